//! TLS upgrade of an established stream.
//!
//! Certificates come from PEM files, raw DER or a generated self-signed
//! certificate (development only). Clients trust a CA file, explicit DER
//! certificates, or (tests only) anything.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use rcgen::{Certificate, CertificateParams};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, RootCertStore, ServerConfig, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::stream::GridStream;
use crate::error::{ErrorCode, GridError, Result};

/// Agent certificate source.
#[derive(Debug, Clone)]
pub enum CertSource {
    /// Generate a self-signed certificate (development only).
    SelfSigned {
        /// Common name for the certificate.
        common_name: String,
    },
    /// Load PEM files.
    Files {
        /// Certificate chain.
        cert_path: PathBuf,
        /// PKCS8 or RSA private key.
        key_path: PathBuf,
    },
    /// Raw DER data.
    Raw {
        /// Certificate chain.
        cert_der: Vec<Vec<u8>>,
        /// PKCS8 private key.
        key_der: Vec<u8>,
    },
}

impl Default for CertSource {
    fn default() -> Self {
        Self::SelfSigned {
            common_name: "localhost".to_string(),
        }
    }
}

impl CertSource {
    /// Self-signed source for `common_name`.
    pub fn self_signed(common_name: impl Into<String>) -> Self {
        Self::SelfSigned {
            common_name: common_name.into(),
        }
    }

    /// PEM file source.
    pub fn from_files(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self::Files {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    /// Load the certificate chain and private key.
    pub fn load(&self) -> Result<(Vec<rustls::Certificate>, rustls::PrivateKey)> {
        match self {
            Self::SelfSigned { common_name } => {
                tracing::warn!(
                    "Using self-signed certificate for '{}' - NOT FOR PRODUCTION",
                    common_name
                );

                let mut params = CertificateParams::new(vec![
                    common_name.clone(),
                    "127.0.0.1".to_string(),
                ]);
                params.distinguished_name = rcgen::DistinguishedName::new();
                params
                    .distinguished_name
                    .push(rcgen::DnType::CommonName, common_name.clone());

                let cert = Certificate::from_params(params).map_err(|e| {
                    GridError::Config(format!("Failed to generate self-signed cert: {e}"))
                })?;
                let cert_der = cert
                    .serialize_der()
                    .map_err(|e| GridError::Config(format!("Failed to serialize cert: {e}")))?;

                Ok((
                    vec![rustls::Certificate(cert_der)],
                    rustls::PrivateKey(cert.serialize_private_key_der()),
                ))
            },
            Self::Files {
                cert_path,
                key_path,
            } => {
                let cert_pem = fs::read(cert_path).map_err(|e| {
                    GridError::Config(format!("Failed to read cert file {cert_path:?}: {e}"))
                })?;
                let key_pem = fs::read(key_path).map_err(|e| {
                    GridError::Config(format!("Failed to read key file {key_path:?}: {e}"))
                })?;

                let certs = parse_pem_certs(&cert_pem)?;

                let key = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_slice())
                    .map_err(|e| GridError::Config(format!("Failed to parse key PEM: {e}")))?
                    .into_iter()
                    .next()
                    .or_else(|| {
                        rustls_pemfile::rsa_private_keys(&mut key_pem.as_slice())
                            .ok()?
                            .into_iter()
                            .next()
                    })
                    .map(rustls::PrivateKey)
                    .ok_or_else(|| GridError::Config("No private key found in PEM file".into()))?;

                Ok((certs, key))
            },
            Self::Raw { cert_der, key_der } => Ok((
                cert_der.iter().cloned().map(rustls::Certificate).collect(),
                rustls::PrivateKey(key_der.clone()),
            )),
        }
    }
}

fn parse_pem_certs(pem: &[u8]) -> Result<Vec<rustls::Certificate>> {
    let certs: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut &pem[..])
        .map_err(|e| GridError::Config(format!("Failed to parse cert PEM: {e}")))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();
    if certs.is_empty() {
        return Err(GridError::Config(
            "No certificates found in PEM file".to_string(),
        ));
    }
    Ok(certs)
}

/// Which agent certificates a client accepts.
#[derive(Debug, Clone)]
pub enum TrustConfig {
    /// CA bundle in PEM form.
    CaFile(PathBuf),
    /// Explicit DER certificates.
    Certificates(Vec<Vec<u8>>),
    /// Accept any certificate. Never use outside tests.
    AcceptAny,
}

struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn root_store(certs: &[rustls::Certificate]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| GridError::Config(format!("Invalid trust anchor: {e}")))?;
    }
    Ok(roots)
}

/// Build the client TLS configuration.
pub fn client_config(trust: &TrustConfig) -> Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder().with_safe_defaults();
    let config = match trust {
        TrustConfig::CaFile(path) => {
            let pem = fs::read(path).map_err(|e| {
                GridError::Config(format!("Failed to read CA file {path:?}: {e}"))
            })?;
            builder
                .with_root_certificates(root_store(&parse_pem_certs(&pem)?)?)
                .with_no_client_auth()
        },
        TrustConfig::Certificates(ders) => {
            let certs: Vec<_> = ders.iter().cloned().map(rustls::Certificate).collect();
            builder
                .with_root_certificates(root_store(&certs)?)
                .with_no_client_auth()
        },
        TrustConfig::AcceptAny => {
            tracing::warn!("TLS certificate verification disabled");
            builder
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
                .with_no_client_auth()
        },
    };
    Ok(Arc::new(config))
}

/// Build the agent TLS configuration.
pub fn server_config(cert: &CertSource) -> Result<Arc<ServerConfig>> {
    let (certs, key) = cert.load()?;
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GridError::Config(format!("Invalid TLS certificate: {e}")))?;
    Ok(Arc::new(config))
}

/// Upgrade `stream` to TLS in the client role.
pub async fn upgrade_client(
    stream: TcpStream,
    config: Arc<ClientConfig>,
    server_name: &str,
) -> Result<GridStream> {
    let name = ServerName::try_from(server_name).map_err(|e| {
        GridError::negotiation(
            ErrorCode::CLIENT_NEGOTIATION_ERROR,
            format!("invalid TLS server name {server_name:?}: {e}"),
        )
    })?;
    let tls = TlsConnector::from(config)
        .connect(name, stream)
        .await
        .map_err(|e| {
            GridError::negotiation(
                ErrorCode::CLIENT_NEGOTIATION_ERROR,
                format!("TLS handshake failed: {e}"),
            )
        })?;
    tracing::debug!("TLS established with {}", server_name);
    Ok(GridStream::ClientTls(Box::new(tls)))
}

/// Upgrade `stream` to TLS in the agent role.
pub async fn upgrade_server(stream: TcpStream, config: Arc<ServerConfig>) -> Result<GridStream> {
    let tls = TlsAcceptor::from(config).accept(stream).await.map_err(|e| {
        GridError::negotiation(
            ErrorCode::SERVER_NEGOTIATION_ERROR,
            format!("TLS handshake failed: {e}"),
        )
    })?;
    Ok(GridStream::ServerTls(Box::new(tls)))
}

/// Self-signed certificate paired with the trust config that accepts it.
pub fn self_signed_pair(common_name: &str) -> Result<(CertSource, TrustConfig)> {
    let (certs, key) = CertSource::self_signed(common_name).load()?;
    let ders: Vec<Vec<u8>> = certs.into_iter().map(|c| c.0).collect();
    Ok((
        CertSource::Raw {
            cert_der: ders.clone(),
            key_der: key.0,
        },
        TrustConfig::Certificates(ders),
    ))
}
