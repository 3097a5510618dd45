//! Client/agent transport-security negotiation.
//!
//! ```text
//! Client                                   Agent
//!    |<-- CS_NEG status=1 policy,salt ------|  (status=0: legacy plain)
//!    |--- CS_NEG result,policy[,sid] ------>|
//!    |<-- CS_NEG result (echo or failure) --|
//!    |======== TLS upgrade if SSL ==========|
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::message::CsNeg;
use crate::auth::digest::{from_hex, to_hex};
use crate::error::{ErrorCode, GridError, Result};
use crate::net::framer::{self, MsgType};
use crate::net::pack::PackStruct;

type HmacSha256 = Hmac<Sha256>;

/// Key carrying the chosen outcome.
pub const RESULT_KW: &str = "cs_neg_result_kw";
/// Key carrying a side's policy.
pub const POLICY_KW: &str = "cs_neg_policy";
/// Key carrying the per-connection salt.
pub const SALT_KW: &str = "cs_neg_salt";
/// Key carrying the signed zone token.
pub const SID_KW: &str = "cs_neg_sid_kw";

/// Required length of a negotiation key.
pub const NEGOTIATION_KEY_LEN: usize = 32;

/// Bytes of random salt per connection.
pub const SALT_LEN: usize = 16;

/// Upper bound on a packed negotiation message.
pub const MAX_CS_NEG_STRUCT_LEN: usize = 1024;

/// One side's transport-security preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Policy {
    /// Must secure
    #[serde(rename = "CS_NEG_REQUIRE")]
    Require,
    /// Must not secure
    #[serde(rename = "CS_NEG_REFUSE")]
    #[default]
    Refuse,
    /// Either
    #[serde(rename = "CS_NEG_DONT_CARE")]
    DontCare,
}

impl Policy {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Require => "CS_NEG_REQUIRE",
            Self::Refuse => "CS_NEG_REFUSE",
            Self::DontCare => "CS_NEG_DONT_CARE",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CS_NEG_REQUIRE" => Ok(Self::Require),
            "CS_NEG_REFUSE" => Ok(Self::Refuse),
            "CS_NEG_DONT_CARE" => Ok(Self::DontCare),
            _ => Err(GridError::negotiation(
                ErrorCode::CLIENT_NEGOTIATION_ERROR,
                format!("unknown negotiation policy {s:?}"),
            )),
        }
    }
}

/// Chosen transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Plain TCP
    Plain,
    /// TLS
    Secured,
    /// Policies conflict
    Failure,
}

impl Outcome {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "CS_NEG_USE_TCP",
            Self::Secured => "CS_NEG_USE_SSL",
            Self::Failure => "CS_NEG_FAILURE",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CS_NEG_USE_TCP" => Ok(Self::Plain),
            "CS_NEG_USE_SSL" => Ok(Self::Secured),
            "CS_NEG_FAILURE" => Ok(Self::Failure),
            _ => Err(GridError::negotiation(
                ErrorCode::SERVER_NEGOTIATION_ERROR,
                format!("unknown negotiation result {s:?}"),
            )),
        }
    }
}

/// Combine the two policies.
pub fn negotiate(client: Policy, server: Policy) -> Outcome {
    use Policy::*;
    match (client, server) {
        (Require, Refuse) | (Refuse, Require) => Outcome::Failure,
        (Require, _) | (_, Require) => Outcome::Secured,
        _ => Outcome::Plain,
    }
}

/// 32-character `[A-Za-z0-9_]` key used to sign the zone token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NegotiationKey(String);

impl NegotiationKey {
    /// Validate a key.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let valid_chars = key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_');
        if key.len() != NEGOTIATION_KEY_LEN || !valid_chars {
            return Err(GridError::Config(format!(
                "negotiation key must be exactly {NEGOTIATION_KEY_LEN} characters of [A-Za-z0-9_]"
            )));
        }
        Ok(Self(key))
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<String> for NegotiationKey {
    type Error = GridError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<NegotiationKey> for String {
    fn from(key: NegotiationKey) -> Self {
        key.0
    }
}

impl fmt::Debug for NegotiationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NegotiationKey([REDACTED])")
    }
}

/// A zone's shared key paired with its negotiation key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneKeys {
    /// Shared zone key
    pub zone_key: String,
    /// Key signing the token
    pub negotiation_key: NegotiationKey,
}

impl ZoneKeys {
    fn mac(&self, salt: &str) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.negotiation_key.as_bytes()).map_err(|e| {
            GridError::resource(ErrorCode::SYS_LIBRARY_ERROR, format!("HMAC init: {e}"))
        })?;
        mac.update(self.zone_key.as_bytes());
        mac.update(salt.as_bytes());
        Ok(mac)
    }

    /// hex(HMAC-SHA256(negotiation key, zone key ‖ salt))
    pub fn sign(&self, salt: &str) -> Result<String> {
        Ok(to_hex(&self.mac(salt)?.finalize().into_bytes()))
    }

    /// Check a token in constant time.
    pub fn verify(&self, salt: &str, token: &str) -> bool {
        let Some(bytes) = from_hex(token) else {
            return false;
        };
        self.mac(salt)
            .map(|mac| mac.verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    }
}

/// Check a token against the local zone and every federation entry.
pub fn verify_token<'a>(
    keys: impl IntoIterator<Item = &'a ZoneKeys>,
    salt: &str,
    token: &str,
) -> bool {
    keys.into_iter().any(|k| k.verify(salt, token))
}

/// Parse `key=value;key=value;` text.
pub fn parse_kv(text: &str) -> BTreeMap<String, String> {
    text.split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Format pairs as `key=value;` text.
pub fn format_kv<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .map(|(key, value)| format!("{key}={value};"))
        .collect()
}

/// Agent-side negotiation settings.
#[derive(Debug, Clone, Default)]
pub struct AgentNegotiation {
    /// Agent policy
    pub policy: Policy,
    /// Keys of the local zone
    pub local: Option<ZoneKeys>,
    /// Keys of federated zones
    pub federation: Vec<ZoneKeys>,
    /// Treat unsigned clients as REFUSE
    pub require_signed: bool,
}

impl AgentNegotiation {
    fn known_keys(&self) -> impl Iterator<Item = &ZoneKeys> {
        self.local.iter().chain(self.federation.iter())
    }
}

async fn send_cs_neg<S>(stream: &mut S, status: i32, result: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let msg = CsNeg {
        status,
        result: result.to_string(),
    };
    framer::send_message(stream, MsgType::CsNeg, &msg.pack(), &[], &[], 0).await
}

async fn read_cs_neg<S>(stream: &mut S, deadline: Option<Duration>) -> Result<CsNeg>
where
    S: AsyncRead + Unpin,
{
    let header = framer::read_header(stream, deadline).await?;
    framer::expect_type(&header, MsgType::CsNeg)?;
    framer::check_struct_len(&header, MAX_CS_NEG_STRUCT_LEN)?;
    framer::warn_unexpected_aux(&header);
    let body = framer::read_body(stream, &header).await?;
    CsNeg::unpack(&body.structure)
}

fn random_salt() -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    to_hex(&salt)
}

/// Client side of the exchange; returns the agreed outcome.
pub async fn client_negotiate<S>(
    stream: &mut S,
    policy: Policy,
    keys: Option<&ZoneKeys>,
    deadline: Option<Duration>,
) -> Result<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let offer = read_cs_neg(stream, deadline).await?;
    if offer.status != 1 {
        if policy == Policy::Require {
            return Err(GridError::negotiation(
                ErrorCode::CLIENT_NEGOTIATION_ERROR,
                "agent declined negotiation but client policy is CS_NEG_REQUIRE",
            ));
        }
        info!("Agent declined negotiation, using plain transport");
        return Ok(Outcome::Plain);
    }

    let offered = parse_kv(&offer.result);
    let server_policy: Policy = offered
        .get(POLICY_KW)
        .ok_or_else(|| {
            GridError::negotiation(
                ErrorCode::CLIENT_NEGOTIATION_ERROR,
                "agent negotiation offer carries no policy",
            )
        })?
        .parse()?;
    let salt = offered.get(SALT_KW).map(String::as_str).unwrap_or_default();

    let outcome = negotiate(policy, server_policy);
    debug!(
        "Negotiation: client {} vs agent {} -> {}",
        policy, server_policy, outcome
    );

    if outcome == Outcome::Failure {
        let text = format_kv([(RESULT_KW, Outcome::Failure.as_str())]);
        send_cs_neg(stream, 0, &text).await?;
        return Err(GridError::negotiation(
            ErrorCode::CLIENT_NEGOTIATION_ERROR,
            format!("client policy {policy} conflicts with agent policy {server_policy}"),
        ));
    }

    let token = keys.map(|k| k.sign(salt)).transpose()?;
    let mut pairs = vec![(RESULT_KW, outcome.as_str()), (POLICY_KW, policy.as_str())];
    if let Some(token) = token.as_deref() {
        pairs.push((SID_KW, token));
    }
    send_cs_neg(stream, 1, &format_kv(pairs)).await?;

    let ack = read_cs_neg(stream, deadline).await?;
    let acked: Outcome = parse_kv(&ack.result)
        .get(RESULT_KW)
        .map(|r| r.parse::<Outcome>())
        .transpose()?
        .unwrap_or(Outcome::Failure);
    if ack.status != 1 || acked != outcome {
        return Err(GridError::negotiation(
            ErrorCode::SERVER_NEGOTIATION_ERROR,
            format!("agent rejected negotiated result {outcome}"),
        ));
    }
    Ok(outcome)
}

/// Agent side of the exchange; returns the agreed outcome.
pub async fn agent_negotiate<S>(
    stream: &mut S,
    settings: &AgentNegotiation,
    deadline: Option<Duration>,
) -> Result<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let salt = random_salt();
    let offer = format_kv([(POLICY_KW, settings.policy.as_str()), (SALT_KW, salt.as_str())]);
    send_cs_neg(stream, 1, &offer).await?;

    let reply = read_cs_neg(stream, deadline).await?;
    let fields = parse_kv(&reply.result);
    let client_result: Outcome = fields
        .get(RESULT_KW)
        .map(|r| r.parse::<Outcome>())
        .transpose()?
        .unwrap_or(Outcome::Failure);
    if client_result == Outcome::Failure {
        return Err(GridError::negotiation(
            ErrorCode::CLIENT_NEGOTIATION_ERROR,
            "client reported a negotiation failure",
        ));
    }

    let mut client_policy: Policy = match fields.get(POLICY_KW) {
        Some(p) => p.parse()?,
        None => Policy::Refuse,
    };
    match fields.get(SID_KW) {
        Some(token) if !verify_token(settings.known_keys(), &salt, token) => {
            warn!("Negotiation token failed verification, treating client as CS_NEG_REFUSE");
            client_policy = Policy::Refuse;
        },
        None if settings.require_signed => {
            warn!("Unsigned negotiation from client, treating client as CS_NEG_REFUSE");
            client_policy = Policy::Refuse;
        },
        _ => {},
    }

    let outcome = negotiate(client_policy, settings.policy);
    if outcome == Outcome::Failure || outcome != client_result {
        let text = format_kv([(RESULT_KW, Outcome::Failure.as_str())]);
        send_cs_neg(stream, 0, &text).await?;
        return Err(GridError::negotiation(
            ErrorCode::SERVER_NEGOTIATION_ERROR,
            format!("client result {client_result} does not match agent result {outcome}"),
        ));
    }

    send_cs_neg(stream, 1, &format_kv([(RESULT_KW, outcome.as_str())])).await?;
    debug!("Negotiated {}", outcome);
    Ok(outcome)
}

/// Agent side: decline negotiation (legacy plain path).
pub async fn agent_decline<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    send_cs_neg(stream, 0, "").await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(zone_key: &str, neg_key_char: char) -> ZoneKeys {
        ZoneKeys {
            zone_key: zone_key.to_string(),
            negotiation_key: NegotiationKey::new(neg_key_char.to_string().repeat(32)).unwrap(),
        }
    }

    #[test]
    fn test_truth_table() {
        use Outcome::*;
        use Policy::*;
        let cases = [
            (Require, Require, Secured),
            (Require, Refuse, Failure),
            (Refuse, Require, Failure),
            (Refuse, Refuse, Plain),
            (DontCare, DontCare, Plain),
            (Require, DontCare, Secured),
            (DontCare, Require, Secured),
            (Refuse, DontCare, Plain),
            (DontCare, Refuse, Plain),
        ];
        for (client, server, expected) in cases {
            assert_eq!(
                negotiate(client, server),
                expected,
                "{client} vs {server}"
            );
        }
    }

    #[test]
    fn test_negotiation_key_validation() {
        assert!(NegotiationKey::new("a".repeat(32)).is_ok());
        assert!(NegotiationKey::new("a_B9".repeat(8)).is_ok());
        assert!(NegotiationKey::new("a".repeat(31)).is_err());
        assert!(NegotiationKey::new(format!("{}-", "a".repeat(31))).is_err());
    }

    #[test]
    fn test_token_sign_verify() {
        let local = keys("zone_key_one", 'a');
        let token = local.sign("00ff").unwrap();
        assert_eq!(token.len(), 64);
        assert!(local.verify("00ff", &token));
        assert!(!local.verify("00fe", &token));
        assert!(!local.verify("00ff", "not-hex"));

        let other = keys("zone_key_two", 'b');
        assert!(!other.verify("00ff", &token));
        assert!(verify_token([&other, &local], "00ff", &token));
    }

    #[test]
    fn test_kv_roundtrip() {
        let text = format_kv([(RESULT_KW, "CS_NEG_USE_SSL"), (POLICY_KW, "CS_NEG_REQUIRE")]);
        assert_eq!(text, "cs_neg_result_kw=CS_NEG_USE_SSL;cs_neg_policy=CS_NEG_REQUIRE;");
        let parsed = parse_kv(&text);
        assert_eq!(parsed.get(RESULT_KW).unwrap(), "CS_NEG_USE_SSL");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_policy_serde_names() {
        let json = serde_json::to_string(&Policy::DontCare).unwrap();
        assert_eq!(json, "\"CS_NEG_DONT_CARE\"");
        assert_eq!("CS_NEG_REQUIRE".parse::<Policy>().unwrap(), Policy::Require);
    }

    async fn run(
        client_policy: Policy,
        client_keys: Option<ZoneKeys>,
        agent: AgentNegotiation,
    ) -> (Result<Outcome>, Result<Outcome>) {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let agent_task =
            tokio::spawn(async move { agent_negotiate(&mut server, &agent, None).await });
        let client_result =
            client_negotiate(&mut client, client_policy, client_keys.as_ref(), None).await;
        drop(client);
        (client_result, agent_task.await.unwrap())
    }

    #[tokio::test]
    async fn test_exchange_agrees() {
        let agent = AgentNegotiation {
            policy: Policy::DontCare,
            ..Default::default()
        };
        let (client, server) = run(Policy::Require, None, agent).await;
        assert_eq!(client.unwrap(), Outcome::Secured);
        assert_eq!(server.unwrap(), Outcome::Secured);
    }

    #[tokio::test]
    async fn test_exchange_conflict_is_client_error() {
        let agent = AgentNegotiation {
            policy: Policy::Refuse,
            ..Default::default()
        };
        let (client, server) = run(Policy::Require, None, agent).await;
        assert_eq!(
            client.unwrap_err().code(),
            ErrorCode::CLIENT_NEGOTIATION_ERROR
        );
        assert!(server.is_err());
    }

    #[tokio::test]
    async fn test_bad_token_degrades_to_refuse() {
        let agent = AgentNegotiation {
            policy: Policy::DontCare,
            local: Some(keys("zone_key_one", 'a')),
            ..Default::default()
        };
        let (client, server) = run(Policy::Require, Some(keys("zone_key_one", 'z')), agent).await;
        assert_eq!(
            client.unwrap_err().code(),
            ErrorCode::SERVER_NEGOTIATION_ERROR
        );
        assert_eq!(
            server.unwrap_err().code(),
            ErrorCode::SERVER_NEGOTIATION_ERROR
        );
    }

    #[tokio::test]
    async fn test_valid_token_accepted() {
        let shared = keys("zone_key_one", 'a');
        let agent = AgentNegotiation {
            policy: Policy::DontCare,
            local: Some(shared.clone()),
            require_signed: true,
            ..Default::default()
        };
        let (client, server) = run(Policy::Require, Some(shared), agent).await;
        assert_eq!(client.unwrap(), Outcome::Secured);
        assert_eq!(server.unwrap(), Outcome::Secured);
    }

    #[tokio::test]
    async fn test_unsigned_client_when_signature_required() {
        let agent = AgentNegotiation {
            policy: Policy::DontCare,
            local: Some(keys("zone_key_one", 'a')),
            require_signed: true,
            ..Default::default()
        };
        let (client, _) = run(Policy::DontCare, None, agent).await;
        assert_eq!(client.unwrap(), Outcome::Plain);
    }

    #[tokio::test]
    async fn test_declined_offer() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        agent_decline(&mut server).await.unwrap();
        let outcome = client_negotiate(&mut client, Policy::DontCare, None, None)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Plain);

        agent_decline(&mut server).await.unwrap();
        let err = client_negotiate(&mut client, Policy::Require, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CLIENT_NEGOTIATION_ERROR);
    }
}
