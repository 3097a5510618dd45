//! Gridlink CLI binary.
//!
//! # Commands
//!
//! - `login` - Connect, authenticate and optionally record the auth file
//! - `agent` - Run a session-setup agent from a TOML config
//! - `scramble` - Obfuscate a secret the way the auth file stores it

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use gridlink::{
    auth::obf::Obfuscator,
    auth::{AuthContext, HashScheme, SchemeRegistry},
    config::Config,
    Agent, Connection, MemoryCredentialStore, VERSION,
};

#[derive(Parser)]
#[command(name = "gridlink")]
#[command(version = VERSION)]
#[command(about = "Gridlink - data-grid session setup and authentication", long_about = None)]
struct Cli {
    /// Config file (default: ~/.grid/gridlink.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to an agent and authenticate
    Login {
        /// Agent host
        #[arg(long)]
        host: Option<String>,

        /// Agent port
        #[arg(short, long)]
        port: Option<u16>,

        /// User name
        #[arg(short, long)]
        user: Option<String>,

        /// Zone name
        #[arg(short, long)]
        zone: Option<String>,

        /// Password (prompted for if absent and no auth file exists)
        #[arg(long)]
        password: Option<String>,

        /// Authentication scheme
        #[arg(long)]
        scheme: Option<String>,

        /// Mint a limited password valid for this many hours
        #[arg(long)]
        ttl: Option<u32>,

        /// Auth file path
        #[arg(long)]
        auth_file: Option<PathBuf>,

        /// Record the password in the auth file after login
        #[arg(long)]
        record: bool,

        /// Always prompt for the password
        #[arg(long)]
        prompt: bool,

        /// Request transport negotiation
        #[arg(long)]
        negotiate: bool,

        /// Ask the agent for reconnect support
        #[arg(long)]
        reconnect: bool,
    },

    /// Run an agent
    Agent {
        /// Listen address (overrides the config)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Obfuscate a secret with a key
    Scramble {
        /// Secret to obfuscate (or reverse with --decode)
        text: String,

        /// Obfuscation key
        #[arg(short, long)]
        key: String,

        /// Use the sha1 key stream
        #[arg(long)]
        sha1: bool,

        /// Reverse an earlier obfuscation
        #[arg(short, long)]
        decode: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    match cli.command {
        Commands::Login {
            host,
            port,
            user,
            zone,
            password,
            scheme,
            ttl,
            auth_file,
            record,
            prompt,
            negotiate,
            reconnect,
        } => {
            let mut config = load_config(cli.config)?;
            let client = &mut config.client;
            if let Some(host) = host {
                client.host = host;
            }
            if let Some(port) = port {
                client.port = port;
            }
            if let Some(user) = user {
                client.user_name = user;
            }
            if let Some(zone) = zone {
                client.zone_name = zone;
            }
            if let Some(scheme) = scheme {
                client.authentication_scheme = scheme.to_lowercase();
            }
            if let Some(path) = auth_file {
                client.auth_file = Some(path);
            }
            client.client_server_negotiation |= negotiate;
            client.reconnect |= reconnect;

            let mut ctx = AuthContext::new()
                .force_prompt(prompt)
                .record_auth_file(record);
            if let Some(password) = password {
                ctx = ctx.with_password(password);
            }
            if let Some(ttl) = ttl {
                ctx = ctx.with_ttl(ttl);
            }
            cmd_login(config, ctx)
        },

        Commands::Agent { listen } => {
            let mut config = load_config(cli.config)?;
            if let Some(listen) = listen {
                config.agent.listen_addr = listen;
            }
            cmd_agent(config)
        },

        Commands::Scramble {
            text,
            key,
            sha1,
            decode,
        } => {
            let scheme = if sha1 { HashScheme::Sha1 } else { HashScheme::Md5 };
            let obfuscator = Obfuscator::new(scheme, true)?;
            let out = if decode {
                obfuscator.deobfuscate(&text, &key)?
            } else {
                obfuscator.obfuscate(&text, &key)?
            };
            println!("{out}");
            Ok(())
        },
    }
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// File config (explicit path, else the default path if present) under
/// environment overrides.
fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let file = match path {
        Some(path) => Config::from_file(path)?,
        None => match Config::default_path().filter(|p| p.is_file()) {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        },
    };
    Ok(file.merge(Config::from_env()))
}

fn cmd_login(config: Config, ctx: AuthContext) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let client = config.client;
        tracing::info!(
            "Connecting to {}:{} as {}#{}",
            client.host,
            client.port,
            client.user_name,
            client.zone_name
        );
        let mut conn = Connection::open(client).await?;
        let result = conn.authenticate(None, &ctx).await;
        if let Err(e) = result {
            for entry in conn.errors().entries() {
                eprintln!("  {}: {}", entry.code, entry.message);
            }
            conn.disconnect().await?;
            return Err(e.into());
        }

        println!(
            "Authenticated as {} via {} ({})",
            conn.proxy_user().qualified(),
            conn.auth_scheme().unwrap_or("unknown"),
            if conn.is_secure() { "TLS" } else { "plain" }
        );
        if let Some(signature) = conn.session_signature() {
            tracing::debug!("Session signature {}", signature.as_str());
        }
        conn.disconnect().await?;
        Ok::<_, anyhow::Error>(())
    })
}

fn cmd_agent(config: Config) -> anyhow::Result<()> {
    let agent_config = config.agent;
    agent_config.validate()?;
    let store = Arc::new(MemoryCredentialStore::from_config(&agent_config)?);
    tracing::info!(
        "Starting agent for zone {} with {} user(s)",
        agent_config.local_zone,
        agent_config.users.len()
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        Agent::new(agent_config, store, SchemeRegistry::with_defaults())
            .serve()
            .await?;
        Ok::<_, anyhow::Error>(())
    })
}
