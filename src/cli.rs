//! CLI interface for callbridge

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::carrier::{CallDispatcher, PlaceCall};
use crate::config::Config;
use crate::token::{MintRequest, TokenMinter};

#[derive(Parser)]
#[command(name = "callbridge")]
#[command(about = "Bridge carrier phone calls to a realtime speech-to-speech model", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge server (default when no command given)
    Serve {
        /// Bind host
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Bind port
        #[arg(short, long, default_value = "8080", env = "PORT")]
        port: u16,
        /// Serve HTTPS (requires --cert and --key)
        #[arg(long)]
        https: bool,
        /// TLS certificate path (PEM)
        #[arg(long)]
        cert: Option<String>,
        /// TLS private key path (PEM)
        #[arg(long)]
        key: Option<String>,
    },
    /// Place an outbound call pointing at this server's control document
    Call {
        /// Destination number (E.164)
        #[arg(long)]
        to: String,
        /// Caller number; defaults to TWILIO_FROM_NUMBER
        #[arg(long)]
        from: Option<String>,
        /// Request dual-channel recording
        #[arg(long)]
        record: bool,
    },
    /// Mint an ephemeral credential and print it
    Mint {
        /// Credential lifetime in seconds
        #[arg(long, default_value = "600")]
        expires: u64,
    },
    /// Print the boolean matrix of recognized environment variables
    EnvCheck,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => crate::server::start("0.0.0.0", 8080, false, None, None).await,
        Some(Commands::Serve {
            host,
            port,
            https,
            cert,
            key,
        }) => crate::server::start(&host, port, https, cert, key).await,
        Some(Commands::Call { to, from, record }) => place_call(to, from, record).await,
        Some(Commands::Mint { expires }) => mint(expires).await,
        Some(Commands::EnvCheck) => {
            env_check();
            Ok(())
        }
    }
}

async fn place_call(to: String, from: Option<String>, record: bool) -> Result<()> {
    let config = Config::from_env()?;
    let base = config
        .deploy
        .public_base_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("PUBLIC_BASE_URL is not set"))?;
    let url = format!("{}/twiml", base.trim_end_matches('/'));

    let dispatcher = CallDispatcher::new(&config.twilio);
    let request = PlaceCall {
        to,
        from,
        url: Some(url),
        record,
        status_callback: None,
    };
    let sid = dispatcher.place(&request, "").await?;
    println!("{}", sid);
    Ok(())
}

async fn mint(expires: u64) -> Result<()> {
    let config = Config::from_env()?;
    let api_key = config.require_api_key()?.to_string();

    let control = crate::session::ControlState::from_defaults(&config.realtime);
    let request = MintRequest {
        expires_after_seconds: expires,
        session: serde_json::to_value(control.current())?,
        webhook: None,
    };
    let minter = TokenMinter::new(&config.openai);
    let credential = minter.mint(&api_key, &request).await?;
    println!("{}", credential.value);
    eprintln!("expires_at: {}", credential.expires_at);
    Ok(())
}

fn env_check() {
    for (name, required, set) in Config::env_matrix() {
        let marker = if set {
            "✓"
        } else if required {
            "✗"
        } else {
            "·"
        };
        let tag = if required { "required" } else { "optional" };
        println!("{} {:40} {}", marker, name, tag);
    }
}
