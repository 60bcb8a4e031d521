//! Ceremony Party CLI
//!
//! Command-line interface for driving a ceremony session against a relay:
//! - Host a session and declare the committee once peers have joined
//! - Join a session from a pairing payload and wait for it to start
//! - Inspect or tear down a session

use anyhow::{bail, Context, Result};
use ceremony_core::crypto::random_hex;
use ceremony_core::mpc::{Relay, ServiceDiscovery, StaticServiceDiscovery};
use ceremony_core::payload::KeygenPairingPayload;
use ceremony_core::{
    CeremonyConfig, Committee, ParticipantDiscovery, Session, SessionCoordinator, TssAction,
    PUBLIC_RELAY_URL,
};
use clap::{Parser, Subcommand};
use msg_relay_client::RelayClient;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

/// Ceremony Party - session coordination for MPC devices
#[derive(Parser)]
#[command(name = "ceremony-party")]
#[command(about = "Host, join and inspect threshold ceremony sessions")]
#[command(version)]
struct Cli {
    /// Relay service URL
    #[arg(short, long, env = "RELAY_URL", default_value = PUBLIC_RELAY_URL)]
    relay: String,

    /// Local party ID
    #[arg(short, long, env = "PARTY_ID")]
    party_id: String,

    /// Polling interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    poll_ms: u64,

    /// Per request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a session, wait for peers, then declare the committee
    Host {
        /// Total number of parties, including this one
        #[arg(short, long)]
        parties: usize,

        /// Service name advertised in the pairing payload
        #[arg(long, default_value = "ceremony")]
        service_name: String,

        /// Use a local mediator instead of the public relay
        #[arg(long)]
        local: bool,

        /// Local mediator URL the session is created on with --local
        #[arg(long, env = "MEDIATOR_URL")]
        mediator: Option<String>,

        /// Write the pairing payload to this file as well
        #[arg(long)]
        payload_out: Option<PathBuf>,
    },

    /// Join a session from a pairing payload and wait for it to start
    Join {
        /// Pairing payload JSON, or @path to read it from a file
        #[arg(short = 'P', long)]
        payload: String,

        /// Mediator URL for local sessions
        #[arg(long, env = "MEDIATOR_URL")]
        mediator: Option<String>,
    },

    /// Show participants, committee and completion of a session
    Status {
        /// Session ID
        #[arg(short, long)]
        session: String,
    },

    /// Remove a session from the relay
    Teardown {
        /// Session ID
        #[arg(short, long)]
        session: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = CeremonyConfig::default()
        .with_relay_url(cli.relay.clone())
        .with_poll_interval(Duration::from_millis(cli.poll_ms));
    let config = CeremonyConfig {
        request_timeout: Duration::from_secs(cli.timeout),
        ..config
    };
    config.validate()?;

    match cli.command {
        Commands::Host {
            parties,
            ref service_name,
            local,
            ref mediator,
            ref payload_out,
        } => {
            let address = host_address(local, mediator.as_deref(), &config.relay_url)?;
            run_host(&cli, &config, parties, service_name, address, payload_out.as_ref()).await?;
        }
        Commands::Join {
            ref payload,
            ref mediator,
        } => {
            run_join(&cli, &config, payload, mediator.as_deref()).await?;
        }
        Commands::Status { ref session } => {
            show_status(&config, session).await?;
        }
        Commands::Teardown { ref session } => {
            relay(&config, &config.relay_url).end_session(session).await?;
            println!("Session {} removed", session);
        }
    }

    Ok(())
}

/// Where a hosted session lives, and whether that is the public relay
fn host_address(local: bool, mediator: Option<&str>, relay_url: &str) -> Result<(String, bool)> {
    if !local {
        return Ok((relay_url.to_string(), true));
    }
    match mediator {
        Some(url) => Ok((url.trim_end_matches('/').to_string(), false)),
        None => bail!("--local needs the mediator URL (--mediator or MEDIATOR_URL)"),
    }
}

fn relay(config: &CeremonyConfig, address: &str) -> Arc<dyn Relay> {
    Arc::new(RelayClient::new(address).with_timeout(config.request_timeout))
}

async fn run_host(
    cli: &Cli,
    config: &CeremonyConfig,
    parties: usize,
    service_name: &str,
    (server_address, uses_public_relay): (String, bool),
    payload_out: Option<&PathBuf>,
) -> Result<()> {
    if parties < 2 {
        bail!("a ceremony needs at least two parties");
    }

    let session = Session::generate(server_address, uses_public_relay);
    let relay = relay(config, &session.server_address);
    let coordinator =
        SessionCoordinator::new(session.clone(), cli.party_id.clone(), relay.clone(), config.clone());

    let payload = KeygenPairingPayload {
        session_id: session.session_id.clone(),
        service_name: service_name.to_string(),
        hex_chain_code: random_hex(32),
        encryption_key_hex: session.encryption_key.to_hex(),
        use_relay: session.uses_public_relay,
        action: TssAction::Keygen,
        pub_key_ecdsa: None,
        old_parties: None,
    };
    let payload_json = payload.to_json()?;
    println!("Pairing payload:\n{}", payload_json);
    if let Some(path) = payload_out {
        std::fs::write(path, &payload_json)
            .with_context(|| format!("writing payload to {}", path.display()))?;
    }

    coordinator.create_session().await?;
    info!(session_id = %session.session_id, parties, "Waiting for peers");

    let mut discovery =
        ParticipantDiscovery::new(session.session_id.clone(), cli.party_id.clone(), relay, config);
    let mut updates = discovery.subscribe();
    discovery.start();

    let waited = async {
        loop {
            let known = updates.borrow_and_update().clone();
            info!(participants = ?known, "Participants");
            if known.len() >= parties {
                return Ok::<_, anyhow::Error>(known);
            }
            updates.changed().await?;
        }
    };
    let discovered: Result<Vec<String>> = tokio::select! {
        found = waited => found,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
    };
    discovery.stop().await;

    let committee = Committee::new(discovered?.into_iter().take(parties));
    coordinator.start_session(&committee).await?;

    println!("Session {} started", session.session_id);
    println!("Committee: {}", committee.keys());
    Ok(())
}

async fn run_join(
    cli: &Cli,
    config: &CeremonyConfig,
    raw_payload: &str,
    mediator: Option<&str>,
) -> Result<()> {
    let raw = match raw_payload.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading payload from {}", path))?,
        None => raw_payload.to_string(),
    };
    let payload = KeygenPairingPayload::parse(&raw)?;

    let address = if payload.use_relay {
        config.relay_url.clone()
    } else {
        let mut discovery = StaticServiceDiscovery::new();
        if let Some(url) = mediator {
            discovery = discovery.with_service(payload.service_name.clone(), url);
        }
        discovery.resolve(&payload.service_name).await?
    };
    let session = payload.session(&address)?;

    let coordinator = SessionCoordinator::new(
        session.clone(),
        cli.party_id.clone(),
        relay(config, &session.server_address),
        config.clone(),
    );
    coordinator.create_session().await?;
    info!(session_id = %session.session_id, "Waiting for the host to start");

    let committee = tokio::select! {
        committee = coordinator.await_session_start() => committee?,
        _ = tokio::signal::ctrl_c() => bail!("interrupted"),
    };

    println!("Session {} started", session.session_id);
    println!("Committee: {}", committee.keys());
    Ok(())
}

async fn show_status(config: &CeremonyConfig, session_id: &str) -> Result<()> {
    let relay = relay(config, &config.relay_url);

    let participants = relay.participants(session_id).await?;
    let committee = relay.committee(session_id).await?;
    let completed = relay.completed_parties(session_id).await?;

    println!("Session {}:", session_id);
    println!("  Participants: {}", participants.join(","));
    match committee {
        Some(committee) => {
            let committee = Committee::new(committee);
            println!("  Committee: {}", committee.keys());
            println!(
                "  Completed: {} ({})",
                completed.join(","),
                if committee.is_covered_by(&completed) {
                    "all done"
                } else {
                    "pending"
                }
            );
        }
        None => println!("  Not started"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_address_follows_mode() {
        let (address, public) = host_address(false, None, PUBLIC_RELAY_URL).unwrap();
        assert_eq!(address, PUBLIC_RELAY_URL);
        assert!(public);

        let (address, public) =
            host_address(true, Some("http://192.168.1.4:18080/"), PUBLIC_RELAY_URL).unwrap();
        assert_eq!(address, "http://192.168.1.4:18080");
        assert!(!public);

        assert!(host_address(true, None, PUBLIC_RELAY_URL).is_err());
    }
}
