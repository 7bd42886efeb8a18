use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pvt_common::{EncryptedPayloadHash, RequestContext};
use pvt_ptm::private_state::resident_groups_for;
use pvt_ptm::{
    connect, new_private_state_manager, MemoryStateRootStore, PrivateStateManager, PrivateTransactionManager, PtmConfig,
    PtmFeature,
};

#[derive(Parser)]
#[command(name = "ptmctl")]
#[command(about = "Inspect a private transaction manager the way a node sees it")]
struct Args {
    /// PTM connection config file; falls back to PRIVATE_CONFIG
    #[arg(short, long)]
    config: Option<String>,

    /// Connect to this HTTP URL instead of a config file
    #[arg(long, conflicts_with = "config")]
    url: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Select the adapter and report its features
    Upcheck,
    /// Fetch a payload by its base64 or 0x-hex encrypted payload hash
    Receive { hash: String },
    /// Report whether this node sent the payload
    IsSender { hash: String },
    /// List the recipients of a payload
    Participants { hash: String },
    /// List privacy groups, optionally only resident groups containing a key
    Groups {
        #[arg(long)]
        party: Option<String>,
    },
    /// Resolve a PSI to its private state
    Resolve {
        #[arg(default_value = "private")]
        psi: String,
    },
}

fn parse_hash(encoded: &str) -> anyhow::Result<EncryptedPayloadHash> {
    let hash = if encoded.starts_with("0x") {
        EncryptedPayloadHash::from_hex(encoded)
    } else {
        EncryptedPayloadHash::from_base64(encoded)
    };
    hash.with_context(|| format!("invalid encrypted payload hash {}", encoded))
}

fn load_config(args: &Args) -> anyhow::Result<PtmConfig> {
    if let Some(url) = &args.url {
        return Ok(PtmConfig::with_http_url(url.clone()));
    }
    let config = match &args.config {
        Some(path) => PtmConfig::fetch(path).with_context(|| format!("unable to load {}", path))?,
        None => PtmConfig::from_environment().context("unable to load PRIVATE_CONFIG")?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("pvt_ptm={0},ptmctl={0}", args.log_level))),
        )
        .init();

    let config = load_config(&args)?;
    let ptm = connect(&config).await?.into_shared();
    info!(name = ptm.name(), "connected to private transaction manager");

    match args.command {
        Command::Upcheck => {
            println!("adapter: {}", ptm.name());
            for feature in [
                PtmFeature::PrivacyEnhancements,
                PtmFeature::MultiTenancy,
                PtmFeature::MultiplePrivateStates,
                PtmFeature::MandatoryRecipients,
            ] {
                println!("{:?}: {}", feature, ptm.has_feature(feature));
            }
        }
        Command::Receive { hash } => match ptm.receive(&parse_hash(&hash)?).await? {
            Some(received) => {
                println!("payload: {}", pvt_common::serde_hex::encode(&received.payload));
                println!("{}", serde_json::to_string_pretty(&received.extra)?);
            }
            None => println!("not a party to {}", hash),
        },
        Command::IsSender { hash } => {
            println!("{}", ptm.is_sender(&parse_hash(&hash)?).await?);
        }
        Command::Participants { hash } => {
            for key in ptm.get_participants(&parse_hash(&hash)?).await? {
                println!("{}", key);
            }
        }
        Command::Groups { party } => {
            let groups = match party {
                Some(party) => resident_groups_for(ptm.as_ref(), &party).await?,
                None => ptm.groups().await?,
            };
            println!("{}", serde_json::to_string_pretty(&groups)?);
        }
        Command::Resolve { psi } => {
            if !ptm.has_feature(PtmFeature::MultiplePrivateStates) {
                bail!("{} does not support multiple private states", ptm.name());
            }
            let manager = new_private_state_manager(Arc::clone(&ptm), Arc::new(MemoryStateRootStore::new())).await?;
            let psm = manager.resolve_for_user_context(&RequestContext::with_psi(psi))?;
            println!("{}", psm);
        }
    }
    Ok(())
}
