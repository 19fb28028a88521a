//! Studio CLI - command-line client for podcast studio calls
//!
//! Joins a studio over the signaling server, negotiates a peer call, and
//! records synchronized chunked uploads alongside the other participant.

mod call;
mod config;
mod media;
mod recording;
mod signaling;
mod studio;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;

#[derive(Parser)]
#[command(name = "studio-cli")]
#[command(about = "CLI client for podcast studio calls and recordings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a studio and stay in the call until `leave`
    Join {
        /// Studio (podcast) identifier to join
        podcast_id: String,

        /// Account identity; the studio creator is the recording host
        #[arg(short, long)]
        user_id: Option<String>,

        /// Offer a camera track in addition to the microphone
        #[arg(long)]
        video: bool,

        /// Simulate a denied camera/microphone permission prompt (debug)
        #[arg(long, hide = true)]
        deny_media: bool,
    },

    /// Show or update the stored configuration
    Config {
        /// Signaling websocket URL (e.g. wss://sig.example.com/ws)
        #[arg(long)]
        signaling_url: Option<String>,

        /// Backend API base URL
        #[arg(long)]
        api_url: Option<String>,

        /// Upload service base URL
        #[arg(long)]
        upload_url: Option<String>,

        /// Web app base URL (used for invite links)
        #[arg(long)]
        app_url: Option<String>,

        /// Default account identity for `join`
        #[arg(long)]
        user_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Join {
            podcast_id,
            user_id,
            video,
            deny_media,
        } => {
            let config = Config::load()?;
            let user_id = user_id
                .or_else(|| config.user_id.clone())
                .ok_or_else(|| {
                    anyhow::anyhow!("no user id; pass --user-id or set one via `config`")
                })?;
            studio::run(
                &config,
                studio::StudioOpts {
                    podcast_id,
                    user_id,
                    with_video: video,
                    deny_media,
                },
            )
            .await?;
        }
        Commands::Config {
            signaling_url,
            api_url,
            upload_url,
            app_url,
            user_id,
        } => {
            let mut config = Config::load()?;
            let changed = signaling_url.is_some()
                || api_url.is_some()
                || upload_url.is_some()
                || app_url.is_some()
                || user_id.is_some();
            if let Some(url) = signaling_url {
                config.signaling_url = url;
            }
            if let Some(url) = api_url {
                config.api_base_url = url;
            }
            if let Some(url) = upload_url {
                config.upload_base_url = url;
            }
            if let Some(url) = app_url {
                config.app_base_url = url;
            }
            if let Some(id) = user_id {
                config.user_id = Some(id);
            }
            if changed {
                config.save()?;
                tracing::info!("configuration saved");
            }
            println!("signaling_url = {}", config.signaling_url);
            println!("api_base_url  = {}", config.api_base_url);
            println!("upload_base_url = {}", config.upload_base_url);
            println!("app_base_url  = {}", config.app_base_url);
            println!("user_id = {}", config.user_id.as_deref().unwrap_or("(unset)"));
        }
    }

    Ok(())
}
