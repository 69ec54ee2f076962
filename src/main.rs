extern crate log;
pub mod auth;
pub mod config;
pub mod osm;
pub mod server;
use crate::config::{load_config, load_secrets};
use crate::osm::api::HttpOsmApi;
use crate::server::AppState;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Map server that shows Overpass layers and writes edits back to OpenStreetMap.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML config file.
    #[arg(short, long, default_value = "config.yaml")]
    config_filepath: PathBuf,

    /// Port to listen on, overrides both the config file and `PORT`.
    #[arg(short, long)]
    port: Option<u16>,
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = load_config(&args.config_filepath)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let secrets = load_secrets(|key| std::env::var(key).ok())?;
    log::info!(
        "Loaded {} layers from {:?}, changesets are {}",
        config.layers.len(),
        args.config_filepath,
        if config.changesets.reuse {
            "reused per user"
        } else {
            "opened per request"
        }
    );

    let osm = Arc::new(HttpOsmApi::new(
        &config.osm.api_url,
        &config.osm.user_agent,
        Duration::from_secs(config.osm.timeout_secs),
    )?);
    let state = Arc::new(AppState::new(config, &secrets, osm)?);
    state.layers.load_on_boot(&state.overpass).await?;
    server::serve(state).await
}

fn try_main() -> anyhow::Result<()> {
    let args = Args::try_parse()?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(args))
}

fn main() {
    // Before the logger so RUST_LOG can come from .env as well.
    let dotenv = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = dotenv {
        log::debug!("No .env file loaded: {}", err);
    }
    if let Err(e) = try_main() {
        eprintln!("Error: {:?}", e);
        std::process::exit(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_flag_is_optional() {
        let args = Args::try_parse_from(["osm_poi_editor"]).unwrap();
        assert_eq!(args.config_filepath, PathBuf::from("config.yaml"));
        assert_eq!(args.port, None);

        let args = Args::try_parse_from(["osm_poi_editor", "-c", "other.yaml", "--port", "9100"])
            .unwrap();
        assert_eq!(args.config_filepath, PathBuf::from("other.yaml"));
        assert_eq!(args.port, Some(9100));
    }
}
