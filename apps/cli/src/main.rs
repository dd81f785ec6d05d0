//! Courier command-line tool.

mod host;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use courier_http::{DirectoryStore, Services, TransferConfig, TransferManager, Transferable};
use courier_protocol::TransferStatus;
use tracing_subscriber::EnvFilter;

use crate::host::{CliHost, CliMessage, NullChannel, Outcome, describe};

#[derive(Parser, Debug)]
#[command(name = "courier", version, about = "Encrypted, resumable HTTP media transfers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a file, resuming a previous partial download.
    Fetch {
        /// `https://` or `aesgcm://` URL (key in the fragment).
        url: String,

        /// Directory to save into.
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Transfer configuration file (JSON).
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier=debug")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Fetch { url, dir, config } => {
            let config = load_config(config)?;
            let rt = tokio::runtime::Runtime::new()?;
            let saved = rt.block_on(fetch(config, &url, dir))?;
            println!("{}", saved.display());
        }
    }
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<TransferConfig> {
    match path {
        Some(path) => TransferConfig::load_from(&path)
            .with_context(|| format!("reading config {}", path.display())),
        None => Ok(TransferConfig::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "no usable config location, using defaults");
            TransferConfig::default()
        })),
    }
}

/// Local file stem for a URL: its last path segment up to the first dot.
fn stem_for(raw: &str) -> String {
    let parsed = courier_transfer::url::from_encrypted_scheme(raw).ok();
    parsed
        .as_ref()
        .and_then(|u| u.path_segments())
        .and_then(|mut s| s.next_back())
        .and_then(|name| name.split('.').next())
        .filter(|stem| !stem.is_empty())
        .unwrap_or("download")
        .to_string()
}

async fn fetch(config: TransferConfig, raw_url: &str, dir: PathBuf) -> anyhow::Result<PathBuf> {
    let url = courier_transfer::url::from_encrypted_scheme(raw_url)
        .with_context(|| format!("invalid URL {raw_url}"))?;
    tracing::info!(host = url.host_str().unwrap_or(""), "fetching");

    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let (host, mut changed) = CliHost::new();
    let store = Arc::new(DirectoryStore::new(&dir, dir.join(".courier-partial")));
    let services = Services::new(host.clone(), store, Arc::new(NullChannel));
    let manager = TransferManager::new(config, services, tokio::runtime::Handle::current());

    let message = CliMessage::new(stem_for(raw_url), raw_url);
    let transfer = manager
        .create_download(message, true)
        .context("download already running")?;

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    let mut detached_checks = 0;
    loop {
        if let Some(outcome) = host.outcome() {
            return match outcome {
                Outcome::Saved(path) => Ok(path),
                Outcome::Failed(category) => bail!("download failed: {}", describe(category)),
            };
        }
        match transfer.status() {
            TransferStatus::OfferCheckFilesize => {
                transfer.cancel();
                bail!("server did not report the file size");
            }
            TransferStatus::Offer => {
                transfer.start();
            }
            _ => {}
        }
        // Detached without a result: give the terminal step a moment to report.
        if !manager.is_active(&transfer.message_id()) {
            detached_checks += 1;
            if detached_checks > 1 {
                bail!("download stopped without a result");
            }
        }

        tokio::select! {
            _ = &mut interrupted => {
                manager.cancel_all();
                bail!("interrupted");
            }
            r = changed.changed() => {
                if r.is_err() {
                    bail!("transfer host went away");
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(250)), if detached_checks > 0 => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stems() {
        assert_eq!(stem_for("https://h.example/a/photo.jpg"), "photo");
        assert_eq!(stem_for("aesgcm://h.example/x/doc.txt.pgp#00"), "doc");
        assert_eq!(stem_for("https://h.example/"), "download");
        assert_eq!(stem_for("nonsense"), "download");
    }

    #[test]
    fn cli_parses_fetch() {
        let cli = Cli::try_parse_from(["courier", "fetch", "https://h/a.jpg", "--dir", "/tmp/x"])
            .unwrap();
        let Command::Fetch { url, dir, config } = cli.command;
        assert_eq!(url, "https://h/a.jpg");
        assert_eq!(dir, PathBuf::from("/tmp/x"));
        assert!(config.is_none());
    }

    #[test]
    fn explicit_config_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfer.json");
        std::fs::write(&path, r#"{"max_workers": 2}"#).unwrap();
        let config = load_config(Some(path)).unwrap();
        assert_eq!(config.max_workers, 2);
    }
}
