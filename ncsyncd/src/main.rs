use std::sync::Arc;

use anyhow::Context;
use ncsync_core::DavClient;
use ncsyncd::config::SyncConfig;
use ncsyncd::events::EventBus;
use ncsyncd::sync::e2ee::crypto::ChaChaCrypto;
use ncsyncd::sync::engine::SyncEngine;
use ncsyncd::sync::index::MetadataStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    /// Reads the given folder, relative to the WebDAV home, or the home itself.
    Run(Option<String>),
    ReleaseLocks,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run(None);
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--release-locks" => mode = CliMode::ReleaseLocks,
            "--help" | "-h" => mode = CliMode::Help,
            other if other.starts_with('-') => anyhow::bail!("unknown argument: {other}"),
            folder => mode = CliMode::Run(Some(folder.to_string())),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ncsyncd=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: ncsyncd [FOLDER] [--release-locks]");
        println!("  FOLDER            Folder to read, relative to the WebDAV home");
        println!("  --release-locks   Unlock every stored end-to-end folder lock and exit");
        return Ok(());
    }
    init_tracing();

    let config = SyncConfig::from_env()?;
    tokio::fs::create_dir_all(&config.cache_root)
        .await
        .with_context(|| format!("failed to create cache root at {:?}", config.cache_root))?;
    let gateway = DavClient::with_webdav_root(
        &config.server_url,
        &config.webdav_root,
        config.user.clone(),
        config.app_password.clone(),
    )
    .context("invalid server URL")?;
    let store = MetadataStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open metadata store at {:?}", config.db_path))?;
    let engine = SyncEngine::new(
        config.account(),
        Arc::new(gateway),
        store,
        Arc::new(ChaChaCrypto),
        EventBus::new(),
        config.engine_config(),
    );

    match mode {
        CliMode::ReleaseLocks => {
            let released = engine.locks().release_all(engine.account()).await?;
            info!(released, "stored folder locks released");
        }
        CliMode::Run(folder) => {
            let home = engine.account().home();
            let server_url = match folder.as_deref().map(|f| f.trim_matches('/')) {
                Some(folder) if !folder.is_empty() => format!("{home}/{folder}"),
                _ => home,
            };
            let records = engine.read_folder(&server_url).await?;
            info!(server_url = %server_url, entries = records.len(), "folder read");
            for record in records {
                let kind = if record.directory { "dir " } else { "file" };
                println!("{kind} {:>12} {}", record.size, record.file_name_view);
            }
        }
        CliMode::Help => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        let mode = parse_cli_mode(args(&["ncsyncd"])).unwrap();
        assert_eq!(mode, CliMode::Run(None));
    }

    #[test]
    fn parse_cli_mode_takes_folder() {
        let mode = parse_cli_mode(args(&["ncsyncd", "Photos/2024"])).unwrap();
        assert_eq!(mode, CliMode::Run(Some("Photos/2024".into())));
    }

    #[test]
    fn parse_cli_mode_supports_release_locks() {
        let mode = parse_cli_mode(args(&["ncsyncd", "--release-locks"])).unwrap();
        assert_eq!(mode, CliMode::ReleaseLocks);
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        let mode = parse_cli_mode(args(&["ncsyncd", "--help"])).unwrap();
        assert_eq!(mode, CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(args(&["ncsyncd", "--logout"])).is_err());
    }
}
