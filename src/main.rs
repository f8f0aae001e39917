//! Transcache - a layered translation cache
//!
//! Opens the cache described by a TOML file (default `transcache.toml`) and
//! serves line commands from stdin until EOF or a shutdown signal.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use transcache::{BufferedCache, CacheFacade, Config};

const DEFAULT_CONFIG: &str = "transcache.toml";

/// One parsed stdin command.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Get(String),
    Set {
        key: String,
        value: String,
        ttl: Duration,
    },
    Del(String),
    Keys(String),
    Stats,
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> anyhow::Result<Option<Self>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let command = match tokens.as_slice() {
            [] => return Ok(None),
            ["get", key] => Command::Get(key.to_string()),
            ["set", key, value] | ["persist", key, value] => Command::Set {
                key: key.to_string(),
                value: value.to_string(),
                ttl: Duration::ZERO,
            },
            ["set", key, value, ttl_ms] => Command::Set {
                key: key.to_string(),
                value: value.to_string(),
                ttl: Duration::from_millis(
                    ttl_ms
                        .parse()
                        .with_context(|| format!("invalid TTL {:?}", ttl_ms))?,
                ),
            },
            ["del", key] => Command::Del(key.to_string()),
            ["keys"] => Command::Keys("*".to_string()),
            ["keys", pattern] => Command::Keys(pattern.to_string()),
            ["stats"] => Command::Stats,
            ["help"] => Command::Help,
            ["quit"] | ["exit"] => Command::Quit,
            _ => bail!("unrecognized command {:?} (try `help`)", line.trim()),
        };
        Ok(Some(command))
    }
}

/// Main entry point for the transcache shell.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging (stderr)
/// 2. Load configuration from the TOML file and `CACHE_*` variables
/// 3. Open both cache tiers
/// 4. Serve stdin commands until EOF, `quit`, or Ctrl+C/SIGTERM
/// 5. Destroy the cache so queued writes reach disk
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" for this crate, can be overridden with RUST_LOG
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = Config::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;
    info!(
        "Configuration loaded: cache_file={}, async_upstream={}, buffer_ttl={}ms",
        config.cache_file.display(),
        config.async_upstream,
        config.buffer_ttl_ms
    );

    let cache = BufferedCache::from_config(&config);
    cache
        .init()
        .await
        .with_context(|| format!("opening cache at {}", config.cache_file.display()))?;

    let outcome = tokio::select! {
        outcome = serve_stdin(&cache) => outcome,
        _ = shutdown_signal() => Ok(()),
    };

    cache.destroy().await.context("closing cache")?;
    info!("Cache closed");
    outcome
}

async fn serve_stdin(cache: &BufferedCache) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("error: {:#}", err);
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        if let Err(err) = execute(cache, command).await {
            println!("error: {:#}", err);
        }
    }
    Ok(())
}

async fn execute(cache: &BufferedCache, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Get(key) => match cache.load(&key).await? {
            Some(value) => println!("{}", value),
            None => println!("(nil)"),
        },
        Command::Set { key, value, ttl } => {
            cache.save(&key, value, ttl).await?;
            println!("OK");
        }
        Command::Del(key) => {
            cache.invalidate(&key).await?;
            println!("OK");
        }
        Command::Keys(pattern) => {
            let mut keys: Vec<String> = cache.keys(&pattern).await?.into_iter().collect();
            keys.sort();
            for key in keys {
                println!("{}", key);
            }
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&cache.stats())?);
        }
        Command::Help => {
            println!("get KEY | set KEY VALUE [TTL_MS] | persist KEY VALUE | del KEY");
            println!("keys [PATTERN] | stats | quit");
        }
        Command::Quit => {}
    }
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("get hello").unwrap(),
            Some(Command::Get("hello".into()))
        );
        assert_eq!(
            Command::parse("set a b 1500").unwrap(),
            Some(Command::Set {
                key: "a".into(),
                value: "b".into(),
                ttl: Duration::from_millis(1500),
            })
        );
        assert_eq!(
            Command::parse("persist a b").unwrap(),
            Some(Command::Set {
                key: "a".into(),
                value: "b".into(),
                ttl: Duration::ZERO,
            })
        );
        assert_eq!(
            Command::parse("keys").unwrap(),
            Some(Command::Keys("*".into()))
        );
        assert_eq!(Command::parse("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Command::parse("set a b soon").is_err());
        assert!(Command::parse("fly away").is_err());
    }
}
