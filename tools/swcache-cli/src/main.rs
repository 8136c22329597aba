//! Command-line driver for the swcache caching proxy.
//!
//! ## Usage
//!
//! ```bash
//! # Install (and, with skip_waiting, activate) the configured generation
//! swcache --config swcache.json install
//!
//! # See which strategy a request would get
//! swcache --config swcache.json classify https://app.example.com/index.html
//!
//! # Serve a request through the proxy
//! swcache --config swcache.json fetch https://app.example.com/images/logo.png
//!
//! # Inspect and clear storage
//! swcache --config swcache.json generations
//! swcache --config swcache.json clear
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use swcache_common::{init_logging, LogConfig};
use swcache_net::Request;
use swcache_sw::{CacheConfig, CacheProxy};
use tracing::debug;
use url::Url;

mod report;

use report::{FetchReport, GenerationRow};

#[derive(Parser)]
#[command(name = "swcache")]
#[command(about = "Generation-versioned caching proxy")]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the configured generation from the pre-cache list
    Install {
        /// Leave the new generation waiting even if skip_waiting is set
        #[arg(long)]
        no_activate: bool,
    },

    /// Activate a waiting generation
    Activate,

    /// List stored generations
    Generations,

    /// List entries of the current generation
    Entries,

    /// Delete every generation
    Clear,

    /// Show the strategy a request would be served with
    Classify {
        url: String,
        /// Treat the request as a page navigation
        #[arg(long)]
        navigate: bool,
        /// Accept header to send
        #[arg(long)]
        accept: Option<String>,
    },

    /// Serve a request through the proxy
    Fetch {
        url: String,
        /// Treat the request as a page navigation
        #[arg(long)]
        navigate: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<CacheConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(CacheConfig::from_file(path)?),
        None => Ok(CacheConfig::default()),
    }
}

fn build_request(url: &str, navigate: bool, accept: Option<&str>) -> Result<Request, Box<dyn std::error::Error>> {
    let url = Url::parse(url)?;
    let mut request = if navigate { Request::navigate(url) } else { Request::get(url) };
    if let Some(accept) = accept {
        request = request.accept(accept);
    }
    Ok(request)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(LogConfig::from_verbosity(cli.verbose))?;

    let mut config = load_config(cli.config.as_ref())?;
    debug!(version = %config.version, database = %config.database_path().display(), "Configuration loaded");

    match cli.command {
        Commands::Classify { url, navigate, accept } => {
            // Classification needs no storage.
            let classifier = swcache_sw::Classifier::from_config(&config);
            let request = build_request(&url, navigate, accept.as_deref())?;
            let strategy = classifier.classify(&request);
            let rule = classifier.matching_rule(&request).map(|rule| rule.name);

            if cli.json {
                print_json(&serde_json::json!({ "url": url, "strategy": strategy, "rule": rule }))?;
            } else {
                println!("{strategy}  ({})", rule.unwrap_or("default"));
            }
        }

        Commands::Install { no_activate } => {
            if no_activate {
                config.skip_waiting = false;
            }
            let proxy = CacheProxy::open(config).await?;
            match proxy.install().await? {
                Some(activation) => {
                    println!("Installed and activated {}", activation.generation);
                    for name in &activation.retired {
                        println!("  Retired {name}");
                    }
                }
                None => println!("Installed {}; waiting for activation", proxy.generations().staging_name()),
            }
        }

        Commands::Activate => {
            let proxy = CacheProxy::open(config).await?;
            let activation = proxy.activate().await?;
            println!("Activated {}", activation.generation);
            for name in &activation.retired {
                println!("  Retired {name}");
            }
        }

        Commands::Generations => {
            let proxy = CacheProxy::open(config).await?;
            let rows: Vec<GenerationRow> = proxy
                .generations()
                .describe()
                .await?
                .iter()
                .map(GenerationRow::from)
                .collect();

            if cli.json {
                print_json(&rows)?;
            } else if rows.is_empty() {
                println!("No generations stored");
            } else {
                for row in &rows {
                    println!("{:<32} {:>6} entries  {}", row.name, row.entries, row.role);
                }
            }
        }

        Commands::Entries => {
            let proxy = CacheProxy::open(config).await?;
            let keys = proxy.generations().keys().await?;
            if cli.json {
                let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
                print_json(&keys)?;
            } else {
                for key in &keys {
                    println!("{key}");
                }
                println!("{} entries", keys.len());
            }
        }

        Commands::Clear => {
            let proxy = CacheProxy::open(config).await?;
            let deleted = proxy.generations().clear_all().await?;
            println!("Deleted {} generation(s)", deleted.len());
        }

        Commands::Fetch { url, navigate } => {
            let proxy = CacheProxy::open(config).await?;
            let request = build_request(&url, navigate, None)?;
            let strategy = proxy.classify(&request);
            let response = proxy.handle_fetch(request).await;
            proxy.flush().await;

            let report = FetchReport::new(strategy, &response);
            if cli.json {
                print_json(&report)?;
            } else {
                report.print();
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["swcache", "fetch", "https://a.example/x.js", "-vv", "--json"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Fetch { navigate: false, .. }));
    }

    #[test]
    fn test_build_request_navigation() {
        let request = build_request("https://app.example.com/", true, None).unwrap();
        assert!(request.is_navigation());

        let request = build_request("https://app.example.com/a", false, Some("text/html")).unwrap();
        assert_eq!(request.accept_header(), Some("text/html"));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swcache.json");
        std::fs::write(&path, r#"{"version": "v9"}"#).unwrap();

        assert_eq!(load_config(Some(&path)).unwrap().version, "v9");
        assert_eq!(load_config(None).unwrap(), CacheConfig::default());
    }
}
