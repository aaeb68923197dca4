//! Cachet admin tool.
//!
//! # Usage
//!
//! ```bash
//! cachet --url sqlite://cache.db init
//! cachet --url sqlite://cache.db markers --json
//! cachet --url sqlite://cache.db clear-marker summoner
//! ```
//!
//! Environment variables can also be used:
//! - `CACHET_URL`: Database URL
//! - `CACHET_SCHEMA_MODE`: Schema management mode
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use anyhow::Context;
use cachet::config::Config;
use cachet::observability::tracing::init_tracing;
use cachet::{Store, WorkerToken};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "cachet")]
#[command(author, version, about = "Inspect and maintain a Cachet store", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: Config,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or check the store's tables according to the schema mode
    Init,
    /// List completeness markers
    Markers {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget that an entity type's population is complete
    ClearMarker {
        /// Entity type name
        entity_type: String,
    },
}

/// Print startup banner with version and target database.
fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        r#"
  Cachet v{}

  Configuration:
    Database:     {}
    Schema Mode:  {}
    Log Level:    {}
"#,
        version,
        config.url.as_deref().unwrap_or("<unset>"),
        config.schema_mode,
        config.log_level
    );
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.config.log_level, cli.log_json);
    print_banner(&cli.config);

    let store = Store::builder(cli.config.clone())
        .build()
        .context("failed to open store")?;
    let worker = WorkerToken::new();

    match cli.command {
        Command::Init => {
            println!("schema ready ({})", cli.config.schema_mode);
        }
        Command::Markers { json } => {
            let markers = store
                .completeness_markers(&worker)
                .context("failed to read completeness markers")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&markers)?);
            } else if markers.is_empty() {
                println!("no completeness markers");
            } else {
                for marker in &markers {
                    println!("{marker}");
                }
            }
        }
        Command::ClearMarker { entity_type } => {
            let removed = store
                .clear_marker(&worker, &entity_type)
                .with_context(|| format!("failed to clear marker for {entity_type}"))?;
            if removed {
                println!("cleared {entity_type}");
            } else {
                println!("no marker for {entity_type}");
            }
        }
    }

    store.close().context("failed to close store")?;
    tracing::info!("Cachet shutdown complete");
    Ok(())
}
