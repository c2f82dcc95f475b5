use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pgrant_core::{LogFormat, LoggingConfig, PgrantConfig};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "pgrant", version, about = "Time-boxed access grants for PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy.
    Serve {
        /// Path to the configuration file.
        #[arg(short, long, env = "PGRANT_CONFIG", default_value = "pgrant.yaml")]
        config: PathBuf,
    },

    /// Validate a configuration file and summarise its grants.
    Check {
        /// Path to the configuration file.
        #[arg(short, long, env = "PGRANT_CONFIG", default_value = "pgrant.yaml")]
        config: PathBuf,
    },

    /// Show how SQL is classified and whether a control set admits it.
    Classify {
        /// SQL text; may hold several statements.
        sql: String,

        /// Controls to check against (read_only, block_copy, block_ddl).
        #[arg(long = "control", value_delimiter = ',')]
        controls: Vec<String>,
    },

    /// Hash a password for the `users` section.
    HashPassword {
        /// Password to hash. Read from stdin when omitted.
        password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Serve { config } => {
            let config = PgrantConfig::load_with_context(&config)?;
            init_tracing(&config.logging);
            commands::serve::run(config).await?
        }
        Command::Check { config } => {
            init_tracing(&LoggingConfig::default());
            commands::check::run(&config)?
        }
        Command::Classify { sql, controls } => commands::classify::run(&sql, &controls)?,
        Command::HashPassword { password } => commands::hash_password::run(password)?,
    }

    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}
