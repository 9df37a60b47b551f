use clap::{Parser, Subcommand};
use lunabridge::client::{self, CallRequest};
use lunabridge::config::{self, Config};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "lunabridge")]
#[command(author, version, about = "Luna bus client", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a bus method and print the replies
    Call {
        /// Method URI (e.g., "luna://com.webos.service.bus/signal/registerServerStatus")
        uri: String,

        /// JSON payload
        #[arg(default_value = "{}")]
        payload: String,

        /// Call on behalf of this application id
        #[arg(long)]
        app_id: Option<String>,

        /// Session id for the call ("no-session" disables it)
        #[arg(long)]
        session: Option<String>,

        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Retry a failed call this many times
        #[arg(long)]
        retry: Option<u32>,

        /// Deliver replies through the response spreader
        #[arg(long)]
        spread: bool,
    },

    /// Watch a service connect and disconnect
    Watch {
        /// Service name (e.g., "com.webos.notification")
        service: String,
    },

    /// Configure settings
    Config {
        /// Set the hub socket path
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Set the application id calls are made as
        #[arg(long)]
        app_id: Option<String>,

        /// Set the number of call attempts for retried calls
        #[arg(long)]
        retry: Option<u32>,

        /// Set the pause after each spread delivery, in milliseconds
        #[arg(long)]
        spread_delay_ms: Option<u64>,

        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

fn init_logging(verbose: bool, level: &str) {
    let filter = if verbose {
        EnvFilter::new("lunabridge=debug")
    } else {
        EnvFilter::try_new(format!("lunabridge={}", level))
            .unwrap_or_else(|_| EnvFilter::new("lunabridge=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // A broken config file is reported by the command itself.
    let level = Config::load()
        .map(|config| config.logging.level)
        .unwrap_or_else(|_| "info".to_string());
    init_logging(cli.verbose, &level);

    match cli.command {
        Commands::Call {
            uri,
            payload,
            app_id,
            session,
            timeout_ms,
            retry,
            spread,
        } => {
            let config = Config::load()?;
            let request = CallRequest {
                uri,
                payload,
                app_id,
                session,
                timeout: timeout_ms.map(Duration::from_millis),
                retry,
                spread,
            };
            let replies = client::call(config, request).await?;
            info!("{} replies received", replies);
        }

        Commands::Watch { service } => {
            let config = Config::load()?;
            client::watch(config, service).await?;
        }

        Commands::Config {
            socket,
            app_id,
            retry,
            spread_delay_ms,
            show,
        } => {
            if show {
                config::show()?;
            } else {
                config::update(socket, app_id, retry, spread_delay_ms)?;
            }
        }
    }

    Ok(())
}
