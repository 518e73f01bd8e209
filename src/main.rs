use anyhow::Result;
use clap::{Parser, Subcommand};
use marketscope::config::Config;
use marketscope::engine::Engine;
use marketscope::server;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "marketscope")]
#[command(version, about = "Market-analysis orchestration engine")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1:8300", env = "MARKETSCOPE_BIND")]
        bind: String,
        /// Optional config file (environment overrides it)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Serve { bind, config } => {
            let config = Config::load(config.as_deref())?;
            if !config.has_required_providers() {
                tracing::warn!(
                    "no LLM or search providers configured; submissions will be refused"
                );
            }
            let engine = Engine::new(config)?;
            server::serve(Arc::new(engine), &bind).await
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "marketscope=debug,info" } else { "marketscope=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
