use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use creditd::api::{self, AppState};
use creditd::config;

#[derive(Parser)]
#[command(name = "creditd")]
#[command(about = "Credit accounting and usage-metering service for an LLM chat platform")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server exposing the `/credit` surface.
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Apply pending database migrations and exit.
    Migrate,

    /// Bulk-issue redemption codes from the command line.
    IssueCodes {
        #[arg(long)]
        purpose: String,
        #[arg(long)]
        count: u32,
        #[arg(long)]
        amount: Decimal,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut cfg = config::load()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, bind } => {
            if let Some(port) = port {
                cfg.gateway.port = port;
            }
            if let Some(bind) = bind {
                cfg.gateway.bind = bind;
            }
            serve(cfg).await
        }
        Commands::Migrate => {
            creditd::db::connect(&cfg.gateway.database_path).await?;
            info!("migrations applied");
            Ok(())
        }
        Commands::IssueCodes { purpose, count, amount } => {
            let pool = creditd::db::connect(&cfg.gateway.database_path).await?;
            let codes = creditd::redemption::RedemptionCodes::new(pool);
            let issued = codes.issue(&purpose, count, amount, None).await?;
            for code in issued {
                println!("{}", code.code);
            }
            Ok(())
        }
    }
}

async fn serve(config: config::CreditConfig) -> anyhow::Result<()> {
    let pool = creditd::db::connect(&config.gateway.database_path).await?;
    let addr = format!("{}:{}", config.gateway.bind, config.gateway.port);
    let state = AppState::new(config, pool);
    let router = api::router(state).layer(tower_http::trace::TraceLayer::new_for_http());

    info!(%addr, "creditd listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;
    Ok(())
}
