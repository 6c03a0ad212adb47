use clap::{Parser, Subcommand, ValueEnum};

use gale_core::{CorrelationMode, WireFormat};

mod commands;

#[derive(Parser)]
#[command(name = "gale")]
#[command(about = "WebSocket virtual-user load generator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, default_value = "info", global = true, env = "GALE_LOG")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive virtual users against a WebSocket endpoint and report latencies
    Run(RunArgs),
    /// Serve a local WebSocket echo target
    Echo {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,

        /// Hold every echo back by this many milliseconds
        #[arg(long, default_value = "0")]
        delay_ms: u64,
    },
}

#[derive(clap::Args)]
pub struct RunArgs {
    /// Target endpoint (ws:// or wss://)
    #[arg(long, env = "WS_URL", default_value = "ws://localhost:8080/ws")]
    pub url: String,

    /// Number of virtual users
    #[arg(long, default_value = "3000")]
    pub vus: usize,

    #[arg(long, default_value = "30")]
    pub duration_secs: u64,

    #[arg(long, default_value = "100")]
    pub interval_ms: u64,

    /// Lifetime of each WebSocket session
    #[arg(long, default_value = "10000")]
    pub session_timeout_ms: u64,

    #[arg(long, default_value = "5000")]
    pub handshake_timeout_ms: u64,

    #[arg(long, default_value = "1000")]
    pub close_grace_ms: u64,

    #[arg(long, default_value = "2000")]
    pub shutdown_grace_ms: u64,

    /// Cap on simultaneously open sessions (defaults to --vus)
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Spread VU start times over this many seconds
    #[arg(long, default_value = "0")]
    pub ramp_up_secs: u64,

    #[arg(long, value_enum, default_value = "embedded")]
    pub correlation: CorrelationArg,

    #[arg(long, value_enum, default_value = "json")]
    pub wire_format: WireFormatArg,

    #[arg(long, default_value = "user-")]
    pub payload_prefix: String,

    /// Start a new session as soon as the previous one ends, until the run ends
    #[arg(long)]
    pub repeat: bool,

    /// Seconds between progress lines, 0 to disable
    #[arg(long, default_value = "5")]
    pub progress_secs: u64,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CorrelationArg {
    /// Requests carry an id the target echoes back
    Embedded,
    /// Target replies carry no id; match replies in send order
    Fifo,
}

impl From<CorrelationArg> for CorrelationMode {
    fn from(arg: CorrelationArg) -> Self {
        match arg {
            CorrelationArg::Embedded => CorrelationMode::Embedded,
            CorrelationArg::Fifo => CorrelationMode::Fifo,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum WireFormatArg {
    Json,
    Binary,
}

impl From<WireFormatArg> for WireFormat {
    fn from(arg: WireFormatArg) -> Self {
        match arg {
            WireFormatArg::Json => WireFormat::Json,
            WireFormatArg::Binary => WireFormat::Binary,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&cli.log_level)
        .init();

    match cli.command {
        Commands::Run(args) => {
            commands::run(args).await?;
        }
        Commands::Echo { bind, delay_ms } => {
            commands::echo(&bind, delay_ms).await?;
        }
    }

    Ok(())
}
