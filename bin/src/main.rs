//! candlewick CLI - Live multi-timeframe candle aggregation.

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};

mod commands;
mod display;
mod logging;

use display::Format;

#[derive(Parser)]
#[command(name = "candlewick")]
#[command(about = "Live multi-timeframe candle aggregation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate live bars from Binance
    Watch {
        /// Market (spot, usdm, coinm)
        #[arg(short, long, default_value = "spot")]
        market: String,

        /// Comma-separated symbols. Defaults to every active pair.
        #[arg(short, long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Comma-separated timeframes. The lowest one is streamed.
        #[arg(short, long, value_delimiter = ',', default_value = "1m,5m,15m,1h,4h,1d")]
        timeframes: Vec<String>,

        /// Symbols backfilled concurrently
        #[arg(long, default_value = "1")]
        init_concurrency: usize,

        /// Only print closed bars
        #[arg(long)]
        closed_only: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Show the bar containing an instant
    Boundary {
        /// Timeframe (e.g., 1h, 3d, 1M)
        timeframe: String,

        /// Unix milliseconds, RFC 3339 instant, or "now"
        #[arg(default_value = "now")]
        timestamp: String,

        /// IANA timezone used for calendar bars
        #[arg(long, default_value = "UTC")]
        timezone: String,

        /// Anchor open time for day, week and multi-month timeframes
        #[arg(long)]
        base_time: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet)?;

    // Show help if no command provided
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    match command {
        Commands::Watch { market, symbols, timeframes, init_concurrency, closed_only, format } => {
            commands::watch::watch(&market, symbols, &timeframes, init_concurrency, closed_only, format).await
        }
        Commands::Boundary { timeframe, timestamp, timezone, base_time } => {
            commands::boundary::boundary(&timeframe, &timestamp, &timezone, base_time)
        }
    }
}
