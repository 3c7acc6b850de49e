use clap::{Parser, Subcommand};

use crate::domain::Cadence;

#[derive(Parser, Debug)]
#[command(name = "fundwatch")]
#[command(version = "0.1.0")]
#[command(about = "Funding rate settlement tracker", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config directory (default.toml plus $FUNDWATCH_ENV overrides)
    #[arg(short, long, default_value = "config")]
    pub config: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Classify, schedule extraction and verification, and run until signalled
    Run {
        /// Instruments to track (default: top by 24h volume)
        symbols: Vec<String>,
    },
    /// Print the settlement cadence of each instrument
    Classify {
        symbols: Vec<String>,
        /// Ignore cached classifications
        #[arg(long)]
        refresh: bool,
    },
    /// Load the full settlement history of one instrument
    Backfill { symbol: String },
    /// Check data freshness for one cadence bucket
    Verify {
        /// 1h, 4h or 8h
        cadence: Cadence,
        symbols: Vec<String>,
    },
    /// List the top instruments by 24h quote volume
    Symbols {
        #[arg(short, long)]
        limit: Option<usize>,
    },
}
