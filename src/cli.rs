use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::sites::{SiteFilter, ALL};

#[derive(Parser, Debug)]
#[command(name = "site-map")]
#[command(about = "Geocode WiFi 7 deployment sites and place them on a map", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Override the data directory (database, seed file, event journal)
    #[arg(long, global = true, env = "SITE_MAP_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Override the site dataset path
    #[arg(long, global = true)]
    pub sites: Option<PathBuf>,

    /// Minimum delay between network geocoding requests, in milliseconds
    #[arg(long, global = true)]
    pub delay_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve coordinates for the filtered sites and print the placed markers
    Resolve {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Geocode every unique address and write the seed file
    Seed {
        /// Output path (defaults to the configured seed file)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Inspect the persistent geocode cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Print storage, cache and configuration status as JSON
    Health,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Look up one address
    Get {
        /// Address exactly as it appears in the dataset
        address: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct FilterArgs {
    /// Case-insensitive search over customer, site and address
    #[arg(long, default_value = "")]
    pub search: String,

    #[arg(long, default_value = ALL)]
    pub region: String,

    #[arg(long, default_value = ALL)]
    pub vertical: String,

    /// Exclude sites that only carry AP 9176
    #[arg(long)]
    pub no_9176: bool,

    /// Exclude sites that only carry AP 9178
    #[arg(long)]
    pub no_9178: bool,

    /// Minimum total AP count
    #[arg(long, default_value_t = 0)]
    pub min_aps: u64,
}

impl From<FilterArgs> for SiteFilter {
    fn from(args: FilterArgs) -> Self {
        SiteFilter {
            search: args.search,
            region: args.region,
            vertical: args.vertical,
            wants_9176: !args.no_9176,
            wants_9178: !args.no_9178,
            min_aps: args.min_aps,
        }
    }
}
