use clap::{Parser, Subcommand};

/// CLI entry point for the crawl controller.
/// Exit codes: 0=success, 2=invalid arguments, 3=I/O or config error
#[derive(Parser, Debug)]
#[command(name = "boardwatch")]
#[command(about = "Adaptive stealth-crawling controller for monitored announcement boards")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller loop against the configured targets.
    Run {
        #[arg(
            short,
            long,
            default_value = "./boardwatch.json",
            help = "Path to the controller configuration file"
        )]
        config: String,

        #[arg(
            short,
            long,
            default_value = "./data",
            help = "Directory for persisted controller state and logs"
        )]
        data_dir: String,

        #[arg(
            short,
            long,
            help = "Override the configured concurrent worker count"
        )]
        workers: Option<usize>,
    },

    /// Clear a target's suspension so it re-enters scheduling healthy.
    ResetSuspended {
        #[arg(help = "Target key to reset")]
        target: String,

        #[arg(short, long, default_value = "./data")]
        data_dir: String,
    },

    /// Make a target due on the next controller start, ignoring its windows
    /// and minimum interval.
    ForceSchedule {
        #[arg(help = "Target key to force")]
        target: String,

        #[arg(short, long, default_value = "./data")]
        data_dir: String,
    },

    /// Dump per-target persisted state for the operator.
    Status {
        #[arg(
            short,
            long,
            default_value = "./boardwatch.json",
            help = "Path to the controller configuration file"
        )]
        config: String,

        #[arg(short, long, default_value = "./data")]
        data_dir: String,
    },
}
