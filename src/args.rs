use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "goma_ctl")]
#[command(version)]
#[command(about = "Install, update and supervise the goma compiler_proxy", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
#[command(rename_all = "snake_case")]
pub(crate) enum Commands {
    /// Start compiler proxy
    Start,

    /// Stop compiler proxy
    Stop,

    /// Restart compiler proxy
    Restart,

    /// Start compiler proxy if it is not running
    EnsureStart,

    /// Just download the latest goma package for update
    Pull,

    /// Update or install goma package
    Update,

    /// Get compiler proxy status
    Status,

    /// Show statistics
    Stat,

    /// Show histogram
    Histogram,

    /// Show status report in JSON
    Jsonstatus {
        /// Write the report here instead of stdout
        outfile: Option<String>,
    },

    /// Show the available latest release version
    LatestVersion,

    /// Download the latest goma package
    Fetch {
        /// One of goobuntu, chromeos, mac, win64
        platform: String,

        /// File name in the current directory (default: the package name)
        outfile: Option<String>,
    },

    /// Create a report file
    Report,

    /// Audit goma client
    Audit,
}
