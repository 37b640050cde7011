//! Command-line interface for the storefront client

use clap::{Parser, Subcommand};

/// Storefront real-time client
///
/// Keeps an authenticated real-time connection to the storefront server
/// alive, refreshing the access token before it expires.
#[derive(Parser, Debug)]
#[command(name = "storefront-realtime")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// More log output: -v debug, -vv trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file to use instead of the search path
    #[arg(short, long, global = true, env = "STOREFRONT_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect, restore the session and log real-time events until Ctrl-C
    Run,

    /// Log in with email and password and store the access token
    Login {
        #[arg(long)]
        email: String,

        #[arg(long, env = "STOREFRONT_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// End the session on the server and clear the stored token
    Logout,

    /// Show the stored session and token expiry
    Status,

    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Where to create the file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Load and validate the configuration
    Validate,
}
