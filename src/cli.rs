use clap::ValueHint;

use std::path::PathBuf;

#[derive(clap::Parser, Debug, Clone)]
#[command(version, about)]
pub struct Args {
    /// Path to the config file.
    ///
    /// By default, notifeed looks for a file named `notifeed.toml` in the following directories
    /// (in order):
    ///
    /// - `./` (the current directory)
    /// - `/etc`
    #[arg(
        short,
        env = "NOTIFEED_CONFIG",
        value_hint(ValueHint::FilePath)
    )]
    pub config_path: Option<PathBuf>,

    /// Address of the admin HTTP server.
    #[arg(long, env = "NOTIFEED_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Path to the database file.
    #[arg(long, env = "NOTIFEED_DB", value_hint(ValueHint::FilePath))]
    pub db_path: Option<PathBuf>,

    /// Check the notification feed once (subject to the configured frequency) and exit.
    #[arg(long)]
    pub check_once: bool,
}

impl Args {
    pub fn parse() -> Self {
        clap::Parser::parse()
    }
}
