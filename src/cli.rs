//! Command line argument surface.

use clap::{Parser, ValueEnum};

/// How local paths map to destinations on the receiving terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// The last argument names the remote destination.
    Normal,
    /// Recreate the local layout; paths under the home directory are sent
    /// as `~`-relative.
    Mirror,
}

#[derive(Debug, Parser)]
#[command(
    name = "termsend",
    version,
    about = "Send files and directories over the terminal's in-band transfer protocol"
)]
pub struct Args {
    /// Transfer mode
    #[arg(long, value_enum, default_value = "normal")]
    pub mode: Mode,

    /// Print the resolved destination of every file and wait for y/n
    /// confirmation before sending any data
    #[arg(long)]
    pub confirm_paths: bool,

    /// Shared-secret password, hashed together with the request id into the
    /// start frame; skips the interactive permission round-trip
    #[arg(long, env = "TERMSEND_PASSWORD")]
    pub permissions_password: Option<String>,

    /// Ask the receiver for delta transmission of files it already has
    #[arg(long)]
    pub transmit_deltas: bool,

    /// Local paths to send; in normal mode the final argument is the remote
    /// destination path
    #[arg(required = true)]
    pub paths: Vec<String>,
}
