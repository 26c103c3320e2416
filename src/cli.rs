// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: One target endpoint per invocation, one operation per subcommand.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "machine-ssh")]
#[command(about = "Run commands and copy files on remote machines over SSH")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Client settings file (YAML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Remote machine as [user@]host[:port]
    pub target: String,

    /// Private key file; without one only the SSH agent is tried
    #[arg(short, long)]
    pub key: Option<PathBuf>,

    /// Environment variable holding the key passphrase
    #[arg(long, requires = "key")]
    pub passphrase_env: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command, log its output and fail on non-zero exit
    Run {
        /// Command line executed by the remote shell
        command: String,
    },

    /// Run a command and print its standard output
    Output {
        /// Command line executed by the remote shell
        command: String,
    },

    /// Print the cluster admin kubeconfig
    Kubeconfig,

    /// Copy a local file to a remote path
    Copy {
        local: PathBuf,
        remote: String,

        /// Octal permissions for the remote file; use 600 for secrets
        #[arg(long, value_parser = parse_mode, default_value = "644")]
        mode: u32,
    },

    /// Add a public key to the remote user's authorized keys
    Authorize {
        /// OpenSSH public key file
        public_key: PathBuf,
    },

    /// Remove a public key from the remote user's authorized keys
    Revoke {
        /// OpenSSH public key file
        public_key: PathBuf,
    },
}

fn parse_mode(s: &str) -> Result<u32, String> {
    let mode = u32::from_str_radix(s.trim_start_matches("0o"), 8)
        .map_err(|_| format!("invalid octal mode: {}", s))?;
    if mode > 0o7777 {
        return Err(format!("mode out of range: {}", s));
    }
    Ok(mode)
}
