//! Command-line arguments.

use std::path::PathBuf;

use beam_core::Compression;
use clap::{ArgAction, ArgGroup, Args, Parser, Subcommand};

/// Point-to-point file transfer over TCP.
#[derive(Debug, Parser)]
#[command(name = "beam", version, about = "Point-to-point file transfer over TCP")]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Receive files until interrupted
    Receive {
        /// Password for encrypted transfers
        #[arg(long)]
        password: Option<String>,

        /// Port to listen on (default from config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Download directory (default from config)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Send files or directories to a receiver
    Send(SendArgs),

    /// List interrupted transfers that can be resumed
    ListResume,

    /// Resume the transfer at INDEX in `list-resume`
    Resume {
        index: usize,

        /// Password, when the transfer was encrypted
        #[arg(long)]
        password: Option<String>,
    },

    /// Show queued jobs
    QueueList,

    /// Run queued jobs until the queue is empty or stopped
    QueueStart,

    /// Ask a running `queue-start` to stop after its current job
    QueueStop,

    /// Drop every queued job
    QueueClear,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("compression").args(["compress", "gzip", "brotli"])))]
pub struct SendArgs {
    /// Receiver host name or address
    pub host: String,

    /// Files or directories to send
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Compress with gzip
    #[arg(long)]
    pub compress: bool,

    /// Compress with gzip
    #[arg(long)]
    pub gzip: bool,

    /// Compress with brotli
    #[arg(long)]
    pub brotli: bool,

    /// Encrypt with this password
    #[arg(long, value_name = "PASSWORD")]
    pub encrypt: Option<String>,

    /// Record progress so the transfer can be resumed
    #[arg(long)]
    pub resume: bool,

    /// Bandwidth cap in KB/s
    #[arg(long, value_name = "KBS")]
    pub speed_limit: Option<u64>,

    /// Add to the queue instead of sending now
    #[arg(long)]
    pub queue: bool,

    /// Receiver port (default from config)
    #[arg(short, long)]
    pub port: Option<u16>,
}

impl SendArgs {
    pub fn compression(&self) -> Compression {
        if self.brotli {
            Compression::Brotli
        } else if self.gzip || self.compress {
            Compression::Gzip
        } else {
            Compression::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_flags() {
        let cli = Cli::parse_from([
            "beam", "-vv", "send", "10.0.0.2", "a.txt", "b.txt", "--brotli", "--encrypt", "pw",
            "--speed-limit", "512", "--resume",
        ]);
        assert_eq!(cli.verbose, 2);
        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.paths.len(), 2);
        assert_eq!(args.compression(), Compression::Brotli);
        assert_eq!(args.encrypt.as_deref(), Some("pw"));
        assert_eq!(args.speed_limit, Some(512));
        assert!(args.resume && !args.queue);
    }

    #[test]
    fn test_compression_flags_exclusive() {
        assert!(Cli::try_parse_from(["beam", "send", "h", "a", "--gzip", "--brotli"]).is_err());
        let cli = Cli::try_parse_from(["beam", "send", "h", "a", "--compress"]).unwrap();
        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.compression(), Compression::Gzip);
    }

    #[test]
    fn test_resume_index() {
        let cli = Cli::parse_from(["beam", "resume", "2", "--password", "pw"]);
        assert!(matches!(cli.command, Command::Resume { index: 2, .. }));
    }
}
