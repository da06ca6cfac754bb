use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "sharelock", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub target: Target,

    /// Nickname shown to other instances while this one holds a lease
    #[arg(short, long, global = true)]
    pub nickname: Option<String>,

    /// JSON config file; `SHARELOCK_*` variables are used otherwise
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, action = ArgAction::Count, global = true)]
    pub verbosity: u8,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// What to lock: the shared database, or one file in a shared directory
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = true)]
pub struct Target {
    /// Shared database file
    #[arg(long, value_name = "PATH", conflicts_with_all = ["dir", "file"])]
    pub db: Option<PathBuf>,

    /// Shared output directory
    #[arg(long, value_name = "DIR", requires = "file")]
    pub dir: Option<PathBuf>,

    /// File name inside the output directory
    #[arg(long, value_name = "NAME", requires = "dir")]
    pub file: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Prints the current lease, if any
    Info,
    /// Prints whether the resource is locked by another instance
    Status,
    /// Takes the lease without overriding anyone
    Acquire {
        /// Expected duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,
        #[arg(short = 'm', long, default_value = "Manual lock")]
        operation: String,
    },
    /// Takes the lease unconditionally
    ForceAcquire {
        #[arg(short, long)]
        duration: Option<u64>,
        #[arg(short = 'm', long, default_value = "Manual lock")]
        operation: String,
    },
    /// Refreshes a lease held by this instance
    Heartbeat,
    /// Releases a lease held by this instance
    Release,
    /// Runs a command while holding the lease, retrying while it is busy
    Run {
        #[arg(short, long)]
        duration: Option<u64>,
        /// Override stale leases without asking
        #[arg(short, long)]
        yes: bool,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_target() {
        let cli = Cli::try_parse_from(["sharelock", "--db", "/share/main.db", "status"]).unwrap();
        assert_eq!(cli.target.db, Some(PathBuf::from("/share/main.db")));
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_file_target_and_run() {
        let cli = Cli::try_parse_from([
            "sharelock",
            "-vv",
            "--dir",
            "/share/kml",
            "--file",
            "plot_42.kml",
            "run",
            "--",
            "cp",
            "-r",
            "a",
            "b",
        ])
        .unwrap();
        assert_eq!(cli.verbosity, 2);
        assert_eq!(cli.target.file.as_deref(), Some("plot_42.kml"));
        match cli.command {
            Commands::Run { command, yes, .. } => {
                assert!(!yes);
                assert_eq!(command, vec!["cp", "-r", "a", "b"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_targets_are_exclusive() {
        assert!(Cli::try_parse_from(["sharelock", "status"]).is_err());
        assert!(Cli::try_parse_from(["sharelock", "--dir", "/share", "status"]).is_err());
        assert!(Cli::try_parse_from([
            "sharelock", "--db", "a.db", "--dir", "/x", "--file", "f", "status"
        ])
        .is_err());
    }
}
