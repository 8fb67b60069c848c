//! `afdd` command-line surface: run the daemon in the foreground, or send a
//! control command to an already-running instance over its command fifo
//! (§4.I/§6). Subcommands other than `run` never touch the state areas
//! directly — they all go through `supervisor::send_command`.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "afdd", author, version, about = "Automatic file distribution daemon", long_about = None)]
pub struct Cli {
    /// Enable debug-level logging (only meaningful for `run`).
    #[arg(long, global = true)]
    pub debug: bool,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the daemon in the foreground (default when no subcommand is given).
    Run,
    /// Ask a running daemon to shut down.
    Stop,
    /// Re-parse DIR_CONFIG and publish a new FSA/FRA generation.
    Reload,
    /// Swap a host between its primary and toggle hostname.
    ToggleHost { alias: String },
    /// Pause admission of new jobs.
    Pause,
    /// Resume admission of new jobs.
    Resume,
    /// Force an immediate archive sweep.
    Archive,
}

impl Commands {
    /// The line this subcommand sends over the command fifo; `None` for
    /// `Run`, which never goes through the client path.
    pub fn as_fifo_line(&self) -> Option<String> {
        match self {
            Commands::Run => None,
            Commands::Stop => Some("stop".to_string()),
            Commands::Reload => Some("reload".to_string()),
            Commands::ToggleHost { alias } => Some(format!("toggle-host {alias}")),
            Commands::Pause => Some("pause".to_string()),
            Commands::Resume => Some("resume".to_string()),
            Commands::Archive => Some("archive".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_host_formats_alias_into_the_fifo_line() {
        let cmd = Commands::ToggleHost { alias: "h1".to_string() };
        assert_eq!(cmd.as_fifo_line(), Some("toggle-host h1".to_string()));
    }

    #[test]
    fn run_has_no_fifo_line() {
        assert_eq!(Commands::Run.as_fifo_line(), None);
    }
}
