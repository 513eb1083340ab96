//! boardlink CLI - Command-line tool for MicroPython boards.
//!
//! ## Features
//!
//! - Find boards by probing serial ports for a raw REPL
//! - Run scripts with live console output and keyboard input
//! - Interactive REPL passthrough
//! - List, download, upload, remove and rename files
//! - Hash-verified backup to and restore from ZIP archives
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use boardlink::CancelToken;

mod commands;
mod config;
mod session;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Number of Ctrl-C presses seen.
static INTERRUPTS: AtomicU32 = AtomicU32::new(0);

/// Cancel token of the active board, driven by Ctrl-C.
static CANCEL: OnceLock<Arc<CancelToken>> = OnceLock::new();

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTS.load(Ordering::Relaxed) > 0
}

/// Route Ctrl-C to `token`: the first press stops, later presses abort.
pub(crate) fn watch_cancel(token: Arc<CancelToken>) {
    if CANCEL.set(token).is_err() {
        debug!("Cancel token already installed");
    }
}

fn install_interrupt_handler() {
    let result = ctrlc::set_handler(|| {
        let presses = INTERRUPTS.fetch_add(1, Ordering::Relaxed) + 1;
        match (CANCEL.get(), presses) {
            (Some(token), 1) => token.request_stop(),
            (Some(token), _) => token.request_abort(),
            (None, 1) => {},
            (None, _) => std::process::exit(130),
        }
    });
    if let Err(e) = result {
        debug!("Could not install Ctrl-C handler: {e}");
    }
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or an impossible request.
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<boardlink::Error>() {
        Some(boardlink::Error::Aborted) => 130,
        _ => 1,
    }
}

/// boardlink - Control MicroPython boards over a serial line.
///
/// Environment variables:
///   BOARDLINK_PORT              - Serial port (probing is skipped)
///   BOARDLINK_BAUD              - Baud rate for USB-UART bridges (default: 115200)
///   BOARDLINK_SOFT_RESET        - Soft-reset the board after entering the raw REPL
///   BOARDLINK_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "boardlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (all ports are probed if not specified).
    #[arg(short, long, global = true, env = "BOARDLINK_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate for USB-UART bridges.
    #[arg(short, long, global = true, env = "BOARDLINK_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Soft-reset the board after entering the raw REPL.
    #[arg(long, global = true, env = "BOARDLINK_SOFT_RESET")]
    pub(crate) soft_reset: bool,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "BOARDLINK_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Probe serial ports and print the one a board answers on.
    Scan,

    /// Show board identification (os.uname).
    Info {
        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List files on the board.
    Ls {
        /// Directory to list.
        #[arg(default_value = "/")]
        path: String,

        /// Output the listing as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Download a file from the board.
    Get {
        /// File on the board.
        remote: String,

        /// Local destination (default: the file name, in the current directory).
        local: Option<PathBuf>,
    },

    /// Upload a file to the board.
    Put {
        /// Local file.
        local: PathBuf,

        /// Destination on the board (default: the file name, in `/`).
        remote: Option<String>,
    },

    /// Remove a file or an empty directory on the board.
    Rm {
        /// Path on the board.
        path: String,
    },

    /// Create a directory on the board.
    Mkdir {
        /// Path on the board.
        path: String,
    },

    /// Rename a file or directory on the board.
    Mv {
        /// Current path.
        from: String,

        /// New path.
        to: String,
    },

    /// Print the SHA-1 of every file on the board.
    Hash {
        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Run a script, forwarding console output and input until it ends.
    Run {
        /// Script to run.
        file: PathBuf,
    },

    /// Open the board's interactive REPL (Ctrl-X exits).
    Repl,

    /// Back up the board's files into a ZIP archive.
    Backup {
        /// Archive path; an existing archive is updated incrementally.
        archive: PathBuf,
    },

    /// Restore a ZIP archive onto the board.
    Restore {
        /// Archive path.
        archive: PathBuf,

        /// Delete board files that are not in the archive.
        #[arg(long)]
        delete_extra: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
        Commands::Scan => commands::ports::cmd_scan(cli, &mut config),
        Commands::Info { json } => commands::fs::cmd_info(cli, &mut config, *json),
        Commands::Ls { path, json } => commands::fs::cmd_ls(cli, &mut config, path, *json),
        Commands::Get { remote, local } => {
            commands::fs::cmd_get(cli, &mut config, remote, local.as_deref())
        },
        Commands::Put { local, remote } => {
            commands::fs::cmd_put(cli, &mut config, local, remote.as_deref())
        },
        Commands::Rm { path } => commands::fs::cmd_rm(cli, &mut config, path),
        Commands::Mkdir { path } => commands::fs::cmd_mkdir(cli, &mut config, path),
        Commands::Mv { from, to } => commands::fs::cmd_mv(cli, &mut config, from, to),
        Commands::Hash { json } => commands::fs::cmd_hash(cli, &mut config, *json),
        Commands::Run { file } => commands::run::cmd_run(cli, &mut config, file),
        Commands::Repl => commands::run::cmd_repl(cli, &mut config),
        Commands::Backup { archive } => commands::sync::cmd_backup(cli, &mut config, archive),
        Commands::Restore {
            archive,
            delete_extra,
        } => commands::sync::cmd_restore(cli, &mut config, archive, *delete_extra),
    }
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    install_interrupt_handler();

    debug!(
        "boardlink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code_for(&err));
    }
}
