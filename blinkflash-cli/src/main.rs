//! blinkflash CLI - Command-line tool for sending mruby bytecode to OpenBlink devices.
//!
//! ## Features
//!
//! - Scan for OpenBlink devices
//! - Send precompiled `.mrb` bytecode to a program slot
//! - Compile `.rb` sources with `mrbc` and send them in one step
//! - Reset / reload control frames
//! - Live device console with automatic reconnection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod compiler;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// CLI-level failures that map to dedicated exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid usage or environment (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Invalid configuration (exit 3).
    #[error("{0}")]
    Config(String),
    /// Interrupted by the user (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

/// Map an error to the process exit code.
///
/// - 1: unexpected error
/// - 2: usage error
/// - 3: configuration error
/// - 4: device not found
/// - 130: cancelled
fn exit_code_for_error(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<blinkflash::Error>() {
        Some(blinkflash::Error::DeviceNotFound) => 4,
        Some(blinkflash::Error::DiscoveryCancelled | blinkflash::Error::Cancelled) => 130,
        Some(blinkflash::Error::InvalidSlot(_) | blinkflash::Error::ImageTooLarge(_)) => 2,
        Some(blinkflash::Error::Config(_) | blinkflash::Error::MtuTooSmall(_)) => 3,
        _ => 1,
    }
}

/// blinkflash - Send mruby bytecode to OpenBlink devices over Bluetooth LE.
///
/// Environment variables:
///   BLINKFLASH_DEVICE            - Device name to connect to
///   BLINKFLASH_SLOT              - Default program slot (1 or 2)
///   BLINKFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "blinkflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "For more information, visit: https://github.com/OpenBlink/blinkflash")]
pub(crate) struct Cli {
    /// Device name to connect to (prompted if several are found).
    #[arg(short, long, global = true, env = "BLINKFLASH_DEVICE")]
    device: Option<String>,

    /// Use the built-in simulated device instead of Bluetooth.
    #[arg(long, global = true)]
    sim: bool,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "BLINKFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List OpenBlink devices in range.
    Scan {
        /// Output device list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Send precompiled mruby bytecode (.mrb).
    Send {
        /// Path to the bytecode file.
        file: PathBuf,

        /// Program slot (1 or 2).
        #[arg(short, long, env = "BLINKFLASH_SLOT")]
        slot: Option<u8>,

        /// Keep streaming the device console after sending.
        #[arg(long)]
        console: bool,
    },

    /// Compile a Ruby source with mrbc and send it.
    Run {
        /// Path to the Ruby source.
        file: PathBuf,

        /// Program slot (1 or 2).
        #[arg(short, long, env = "BLINKFLASH_SLOT")]
        slot: Option<u8>,

        /// Path to the mrbc executable.
        #[arg(long, value_name = "PATH")]
        mrbc: Option<PathBuf>,

        /// Keep streaming the device console after sending.
        #[arg(long)]
        console: bool,
    },

    /// Reset the device.
    Reset,

    /// Reload the program stored on the device.
    Reload,

    /// Stream the device console until Ctrl+C.
    Console {
        /// Prefix each line with a timestamp.
        #[arg(long)]
        timestamp: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (auto-detected from $SHELL if not specified).
        #[arg(value_enum)]
        shell: Option<Shell>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
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

    debug!(
        "blinkflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!(
                "{} {}",
                console::style("Error:").red().bold(),
                error_message(&err)
            );
            ExitCode::from(exit_code_for_error(&err))
        },
    }
}

/// One line for the user: the friendly library message when there is one,
/// otherwise the full context chain.
fn error_message(err: &anyhow::Error) -> String {
    match err.downcast_ref::<blinkflash::Error>() {
        Some(lib) if err.chain().count() == 1 => lib
            .status_line()
            .trim_start_matches("Error: ")
            .to_string(),
        _ => format!("{err:#}"),
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Completions need neither config nor a runtime.
    if let Commands::Completions { shell } = &cli.command {
        return commands::completions::cmd_completions(*shell);
    }

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let ctx = commands::Context::new(cli, config).await?;

        let result = match &cli.command {
            Commands::Scan { json } => commands::scan::cmd_scan(&ctx, *json).await,
            Commands::Send {
                file,
                slot,
                console,
            } => commands::send::cmd_send(&ctx, file, *slot, *console).await,
            Commands::Run {
                file,
                slot,
                mrbc,
                console,
            } => commands::send::cmd_run(&ctx, file, *slot, mrbc.as_deref(), *console).await,
            Commands::Reset => commands::control::cmd_reset(&ctx).await,
            Commands::Reload => commands::control::cmd_reload(&ctx).await,
            Commands::Console { timestamp } => {
                commands::console::cmd_console(&ctx, *timestamp).await
            },
            Commands::Completions { .. } => Ok(()),
        };

        ctx.close().await;
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_send() {
        let cli = Cli::try_parse_from(["blinkflash", "send", "app.mrb", "--slot", "1"]).unwrap();
        match cli.command {
            Commands::Send {
                file,
                slot,
                console,
            } => {
                assert_eq!(file, PathBuf::from("app.mrb"));
                assert_eq!(slot, Some(1));
                assert!(!console);
            },
            _ => panic!("Expected Send command"),
        }
    }

    #[test]
    fn test_cli_parse_run_with_mrbc() {
        let cli = Cli::try_parse_from([
            "blinkflash",
            "run",
            "app.rb",
            "--mrbc",
            "/opt/mruby/bin/mrbc",
            "--console",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { mrbc, console, .. } => {
                assert_eq!(mrbc, Some(PathBuf::from("/opt/mruby/bin/mrbc")));
                assert!(console);
            },
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from([
            "blinkflash",
            "--sim",
            "-vv",
            "--device",
            "OpenBlink-A1",
            "--non-interactive",
            "scan",
            "--json",
        ])
        .unwrap();
        assert!(cli.sim);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.device.as_deref(), Some("OpenBlink-A1"));
        assert!(cli.non_interactive);
        assert!(matches!(cli.command, Commands::Scan { json: true }));
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["blinkflash"]).is_err());
    }

    #[test]
    fn test_cli_send_requires_file() {
        assert!(Cli::try_parse_from(["blinkflash", "send"]).is_err());
    }

    #[test]
    fn test_exit_code_mapping() {
        let usage: anyhow::Error = CliError::Usage("bad".into()).into();
        let config: anyhow::Error = CliError::Config("bad".into()).into();
        let cancelled: anyhow::Error = CliError::Cancelled("stop".into()).into();
        let not_found: anyhow::Error = blinkflash::Error::DeviceNotFound.into();
        let slot: anyhow::Error = blinkflash::Error::InvalidSlot(3).into();
        let other = anyhow::anyhow!("boom");

        assert_eq!(exit_code_for_error(&usage), 2);
        assert_eq!(exit_code_for_error(&config), 3);
        assert_eq!(exit_code_for_error(&cancelled), 130);
        assert_eq!(exit_code_for_error(&not_found), 4);
        assert_eq!(exit_code_for_error(&slot), 2);
        assert_eq!(exit_code_for_error(&other), 1);
    }

    #[test]
    fn test_error_message_prefers_friendly_line() {
        let err: anyhow::Error = blinkflash::Error::NotConnected.into();
        assert_eq!(
            error_message(&err),
            "Device not connected. Please connect to a device first."
        );

        let err = anyhow::Error::from(blinkflash::Error::InvalidSlot(5)).context("send failed");
        assert!(error_message(&err).starts_with("send failed: "));
    }
}
