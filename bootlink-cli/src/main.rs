//! bootlink CLI - serve and drive the bootloader protocol over a serial link.
//!
//! ## Features
//!
//! - Emulate a device in bootloader mode backed by a flash image file
//! - Query features, ping, erase, flash and read back a connected device
//! - Inspect firmware images offline
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Fail with [`CliError::Cancelled`] once Ctrl-C was pressed.
pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or environment (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Cancelled by the user (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// bootlink - serve and drive the bootloader protocol.
///
/// Environment variables:
///   BOOTLINK_PORT              - Default serial port
///   BOOTLINK_BAUD              - Default baud rate (default: 115200)
///   BOOTLINK_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "bootlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "BOOTLINK_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, env = "BOOTLINK_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "BOOTLINK_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Response timeout in seconds.
    #[arg(long, global = true, value_name = "SECS")]
    pub(crate) timeout: Option<u64>,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Act as a device in bootloader mode on the serial port.
    Serve {
        /// Flash image file (created erased if missing).
        #[arg(long)]
        image: Option<PathBuf>,

        /// Firmware area size in bytes (e.g. 1048576 or 0x100000).
        #[arg(long, value_parser = parse_size)]
        capacity: Option<u32>,

        /// Ask on the terminal instead of confirming automatically.
        #[arg(long)]
        interactive: bool,

        /// Require confirmation before erasing.
        #[arg(long)]
        confirm_erase: bool,
    },

    /// Show the features reported by the device.
    Features {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Send a ping and print the echoed message.
    Ping {
        /// Message to echo.
        #[arg(default_value = "")]
        message: String,

        /// Ask for button confirmation.
        #[arg(long)]
        button: bool,

        /// Ask for PIN entry.
        #[arg(long)]
        pin: bool,

        /// Ask for passphrase entry.
        #[arg(long)]
        passphrase: bool,
    },

    /// Erase the firmware area.
    Erase {
        /// Bytes to erase.
        #[arg(long, value_parser = parse_size, conflicts_with = "all")]
        length: Option<u32>,

        /// Erase the whole firmware area.
        #[arg(long)]
        all: bool,
    },

    /// Erase, upload and verify a firmware image.
    Flash {
        /// Firmware image file.
        firmware: PathBuf,

        /// Skip read-back verification.
        #[arg(long)]
        skip_verify: bool,
    },

    /// Read the firmware area back into a file.
    Read {
        /// Output file.
        output: PathBuf,

        /// Bytes to read.
        #[arg(short, long, value_parser = parse_size)]
        length: u32,
    },

    /// Show size and digest of a firmware image.
    ImageInfo {
        /// Firmware image file.
        firmware: PathBuf,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install completions for the current shell.
        #[arg(long)]
        install: bool,
    },
}

/// Parse a size or offset, decimal or `0x` hexadecimal.
fn parse_size(s: &str) -> Result<u32, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse::<u32>()
    };
    parsed.map_err(|e| format!("Invalid size '{s}': {e}"))
}

/// Resolve the serial port to use.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };
    let selected = select_serial_port(&options, config)?;
    Ok(selected.name)
}

/// Baud rate from the command line, config file or default.
pub(crate) fn get_baud(cli: &Cli, config: &Config) -> u32 {
    cli.baud
        .or(config.port.baud)
        .unwrap_or(bootlink::port::DEFAULT_BAUD)
}

/// Response timeout override.
pub(crate) fn get_timeout(cli: &Cli) -> Option<Duration> {
    cli.timeout.map(Duration::from_secs)
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<bootlink::Error>() {
        Some(bootlink::Error::Interrupted) => 130,
        _ => 1,
    }
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
        "bootlink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    bootlink::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code(&err);
            if code == 130 {
                eprintln!("{} {err}", style("✗").yellow());
            } else {
                eprintln!("{} {err:#}", style("Error:").red().bold());
            }
            ExitCode::from(code)
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Serve {
            image,
            capacity,
            interactive,
            confirm_erase,
        } => commands::serve::cmd_serve(
            cli,
            &mut config,
            &commands::serve::ServeOptions {
                image: image.clone(),
                capacity: *capacity,
                interactive: *interactive,
                confirm_erase: *confirm_erase,
            },
        ),
        Commands::Features { json } => commands::device::cmd_features(cli, &mut config, *json),
        Commands::Ping {
            message,
            button,
            pin,
            passphrase,
        } => commands::device::cmd_ping(
            cli,
            &mut config,
            message,
            bootlink::PingProtection {
                button: *button,
                pin: *pin,
                passphrase: *passphrase,
            },
        ),
        Commands::Erase { length, all } => {
            commands::flash::cmd_erase(cli, &mut config, *length, *all)
        },
        Commands::Flash {
            firmware,
            skip_verify,
        } => commands::flash::cmd_flash(cli, &mut config, firmware, !*skip_verify),
        Commands::Read { output, length } => {
            commands::flash::cmd_read(cli, &mut config, output, *length)
        },
        Commands::ImageInfo { firmware, json } => commands::image::cmd_image_info(firmware, *json),
        Commands::ListPorts { json } => {
            commands::device::cmd_list_ports(*json);
            Ok(())
        },
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else if let Some(shell) = shell {
                commands::completions::cmd_completions(*shell);
                Ok(())
            } else {
                Err(CliError::Usage(
                    "Specify a shell type, e.g.: bootlink completions bash \
                     (or use --install to auto-install)"
                        .to_string(),
                )
                .into())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("0x1000"), Ok(4096));
        assert_eq!(parse_size("0X10"), Ok(16));
        assert!(parse_size("0xZZ").is_err());
        assert!(parse_size("-1").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&CliError::Usage("x".into()).into()), 2);
        assert_eq!(exit_code(&CliError::Cancelled("x".into()).into()), 130);
        assert_eq!(exit_code(&bootlink::Error::Interrupted.into()), 130);
        assert_eq!(exit_code(&bootlink::Error::Disconnected.into()), 1);
        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }

    #[test]
    fn test_parse_flash_args() {
        let cli = Cli::try_parse_from([
            "bootlink",
            "--port",
            "/dev/ttyACM0",
            "flash",
            "fw.bin",
            "--skip-verify",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
        match cli.command {
            Commands::Flash {
                firmware,
                skip_verify,
            } => {
                assert_eq!(firmware, PathBuf::from("fw.bin"));
                assert!(skip_verify);
            },
            _ => panic!("expected flash"),
        }
    }

    #[test]
    fn test_parse_serve_capacity_hex() {
        let cli = Cli::try_parse_from(["bootlink", "serve", "--capacity", "0x10000"]).unwrap();
        match cli.command {
            Commands::Serve { capacity, .. } => assert_eq!(capacity, Some(0x10000)),
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_get_baud_priority() {
        let mut config = Config::default();
        let cli = Cli::try_parse_from(["bootlink", "list-ports"]).unwrap();
        assert_eq!(get_baud(&cli, &config), bootlink::port::DEFAULT_BAUD);

        config.port.baud = Some(9600);
        assert_eq!(get_baud(&cli, &config), 9600);

        let cli = Cli::try_parse_from(["bootlink", "-b", "57600", "list-ports"]).unwrap();
        assert_eq!(get_baud(&cli, &config), 57600);
    }
}
