//! Serve command: act as a device in bootloader mode.

use anyhow::{Context, Result};
use bootlink::protocol::message::ButtonRequestType;
use bootlink::{
    AutoConfirm, Decision, Engine, Error, FileFlash, FlashDriver, MemoryFlash, NativePort, Prompt,
    SerialConfig, Server, SessionRegistry, UserInterface,
};
use console::style;
use dialoguer::{Confirm, Password, theme::ColorfulTheme};
use log::warn;
use std::path::PathBuf;

use crate::config::Config;
use crate::{Cli, CliError, get_baud, get_port};

/// Firmware area size when neither flag nor config sets one.
const DEFAULT_CAPACITY: u32 = 1024 * 1024;

/// Options of the serve command.
#[derive(Debug, Clone, Default)]
pub(crate) struct ServeOptions {
    pub(crate) image: Option<PathBuf>,
    pub(crate) capacity: Option<u32>,
    pub(crate) interactive: bool,
    pub(crate) confirm_erase: bool,
}

/// Confirmation prompts answered on the terminal.
struct TerminalUi;

impl UserInterface for TerminalUi {
    fn show(&mut self, prompt: &Prompt) {
        eprintln!("{} {}", style("⏳").yellow(), prompt.text);
    }

    fn decide(&mut self, prompt: &Prompt) -> Decision {
        let theme = ColorfulTheme::default();
        let answer = match prompt.kind {
            ButtonRequestType::PinEntry => Password::with_theme(&theme)
                .with_prompt("PIN")
                .interact()
                .map(|pin| !pin.is_empty()),
            ButtonRequestType::PassphraseEntry => Password::with_theme(&theme)
                .with_prompt("Passphrase")
                .allow_empty_password(true)
                .interact()
                .map(|_| true),
            _ => Confirm::with_theme(&theme)
                .with_prompt(prompt.text.as_str())
                .default(false)
                .interact(),
        };

        match answer {
            Ok(true) => Decision::Confirm,
            Ok(false) => Decision::Decline,
            Err(e) => {
                warn!("Prompt failed, declining: {e}");
                Decision::Decline
            },
        }
    }
}

fn open_flash(image: Option<&PathBuf>, capacity: u32) -> Result<Box<dyn FlashDriver>> {
    match image {
        Some(path) => {
            let flash = FileFlash::open_or_create(path, capacity)
                .with_context(|| format!("Failed to open flash image {}", path.display()))?;
            Ok(Box::new(flash))
        },
        None => Ok(Box::new(MemoryFlash::new(capacity))),
    }
}

/// Serve command implementation.
pub(crate) fn cmd_serve(cli: &Cli, config: &mut Config, options: &ServeOptions) -> Result<()> {
    if options.interactive && cli.non_interactive {
        return Err(
            CliError::Usage("--interactive conflicts with --non-interactive".to_string()).into(),
        );
    }

    let capacity = options
        .capacity
        .or(config.flash.capacity)
        .unwrap_or(DEFAULT_CAPACITY);
    let image = options.image.as_ref().or(config.flash.image.as_ref()).cloned();
    let flash = open_flash(image.as_ref(), capacity)?;

    let mut engine_config = config.engine_config();
    if options.confirm_erase {
        engine_config = engine_config.with_confirm_erase(true);
    }

    let ui: Box<dyn UserInterface> = if options.interactive {
        Box::new(TerminalUi)
    } else {
        Box::new(AutoConfirm)
    };

    let port = get_port(cli, config)?;
    let baud = get_baud(cli, config);
    let native = NativePort::open(&SerialConfig::new(&port, baud))
        .with_context(|| format!("Failed to open {port}"))?;

    let registry = SessionRegistry::new();
    let engine = Engine::new(flash, ui, &registry)
        .with_config(engine_config)
        .with_device_info(config.device_info());

    if !cli.quiet {
        let backing = image.map_or_else(|| "memory".to_string(), |p| p.display().to_string());
        eprintln!(
            "{} Serving on {} at {} baud ({} bytes, {})",
            style("🔌").cyan(),
            port,
            baud,
            capacity,
            backing
        );
        eprintln!("{}", style("Press Ctrl-C to stop").dim());
    }

    let mut server = Server::new(native, engine)?;
    let result = server.run();
    let summary = server.summary();

    if !cli.quiet {
        eprintln!(
            "\n{} Handled {} requests, firmware {}",
            style("ℹ").blue(),
            summary.requests_handled,
            if summary.firmware_present {
                style("present").green()
            } else {
                style("absent").yellow()
            }
        );
    }

    match result {
        Ok(_) => Ok(()),
        Err(Error::Interrupted) => Err(CliError::Cancelled("Stopped".to_string()).into()),
        Err(e) => Err(e.into()),
    }
}
