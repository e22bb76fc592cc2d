//! Interactive serial port selection.
//!
//! Resolution order: `--port`/`BOOTLINK_PORT`, the configured port, then
//! discovery. A single bootloader-class device is picked automatically;
//! otherwise the user chooses, unless running non-interactively.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    bootlink::device::format_port_list,
    bootlink::{DetectedPort, discover_ports},
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Candidates shown to the user: bootloader devices if any, otherwise all.
fn candidates(ports: Vec<DetectedPort>) -> Vec<DetectedPort> {
    if ports.iter().any(DetectedPort::is_bootloader) {
        ports.into_iter().filter(DetectedPort::is_bootloader).collect()
    } else {
        ports
    }
}

/// Pick a port without prompting.
fn choose_non_interactive(mut ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    match ports.len() {
        0 => Err(usage_err("No serial ports available")),
        1 => Ok(ports.remove(0)),
        _ => Err(usage_err(
            "Multiple serial ports found; specify one with --port",
        )),
    }
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &mut Config) -> Result<DetectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name));
    }

    if let Some(port_name) = &config.port.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name));
    }

    let ports = discover_ports();
    if ports.is_empty() {
        return Err(usage_err("No serial ports found"));
    }

    let ports = candidates(ports);
    if options.non_interactive {
        return choose_non_interactive(ports);
    }

    if ports.len() == 1 && ports[0].is_bootloader() {
        let port = choose_non_interactive(ports)?;
        info!("Auto-selected port: {} [{}]", port.name, port.device.name());
        return Ok(port);
    }

    ensure_interactive_terminal()?;
    let port = select_port_interactive(ports)?;
    ask_remember_port(&port, config)?;
    Ok(port)
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs a terminal; pass --port or --non-interactive",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            CliError::Cancelled("Port selection cancelled".to_string()).into()
        },
        DialoguerError::IO(io_err) => usage_err(&format!("Prompt failed: {io_err}")),
    }
}

/// Look a port up by name, falling back to a bare entry.
fn find_port_by_name(name: &str) -> DetectedPort {
    discover_ports()
        .into_iter()
        .find(|p| p.name == name || p.name.eq_ignore_ascii_case(name))
        .unwrap_or_else(|| DetectedPort::plain(name))
}

fn select_port_interactive(mut ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    eprintln!(
        "{} Detected {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    ports.sort_by_key(|p| !p.device.is_known());
    let labels = format_port_list(&ports);

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) if index < ports.len() => Ok(ports.swap_remove(index)),
        Some(index) => Err(anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("Port selection cancelled".to_string()).into()),
    }
}

/// Offer to store the chosen port in the local config.
fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {} for this directory?", port.name))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_port(&port.name) {
            error!("Failed to save port configuration: {e}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bootlink::DeviceKind;

    fn usb(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort {
            device: DeviceKind::from_vid_pid(vid, pid),
            vid: Some(vid),
            pid: Some(pid),
            ..DetectedPort::plain(name)
        }
    }

    #[test]
    fn test_candidates_prefer_bootloader() {
        let ports = vec![
            usb("/dev/ttyUSB0", 0x1A86, 0x7523),
            usb("/dev/ttyACM0", 0x1209, 0x53C0),
        ];
        let picked = candidates(ports);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "/dev/ttyACM0");
    }

    #[test]
    fn test_candidates_keep_all_without_bootloader() {
        let ports = vec![
            usb("/dev/ttyUSB0", 0x1A86, 0x7523),
            DetectedPort::plain("/dev/ttyS0"),
        ];
        assert_eq!(candidates(ports).len(), 2);
    }

    #[test]
    fn test_non_interactive_single_port() {
        let port = choose_non_interactive(vec![DetectedPort::plain("/dev/ttyS0")]).unwrap();
        assert_eq!(port.name, "/dev/ttyS0");
    }

    #[test]
    fn test_non_interactive_ambiguous_is_usage_error() {
        let ports = vec![DetectedPort::plain("/dev/ttyS0"), DetectedPort::plain("/dev/ttyS1")];
        let err = choose_non_interactive(ports).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));

        let err = choose_non_interactive(Vec::new()).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }

    #[test]
    fn test_explicit_port_wins() {
        let options = SerialOptions {
            port: Some("/dev/does-not-exist".to_string()),
            non_interactive: true,
        };
        let mut config = Config::default();
        config.port.serial = Some("/dev/from-config".to_string());
        let port = select_serial_port(&options, &mut config).unwrap();
        assert_eq!(port.name, "/dev/does-not-exist");
    }

    #[test]
    fn test_configured_port_used() {
        let options = SerialOptions {
            port: None,
            non_interactive: true,
        };
        let mut config = Config::default();
        config.port.serial = Some("/dev/from-config".to_string());
        let port = select_serial_port(&options, &mut config).unwrap();
        assert_eq!(port.name, "/dev/from-config");
    }
}
