//! Device query commands: features, ping and port listing.

use anyhow::Result;
use bootlink::protocol::message::Features;
use bootlink::{PingProtection, discover_ports};
use console::style;

use super::connect;
use crate::Cli;
use crate::config::Config;

fn flag(value: Option<bool>) -> &'static str {
    match value {
        Some(true) => "yes",
        Some(false) => "no",
        None => "-",
    }
}

/// Human-readable feature lines.
fn feature_lines(features: &Features) -> Vec<(&'static str, String)> {
    let version = match (
        features.major_version,
        features.minor_version,
        features.patch_version,
    ) {
        (Some(major), Some(minor), Some(patch)) => format!("{major}.{minor}.{patch}"),
        _ => "-".to_string(),
    };
    let text = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());

    vec![
        ("Vendor", text(features.vendor.as_ref().map(ToString::to_string))),
        ("Version", version),
        ("Bootloader mode", flag(features.bootloader_mode).to_string()),
        ("Firmware present", flag(features.firmware_present).to_string()),
        ("Device ID", text(features.device_id.as_ref().map(ToString::to_string))),
        ("Label", text(features.label.as_ref().map(ToString::to_string))),
        ("Language", text(features.language.as_ref().map(ToString::to_string))),
        ("Initialized", flag(features.initialized).to_string()),
        ("PIN protection", flag(features.pin_protection).to_string()),
        ("Passphrase protection", flag(features.passphrase_protection).to_string()),
        ("Revision", text(features.revision.as_ref().map(|r| r.to_hex()))),
        (
            "Bootloader hash",
            text(features.bootloader_hash.as_ref().map(|h| h.to_hex())),
        ),
    ]
}

/// Features command implementation.
pub(crate) fn cmd_features(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let mut client = connect(cli, config)?;
    let features = client.get_features()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&features)?);
        return Ok(());
    }

    eprintln!("{}", style("Device features").bold().underlined());
    for (name, value) in feature_lines(&features) {
        println!("  {:<22} {value}", format!("{name}:"));
    }
    Ok(())
}

/// Ping command implementation.
pub(crate) fn cmd_ping(
    cli: &Cli,
    config: &mut Config,
    message: &str,
    protection: PingProtection,
) -> Result<()> {
    let mut client = connect(cli, config)?;
    if (protection.button || protection.pin || protection.passphrase) && !cli.quiet {
        eprintln!(
            "{} Waiting for confirmation on the device...",
            style("⏳").yellow()
        );
    }
    let echoed = client.ping(message, protection)?;
    println!("{}", echoed.unwrap_or_default());
    Ok(())
}

/// List-ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) {
    let detected = discover_ports();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&detected).unwrap_or_else(|_| "[]".to_string())
        );
        return;
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());
    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return;
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_ref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            device_type,
            vid_pid,
            product
        );
    }

    if let Some(best) = bootlink::device::select_port(&detected) {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&best.name).cyan().bold()
        );
    }
}
