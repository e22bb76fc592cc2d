//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod device;
pub(crate) mod flash;
pub(crate) mod image;
pub(crate) mod serve;

use anyhow::{Context, Result};
use bootlink::{Client, NativePort, SerialConfig};
use console::style;

use crate::config::Config;
use crate::{Cli, ensure_not_interrupted, get_baud, get_port, get_timeout};

/// Open the serial port and start a session with the device.
pub(crate) fn connect(cli: &Cli, config: &mut Config) -> Result<Client<NativePort>> {
    let port = get_port(cli, config)?;
    let baud = get_baud(cli, config);
    if !cli.quiet {
        eprintln!("{} Using port {} at {} baud", style("🔌").cyan(), port, baud);
    }

    let native = NativePort::open(&SerialConfig::new(&port, baud))
        .with_context(|| format!("Failed to open {port}"))?;
    let mut client = Client::new(native)?;
    if let Some(timeout) = get_timeout(cli) {
        client = client.with_timeout(timeout);
    }
    ensure_not_interrupted()?;

    client.initialize()?;
    if !cli.quiet {
        eprintln!("{} Connected", style("✓").green());
    }
    Ok(client)
}
