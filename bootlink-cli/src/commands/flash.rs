//! Flash, erase and read command implementations.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;

use super::connect;
use crate::config::Config;
use crate::{Cli, CliError, ensure_not_interrupted, use_fancy_output};

fn progress_bar(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Progress callback driving `pb`, relabelled when the stage changes.
fn track(pb: &ProgressBar) -> impl FnMut(&str, usize, usize) + '_ {
    let mut current_stage = String::new();
    move |stage: &str, current: usize, total: usize| {
        if stage != current_stage {
            current_stage = stage.to_string();
            let label = match stage {
                "upload" => "Uploading",
                "read" => "Verifying",
                other => other,
            };
            pb.set_message(label.to_string());
        }
        if total > 0 {
            pb.set_position((current * 100 / total) as u64);
        }
    }
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &mut Config, firmware: &Path, verify: bool) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware: {}",
            style("📦").cyan(),
            firmware.display()
        );
    }
    let data = std::fs::read(firmware)
        .with_context(|| format!("Failed to read firmware {}", firmware.display()))?;
    if data.is_empty() {
        return Err(CliError::Usage(format!("{} is empty", firmware.display())).into());
    }
    if !cli.quiet {
        eprintln!(
            "{} {} bytes, sha256 {}",
            style("ℹ").blue(),
            data.len(),
            bootlink::firmware_digest(&data).to_hex()
        );
    }

    let mut client = connect(cli, config)?;

    let pb = progress_bar(cli);
    client.flash_firmware(&data, verify, track(&pb))?;
    ensure_not_interrupted()?;
    pb.finish_with_message("Complete");

    if !cli.quiet {
        eprintln!("\n{} Flashing completed", style("🎉").green().bold());
    }
    Ok(())
}

/// Erase command implementation.
pub(crate) fn cmd_erase(
    cli: &Cli,
    config: &mut Config,
    length: Option<u32>,
    all: bool,
) -> Result<()> {
    if length.is_none() && !all {
        if !cli.quiet {
            eprintln!(
                "{} Use --all to erase the whole firmware area",
                style("⚠").yellow()
            );
        }
        return Err(CliError::Usage("Pass --length or --all".to_string()).into());
    }

    let mut client = connect(cli, config)?;
    if !cli.quiet {
        eprintln!("{} Erasing...", style("🗑").red());
    }
    client.erase(length)?;
    ensure_not_interrupted()?;

    if !cli.quiet {
        eprintln!("\n{} Erase completed", style("✓").green().bold());
    }
    Ok(())
}

/// Read command implementation.
pub(crate) fn cmd_read(cli: &Cli, config: &mut Config, output: &Path, length: u32) -> Result<()> {
    if length == 0 {
        return Err(CliError::Usage("--length must be greater than zero".to_string()).into());
    }

    let mut client = connect(cli, config)?;
    let pb = progress_bar(cli);
    let image = client.read_image(length, track(&pb))?;
    ensure_not_interrupted()?;
    pb.finish_with_message("Complete");

    std::fs::write(output, &image)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} Read {} bytes into {}",
            style("✓").green(),
            image.len(),
            output.display()
        );
    }
    Ok(())
}
