//! Offline firmware image inspection.

use anyhow::{Context, Result};
use console::style;
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::CliError;

/// Size and digest of an image file.
#[derive(Debug, Serialize, PartialEq, Eq)]
struct ImageInfo {
    path: String,
    size: u64,
    sha256: String,
    /// Fits the 32-bit length field of an erase request.
    flashable: bool,
}

fn inspect(path: &Path) -> Result<ImageInfo> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok(ImageInfo {
        path: path.display().to_string(),
        size,
        sha256: hex::encode(hasher.finalize()),
        flashable: size > 0 && u32::try_from(size).is_ok(),
    })
}

/// Image-info command implementation.
pub(crate) fn cmd_image_info(firmware: &Path, json: bool) -> Result<()> {
    if !firmware.is_file() {
        return Err(CliError::Usage(format!("{} is not a file", firmware.display())).into());
    }
    let info = inspect(firmware)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    eprintln!("{}", style("Firmware image").bold().underlined());
    println!("  Path:    {}", info.path);
    println!("  Size:    {} bytes", info.size);
    println!("  SHA-256: {}", info.sha256);
    if !info.flashable {
        eprintln!("{} Image cannot be flashed (empty or too large)", style("⚠").yellow());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inspect_matches_firmware_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let info = inspect(&path).unwrap();
        assert_eq!(info.size, 200_000);
        assert_eq!(info.sha256, bootlink::firmware_digest(&data).to_hex());
        assert!(info.flashable);
    }

    #[test]
    fn test_inspect_empty_is_not_flashable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let info = inspect(&path).unwrap();
        assert_eq!(info.size, 0);
        assert_eq!(
            info.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(!info.flashable);
    }
}
