//! Engine and device configuration.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::protocol::bounded::{BoundedBytes, BoundedString};
use crate::protocol::message::{
    DEVICE_ID_MAX, Digest, Features, LANGUAGE_MAX, REVISION_MAX, VENDOR_MAX,
};

/// Default time to wait for a ButtonAck after a ButtonRequest.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);
/// Default inactivity limit inside a streamed frame.
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(5);
/// Default largest read-back answered by a single FirmwareRequest.
pub const DEFAULT_MAX_READBACK: u32 = 16 * 1024;

/// Protocol engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    /// Bounded wait for ButtonAck.
    #[cfg_attr(feature = "serde", serde(with = "duration_ms", rename = "confirm_timeout_ms"))]
    pub confirm_timeout: Duration,
    /// Inactivity limit while a streamed frame is arriving.
    #[cfg_attr(feature = "serde", serde(with = "duration_ms", rename = "frame_timeout_ms"))]
    pub frame_timeout: Duration,
    /// Largest region returned by one FirmwareRequest.
    pub max_readback: u32,
    /// Ask for a FirmwareCheck confirmation before erasing.
    pub confirm_erase: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            max_readback: DEFAULT_MAX_READBACK,
            confirm_erase: false,
        }
    }
}

impl EngineConfig {
    /// Set the ButtonAck wait.
    #[must_use]
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Set the streamed frame inactivity limit.
    #[must_use]
    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    /// Set the read-back limit.
    #[must_use]
    pub fn with_max_readback(mut self, max: u32) -> Self {
        self.max_readback = max;
        self
    }

    /// Require confirmation before erasing.
    #[must_use]
    pub fn with_confirm_erase(mut self, enabled: bool) -> Self {
        self.confirm_erase = enabled;
        self
    }
}

/// Static identity reported in Features.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DeviceInfo {
    /// Vendor name.
    pub vendor: BoundedString<VENDOR_MAX>,
    /// Bootloader version `(major, minor, patch)`.
    pub version: (u32, u32, u32),
    /// Device id.
    pub device_id: Option<BoundedString<DEVICE_ID_MAX>>,
    /// UI language.
    pub language: Option<BoundedString<LANGUAGE_MAX>>,
    /// Device label.
    pub label: Option<BoundedString<VENDOR_MAX>>,
    /// Source revision.
    pub revision: Option<BoundedBytes<REVISION_MAX>>,
    /// Bootloader digest.
    pub bootloader_hash: Option<Digest>,
    /// Device has been set up.
    pub initialized: bool,
    /// PIN protection enabled.
    pub pin_protection: bool,
    /// Passphrase protection enabled.
    pub passphrase_protection: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            vendor: BoundedString::try_from("bootlink").unwrap_or_default(),
            version: (
                parse_version(env!("CARGO_PKG_VERSION_MAJOR")),
                parse_version(env!("CARGO_PKG_VERSION_MINOR")),
                parse_version(env!("CARGO_PKG_VERSION_PATCH")),
            ),
            device_id: None,
            language: None,
            label: None,
            revision: None,
            bootloader_hash: None,
            initialized: false,
            pin_protection: false,
            passphrase_protection: false,
        }
    }
}

fn parse_version(s: &str) -> u32 {
    s.parse().unwrap_or(0)
}

impl DeviceInfo {
    /// Set the vendor name.
    #[must_use]
    pub fn with_vendor(mut self, vendor: BoundedString<VENDOR_MAX>) -> Self {
        self.vendor = vendor;
        self
    }

    /// Set the device id.
    #[must_use]
    pub fn with_device_id(mut self, id: BoundedString<DEVICE_ID_MAX>) -> Self {
        self.device_id = Some(id);
        self
    }

    /// Set the label.
    #[must_use]
    pub fn with_label(mut self, label: BoundedString<VENDOR_MAX>) -> Self {
        self.label = Some(label);
        self
    }

    /// Features record for this device, with bootloader mode set.
    pub fn features(&self, firmware_present: bool) -> Features {
        Features {
            vendor: Some(self.vendor.clone()),
            major_version: Some(self.version.0),
            minor_version: Some(self.version.1),
            patch_version: Some(self.version.2),
            bootloader_mode: Some(true),
            device_id: self.device_id.clone(),
            pin_protection: Some(self.pin_protection),
            passphrase_protection: Some(self.passphrase_protection),
            language: self.language.clone(),
            label: self.label.clone(),
            initialized: Some(self.initialized),
            revision: self.revision.clone(),
            bootloader_hash: self.bootloader_hash.clone(),
            imported: None,
            pin_cached: None,
            passphrase_cached: None,
            firmware_present: Some(firmware_present),
        }
    }
}

/// Serde helper storing a [`Duration`] as integer milliseconds.
#[cfg(feature = "serde")]
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_builder() {
        let config = EngineConfig::default()
            .with_confirm_timeout(Duration::from_millis(10))
            .with_max_readback(64)
            .with_confirm_erase(true);
        assert_eq!(config.confirm_timeout, Duration::from_millis(10));
        assert_eq!(config.max_readback, 64);
        assert!(config.confirm_erase);
        assert_eq!(config.frame_timeout, DEFAULT_FRAME_TIMEOUT);
    }

    #[test]
    fn test_features_from_device_info() {
        let info = DeviceInfo::default()
            .with_label(BoundedString::try_from("bench unit").unwrap());
        let features = info.features(false);
        assert_eq!(features.bootloader_mode, Some(true));
        assert_eq!(features.firmware_present, Some(false));
        assert_eq!(features.vendor.as_deref(), Some("bootlink"));
        assert_eq!(features.label.as_deref(), Some("bench unit"));
        assert_eq!(features.imported, None);
    }
}
