//! Device-side collaborators and host-side device discovery.
//!
//! - [`flash`]: flash driver trait and reference drivers.
//! - [`ui`]: user-confirmation trait and reference implementations.
//! - Port discovery: serial ports classified by USB VID/PID, bootloader-class
//!   devices first, then common USB-UART bridges.

pub mod flash;
pub mod ui;

#[cfg(feature = "native")]
use log::{debug, trace};

#[cfg(feature = "serde")]
use serde::Serialize;

/// Known device kinds behind a serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum DeviceKind {
    /// USB device enumerating in bootloader mode.
    Bootloader,
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches any PID.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (0x1209, &[0x53C0], DeviceKind::Bootloader),
    (0x534C, &[0x0001], DeviceKind::Bootloader),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && (pids.is_empty() || pids.contains(&pid)))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bootloader => "Bootloader",
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the kind was recognised.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Auto-selection rank; lower is preferred.
    fn rank(&self) -> u8 {
        match self {
            Self::Bootloader => 0,
            Self::Ch340 | Self::Cp210x => 1,
            Self::Ftdi | Self::Prolific => 2,
            Self::Unknown => 3,
        }
    }
}

/// A discovered serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// A port with no USB metadata.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Whether this port is a device in bootloader mode.
    pub fn is_bootloader(&self) -> bool {
        self.device == DeviceKind::Bootloader
    }
}

/// Enumerate serial ports with metadata.
#[cfg(feature = "native")]
pub fn discover_ports() -> Vec<DetectedPort> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            return Vec::new();
        },
    };

    ports
        .into_iter()
        .map(|port_info| {
            let mut detected = DetectedPort::plain(port_info.port_name);
            if let serialport::SerialPortType::UsbPort(usb) = port_info.port_type {
                detected.device = DeviceKind::from_vid_pid(usb.vid, usb.pid);
                trace!(
                    "Found USB port: {} (VID: {:04X}, PID: {:04X}, Device: {:?})",
                    detected.name, usb.vid, usb.pid, detected.device
                );
                detected.vid = Some(usb.vid);
                detected.pid = Some(usb.pid);
                detected.manufacturer = usb.manufacturer;
                detected.product = usb.product;
                detected.serial = usb.serial_number;
            }
            detected
        })
        .collect()
}

/// Enumerate serial ports (unavailable without native serial support).
#[cfg(not(feature = "native"))]
pub fn discover_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the best candidate: bootloader devices, then common bridges, then
/// anything.
pub fn select_port(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    ports.iter().min_by_key(|p| p.device.rank())
}

/// Format detected ports for display, one line each.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port.device.is_known() {
                format!(" [{}]", port.device.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };

            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();

            format!("{}{}{}", port.name, device_info, product_info)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort {
            device: DeviceKind::from_vid_pid(vid, pid),
            vid: Some(vid),
            pid: Some(pid),
            ..DetectedPort::plain(name)
        }
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x1209, 0x53C0), DeviceKind::Bootloader);
        assert_eq!(DeviceKind::from_vid_pid(0x1209, 0x53C1), DeviceKind::Unknown);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x6001), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x067B, 0x2303), DeviceKind::Prolific);
        assert_eq!(DeviceKind::from_vid_pid(0x1234, 0x5678), DeviceKind::Unknown);
    }

    #[test]
    fn test_select_port_prefers_bootloader() {
        let ports = vec![
            DetectedPort::plain("/dev/ttyS0"),
            usb("/dev/ttyUSB0", 0x0403, 0x6001),
            usb("/dev/ttyUSB1", 0x1A86, 0x7523),
            usb("/dev/ttyACM0", 0x1209, 0x53C0),
        ];
        assert_eq!(select_port(&ports).unwrap().name, "/dev/ttyACM0");
        assert_eq!(select_port(&ports[..3]).unwrap().name, "/dev/ttyUSB1");
        assert_eq!(select_port(&ports[..1]).unwrap().name, "/dev/ttyS0");
        assert!(select_port(&[]).is_none());
    }

    #[test]
    fn test_format_port_list() {
        let mut bridge = usb("/dev/ttyUSB0", 0x1A86, 0x7523);
        bridge.product = Some("USB-Serial".to_string());
        let ports = vec![
            bridge,
            usb("/dev/ttyUSB1", 0x1111, 0x2222),
            DetectedPort::plain("/dev/ttyS0"),
        ];

        let formatted = format_port_list(&ports);
        assert_eq!(formatted[0], "/dev/ttyUSB0 [CH340/CH341] - USB-Serial");
        assert_eq!(formatted[1], "/dev/ttyUSB1 [VID:1111 PID:2222]");
        assert_eq!(formatted[2], "/dev/ttyS0");
    }
}
