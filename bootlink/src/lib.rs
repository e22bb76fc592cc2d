//! # bootlink
//!
//! A bootloader command/response protocol engine.
//!
//! This crate implements both ends of a small firmware-update protocol
//! carried in 64-byte packets over a serial link:
//!
//! - Wire codec for the fixed message catalog (protobuf wire format, bounded
//!   fields, streamed firmware payloads)
//! - Transport framer reassembling packets into message frames
//! - Device-side protocol engine: state machine, erase/upload/verify,
//!   confirmation waits, session guard
//! - Host-side client to initialize, ping, erase, upload and read back
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport` crate
//! - Any byte transport implementing [`port::Port`], including the in-memory
//!   [`port::LoopbackPort`] pair
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for configuration and data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use bootlink::{AutoConfirm, Engine, MemoryFlash, Server, SessionRegistry};
//! use bootlink::port::LoopbackPort;
//! use bootlink::client::Client;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (host, device) = LoopbackPort::pair();
//!     let registry = SessionRegistry::new();
//!
//!     let engine = Engine::new(MemoryFlash::new(64 * 1024), AutoConfirm, &registry);
//!     let mut server = Server::new(device, engine)?;
//!     let device_thread = std::thread::spawn(move || server.run());
//!
//!     let mut client = Client::new(host)?;
//!     client.initialize()?;
//!     client.flash_firmware(&[0xAA; 4096], true, |stage: &str, current, total| {
//!         println!("{stage}: {current}/{total}");
//!     })?;
//!
//!     drop(client);
//!     device_thread.join().ok();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod client;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod port;
pub mod protocol;
pub mod server;
pub mod transport;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

/// Flag the calling test thread as interrupted.
///
/// The flag is thread-local so tests running in parallel never see each
/// other's interrupts.
#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::cell::Cell;

    thread_local! {
        static TEST_INTERRUPTED: Cell<bool> = const { Cell::new(false) };
    }

    static REGISTERED: OnceLock<()> = OnceLock::new();
    REGISTERED.get_or_init(|| set_interrupt_checker(|| TEST_INTERRUPTED.with(Cell::get)));

    TEST_INTERRUPTED.with(|flag| flag.set(value));
}


// Re-exports for convenience
pub use client::{Client, PingProtection};
pub use config::{DeviceInfo, EngineConfig};
pub use device::flash::{FileFlash, FlashDriver, ImageState, MemoryFlash, Region, SharedFlash};
pub use device::ui::{AutoConfirm, Decision, Prompt, ScriptedUi, UserInterface};
pub use device::{DetectedPort, DeviceKind, discover_ports};
pub use engine::{Engine, SessionRegistry, State, firmware_digest};
pub use error::{Error, Result, SessionError};
pub use port::{Port, SerialConfig};
pub use protocol::{Message, MessageType};
pub use server::{ServeSummary, Server};

// Native-specific re-exports
#[cfg(feature = "native")]
pub use port::NativePort;
