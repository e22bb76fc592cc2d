//! Host-side client.
//!
//! [`Client`] drives a device running the bootloader protocol: it opens the
//! session, answers confirmation requests, erases, streams a firmware image
//! and reads it back.
//!
//! ## Example
//!
//! ```rust,no_run
//! use bootlink::client::Client;
//! use bootlink::port::{NativePort, SerialConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyACM0", 115_200))?;
//!     let mut client = Client::new(port)?;
//!
//!     let features = client.initialize()?;
//!     println!("Vendor: {:?}", features.vendor);
//!
//!     let image = std::fs::read("firmware.bin")?;
//!     client.flash_firmware(&image, true, |stage, current, total| {
//!         println!("{stage}: {current}/{total}");
//!     })?;
//!     Ok(())
//! }
//! ```

use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::DEFAULT_MAX_READBACK;
use crate::engine::firmware_digest;
use crate::error::{DecodeError, Error, Result};
use crate::port::Port;
use crate::protocol::message::{
    ButtonAck, Features, FirmwareErase, FirmwareRequest, FirmwareUpload, GetFeatures, Initialize,
    Message, Ping, Text,
};
use crate::transport::Link;

/// Wait for an ordinary response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait for a response while the user is being asked to confirm.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);

/// Wait for an erase to finish.
const ERASE_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait for a chunk to be written and acknowledged.
const CHUNK_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between Initialize attempts.
const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Maximum number of Initialize attempts.
const MAX_INIT_ATTEMPTS: usize = 3;

/// Payload bytes per FirmwareUpload message.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Confirmations requested by a Ping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingProtection {
    /// Ask for a button press.
    pub button: bool,
    /// Ask for the PIN.
    pub pin: bool,
    /// Ask for the passphrase.
    pub passphrase: bool,
}

/// Host-side protocol client.
pub struct Client<P: Port> {
    link: Link<P>,
    response_timeout: Duration,
    confirm_timeout: Duration,
    chunk_size: usize,
}

impl<P: Port> Client<P> {
    /// Create a client on an opened port.
    pub fn new(port: P) -> Result<Self> {
        Ok(Self {
            link: Link::new(port)?,
            response_timeout: RESPONSE_TIMEOUT,
            confirm_timeout: CONFIRM_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Set the response timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set how long to wait while the device asks for confirmation.
    #[must_use]
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Set the upload chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        self.link.port()
    }

    /// Consume the client and return the underlying port.
    pub fn into_port(self) -> P {
        self.link.into_port()
    }

    /// Open a session, retrying a few times.
    pub fn initialize(&mut self) -> Result<Features> {
        info!("Initializing session on {}...", self.link.port().name());
        let mut last_error = None;

        for attempt in 1..=MAX_INIT_ATTEMPTS {
            match self.call(Initialize.into(), self.response_timeout) {
                Ok(Message::Features(features)) => {
                    if attempt > 1 {
                        debug!("Session opened on attempt {attempt}");
                    }
                    return Ok(*features);
                },
                Ok(other) => return Err(unexpected(&other)),
                Err(e @ (Error::Disconnected | Error::Interrupted)) => return Err(e),
                Err(e) => {
                    warn!("Initialize failed (attempt {attempt}/{MAX_INIT_ATTEMPTS}): {e}");
                    last_error = Some(e);
                    if attempt < MAX_INIT_ATTEMPTS {
                        thread::sleep(INIT_RETRY_DELAY);
                        self.link.clear()?;
                    }
                },
            }
        }

        Err(last_error.unwrap_or(Error::Timeout("Initialize failed".into())))
    }

    /// Query device features.
    pub fn get_features(&mut self) -> Result<Features> {
        match self.call(GetFeatures.into(), self.response_timeout)? {
            Message::Features(features) => Ok(*features),
            other => Err(unexpected(&other)),
        }
    }

    /// Ping the device; returns the echoed text.
    pub fn ping(&mut self, message: &str, protection: PingProtection) -> Result<Option<String>> {
        let text = Text::try_from(message).map_err(|e| DecodeError::FieldTooLarge {
            field: "message",
            length: e.length,
            max: e.capacity,
        })?;
        let ping = Ping {
            message: Some(text),
            button_protection: protection.button.then_some(true),
            pin_protection: protection.pin.then_some(true),
            passphrase_protection: protection.passphrase.then_some(true),
        };
        expect_success(self.call(ping.into(), self.response_timeout)?)
    }

    /// Erase `length` bytes of firmware area, or all of it.
    pub fn erase(&mut self, length: Option<u32>) -> Result<()> {
        match length {
            Some(len) => info!("Erasing {len} bytes..."),
            None => info!("Erasing firmware area..."),
        }
        let reply = self.call(FirmwareErase { length }.into(), ERASE_TIMEOUT)?;
        expect_success(reply).map(|_| ())
    }

    /// Stream `data` into the erased area.
    ///
    /// Every chunk but the last is sent without a hash; the last one carries
    /// the SHA-256 of the whole image and completes the upload.
    pub fn upload<F>(&mut self, data: &[u8], mut progress: F) -> Result<()>
    where
        F: FnMut(&str, usize, usize),
    {
        if data.is_empty() {
            return Err(Error::Protocol("firmware image is empty".into()));
        }
        let hash = firmware_digest(data);
        let total = data.len();
        let mut sent = 0;
        progress("upload", 0, total);

        for chunk in data.chunks(self.chunk_size) {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            sent += chunk.len();
            let last = sent == total;
            let msg = FirmwareUpload {
                payload: Some(chunk.to_vec()),
                hash: last.then(|| hash.clone()),
            };
            debug!("Uploading {} bytes ({sent}/{total})", chunk.len());
            expect_success(self.call(msg.into(), CHUNK_TIMEOUT)?)?;
            progress("upload", sent, total);
        }

        info!("Upload verified by device ({total} bytes, sha256 {})", hash.to_hex());
        Ok(())
    }

    /// Read back one region and check its hash.
    pub fn read_back(&mut self, offset: u32, length: u32) -> Result<Vec<u8>> {
        let request = FirmwareRequest {
            offset: Some(offset),
            length: Some(length),
        };
        let reply = self.call(request.into(), self.response_timeout)?;
        let Message::FirmwareUpload(region) = reply else {
            return Err(unexpected(&reply));
        };

        let payload = region.payload.unwrap_or_default();
        if payload.len() != length as usize {
            return Err(Error::Protocol(format!(
                "read-back returned {} bytes, expected {length}",
                payload.len()
            )));
        }
        if region.hash.is_some_and(|hash| hash != firmware_digest(&payload)) {
            return Err(Error::Protocol(format!(
                "read-back hash mismatch at 0x{offset:08X}"
            )));
        }
        Ok(payload)
    }

    /// Read `length` bytes from the start of the image.
    pub fn read_image<F>(&mut self, length: u32, mut progress: F) -> Result<Vec<u8>>
    where
        F: FnMut(&str, usize, usize),
    {
        let mut image = Vec::with_capacity(length as usize);
        let mut offset = 0u32;
        progress("read", 0, length as usize);

        while offset < length {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            let n = (length - offset).min(DEFAULT_MAX_READBACK);
            image.extend_from_slice(&self.read_back(offset, n)?);
            offset += n;
            progress("read", offset as usize, length as usize);
        }
        Ok(image)
    }

    /// Erase, upload and optionally read back `data`.
    pub fn flash_firmware<F>(&mut self, data: &[u8], verify: bool, mut progress: F) -> Result<()>
    where
        F: FnMut(&str, usize, usize),
    {
        let length = u32::try_from(data.len())
            .map_err(|_| Error::Protocol("firmware image larger than 4 GiB".into()))?;

        self.erase(Some(length))?;
        self.upload(data, &mut progress)?;

        if verify {
            let image = self.read_image(length, &mut progress)?;
            if let Some(pos) = image.iter().zip(data).position(|(a, b)| a != b) {
                return Err(Error::Protocol(format!(
                    "verification failed at offset 0x{pos:08X}"
                )));
            }
            info!("Read-back verification passed");
        }

        info!("Flashing complete!");
        Ok(())
    }

    /// Send a request and wait for its final response, acknowledging any
    /// confirmation requests on the way.
    fn call(&mut self, msg: Message, timeout: Duration) -> Result<Message> {
        self.link.send(&msg)?;
        let mut reply = self.link.recv(timeout)?;

        while let Message::ButtonRequest(request) = &reply {
            info!(
                "Device asks for confirmation ({:?}){}",
                request.code,
                request
                    .data
                    .as_ref()
                    .map(|d| format!(": {d}"))
                    .unwrap_or_default()
            );
            self.link.send(&ButtonAck.into())?;
            reply = self.link.recv(self.confirm_timeout)?;
        }

        match reply {
            Message::Failure(failure) => Err(Error::DeviceFailure {
                code: failure.code,
                message: failure.message.map(|m| m.to_string()).unwrap_or_default(),
            }),
            other => Ok(other),
        }
    }
}

fn expect_success(reply: Message) -> Result<Option<String>> {
    match reply {
        Message::Success(success) => Ok(success.message.map(|m| m.to_string())),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(reply: &Message) -> Error {
    Error::Protocol(format!("unexpected {:?} reply", reply.message_type()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::LoopbackPort;
    use crate::protocol::message::{
        ButtonRequest, ButtonRequestType, Failure, FailureType, MessageType, Success,
    };

    /// Runs a scripted device: for each expected request type, answers with
    /// the given replies.
    fn scripted_device(
        port: LoopbackPort,
        script: Vec<(MessageType, Vec<Message>)>,
    ) -> thread::JoinHandle<Vec<Message>> {
        thread::spawn(move || {
            let mut link = Link::new(port).unwrap();
            let mut seen = Vec::new();
            for (expected, replies) in script {
                let msg = link.recv(Duration::from_secs(2)).unwrap();
                assert_eq!(msg.message_type(), expected);
                seen.push(msg);
                for reply in replies {
                    link.send(&reply).unwrap();
                }
            }
            seen
        })
    }

    #[test]
    fn test_call_answers_button_requests() {
        let (host, device) = LoopbackPort::pair();
        let button = Message::from(ButtonRequest {
            code: Some(ButtonRequestType::Confirm),
            data: None,
        });
        let done = Message::from(Success {
            message: Some(Text::try_from("pong").unwrap()),
        });
        let handle = scripted_device(
            device,
            vec![
                (MessageType::Ping, vec![button]),
                (MessageType::ButtonAck, vec![done]),
            ],
        );

        let mut client = Client::new(host).unwrap();
        let protection = PingProtection {
            button: true,
            ..PingProtection::default()
        };
        let echoed = client.ping("pong", protection).unwrap();
        assert_eq!(echoed.as_deref(), Some("pong"));

        let seen = handle.join().unwrap();
        let Message::Ping(ping) = &seen[0] else {
            panic!("expected Ping");
        };
        assert_eq!(ping.button_protection, Some(true));
        assert_eq!(ping.pin_protection, None);
    }

    #[test]
    fn test_failure_reply_becomes_error() {
        let (host, device) = LoopbackPort::pair();
        let failure = Message::from(Failure {
            code: Some(FailureType::DataError),
            message: Some(Text::try_from("Erase length must be non-zero").unwrap()),
        });
        let handle = scripted_device(device, vec![(MessageType::FirmwareErase, vec![failure])]);

        let mut client = Client::new(host).unwrap();
        let err = client.erase(Some(0)).unwrap_err();
        assert!(matches!(
            err,
            Error::DeviceFailure {
                code: Some(FailureType::DataError),
                ..
            }
        ));
        handle.join().unwrap();
    }

    #[test]
    fn test_upload_splits_chunks_and_hashes_last() {
        let (host, device) = LoopbackPort::pair();
        let ok = || Message::from(Success::default());
        let handle = scripted_device(
            device,
            vec![
                (MessageType::FirmwareUpload, vec![ok()]),
                (MessageType::FirmwareUpload, vec![ok()]),
                (MessageType::FirmwareUpload, vec![ok()]),
            ],
        );

        let data: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let mut client = Client::new(host).unwrap().with_chunk_size(1000);
        let mut calls = Vec::new();
        client
            .upload(&data, |stage, current, total| calls.push((stage.to_string(), current, total)))
            .unwrap();

        let seen = handle.join().unwrap();
        let hashes: Vec<_> = seen
            .iter()
            .map(|m| match m {
                Message::FirmwareUpload(u) => u.hash.clone(),
                _ => panic!("expected FirmwareUpload"),
            })
            .collect();
        assert_eq!(hashes, vec![None, None, Some(firmware_digest(&data))]);
        assert_eq!(calls.last(), Some(&("upload".to_string(), 2500, 2500)));
    }

    #[test]
    fn test_read_back_rejects_bad_hash() {
        let (host, device) = LoopbackPort::pair();
        let reply = Message::from(FirmwareUpload {
            payload: Some(vec![1, 2, 3, 4]),
            hash: Some(firmware_digest(b"not it")),
        });
        let handle = scripted_device(device, vec![(MessageType::FirmwareRequest, vec![reply])]);

        let mut client = Client::new(host).unwrap();
        assert!(matches!(client.read_back(0, 4), Err(Error::Protocol(_))));
        handle.join().unwrap();
    }
}
