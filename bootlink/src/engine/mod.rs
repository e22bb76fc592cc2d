//! Bootloader protocol engine.
//!
//! [`Engine`] is the device side of one transport session. It validates each
//! decoded request against the current [`State`], drives the flash driver
//! and the user interface, and returns exactly one response per accepted
//! request.
//!
//! ```text
//! Idle --Initialize--> Initialized --FirmwareErase--> EraseRequested
//!   ^                   |  ^  (GetFeatures, Ping)          |
//!   |                   +--+                           Erasing
//!   |                                                      |
//!   +--(verified)-- Verifying <-- UploadInProgress <-- ReadyForUpload
//! ```
//!
//! Any request that is not a legal next step answers
//! `Failure{UnexpectedMessage}` and resets the session to `Idle`. A partial
//! upload that is abandoned for any reason is erased and the image is left
//! marked unbootable.

pub mod guard;
pub mod response;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, trace, warn};
use sha2::{Digest as _, Sha256};

use crate::config::{DeviceInfo, EngineConfig};
use crate::device::flash::{FlashDriver, ImageState, Region};
use crate::device::ui::{Decision, Prompt, UserInterface};
use crate::error::{FlashError, Result, SessionError};
use crate::protocol::message::{
    ButtonRequestType, Digest, Features, FirmwareErase, FirmwareRequest, FirmwareUpload, HASH_LEN,
    Message, MessageType, Ping, Text,
};
use crate::protocol::stream::{BufferedUpload, PayloadSource};

pub use guard::{SessionGuard, SessionId, SessionRegistry};
pub use response::Outcome;

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No session established.
    Idle,
    /// Initialize received.
    Initialized,
    /// Erase accepted, waiting for confirmation.
    EraseRequested,
    /// Driver erase running.
    Erasing,
    /// Erased region ready for the first upload chunk.
    ReadyForUpload,
    /// Upload chunks are being written.
    UploadInProgress,
    /// Checking the declared hash.
    Verifying,
}

/// Work to do once every confirmation step was accepted.
#[derive(Debug)]
enum PendingAction {
    PingReply(Option<Text>),
    Erase(u32),
}

#[derive(Debug)]
struct Pending {
    current: Prompt,
    remaining: VecDeque<Prompt>,
    action: PendingAction,
}

struct UploadSession {
    cursor: u32,
    hasher: Sha256,
}

/// SHA-256 of a firmware image or read-back region.
pub fn firmware_digest(data: &[u8]) -> Digest {
    let bytes: [u8; HASH_LEN] = Sha256::digest(data).into();
    Digest::from(bytes)
}

/// Device-side protocol engine for one session.
pub struct Engine<F, U> {
    config: EngineConfig,
    info: DeviceInfo,
    flash: F,
    ui: U,
    guard: SessionGuard,
    state: State,
    pending: Option<Pending>,
    erased: u32,
    upload: Option<UploadSession>,
}

impl<F: FlashDriver, U: UserInterface> Engine<F, U> {
    /// Create an engine registered with `registry`.
    pub fn new(flash: F, ui: U, registry: &Arc<SessionRegistry>) -> Self {
        Self {
            config: EngineConfig::default(),
            info: DeviceInfo::default(),
            flash,
            ui,
            guard: registry.open_session(),
            state: State::Idle,
            pending: None,
            erased: 0,
            upload: None,
        }
    }

    /// Set the engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the identity reported in Features.
    #[must_use]
    pub fn with_device_info(mut self, info: DeviceInfo) -> Self {
        self.info = info;
        self
    }

    /// Current protocol state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Session id.
    pub fn session_id(&self) -> SessionId {
        self.guard.id()
    }

    /// Flash driver.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// User interface.
    pub fn ui(&self) -> &U {
        &self.ui
    }

    /// Whether a ButtonAck is awaited.
    pub fn awaiting_confirmation(&self) -> bool {
        self.pending.is_some()
    }

    /// Deadline of the pending confirmation, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().and(self.guard.deadline())
    }

    /// Handle one decoded request and build its response.
    pub fn handle(&mut self, msg: Message, now: Instant) -> Message {
        let msg_type = msg.message_type();
        debug!("{}: {:?} in state {:?}", self.guard.id(), msg_type, self.state);

        if self.pending.is_some() {
            let outcome = match msg {
                Message::ButtonAck(_) => self.on_button_ack(now),
                _ => self.violation(msg_type),
            };
            return outcome.into_message();
        }

        let outcome = match (self.state, msg) {
            (State::Idle | State::Initialized, Message::Initialize(_)) => self.on_initialize(),
            (State::Initialized, Message::GetFeatures(_)) => {
                Outcome::Features(Box::new(self.features()))
            },
            (State::Initialized, Message::Ping(ping)) => self.on_ping(ping, now),
            (State::Initialized, Message::FirmwareErase(erase)) => self.on_erase(erase, now),
            (_, Message::FirmwareRequest(request)) => self.on_read_back(request),
            (_, Message::FirmwareUpload(upload)) => {
                return match self.handle_upload(&mut BufferedUpload::new(&upload)) {
                    Ok(reply) => reply,
                    Err(err) => self
                        .fail(SessionError::DataError(err.to_string()))
                        .into_message(),
                };
            },
            _ => self.violation(msg_type),
        };
        outcome.into_message()
    }

    /// Handle a FirmwareUpload whose payload is pulled from `source`.
    ///
    /// An error from `source` means the request never fully arrived: the
    /// session is reset and no response is produced.
    pub fn handle_upload<P: PayloadSource>(&mut self, source: &mut P) -> Result<Message> {
        if self.pending.is_some()
            || !matches!(self.state, State::ReadyForUpload | State::UploadInProgress)
        {
            return Ok(self.violation(MessageType::FirmwareUpload).into_message());
        }
        match self.receive_upload(source) {
            Ok(outcome) => Ok(outcome.into_message()),
            Err(err) => {
                warn!("{}: upload aborted: {err}", self.guard.id());
                self.reset();
                Err(err)
            },
        }
    }

    /// Cancel a confirmation whose deadline passed.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<Message> {
        let expired = self.pending.is_some() && self.guard.wait_expired(now);
        expired.then(|| self.cancel("confirmation timed out").into_message())
    }

    /// Transport went away.
    pub fn disconnect(&mut self) {
        info!("{}: transport disconnected in state {:?}", self.guard.id(), self.state);
        self.reset();
    }

    fn features(&self) -> Features {
        self.info.features(self.flash.image_state().is_bootable())
    }

    fn on_initialize(&mut self) -> Outcome {
        self.reset();
        self.state = State::Initialized;
        Outcome::Features(Box::new(self.features()))
    }

    fn on_ping(&mut self, ping: Ping, now: Instant) -> Outcome {
        let mut steps = VecDeque::new();
        if ping.button_protection == Some(true) {
            steps.push_back(Prompt::new(ButtonRequestType::Confirm, "Confirm ping"));
        }
        if ping.pin_protection == Some(true) {
            steps.push_back(Prompt::new(ButtonRequestType::PinEntry, "Enter PIN"));
        }
        if ping.passphrase_protection == Some(true) {
            steps.push_back(Prompt::new(
                ButtonRequestType::PassphraseEntry,
                "Enter passphrase",
            ));
        }
        self.confirm(steps, PendingAction::PingReply(ping.message), now)
    }

    fn on_erase(&mut self, erase: FirmwareErase, now: Instant) -> Outcome {
        let capacity = self.flash.capacity();
        let length = match erase.length {
            None => capacity,
            Some(0) => {
                return self.fail(SessionError::DataError(
                    "Erase length must be non-zero".into(),
                ));
            },
            Some(length) if length > capacity => {
                return self.fail(SessionError::DataError(format!(
                    "Erase length {length} exceeds flash capacity {capacity}"
                )));
            },
            Some(length) => length,
        };

        if let Err(err) = self.guard.acquire_flash() {
            return self.fail(err);
        }
        self.state = State::EraseRequested;

        if self.config.confirm_erase {
            let prompt = Prompt::new(
                ButtonRequestType::FirmwareCheck,
                format!("Erase {length} bytes of firmware?"),
            );
            self.confirm(VecDeque::from([prompt]), PendingAction::Erase(length), now)
        } else {
            self.perform_erase(length)
        }
    }

    fn perform_erase(&mut self, length: u32) -> Outcome {
        self.state = State::Erasing;
        info!("{}: erasing {length} bytes", self.guard.id());
        match self.erase_region(length) {
            Ok(()) => {
                self.erased = length;
                self.state = State::ReadyForUpload;
                Outcome::success("Firmware erased")
            },
            Err(err) => self.fail(err.into()),
        }
    }

    fn erase_region(&mut self, length: u32) -> std::result::Result<(), FlashError> {
        self.flash
            .set_image_state(ImageState::Unbootable { written: 0 })?;
        self.flash.erase(Region::new(0, length))?;
        if length == self.flash.capacity() {
            self.flash.set_image_state(ImageState::Empty)?;
        }
        Ok(())
    }

    fn on_read_back(&mut self, request: FirmwareRequest) -> Outcome {
        let (Some(offset), Some(length)) = (request.offset, request.length) else {
            return self.fail(SessionError::DataError(
                "Read-back needs offset and length".into(),
            ));
        };
        if length == 0 || length > self.config.max_readback {
            return self.fail(SessionError::DataError(format!(
                "Read-back length must be 1..={}",
                self.config.max_readback
            )));
        }
        let committed = self.committed_length();
        if offset.checked_add(length).is_none_or(|end| end > committed) {
            return self.fail(SessionError::DataError(format!(
                "Range 0x{offset:08X}+{length} is outside the committed image ({committed} bytes)"
            )));
        }

        match self.flash.read(offset, length) {
            Ok(payload) => {
                let hash = firmware_digest(&payload);
                Outcome::Payload(FirmwareUpload {
                    payload: Some(payload),
                    hash: Some(hash),
                })
            },
            Err(err) => self.fail(err.into()),
        }
    }

    /// Bytes that may be read back: the current upload's progress, else the
    /// verified image. Nothing while another session owns the flash.
    fn committed_length(&self) -> u32 {
        if let Some(upload) = &self.upload {
            return upload.cursor;
        }
        if self.guard.flash_held_elsewhere() {
            return 0;
        }
        match self.flash.image_state() {
            ImageState::Bootable { length, .. } => length,
            _ => 0,
        }
    }

    fn receive_upload<P: PayloadSource>(&mut self, source: &mut P) -> Result<Outcome> {
        if self.upload.is_none() {
            debug!("{}: upload session started", self.guard.id());
            self.upload = Some(UploadSession {
                cursor: 0,
                hasher: Sha256::new(),
            });
        }
        self.state = State::UploadInProgress;

        while let Some(chunk) = source.next_payload()? {
            let cursor = self.upload.as_ref().map_or(0, |u| u.cursor);
            let end = u32::try_from(chunk.len())
                .ok()
                .and_then(|len| cursor.checked_add(len))
                .filter(|end| *end <= self.erased);
            let Some(end) = end else {
                return Ok(self.fail(SessionError::DataError(format!(
                    "Upload exceeds erased length of {} bytes",
                    self.erased
                ))));
            };
            if let Err(err) = self.flash.write(cursor, chunk) {
                return Ok(self.fail(err.into()));
            }
            if let Some(upload) = self.upload.as_mut() {
                upload.cursor = end;
                upload.hasher.update(chunk);
            }
            trace!("{}: wrote {} bytes at 0x{cursor:08X}", self.guard.id(), chunk.len());
        }

        match source.declared_hash() {
            Some(declared) => {
                let declared = declared.clone();
                Ok(self.verify(&declared))
            },
            None => Ok(Outcome::success("Chunk accepted")),
        }
    }

    fn verify(&mut self, declared: &Digest) -> Outcome {
        self.state = State::Verifying;
        let Some(upload) = self.upload.take() else {
            return self.fail(SessionError::DataError("No upload in progress".into()));
        };
        let length = upload.cursor;
        if declared.len() != HASH_LEN {
            self.upload = Some(upload);
            return self.fail(SessionError::DataError(format!(
                "Hash must be {HASH_LEN} bytes"
            )));
        }
        if length == 0 {
            self.upload = Some(upload);
            return self.fail(SessionError::DataError("Empty firmware image".into()));
        }

        let computed: [u8; HASH_LEN] = upload.hasher.clone().finalize().into();
        let computed = Digest::from(computed);
        if computed != *declared {
            warn!(
                "{}: firmware hash mismatch: computed {}, declared {}",
                self.guard.id(),
                computed.to_hex(),
                declared.to_hex()
            );
            self.upload = Some(upload);
            return self.fail(SessionError::FirmwareMismatch);
        }

        if let Err(err) = self.flash.set_image_state(ImageState::Bootable {
            length,
            hash: computed,
        }) {
            self.upload = Some(upload);
            return self.fail(err.into());
        }
        info!("{}: firmware verified, {length} bytes", self.guard.id());
        self.erased = 0;
        self.guard.release_flash();
        self.state = State::Idle;
        Outcome::Success(None)
    }

    fn confirm(&mut self, mut steps: VecDeque<Prompt>, action: PendingAction, now: Instant) -> Outcome {
        let Some(current) = steps.pop_front() else {
            return self.execute(action);
        };
        self.ui.show(&current);
        self.guard.begin_wait(now, self.config.confirm_timeout);
        self.pending = Some(Pending {
            current: current.clone(),
            remaining: steps,
            action,
        });
        Outcome::NeedsConfirmation(current)
    }

    fn on_button_ack(&mut self, now: Instant) -> Outcome {
        if self.guard.wait_expired(now) {
            return self.cancel("ButtonAck arrived after the deadline");
        }
        let Some(mut pending) = self.pending.take() else {
            return self.violation(MessageType::ButtonAck);
        };
        self.guard.end_wait();

        if self.ui.decide(&pending.current) == Decision::Decline {
            return self.cancel("user declined");
        }

        match pending.remaining.pop_front() {
            Some(next) => {
                self.ui.show(&next);
                self.guard.begin_wait(now, self.config.confirm_timeout);
                pending.current = next.clone();
                self.pending = Some(pending);
                Outcome::NeedsConfirmation(next)
            },
            None => {
                self.ui.clear();
                self.execute(pending.action)
            },
        }
    }

    fn execute(&mut self, action: PendingAction) -> Outcome {
        match action {
            PendingAction::PingReply(message) => Outcome::Success(message),
            PendingAction::Erase(length) => self.perform_erase(length),
        }
    }

    /// Abandon a confirmation. The session stays established.
    fn cancel(&mut self, reason: &str) -> Outcome {
        warn!("{}: {reason}, action cancelled", self.guard.id());
        self.pending = None;
        self.guard.end_wait();
        self.ui.clear();
        if self.state == State::EraseRequested {
            self.guard.release_flash();
        }
        self.state = State::Initialized;
        Outcome::Failed(SessionError::ActionCancelled)
    }

    fn violation(&mut self, msg_type: MessageType) -> Outcome {
        warn!(
            "{}: {:?} is not valid in state {:?}",
            self.guard.id(),
            msg_type,
            self.state
        );
        self.fail(SessionError::UnexpectedMessage)
    }

    fn fail(&mut self, err: SessionError) -> Outcome {
        debug!("{}: failing request: {err}", self.guard.id());
        self.reset();
        Outcome::Failed(err)
    }

    /// Return to `Idle`, invalidating any partial image.
    fn reset(&mut self) {
        self.invalidate();
        if self.pending.take().is_some() {
            self.ui.clear();
        }
        self.guard.end_wait();
        self.erased = 0;
        self.guard.release_flash();
        self.state = State::Idle;
    }

    fn invalidate(&mut self) {
        let upload = self.upload.take();
        if upload.is_none() && self.state != State::Erasing {
            return;
        }
        let written = upload.map_or(0, |u| u.cursor);
        let result = if written > 0 {
            self.flash.erase(Region::new(0, self.erased))
        } else {
            Ok(())
        }
        .and_then(|()| self.flash.set_image_state(ImageState::Unbootable { written }));

        match result {
            Ok(()) => info!(
                "{}: partial image of {written} bytes invalidated",
                self.guard.id()
            ),
            Err(err) => warn!("{}: failed to invalidate partial image: {err}", self.guard.id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::flash::{MemoryFlash, SharedFlash};
    use crate::device::ui::ScriptedUi;
    use crate::protocol::message::{
        ButtonAck, FailureType, GetFeatures, Initialize, Success,
    };
    use std::time::Duration;

    const CAPACITY: u32 = 8192;

    fn engine(answers: &[Decision]) -> Engine<MemoryFlash, ScriptedUi> {
        Engine::new(
            MemoryFlash::new(CAPACITY),
            ScriptedUi::new(answers.iter().copied()),
            &SessionRegistry::new(),
        )
    }

    fn initialized(answers: &[Decision]) -> Engine<MemoryFlash, ScriptedUi> {
        let mut engine = engine(answers);
        engine.handle(Initialize.into(), Instant::now());
        assert_eq!(engine.state(), State::Initialized);
        engine
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn upload(payload: &[u8], hash: Option<Digest>) -> Message {
        FirmwareUpload {
            payload: Some(payload.to_vec()),
            hash,
        }
        .into()
    }

    fn erase(length: Option<u32>) -> Message {
        FirmwareErase { length }.into()
    }

    fn failure_code(msg: &Message) -> Option<FailureType> {
        match msg {
            Message::Failure(f) => f.code,
            _ => None,
        }
    }

    fn success_text(msg: &Message) -> Option<&str> {
        match msg {
            Message::Success(s) => s.message.as_deref(),
            _ => None,
        }
    }

    #[test]
    fn test_initialize_returns_features() {
        let mut engine = engine(&[]);
        let reply = engine.handle(Initialize.into(), Instant::now());
        let Message::Features(features) = reply else {
            panic!("expected Features, got {reply:?}");
        };
        assert_eq!(features.bootloader_mode, Some(true));
        assert_eq!(features.firmware_present, Some(false));
        assert_eq!(engine.state(), State::Initialized);

        let reply = engine.handle(GetFeatures.into(), Instant::now());
        assert!(matches!(reply, Message::Features(_)));
        assert_eq!(engine.state(), State::Initialized);
    }

    #[test]
    fn test_get_features_before_initialize_is_unexpected() {
        let mut engine = engine(&[]);
        let reply = engine.handle(GetFeatures.into(), Instant::now());
        assert_eq!(failure_code(&reply), Some(FailureType::UnexpectedMessage));
        assert_eq!(engine.state(), State::Idle);
    }

    #[test]
    fn test_ping_echo() {
        let mut engine = initialized(&[]);
        let ping = Ping {
            message: Some(Text::try_from("hello").unwrap()),
            ..Ping::default()
        };
        let reply = engine.handle(ping.into(), Instant::now());
        assert_eq!(success_text(&reply), Some("hello"));
        assert_eq!(engine.state(), State::Initialized);
    }

    #[test]
    fn test_ping_confirmations_run_in_order() {
        let mut engine = initialized(&[Decision::Confirm; 3]);
        let now = Instant::now();
        let ping = Ping {
            message: Some(Text::try_from("ok").unwrap()),
            button_protection: Some(true),
            pin_protection: Some(true),
            passphrase_protection: Some(true),
        };

        let mut kinds = Vec::new();
        let mut reply = engine.handle(ping.into(), now);
        while let Message::ButtonRequest(req) = &reply {
            kinds.push(req.code.unwrap());
            reply = engine.handle(ButtonAck.into(), now);
        }
        assert_eq!(
            kinds,
            [
                ButtonRequestType::Confirm,
                ButtonRequestType::PinEntry,
                ButtonRequestType::PassphraseEntry
            ]
        );
        assert_eq!(success_text(&reply), Some("ok"));
        assert_eq!(engine.ui().shown().len(), 3);
        assert!(!engine.awaiting_confirmation());
    }

    #[test]
    fn test_ping_declined() {
        let mut engine = initialized(&[Decision::Decline]);
        let now = Instant::now();
        let ping = Ping {
            button_protection: Some(true),
            ..Ping::default()
        };
        assert!(matches!(engine.handle(ping.into(), now), Message::ButtonRequest(_)));
        let reply = engine.handle(ButtonAck.into(), now);
        assert_eq!(failure_code(&reply), Some(FailureType::ActionCancelled));
        assert_eq!(engine.state(), State::Initialized);
    }

    #[test]
    fn test_confirmation_timeout() {
        let mut engine = initialized(&[Decision::Confirm]);
        let timeout = engine.config().confirm_timeout;
        let start = Instant::now();
        let ping = Ping {
            button_protection: Some(true),
            ..Ping::default()
        };
        let reply = engine.handle(ping.into(), start);
        let Message::ButtonRequest(req) = reply else {
            panic!("expected ButtonRequest");
        };
        assert_eq!(req.code, Some(ButtonRequestType::Confirm));
        assert_eq!(engine.next_deadline(), Some(start + timeout));

        assert!(engine.poll_timeout(start + timeout / 2).is_none());
        let reply = engine.poll_timeout(start + timeout).unwrap();
        assert_eq!(failure_code(&reply), Some(FailureType::ActionCancelled));
        assert_eq!(engine.state(), State::Initialized);
        assert!(engine.next_deadline().is_none());
    }

    #[test]
    fn test_late_button_ack_is_cancelled() {
        let mut engine = initialized(&[Decision::Confirm]).with_config(
            EngineConfig::default().with_confirm_timeout(Duration::from_millis(10)),
        );
        let start = Instant::now();
        let ping = Ping {
            button_protection: Some(true),
            ..Ping::default()
        };
        engine.handle(ping.into(), start);
        let reply = engine.handle(ButtonAck.into(), start + Duration::from_secs(1));
        assert_eq!(failure_code(&reply), Some(FailureType::ActionCancelled));
    }

    #[test]
    fn test_other_message_during_confirmation() {
        let mut engine = initialized(&[Decision::Confirm]);
        let now = Instant::now();
        let ping = Ping {
            button_protection: Some(true),
            ..Ping::default()
        };
        engine.handle(ping.into(), now);
        let reply = engine.handle(GetFeatures.into(), now);
        assert_eq!(failure_code(&reply), Some(FailureType::UnexpectedMessage));
        assert_eq!(engine.state(), State::Idle);
        assert!(!engine.awaiting_confirmation());
    }

    #[test]
    fn test_erase_then_upload_verified() {
        let mut engine = initialized(&[]);
        let now = Instant::now();
        let data = image(4096);

        let reply = engine.handle(erase(Some(4096)), now);
        assert_eq!(success_text(&reply), Some("Firmware erased"));
        assert_eq!(engine.state(), State::ReadyForUpload);

        let reply = engine.handle(upload(&data, Some(firmware_digest(&data))), now);
        assert_eq!(reply, Message::Success(Success { message: None }));
        assert_eq!(engine.state(), State::Idle);
        assert_eq!(
            engine.flash().image_state(),
            ImageState::Bootable {
                length: 4096,
                hash: firmware_digest(&data)
            }
        );
        assert_eq!(&engine.flash().contents()[..4096], data.as_slice());
    }

    #[test]
    fn test_erase_length_validation() {
        let mut engine = initialized(&[]);
        let reply = engine.handle(erase(Some(0)), Instant::now());
        assert_eq!(failure_code(&reply), Some(FailureType::DataError));
        assert_eq!(engine.state(), State::Idle);

        let mut engine = initialized(&[]);
        let reply = engine.handle(erase(Some(CAPACITY + 1)), Instant::now());
        assert_eq!(failure_code(&reply), Some(FailureType::DataError));

        let mut engine = initialized(&[]);
        let reply = engine.handle(erase(None), Instant::now());
        assert_eq!(success_text(&reply), Some("Firmware erased"));
        assert_eq!(engine.flash().image_state(), ImageState::Empty);
    }

    #[test]
    fn test_upload_cannot_exceed_erase_length() {
        let mut engine = initialized(&[]);
        let now = Instant::now();
        engine.handle(erase(Some(1024)), now);

        let data = image(1500);
        let reply = engine.handle(upload(&data, Some(firmware_digest(&data))), now);
        assert_eq!(failure_code(&reply), Some(FailureType::DataError));
        assert_eq!(engine.state(), State::Idle);
        assert!(engine.flash().contents().iter().all(|b| *b == 0xFF));
        assert_eq!(
            engine.flash().image_state(),
            ImageState::Unbootable { written: 1024 }
        );
    }

    #[test]
    fn test_hash_mismatch_invalidates_image() {
        let mut engine = initialized(&[]);
        let now = Instant::now();
        engine.handle(erase(Some(4096)), now);

        let data = image(4096);
        let wrong = firmware_digest(b"something else");
        let reply = engine.handle(upload(&data, Some(wrong)), now);
        assert_eq!(failure_code(&reply), Some(FailureType::FirmwareMismatch));
        assert_eq!(engine.state(), State::Idle);
        assert_eq!(
            engine.flash().image_state(),
            ImageState::Unbootable { written: 4096 }
        );
        assert!(engine.flash().contents()[..4096].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn test_chunked_upload() {
        let mut engine = initialized(&[]);
        let now = Instant::now();
        let data = image(3000);
        engine.handle(erase(Some(4096)), now);

        let reply = engine.handle(upload(&data[..2000], None), now);
        assert_eq!(success_text(&reply), Some("Chunk accepted"));
        assert_eq!(engine.state(), State::UploadInProgress);

        let reply = engine.handle(upload(&data[2000..], Some(firmware_digest(&data))), now);
        assert_eq!(reply, Message::Success(Success { message: None }));
        assert!(engine.flash().image_state().is_bootable());
    }

    #[test]
    fn test_upload_without_erase_is_unexpected() {
        let mut engine = initialized(&[]);
        let data = image(16);
        let reply = engine.handle(upload(&data, Some(firmware_digest(&data))), Instant::now());
        assert_eq!(failure_code(&reply), Some(FailureType::UnexpectedMessage));
        assert_eq!(engine.flash().image_state(), ImageState::Empty);
    }

    #[test]
    fn test_read_back() {
        let mut engine = initialized(&[]);
        let now = Instant::now();
        let data = image(2048);
        engine.handle(erase(Some(2048)), now);
        engine.handle(upload(&data, Some(firmware_digest(&data))), now);

        let request = FirmwareRequest {
            offset: Some(100),
            length: Some(200),
        };
        let reply = engine.handle(request.into(), now);
        let Message::FirmwareUpload(region) = reply else {
            panic!("expected FirmwareUpload, got {reply:?}");
        };
        assert_eq!(region.payload.as_deref(), Some(&data[100..300]));
        assert_eq!(region.hash, Some(firmware_digest(&data[100..300])));

        let request = FirmwareRequest {
            offset: Some(2000),
            length: Some(100),
        };
        let reply = engine.handle(request.into(), now);
        assert_eq!(failure_code(&reply), Some(FailureType::DataError));
    }

    #[test]
    fn test_read_back_during_upload_sees_written_bytes() {
        let mut engine = initialized(&[]);
        let now = Instant::now();
        let data = image(1000);
        engine.handle(erase(Some(4096)), now);
        engine.handle(upload(&data, None), now);

        let request = FirmwareRequest {
            offset: Some(0),
            length: Some(1000),
        };
        let reply = engine.handle(request.into(), now);
        assert!(matches!(reply, Message::FirmwareUpload(_)));
        assert_eq!(engine.state(), State::UploadInProgress);
    }

    #[test]
    fn test_flash_busy_across_sessions() {
        let registry = SessionRegistry::new();
        let flash = SharedFlash::new(MemoryFlash::new(CAPACITY));
        let now = Instant::now();
        let mut a = Engine::new(flash.clone(), ScriptedUi::default(), &registry);
        let mut b = Engine::new(flash, ScriptedUi::default(), &registry);
        a.handle(Initialize.into(), now);
        b.handle(Initialize.into(), now);

        assert_eq!(success_text(&a.handle(erase(Some(1024)), now)), Some("Firmware erased"));
        let reply = b.handle(erase(Some(1024)), now);
        assert_eq!(failure_code(&reply), Some(FailureType::ProcessError));
        assert_eq!(b.state(), State::Idle);

        let data = image(1024);
        a.handle(upload(&data, Some(firmware_digest(&data))), now);
        b.handle(Initialize.into(), now);
        assert_eq!(success_text(&b.handle(erase(Some(1024)), now)), Some("Firmware erased"));
    }

    #[test]
    fn test_driver_failure_marks_unbootable() {
        let mut engine = Engine::new(
            MemoryFlash::new(CAPACITY).with_write_fault(600),
            ScriptedUi::default(),
            &SessionRegistry::new(),
        );
        let now = Instant::now();
        engine.handle(Initialize.into(), now);
        engine.handle(erase(Some(2048)), now);

        let data = image(2048);
        let reply = engine.handle(upload(&data, Some(firmware_digest(&data))), now);
        assert_eq!(failure_code(&reply), Some(FailureType::HardwareError));
        assert_eq!(
            engine.flash().image_state(),
            ImageState::Unbootable { written: 512 }
        );
    }

    #[test]
    fn test_disconnect_abandons_upload() {
        let registry = SessionRegistry::new();
        let mut engine = Engine::new(MemoryFlash::new(CAPACITY), ScriptedUi::default(), &registry);
        let now = Instant::now();
        engine.handle(Initialize.into(), now);
        engine.handle(erase(Some(4096)), now);
        engine.handle(upload(&image(700), None), now);
        assert_eq!(registry.flash_owner(), Some(engine.session_id()));

        engine.disconnect();
        assert_eq!(engine.state(), State::Idle);
        assert_eq!(registry.flash_owner(), None);
        assert_eq!(
            engine.flash().image_state(),
            ImageState::Unbootable { written: 700 }
        );
    }

    #[test]
    fn test_erase_confirmation() {
        let mut engine = initialized(&[Decision::Confirm])
            .with_config(EngineConfig::default().with_confirm_erase(true));
        let now = Instant::now();
        let reply = engine.handle(erase(Some(1024)), now);
        let Message::ButtonRequest(req) = reply else {
            panic!("expected ButtonRequest");
        };
        assert_eq!(req.code, Some(ButtonRequestType::FirmwareCheck));
        assert_eq!(engine.state(), State::EraseRequested);

        let reply = engine.handle(ButtonAck.into(), now);
        assert_eq!(success_text(&reply), Some("Firmware erased"));
        assert_eq!(engine.state(), State::ReadyForUpload);
    }

    #[test]
    fn test_declined_erase_releases_flash() {
        let registry = SessionRegistry::new();
        let mut engine = Engine::new(MemoryFlash::new(CAPACITY), ScriptedUi::default(), &registry)
            .with_config(EngineConfig::default().with_confirm_erase(true));
        let now = Instant::now();
        engine.handle(Initialize.into(), now);
        engine.handle(erase(None), now);
        assert!(registry.flash_owner().is_some());

        let reply = engine.handle(ButtonAck.into(), now);
        assert_eq!(failure_code(&reply), Some(FailureType::ActionCancelled));
        assert_eq!(registry.flash_owner(), None);
        assert_eq!(engine.state(), State::Initialized);
    }
}
