//! Mapping of request outcomes to response messages.

use crate::device::ui::Prompt;
use crate::error::SessionError;
use crate::protocol::bounded::BoundedString;
use crate::protocol::message::{
    ButtonRequest, Failure, Features, FirmwareUpload, Message, Success, TEXT_MAX, Text,
};

/// Result of one accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Request done.
    Success(Option<Text>),
    /// Device identity.
    Features(Box<Features>),
    /// Read-back data.
    Payload(FirmwareUpload),
    /// User confirmation needed before the request can finish.
    NeedsConfirmation(Prompt),
    /// Request failed.
    Failed(SessionError),
}

impl Outcome {
    /// Success with a fixed text.
    pub fn success(message: &str) -> Self {
        Self::Success(Some(text(message)))
    }

    /// Build the single response message for this outcome.
    pub fn into_message(self) -> Message {
        match self {
            Self::Success(message) => Message::Success(Success { message }),
            Self::Features(features) => Message::Features(features),
            Self::Payload(upload) => Message::FirmwareUpload(upload),
            Self::NeedsConfirmation(prompt) => Message::ButtonRequest(ButtonRequest {
                code: Some(prompt.kind),
                data: (!prompt.text.is_empty()).then(|| text(&prompt.text)),
            }),
            Self::Failed(err) => Message::Failure(Failure {
                code: Some(err.failure_type()),
                message: Some(text(&err.to_string())),
            }),
        }
    }
}

impl From<SessionError> for Outcome {
    fn from(err: SessionError) -> Self {
        Self::Failed(err)
    }
}

/// Marks a text field that was cut short.
const ELLIPSIS: &str = "…";

/// Build a text field. Text that does not fit is cut at a character boundary
/// and ends with an ellipsis.
pub fn text(s: &str) -> Text {
    if s.len() <= TEXT_MAX {
        return BoundedString::try_from(s).unwrap_or_default();
    }
    let mut end = TEXT_MAX - ELLIPSIS.len();
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    BoundedString::try_from(format!("{}{ELLIPSIS}", &s[..end]).as_str()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{ButtonRequestType, FailureType};

    #[test]
    fn test_failure_message() {
        let msg = Outcome::Failed(SessionError::FirmwareMismatch).into_message();
        let Message::Failure(failure) = msg else {
            panic!("expected Failure");
        };
        assert_eq!(failure.code, Some(FailureType::FirmwareMismatch));
        assert_eq!(failure.message.as_deref(), Some("Firmware hash mismatch"));
    }

    #[test]
    fn test_button_request_message() {
        let prompt = Prompt::new(ButtonRequestType::PinEntry, "");
        let Message::ButtonRequest(req) = Outcome::NeedsConfirmation(prompt).into_message() else {
            panic!("expected ButtonRequest");
        };
        assert_eq!(req.code, Some(ButtonRequestType::PinEntry));
        assert_eq!(req.data, None);
    }

    #[test]
    fn test_success_without_message() {
        assert_eq!(
            Outcome::Success(None).into_message(),
            Message::Success(Success { message: None })
        );
    }

    #[test]
    fn test_long_text_shortened_on_char_boundary() {
        let long = "é".repeat(200);
        let t = text(&long);
        assert!(t.len() <= TEXT_MAX);
        assert!(t.ends_with(ELLIPSIS));
        assert_eq!(t.trim_end_matches(ELLIPSIS), "é".repeat(126));
    }

    #[test]
    fn test_text_at_limit_is_kept() {
        let exact = "a".repeat(TEXT_MAX);
        assert_eq!(text(&exact).as_str(), exact);
        assert_eq!(text("ok").as_str(), "ok");
    }

    #[test]
    fn test_long_reply_text_is_marked() {
        let msg = Outcome::Success(Some(text(&"x".repeat(TEXT_MAX + 1)))).into_message();
        let Message::Success(Success { message: Some(m) }) = msg else {
            panic!("expected Success with text");
        };
        assert_eq!(m.len(), TEXT_MAX);
        assert!(m.starts_with(&"x".repeat(TEXT_MAX - ELLIPSIS.len())));
        assert!(m.ends_with(ELLIPSIS));
    }
}
