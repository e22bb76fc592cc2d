//! User-confirmation collaborator.
//!
//! When the engine needs a confirmation it shows a [`Prompt`] as soon as the
//! ButtonRequest goes out, and asks for a [`Decision`] once the host's
//! ButtonAck arrives.

use std::collections::VecDeque;

use log::info;

use crate::protocol::message::ButtonRequestType;

/// What the device asks the user to confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Confirmation kind, as sent in the ButtonRequest.
    pub kind: ButtonRequestType,
    /// Text shown to the user.
    pub text: String,
}

impl Prompt {
    /// Create a prompt.
    pub fn new(kind: ButtonRequestType, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// User answer to a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// User confirmed.
    Confirm,
    /// User declined.
    Decline,
}

/// Display and input of the device.
pub trait UserInterface: Send {
    /// Render a confirmation prompt.
    fn show(&mut self, prompt: &Prompt);

    /// Obtain the user's decision for the prompt currently shown.
    fn decide(&mut self, prompt: &Prompt) -> Decision;

    /// Remove any prompt from the display.
    fn clear(&mut self) {}
}

impl<U: UserInterface + ?Sized> UserInterface for Box<U> {
    fn show(&mut self, prompt: &Prompt) {
        (**self).show(prompt);
    }

    fn decide(&mut self, prompt: &Prompt) -> Decision {
        (**self).decide(prompt)
    }

    fn clear(&mut self) {
        (**self).clear();
    }
}

/// Confirms everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

impl UserInterface for AutoConfirm {
    fn show(&mut self, prompt: &Prompt) {
        info!("Auto-confirming {:?}: {}", prompt.kind, prompt.text);
    }

    fn decide(&mut self, _prompt: &Prompt) -> Decision {
        Decision::Confirm
    }
}

/// Answers from a fixed script and records what was shown.
///
/// Once the script runs out every prompt is declined.
#[derive(Debug, Default, Clone)]
pub struct ScriptedUi {
    answers: VecDeque<Decision>,
    shown: Vec<Prompt>,
}

impl ScriptedUi {
    /// Create a UI that answers with `answers` in order.
    pub fn new(answers: impl IntoIterator<Item = Decision>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            shown: Vec::new(),
        }
    }

    /// Prompts shown so far.
    pub fn shown(&self) -> &[Prompt] {
        &self.shown
    }
}

impl UserInterface for ScriptedUi {
    fn show(&mut self, prompt: &Prompt) {
        self.shown.push(prompt.clone());
    }

    fn decide(&mut self, _prompt: &Prompt) -> Decision {
        self.answers.pop_front().unwrap_or(Decision::Decline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_ui_runs_out() {
        let mut ui = ScriptedUi::new([Decision::Confirm]);
        let prompt = Prompt::new(ButtonRequestType::Confirm, "Ping?");
        ui.show(&prompt);
        assert_eq!(ui.decide(&prompt), Decision::Confirm);
        assert_eq!(ui.decide(&prompt), Decision::Decline);
        assert_eq!(ui.shown(), &[prompt]);
    }

    #[test]
    fn test_auto_confirm() {
        let mut ui: Box<dyn UserInterface> = Box::new(AutoConfirm);
        let prompt = Prompt::new(ButtonRequestType::FirmwareCheck, "Erase?");
        ui.show(&prompt);
        assert_eq!(ui.decide(&prompt), Decision::Confirm);
    }
}
