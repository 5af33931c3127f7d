//! Prompt assembly: system prompt, per-iteration observation, and the bounded
//! conversation transcript.

use std::collections::VecDeque;

use roamer_hal::CameraFrame;

use crate::command::CommandRegistry;
use crate::llm_driver::ChatMessage;

/// Behavioral prompt used when the configuration does not supply one.
pub const DEFAULT_BEHAVIOR_PROMPT: &str = "\
You are a small, curious robot exploring the room in front of you. Each turn \
you receive a photo from your camera and decide on exactly one action.

- Observe first. Comment on new or interesting things you see.
- Talk to people you notice; greet them or ask a question.
- Announce where you are going before you drive, and move in short steps.
- If the path looks blocked or unsafe, stop and look around instead.
- Ask for a fresh photo when you are unsure what changed.
- Stop autonomous mode when you are done, stuck, or asked to stop.";

const GRAMMAR_RULES: &str = "\
Respond with ONLY ONE command string per turn, exactly in the form NAME(arg1, arg2, ...). \
No other text. String arguments may be quoted and must not contain commas.";

/// Messages kept from earlier turns by default (5 exchanges).
pub const DEFAULT_TRANSCRIPT_WINDOW: usize = 10;

/// Full system prompt: behavior, grammar rules, and the live command catalog.
pub fn system_prompt(behavior: Option<&str>, registry: &CommandRegistry) -> String {
    format!(
        "{}\n\n## Commands\n{}\n\n{}",
        behavior.unwrap_or(DEFAULT_BEHAVIOR_PROMPT),
        GRAMMAR_RULES,
        registry.catalog()
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Observation
// ─────────────────────────────────────────────────────────────────────────────

/// What the loop saw this iteration.
#[derive(Debug, Clone)]
pub enum Observation {
    Frame(CameraFrame),
    CaptureFailed,
}

impl Observation {
    /// The user turn for this observation. The frame is attached only when
    /// the model accepts images.
    pub fn to_message(&self, model_supports_images: bool) -> ChatMessage {
        match self {
            Observation::Frame(frame) if model_supports_images => ChatMessage::user_with_image(
                "Current view is attached. What is the next command?",
                frame,
            ),
            Observation::Frame(_) => ChatMessage::user(
                "No image is available for this model. What is the next command, \
                 based on earlier turns or general knowledge?",
            ),
            Observation::CaptureFailed => ChatMessage::user(
                "The camera failed to capture an image. What is the next command, \
                 based on earlier turns or general knowledge?",
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transcript
// ─────────────────────────────────────────────────────────────────────────────

/// Trailing window of earlier turns, text only.
///
/// Images are never retained; each request carries at most the current frame.
#[derive(Debug, Clone)]
pub struct Transcript {
    window: usize,
    history: VecDeque<ChatMessage>,
}

impl Transcript {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            history: VecDeque::with_capacity(window),
        }
    }

    /// Record one completed exchange.
    pub fn record(&mut self, user: &ChatMessage, reply: &str) {
        self.push(ChatMessage::user(user.text()));
        self.push(ChatMessage::assistant(reply));
    }

    fn push(&mut self, message: ChatMessage) {
        if self.window == 0 {
            return;
        }
        while self.history.len() >= self.window {
            self.history.pop_front();
        }
        self.history.push_back(message);
    }

    /// `system`, then history, then `current`.
    pub fn request(&self, system: &str, current: ChatMessage) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(self.history.iter().cloned());
        messages.push(current);
        messages
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSCRIPT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_driver::Role;

    #[test]
    fn system_prompt_embeds_catalog() {
        let registry = CommandRegistry::builtin();
        let prompt = system_prompt(None, &registry);
        assert!(prompt.starts_with(DEFAULT_BEHAVIOR_PROMPT));
        assert!(prompt.contains("CMD_STOP_AUTONOMOUS_MODE()"));
        assert!(prompt.contains("durationMs: int"));

        let custom = system_prompt(Some("Be brief."), &registry);
        assert!(custom.starts_with("Be brief."));
        assert!(custom.contains("CMD_SAY_TEXT(textToSay: string)"));
    }

    #[test]
    fn observation_variants() {
        let frame = Observation::Frame(CameraFrame::jpeg(vec![1, 2, 3]));
        assert!(frame.to_message(true).has_image());
        assert!(!frame.to_message(false).has_image());
        assert!(frame.to_message(false).text().contains("No image"));

        let failed = Observation::CaptureFailed.to_message(true);
        assert!(!failed.has_image());
        assert!(failed.text().contains("failed to capture"));
    }

    #[test]
    fn transcript_drops_images_and_keeps_order() {
        let mut transcript = Transcript::default();
        let current = Observation::Frame(CameraFrame::jpeg(vec![1])).to_message(true);
        transcript.record(&current, "CMD_MOVE_HEAD(0.5)");

        let request = transcript.request("sys", ChatMessage::user("again"));
        assert_eq!(request.len(), 4);
        assert_eq!(request[0].role, Role::System);
        assert_eq!(request[1].role, Role::User);
        assert!(!request[1].has_image());
        assert_eq!(request[2], ChatMessage::assistant("CMD_MOVE_HEAD(0.5)"));
        assert_eq!(request[3], ChatMessage::user("again"));
    }

    #[test]
    fn transcript_is_bounded() {
        let mut transcript = Transcript::new(4);
        for i in 0..10 {
            transcript.record(&ChatMessage::user(format!("turn {i}")), &format!("reply {i}"));
        }
        assert_eq!(transcript.len(), 4);
        let request = transcript.request("sys", ChatMessage::user("now"));
        assert_eq!(request[1].text(), "turn 8");
        assert_eq!(request[4].text(), "reply 9");
    }

    #[test]
    fn zero_window_keeps_nothing() {
        let mut transcript = Transcript::new(0);
        transcript.record(&ChatMessage::user("x"), "y");
        assert!(transcript.is_empty());
    }
}
