//! Assistant command interception.
//!
//! Sits in front of the transcript append path. A message whose trimmed text
//! starts with the trigger token (case-insensitive) is an assistant command:
//!
//! ```text
//! Idle --query--> Dispatching --ok--> Fulfilled --> Idle
//!                             \--err-> Failed    --> Idle
//! Idle --empty--> (prompt-for-input entry) --> Idle
//! ```
//!
//! While `Dispatching` every local submission is refused and remote triggers
//! are appended without being dispatched, so completion calls never
//! interleave. Assistant entries are local only and never published.

use crate::channel::EventChannel;
use crate::config::AssistantConfig;
use crate::error::{Result, SyncError};
use crate::gateway::{CommandRequest, CompletionGateway};
use crate::protocol::{ChannelEvent, ChatEntry, Origin, TimestampFormatter};
use crate::transcript::{Appended, TranscriptStore};

pub const APOLOGY: &str = "Sorry, I couldn't process your request at the moment.";
pub const IDLE_PLACEHOLDER: &str = "Type @ai followed by your question...";
pub const BUSY_PLACEHOLDER: &str = "AI is thinking...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Idle,
    Dispatching,
    Fulfilled,
    Failed,
}

/// Result of inspecting message text for the trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Not an assistant command.
    None,
    /// Trigger with nothing after it.
    Empty,
    Query(String),
}

/// Case-insensitive prefix match of `trigger` on the trimmed text.
pub fn parse_command(trigger: &str, text: &str) -> Command {
    let trimmed = text.trim();
    match trimmed.get(..trigger.len()) {
        Some(prefix) if !trigger.is_empty() && prefix.eq_ignore_ascii_case(trigger) => {
            let query = trimmed[trigger.len()..].trim();
            if query.is_empty() {
                Command::Empty
            } else {
                Command::Query(query.to_string())
            }
        }
        _ => Command::None,
    }
}

/// What the caller must do after a message passed through the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing further.
    None,
    /// Call the gateway with this request, then feed the result to
    /// [`CommandRouter::resolve`].
    Request(CommandRequest),
}

/// Discriminated outcome of one completion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Reply { text: String },
    Failure { error_message: String },
}

pub struct CommandRouter {
    trigger: String,
    assistant_name: String,
    formatter: TimestampFormatter,
    state: RouterState,
    inline_error: Option<String>,
}

impl CommandRouter {
    pub fn new(cfg: &AssistantConfig, formatter: TimestampFormatter) -> Self {
        Self {
            trigger: cfg.trigger.clone(),
            assistant_name: cfg.display_name.clone(),
            formatter,
            state: RouterState::Idle,
            inline_error: None,
        }
    }

    pub fn state(&self) -> RouterState {
        self.state
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    /// The submission control is disabled exactly while dispatching.
    pub fn input_disabled(&self) -> bool {
        self.state == RouterState::Dispatching
    }

    pub fn placeholder(&self) -> &'static str {
        if self.input_disabled() {
            BUSY_PLACEHOLDER
        } else {
            IDLE_PLACEHOLDER
        }
    }

    pub fn thinking_indicator(&self) -> Option<String> {
        self.input_disabled()
            .then(|| format!("{} is thinking...", self.assistant_name))
    }

    /// Error from the last failed completion, shown to this client only.
    pub fn inline_error(&self) -> Option<&str> {
        self.inline_error.as_deref()
    }

    pub fn prompt_for_input(&self) -> String {
        format!("Please provide a question after {}", self.trigger)
    }

    /// Handle a message typed by the local user.
    ///
    /// Refused with `SyncError::Busy` while dispatching. Otherwise the entry is
    /// appended and published (publish failures are logged, the local append
    /// stands), then checked for the trigger.
    pub fn submit_local(
        &mut self,
        transcript: &mut TranscriptStore,
        channel: &dyn EventChannel,
        author: &str,
        text: &str,
    ) -> Result<Dispatch> {
        if self.input_disabled() {
            return Err(SyncError::Busy);
        }
        let text = text.trim();
        if text.is_empty() {
            return Ok(Dispatch::None);
        }

        let entry = ChatEntry::new(author, text, Origin::User, self.formatter.now());
        transcript.append(entry.clone());
        if let Err(e) = channel.publish(ChannelEvent::SendMessage { message: entry }) {
            tracing::warn!(error = %e, "message kept locally, broadcast failed");
        }
        Ok(self.begin(transcript, text))
    }

    /// Handle a message delivered by another participant.
    ///
    /// Every observer evaluates triggers independently, so with N connected
    /// participants a broadcast command is answered N times (once in each
    /// transcript). Duplicates and assistant-origin entries never dispatch.
    pub fn observe_remote(&mut self, transcript: &mut TranscriptStore, entry: ChatEntry) -> Dispatch {
        let text = entry.body.clone();
        let from_user = entry.origin == Origin::User;
        if transcript.append(entry) == Appended::Duplicate || !from_user {
            return Dispatch::None;
        }
        if self.input_disabled() {
            if parse_command(&self.trigger, &text) != Command::None {
                tracing::debug!("remote assistant command not dispatched, request already pending");
            }
            return Dispatch::None;
        }
        self.begin(transcript, &text)
    }

    fn begin(&mut self, transcript: &mut TranscriptStore, text: &str) -> Dispatch {
        match parse_command(&self.trigger, text) {
            Command::None => Dispatch::None,
            Command::Empty => {
                tracing::debug!(error = %SyncError::EmptyCommand, "prompting for input");
                let prompt = self.prompt_for_input();
                self.append_assistant(transcript, prompt);
                Dispatch::None
            }
            Command::Query(query) => {
                self.transition(RouterState::Dispatching);
                self.inline_error = None;
                Dispatch::Request(CommandRequest::new(query))
            }
        }
    }

    /// Convert a completion result into a transcript entry and return to Idle.
    ///
    /// Late results are still appended; there is no fencing.
    pub fn resolve(&mut self, transcript: &mut TranscriptStore, result: Result<String>) -> CommandOutcome {
        if self.state != RouterState::Dispatching {
            tracing::debug!(state = ?self.state, "accepting completion outside dispatch");
        }
        let outcome = match result {
            Ok(text) => {
                self.transition(RouterState::Fulfilled);
                self.inline_error = None;
                self.append_assistant(transcript, text.clone());
                CommandOutcome::Reply { text }
            }
            Err(e) => {
                tracing::warn!(error = %e, "assistant unavailable, posting apology");
                self.transition(RouterState::Failed);
                let error_message = e.inline_message();
                self.inline_error = Some(error_message.clone());
                self.append_assistant(transcript, APOLOGY.to_string());
                CommandOutcome::Failure { error_message }
            }
        };
        self.transition(RouterState::Idle);
        outcome
    }

    /// Drop an abandoned request without touching the transcript.
    pub fn cancel(&mut self) {
        if self.state == RouterState::Dispatching {
            self.transition(RouterState::Idle);
        }
    }

    /// Dispatch and resolve in one step, awaiting the gateway inline.
    pub async fn run_request(
        &mut self,
        transcript: &mut TranscriptStore,
        gateway: &dyn CompletionGateway,
        request: &CommandRequest,
    ) -> CommandOutcome {
        let result = gateway.complete(request).await;
        self.resolve(transcript, result)
    }

    fn append_assistant(&self, transcript: &mut TranscriptStore, body: String) {
        let entry = ChatEntry::new(self.assistant_name.as_str(), body, Origin::Assistant, self.formatter.now());
        transcript.append(entry);
    }

    fn transition(&mut self, to: RouterState) {
        tracing::debug!(from = ?self.state, to = ?to, "router transition");
        self.state = to;
    }
}
