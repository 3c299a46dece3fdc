//! Real-time synchronization core for collaborative rooms.
//!
//! Participants share a chat transcript and an editable document through a
//! relay hub. A chat line starting with `@ai` is routed to an external
//! completion service and the answer is appended to the asker's transcript.
//!
//! ## Modules
//! - [`session`]: one participant, wiring every component into a single event loop
//! - [`router`]: `@ai` command interception and its state machine
//! - [`transcript`]: append-only chat log with duplicate suppression
//! - [`document`]: last-write-wins document state and peer cursors
//! - [`presence`]: debounced typing-start / typing-pause signals
//! - [`channel`]: event transport (WebSocket client and in-process hub)
//! - [`hub`]: the relay server
//! - [`gateway`]: completion service adapters

pub mod channel;
pub mod cli;
pub mod config;
pub mod document;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod session;
pub mod transcript;

pub use channel::{EventChannel, LoopbackHub, WsChannel};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use gateway::{CommandRequest, CompletionGateway, HttpGateway, Provider};
pub use protocol::{ChannelEvent, ChatEntry, DocumentSnapshot, Envelope, Origin};
pub use session::{SessionUpdate, SyncSession};
