//! voicedesk - Realtime voice assistant front-end for hosted speech models
//!
//! This library provides the core functionality for voicedesk:
//! - Microphone capture, PCM encoding and gapless playback
//! - The realtime session protocol and its WebSocket transport
//! - The session controller state machine
//! - Tool-call actions with email drafts and spreadsheet sync
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      CLI / meter                     │
//! └────────────────────┬────────────────────────────────┘
//!                      │ commands, status
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Session controller                   │
//! │   Capture  │  Codec  │  Playback  │  Tool dispatch  │
//! └─────────┬──────────────────────────────┬────────────┘
//!           │                              │ actions
//! ┌─────────▼──────────┐        ┌──────────▼────────────┐
//! │  Realtime session  │        │  Notifier / webhook   │
//! └────────────────────┘        └───────────────────────┘
//! ```

pub mod actions;
pub mod config;
pub mod error;
pub mod live;
pub mod prompt;
pub mod session;
pub mod voice;

pub use actions::{ActionEvent, ActionKind, ActionLog, ActionStatus, EmailDraft, Notifier};
pub use config::Config;
pub use error::{Error, Result};
pub use live::{Connector, LiveConnection, ServerEvent, ToolInvocation, WsConnector};
pub use session::{Command, ConnectionState, SessionController, SessionStatus};
pub use voice::{AudioBackend, CpalBackend, MeterState, PcmPacket};
