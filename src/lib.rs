//! Turn-taking coordination for multi-agent chat channels.
//!
//! When several independent bots share one channel, a single inbound message
//! reaches every bot at the same time through its own event source. Left
//! alone they would all answer at once against a stale view of the
//! conversation. `chorus` collects the bots that want to react inside a short
//! window, then releases them one at a time so each sees what the previous
//! ones said, chaining follow-on rounds until the conversation converges.

pub mod config;
pub mod conversation;
pub mod error;
pub mod fanout;
pub mod shuffle;
pub mod turn;

use std::sync::Arc;

/// Opaque agent (account) identifier.
pub type AgentId = Arc<str>;
/// Opaque chat channel identifier.
pub type ChannelId = Arc<str>;
/// Opaque chat message identifier.
pub type MessageId = Arc<str>;

pub use config::{
    AGENT_COLLECTION_WINDOW, AGENT_RESPONSE_TIMEOUT, DEFAULT_MAX_ROUNDS, FanOutConfig,
};
pub use conversation::{ConversationLog, ConversationMessage, Speaker};
pub use error::{FanOutError, Result};
pub use fanout::{ChannelSnapshot, Coordinator, CoordinatorBuilder, FanOutRegistration};
pub use turn::{AgentProcessor, FANOUT_GUIDANCE, FanOutTurn, ProcessFuture, RoundInfo, processor};
