//! Per-channel scheduler state.

use crate::conversation::{ConversationLog, ConversationMessage};
use crate::turn::AgentProcessor;
use crate::{AgentId, MessageId};

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::oneshot;

/// One agent's participation in a pending round.
pub(crate) struct AgentRegistration<C> {
    pub account_id: AgentId,
    /// Chat-level bot id, matched against trigger mentions.
    pub bot_user_id: String,
    /// Opaque preflight context cloned into each turn.
    pub ctx: C,
    pub processor: AgentProcessor<C>,
    /// True iff this agent authored the triggering message; it sits out
    /// round 1 so it does not react to itself.
    pub skip_first_round: bool,
}

/// An in-progress collection of registrations for one trigger message.
pub(crate) struct PendingRound<C> {
    pub trigger_message_id: MessageId,
    /// Trigger text captured from the first registration that carried one.
    pub trigger_text: Option<String>,
    /// Deduplicated by account id at intake.
    pub registrations: Vec<AgentRegistration<C>>,
    /// Bot ids mentioned in the trigger, in mention order.
    pub mentioned_bot_ids: Vec<String>,
    /// Armed collection timer, aborted on every path that discards the round.
    pub collection_timer: Option<tokio::task::JoinHandle<()>>,
}

impl<C> PendingRound<C> {
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.collection_timer.take() {
            timer.abort();
        }
    }

    pub fn contains(&self, account_id: &str) -> bool {
        self.registrations
            .iter()
            .any(|registration| registration.account_id.as_ref() == account_id)
    }
}

/// Singleton per-channel scheduler state. Lives behind one async lock that
/// is only ever held between suspension points.
pub(crate) struct ChannelState<C> {
    /// 1-based while a conversation is in progress; 0 otherwise.
    pub current_round: u32,
    /// True while the executor owns the channel.
    pub is_processing: bool,
    /// At most one round waiting for its window, or queued during processing.
    pub pending_round: Option<PendingRound<C>>,
    /// Agents that produced non-silent replies in the previous round; they
    /// go first in the next chained round.
    pub previous_round_responders: HashSet<AgentId>,
    pub round_limit: u32,
    /// One-shot resolvers for the agents currently awaited, keyed by account.
    pub response_callbacks: HashMap<AgentId, oneshot::Sender<Option<String>>>,
    pub conversation: ConversationLog,
}

impl<C> ChannelState<C> {
    pub fn new(round_limit: u32) -> Self {
        Self {
            current_round: 0,
            is_processing: false,
            pending_round: None,
            previous_round_responders: HashSet::new(),
            round_limit,
            response_callbacks: HashMap::new(),
            conversation: ConversationLog::new(),
        }
    }
}

/// Point-in-time view of a channel for hosts and tests.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    /// 1-based while a conversation is in progress; 0 otherwise.
    pub current_round: u32,
    pub is_processing: bool,
    pub messages: Vec<ConversationMessage>,
}
