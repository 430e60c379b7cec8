//! The fan-out coordinator: channel registry, registration intake, and the
//! response notifier.

mod executor;
mod state;


pub use state::ChannelSnapshot;
pub(crate) use state::{AgentRegistration, ChannelState, PendingRound};

use crate::config::FanOutConfig;
use crate::turn::AgentProcessor;
use crate::{AgentId, ChannelId, MessageId};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;

/// Everything the host supplies when one of its agents wants to react to a
/// shared channel message.
pub struct FanOutRegistration<C> {
    pub channel_id: ChannelId,
    /// Id of the message the agent is reacting to. Registrations for the
    /// same message id are pooled into one round.
    pub message_id: MessageId,
    pub account_id: AgentId,
    /// Chat-level id of this agent's bot user; used for mention matching and
    /// trigger self-exclusion.
    pub bot_user_id: String,
    /// Bot user id of the triggering message's author, when a bot wrote it.
    /// An agent whose own bot id matches sits out the first round.
    pub trigger_bot_user_id: Option<String>,
    /// Text of the triggering message. The first registration that carries
    /// one wins; a round with no text gets a placeholder.
    pub trigger_text: Option<String>,
    /// Bot ids explicitly mentioned in the trigger, in mention order.
    pub mentioned_user_ids: Vec<String>,
    /// Opaque preflight context handed back to `process_message` each turn.
    pub ctx: C,
    pub process_message: AgentProcessor<C>,
    /// Per-channel round ceiling override; the last-seen value wins.
    pub max_rounds: Option<u32>,
}

type SilentReplyPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub(crate) struct CoordinatorInner<C> {
    pub channels: Mutex<HashMap<ChannelId, Arc<Mutex<ChannelState<C>>>>>,
    pub config: FanOutConfig,
    /// Injected randomness source behind every ordering shuffle.
    pub rng: StdMutex<Box<dyn RngCore + Send>>,
    /// Host predicate deciding whether a reply text is the silent-reply
    /// sentinel and therefore counts as no response.
    pub is_silent_reply: SilentReplyPredicate,
}

/// Per-channel scheduler that serializes agent reactions to shared messages.
///
/// One inbound message can make several independent bot processes want to
/// reply at once. Each of them registers with the coordinator instead of
/// replying directly; the coordinator collects registrations for a short
/// window, then runs the agents one at a time so each sees the replies of
/// those that went before it, chaining follow-on rounds until nobody has
/// anything new to react to.
///
/// Cheap to clone; all clones share the same channel registry. Channels
/// never interact: work on one channel runs concurrently with any other.
pub struct Coordinator<C> {
    inner: Arc<CoordinatorInner<C>>,
}

impl<C> Clone for Coordinator<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> std::fmt::Debug for Coordinator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").finish_non_exhaustive()
    }
}

/// Builder for a [`Coordinator`].
pub struct CoordinatorBuilder<C> {
    config: FanOutConfig,
    rng: Option<Box<dyn RngCore + Send>>,
    is_silent_reply: Option<SilentReplyPredicate>,
    _ctx: PhantomData<fn() -> C>,
}

impl<C: Clone + Send + Sync + 'static> CoordinatorBuilder<C> {
    pub fn config(mut self, config: FanOutConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the randomness source behind ordering shuffles. Tests inject
    /// a seeded rng for deterministic orders.
    pub fn rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Some(Box::new(rng));
        self
    }

    /// Predicate from the host's token layer deciding whether a reply text
    /// is the silent-reply sentinel. The default accepts everything, so only
    /// empty or absent text counts as silence.
    pub fn silent_reply_predicate(
        mut self,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_silent_reply = Some(Arc::new(predicate));
        self
    }

    pub fn build(self) -> Coordinator<C> {
        Coordinator {
            inner: Arc::new(CoordinatorInner {
                channels: Mutex::new(HashMap::new()),
                config: self.config,
                rng: StdMutex::new(
                    self.rng
                        .unwrap_or_else(|| Box::new(StdRng::from_os_rng())),
                ),
                is_silent_reply: self.is_silent_reply.unwrap_or_else(|| Arc::new(|_| false)),
            }),
        }
    }
}

impl<C: Clone + Send + Sync + 'static> Default for Coordinator<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clone + Send + Sync + 'static> Coordinator<C> {
    /// A coordinator with default thresholds, OS randomness, and no silent
    /// reply sentinel.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> CoordinatorBuilder<C> {
        CoordinatorBuilder {
            config: FanOutConfig::default(),
            rng: None,
            is_silent_reply: None,
            _ctx: PhantomData,
        }
    }

    /// Register one agent's intent to react to `message_id` in its channel.
    ///
    /// Registrations for the same message are pooled until the collection
    /// window closes; a registration for a newer message supersedes a round
    /// still collecting; registrations arriving while a round is processing
    /// are queued and drained when the round finishes.
    ///
    /// Always returns `true`: the coordinator owns processing of the event
    /// from here on and the caller must not respond independently.
    pub async fn register_agent(&self, registration: FanOutRegistration<C>) -> bool {
        let FanOutRegistration {
            channel_id,
            message_id,
            account_id,
            bot_user_id,
            trigger_bot_user_id,
            trigger_text,
            mentioned_user_ids,
            ctx,
            process_message,
            max_rounds,
        } = registration;

        let skip_first_round = trigger_bot_user_id.as_deref() == Some(bot_user_id.as_str());
        let entry = AgentRegistration {
            account_id: account_id.clone(),
            bot_user_id,
            ctx,
            processor: process_message,
            skip_first_round,
        };

        let state = self.get_or_create(&channel_id, max_rounds).await;
        let mut st = state.lock().await;

        if let Some(pending) = st.pending_round.as_mut()
            && pending.trigger_message_id == message_id
        {
            // Same trigger: pool the registration, keep the existing window.
            if pending.contains(&account_id) {
                tracing::debug!(
                    channel_id = %channel_id,
                    account_id = %account_id,
                    "duplicate registration ignored"
                );
            } else {
                if pending.trigger_text.is_none() {
                    pending.trigger_text = trigger_text;
                }
                pending.registrations.push(entry);
                tracing::debug!(
                    channel_id = %channel_id,
                    account_id = %account_id,
                    agents = pending.registrations.len(),
                    "agent joined pending round"
                );
            }
            return true;
        }

        // A newer trigger supersedes any round still collecting. While a
        // round is processing the new round waits: its timer fire is a no-op
        // and the executor drains it on completion.
        if let Some(mut stale) = st.pending_round.take() {
            stale.cancel_timer();
            tracing::debug!(
                channel_id = %channel_id,
                superseded = %stale.trigger_message_id,
                trigger = %message_id,
                "pending round superseded by newer trigger message"
            );
        }

        tracing::info!(
            channel_id = %channel_id,
            trigger = %message_id,
            account_id = %account_id,
            queued = st.is_processing,
            "collection window opened"
        );

        st.pending_round = Some(PendingRound {
            trigger_message_id: message_id,
            trigger_text,
            registrations: vec![entry],
            mentioned_bot_ids: mentioned_user_ids,
            collection_timer: Some(self.arm_collection_timer(channel_id)),
        });
        true
    }

    /// Report what an agent said for its awaited turn, or `None` for
    /// explicit silence.
    ///
    /// This is the only way the host's delivery pipeline informs the
    /// coordinator of outcomes. Late arrivals (after the response timeout)
    /// and unknown channels are dropped without effect.
    pub async fn notify_response(
        &self,
        channel_id: &str,
        account_id: &str,
        response_text: Option<String>,
    ) {
        let Some(state) = self.channel(channel_id).await else {
            tracing::debug!(channel_id, account_id, "response for unknown channel dropped");
            return;
        };

        let callback = state.lock().await.response_callbacks.remove(account_id);
        match callback {
            Some(resolver) => {
                // Send only fails if the executor stopped waiting, in which
                // case there is nothing left to do.
                let _ = resolver.send(response_text);
            }
            None => {
                tracing::debug!(channel_id, account_id, "late or unmatched response dropped");
            }
        }
    }

    /// Whether a fan-out round is currently executing on the channel. Hosts
    /// use this to gate their own parallel handling.
    pub async fn is_round_active(&self, channel_id: &str) -> bool {
        match self.channel(channel_id).await {
            Some(state) => state.lock().await.is_processing,
            None => false,
        }
    }

    /// Point-in-time view of a channel's round counter, processing flag, and
    /// conversation log. `None` if the channel has never registered anyone.
    pub async fn channel_snapshot(&self, channel_id: &str) -> Option<ChannelSnapshot> {
        let state = self.channel(channel_id).await?;
        let st = state.lock().await;
        Some(ChannelSnapshot {
            current_round: st.current_round,
            is_processing: st.is_processing,
            messages: st.conversation.messages().to_vec(),
        })
    }

    /// Abort any armed collection timer and drop the channel's state.
    ///
    /// A round already executing keeps its own handle on the state and runs
    /// to completion against the detached entry.
    pub async fn reset_channel(&self, channel_id: &str) {
        let removed = self.inner.channels.lock().await.remove(channel_id);
        if let Some(state) = removed {
            let mut st = state.lock().await;
            if let Some(mut pending) = st.pending_round.take() {
                pending.cancel_timer();
            }
            st.response_callbacks.clear();
            tracing::info!(channel_id, "channel state reset");
        }
    }

    async fn get_or_create(
        &self,
        channel_id: &ChannelId,
        max_rounds: Option<u32>,
    ) -> Arc<Mutex<ChannelState<C>>> {
        let state = {
            let mut channels = self.inner.channels.lock().await;
            channels
                .entry(channel_id.clone())
                .or_insert_with(|| {
                    tracing::debug!(channel_id = %channel_id, "channel state created");
                    Arc::new(Mutex::new(ChannelState::new(
                        self.inner.config.default_max_rounds,
                    )))
                })
                .clone()
        };

        if let Some(limit) = max_rounds {
            state.lock().await.round_limit = limit.max(1);
        }
        state
    }

    pub(crate) async fn channel(&self, channel_id: &str) -> Option<Arc<Mutex<ChannelState<C>>>> {
        self.inner.channels.lock().await.get(channel_id).cloned()
    }

    fn arm_collection_timer(&self, channel_id: ChannelId) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        let window = self.inner.config.collection_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            coordinator.on_collection_window_elapsed(channel_id).await;
        })
    }

    pub(crate) fn shuffle(&self, items: &mut [usize]) {
        let mut rng = self
            .inner
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        crate::shuffle::fisher_yates(items, &mut **rng);
    }
}
