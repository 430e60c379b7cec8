//! The round state machine: ordering, serial invocation, chaining.

use super::{AgentRegistration, ChannelState, Coordinator, PendingRound};
use crate::conversation::Speaker;
use crate::turn::FanOutTurn;
use crate::{AgentId, ChannelId};

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};

/// Placeholder appended when a trigger arrives with no usable text.
const MISSING_TRIGGER_TEXT: &str = "(trigger message)";

/// What the executor does after finishing one round.
enum NextStep<C> {
    /// Chain straight into another round with the same registrations.
    Chain,
    /// Run a queued pending round (a new trigger arrived meanwhile).
    Queued(PendingRound<C>),
    /// Conversation over; the channel is released.
    Stop,
}

impl<C: Clone + Send + Sync + 'static> Coordinator<C> {
    /// Entry point fired by the collection timer.
    ///
    /// If the channel is already processing, the queued round stays in place
    /// and the running executor drains it when the conversation allows.
    pub(crate) async fn on_collection_window_elapsed(&self, channel_id: ChannelId) {
        let Some(state) = self.channel(&channel_id).await else {
            return;
        };

        let pending = {
            let mut st = state.lock().await;
            if st.is_processing {
                tracing::debug!(
                    channel_id = %channel_id,
                    "collection window closed during processing, round stays queued"
                );
                return;
            }
            let Some(mut pending) = st.pending_round.take() else {
                return;
            };
            // The fired timer is this very task; dropping the handle detaches
            // it instead of aborting ourselves.
            pending.collection_timer.take();
            st.is_processing = true;
            pending
        };

        self.run_rounds(&channel_id, &state, pending).await;
    }

    /// Drive rounds until the conversation terminates, absorbing queued
    /// trigger messages along the way. The processing flag stays owned by
    /// this call for the whole loop.
    async fn run_rounds(
        &self,
        channel_id: &ChannelId,
        state: &Arc<Mutex<ChannelState<C>>>,
        mut pending: PendingRound<C>,
    ) {
        loop {
            let responders = self.execute_round(channel_id, state, &pending).await;

            let next = {
                let mut st = state.lock().await;
                self.plan_next_round(channel_id, &mut st, &pending, responders)
            };

            match next {
                NextStep::Chain => {}
                NextStep::Queued(queued) => pending = queued,
                NextStep::Stop => break,
            }
        }
    }

    /// Run one round: order the ready agents and give each a serial turn.
    /// Returns the accounts that produced non-silent replies.
    #[tracing::instrument(skip_all, fields(channel_id = %channel_id, trigger = %pending.trigger_message_id))]
    async fn execute_round(
        &self,
        channel_id: &ChannelId,
        state: &Arc<Mutex<ChannelState<C>>>,
        pending: &PendingRound<C>,
    ) -> HashSet<AgentId> {
        // Open the round and fix the invocation order without yielding.
        let (round, order) = {
            let mut st = state.lock().await;
            st.current_round += 1;
            let round = st.current_round;

            if round == 1 {
                st.conversation.reset();
                let trigger = pending
                    .trigger_text
                    .clone()
                    .unwrap_or_else(|| MISSING_TRIGGER_TEXT.to_string());
                st.conversation.append(Speaker::Human, trigger);
            }

            // Agents with nothing new sit this round out.
            let mut ready = Vec::new();
            let mut skipped = 0usize;
            for (position, registration) in pending.registrations.iter().enumerate() {
                if st.conversation.has_unseen(&registration.account_id) {
                    ready.push(position);
                } else {
                    skipped += 1;
                    tracing::debug!(
                        channel_id = %channel_id,
                        account_id = %registration.account_id,
                        round,
                        "agent has no new messages, skipped"
                    );
                }
            }

            let order = if round == 1 {
                self.order_first_round(pending, ready)
            } else {
                self.order_chained_round(pending, ready, &st.previous_round_responders)
            };

            tracing::info!(
                channel_id = %channel_id,
                round,
                agents = order.len(),
                skipped,
                "fan-out round started"
            );
            (round, order)
        };

        let mut responders = HashSet::new();
        for position in order {
            let registration = &pending.registrations[position];
            if registration.skip_first_round && round == 1 {
                tracing::debug!(
                    channel_id = %channel_id,
                    account_id = %registration.account_id,
                    "trigger agent sits out the first round"
                );
                continue;
            }
            if self.run_turn(channel_id, state, registration, round).await {
                responders.insert(registration.account_id.clone());
            }
        }

        tracing::info!(
            channel_id = %channel_id,
            round,
            responders = responders.len(),
            "fan-out round finished"
        );
        responders
    }

    /// Round 1 order: mentioned bots first, in mention order; the rest in
    /// uniformly random order.
    fn order_first_round(&self, pending: &PendingRound<C>, ready: Vec<usize>) -> Vec<usize> {
        let mention_rank = |position: usize| {
            let bot = &pending.registrations[position].bot_user_id;
            pending
                .mentioned_bot_ids
                .iter()
                .position(|mentioned| mentioned == bot)
        };

        let (mut mentioned, mut rest): (Vec<usize>, Vec<usize>) = ready
            .into_iter()
            .partition(|position| mention_rank(*position).is_some());
        mentioned.sort_by_key(|position| mention_rank(*position).unwrap_or(usize::MAX));
        self.shuffle(&mut rest);

        mentioned.extend(rest);
        mentioned
    }

    /// Chained order: previous-round responders first, shuffled among
    /// themselves, then the rest shuffled after.
    fn order_chained_round(
        &self,
        pending: &PendingRound<C>,
        ready: Vec<usize>,
        responders: &HashSet<AgentId>,
    ) -> Vec<usize> {
        let (mut spoke, mut rest): (Vec<usize>, Vec<usize>) = ready
            .into_iter()
            .partition(|position| responders.contains(&pending.registrations[*position].account_id));
        self.shuffle(&mut spoke);
        self.shuffle(&mut rest);

        spoke.extend(rest);
        spoke
    }

    /// Drive one agent's turn: deliver the augmented context, then wait for
    /// the reply callback or the response timeout. Returns whether the agent
    /// produced a non-silent reply.
    async fn run_turn(
        &self,
        channel_id: &ChannelId,
        state: &Arc<Mutex<ChannelState<C>>>,
        registration: &AgentRegistration<C>,
        round: u32,
    ) -> bool {
        let account_id = registration.account_id.clone();

        let (turn, response_rx) = {
            let mut st = state.lock().await;
            let accumulated = st.conversation.unseen_agent_lines(&account_id);
            // Everything up to the tail counts as delivered from here on, so
            // the agent's own forthcoming reply is never re-delivered to it.
            st.conversation.advance_watermark(&account_id);

            let (resolver, response_rx) = oneshot::channel();
            st.response_callbacks.insert(account_id.clone(), resolver);

            let turn = FanOutTurn {
                ctx: registration.ctx.clone(),
                round,
                accumulated_responses: accumulated,
            };
            (turn, response_rx)
        };

        tracing::debug!(
            channel_id = %channel_id,
            account_id = %account_id,
            round,
            "invoking agent processor"
        );
        // One timeout budget covers the whole turn: accepting the work and
        // producing the reply both count against it.
        let outcome = tokio::time::timeout(self.inner.config.response_timeout, async {
            if let Err(error) = (registration.processor)(turn).await {
                // The turn is already armed; the reply may still arrive
                // through the notifier, otherwise the timeout resolves it
                // as silence.
                tracing::warn!(
                    channel_id = %channel_id,
                    account_id = %account_id,
                    %error,
                    "agent processor failed"
                );
            }
            response_rx.await
        })
        .await;

        let response = match outcome {
            Ok(Ok(text)) => text,
            // Resolver dropped without a reply; treat as silence.
            Ok(Err(_)) => None,
            Err(_) => {
                state.lock().await.response_callbacks.remove(&account_id);
                tracing::warn!(
                    channel_id = %channel_id,
                    account_id = %account_id,
                    round,
                    "agent reply timed out"
                );
                None
            }
        };

        match response {
            Some(text) if !text.is_empty() && !(self.inner.is_silent_reply)(&text) => {
                let mut st = state.lock().await;
                let index = st
                    .conversation
                    .append(Speaker::Agent(account_id.clone()), text);
                st.conversation.advance_watermark(&account_id);
                tracing::debug!(
                    channel_id = %channel_id,
                    account_id = %account_id,
                    index,
                    "agent reply appended"
                );
                true
            }
            Some(_) => {
                tracing::debug!(
                    channel_id = %channel_id,
                    account_id = %account_id,
                    round,
                    "agent replied with the silent sentinel"
                );
                false
            }
            None => {
                tracing::debug!(
                    channel_id = %channel_id,
                    account_id = %account_id,
                    round,
                    "agent stayed silent"
                );
                false
            }
        }
    }

    /// Bookkeeping and the chaining decision after a finished round.
    fn plan_next_round(
        &self,
        channel_id: &ChannelId,
        st: &mut ChannelState<C>,
        pending: &PendingRound<C>,
        responders: HashSet<AgentId>,
    ) -> NextStep<C> {
        let any_responded = !responders.is_empty();
        st.previous_round_responders = responders;

        if st.current_round >= st.round_limit || !any_responded {
            if st.current_round >= st.round_limit {
                tracing::info!(
                    channel_id = %channel_id,
                    round = st.current_round,
                    limit = st.round_limit,
                    "round limit reached, conversation over"
                );
            } else {
                tracing::info!(
                    channel_id = %channel_id,
                    round = st.current_round,
                    "no agent responded, conversation over"
                );
            }
            st.current_round = 0;
            st.previous_round_responders.clear();

            if let Some(mut queued) = st.pending_round.take() {
                queued.cancel_timer();
                tracing::debug!(
                    channel_id = %channel_id,
                    trigger = %queued.trigger_message_id,
                    "starting queued round as a fresh conversation"
                );
                return NextStep::Queued(queued);
            }
            st.is_processing = false;
            return NextStep::Stop;
        }

        // A new trigger that arrived mid-conversation continues it as the
        // next chained round; the counter keeps climbing.
        if let Some(mut queued) = st.pending_round.take() {
            queued.cancel_timer();
            tracing::debug!(
                channel_id = %channel_id,
                trigger = %queued.trigger_message_id,
                "chaining into queued round"
            );
            return NextStep::Queued(queued);
        }

        let someone_behind = pending
            .registrations
            .iter()
            .any(|registration| st.conversation.has_unseen(&registration.account_id));
        if someone_behind {
            tracing::debug!(
                channel_id = %channel_id,
                "agents still have unseen messages, chaining another round"
            );
            return NextStep::Chain;
        }

        tracing::info!(
            channel_id = %channel_id,
            round = st.current_round,
            "all agents caught up, conversation over"
        );
        st.current_round = 0;
        st.previous_round_responders.clear();
        st.is_processing = false;
        NextStep::Stop
    }
}
