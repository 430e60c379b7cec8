//! The augmented per-turn context handed to agent processors.

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Guidance for agents participating in a shared fan-out channel, meant to
/// be prepended to their prompts.
pub const FANOUT_GUIDANCE: &str = "\
You are one of several assistants sharing this channel. Replies are released \
one at a time: by the time your turn comes, other assistants may already \
have answered. Read the accumulated responses before composing yours. Do not \
repeat a point another assistant has already made; add something new, \
disagree with reasons, or stay silent. Only respond when you have something \
to contribute.";

/// Round metadata extracted from a [`FanOutTurn`].
#[derive(Debug, Clone, Serialize)]
pub struct RoundInfo {
    /// 1-based round number.
    pub round: u32,
    /// `[{agent}]: {content}` lines the agent has not seen yet.
    pub accumulated_responses: Vec<String>,
}

/// The context an agent processor receives for one turn.
///
/// Wraps the caller's opaque registration context with the round number and
/// the peer responses this agent has not yet seen. The base context is
/// cloned per turn; the caller's own value is never mutated.
#[derive(Debug, Clone)]
pub struct FanOutTurn<C> {
    pub ctx: C,
    /// 1-based round number.
    pub round: u32,
    /// `[{agent}]: {content}` lines the agent has not seen yet. Human
    /// messages are excluded; the trigger text is delivered with round 1.
    pub accumulated_responses: Vec<String>,
}

impl<C> FanOutTurn<C> {
    pub fn round_info(&self) -> RoundInfo {
        RoundInfo {
            round: self.round,
            accumulated_responses: self.accumulated_responses.clone(),
        }
    }
}

/// Future returned by an agent processor once it has accepted the work.
pub type ProcessFuture = Pin<Box<dyn Future<Output = crate::error::Result<()>> + Send>>;

/// Callback invoked once per turn for each agent.
///
/// Completion means the agent has accepted the work, not that it has
/// replied; the reply arrives later through
/// [`Coordinator::notify_response`](crate::fanout::Coordinator::notify_response)
/// or the response timeout resolves the turn as silence.
pub type AgentProcessor<C> = Arc<dyn Fn(FanOutTurn<C>) -> ProcessFuture + Send + Sync>;

/// Wrap an async closure as an [`AgentProcessor`].
pub fn processor<C, F, Fut>(f: F) -> AgentProcessor<C>
where
    F: Fn(FanOutTurn<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::error::Result<()>> + Send + 'static,
{
    Arc::new(move |turn| -> ProcessFuture { Box::pin(f(turn)) })
}
