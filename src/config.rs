//! Scheduler thresholds and their defaults.

use std::time::Duration;

/// How long registrations for one trigger message are collected before the
/// round executes. Every bot process receives the trigger independently, so
/// the window has to cover their delivery skew.
pub const AGENT_COLLECTION_WINDOW: Duration = Duration::from_millis(1_500);

/// How long the executor waits for one agent's reply before moving on to the
/// next agent.
pub const AGENT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(45);

/// Hard ceiling on chained rounds per conversation.
pub const DEFAULT_MAX_ROUNDS: u32 = 20;

/// Tunable thresholds for the fan-out scheduler.
///
/// The defaults match the exported constants; hosts override them through
/// [`Coordinator::builder`](crate::fanout::Coordinator::builder). The round
/// ceiling can additionally be overridden per channel at registration time.
#[derive(Debug, Clone)]
pub struct FanOutConfig {
    pub collection_window: Duration,
    pub response_timeout: Duration,
    pub default_max_rounds: u32,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            collection_window: AGENT_COLLECTION_WINDOW,
            response_timeout: AGENT_RESPONSE_TIMEOUT,
            default_max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }
}
