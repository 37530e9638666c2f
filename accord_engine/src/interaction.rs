//! Token-bucket rate limiting, turn counting, and cooldown signaling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;

/// Deserializable rate-limit configuration for ambient config loading.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub max_tokens_per_minute: u64,
    pub max_tokens_per_hour: u64,
    pub max_turns: u32,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_minute: 100_000,
            max_tokens_per_hour: 1_000_000,
            max_turns: 1_000,
        }
    }
}

impl TokenConfig {
    const MINUTE: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(3600);
}

#[derive(Debug)]
struct Window {
    start: Instant,
    tokens: u64,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self { start: now, tokens: 0 }
    }

    fn add(&mut self, now: Instant, size: Duration, tokens: u64) {
        if now.duration_since(self.start) >= size {
            self.start = now;
            self.tokens = 0;
        }
        self.tokens += tokens;
    }

    fn over(&self, limit: u64) -> bool {
        self.tokens > limit
    }

    fn remaining_in_window(&self, now: Instant, size: Duration) -> Duration {
        size.saturating_sub(now.duration_since(self.start))
    }
}

#[derive(Debug, Default)]
struct ConversationStats {
    token_total: u64,
    turn_count: u32,
}

/// Result of [`InteractionControl::process_interaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionResult {
    Continue,
    Wait,
    Stop,
}

/// An injectable, side-effecting callback fired when a window breaches its limit.
pub type CooldownCallback = Box<dyn Fn(Duration) + Send + Sync>;

/// Per-agent rate limiter: two independent sliding windows plus a turn
/// counter, with a pluggable cooldown callback.
pub struct InteractionControl {
    config: TokenConfig,
    minute_window: Mutex<Window>,
    hour_window: Mutex<Window>,
    current_turn: Mutex<u32>,
    conversations: Mutex<HashMap<String, ConversationStats>>,
    on_cooldown: Option<CooldownCallback>,
}

impl InteractionControl {
    pub fn new(config: TokenConfig) -> Arc<Self> {
        Self::with_cooldown_callback(config, None)
    }

    pub fn with_cooldown_callback(config: TokenConfig, on_cooldown: Option<CooldownCallback>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            config,
            minute_window: Mutex::new(Window::new(now)),
            hour_window: Mutex::new(Window::new(now)),
            current_turn: Mutex::new(0),
            conversations: Mutex::new(HashMap::new()),
            on_cooldown,
        })
    }

    /// Never returns [`InteractionResult::Continue`] when a limit is
    /// breached; `Wait` is idempotent — repeated calls during an active
    /// cooldown reissue the remaining duration.
    pub async fn process_interaction(
        &self,
        token_count: u64,
        conversation_id: &str,
    ) -> InteractionResult {
        let turn = *self.current_turn.lock().await;
        if turn >= self.config.max_turns {
            return InteractionResult::Stop;
        }
        if token_count == 0 {
            return InteractionResult::Continue;
        }

        let now = Instant::now();
        let mut minute = self.minute_window.lock().await;
        let mut hour = self.hour_window.lock().await;
        minute.add(now, TokenConfig::MINUTE, token_count);
        hour.add(now, TokenConfig::HOUR, token_count);
        *self.current_turn.lock().await += 1;

        {
            let mut conversations = self.conversations.lock().await;
            let stats = conversations.entry(conversation_id.to_string()).or_default();
            stats.token_total += token_count;
            stats.turn_count += 1;
        }

        let cooldown = if minute.over(self.config.max_tokens_per_minute) {
            Some(minute.remaining_in_window(now, TokenConfig::MINUTE))
        } else if hour.over(self.config.max_tokens_per_hour) {
            Some(hour.remaining_in_window(now, TokenConfig::HOUR))
        } else {
            None
        };

        match cooldown {
            Some(duration) => {
                if let Some(callback) = &self.on_cooldown {
                    callback(duration);
                }
                InteractionResult::Wait
            }
            None => InteractionResult::Continue,
        }
    }

    pub async fn conversation_token_total(&self, conversation_id: &str) -> u64 {
        self.conversations
            .lock()
            .await
            .get(conversation_id)
            .map(|s| s.token_total)
            .unwrap_or(0)
    }

    pub async fn conversation_turn_count(&self, conversation_id: &str) -> u32 {
        self.conversations
            .lock()
            .await
            .get(conversation_id)
            .map(|s| s.turn_count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn exceeding_minute_budget_triggers_wait() {
        let config = TokenConfig {
            max_tokens_per_minute: 100,
            max_tokens_per_hour: 1_000_000,
            max_turns: 100,
        };
        let control = InteractionControl::new(config);
        let result = control.process_interaction(150, "conv-1").await;
        assert_eq!(result, InteractionResult::Wait);
    }

    #[tokio::test]
    async fn zero_tokens_is_a_free_continue() {
        let control = InteractionControl::new(TokenConfig::default());
        assert_eq!(control.process_interaction(0, "conv-1").await, InteractionResult::Continue);
        assert_eq!(control.conversation_turn_count("conv-1").await, 0);
    }

    #[tokio::test]
    async fn turn_limit_yields_stop_before_accounting() {
        let config = TokenConfig {
            max_tokens_per_minute: 1_000_000,
            max_tokens_per_hour: 1_000_000,
            max_turns: 1,
        };
        let control = InteractionControl::new(config);
        assert_eq!(control.process_interaction(10, "conv-1").await, InteractionResult::Continue);
        assert_eq!(control.process_interaction(10, "conv-1").await, InteractionResult::Stop);
    }

    #[tokio::test]
    async fn cooldown_callback_is_invoked_with_remaining_duration() {
        let invoked = Arc::new(AtomicU64::new(0));
        let invoked2 = invoked.clone();
        let config = TokenConfig {
            max_tokens_per_minute: 10,
            max_tokens_per_hour: 1_000_000,
            max_turns: 100,
        };
        let control = InteractionControl::with_cooldown_callback(
            config,
            Some(Box::new(move |d: Duration| {
                invoked2.store(d.as_secs(), Ordering::SeqCst);
            })),
        );
        control.process_interaction(20, "conv-1").await;
        assert!(invoked.load(Ordering::SeqCst) > 0);
    }
}
