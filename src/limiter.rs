//! Adaptive per-proxy rate limiting
//!
//! Each proxy owns one [`AdaptiveRateLimiter`] (a single global instance is
//! used when running without proxies). The limiter throttles calls to a
//! current rate in calls per second and adjusts that rate from observed
//! feedback: remote throttling cuts it sharply, sustained success recovers
//! it slowly.
//!
//! # Algorithm
//!
//! - A sliding one-second window of call timestamps decides whether a new
//!   call may proceed or must sleep.
//! - [`report_error`](AdaptiveRateLimiter::report_error) with a rate-limit
//!   error multiplies the rate by `backoff_factor`, with a harsher extra cut
//!   after more than 3 consecutive errors, floored at `min_rate`.
//! - [`report_success`](AdaptiveRateLimiter::report_success) raises the rate
//!   by `recovery_factor` after `success_streak` consecutive successes, at
//!   most once per `adjust_cooldown`, capped at `max_rate`.
//!
//! The invariant `min_rate <= current_rate <= max_rate` holds at all times.

use crate::config::LimiterConfig;
use rand::Rng;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Maximum random jitter added to each wait, to desynchronize concurrent callers
const JITTER_MAX_SECS: f64 = 0.3;

/// Extra multiplier applied when rate-limit errors keep arriving back to back
const REPEAT_ERROR_CUT: f64 = 0.7;

/// Consecutive rate-limit errors after which the extra cut kicks in
const REPEAT_ERROR_THRESHOLD: u32 = 3;

/// Adaptive token-interval rate limiter
///
/// Safe to share across tasks behind an `Arc`; all state lives behind one
/// async mutex. The mutex is held across the wait itself, which serializes
/// callers sharing the same limiter — two tasks routed through one proxy
/// never race past its rate.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    config: LimiterConfig,
    state: Mutex<LimiterState>,
}

#[derive(Debug)]
struct LimiterState {
    /// Current permitted rate in calls per second
    current_rate: f64,
    /// Timestamps of calls within the sliding window
    calls: VecDeque<Instant>,
    /// Consecutive successes since the last error
    success_streak: u32,
    /// Consecutive errors since the last success
    error_streak: u32,
    /// When the rate was last adjusted in either direction
    last_adjustment: Instant,
}

impl LimiterState {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.calls.front() {
            if now.duration_since(*front) >= Duration::from_secs(1) {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }
}

impl AdaptiveRateLimiter {
    /// Create a limiter starting at `config.initial_rate`
    ///
    /// The initial rate is clamped into `[min_rate, max_rate]` so a
    /// misconfigured starting point cannot break the invariant.
    #[must_use]
    pub fn new(config: LimiterConfig) -> Self {
        let initial = config.initial_rate.clamp(config.min_rate, config.max_rate);
        Self {
            state: Mutex::new(LimiterState {
                current_rate: initial,
                calls: VecDeque::new(),
                success_streak: 0,
                error_streak: 0,
                last_adjustment: Instant::now(),
            }),
            config,
        }
    }

    /// Block until issuing one more call would not exceed the current rate
    ///
    /// Records the call timestamp on return. Adds up to 300 ms of uniform
    /// random jitter so concurrent callers spread out instead of firing in
    /// lockstep. Returns the duration actually waited.
    pub async fn wait_for_permission(&self) -> Duration {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.prune(now);

        let mut delay = Duration::ZERO;
        if state.calls.len() as f64 >= state.current_rate {
            if let Some(oldest) = state.calls.front() {
                let interval = Duration::from_secs_f64(1.0 / state.current_rate);
                delay = interval.saturating_sub(now.duration_since(*oldest));
            }
        }

        let jitter = Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..JITTER_MAX_SECS));
        delay += jitter;

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        state.calls.push_back(Instant::now());
        delay
    }

    /// Record a successful call; may raise the rate
    ///
    /// The rate increases by `recovery_factor` only after `success_streak`
    /// consecutive successes and at least `adjust_cooldown` since the last
    /// adjustment, capped at `max_rate`. Returns whether the rate changed.
    pub async fn report_success(&self) -> bool {
        let mut state = self.state.lock().await;
        state.error_streak = 0;
        state.success_streak += 1;

        let now = Instant::now();
        if state.success_streak >= self.config.success_streak
            && now.duration_since(state.last_adjustment) >= self.config.adjust_cooldown
            && state.current_rate < self.config.max_rate
        {
            state.current_rate = (state.current_rate * self.config.recovery_factor)
                .min(self.config.max_rate);
            state.last_adjustment = now;
            state.success_streak = 0;
            return true;
        }
        false
    }

    /// Record a failed call; rate-limit errors cut the rate immediately
    ///
    /// Non-rate-limit errors only reset the success streak. Returns whether
    /// the rate changed.
    pub async fn report_error(&self, is_rate_limit: bool) -> bool {
        let mut state = self.state.lock().await;
        state.success_streak = 0;
        state.error_streak += 1;

        if is_rate_limit {
            let old_rate = state.current_rate;
            state.current_rate =
                (state.current_rate * self.config.backoff_factor).max(self.config.min_rate);
            if state.error_streak > REPEAT_ERROR_THRESHOLD {
                state.current_rate =
                    (state.current_rate * REPEAT_ERROR_CUT).max(self.config.min_rate);
            }
            state.last_adjustment = Instant::now();
            return (old_rate - state.current_rate).abs() > f64::EPSILON;
        }
        false
    }

    /// Current permitted rate in calls per second
    pub async fn current_rate(&self) -> f64 {
        self.state.lock().await.current_rate
    }
}
