//! Sliding-window admission control for calls to the remote endpoint.
//!
//! One [`RateLimiter`] exists per gateway process. Every admitted call records its
//! timestamp; an admit first drops timestamps older than the window, then allows the
//! call only while fewer than `limit` remain. The check and the insert happen under the
//! same lock, so two concurrent admits can never both take the last slot.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::RateLimitPolicy;
use crate::error::{ProxyError, Result};

/// Source of "now" for the limiter.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

#[derive(Debug, Default)]
struct Window {
    admitted: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

pub struct RateLimiter {
    limit: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<Window>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self::with_clock(limit, window, Arc::new(SystemClock))
    }

    pub fn with_clock(limit: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit: limit as usize,
            window,
            clock,
            state: Mutex::new(Window::default()),
        }
    }

    /// Try to take a slot in the current window.
    pub fn admit(&self) -> Admission {
        let now = self.clock.now();
        let mut state = self.lock();

        if let Some(until) = state.blocked_until {
            if now < until {
                return Admission::Denied {
                    retry_after: until - now,
                };
            }
            state.blocked_until = None;
        }

        Self::purge(&mut state.admitted, now, self.window);

        if state.admitted.len() < self.limit {
            state.admitted.push_back(now);
            return Admission::Allowed;
        }

        // Full window: the earliest entry is the next to expire.
        let retry_after = state
            .admitted
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(self.window);

        Admission::Denied { retry_after }
    }

    /// Admit according to `policy`: fail fast with [`ProxyError::RateLimited`], or sleep
    /// until a slot frees up. The lock is never held across the sleep.
    pub async fn acquire(&self, policy: RateLimitPolicy) -> Result<()> {
        loop {
            match self.admit() {
                Admission::Allowed => return Ok(()),
                Admission::Denied { retry_after } => match policy {
                    RateLimitPolicy::Reject => return Err(ProxyError::rate_limited(retry_after)),
                    RateLimitPolicy::Wait => {
                        tracing::warn!(
                            wait_secs = retry_after.as_secs_f64(),
                            "Rate limited, waiting for a free slot"
                        );
                        tokio::time::sleep(retry_after.max(Duration::from_millis(10))).await;
                    }
                },
            }
        }
    }

    /// Deny every admit for `duration`, e.g. after the remote answered 429.
    pub fn block_for(&self, duration: Duration) {
        let until = self.clock.now() + duration;
        let mut state = self.lock();
        state.blocked_until = Some(match state.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    /// Number of admits still inside the window.
    pub fn in_window(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        Self::purge(&mut state.admitted, now, self.window);
        state.admitted.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn purge(admitted: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = admitted.front() {
            if now.saturating_duration_since(*oldest) >= window {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
