//! Fixed window counter controller.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::codec::QuotaState;
use super::limiter::QuotaSnapshot;
use super::transaction::{StateAccess, Verdict};
use crate::clock::Clock;
use crate::error::QuotaError;

/// Persisted request count for one subject in one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    pub subject_id: String,
    /// `floor(now / window_size)` for the window being counted.
    pub window_id: i64,
    pub max_requests: u64,
    pub request_count: u64,
}

impl QuotaState for WindowState {
    fn validate(&self) -> Result<(), String> {
        if self.max_requests == 0 {
            return Err(format!("window for {} allows no requests", self.subject_id));
        }
        if self.request_count > self.max_requests {
            return Err(format!(
                "window {} for {} counts {} requests, above maximum {}",
                self.window_id, self.subject_id, self.request_count, self.max_requests
            ));
        }
        Ok(())
    }
}

/// Counts requests per subject in aligned windows of `window_size` seconds.
///
/// A new window starts from zero; nothing carries over from the previous one.
#[derive(Clone)]
pub struct FixedWindowController {
    state: StateAccess,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    window_size: u64,
    max_requests: u64,
    ttl: Duration,
}

impl FixedWindowController {
    pub(crate) fn new(
        state: StateAccess,
        clock: Arc<dyn Clock>,
        key_prefix: String,
        window_size: u64,
        max_requests: u64,
        ttl: Duration,
    ) -> Self {
        Self {
            state,
            clock,
            key_prefix,
            window_size,
            max_requests,
            ttl,
        }
    }

    /// Decide whether `subject_id` may make another request in the current
    /// window.
    pub async fn accept(&self, subject_id: &str) -> Result<bool, QuotaError> {
        let key = self.key(subject_id);

        self.state
            .update(&key, subject_id, self.ttl, |current: Option<&WindowState>| {
                let window_id = self.window_id(self.clock.now());
                match current {
                    Some(window) if window.window_id == window_id => {
                        if window.request_count >= window.max_requests {
                            Verdict::Deny
                        } else {
                            Verdict::Admit(WindowState {
                                request_count: window.request_count + 1,
                                ..window.clone()
                            })
                        }
                    }
                    _ => {
                        trace!(subject = %subject_id, window_id = window_id, "Starting new window");
                        Verdict::Admit(WindowState {
                            subject_id: subject_id.to_string(),
                            window_id,
                            max_requests: self.max_requests,
                            request_count: 1,
                        })
                    }
                }
            })
            .await
    }

    /// Remaining quota in the current window without consuming any.
    pub async fn peek(&self, subject_id: &str) -> Result<QuotaSnapshot, QuotaError> {
        let now = self.clock.now();
        let window_id = self.window_id(now);
        let current = self.state.load::<WindowState>(&self.key(subject_id)).await?;

        let remaining = match current {
            Some(stamped) if stamped.state.window_id == window_id => stamped
                .state
                .max_requests
                .saturating_sub(stamped.state.request_count),
            _ => self.max_requests,
        };

        Ok(QuotaSnapshot {
            remaining,
            resets_at: window_id.saturating_add(1).saturating_mul(self.window_len()),
        })
    }

    fn window_id(&self, now: i64) -> i64 {
        now.div_euclid(self.window_len())
    }

    fn window_len(&self) -> i64 {
        i64::try_from(self.window_size).unwrap_or(i64::MAX).max(1)
    }

    fn key(&self, subject_id: &str) -> String {
        format!("{}{}", self.key_prefix, subject_id)
    }
}
