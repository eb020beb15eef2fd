//! Read-decide-write cycle shared by the controllers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace};

use super::codec::{decode, encode, QuotaState, Stamped};
use crate::error::QuotaError;
use crate::store::QuotaStore;

/// Upper bound of the first retry pause, in microseconds.
const BASE_BACKOFF_MICROS: u64 = 250;
/// Upper bound of any retry pause, in microseconds.
const MAX_BACKOFF_MICROS: u64 = 20_000;

/// What a controller wants to do with the state it was shown.
#[derive(Debug)]
pub(crate) enum Verdict<S> {
    /// Admit the request and persist the new state.
    Admit(S),
    /// Deny the request without writing.
    Deny,
}

/// Access to controller state in the quota store.
///
/// Writes go through compare-and-swap against the exact bytes that were
/// read, so a decision is only committed if nobody else wrote in between.
/// On conflict the state is re-read and the decision is made again after a
/// short randomized pause, so racing checks spread out instead of colliding
/// again on the next round trip.
#[derive(Clone)]
pub(crate) struct StateAccess {
    store: Arc<dyn QuotaStore>,
    timeout: Duration,
    max_attempts: u32,
}

impl StateAccess {
    pub(crate) fn new(store: Arc<dyn QuotaStore>, timeout: Duration, max_attempts: u32) -> Self {
        Self {
            store,
            timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Read and decode the state under `key`.
    pub(crate) async fn load<S: QuotaState>(
        &self,
        key: &str,
    ) -> Result<Option<Stamped<S>>, QuotaError> {
        let raw = self.bounded(self.store.get(key)).await?;
        raw.as_deref().map(decode).transpose()
    }

    /// Run one admission decision against the state under `key`.
    ///
    /// Returns `Ok(true)` if the request was admitted and its state change
    /// committed, `Ok(false)` if `decide` denied it.
    pub(crate) async fn update<S, F>(
        &self,
        key: &str,
        subject: &str,
        ttl: Duration,
        mut decide: F,
    ) -> Result<bool, QuotaError>
    where
        S: QuotaState,
        F: FnMut(Option<&S>) -> Verdict<S>,
    {
        for attempt in 1..=self.max_attempts {
            let raw = self.bounded(self.store.get(key)).await?;
            let current: Option<Stamped<S>> = raw.as_deref().map(decode).transpose()?;

            let next = match decide(current.as_ref().map(|c| &c.state)) {
                Verdict::Deny => return Ok(false),
                Verdict::Admit(state) => match &current {
                    Some(current) => current.succeed(state),
                    None => Stamped::first(state),
                },
            };

            let encoded = encode(&next)?;
            let committed = self
                .bounded(
                    self.store
                        .compare_and_swap(key, raw.as_deref(), &encoded, ttl),
                )
                .await?;

            if committed {
                trace!(key = %key, revision = next.revision, "Committed quota state");
                return Ok(true);
            }

            if attempt < self.max_attempts {
                let pause = backoff(attempt);
                debug!(
                    key = %key,
                    subject = %subject,
                    attempt = attempt,
                    pause_us = pause.as_micros() as u64,
                    "Concurrent update detected, retrying"
                );
                tokio::time::sleep(pause).await;
            }
        }

        Err(QuotaError::Contention {
            subject: subject.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// Bound a store round trip by the configured timeout.
    async fn bounded<T, F>(&self, call: F) -> Result<T, QuotaError>
    where
        F: Future<Output = Result<T, QuotaError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(QuotaError::Store(format!(
                "store call timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

/// Full-jitter exponential backoff for the retry after `attempt`.
fn backoff(attempt: u32) -> Duration {
    let ceiling = BASE_BACKOFF_MICROS
        .saturating_mul(1u64 << attempt.min(16))
        .min(MAX_BACKOFF_MICROS);
    Duration::from_micros(rand::thread_rng().gen_range(0..=ceiling))
}
