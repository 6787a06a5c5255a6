//! Circuit-breaker wrapper around a [`SearchAndFetch`] implementation.
//!
//! Every call checks the breaker first; an open breaker short-circuits with
//! [`PortError::Unavailable`] without touching the downloader. Outcomes are
//! reported back so the breaker can count transport failures and resolve
//! half-open probes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{Hit, PortError, PortResult, SearchAndFetch, TransferUpdate};
use crate::breaker::CircuitBreaker;

/// Breaker-guarded downloader. Workers hold this, never the raw client.
pub struct GuardedDownloader {
    inner: Arc<dyn SearchAndFetch>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedDownloader {
    /// Wraps a downloader with the shared breaker.
    #[must_use]
    pub fn new(inner: Arc<dyn SearchAndFetch>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    /// The breaker shared with observers.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn guard<T, F>(&self, call: F) -> PortResult<T>
    where
        F: std::future::Future<Output = PortResult<T>>,
    {
        let now = Utc::now();
        if !self.breaker.try_acquire(now) {
            return Err(PortError::Unavailable {
                reason: "circuit breaker open".to_string(),
            });
        }

        let result = call.await;
        let now = Utc::now();
        match &result {
            Ok(_) => self.breaker.on_success(now),
            Err(err) if err.counts_toward_breaker() => self.breaker.on_failure(now),
            Err(_) => self.breaker.on_non_transport(now),
        }
        result
    }
}

#[async_trait]
impl SearchAndFetch for GuardedDownloader {
    async fn search(&self, query: &str) -> PortResult<Vec<Hit>> {
        self.guard(self.inner.search(query)).await
    }

    async fn enqueue(
        &self,
        peer: &str,
        filename: &str,
        size_bytes: i64,
        priority: i64,
    ) -> PortResult<String> {
        self.guard(self.inner.enqueue(peer, filename, size_bytes, priority))
            .await
    }

    async fn status(&self, external_ref: &str) -> PortResult<TransferUpdate> {
        self.guard(self.inner.status(external_ref)).await
    }

    async fn cancel(&self, external_ref: &str) -> PortResult<()> {
        self.guard(self.inner.cancel(external_ref)).await
    }

    async fn ping(&self) -> PortResult<()> {
        self.guard(self.inner.ping()).await
    }
}
