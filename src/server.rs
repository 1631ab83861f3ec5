use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::identity::{ClientId, IdentityResolver};
use crate::scheduler::dispatcher::{Eviction, Reconciliation};
use crate::scheduler::{Admission, DispatchStats, Dispatcher, QueueStatus, StepOutcome};
use crate::upstream::{AnswerUpload, Upstream};

/// Result of one accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub outcome: StepOutcome,
    /// `None` while incomplete or when verification is disabled.
    pub verified: Option<bool>,
}

/// Ties the dispatcher to the upstream and runs the maintenance loops.
///
/// Upstream calls are never made while the dispatcher lock is held: the
/// refresh fetch happens before locking, uploads and verification after the
/// mutation has been committed.
#[derive(Clone)]
pub struct DispatchServer {
    config: Arc<DispatchConfig>,
    dispatcher: Arc<Mutex<Dispatcher>>,
    upstream: Arc<dyn Upstream>,
}

impl DispatchServer {
    pub fn new(config: DispatchConfig, upstream: Arc<dyn Upstream>) -> Self {
        let dispatcher = Dispatcher::new(config.default_steps);
        Self {
            config: Arc::new(config),
            dispatcher: Arc::new(Mutex::new(dispatcher)),
            upstream,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Shared handle to the dispatcher, for inspection.
    pub fn dispatcher(&self) -> Arc<Mutex<Dispatcher>> {
        self.dispatcher.clone()
    }

    /// Run all subsystems until `shutdown` is cancelled.
    ///
    /// 1. Performs an initial pool refresh
    /// 2. Spawns the refresh loop
    /// 3. Spawns the eviction loop
    /// 4. Serves the HTTP API (blocking)
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        if let Err(e) = self.refresh().await {
            tracing::warn!(error = %e, "Initial captcha refresh failed");
        }

        let refresher = self.clone();
        let refresh_shutdown = shutdown.clone();
        tokio::spawn(async move {
            refresher.refresh_loop(refresh_shutdown).await;
        });

        let evictor = self.clone();
        let eviction_shutdown = shutdown.clone();
        tokio::spawn(async move {
            evictor.eviction_loop(eviction_shutdown).await;
        });

        let state = ApiState {
            identity: IdentityResolver::new(self.config.token_max_age),
            server: self.clone(),
        };
        run_api(self.config.listen_addr, state, shutdown).await
    }

    async fn refresh_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.refresh_interval);
        // The first tick fires immediately and startup already refreshed.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Refresh loop stopped");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        tracing::warn!(error = %e, "Captcha refresh failed");
                    }
                }
            }
        }
    }

    async fn eviction_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.eviction_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Eviction loop stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.evict(Instant::now()).await;
                }
            }
        }
    }

    /// Fetch the item set and reconcile local state against it.
    ///
    /// A failed fetch clears the pool and every assignment: no reachable
    /// source means no work exists.
    pub async fn refresh(&self) -> Result<Reconciliation> {
        let fetched = self.upstream.fetch_items().await;

        let mut dispatcher = self.dispatcher.lock().await;
        match fetched {
            Ok(items) => {
                let fetched_count = items.len();
                let result = dispatcher.reconcile(items, Instant::now());
                tracing::info!(
                    fetched = fetched_count,
                    added = ?result.added,
                    removed = ?result.removed,
                    released = result.released.len(),
                    promoted = result.promoted.len(),
                    pooled = dispatcher.pool().len(),
                    "Captcha pool refreshed"
                );
                Ok(result)
            }
            Err(e) => {
                dispatcher.clear();
                Err(e)
            }
        }
    }

    pub async fn evict(&self, now: Instant) -> Eviction {
        let result = self.dispatcher.lock().await.evict(
            now,
            self.config.queue_timeout,
            self.config.assignment_timeout,
        );
        if !result.evicted.is_empty() || !result.reclaimed.is_empty() {
            tracing::info!(
                evicted = result.evicted.len(),
                reclaimed = ?result.reclaimed,
                promoted = result.promoted.len(),
                "Evicted stale clients"
            );
        }
        result
    }

    pub async fn request_work(&self, client_id: &ClientId) -> Result<Admission> {
        self.dispatcher
            .lock()
            .await
            .request_work(client_id, Instant::now())
    }

    pub async fn queue_position(&self, client_id: &ClientId) -> QueueStatus {
        self.dispatcher
            .lock()
            .await
            .queue_position(client_id, Instant::now())
    }

    /// Record one answer, forward it, and retire the session when complete.
    pub async fn submit_answer(
        &self,
        client_id: &ClientId,
        session_id: Option<&str>,
        answer: &str,
    ) -> Result<SubmitOutcome> {
        let recorded = self.dispatcher.lock().await.record_answer(
            client_id,
            session_id,
            answer,
            Instant::now(),
        )?;

        let upload = AnswerUpload {
            session_id: recorded.session_id().to_string(),
            item_id: recorded.item.id.clone(),
            url: recorded.item.url.clone(),
            answers: recorded.answers.clone(),
        };
        let upstream = self.upstream.clone();
        let uploader = client_id.clone();
        tokio::spawn(async move {
            if let Err(e) = upstream.upload_answers(&upload).await {
                tracing::warn!(
                    client_id = %uploader,
                    session_id = %upload.session_id,
                    error = %e,
                    "Answer upload failed"
                );
            }
        });

        if !recorded.outcome.completed {
            return Ok(SubmitOutcome {
                outcome: recorded.outcome,
                verified: None,
            });
        }

        let verified = if self.config.upstream.verify {
            match self.poll_verification(recorded.session_id()).await {
                Ok(()) => Some(true),
                Err(e) => {
                    tracing::warn!(session_id = recorded.session_id(), error = %e, "Captcha not verified");
                    Some(false)
                }
            }
        } else {
            None
        };

        self.dispatcher
            .lock()
            .await
            .finish(client_id, recorded.session_id());

        Ok(SubmitOutcome {
            outcome: recorded.outcome,
            verified,
        })
    }

    /// Poll the verification endpoint under the configured retry policy.
    async fn poll_verification(&self, session_id: &str) -> Result<()> {
        let policy = self.config.verify_policy;
        for attempt in 1..=policy.max_attempts {
            match self.upstream.verify(session_id).await {
                Ok(true) => {
                    tracing::info!(session_id, attempt, "Captcha verified");
                    return Ok(());
                }
                Ok(false) => tracing::debug!(session_id, attempt, "Captcha not yet verified"),
                Err(e) => tracing::debug!(session_id, attempt, error = %e, "Verification request failed"),
            }
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }
        Err(DispatchError::VerificationTimeout {
            attempts: policy.max_attempts,
        })
    }

    pub async fn stats(&self) -> DispatchStats {
        self.dispatcher.lock().await.stats()
    }
}
