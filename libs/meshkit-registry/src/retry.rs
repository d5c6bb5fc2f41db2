//! Background registration while the backend is unreachable.

use meshkit_backend::BackendConnector;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::record::ServiceRecord;
use crate::registrar::{Registrar, RegistrySettings};
use crate::throttled_log::FailureLog;

/// Default delay between two reconnection attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// How a supervisor ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// A registration succeeded and was handed to the success callback.
    Registered,
    /// Cancelled before any attempt succeeded.
    Cancelled,
}

/// Owns the reconnection task.
///
/// Each tick connects a fresh backend, builds a [`Registrar`] on it and
/// registers the record. The first success is handed to the callback and the
/// task exits; the callback decides whether to install the registrar.
#[derive(Debug)]
pub struct RetrySupervisor {
    token: CancellationToken,
    handle: JoinHandle<RetryOutcome>,
}

impl RetrySupervisor {
    /// Spawn the supervisor. The first attempt happens after `interval`.
    pub fn start<F, Fut>(
        connector: Arc<dyn BackendConnector>,
        record: ServiceRecord,
        settings: RegistrySettings,
        interval: Duration,
        parent: &CancellationToken,
        on_success: F,
    ) -> Self
    where
        F: FnOnce(Arc<Registrar>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let handle = tokio::spawn(run(
            connector,
            record,
            settings,
            interval,
            token.clone(),
            on_success,
        ));
        Self { token, handle }
    }

    /// Ask the task to stop; an attempt in flight is abandoned.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task to end.
    pub async fn wait(self) -> RetryOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "registry retry task ended abnormally");
                RetryOutcome::Cancelled
            }
        }
    }

    /// Cancel and wait.
    pub async fn stop(self) -> RetryOutcome {
        self.cancel();
        self.wait().await
    }
}

async fn attempt(
    connector: &dyn BackendConnector,
    record: &ServiceRecord,
    settings: RegistrySettings,
) -> Result<Registrar> {
    let backend = connector.connect().await?;
    let registrar = Registrar::new(Arc::clone(&backend), settings);
    if let Err(e) = registrar.register(record.clone()).await {
        backend.close().await;
        return Err(e);
    }
    Ok(registrar)
}

async fn run<F, Fut>(
    connector: Arc<dyn BackendConnector>,
    record: ServiceRecord,
    settings: RegistrySettings,
    period: Duration,
    token: CancellationToken,
    on_success: F,
) -> RetryOutcome
where
    F: FnOnce(Arc<Registrar>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let failures = FailureLog::default();
    let mut attempts: u64 = 0;

    tracing::info!(service_id = %record.id, ?period, "registry unreachable, retrying in background");
    loop {
        tokio::select! {
            () = token.cancelled() => {
                tracing::debug!(service_id = %record.id, attempts, "registry retry cancelled");
                return RetryOutcome::Cancelled;
            }
            _ = interval.tick() => {}
        }
        attempts += 1;

        let outcome = tokio::select! {
            () = token.cancelled() => return RetryOutcome::Cancelled,
            res = attempt(connector.as_ref(), &record, settings) => res,
        };

        match outcome {
            Ok(registrar) => {
                tracing::info!(service_id = %record.id, attempts, "registered after retry");
                on_success(Arc::new(registrar)).await;
                return RetryOutcome::Registered;
            }
            Err(e) => {
                if let Some(streak) = failures.failure() {
                    tracing::warn!(
                        service_id = %record.id,
                        consecutive = streak,
                        error = %e,
                        "registry still unreachable"
                    );
                } else {
                    tracing::debug!(service_id = %record.id, error = %e, "registry retry failed");
                }
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use meshkit_backend::{MockBackend, RegistryBackend};
    use tokio::sync::oneshot;

    fn record() -> ServiceRecord {
        ServiceRecord::tool("svc-R", "retry", "h", 1)
    }

    #[tokio::test(start_paused = true)]
    async fn registers_once_backend_returns() {
        let mock = MockBackend::new();
        mock.set_available(false);
        let (tx, rx) = oneshot::channel();
        let supervisor = RetrySupervisor::start(
            Arc::new(mock.clone()),
            record(),
            RegistrySettings::default(),
            Duration::from_secs(1),
            &CancellationToken::new(),
            move |registrar| async move {
                assert!(tx.send(registrar).is_ok());
            },
        );

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!supervisor.is_finished());
        assert!(mock.keys().is_empty());

        mock.set_available(true);
        assert_eq!(supervisor.wait().await, RetryOutcome::Registered);
        let registrar = rx.await.unwrap();
        assert!(registrar.current("svc-R").is_some());
        assert!(mock.get("services:svc-R").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let mock = MockBackend::new();
        mock.set_available(false);
        let parent = CancellationToken::new();
        let supervisor = RetrySupervisor::start(
            Arc::new(mock),
            record(),
            RegistrySettings::default(),
            Duration::from_secs(1),
            &parent,
            |_| async {},
        );
        tokio::time::sleep(Duration::from_secs(3)).await;
        parent.cancel();
        assert_eq!(supervisor.wait().await, RetryOutcome::Cancelled);
    }
}
