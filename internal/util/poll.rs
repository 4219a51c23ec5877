use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_wait: Duration,
    pub max_interval: Duration,
}

impl PollSettings {
    pub fn fixed(interval: Duration, max_wait: Duration) -> Self {
        Self {
            interval,
            max_wait,
            max_interval: interval,
        }
    }

    pub fn with_backoff(interval: Duration, max_interval: Duration, max_wait: Duration) -> Self {
        Self {
            interval,
            max_wait,
            max_interval: max_interval.max(interval),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    Timeout { waited: Duration, attempts: u32 },
    Probe(String),
}

impl std::fmt::Display for PollError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { waited, attempts } => write!(
                f,
                "condition not met after {attempts} attempts ({}ms)",
                waited.as_millis()
            ),
            Self::Probe(err) => write!(f, "probe failed: {err}"),
        }
    }
}

/// Runs `probe` until it yields `Some`, sleeping between attempts and giving up
/// once `max_wait` has elapsed. A probe error ends the loop immediately.
pub async fn poll_until<T, F, Fut>(settings: PollSettings, mut probe: F) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, String>>,
{
    let started = Instant::now();
    let mut interval = settings.interval;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match probe().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(err) => return Err(PollError::Probe(err)),
        }
        let waited = started.elapsed();
        if waited >= settings.max_wait {
            return Err(PollError::Timeout { waited, attempts });
        }
        let remaining = settings.max_wait - waited;
        tracing::debug!(attempts, waited_ms = waited.as_millis() as u64, "poll condition pending");
        sleep(interval.min(remaining)).await;
        interval = (interval * 2).min(settings.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::{poll_until, PollError, PollSettings};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn poll_returns_once_condition_flips() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = poll_until(
            PollSettings::fixed(Duration::from_millis(5), Duration::from_secs(2)),
            move || {
                let counter = counter.clone();
                async move {
                    let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok((seen >= 3).then_some(seen))
                }
            },
        )
        .await
        .expect("poll");
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_times_out_instead_of_hanging() {
        let err = poll_until::<(), _, _>(
            PollSettings::with_backoff(
                Duration::from_millis(5),
                Duration::from_millis(20),
                Duration::from_millis(60),
            ),
            || async { Ok(None) },
        )
        .await
        .unwrap_err();
        match err {
            PollError::Timeout { waited, attempts } => {
                assert!(waited >= Duration::from_millis(60));
                assert!(attempts >= 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn probe_errors_stop_the_loop() {
        let err = poll_until::<(), _, _>(
            PollSettings::fixed(Duration::from_millis(5), Duration::from_secs(5)),
            || async { Err("connection refused".to_string()) },
        )
        .await
        .unwrap_err();
        assert_eq!(err, PollError::Probe("connection refused".into()));
    }
}
