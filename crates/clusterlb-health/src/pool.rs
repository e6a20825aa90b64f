//! Bounded probe pool.
//!
//! The watchdog hands probes to the pool so slow connects do not stall
//! the pass. At most `size` probes run concurrently; when every permit
//! is taken the probe runs inline on the caller instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::checker::{NodeProbe, ProbeResult, ProbeTarget};

#[derive(Clone)]
pub struct ProbePool {
    permits: Arc<Semaphore>,
    probe: Arc<dyn NodeProbe>,
}

impl std::fmt::Debug for ProbePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbePool")
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

impl ProbePool {
    pub fn new(size: usize, probe: Arc<dyn NodeProbe>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            probe,
        }
    }

    pub fn probe(&self) -> &Arc<dyn NodeProbe> {
        &self.probe
    }

    /// Probe `target` and hand the result to `on_done`.
    ///
    /// Returns the task handle when the probe was dispatched to the pool,
    /// `None` when it already ran inline.
    pub async fn submit<F>(
        &self,
        target: ProbeTarget,
        timeout: Duration,
        on_done: F,
    ) -> Option<JoinHandle<()>>
    where
        F: FnOnce(ProbeResult) + Send + 'static,
    {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                let probe = Arc::clone(&self.probe);
                Some(tokio::spawn(async move {
                    let result = probe.probe(&target, timeout).await;
                    drop(permit);
                    on_done(result);
                }))
            }
            Err(_) => {
                debug!(address = %target.address(), "probe pool saturated, probing inline");
                let result = self.probe.probe(&target, timeout).await;
                on_done(result);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use clusterlb_state::NodeType;

    use super::*;
    use crate::checker::BoxFuture;

    struct Fixed(ProbeResult);

    impl NodeProbe for Fixed {
        fn probe<'a>(&'a self, _: &'a ProbeTarget, _: Duration) -> BoxFuture<'a, ProbeResult> {
            let result = self.0;
            Box::pin(async move { result })
        }
    }

    fn target() -> ProbeTarget {
        ProbeTarget::new(NodeType::Ajp, "127.0.0.1", 1)
    }

    #[tokio::test]
    async fn dispatches_while_permits_remain() {
        let pool = ProbePool::new(1, Arc::new(Fixed(ProbeResult::Healthy)));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handle = pool
            .submit(target(), Duration::from_secs(1), move |r| {
                assert_eq!(r, ProbeResult::Healthy);
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .expect("dispatched to pool");
        handle.await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn runs_inline_when_saturated() {
        let pool = ProbePool::new(0, Arc::new(Fixed(ProbeResult::Failed)));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handle = pool
            .submit(target(), Duration::from_secs(1), move |r| {
                assert_eq!(r, ProbeResult::Failed);
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert!(handle.is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
