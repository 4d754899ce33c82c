use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Semaphore;
use tracing::error;

use super::{Decision, Destination, FirewallEngine, Origin, Verdict};

/// Worker threads that run firewall decisions off the proxy's event loop.
///
/// A decision can wait minutes on a human; the proxy loop only awaits the
/// join handle. At most `workers` decisions run at once, the rest queue on
/// the semaphore.
pub struct DecisionPool {
    runtime: Option<Runtime>,
    handle: Handle,
    permits: Arc<Semaphore>,
}

impl DecisionPool {
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("vmgate-decide")
            .enable_all()
            .build()
            .context("building firewall decision pool")?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
            permits: Arc::new(Semaphore::new(workers)),
        })
    }

    /// Run `engine.decide` on the pool. Anything that prevents an answer
    /// (pool shut down, panicking gateway) is a deny.
    pub async fn decide(
        &self,
        engine: Arc<FirewallEngine>,
        dest: Destination,
        hostname: Option<String>,
    ) -> Decision {
        let permits = self.permits.clone();
        let task = self.handle.spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            engine.decide(dest, hostname).await
        });
        match task.await {
            Ok(decision) => decision,
            Err(e) => {
                error!(%dest, error = %e, "firewall decision task failed, denying");
                Decision::new(Verdict::Deny, Origin::GatewayError)
            }
        }
    }
}

impl Drop for DecisionPool {
    fn drop(&mut self) {
        // Pending prompts are abandoned; their connections see a deny.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::firewall::testing::FakeGateway;
    use crate::firewall::{DefaultAllowList, Mode, RuleStore};
    use crate::resolver::testing::StaticResolver;

    fn engine(gateway: Arc<FakeGateway>) -> Arc<FirewallEngine> {
        Arc::new(FirewallEngine::new(
            "dev",
            Mode::Enforce,
            RuleStore::in_memory(),
            Arc::new(DefaultAllowList::empty()),
            gateway,
            Arc::new(StaticResolver::default()),
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn decides_on_worker_thread() {
        let pool = DecisionPool::new(2).unwrap();
        let gateway = Arc::new(FakeGateway::answering(Verdict::Allow));
        let fw = engine(gateway.clone());

        let d = pool.decide(fw.clone(), "1.1.1.1:443".parse().unwrap(), None).await;
        assert!(d.is_allowed());
        assert_eq!(gateway.calls(), 1);
        assert_eq!(fw.rules().await.len(), 1);
    }

    #[tokio::test]
    async fn pending_prompt_does_not_block_caller_loop() {
        let pool = Arc::new(DecisionPool::new(2).unwrap());
        let fw = engine(Arc::new(
            FakeGateway::answering(Verdict::Allow).with_delay(Duration::from_millis(300)),
        ));

        let slow = tokio::spawn({
            let pool = pool.clone();
            let fw = fw.clone();
            async move { pool.decide(fw, "1.1.1.1:443".parse().unwrap(), None).await }
        });

        // The caller's runtime keeps making progress while the prompt waits.
        let tick = tokio::time::timeout(Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        })
        .await;
        assert!(tick.is_ok());
        assert!(!slow.is_finished());

        assert!(slow.await.unwrap().is_allowed());
    }

    #[test]
    fn zero_workers_is_clamped() {
        let pool = DecisionPool::new(0).unwrap();
        assert_eq!(pool.permits.available_permits(), 1);
    }
}
