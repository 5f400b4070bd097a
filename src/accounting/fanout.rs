//! Fans a single statistics event out to every configured sink.

use super::AccountingSink;
use serde_json::Value;

/// Owns the configured accounting sinks and drives `start`/`stop` and
/// per-event fan-out. A sink whose `do_accounting` call fails is logged
/// and skipped; it never blocks delivery to the remaining sinks.
pub struct AccountingFanout {
    sinks: Vec<Box<dyn AccountingSink>>,
}

impl AccountingFanout {
    pub fn new(sinks: Vec<Box<dyn AccountingSink>>) -> Self {
        Self { sinks }
    }

    pub async fn start(&self) -> crate::Result<()> {
        for sink in &self.sinks {
            sink.start().await?;
        }
        Ok(())
    }

    pub async fn do_accounting(&self, stats: &Value) {
        tracing::debug!(stats = %stats, "dispatching session statistics");
        for sink in &self.sinks {
            if let Err(e) = sink.do_accounting(stats).await {
                tracing::warn!(error = %e, "accounting sink failed to record event");
            }
        }
    }

    pub async fn stop(&self) {
        for sink in &self.sinks {
            if let Err(e) = sink.stop().await {
                tracing::warn!(error = %e, "accounting sink failed to stop cleanly");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::sink::AccountingSink;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        count: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl AccountingSink for CountingSink {
        async fn start(&self) -> crate::Result<()> {
            Ok(())
        }

        async fn do_accounting(&self, _stats: &Value) -> crate::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("simulated sink failure");
            }
            Ok(())
        }

        async fn stop(&self) -> crate::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_sink_does_not_block_others() {
        let counter_a = Arc::new(AtomicUsize::new(0));
        let counter_b = Arc::new(AtomicUsize::new(0));
        let fanout = AccountingFanout::new(vec![
            Box::new(CountingSink {
                count: counter_a.clone(),
                fail: true,
            }),
            Box::new(CountingSink {
                count: counter_b.clone(),
                fail: false,
            }),
        ]);

        fanout.do_accounting(&json!({"call_id": "x"})).await;

        assert_eq!(counter_a.load(Ordering::SeqCst), 1);
        assert_eq!(counter_b.load(Ordering::SeqCst), 1);
    }
}
