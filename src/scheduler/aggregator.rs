use crate::{
    registry::Registry,
    supervisor::{ServeFuture, Service, ServiceError, Stop},
    target::TargetStats,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Single writer of the registry's stats map.
pub struct StatsAggregator {
    registry: Arc<Registry>,
    rx: Mutex<mpsc::UnboundedReceiver<TargetStats>>,
}

impl StatsAggregator {
    pub fn new(registry: Arc<Registry>, rx: mpsc::UnboundedReceiver<TargetStats>) -> Self {
        Self {
            registry,
            rx: Mutex::new(rx),
        }
    }

    async fn run(&self, stop: &mut Stop) -> Result<(), ServiceError> {
        let mut rx = self.rx.lock().await;
        loop {
            let stats = tokio::select! {
                _ = stop.wait() => return Ok(()),
                s = rx.recv() => s,
            };
            match stats {
                Some(s) => {
                    let id = s.id.clone();
                    if !self.registry.update_stats(s) {
                        log::debug!("aggregator: dropped stats of unknown target {}", id);
                    }
                }
                None => {
                    stop.wait().await;
                    return Ok(());
                }
            }
        }
    }
}

impl Service for StatsAggregator {
    fn name(&self) -> String {
        "stats-aggregator".to_string()
    }

    fn serve(self: Arc<Self>, mut stop: Stop) -> ServeFuture {
        Box::pin(async move { self.run(&mut stop).await })
    }
}
