use super::parse_afl_stats;
use crate::{
    supervisor::{ServeFuture, Service, ServiceError, Stop},
    target::TargetStats,
    util::{wait_for_paths, Wait},
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::mpsc;

/// Re-reads AFL's `fuzzer_stats` file every `interval`.
pub struct AflStatsService {
    target: String,
    stats_file: PathBuf,
    interval: Duration,
    wait_timeout: Duration,
    tx: mpsc::UnboundedSender<TargetStats>,
}

impl AflStatsService {
    pub fn new(
        target: &str,
        stats_file: PathBuf,
        interval: Duration,
        wait_timeout: Duration,
        tx: mpsc::UnboundedSender<TargetStats>,
    ) -> Self {
        Self {
            target: target.to_string(),
            stats_file,
            interval,
            wait_timeout,
            tx,
        }
    }

    async fn report(&self) -> Option<TargetStats> {
        let content = match tokio::fs::read_to_string(&self.stats_file).await {
            Ok(c) => c,
            Err(e) => {
                target_error!(self.target, "failed to read {}: {}", self.stats_file.display(), e);
                return None;
            }
        };
        match parse_afl_stats(&self.target, &content) {
            Ok(stats) => Some(stats),
            Err(e) => {
                target_error!(self.target, "afl stats: {}", e);
                None
            }
        }
    }

    async fn watch(&self, stop: &mut Stop) -> Result<(), ServiceError> {
        target_info!(self.target, "waiting for fuzzer to initialize");
        let wait = wait_for_paths(
            &[self.stats_file.clone()],
            Duration::from_secs(1),
            self.wait_timeout,
            stop,
        )
        .await?;
        if wait == Wait::Stopped {
            return Ok(());
        }

        target_info!(self.target, "watching statistics");
        while !stop.sleep(self.interval).await {
            if let Some(stats) = self.report().await {
                target_debug!(
                    self.target,
                    "{:.2} execs/s, {} bugs",
                    stats.tests_per_second,
                    stats.bugs_found
                );
                if self.tx.send(stats).is_err() {
                    target_warn!(self.target, "stats aggregator is gone");
                }
            }
        }
        Ok(())
    }
}

impl Service for AflStatsService {
    fn name(&self) -> String {
        format!("afl-stats:{}", self.target)
    }

    fn serve(self: Arc<Self>, mut stop: Stop) -> ServeFuture {
        Box::pin(async move { self.watch(&mut stop).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::stop_pair;
    use std::fs;

    #[tokio::test]
    async fn reports_each_cycle_and_skips_bad_ones() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("fuzzer_stats");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let svc = Arc::new(AflStatsService::new(
            "png",
            file.clone(),
            Duration::from_millis(50),
            Duration::from_secs(10),
            tx,
        ));
        let (handle, stop) = stop_pair();
        let task = tokio::spawn(Arc::clone(&svc).serve(stop));

        fs::write(&file, "execs_per_sec : 10.0\nunique_crashes : 1\nunique_hangs : 0\n").unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.id, "png");
        assert_eq!(first.bugs_found, 1);

        fs::write(&file, "unique_crashes : 1\n").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        while rx.try_recv().is_ok() {}
        fs::write(&file, "execs_per_sec : 20.0\nunique_crashes : 2\nunique_hangs : 3\n").unwrap();
        let next = rx.recv().await.unwrap();
        assert_eq!(next.bugs_found, 5);
        assert!(!task.is_finished());

        handle.stop();
        task.await.unwrap().unwrap();
    }
}
