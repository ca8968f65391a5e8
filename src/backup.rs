//! Periodic snapshots of a target's sync directory.

use crate::{
    archive,
    storage::StorageHandler,
    supervisor::{ServeFuture, Service, ServiceError, Stop},
    util::blocking,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared between a target's runner and its backup service. The runner holds it
/// exclusively while it rebuilds the sync directory; backups only run while nobody does.
#[derive(Debug, Clone, Default)]
pub struct SyncDirLock(Arc<RwLock<()>>);

impl SyncDirLock {
    /// Waits for a running backup to finish, then blocks new ones until dropped.
    pub async fn setup(&self) -> RwLockWriteGuard<'_, ()> {
        self.0.write().await
    }

    /// `None` while the sync directory is being set up.
    pub fn try_backup(&self) -> Option<RwLockReadGuard<'_, ()>> {
        self.0.try_read().ok()
    }
}

pub struct BackupService {
    target: String,
    sync_dir: PathBuf,
    storage: Arc<dyn StorageHandler>,
    interval: Duration,
    lock: SyncDirLock,
}

impl BackupService {
    pub fn new(
        target: &str,
        sync_dir: PathBuf,
        storage: Arc<dyn StorageHandler>,
        interval: Duration,
        lock: SyncDirLock,
    ) -> Self {
        Self {
            target: target.to_string(),
            sync_dir,
            storage,
            interval,
            lock,
        }
    }

    /// Archives whatever the engine has on disk right now and stores it,
    /// replacing the previous backup. Returns `None` without touching the
    /// stored backup while the sync directory is being set up.
    pub async fn backup_once(&self) -> Result<Option<usize>, ServiceError> {
        let _guard = match self.lock.try_backup() {
            Some(g) => g,
            None => return Ok(None),
        };
        let storage = Arc::clone(&self.storage);
        let sync_dir = self.sync_dir.clone();
        blocking(move || -> Result<usize, ServiceError> {
            let n = archive::zip_dir(&sync_dir, &storage.backup_location())?;
            storage.make_backup()?;
            Ok(n)
        })
        .await
        .map(Some)
    }

    async fn run(&self, stop: &mut Stop) -> Result<(), ServiceError> {
        target_info!(self.target, "backups every {:?}", self.interval);
        while !stop.sleep(self.interval).await {
            if !self.sync_dir.is_dir() {
                target_debug!(self.target, "nothing to back up yet");
                continue;
            }
            match self.backup_once().await {
                Ok(Some(n)) => target_info!(self.target, "backup done, {} files", n),
                Ok(None) => target_debug!(self.target, "sync dir is being set up, backup skipped"),
                Err(e) => target_error!(self.target, "backup failed: {}", e),
            }
        }
        Ok(())
    }
}

impl Service for BackupService {
    fn name(&self) -> String {
        format!("backup:{}", self.target)
    }

    fn serve(self: Arc<Self>, mut stop: Stop) -> ServeFuture {
        Box::pin(async move { self.run(&mut stop).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Paths, storage::LocalStorage, supervisor::stop_pair};
    use std::fs;

    #[tokio::test]
    async fn backups_replace_each_other() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        let sync = paths.sync_dir("png");
        fs::create_dir_all(sync.join("queue")).unwrap();
        fs::write(sync.join("queue/id:000000"), "seed").unwrap();
        let storage = Arc::new(LocalStorage::new(paths.clone(), "png"));
        let svc = BackupService::new(
            "png",
            sync.clone(),
            storage.clone(),
            Duration::from_secs(600),
            SyncDirLock::default(),
        );

        assert_eq!(svc.backup_once().await.unwrap(), Some(1));
        fs::write(sync.join("queue/id:000001"), "more").unwrap();
        assert_eq!(svc.backup_once().await.unwrap(), Some(2));

        assert!(storage.backup_exists().unwrap());
        let restored = tmp.path().join("restored");
        archive::unzip(&storage.get_backup().unwrap(), &restored).unwrap();
        assert_eq!(fs::read_to_string(restored.join("queue/id:000001")).unwrap(), "more");
        assert!(!storage.backup_location().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_sync_dir_is_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        let storage = Arc::new(LocalStorage::new(paths.clone(), "png"));
        let svc = Arc::new(BackupService::new(
            "png",
            paths.sync_dir("png"),
            storage,
            Duration::from_secs(600),
            SyncDirLock::default(),
        ));
        let (handle, stop) = stop_pair();
        let task = tokio::spawn(Arc::clone(&svc).serve(stop));
        tokio::time::sleep(Duration::from_secs(1900)).await;
        handle.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn no_backup_while_sync_dir_is_set_up() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        let sync = paths.sync_dir("png");
        fs::create_dir_all(sync.join("queue")).unwrap();
        fs::write(sync.join("queue/id:000000"), "seed").unwrap();
        fs::write(sync.join("queue/id:000001"), "more").unwrap();
        let storage = Arc::new(LocalStorage::new(paths.clone(), "png"));
        let lock = SyncDirLock::default();
        let svc = BackupService::new(
            "png",
            sync.clone(),
            storage.clone(),
            Duration::from_secs(600),
            lock.clone(),
        );
        assert_eq!(svc.backup_once().await.unwrap(), Some(2));

        {
            // sync dir wiped, restore not finished yet
            let _setup = lock.setup().await;
            fs::remove_dir_all(&sync).unwrap();
            fs::create_dir_all(&sync).unwrap();
            assert_eq!(svc.backup_once().await.unwrap(), None);
        }

        let restored = tmp.path().join("restored");
        archive::unzip(&storage.get_backup().unwrap(), &restored).unwrap();
        assert_eq!(fs::read_to_string(restored.join("queue/id:000000")).unwrap(), "seed");
        assert_eq!(fs::read_to_string(restored.join("queue/id:000001")).unwrap(), "more");

        // empty but fully set up sync dir is backed up again
        assert_eq!(svc.backup_once().await.unwrap(), Some(0));
    }
}
