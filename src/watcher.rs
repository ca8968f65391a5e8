//! Crash and hang harvesting.
//!
//! Engines create their artifact directories lazily, so the watcher first waits
//! (bounded) for them to appear. Entries present at that point are considered
//! known. An artifact is identified by its path and content: a file that shows up
//! later, or that reappears at a known path with different content (the sync dir
//! was restored and the engine reused an id), is handed to storage.

use crate::{
    storage::{Category, FuzzerOutput, FuzzerPayload, StorageHandler},
    supervisor::{ServeFuture, Service, ServiceError, Stop},
    util::{blocking, file_name, wait_for_paths, Wait},
    HashMap,
};
use rustc_hash::FxHasher;
use std::{
    hash::Hasher,
    io,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

/// Any file whose name contains this is engine documentation.
const README: &str = "README.txt";

/// Cheap change detector, the content digest is only recomputed when it moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    ino: u64,
    len: u64,
    mtime: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy)]
struct Known {
    stamp: Stamp,
    digest: u64,
}

type Seen = HashMap<PathBuf, Known>;

fn digest(content: &[u8]) -> u64 {
    let mut h = FxHasher::default();
    h.write(content);
    h.write_usize(content.len());
    h.finish()
}

/// One artifact directory written by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchDir {
    pub path: PathBuf,
    pub category: Category,
    /// Files ending with this suffix are engine output, not payloads.
    pub output_suffix: Option<&'static str>,
}

impl WatchDir {
    pub fn payloads(path: PathBuf, category: Category) -> Self {
        Self {
            path,
            category,
            output_suffix: None,
        }
    }

    pub fn with_outputs(path: PathBuf, category: Category, suffix: &'static str) -> Self {
        Self {
            path,
            category,
            output_suffix: Some(suffix),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Artifact {
    Payload(FuzzerPayload),
    Output(FuzzerOutput),
}

pub struct CrashWatcher {
    target: String,
    revision: String,
    dirs: Vec<WatchDir>,
    storage: Arc<dyn StorageHandler>,
    interval: Duration,
    wait_timeout: Duration,
}

impl CrashWatcher {
    pub fn new(
        target: &str,
        revision: &str,
        dirs: Vec<WatchDir>,
        storage: Arc<dyn StorageHandler>,
        interval: Duration,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            target: target.to_string(),
            revision: revision.to_string(),
            dirs,
            storage,
            interval,
            wait_timeout,
        }
    }

    fn classify(&self, dir: &WatchDir, path: PathBuf) -> Artifact {
        let name = file_name(&path);
        match dir.output_suffix {
            Some(suffix) if name.ends_with(suffix) => Artifact::Output(FuzzerOutput {
                identifier: name.trim_end_matches(suffix).to_string(),
                output: path,
            }),
            _ => Artifact::Payload(FuzzerPayload {
                category: dir.category,
                location: path,
                revision: self.revision.clone(),
            }),
        }
    }

    /// New or changed regular files across all watched directories. Entries of
    /// files that disappeared are forgotten; a directory that is missing right now
    /// keeps its entries until it comes back.
    async fn scan(&self, seen: &mut Seen) -> io::Result<Vec<(usize, PathBuf)>> {
        let mut found = Vec::new();
        let mut next = Seen::default();
        for (i, dir) in self.dirs.iter().enumerate() {
            let mut entries = match tokio::fs::read_dir(&dir.path).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    let kept = seen
                        .iter()
                        .filter(|(p, _)| p.parent() == Some(dir.path.as_path()))
                        .map(|(p, k)| (p.clone(), *k));
                    next.extend(kept);
                    continue;
                }
                Err(e) => return Err(e),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if file_name(&path).contains(README) {
                    continue;
                }
                let meta = match entry.metadata().await {
                    Ok(m) => m,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e),
                };
                if !meta.is_file() {
                    continue;
                }
                let stamp = Stamp {
                    ino: meta.ino(),
                    len: meta.len(),
                    mtime: meta.modified().ok(),
                };
                let known = seen.get(&path).copied();
                if let Some(k) = known.filter(|k| k.stamp == stamp) {
                    next.insert(path, k);
                    continue;
                }
                let digest = match read_digest(&path).await {
                    Ok(d) => d,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e),
                };
                if known.map(|k| k.digest) != Some(digest) {
                    found.push((i, path.clone()));
                }
                next.insert(path, Known { stamp, digest });
            }
        }
        *seen = next;
        found.sort();
        Ok(found)
    }

    async fn save(&self, artifact: Artifact) {
        let storage = Arc::clone(&self.storage);
        let res = match artifact {
            Artifact::Payload(p) => {
                target_info!(self.target, "bug found: {} ({})", file_name(&p.location), p.category);
                blocking(move || storage.save_payload(&p)).await.map(|id| {
                    target_debug!(self.target, "payload stored as {}", id);
                })
            }
            Artifact::Output(o) => {
                target_debug!(self.target, "engine output for {}", o.identifier);
                blocking(move || storage.save_output(&o)).await
            }
        };
        if let Err(e) = res {
            target_error!(self.target, "could not save artifact: {}", e);
        }
    }

    async fn watch(&self, stop: &mut Stop) -> Result<(), ServiceError> {
        let paths = self.dirs.iter().map(|d| d.path.clone()).collect::<Vec<_>>();
        target_info!(self.target, "crash watcher waiting for crash directories");
        if wait_for_paths(&paths, self.interval, self.wait_timeout, stop).await? == Wait::Stopped {
            return Ok(());
        }

        let mut seen = Seen::default();
        self.scan(&mut seen).await?;
        target_info!(
            self.target,
            "watching crash directories, {} known artifacts",
            seen.len()
        );

        loop {
            if stop.sleep(self.interval).await {
                return Ok(());
            }
            let found = match self.scan(&mut seen).await {
                Ok(f) => f,
                Err(e) => {
                    target_warn!(self.target, "crash scan failed: {}", e);
                    continue;
                }
            };
            for (i, path) in found {
                let artifact = self.classify(&self.dirs[i], path);
                self.save(artifact).await;
            }
        }
    }
}

async fn read_digest(path: &Path) -> io::Result<u64> {
    tokio::fs::read(path).await.map(|c| digest(&c))
}

impl Service for CrashWatcher {
    fn name(&self) -> String {
        format!("crash-watcher:{}", self.target)
    }

    fn serve(self: Arc<Self>, mut stop: Stop) -> ServeFuture {
        Box::pin(async move { self.watch(&mut stop).await })
    }
}
