use super::{FuzzerOutput, FuzzerPayload, StorageError, StorageHandler};
use crate::config::Paths;
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

const BACKUP_NAME: &str = "backup.zip";

/// Filesystem storage under the work dir.
///
/// ```text
/// targets/<id>.zip               bundle
/// crashes/<id>/backup.zip        latest backup
/// crashes/<id>/<name>            artifact
/// crashes/<id>/<name>.meta.json  artifact category and revision
/// staging/<id>/                  archives in flight
/// ```
pub struct LocalStorage {
    paths: Paths,
    target: String,
}

#[derive(Serialize)]
struct ArtifactMeta<'a> {
    target: &'a str,
    category: String,
    revision: &'a str,
}

impl LocalStorage {
    pub fn new(paths: Paths, target: &str) -> Self {
        Self {
            paths,
            target: target.to_string(),
        }
    }

    fn crash_dir(&self) -> PathBuf {
        self.paths.crashes.join(&self.target)
    }

    fn staging_dir(&self) -> PathBuf {
        self.paths.staging.join(&self.target)
    }

    fn stored_backup(&self) -> PathBuf {
        self.crash_dir().join(BACKUP_NAME)
    }

    fn store(&self, src: &Path, what: &'static str) -> Result<PathBuf, StorageError> {
        if !src.is_file() {
            return Err(StorageError::Missing {
                what,
                path: src.display().to_string(),
            });
        }
        let name = src.file_name().ok_or_else(|| StorageError::Missing {
            what,
            path: src.display().to_string(),
        })?;
        let dir = self.crash_dir();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        let dst = dir.join(name);
        copy(src, &dst)?;
        Ok(dst)
    }
}

fn copy(src: &Path, dst: &Path) -> Result<(), StorageError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }
    fs::copy(src, dst).map_err(|e| StorageError::io(src, e))?;
    Ok(())
}

impl StorageHandler for LocalStorage {
    fn get_target(&self) -> Result<PathBuf, StorageError> {
        let bundle = self.paths.targets.join(format!("{}.zip", self.target));
        if !bundle.is_file() {
            return Err(StorageError::Missing {
                what: "target bundle",
                path: bundle.display().to_string(),
            });
        }
        let dst = self.staging_dir().join("target.zip");
        copy(&bundle, &dst)?;
        Ok(dst)
    }

    fn backup_exists(&self) -> Result<bool, StorageError> {
        let backup = self.stored_backup();
        match fs::metadata(&backup) {
            Ok(m) => Ok(m.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(&backup, e)),
        }
    }

    fn get_backup(&self) -> Result<PathBuf, StorageError> {
        let backup = self.stored_backup();
        if !backup.is_file() {
            return Err(StorageError::Missing {
                what: "backup",
                path: backup.display().to_string(),
            });
        }
        let dst = self.staging_dir().join("restore.zip");
        copy(&backup, &dst)?;
        Ok(dst)
    }

    fn make_backup(&self) -> Result<(), StorageError> {
        let src = self.backup_location();
        let ret = if src.is_file() {
            let tmp = self.crash_dir().join("backup.zip.part");
            copy(&src, &tmp).and_then(|_| {
                let dst = self.stored_backup();
                fs::rename(&tmp, &dst).map_err(|e| StorageError::io(&dst, e))
            })
        } else {
            Err(StorageError::Missing {
                what: "backup archive",
                path: src.display().to_string(),
            })
        };
        let _ = fs::remove_file(&src);
        ret
    }

    fn save_payload(&self, payload: &FuzzerPayload) -> Result<String, StorageError> {
        let dst = self.store(&payload.location, "payload")?;
        let id = dst
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let meta = ArtifactMeta {
            target: &self.target,
            category: payload.category.to_string(),
            revision: &payload.revision,
        };
        let meta_path = self.crash_dir().join(format!("{}.meta.json", id));
        let content = serde_json::to_vec_pretty(&meta)?;
        fs::write(&meta_path, content).map_err(|e| StorageError::io(&meta_path, e))?;
        Ok(format!("{}/{}", self.target, id))
    }

    fn save_output(&self, output: &FuzzerOutput) -> Result<(), StorageError> {
        self.store(&output.output, "output")?;
        Ok(())
    }

    fn backup_location(&self) -> PathBuf {
        self.staging_dir().join(BACKUP_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Category;

    fn storage(root: &Path) -> LocalStorage {
        LocalStorage::new(Paths::new(root), "png")
    }

    #[test]
    fn bundle_is_staged() {
        let tmp = tempfile::tempdir().unwrap();
        let s = storage(tmp.path());
        assert!(s.get_target().is_err());
        fs::create_dir_all(tmp.path().join("targets")).unwrap();
        fs::write(tmp.path().join("targets/png.zip"), "zip").unwrap();
        let staged = s.get_target().unwrap();
        assert!(staged.starts_with(tmp.path().join("staging/png")));
        assert_eq!(fs::read_to_string(staged).unwrap(), "zip");
    }

    #[test]
    fn backup_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let s = storage(tmp.path());
        assert!(!s.backup_exists().unwrap());
        assert!(s.make_backup().is_err());

        let loc = s.backup_location();
        fs::create_dir_all(loc.parent().unwrap()).unwrap();
        fs::write(&loc, "v1").unwrap();
        s.make_backup().unwrap();
        assert!(!loc.exists());
        assert!(s.backup_exists().unwrap());

        fs::write(&loc, "v2").unwrap();
        s.make_backup().unwrap();
        let restored = s.get_backup().unwrap();
        assert_eq!(fs::read_to_string(restored).unwrap(), "v2");
    }

    #[test]
    fn payload_with_meta() {
        let tmp = tempfile::tempdir().unwrap();
        let s = storage(tmp.path());
        let crash = tmp.path().join("id:000001,sig:11");
        fs::write(&crash, [0xffu8; 4]).unwrap();
        let id = s
            .save_payload(&FuzzerPayload {
                category: Category::Hang,
                location: crash,
                revision: "abc".to_string(),
            })
            .unwrap();
        assert_eq!(id, "png/id:000001,sig:11");
        let meta = fs::read_to_string(tmp.path().join("crashes/png/id:000001,sig:11.meta.json"))
            .unwrap();
        let meta: serde_json::Value = serde_json::from_str(&meta).unwrap();
        assert_eq!(meta["category"], "HANG");
        assert_eq!(meta["revision"], "abc");
    }
}
