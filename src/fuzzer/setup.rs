//! Preparing a target's execution and sync directories.

use crate::{
    archive,
    cluster::FUZZER_OUTPUT_DIR,
    storage::StorageHandler,
    supervisor::ServiceError,
};
use std::{fmt, fs, io, path::Path, str::FromStr};

/// Seed corpus location inside the fuzzer unit.
pub const FUZZER_INPUT_DIR: &str = "/root/fuzz_in";
/// Name of the environment file inside a target bundle.
pub const ENV_FILE: &str = "environment";

/// Engine input/output flags derived from the setup outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoOptions {
    /// Seed directory, `None` when resuming from a previous sync dir.
    pub input: Option<String>,
    pub output: String,
}

impl IoOptions {
    pub fn fresh() -> Self {
        Self {
            input: Some(FUZZER_INPUT_DIR.to_string()),
            output: FUZZER_OUTPUT_DIR.to_string(),
        }
    }

    pub fn resume() -> Self {
        Self {
            input: None,
            output: FUZZER_OUTPUT_DIR.to_string(),
        }
    }

    pub fn is_resume(&self) -> bool {
        self.input.is_none()
    }
}

impl fmt::Display for IoOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.input {
            Some(input) => write!(f, "-i {} -o {}", input, self.output),
            None => write!(f, "-i- -o {}", self.output),
        }
    }
}

impl FromStr for IoOptions {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let items = s.split_whitespace().collect::<Vec<_>>();
        match items.as_slice() {
            ["-i", input, "-o", output] => Ok(IoOptions {
                input: Some(input.to_string()),
                output: output.to_string(),
            }),
            ["-i-", "-o", output] => Ok(IoOptions {
                input: None,
                output: output.to_string(),
            }),
            _ => Err(ServiceError::Config(format!("malformed io options: '{}'", s))),
        }
    }
}

fn reset_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => (),
    }
    fs::create_dir_all(dir)
}

/// Unpacks the bundle into a clean `target_dir` and restores the latest backup
/// into a clean `sync_dir` when one exists. Safe to run again after a crash.
pub fn initial_setup(
    storage: &dyn StorageHandler,
    target_dir: &Path,
    sync_dir: &Path,
) -> Result<IoOptions, ServiceError> {
    reset_dir(target_dir)?;
    reset_dir(sync_dir)?;

    let bundle = storage.get_target()?;
    archive::unzip(&bundle, target_dir)?;
    fs::remove_file(&bundle)?;

    if !storage.backup_exists()? {
        return Ok(IoOptions::fresh());
    }
    let backup = storage.get_backup()?;
    archive::unzip(&backup, sync_dir)?;
    fs::remove_file(&backup)?;
    Ok(IoOptions::resume())
}

/// Variables declared in a target's environment file, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment(Vec<(String, String)>);

impl Environment {
    pub fn parse(content: &str) -> Self {
        let mut vars: Vec<(String, String)> = Vec::new();
        for line in content.lines().map(|l| l.trim()) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
            let (key, val) = match line.find('=') {
                Some(i) => (line[..i].trim(), line[i + 1..].trim()),
                None => continue,
            };
            if key.is_empty() {
                continue;
            }
            let val = unquote(val);
            match vars.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = val,
                None => vars.push((key.to_string(), val)),
            }
        }
        Environment(vars)
    }

    pub fn load(path: &Path) -> Result<Self, ServiceError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ServiceError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Ok(Self::parse(&content))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.0
    }
}

fn unquote(val: &str) -> String {
    let bytes = val.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == b'"' && last == b'"' {
            return val[1..val.len() - 1]
                .replace("\\n", "\n")
                .replace("\\\"", "\"");
        }
        if first == b'\'' && last == b'\'' {
            return val[1..val.len() - 1].to_string();
        }
    }
    match val.find(" #") {
        Some(i) => val[..i].trim_end().to_string(),
        None => val.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Paths, storage::LocalStorage};
    use std::path::PathBuf;
    use walkdir::WalkDir;

    fn files_under(dir: &Path) -> Vec<PathBuf> {
        let mut v = WalkDir::new(dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().strip_prefix(dir).unwrap().to_path_buf())
            .collect::<Vec<_>>();
        v.sort();
        v
    }

    fn seed_bundle(root: &Path) {
        let bundle_src = root.join("bundle_src");
        fs::create_dir_all(bundle_src.join("corpus")).unwrap();
        fs::write(bundle_src.join(ENV_FILE), "AFL_FUZZ=afl-fuzz\n").unwrap();
        fs::write(bundle_src.join("build_steps"), "#!/bin/sh\nmake\n").unwrap();
        archive::zip_dir(&bundle_src, &root.join("targets/png.zip")).unwrap();
    }

    #[test]
    fn io_options_text() {
        assert_eq!(IoOptions::fresh().to_string(), "-i /root/fuzz_in -o /root/fuzz_out");
        assert_eq!(IoOptions::resume().to_string(), "-i- -o /root/fuzz_out");
        let back: IoOptions = "-i- -o /root/fuzz_out".parse().unwrap();
        assert!(back.is_resume());
        assert!("-o".parse::<IoOptions>().is_err());
    }

    #[test]
    fn fresh_setup_without_backup() {
        let tmp = tempfile::tempdir().unwrap();
        seed_bundle(tmp.path());
        let paths = Paths::new(tmp.path());
        let storage = LocalStorage::new(paths.clone(), "png");
        let io = initial_setup(&storage, &paths.target_dir("png"), &paths.sync_dir("png")).unwrap();
        assert_eq!(io, IoOptions::fresh());
        assert!(paths.target_dir("png").join(ENV_FILE).is_file());
        assert!(!tmp.path().join("staging/png/target.zip").exists());
    }

    #[test]
    fn backup_restore_resumes() {
        let tmp = tempfile::tempdir().unwrap();
        seed_bundle(tmp.path());
        let paths = Paths::new(tmp.path());
        let storage = LocalStorage::new(paths.clone(), "png");
        let sync = paths.sync_dir("png");

        fs::create_dir_all(sync.join("queue")).unwrap();
        fs::create_dir_all(sync.join("crashes")).unwrap();
        fs::write(sync.join("fuzzer_stats"), "execs_per_sec : 10\n").unwrap();
        fs::write(sync.join("queue/id:000000,orig:seed"), "seed").unwrap();
        fs::write(sync.join("crashes/id:000000,sig:11"), "boom").unwrap();
        let before = files_under(&sync);

        archive::zip_dir(&sync, &storage.backup_location()).unwrap();
        storage.make_backup().unwrap();

        // a second run must not duplicate or keep stale files
        fs::write(sync.join("stale"), "x").unwrap();
        for _ in 0..2 {
            let io = initial_setup(&storage, &paths.target_dir("png"), &sync).unwrap();
            assert!(io.is_resume());
            assert_eq!(io.to_string(), "-i- -o /root/fuzz_out");
            assert_eq!(files_under(&sync), before);
        }
        assert_eq!(fs::read_to_string(sync.join("crashes/id:000000,sig:11")).unwrap(), "boom");
    }

    #[test]
    fn environment_file() {
        let env = Environment::parse(
            r#"
# afl settings
AFL_FUZZ=/usr/local/bin/afl-fuzz
export AFL_MEMORY_LIMIT="none"
AFL_OPTIONS='-d -x /root/fuzzer/dict'
AFL_BINARY=/root/fuzzer/png_fuzz # harness
EMPTY=
garbage line
AFL_FUZZ=afl-fuzz
"#,
        );
        assert_eq!(env.get("AFL_FUZZ"), Some("afl-fuzz"));
        assert_eq!(env.get("AFL_MEMORY_LIMIT"), Some("none"));
        assert_eq!(env.get("AFL_OPTIONS"), Some("-d -x /root/fuzzer/dict"));
        assert_eq!(env.get("AFL_BINARY"), Some("/root/fuzzer/png_fuzz"));
        assert_eq!(env.get("EMPTY"), Some(""));
        assert_eq!(env.vars().len(), 5);
        assert!(Environment::load(Path::new("/nonexistent/environment"))
            .unwrap_err()
            .is_permanent());
    }
}
