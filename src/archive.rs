//! Zip packing and unpacking for target bundles and backups.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::Path,
};
use thiserror::Error;
use walkdir::WalkDir;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive io: {0}")]
    Io(#[from] io::Error),
    #[error("zip: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("walk {0}")]
    Walk(#[from] walkdir::Error),
    #[error("unsafe entry in archive: {0}")]
    UnsafeEntry(String),
}

/// Packs every regular file under `dir` into `out`, paths relative to `dir`.
/// `out` itself is skipped when it lives inside `dir`. Returns the number of files packed.
pub fn zip_dir(dir: &Path, out: &Path) -> Result<usize, ArchiveError> {
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = out.with_extension("zip.part");
    let mut zip = ZipWriter::new(File::create(&tmp)?);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mut n = 0;
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            // files vanish while the engine rotates its queue
            Err(e) if e.io_error().map(|e| e.kind()) == Some(io::ErrorKind::NotFound) => continue,
            Err(e) => return Err(e.into()),
        };
        if !entry.file_type().is_file() || entry.path() == out || entry.path() == tmp {
            continue;
        }
        let bytes = match fs::read(entry.path()) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        let rel = entry.path().strip_prefix(dir).unwrap_or_else(|_| entry.path());
        zip.start_file(rel.to_string_lossy().replace('\\', "/"), options)?;
        zip.write_all(&bytes)?;
        n += 1;
    }
    zip.finish()?;
    fs::rename(&tmp, out)?;
    Ok(n)
}

/// Extracts `archive` into `dir`, creating it when missing.
pub fn unzip(archive: &Path, dir: &Path) -> Result<usize, ArchiveError> {
    fs::create_dir_all(dir)?;
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    let mut n = 0;
    for i in 0..zip.len() {
        let mut f = zip.by_index(i)?;
        let rel = f
            .enclosed_name()
            .ok_or_else(|| ArchiveError::UnsafeEntry(f.name().to_string()))?;
        let out = dir.join(rel);
        if f.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut dst = File::create(&out)?;
        io::copy(&mut f, &mut dst)?;
        #[cfg(unix)]
        if let Some(mode) = f.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out, fs::Permissions::from_mode(mode))?;
        }
        n += 1;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

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

    #[test]
    fn pack_and_unpack() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("queue")).unwrap();
        fs::write(src.join("fuzzer_stats"), "execs_per_sec : 1\n").unwrap();
        fs::write(src.join("queue/id:000000"), [0u8, 1, 2]).unwrap();

        let out = tmp.path().join("out/backup.zip");
        assert_eq!(zip_dir(&src, &out).unwrap(), 2);
        let dst = tmp.path().join("dst");
        assert_eq!(unzip(&out, &dst).unwrap(), 2);
        assert_eq!(files_under(&src), files_under(&dst));
        assert_eq!(fs::read(dst.join("queue/id:000000")).unwrap(), vec![0u8, 1, 2]);
    }

    #[test]
    fn archive_inside_source_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a"), "a").unwrap();
        let out = tmp.path().join("backup.zip");
        assert_eq!(zip_dir(tmp.path(), &out).unwrap(), 1);
        assert_eq!(zip_dir(tmp.path(), &out).unwrap(), 1);
    }
}
