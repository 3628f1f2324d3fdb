use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

/// True when `path` is a regular file with size > 0. This predicate is the
/// completeness check for durable artifacts; a zero-length file counts as
/// absent (silent truncation is treated the same as never written).
pub fn non_empty(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    file.read_exact(&mut buffer)?;
    Ok(buffer == [0x1F, 0x8B]) // Gzip magic bytes
}

/// Copies `src` into `dest_dir`, keeping the file name.
pub async fn copy_into(src: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let name = src
        .file_name()
        .ok_or_else(|| anyhow!("source path has no file name: {}", src.display()))?;
    let dest = dest_dir.join(name);
    tokio::fs::copy(src, &dest).await?;
    Ok(dest)
}

/// Copies a file to `dest` via a `.part` sibling renamed into place, so a
/// kill mid-copy never leaves a plausible-looking artifact at `dest`.
pub async fn copy_then_rename(src: &Path, dest: &Path) -> Result<()> {
    let part = dest.with_extension(match dest.extension() {
        Some(ext) => format!("{}.part", ext.to_string_lossy()),
        None => "part".to_string(),
    });
    tokio::fs::copy(src, &part).await?;
    tokio::fs::rename(&part, dest).await?;
    Ok(())
}

/// Recursively copies a directory tree (reference database snapshots).
pub fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Deletes every file in `dir` whose name contains `needle`. Used to drop
/// stage byproducts (contaminant reads) as soon as a stage completes.
pub fn remove_matching(dir: &Path, needle: &str) -> Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file()
            && entry.file_name().to_string_lossy().contains(needle)
        {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn non_empty_rejects_missing_empty_and_dirs() {
        let dir = TempDir::new().unwrap();

        assert!(!non_empty(&dir.path().join("absent")));
        assert!(!non_empty(dir.path()));

        let empty = dir.path().join("empty");
        File::create(&empty).unwrap();
        assert!(!non_empty(&empty));

        let full = dir.path().join("full");
        File::create(&full).unwrap().write_all(b"reads").unwrap();
        assert!(non_empty(&full));
    }

    #[test]
    fn gzip_magic_is_detected() {
        let dir = TempDir::new().unwrap();
        let gz = dir.path().join("x.gz");
        File::create(&gz).unwrap().write_all(&[0x1F, 0x8B, 0x08]).unwrap();
        assert!(is_gzipped(&gz).unwrap());

        let plain = dir.path().join("x.txt");
        File::create(&plain).unwrap().write_all(b"@read1").unwrap();
        assert!(!is_gzipped(&plain).unwrap());
    }

    #[test]
    fn remove_matching_only_hits_named_files() {
        let dir = TempDir::new().unwrap();
        for name in ["S1_contam_1.fastq", "S1_contam_2.fastq", "S1_paired_1.fastq"] {
            File::create(dir.path().join(name)).unwrap();
        }
        let removed = remove_matching(dir.path(), "contam").unwrap();
        assert_eq!(removed, 2);
        assert!(dir.path().join("S1_paired_1.fastq").exists());
    }
}
