//! Helper functions to deal with the filesystem and serial ports.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use glob_match::glob_match;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha1::{Digest, Sha1};
use walkdir::WalkDir;

use crate::error::{Error, Result};

mod ports;

pub use ports::select_port;
pub(crate) use ports::open_and_setup_port;

// =============================================================================
// Filesystem helpers
// =============================================================================

/// Recursively enumerate the files under `base`, returning their paths
/// relative to `base` with `/` separators. Directories are not listed.
pub fn enumerate_dir(base: &Path) -> Result<Vec<String>> {
    let mut list = Vec::new();
    for entry in WalkDir::new(base).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            Error::io(
                format!("enumerating {}", base.display()),
                e.into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk error")),
            )
        })?;
        if entry.file_type().is_file() {
            let rel = entry
                .path()
                .strip_prefix(base)
                .expect("walked entries live under their base")
                .to_string_lossy()
                .replace('\\', "/");
            list.push(rel);
        }
    }
    Ok(list)
}

/// SHA-1 of a byte slice, as lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex_digest(hasher)
}

/// SHA-1 of a file's contents, as lowercase hex.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_digest(hasher))
}

pub(crate) fn hex_digest(hasher: Sha1) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Read and deserialize a JSON document.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data =
        fs::read(path).map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    serde_json::from_slice(&data).map_err(|e| Error::parse(path.display().to_string(), e))
}

/// Serialize `item` as pretty-printed JSON and write it to `path`.
pub fn write_json<T: Serialize>(path: &Path, item: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(item)
        .map_err(|e| Error::parse(path.display().to_string(), e))?;
    fs::write(path, data).map_err(|e| Error::io(format!("writing {}", path.display()), e))
}

/// Copy `src` to `dst`, optionally hashing the copied bytes. Returns the
/// SHA-1 hex of the content when `hash` is set.
pub fn copy_file(src: &Path, dst: &Path, hash: bool) -> Result<Option<String>> {
    let mut reader =
        File::open(src).map_err(|e| Error::io(format!("opening {}", src.display()), e))?;
    let mut writer =
        File::create(dst).map_err(|e| Error::io(format!("creating {}", dst.display()), e))?;
    let mut hasher = hash.then(|| Sha1::new());
    let mut buf = [0u8; 8192];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| Error::io(format!("reading {}", src.display()), e))?;
        if n == 0 {
            break;
        }
        if let Some(h) = hasher.as_mut() {
            h.update(&buf[..n]);
        }
        writer
            .write_all(&buf[..n])
            .map_err(|e| Error::io(format!("writing {}", dst.display()), e))?;
    }
    Ok(hasher.map(hex_digest))
}

/// Delete everything inside `dir`, keeping the directory itself. The
/// directory is created first if it does not exist.
pub fn remove_dir_contents(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return fs::create_dir_all(dir)
            .map_err(|e| Error::io(format!("creating {}", dir.display()), e));
    }
    let entries =
        fs::read_dir(dir).map_err(|e| Error::io(format!("reading {}", dir.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(format!("reading {}", dir.display()), e))?;
        let path = entry.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|e| Error::io(format!("removing {}", path.display()), e))?;
    }
    Ok(())
}

/// Expand a filesystem glob such as `firmware/*` into the matching paths.
///
/// The leading glob-free components are used as the walk base so that a
/// pattern never forces a scan of the whole working directory. Matches are
/// returned in deterministic traversal order and may be files or
/// directories; callers filter for what they need.
pub fn expand_path_glob(pattern: &str) -> Vec<PathBuf> {
    let (base, rest) = split_glob_base(pattern);
    if rest.is_empty() {
        return if base.exists() { vec![base] } else { Vec::new() };
    }
    let mut matches = Vec::new();
    for entry in WalkDir::new(&base)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .flatten()
    {
        let rel = match entry.path().strip_prefix(&base) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        if glob_match(&rest, &rel) {
            matches.push(entry.into_path());
        }
    }
    matches
}

fn split_glob_base(pattern: &str) -> (PathBuf, String) {
    let mut base = PathBuf::new();
    let mut rest: Vec<&str> = Vec::new();
    for part in pattern.split('/') {
        if rest.is_empty() && !part.contains(['*', '?', '[', '{']) {
            base.push(part);
        } else {
            rest.push(part);
        }
    }
    if base.as_os_str().is_empty() {
        base = PathBuf::from(".");
    }
    (base, rest.join("/"))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn hash_bytes_known_vector() {
        // sha1("abc")
        assert_eq!(hash_bytes(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn hash_file_matches_hash_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, b"espore").unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"espore"));
    }

    #[test]
    fn enumerate_dir_is_relative_and_recursive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub/inner")).unwrap();
        fs::write(dir.path().join("a.lua"), "").unwrap();
        fs::write(dir.path().join("sub/inner/b.txt"), "").unwrap();
        let mut list = enumerate_dir(dir.path()).unwrap();
        list.sort();
        assert_eq!(list, vec!["a.lua".to_string(), "sub/inner/b.txt".to_string()]);
    }

    #[test]
    fn remove_dir_contents_keeps_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/file"), "x").unwrap();
        fs::write(dir.path().join("top"), "y").unwrap();
        remove_dir_contents(dir.path()).unwrap();
        assert!(dir.path().exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn expand_path_glob_matches_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("libs/core")).unwrap();
        fs::create_dir_all(dir.path().join("libs/net")).unwrap();
        fs::write(dir.path().join("libs/readme.txt"), "").unwrap();
        let pattern = format!("{}/libs/*", dir.path().display());
        let found = expand_path_glob(&pattern);
        let dirs: Vec<_> = found.iter().filter(|p| p.is_dir()).collect();
        assert_eq!(dirs.len(), 2);
    }

    #[test]
    fn expand_path_glob_literal_path() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().display().to_string();
        assert_eq!(expand_path_glob(&pattern), vec![dir.path().to_path_buf()]);
        assert!(expand_path_glob("/definitely/not/here").is_empty());
    }
}
