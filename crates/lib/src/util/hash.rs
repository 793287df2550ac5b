//! Hashing utilities for keys and content fingerprints.
//!
//! This module provides:
//! - `ObjectHash`: a truncated 20-character hash used as artifact/rule keys
//! - `ContentHash`: a full 64-character hash for content fingerprints
//! - `Hashable`: stable hashing of any serializable value
//! - `hash_directory()` / `hash_file()` / `hash_bytes()`: content hashing

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::OBJ_HASH_PREFIX_LEN;

pub type HashError = serde_json::Error;

/// A truncated hash identifying a unique object.
///
/// The hash is a 20-character truncated SHA-256 of the JSON-serialized
/// value. This provides sufficient collision resistance while keeping
/// keys readable in logs and ledger dumps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Compute the truncated object hash of any serializable value.
pub fn object_hash_of<T: Serialize + ?Sized>(value: &T) -> Result<ObjectHash, HashError> {
  let serialized = serde_json::to_string(value)?;
  let mut hasher = Sha256::new();
  hasher.update(serialized.as_bytes());
  let full = hex::encode(hasher.finalize());
  Ok(ObjectHash(full[..OBJ_HASH_PREFIX_LEN].to_string()))
}

pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ObjectHash, HashError> {
    object_hash_of(self)
  }
}

/// Hash a set of object hashes independent of input order.
///
/// Keys are sorted before hashing, so two sets with the same members
/// always produce the same digest.
pub fn hash_key_set<'a, I>(keys: I) -> ObjectHash
where
  I: IntoIterator<Item = &'a ObjectHash>,
{
  let mut sorted: Vec<&str> = keys.into_iter().map(|k| k.0.as_str()).collect();
  sorted.sort_unstable();

  let mut hasher = Sha256::new();
  for key in sorted {
    hasher.update(key.as_bytes());
    hasher.update(b"\n");
  }
  let full = hex::encode(hasher.finalize());
  ObjectHash(full[..OBJ_HASH_PREFIX_LEN].to_string())
}

/// A full 64-character SHA-256 hash used for content fingerprints.
///
/// Unlike `ObjectHash`, which is truncated for readable keys,
/// `ContentHash` keeps the full digest for maximum collision resistance
/// when deciding whether an artifact changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error during filesystem content hashing.
#[derive(Debug, thiserror::Error)]
pub enum FsHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// Compute a deterministic hash of a directory's contents.
///
/// The hash covers file contents, directory structure, and symlink
/// targets — never metadata like timestamps or permissions. Entries are
/// sorted by path for determinism.
pub fn hash_directory(path: &Path, exclude: &[&str]) -> Result<ContentHash, FsHashError> {
  let mut entries: Vec<(String, String)> = Vec::new();

  let walker = WalkDir::new(path).sort_by_file_name().into_iter().filter_entry(|e| {
    e.file_name()
      .to_str()
      .map(|name| !exclude.contains(&name))
      .unwrap_or(true)
  });

  for entry in walker {
    let entry = entry.map_err(|e| FsHashError::WalkDir { message: e.to_string() })?;
    let entry_path = entry.path();

    let rel_path = entry_path
      .strip_prefix(path)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .to_string();

    // Skip the root directory itself
    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    let entry_hash = if file_type.is_file() {
      let content_hash = hash_file(entry_path)?;
      format!("F:{}:{}", rel_path, content_hash.0)
    } else if file_type.is_dir() {
      format!("D:{}", rel_path)
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|e| FsHashError::ReadSymlink {
        path: entry_path.display().to_string(),
        message: e.to_string(),
      })?;
      let target_hash = hash_bytes(target.to_string_lossy().as_bytes());
      format!("L:{}:{}", rel_path, target_hash.0)
    } else {
      // Skip special files (sockets, devices, etc.)
      continue;
    };

    entries.push((rel_path, entry_hash));
  }

  entries.sort_by(|a, b| a.0.cmp(&b.0));

  let mut hasher = Sha256::new();
  for (_, entry_hash) in entries {
    hasher.update(entry_hash.as_bytes());
    hasher.update(b"\n");
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash, FsHashError> {
  let mut file = fs::File::open(path).map_err(|e| FsHashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  })?;

  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(|e| FsHashError::ReadFile {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::tempdir;

  #[derive(Serialize)]
  struct Sample {
    name: String,
    count: u32,
  }

  impl Hashable for Sample {}

  #[test]
  fn object_hash_is_stable_and_truncated() {
    let a = Sample {
      name: "out.txt".to_string(),
      count: 3,
    };
    let b = Sample {
      name: "out.txt".to_string(),
      count: 3,
    };

    let ha = a.compute_hash().unwrap();
    let hb = b.compute_hash().unwrap();

    assert_eq!(ha, hb);
    assert_eq!(ha.0.len(), OBJ_HASH_PREFIX_LEN);
  }

  #[test]
  fn object_hash_changes_with_content() {
    let a = Sample {
      name: "out.txt".to_string(),
      count: 3,
    };
    let b = Sample {
      name: "out.txt".to_string(),
      count: 4,
    };

    assert_ne!(a.compute_hash().unwrap(), b.compute_hash().unwrap());
  }

  #[test]
  fn key_set_hash_ignores_order() {
    let a = ObjectHash("aaa".to_string());
    let b = ObjectHash("bbb".to_string());
    let c = ObjectHash("ccc".to_string());

    let h1 = hash_key_set([&a, &b, &c]);
    let h2 = hash_key_set([&c, &a, &b]);
    let h3 = hash_key_set([&a, &b]);

    assert_eq!(h1, h2);
    assert_ne!(h1, h3);
  }

  #[test]
  fn hash_empty_directory() {
    let temp = tempdir().unwrap();
    let hash = hash_directory(temp.path(), &[]).unwrap();
    assert_eq!(hash.0.len(), 64);
  }

  #[test]
  fn hash_is_deterministic() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("a.txt"), "content a").unwrap();
    fs::write(temp.path().join("b.txt"), "content b").unwrap();

    let hash1 = hash_directory(temp.path(), &[]).unwrap();
    let hash2 = hash_directory(temp.path(), &[]).unwrap();

    assert_eq!(hash1, hash2);
  }

  #[test]
  fn hash_changes_with_content() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("file.txt"), "original").unwrap();
    let hash1 = hash_directory(temp.path(), &[]).unwrap();

    fs::write(temp.path().join("file.txt"), "modified").unwrap();
    let hash2 = hash_directory(temp.path(), &[]).unwrap();

    assert_ne!(hash1, hash2);
  }

  #[test]
  fn hash_respects_exclusions() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("file.txt"), "content").unwrap();
    let hash1 = hash_directory(temp.path(), &[]).unwrap();

    fs::create_dir(temp.path().join("tmp")).unwrap();
    fs::write(temp.path().join("tmp/scratch"), "scratch").unwrap();

    let hash2 = hash_directory(temp.path(), &["tmp"]).unwrap();

    assert_eq!(hash1, hash2);
  }

  #[test]
  fn hash_file_works() {
    let temp = tempdir().unwrap();
    let file_path = temp.path().join("test.txt");
    fs::write(&file_path, "hello world").unwrap();

    let hash = hash_file(&file_path).unwrap();
    assert_eq!(hash.0.len(), 64);
    assert_eq!(hash, hash_file(&file_path).unwrap());
  }

  #[test]
  fn same_content_different_structure_different_hash() {
    let temp1 = tempdir().unwrap();
    fs::write(temp1.path().join("file.txt"), "content").unwrap();

    let temp2 = tempdir().unwrap();
    fs::create_dir(temp2.path().join("subdir")).unwrap();
    fs::write(temp2.path().join("subdir/file.txt"), "content").unwrap();

    let hash1 = hash_directory(temp1.path(), &[]).unwrap();
    let hash2 = hash_directory(temp2.path(), &[]).unwrap();

    assert_ne!(hash1, hash2);
  }
}
