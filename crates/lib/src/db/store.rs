//! On-disk ledger document handling.
//!
//! The ledger is a single JSON document, written atomically (write to a
//! `.tmp` sibling, then rename) and stamped with a format version that
//! is checked on load. A missing file loads as an empty ledger.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactKey, Descriptor};
use crate::consts::LEDGER_FORMAT_VERSION;

use super::{DbError, VersionRow};

/// The persisted ledger document.
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct LedgerFile {
  pub version: u32,
  pub rows: Vec<VersionRow>,
  pub artifacts: BTreeMap<ArtifactKey, Descriptor>,
}

impl Default for LedgerFile {
  fn default() -> Self {
    Self {
      version: LEDGER_FORMAT_VERSION,
      rows: Vec::new(),
      artifacts: BTreeMap::new(),
    }
  }
}

/// Load a ledger document, returning an empty one when the file does
/// not exist yet.
pub(super) fn load(path: &Path) -> Result<LedgerFile, DbError> {
  let content = match fs::read_to_string(path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LedgerFile::default()),
    Err(e) => {
      return Err(DbError::Read {
        path: path.to_path_buf(),
        source: e,
      });
    }
  };

  let file: LedgerFile = serde_json::from_str(&content).map_err(|e| DbError::Parse {
    path: path.to_path_buf(),
    source: e,
  })?;

  if file.version != LEDGER_FORMAT_VERSION {
    return Err(DbError::UnsupportedVersion(file.version));
  }

  Ok(file)
}

/// Save a ledger document atomically.
pub(super) fn save(path: &Path, file: &LedgerFile) -> Result<(), DbError> {
  if let Some(parent) = path.parent()
    && !parent.as_os_str().is_empty()
  {
    fs::create_dir_all(parent).map_err(|e| DbError::Write {
      path: path.to_path_buf(),
      source: e,
    })?;
  }

  let content = serde_json::to_string_pretty(file).map_err(DbError::Serialize)?;

  let mut temp_path = path.as_os_str().to_owned();
  temp_path.push(".tmp");
  let temp_path = std::path::PathBuf::from(temp_path);

  fs::write(&temp_path, &content).map_err(|e| DbError::Write {
    path: temp_path.clone(),
    source: e,
  })?;
  fs::rename(&temp_path, path).map_err(|e| DbError::Write {
    path: path.to_path_buf(),
    source: e,
  })?;

  Ok(())
}
