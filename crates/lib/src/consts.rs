//! Crate-wide constants.

/// Length of truncated object hashes used as artifact and rule keys.
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// Sentinel version recorded for artifacts that do not currently exist.
pub const NONEXISTENT_VERSION: &str = "<nonexistent>";

/// Format version of the persisted ledger document.
pub const LEDGER_FORMAT_VERSION: u32 = 1;

/// Artifact type assumed when a reference carries no explicit type tag.
pub const DEFAULT_ARTIFACT_KIND: &str = "file";

/// Type tag of the per-job recipe pseudo-artifact.
pub const RECIPE_ARTIFACT_KIND: &str = "recipe";

/// Type tag of list artifacts.
pub const LIST_ARTIFACT_KIND: &str = "list";

/// Type tag of in-memory mock artifacts.
pub const MOCK_ARTIFACT_KIND: &str = "mock";
