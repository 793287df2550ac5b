//! The typed artifact registry.
//!
//! `ArtifactManager` turns textual references (`[type:]module+ref`) into
//! cached `Artifact` instances. Each artifact type registers an
//! `ArtifactFactory`, whose resolver half normalizes references (default
//! type, referring rule's module, per-type infix path segment) and maps
//! them to external identifiers such as filesystem paths. Instances are
//! memoized process-wide by key: equal normalized descriptors always
//! yield the identical `Arc`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::consts::{DEFAULT_ARTIFACT_KIND, MOCK_ARTIFACT_KIND};
use crate::util::hash::HashError;

use super::{Aid, AidError, Artifact, ArtifactError, ArtifactKey, Descriptor, FileArtifact, MockArtifact};

/// A reference accepted by the manager: raw text or an already-parsed AID.
#[derive(Debug, Clone)]
pub enum ArtifactRef {
  Text(String),
  Parsed(Aid),
}

impl From<&str> for ArtifactRef {
  fn from(value: &str) -> Self {
    ArtifactRef::Text(value.to_string())
  }
}

impl From<String> for ArtifactRef {
  fn from(value: String) -> Self {
    ArtifactRef::Text(value)
  }
}

impl From<Aid> for ArtifactRef {
  fn from(value: Aid) -> Self {
    ArtifactRef::Parsed(value)
  }
}

impl From<&Aid> for ArtifactRef {
  fn from(value: &Aid) -> Self {
    ArtifactRef::Parsed(value.clone())
  }
}

/// Errors raised while resolving artifact references.
#[derive(Debug, Error)]
pub enum ManagerError {
  #[error(transparent)]
  Aid(#[from] AidError),

  #[error("no artifact type registered for `{kind}`")]
  UnresolvableType { kind: String },

  #[error(transparent)]
  Artifact(#[from] ArtifactError),

  #[error(transparent)]
  Hash(#[from] HashError),
}

/// Normalizes references of one artifact type and maps them to external
/// identifiers.
pub trait ArtifactResolver: Send + Sync {
  fn kind(&self) -> &str;

  /// Extra path segment inserted between module and ref, for types whose
  /// external layout nests them (e.g. generated files under `gen/`).
  fn infix(&self) -> Option<&str> {
    None
  }

  /// The canonical identity of a normalized reference within this type.
  fn identity_of(&self, aid: &Aid) -> String {
    let mut segments: Vec<&str> = Vec::new();
    if let Some(module) = aid.module.as_deref()
      && !module.is_empty()
    {
      segments.push(module);
    }
    if let Some(infix) = self.infix() {
      segments.push(infix);
    }
    segments.push(&aid.name);
    segments.join("/")
  }

  /// The concrete external name a recipe needs, e.g. a filesystem path.
  fn external_identifier(&self, root: &Path, aid: &Aid) -> String {
    let path = root.join(self.identity_of(aid));
    dunce::simplified(&path).display().to_string()
  }
}

/// Constructs artifacts of one type on first access.
pub trait ArtifactFactory: ArtifactResolver {
  fn create(&self, aid: &Aid, root: &Path) -> Result<Arc<dyn Artifact>, ManagerError>;
}

/// Factory for workspace files.
#[derive(Default)]
pub struct FileFactory {
  infix: Option<String>,
}

impl FileFactory {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_infix(infix: impl Into<String>) -> Self {
    Self {
      infix: Some(infix.into()),
    }
  }
}

impl ArtifactResolver for FileFactory {
  fn kind(&self) -> &str {
    DEFAULT_ARTIFACT_KIND
  }

  fn infix(&self) -> Option<&str> {
    self.infix.as_deref()
  }
}

impl ArtifactFactory for FileFactory {
  fn create(&self, aid: &Aid, root: &Path) -> Result<Arc<dyn Artifact>, ManagerError> {
    let identity = self.identity_of(aid);
    let path = root.join(&identity);
    Ok(Arc::new(FileArtifact::new(identity, path)?))
  }
}

/// Factory for in-memory mock artifacts.
#[derive(Default)]
pub struct MockFactory;

impl ArtifactResolver for MockFactory {
  fn kind(&self) -> &str {
    MOCK_ARTIFACT_KIND
  }

  fn external_identifier(&self, _root: &Path, aid: &Aid) -> String {
    self.identity_of(aid)
  }
}

impl ArtifactFactory for MockFactory {
  fn create(&self, aid: &Aid, _root: &Path) -> Result<Arc<dyn Artifact>, ManagerError> {
    Ok(Arc::new(MockArtifact::new(self.identity_of(aid))?))
  }
}

/// The process-wide artifact registry and cache.
pub struct ArtifactManager {
  root: PathBuf,
  default_kind: String,
  factories: HashMap<String, Arc<dyn ArtifactFactory>>,
  cache: Mutex<HashMap<ArtifactKey, Arc<dyn Artifact>>>,
}

impl ArtifactManager {
  /// Create a manager rooted at the workspace directory, with the
  /// builtin `file` and `mock` types registered.
  pub fn new(root: impl Into<PathBuf>) -> Self {
    let mut manager = Self {
      root: root.into(),
      default_kind: DEFAULT_ARTIFACT_KIND.to_string(),
      factories: HashMap::new(),
      cache: Mutex::new(HashMap::new()),
    };
    manager.register(Arc::new(FileFactory::new()));
    manager.register(Arc::new(MockFactory));
    manager
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Register (or replace) the factory for a type.
  pub fn register(&mut self, factory: Arc<dyn ArtifactFactory>) {
    self.factories.insert(factory.kind().to_string(), factory);
  }

  pub fn set_default_kind(&mut self, kind: impl Into<String>) {
    self.default_kind = kind.into();
  }

  fn normalize(&self, reference: ArtifactRef, referrer_module: Option<&str>) -> Result<Aid, ManagerError> {
    let aid = match reference {
      ArtifactRef::Text(text) => Aid::parse_correctly(&text)?,
      ArtifactRef::Parsed(aid) => aid,
    };
    Ok(aid.with_defaults(&self.default_kind, referrer_module))
  }

  fn factory_for(&self, aid: &Aid) -> Result<&Arc<dyn ArtifactFactory>, ManagerError> {
    let kind = aid.kind.as_deref().unwrap_or(&self.default_kind);
    self
      .factories
      .get(kind)
      .ok_or_else(|| ManagerError::UnresolvableType { kind: kind.to_string() })
  }

  /// Resolve a reference to its cached artifact, constructing it via the
  /// registered factory on first access.
  pub fn get(
    &self,
    reference: impl Into<ArtifactRef>,
    referrer_module: Option<&str>,
  ) -> Result<Arc<dyn Artifact>, ManagerError> {
    let aid = self.normalize(reference.into(), referrer_module)?;
    let factory = self.factory_for(&aid)?;

    let identity = factory.identity_of(&aid);
    let key = Descriptor::new(factory.kind(), identity).key()?;

    let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(artifact) = cache.get(&key) {
      return Ok(artifact.clone());
    }

    let artifact = factory.create(&aid, &self.root)?;
    cache.insert(key, artifact.clone());
    Ok(artifact)
  }

  /// Non-throwing variant of `get`.
  pub fn find(&self, reference: impl Into<ArtifactRef>, referrer_module: Option<&str>) -> Option<Arc<dyn Artifact>> {
    self.get(reference, referrer_module).ok()
  }

  /// The concrete external name (e.g. filesystem path) a recipe needs.
  pub fn resolve_to_external_identifier(
    &self,
    reference: impl Into<ArtifactRef>,
    referrer_module: Option<&str>,
  ) -> Result<String, ManagerError> {
    let aid = self.normalize(reference.into(), referrer_module)?;
    let factory = self.factory_for(&aid)?;
    Ok(factory.external_identifier(&self.root, &aid))
  }

  /// Cache a programmatically constructed artifact (lists, recipe
  /// pseudo-artifacts). Returns the cached instance, which may be an
  /// earlier adoption of the same key.
  pub fn adopt(&self, artifact: Arc<dyn Artifact>) -> Arc<dyn Artifact> {
    let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
    cache.entry(artifact.key().clone()).or_insert(artifact).clone()
  }

  /// Look up an already-cached artifact by key.
  pub fn cached(&self, key: &ArtifactKey) -> Option<Arc<dyn Artifact>> {
    self
      .cache
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(key)
      .cloned()
  }
}

impl std::fmt::Debug for ArtifactManager {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ArtifactManager")
      .field("root", &self.root)
      .field("default_kind", &self.default_kind)
      .field("types", &self.factories.keys().collect::<Vec<_>>())
      .finish()
  }
}
