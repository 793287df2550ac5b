//! Artifact identifier parsing.
//!
//! An AID is a textual artifact reference of shape `[type:]module+ref`:
//!
//! - `type` is optional and defaults per manager (usually `file`)
//! - `module` is optional and defaults to the referring rule's module;
//!   an explicit leading `+` selects the root module
//! - `ref` is required
//!
//! Examples: `main.c`, `src+main.c`, `file:src+main.c`, `+top.txt`.
//!
//! A `:` only introduces a type tag when it appears before the first
//! `+`; anything after the `+` belongs to the ref verbatim.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A parsed artifact reference.
///
/// Two AIDs with equal normalized descriptors resolve to the identical
/// cached artifact instance (see `ArtifactManager`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aid {
  /// Type tag, if given explicitly.
  pub kind: Option<String>,

  /// Module path, if given explicitly. `Some("")` is the root module.
  pub module: Option<String>,

  /// The within-module name. Never empty.
  pub name: String,
}

/// Errors raised by AID parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AidError {
  #[error("empty artifact reference")]
  Empty,

  #[error("artifact reference `{0}` has an empty ref component")]
  MissingRef(String),

  #[error("artifact reference `{0}` has an empty type tag")]
  EmptyType(String),
}

impl Aid {
  pub fn new(kind: Option<&str>, module: Option<&str>, name: &str) -> Self {
    Self {
      kind: kind.map(str::to_string),
      module: module.map(str::to_string),
      name: name.to_string(),
    }
  }

  /// Parse a reference, returning `None` on malformed input.
  pub fn parse(input: &str) -> Option<Self> {
    Self::parse_correctly(input).ok()
  }

  /// Parse a reference, failing loudly on malformed input.
  pub fn parse_correctly(input: &str) -> Result<Self, AidError> {
    if input.is_empty() {
      return Err(AidError::Empty);
    }

    let plus = input.find('+');
    let colon = input.find(':');

    // A type tag only counts when the colon precedes any `+`.
    let (kind, rest) = match (colon, plus) {
      (Some(c), Some(p)) if c < p => (Some(&input[..c]), &input[c + 1..]),
      (Some(c), None) => (Some(&input[..c]), &input[c + 1..]),
      _ => (None, input),
    };

    if let Some(kind) = kind
      && kind.is_empty()
    {
      return Err(AidError::EmptyType(input.to_string()));
    }

    let (module, name) = match rest.find('+') {
      Some(p) => (Some(&rest[..p]), &rest[p + 1..]),
      None => (None, rest),
    };

    if name.is_empty() {
      return Err(AidError::MissingRef(input.to_string()));
    }

    Ok(Self {
      kind: kind.map(str::to_string),
      module: module.map(str::to_string),
      name: name.to_string(),
    })
  }

  /// Fill in missing components from context: the manager's default type
  /// and the referring rule's module.
  pub fn with_defaults(mut self, default_kind: &str, referrer_module: Option<&str>) -> Self {
    if self.kind.is_none() {
      self.kind = Some(default_kind.to_string());
    }
    if self.module.is_none() {
      self.module = Some(referrer_module.unwrap_or("").to_string());
    }
    self
  }
}

impl std::fmt::Display for Aid {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if let Some(kind) = &self.kind {
      write!(f, "{}:", kind)?;
    }
    if let Some(module) = &self.module {
      write!(f, "{}+", module)?;
    }
    write!(f, "{}", self.name)
  }
}

impl std::str::FromStr for Aid {
  type Err = AidError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse_correctly(s)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bare_ref() {
    let aid = Aid::parse_correctly("main.c").unwrap();
    assert_eq!(aid.kind, None);
    assert_eq!(aid.module, None);
    assert_eq!(aid.name, "main.c");
  }

  #[test]
  fn module_and_ref() {
    let aid = Aid::parse_correctly("src+main.c").unwrap();
    assert_eq!(aid.kind, None);
    assert_eq!(aid.module.as_deref(), Some("src"));
    assert_eq!(aid.name, "main.c");
  }

  #[test]
  fn full_form() {
    let aid = Aid::parse_correctly("file:src+main.c").unwrap();
    assert_eq!(aid.kind.as_deref(), Some("file"));
    assert_eq!(aid.module.as_deref(), Some("src"));
    assert_eq!(aid.name, "main.c");
  }

  #[test]
  fn explicit_root_module() {
    let aid = Aid::parse_correctly("+top.txt").unwrap();
    assert_eq!(aid.module.as_deref(), Some(""));
    assert_eq!(aid.name, "top.txt");
  }

  #[test]
  fn colon_after_plus_belongs_to_ref() {
    let aid = Aid::parse_correctly("src+name:with-colon").unwrap();
    assert_eq!(aid.kind, None);
    assert_eq!(aid.module.as_deref(), Some("src"));
    assert_eq!(aid.name, "name:with-colon");
  }

  #[test]
  fn type_without_module() {
    let aid = Aid::parse_correctly("mock:thing").unwrap();
    assert_eq!(aid.kind.as_deref(), Some("mock"));
    assert_eq!(aid.module, None);
    assert_eq!(aid.name, "thing");
  }

  #[test]
  fn malformed_inputs() {
    assert_eq!(Aid::parse_correctly(""), Err(AidError::Empty));
    assert!(matches!(Aid::parse_correctly("src+"), Err(AidError::MissingRef(_))));
    assert!(matches!(
      Aid::parse_correctly(":src+main.c"),
      Err(AidError::EmptyType(_))
    ));
    assert_eq!(Aid::parse("src+"), None);
  }

  #[test]
  fn defaults_fill_missing_components() {
    let aid = Aid::parse_correctly("main.c")
      .unwrap()
      .with_defaults("file", Some("src"));
    assert_eq!(aid.kind.as_deref(), Some("file"));
    assert_eq!(aid.module.as_deref(), Some("src"));

    let explicit = Aid::parse_correctly("mock:lib+x")
      .unwrap()
      .with_defaults("file", Some("src"));
    assert_eq!(explicit.kind.as_deref(), Some("mock"));
    assert_eq!(explicit.module.as_deref(), Some("lib"));
  }

  #[test]
  fn display_round_trips() {
    for input in ["file:src+main.c", "src+main.c", "main.c", "+top.txt"] {
      let aid = Aid::parse_correctly(input).unwrap();
      assert_eq!(aid.to_string(), input);
      assert_eq!(Aid::parse_correctly(&aid.to_string()).unwrap(), aid);
    }
  }
}
