//! Command-template parsing for deferred artifact resolution.
//!
//! Command strings and arguments may embed artifact references that are
//! resolved at spec-concretization time:
//!
//! - `$${<aid>}` — an artifact reference (`[type:]module+ref`), replaced
//!   by the artifact's external identifier
//!
//! # Shell Variables
//!
//! Single `$` characters pass through unchanged, so shell variables like
//! `$HOME` and `$PATH` work naturally without any escaping.
//!
//! # Escaping
//!
//! Use `$$$` before `{` to produce a literal `$${` sequence. This is only
//! needed in the rare case where you want literal `$${` in output.

use thiserror::Error;

use crate::artifact::{Aid, AidError};

/// A parsed piece of a command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  /// Literal text (no references)
  Literal(String),

  /// An artifact reference to be resolved
  Reference(Aid),
}

/// Errors during template parsing or rendering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
  #[error("unclosed reference at position {0}")]
  Unclosed(usize),

  #[error("empty reference at position {0}")]
  EmptyReference(usize),

  #[error("malformed reference at position {at}: {source}")]
  BadReference {
    at: usize,
    #[source]
    source: AidError,
  },

  #[error("unresolved reference `{reference}`: {message}")]
  Unresolved { reference: String, message: String },
}

/// Parse a template into literal and reference segments.
pub fn parse(input: &str) -> Result<Vec<Segment>, TemplateError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut i = 0;

  while i < input.len() {
    let rest = &input[i..];

    if rest.starts_with("$$${") {
      // Escape: `$$${` yields a literal `$${`.
      literal.push_str("$${");
      i += 4;
    } else if rest.starts_with("$${") {
      let start = i + 3;
      let close = input[start..].find('}').ok_or(TemplateError::Unclosed(i))?;
      let inner = &input[start..start + close];
      if inner.is_empty() {
        return Err(TemplateError::EmptyReference(i));
      }
      let aid = Aid::parse_correctly(inner).map_err(|source| TemplateError::BadReference { at: i, source })?;

      if !literal.is_empty() {
        segments.push(Segment::Literal(std::mem::take(&mut literal)));
      }
      segments.push(Segment::Reference(aid));
      i = start + close + 1;
    } else {
      let ch_len = rest.chars().next().map(char::len_utf8).unwrap_or(1);
      literal.push_str(&rest[..ch_len]);
      i += ch_len;
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

/// Render segments back into a string, resolving each reference through
/// the supplied callback.
pub fn render(
  segments: &[Segment],
  mut resolve: impl FnMut(&Aid) -> Result<String, TemplateError>,
) -> Result<String, TemplateError> {
  let mut out = String::new();
  for segment in segments {
    match segment {
      Segment::Literal(text) => out.push_str(text),
      Segment::Reference(aid) => out.push_str(&resolve(aid)?),
    }
  }
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plain_text_is_one_literal() {
    let segments = parse("cc -o out main.c").unwrap();
    assert_eq!(segments, vec![Segment::Literal("cc -o out main.c".to_string())]);
  }

  #[test]
  fn references_split_literals() {
    let segments = parse("cat $${+in.txt} > $${+out.txt}").unwrap();
    assert_eq!(segments.len(), 4);
    assert_eq!(segments[0], Segment::Literal("cat ".to_string()));
    assert!(matches!(&segments[1], Segment::Reference(aid) if aid.name == "in.txt"));
    assert_eq!(segments[2], Segment::Literal(" > ".to_string()));
    assert!(matches!(&segments[3], Segment::Reference(aid) if aid.name == "out.txt"));
  }

  #[test]
  fn shell_variables_pass_through() {
    let segments = parse("echo $HOME ${PATH}").unwrap();
    assert_eq!(segments, vec![Segment::Literal("echo $HOME ${PATH}".to_string())]);
  }

  #[test]
  fn triple_dollar_escapes_to_literal_marker() {
    let segments = parse("printf '$$${escaped}'").unwrap();
    assert_eq!(segments, vec![Segment::Literal("printf '$${escaped}'".to_string())]);
  }

  #[test]
  fn unclosed_reference_is_an_error() {
    assert_eq!(parse("cat $${in.txt"), Err(TemplateError::Unclosed(4)));
  }

  #[test]
  fn empty_reference_is_an_error() {
    assert_eq!(parse("cat $${}"), Err(TemplateError::EmptyReference(4)));
  }

  #[test]
  fn malformed_reference_carries_position() {
    let err = parse("cp $${src+} dest").unwrap_err();
    assert!(matches!(err, TemplateError::BadReference { at: 3, .. }));
  }

  #[test]
  fn render_substitutes_references() {
    let segments = parse("cc -o $${+prog} $${src+main.c}").unwrap();
    let rendered = render(&segments, |aid| Ok(format!("/ws/{}", aid.name))).unwrap();
    assert_eq!(rendered, "cc -o /ws/prog /ws/main.c");
  }

  #[test]
  fn render_propagates_resolution_failures() {
    let segments = parse("$${missing.txt}").unwrap();
    let err = render(&segments, |aid| {
      Err(TemplateError::Unresolved {
        reference: aid.to_string(),
        message: "nope".to_string(),
      })
    })
    .unwrap_err();
    assert!(matches!(err, TemplateError::Unresolved { .. }));
  }
}
