//! Locating the subtrees to merge inside larger manifests.
//!
//! The pod template of a runtime definition and the override fragment of a
//! job manifest both live at fixed, well-known positions. Instead of
//! hard-coding the traversal, the positions are described declaratively as a
//! [`FieldPath`], a sequence of field and index accessors, so callers can
//! point the previewer at differently shaped documents.

use std::{fmt, str::FromStr};

use serde_yaml::{Mapping, Value};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::merge::value_kind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("field {field:?} is missing at {walked} (expected structure {path})"))]
    MissingField {
        field: String,
        walked: String,
        path: String,
    },

    #[snafu(display("index {index} is out of bounds at {walked} (expected structure {path})"))]
    IndexOutOfBounds {
        index: usize,
        walked: String,
        path: String,
    },

    #[snafu(display("cannot descend into {kind} at {walked} (expected structure {path})"))]
    CannotDescend {
        kind: &'static str,
        walked: String,
        path: String,
    },

    #[snafu(display("expected {path} to point at a mapping, but it points at {kind}"))]
    NotAMapping { kind: &'static str, path: String },

    #[snafu(display("cannot parse {segment:?} as a path segment"))]
    ParseSegment { segment: String },

    #[snafu(display("cannot parse {index:?} as a sequence index"))]
    ParseIndex {
        source: std::num::ParseIntError,
        index: String,
    },
}

/// One accessor in a [`FieldPath`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// A named field in a mapping.
    Field(String),

    /// A position in a sequence.
    Index(usize),
}

impl Segment {
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }
}

/// Describes where a subtree lives inside a document, e.g.
/// `spec.podTemplateOverrides[0].spec`.
///
/// Paths render and parse in exactly that dotted notation, so they can be
/// passed on the command line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

impl FieldPath {
    /// The pod spec of the first replicated job inside a runtime definition.
    pub fn runtime_pod_spec() -> Self {
        Self::from(vec![
            Segment::field("spec"),
            Segment::field("template"),
            Segment::field("spec"),
            Segment::field("replicatedJobs"),
            Segment::Index(0),
            Segment::field("template"),
            Segment::field("spec"),
            Segment::field("template"),
            Segment::field("spec"),
        ])
    }

    /// The first pod template override fragment inside a job manifest.
    pub fn job_override_spec() -> Self {
        Self::from(vec![
            Segment::field("spec"),
            Segment::field("podTemplateOverrides"),
            Segment::Index(0),
            Segment::field("spec"),
        ])
    }

    /// Walks the path inside `document`, failing loudly (with the full
    /// expected structure in the message) as soon as a segment does not
    /// match the document shape.
    pub fn locate<'a>(&self, document: &'a Value) -> Result<&'a Value> {
        let mut current = document;

        for (position, segment) in self.segments.iter().enumerate() {
            current = match (segment, current) {
                (Segment::Field(field), Value::Mapping(mapping)) => {
                    mapping.get(field.as_str()).with_context(|| MissingFieldSnafu {
                        field: field.clone(),
                        walked: self.walked(position),
                        path: self.to_string(),
                    })?
                }
                (Segment::Index(index), Value::Sequence(sequence)) => {
                    sequence.get(*index).with_context(|| IndexOutOfBoundsSnafu {
                        index: *index,
                        walked: self.walked(position),
                        path: self.to_string(),
                    })?
                }
                (_, other) => {
                    return CannotDescendSnafu {
                        kind: value_kind(other),
                        walked: self.walked(position),
                        path: self.to_string(),
                    }
                    .fail();
                }
            };
        }

        Ok(current)
    }

    /// Like [`FieldPath::locate`], but additionally requires the located
    /// subtree to be a mapping.
    pub fn locate_mapping<'a>(&self, document: &'a Value) -> Result<&'a Mapping> {
        let located = self.locate(document)?;
        located.as_mapping().with_context(|| NotAMappingSnafu {
            kind: value_kind(located),
            path: self.to_string(),
        })
    }

    /// Renders the part of the path that was successfully walked, for error
    /// messages.
    fn walked(&self, until: usize) -> String {
        if until == 0 {
            "the document root".to_owned()
        } else {
            Self {
                segments: self.segments[..until].to_vec(),
            }
            .to_string()
        }
    }
}

impl From<Vec<Segment>> for FieldPath {
    fn from(segments: Vec<Segment>) -> Self {
        Self { segments }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Field(field) => {
                    if position > 0 {
                        f.write_str(".")?;
                    }
                    f.write_str(field)?;
                }
                Segment::Index(index) => write!(f, "[{index}]")?,
            }
        }

        Ok(())
    }
}

impl FromStr for FieldPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut segments = Vec::new();

        for chunk in s.split('.') {
            let name_end = chunk.find('[').unwrap_or(chunk.len());
            let (name, mut indices) = chunk.split_at(name_end);

            if name.is_empty() && indices.is_empty() {
                return ParseSegmentSnafu { segment: chunk }.fail();
            }
            if !name.is_empty() {
                segments.push(Segment::field(name));
            }

            while let Some(bracketed) = indices.strip_prefix('[') {
                let Some((index, rest)) = bracketed.split_once(']') else {
                    return ParseSegmentSnafu { segment: chunk }.fail();
                };
                segments.push(Segment::Index(
                    index.parse().context(ParseIndexSnafu { index })?,
                ));
                indices = rest;
            }
            ensure!(indices.is_empty(), ParseSegmentSnafu { segment: chunk });
        }

        Ok(Self { segments })
    }
}
