//! Overlay merging of pod template fragments, so that the effective set of
//! containers, init containers and environment variables can be previewed
//! before a job is submitted.
//!
//! The merge applies exactly one policy: list fields registered in an
//! [`OverlayPolicy`](merge::OverlayPolicy) are treated as keyed collections
//! and merged record by record (correlated by an identity field,
//! conventionally `name`), every other field is an atomic value that the
//! override replaces wholesale. There is no support for deletion markers,
//! strategic merge patch directives or JSON patch operations.
//!
//! [`document`] locates the two subtrees to merge inside larger manifests,
//! [`merge`] produces the merged collection and [`yaml`] renders it back to
//! text.

pub mod document;
pub mod merge;
pub mod yaml;
