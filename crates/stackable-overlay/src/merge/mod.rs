//! Merging of keyed collections, the way the orchestrator applies pod
//! template overrides at deploy time.
//!
//! A keyed collection is an ordered sequence of records (YAML mappings) in
//! which records are correlated across the base and override sequences by the
//! value of an identity field, conventionally `name`. Matched records are
//! merged field by field, records only present in the override are appended,
//! records only present in the base stay untouched at their original
//! position. Which fields of a record hold nested keyed collections of their
//! own is configured through an [`OverlayPolicy`].

use std::collections::{BTreeMap, HashMap};

use serde_yaml::{Mapping, Sequence, Value};
use snafu::{OptionExt, Snafu};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Represents every shape mismatch that aborts a merge.
///
/// Anything less than a shape mismatch (missing identity fields, duplicate
/// identities, absent collections) degrades to a deterministic best-effort
/// merge instead, since a preview is most useful when it shows *something*
/// even for partially malformed overrides.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("expected field {field:?} to hold a sequence, but it holds {kind}"))]
    FieldNotASequence { field: String, kind: &'static str },
}

/// The semantic knobs of the overlay merge.
///
/// Everything else about the merge behavior is fixed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverlayPolicy {
    /// The field correlating records across the base and override sequences.
    pub identity_field: String,

    /// Record fields that hold nested keyed collections, together with the
    /// identity field used inside each of them. Every field not listed here
    /// is overwritten wholesale by the override value.
    pub keyed_fields: BTreeMap<String, String>,
}

impl Default for OverlayPolicy {
    /// Containers are correlated by container `name`, their `env` lists by
    /// variable `name`.
    fn default() -> Self {
        Self {
            identity_field: "name".to_owned(),
            keyed_fields: BTreeMap::from([("env".to_owned(), "name".to_owned())]),
        }
    }
}

/// Merges one named keyed collection of `override_spec` onto the same
/// collection of `base_spec`.
///
/// An absent (or null) collection field counts as the empty sequence, on
/// either side. No other field of the two specs is consulted or altered;
/// previewing several collections means calling this once per collection
/// name.
///
/// Neither input is mutated, the merged collection is a fresh value.
///
/// # Example
///
/// ```
/// use indoc::indoc;
/// use stackable_overlay::merge::{OverlayPolicy, merge_collection};
///
/// let base: serde_yaml::Mapping = serde_yaml::from_str(indoc! {"
///     initContainers:
///     - name: fetch-data
///       image: busybox
/// "})
/// .unwrap();
/// let overrides: serde_yaml::Mapping = serde_yaml::from_str(indoc! {"
///     initContainers:
///     - name: fetch-data
///       image: busybox:1.36
/// "})
/// .unwrap();
///
/// let merged = merge_collection(
///     &base,
///     &overrides,
///     "initContainers",
///     &OverlayPolicy::default(),
/// )
/// .unwrap();
///
/// assert_eq!(merged[0]["image"], "busybox:1.36");
/// ```
pub fn merge_collection(
    base_spec: &Mapping,
    override_spec: &Mapping,
    collection_field: &str,
    policy: &OverlayPolicy,
) -> Result<Sequence> {
    let base = sequence_or_empty(base_spec.get(collection_field), collection_field)?;
    let overrides = sequence_or_empty(override_spec.get(collection_field), collection_field)?;

    tracing::debug!(
        collection = collection_field,
        base_records = base.len(),
        override_records = overrides.len(),
        "merging keyed collection"
    );

    merge_keyed_sequence(
        &base,
        &overrides,
        &policy.identity_field,
        |base_record, override_record| overlay_mapping(base_record, override_record, policy),
    )
}

/// Merges two sequences of keyed records into one.
///
/// Base records keep their original position. An override record whose
/// identity matches a base record replaces it in place with
/// `merge_matched(base_record, override_record)`; all other override records
/// (unmatched identity, no identity field, not a mapping at all) are appended
/// verbatim, in override order.
///
/// Two deliberate consequences of this two-pass overlay:
///
/// * Duplicate identities within the base index first-wins, so an override
///   only ever lands on the first occurrence; later base duplicates keep
///   their slot untouched.
/// * Override records sharing a *matched* identity compound (each one merges
///   onto the previous result), while unmatched duplicates append as separate
///   records and are never merged with each other.
pub fn merge_keyed_sequence<F>(
    base: &[Value],
    overrides: &[Value],
    identity_field: &str,
    mut merge_matched: F,
) -> Result<Sequence>
where
    F: FnMut(&Mapping, &Mapping) -> Result<Mapping>,
{
    let mut merged = base.to_vec();

    // Identity value -> ordinal slot in the base sequence, first occurrence
    // wins. Records without the identity field are not indexed.
    let mut slots = HashMap::new();
    for (position, record) in base.iter().enumerate() {
        if let Some(identity) = record
            .as_mapping()
            .and_then(|record| record.get(identity_field))
        {
            slots.entry(identity.clone()).or_insert(position);
        }
    }

    for override_value in overrides {
        let Some(override_record) = override_value.as_mapping() else {
            merged.push(override_value.clone());
            continue;
        };

        let slot = override_record
            .get(identity_field)
            .and_then(|identity| slots.get(identity));

        match slot {
            Some(&slot) => {
                // Indexed slots always hold mappings, and merging keeps them
                // mappings, so the clone cannot come up empty.
                if let Some(base_record) = merged[slot].as_mapping().cloned() {
                    merged[slot] = Value::Mapping(merge_matched(&base_record, override_record)?);
                }
            }
            None => merged.push(override_value.clone()),
        }
    }

    Ok(merged)
}

/// Applies one override record onto one base record, field by field.
///
/// Fields registered in the policy as keyed collections are merged with
/// [`merge_keyed_sequence`], where a matched nested record is replaced
/// wholesale by its override (so an env var overriding a base `valueFrom`
/// with a literal `value` does not end up with both). Every other field is
/// overwritten by the override value, including mappings and sequences; the
/// merge is intentionally shallow for unknown structures.
///
/// Fields only present in the base survive unchanged and keep their
/// position; fields only present in the override are appended.
pub fn overlay_mapping(
    base: &Mapping,
    overlay: &Mapping,
    policy: &OverlayPolicy,
) -> Result<Mapping> {
    let mut merged = base.clone();

    for (field, value) in overlay {
        // Only string field names can be registered as keyed collections
        let keyed = field
            .as_str()
            .map(|name| (name, policy.keyed_fields.get(name)));

        match keyed {
            Some((field_name, Some(nested_identity))) => {
                let nested_base = sequence_or_empty(merged.get(field_name), field_name)?;
                let nested_overrides = sequence_or_empty(Some(value), field_name)?;

                let nested = merge_keyed_sequence(
                    &nested_base,
                    &nested_overrides,
                    nested_identity,
                    |_, override_record| Ok(override_record.clone()),
                )?;

                merged.insert(field.clone(), Value::Sequence(nested));
            }
            _ => {
                merged.insert(field.clone(), value.clone());
            }
        }
    }

    Ok(merged)
}

/// Treats an absent or null field as the empty sequence. A present value of
/// any other non-sequence type is a shape mismatch.
fn sequence_or_empty(value: Option<&Value>, field: &str) -> Result<Sequence> {
    match value {
        None | Some(Value::Null) => Ok(Sequence::new()),
        Some(Value::Sequence(sequence)) => Ok(sequence.clone()),
        Some(other) => FieldNotASequenceSnafu {
            field,
            kind: value_kind(other),
        }
        .fail(),
    }
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    fn mapping(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).expect("test YAML is valid")
    }

    fn sequence(yaml: &str) -> Sequence {
        serde_yaml::from_str(yaml).expect("test YAML is valid")
    }

    fn merge(base: &str, overrides: &str) -> Sequence {
        merge_collection(
            &mapping(base),
            &mapping(overrides),
            "initContainers",
            &OverlayPolicy::default(),
        )
        .expect("merging test collections works")
    }

    #[test]
    fn matched_container_merges_env_and_appends_new_container() {
        let merged = merge(
            indoc! {"
                initContainers:
                - name: init-a
                  image: busybox
                  env:
                  - name: X
                    value: 1
            "},
            indoc! {"
                initContainers:
                - name: init-a
                  env:
                  - name: X
                    value: 2
                  - name: Y
                    value: 9
                - name: init-b
                  image: alpine
            "},
        );

        assert_eq!(
            merged,
            sequence(indoc! {"
                - name: init-a
                  image: busybox
                  env:
                  - name: X
                    value: 2
                  - name: Y
                    value: 9
                - name: init-b
                  image: alpine
            "})
        );
    }

    #[test]
    fn base_records_keep_their_slot() {
        let merged = merge(
            indoc! {"
                initContainers:
                - name: first
                  image: a
                - name: second
                  image: b
                - name: third
                  image: c
            "},
            indoc! {"
                initContainers:
                - name: third
                  image: c2
                - name: second
                  image: b2
            "},
        );

        assert_eq!(
            merged,
            sequence(indoc! {"
                - name: first
                  image: a
                - name: second
                  image: b2
                - name: third
                  image: c2
            "})
        );
    }

    #[test]
    fn unmatched_overrides_append_in_override_order() {
        let merged = merge(
            indoc! {"
                initContainers:
                - name: base
            "},
            indoc! {"
                initContainers:
                - name: new-b
                - name: new-a
            "},
        );

        let names = merged
            .iter()
            .map(|record| record["name"].as_str().expect("names are strings"))
            .collect::<Vec<_>>();
        assert_eq!(names, ["base", "new-b", "new-a"]);
    }

    #[test]
    fn matched_env_var_is_replaced_wholesale() {
        let merged = merge(
            indoc! {"
                initContainers:
                - name: init-a
                  env:
                  - name: X
                    valueFrom:
                      configMapKeyRef:
                        name: shared-config
                        key: X
            "},
            indoc! {"
                initContainers:
                - name: init-a
                  env:
                  - name: X
                    value: literal
            "},
        );

        // The base valueFrom must not survive next to the override value
        assert_eq!(
            merged[0]["env"],
            Value::Sequence(sequence(indoc! {"
                - name: X
                  value: literal
            "}))
        );
    }

    #[test]
    fn env_vars_of_unmatched_base_containers_survive() {
        let merged = merge(
            indoc! {"
                initContainers:
                - name: untouched
                  env:
                  - name: KEEP
                    value: kept
            "},
            indoc! {"
                initContainers:
                - name: other
            "},
        );

        assert_eq!(merged[0]["env"][0]["value"], "kept");
    }

    #[rstest]
    #[case::empty_sequence("initContainers: []")]
    #[case::null_collection("initContainers: null")]
    #[case::absent_collection("{}")]
    fn empty_override_is_a_noop(#[case] overrides: &str) {
        let base = indoc! {"
            initContainers:
            - name: init-a
              image: busybox
            - name: init-b
        "};

        assert_eq!(
            merge(base, overrides),
            sequence(indoc! {"
                - name: init-a
                  image: busybox
                - name: init-b
            "})
        );
    }

    #[test]
    fn absent_base_collection_yields_the_override_records() {
        let merged = merge(
            "{}",
            indoc! {"
                initContainers:
                - name: only-override
            "},
        );

        assert_eq!(merged, sequence("- name: only-override\n"));
    }

    #[test]
    fn both_collections_absent_merge_to_empty() {
        assert_eq!(merge("{}", "{}"), Sequence::new());
    }

    #[test]
    fn collection_field_must_hold_a_sequence() {
        let error = merge_collection(
            &mapping("initContainers: not-a-list"),
            &mapping("{}"),
            "initContainers",
            &OverlayPolicy::default(),
        )
        .expect_err("merging a scalar collection must fail");

        assert_eq!(
            error.to_string(),
            "expected field \"initContainers\" to hold a sequence, but it holds a string"
        );
    }

    #[test]
    fn nested_keyed_field_must_hold_a_sequence() {
        let error = merge_collection(
            &mapping(indoc! {"
                initContainers:
                - name: init-a
                  env:
                    X: 1
            "}),
            &mapping(indoc! {"
                initContainers:
                - name: init-a
                  env:
                  - name: X
                    value: 2
            "}),
            "initContainers",
            &OverlayPolicy::default(),
        )
        .expect_err("merging onto a non-sequence env must fail");

        assert_eq!(
            error.to_string(),
            "expected field \"env\" to hold a sequence, but it holds a mapping"
        );
    }

    #[test]
    fn duplicate_base_identities_first_wins() {
        let merged = merge(
            indoc! {"
                initContainers:
                - name: dup
                  image: first
                - name: dup
                  image: second
            "},
            indoc! {"
                initContainers:
                - name: dup
                  image: overridden
            "},
        );

        assert_eq!(
            merged,
            sequence(indoc! {"
                - name: dup
                  image: overridden
                - name: dup
                  image: second
            "})
        );
    }

    #[test]
    fn duplicate_unmatched_overrides_append_independently() {
        let merged = merge(
            "initContainers: []",
            indoc! {"
                initContainers:
                - name: new
                  image: one
                - name: new
                  command: [two]
            "},
        );

        // Two-pass overlay, not a three-way merge: no self-merging among
        // override-only records
        assert_eq!(
            merged,
            sequence(indoc! {"
                - name: new
                  image: one
                - name: new
                  command: [two]
            "})
        );
    }

    #[test]
    fn repeated_matched_overrides_compound() {
        let merged = merge(
            indoc! {"
                initContainers:
                - name: init-a
                  image: base
            "},
            indoc! {"
                initContainers:
                - name: init-a
                  image: one
                - name: init-a
                  command: [two]
            "},
        );

        assert_eq!(
            merged,
            sequence(indoc! {"
                - name: init-a
                  image: one
                  command: [two]
            "})
        );
    }

    #[test]
    fn unkeyed_elements_are_passed_through() {
        let merged = merge(
            indoc! {"
                initContainers:
                - keep-my-slot
                - name: init-a
            "},
            indoc! {"
                initContainers:
                - name: init-a
                  image: busybox
                - appended-verbatim
            "},
        );

        assert_eq!(
            merged,
            sequence(indoc! {"
                - keep-my-slot
                - name: init-a
                  image: busybox
                - appended-verbatim
            "})
        );
    }

    #[test]
    fn overridden_fields_keep_their_position() {
        let merged = overlay_mapping(
            &mapping(indoc! {"
                name: init-a
                image: busybox
                command: [sh]
            "}),
            &mapping(indoc! {"
                image: alpine
                workingDir: /tmp
            "}),
            &OverlayPolicy::default(),
        )
        .expect("overlaying test records works");

        let fields = merged
            .iter()
            .map(|(field, _)| field.as_str().expect("fields are strings"))
            .collect::<Vec<_>>();
        assert_eq!(fields, ["name", "image", "command", "workingDir"]);
        assert_eq!(merged.get("image"), Some(&Value::from("alpine")));
        assert_eq!(
            merged.get("command"),
            Some(&Value::Sequence(sequence("[sh]")))
        );
    }

    #[test]
    fn unknown_nested_structures_are_overwritten_wholesale() {
        let merged = merge(
            indoc! {"
                initContainers:
                - name: init-a
                  securityContext:
                    runAsUser: 1000
                    runAsGroup: 1000
            "},
            indoc! {"
                initContainers:
                - name: init-a
                  securityContext:
                    runAsUser: 0
            "},
        );

        // No recursive merge for fields outside the keyed-field table
        assert_eq!(
            merged[0]["securityContext"],
            Value::Mapping(mapping("runAsUser: 0"))
        );
    }

    #[test]
    fn custom_policy_keys_other_collections() {
        let policy = OverlayPolicy {
            identity_field: "containerName".to_owned(),
            keyed_fields: BTreeMap::from([("ports".to_owned(), "portName".to_owned())]),
        };

        let merged = merge_collection(
            &mapping(indoc! {"
                sidecars:
                - containerName: proxy
                  ports:
                  - portName: http
                    port: 8080
            "}),
            &mapping(indoc! {"
                sidecars:
                - containerName: proxy
                  ports:
                  - portName: http
                    port: 9090
            "}),
            "sidecars",
            &policy,
        )
        .expect("merging with a custom policy works");

        assert_eq!(merged[0]["ports"][0]["port"], 9090);
    }
}
