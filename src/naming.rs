//! Device slot allocation and backend-facing names.
//!
//! Slots are small positive integers assigned per group (or per host) so
//! sibling volumes get stable, distinct device names. Allocation reads the
//! slots already in use and picks the lowest free one; backends that report a
//! name collision are retried with [`next_slot_after`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::model::Labels;

const MAX_LABEL_LENGTH: usize = 63;
const DISCRIMINATOR_LENGTH: usize = 8;

/// Returns the lowest slot, starting at 1, that is not in `used`.
#[must_use]
pub fn next_slot(used: impl IntoIterator<Item = u32>) -> u32 {
    let taken: BTreeSet<u32> = used.into_iter().collect();
    let mut candidate = 1;
    while taken.contains(&candidate) {
        candidate += 1;
    }
    candidate
}

/// Returns the lowest free slot strictly above `floor`.
///
/// Used after a backend rejected `floor` because a concurrent caller claimed
/// it between the sibling read and the create call.
#[must_use]
pub fn next_slot_after(used: impl IntoIterator<Item = u32>, floor: u32) -> u32 {
    next_slot(used.into_iter().chain(1..=floor))
}

/// Parses the slot out of a name produced by [`slot_name`].
#[must_use]
pub fn slot_from_name(name: &str) -> Option<u32> {
    let (_, suffix) = name.rsplit_once("-data")?;
    suffix.parse().ok().filter(|slot| *slot > 0)
}

/// Builds the backend name for a volume occupying `slot` in `group`.
#[must_use]
pub fn slot_name(group: &str, slot: u32) -> String {
    let base = slugify(group);
    if base.is_empty() {
        return format!("volume-data{slot}");
    }
    format!("{base}-data{slot}")
}

/// Builds a snapshot name from the volume's resource id, a timestamp and the
/// first characters of `discriminator`.
///
/// Two snapshots of one volume within the same second differ only in the
/// discriminator, so callers pass something unique per snapshot such as the
/// new record's id.
#[must_use]
pub fn snapshot_name(resource_id: &str, at: DateTime<Utc>, discriminator: &str) -> String {
    let base = slugify(resource_id);
    let stamp = at.format("%Y%m%d%H%M%S");
    let suffix: String = slugify(discriminator)
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(DISCRIMINATOR_LENGTH)
        .collect();
    let name = if base.is_empty() {
        format!("snapshot-{stamp}")
    } else {
        format!("{base}-{stamp}")
    };
    if suffix.is_empty() {
        return name;
    }
    format!("{name}-{suffix}")
}

/// Lowercases `value` and collapses runs of other characters into `-`.
#[must_use]
pub fn slugify(value: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = false;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_matches('-').to_owned()
}

/// Restricts a label key or value to the character set accepted by label
/// backends (lowercase letters, digits, `-` and `_`, at most 63 chars).
#[must_use]
pub fn sanitize_label(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            let lower = ch.to_ascii_lowercase();
            if lower.is_ascii_alphanumeric() || lower == '-' || lower == '_' {
                lower
            } else {
                '_'
            }
        })
        .take(MAX_LABEL_LENGTH)
        .collect()
}

/// Ownership metadata translated into backend labels.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LabelSource<'a> {
    /// Team owning the database.
    pub team: Option<&'a str>,
    /// Database engine name.
    pub engine: Option<&'a str>,
    /// Database name.
    pub db_name: Option<&'a str>,
    /// Whether the snapshot is retained past rotation.
    pub persist: bool,
}

impl LabelSource<'_> {
    /// Renders the labels, omitting every key whose value is unset or blank.
    #[must_use]
    pub fn to_labels(&self) -> Labels {
        let mut labels = Labels::new();
        let pairs = [
            ("team", self.team),
            ("engine", self.engine),
            ("db_name", self.db_name),
        ];
        for (key, value) in pairs {
            let Some(raw) = value.map(str::trim).filter(|raw| !raw.is_empty()) else {
                continue;
            };
            labels.insert(key.to_owned(), sanitize_label(raw));
        }
        if self.persist {
            labels.insert(String::from("is_persisted"), String::from("true"));
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SnapshotId;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case(vec![], 1)]
    #[case(vec![1, 2], 3)]
    #[case(vec![2, 3], 1)]
    #[case(vec![1, 3], 2)]
    #[case(vec![3, 1, 2, 2], 4)]
    fn next_slot_picks_lowest_unused(#[case] used: Vec<u32>, #[case] expected: u32) {
        assert_eq!(next_slot(used), expected);
    }

    #[rstest]
    #[case(vec![1], 1, 2)]
    #[case(vec![1, 2], 2, 3)]
    #[case(vec![], 3, 4)]
    #[case(vec![5], 4, 6)]
    fn next_slot_after_skips_rejected_slot(
        #[case] used: Vec<u32>,
        #[case] floor: u32,
        #[case] expected: u32,
    ) {
        assert_eq!(next_slot_after(used, floor), expected);
    }

    #[rstest]
    #[case("db-1-data3", Some(3))]
    #[case("db-data-data12", Some(12))]
    #[case("db-1-data0", None)]
    #[case("db-1", None)]
    #[case("db-1-datax", None)]
    fn slot_from_name_parses_suffix(#[case] name: &str, #[case] expected: Option<u32>) {
        assert_eq!(slot_from_name(name), expected);
    }

    #[test]
    fn slot_name_round_trips_through_parser() {
        let name = slot_name("Orders DB", 2);
        assert_eq!(name, "orders-db-data2");
        assert_eq!(slot_from_name(&name), Some(2));
    }

    #[test]
    fn slot_name_handles_unusable_group() {
        assert_eq!(slot_name("!!!", 1), "volume-data1");
    }

    #[test]
    fn snapshot_name_combines_stamp_and_discriminator() {
        let at = Utc
            .with_ymd_and_hms(2024, 3, 9, 7, 5, 1)
            .single()
            .expect("valid timestamp");
        assert_eq!(
            snapshot_name("db-1-data1", at, "4f9c21d07aa54e3b"),
            "db-1-data1-20240309070501-4f9c21d0"
        );
        assert_eq!(snapshot_name("", at, "ab12"), "snapshot-20240309070501-ab12");
        assert_eq!(snapshot_name("db-1-data1", at, "--"), "db-1-data1-20240309070501");
    }

    #[test]
    fn snapshots_in_the_same_second_get_distinct_names() {
        let at = Utc
            .with_ymd_and_hms(2024, 3, 9, 7, 5, 1)
            .single()
            .expect("valid timestamp");
        let first = SnapshotId::generate();
        let second = SnapshotId::generate();
        assert_ne!(
            snapshot_name("db-1-data1", at, first.as_str()),
            snapshot_name("db-1-data1", at, second.as_str())
        );
    }

    #[test]
    fn labels_omit_unset_keys() {
        let labels = LabelSource {
            team: Some("DBaaS Team"),
            engine: None,
            db_name: Some("  "),
            persist: false,
        }
        .to_labels();

        assert_eq!(labels.len(), 1);
        assert_eq!(labels.get("team").map(String::as_str), Some("dbaas_team"));
    }

    #[test]
    fn persisted_label_only_when_requested() {
        let source = LabelSource {
            engine: Some("mysql"),
            ..LabelSource::default()
        };
        assert!(!source.to_labels().contains_key("is_persisted"));

        let persisted = LabelSource {
            persist: true,
            ..source
        };
        assert_eq!(
            persisted.to_labels().get("is_persisted").map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn sanitize_label_truncates() {
        let long = "x".repeat(80);
        assert_eq!(sanitize_label(&long).len(), 63);
    }
}
