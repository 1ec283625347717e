use serde::{Deserialize, Serialize};

/// Internal series identifier.
pub type Tsid = u64;

/// Timestamp type (nanoseconds since epoch).
pub type Timestamp = i64;

/// Largest representable query time.
pub const MAX_TIME: Timestamp = i64::MAX;

/// Closed time range of a query, nanoseconds since epoch.
///
/// The index does not partition by time; ranges are normalised (negative `min` clamped to
/// zero) and passed through so callers see a consistent contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub min: Timestamp,
    pub max: Timestamp,
}

impl TimeRange {
    pub fn new(min: Timestamp, max: Timestamp) -> Self {
        Self { min, max }
    }

    /// The whole time axis.
    pub fn all() -> Self {
        Self {
            min: 0,
            max: MAX_TIME,
        }
    }

    pub(crate) fn normalized(self) -> Self {
        Self {
            min: self.min.max(0),
            max: self.max,
        }
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::all()
    }
}

/// A single tag key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Tags of one series, sorted by key once canonicalised.
pub type PointTags = Vec<Tag>;

/// Builds a tag list from `(key, value)` pairs.
pub fn tags_from_pairs(pairs: &[(&str, &str)]) -> PointTags {
    pairs.iter().map(|(k, v)| Tag::new(*k, *v)).collect()
}

/// Sorts tags by key then value and drops exact duplicates, so equivalent tag sets produce
/// the same series key.
pub fn canonicalize_tags(tags: &mut PointTags) {
    tags.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.value.cmp(&b.value)));
    tags.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_ordering_is_stable() {
        let mut t1 = tags_from_pairs(&[("region", "eu"), ("host", "a")]);
        let mut t2 = tags_from_pairs(&[("host", "a"), ("region", "eu"), ("host", "a")]);
        canonicalize_tags(&mut t1);
        canonicalize_tags(&mut t2);
        assert_eq!(t1, t2);
        assert_eq!(t1[0].key, "host");
    }

    #[test]
    fn negative_min_is_clamped() {
        let tr = TimeRange::new(-5, 10).normalized();
        assert_eq!(tr.min, 0);
        assert_eq!(tr.max, 10);
    }
}
