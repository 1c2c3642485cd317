//! Object key and metadata for an export.

use crate::pipeline::compression;
use chrono::{DateTime, SecondsFormat, Utc};

/// Content-Type of every export.
pub const CONTENT_TYPE: &str = "text/csv";

/// Where an export is written and how it is labelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub key: String,
    pub content_type: &'static str,
    pub content_encoding: Option<&'static str>,
}

impl Destination {
    /// Build `<prefix>/<table>_<timestamp>.csv[.zst]`.
    pub fn for_export(prefix: &str, table: &str, at: DateTime<Utc>, compressed: bool) -> Self {
        let mut key = String::new();
        let prefix = prefix.trim_matches('/');
        if !prefix.is_empty() {
            key.push_str(prefix);
            key.push('/');
        }
        key.push_str(table);
        key.push('_');
        key.push_str(&key_timestamp(at));
        key.push_str(".csv");
        if compressed {
            key.push_str(compression::FILE_SUFFIX);
        }

        Self {
            key,
            content_type: CONTENT_TYPE,
            content_encoding: compressed.then_some(compression::CONTENT_ENCODING),
        }
    }
}

/// ISO-8601 with millisecond precision, `:` and `.` replaced by `-`.
pub fn key_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 10, 20, 30).unwrap()
            + chrono::Duration::milliseconds(123)
    }

    #[test]
    fn test_key_timestamp() {
        assert_eq!(key_timestamp(at()), "2024-03-05T10-20-30-123Z");
    }

    #[test]
    fn test_plain_destination() {
        let dest = Destination::for_export("exports", "large_table", at(), false);
        assert_eq!(dest.key, "exports/large_table_2024-03-05T10-20-30-123Z.csv");
        assert_eq!(dest.content_type, "text/csv");
        assert_eq!(dest.content_encoding, None);
    }

    #[test]
    fn test_compressed_destination() {
        let dest = Destination::for_export("exports/", "large_table", at(), true);
        assert_eq!(dest.key, "exports/large_table_2024-03-05T10-20-30-123Z.csv.zst");
        assert_eq!(dest.content_encoding, Some("zstd"));
    }

    #[test]
    fn test_empty_prefix() {
        let dest = Destination::for_export("", "t", at(), false);
        assert!(dest.key.starts_with("t_2024"));
    }
}
