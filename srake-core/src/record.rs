//! Domain records extracted from SRA XML.
//!
//! All entities are keyed by accession. Cross-entity references
//! (`study_accession`, `experiment_accession`, sample pools) are stored as
//! plain strings and may dangle in partial dumps; resolution happens lazily
//! at query time.

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::Date;

/// One `(tag, value, unit?)` entry of an attribute bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub tag: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Order-preserving, unvalidated attribute bag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeBag(pub Vec<Attribute>);

impl AttributeBag {
    pub fn push(&mut self, tag: String, value: String, unit: Option<String>) {
        self.0.push(Attribute { tag, value, unit });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Stable JSON array serialization, preserving insertion order.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn from_json(json: &str) -> Self {
        serde_json::from_str(json).map(AttributeBag).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Study {
    pub accession: String,
    pub title: Option<String>,
    pub abstract_text: Option<String>,
    pub study_type: Option<String>,
    pub center_name: Option<String>,
    /// ISO date (`YYYY-MM-DD`); unparseable input is dropped to None.
    pub submission_date: Option<String>,
    #[serde(default)]
    pub attributes: AttributeBag,
    /// Unrecognized XML subtrees, keyed by element name.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub accession: String,
    pub study_accession: Option<String>,
    pub title: Option<String>,
    pub library_strategy: Option<String>,
    pub library_source: Option<String>,
    pub library_selection: Option<String>,
    /// `SINGLE` or `PAIRED`.
    pub library_layout: Option<String>,
    pub platform: Option<String>,
    pub instrument_model: Option<String>,
    /// Pooled sample accessions (many-to-many).
    #[serde(default)]
    pub sample_accessions: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub accession: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub scientific_name: Option<String>,
    pub taxon_id: Option<i64>,
    #[serde(default)]
    pub attributes: AttributeBag,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// One entry of a run's file manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFile {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub accession: String,
    pub experiment_accession: Option<String>,
    pub run_date: Option<String>,
    pub center: Option<String>,
    pub total_spots: Option<u64>,
    pub total_bases: Option<u64>,
    #[serde(default)]
    pub files: Vec<RunFile>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub accession: String,
    pub center_name: Option<String>,
    pub lab_name: Option<String>,
    pub submission_date: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub accession: String,
    pub title: Option<String>,
    pub analysis_type: Option<String>,
    pub study_accession: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Entity tier of a record or accession.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Study,
    Experiment,
    Sample,
    Run,
    Submission,
    Analysis,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Study => "study",
            Self::Experiment => "experiment",
            Self::Sample => "sample",
            Self::Run => "run",
            Self::Submission => "submission",
            Self::Analysis => "analysis",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Self::Study => "studies",
            Self::Experiment => "experiments",
            Self::Sample => "samples",
            Self::Run => "runs",
            Self::Submission => "submissions",
            Self::Analysis => "analyses",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged union of everything the extractor can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SraRecord {
    Study(Study),
    Experiment(Experiment),
    Sample(Sample),
    Run(Run),
    Submission(Submission),
    Analysis(Analysis),
}

impl SraRecord {
    pub fn accession(&self) -> &str {
        match self {
            Self::Study(r) => &r.accession,
            Self::Experiment(r) => &r.accession,
            Self::Sample(r) => &r.accession,
            Self::Run(r) => &r.accession,
            Self::Submission(r) => &r.accession,
            Self::Analysis(r) => &r.accession,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Study(_) => RecordKind::Study,
            Self::Experiment(_) => RecordKind::Experiment,
            Self::Sample(_) => RecordKind::Sample,
            Self::Run(_) => RecordKind::Run,
            Self::Submission(_) => RecordKind::Submission,
            Self::Analysis(_) => RecordKind::Analysis,
        }
    }

    /// Rough serialized size, used for the batch byte cap.
    pub fn approx_bytes(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(256)
    }
}

/// Whether `s` is a canonical SRA accession (`^[SED]R[RSXP][0-9]+$`).
///
/// Submissions (`[SED]RA…`) intentionally do not match; they are not
/// addressable through the tiered search path.
pub fn is_accession(s: &str) -> bool {
    accession_kind(s).is_some()
}

/// Tier of a canonical accession, if it is one.
pub fn accession_kind(s: &str) -> Option<RecordKind> {
    let bytes = s.as_bytes();
    if bytes.len() < 4 {
        return None;
    }
    if !matches!(bytes[0], b'S' | b'E' | b'D') || bytes[1] != b'R' {
        return None;
    }
    let kind = match bytes[2] {
        b'R' => RecordKind::Run,
        b'S' => RecordKind::Sample,
        b'X' => RecordKind::Experiment,
        b'P' => RecordKind::Study,
        _ => return None,
    };
    if bytes[3..].iter().all(|b| b.is_ascii_digit()) {
        Some(kind)
    } else {
        None
    }
}

const DATE_ONLY: &'static [time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

/// Normalize an ISO-8601 date or timestamp to `YYYY-MM-DD`.
///
/// Returns None for anything unparseable; callers count that as a warning.
pub fn normalize_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = Date::parse(raw, DATE_ONLY) {
        return date.format(DATE_ONLY).ok();
    }
    if let Ok(ts) = time::OffsetDateTime::parse(raw, &Rfc3339) {
        return ts.date().format(DATE_ONLY).ok();
    }
    // Timestamps like "2020-01-02T03:04:05" without an offset
    if raw.len() >= 10 && raw.is_char_boundary(10) {
        if let Ok(date) = Date::parse(&raw[..10], DATE_ONLY) {
            return date.format(DATE_ONLY).ok();
        }
    }
    None
}

/// Map empty strings and the literal `NULL` to absent.
pub fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accession_tiers() {
        assert_eq!(accession_kind("SRR12345678"), Some(RecordKind::Run));
        assert_eq!(accession_kind("ERS000001"), Some(RecordKind::Sample));
        assert_eq!(accession_kind("DRX42"), Some(RecordKind::Experiment));
        assert_eq!(accession_kind("SRP000001"), Some(RecordKind::Study));
    }

    #[test]
    fn test_accession_rejects_non_canonical() {
        assert!(!is_accession("SRA000001")); // submission tier
        assert!(!is_accession("srr123")); // case-sensitive
        assert!(!is_accession("SRR"));
        assert!(!is_accession("SRR12x4"));
        assert!(!is_accession("PRJNA123"));
        assert!(!is_accession(""));
    }

    #[test]
    fn test_normalize_date() {
        assert_eq!(normalize_date("2021-03-04"), Some("2021-03-04".into()));
        assert_eq!(
            normalize_date("2021-03-04T05:06:07Z"),
            Some("2021-03-04".into())
        );
        assert_eq!(
            normalize_date("2021-03-04T05:06:07"),
            Some("2021-03-04".into())
        );
        assert_eq!(normalize_date("not a date"), None);
        assert_eq!(normalize_date(""), None);
    }

    #[test]
    fn test_non_empty_normalization() {
        assert_eq!(non_empty("  "), None);
        assert_eq!(non_empty("NULL"), None);
        assert_eq!(non_empty("null"), None);
        assert_eq!(non_empty(" ok "), Some("ok".into()));
    }

    #[test]
    fn test_attribute_bag_json_preserves_order() {
        let mut bag = AttributeBag::default();
        bag.push("tissue".into(), "liver".into(), None);
        bag.push("age".into(), "12".into(), Some("weeks".into()));
        let json = bag.to_json();
        let round = AttributeBag::from_json(&json);
        assert_eq!(bag, round);
        assert!(json.find("tissue").unwrap() < json.find("age").unwrap());
    }

    #[test]
    fn test_record_kind_accessors() {
        let record = SraRecord::Study(Study {
            accession: "SRP000001".into(),
            ..Default::default()
        });
        assert_eq!(record.accession(), "SRP000001");
        assert_eq!(record.kind(), RecordKind::Study);
        assert_eq!(record.kind().table(), "studies");
    }
}
