//! Core opportunity record model, logical field resolution and dedup configuration.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "bidfit-core";

pub const PROCESSING_STATUS_FIELD: &str = "processing_status";
pub const ARCHIVED_STATUS: &str = "archived";

/// Semantic fields the engine reads. Each maps to an ordered list of physical paths,
/// because upstream integrations store the same value under different keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogicalField {
    StoredId,
    NoticeId,
    SolicitationNumber,
    Title,
    Description,
    Agency,
    PostedDate,
    DueDate,
    CreatedAt,
    Value,
    DataQualityScore,
    EnhancedMarker,
    ParsedMarker,
    AnalysisMarker,
}

impl LogicalField {
    /// Candidate paths in priority order. Dotted paths walk nested objects.
    pub const fn paths(self) -> &'static [&'static str] {
        match self {
            Self::StoredId => &["id", "_id"],
            Self::NoticeId => &[
                "noticeId",
                "notice_id",
                "source_ids.sam_gov",
                "_parsed.classification.noticeId",
            ],
            Self::SolicitationNumber => &[
                "solicitationNumber",
                "solicitation_number",
                "_parsed.classification.solicitationNumber",
            ],
            Self::Title => &["title", "_parsed.title"],
            Self::Description => &["description", "_parsed.description", "summary"],
            Self::Agency => &[
                "agency",
                "department",
                "_parsed.agency.name",
                "fullParentPathName",
            ],
            Self::PostedDate => &["postedDate", "posted_date", "publishDate", "_parsed.dates.posted"],
            Self::DueDate => &[
                "dueDate",
                "due_date",
                "responseDeadLine",
                "_parsed.dates.due",
            ],
            Self::CreatedAt => &["createdAt", "created_at"],
            Self::Value => &[
                "value",
                "estimatedValue",
                "award.amount",
                "_parsed.financial.estimatedValue",
            ],
            Self::DataQualityScore => &["dataQualityScore", "data_quality_score", "_quality.score"],
            Self::EnhancedMarker => &["_enhanced", "enhancedData", "enhanced_at"],
            Self::ParsedMarker => &["_parsed"],
            Self::AnalysisMarker => &["_analysis", "analysis"],
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::StoredId => "id",
            Self::NoticeId => "noticeId",
            Self::SolicitationNumber => "solicitationNumber",
            Self::Title => "title",
            Self::Description => "description",
            Self::Agency => "agency",
            Self::PostedDate => "postedDate",
            Self::DueDate => "dueDate",
            Self::CreatedAt => "createdAt",
            Self::Value => "value",
            Self::DataQualityScore => "dataQualityScore",
            Self::EnhancedMarker => "enhanced",
            Self::ParsedMarker => "parsed",
            Self::AnalysisMarker => "analysis",
        }
    }
}

/// One ingested notice. Schemaless: the engine tolerates any missing field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpportunityRecord(Map<String, Value>);

impl OpportunityRecord {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wraps a JSON object. Non-object values are not records.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Dotted lookup. A missing intermediate key or a JSON `null` yields `None`.
    pub fn lookup_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.0.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        (!current.is_null()).then_some(current)
    }

    /// First candidate path holding a non-null value.
    pub fn resolve(&self, field: LogicalField) -> Option<&Value> {
        field.paths().iter().find_map(|path| self.lookup_path(path))
    }

    /// Resolved value as trimmed, non-empty text. Numbers and booleans are stringified.
    pub fn resolve_text(&self, field: LogicalField) -> Option<String> {
        let text = match self.resolve(field)? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    }

    /// Whether a marker/flag field carries a populated value.
    pub fn has_marker(&self, field: LogicalField) -> bool {
        self.resolve(field)
            .map(|value| is_populated(value) && value != &Value::Bool(false))
            .unwrap_or(false)
    }

    /// Processing identity: stored id, notice id, solicitation number, then a
    /// title/agency composite.
    pub fn identifier(&self) -> String {
        [
            LogicalField::StoredId,
            LogicalField::NoticeId,
            LogicalField::SolicitationNumber,
        ]
        .into_iter()
        .find_map(|field| self.resolve_text(field))
        .unwrap_or_else(|| {
            let title = self
                .resolve_text(LogicalField::Title)
                .unwrap_or_else(|| "untitled".to_string());
            let agency = self
                .resolve_text(LogicalField::Agency)
                .unwrap_or_else(|| "unknown".to_string());
            format!("{title}|{agency}")
        })
    }

    /// Share of populated top-level fields, in percent.
    pub fn completeness_percent(&self) -> f64 {
        if self.0.is_empty() {
            return 0.0;
        }
        let populated = self.0.values().filter(|v| is_populated(v)).count();
        populated as f64 / self.0.len() as f64 * 100.0
    }

    pub fn processing_status(&self) -> Option<&str> {
        self.0.get(PROCESSING_STATUS_FIELD).and_then(Value::as_str)
    }

    pub fn is_archived(&self) -> bool {
        self.processing_status() == Some(ARCHIVED_STATUS)
    }

    pub fn mark_archived(&mut self) {
        self.insert(PROCESSING_STATUS_FIELD, ARCHIVED_STATUS);
    }

    /// Best-effort ordering date: creation time, then posting date.
    pub fn sort_date(&self) -> Option<DateTime<Utc>> {
        self.resolve(LogicalField::CreatedAt)
            .and_then(parse_date)
            .or_else(|| self.resolve(LogicalField::PostedDate).and_then(parse_date))
    }
}

impl From<Map<String, Value>> for OpportunityRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

pub fn is_populated(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

const NAIVE_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];
const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

/// Parses RFC 3339, common naive date/datetime layouts, or epoch milliseconds.
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(s) => parse_date_str(s.trim()),
        _ => None,
    }
}

pub fn parse_date_str(input: &str) -> Option<DateTime<Utc>> {
    if input.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(naive.and_utc());
        }
    }
    NAIVE_DATE_FORMATS.iter().find_map(|format| {
        NaiveDate::parse_from_str(input, format)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    })
}

/// Parses a JSON number, or a string such as `"$1,250,000.00"`.
pub fn parse_number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned = s
                .chars()
                .filter(|c| !matches!(c, '$' | ',') && !c.is_whitespace())
                .collect::<String>();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

/// Inclusive posting-date window used to filter candidate fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| at >= start) && self.end.map_or(true, |end| at <= end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusteringMode {
    /// Members only need to match the group's anchor record.
    #[default]
    Anchor,
    /// Connected components of the pairwise match graph.
    TransitiveClosure,
}

/// Relative importance of each compared field in the weighted average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldWeights {
    pub notice_id: f64,
    pub solicitation_number: f64,
    pub title: f64,
    pub agency: f64,
    pub description: f64,
    pub posted_date: f64,
    pub due_date: f64,
    pub value: f64,
}

impl Default for FieldWeights {
    fn default() -> Self {
        Self {
            notice_id: 1.0,
            solicitation_number: 1.0,
            title: 0.8,
            agency: 0.6,
            description: 0.4,
            posted_date: 0.3,
            due_date: 0.3,
            value: 0.2,
        }
    }
}

impl FieldWeights {
    fn all(&self) -> [(&'static str, f64); 8] {
        [
            ("notice_id", self.notice_id),
            ("solicitation_number", self.solicitation_number),
            ("title", self.title),
            ("agency", self.agency),
            ("description", self.description),
            ("posted_date", self.posted_date),
            ("due_date", self.due_date),
            ("value", self.value),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchLevel {
    Exact,
    Strong,
    Moderate,
    Weak,
    None,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within [0, 1], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f64 },
    #[error("weight for {field} must be finite and non-negative, got {value}")]
    InvalidWeight { field: &'static str, value: f64 },
    #[error("{name} must be positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },
}

/// Per-run dedup settings. Built once and passed by reference to scoring and grouping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub exact_match_threshold: f64,
    pub strong_match_threshold: f64,
    pub moderate_match_threshold: f64,
    pub weak_match_threshold: f64,
    pub weights: FieldWeights,
    pub batch_size: usize,
    pub max_comparisons: usize,
    pub enable_fuzzy_matching: bool,
    pub enable_semantic_matching: bool,
    pub date_tolerance_days: f64,
    pub value_tolerance: f64,
    pub text_prefix_chars: usize,
    pub identifier_match_score: f64,
    pub clustering: ClusteringMode,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            exact_match_threshold: 1.0,
            strong_match_threshold: 0.9,
            moderate_match_threshold: 0.75,
            weak_match_threshold: 0.6,
            weights: FieldWeights::default(),
            batch_size: 100,
            max_comparisons: 250_000,
            enable_fuzzy_matching: true,
            enable_semantic_matching: false,
            date_tolerance_days: 7.0,
            value_tolerance: 0.2,
            text_prefix_chars: 500,
            identifier_match_score: 0.95,
            clustering: ClusteringMode::Anchor,
        }
    }
}

impl DedupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("exact_match_threshold", self.exact_match_threshold),
            ("strong_match_threshold", self.strong_match_threshold),
            ("moderate_match_threshold", self.moderate_match_threshold),
            ("weak_match_threshold", self.weak_match_threshold),
            ("identifier_match_score", self.identifier_match_score),
        ] {
            check_unit_interval(name, value)?;
        }
        for (field, value) in self.weights.all() {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidWeight { field, value });
            }
        }
        for (name, value) in [
            ("date_tolerance_days", self.date_tolerance_days),
            ("value_tolerance", self.value_tolerance),
            ("batch_size", self.batch_size as f64),
            ("text_prefix_chars", self.text_prefix_chars as f64),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::NonPositive { name, value });
            }
        }
        Ok(())
    }

    pub fn classify(&self, score: f64) -> MatchLevel {
        if score >= self.exact_match_threshold {
            MatchLevel::Exact
        } else if score >= self.strong_match_threshold {
            MatchLevel::Strong
        } else if score >= self.moderate_match_threshold {
            MatchLevel::Moderate
        } else if score >= self.weak_match_threshold {
            MatchLevel::Weak
        } else {
            MatchLevel::None
        }
    }
}

pub fn check_unit_interval(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::ThresholdOutOfRange { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> OpportunityRecord {
        OpportunityRecord::from_value(value).unwrap()
    }

    #[test]
    fn resolves_first_non_null_candidate_path() {
        let rec = record(json!({
            "noticeId": null,
            "source_ids": { "sam_gov": "SAM-42" },
            "_parsed": { "classification": { "noticeId": "PARSED-1" } }
        }));
        assert_eq!(rec.resolve_text(LogicalField::NoticeId).as_deref(), Some("SAM-42"));
    }

    #[test]
    fn dotted_lookup_through_missing_or_scalar_intermediate_is_none() {
        let rec = record(json!({ "source_ids": "not-an-object", "_parsed": {} }));
        assert_eq!(rec.lookup_path("source_ids.sam_gov"), None);
        assert_eq!(rec.lookup_path("_parsed.classification.noticeId"), None);
        assert_eq!(rec.resolve(LogicalField::NoticeId), None);
    }

    #[test]
    fn identifier_falls_back_in_priority_order() {
        let with_id = record(json!({ "id": "rec-1", "noticeId": "N-1" }));
        assert_eq!(with_id.identifier(), "rec-1");

        let with_solicitation = record(json!({ "solicitationNumber": "SOL-9", "title": "x" }));
        assert_eq!(with_solicitation.identifier(), "SOL-9");

        let composite = record(json!({ "title": "Janitorial Services", "agency": "GSA" }));
        assert_eq!(composite.identifier(), "Janitorial Services|GSA");

        let bare = record(json!({ "noticeId": "   " }));
        assert_eq!(bare.identifier(), "untitled|unknown");
    }

    #[test]
    fn completeness_counts_populated_top_level_fields() {
        let rec = record(json!({
            "title": "Roof repair",
            "description": "",
            "agency": null,
            "tags": [],
            "value": 10
        }));
        assert!((rec.completeness_percent() - 40.0).abs() < 1e-9);
        assert_eq!(OpportunityRecord::new().completeness_percent(), 0.0);
    }

    #[test]
    fn parses_supported_date_layouts() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).single().unwrap();
        assert_eq!(parse_date(&json!("2024-03-04")), Some(expected));
        assert_eq!(parse_date(&json!("03/04/2024")), Some(expected));
        assert_eq!(parse_date(&json!("2024-03-04T00:00:00Z")), Some(expected));
        assert_eq!(parse_date(&json!("2024-03-04 00:00:00")), Some(expected));
        assert_eq!(parse_date(&json!(expected.timestamp_millis())), Some(expected));
        assert_eq!(parse_date(&json!("next tuesday")), None);
        assert_eq!(parse_date(&json!(true)), None);
    }

    #[test]
    fn parses_currency_strings() {
        assert_eq!(parse_number(&json!("$1,250,000.50")), Some(1_250_000.5));
        assert_eq!(parse_number(&json!(42)), Some(42.0));
        assert_eq!(parse_number(&json!("TBD")), None);
    }

    #[test]
    fn archive_marker_round_trips() {
        let mut rec = record(json!({ "id": "a" }));
        assert!(!rec.is_archived());
        rec.mark_archived();
        assert!(rec.is_archived());
        assert_eq!(rec.processing_status(), Some("archived"));
    }

    #[test]
    fn markers_ignore_empty_and_false_values() {
        let rec = record(json!({ "_enhanced": false, "_parsed": {}, "_analysis": { "fit": 0.8 } }));
        assert!(!rec.has_marker(LogicalField::EnhancedMarker));
        assert!(!rec.has_marker(LogicalField::ParsedMarker));
        assert!(rec.has_marker(LogicalField::AnalysisMarker));
    }

    #[test]
    fn default_config_is_valid_and_classifies_levels() {
        let config = DedupConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.classify(1.0), MatchLevel::Exact);
        assert_eq!(config.classify(0.95), MatchLevel::Strong);
        assert_eq!(config.classify(0.8), MatchLevel::Moderate);
        assert_eq!(config.classify(0.6), MatchLevel::Weak);
        assert_eq!(config.classify(0.1), MatchLevel::None);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let config = DedupConfig {
            moderate_match_threshold: 1.5,
            ..DedupConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdOutOfRange { name: "moderate_match_threshold", .. })
        ));

        let mut weights = FieldWeights::default();
        weights.title = -1.0;
        let config = DedupConfig { weights, ..DedupConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidWeight { field: "title", .. })));
    }

    #[test]
    fn date_range_is_inclusive() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).single().unwrap();
        let range = DateRange { start: Some(start), end: Some(end) };
        assert!(range.contains(start));
        assert!(range.contains(end));
        assert!(!range.contains(end + chrono::Duration::seconds(1)));
        assert!(DateRange::default().contains(start));
    }
}
