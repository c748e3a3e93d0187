//! Pairwise similarity scoring, duplicate grouping and canonical record selection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use bidfit_core::{
    parse_date, parse_number, ClusteringMode, DedupConfig, FieldWeights, LogicalField,
    MatchLevel, OpportunityRecord,
};
use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidfit-matching";

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Result of comparing one field across two records.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "score", rename_all = "snake_case")]
pub enum FieldOutcome {
    /// Both present and comparable; partial score in (0, 1].
    Scored(f64),
    /// Both present, but different or outside tolerance. Counts as 0.
    NoMatch,
    /// At least one side has no value. Excluded from the average.
    Missing,
    /// At least one side has a value that could not be parsed. Excluded from the average.
    Unparseable,
}

impl FieldOutcome {
    pub fn contribution(self) -> Option<f64> {
        match self {
            Self::Scored(score) => Some(score),
            Self::NoMatch => Some(0.0),
            Self::Missing | Self::Unparseable => None,
        }
    }

    fn from_partial(score: f64) -> Self {
        if score > 0.0 {
            Self::Scored(score.min(1.0))
        } else {
            Self::NoMatch
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparator {
    Exact,
    Text,
    Date,
    Number,
}

const FIELD_PLAN: [(LogicalField, Comparator); 8] = [
    (LogicalField::NoticeId, Comparator::Exact),
    (LogicalField::SolicitationNumber, Comparator::Exact),
    (LogicalField::Title, Comparator::Text),
    (LogicalField::Agency, Comparator::Exact),
    (LogicalField::Description, Comparator::Text),
    (LogicalField::PostedDate, Comparator::Date),
    (LogicalField::DueDate, Comparator::Date),
    (LogicalField::Value, Comparator::Number),
];

const IDENTIFIER_FIELDS: [LogicalField; 2] = [LogicalField::NoticeId, LogicalField::SolicitationNumber];

fn weight_for(weights: &FieldWeights, field: LogicalField) -> f64 {
    match field {
        LogicalField::NoticeId => weights.notice_id,
        LogicalField::SolicitationNumber => weights.solicitation_number,
        LogicalField::Title => weights.title,
        LogicalField::Agency => weights.agency,
        LogicalField::Description => weights.description,
        LogicalField::PostedDate => weights.posted_date,
        LogicalField::DueDate => weights.due_date,
        LogicalField::Value => weights.value,
        _ => 0.0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldComparison {
    pub field: LogicalField,
    pub weight: f64,
    pub outcome: FieldOutcome,
}

/// Score plus the per-field evidence behind it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityBreakdown {
    pub score: f64,
    pub identifier_match: Option<LogicalField>,
    pub fields: Vec<FieldComparison>,
}

pub struct SimilarityScorer<'a> {
    config: &'a DedupConfig,
}

impl<'a> SimilarityScorer<'a> {
    pub fn new(config: &'a DedupConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, a: &OpportunityRecord, b: &OpportunityRecord) -> f64 {
        if self.identifier_match(a, b).is_some() {
            return self.config.identifier_match_score;
        }
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (field, comparator) in FIELD_PLAN {
            let weight = weight_for(&self.config.weights, field);
            if let Some(partial) = self.compare(comparator, field, a, b).contribution() {
                weighted += partial * weight;
                total_weight += weight;
            }
        }
        aggregate(weighted, total_weight)
    }

    /// Same result as [`Self::score`], with every field outcome retained.
    pub fn explain(&self, a: &OpportunityRecord, b: &OpportunityRecord) -> SimilarityBreakdown {
        let identifier_match = self.identifier_match(a, b);
        let fields = FIELD_PLAN
            .iter()
            .map(|&(field, comparator)| FieldComparison {
                field,
                weight: weight_for(&self.config.weights, field),
                outcome: self.compare(comparator, field, a, b),
            })
            .collect::<Vec<_>>();

        let score = if identifier_match.is_some() {
            self.config.identifier_match_score
        } else {
            let (weighted, total_weight) = fields.iter().fold((0.0, 0.0), |(w, t), c| {
                match c.outcome.contribution() {
                    Some(partial) => (w + partial * c.weight, t + c.weight),
                    None => (w, t),
                }
            });
            aggregate(weighted, total_weight)
        };

        SimilarityBreakdown {
            score,
            identifier_match,
            fields,
        }
    }

    /// Shared notice or solicitation number. Case-sensitive.
    pub fn identifier_match(&self, a: &OpportunityRecord, b: &OpportunityRecord) -> Option<LogicalField> {
        IDENTIFIER_FIELDS.into_iter().find(|&field| {
            matches!(
                (a.resolve_text(field), b.resolve_text(field)),
                (Some(left), Some(right)) if left == right
            )
        })
    }

    fn compare(
        &self,
        comparator: Comparator,
        field: LogicalField,
        a: &OpportunityRecord,
        b: &OpportunityRecord,
    ) -> FieldOutcome {
        match comparator {
            Comparator::Exact => compare_exact(a.resolve_text(field), b.resolve_text(field)),
            Comparator::Text => compare_text(
                a.resolve_text(field).as_deref(),
                b.resolve_text(field).as_deref(),
                self.config,
            ),
            Comparator::Date => {
                compare_dates(a.resolve(field), b.resolve(field), self.config.date_tolerance_days)
            }
            Comparator::Number => {
                compare_values(a.resolve(field), b.resolve(field), self.config.value_tolerance)
            }
        }
    }
}

fn aggregate(weighted: f64, total_weight: f64) -> f64 {
    if total_weight > 0.0 {
        (weighted / total_weight).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn compare_exact(a: Option<String>, b: Option<String>) -> FieldOutcome {
    match (a, b) {
        (Some(a), Some(b)) if a == b => FieldOutcome::Scored(1.0),
        (Some(_), Some(_)) => FieldOutcome::NoMatch,
        _ => FieldOutcome::Missing,
    }
}

/// Word-set Jaccard over a bounded prefix of each text. With fuzzy matching
/// disabled, falls back to normalized equality.
pub fn compare_text(a: Option<&str>, b: Option<&str>, config: &DedupConfig) -> FieldOutcome {
    let (Some(a), Some(b)) = (a, b) else {
        return FieldOutcome::Missing;
    };
    let a = normalize_text(a, config.text_prefix_chars);
    let b = normalize_text(b, config.text_prefix_chars);
    if !config.enable_fuzzy_matching {
        return FieldOutcome::from_partial(if a == b { 1.0 } else { 0.0 });
    }
    FieldOutcome::from_partial(jaccard(&word_set(&a), &word_set(&b)))
}

fn normalize_text(text: &str, prefix_chars: usize) -> String {
    text.chars()
        .take(prefix_chars)
        .collect::<String>()
        .to_lowercase()
        .trim()
        .to_string()
}

fn word_set(text: &str) -> HashSet<&str> {
    text.split_whitespace().collect()
}

pub fn jaccard(a: &HashSet<&str>, b: &HashSet<&str>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// `1 - days/tolerance` inside the tolerance window, otherwise no match.
pub fn compare_dates(a: Option<&Value>, b: Option<&Value>, tolerance_days: f64) -> FieldOutcome {
    let (Some(a), Some(b)) = (a, b) else {
        return FieldOutcome::Missing;
    };
    let (Some(a), Some(b)) = (parse_date(a), parse_date(b)) else {
        return FieldOutcome::Unparseable;
    };
    let diff_days = (a - b).num_milliseconds().abs() as f64 / MILLIS_PER_DAY;
    if diff_days <= tolerance_days {
        FieldOutcome::from_partial(1.0 - diff_days / tolerance_days)
    } else {
        FieldOutcome::NoMatch
    }
}

/// `1 - |a-b|/avg(a,b)` when the relative difference is within tolerance.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>, tolerance: f64) -> FieldOutcome {
    let (Some(a), Some(b)) = (a, b) else {
        return FieldOutcome::Missing;
    };
    let (Some(a), Some(b)) = (parse_number(a), parse_number(b)) else {
        return FieldOutcome::Unparseable;
    };
    if a == b {
        return FieldOutcome::Scored(1.0);
    }
    let average = (a.abs() + b.abs()) / 2.0;
    let relative_diff = (a - b).abs() / average;
    if relative_diff <= tolerance {
        FieldOutcome::from_partial(1.0 - relative_diff)
    } else {
        FieldOutcome::NoMatch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    #[default]
    BestQuality,
    MostRecent,
    MostComplete,
}

impl ResolutionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BestQuality => "best_quality",
            Self::MostRecent => "most_recent",
            Self::MostComplete => "most_complete",
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::BestQuality => "Kept the record with the highest data quality score",
            Self::MostRecent => "Kept the most recently posted record",
            Self::MostComplete => "Kept the record with the most populated fields",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "best_quality" => Ok(Self::BestQuality),
            "most_recent" => Ok(Self::MostRecent),
            "most_complete" => Ok(Self::MostComplete),
            other => Err(format!("unknown conflict resolution strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Merge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: RecommendedAction,
    pub keep_identifier: String,
    pub remove_identifiers: Vec<String>,
    pub reason: String,
    pub strategy: ResolutionStrategy,
}

const KEY_FIELDS: [LogicalField; 5] = [
    LogicalField::NoticeId,
    LogicalField::SolicitationNumber,
    LogicalField::Title,
    LogicalField::Description,
    LogicalField::Agency,
];

/// Completeness, reported quality, enrichment markers and key-field coverage.
pub fn quality_score(record: &OpportunityRecord) -> f64 {
    let mut score = record.completeness_percent() * 0.4;
    if let Some(reported) = record.resolve(LogicalField::DataQualityScore).and_then(parse_number) {
        score += reported * 0.3;
    }
    if record.has_marker(LogicalField::EnhancedMarker) {
        score += 20.0;
    }
    if record.has_marker(LogicalField::ParsedMarker) {
        score += 15.0;
    }
    if record.has_marker(LogicalField::AnalysisMarker) {
        score += 10.0;
    }
    let key_fields = KEY_FIELDS
        .iter()
        .filter(|&&field| record.resolve_text(field).is_some())
        .count();
    score + key_fields as f64 * 3.0
}

fn posted_millis(record: &OpportunityRecord) -> i64 {
    record
        .resolve(LogicalField::PostedDate)
        .and_then(parse_date)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    strategy: ResolutionStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ResolutionStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }

    /// Position of the winning record. Ties keep the earliest member.
    pub fn select_best_index(&self, members: &[OpportunityRecord]) -> Option<usize> {
        match self.strategy {
            ResolutionStrategy::BestQuality => first_max_by(members, quality_score),
            ResolutionStrategy::MostComplete => {
                first_max_by(members, OpportunityRecord::completeness_percent)
            }
            ResolutionStrategy::MostRecent => first_max_by(members, |r| posted_millis(r) as f64),
        }
    }

    pub fn select_best<'r>(&self, members: &'r [OpportunityRecord]) -> Option<&'r OpportunityRecord> {
        self.select_best_index(members).map(|idx| &members[idx])
    }

    pub fn recommend(&self, members: &[OpportunityRecord]) -> Option<(usize, Recommendation)> {
        let keep = self.select_best_index(members)?;
        let remove_identifiers = members
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != keep)
            .map(|(_, record)| record.identifier())
            .collect();
        Some((
            keep,
            Recommendation {
                action: RecommendedAction::Merge,
                keep_identifier: members[keep].identifier(),
                remove_identifiers,
                reason: self.strategy.reason().to_string(),
                strategy: self.strategy,
            },
        ))
    }
}

fn first_max_by<F>(members: &[OpportunityRecord], key: F) -> Option<usize>
where
    F: Fn(&OpportunityRecord) -> f64,
{
    let mut best: Option<(usize, f64)> = None;
    for (idx, record) in members.iter().enumerate() {
        let value = key(record);
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub group_id: String,
    pub opportunities: Vec<OpportunityRecord>,
    /// Average pairwise similarity across all members.
    pub similarity: f64,
    pub match_level: MatchLevel,
    pub recommendation: Recommendation,
    /// Position of the kept record within `opportunities`.
    pub representative: usize,
    /// Positions of the members in the grouper's input slice.
    #[serde(skip)]
    pub source_indices: Vec<usize>,
}

impl DuplicateGroup {
    pub fn representative(&self) -> &OpportunityRecord {
        &self.opportunities[self.representative]
    }

    pub fn len(&self) -> usize {
        self.opportunities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opportunities.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct GroupingOutcome {
    pub groups: Vec<DuplicateGroup>,
    /// Input positions of records not placed in any group, in input order.
    pub singletons: Vec<usize>,
    pub comparisons: usize,
    /// The comparison budget ran out before every pair was examined.
    pub truncated: bool,
}

impl GroupingOutcome {
    pub fn grouped_records(&self) -> usize {
        self.groups.iter().map(DuplicateGroup::len).sum()
    }
}

struct ComparisonBudget {
    limit: usize,
    used: usize,
    exhausted: bool,
}

impl ComparisonBudget {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            used: 0,
            exhausted: false,
        }
    }

    fn take(&mut self) -> bool {
        if self.used >= self.limit {
            self.exhausted = true;
            return false;
        }
        self.used += 1;
        true
    }
}

/// Partitions records into disjoint duplicate groups.
///
/// In [`ClusteringMode::Anchor`] mode every member was matched against the group's
/// anchor (its earliest record), but members are not required to match each other,
/// and a record that only matches a non-anchor member is left for a later anchor.
/// [`ClusteringMode::TransitiveClosure`] instead groups connected components of the
/// pairwise match graph.
pub struct DuplicateGrouper<'a> {
    config: &'a DedupConfig,
    resolver: ConflictResolver,
}

impl<'a> DuplicateGrouper<'a> {
    pub fn new(config: &'a DedupConfig, strategy: ResolutionStrategy) -> Self {
        Self {
            config,
            resolver: ConflictResolver::new(strategy),
        }
    }

    pub fn group(&self, records: &[OpportunityRecord], threshold: f64) -> GroupingOutcome {
        let order = processing_order(records);
        let scorer = SimilarityScorer::new(self.config);
        let mut budget = ComparisonBudget::new(self.config.max_comparisons);

        let clusters = match self.config.clustering {
            ClusteringMode::Anchor => anchor_clusters(records, &order, &scorer, threshold, &mut budget),
            ClusteringMode::TransitiveClosure => {
                closure_clusters(records, &order, &scorer, threshold, &mut budget)
            }
        };

        if budget.exhausted {
            warn!(
                comparisons = budget.used,
                max_comparisons = self.config.max_comparisons,
                records = records.len(),
                "comparison budget exhausted; remaining records treated as singletons"
            );
        }

        let mut grouped = vec![false; records.len()];
        let mut groups = Vec::with_capacity(clusters.len());
        for members in clusters {
            for &idx in &members {
                grouped[idx] = true;
            }
            if let Some(group) = self.build_group(records, members, &scorer) {
                debug!(
                    group_id = %group.group_id,
                    members = group.len(),
                    similarity = group.similarity,
                    "duplicate group formed"
                );
                groups.push(group);
            }
        }

        let singletons = (0..records.len()).filter(|&idx| !grouped[idx]).collect();
        GroupingOutcome {
            groups,
            singletons,
            comparisons: budget.used,
            truncated: budget.exhausted,
        }
    }

    fn build_group(
        &self,
        records: &[OpportunityRecord],
        members: Vec<usize>,
        scorer: &SimilarityScorer<'_>,
    ) -> Option<DuplicateGroup> {
        let opportunities = members.iter().map(|&idx| records[idx].clone()).collect::<Vec<_>>();
        let (representative, recommendation) = self.resolver.recommend(&opportunities)?;
        let similarity = average_pairwise_similarity(&opportunities, scorer);
        Some(DuplicateGroup {
            group_id: group_id_for(&opportunities),
            match_level: self.config.classify(similarity),
            similarity,
            recommendation,
            representative,
            source_indices: members,
            opportunities,
        })
    }
}

/// Stable sort by creation/posting date; undated records go last.
fn processing_order(records: &[OpportunityRecord]) -> Vec<usize> {
    let dates = records.iter().map(OpportunityRecord::sort_date).collect::<Vec<_>>();
    let mut order = (0..records.len()).collect::<Vec<_>>();
    order.sort_by_key(|&idx| (dates[idx].is_none(), dates[idx]));
    order
}

fn anchor_clusters(
    records: &[OpportunityRecord],
    order: &[usize],
    scorer: &SimilarityScorer<'_>,
    threshold: f64,
    budget: &mut ComparisonBudget,
) -> Vec<Vec<usize>> {
    let mut processed = vec![false; order.len()];
    let mut clusters = Vec::new();

    for pos in 0..order.len() {
        if processed[pos] || budget.exhausted {
            continue;
        }
        processed[pos] = true;
        let anchor = order[pos];
        let mut members = vec![anchor];

        for later in (pos + 1)..order.len() {
            if processed[later] {
                continue;
            }
            if !budget.take() {
                break;
            }
            let candidate = order[later];
            if scorer.score(&records[anchor], &records[candidate]) >= threshold {
                processed[later] = true;
                members.push(candidate);
            }
        }

        if members.len() > 1 {
            clusters.push(members);
        }
    }
    clusters
}

fn closure_clusters(
    records: &[OpportunityRecord],
    order: &[usize],
    scorer: &SimilarityScorer<'_>,
    threshold: f64,
    budget: &mut ComparisonBudget,
) -> Vec<Vec<usize>> {
    let n = order.len();
    let mut components = UnionFind::<usize>::new(n);

    'pairs: for i in 0..n {
        for j in (i + 1)..n {
            if !budget.take() {
                break 'pairs;
            }
            if scorer.score(&records[order[i]], &records[order[j]]) >= threshold {
                components.union(i, j);
            }
        }
    }

    let mut slot_by_root: HashMap<usize, usize> = HashMap::new();
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for pos in 0..n {
        let root = components.find(pos);
        let slot = *slot_by_root.entry(root).or_insert_with(|| {
            clusters.push(Vec::new());
            clusters.len() - 1
        });
        clusters[slot].push(order[pos]);
    }
    clusters.retain(|members| members.len() > 1);
    clusters
}

fn average_pairwise_similarity(members: &[OpportunityRecord], scorer: &SimilarityScorer<'_>) -> f64 {
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..members.len() {
        for j in (i + 1)..members.len() {
            total += scorer.score(&members[i], &members[j]);
            pairs += 1;
        }
    }
    if pairs == 0 {
        0.0
    } else {
        total / pairs as f64
    }
}

/// Stable id derived from the sorted member identifiers.
fn group_id_for(members: &[OpportunityRecord]) -> String {
    let mut identifiers = members.iter().map(OpportunityRecord::identifier).collect::<Vec<_>>();
    identifiers.sort();
    let key = identifiers.join("\n");
    format!("group-{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()))
}
