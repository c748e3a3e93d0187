//! Record store and audit trail collaborators for dedup runs: in-memory, JSON file and
//! PostgreSQL backends.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bidfit_core::{parse_date, DateRange, LogicalField, OpportunityRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidfit-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(String),
    #[error("{context} {}: {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed store contents in {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid audit run id {0}")]
    InvalidRunId(String),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Filters for a candidate fetch. Archived records are never candidates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateQuery {
    pub date_range: Option<DateRange>,
    pub agency_filter: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl CandidateQuery {
    /// Date ranges match on posting date; the agency filter is a case-insensitive
    /// substring match. Records lacking the filtered field are excluded.
    pub fn matches(&self, record: &OpportunityRecord) -> bool {
        if record.is_archived() {
            return false;
        }
        if let Some(range) = &self.date_range {
            let posted = record.resolve(LogicalField::PostedDate).and_then(parse_date);
            if !posted.is_some_and(|at| range.contains(at)) {
                return false;
            }
        }
        if let Some(filter) = &self.agency_filter {
            let needle = filter.to_lowercase();
            let agency = record.resolve_text(LogicalField::Agency).unwrap_or_default();
            if !agency.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }

    fn page(&self, records: &[OpportunityRecord]) -> CandidatePage {
        let records = records
            .iter()
            .enumerate()
            .filter(|(_, record)| self.matches(record))
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .map(|(position, record)| addressable(position, record))
            .collect::<Vec<_>>();
        CandidatePage {
            rows_read: records.len(),
            records,
        }
    }
}

/// One page of candidates. `rows_read` counts every row the page consumed, including rows
/// the store skipped, so the next page starts at `offset + rows_read`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidatePage {
    pub records: Vec<OpportunityRecord>,
    pub rows_read: usize,
}

/// The identifier `archive` accepts for the record at `position`: its stored id, or the
/// derived identifier suffixed with the position when it carries none.
pub fn addressable_id(position: usize, record: &OpportunityRecord) -> String {
    record
        .resolve_text(LogicalField::StoredId)
        .unwrap_or_else(|| format!("{}#{position}", record.identifier()))
}

fn addressable(position: usize, record: &OpportunityRecord) -> OpportunityRecord {
    if record.resolve_text(LogicalField::StoredId).is_some() {
        return record.clone();
    }
    record.clone().with("id", addressable_id(position, record))
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every returned record's `identifier()` is accepted by [`RecordStore::archive`].
    async fn fetch_candidates(&self, query: &CandidateQuery) -> Result<CandidatePage, StoreError>;

    /// Marks every record with this identifier as archived. Idempotent.
    async fn archive(&self, identifier: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_kind: String,
    pub started_at: DateTime<Utc>,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ArchiveDuplicate,
    RunCompleted,
    RunFailed,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ArchiveDuplicate => "archive_duplicate",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub run_id: String,
    pub action: AuditAction,
    pub details: Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRun {
    pub run_id: String,
    pub metadata: RunMetadata,
}

#[async_trait]
pub trait AuditTrail: Send + Sync {
    async fn create_run(&self, metadata: &RunMetadata) -> Result<String, StoreError>;

    async fn record_action(&self, run_id: &str, action: AuditAction, details: Value) -> Result<(), StoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replaces `path` with `bytes` through a temp file in the same directory and a rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|err| StoreError::io("creating directory", parent, err))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|err| StoreError::io("opening temp file", &temp_path, err))?;
    file.write_all(bytes)
        .await
        .map_err(|err| StoreError::io("writing temp file", &temp_path, err))?;
    file.flush()
        .await
        .map_err(|err| StoreError::io("flushing temp file", &temp_path, err))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io("renaming temp file onto", path, err));
    }
    Ok(())
}

fn archive_matching(records: &mut [OpportunityRecord], identifier: &str) -> Result<usize, StoreError> {
    let mut matched = 0usize;
    for (position, record) in records.iter_mut().enumerate() {
        if addressable_id(position, record) == identifier {
            record.mark_archived();
            matched += 1;
        }
    }
    if matched == 0 {
        return Err(StoreError::NotFound(identifier.to_string()));
    }
    Ok(matched)
}

/// Process-local store, used for tests and for embedding the engine without a database.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<Vec<OpportunityRecord>>,
}

impl InMemoryRecordStore {
    pub fn new(records: Vec<OpportunityRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub async fn snapshot(&self) -> Vec<OpportunityRecord> {
        self.records.lock().await.clone()
    }

    pub async fn archived_identifiers(&self) -> Vec<String> {
        self.records
            .lock()
            .await
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_archived())
            .map(|(position, r)| addressable_id(position, r))
            .collect()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn fetch_candidates(&self, query: &CandidateQuery) -> Result<CandidatePage, StoreError> {
        Ok(query.page(&self.records.lock().await))
    }

    async fn archive(&self, identifier: &str) -> Result<(), StoreError> {
        archive_matching(&mut self.records.lock().await, identifier).map(|_| ())
    }
}

/// Store backed by a JSON array file; every archive rewrites the file atomically.
#[derive(Debug)]
pub struct JsonFileRecordStore {
    path: PathBuf,
    records: Mutex<Vec<OpportunityRecord>>,
}

impl JsonFileRecordStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let text = fs::read_to_string(&path)
            .await
            .map_err(|err| StoreError::io("reading", &path, err))?;
        let records: Vec<OpportunityRecord> =
            serde_json::from_str(&text).map_err(|source| StoreError::Malformed {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), records = records.len(), "opened json record store");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> Vec<OpportunityRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl RecordStore for JsonFileRecordStore {
    async fn fetch_candidates(&self, query: &CandidateQuery) -> Result<CandidatePage, StoreError> {
        Ok(query.page(&self.records.lock().await))
    }

    async fn archive(&self, identifier: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let mut updated = records.clone();
        archive_matching(&mut updated, identifier)?;
        let bytes = serde_json::to_vec_pretty(&updated)?;
        write_atomic(&self.path, &bytes).await?;
        *records = updated;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAuditTrail {
    runs: Mutex<Vec<AuditRun>>,
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn runs(&self) -> Vec<AuditRun> {
        self.runs.lock().await.clone()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl AuditTrail for InMemoryAuditTrail {
    async fn create_run(&self, metadata: &RunMetadata) -> Result<String, StoreError> {
        let run_id = Uuid::new_v4().to_string();
        self.runs.lock().await.push(AuditRun {
            run_id: run_id.clone(),
            metadata: metadata.clone(),
        });
        Ok(run_id)
    }

    async fn record_action(&self, run_id: &str, action: AuditAction, details: Value) -> Result<(), StoreError> {
        self.entries.lock().await.push(AuditEntry {
            run_id: run_id.to_string(),
            action,
            details,
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}

/// Append-only audit log: `runs.jsonl` and `actions.jsonl` under one directory.
#[derive(Debug)]
pub struct JsonlAuditTrail {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditTrail {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn runs_path(&self) -> PathBuf {
        self.dir.join("runs.jsonl")
    }

    pub fn actions_path(&self) -> PathBuf {
        self.dir.join("actions.jsonl")
    }

    async fn append_line<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| StoreError::io("creating directory", &self.dir, err))?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|err| StoreError::io("opening", path, err))?;
        file.write_all(&line)
            .await
            .map_err(|err| StoreError::io("appending to", path, err))?;
        file.flush()
            .await
            .map_err(|err| StoreError::io("flushing", path, err))
    }
}

#[async_trait]
impl AuditTrail for JsonlAuditTrail {
    async fn create_run(&self, metadata: &RunMetadata) -> Result<String, StoreError> {
        let run = AuditRun {
            run_id: Uuid::new_v4().to_string(),
            metadata: metadata.clone(),
        };
        self.append_line(&self.runs_path(), &run).await?;
        Ok(run.run_id)
    }

    async fn record_action(&self, run_id: &str, action: AuditAction, details: Value) -> Result<(), StoreError> {
        let entry = AuditEntry {
            run_id: run_id.to_string(),
            action,
            details,
            recorded_at: Utc::now(),
        };
        self.append_line(&self.actions_path(), &entry).await
    }
}

pub async fn connect_pg(database_url: &str) -> Result<PgPool, StoreError> {
    Ok(PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn fetch_candidates(&self, query: &CandidateQuery) -> Result<CandidatePage, StoreError> {
        let range = query.date_range.unwrap_or_default();
        let rows = sqlx::query(
            r#"
            SELECT identifier, data
              FROM opportunities
             WHERE processing_status IS DISTINCT FROM 'archived'
               AND ($1::timestamptz IS NULL OR posted_date >= $1)
               AND ($2::timestamptz IS NULL OR posted_date <= $2)
               AND ($3::text IS NULL OR agency ILIKE '%' || $3 || '%')
             ORDER BY posted_date ASC NULLS LAST, identifier ASC
             LIMIT $4 OFFSET $5
            "#,
        )
        .bind(range.start)
        .bind(range.end)
        .bind(query.agency_filter.as_deref())
        .bind(query.limit.map(|limit| limit as i64))
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let rows_read = rows.len();
        let mut records = Vec::with_capacity(rows_read);
        for row in rows {
            let identifier: String = row.try_get("identifier")?;
            let data: Value = row.try_get("data")?;
            match OpportunityRecord::from_value(data) {
                Some(record) => records.push(with_row_identifier(record, identifier)),
                None => warn!(%identifier, "skipping opportunity row whose data is not a JSON object"),
            }
        }
        Ok(CandidatePage { records, rows_read })
    }

    async fn archive(&self, identifier: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE opportunities
               SET processing_status = 'archived',
                   data = jsonb_set(data, '{processing_status}', '"archived"'::jsonb, true),
                   updated_at = now()
             WHERE identifier = $1
            "#,
        )
        .bind(identifier)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(identifier.to_string()));
        }
        Ok(())
    }
}

/// Archival is keyed on the `identifier` column, so the record must derive the same value.
fn with_row_identifier(mut record: OpportunityRecord, identifier: String) -> OpportunityRecord {
    if record.resolve_text(LogicalField::StoredId).as_deref() != Some(identifier.as_str()) {
        record.insert("id", identifier);
    }
    record
}

#[derive(Debug, Clone)]
pub struct PgAuditTrail {
    pool: PgPool,
}

impl PgAuditTrail {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditTrail for PgAuditTrail {
    async fn create_run(&self, metadata: &RunMetadata) -> Result<String, StoreError> {
        let run_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO dedup_runs (id, run_kind, started_at, parameters)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(run_id)
        .bind(&metadata.run_kind)
        .bind(metadata.started_at)
        .bind(Json(&metadata.parameters))
        .execute(&self.pool)
        .await?;
        Ok(run_id.to_string())
    }

    async fn record_action(&self, run_id: &str, action: AuditAction, details: Value) -> Result<(), StoreError> {
        let run_uuid = Uuid::parse_str(run_id).map_err(|_| StoreError::InvalidRunId(run_id.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO dedup_audit_actions (run_id, action_type, details)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(run_uuid)
        .bind(action.as_str())
        .bind(Json(details))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    fn rec(value: Value) -> OpportunityRecord {
        OpportunityRecord::from_value(value).expect("object")
    }

    fn sample_records() -> Vec<OpportunityRecord> {
        vec![
            rec(json!({ "id": "a", "agency": "General Services Administration", "postedDate": "2024-01-05" })),
            rec(json!({ "id": "b", "agency": "Department of Energy", "postedDate": "2024-02-10" })),
            rec(json!({ "id": "c", "agency": "GSA Region 4", "postedDate": "2024-03-15" })),
            rec(json!({ "id": "d", "agency": "Department of Energy" })),
        ]
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn candidate_query_filters_and_pages() {
        let store = InMemoryRecordStore::new(sample_records());

        let energy = store
            .fetch_candidates(&CandidateQuery {
                agency_filter: Some("energy".into()),
                ..CandidateQuery::default()
            })
            .await
            .expect("fetch");
        assert_eq!(energy.records.iter().map(|r| r.identifier()).collect::<Vec<_>>(), vec!["b", "d"]);

        let q1 = CandidateQuery {
            date_range: Some(DateRange {
                start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single(),
                end: Utc.with_ymd_and_hms(2024, 2, 28, 0, 0, 0).single(),
            }),
            ..CandidateQuery::default()
        };
        let in_range = store.fetch_candidates(&q1).await.expect("fetch");
        assert_eq!(in_range.records.iter().map(|r| r.identifier()).collect::<Vec<_>>(), vec!["a", "b"]);

        let page = store
            .fetch_candidates(&CandidateQuery {
                limit: Some(2),
                offset: 1,
                ..CandidateQuery::default()
            })
            .await
            .expect("fetch");
        assert_eq!(page.records.iter().map(|r| r.identifier()).collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn archived_records_are_no_longer_candidates() {
        let store = InMemoryRecordStore::new(sample_records());
        store.archive("b").await.expect("archive");
        store.archive("b").await.expect("archive is idempotent");
        assert!(matches!(store.archive("zzz").await, Err(StoreError::NotFound(id)) if id == "zzz"));

        let remaining = store.fetch_candidates(&CandidateQuery::default()).await.expect("fetch");
        assert_eq!(remaining.records.len(), 3);
        assert_eq!(remaining.rows_read, 3);
        assert_eq!(store.archived_identifiers().await, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn records_without_stored_ids_stay_individually_archivable() {
        let store = InMemoryRecordStore::new(vec![
            rec(json!({ "solicitationNumber": "SOL-2024-001", "title": "IT Support Services" })),
            rec(json!({ "solicitationNumber": "SOL-2024-001", "title": "IT Support Services (Amended)" })),
        ]);
        let page = store.fetch_candidates(&CandidateQuery::default()).await.expect("fetch");
        let ids = page.records.iter().map(|r| r.identifier()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["SOL-2024-001#0", "SOL-2024-001#1"]);

        store.archive(&ids[1]).await.expect("archive");
        let remaining = store.fetch_candidates(&CandidateQuery::default()).await.expect("fetch");
        assert_eq!(remaining.records.len(), 1);
        assert_eq!(remaining.records[0].identifier(), "SOL-2024-001#0");
        assert_eq!(store.archived_identifiers().await, vec!["SOL-2024-001#1".to_string()]);
    }

    #[test]
    fn database_rows_derive_their_column_identifier() {
        let bare = rec(json!({ "noticeId": "N-1", "title": "Paving" }));
        assert_eq!(with_row_identifier(bare, "row-7".into()).identifier(), "row-7");

        let stale = rec(json!({ "_id": "legacy-3", "noticeId": "N-1" }));
        assert_eq!(with_row_identifier(stale, "row-8".into()).identifier(), "row-8");

        let matching = rec(json!({ "id": "row-9", "noticeId": "N-1" }));
        let kept = with_row_identifier(matching.clone(), "row-9".into());
        assert_eq!(kept, matching);
    }

    #[tokio::test]
    async fn json_store_persists_archival_atomically() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("opportunities.json");
        std::fs::write(&path, serde_json::to_vec(&sample_records()).expect("json")).expect("seed");

        let store = JsonFileRecordStore::open(&path).await.expect("open");
        store.archive("c").await.expect("archive");

        let reopened = JsonFileRecordStore::open(&path).await.expect("reopen");
        let snapshot = reopened.snapshot().await;
        assert_eq!(snapshot.len(), 4);
        assert!(snapshot.iter().any(|r| r.identifier() == "c" && r.is_archived()));
        let leftovers = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn json_store_rejects_malformed_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"{ not json").expect("seed");
        assert!(matches!(
            JsonFileRecordStore::open(&path).await,
            Err(StoreError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn jsonl_audit_trail_appends_runs_and_actions() {
        let dir = tempdir().expect("tempdir");
        let audit = JsonlAuditTrail::new(dir.path().join("audit"));
        let metadata = RunMetadata {
            run_kind: "batch_dedup".into(),
            started_at: Utc::now(),
            parameters: json!({ "dry_run": false }),
        };
        let run_id = audit.create_run(&metadata).await.expect("create run");
        audit
            .record_action(&run_id, AuditAction::ArchiveDuplicate, json!({ "identifier": "b" }))
            .await
            .expect("record");
        audit
            .record_action(&run_id, AuditAction::RunCompleted, json!({}))
            .await
            .expect("record");

        let actions = std::fs::read_to_string(audit.actions_path()).expect("actions");
        let entries = actions
            .lines()
            .map(|line| serde_json::from_str::<AuditEntry>(line).expect("entry"))
            .collect::<Vec<_>>();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.run_id == run_id));
        assert_eq!(entries[0].action, AuditAction::ArchiveDuplicate);

        let runs = std::fs::read_to_string(audit.runs_path()).expect("runs");
        let run: AuditRun = serde_json::from_str(runs.trim()).expect("run");
        assert_eq!(run.metadata, metadata);
    }
}
