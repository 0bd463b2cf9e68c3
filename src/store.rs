//! SQLite persistence for runs, steps, artifacts, reports, PR bindings,
//! events, and the side-effect dedupe ledger.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::events::{EventRecord, EventType};
use crate::models::{
    Artifact, ArtifactKind, PrBinding, Run, RunStatus, Step, StepState, ValidationReport,
};

/// Async-safe handle to the engine database.
///
/// Wraps `Store` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl StoreHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Store::new_in_memory()?))
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Store::new(path)?))
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Store task panicked")?
    }

    /// Acquire the store mutex synchronously. For startup work and tests,
    /// not for hot async paths.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Store>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))
    }
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a SQLite database at the given path and run
    /// migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    repo TEXT NOT NULL,
                    base_ref TEXT NOT NULL,
                    branch_ref TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS steps (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    idx INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    body TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'queued',
                    acceptance_criteria TEXT NOT NULL DEFAULT '[]',
                    plan_md TEXT,
                    attempt INTEGER NOT NULL DEFAULT 1,
                    resume_state TEXT,
                    pause_code TEXT,
                    pause_message TEXT,
                    work_order TEXT,
                    coder_result TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(run_id, idx)
                );

                CREATE TABLE IF NOT EXISTS artifacts (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    step_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    uri TEXT NOT NULL,
                    content TEXT NOT NULL DEFAULT '',
                    meta TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS validation_reports (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    step_id TEXT NOT NULL,
                    attempt INTEGER NOT NULL,
                    report TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pr_bindings (
                    run_id TEXT PRIMARY KEY REFERENCES runs(id) ON DELETE CASCADE,
                    pr_number INTEGER NOT NULL,
                    pr_url TEXT NOT NULL,
                    head TEXT NOT NULL,
                    base TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    step_id TEXT,
                    seq INTEGER NOT NULL,
                    event_type TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT '{}',
                    ts TEXT NOT NULL,
                    UNIQUE(run_id, seq)
                );

                CREATE TABLE IF NOT EXISTS effects (
                    key TEXT PRIMARY KEY,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id);
                CREATE INDEX IF NOT EXISTS idx_artifacts_step ON artifacts(step_id);
                CREATE INDEX IF NOT EXISTS idx_reports_step ON validation_reports(step_id);
                CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id, seq);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn create_run(&self, run: &Run) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO runs (id, repo, base_ref, branch_ref, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.id.to_string(),
                    run.repo,
                    run.base_ref,
                    run.branch_ref,
                    run.status.as_str(),
                    run.created_at.to_rfc3339(),
                    run.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert run")?;
        Ok(())
    }

    pub fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        let row: Option<(String, String, String, String, String, String, String)> = self
            .conn
            .query_row(
                "SELECT id, repo, base_ref, branch_ref, status, created_at, updated_at
                 FROM runs WHERE id = ?1",
                params![run_id.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query run")?;
        row.map(|(id, repo, base_ref, branch_ref, status, created, updated)| {
            Ok(Run {
                id: parse_uuid(&id)?,
                repo,
                base_ref,
                branch_ref,
                status: parse_enum::<RunStatus>(&status)?,
                created_at: parse_ts(&created)?,
                updated_at: parse_ts(&updated)?,
            })
        })
        .transpose()
    }

    pub fn update_run_status(&self, run_id: Uuid, status: RunStatus) -> Result<()> {
        let n = self
            .conn
            .execute(
                "UPDATE runs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    run_id.to_string()
                ],
            )
            .context("Failed to update run status")?;
        anyhow::ensure!(n == 1, "Run {} not found", run_id);
        Ok(())
    }

    // ── Steps ─────────────────────────────────────────────────────────

    pub fn insert_steps(&self, steps: &[Step]) -> Result<()> {
        for step in steps {
            self.conn
                .execute(
                    "INSERT INTO steps (id, run_id, idx, title, body, status,
                        acceptance_criteria, plan_md, attempt, resume_state,
                        pause_code, pause_message, work_order, coder_result,
                        created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    params![
                        step.id.to_string(),
                        step.run_id.to_string(),
                        step.index,
                        step.title,
                        step.body,
                        step.status.as_str(),
                        serde_json::to_string(&step.acceptance_criteria)?,
                        step.plan_md,
                        step.attempt,
                        step.resume_state.map(|s| s.as_str()),
                        step.pause_code,
                        step.pause_message,
                        step.work_order
                            .as_ref()
                            .map(serde_json::to_string)
                            .transpose()?,
                        step.coder_result
                            .as_ref()
                            .map(serde_json::to_string)
                            .transpose()?,
                        step.created_at.to_rfc3339(),
                        step.updated_at.to_rfc3339(),
                    ],
                )
                .context("Failed to insert step")?;
        }
        Ok(())
    }

    pub fn list_steps(&self, run_id: Uuid) -> Result<Vec<Step>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY idx"
            ))
            .context("Failed to prepare list_steps")?;
        let rows = stmt
            .query_map(params![run_id.to_string()], raw_step)
            .context("Failed to query steps")?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(step_from_raw(row.context("Failed to read step row")?)?);
        }
        Ok(steps)
    }

    pub fn get_step(&self, step_id: Uuid) -> Result<Option<Step>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1"
            ))
            .context("Failed to prepare get_step")?;
        let raw = stmt
            .query_row(params![step_id.to_string()], raw_step)
            .optional()
            .context("Failed to query step")?;
        raw.map(step_from_raw).transpose()
    }

    /// Persist all mutable fields of a step in one statement.
    pub fn update_step(&self, step: &Step) -> Result<()> {
        let n = self
            .conn
            .execute(
                "UPDATE steps SET status = ?1, plan_md = ?2, attempt = ?3,
                    resume_state = ?4, pause_code = ?5, pause_message = ?6,
                    work_order = ?7, coder_result = ?8, updated_at = ?9
                 WHERE id = ?10",
                params![
                    step.status.as_str(),
                    step.plan_md,
                    step.attempt,
                    step.resume_state.map(|s| s.as_str()),
                    step.pause_code,
                    step.pause_message,
                    step.work_order
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    step.coder_result
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    Utc::now().to_rfc3339(),
                    step.id.to_string(),
                ],
            )
            .context("Failed to update step")?;
        anyhow::ensure!(n == 1, "Step {} not found", step.id);
        Ok(())
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    pub fn add_artifact(&self, artifact: &Artifact, content: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO artifacts (id, run_id, step_id, kind, uri, content, meta, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    artifact.id.to_string(),
                    artifact.run_id.to_string(),
                    artifact.step_id.to_string(),
                    artifact.kind.as_str(),
                    artifact.uri,
                    content,
                    serde_json::to_string(&artifact.meta)?,
                    artifact.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert artifact")?;
        Ok(())
    }

    pub fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<Artifact>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, step_id, kind, uri, meta, created_at
                 FROM artifacts WHERE run_id = ?1 ORDER BY created_at, id",
            )
            .context("Failed to prepare list_artifacts")?;
        let rows = stmt
            .query_map(params![run_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query artifacts")?;
        let mut artifacts = Vec::new();
        for row in rows {
            let (id, run, step, kind, uri, meta, created) =
                row.context("Failed to read artifact row")?;
            artifacts.push(Artifact {
                id: parse_uuid(&id)?,
                run_id: parse_uuid(&run)?,
                step_id: parse_uuid(&step)?,
                kind: parse_enum::<ArtifactKind>(&kind)?,
                uri,
                meta: serde_json::from_str(&meta).context("Corrupt artifact meta")?,
                created_at: parse_ts(&created)?,
            });
        }
        Ok(artifacts)
    }

    pub fn artifact_content(&self, artifact_id: Uuid) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT content FROM artifacts WHERE id = ?1",
                params![artifact_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query artifact content")
    }

    // ── Validation reports ────────────────────────────────────────────

    pub fn add_validation_report(
        &self,
        step_id: Uuid,
        attempt: u32,
        report: &ValidationReport,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO validation_reports (step_id, attempt, report, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    step_id.to_string(),
                    attempt,
                    serde_json::to_string(report)?,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to insert validation report")?;
        Ok(())
    }

    /// All reports for a step, oldest first, with the attempt that
    /// produced each.
    pub fn list_validation_reports(&self, step_id: Uuid) -> Result<Vec<(u32, ValidationReport)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT attempt, report FROM validation_reports
                 WHERE step_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_validation_reports")?;
        let rows = stmt
            .query_map(params![step_id.to_string()], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query validation reports")?;
        let mut reports = Vec::new();
        for row in rows {
            let (attempt, json) = row.context("Failed to read report row")?;
            reports.push((
                attempt,
                serde_json::from_str(&json).context("Corrupt validation report")?,
            ));
        }
        Ok(reports)
    }

    // ── PR bindings ───────────────────────────────────────────────────

    pub fn upsert_pr_binding(&self, binding: &PrBinding) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO pr_bindings (run_id, pr_number, pr_url, head, base)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(run_id) DO UPDATE SET
                    pr_number = excluded.pr_number,
                    pr_url = excluded.pr_url,
                    head = excluded.head,
                    base = excluded.base",
                params![
                    binding.run_id.to_string(),
                    binding.pr_number,
                    binding.pr_url,
                    binding.head,
                    binding.base,
                ],
            )
            .context("Failed to upsert PR binding")?;
        Ok(())
    }

    pub fn get_pr_binding(&self, run_id: Uuid) -> Result<Option<PrBinding>> {
        let row: Option<(String, i64, String, String, String)> = self
            .conn
            .query_row(
                "SELECT run_id, pr_number, pr_url, head, base FROM pr_bindings WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query PR binding")?;
        row.map(|(run, pr_number, pr_url, head, base)| {
            Ok(PrBinding {
                run_id: parse_uuid(&run)?,
                pr_number,
                pr_url,
                head,
                base,
            })
        })
        .transpose()
    }

    // ── Events ────────────────────────────────────────────────────────

    /// Append an event with the next sequence number for the run.
    pub fn append_event(
        &self,
        run_id: Uuid,
        step_id: Option<Uuid>,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<EventRecord> {
        let seq: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to compute event seq")?;
        let ts = Utc::now();
        self.conn
            .execute(
                "INSERT INTO events (run_id, step_id, seq, event_type, payload, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id.to_string(),
                    step_id.map(|s| s.to_string()),
                    seq,
                    event_type.as_str(),
                    serde_json::to_string(&payload)?,
                    ts.to_rfc3339(),
                ],
            )
            .context("Failed to insert event")?;
        Ok(EventRecord {
            id: self.conn.last_insert_rowid(),
            run_id,
            step_id,
            seq,
            event_type,
            payload,
            ts,
        })
    }

    pub fn list_events(&self, run_id: Uuid) -> Result<Vec<EventRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, step_id, seq, event_type, payload, ts
                 FROM events WHERE run_id = ?1 ORDER BY seq",
            )
            .context("Failed to prepare list_events")?;
        let rows = stmt
            .query_map(params![run_id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            let (id, run, step, seq, event_type, payload, ts) =
                row.context("Failed to read event row")?;
            events.push(EventRecord {
                id,
                run_id: parse_uuid(&run)?,
                step_id: step.as_deref().map(parse_uuid).transpose()?,
                seq,
                event_type: parse_enum::<EventType>(&event_type)?,
                payload: serde_json::from_str(&payload).context("Corrupt event payload")?,
                ts: parse_ts(&ts)?,
            });
        }
        Ok(events)
    }

    // ── Effect dedupe ledger ──────────────────────────────────────────

    /// Record that a keyed side effect ran. Returns true on first
    /// occurrence, false if the key was already present.
    pub fn record_effect(&self, key: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO effects (key, created_at) VALUES (?1, ?2)",
                params![key, Utc::now().to_rfc3339()],
            )
            .context("Failed to record effect")?;
        Ok(n == 1)
    }
}

const STEP_COLUMNS: &str = "id, run_id, idx, title, body, status, acceptance_criteria, \
     plan_md, attempt, resume_state, pause_code, pause_message, work_order, coder_result, \
     created_at, updated_at";

type RawStep = (
    String,
    String,
    u32,
    String,
    String,
    String,
    String,
    Option<String>,
    u32,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn raw_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawStep> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
    ))
}

fn step_from_raw(raw: RawStep) -> Result<Step> {
    let (
        id,
        run_id,
        index,
        title,
        body,
        status,
        acceptance_criteria,
        plan_md,
        attempt,
        resume_state,
        pause_code,
        pause_message,
        work_order,
        coder_result,
        created_at,
        updated_at,
    ) = raw;
    Ok(Step {
        id: parse_uuid(&id)?,
        run_id: parse_uuid(&run_id)?,
        index,
        title,
        body,
        status: parse_enum::<StepState>(&status)?,
        acceptance_criteria: serde_json::from_str(&acceptance_criteria)
            .context("Corrupt acceptance criteria")?,
        plan_md,
        attempt,
        resume_state: resume_state
            .as_deref()
            .map(parse_enum::<StepState>)
            .transpose()?,
        pause_code,
        pause_message,
        work_order: work_order
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Corrupt work order")?,
        coder_result: coder_result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Corrupt coder result")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Corrupt uuid: {s}"))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Corrupt timestamp: {s}"))?
        .with_timezone(&Utc))
}

fn parse_enum<T: FromStr<Err = String>>(s: &str) -> Result<T> {
    s.parse().map_err(|e: String| anyhow::anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StepSpec;
    use serde_json::json;

    fn seeded_run(store: &Store) -> (Run, Vec<Step>) {
        let now = Utc::now();
        let run = Run {
            id: Uuid::new_v4(),
            repo: "acme/site".into(),
            base_ref: "main".into(),
            branch_ref: "autogen/feature-abcd1234".into(),
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
        };
        store.create_run(&run).unwrap();
        let steps = vec![
            Step::from_spec(run.id, &StepSpec::new(0, "first")),
            Step::from_spec(run.id, &StepSpec::new(1, "second")),
        ];
        store.insert_steps(&steps).unwrap();
        (run, steps)
    }

    #[test]
    fn run_round_trips() {
        let store = Store::new_in_memory().unwrap();
        let (run, _) = seeded_run(&store);
        let loaded = store.get_run(run.id).unwrap().unwrap();
        assert_eq!(loaded.repo, "acme/site");
        assert_eq!(loaded.status, RunStatus::Running);
        assert!(store.get_run(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn steps_come_back_in_index_order() {
        let store = Store::new_in_memory().unwrap();
        let (run, _) = seeded_run(&store);
        let steps = store.list_steps(run.id).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].index, 0);
        assert_eq!(steps[1].index, 1);
    }

    #[test]
    fn duplicate_step_index_violates_unique_constraint() {
        let store = Store::new_in_memory().unwrap();
        let (run, _) = seeded_run(&store);
        let dup = Step::from_spec(run.id, &StepSpec::new(0, "clash"));
        assert!(store.insert_steps(&[dup]).is_err());
    }

    #[test]
    fn step_update_persists_pause_fields_and_payloads() {
        let store = Store::new_in_memory().unwrap();
        let (run, mut steps) = seeded_run(&store);
        let step = &mut steps[0];
        step.status = StepState::Paused;
        step.resume_state = Some(StepState::Planned);
        step.pause_code = Some("guard_exceeded".into());
        step.pause_message = Some("changed lines exceed limit (6000 > 5000)".into());
        step.work_order = Some(crate::models::WorkOrder {
            work_order_id: Uuid::new_v4(),
            title: "first".into(),
            objective: "do the thing".into(),
            constraints: vec![],
            acceptance_criteria: vec![],
            context_files: vec![],
            return_format: "unified-diff".into(),
        });
        store.update_step(step).unwrap();

        let loaded = store.get_step(step.id).unwrap().unwrap();
        assert_eq!(loaded.status, StepState::Paused);
        assert_eq!(loaded.resume_state, Some(StepState::Planned));
        assert_eq!(loaded.pause_code.as_deref(), Some("guard_exceeded"));
        assert_eq!(loaded.work_order.unwrap().objective, "do the thing");
        let _ = run;
    }

    #[test]
    fn event_seq_is_monotonic_per_run() {
        let store = Store::new_in_memory().unwrap();
        let (run, steps) = seeded_run(&store);
        let a = store
            .append_event(run.id, None, EventType::RunCreated, json!({}))
            .unwrap();
        let b = store
            .append_event(run.id, Some(steps[0].id), EventType::StepPlanned, json!({}))
            .unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);

        let events = store.list_events(run.id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, EventType::StepPlanned);
        assert_eq!(events[1].step_id, Some(steps[0].id));
    }

    #[test]
    fn effect_keys_dedupe() {
        let store = Store::new_in_memory().unwrap();
        let key = "step:abc:attempt:1:apply_patch";
        assert!(store.record_effect(key).unwrap());
        assert!(!store.record_effect(key).unwrap());
        assert!(store.record_effect("step:abc:attempt:2:apply_patch").unwrap());
    }

    #[test]
    fn validation_reports_keep_every_attempt() {
        let store = Store::new_in_memory().unwrap();
        let (_, steps) = seeded_run(&store);
        let step_id = steps[0].id;
        let mut first = ValidationReport::clean(step_id);
        first.fatal.push(crate::models::FatalFinding {
            code: "SYNTAX_CONFLICT_MARKER".into(),
            file: "src/a.js".into(),
            line: Some(3),
            msg: "conflict marker".into(),
        });
        store.add_validation_report(step_id, 1, &first).unwrap();
        store
            .add_validation_report(step_id, 2, &ValidationReport::clean(step_id))
            .unwrap();

        let reports = store.list_validation_reports(step_id).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].0, 1);
        assert!(reports[0].1.has_fatal());
        assert!(!reports[1].1.has_fatal());
    }

    #[test]
    fn pr_binding_upsert_replaces_existing_row() {
        let store = Store::new_in_memory().unwrap();
        let (run, _) = seeded_run(&store);
        let binding = PrBinding {
            run_id: run.id,
            pr_number: 1,
            pr_url: "https://example.test/pr/1".into(),
            head: run.branch_ref.clone(),
            base: run.base_ref.clone(),
        };
        store.upsert_pr_binding(&binding).unwrap();
        let mut updated = binding.clone();
        updated.pr_number = 2;
        updated.pr_url = "https://example.test/pr/2".into();
        store.upsert_pr_binding(&updated).unwrap();

        let loaded = store.get_pr_binding(run.id).unwrap().unwrap();
        assert_eq!(loaded.pr_number, 2);
    }

    #[test]
    fn artifacts_round_trip_with_content() {
        let store = Store::new_in_memory().unwrap();
        let (run, steps) = seeded_run(&store);
        let artifact = Artifact {
            id: Uuid::new_v4(),
            run_id: run.id,
            step_id: steps[0].id,
            kind: ArtifactKind::Diff,
            uri: format!("artifact://{}/{}/{}", run.id, steps[0].id, Uuid::new_v4()),
            meta: json!({"changed_lines": 5}),
            created_at: Utc::now(),
        };
        store.add_artifact(&artifact, "diff --git a/x b/x\n").unwrap();

        let listed = store.list_artifacts(run.id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, ArtifactKind::Diff);
        assert_eq!(listed[0].meta["changed_lines"], 5);
        let content = store.artifact_content(artifact.id).unwrap().unwrap();
        assert!(content.starts_with("diff --git"));
    }

    #[test]
    fn store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");
        let run_id = {
            let store = Store::new(&path).unwrap();
            let (run, _) = seeded_run(&store);
            run.id
        };
        let store = Store::new(&path).unwrap();
        let run = store.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.repo, "acme/site");
        assert_eq!(store.list_steps(run_id).unwrap().len(), 2);
    }
}
