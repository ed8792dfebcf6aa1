//! End-to-end pipeline tests with substituted backends: a fixed schema
//! snapshot, a scripted completion engine, and a recording executor. No
//! database or inference server required.

use async_trait::async_trait;
use katana_nlq::completion::CompletionBackend;
use katana_nlq::config::Config;
use katana_nlq::engine::NlqEngine;
use katana_nlq::error::{NlqError, Result};
use katana_nlq::executor::{QueryResult, SqlExecutor};
use katana_nlq::knowledge::DomainIndex;
use katana_nlq::schema::{build_model, SchemaModel, SchemaProvider};
use katana_nlq::validator::ValidatedQuery;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn sample_schema() -> SchemaModel {
    build_model(
        vec![
            ("objects".into(), "id".into(), "integer".into(), "NO".into()),
            ("objects".into(), "name".into(), "text".into(), "YES".into()),
            (
                "objects".into(),
                "vendor_id".into(),
                "integer".into(),
                "YES".into(),
            ),
            (
                "vendors".into(),
                "vendor_id".into(),
                "integer".into(),
                "NO".into(),
            ),
            (
                "vendors".into(),
                "vendor_name".into(),
                "character varying".into(),
                "YES".into(),
            ),
        ],
        vec![(
            "objects".into(),
            "vendor_id".into(),
            "vendors".into(),
            "vendor_id".into(),
        )],
    )
}

struct FixedSchema {
    model: Arc<SchemaModel>,
    fail_first: AtomicUsize,
    loads: AtomicUsize,
    invalidations: AtomicUsize,
}

impl FixedSchema {
    fn new(model: SchemaModel) -> Self {
        Self {
            model: Arc::new(model),
            fail_first: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            invalidations: AtomicUsize::new(0),
        }
    }

    fn failing_first(model: SchemaModel, failures: usize) -> Self {
        let provider = Self::new(model);
        provider.fail_first.store(failures, Ordering::SeqCst);
        provider
    }
}

#[async_trait]
impl SchemaProvider for FixedSchema {
    async fn load(&self) -> Result<Arc<SchemaModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(NlqError::SchemaUnavailable("connection refused".into()));
        }
        Ok(Arc::clone(&self.model))
    }

    fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

enum ScriptStep {
    Respond(String),
    Timeout,
    EngineError,
}

struct ScriptedBackend {
    steps: Mutex<VecDeque<ScriptStep>>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, _prompt: &str, _max_tokens: u32, _stop: &[String]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(ScriptStep::Respond(text)) => Ok(text),
            Some(ScriptStep::Timeout) => {
                Err(NlqError::CompletionTimeout(Duration::from_secs(1)))
            }
            Some(ScriptStep::EngineError) => {
                Err(NlqError::CompletionEngineError("server returned 500".into()))
            }
            None => panic!("completion backend called more times than scripted"),
        }
    }
}

struct RecordingExecutor {
    calls: AtomicUsize,
    timeouts_to_fail: AtomicUsize,
    executed_sql: Mutex<Vec<String>>,
    deadlines: Mutex<Vec<Duration>>,
}

impl RecordingExecutor {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            timeouts_to_fail: AtomicUsize::new(0),
            executed_sql: Mutex::new(Vec::new()),
            deadlines: Mutex::new(Vec::new()),
        }
    }

    fn timing_out(failures: usize) -> Self {
        let exec = Self::new();
        exec.timeouts_to_fail.store(failures, Ordering::SeqCst);
        exec
    }
}

#[async_trait]
impl SqlExecutor for RecordingExecutor {
    async fn execute(&self, query: &ValidatedQuery, timeout: Duration) -> Result<QueryResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.deadlines.lock().unwrap().push(timeout);
        let remaining = self.timeouts_to_fail.load(Ordering::SeqCst);
        if remaining > 0 {
            self.timeouts_to_fail.store(remaining - 1, Ordering::SeqCst);
            return Err(NlqError::QueryTimeout(timeout));
        }
        self.executed_sql.lock().unwrap().push(query.sql.clone());
        Ok(QueryResult {
            columns: vec!["id".into(), "name".into()],
            rows: vec![vec![serde_json::json!(1), serde_json::json!("LTE_MAC")]],
        })
    }
}

struct Harness {
    engine: NlqEngine,
    schema: Arc<FixedSchema>,
    backend: Arc<ScriptedBackend>,
    executor: Arc<RecordingExecutor>,
}

fn harness(
    schema: FixedSchema,
    backend: ScriptedBackend,
    executor: RecordingExecutor,
) -> Harness {
    let schema = Arc::new(schema);
    let backend = Arc::new(backend);
    let executor = Arc::new(executor);
    let engine = NlqEngine::new(
        Config::default(),
        schema.clone() as Arc<dyn SchemaProvider>,
        Arc::new(DomainIndex::empty()),
        backend.clone() as Arc<dyn CompletionBackend>,
        executor.clone() as Arc<dyn SqlExecutor>,
    );
    Harness {
        engine,
        schema,
        backend,
        executor,
    }
}

#[tokio::test]
async fn end_to_end_select_runs_with_clamped_limit() {
    let h = harness(
        FixedSchema::new(sample_schema()),
        ScriptedBackend::new(vec![ScriptStep::Respond(
            "```sql\nSELECT id, name FROM objects\n```".into(),
        )]),
        RecordingExecutor::new(),
    );

    let outcome = h.engine.translate_and_run("What objects do we have?").await.unwrap();
    assert_eq!(outcome.question, "What objects do we have?");
    assert!(outcome.sql.contains("LIMIT 200"), "sql was: {}", outcome.sql);
    assert_eq!(outcome.columns, vec!["id", "name"]);
    assert_eq!(outcome.rows.len(), 1);
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hallucinated_table_never_reaches_executor() {
    let h = harness(
        FixedSchema::new(sample_schema()),
        ScriptedBackend::new(vec![ScriptStep::Respond(
            "SELECT type FROM object_types".into(),
        )]),
        RecordingExecutor::new(),
    );

    let err = h.engine.translate_and_run("What object types exist?").await.unwrap_err();
    match err {
        NlqError::UnknownSchemaReference(name) => assert_eq!(name, "object_types"),
        other => panic!("expected UnknownSchemaReference, got {:?}", other),
    }
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn write_statement_never_reaches_executor() {
    let h = harness(
        FixedSchema::new(sample_schema()),
        ScriptedBackend::new(vec![ScriptStep::Respond("DELETE FROM objects".into())]),
        RecordingExecutor::new(),
    );

    let err = h.engine.translate_and_run("Delete all objects").await.unwrap_err();
    assert!(matches!(err, NlqError::WriteStatementRejected(_)));
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn completion_timeout_gets_exactly_one_retry() {
    let h = harness(
        FixedSchema::new(sample_schema()),
        ScriptedBackend::new(vec![ScriptStep::Timeout, ScriptStep::Timeout]),
        RecordingExecutor::new(),
    );

    let err = h.engine.translate_and_run("What objects do we have?").await.unwrap_err();
    assert!(matches!(err, NlqError::CompletionTimeout(_)));
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn completion_timeout_then_success_recovers() {
    let h = harness(
        FixedSchema::new(sample_schema()),
        ScriptedBackend::new(vec![
            ScriptStep::Timeout,
            ScriptStep::Respond("SELECT id FROM objects".into()),
        ]),
        RecordingExecutor::new(),
    );

    let outcome = h.engine.translate_and_run("What objects do we have?").await.unwrap();
    assert!(outcome.sql.contains("SELECT id FROM objects"));
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn engine_error_is_not_retried() {
    let h = harness(
        FixedSchema::new(sample_schema()),
        ScriptedBackend::new(vec![ScriptStep::EngineError]),
        RecordingExecutor::new(),
    );

    let err = h.engine.translate_and_run("What objects do we have?").await.unwrap_err();
    assert!(matches!(err, NlqError::CompletionEngineError(_)));
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fuzzy_rewrite_reaches_executor() {
    let h = harness(
        FixedSchema::new(sample_schema()),
        ScriptedBackend::new(vec![ScriptStep::Respond(
            "SELECT vendor_name FROM vendors WHERE vendor_name = 'Nokia'".into(),
        )]),
        RecordingExecutor::new(),
    );

    h.engine.translate_and_run("Which vendors are named Nokia?").await.unwrap();
    let executed = h.executor.executed_sql.lock().unwrap();
    assert_eq!(executed.len(), 1);
    assert!(
        executed[0].contains("vendor_name ILIKE '%Nokia%'"),
        "sql was: {}",
        executed[0]
    );
}

#[tokio::test]
async fn schema_failure_invalidates_cache_and_retries_once() {
    let h = harness(
        FixedSchema::failing_first(sample_schema(), 1),
        ScriptedBackend::new(vec![ScriptStep::Respond("SELECT id FROM objects".into())]),
        RecordingExecutor::new(),
    );

    h.engine.translate_and_run("What objects do we have?").await.unwrap();
    assert_eq!(h.schema.loads.load(Ordering::SeqCst), 2);
    assert_eq!(h.schema.invalidations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn persistent_schema_failure_surfaces_after_one_retry() {
    let h = harness(
        FixedSchema::failing_first(sample_schema(), 2),
        ScriptedBackend::new(vec![]),
        RecordingExecutor::new(),
    );

    let err = h.engine.translate_and_run("What objects do we have?").await.unwrap_err();
    assert!(matches!(err, NlqError::SchemaUnavailable(_)));
    assert_eq!(h.schema.loads.load(Ordering::SeqCst), 2);
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn query_timeout_retries_once_with_shorter_deadline() {
    let h = harness(
        FixedSchema::new(sample_schema()),
        ScriptedBackend::new(vec![ScriptStep::Respond("SELECT id FROM objects".into())]),
        RecordingExecutor::timing_out(1),
    );

    h.engine.translate_and_run("What objects do we have?").await.unwrap();
    let deadlines = h.executor.deadlines.lock().unwrap();
    assert_eq!(deadlines.len(), 2);
    assert_eq!(deadlines[1], deadlines[0] / 2);
}

#[tokio::test]
async fn persistent_query_timeout_surfaces_after_one_retry() {
    let h = harness(
        FixedSchema::new(sample_schema()),
        ScriptedBackend::new(vec![ScriptStep::Respond("SELECT id FROM objects".into())]),
        RecordingExecutor::timing_out(2),
    );

    let err = h.engine.translate_and_run("What objects do we have?").await.unwrap_err();
    assert!(matches!(err, NlqError::QueryTimeout(_)));
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 2);
}
