//! Durable, versioned storage of plans and session contexts.
//!
//! One JSON document per session at `<root>/<session_id>/session.json`,
//! schema-validated at load so partial corruption is detected up front.
//! Writes are optimistic-concurrency-controlled: callers present the version
//! they last read, and a mismatch means another writer got there first.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::context::SessionContext;
use crate::core::plan::Plan;

const SESSION_DOCUMENT_SCHEMA: &str = include_str!("../schemas/session_document.schema.json");

/// Document schema tag, bumped on incompatible layout changes so loaders can
/// migrate forward.
pub const SCHEMA_VERSION: u32 = 1;

/// Another writer mutated the session since the caller's last read. The
/// caller must reload and retry (or abort with conflict semantics at the
/// boundary); this is never surfaced to the end user as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConflictError {
    pub expected: u64,
    pub actual: u64,
}

impl fmt::Display for VersionConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version conflict: expected {}, found {}",
            self.expected, self.actual
        )
    }
}

impl std::error::Error for VersionConflictError {}

/// The persisted document failed schema validation or could not be parsed.
/// Non-retryable; surfaced to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptStateError {
    pub session_id: String,
    pub reason: String,
}

impl fmt::Display for CorruptStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "corrupt session state for '{}': {}",
            self.session_id, self.reason
        )
    }
}

impl std::error::Error for CorruptStateError {}

/// Versioned document persisted per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionDocument {
    schema_version: u32,
    version: u64,
    plan: Plan,
    context: SessionContext,
}

/// A consistent read of a session.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub plan: Plan,
    pub context: SessionContext,
    pub version: u64,
}

/// File-backed session store with per-session write serialization.
pub struct PlanStore {
    root: PathBuf,
    // Save is a compare-and-swap; the lock table makes it atomic within this
    // process. Cross-process writers are excluded by the single-writer-per-
    // session ownership model.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PlanStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.session_path(session_id).exists()
    }

    /// Create a new session at version 1. Fails if the session already exists.
    pub fn create(
        &self,
        session_id: &str,
        plan: &Plan,
        context: &SessionContext,
    ) -> Result<u64> {
        validate_session_id(session_id)?;
        let _guard = self.lock_session(session_id);
        let path = self.session_path(session_id);
        if path.exists() {
            return Err(anyhow!("session '{session_id}' already exists"));
        }
        let document = SessionDocument {
            schema_version: SCHEMA_VERSION,
            version: 1,
            plan: plan.clone(),
            context: context.clone(),
        };
        write_document(&path, &document)?;
        debug!(session_id, "session created");
        Ok(1)
    }

    /// Load the session's plan, context, and current version.
    pub fn load(&self, session_id: &str) -> Result<Snapshot> {
        validate_session_id(session_id)?;
        let path = self.session_path(session_id);
        let document = read_document(session_id, &path)?;
        debug!(session_id, version = document.version, "session loaded");
        Ok(Snapshot {
            plan: document.plan,
            context: document.context,
            version: document.version,
        })
    }

    /// Persist new state if `expected_version` still matches the stored
    /// document. Returns the new version on success.
    pub fn save(
        &self,
        session_id: &str,
        plan: &Plan,
        context: &SessionContext,
        expected_version: u64,
    ) -> Result<u64> {
        validate_session_id(session_id)?;
        let _guard = self.lock_session(session_id);
        let path = self.session_path(session_id);
        let current = read_document(session_id, &path)?;
        if current.version != expected_version {
            return Err(anyhow!(VersionConflictError {
                expected: expected_version,
                actual: current.version,
            }));
        }
        let document = SessionDocument {
            schema_version: SCHEMA_VERSION,
            version: expected_version + 1,
            plan: plan.clone(),
            context: context.clone(),
        };
        write_document(&path, &document)?;
        debug!(session_id, version = document.version, "session saved");
        Ok(document.version)
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id).join("session.json")
    }

    fn lock_session(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Session ids become directory names; keep them to a safe charset.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() {
        return Err(anyhow!("session id must not be empty"));
    }
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(anyhow!(
            "invalid session id '{session_id}' (allowed: alphanumeric, '-', '_')"
        ));
    }
    Ok(())
}

fn read_document(session_id: &str, path: &Path) -> Result<SessionDocument> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read session {} ({})", session_id, path.display()))?;
    let value: Value = serde_json::from_str(&contents).map_err(|err| {
        anyhow!(CorruptStateError {
            session_id: session_id.to_string(),
            reason: format!("invalid JSON: {err}"),
        })
    })?;
    validate_schema(session_id, &value)?;
    let document: SessionDocument = serde_json::from_value(value).map_err(|err| {
        anyhow!(CorruptStateError {
            session_id: session_id.to_string(),
            reason: format!("deserialize failed: {err}"),
        })
    })?;
    if document.schema_version != SCHEMA_VERSION {
        return Err(anyhow!(CorruptStateError {
            session_id: session_id.to_string(),
            reason: format!(
                "unsupported schema_version {} (engine supports {})",
                document.schema_version, SCHEMA_VERSION
            ),
        }));
    }
    Ok(document)
}

fn validate_schema(session_id: &str, value: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(SESSION_DOCUMENT_SCHEMA).context("parse session document schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {err}"))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(CorruptStateError {
            session_id: session_id.to_string(),
            reason: format!("schema validation failed: {}", messages.join("; ")),
        }));
    }
    Ok(())
}

/// Atomic write (temp file + rename), pretty-printed with trailing newline.
fn write_document(path: &Path, document: &SessionDocument) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("session path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(document)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp session {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace session {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan_with_tasks, task};

    fn store() -> (tempfile::TempDir, PlanStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = PlanStore::new(temp.path());
        (temp, store)
    }

    /// Verifies create -> load round-trips plan, context, and version.
    #[test]
    fn create_and_load_round_trips() {
        let (_temp, store) = store();
        let plan = plan_with_tasks(vec![task(0, &[]), task(1, &[0])]);
        let ctx = SessionContext::default();

        let version = store.create("ses-1", &plan, &ctx).expect("create");
        assert_eq!(version, 1);

        let snapshot = store.load("ses-1").expect("load");
        assert_eq!(snapshot.plan, plan);
        assert_eq!(snapshot.context, ctx);
        assert_eq!(snapshot.version, 1);
    }

    #[test]
    fn create_rejects_existing_session() {
        let (_temp, store) = store();
        let plan = plan_with_tasks(vec![task(0, &[])]);
        let ctx = SessionContext::default();
        store.create("ses-1", &plan, &ctx).expect("create");
        let err = store.create("ses-1", &plan, &ctx).expect_err("duplicate");
        assert!(err.to_string().contains("already exists"));
    }

    /// Save with a stale version yields a downcastable VersionConflictError.
    #[test]
    fn stale_save_returns_version_conflict() {
        let (_temp, store) = store();
        let plan = plan_with_tasks(vec![task(0, &[])]);
        let ctx = SessionContext::default();
        store.create("ses-1", &plan, &ctx).expect("create");

        let v2 = store.save("ses-1", &plan, &ctx, 1).expect("first save");
        assert_eq!(v2, 2);

        let err = store
            .save("ses-1", &plan, &ctx, 1)
            .expect_err("stale save must fail");
        let conflict = err
            .downcast_ref::<VersionConflictError>()
            .expect("typed conflict");
        assert_eq!(conflict.expected, 1);
        assert_eq!(conflict.actual, 2);
    }

    /// A document that fails schema validation surfaces CorruptStateError.
    #[test]
    fn corrupt_document_is_detected_at_load() {
        let (temp, store) = store();
        let plan = plan_with_tasks(vec![task(0, &[])]);
        store
            .create("ses-1", &plan, &SessionContext::default())
            .expect("create");

        let path = temp.path().join("ses-1").join("session.json");
        fs::write(&path, "{\"schema_version\": 1}\n").expect("overwrite");

        let err = store.load("ses-1").expect_err("load must fail");
        assert!(err.downcast_ref::<CorruptStateError>().is_some());
    }

    #[test]
    fn invalid_json_is_corrupt_state() {
        let (temp, store) = store();
        let plan = plan_with_tasks(vec![task(0, &[])]);
        store
            .create("ses-1", &plan, &SessionContext::default())
            .expect("create");
        let path = temp.path().join("ses-1").join("session.json");
        fs::write(&path, "not json").expect("overwrite");
        let err = store.load("ses-1").expect_err("load must fail");
        assert!(err.downcast_ref::<CorruptStateError>().is_some());
    }

    #[test]
    fn session_id_charset_is_enforced() {
        assert!(validate_session_id("ses-1_a").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../escape").is_err());
        assert!(validate_session_id("a b").is_err());
    }
}
