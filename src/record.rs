//! Deployment record store
//!
//! Tracks each deployment by a stable deploy ID and a monotonically
//! increasing operation ID per deploy/destroy pass, with the final status
//! of every operation. Records persist as TOML under the user state
//! directory (or an explicit root, for tests and embedding).

use crate::deploy::types::{DeployOpStatus, GoalStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Identity of one deployment operation within a deployment
pub type DeployOpId = u64;

/// One deploy/destroy operation of a deployment
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpRecord {
    /// Operation id, increasing per deployment
    pub op_id: DeployOpId,
    /// Goal the operation drove toward
    pub goal: GoalStatus,
    /// Final status; absent while the operation is in flight
    pub status: Option<DeployOpStatus>,
    /// When the operation started
    pub started: DateTime<Utc>,
    /// When the operation finished
    pub finished: Option<DateTime<Utc>>,
}

/// Persistent record of one deployment
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeploymentRecord {
    /// Stable identity of the deployment
    pub deploy_id: String,
    /// When the deployment was first created
    pub created: DateTime<Utc>,
    /// Last time the record was updated
    pub last_updated: DateTime<Utc>,
    /// Operation history, oldest first
    #[serde(default)]
    pub ops: Vec<OpRecord>,
}

impl DeploymentRecord {
    fn new(deploy_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            deploy_id: deploy_id.into(),
            created: now,
            last_updated: now,
            ops: Vec::new(),
        }
    }

    /// The most recent operation, if any
    pub fn current_op(&self) -> Option<&OpRecord> {
        self.ops.last()
    }
}

/// Directory of deployment record files
#[derive(Debug, Clone)]
pub struct DeploymentStore {
    root: PathBuf,
}

impl DeploymentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default record directory (~/.local/state/stratus)
    pub fn default_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".local").join("state").join("stratus"))
    }

    /// Open the store at the default directory
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Self::default_dir()?))
    }

    fn record_file(&self, deploy_id: &str) -> PathBuf {
        self.root.join(format!("{deploy_id}.toml"))
    }

    /// Create a new deployment record and return a handle to it
    pub fn create(&self, deploy_id: impl Into<String>) -> Result<Deployment> {
        let record = DeploymentRecord::new(deploy_id);
        self.save(&record)?;
        Ok(Deployment::with_store(record, self.clone()))
    }

    /// Load an existing deployment record into a handle
    pub fn load(&self, deploy_id: &str) -> Result<Deployment> {
        let path = self.record_file(deploy_id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read record file: {}", path.display()))?;
        let record: DeploymentRecord = toml::from_str(&content)
            .with_context(|| format!("Failed to parse record file: {}", path.display()))?;
        log::debug!("Loaded deployment record from {}", path.display());
        Ok(Deployment::with_store(record, self.clone()))
    }

    /// Save a record to disk
    pub fn save(&self, record: &DeploymentRecord) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create record directory: {}", self.root.display()))?;

        let path = self.record_file(&record.deploy_id);
        let content =
            toml::to_string_pretty(record).context("Failed to serialize record to TOML")?;
        fs::write(&path, &content)
            .with_context(|| format!("Failed to write record file: {}", path.display()))?;

        log::debug!("Saved deployment record to {}", path.display());
        Ok(())
    }
}

struct DeploymentInner {
    record: DeploymentRecord,
    store: Option<DeploymentStore>,
}

/// Cheap cloneable handle to one deployment's record
///
/// The status tracker holds one of these and records each operation's
/// final status through it.
#[derive(Clone)]
pub struct Deployment {
    inner: Arc<Mutex<DeploymentInner>>,
}

impl Deployment {
    fn with_store(record: DeploymentRecord, store: DeploymentStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeploymentInner {
                record,
                store: Some(store),
            })),
        }
    }

    /// In-memory handle with no persistence, for tests and embedders that
    /// keep their own records
    pub fn ephemeral(deploy_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeploymentInner {
                record: DeploymentRecord::new(deploy_id),
                store: None,
            })),
        }
    }

    pub fn deploy_id(&self) -> String {
        self.lock().record.deploy_id.clone()
    }

    /// Snapshot of the current record
    pub fn record(&self) -> DeploymentRecord {
        self.lock().record.clone()
    }

    /// Start a new operation toward the given goal
    pub fn new_op(&self, goal: GoalStatus) -> Result<DeployOpId> {
        let mut inner = self.lock();
        let op_id = inner.record.ops.last().map_or(0, |op| op.op_id + 1);
        inner.record.ops.push(OpRecord {
            op_id,
            goal,
            status: None,
            started: Utc::now(),
            finished: None,
        });
        inner.record.last_updated = Utc::now();
        Self::persist(&inner)?;
        Ok(op_id)
    }

    /// Record the final status of an operation
    pub fn record_op_status(&self, op_id: DeployOpId, status: DeployOpStatus) -> Result<()> {
        let mut inner = self.lock();
        let op = inner
            .record
            .ops
            .iter_mut()
            .find(|op| op.op_id == op_id)
            .with_context(|| format!("No operation {op_id} in deployment record"))?;
        op.status = Some(status);
        op.finished = Some(Utc::now());
        inner.record.last_updated = Utc::now();
        Self::persist(&inner)
    }

    fn persist(inner: &DeploymentInner) -> Result<()> {
        match &inner.store {
            Some(store) => store.save(&inner.record),
            None => Ok(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeploymentInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("deploy_id", &self.deploy_id())
            .finish_non_exhaustive()
    }
}
