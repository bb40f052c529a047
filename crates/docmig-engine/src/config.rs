use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use docmig_core::{fields, FieldMap};
use docmig_store::{FirestoreConfig, FirestoreRestStore, JsonFileStore, MemoryStore, RecordStore};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dedup::DedupSpec;
use crate::link::{LinkSpec, ScopeFilter};
use crate::reconcile::DuplicatePair;
use crate::seed::SeedSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    File,
    Firestore,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "file" | "json" => Ok(StoreBackend::File),
            "firestore" => Ok(StoreBackend::Firestore),
            other => bail!("unknown store backend {other:?} (expected memory, file or firestore)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend: StoreBackend,
    pub snapshot_path: PathBuf,
    pub firestore_project_id: Option<String>,
    pub firestore_database: String,
    pub firestore_access_token: Option<String>,
    pub firestore_emulator_host: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub reports_dir: PathBuf,
    pub tasks_file: PathBuf,
    pub dry_run: bool,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let backend = std::env::var("DOCMIG_BACKEND")
            .ok()
            .and_then(|v| match v.parse() {
                Ok(backend) => Some(backend),
                Err(err) => {
                    warn!(error = %err, "ignoring DOCMIG_BACKEND");
                    None
                }
            })
            .unwrap_or(StoreBackend::File);

        Self {
            backend,
            snapshot_path: std::env::var("DOCMIG_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/snapshot.json")),
            firestore_project_id: std::env::var("FIRESTORE_PROJECT_ID").ok(),
            firestore_database: std::env::var("FIRESTORE_DATABASE")
                .unwrap_or_else(|_| "(default)".to_string()),
            firestore_access_token: std::env::var("FIRESTORE_ACCESS_TOKEN").ok(),
            firestore_emulator_host: std::env::var("FIRESTORE_EMULATOR_HOST").ok(),
            http_timeout_secs: std::env::var("DOCMIG_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("DOCMIG_USER_AGENT")
                .unwrap_or_else(|_| "docmig/0.1".to_string()),
            reports_dir: std::env::var("DOCMIG_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            tasks_file: std::env::var("DOCMIG_TASKS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./tasks.yaml")),
            dry_run: std::env::var("DOCMIG_DRY_RUN")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }

    /// Builds the configured backend. Failing here aborts the run before any read or write.
    pub async fn open_store(&self) -> Result<Box<dyn RecordStore>> {
        match self.backend {
            StoreBackend::Memory => Ok(Box::new(MemoryStore::new())),
            StoreBackend::File => {
                let store = JsonFileStore::open(&self.snapshot_path)
                    .await
                    .with_context(|| format!("opening snapshot {}", self.snapshot_path.display()))?;
                Ok(Box::new(store))
            }
            StoreBackend::Firestore => {
                let project_id = self
                    .firestore_project_id
                    .clone()
                    .context("FIRESTORE_PROJECT_ID is required for the firestore backend")?;
                let mut config = FirestoreConfig::new(project_id);
                config.database = self.firestore_database.clone();
                config.timeout = Duration::from_secs(self.http_timeout_secs);
                config.user_agent = Some(self.user_agent.clone());
                config.access_token = self.firestore_access_token.clone();
                if let Some(host) = &self.firestore_emulator_host {
                    config.base_url = format!("http://{host}/v1");
                    config.access_token.get_or_insert_with(|| "owner".to_string());
                } else if config.access_token.is_none() {
                    bail!("FIRESTORE_ACCESS_TOKEN is required outside the emulator");
                }
                let store = FirestoreRestStore::new(config).context("building firestore client")?;
                Ok(Box::new(store))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileTask {
    pub collection: String,
    pub pairs: Vec<DuplicatePair>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeTask {
    /// Collection that is kept.
    pub primary: String,
    /// Collection absorbed into `primary` and then emptied.
    pub secondary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkTask {
    pub reference_collection: String,
    pub name_field: String,
    pub target_collection: String,
    #[serde(flatten)]
    pub spec: LinkSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedTask {
    pub reference_collection: String,
    pub target_collection: String,
    #[serde(flatten)]
    pub spec: SeedSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupTask {
    pub collection: String,
    #[serde(flatten)]
    pub spec: DedupSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillTask {
    pub collection: String,
    pub defaults: FieldMap,
}

/// Which collections and fields each mode works on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFile {
    pub reconcile: ReconcileTask,
    pub merge: MergeTask,
    pub dedup: Vec<DedupTask>,
    pub links: Vec<LinkTask>,
    pub seed: Option<SeedTask>,
    pub backfill: Vec<BackfillTask>,
}

impl Default for TaskFile {
    fn default() -> Self {
        let scope = ScopeFilter {
            field: "organizacionId".to_string(),
            value: "MEIK LABS".to_string(),
        };
        Self {
            reconcile: ReconcileTask {
                collection: "usuarios".to_string(),
                pairs: vec![
                    DuplicatePair::new("role", "rol"),
                    DuplicatePair::new("organizationId", "organizacionId"),
                ],
            },
            merge: MergeTask {
                primary: "users".to_string(),
                secondary: "usuarios".to_string(),
            },
            dedup: vec![DedupTask {
                collection: "usuarios".to_string(),
                spec: DedupSpec::new("email", "fechaCreacion"),
            }],
            links: vec![
                LinkTask {
                    reference_collection: "organizaciones".to_string(),
                    name_field: "nombre".to_string(),
                    target_collection: "contratos".to_string(),
                    spec: LinkSpec {
                        touch_field: Some("fechaUltimaModificacion".to_string()),
                        scope: Some(scope.clone()),
                        ..LinkSpec::new("contraparte", "contraparteOrganizacionId")
                    },
                },
                // Organisation names stored where the id belongs.
                LinkTask {
                    reference_collection: "organizaciones".to_string(),
                    name_field: "nombre".to_string(),
                    target_collection: "usuarios".to_string(),
                    spec: LinkSpec {
                        touch_field: Some("ultimoAcceso".to_string()),
                        ..LinkSpec::new("organizacionId", "organizacionId")
                    },
                },
            ],
            seed: Some(SeedTask {
                reference_collection: "organizaciones".to_string(),
                target_collection: "contratos".to_string(),
                spec: SeedSpec {
                    name_field: "nombre".to_string(),
                    reference_field: "contraparte".to_string(),
                    scope: Some(scope),
                    defaults: fields([("tipo", "empresa"), ("sector", "otros")]),
                },
            }),
            backfill: vec![BackfillTask {
                collection: "organizaciones".to_string(),
                defaults: fields([("representanteLegal", ""), ("rutRepresentanteLegal", "")]),
            }],
        }
    }
}

impl TaskFile {
    /// A missing file means the built-in tasks; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no task file, using built-in tasks");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}
