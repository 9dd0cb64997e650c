//! JSON-backed model catalog.
//!
//! One document holds every known model, the active model per pool, and the
//! role assignments consumed by the LLM service (`character_model`,
//! `executor_model:{task}`, `embedding_model`). Writes go through explicit
//! operations and persist atomically (write temp, rename).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use env_config::ModelSettings;

use super::RegistryError;

/// Role category of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelPool {
    Text,
    Embedding,
}

impl ModelPool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Embedding => "embedding",
        }
    }
}

/// One catalog record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub pool: ModelPool,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Where the model came from: "local" or "download".
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// True when this model is the active one for its pool. Reset atomically
    /// whenever an assignment changes.
    #[serde(default)]
    pub active: bool,
    /// Per-model execution parameters.
    #[serde(default)]
    pub settings: ModelSettings,
}

/// Role assignment maps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleAssignments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character: Option<String>,
    /// Executor assignments keyed by task type; "default" is the fallback.
    #[serde(default)]
    pub executor: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<String>,
}

/// The persisted `models.json` structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDoc {
    pub version: u32,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
    /// Active model id per pool name.
    #[serde(default)]
    pub active: HashMap<String, String>,
    #[serde(default)]
    pub roles: RoleAssignments,
}

impl Default for RegistryDoc {
    fn default() -> Self {
        Self {
            version: 1,
            models: Vec::new(),
            active: HashMap::new(),
            roles: RoleAssignments::default(),
        }
    }
}

/// Persistent model catalog.
///
/// **Interaction**: `LlmService` resolves model keys through
/// [`ModelCatalog::resolve_model_key`]; the download service registers
/// completed downloads via [`ModelCatalog::add_model`].
pub struct ModelCatalog {
    registry_path: PathBuf,
    models_dir: PathBuf,
    doc: RwLock<RegistryDoc>,
}

impl ModelCatalog {
    /// Opens (or initializes) the catalog at `registry_path`. A missing file
    /// yields an empty document; a corrupt file is an error.
    pub fn open(registry_path: PathBuf, models_dir: PathBuf) -> Result<Self, RegistryError> {
        let doc = if registry_path.exists() {
            let content = std::fs::read_to_string(&registry_path)?;
            serde_json::from_str(&content)?
        } else {
            RegistryDoc::default()
        };
        debug!(path = %registry_path.display(), models = doc.models.len(), "model catalog opened");
        Ok(Self {
            registry_path,
            models_dir,
            doc: RwLock::new(doc),
        })
    }

    /// Managed models directory; deleted models inside it lose their file.
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    fn persist(&self, doc: &RegistryDoc) -> Result<(), RegistryError> {
        if let Some(parent) = self.registry_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.registry_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(doc)?)?;
        std::fs::rename(&tmp, &self.registry_path)?;
        Ok(())
    }

    fn write<T>(
        &self,
        mutate: impl FnOnce(&mut RegistryDoc) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut doc = self
            .doc
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let result = mutate(&mut doc)?;
        self.persist(&doc)?;
        Ok(result)
    }

    fn read<T>(&self, f: impl FnOnce(&RegistryDoc) -> T) -> T {
        let doc = self
            .doc
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&doc)
    }

    /// Lists models, optionally filtered by pool, in stored (display) order.
    pub fn list(&self, pool: Option<ModelPool>) -> Vec<ModelInfo> {
        self.read(|doc| {
            doc.models
                .iter()
                .filter(|m| pool.map_or(true, |p| m.pool == p))
                .cloned()
                .collect()
        })
    }

    /// Fetches one model by id.
    pub fn get(&self, id: &str) -> Option<ModelInfo> {
        self.read(|doc| doc.models.iter().find(|m| m.id == id).cloned())
    }

    /// Active model for a pool, if any.
    pub fn active_model(&self, pool: ModelPool) -> Option<ModelInfo> {
        self.read(|doc| {
            doc.active
                .get(pool.as_str())
                .and_then(|id| doc.models.iter().find(|m| &m.id == id))
                .cloned()
        })
    }

    /// Marks `id` active for `pool`, atomically resetting every other model
    /// in the pool.
    pub fn set_active(&self, pool: ModelPool, id: &str) -> Result<(), RegistryError> {
        self.write(|doc| {
            if !doc.models.iter().any(|m| m.id == id && m.pool == pool) {
                return Err(RegistryError::NotFound(id.to_string()));
            }
            for model in doc.models.iter_mut().filter(|m| m.pool == pool) {
                model.active = model.id == id;
            }
            doc.active.insert(pool.as_str().to_string(), id.to_string());
            info!(pool = pool.as_str(), id, "active model changed");
            Ok(())
        })
    }

    /// Registers a model backed by a local file.
    pub fn add_local(
        &self,
        path: PathBuf,
        display_name: impl Into<String>,
        pool: ModelPool,
    ) -> Result<ModelInfo, RegistryError> {
        let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let info = ModelInfo {
            id: uuid::Uuid::new_v4().to_string(),
            display_name: display_name.into(),
            pool,
            path,
            size_bytes,
            source: "local".into(),
            repo_id: None,
            revision: None,
            sha256: None,
            active: false,
            settings: ModelSettings::default(),
        };
        self.add_model(info.clone())?;
        Ok(info)
    }

    /// Inserts a fully-formed record (e.g. from a verified download).
    pub fn add_model(&self, info: ModelInfo) -> Result<(), RegistryError> {
        self.write(|doc| {
            info!(id = %info.id, name = %info.display_name, pool = info.pool.as_str(), "model registered");
            doc.models.push(info);
            Ok(())
        })
    }

    /// Removes a model. The backing file is deleted only when it lives under
    /// the managed models directory.
    pub fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let removed = self.write(|doc| {
            let Some(pos) = doc.models.iter().position(|m| m.id == id) else {
                return Err(RegistryError::NotFound(id.to_string()));
            };
            let removed = doc.models.remove(pos);
            doc.active.retain(|_, v| v != id);
            if doc.roles.character.as_deref() == Some(id) {
                doc.roles.character = None;
            }
            if doc.roles.embedding.as_deref() == Some(id) {
                doc.roles.embedding = None;
            }
            doc.roles.executor.retain(|_, v| v != id);
            Ok(removed)
        })?;

        if removed.path.starts_with(&self.models_dir) {
            if let Err(err) = std::fs::remove_file(&removed.path) {
                warn!(path = %removed.path.display(), error = %err, "failed to delete model file");
            }
        }
        info!(id, "model deleted");
        Ok(())
    }

    /// Reorders models of one pool for display. Unknown ids are ignored;
    /// unmentioned models keep their relative order at the end.
    pub fn reorder(&self, pool: ModelPool, new_order: &[String]) -> Result<(), RegistryError> {
        self.write(|doc| {
            let (mut in_pool, rest): (Vec<ModelInfo>, Vec<ModelInfo>) =
                doc.models.drain(..).partition(|m| m.pool == pool);
            let mut ordered = Vec::with_capacity(in_pool.len());
            for id in new_order {
                if let Some(pos) = in_pool.iter().position(|m| &m.id == id) {
                    ordered.push(in_pool.remove(pos));
                }
            }
            ordered.extend(in_pool);
            doc.models = ordered;
            doc.models.extend(rest);
            Ok(())
        })
    }

    /// Assigns the character role.
    pub fn set_character_model(&self, id: &str) -> Result<(), RegistryError> {
        self.write(|doc| {
            if !doc.models.iter().any(|m| m.id == id) {
                return Err(RegistryError::NotFound(id.to_string()));
            }
            doc.roles.character = Some(id.to_string());
            Ok(())
        })
    }

    /// Assigns the executor role for a task type.
    pub fn set_executor_model(&self, task_type: &str, id: &str) -> Result<(), RegistryError> {
        self.write(|doc| {
            if !doc.models.iter().any(|m| m.id == id) {
                return Err(RegistryError::NotFound(id.to_string()));
            }
            doc.roles
                .executor
                .insert(task_type.to_string(), id.to_string());
            Ok(())
        })
    }

    /// Assigns the embedding role.
    pub fn set_embedding_model(&self, id: &str) -> Result<(), RegistryError> {
        self.write(|doc| {
            if !doc.models.iter().any(|m| m.id == id) {
                return Err(RegistryError::NotFound(id.to_string()));
            }
            doc.roles.embedding = Some(id.to_string());
            Ok(())
        })
    }

    /// Resolves a service model key (`character_model`,
    /// `executor_model:{task}`, `embedding_model`) to the assigned record.
    /// Executor lookups fall back to the `default` task type.
    pub fn resolve_model_key(&self, model_key: &str) -> Option<ModelInfo> {
        self.read(|doc| {
            let id = if model_key == "character_model" {
                doc.roles.character.clone()
            } else if model_key == "embedding_model" {
                doc.roles.embedding.clone()
            } else if let Some(task) = model_key.strip_prefix("executor_model:") {
                doc.roles
                    .executor
                    .get(task)
                    .or_else(|| doc.roles.executor.get("default"))
                    .cloned()
            } else {
                None
            }?;
            doc.models.iter().find(|m| m.id == id).cloned()
        })
    }
}
