//! Module resolution — which modules are installed and how to construct them.
//!
//! The orchestrator only needs `resolve(client, name) -> metadata | not found`.
//! [`DirResolver`] implements it over a modules directory of `module.toml`
//! manifests, cached until invalidated.

use std::fs;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::token::ClientId;

/// Metadata describing an installed module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleMetadata {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    /// Provider factory key — which registered constructor instantiates
    /// this module inside the worker process.
    pub provider: String,
}

/// Package-resolution collaborator consumed by the orchestrator.
pub trait ModuleResolver: Send + Sync {
    fn resolve(&self, client: ClientId, name: &str) -> Option<ModuleMetadata>;
}

/// Resolves modules from a directory of `module.toml` manifests.
pub struct DirResolver {
    modules_dir: String,
    cached: RwLock<Option<Vec<ModuleMetadata>>>,
}

impl DirResolver {
    pub fn new(modules_dir: &str) -> Self {
        Self {
            modules_dir: modules_dir.to_string(),
            cached: RwLock::new(None),
        }
    }

    /// 캐시를 무효화합니다 (모듈이 추가/제거되었을 때 호출)
    pub fn invalidate_cache(&self) {
        *self.cached.write().unwrap_or_else(|e| e.into_inner()) = None;
        tracing::info!("Module metadata cache invalidated");
    }

    /// 모듈 디렉터리에서 모든 사용 가능한 모듈 발견
    pub fn discover_modules(&self) -> Vec<ModuleMetadata> {
        if let Some(modules) = self.cached.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return modules.clone();
        }

        let mut modules = Vec::new();

        if !Path::new(&self.modules_dir).exists() {
            tracing::warn!("Modules directory does not exist: {}", self.modules_dir);
        } else {
            match fs::read_dir(&self.modules_dir) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        let path = entry.path();
                        if !path.is_dir() {
                            continue;
                        }
                        let manifest = path.join("module.toml");
                        if !manifest.exists() {
                            continue;
                        }
                        match load_manifest(&manifest) {
                            Ok(metadata) => {
                                tracing::info!(
                                    "Discovered module: {} v{} (provider '{}')",
                                    metadata.name,
                                    metadata.version,
                                    metadata.provider
                                );
                                modules.push(metadata);
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "Failed to load module manifest {}: {}",
                                    manifest.display(),
                                    e
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to read modules directory {}: {}", self.modules_dir, e);
                }
            }
        }

        *self.cached.write().unwrap_or_else(|e| e.into_inner()) = Some(modules.clone());
        modules
    }
}

impl ModuleResolver for DirResolver {
    // 모듈은 모든 클라이언트에 공통으로 설치됨 — client 축은 사용하지 않음
    fn resolve(&self, _client: ClientId, name: &str) -> Option<ModuleMetadata> {
        self.discover_modules().into_iter().find(|m| m.name == name)
    }
}

/// module.toml 파싱 ([module] 섹션: name, version, description, provider)
fn load_manifest(path: &Path) -> anyhow::Result<ModuleMetadata> {
    let content = fs::read_to_string(path)?;
    let data: toml::Value = toml::from_str(&content)?;

    let section = data
        .get("module")
        .ok_or_else(|| anyhow::anyhow!("Missing [module] section"))?;

    Ok(ModuleMetadata {
        name: section
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing module name"))?
            .to_string(),
        version: section
            .get("version")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing module version"))?
            .to_string(),
        description: section
            .get("description")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        provider: section
            .get("provider")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing module provider"))?
            .to_string(),
    })
}
