use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::types::{ChunkId, ModuleId, WasmModuleId};

/// Build-time mapping from chunk and module identifiers to fetchable URLs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Manifest {
    /// Prefix prepended to every artifact file name.
    #[serde(default)]
    pub public_path: String,
    /// Chunk scripts resolve to `<public_path><chunk>.<script_suffix>.js`.
    #[serde(default = "default_script_suffix")]
    pub script_suffix: String,
    /// Binary modules resolve to `<public_path><hash>.module.<module_extension>`.
    #[serde(default = "default_module_extension")]
    pub module_extension: String,
    /// Chunks that ship with the entry bundle and never need fetching.
    #[serde(default = "default_installed")]
    pub installed: Vec<ChunkId>,
    #[serde(default)]
    pub chunks: BTreeMap<ChunkId, ChunkDefinition>,
    #[serde(default)]
    pub wasm: BTreeMap<WasmModuleId, WasmDefinition>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkDefinition {
    #[serde(default = "default_true")]
    pub script: bool,
    #[serde(default)]
    pub wasm: Vec<WasmModuleId>,
}

impl Default for ChunkDefinition {
    fn default() -> Self {
        Self {
            script: true,
            wasm: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WasmDefinition {
    /// Content hash that names the artifact on the server
    pub hash: String,
    /// Import namespace -> host adapter whose exports satisfy it
    #[serde(default)]
    pub imports: BTreeMap<String, ImportNamespace>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImportNamespace {
    pub adapter: ModuleId,
    /// Function name -> number of integer parameters
    #[serde(default)]
    pub functions: BTreeMap<String, usize>,
}

fn default_script_suffix() -> String {
    "bootstrap".to_string()
}

fn default_module_extension() -> String {
    "wasm".to_string()
}

fn default_installed() -> Vec<ChunkId> {
    vec![ChunkId::from("main")]
}

fn default_true() -> bool {
    true
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            public_path: String::new(),
            script_suffix: default_script_suffix(),
            module_extension: default_module_extension(),
            installed: default_installed(),
            chunks: BTreeMap::new(),
            wasm: BTreeMap::new(),
        }
    }
}

impl Manifest {
    /// Load and validate a manifest from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to load manifest {}: {e}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let manifest: Manifest = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn with_public_path(mut self, public_path: impl Into<String>) -> Self {
        self.public_path = public_path.into();
        self
    }

    pub fn with_chunk(mut self, chunk: impl Into<ChunkId>, definition: ChunkDefinition) -> Self {
        self.chunks.insert(chunk.into(), definition);
        self
    }

    pub fn with_wasm(mut self, module: impl Into<WasmModuleId>, definition: WasmDefinition) -> Self {
        self.wasm.insert(module.into(), definition);
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (chunk, definition) in &self.chunks {
            for module in &definition.wasm {
                if !self.wasm.contains_key(module) {
                    return Err(anyhow::anyhow!(
                        "Chunk '{chunk}' references undefined wasm module '{module}'"
                    ));
                }
            }
        }
        for (module, definition) in &self.wasm {
            if definition.hash.is_empty() || definition.hash.contains('/') {
                return Err(anyhow::anyhow!(
                    "Wasm module '{module}' has invalid content hash '{}'",
                    definition.hash
                ));
            }
        }
        Ok(())
    }

    pub fn is_installed(&self, chunk: &ChunkId) -> bool {
        self.installed.contains(chunk)
    }

    /// Whether loading this chunk requires fetching its script.
    /// Chunks the manifest does not mention are assumed to have one.
    pub fn has_script(&self, chunk: &ChunkId) -> bool {
        !self.is_installed(chunk) && self.chunks.get(chunk).is_none_or(|def| def.script)
    }

    pub fn wasm_modules(&self, chunk: &ChunkId) -> &[WasmModuleId] {
        self.chunks
            .get(chunk)
            .map(|def| def.wasm.as_slice())
            .unwrap_or_default()
    }

    pub fn script_url(&self, chunk: &ChunkId) -> String {
        format!("{}{chunk}.{}.js", self.public_path, self.script_suffix)
    }

    pub fn wasm_url(&self, module: &str) -> Option<String> {
        self.wasm.get(module).map(|def| {
            format!(
                "{}{}.module.{}",
                self.public_path, def.hash, self.module_extension
            )
        })
    }
}
