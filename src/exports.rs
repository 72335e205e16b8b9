use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use wasmtime::{Extern, Store, Val};

use crate::types::{HostState, WasmModuleId};

/// Exports of an instantiated binary module, by name.
#[derive(Clone)]
pub struct ModuleExports {
    module: WasmModuleId,
    externs: BTreeMap<String, Extern>,
    store: Arc<Mutex<Store<HostState>>>,
}

impl ModuleExports {
    pub(crate) fn new(
        module: WasmModuleId,
        externs: BTreeMap<String, Extern>,
        store: Arc<Mutex<Store<HostState>>>,
    ) -> Self {
        Self {
            module,
            externs,
            store,
        }
    }

    pub fn module(&self) -> &WasmModuleId {
        &self.module
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.externs.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.externs.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Extern> {
        self.externs.get(name).cloned()
    }

    /// Call an exported function.
    pub async fn call(&self, name: &str, args: &[Val]) -> Result<Vec<Val>> {
        let func = self
            .externs
            .get(name)
            .cloned()
            .and_then(Extern::into_func)
            .ok_or_else(|| anyhow::anyhow!("'{}' has no exported function '{name}'", self.module))?;

        let mut store = self.store.lock().await;
        let results = func.ty(&*store).results().len();
        let mut results = vec![Val::I32(0); results];
        func.call_async(&mut *store, args, &mut results).await?;
        Ok(results)
    }

    /// Call an exported function taking and returning integers.
    pub async fn call_i32(&self, name: &str, args: &[i32]) -> Result<Option<i32>> {
        let args: Vec<Val> = args.iter().copied().map(Val::I32).collect();
        let results = self.call(name, &args).await?;
        match results.first() {
            None => Ok(None),
            Some(Val::I32(v)) => Ok(Some(*v)),
            Some(Val::I64(v)) => Ok(Some(i32::try_from(*v)?)),
            Some(other) => Err(anyhow::anyhow!(
                "'{name}' returned a non-integer value {other:?}"
            )),
        }
    }
}

impl std::fmt::Debug for ModuleExports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleExports")
            .field("module", &self.module)
            .field("exports", &self.externs.keys().collect::<Vec<_>>())
            .finish()
    }
}
