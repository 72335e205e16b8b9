//! Host modules and the module cache.
//!
//! A host module is a named set of host functions produced by a factory the
//! embedder registers at build time. A factory runs at most once; its
//! result is cached for the lifetime of the loader.

use anyhow::Result;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use wasmtime::Caller;

use crate::error::LoadError;
use crate::loader::Loader;
use crate::types::{HostState, ModuleId};

/// A host function callable from Wasm. Arguments are the integer
/// parameters of the call; `None` means "no value".
pub type HostFn =
    Arc<dyn Fn(&mut Caller<'_, HostState>, &[i32]) -> Result<Option<i32>> + Send + Sync>;

/// Produces a host module. Receives the loader so entry modules can reach
/// already-instantiated Wasm exports.
pub type ModuleFactory = Arc<dyn Fn(Loader) -> BoxFuture<'static, Result<HostModule>> + Send + Sync>;

/// Realized exports of a host module.
#[derive(Clone)]
pub struct HostModule {
    id: ModuleId,
    functions: BTreeMap<String, HostFn>,
}

impl HostModule {
    pub fn new(id: impl Into<ModuleId>) -> Self {
        Self {
            id: id.into(),
            functions: BTreeMap::new(),
        }
    }

    pub fn with_function<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut Caller<'_, HostState>, &[i32]) -> Result<Option<i32>> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(func));
        self
    }

    /// An adapter whose functions only trace their calls and return 0.
    pub fn tracing_adapter<I, S>(id: impl Into<ModuleId>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        let mut module = Self::new(id.clone());
        for name in names {
            let name = name.into();
            let (adapter, function) = (id.clone(), name.clone());
            module = module.with_function(name, move |caller, args| {
                caller
                    .data_mut()
                    .update_extension(|count: &mut HostCallCount| count.0 += 1);
                tracing::info!(%adapter, %function, ?args, "host call");
                Ok(Some(0))
            });
        }
        module
    }

    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    pub fn function(&self, name: &str) -> Option<HostFn> {
        self.functions.get(name).cloned()
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for HostModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostModule")
            .field("id", &self.id)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Number of host calls served by tracing adapters, kept in `HostState`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostCallCount(pub u64);

pub(crate) struct ModuleRegistry {
    factories: HashMap<ModuleId, ModuleFactory>,
    available: Mutex<HashSet<ModuleId>>,
    installed: Mutex<HashMap<ModuleId, Arc<OnceCell<Arc<HostModule>>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ModuleRegistry {
    pub(crate) fn new(factories: HashMap<ModuleId, ModuleFactory>, bundled: HashSet<ModuleId>) -> Self {
        Self {
            factories,
            available: Mutex::new(bundled),
            installed: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn make_available<'a>(&self, modules: impl IntoIterator<Item = &'a ModuleId>) {
        let mut available = lock(&self.available);
        for module in modules {
            if !self.factories.contains_key(module) {
                tracing::warn!(%module, "Chunk registered a module with no factory");
            }
            available.insert(module.clone());
        }
    }

    pub(crate) fn is_available(&self, module: &str) -> bool {
        lock(&self.available).contains(module)
    }

    pub(crate) fn installed(&self, module: &str) -> Option<Arc<HostModule>> {
        lock(&self.installed)
            .get(module)
            .and_then(|cell| cell.get().cloned())
    }

    pub(crate) async fn require(&self, module: &str, loader: Loader) -> Result<Arc<HostModule>, LoadError> {
        if let Some(installed) = self.installed(module) {
            return Ok(installed);
        }
        let not_found = || LoadError::ModuleNotFound(ModuleId::from(module));
        if !self.is_available(module) {
            return Err(not_found());
        }
        let factory = self.factories.get(module).cloned().ok_or_else(not_found)?;
        let cell = Arc::clone(lock(&self.installed).entry(ModuleId::from(module)).or_default());

        cell.get_or_try_init(|| async {
            tracing::debug!(%module, "Initializing host module");
            factory(loader)
                .await
                .map(Arc::new)
                .map_err(|e| LoadError::ModuleInit {
                    module: ModuleId::from(module),
                    reason: format!("{e:#}"),
                })
        })
        .await
        .cloned()
    }
}
