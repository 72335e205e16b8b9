//! The chunk loader.
//!
//! A [`Loader`] owns the chunk and binary-module slot tables, the export
//! cache and the host module registry. Loads are started on first request
//! and shared by every caller until they settle; a failed load clears its
//! slot so a later request starts a fresh attempt.

use futures::FutureExt;
use futures::future::{self, BoxFuture, try_join_all};
use http_body_util::BodyExt;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::LoadError;
use crate::exports::ModuleExports;
use crate::fetch::{self, Fetcher};
use crate::imports::ImportTable;
use crate::instantiate::{Capabilities, Instantiator, Source};
use crate::manifest::Manifest;
use crate::modules::{HostModule, ModuleFactory, ModuleRegistry};
use crate::settle::{Join, Pending, Settlement, SlotTable};
use crate::types::{ChunkId, ChunkPayload, HostState, LoadState, ModuleId, WasmModuleId};

/// Ceiling on a single script or binary module load.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SlotKey {
    Chunk(ChunkId),
    Wasm(WasmModuleId),
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKey::Chunk(chunk) => write!(f, "chunk {chunk}"),
            SlotKey::Wasm(module) => write!(f, "wasm module {module}"),
        }
    }
}

struct Registry {
    slots: SlotTable<SlotKey>,
    exports: HashMap<WasmModuleId, ModuleExports>,
}

struct Inner {
    manifest: Manifest,
    fetcher: Arc<dyn Fetcher>,
    instantiator: Instantiator,
    capabilities: Capabilities,
    timeout: Duration,
    imports: HashMap<WasmModuleId, ImportTable>,
    modules: ModuleRegistry,
    registry: Mutex<Registry>,
}

/// Handle to a loader. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Loader {
    inner: Arc<Inner>,
}

pub struct LoaderBuilder {
    manifest: Manifest,
    fetcher: Option<Arc<dyn Fetcher>>,
    timeout: Duration,
    capabilities: Capabilities,
    imports: HashMap<WasmModuleId, ImportTable>,
    factories: HashMap<ModuleId, ModuleFactory>,
    bundled: HashSet<ModuleId>,
    preregistered: Vec<ChunkPayload>,
}

impl LoaderBuilder {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            fetcher: None,
            timeout: DEFAULT_TIMEOUT,
            capabilities: Capabilities::default(),
            imports: HashMap::new(),
            factories: HashMap::new(),
            bundled: HashSet::new(),
            preregistered: Vec::new(),
        }
    }

    /// Fetch artifacts with `fetcher` instead of the one chosen from the
    /// manifest's public path.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Host import table for `module`. Without one, the table is derived
    /// from the module's manifest entry.
    pub fn with_imports(mut self, module: impl Into<WasmModuleId>, table: ImportTable) -> Self {
        self.imports.insert(module.into(), table);
        self
    }

    /// Register a host module that ships with the entry chunk.
    pub fn with_module<F, Fut>(self, id: impl Into<ModuleId>, factory: F) -> Self
    where
        F: Fn(Loader) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HostModule>> + Send + 'static,
    {
        let id = id.into();
        self.register_factory(id, factory, true)
    }

    /// Register a host module that becomes available only once a chunk
    /// payload listing it has been registered.
    pub fn with_deferred_module<F, Fut>(self, id: impl Into<ModuleId>, factory: F) -> Self
    where
        F: Fn(Loader) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HostModule>> + Send + 'static,
    {
        let id = id.into();
        self.register_factory(id, factory, false)
    }

    /// Register a fixed host module that ships with the entry chunk.
    pub fn with_host_module(self, module: HostModule) -> Self {
        let id = module.id().clone();
        self.with_module(id, move |_| {
            let module = module.clone();
            async move { Ok(module) }
        })
    }

    /// Replay a payload that was pushed before the loader existed.
    pub fn with_preregistered(mut self, payload: ChunkPayload) -> Self {
        self.preregistered.push(payload);
        self
    }

    fn register_factory<F, Fut>(mut self, id: ModuleId, factory: F, bundled: bool) -> Self
    where
        F: Fn(Loader) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HostModule>> + Send + 'static,
    {
        if bundled {
            self.bundled.insert(id.clone());
        }
        let factory: ModuleFactory = Arc::new(move |loader| factory(loader).boxed());
        self.factories.insert(id, factory);
        self
    }

    pub fn build(self) -> anyhow::Result<Loader> {
        self.manifest.validate()?;
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| fetch::for_public_path(&self.manifest.public_path));

        let mut imports = self.imports;
        for (module, definition) in &self.manifest.wasm {
            imports
                .entry(module.clone())
                .or_insert_with(|| ImportTable::from_definition(definition));
        }

        let mut slots = SlotTable::new();
        for chunk in &self.manifest.installed {
            slots.mark_loaded(SlotKey::Chunk(chunk.clone()));
        }

        let loader = Loader {
            inner: Arc::new(Inner {
                fetcher,
                instantiator: Instantiator::new()?,
                capabilities: self.capabilities,
                timeout: self.timeout,
                imports,
                modules: ModuleRegistry::new(self.factories, self.bundled),
                registry: Mutex::new(Registry {
                    slots,
                    exports: HashMap::new(),
                }),
                manifest: self.manifest,
            }),
        };
        for payload in &self.preregistered {
            loader.register_chunk(payload);
        }
        Ok(loader)
    }
}

impl Loader {
    pub fn builder(manifest: Manifest) -> LoaderBuilder {
        LoaderBuilder::new(manifest)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.inner.manifest
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every artifact of `chunk` available: its script, if it has one,
    /// and each of its binary modules. Concurrent calls share one load.
    pub async fn ensure(&self, chunk: impl Into<ChunkId>) -> Result<(), LoadError> {
        let chunk = chunk.into();
        let manifest = &self.inner.manifest;

        let mut loads = Vec::new();
        if manifest.has_script(&chunk) {
            loads.push(self.track(SlotKey::Chunk(chunk.clone()), &chunk));
        }
        for module in manifest.wasm_modules(&chunk) {
            loads.push(self.track(SlotKey::Wasm(module.clone()), &chunk));
        }
        try_join_all(loads).await?;
        Ok(())
    }

    /// Register a chunk payload: every listed chunk becomes loaded and every
    /// listed module becomes available.
    pub fn register_chunk(&self, payload: &ChunkPayload) {
        let completed = {
            let mut registry = self.registry();
            self.apply_payload(&mut registry, payload)
        };
        self.finish_registration(completed);
    }

    /// Realize a host module, running its factory at most once.
    pub async fn require(&self, module: &str) -> Result<Arc<HostModule>, LoadError> {
        self.inner.modules.require(module, self.clone()).await
    }

    /// Exports of an instantiated binary module.
    pub fn exports(&self, module: &str) -> Option<ModuleExports> {
        self.registry().exports.get(module).cloned()
    }

    pub fn chunk_state(&self, chunk: impl Into<ChunkId>) -> LoadState {
        self.registry().slots.state(&SlotKey::Chunk(chunk.into()))
    }

    pub fn wasm_state(&self, module: impl Into<WasmModuleId>) -> LoadState {
        self.registry().slots.state(&SlotKey::Wasm(module.into()))
    }

    pub fn is_module_available(&self, module: &str) -> bool {
        self.inner.modules.is_available(module)
    }

    /// Run `f` against the state shared by every instance.
    pub async fn with_host_state<R>(&self, f: impl FnOnce(&mut HostState) -> R) -> R {
        let mut store = self.inner.instantiator.store().lock().await;
        f(store.data_mut())
    }

    fn apply_payload(&self, registry: &mut Registry, payload: &ChunkPayload) -> Vec<(ChunkId, Pending)> {
        self.inner.modules.make_available(&payload.modules);
        payload
            .chunks
            .iter()
            .filter_map(|chunk| {
                registry
                    .slots
                    .mark_loaded(SlotKey::Chunk(chunk.clone()))
                    .map(|pending| (chunk.clone(), pending))
            })
            .collect()
    }

    fn track(&self, key: SlotKey, origin: &ChunkId) -> BoxFuture<'static, Result<(), LoadError>> {
        let join = self.registry().slots.join(key.clone());
        match join {
            Join::Ready => future::ready(Ok(())).boxed(),
            Join::Wait(settlement) => {
                tracing::debug!(%key, "Joining in-flight load");
                wait(key, settlement).boxed()
            }
            Join::Start {
                attempt,
                settlement,
            } => {
                self.start(key.clone(), origin.clone(), attempt);
                wait(key, settlement).boxed()
            }
        }
    }

    fn request_url(&self, key: &SlotKey) -> String {
        match key {
            SlotKey::Chunk(chunk) => self.inner.manifest.script_url(chunk),
            SlotKey::Wasm(module) => self
                .inner
                .manifest
                .wasm_url(module.as_str())
                .unwrap_or_else(|| module.to_string()),
        }
    }

    fn start(&self, key: SlotKey, origin: ChunkId, attempt: u64) {
        let request = self.request_url(&key);
        tracing::info!(%key, %request, attempt, "Loading");

        let loader = self.clone();
        let (load_key, load_origin) = (key.clone(), origin.clone());
        tokio::spawn(async move { loader.run_load(load_key, load_origin, attempt).await });

        // The transfer is not cancelled on timeout; its late result is dropped as stale.
        let loader = self.clone();
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(loader.inner.timeout).await;
            let error = LoadError::Timeout {
                chunk: origin,
                request,
            };
            loader.settle(&timer_key, attempt, Err(error));
        });
        if !self.registry().slots.arm(&key, attempt, timer.abort_handle()) {
            timer.abort();
        }
    }

    async fn run_load(self, key: SlotKey, origin: ChunkId, attempt: u64) {
        let result = match &key {
            SlotKey::Chunk(chunk) => match self.load_script(chunk, attempt).await {
                // Registration settled the slot.
                Ok(()) => return,
                Err(e) => Err(e),
            },
            SlotKey::Wasm(module) => match self.load_wasm(module, &origin, attempt).await {
                Ok(None) => {
                    tracing::debug!(%key, attempt, "Discarding stale module response");
                    return;
                }
                other => other,
            },
        };
        self.settle(&key, attempt, result);
    }

    async fn load_script(&self, chunk: &ChunkId, attempt: u64) -> Result<(), LoadError> {
        let request = self.inner.manifest.script_url(chunk);
        let transport = |reason: String| LoadError::Transport {
            chunk: chunk.clone(),
            request: request.clone(),
            reason,
        };
        let missing = |reason: String| LoadError::MissingArtifact {
            chunk: chunk.clone(),
            request: request.clone(),
            reason,
        };

        let response = self
            .inner
            .fetcher
            .fetch(&request)
            .await
            .map_err(|e| transport(format!("{e:#}")))?;
        if !response.is_success() {
            return Err(missing(format!("status {}", response.status)));
        }
        let body = response
            .body
            .collect()
            .await
            .map_err(|e| transport(format!("{e:#}")))?
            .to_bytes();
        let payload: ChunkPayload = serde_json::from_slice(&body)
            .map_err(|e| missing(format!("invalid chunk payload: {e}")))?;

        let key = SlotKey::Chunk(chunk.clone());
        let (completed, registered) = {
            let mut registry = self.registry();
            if !registry.slots.is_current(&key, attempt) {
                tracing::debug!(%key, attempt, "Discarding stale chunk payload");
                return Ok(());
            }
            let completed = self.apply_payload(&mut registry, &payload);
            (completed, registry.slots.state(&key) == LoadState::Loaded)
        };
        self.finish_registration(completed);
        if registered {
            Ok(())
        } else {
            Err(missing("chunk payload did not register the chunk".to_string()))
        }
    }

    fn finish_registration(&self, completed: Vec<(ChunkId, Pending)>) {
        for (chunk, pending) in completed {
            let waiters = pending.settle(Ok(()));
            tracing::info!(%chunk, waiters, "Chunk loaded");
        }
    }

    /// Fetch, compile and instantiate a binary module. `None` when attempt
    /// `attempt` went stale before the module was instantiated.
    async fn load_wasm(
        &self,
        module: &WasmModuleId,
        origin: &ChunkId,
        attempt: u64,
    ) -> Result<Option<ModuleExports>, LoadError> {
        let request = self.inner.manifest.wasm_url(module.as_str()).ok_or_else(|| {
            LoadError::MissingArtifact {
                chunk: origin.clone(),
                request: module.to_string(),
                reason: "no content hash for module".to_string(),
            }
        })?;

        let response = self.inner.fetcher.fetch(&request).await.map_err(|e| {
            LoadError::Transport {
                chunk: origin.clone(),
                request: request.clone(),
                reason: format!("{e:#}"),
            }
        })?;
        if !response.is_success() {
            return Err(LoadError::MissingArtifact {
                chunk: origin.clone(),
                request: request.clone(),
                reason: format!("status {}", response.status),
            });
        }
        let key = SlotKey::Wasm(module.clone());
        if !self.registry().slots.is_current(&key, attempt) {
            return Ok(None);
        }

        let table = self.inner.imports.get(module).cloned().unwrap_or_default();
        let deferred = table.is_deferred();
        let strategy = self.inner.capabilities.select(deferred);
        // Forwarded imports target host modules made available by the chunk's own script.
        let imports = async {
            if deferred && self.inner.manifest.has_script(origin) {
                self.track(SlotKey::Chunk(origin.clone()), origin).await?;
            }
            Ok::<_, LoadError>(table.resolve(self).await)
        };

        let source = Source {
            chunk: origin,
            module,
            request: &request,
        };
        self.inner
            .instantiator
            .instantiate(source, response.body, strategy, imports, || {
                self.registry().slots.commit(&key, attempt)
            })
            .await
    }

    fn settle(&self, key: &SlotKey, attempt: u64, result: Result<Option<ModuleExports>, LoadError>) {
        let pending = {
            let mut registry = self.registry();
            match &result {
                Ok(exports) => {
                    let pending = registry.slots.complete(key, attempt);
                    if let (Some(_), Some(exports), SlotKey::Wasm(module)) = (&pending, exports, key) {
                        registry
                            .exports
                            .entry(module.clone())
                            .or_insert_with(|| exports.clone());
                    }
                    pending
                }
                Err(_) => registry.slots.fail(key, attempt),
            }
        };

        let Some(pending) = pending else {
            tracing::debug!(%key, attempt, "Dropping stale settlement");
            return;
        };
        match result {
            Ok(_) => {
                let waiters = pending.settle(Ok(()));
                tracing::info!(%key, waiters, "Loaded");
            }
            Err(e) => {
                tracing::warn!(%key, category = ?e.category(), "{e}");
                pending.settle(Err(e));
            }
        }
    }
}

async fn wait(key: SlotKey, settlement: Settlement) -> Result<(), LoadError> {
    settlement
        .await
        .unwrap_or_else(|_| Err(LoadError::Abandoned(key.to_string())))
}
