//! Compilation and instantiation of binary modules.
//!
//! Three tiers, chosen per module by [`Capabilities::select`]:
//!
//! - streaming compile: the body is validated frame by frame while the
//!   import object is built concurrently
//! - streaming instantiate: the import object is built first, then the body
//!   is validated frame by frame
//! - buffered: the whole body is read before compiling
//!
//! All tiers produce the same [`ModuleExports`] for the same artifact.

use http_body_util::BodyExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use wasmparser::{Chunk, Parser, ValidPayload, Validator};
use wasmtime::{Config, Engine, Linker, Module, Store};

use crate::error::LoadError;
use crate::exports::ModuleExports;
use crate::fetch::ArtifactBody;
use crate::imports::ImportObject;
use crate::types::{ChunkId, HostState, WasmModuleId};

/// What the environment offers for compiling modules as they arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub compile_streaming: bool,
    pub instantiate_streaming: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            compile_streaming: true,
            instantiate_streaming: true,
        }
    }
}

impl Capabilities {
    /// Only buffered instantiation.
    pub fn buffered() -> Self {
        Self {
            compile_streaming: false,
            instantiate_streaming: false,
        }
    }

    /// Pick the instantiation tier for a module. Streaming compile only pays
    /// off when building the import object has to wait on something.
    pub fn select(&self, deferred_imports: bool) -> Strategy {
        if deferred_imports && self.compile_streaming {
            Strategy::StreamingCompile
        } else if self.instantiate_streaming {
            Strategy::StreamingInstantiate
        } else {
            Strategy::Buffered
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    StreamingCompile,
    StreamingInstantiate,
    Buffered,
}

/// Where the artifact being instantiated came from, for error reporting.
pub(crate) struct Source<'a> {
    pub(crate) chunk: &'a ChunkId,
    pub(crate) module: &'a WasmModuleId,
    pub(crate) request: &'a str,
}

impl Source<'_> {
    fn transport(&self, reason: impl std::fmt::Display) -> LoadError {
        LoadError::Transport {
            chunk: self.chunk.clone(),
            request: self.request.to_string(),
            reason: reason.to_string(),
        }
    }

    fn invalid(&self, reason: impl std::fmt::Display) -> LoadError {
        LoadError::Instantiation {
            module: self.module.clone(),
            request: self.request.to_string(),
            reason: reason.to_string(),
        }
    }

    fn empty(&self) -> LoadError {
        LoadError::MissingArtifact {
            chunk: self.chunk.clone(),
            request: self.request.to_string(),
            reason: "empty response body".to_string(),
        }
    }
}

/// Compiles modules with one engine and instantiates them all into one store.
#[derive(Clone)]
pub(crate) struct Instantiator {
    engine: Engine,
    store: Arc<Mutex<Store<HostState>>>,
}

impl Instantiator {
    pub(crate) fn new() -> anyhow::Result<Self> {
        let mut config = Config::new();
        config.parallel_compilation(true);
        config.memory_init_cow(true);
        let engine = Engine::new(&config)?;
        let store = Store::new(&engine, HostState::default());
        Ok(Self {
            engine,
            store: Arc::new(Mutex::new(store)),
        })
    }

    pub(crate) fn store(&self) -> &Arc<Mutex<Store<HostState>>> {
        &self.store
    }

    /// Compile and link the module, then instantiate it once `commit`
    /// agrees. Returns `None`, with nothing instantiated, when `commit`
    /// refuses because the load was superseded in the meantime.
    pub(crate) async fn instantiate<F, C>(
        &self,
        source: Source<'_>,
        body: ArtifactBody,
        strategy: Strategy,
        imports: F,
        commit: C,
    ) -> Result<Option<ModuleExports>, LoadError>
    where
        F: Future<Output = Result<ImportObject, LoadError>>,
        C: FnOnce() -> bool,
    {
        tracing::debug!(module = %source.module, ?strategy, "Instantiating");
        let (module, imports) = match strategy {
            Strategy::StreamingCompile => {
                tokio::try_join!(self.compile_streaming(&source, body), imports)?
            }
            Strategy::StreamingInstantiate => {
                let imports = imports.await?;
                (self.compile_streaming(&source, body).await?, imports)
            }
            Strategy::Buffered => {
                let bytes = body
                    .collect()
                    .await
                    .map_err(|e| source.transport(format!("{e:#}")))?
                    .to_bytes();
                if bytes.is_empty() {
                    return Err(source.empty());
                }
                let imports = imports.await?;
                let module = Module::from_binary(&self.engine, &bytes)
                    .map_err(|e| source.invalid(format!("{e:#}")))?;
                (module, imports)
            }
        };

        let mut store = self.store.lock().await;
        let mut linker = Linker::new(&self.engine);
        imports.define(&mut linker, &store, source.module, &module)?;
        // The start function runs inside `instantiate_async`, so a stale load stops here.
        if !commit() {
            return Ok(None);
        }
        let instance = linker
            .instantiate_async(&mut *store, &module)
            .await
            .map_err(|e| source.invalid(format!("{e:#}")))?;

        let mut externs = BTreeMap::new();
        for export in module.exports() {
            if let Some(item) = instance.get_export(&mut *store, export.name()) {
                externs.insert(export.name().to_string(), item);
            }
        }
        Ok(Some(ModuleExports::new(
            source.module.clone(),
            externs,
            Arc::clone(&self.store),
        )))
    }

    /// Validate the body as its frames arrive, then compile it.
    async fn compile_streaming(
        &self,
        source: &Source<'_>,
        mut body: ArtifactBody,
    ) -> Result<Module, LoadError> {
        let mut parser = Parser::new(0);
        let mut validator = Validator::new();
        let mut buf: Vec<u8> = Vec::new();
        let mut offset = 0;
        let mut eof = false;

        loop {
            if eof && buf.is_empty() {
                return Err(source.empty());
            }
            let (payload, consumed) = match parser
                .parse(&buf[offset..], eof)
                .map_err(|e| source.invalid(e))?
            {
                Chunk::NeedMoreData(_) => {
                    if eof {
                        return Err(source.invalid("truncated module"));
                    }
                    match body.frame().await {
                        Some(Ok(frame)) => {
                            if let Ok(data) = frame.into_data() {
                                buf.extend_from_slice(&data);
                            }
                        }
                        Some(Err(e)) => return Err(source.transport(format!("{e:#}"))),
                        None => eof = true,
                    }
                    continue;
                }
                Chunk::Parsed { consumed, payload } => (payload, consumed),
            };

            match validator.payload(&payload).map_err(|e| source.invalid(e))? {
                ValidPayload::Func(func, func_body) => {
                    let mut func = func.into_validator(Default::default());
                    func.validate(&func_body).map_err(|e| source.invalid(e))?;
                }
                ValidPayload::End(_) => break,
                ValidPayload::Parser(_) => {
                    return Err(source.invalid("nested modules are not supported"));
                }
                ValidPayload::Ok => {}
            }
            offset += consumed;
        }

        tracing::trace!(module = %source.module, bytes = buf.len(), "Validated streamed module");
        Module::from_binary(&self.engine, &buf).map_err(|e| source.invalid(format!("{e:#}")))
    }
}
