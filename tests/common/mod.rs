#![allow(dead_code)]

use anyhow::Result;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use wasm_bootstrap::{
    ArtifactResponse, ChunkDefinition, ChunkPayload, Fetcher, HostModule, ImportNamespace, Loader,
    LoaderBuilder, LoadError, Manifest, WasmDefinition, todomvc,
};

pub const PUBLIC_PATH: &str = "http://test/";
pub const GLUE: &str = "./glue.js";
pub const ADDER: &str = "adder";
pub const ADDER_HASH: &str = "abc123";
pub const SCRIPT_URL: &str = "http://test/1.bootstrap.js";
pub const ADDER_URL: &str = "http://test/abc123.module.wasm";

#[derive(Clone)]
enum Route {
    Respond { status: u16, frames: Vec<Bytes> },
    Never,
    Gated { gate: Arc<Notify>, body: Bytes },
    TransportError(String),
}

/// In-memory fetcher. Unrouted URLs complete with status 404.
#[derive(Clone, Default)]
pub struct MockFetcher {
    routes: Arc<Mutex<HashMap<String, Route>>>,
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn route(&self, url: &str, route: Route) {
        self.routes.lock().unwrap().insert(url.to_string(), route);
    }

    pub fn serve(&self, url: &str, body: impl Into<Bytes>) {
        self.route(
            url,
            Route::Respond {
                status: 200,
                frames: vec![body.into()],
            },
        );
    }

    /// Serve `body` split into frames of `frame_size` bytes.
    pub fn serve_chunked(&self, url: &str, body: &[u8], frame_size: usize) {
        let frames = body
            .chunks(frame_size)
            .map(Bytes::copy_from_slice)
            .collect();
        self.route(url, Route::Respond { status: 200, frames });
    }

    pub fn serve_status(&self, url: &str, status: u16) {
        self.route(
            url,
            Route::Respond {
                status,
                frames: Vec::new(),
            },
        );
    }

    /// Requests to `url` never complete.
    pub fn hang(&self, url: &str) {
        self.route(url, Route::Never);
    }

    /// Requests to `url` complete with `body` once the returned gate is notified.
    pub fn gate(&self, url: &str, body: impl Into<Bytes>) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.route(
            url,
            Route::Gated {
                gate: gate.clone(),
                body: body.into(),
            },
        );
        gate
    }

    pub fn fail(&self, url: &str, reason: &str) {
        self.route(url, Route::TransportError(reason.to_string()));
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.counts.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

impl Fetcher for MockFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ArtifactResponse>> {
        Box::pin(async move {
            *self
                .counts
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default() += 1;
            let route = self.routes.lock().unwrap().get(url).cloned();
            match route {
                None => Ok(ArtifactResponse::from_bytes(url, 404, Bytes::new())),
                Some(Route::Respond { status, frames }) => {
                    let frames = frames.into_iter().map(|b| Ok(Frame::data(b)));
                    let body = StreamBody::new(futures::stream::iter(frames)).boxed_unsync();
                    Ok(ArtifactResponse::new(url, status, body))
                }
                Some(Route::Never) => std::future::pending().await,
                Some(Route::Gated { gate, body }) => {
                    gate.notified().await;
                    Ok(ArtifactResponse::from_bytes(url, 200, body))
                }
                Some(Route::TransportError(reason)) => Err(anyhow::anyhow!(reason)),
            }
        })
    }
}

pub fn payload_json(chunks: &[&str], modules: &[&str]) -> Vec<u8> {
    let payload = ChunkPayload::new(chunks.iter().copied(), modules.iter().copied());
    serde_json::to_vec(&payload).unwrap()
}

/// Adapter whose `double` doubles its argument.
pub fn glue() -> HostModule {
    HostModule::new(GLUE).with_function("double", |_caller, args| Ok(Some(args[0] * 2)))
}

/// `compute(x) = double(x) + 1`, with `double` imported from `env`.
pub fn adder_wasm() -> Vec<u8> {
    wat::parse_str(
        r#"
        (module
            (import "env" "double" (func $double (param i32) (result i32)))
            (memory (export "memory") 1)
            (func (export "compute") (param i32) (result i32)
                (i32.add (call $double (local.get 0)) (i32.const 1)))
            (func (export "add") (param i32 i32) (result i32)
                (i32.add (local.get 0) (local.get 1)))
        )
        "#,
    )
    .unwrap()
}

/// Chunk `1` ships a script registering `./glue.js` and the `adder` module,
/// whose `env` imports forward into `./glue.js`.
pub fn manifest() -> Manifest {
    let imports = BTreeMap::from([(
        "env".to_string(),
        ImportNamespace {
            adapter: GLUE.into(),
            functions: BTreeMap::from([("double".to_string(), 1)]),
        },
    )]);
    Manifest::default()
        .with_public_path(PUBLIC_PATH)
        .with_chunk(
            "1",
            ChunkDefinition {
                script: true,
                wasm: vec![ADDER.into()],
            },
        )
        .with_wasm(
            ADDER,
            WasmDefinition {
                hash: ADDER_HASH.to_string(),
                imports,
            },
        )
}

/// Serve a well-formed chunk `1`.
pub fn serve_chunk_one(fetcher: &MockFetcher) {
    fetcher.serve(SCRIPT_URL, payload_json(&["1"], &[GLUE]));
    fetcher.serve(ADDER_URL, adder_wasm());
}

pub fn builder(fetcher: &MockFetcher, manifest: Manifest) -> LoaderBuilder {
    Loader::builder(manifest)
        .with_fetcher(Arc::new(fetcher.clone()))
        .with_deferred_module(GLUE, |_| async { Ok(glue()) })
}

pub fn loader(fetcher: &MockFetcher) -> Loader {
    builder(fetcher, manifest()).build().unwrap()
}

/// A module importing every TodoMVC host function. `run` makes two host calls.
pub fn todomvc_wasm() -> Vec<u8> {
    let imports: String = todomvc::HOST_IMPORTS
        .iter()
        .map(|(name, arity)| {
            let params = if *arity == 0 {
                String::new()
            } else {
                format!("(param{})", " i32".repeat(*arity))
            };
            format!(
                "(import \"{}\" \"{name}\" (func ${name} {params} (result i32)))\n",
                todomvc::IMPORT_NAMESPACE
            )
        })
        .collect();
    let wat = format!(
        r#"
        (module
            {imports}
            (memory (export "memory") 1)
            (func (export "run") (result i32)
                (drop (call $__wbindgen_string_new (i32.const 0) (i32.const 5)))
                (call $__wbg_log_3415aec3cd45961d (i32.const 0) (i32.const 5)))
            (func (export "greet") (param i32) (result i32)
                (i32.add (local.get 0) (i32.const 1)))
        )
        "#
    );
    wat::parse_str(wat).unwrap()
}

pub fn assert_missing(error: &LoadError, request: &str) {
    assert!(
        matches!(error, LoadError::MissingArtifact { .. }),
        "expected a missing artifact, got {error:?}"
    );
    assert_eq!(error.request(), Some(request));
}
