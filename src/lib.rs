//! Wasm Bootstrap
//!
//! Loads deferred chunks and their Wasm modules, links each module against a
//! fixed host import table, caches the realized exports and hands control
//! to an entry module.

pub use bootstrap::bootstrap;
pub use error::{ErrorCategory, LoadError};
pub use exports::ModuleExports;
pub use fetch::{ArtifactBody, ArtifactResponse, FileFetcher, Fetcher, HttpFetcher};
pub use imports::{HostImport, ImportTable, ImportTarget};
pub use instantiate::{Capabilities, Strategy};
pub use loader::{DEFAULT_TIMEOUT, Loader, LoaderBuilder};
pub use manifest::{ChunkDefinition, ImportNamespace, Manifest, WasmDefinition};
pub use modules::{HostCallCount, HostFn, HostModule};
pub use types::{ChunkId, ChunkPayload, HostState, LoadState, ModuleId, WasmModuleId};

pub mod bootstrap;
pub mod error;
pub mod exports;
pub mod fetch;
pub mod imports;
pub mod instantiate;
pub mod loader;
pub mod manifest;
pub mod modules;
mod settle;
pub mod todomvc;
pub mod types;
