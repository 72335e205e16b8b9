//! Load failure taxonomy.

use std::fmt;

use crate::types::{ChunkId, ModuleId, WasmModuleId};

/// Category reported for fetch-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The request completed but the artifact was absent or unusable.
    Missing,
    /// The request did not complete.
    Error,
    /// The deadline elapsed first.
    Timeout,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorCategory::Missing => "missing",
            ErrorCategory::Error => "error",
            ErrorCategory::Timeout => "timeout",
        })
    }
}

/// Why a chunk, binary module, or host module could not be loaded.
///
/// Cloneable so that every caller sharing one in-flight load observes the
/// same failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("Loading chunk {chunk} failed.\n(error: {request}): {reason}")]
    Transport {
        chunk: ChunkId,
        request: String,
        reason: String,
    },
    #[error("Loading chunk {chunk} failed.\n(missing: {request}): {reason}")]
    MissingArtifact {
        chunk: ChunkId,
        request: String,
        reason: String,
    },
    #[error("Loading chunk {chunk} failed.\n(timeout: {request})")]
    Timeout { chunk: ChunkId, request: String },
    #[error("Wasm module '{module}' has unresolved imports: {unresolved:?}")]
    Link {
        module: WasmModuleId,
        unresolved: Vec<String>,
    },
    #[error("Wasm module '{module}' failed to instantiate from {request}: {reason}")]
    Instantiation {
        module: WasmModuleId,
        request: String,
        reason: String,
    },
    #[error("Module '{0}' is not available")]
    ModuleNotFound(ModuleId),
    #[error("Module '{module}' failed to initialize: {reason}")]
    ModuleInit { module: ModuleId, reason: String },
    #[error("Load of {0} was abandoned before it settled")]
    Abandoned(String),
}

impl LoadError {
    /// Fetch-level category, if this failure happened while fetching.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            LoadError::Transport { .. } | LoadError::Abandoned(_) => Some(ErrorCategory::Error),
            LoadError::MissingArtifact { .. } => Some(ErrorCategory::Missing),
            LoadError::Timeout { .. } => Some(ErrorCategory::Timeout),
            _ => None,
        }
    }

    /// Resolved source location of the failed request.
    pub fn request(&self) -> Option<&str> {
        match self {
            LoadError::Transport { request, .. }
            | LoadError::MissingArtifact { request, .. }
            | LoadError::Timeout { request, .. }
            | LoadError::Instantiation { request, .. } => Some(request),
            _ => None,
        }
    }

    pub fn is_link_failure(&self) -> bool {
        matches!(self, LoadError::Link { .. })
    }
}
