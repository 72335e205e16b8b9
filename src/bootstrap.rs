use std::sync::Arc;

use crate::error::LoadError;
use crate::loader::Loader;
use crate::modules::HostModule;
use crate::types::ChunkId;

/// Hand control to the application: make `chunk` available, then realize
/// the entry module. Failures are logged here and returned to the caller.
pub async fn bootstrap(
    loader: &Loader,
    chunk: impl Into<ChunkId>,
    entry: &str,
) -> Result<Arc<HostModule>, LoadError> {
    let chunk = chunk.into();
    tracing::info!(%chunk, entry, "Bootstrapping");

    let result = match loader.ensure(chunk).await {
        Ok(()) => loader.require(entry).await,
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        tracing::error!(
            category = ?e.category(),
            request = e.request().unwrap_or_default(),
            "Error importing `{entry}`: {e}"
        );
    }
    result
}
