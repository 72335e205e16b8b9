use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use wasm_bootstrap::{ChunkId, HostModule, Manifest, bootstrap, todomvc};

#[derive(Parser)]
#[command(name = "wasm-bootstrap")]
#[command(about = "Load a chunk's scripts and Wasm modules, then hand control to its entry module")]
struct Cli {
    /// Manifest file (.toml); the built-in TodoMVC manifest is used otherwise
    #[arg(long, short)]
    manifest: Option<PathBuf>,

    /// Prefix prepended to every artifact file name (URL or directory)
    #[arg(long, short)]
    public_path: Option<String>,

    /// Chunk to bootstrap
    #[arg(long, short, default_value = todomvc::ENTRY_CHUNK)]
    chunk: String,

    /// Entry module realized once the chunk is loaded
    #[arg(long, short, default_value = todomvc::ENTRY_MODULE)]
    entry: String,

    /// Wasm export the entry module calls to start the application
    #[arg(long, short)]
    invoke: Option<String>,

    /// Per-artifact load timeout
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,

    /// Print the resolved artifact URLs without fetching anything
    #[arg(long, short)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut manifest = match &cli.manifest {
        Some(path) => Manifest::from_file(path)?,
        None => todomvc::manifest(),
    };
    if let Some(public_path) = cli.public_path {
        manifest = manifest.with_public_path(public_path);
    }

    let chunk = ChunkId::from(cli.chunk.as_str());
    if cli.dry_run {
        println!("--- Artifacts for chunk {chunk} (Dry Run) ---");
        if manifest.has_script(&chunk) {
            println!("script: {}", manifest.script_url(&chunk));
        }
        for module in manifest.wasm_modules(&chunk) {
            let url = manifest
                .wasm_url(module.as_str())
                .unwrap_or_else(|| "<no content hash>".to_string());
            println!("wasm:   {url} ({module})");
        }
        println!("---------------------------------------------");
        return Ok(());
    }

    // Adapters other than the TodoMVC glue are served by tracing stand-ins.
    let mut builder =
        todomvc::loader_builder(manifest.clone(), todomvc::tracing_glue(), cli.invoke);
    for namespace in manifest.wasm.values().flat_map(|def| def.imports.values()) {
        if namespace.adapter.as_str() != todomvc::GLUE_MODULE {
            builder = builder.with_host_module(HostModule::tracing_adapter(
                &namespace.adapter,
                namespace.functions.keys().cloned(),
            ));
        }
    }

    let loader = builder
        .with_timeout(Duration::from_secs(cli.timeout_secs))
        .build()?;
    bootstrap(&loader, chunk, &cli.entry).await?;
    println!("Bootstrapped '{}'", cli.entry);

    Ok(())
}
