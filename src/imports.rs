//! Static host import tables and import-object construction.
//!
//! A table is enumerated once at startup. For every binary module it is
//! resolved into an import object, and every import the module declares
//! must find a binding there before instantiation may proceed.

use std::collections::HashMap;
use std::sync::Arc;
use wasmtime::{Caller, Extern, ExternType, Linker, Module, Store, Val, ValType};

use crate::error::LoadError;
use crate::loader::Loader;
use crate::manifest::WasmDefinition;
use crate::modules::HostFn;
use crate::types::{HostState, ModuleId, WasmModuleId};

/// Where a host import is satisfied from.
#[derive(Clone)]
pub enum ImportTarget {
    /// A host function provided directly.
    Direct(HostFn),
    /// The same-named function exported by a host module.
    Forward(ModuleId),
    /// An export of an already-instantiated binary module.
    Export {
        module: WasmModuleId,
        export: String,
    },
}

impl std::fmt::Debug for ImportTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportTarget::Direct(_) => f.write_str("Direct(..)"),
            ImportTarget::Forward(module) => f.debug_tuple("Forward").field(module).finish(),
            ImportTarget::Export { module, export } => f
                .debug_struct("Export")
                .field("module", module)
                .field("export", export)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostImport {
    pub namespace: String,
    pub name: String,
    /// Declared parameter count; `None` for non-function or pass-through imports
    pub arity: Option<usize>,
    pub target: ImportTarget,
}

/// Fixed table of host imports available to one binary module.
#[derive(Debug, Clone, Default)]
pub struct ImportTable {
    entries: Vec<HostImport>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn direct<F>(
        mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        arity: usize,
        func: F,
    ) -> Self
    where
        F: Fn(&mut Caller<'_, HostState>, &[i32]) -> anyhow::Result<Option<i32>>
            + Send
            + Sync
            + 'static,
    {
        self.entries.push(HostImport {
            namespace: namespace.into(),
            name: name.into(),
            arity: Some(arity),
            target: ImportTarget::Direct(Arc::new(func)),
        });
        self
    }

    pub fn forward(
        mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        arity: usize,
        adapter: impl Into<ModuleId>,
    ) -> Self {
        self.entries.push(HostImport {
            namespace: namespace.into(),
            name: name.into(),
            arity: Some(arity),
            target: ImportTarget::Forward(adapter.into()),
        });
        self
    }

    pub fn export(
        mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        module: impl Into<WasmModuleId>,
        export: impl Into<String>,
    ) -> Self {
        self.entries.push(HostImport {
            namespace: namespace.into(),
            name: name.into(),
            arity: None,
            target: ImportTarget::Export {
                module: module.into(),
                export: export.into(),
            },
        });
        self
    }

    /// Forward every `(name, arity)` of `namespace` to `adapter`.
    pub fn forwarding(
        namespace: &str,
        adapter: impl Into<ModuleId>,
        functions: &[(&str, usize)],
    ) -> Self {
        let adapter = adapter.into();
        functions
            .iter()
            .fold(Self::new(), |table, (name, arity)| {
                table.forward(namespace, *name, *arity, adapter.clone())
            })
    }

    /// Build the table described by a manifest entry.
    pub fn from_definition(definition: &WasmDefinition) -> Self {
        let mut table = Self::new();
        for (namespace, imports) in &definition.imports {
            for (name, arity) in &imports.functions {
                table = table.forward(namespace.as_str(), name.as_str(), *arity, &imports.adapter);
            }
        }
        table
    }

    pub fn entries(&self) -> &[HostImport] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether building the import object has to wait on host modules.
    pub fn is_deferred(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| matches!(entry.target, ImportTarget::Forward(_)))
    }

    /// Resolve every entry against the loader's current caches. Entries that
    /// cannot be resolved are kept with a reason so linking can report them.
    pub(crate) async fn resolve(&self, loader: &Loader) -> ImportObject {
        let mut bindings = HashMap::new();
        for entry in &self.entries {
            let binding = match &entry.target {
                ImportTarget::Direct(func) => Binding::Host {
                    arity: entry.arity,
                    func: Arc::clone(func),
                },
                ImportTarget::Forward(adapter) => match loader.require(adapter.as_str()).await {
                    Ok(module) => match module.function(&entry.name) {
                        Some(func) => Binding::Host {
                            arity: entry.arity,
                            func,
                        },
                        None => Binding::Unresolved(format!("'{adapter}' does not export it")),
                    },
                    Err(e) => Binding::Unresolved(e.to_string()),
                },
                ImportTarget::Export { module, export } => {
                    match loader.exports(module.as_str()).and_then(|e| e.get(export)) {
                        Some(item) => Binding::Extern(item),
                        None => Binding::Unresolved(format!(
                            "'{module}' is not loaded or does not export '{export}'"
                        )),
                    }
                }
            };
            bindings.insert((entry.namespace.clone(), entry.name.clone()), binding);
        }
        ImportObject { bindings }
    }
}

enum Binding {
    Host { arity: Option<usize>, func: HostFn },
    Extern(Extern),
    Unresolved(String),
}

/// Import table resolved for one binary module.
pub(crate) struct ImportObject {
    bindings: HashMap<(String, String), Binding>,
}

impl ImportObject {
    /// Define a binding for every import of `module`, or fail with a
    /// `LoadError::Link` naming every import that has none.
    pub(crate) fn define(
        &self,
        linker: &mut Linker<HostState>,
        store: &Store<HostState>,
        id: &WasmModuleId,
        module: &Module,
    ) -> Result<(), LoadError> {
        let mut unresolved = Vec::new();
        let link_error = |reason: String| LoadError::Link {
            module: id.clone(),
            unresolved: vec![reason],
        };

        for import in module.imports() {
            let key = format!("{}::{}", import.module(), import.name());
            let binding = self
                .bindings
                .get(&(import.module().to_string(), import.name().to_string()));
            match (binding, import.ty()) {
                (None, _) => unresolved.push(key),
                (Some(Binding::Unresolved(reason)), _) => {
                    unresolved.push(format!("{key} ({reason})"))
                }
                (Some(Binding::Host { arity, func }), ExternType::Func(ty)) => {
                    let params = ty.params().len();
                    if arity.is_some_and(|arity| arity != params) {
                        unresolved.push(format!(
                            "{key} (takes {params} params, host table declares {})",
                            arity.unwrap_or_default()
                        ));
                        continue;
                    }
                    let func = Arc::clone(func);
                    let result = ty.results().next();
                    linker
                        .func_new(import.module(), import.name(), ty, move |mut caller, args, results| {
                            call_host(&func, &mut caller, args, results, result.as_ref())
                                .map_err(wasmtime::Error::from_anyhow)
                        })
                        .map_err(|e| link_error(format!("{key}: {e:#}")))?;
                }
                (Some(Binding::Host { .. }), _) => {
                    unresolved.push(format!("{key} (host functions cannot satisfy it)"))
                }
                (Some(Binding::Extern(item)), _) => {
                    linker
                        .define(store, import.module(), import.name(), item.clone())
                        .map_err(|e| link_error(format!("{key}: {e:#}")))?;
                }
            }
        }

        if unresolved.is_empty() {
            Ok(())
        } else {
            Err(LoadError::Link {
                module: id.clone(),
                unresolved,
            })
        }
    }
}

fn call_host(
    func: &HostFn,
    caller: &mut Caller<'_, HostState>,
    args: &[Val],
    results: &mut [Val],
    result: Option<&ValType>,
) -> anyhow::Result<()> {
    let args = args
        .iter()
        .map(small_int)
        .collect::<anyhow::Result<Vec<i32>>>()?;
    let value = func(caller, &args)?.unwrap_or_default();
    if let Some(slot) = results.first_mut() {
        *slot = match result {
            Some(ValType::I64) => Val::I64(value.into()),
            // Rounds to nearest above 2^24, as any i32 to f32 conversion does.
            Some(ValType::F32) => Val::F32((value as f32).to_bits()),
            Some(ValType::F64) => Val::F64(f64::from(value).to_bits()),
            _ => Val::I32(value),
        };
    }
    Ok(())
}

fn small_int(val: &Val) -> anyhow::Result<i32> {
    match val {
        Val::I32(v) => Ok(*v),
        Val::I64(v) => i32::try_from(*v)
            .map_err(|_| anyhow::anyhow!("Host import argument {v} does not fit in i32")),
        other => Err(anyhow::anyhow!(
            "Host imports take integer arguments, got {other:?}"
        )),
    }
}
