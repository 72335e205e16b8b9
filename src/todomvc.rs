//! The TodoMVC bundle: its manifest, its fixed host import table and the
//! host modules its bootstrap chunk provides.
//!
//! Chunk `0` carries the entry module, the glue module and the application's
//! binary module. Every import of the binary module forwards into the glue
//! module's export of the same name.

use std::collections::BTreeMap;

use crate::imports::ImportTable;
use crate::loader::{Loader, LoaderBuilder};
use crate::manifest::{ChunkDefinition, ImportNamespace, Manifest, WasmDefinition};
use crate::modules::HostModule;
use crate::types::ChunkPayload;

pub const ENTRY_CHUNK: &str = "0";
pub const ENTRY_MODULE: &str = "./index.js";
pub const GLUE_MODULE: &str = "../pkg/example_todomvc.js";
pub const WASM_MODULE: &str = "../pkg/example_todomvc_bg.wasm";
pub const IMPORT_NAMESPACE: &str = "./example_todomvc";
pub const CONTENT_HASH: &str = "9aa00d1bf7899e14f27c";

/// Host functions the binary module imports from [`IMPORT_NAMESPACE`], with
/// their parameter counts.
pub const HOST_IMPORTS: &[(&str, usize)] = &[
    ("__wbindgen_object_drop_ref", 1),
    ("__wbindgen_string_new", 2),
    ("__wbindgen_cb_drop", 1),
    ("__wbg_error_cc95a3d302735ca3", 2),
    ("__wbg_log_3415aec3cd45961d", 2),
    ("__widl_instanceof_Window", 1),
    ("__widl_f_remove_property_CSSStyleDeclaration", 5),
    ("__widl_f_set_property_CSSStyleDeclaration", 6),
    ("__widl_f_create_element_Document", 4),
    ("__widl_f_create_text_node_Document", 3),
    ("__widl_f_get_element_by_id_Document", 3),
    ("__widl_f_prevent_default_Event", 1),
    ("__widl_f_stop_propagation_Event", 1),
    ("__widl_f_target_Event", 1),
    ("__widl_f_add_event_listener_with_callback_EventTarget", 5),
    ("__widl_f_remove_event_listener_with_callback_EventTarget", 5),
    ("__widl_instanceof_HTMLElement", 1),
    ("__widl_f_style_HTMLElement", 1),
    ("__widl_instanceof_HTMLInputElement", 1),
    ("__widl_f_value_HTMLInputElement", 2),
    ("__widl_instanceof_KeyboardEvent", 1),
    ("__widl_f_key_code_KeyboardEvent", 1),
    ("__widl_f_append_child_Node", 3),
    ("__widl_f_remove_child_Node", 3),
    ("__widl_f_replace_child_Node", 4),
    ("__widl_f_node_name_Node", 2),
    ("__widl_f_parent_node_Node", 1),
    ("__widl_f_child_nodes_Node", 1),
    ("__widl_f_item_NodeList", 2),
    ("__widl_f_document_Window", 1),
    ("__wbg_newnoargs_b5dbe629f3c72f37", 2),
    ("__wbg_call_80c8cb20bdc473db", 3),
    ("__wbg_deleteProperty_9632d7a32cb6f6b5", 3),
    ("__wbg_set_560a0f4bd944cd79", 4),
    ("__wbindgen_number_get", 2),
    ("__wbindgen_string_get", 2),
    ("__wbindgen_boolean_get", 1),
    ("__wbindgen_object_clone_ref", 1),
    ("__wbindgen_is_null", 1),
    ("__wbindgen_is_undefined", 1),
    ("__wbindgen_is_symbol", 1),
    ("__wbindgen_throw", 2),
    ("__wbindgen_closure_wrapper161", 5),
];

pub fn manifest() -> Manifest {
    let functions = HOST_IMPORTS
        .iter()
        .map(|(name, arity)| (name.to_string(), *arity))
        .collect();
    let imports = BTreeMap::from([(
        IMPORT_NAMESPACE.to_string(),
        ImportNamespace {
            adapter: GLUE_MODULE.into(),
            functions,
        },
    )]);

    Manifest::default()
        .with_chunk(
            ENTRY_CHUNK,
            ChunkDefinition {
                script: true,
                wasm: vec![WASM_MODULE.into()],
            },
        )
        .with_wasm(
            WASM_MODULE,
            WasmDefinition {
                hash: CONTENT_HASH.to_string(),
                imports,
            },
        )
}

pub fn import_table() -> ImportTable {
    ImportTable::forwarding(IMPORT_NAMESPACE, GLUE_MODULE, HOST_IMPORTS)
}

/// What `0.bootstrap.js` registers.
pub fn chunk_payload() -> ChunkPayload {
    ChunkPayload::new([ENTRY_CHUNK], [ENTRY_MODULE, GLUE_MODULE])
}

/// A glue module whose functions only trace the calls they receive.
pub fn tracing_glue() -> HostModule {
    HostModule::tracing_adapter(GLUE_MODULE, HOST_IMPORTS.iter().map(|(name, _)| *name))
}

/// The entry module. Realizing it hands control to the application by
/// calling `start` on the binary module's exports, if given.
pub async fn entry_module(loader: Loader, start: Option<String>) -> anyhow::Result<HostModule> {
    let exports = loader
        .exports(WASM_MODULE)
        .ok_or_else(|| anyhow::anyhow!("'{WASM_MODULE}' is not instantiated"))?;
    tracing::info!(exports = ?exports.names().collect::<Vec<_>>(), "Entry module ready");

    if let Some(start) = start {
        let result = exports.call_i32(&start, &[]).await?;
        tracing::info!(export = %start, ?result, "Application started");
    }
    Ok(HostModule::new(ENTRY_MODULE))
}

/// Wire the bundle's host modules into a loader: both become available once
/// chunk `0` has registered.
pub fn loader_builder(
    manifest: Manifest,
    glue: HostModule,
    start: Option<String>,
) -> LoaderBuilder {
    Loader::builder(manifest)
        .with_imports(WASM_MODULE, import_table())
        .with_deferred_module(GLUE_MODULE, move |_| {
            let glue = glue.clone();
            async move { Ok(glue) }
        })
        .with_deferred_module(ENTRY_MODULE, move |loader| {
            entry_module(loader, start.clone())
        })
}
