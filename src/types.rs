//! Core type definitions shared across the crate.

use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&$name> for $name {
            fn from(id: &$name) -> Self {
                id.clone()
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Build-time key of a deferred-loadable chunk
    ChunkId
);

string_id!(
    /// Key of a host module in the module registry, e.g. `./index.js`
    ModuleId
);

string_id!(
    /// Key of a binary Wasm module, e.g. `../pkg/example_todomvc_bg.wasm`
    WasmModuleId
);

impl From<u32> for ChunkId {
    fn from(id: u32) -> Self {
        Self(id.to_string())
    }
}

/// Observable loading state of a chunk or binary module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    NotRequested,
    Loading,
    Loaded,
}

/// JSONP-style chunk registration: the chunks it completes and the
/// modules it makes available.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub chunks: Vec<ChunkId>,
    #[serde(default)]
    pub modules: Vec<ModuleId>,
}

impl ChunkPayload {
    pub fn new<C, M>(chunks: impl IntoIterator<Item = C>, modules: impl IntoIterator<Item = M>) -> Self
    where
        C: Into<ChunkId>,
        M: Into<ModuleId>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            modules: modules.into_iter().map(Into::into).collect(),
        }
    }
}

/// State shared by every Wasm instance in a loader's store.
#[derive(Default)]
pub struct HostState {
    pub(crate) extensions: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl HostState {
    /// Get a reference to an extension by type.
    pub fn get_extension<T: 'static + Send>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    /// Get a mutable reference to an extension by type.
    pub fn get_extension_mut<T: 'static + Send>(&mut self) -> Option<&mut T> {
        self.extensions
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_mut())
    }

    /// Set an extension value by type.
    pub fn set_extension<T: 'static + Send>(&mut self, value: T) {
        self.extensions.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Update an extension in place, starting from its default if absent.
    pub fn update_extension<T, R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: 'static + Send + Default,
    {
        let mut value: Box<T> = self
            .extensions
            .remove(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast().ok())
            .unwrap_or_default();
        let result = f(&mut value);
        self.extensions.insert(TypeId::of::<T>(), value);
        result
    }
}
