//! Compiled script cache with hot reload.
//!
//! Definitions are keyed by source path, so attaching the same file to many
//! entities compiles it once and shares the chunks through `Rc`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::bytecode::compile::compile;
use crate::bytecode::compile_error::CompileError;
use crate::runtime::script::{RuntimeContext, ScriptDefinition};

/// Extension of baked (precompiled) scripts.
pub const BAKED_EXTENSION: &str = "zbc";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot read '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("bad baked script '{path}': {source}")]
    Decode {
        path: String,
        source: postcard::Error,
    },
}

/// Where a tracked definition comes from on reload.
#[derive(Debug, Clone)]
enum Origin {
    File,
    Source(String),
    Baked(Vec<u8>),
}

#[derive(Debug, Default)]
pub struct ScriptRegistry {
    definitions: HashMap<String, Rc<ScriptDefinition>>,
    tracked: BTreeMap<String, Origin>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached definition for `path`, compiling the file on a
    /// miss. Files ending in `.zbc` are decoded as baked scripts.
    ///
    /// A path that fails stays tracked, so a later [`reload`] picks it up
    /// once the file is fixed.
    ///
    /// [`reload`]: ScriptRegistry::reload
    pub fn load(&mut self, path: &str) -> Result<Rc<ScriptDefinition>, RegistryError> {
        if let Some(def) = self.definitions.get(path) {
            debug!(path, "script cache hit");
            return Ok(Rc::clone(def));
        }

        debug!(path, "script cache miss");
        self.tracked.insert(path.to_string(), Origin::File);
        let def = Rc::new(build(path, &Origin::File).inspect_err(|e| warn!("{}", e))?);
        self.definitions.insert(path.to_string(), Rc::clone(&def));
        Ok(def)
    }

    /// Compiles `source` as if it were the file at `path` and caches it.
    pub fn insert_source(
        &mut self,
        path: &str,
        source: &str,
    ) -> Result<Rc<ScriptDefinition>, RegistryError> {
        self.insert(path, Origin::Source(source.to_string()))
    }

    /// Registers a baked definition under `path` without compiling.
    pub fn insert_baked(
        &mut self,
        path: &str,
        bytes: &[u8],
    ) -> Result<Rc<ScriptDefinition>, RegistryError> {
        self.insert(path, Origin::Baked(bytes.to_vec()))
    }

    fn insert(
        &mut self,
        path: &str,
        origin: Origin,
    ) -> Result<Rc<ScriptDefinition>, RegistryError> {
        self.definitions.remove(path);
        let result = build(path, &origin);
        self.tracked.insert(path.to_string(), origin);

        let def = Rc::new(result.inspect_err(|e| warn!("{}", e))?);
        self.definitions.insert(path.to_string(), Rc::clone(&def));
        Ok(def)
    }

    pub fn get(&self, path: &str) -> Option<Rc<ScriptDefinition>> {
        self.definitions.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Drops every definition and forgets every tracked path.
    ///
    /// Contexts keep their own `Rc` and stay runnable.
    pub fn clear(&mut self) {
        debug!(count = self.tracked.len(), "clearing script registry");
        self.definitions.clear();
        self.tracked.clear();
    }

    /// Discards the cache and rebuilds every tracked path.
    ///
    /// Paths that fail keep no entry; their errors are returned in path
    /// order. Existing contexts must be moved over with [`rebind`].
    ///
    /// [`rebind`]: ScriptRegistry::rebind
    pub fn reload(&mut self) -> Vec<RegistryError> {
        debug!(count = self.tracked.len(), "reloading scripts");
        self.definitions.clear();

        let mut errors = Vec::new();
        for (path, origin) in &self.tracked {
            match build(path, origin) {
                Ok(def) => {
                    self.definitions.insert(path.clone(), Rc::new(def));
                }
                Err(e) => {
                    warn!("reload failed: {}", e);
                    errors.push(e);
                }
            }
        }
        errors
    }

    /// Points `ctx` at the current definition for its script's path.
    ///
    /// Returns false when the registry has no definition for that path, in
    /// which case the context keeps running its old definition.
    pub fn rebind(&self, ctx: &mut RuntimeContext) -> bool {
        let path = ctx.definition().path.clone();
        let Some(def) = self.definitions.get(&path) else {
            return false;
        };
        if Rc::ptr_eq(def, ctx.definition()) {
            return true;
        }

        let old_state = ctx.state().to_string();
        if !ctx.rebind(Rc::clone(def)) {
            warn!(
                path = %path,
                old = %old_state,
                new = ctx.state(),
                "state no longer exists after reload; reset to initial state"
            );
        }
        true
    }
}

fn build(path: &str, origin: &Origin) -> Result<ScriptDefinition, RegistryError> {
    match origin {
        Origin::File if is_baked(path) => {
            let bytes = fs::read(path).map_err(|source| RegistryError::Io {
                path: path.to_string(),
                source,
            })?;
            decode(path, &bytes)
        }
        Origin::File => {
            let source = fs::read_to_string(path).map_err(|source| RegistryError::Io {
                path: path.to_string(),
                source,
            })?;
            Ok(compile(path, &source)?)
        }
        Origin::Source(source) => Ok(compile(path, source)?),
        Origin::Baked(bytes) => decode(path, bytes),
    }
}

fn decode(path: &str, bytes: &[u8]) -> Result<ScriptDefinition, RegistryError> {
    let mut def = ScriptDefinition::from_bytes(bytes).map_err(|source| RegistryError::Decode {
        path: path.to_string(),
        source,
    })?;
    def.path = path.to_string();
    Ok(def)
}

fn is_baked(path: &str) -> bool {
    Path::new(path).extension().and_then(|e| e.to_str()) == Some(BAKED_EXTENSION)
}
