use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use mlua::Lua;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::compile_source;
use crate::{error::Result, pool::new_interpreter};

/// Size and modification time of a script file when it was compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub len: u64,
    pub modified: SystemTime,
}

impl Fingerprint {
    /// # Errors
    /// Returns an error if the file metadata cannot be read.
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        Ok(Self {
            len: meta.len(),
            modified: meta.modified()?,
        })
    }
}

/// Checked bytecode for one script file.
#[derive(Debug)]
pub struct CompiledScript {
    path: PathBuf,
    bytecode: Vec<u8>,
    fingerprint: Option<Fingerprint>,
}

impl CompiledScript {
    pub(crate) fn from_parts(
        path: impl Into<PathBuf>,
        bytecode: Vec<u8>,
        fingerprint: Option<Fingerprint>,
    ) -> Self {
        Self {
            path: path.into(),
            bytecode,
            fingerprint,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[must_use]
    pub const fn fingerprint(&self) -> Option<Fingerprint> {
        self.fingerprint
    }

    fn is_fresh(&self, current: Fingerprint) -> bool {
        self.fingerprint == Some(current)
    }
}

/// Compiled scripts keyed by absolute path.
///
/// An entry is served only while the file's current size and modification
/// time match the ones recorded at compile time. Compilation happens on a
/// dedicated interpreter behind a lock, so concurrent misses for the same
/// file compile it once.
pub struct ScriptCache {
    compiler: Mutex<Lua>,
    entries: RwLock<HashMap<PathBuf, Arc<CompiledScript>>>,
}

impl ScriptCache {
    /// # Errors
    /// Returns an error if the compiler interpreter cannot be created.
    pub fn new() -> Result<Self> {
        Ok(Self {
            compiler: Mutex::new(new_interpreter()?),
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the compiled form of `path`, compiling it when missing or stale.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be read and
    /// [`Error::Compile`](crate::Error::Compile) if it fails to compile.
    pub fn load(&self, path: &Path) -> Result<Arc<CompiledScript>> {
        let path = fs::canonicalize(path)?;
        let current = Fingerprint::of(&path)?;

        if let Some(hit) = self.fresh_entry(&path, current) {
            metrics::counter!("lumen_script_cache_hits_total").increment(1);
            return Ok(hit);
        }

        let compiler = self.compiler.lock();
        // another task may have compiled it while we waited
        let current = Fingerprint::of(&path)?;
        if let Some(hit) = self.fresh_entry(&path, current) {
            metrics::counter!("lumen_script_cache_hits_total").increment(1);
            return Ok(hit);
        }

        metrics::counter!("lumen_script_cache_misses_total").increment(1);
        match Self::compile_with(&compiler, &path, current) {
            Ok(compiled) => {
                let compiled = Arc::new(compiled);
                self.entries.write().insert(path, compiled.clone());
                Ok(compiled)
            }
            Err(err) => {
                metrics::counter!("lumen_script_compile_errors_total").increment(1);
                self.entries.write().remove(&path);
                Err(err)
            }
        }
    }

    /// Compiles `path` without consulting or filling the cache.
    ///
    /// # Errors
    /// Same as [`ScriptCache::load`].
    pub fn compile(&self, path: &Path) -> Result<CompiledScript> {
        let path = fs::canonicalize(path)?;
        let current = Fingerprint::of(&path)?;
        Self::compile_with(&self.compiler.lock(), &path, current)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fresh_entry(&self, path: &Path, current: Fingerprint) -> Option<Arc<CompiledScript>> {
        self.entries
            .read()
            .get(path)
            .filter(|entry| entry.is_fresh(current))
            .cloned()
    }

    fn compile_with(lua: &Lua, path: &Path, fingerprint: Fingerprint) -> Result<CompiledScript> {
        // fingerprint is taken before the read, so a concurrent edit leaves a
        // mismatch behind and the next load recompiles
        let source = fs::read(path)?;
        let bytecode = compile_source(lua, path, &source)?;
        debug!(path = %path.display(), bytes = bytecode.len(), "Compiled script");
        Ok(CompiledScript::from_parts(path, bytecode, Some(fingerprint)))
    }
}

impl std::fmt::Debug for ScriptCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptCache")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

/// Compiles every `.lua` file below `root`, returning the failures.
///
/// # Errors
/// Returns an error if the directory cannot be walked.
pub fn check_tree(cache: &ScriptCache, root: &Path) -> Result<Vec<crate::Error>> {
    let mut failures = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    let mut checked = 0usize;
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "lua") {
                checked += 1;
                if let Err(err) = cache.compile(&path) {
                    failures.push(err);
                }
            }
        }
    }
    info!(checked, failed = failures.len(), "Checked scripts");
    Ok(failures)
}
