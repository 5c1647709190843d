//! CLI command implementations.

mod display;

pub mod cascade;
pub mod index;
pub mod search;
pub mod status;
pub mod symbols;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata::{ChainSearchEngine, EngineConfig, Error, PathMapper, RegistryStore};

/// Environment variable naming the index root.
const INDEX_ROOT_ENV: &str = "STRATA_INDEX_ROOT";

/// Settings shared by every command.
pub struct Context {
    index_root: PathBuf,
    config: EngineConfig,
}

impl Context {
    /// Resolve the index root and load the configuration file, if any.
    pub fn load(index_root: Option<PathBuf>, config: Option<&Path>) -> Result<Self, Error> {
        let index_root = match index_root {
            Some(root) => root,
            None => default_index_root()?,
        };
        let config = match config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        tracing::debug!(index_root = %index_root.display(), "Using index root");
        Ok(Self { index_root, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> Result<Arc<RegistryStore>, Error> {
        Ok(Arc::new(RegistryStore::open(PathMapper::new(&self.index_root))?))
    }

    pub fn engine(&self) -> Result<ChainSearchEngine, Error> {
        ChainSearchEngine::new(self.registry()?, self.config.clone())
    }
}

fn default_index_root() -> Result<PathBuf, Error> {
    if let Some(root) = std::env::var_os(INDEX_ROOT_ENV) {
        return Ok(PathBuf::from(root));
    }
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        return Ok(PathBuf::from(home).join(".strata").join("indexes"));
    }
    Ok(current_dir()?.join(".strata").join("indexes"))
}

/// `path`, or the current directory when none was given.
pub fn search_root(path: Option<&Path>) -> Result<PathBuf, Error> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => current_dir(),
    }
}

fn current_dir() -> Result<PathBuf, Error> {
    std::env::current_dir().map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("failed to get current directory: {e}"),
        ))
    })
}
