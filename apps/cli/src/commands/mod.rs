//! Command implementations for the Stratus CLI.

pub mod purge;
pub mod resume;
pub mod run;
pub mod runs;
pub mod status;
pub mod validate;

use std::path::Path;
use std::sync::Arc;

use stratus_core::{Engine, FileStore, StratusConfig};

use crate::loopback::LoopbackInvoker;

/// Builds an engine over the checkpoint store at `store_dir`.
fn open_engine(store_dir: &Path, config: StratusConfig) -> Engine {
    Engine::builder(Arc::new(LoopbackInvoker))
        .with_store(Arc::new(FileStore::new(store_dir)))
        .with_config(config)
        .build()
}
