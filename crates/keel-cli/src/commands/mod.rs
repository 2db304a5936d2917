//! CLI commands

use std::path::Path;

use keel_common::wait::ProgressSink;
use keel_common::RuntimeConfig;
use tracing::debug;

use crate::Result;

pub mod restore;
pub mod upgrade;

/// Defaults overlaid with the `--config` file when one is given
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => {
            debug!(path = %path.display(), "loading runtime config");
            Ok(RuntimeConfig::load(path)?)
        }
        None => Ok(RuntimeConfig::default()),
    }
}

/// Progress sink printing each update on its own line
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutProgress;

impl ProgressSink for StdoutProgress {
    fn report(&self, message: &str) {
        println!("{}", message);
    }
}
