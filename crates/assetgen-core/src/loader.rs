//! Config file loading
//!
//! Loading never fails: a missing, unreadable or malformed file is treated as
//! an empty config.

use crate::config::ConfigMap;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

/// Load a JSON object from `path`, or an empty map on any problem
pub fn load_config(path: impl AsRef<Path>) -> ConfigMap {
    let path = path.as_ref();

    if !path.is_file() {
        debug!(path = %path.display(), "No config file");
        return ConfigMap::new();
    }

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Config file unreadable, ignoring");
            return ConfigMap::new();
        }
    };

    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => {
            debug!(path = %path.display(), keys = map.len(), "Loaded config file");
            map
        }
        Ok(_) => {
            warn!(path = %path.display(), "Config file is not a JSON object, ignoring");
            ConfigMap::new()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Config file is not valid JSON, ignoring");
            ConfigMap::new()
        }
    }
}
