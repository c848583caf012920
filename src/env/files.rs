//! dotenv-style files

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

/// Read `KEY=value` pairs from `path`.
///
/// A missing file is an empty source. An unreadable or malformed file is
/// logged and treated as empty, so one bad file never blocks a run.
pub fn read_env_file(path: &Path) -> HashMap<String, String> {
    if !path.is_file() {
        debug!(path = %path.display(), "No env file");
        return HashMap::new();
    }

    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Skipping unreadable env file");
            return HashMap::new();
        }
    };

    let mut vars = HashMap::new();
    for item in iter {
        match item {
            Ok((key, value)) => {
                vars.insert(key, value);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping malformed env file");
                return HashMap::new();
            }
        }
    }
    debug!(path = %path.display(), count = vars.len(), "Loaded env file");
    vars
}
