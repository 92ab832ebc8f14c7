//! Instance environment file rendering.
//!
//! The env file is the sole identity contract between the controller and a
//! spawned process: the process reads it at its own startup via the `ENV_PATH`
//! variable. The key set is fixed for compatibility with existing consumers:
//! `INSTANCE` and `INSTANCE_NAME` (two aliases for the same value),
//! `INSTANCE_VERSION` (empty when unset), and `PORT` only when a port is set.

use crate::error::{Error, Result};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Render and atomically write the env file. No partial file is ever
/// observable: content lands in a temp file in the same directory and is
/// renamed over the target.
pub fn write_env_file(path: &Path, name: &str, version: Option<&str>, port: Option<u16>) -> Result<()> {
    let contents = render(name, version, port);

    let dir = path.parent().ok_or_else(|| {
        Error::Filesystem(format!("env path {} has no parent directory", path.display()))
    })?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.persist(path)
        .map_err(|e| Error::Filesystem(format!("writing {}: {}", path.display(), e.error)))?;
    Ok(())
}

fn render(name: &str, version: Option<&str>, port: Option<u16>) -> String {
    let mut contents = format!(
        "INSTANCE={name}\nINSTANCE_NAME={name}\nINSTANCE_VERSION={}\n",
        version.unwrap_or("")
    );
    if let Some(port) = port {
        contents.push_str(&format!("PORT={port}\n"));
    }
    contents
}
