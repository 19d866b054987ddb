use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use sshpuppet_core::AccessPolicy;

/// Opens and parses the access policy document at `path`.
pub fn load_access_policy(path: &Path) -> Result<AccessPolicy> {
    let file = File::open(path).with_context(|| format!("opening access policy {}", path.display()))?;
    AccessPolicy::load_from(file).with_context(|| format!("parsing access policy {}", path.display()))
}
