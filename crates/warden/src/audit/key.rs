// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Audit HMAC key resolution.

use std::path::Path;

use rand::Rng;

/// Resolve the HMAC key for the audit chain.
///
/// An explicit key wins. Otherwise `<state_dir>/audit.key` (hex) is loaded,
/// or generated with 32 random bytes on first run.
pub fn load_or_create(explicit: Option<&str>, state_dir: &Path) -> anyhow::Result<Vec<u8>> {
    if let Some(key) = explicit {
        if key.is_empty() {
            anyhow::bail!("audit key must not be empty");
        }
        return Ok(key.as_bytes().to_vec());
    }

    let path = state_dir.join("audit.key");
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let key = hex::decode(contents.trim())
                .map_err(|e| anyhow::anyhow!("invalid audit key in {}: {e}", path.display()))?;
            if key.is_empty() {
                anyhow::bail!("audit key file {} is empty", path.display());
            }
            Ok(key)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut key = [0u8; 32];
            rand::rng().fill(&mut key);
            std::fs::create_dir_all(state_dir)?;
            crate::persist::write_private(&path, hex::encode(key).as_bytes())?;
            tracing::info!(path = %path.display(), "generated new audit key");
            Ok(key.to_vec())
        }
        Err(e) => Err(e.into()),
    }
}
