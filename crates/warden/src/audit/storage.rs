// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only storage adapters for the audit chain.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Append-only line storage. There is deliberately no update or delete.
pub trait AuditStorage: Send + Sync {
    /// Append one serialized entry. `line` never contains a newline.
    fn append(&self, line: &str) -> std::io::Result<()>;

    /// Read every stored line in append order, as raw bytes.
    ///
    /// Lines are returned exactly as stored so a tampered line that is no
    /// longer valid UTF-8 still reaches verification.
    fn read_all(&self) -> std::io::Result<Vec<Vec<u8>>>;
}

/// Newline-delimited JSON file, created with owner-only permissions.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        // Touch so the mode is set before the first append.
        std::fs::OpenOptions::new().create(true).append(true).mode(0o600).open(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditStorage for FileStorage {
    fn append(&self, line: &str) -> std::io::Result<()> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        let mut file =
            std::fs::OpenOptions::new().create(true).append(true).mode(0o600).open(&self.path)?;
        file.write_all(buf.as_bytes())?;
        file.sync_data()
    }

    fn read_all(&self) -> std::io::Result<Vec<Vec<u8>>> {
        let contents = match std::fs::read(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e),
        };
        Ok(split_lines(&contents))
    }
}

/// Split on `\n`, dropping empty lines. No other byte is treated specially.
pub fn split_lines(contents: &[u8]) -> Vec<Vec<u8>> {
    contents.split(|b| *b == b'\n').filter(|l| !l.is_empty()).map(<[u8]>::to_vec).collect()
}

/// In-memory storage for tests and `--ephemeral` runs.
#[derive(Default)]
pub struct MemoryStorage {
    lines: Mutex<Vec<Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStorage for MemoryStorage {
    fn append(&self, line: &str) -> std::io::Result<()> {
        self.lines.lock().push(line.as_bytes().to_vec());
        Ok(())
    }

    fn read_all(&self) -> std::io::Result<Vec<Vec<u8>>> {
        Ok(self.lines.lock().clone())
    }
}
