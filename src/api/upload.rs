//! Uploaded video files and the identifiers that name them.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$";

/// Directory of uploaded files, addressed by validated identifiers.
#[derive(Clone, Debug)]
pub struct UploadStore {
    dir: PathBuf,
    identifier: Regex,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            dir: dir.into(),
            identifier: Regex::new(IDENTIFIER_PATTERN)?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_valid_identifier(&self, id: &str) -> bool {
        self.identifier.is_match(id)
    }

    /// Path for an identifier. Does not check that the file exists.
    pub fn resolve(&self, id: &str) -> Result<PathBuf> {
        if !self.is_valid_identifier(id) {
            return Err(anyhow!("invalid upload identifier '{}'", id));
        }
        Ok(self.dir.join(id))
    }

    /// Write `bytes` under `name`, replacing any previous upload of that name.
    pub fn store(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.resolve(name)?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create upload dir {}", self.dir.display()))?;
        let partial = self.dir.join(format!(".{}.partial", name));
        fs::write(&partial, bytes)
            .with_context(|| format!("write upload {}", partial.display()))?;
        fs::rename(&partial, &path)
            .with_context(|| format!("move upload into place at {}", path.display()))?;
        Ok(path)
    }
}
