use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;
use crate::frame::RawFrame;
use crate::stats::CategoryFilter;

/// Backend used when no model is configured. Never detects anything, so
/// streams still flow and every snapshot is zero.
#[derive(Debug, Default)]
pub struct NullBackend;

impl NullBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DetectorBackend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn detect(&self, _frame: &RawFrame, _filter: &CategoryFilter) -> Result<Vec<RawDetection>> {
        Ok(Vec::new())
    }
}
