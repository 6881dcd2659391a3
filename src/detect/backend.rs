use anyhow::Result;

use crate::detect::result::RawDetection;
use crate::frame::RawFrame;
use crate::stats::CategoryFilter;

/// Detector backend trait.
///
/// The model behind it is a black box. Implementations treat the frame as
/// read-only and should honour the filter's threshold and class ids; the
/// adapter enforces both again on whatever comes back.
///
/// One instance serves every session at once, so `detect` takes `&self`.
/// Backends with mutable inference state keep their own locking.
pub trait DetectorBackend: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one frame.
    fn detect(&self, frame: &RawFrame, filter: &CategoryFilter) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
