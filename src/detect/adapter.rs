use std::sync::Arc;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::error::DetectError;
use crate::frame::RawFrame;
use crate::stats::CategoryFilter;

/// Backend shared by every session. The model is loaded once per process and
/// sessions call into it concurrently.
pub type SharedDetector = Arc<dyn DetectorBackend>;

/// Runs the shared backend with the process-wide filter.
///
/// Whatever this returns is what counts as "detected": detections under the
/// threshold or outside the class filter never leave this call.
#[derive(Clone)]
pub struct DetectionAdapter {
    backend: SharedDetector,
    filter: CategoryFilter,
}

impl DetectionAdapter {
    pub fn new(backend: SharedDetector, filter: CategoryFilter) -> Self {
        Self { backend, filter }
    }

    pub fn filter(&self) -> &CategoryFilter {
        &self.filter
    }

    /// Detect on one frame, in backend order.
    pub fn detect(&self, frame: &RawFrame) -> Result<Vec<Detection>, DetectError> {
        let raw = self
            .backend
            .detect(frame, &self.filter)
            .map_err(|err| DetectError::Backend {
                backend: self.backend.name().to_string(),
                message: format!("{err:#}"),
            })?;

        Ok(raw
            .into_iter()
            .filter(|r| r.confidence >= self.filter.threshold())
            .filter_map(|r| {
                let category = self.filter.category_of(r.class_id)?;
                Some(Detection {
                    category,
                    class_id: r.class_id,
                    confidence: r.confidence,
                    bbox: r.bbox,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Category, RawDetection};
    use anyhow::{anyhow, Result};

    struct FixedBackend(Vec<RawDetection>);

    impl DetectorBackend for FixedBackend {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detect(&self, _frame: &RawFrame, _filter: &CategoryFilter) -> Result<Vec<RawDetection>> {
            Ok(self.0.clone())
        }
    }

    struct FailingBackend;

    impl DetectorBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&self, _frame: &RawFrame, _filter: &CategoryFilter) -> Result<Vec<RawDetection>> {
            Err(anyhow!("model crashed"))
        }
    }

    fn raw(class_id: u32, confidence: f32) -> RawDetection {
        RawDetection {
            class_id,
            confidence,
            bbox: BoundingBox::new(1.0, 2.0, 3.0, 4.0),
        }
    }

    fn frame() -> RawFrame {
        RawFrame::from_rgb(vec![0u8; 2 * 2 * 3], 2, 2, 0).unwrap()
    }

    #[test]
    fn adapter_drops_low_confidence_and_unlisted_classes() -> Result<()> {
        let backend = FixedBackend(vec![
            raw(0, 0.9),
            raw(2, 0.3),
            raw(16, 0.95),
            raw(5, 0.4),
            raw(0, 0.41),
        ]);
        let adapter = DetectionAdapter::new(Arc::new(backend), CategoryFilter::default());

        let detections = adapter.detect(&frame())?;
        let summary: Vec<(u32, Category)> =
            detections.iter().map(|d| (d.class_id, d.category)).collect();
        assert_eq!(
            summary,
            vec![
                (0, Category::Person),
                (5, Category::Vehicle),
                (0, Category::Person)
            ]
        );
        Ok(())
    }

    #[test]
    fn adapter_reports_backend_failure() {
        let adapter = DetectionAdapter::new(Arc::new(FailingBackend), CategoryFilter::default());
        match adapter.detect(&frame()) {
            Err(DetectError::Backend { backend, message }) => {
                assert_eq!(backend, "failing");
                assert!(message.contains("model crashed"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
