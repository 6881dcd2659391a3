#![cfg(feature = "backend-tract")]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, RawDetection};
use crate::frame::RawFrame;
use crate::stats::CategoryFilter;

/// Padding colour used by the YOLO letterbox.
const LETTERBOX_FILL: u8 = 114;
const DEFAULT_IOU_THRESHOLD: f32 = 0.7;

#[derive(Clone, Debug)]
pub struct TractConfig {
    pub model_path: PathBuf,
    /// Square model input edge in pixels.
    pub input_size: u32,
    pub iou_threshold: f32,
}

impl TractConfig {
    pub fn new(model_path: impl Into<PathBuf>, input_size: u32) -> Self {
        Self {
            model_path: model_path.into(),
            input_size,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        }
    }
}

/// Tract-based backend for YOLOv8 ONNX exports.
///
/// Expects a single `[1, 3, S, S]` f32 input and a `[1, 4 + C, N]` output where
/// the first four rows are box centre/size in input pixels and the remaining
/// `C` rows are per-class scores.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    iou_threshold: f32,
}

/// How a frame was mapped into the square model input.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new(config: &TractConfig) -> Result<Self> {
        let model_path: &Path = &config.model_path;
        let size = config.input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size: config.input_size,
            iou_threshold: config.iou_threshold,
        })
    }

    fn build_input(&self, frame: &RawFrame) -> Result<(Tensor, Letterbox)> {
        let source = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
        let (canvas, letterbox) = letterbox(&source, self.input_size)?;

        let size = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
            canvas.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        });
        Ok((input.into_tensor(), letterbox))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&self, frame: &RawFrame, filter: &CategoryFilter) -> Result<Vec<RawDetection>> {
        let (input, letterbox) = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("expected a [1, 4 + classes, anchors] output")?;

        let rows = view.shape()[1];
        let anchors = view.shape()[2];
        if rows <= 4 {
            return Err(anyhow!("model output has {} rows, expected > 4", rows));
        }

        let class_ids: Vec<u32> = filter
            .class_ids()
            .into_iter()
            .filter(|id| (*id as usize) < rows - 4)
            .collect();

        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let best = class_ids
                .iter()
                .map(|&id| (id, view[[0, 4 + id as usize, anchor]]))
                .fold(None, |best: Option<(u32, f32)>, (id, score)| match best {
                    Some((_, best_score)) if best_score >= score => best,
                    _ => Some((id, score)),
                });
            let Some((class_id, confidence)) = best else {
                continue;
            };
            if confidence < filter.threshold() {
                continue;
            }
            let bbox = unletterbox(
                view[[0, 0, anchor]],
                view[[0, 1, anchor]],
                view[[0, 2, anchor]],
                view[[0, 3, anchor]],
                letterbox,
                frame.width,
                frame.height,
            );
            candidates.push(RawDetection {
                class_id,
                confidence,
                bbox,
            });
        }

        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

fn letterbox(source: &RgbImage, size: u32) -> Result<(RgbImage, Letterbox)> {
    if source.width() == 0 || source.height() == 0 {
        return Err(anyhow!("cannot letterbox an empty frame"));
    }
    let scale = (size as f32 / source.width() as f32).min(size as f32 / source.height() as f32);
    let scaled_w = ((source.width() as f32 * scale).round() as u32).clamp(1, size);
    let scaled_h = ((source.height() as f32 * scale).round() as u32).clamp(1, size);
    let resized = imageops::resize(source, scaled_w, scaled_h, FilterType::Triangle);

    let pad_x = (size - scaled_w) / 2;
    let pad_y = (size - scaled_h) / 2;
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
    imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    Ok((
        canvas,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    ))
}

fn unletterbox(
    cx: f32,
    cy: f32,
    w: f32,
    h: f32,
    letterbox: Letterbox,
    frame_width: u32,
    frame_height: u32,
) -> BoundingBox {
    let left = ((cx - w / 2.0 - letterbox.pad_x) / letterbox.scale).clamp(0.0, frame_width as f32);
    let top = ((cy - h / 2.0 - letterbox.pad_y) / letterbox.scale).clamp(0.0, frame_height as f32);
    let right = ((cx + w / 2.0 - letterbox.pad_x) / letterbox.scale).clamp(0.0, frame_width as f32);
    let bottom =
        ((cy + h / 2.0 - letterbox.pad_y) / letterbox.scale).clamp(0.0, frame_height as f32);
    BoundingBox::new(left, top, right - left, bottom - top)
}

/// Greedy per-class NMS, highest confidence first.
fn non_max_suppression(mut candidates: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<RawDetection> = Vec::new();
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
