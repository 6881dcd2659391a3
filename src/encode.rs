//! Frame compression for chunked transport.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::error::EncodeError;
use crate::frame::RawFrame;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Turns an annotated frame into one transport payload.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>, EncodeError>;

    /// MIME type of the payloads this encoder produces.
    fn content_type(&self) -> &'static str;
}

/// Baseline JPEG via the `image` crate.
#[derive(Clone, Copy, Debug)]
pub struct JpegFrameEncoder {
    quality: u8,
}

impl JpegFrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegFrameEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl FrameEncoder for JpegFrameEncoder {
    fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>, EncodeError> {
        let fail = |reason: String| EncodeError {
            sequence: frame.sequence,
            reason,
        };
        if frame.width == 0 || frame.height == 0 {
            return Err(fail(format!("empty frame {}x{}", frame.width, frame.height)));
        }
        if frame.width > u16::MAX as u32 || frame.height > u16::MAX as u32 {
            return Err(fail(format!(
                "frame {}x{} exceeds JPEG limits",
                frame.width, frame.height
            )));
        }

        let mut buffer = Vec::with_capacity(frame.byte_len() / 8);
        JpegEncoder::new_with_quality(&mut buffer, self.quality)
            .encode(
                frame.pixels(),
                frame.width,
                frame.height,
                ExtendedColorType::Rgb8,
            )
            .map_err(|err| fail(err.to_string()))?;
        Ok(buffer)
    }

    fn content_type(&self) -> &'static str {
        "image/jpeg"
    }
}
