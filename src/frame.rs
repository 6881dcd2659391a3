//! Decoded frames.
//!
//! A `RawFrame` is one RGB24 image plus its position in the source sequence.
//! Sources produce them, the session pipeline owns each one for a single
//! iteration and then drops it.

use anyhow::{anyhow, Result};

/// Bytes per RGB24 pixel.
pub const RGB_CHANNELS: usize = 3;

/// One decoded RGB24 frame.
///
/// Not `Clone`: the annotator builds its own copy so the source frame is never
/// mutated in place.
#[derive(Debug)]
pub struct RawFrame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Zero-based position in the source sequence.
    pub sequence: u64,
}

impl RawFrame {
    /// Wrap an RGB24 buffer. Fails when the buffer length does not match the
    /// dimensions.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = expected_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            sequence,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Same shape and sequence, different pixels. `data` must come from a
    /// buffer of this frame's dimensions.
    pub(crate) fn with_pixels(&self, data: Vec<u8>) -> RawFrame {
        debug_assert_eq!(data.len(), self.data.len());
        RawFrame {
            data,
            width: self.width,
            height: self.height,
            sequence: self.sequence,
        }
    }
}

pub(crate) fn expected_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(RGB_CHANNELS))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgb_accepts_matching_buffer() -> Result<()> {
        let frame = RawFrame::from_rgb(vec![7u8; 4 * 2 * 3], 4, 2, 9)?;
        assert_eq!(frame.width, 4);
        assert_eq!(frame.height, 2);
        assert_eq!(frame.sequence, 9);
        assert_eq!(frame.byte_len(), 24);
        Ok(())
    }

    #[test]
    fn from_rgb_rejects_short_buffer() {
        let err = RawFrame::from_rgb(vec![0u8; 10], 4, 2, 0).unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
    }
}
