//! Concatenated-JPEG ("raw MJPEG") files.
//!
//! Each frame is a complete JPEG (SOI .. EOI). Decoding is done in memory
//! with the `image` crate, so this backend needs no native codec.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::frame::RawFrame;

/// Extensions routed to this backend (case-insensitive).
pub const MJPEG_EXTENSIONS: [&str; 2] = ["mjpeg", "mjpg"];

const MAX_JPEG_BYTES: usize = 16 * 1024 * 1024;
const READ_CHUNK: usize = 64 * 1024;

pub(crate) fn is_mjpeg_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            MJPEG_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

pub(crate) struct MjpegFileSource {
    path: PathBuf,
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
    /// First frame, decoded at open time so a bad file fails to open.
    pending: Option<(Vec<u8>, u32, u32)>,
    eof: bool,
}

impl MjpegFileSource {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mut source = Self {
            path: path.to_path_buf(),
            reader: Box::new(BufReader::new(file)),
            buffer: Vec::with_capacity(READ_CHUNK),
            pending: None,
            eof: false,
        };
        let first = source
            .read_next_jpeg()?
            .ok_or_else(|| anyhow!("{} contains no JPEG frames", path.display()))?;
        source.pending = Some(decode_jpeg(&first)?);
        Ok(source)
    }

    pub(crate) fn next_frame(&mut self, sequence: u64) -> Result<Option<RawFrame>> {
        let decoded = match self.pending.take() {
            Some(decoded) => decoded,
            None => match self.read_next_jpeg()? {
                Some(jpeg) => decode_jpeg(&jpeg)
                    .with_context(|| format!("frame {} of {}", sequence, self.path.display()))?,
                None => return Ok(None),
            },
        };
        let (pixels, width, height) = decoded;
        RawFrame::from_rgb(pixels, width, height, sequence).map(Some)
    }

    /// Next complete JPEG, `None` once the file is exhausted. Trailing bytes
    /// that never form a complete JPEG are ignored.
    fn read_next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let jpeg = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(Some(jpeg));
            }
            if self.eof {
                if !self.buffer.is_empty() {
                    log::debug!(
                        "{}: ignoring {} trailing bytes",
                        self.path.display(),
                        self.buffer.len()
                    );
                    self.buffer.clear();
                }
                return Ok(None);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                self.eof = true;
                continue;
            }
            self.buffer.extend_from_slice(&chunk[..read]);
            if self.buffer.len() > MAX_JPEG_BYTES {
                return Err(anyhow!(
                    "{}: no complete JPEG within {} bytes",
                    self.path.display(),
                    MAX_JPEG_BYTES
                ));
            }
        }
    }
}

pub(crate) fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let rgb = image.into_rgb8();
    let (width, height) = rgb.dimensions();
    Ok((rgb.into_raw(), width, height))
}

/// Byte range of the first complete JPEG (SOI through EOI) in `buffer`.
///
/// Marker segments are stepped over by their length field, so an EOI inside
/// an APPn payload (an EXIF thumbnail, say) does not end the frame. `None`
/// until the buffer holds the whole frame.
pub fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let mut pos = start + 2;
    loop {
        // Bytes where a marker should be are skipped up to the next 0xFF.
        while *buffer.get(pos)? != 0xFF {
            pos += 1;
        }
        let mut marker = *buffer.get(pos + 1)?;
        while marker == 0xFF {
            pos += 1;
            marker = *buffer.get(pos + 1)?;
        }
        pos = match marker {
            0xD9 => return Some((start, pos + 2)),
            0x00 | 0x01 | 0xD0..=0xD8 => pos + 2,
            0xDA => next_marker_after_scan(buffer, pos + 2 + segment_len(buffer, pos)?)?,
            _ => pos + 2 + segment_len(buffer, pos)?,
        };
    }
}

/// Length field of the segment whose marker starts at `marker_pos`.
fn segment_len(buffer: &[u8], marker_pos: usize) -> Option<usize> {
    let hi = *buffer.get(marker_pos + 2)?;
    let lo = *buffer.get(marker_pos + 3)?;
    Some(u16::from_be_bytes([hi, lo]) as usize)
}

/// First marker after entropy-coded data. Stuffed `FF 00` and RSTn are part
/// of the scan.
fn next_marker_after_scan(buffer: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        if *buffer.get(pos)? != 0xFF {
            pos += 1;
            continue;
        }
        match *buffer.get(pos + 1)? {
            0x00 | 0xD0..=0xD7 => pos += 2,
            0xFF => pos += 1,
            _ => return Some(pos),
        }
    }
}
