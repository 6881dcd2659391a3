//! Synthetic capture device for `stub://` device prefixes.
//!
//! Produces an endless moving gradient at the configured size, paced to the
//! target frame rate like a real camera.

use anyhow::Result;
use std::time::{Duration, Instant};

use super::SourceSettings;
use crate::frame::RawFrame;

pub(crate) struct SyntheticDevice {
    node: String,
    width: u32,
    height: u32,
    interval: Duration,
    last_frame_at: Option<Instant>,
}

impl SyntheticDevice {
    pub(crate) fn new(node: String, settings: &SourceSettings) -> Self {
        log::info!("synthetic device {} ({}x{})", node, settings.width, settings.height);
        Self {
            node,
            width: settings.width,
            height: settings.height,
            interval: frame_interval(settings.target_fps),
            last_frame_at: None,
        }
    }

    pub(crate) fn next_frame(&mut self, sequence: u64) -> Result<Option<RawFrame>> {
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());

        let pixels = self.generate_pixels(sequence);
        RawFrame::from_rgb(pixels, self.width, self.height, sequence).map(Some)
    }

    fn generate_pixels(&self, sequence: u64) -> Vec<u8> {
        let pixel_count = (self.width as usize) * (self.height as usize) * 3;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 / 3 + sequence * 4) % 256) as u8;
        }
        pixels
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        log::debug!("synthetic device {} stopped", self.node);
    }
}

fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}
