//! V4L2 capture devices (e.g. `/dev/video0`).
//!
//! Requests RGB3 at the configured size; when the driver insists on YUYV or
//! MJPG the buffer is converted in `normalize`. Buffers are memory-mapped and
//! copied out once per frame.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::SourceSettings;
use crate::frame::RawFrame;

const CAPTURE_BUFFERS: u32 = 4;

pub(crate) struct V4l2Device {
    node: String,
    state: V4l2State,
    width: u32,
    height: u32,
    format: PixelFormat,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Device {
    pub(crate) fn open(node: &str, settings: &SourceSettings) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device =
            v4l::Device::with_path(node).with_context(|| format!("open v4l2 device {}", node))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = settings.width;
        format.height = settings.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("v4l2 {}: failed to set RGB3 format: {}", node, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "v4l2 {}: unsupported pixel format {}",
                node,
                format.fourcc
            )
        })?;

        if settings.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(settings.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("v4l2 {}: failed to set fps: {}", node, err);
            }
        }

        let state = V4l2StateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, CAPTURE_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "v4l2 {}: capturing {}x{} {:?}",
            node,
            format.width,
            format.height,
            pixel_format
        );
        Ok(Self {
            node: node.to_string(),
            state,
            width: format.width,
            height: format.height,
            format: pixel_format,
        })
    }

    pub(crate) fn next_frame(&mut self, sequence: u64) -> Result<Option<RawFrame>> {
        use v4l::io::traits::CaptureStream;

        let (width, height, format) = (self.width, self.height, self.format);
        let converted = self.state.with_mut(|fields| {
            let (buf, meta) = fields
                .stream
                .next()
                .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))?;
            let used = (meta.bytesused as usize).min(buf.len());
            let used = if used == 0 { buf.len() } else { used };
            normalize_to_rgb(&buf[..used], width, height, format)
        });
        let (pixels, width, height) =
            converted.with_context(|| format!("v4l2 {} frame {}", self.node, sequence))?;
        RawFrame::from_rgb(pixels, width, height, sequence).map(Some)
    }
}
