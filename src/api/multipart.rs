//! `multipart/x-mixed-replace` response writer.

use std::io::{self, Write};

use crate::error::ClientDisconnected;
use crate::pipeline::ChunkSink;
use crate::stats::SessionId;

pub const BOUNDARY: &str = "frame";

/// Writes one part per emitted chunk to an already-accepted client.
///
/// Any write failure, including a write timeout on the socket, is reported as
/// `ClientDisconnected`.
pub struct MultipartWriter<W: Write> {
    out: W,
    parts: u64,
}

impl<W: Write> MultipartWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, parts: 0 }
    }

    /// Response head. Nothing is written before the source is open.
    pub fn begin(&mut self, session: &SessionId) -> Result<(), ClientDisconnected> {
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-cache\r\nConnection: close\r\nX-Session-Id: {}\r\n\r\n",
            BOUNDARY, session
        );
        self.out.write_all(head.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }

    /// Closing delimiter after a normal end of stream.
    pub fn finish(&mut self) -> Result<(), ClientDisconnected> {
        write!(self.out, "--{}--\r\n", BOUNDARY)?;
        self.out.flush()?;
        Ok(())
    }

    pub fn parts_written(&self) -> u64 {
        self.parts
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_part(&mut self, payload: &[u8], content_type: &str) -> io::Result<()> {
        write!(
            self.out,
            "--{}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            BOUNDARY,
            content_type,
            payload.len()
        )?;
        self.out.write_all(payload)?;
        self.out.write_all(b"\r\n")?;
        self.out.flush()
    }
}

impl<W: Write> ChunkSink for MultipartWriter<W> {
    fn emit(&mut self, payload: &[u8], content_type: &str) -> Result<(), ClientDisconnected> {
        self.write_part(payload, content_type)?;
        self.parts += 1;
        Ok(())
    }
}
