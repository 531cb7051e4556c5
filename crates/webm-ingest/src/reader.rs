//! Splits the decoder's raw stdout into fixed-size BGRA frames.

use std::{
    io::{self, Read},
    sync::Arc,
};

use crate::{
    process::StderrTail,
    types::{BYTES_PER_PIXEL, DecodeError, Frame, FrameFormat, Phase, VideoStreamInfo},
};

/// Reads whole frames from a raw video stream until end-of-stream.
///
/// Frame boundaries must line up with the stream: a read that ends part-way
/// through a frame yields [`DecodeError::TruncatedFrame`] instead of a short
/// frame. After the first error or end-of-stream the reader is exhausted.
pub struct FrameReader<R> {
    inner: R,
    width: u32,
    height: u32,
    frame_size: usize,
    next_index: u64,
    finished: bool,
    program: String,
    stderr: Option<Arc<StderrTail>>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, info: &VideoStreamInfo) -> Self {
        Self::with_dimensions(inner, info.width, info.height)
    }

    pub fn with_dimensions(inner: R, width: u32, height: u32) -> Self {
        Self {
            inner,
            width,
            height,
            frame_size: width as usize * height as usize * BYTES_PER_PIXEL,
            next_index: 0,
            finished: false,
            program: "decoder".into(),
            stderr: None,
        }
    }

    /// Attach the producing process so errors carry its name and stderr tail.
    pub fn with_source(mut self, program: impl Into<String>, stderr: Arc<StderrTail>) -> Self {
        self.program = program.into();
        self.stderr = Some(stderr);
        self
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Read the next frame. `Ok(None)` marks a clean end-of-stream.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        if self.finished {
            return Ok(None);
        }
        let mut data = vec![0u8; self.frame_size];
        let filled = match read_full(&mut self.inner, &mut data) {
            Ok(filled) => filled,
            Err(source) => {
                self.finished = true;
                return Err(DecodeError::Io {
                    phase: Phase::Decode,
                    program: self.program.clone(),
                    source,
                });
            }
        };

        if filled == 0 {
            self.finished = true;
            return Ok(None);
        }
        if filled < self.frame_size {
            self.finished = true;
            return Err(DecodeError::TruncatedFrame {
                expected: self.frame_size,
                received: filled,
                stderr: self
                    .stderr
                    .as_ref()
                    .map(|tail| tail.snapshot())
                    .unwrap_or_default(),
            });
        }

        let frame = Frame {
            data,
            width: self.width,
            height: self.height,
            index: self.next_index,
            format: FrameFormat::Bgra8,
        };
        self.next_index += 1;
        Ok(Some(frame))
    }

    /// Drain the stream into a vector of frames in decode order.
    pub fn read_all(self) -> Result<Vec<Frame>, DecodeError> {
        self.collect()
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<Frame, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

/// Fill `buf` unless the stream ends first; returns the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
