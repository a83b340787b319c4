//! Sliced video payloads.
//!
//! Encoders emit a set of NAL-unit-sized slices per picture. A
//! [`SlicedVideoFrame`] stages them in one composite frame on the write
//! side of a sliced queue, which then fans each slice out as an
//! independent downstream frame.

use crate::constants::MAX_SLICES;
use crate::stream_info::VideoCodec;

/// One slice region inside the staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub offset: usize,
    pub len: usize,
}

/// Composite frame carrying up to [`MAX_SLICES`] NAL-unit slices.
#[derive(Debug)]
pub struct SlicedVideoFrame {
    buf: Vec<u8>,
    used: usize,
    slices: Vec<Slice>,
    codec: VideoCodec,
    width: usize,
    height: usize,
}

impl SlicedVideoFrame {
    /// Staging buffer holding at most `capacity` payload bytes across all
    /// slices of one picture.
    #[must_use]
    pub fn new(codec: VideoCodec, capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            used: 0,
            slices: Vec::with_capacity(MAX_SLICES),
            codec,
            width: 0,
            height: 0,
        }
    }

    #[must_use]
    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    pub fn set_geometry(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
    }

    #[must_use]
    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Total staged payload bytes.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.used
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Payload of the nth slice.
    #[must_use]
    pub fn slice(&self, index: usize) -> Option<&[u8]> {
        self.slices
            .get(index)
            .map(|s| &self.buf[s.offset..s.offset + s.len])
    }

    /// Appends one slice. Fails (returning `false`, staging untouched) when
    /// the slice table or the staging buffer is exhausted.
    pub fn push_slice(&mut self, data: &[u8]) -> bool {
        if self.slices.len() >= MAX_SLICES || self.used + data.len() > self.buf.len() {
            return false;
        }
        self.buf[self.used..self.used + data.len()].copy_from_slice(data);
        self.slices.push(Slice {
            offset: self.used,
            len: data.len(),
        });
        self.used += data.len();
        true
    }

    /// Drops all staged slices, keeping the buffer allocation.
    pub fn clear(&mut self) {
        self.slices.clear();
        self.used = 0;
    }
}
