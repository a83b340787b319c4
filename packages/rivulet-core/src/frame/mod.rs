//! Media frames.
//!
//! A [`Frame`] couples one reusable payload buffer with the metadata the
//! pipeline needs for pacing: presentation time, origin time, duration,
//! per-writer sequence number and the `consumed` commit flag. Payloads are
//! a tagged union so filters match on the concrete kind instead of
//! downcasting. Buffers are allocated once when a queue is built and reused
//! for the queue's whole life; nothing on the data path allocates.

mod audio;
mod sliced;
mod video;

pub use audio::{InterleavedAudioFrame, PlanarAudioFrame};
pub use sliced::{Slice, SlicedVideoFrame};
pub use video::VideoFrame;

use crate::utils::now_micros;

/// Frame payload, tagged by kind.
#[derive(Debug)]
pub enum FrameData {
    InterleavedVideo(VideoFrame),
    PlanarAudio(PlanarAudioFrame),
    InterleavedAudio(InterleavedAudioFrame),
    SlicedVideo(SlicedVideoFrame),
}

/// One unit of media plus its pacing metadata.
#[derive(Debug)]
pub struct Frame {
    /// Presentation timestamp in microseconds, monotonic per stream,
    /// producer-chosen epoch.
    pts: u64,
    /// Wall-clock microseconds when the frame left its source.
    origin_ts: u64,
    /// Duration in nanoseconds.
    duration_ns: u64,
    /// Monotonic per-writer sequence number.
    sequence: u64,
    /// Set by the producer when the slot carries real data; a skipped slot
    /// stays unconsumed and is never committed.
    consumed: bool,
    data: FrameData,
}

impl Frame {
    /// Wraps a payload with zeroed metadata.
    #[must_use]
    pub fn new(data: FrameData) -> Self {
        Self {
            pts: 0,
            origin_ts: 0,
            duration_ns: 0,
            sequence: 0,
            consumed: false,
            data,
        }
    }

    #[must_use]
    pub fn pts(&self) -> u64 {
        self.pts
    }

    pub fn set_pts(&mut self, pts: u64) {
        self.pts = pts;
    }

    #[must_use]
    pub fn origin_ts(&self) -> u64 {
        self.origin_ts
    }

    pub fn set_origin_ts(&mut self, origin_ts: u64) {
        self.origin_ts = origin_ts;
    }

    /// Stamps the origin with the current wall clock.
    pub fn refresh_origin(&mut self) {
        self.origin_ts = now_micros();
    }

    #[must_use]
    pub fn duration_ns(&self) -> u64 {
        self.duration_ns
    }

    pub fn set_duration_ns(&mut self, duration_ns: u64) {
        self.duration_ns = duration_ns;
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    #[must_use]
    pub fn consumed(&self) -> bool {
        self.consumed
    }

    pub fn set_consumed(&mut self, consumed: bool) {
        self.consumed = consumed;
    }

    #[must_use]
    pub fn data(&self) -> &FrameData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut FrameData {
        &mut self.data
    }

    /// Valid payload length in bytes (per channel for planar audio).
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.data {
            FrameData::InterleavedVideo(v) => v.len(),
            FrameData::PlanarAudio(a) => a.channel_len(),
            FrameData::InterleavedAudio(a) => a.len(),
            FrameData::SlicedVideo(s) => s.payload_len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum payload length in bytes (per channel for planar audio).
    #[must_use]
    pub fn max_len(&self) -> usize {
        match &self.data {
            FrameData::InterleavedVideo(v) => v.max_len(),
            FrameData::PlanarAudio(a) => a.channel_max_len(),
            FrameData::InterleavedAudio(a) => a.max_len(),
            FrameData::SlicedVideo(s) => s.capacity(),
        }
    }

    /// Video payload accessor, `None` for audio frames.
    #[must_use]
    pub fn video(&self) -> Option<&VideoFrame> {
        match &self.data {
            FrameData::InterleavedVideo(v) => Some(v),
            _ => None,
        }
    }

    pub fn video_mut(&mut self) -> Option<&mut VideoFrame> {
        match &mut self.data {
            FrameData::InterleavedVideo(v) => Some(v),
            _ => None,
        }
    }

    /// Planar audio payload accessor.
    #[must_use]
    pub fn planar_audio(&self) -> Option<&PlanarAudioFrame> {
        match &self.data {
            FrameData::PlanarAudio(a) => Some(a),
            _ => None,
        }
    }

    pub fn planar_audio_mut(&mut self) -> Option<&mut PlanarAudioFrame> {
        match &mut self.data {
            FrameData::PlanarAudio(a) => Some(a),
            _ => None,
        }
    }

    /// Sliced video payload accessor.
    #[must_use]
    pub fn sliced_video(&self) -> Option<&SlicedVideoFrame> {
        match &self.data {
            FrameData::SlicedVideo(s) => Some(s),
            _ => None,
        }
    }

    pub fn sliced_video_mut(&mut self) -> Option<&mut SlicedVideoFrame> {
        match &mut self.data {
            FrameData::SlicedVideo(s) => Some(s),
            _ => None,
        }
    }

    /// Copies metadata (pts, origin, duration, sequence) from another frame.
    /// Payload and consumed flag are left untouched.
    pub fn copy_metadata_from(&mut self, other: &Frame) {
        self.pts = other.pts;
        self.origin_ts = other.origin_ts;
        self.duration_ns = other.duration_ns;
        self.sequence = other.sequence;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_info::VideoCodec;

    fn coded_frame() -> Frame {
        Frame::new(FrameData::InterleavedVideo(VideoFrame::coded(
            VideoCodec::H264,
            64,
        )))
    }

    #[test]
    fn new_frame_has_zeroed_metadata() {
        let frame = coded_frame();
        assert_eq!(frame.pts(), 0);
        assert_eq!(frame.sequence(), 0);
        assert!(!frame.consumed());
        assert!(frame.is_empty());
    }

    #[test]
    fn refresh_origin_uses_wall_clock() {
        let mut frame = coded_frame();
        frame.refresh_origin();
        assert!(frame.origin_ts() > 0);
    }

    #[test]
    fn metadata_copy_leaves_payload_alone() {
        let mut a = coded_frame();
        let mut b = coded_frame();
        a.set_pts(42);
        a.set_sequence(7);
        a.set_duration_ns(1_000_000);
        b.video_mut().unwrap().write(&[1, 2, 3]);
        b.copy_metadata_from(&a);
        assert_eq!(b.pts(), 42);
        assert_eq!(b.sequence(), 7);
        assert_eq!(b.len(), 3);
    }
}
