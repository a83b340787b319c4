//! Write-side adaptor fanning encoder slice groups into per-NAL frames.
//!
//! Encoders produce a set of NAL-unit slices per picture; transport and
//! packetization downstream want one NAL per queue slot. The producer fills
//! one [`SlicedVideoFrame`] staging container; committing it copies every
//! slice into a distinct slot of the wrapped [`FramedQueue`], propagating
//! the container's timing, sequence number and geometry. When a picture
//! carries more slices than there is room, the oldest frames in the inner
//! ring are discarded so the newest slices survive.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::constants::MAX_SLICES;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{Frame, FrameData, SlicedVideoFrame, VideoFrame};
use crate::queue::{
    ConnectionData, FilterId, FrameQueue, FramedQueue, FrameRef, QueueState, ReaderData,
};
use crate::stream_info::{StreamInfo, VideoCodec};

/// [`FrameQueue`] accepting sliced composite frames on the write side and
/// exposing each slice as an independent downstream frame.
pub struct SlicedVideoQueue {
    inner: FramedQueue,
    staging: FrameRef,
    max_slice_size: usize,
    rejected: AtomicU64,
}

impl SlicedVideoQueue {
    /// Builds the adaptor around an inner ring of `slots` frames of
    /// `max_slice_size` bytes each.
    pub fn new(
        conn: ConnectionData,
        info: StreamInfo,
        slots: usize,
        max_slice_size: usize,
        delay_ms: u64,
    ) -> PipelineResult<Self> {
        if slots == 0 || max_slice_size == 0 {
            return Err(PipelineError::InvalidParameter(
                "sliced queue needs slots and a slice size".into(),
            ));
        }
        let codec = info
            .video_params()
            .map(|v| v.codec)
            .ok_or_else(|| PipelineError::UnsupportedFormat("sliced queue is video-only".into()))?;
        if codec == VideoCodec::Raw {
            return Err(PipelineError::UnsupportedFormat(
                "sliced queue carries coded video".into(),
            ));
        }
        let frames = (0..slots)
            .map(|_| Frame::new(FrameData::InterleavedVideo(VideoFrame::coded(codec, max_slice_size))))
            .collect();
        let inner = FramedQueue::with_frames(conn, info, frames, delay_ms);
        let staging = FrameRef::new(Mutex::new(Frame::new(FrameData::SlicedVideo(
            SlicedVideoFrame::new(codec, MAX_SLICES * max_slice_size),
        ))));
        Ok(Self {
            inner,
            staging,
            max_slice_size,
            rejected: AtomicU64::new(0),
        })
    }

    /// Slices rejected at write because they exceeded the slot size.
    #[must_use]
    pub fn rejected_slices(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl FrameQueue for SlicedVideoQueue {
    fn stream_info(&self) -> &StreamInfo {
        self.inner.stream_info()
    }

    fn get_rear(&self) -> Option<FrameRef> {
        // The container is handed out as long as the inner ring is not
        // completely full; committing makes room by discarding the oldest.
        if self.inner.elements() >= self.inner.capacity() {
            return None;
        }
        Some(self.staging.clone())
    }

    fn force_get_rear(&self) -> FrameRef {
        self.staging.clone()
    }

    fn add_frame(&self) -> Vec<FilterId> {
        let mut staging = self.staging.lock();
        let pts = staging.pts();
        let origin = staging.origin_ts();
        let duration = staging.duration_ns();
        let sequence = staging.sequence();
        let (width, height, slice_count) = match staging.sliced_video() {
            Some(s) => (s.width(), s.height(), s.slice_count()),
            None => (0, 0, 0),
        };

        for index in 0..slice_count {
            let Some(sliced) = staging.sliced_video() else {
                break;
            };
            let Some(payload) = sliced.slice(index) else {
                continue;
            };
            if payload.len() > self.max_slice_size {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "[Queue] Slice of {} bytes exceeds slot size {}, rejected",
                    payload.len(),
                    self.max_slice_size
                );
                continue;
            }
            let slot = self.inner.force_get_rear();
            {
                let mut frame = slot.lock();
                frame.set_pts(pts);
                frame.set_origin_ts(origin);
                frame.set_duration_ns(duration);
                frame.set_sequence(sequence);
                frame.set_consumed(true);
                if let Some(video) = frame.video_mut() {
                    video.write(payload);
                    video.set_geometry(width, height);
                }
            }
            self.inner.add_frame();
        }

        if let Some(sliced) = staging.sliced_video_mut() {
            sliced.clear();
        }
        staging.set_consumed(false);
        drop(staging);

        self.inner.connection().reader_filter_ids()
    }

    fn get_front(&self, consumer: FilterId) -> Option<(FrameRef, bool)> {
        self.inner.get_front(consumer)
    }

    fn force_get_front(&self, consumer: FilterId) -> Option<(FrameRef, bool)> {
        self.inner.force_get_front(consumer)
    }

    fn remove_frame(&self, consumer: FilterId) {
        self.inner.remove_frame(consumer);
    }

    fn flush(&self) {
        self.inner.flush();
    }

    fn elements(&self) -> usize {
        self.inner.elements()
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn set_connected(&self, connected: bool) {
        self.inner.set_connected(connected);
    }

    fn connection(&self) -> ConnectionData {
        self.inner.connection()
    }

    fn add_sharer(&self, reader: ReaderData) {
        self.inner.add_sharer(reader);
    }

    fn remove_sharer(&self, filter_id: FilterId) {
        self.inner.remove_sharer(filter_id);
    }

    fn state(&self) -> QueueState {
        self.inner.state()
    }

    fn discarded(&self) -> u64 {
        self.inner.discarded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_info::VideoStreamInfo;

    const CONSUMER: FilterId = 2;

    fn test_queue(slots: usize, max_slice_size: usize) -> SlicedVideoQueue {
        let info = StreamInfo::video(VideoStreamInfo {
            codec: VideoCodec::H264,
            pixel_format: None,
            width: 640,
            height: 480,
            annexb: false,
        });
        let queue = SlicedVideoQueue::new(
            ConnectionData::new(1, 1, CONSUMER, 1),
            info,
            slots,
            max_slice_size,
            0,
        )
        .unwrap();
        queue.set_connected(true);
        queue
    }

    fn commit_picture(queue: &SlicedVideoQueue, pts: u64, seq: u64, slices: &[&[u8]]) {
        let container = queue.get_rear().expect("container should be available");
        {
            let mut frame = container.lock();
            frame.set_pts(pts);
            frame.set_sequence(seq);
            frame.set_origin_ts(42);
            let sliced = frame.sliced_video_mut().unwrap();
            sliced.set_geometry(640, 480);
            for slice in slices {
                assert!(sliced.push_slice(slice));
            }
            frame.set_consumed(true);
        }
        queue.add_frame();
    }

    fn pop_payload(queue: &SlicedVideoQueue) -> Option<(Vec<u8>, u64, u64)> {
        let (slot, _) = queue.get_front(CONSUMER)?;
        let (payload, pts, seq) = {
            let frame = slot.lock();
            (
                frame.video().unwrap().payload().to_vec(),
                frame.pts(),
                frame.sequence(),
            )
        };
        queue.remove_frame(CONSUMER);
        Some((payload, pts, seq))
    }

    #[test]
    fn slices_fan_out_as_independent_frames() {
        let queue = test_queue(4, 16);
        commit_picture(&queue, 90_000, 7, &[&[0xAA], &[0xBB]]);

        assert_eq!(queue.elements(), 2);

        let (first, pts_a, seq_a) = pop_payload(&queue).unwrap();
        let (second, pts_b, seq_b) = pop_payload(&queue).unwrap();
        assert_eq!(first, vec![0xAA]);
        assert_eq!(second, vec![0xBB]);
        assert_eq!((pts_a, seq_a), (90_000, 7));
        assert_eq!((pts_b, seq_b), (90_000, 7));
        assert!(pop_payload(&queue).is_none());
    }

    #[test]
    fn geometry_propagates_to_every_slice() {
        let queue = test_queue(4, 16);
        commit_picture(&queue, 0, 0, &[&[1u8]]);
        let (slot, _) = queue.get_front(CONSUMER).unwrap();
        let frame = slot.lock();
        let video = frame.video().unwrap();
        assert_eq!((video.width(), video.height()), (640, 480));
    }

    #[test]
    fn container_clears_after_commit() {
        let queue = test_queue(4, 16);
        commit_picture(&queue, 0, 0, &[&[1u8], &[2u8]]);
        let container = queue.get_rear().unwrap();
        let frame = container.lock();
        assert_eq!(frame.sliced_video().unwrap().slice_count(), 0);
        assert!(!frame.consumed());
    }

    #[test]
    fn overflow_preserves_newest_slices() {
        let queue = test_queue(4, 16);
        commit_picture(&queue, 0, 0, &[&[0u8], &[1u8], &[2u8]]);
        // Second picture of three slices overflows the ring; oldest inner
        // frames must be flushed to make room for the newest slices.
        commit_picture(&queue, 100, 1, &[&[3u8], &[4u8], &[5u8]]);

        assert!(queue.discarded() > 0);
        let mut tail = Vec::new();
        while let Some((payload, _, _)) = pop_payload(&queue) {
            tail.push(payload[0]);
        }
        assert_eq!(
            tail.last().copied(),
            Some(5),
            "newest slice must survive overflow"
        );
        assert!(tail.contains(&4));
    }

    #[test]
    fn oversized_slices_are_rejected_at_write() {
        let queue = test_queue(4, 2);
        commit_picture(&queue, 0, 0, &[&[0u8; 3], &[1u8]]);
        assert_eq!(queue.rejected_slices(), 1);
        assert_eq!(queue.elements(), 1);
        let (payload, _, _) = pop_payload(&queue).unwrap();
        assert_eq!(payload, vec![1u8]);
    }

    #[test]
    fn audio_stream_info_is_rejected() {
        use crate::stream_info::{AudioCodec, AudioStreamInfo, SampleFormat};
        let info = StreamInfo::audio(AudioStreamInfo {
            codec: AudioCodec::Pcm,
            sample_rate: 48000,
            channels: 2,
            sample_format: SampleFormat::S16,
        });
        assert!(SlicedVideoQueue::new(ConnectionData::new(1, 1, 2, 1), info, 4, 16, 0).is_err());
    }
}
