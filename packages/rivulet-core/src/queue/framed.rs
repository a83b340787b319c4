//! Ring-buffer queue for discrete A/V frames.
//!
//! `M` slots are allocated up front from the negotiated [`StreamInfo`] and
//! reused for the queue's whole life. The producer fills the rear slot and
//! commits it; consumers observe the front slot and acknowledge it. A
//! minimum-delay gate can hold frames back so downstream filters are fed
//! pre-buffered content at the right pace.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::QueueConfig;
use crate::constants::{CODED_AUDIO_SLOT_LEN, CODED_VIDEO_SLOT_LEN, RAW_AUDIO_FRAME_MS};
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{Frame, FrameData, InterleavedAudioFrame, PlanarAudioFrame, VideoFrame};
use crate::queue::{ConnectionData, FilterId, FrameQueue, FrameRef, QueueState, ReaderData};
use crate::stream_info::{StreamInfo, StreamParams, VideoCodec};
use crate::utils::now_micros;

/// Ring indices and per-sharer front bookkeeping.
///
/// Invariant: `rear == (front + elements) % capacity`. `seen` and `acked`
/// refer to the slot currently at `front` and are cleared whenever the
/// front advances.
struct Ring {
    rear: usize,
    front: usize,
    elements: usize,
    seen: HashSet<FilterId>,
    acked: HashSet<FilterId>,
    /// True once at least one frame was delivered and released, making the
    /// slot behind `front` valid for duplicate reads.
    delivered: bool,
}

/// Concrete ring-buffer [`FrameQueue`] for discrete frames.
pub struct FramedQueue {
    info: StreamInfo,
    delay_us: u64,
    slots: Vec<FrameRef>,
    ring: Mutex<Ring>,
    conn: Mutex<ConnectionData>,
    connected: AtomicBool,
    discarded: AtomicU64,
}

impl FramedQueue {
    /// Builds a queue sized by `config`, with slot payloads derived from
    /// the stream description.
    pub fn new(
        conn: ConnectionData,
        info: StreamInfo,
        config: QueueConfig,
    ) -> PipelineResult<Self> {
        if config.slots == 0 {
            return Err(PipelineError::InvalidParameter(
                "queue capacity must be >= 1".into(),
            ));
        }
        let mut frames = Vec::with_capacity(config.slots);
        for _ in 0..config.slots {
            frames.push(make_slot_frame(&info)?);
        }
        Ok(Self::with_frames(conn, info, frames, config.delay_ms))
    }

    /// Builds a queue around caller-provided slot frames. Used by the
    /// sliced adaptor and by tests that need custom payload sizes.
    #[must_use]
    pub fn with_frames(
        conn: ConnectionData,
        info: StreamInfo,
        frames: Vec<Frame>,
        delay_ms: u64,
    ) -> Self {
        let slots = frames
            .into_iter()
            .map(|f| FrameRef::new(Mutex::new(f)))
            .collect();
        Self {
            info,
            delay_us: delay_ms * 1000,
            slots,
            ring: Mutex::new(Ring {
                rear: 0,
                front: 0,
                elements: 0,
                seen: HashSet::new(),
                acked: HashSet::new(),
                delivered: false,
            }),
            conn: Mutex::new(conn),
            connected: AtomicBool::new(false),
            discarded: AtomicU64::new(0),
        }
    }

    /// Advances the front when every attached sharer has acknowledged it.
    /// Caller holds the ring lock; `sharers` is the current attached set.
    fn try_advance(&self, ring: &mut Ring, sharers: &[FilterId]) {
        if ring.elements == 0 {
            return;
        }
        if sharers.iter().all(|id| ring.acked.contains(id)) {
            ring.front = (ring.front + 1) % self.slots.len();
            ring.elements -= 1;
            ring.seen.clear();
            ring.acked.clear();
            ring.delivered = true;
        }
    }

    fn sharer_ids(&self) -> Vec<FilterId> {
        self.conn.lock().reader_filter_ids()
    }
}

impl FrameQueue for FramedQueue {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn get_rear(&self) -> Option<FrameRef> {
        let ring = self.ring.lock();
        if ring.elements >= self.slots.len() {
            return None;
        }
        Some(self.slots[ring.rear].clone())
    }

    fn force_get_rear(&self) -> FrameRef {
        let needs_room = {
            let ring = self.ring.lock();
            // A forced producer keeps one slot of headroom: with one free
            // slot or fewer, exactly one front frame is dropped.
            ring.elements > 0 && ring.elements + 1 >= self.slots.len()
        };
        if needs_room {
            log::debug!("[Queue] Frame discarded by forced rear");
            self.flush();
        }
        let ring = self.ring.lock();
        self.slots[ring.rear].clone()
    }

    fn add_frame(&self) -> Vec<FilterId> {
        {
            let mut ring = self.ring.lock();
            debug_assert!(ring.elements < self.slots.len());
            ring.rear = (ring.rear + 1) % self.slots.len();
            ring.elements += 1;
        }
        self.sharer_ids()
    }

    fn get_front(&self, consumer: FilterId) -> Option<(FrameRef, bool)> {
        if !self.is_connected() {
            return None;
        }
        let mut ring = self.ring.lock();
        if ring.elements == 0 {
            return None;
        }
        let slot = self.slots[ring.front].clone();
        if self.delay_us > 0 {
            // Lock order: ring state, then slot. Safe because slot guards
            // are never held across queue index operations.
            let origin = slot.lock().origin_ts();
            if now_micros().saturating_sub(origin) <= self.delay_us {
                return None;
            }
        }
        let new_frame = ring.seen.insert(consumer);
        Some((slot, new_frame))
    }

    fn force_get_front(&self, consumer: FilterId) -> Option<(FrameRef, bool)> {
        if let Some(found) = self.get_front(consumer) {
            return Some(found);
        }
        let ring = self.ring.lock();
        if !ring.delivered {
            return None;
        }
        let oldie = (ring.front + self.slots.len() - 1) % self.slots.len();
        Some((self.slots[oldie].clone(), false))
    }

    fn remove_frame(&self, consumer: FilterId) {
        let sharers = self.sharer_ids();
        let mut ring = self.ring.lock();
        if ring.elements == 0 {
            return;
        }
        ring.acked.insert(consumer);
        self.try_advance(&mut ring, &sharers);
    }

    fn flush(&self) {
        let mut ring = self.ring.lock();
        if ring.elements == 0 {
            return;
        }
        ring.front = (ring.front + 1) % self.slots.len();
        ring.elements -= 1;
        ring.seen.clear();
        ring.acked.clear();
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn elements(&self) -> usize {
        self.ring.lock().elements
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    fn connection(&self) -> ConnectionData {
        self.conn.lock().clone()
    }

    fn add_sharer(&self, reader: ReaderData) {
        let mut conn = self.conn.lock();
        if conn.readers.iter().any(|r| r.filter_id == reader.filter_id) {
            return;
        }
        conn.readers.push(reader);
    }

    fn remove_sharer(&self, filter_id: FilterId) {
        let sharers = {
            let mut conn = self.conn.lock();
            conn.readers.retain(|r| r.filter_id != filter_id);
            conn.reader_filter_ids()
        };
        if sharers.is_empty() {
            return;
        }
        // The leaver may have been the last missing acknowledgement.
        let mut ring = self.ring.lock();
        self.try_advance(&mut ring, &sharers);
    }

    fn state(&self) -> QueueState {
        let ring = self.ring.lock();
        if ring.elements == 0 {
            QueueState::Buffering
        } else if ring.elements == self.slots.len() {
            QueueState::Full
        } else {
            QueueState::Ok
        }
    }

    fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

/// Allocates one slot payload for the given stream description.
pub(crate) fn make_slot_frame(info: &StreamInfo) -> PipelineResult<Frame> {
    let data = match &info.params {
        StreamParams::Video(v) => match v.codec {
            VideoCodec::Raw => {
                let pix = v.pixel_format.ok_or_else(|| {
                    PipelineError::UnsupportedFormat(
                        "raw video needs a pixel format and geometry".into(),
                    )
                })?;
                if v.width == 0 || v.height == 0 {
                    return Err(PipelineError::UnsupportedFormat(
                        "raw video needs a non-zero geometry".into(),
                    ));
                }
                FrameData::InterleavedVideo(VideoFrame::raw(pix, v.width, v.height))
            }
            codec => FrameData::InterleavedVideo(VideoFrame::coded(codec, CODED_VIDEO_SLOT_LEN)),
        },
        StreamParams::Audio(a) => {
            if a.channels == 0 || a.sample_rate == 0 {
                return Err(PipelineError::UnsupportedFormat(
                    "audio needs channels and a sample rate".into(),
                ));
            }
            let raw = matches!(
                a.codec,
                crate::stream_info::AudioCodec::Pcm
                    | crate::stream_info::AudioCodec::Pcmu
                    | crate::stream_info::AudioCodec::G711
            );
            let max_samples = if raw {
                (a.sample_rate as u64 * RAW_AUDIO_FRAME_MS / 1000) as usize
            } else {
                CODED_AUDIO_SLOT_LEN / (a.channels * a.sample_format.bytes_per_sample()).max(1)
            };
            if a.sample_format.is_planar() {
                FrameData::PlanarAudio(PlanarAudioFrame::new(
                    a.codec,
                    a.channels,
                    a.sample_rate,
                    max_samples,
                    a.sample_format,
                ))
            } else {
                FrameData::InterleavedAudio(InterleavedAudioFrame::new(
                    a.codec,
                    a.channels,
                    a.sample_rate,
                    max_samples,
                    a.sample_format,
                ))
            }
        }
    };
    Ok(Frame::new(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_info::VideoStreamInfo;

    fn h264_info() -> StreamInfo {
        StreamInfo::video(VideoStreamInfo {
            codec: VideoCodec::H264,
            pixel_format: None,
            width: 0,
            height: 0,
            annexb: false,
        })
    }

    const CONSUMER: FilterId = 2;

    fn test_queue(capacity: usize, delay_ms: u64) -> FramedQueue {
        let frames = (0..capacity)
            .map(|_| {
                Frame::new(FrameData::InterleavedVideo(VideoFrame::coded(
                    VideoCodec::H264,
                    16,
                )))
            })
            .collect();
        let queue = FramedQueue::with_frames(
            ConnectionData::new(1, 1, CONSUMER, 1),
            h264_info(),
            frames,
            delay_ms,
        );
        queue.set_connected(true);
        queue
    }

    fn push(queue: &FramedQueue, seq: u64) -> bool {
        let Some(slot) = queue.get_rear() else {
            return false;
        };
        {
            let mut frame = slot.lock();
            frame.video_mut().unwrap().write(&[seq as u8]);
            frame.set_sequence(seq);
            frame.set_consumed(true);
        }
        queue.add_frame();
        true
    }

    fn pop(queue: &FramedQueue) -> Option<u64> {
        let (slot, _) = queue.get_front(CONSUMER)?;
        let seq = slot.lock().sequence();
        queue.remove_frame(CONSUMER);
        Some(seq)
    }

    mod ring_behavior {
        use super::*;

        #[test]
        fn fifo_and_backpressure_at_capacity() {
            let queue = test_queue(4, 0);

            for seq in 0..3 {
                assert!(push(&queue, seq));
            }
            assert_eq!(queue.elements(), 3);
            assert!(queue.get_rear().is_some());

            assert!(push(&queue, 3));
            assert!(queue.get_rear().is_none(), "full queue must backpressure");

            assert_eq!(pop(&queue), Some(0));
            assert_eq!(pop(&queue), Some(1));
            assert_eq!(pop(&queue), Some(2));
            assert_eq!(pop(&queue), Some(3));
            assert_eq!(pop(&queue), None);
        }

        #[test]
        fn invariant_holds_after_each_operation() {
            let queue = test_queue(4, 0);
            for round in 0..10u64 {
                push(&queue, round);
                if round % 3 == 0 {
                    pop(&queue);
                }
                assert!(queue.elements() <= queue.capacity());
            }
        }

        #[test]
        fn wake_list_carries_consumer_filter_ids() {
            let queue = test_queue(2, 0);
            let slot = queue.get_rear().unwrap();
            slot.lock().set_consumed(true);
            assert_eq!(queue.add_frame(), vec![CONSUMER]);
        }
    }

    mod forced_rear {
        use super::*;

        #[test]
        fn forced_rear_drops_oldest() {
            let queue = test_queue(4, 0);
            for seq in 0..3 {
                assert!(push(&queue, seq));
            }

            let slot = queue.force_get_rear();
            {
                let mut frame = slot.lock();
                frame.set_sequence(3);
                frame.set_consumed(true);
            }
            queue.add_frame();

            assert_eq!(queue.elements(), 3, "one frame must have been dropped");
            assert_eq!(queue.discarded(), 1);
            assert_eq!(pop(&queue), Some(1));
            assert_eq!(pop(&queue), Some(2));
            assert_eq!(pop(&queue), Some(3));
            assert_eq!(pop(&queue), None);
        }

        #[test]
        fn forced_rear_never_fails_even_on_tiny_queue() {
            let queue = test_queue(1, 0);
            for seq in 0..5 {
                let slot = queue.force_get_rear();
                slot.lock().set_sequence(seq);
                queue.add_frame();
            }
            assert_eq!(queue.elements(), 1);
            assert_eq!(queue.discarded(), 4);
            assert_eq!(pop(&queue), Some(4));
        }
    }

    mod delay_gate {
        use super::*;

        #[test]
        fn fresh_frame_is_held_back() {
            let queue = test_queue(4, 50);
            let slot = queue.get_rear().unwrap();
            {
                let mut frame = slot.lock();
                frame.set_origin_ts(now_micros());
                frame.set_consumed(true);
            }
            queue.add_frame();
            assert!(queue.get_front(CONSUMER).is_none());
        }

        #[test]
        fn aged_frame_passes_the_gate() {
            let queue = test_queue(4, 50);
            let slot = queue.get_rear().unwrap();
            {
                let mut frame = slot.lock();
                frame.set_origin_ts(now_micros() - 100_000);
                frame.set_consumed(true);
            }
            queue.add_frame();
            assert!(queue.get_front(CONSUMER).is_some());
        }
    }

    mod duplicate_front {
        use super::*;

        #[test]
        fn empty_fresh_queue_has_nothing_to_duplicate() {
            let queue = test_queue(4, 0);
            assert!(queue.force_get_front(CONSUMER).is_none());
        }

        #[test]
        fn drained_queue_duplicates_last_delivered() {
            let queue = test_queue(4, 0);
            push(&queue, 9);
            assert_eq!(pop(&queue), Some(9));

            let (slot, new_frame) = queue.force_get_front(CONSUMER).unwrap();
            assert!(!new_frame);
            assert_eq!(slot.lock().sequence(), 9);
        }
    }

    mod reader_sharing {
        use super::*;

        const OTHER: FilterId = 3;

        fn shared_queue() -> FramedQueue {
            let queue = test_queue(4, 0);
            queue.add_sharer(ReaderData {
                filter_id: OTHER,
                reader_id: 7,
            });
            queue
        }

        #[test]
        fn front_advances_only_after_all_sharers_ack() {
            let queue = shared_queue();
            push(&queue, 0);
            push(&queue, 1);

            let (_, new_a) = queue.get_front(CONSUMER).unwrap();
            assert!(new_a);
            queue.remove_frame(CONSUMER);
            assert_eq!(queue.elements(), 2, "one ack must not advance");

            let (slot, new_b) = queue.get_front(OTHER).unwrap();
            assert!(new_b);
            assert_eq!(slot.lock().sequence(), 0);
            queue.remove_frame(OTHER);
            assert_eq!(queue.elements(), 1, "second ack advances");
        }

        #[test]
        fn new_flag_is_per_sharer_per_slot() {
            let queue = shared_queue();
            push(&queue, 0);

            let (_, first) = queue.get_front(CONSUMER).unwrap();
            let (_, second) = queue.get_front(CONSUMER).unwrap();
            assert!(first);
            assert!(!second);

            let (_, other_first) = queue.get_front(OTHER).unwrap();
            assert!(other_first);
        }

        #[test]
        fn leaving_sharer_unblocks_the_front() {
            let queue = shared_queue();
            push(&queue, 0);
            queue.get_front(CONSUMER);
            queue.remove_frame(CONSUMER);
            assert_eq!(queue.elements(), 1);

            queue.remove_sharer(OTHER);
            assert_eq!(queue.elements(), 0, "leaver was the last blocker");
        }
    }

    mod connection_gate {
        use super::*;

        #[test]
        fn disconnected_queue_is_unreadable() {
            let queue = test_queue(4, 0);
            push(&queue, 0);
            queue.set_connected(false);
            assert!(queue.get_front(CONSUMER).is_none());
        }
    }

    mod slot_allocation {
        use super::*;
        use crate::stream_info::{AudioCodec, AudioStreamInfo, PixelFormat, SampleFormat};

        #[test]
        fn raw_video_without_pixel_format_is_rejected() {
            let info = StreamInfo::video(VideoStreamInfo {
                codec: VideoCodec::Raw,
                pixel_format: None,
                width: 16,
                height: 16,
                annexb: false,
            });
            assert!(make_slot_frame(&info).is_err());
        }

        #[test]
        fn raw_video_slot_matches_geometry() {
            let info = StreamInfo::video(VideoStreamInfo {
                codec: VideoCodec::Raw,
                pixel_format: Some(PixelFormat::Rgb24),
                width: 8,
                height: 4,
                annexb: false,
            });
            let frame = make_slot_frame(&info).unwrap();
            assert_eq!(frame.max_len(), 96);
        }

        #[test]
        fn planar_audio_gets_planar_slots() {
            let info = StreamInfo::audio(AudioStreamInfo {
                codec: AudioCodec::Pcm,
                sample_rate: 48000,
                channels: 2,
                sample_format: SampleFormat::S16p,
            });
            let frame = make_slot_frame(&info).unwrap();
            assert!(frame.planar_audio().is_some());
            // 100 ms at 48 kHz
            assert_eq!(frame.planar_audio().unwrap().max_samples(), 4800);
        }
    }
}
