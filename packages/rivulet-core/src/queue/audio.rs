//! Sample-granular circular buffer for planar audio.
//!
//! One byte ring per channel, all channels advancing in lockstep. Insertion
//! is timestamp-tracked: the logical timestamp of the byte at `front` is
//! `sync_ts + front_sample_idx / sample_rate`. Small positive deviations
//! between a pushed pts and the expected rear timestamp are reproduced as
//! silence; deviations beyond the configured threshold flush the ring and
//! resynchronize. Reads are served as fixed-size output frames once the
//! pre-roll threshold is reached.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::config::AudioRingConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{Frame, FrameData, PlanarAudioFrame};
use crate::queue::{ConnectionData, FilterId, FrameQueue, FrameRef, QueueState, ReaderData};
use crate::stream_info::{AudioCodec, AudioStreamInfo, StreamInfo};
use crate::utils::{micros_to_samples, now_micros, samples_to_micros};

struct RingData {
    channels: Vec<Vec<u8>>,
    rear: usize,
    front: usize,
    byte_counter: usize,
    synced: bool,
    sync_ts: u64,
    rear_sample_idx: u64,
    front_sample_idx: u64,
    state: QueueState,
    output_valid: bool,
    delivered: bool,
    discarded_samples: u64,
}

/// Planar audio [`FrameQueue`] with timestamp-aware insertion and
/// fixed-size output framing.
pub struct AudioCircularBuffer {
    cfg: AudioRingConfig,
    info: StreamInfo,
    channel_max_len: usize,
    buffering_threshold_bytes: usize,
    full_threshold_bytes: usize,
    inner: Mutex<RingData>,
    input: FrameRef,
    output: FrameRef,
    conn: Mutex<ConnectionData>,
    connected: AtomicBool,
}

impl AudioCircularBuffer {
    pub fn new(conn: ConnectionData, cfg: AudioRingConfig) -> PipelineResult<Self> {
        if !cfg.sample_format.is_planar() {
            return Err(PipelineError::UnsupportedFormat(
                "audio circular buffer is planar-only (U8P, S16P, FLTP)".into(),
            ));
        }
        if cfg.channels == 0 || cfg.sample_rate == 0 || cfg.ch_max_samples == 0 {
            return Err(PipelineError::InvalidParameter(
                "audio circular buffer needs channels, a rate and capacity".into(),
            ));
        }
        if cfg.output_frame_samples == 0 || cfg.output_frame_samples > cfg.ch_max_samples {
            return Err(PipelineError::InvalidParameter(
                "output frame size must fit the ring".into(),
            ));
        }
        let bps = cfg.sample_format.bytes_per_sample();
        let channel_max_len = cfg.ch_max_samples * bps;
        let buffering_threshold_bytes = cfg
            .channel_bytes_for_ms(cfg.buffering_ms)
            .min(channel_max_len / 2);
        let full_threshold_bytes = cfg
            .channel_bytes_for_ms(cfg.full_threshold_ms)
            .min(channel_max_len / 2);
        let info = StreamInfo::audio(AudioStreamInfo {
            codec: AudioCodec::Pcm,
            sample_rate: cfg.sample_rate,
            channels: cfg.channels,
            sample_format: cfg.sample_format,
        });
        let input = FrameRef::new(Mutex::new(Frame::new(FrameData::PlanarAudio(
            PlanarAudioFrame::new(
                AudioCodec::Pcm,
                cfg.channels,
                cfg.sample_rate,
                cfg.ch_max_samples,
                cfg.sample_format,
            ),
        ))));
        let output = FrameRef::new(Mutex::new(Frame::new(FrameData::PlanarAudio(
            PlanarAudioFrame::new(
                AudioCodec::Pcm,
                cfg.channels,
                cfg.sample_rate,
                cfg.output_frame_samples,
                cfg.sample_format,
            ),
        ))));
        Ok(Self {
            channel_max_len,
            buffering_threshold_bytes,
            full_threshold_bytes,
            inner: Mutex::new(RingData {
                channels: (0..cfg.channels).map(|_| vec![0; channel_max_len]).collect(),
                rear: 0,
                front: 0,
                byte_counter: 0,
                synced: false,
                sync_ts: 0,
                rear_sample_idx: 0,
                front_sample_idx: 0,
                state: QueueState::Buffering,
                output_valid: false,
                delivered: false,
                discarded_samples: 0,
            }),
            input,
            output,
            conn: Mutex::new(conn),
            connected: AtomicBool::new(false),
            cfg,
            info,
        })
    }

    #[must_use]
    pub fn config(&self) -> &AudioRingConfig {
        &self.cfg
    }

    /// Samples per channel that can be pushed without discarding.
    #[must_use]
    pub fn free_samples(&self) -> usize {
        let ring = self.inner.lock();
        self.free_samples_locked(&ring)
    }

    /// Samples discarded so far (overflow and resync drops).
    #[must_use]
    pub fn discarded_samples(&self) -> u64 {
        self.inner.lock().discarded_samples
    }

    /// Current synchronization timestamp (µs).
    #[must_use]
    pub fn sync_timestamp(&self) -> u64 {
        self.inner.lock().sync_ts
    }

    /// Copies out `samples` per channel if that much data is buffered.
    /// `out` must hold one slice per channel of exactly the right length.
    pub fn pop_front(&self, out: &mut [&mut [u8]], samples: usize) -> bool {
        let bps = self.cfg.sample_format.bytes_per_sample();
        let bytes = samples * bps;
        if out.len() != self.cfg.channels || out.iter().any(|o| o.len() != bytes) {
            return false;
        }
        let mut ring = self.inner.lock();
        if bytes > ring.byte_counter {
            return false;
        }
        for (channel, dst) in out.iter_mut().enumerate() {
            Self::copy_out(&ring.channels[channel], ring.front, dst);
        }
        self.consume_locked(&mut ring, samples);
        true
    }

    fn free_samples_locked(&self, ring: &RingData) -> usize {
        (self.channel_max_len - ring.byte_counter) / self.cfg.sample_format.bytes_per_sample()
    }

    /// Wrapping copy out of one channel ring.
    fn copy_out(channel: &[u8], front: usize, dst: &mut [u8]) {
        let len = channel.len();
        let end = front + dst.len();
        if end <= len {
            dst.copy_from_slice(&channel[front..end]);
        } else {
            let pivot = len - front;
            dst[..pivot].copy_from_slice(&channel[front..]);
            dst[pivot..].copy_from_slice(&channel[..end - len]);
        }
    }

    /// Wrapping copy into one channel ring.
    fn copy_in(channel: &mut [u8], rear: usize, src: &[u8]) {
        let len = channel.len();
        let end = rear + src.len();
        if end <= len {
            channel[rear..end].copy_from_slice(src);
        } else {
            let pivot = len - rear;
            channel[rear..].copy_from_slice(&src[..pivot]);
            channel[..end - len].copy_from_slice(&src[pivot..]);
        }
    }

    fn write_silence_locked(&self, ring: &mut RingData, samples: usize) {
        let bps = self.cfg.sample_format.bytes_per_sample();
        let bytes = samples * bps;
        if bytes == 0 {
            return;
        }
        let rear = ring.rear;
        let len = self.channel_max_len;
        for channel in &mut ring.channels {
            let end = rear + bytes;
            if end <= len {
                channel[rear..end].fill(0);
            } else {
                channel[rear..].fill(0);
                channel[..end - len].fill(0);
            }
        }
        self.advance_rear_locked(ring, samples);
    }

    fn advance_rear_locked(&self, ring: &mut RingData, samples: usize) {
        let bytes = samples * self.cfg.sample_format.bytes_per_sample();
        ring.rear = (ring.rear + bytes) % self.channel_max_len;
        ring.byte_counter += bytes;
        ring.rear_sample_idx += samples as u64;
    }

    fn consume_locked(&self, ring: &mut RingData, samples: usize) {
        let bytes = samples * self.cfg.sample_format.bytes_per_sample();
        ring.front = (ring.front + bytes) % self.channel_max_len;
        ring.byte_counter -= bytes;
        ring.front_sample_idx += samples as u64;
        if ring.byte_counter == 0 {
            ring.state = QueueState::Buffering;
        } else if ring.state == QueueState::Full
            && self.channel_max_len - ring.byte_counter > self.full_threshold_bytes
        {
            ring.state = QueueState::Ok;
        }
    }

    fn refresh_state_after_push(&self, ring: &mut RingData) {
        if self.channel_max_len - ring.byte_counter <= self.full_threshold_bytes {
            ring.state = QueueState::Full;
        } else if ring.state == QueueState::Buffering
            && ring.byte_counter >= self.buffering_threshold_bytes
        {
            log::debug!("[AudioBuffer] Pre-roll complete, serving reads");
            ring.state = QueueState::Ok;
        }
    }

    /// Timestamp-tracked insertion of the staged input frame.
    fn push_locked(&self, ring: &mut RingData, input: &PlanarAudioFrame, pts: u64) {
        let samples = input.samples();
        if samples == 0 {
            return;
        }

        if !ring.synced {
            ring.synced = true;
            ring.sync_ts = pts;
        } else {
            let expected =
                ring.sync_ts + samples_to_micros(ring.rear_sample_idx, self.cfg.sample_rate);
            let deviation = pts as i64 - expected as i64;
            if deviation.unsigned_abs() > self.cfg.ts_deviation_threshold_us {
                log::warn!(
                    "[AudioBuffer] pts deviates by {} µs (threshold {}), flushing and resyncing",
                    deviation,
                    self.cfg.ts_deviation_threshold_us
                );
                ring.discarded_samples +=
                    (ring.byte_counter / self.cfg.sample_format.bytes_per_sample()) as u64
                        + samples as u64;
                ring.rear = 0;
                ring.front = 0;
                ring.byte_counter = 0;
                ring.rear_sample_idx = 0;
                ring.front_sample_idx = 0;
                ring.sync_ts = pts;
                ring.state = QueueState::Buffering;
                ring.output_valid = false;
                return;
            }
            if deviation > 0 {
                // A short gap in the incoming timeline is reproduced as
                // silence so output framing stays aligned.
                let gap = micros_to_samples(deviation as u64, self.cfg.sample_rate) as usize;
                let fill = gap.min(self.free_samples_locked(ring));
                if fill < gap {
                    ring.discarded_samples += (gap - fill) as u64;
                }
                self.write_silence_locked(ring, fill);
            }
        }

        let free = self.free_samples_locked(ring);
        let to_write = samples.min(free);
        if to_write < samples {
            ring.discarded_samples += (samples - to_write) as u64;
            log::warn!(
                "[AudioBuffer] Not enough free space, discarding {} samples",
                samples - to_write
            );
        }
        if to_write > 0 {
            let bps = self.cfg.sample_format.bytes_per_sample();
            let rear = ring.rear;
            for (index, channel) in ring.channels.iter_mut().enumerate() {
                if let Some(src) = input.plane(index) {
                    Self::copy_in(channel, rear, &src[..to_write * bps]);
                }
            }
            self.advance_rear_locked(ring, to_write);
        }
        self.refresh_state_after_push(ring);
    }
}

impl FrameQueue for AudioCircularBuffer {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn get_rear(&self) -> Option<FrameRef> {
        // Overflow is handled by discarding at commit, not by backpressure.
        Some(self.input.clone())
    }

    fn force_get_rear(&self) -> FrameRef {
        self.input.clone()
    }

    fn add_frame(&self) -> Vec<FilterId> {
        {
            let mut input = self.input.lock();
            let pts = input.pts();
            // Lock order: input slot, then ring. No path locks the ring
            // before the input slot.
            let mut ring = self.inner.lock();
            if let Some(audio) = input.planar_audio() {
                self.push_locked(&mut ring, audio, pts);
            }
            drop(ring);
            input.set_consumed(false);
        }
        self.conn.lock().reader_filter_ids()
    }

    fn get_front(&self, _consumer: FilterId) -> Option<(FrameRef, bool)> {
        if !self.is_connected() {
            return None;
        }
        let mut ring = self.inner.lock();
        if ring.output_valid {
            return Some((self.output.clone(), false));
        }
        if ring.state == QueueState::Buffering {
            return None;
        }
        let samples = self.cfg.output_frame_samples;
        let bps = self.cfg.sample_format.bytes_per_sample();
        if samples * bps > ring.byte_counter {
            return None;
        }
        let pts = ring.sync_ts + samples_to_micros(ring.front_sample_idx, self.cfg.sample_rate);

        // Lock order: ring, then output slot. The consumer drops its frame
        // guard before calling back into the queue, so this cannot cycle.
        let mut output = self.output.lock();
        {
            let front = ring.front;
            if let Some(audio) = output.planar_audio_mut() {
                for channel in 0..self.cfg.channels {
                    let src = &ring.channels[channel];
                    if let Some(dst) = audio.plane_mut(channel) {
                        Self::copy_out(src, front, &mut dst[..samples * bps]);
                    }
                }
                audio.set_samples(samples);
            }
            output.set_pts(pts);
            output.set_origin_ts(now_micros());
            output.set_duration_ns(samples_to_micros(samples as u64, self.cfg.sample_rate) * 1000);
            output.set_consumed(false);
        }
        drop(output);
        self.consume_locked(&mut ring, samples);
        ring.output_valid = true;
        ring.delivered = true;
        Some((self.output.clone(), true))
    }

    fn force_get_front(&self, consumer: FilterId) -> Option<(FrameRef, bool)> {
        if let Some(found) = self.get_front(consumer) {
            return Some(found);
        }
        let ring = self.inner.lock();
        if !ring.delivered {
            return None;
        }
        log::debug!("[AudioBuffer] Not enough data, reusing previous frame");
        Some((self.output.clone(), false))
    }

    fn remove_frame(&self, _consumer: FilterId) {
        self.inner.lock().output_valid = false;
    }

    /// The ring is only cleared by a resync; an explicit flush is a no-op.
    fn flush(&self) {}

    fn elements(&self) -> usize {
        let ring = self.inner.lock();
        ring.byte_counter
            / (self.cfg.output_frame_samples * self.cfg.sample_format.bytes_per_sample())
    }

    fn capacity(&self) -> usize {
        self.cfg.ch_max_samples / self.cfg.output_frame_samples
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
        self.conn.lock().readers.retain(|r| r.filter_id != filter_id);
    }

    fn state(&self) -> QueueState {
        self.inner.lock().state
    }

    fn discarded(&self) -> u64 {
        self.inner.lock().discarded_samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_info::SampleFormat;

    const CONSUMER: FilterId = 2;

    /// 2 channels, 48 kHz, S16P, 80-sample output frames, no pre-roll.
    fn test_buffer() -> AudioCircularBuffer {
        let cfg = AudioRingConfig::new(2, 48000, SampleFormat::S16p)
            .with_capacity_samples(4800)
            .with_output_frame_samples(80)
            .with_deviation_threshold_us(50_000)
            .with_buffering_ms(0);
        let buffer = AudioCircularBuffer::new(ConnectionData::new(1, 1, CONSUMER, 1), cfg).unwrap();
        buffer.set_connected(true);
        buffer
    }

    /// Pushes `samples` samples whose left channel repeats `value` and
    /// right channel repeats `value + 1`.
    fn push(buffer: &AudioCircularBuffer, value: u8, samples: usize, pts: u64) {
        let left = vec![value; samples * 2];
        let right = vec![value + 1; samples * 2];
        let slot = buffer.get_rear().unwrap();
        {
            let mut frame = slot.lock();
            frame.set_pts(pts);
            assert!(frame
                .planar_audio_mut()
                .unwrap()
                .write_planes(&[&left, &right], samples));
            frame.set_consumed(true);
        }
        buffer.add_frame();
    }

    fn read_frame(buffer: &AudioCircularBuffer) -> Option<(u64, Vec<u8>, Vec<u8>)> {
        let (slot, new_frame) = buffer.get_front(CONSUMER)?;
        assert!(new_frame);
        let (pts, left, right) = {
            let frame = slot.lock();
            let audio = frame.planar_audio().unwrap();
            (
                frame.pts(),
                audio.plane(0).unwrap().to_vec(),
                audio.plane(1).unwrap().to_vec(),
            )
        };
        buffer.remove_frame(CONSUMER);
        Some((pts, left, right))
    }

    mod output_framing {
        use super::*;

        #[test]
        fn two_pushes_fill_one_output_frame() {
            let buffer = test_buffer();
            push(&buffer, 10, 40, 0);
            push(&buffer, 20, 40, 833);

            let (pts, left, right) = read_frame(&buffer).unwrap();
            assert_eq!(pts, 0);
            assert_eq!(left.len(), 160);
            assert_eq!(&left[..80], &[10u8; 80][..]);
            assert_eq!(&left[80..], &[20u8; 80][..]);
            assert_eq!(&right[..80], &[11u8; 80][..]);

            assert_eq!(buffer.elements(), 0, "buffer must be empty after removal");
            assert!(buffer.get_front(CONSUMER).is_none());
        }

        #[test]
        fn output_pts_advances_by_frame_duration() {
            let buffer = test_buffer();
            for i in 0..4u64 {
                push(&buffer, i as u8, 40, samples_to_micros(i * 40, 48000));
            }
            let (pts_a, _, _) = read_frame(&buffer).unwrap();
            let (pts_b, _, _) = read_frame(&buffer).unwrap();
            assert_eq!(pts_a, 0);
            // 80 samples at 48 kHz
            assert_eq!(pts_b, 1666);
        }

        #[test]
        fn partial_frame_is_not_served() {
            let buffer = test_buffer();
            push(&buffer, 1, 40, 0);
            assert!(buffer.get_front(CONSUMER).is_none());
        }
    }

    mod gap_fill {
        use super::*;

        #[test]
        fn short_gap_becomes_silence() {
            let buffer = test_buffer();
            push(&buffer, 10, 40, 0);
            // 80-sample hole between the two pushes: the first frame ends
            // at 833 µs, the second starts 1667 µs later.
            push(&buffer, 20, 40, 2500);

            let (pts, left, _) = read_frame(&buffer).unwrap();
            assert_eq!(pts, 0);
            assert_eq!(&left[..80], &[10u8; 80][..], "first input's samples");
            assert_eq!(&left[80..], &[0u8; 80][..], "gap must be silence");

            let (_, left, _) = read_frame(&buffer).unwrap();
            assert_eq!(&left[..80], &[0u8; 80][..], "gap tail is silence");
            assert_eq!(&left[80..], &[20u8; 80][..], "second input's samples");
        }
    }

    mod resync {
        use super::*;

        #[test]
        fn large_deviation_flushes_and_resyncs() {
            let buffer = test_buffer();
            push(&buffer, 10, 40, 0);
            // Way beyond the 50 ms threshold.
            push(&buffer, 20, 40, 1_000_000);

            assert_eq!(buffer.elements(), 0, "resync must leave the buffer empty");
            assert_eq!(buffer.sync_timestamp(), 1_000_000);
            assert_eq!(buffer.state(), QueueState::Buffering);
            assert!(buffer.discarded_samples() >= 80);
        }

        #[test]
        fn pushes_after_resync_are_accepted() {
            let buffer = test_buffer();
            push(&buffer, 1, 40, 0);
            push(&buffer, 2, 40, 1_000_000);
            push(&buffer, 3, 40, 1_000_000);
            push(&buffer, 4, 40, 1_000_000 + 833);
            let (pts, left, _) = read_frame(&buffer).unwrap();
            assert_eq!(pts, 1_000_000);
            assert_eq!(&left[..80], &[3u8; 80][..]);
            assert_eq!(&left[80..], &[4u8; 80][..]);
        }
    }

    mod round_trip {
        use super::*;

        #[test]
        fn pop_front_reproduces_pushed_bytes() {
            let buffer = test_buffer();
            let mut expected_left = Vec::new();
            for (i, samples) in [40usize, 25, 55].iter().enumerate() {
                let pts = samples_to_micros(expected_left.len() as u64 / 2, 48000);
                push(&buffer, (i + 1) as u8 * 10, *samples, pts);
                expected_left.extend(std::iter::repeat((i + 1) as u8 * 10).take(samples * 2));
            }

            let total = 120usize;
            let mut left = vec![0u8; total * 2];
            let mut right = vec![0u8; total * 2];
            {
                let mut out: Vec<&mut [u8]> = vec![left.as_mut_slice(), right.as_mut_slice()];
                assert!(buffer.pop_front(&mut out, total));
            }
            assert_eq!(left, expected_left);
        }

        #[test]
        fn pop_front_fails_without_enough_data() {
            let buffer = test_buffer();
            push(&buffer, 1, 40, 0);
            let mut left = vec![0u8; 200];
            let mut right = vec![0u8; 200];
            let mut out: Vec<&mut [u8]> = vec![left.as_mut_slice(), right.as_mut_slice()];
            assert!(!buffer.pop_front(&mut out, 100));
        }
    }

    mod buffering_and_overflow {
        use super::*;

        #[test]
        fn pre_roll_holds_reads_until_threshold() {
            let cfg = AudioRingConfig::new(1, 48000, SampleFormat::S16p)
                .with_capacity_samples(960)
                .with_output_frame_samples(48)
                .with_buffering_ms(5); // 240 samples
            let buffer =
                AudioCircularBuffer::new(ConnectionData::new(1, 1, CONSUMER, 1), cfg).unwrap();
            buffer.set_connected(true);

            push_mono(&buffer, 1, 100, 0);
            assert_eq!(buffer.state(), QueueState::Buffering);
            assert!(buffer.get_front(CONSUMER).is_none());

            push_mono(&buffer, 2, 200, samples_to_micros(100, 48000));
            assert_eq!(buffer.state(), QueueState::Ok);
            assert!(buffer.get_front(CONSUMER).is_some());
        }

        #[test]
        fn overflow_discards_excess_samples() {
            let cfg = AudioRingConfig::new(1, 48000, SampleFormat::S16p)
                .with_capacity_samples(100)
                .with_output_frame_samples(10)
                .with_buffering_ms(0);
            let buffer =
                AudioCircularBuffer::new(ConnectionData::new(1, 1, CONSUMER, 1), cfg).unwrap();
            buffer.set_connected(true);

            push_mono(&buffer, 1, 80, 0);
            push_mono(&buffer, 2, 80, samples_to_micros(80, 48000));
            assert_eq!(buffer.discarded_samples(), 60);
            assert_eq!(buffer.free_samples(), 0);
            assert_eq!(buffer.state(), QueueState::Full);
        }

        fn push_mono(buffer: &AudioCircularBuffer, value: u8, samples: usize, pts: u64) {
            let data = vec![value; samples * 2];
            let slot = buffer.get_rear().unwrap();
            {
                let mut frame = slot.lock();
                frame.set_pts(pts);
                assert!(frame.planar_audio_mut().unwrap().write_planes(&[&data], samples));
                frame.set_consumed(true);
            }
            buffer.add_frame();
        }
    }

    mod duplicate_front {
        use super::*;

        #[test]
        fn force_front_reuses_previous_output() {
            let buffer = test_buffer();
            push(&buffer, 10, 80, 0);
            let (pts, _, _) = read_frame(&buffer).unwrap();
            assert_eq!(pts, 0);

            // Drained: a forced read duplicates the last delivered frame.
            let (slot, new_frame) = buffer.force_get_front(CONSUMER).unwrap();
            assert!(!new_frame);
            assert_eq!(slot.lock().pts(), 0);
        }

        #[test]
        fn force_front_on_fresh_buffer_is_none() {
            let buffer = test_buffer();
            assert!(buffer.force_get_front(CONSUMER).is_none());
        }
    }
}
