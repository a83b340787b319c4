//! Sizing and pacing configuration.
//!
//! Queues are agnostic about codecs; the policy of how many slots a
//! connection gets and how large they are lives here, derived from the
//! negotiated [`StreamInfo`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    AUDIO_BUFFERING_MS, AUDIO_FULL_THRESHOLD_MS, CODED_AUDIO_SLOTS, CODED_VIDEO_SLOTS,
    DEFAULT_FRAME_SAMPLES, RAW_AUDIO_SLOTS, RAW_VIDEO_SLOTS, WAIT_MICROS,
};
use crate::stream_info::{SampleFormat, StreamInfo, StreamParams, VideoCodec};

/// Sizing for one framed queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of preallocated slots.
    pub slots: usize,
    /// Minimum delay before a committed frame becomes visible (ms).
    pub delay_ms: u64,
}

impl QueueConfig {
    #[must_use]
    pub fn new(slots: usize) -> Self {
        Self { slots, delay_ms: 0 }
    }

    #[must_use]
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Default slot count for a stream, per codec family.
    #[must_use]
    pub fn for_stream(info: &StreamInfo) -> Self {
        let slots = match &info.params {
            StreamParams::Video(v) => match v.codec {
                VideoCodec::Raw => RAW_VIDEO_SLOTS,
                _ => CODED_VIDEO_SLOTS,
            },
            StreamParams::Audio(a) => {
                if matches!(
                    a.codec,
                    crate::stream_info::AudioCodec::Pcm
                        | crate::stream_info::AudioCodec::Pcmu
                        | crate::stream_info::AudioCodec::G711
                ) {
                    RAW_AUDIO_SLOTS
                } else {
                    CODED_AUDIO_SLOTS
                }
            }
        };
        Self { slots, delay_ms: 0 }
    }
}

/// Sizing and sync policy for one audio circular buffer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AudioRingConfig {
    pub channels: usize,
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
    /// Ring capacity in samples per channel.
    pub ch_max_samples: usize,
    /// Samples per framed output read.
    pub output_frame_samples: usize,
    /// Deviation between a pushed pts and the expected rear timestamp that
    /// triggers a flush-and-resync (µs).
    pub ts_deviation_threshold_us: u64,
    /// Pre-roll span before reads are served (ms).
    pub buffering_ms: u64,
    /// Free-space span below which the buffer reports FULL (ms).
    pub full_threshold_ms: u64,
}

impl AudioRingConfig {
    /// Defaults: one second of capacity, 20 ms output frames at 48 kHz,
    /// 50 ms deviation threshold, 500 ms pre-roll, 40 ms full margin.
    #[must_use]
    pub fn new(channels: usize, sample_rate: u32, sample_format: SampleFormat) -> Self {
        Self {
            channels,
            sample_rate,
            sample_format,
            ch_max_samples: sample_rate as usize,
            output_frame_samples: DEFAULT_FRAME_SAMPLES,
            ts_deviation_threshold_us: 50_000,
            buffering_ms: AUDIO_BUFFERING_MS,
            full_threshold_ms: AUDIO_FULL_THRESHOLD_MS,
        }
    }

    #[must_use]
    pub fn with_capacity_samples(mut self, ch_max_samples: usize) -> Self {
        self.ch_max_samples = ch_max_samples;
        self
    }

    #[must_use]
    pub fn with_output_frame_samples(mut self, samples: usize) -> Self {
        self.output_frame_samples = samples;
        self
    }

    #[must_use]
    pub fn with_deviation_threshold_us(mut self, micros: u64) -> Self {
        self.ts_deviation_threshold_us = micros;
        self
    }

    #[must_use]
    pub fn with_buffering_ms(mut self, ms: u64) -> Self {
        self.buffering_ms = ms;
        self
    }

    /// Bytes per channel covered by `ms` milliseconds of audio.
    #[must_use]
    pub fn channel_bytes_for_ms(&self, ms: u64) -> usize {
        (self.sample_rate as u64 * ms / 1000) as usize * self.sample_format.bytes_per_sample()
    }
}

/// Scheduler pacing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Sleep applied when a filter reports no progress (µs).
    pub wait_micros: u64,
}

impl SchedulerConfig {
    #[must_use]
    pub fn wait(&self) -> Duration {
        Duration::from_micros(self.wait_micros)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            wait_micros: WAIT_MICROS,
        }
    }
}
