//! Tuning constants shared across the pipeline.
//!
//! Queue sizing is codec policy, not queue mechanics: the queues themselves
//! are agnostic and these defaults are applied by [`crate::config`] when a
//! connection is established.

/// Default slot count for coded video queues (H.264/H.265/VP8).
pub const CODED_VIDEO_SLOTS: usize = 100;

/// Default slot count for raw video queues.
pub const RAW_VIDEO_SLOTS: usize = 50;

/// Maximum byte size of one coded video frame (6 MB covers 4K intra frames).
pub const CODED_VIDEO_SLOT_LEN: usize = 6_000_000;

/// Default slot count for coded audio queues (Opus/AAC/MP3).
pub const CODED_AUDIO_SLOTS: usize = 1000;

/// Maximum byte size of one coded audio frame.
pub const CODED_AUDIO_SLOT_LEN: usize = 2000;

/// Default slot count for raw audio queues.
pub const RAW_AUDIO_SLOTS: usize = 2000;

/// Span of one raw audio frame slot in milliseconds.
pub const RAW_AUDIO_FRAME_MS: u64 = 100;

/// Default samples per output frame for audio filters (20 ms at 48 kHz).
pub const DEFAULT_FRAME_SAMPLES: usize = 960;

/// Maximum slice descriptors a sliced video frame can carry.
pub const MAX_SLICES: usize = 128;

/// Pre-roll span of the audio circular buffer before reads are served (ms).
pub const AUDIO_BUFFERING_MS: u64 = 500;

/// Free-space span below which the audio circular buffer reports FULL (ms).
pub const AUDIO_FULL_THRESHOLD_MS: u64 = 40;

/// Polling hint returned by a filter that made no progress (µs).
pub const WAIT_MICROS: u64 = 1000;

/// Endpoint id used when a filter has a single reader or writer.
pub const DEFAULT_ID: u32 = 1;
