//! Stream descriptions negotiated at connect time.
//!
//! A producing filter describes its output with a [`StreamInfo`]; the queue
//! allocated for the connection is sized and typed from it, and downstream
//! readers inspect it for codec/format negotiation. `extradata` carries
//! codec initialization blobs (SPS/PPS for H.264, decoder config for AAC)
//! as an owned, immutable buffer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Stream kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
}

/// Video codecs known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Vp8,
    Mjpeg,
    Raw,
}

/// Audio codecs known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    G711,
    Pcmu,
    Opus,
    Pcm,
    Aac,
    Mp3,
}

/// Raw video pixel layouts accepted at the pipeline boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Rgb32,
    Yuyv422,
    Yuv420p,
    Yuv422p,
    Yuv444p,
    Yuvj420p,
}

impl PixelFormat {
    /// Bytes needed for one frame of the given geometry, plane padding
    /// included for the planar 4:2:0/4:2:2 layouts.
    #[must_use]
    pub fn frame_len(&self, width: usize, height: usize) -> usize {
        let pixels = width * height;
        match self {
            Self::Rgb24 => pixels * 3,
            Self::Rgb32 => pixels * 4,
            Self::Yuyv422 => pixels * 2,
            Self::Yuv420p | Self::Yuvj420p => pixels * 3 / 2,
            Self::Yuv422p => pixels * 2,
            Self::Yuv444p => pixels * 3,
        }
    }
}

/// Audio sample formats; the `P` suffix marks planar layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,
    S16,
    Flt,
    U8p,
    S16p,
    Fltp,
}

impl SampleFormat {
    /// Bytes per sample per channel.
    #[must_use]
    pub const fn bytes_per_sample(&self) -> usize {
        match self {
            Self::U8 | Self::U8p => 1,
            Self::S16 | Self::S16p => 2,
            Self::Flt | Self::Fltp => 4,
        }
    }

    /// True for one-buffer-per-channel layouts.
    #[must_use]
    pub const fn is_planar(&self) -> bool {
        matches!(self, Self::U8p | Self::S16p | Self::Fltp)
    }
}

/// Video-specific stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoStreamInfo {
    pub codec: VideoCodec,
    pub pixel_format: Option<PixelFormat>,
    pub width: usize,
    pub height: usize,
    /// Whether sinks expect Annex-B start codes. NAL units travel through
    /// the queues without start codes either way.
    pub annexb: bool,
}

/// Audio-specific stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioStreamInfo {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: usize,
    pub sample_format: SampleFormat,
}

impl AudioStreamInfo {
    /// Returns the number of samples per channel for the given duration.
    #[must_use]
    pub fn duration_samples(&self, duration_ms: u64) -> usize {
        (self.sample_rate as u64 * duration_ms / 1000) as usize
    }

    /// Bytes for one channel over the given duration.
    #[must_use]
    pub fn channel_bytes(&self, duration_ms: u64) -> usize {
        self.duration_samples(duration_ms) * self.sample_format.bytes_per_sample()
    }
}

/// Codec-specific parameters of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamParams {
    Video(VideoStreamInfo),
    Audio(AudioStreamInfo),
}

/// Description of one stream, negotiated between an upstream filter's queue
/// allocation and its downstream readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub kind: StreamKind,
    pub params: StreamParams,
    extradata: Bytes,
}

impl StreamInfo {
    /// Creates a video stream description with no extradata.
    #[must_use]
    pub fn video(params: VideoStreamInfo) -> Self {
        Self {
            kind: StreamKind::Video,
            params: StreamParams::Video(params),
            extradata: Bytes::new(),
        }
    }

    /// Creates an audio stream description with no extradata, normalizing
    /// fields that are fixed by the codec (Opus/AAC/MP3 decode to S16,
    /// G.711 is always mono 8 kHz U8).
    #[must_use]
    pub fn audio(mut params: AudioStreamInfo) -> Self {
        match params.codec {
            AudioCodec::Opus | AudioCodec::Aac | AudioCodec::Mp3 => {
                params.sample_format = SampleFormat::S16;
            }
            AudioCodec::G711 => {
                params.channels = 1;
                params.sample_rate = 8000;
                params.sample_format = SampleFormat::U8;
            }
            _ => {}
        }
        Self {
            kind: StreamKind::Audio,
            params: StreamParams::Audio(params),
            extradata: Bytes::new(),
        }
    }

    /// Replaces the codec initialization blob. The data is copied; the
    /// stored buffer is immutable for the life of this description.
    pub fn set_extradata(&mut self, data: &[u8]) {
        self.extradata = Bytes::copy_from_slice(data);
    }

    /// Codec initialization blob (empty if none was negotiated).
    #[must_use]
    pub fn extradata(&self) -> &Bytes {
        &self.extradata
    }

    /// Video parameters, if this is a video stream.
    #[must_use]
    pub fn video_params(&self) -> Option<&VideoStreamInfo> {
        match &self.params {
            StreamParams::Video(v) => Some(v),
            StreamParams::Audio(_) => None,
        }
    }

    /// Audio parameters, if this is an audio stream.
    #[must_use]
    pub fn audio_params(&self) -> Option<&AudioStreamInfo> {
        match &self.params {
            StreamParams::Audio(a) => Some(a),
            StreamParams::Video(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_info() -> AudioStreamInfo {
        AudioStreamInfo {
            codec: AudioCodec::Pcm,
            sample_rate: 48000,
            channels: 2,
            sample_format: SampleFormat::S16p,
        }
    }

    #[test]
    fn g711_defaults_are_forced() {
        let info = StreamInfo::audio(AudioStreamInfo {
            codec: AudioCodec::G711,
            sample_rate: 48000,
            channels: 2,
            sample_format: SampleFormat::Fltp,
        });
        let audio = info.audio_params().unwrap();
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.sample_rate, 8000);
        assert_eq!(audio.sample_format, SampleFormat::U8);
    }

    #[test]
    fn coded_audio_decodes_to_s16() {
        let info = StreamInfo::audio(AudioStreamInfo {
            codec: AudioCodec::Opus,
            sample_format: SampleFormat::Fltp,
            ..pcm_info()
        });
        assert_eq!(
            info.audio_params().unwrap().sample_format,
            SampleFormat::S16
        );
    }

    #[test]
    fn pcm_format_is_preserved() {
        let info = StreamInfo::audio(pcm_info());
        assert_eq!(
            info.audio_params().unwrap().sample_format,
            SampleFormat::S16p
        );
    }

    #[test]
    fn extradata_is_copied() {
        let mut info = StreamInfo::audio(pcm_info());
        let blob = vec![1u8, 2, 3];
        info.set_extradata(&blob);
        drop(blob);
        assert_eq!(info.extradata().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn raw_video_frame_lengths() {
        assert_eq!(PixelFormat::Rgb24.frame_len(4, 2), 24);
        assert_eq!(PixelFormat::Yuv420p.frame_len(4, 2), 12);
        assert_eq!(PixelFormat::Yuyv422.frame_len(4, 2), 16);
    }

    #[test]
    fn duration_samples_at_48khz() {
        let audio = pcm_info();
        assert_eq!(audio.duration_samples(20), 960);
        assert_eq!(audio.channel_bytes(20), 1920);
    }
}
