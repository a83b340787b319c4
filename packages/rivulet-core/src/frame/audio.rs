//! Audio payloads, planar and interleaved.

use crate::stream_info::{AudioCodec, SampleFormat};

/// Planar audio payload: one buffer per channel, all channels carrying the
/// same number of valid samples.
#[derive(Debug)]
pub struct PlanarAudioFrame {
    planes: Vec<Vec<u8>>,
    samples: usize,
    max_samples: usize,
    channels: usize,
    sample_rate: u32,
    sample_format: SampleFormat,
    codec: AudioCodec,
}

impl PlanarAudioFrame {
    /// Allocates `channels` buffers of `max_samples` samples each.
    #[must_use]
    pub fn new(
        codec: AudioCodec,
        channels: usize,
        sample_rate: u32,
        max_samples: usize,
        sample_format: SampleFormat,
    ) -> Self {
        let plane_len = max_samples * sample_format.bytes_per_sample();
        Self {
            planes: (0..channels).map(|_| vec![0; plane_len]).collect(),
            samples: 0,
            max_samples,
            channels,
            sample_rate,
            sample_format,
            codec,
        }
    }

    #[must_use]
    pub fn codec(&self) -> AudioCodec {
        self.codec
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    #[must_use]
    pub fn samples(&self) -> usize {
        self.samples
    }

    #[must_use]
    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    /// Valid bytes per channel.
    #[must_use]
    pub fn channel_len(&self) -> usize {
        self.samples * self.sample_format.bytes_per_sample()
    }

    /// Capacity in bytes per channel.
    #[must_use]
    pub fn channel_max_len(&self) -> usize {
        self.max_samples * self.sample_format.bytes_per_sample()
    }

    /// Valid payload of one channel.
    #[must_use]
    pub fn plane(&self, channel: usize) -> Option<&[u8]> {
        self.planes.get(channel).map(|p| &p[..self.channel_len()])
    }

    /// Whole backing buffer of one channel, for in-place fills followed by
    /// [`PlanarAudioFrame::set_samples`].
    pub fn plane_mut(&mut self, channel: usize) -> Option<&mut [u8]> {
        self.planes.get_mut(channel).map(|p| p.as_mut_slice())
    }

    /// Declares the number of valid samples (clamped to capacity).
    pub fn set_samples(&mut self, samples: usize) {
        self.samples = samples.min(self.max_samples);
    }

    /// Copies one payload per channel into the frame. All slices must have
    /// the same length and fit the planes; returns `false` otherwise.
    pub fn write_planes(&mut self, data: &[&[u8]], samples: usize) -> bool {
        let bytes = samples * self.sample_format.bytes_per_sample();
        if data.len() != self.channels || samples > self.max_samples {
            return false;
        }
        if data.iter().any(|d| d.len() != bytes) {
            return false;
        }
        for (plane, src) in self.planes.iter_mut().zip(data) {
            plane[..bytes].copy_from_slice(src);
        }
        self.samples = samples;
        true
    }
}

/// Interleaved audio payload: one packed buffer for all channels.
#[derive(Debug)]
pub struct InterleavedAudioFrame {
    buf: Vec<u8>,
    samples: usize,
    max_samples: usize,
    channels: usize,
    sample_rate: u32,
    sample_format: SampleFormat,
    codec: AudioCodec,
}

impl InterleavedAudioFrame {
    #[must_use]
    pub fn new(
        codec: AudioCodec,
        channels: usize,
        sample_rate: u32,
        max_samples: usize,
        sample_format: SampleFormat,
    ) -> Self {
        Self {
            buf: vec![0; max_samples * channels * sample_format.bytes_per_sample()],
            samples: 0,
            max_samples,
            channels,
            sample_rate,
            sample_format,
            codec,
        }
    }

    #[must_use]
    pub fn codec(&self) -> AudioCodec {
        self.codec
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    #[must_use]
    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Valid payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples * self.channels * self.sample_format.bytes_per_sample()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    #[must_use]
    pub fn max_len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len()]
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn set_samples(&mut self, samples: usize) {
        self.samples = samples.min(self.max_samples);
    }

    /// Copies an interleaved payload into the frame; `false` if it doesn't
    /// fit or isn't whole sample frames.
    pub fn write(&mut self, data: &[u8]) -> bool {
        let frame_bytes = self.channels * self.sample_format.bytes_per_sample();
        if frame_bytes == 0 || data.len() % frame_bytes != 0 || data.len() > self.buf.len() {
            return false;
        }
        self.buf[..data.len()].copy_from_slice(data);
        self.samples = data.len() / frame_bytes;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planar_write_requires_matching_planes() {
        let mut frame =
            PlanarAudioFrame::new(AudioCodec::Pcm, 2, 48000, 16, SampleFormat::S16p);
        let left = [1u8; 8];
        let right = [2u8; 8];
        assert!(frame.write_planes(&[&left, &right], 4));
        assert_eq!(frame.samples(), 4);
        assert_eq!(frame.plane(0).unwrap(), &left);
        // Wrong channel count
        assert!(!frame.write_planes(&[&left], 4));
        // Mismatched byte length for the sample count
        assert!(!frame.write_planes(&[&left[..6], &right[..6]], 4));
    }

    #[test]
    fn interleaved_write_rejects_partial_sample_frames() {
        let mut frame =
            InterleavedAudioFrame::new(AudioCodec::Pcm, 2, 48000, 8, SampleFormat::S16);
        assert!(frame.write(&[0u8; 8])); // 2 samples
        assert_eq!(frame.samples(), 2);
        assert!(!frame.write(&[0u8; 7]));
        assert!(!frame.write(&[0u8; 64]));
    }
}
