//! Builtin filter bodies.
//!
//! Small concrete bodies used by the headless runner and the test-suite:
//! a pattern-generating source, payload-copying pass/fan/merge stages and
//! a recording sink. They double as reference implementations of the
//! [`FilterBody`](super::FilterBody) contract.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use crate::config::QueueConfig;
use crate::filter::{FilterBody, FilterIo, FilterShape, FrameSet, FramedQueueIo, NoOutputIo};
use crate::frame::{Frame, FrameData};
use crate::queue::EndpointId;
use crate::stream_info::StreamInfo;

/// Copies one frame's payload and timing into another of the same kind.
fn copy_payload(org: &Frame, dst: &mut Frame) -> bool {
    let ok = match (org.data(), dst.data_mut()) {
        (FrameData::InterleavedVideo(src), FrameData::InterleavedVideo(out)) => {
            let copied = out.write(src.payload());
            if copied {
                out.set_geometry(src.width(), src.height());
            }
            copied
        }
        (FrameData::PlanarAudio(src), FrameData::PlanarAudio(out)) => {
            let planes: Vec<&[u8]> = (0..src.channels())
                .filter_map(|ch| src.plane(ch))
                .collect();
            out.write_planes(&planes, src.samples())
        }
        (FrameData::InterleavedAudio(src), FrameData::InterleavedAudio(out)) => {
            out.write(src.payload())
        }
        _ => false,
    };
    if ok {
        dst.set_pts(org.pts());
        dst.set_duration_ns(org.duration_ns());
        dst.set_consumed(true);
    }
    ok
}

// ─────────────────────────────────────────────────────────────────────────────
// FrameSource
// ─────────────────────────────────────────────────────────────────────────────

/// Head filter producing pattern frames at a fixed presentation-time step.
///
/// Each emitted frame carries a payload of `payload_len` repeated counter
/// bytes. Handles the `configure` event (`pts_step_us`, `payload_len`).
pub struct FrameSource {
    io: Arc<FramedQueueIo>,
    pts_step_us: u64,
    next_pts: u64,
    payload_len: usize,
    counter: u8,
    emitted: u64,
}

impl FrameSource {
    #[must_use]
    pub fn new(info: StreamInfo, config: QueueConfig) -> Self {
        Self {
            io: Arc::new(FramedQueueIo::with_config(info, config)),
            pts_step_us: 20_000,
            next_pts: 0,
            payload_len: 4,
            counter: 0,
            emitted: 0,
        }
    }

    #[must_use]
    pub fn with_pts_step_us(mut self, step: u64) -> Self {
        self.pts_step_us = step;
        self
    }

    #[must_use]
    pub fn with_payload_len(mut self, len: usize) -> Self {
        self.payload_len = len;
        self
    }

    fn fill(&self, frame: &mut Frame) -> bool {
        let payload = vec![self.counter; self.payload_len];
        match frame.data_mut() {
            FrameData::InterleavedVideo(video) => video.write(&payload),
            FrameData::InterleavedAudio(audio) => audio.write(&payload),
            FrameData::PlanarAudio(audio) => {
                let channels = audio.channels();
                let bps = audio.sample_format().bytes_per_sample();
                let planes: Vec<Vec<u8>> =
                    (0..channels).map(|_| payload.clone()).collect();
                let refs: Vec<&[u8]> = planes.iter().map(|p| p.as_slice()).collect();
                audio.write_planes(&refs, self.payload_len / bps)
            }
            FrameData::SlicedVideo(_) => false,
        }
    }
}

impl FilterBody for FrameSource {
    fn type_name(&self) -> &'static str {
        "frame-source"
    }

    fn shape(&self) -> FilterShape {
        FilterShape::Head(1)
    }

    fn io(&self) -> Arc<dyn FilterIo> {
        self.io.clone()
    }

    fn process(&mut self, _org: &mut FrameSet<'_>, dst: &mut FrameSet<'_>) -> bool {
        let pts = self.next_pts;
        let duration_ns = self.pts_step_us * 1000;
        let Some(frame) = dst.first_mut() else {
            return true;
        };
        if !self.fill(frame) {
            return false;
        }
        frame.set_pts(pts);
        frame.set_duration_ns(duration_ns);
        frame.set_consumed(true);
        self.next_pts += self.pts_step_us;
        self.counter = self.counter.wrapping_add(1);
        self.emitted += 1;
        true
    }

    fn handle_event(&mut self, action: &str, params: &Value) -> Option<bool> {
        match action {
            "configure" => {
                if let Some(step) = params.get("pts_step_us").and_then(Value::as_u64) {
                    if step == 0 {
                        return Some(false);
                    }
                    self.pts_step_us = step;
                }
                if let Some(len) = params.get("payload_len").and_then(Value::as_u64) {
                    self.payload_len = len as usize;
                }
                Some(true)
            }
            _ => None,
        }
    }

    fn append_state(&self, state: &mut Map<String, Value>) {
        state.insert("emitted".into(), json!(self.emitted));
        state.insert("next_pts".into(), json!(self.next_pts));
        state.insert("pts_step_us".into(), json!(self.pts_step_us));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Passthrough / Fanout / Funnel
// ─────────────────────────────────────────────────────────────────────────────

/// One-to-one filter copying its input payload unchanged.
pub struct Passthrough {
    io: Arc<FramedQueueIo>,
    forwarded: u64,
}

impl Passthrough {
    #[must_use]
    pub fn new(info: StreamInfo, config: QueueConfig) -> Self {
        Self {
            io: Arc::new(FramedQueueIo::with_config(info, config)),
            forwarded: 0,
        }
    }
}

impl FilterBody for Passthrough {
    fn type_name(&self) -> &'static str {
        "passthrough"
    }

    fn shape(&self) -> FilterShape {
        FilterShape::OneToOne
    }

    fn io(&self) -> Arc<dyn FilterIo> {
        self.io.clone()
    }

    fn process(&mut self, org: &mut FrameSet<'_>, dst: &mut FrameSet<'_>) -> bool {
        if !org.any_new() {
            return true;
        }
        let Some(src) = org.first() else {
            return true;
        };
        let Some(out) = dst.first_mut() else {
            return true;
        };
        let copied = copy_payload(src, out);
        if copied {
            self.forwarded += 1;
        }
        copied
    }

    fn append_state(&self, state: &mut Map<String, Value>) {
        state.insert("forwarded".into(), json!(self.forwarded));
    }
}

/// One-to-many filter copying its input into every connected output.
pub struct Fanout {
    io: Arc<FramedQueueIo>,
    outputs: usize,
}

impl Fanout {
    #[must_use]
    pub fn new(info: StreamInfo, config: QueueConfig, outputs: usize) -> Self {
        Self {
            io: Arc::new(FramedQueueIo::with_config(info, config)),
            outputs,
        }
    }
}

impl FilterBody for Fanout {
    fn type_name(&self) -> &'static str {
        "fanout"
    }

    fn shape(&self) -> FilterShape {
        FilterShape::OneToMany(self.outputs)
    }

    fn io(&self) -> Arc<dyn FilterIo> {
        self.io.clone()
    }

    fn process(&mut self, org: &mut FrameSet<'_>, dst: &mut FrameSet<'_>) -> bool {
        if !org.any_new() {
            return true;
        }
        let ids = org.ids();
        let Some(&src_id) = ids.first() else {
            return true;
        };
        let dst_ids = dst.ids();
        for id in dst_ids {
            // Each output gets its own copy of the payload.
            let copied = {
                let Some(src) = org.get(src_id) else {
                    return true;
                };
                let Some(out) = dst.get_mut(id) else {
                    continue;
                };
                copy_payload(src, out)
            };
            if !copied {
                return false;
            }
        }
        true
    }
}

/// Many-to-one filter forwarding the first fresh input of each iteration.
pub struct Funnel {
    io: Arc<FramedQueueIo>,
    inputs: usize,
}

impl Funnel {
    #[must_use]
    pub fn new(info: StreamInfo, config: QueueConfig, inputs: usize) -> Self {
        Self {
            io: Arc::new(FramedQueueIo::with_config(info, config)),
            inputs,
        }
    }
}

impl FilterBody for Funnel {
    fn type_name(&self) -> &'static str {
        "funnel"
    }

    fn shape(&self) -> FilterShape {
        FilterShape::ManyToOne(self.inputs)
    }

    fn io(&self) -> Arc<dyn FilterIo> {
        self.io.clone()
    }

    fn process(&mut self, org: &mut FrameSet<'_>, dst: &mut FrameSet<'_>) -> bool {
        let Some(&src_id) = org.ids().iter().find(|id| org.is_new(**id)) else {
            return true;
        };
        let copied = {
            let Some(src) = org.get(src_id) else {
                return true;
            };
            let Some(out) = dst.first_mut() else {
                return true;
            };
            copy_payload(src, out)
        };
        copied
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Collector
// ─────────────────────────────────────────────────────────────────────────────

/// One frame observed by a [`Collector`].
#[derive(Debug, Clone)]
pub struct CollectedFrame {
    pub reader_id: EndpointId,
    pub pts: u64,
    pub sequence: u64,
    pub origin_ts: u64,
    pub len: usize,
    pub first_byte: Option<u8>,
}

/// Shared view into a collector's recordings.
#[derive(Clone)]
pub struct CollectorHandle {
    records: Arc<Mutex<Vec<CollectedFrame>>>,
}

impl CollectorHandle {
    #[must_use]
    pub fn frames(&self) -> Vec<CollectedFrame> {
        self.records.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    #[must_use]
    pub fn pts_values(&self) -> Vec<u64> {
        self.records.lock().iter().map(|r| r.pts).collect()
    }
}

/// Tail filter recording every fresh frame it observes. Handles the
/// `flush` event by clearing its recordings.
pub struct Collector {
    inputs: usize,
    records: Arc<Mutex<Vec<CollectedFrame>>>,
}

impl Collector {
    #[must_use]
    pub fn new(inputs: usize) -> (Self, CollectorHandle) {
        let records = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                inputs,
                records: records.clone(),
            },
            CollectorHandle { records },
        )
    }
}

impl FilterBody for Collector {
    fn type_name(&self) -> &'static str {
        "collector"
    }

    fn shape(&self) -> FilterShape {
        FilterShape::Tail(self.inputs)
    }

    fn io(&self) -> Arc<dyn FilterIo> {
        Arc::new(NoOutputIo)
    }

    fn process(&mut self, org: &mut FrameSet<'_>, _dst: &mut FrameSet<'_>) -> bool {
        let mut records = self.records.lock();
        for id in org.ids() {
            if !org.is_new(id) {
                continue;
            }
            let Some(frame) = org.get(id) else {
                continue;
            };
            let first_byte = match frame.data() {
                FrameData::InterleavedVideo(v) => v.payload().first().copied(),
                FrameData::InterleavedAudio(a) => a.payload().first().copied(),
                FrameData::PlanarAudio(a) => a.plane(0).and_then(|p| p.first().copied()),
                FrameData::SlicedVideo(_) => None,
            };
            records.push(CollectedFrame {
                reader_id: id,
                pts: frame.pts(),
                sequence: frame.sequence(),
                origin_ts: frame.origin_ts(),
                len: frame.len(),
                first_byte,
            });
        }
        true
    }

    fn handle_event(&mut self, action: &str, _params: &Value) -> Option<bool> {
        match action {
            "flush" => {
                self.records.lock().clear();
                Some(true)
            }
            _ => None,
        }
    }

    fn append_state(&self, state: &mut Map<String, Value>) {
        state.insert("collected".into(), json!(self.records.lock().len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::VideoFrame;
    use crate::stream_info::{VideoCodec, VideoStreamInfo};
    use std::collections::BTreeMap;

    fn video_frame(payload: &[u8]) -> Frame {
        let mut frame = Frame::new(FrameData::InterleavedVideo(VideoFrame::coded(
            VideoCodec::H264,
            64,
        )));
        frame.video_mut().unwrap().write(payload);
        frame.set_pts(123);
        frame.set_duration_ns(456);
        frame
    }

    #[test]
    fn copy_payload_carries_bytes_and_timing() {
        let src = video_frame(&[1, 2, 3]);
        let mut out = Frame::new(FrameData::InterleavedVideo(VideoFrame::coded(
            VideoCodec::H264,
            64,
        )));
        assert!(copy_payload(&src, &mut out));
        assert_eq!(out.video().unwrap().payload(), &[1, 2, 3]);
        assert_eq!(out.pts(), 123);
        assert_eq!(out.duration_ns(), 456);
        assert!(out.consumed());
    }

    #[test]
    fn copy_payload_rejects_kind_mismatch() {
        use crate::frame::PlanarAudioFrame;
        use crate::stream_info::{AudioCodec, SampleFormat};
        let src = video_frame(&[1]);
        let mut out = Frame::new(FrameData::PlanarAudio(PlanarAudioFrame::new(
            AudioCodec::Pcm,
            2,
            48000,
            16,
            SampleFormat::S16p,
        )));
        assert!(!copy_payload(&src, &mut out));
        assert!(!out.consumed());
    }

    #[test]
    fn source_fills_and_advances() {
        let info = StreamInfo::video(VideoStreamInfo {
            codec: VideoCodec::H264,
            pixel_format: None,
            width: 0,
            height: 0,
            annexb: false,
        });
        let mut source = FrameSource::new(info, QueueConfig::new(4))
            .with_pts_step_us(1000)
            .with_payload_len(2);

        let mut frame = Frame::new(FrameData::InterleavedVideo(VideoFrame::coded(
            VideoCodec::H264,
            16,
        )));
        let mut frames: BTreeMap<EndpointId, &mut Frame> = BTreeMap::new();
        frames.insert(1, &mut frame);
        let mut dst = FrameSet {
            frames,
            new_ids: Vec::new(),
        };
        let mut org = FrameSet {
            frames: BTreeMap::new(),
            new_ids: Vec::new(),
        };
        assert!(source.process(&mut org, &mut dst));
        assert!(frame.consumed());
        assert_eq!(frame.pts(), 0);
        assert_eq!(frame.len(), 2);

        // configure changes the step for subsequent frames
        assert_eq!(
            source.handle_event("configure", &serde_json::json!({"pts_step_us": 5})),
            Some(true)
        );
        assert_eq!(source.handle_event("unknown", &Value::Null), None);
    }
}
