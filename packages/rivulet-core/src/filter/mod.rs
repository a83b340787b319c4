//! Filter runtime.
//!
//! A [`Filter`] is one node of the pipeline graph: it owns reader and
//! writer endpoints, an event queue and a processing body. The iteration
//! loop lives here once for every shape: securing input and output frames,
//! running the body without any queue lock held, stamping outputs according
//! to the shape, committing and acknowledging. Bodies implement
//! [`FilterBody`] and never touch queues directly.

pub mod builtin;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use crate::config::QueueConfig;
use crate::frame::Frame;
use crate::constants::DEFAULT_ID;
use crate::error::{PipelineError, PipelineResult};
use crate::event::{Event, EventQueue};
use crate::io::{Reader, Writer};
use crate::queue::{ConnectionData, EndpointId, FilterId, FrameQueue, FramedQueue, FrameRef};
use crate::stream_info::StreamInfo;
use crate::utils::random_endpoint_id;

/// Input/output arity of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterShape {
    OneToOne,
    OneToMany(usize),
    ManyToOne(usize),
    Head(usize),
    Tail(usize),
}

impl FilterShape {
    #[must_use]
    pub fn max_readers(&self) -> usize {
        match self {
            Self::OneToOne | Self::OneToMany(_) => 1,
            Self::ManyToOne(n) | Self::Tail(n) => *n,
            Self::Head(_) => 0,
        }
    }

    #[must_use]
    pub fn max_writers(&self) -> usize {
        match self {
            Self::OneToOne | Self::ManyToOne(_) => 1,
            Self::OneToMany(n) | Self::Head(n) => *n,
            Self::Tail(_) => 0,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::OneToOne => "one-to-one",
            Self::OneToMany(_) => "one-to-many",
            Self::ManyToOne(_) => "many-to-one",
            Self::Head(_) => "head",
            Self::Tail(_) => "tail",
        }
    }
}

/// Scheduling behavior of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterRole {
    /// Runs to completion per ready frame set; reports `Wait` otherwise.
    Regular,
    /// Runs on its own cadence, with or without input, always reporting
    /// progress.
    Server,
}

impl FilterRole {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Server => "server",
        }
    }
}

/// Outcome of one processing iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Data moved; run again right away.
    Worked,
    /// No progress; poll again after the scheduler's wait hint.
    Wait,
}

/// Frames secured for one iteration, keyed by endpoint id.
///
/// For input sets, `is_new` tells whether this iteration is the first to
/// observe the frame; duplicated frames (forced reads) are delivered with
/// `is_new == false` and are usually skipped by bodies.
pub struct FrameSet<'a> {
    frames: BTreeMap<EndpointId, &'a mut Frame>,
    new_ids: Vec<EndpointId>,
}

impl<'a> FrameSet<'a> {
    #[must_use]
    pub fn get(&self, id: EndpointId) -> Option<&Frame> {
        self.frames.get(&id).map(|f| &**f)
    }

    pub fn get_mut(&mut self, id: EndpointId) -> Option<&mut Frame> {
        self.frames.get_mut(&id).map(|f| &mut **f)
    }

    /// Frame with the lowest endpoint id (the only one for single-arity
    /// shapes).
    #[must_use]
    pub fn first(&self) -> Option<&Frame> {
        self.frames.values().next().map(|f| &**f)
    }

    pub fn first_mut(&mut self) -> Option<&mut Frame> {
        self.frames.values_mut().next().map(|f| &mut **f)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EndpointId, &mut Frame)> + use<'_, 'a> {
        self.frames.iter_mut().map(|(id, f)| (*id, &mut **f))
    }

    #[must_use]
    pub fn ids(&self) -> Vec<EndpointId> {
        self.frames.keys().copied().collect()
    }

    #[must_use]
    pub fn is_new(&self, id: EndpointId) -> bool {
        self.new_ids.contains(&id)
    }

    #[must_use]
    pub fn any_new(&self) -> bool {
        !self.new_ids.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Connect-time contract of a filter: how its output queues are built and
/// how endpoints are validated. Separated from [`FilterBody`] so
/// connections never contend with a running iteration.
pub trait FilterIo: Send + Sync {
    /// Allocates the output queue for a fresh connection.
    fn alloc_queue(&self, conn: &ConnectionData) -> PipelineResult<Arc<dyn FrameQueue>>;

    /// Endpoint negotiation hook for a new reader. Rejecting aborts the
    /// connection.
    fn reader_config(&self, _reader_id: EndpointId, _queue: &Arc<dyn FrameQueue>) -> bool {
        true
    }

    /// Endpoint negotiation hook for a new writer.
    fn writer_config(&self, _writer_id: EndpointId) -> bool {
        true
    }
}

/// Standard [`FilterIo`] allocating framed queues from a stream
/// description and sizing policy.
pub struct FramedQueueIo {
    pub info: StreamInfo,
    pub config: QueueConfig,
}

impl FramedQueueIo {
    #[must_use]
    pub fn new(info: StreamInfo) -> Self {
        let config = QueueConfig::for_stream(&info);
        Self { info, config }
    }

    #[must_use]
    pub fn with_config(info: StreamInfo, config: QueueConfig) -> Self {
        Self { info, config }
    }
}

impl FilterIo for FramedQueueIo {
    fn alloc_queue(&self, conn: &ConnectionData) -> PipelineResult<Arc<dyn FrameQueue>> {
        let queue = FramedQueue::new(conn.clone(), self.info.clone(), self.config)?;
        Ok(Arc::new(queue))
    }
}

/// [`FilterIo`] for sink filters that never allocate output queues.
pub struct NoOutputIo;

impl FilterIo for NoOutputIo {
    fn alloc_queue(&self, _conn: &ConnectionData) -> PipelineResult<Arc<dyn FrameQueue>> {
        Err(PipelineError::InvalidParameter(
            "filter has no output queues".into(),
        ))
    }
}

/// Processing body of a filter.
///
/// `process` receives the secured input and output frame sets; committing
/// an output means marking it consumed. Returning `false` signals a body
/// failure: nothing is committed, inputs are still released.
pub trait FilterBody: Send {
    /// Introspection type tag.
    fn type_name(&self) -> &'static str;

    /// Input/output arity.
    fn shape(&self) -> FilterShape;

    /// Connect-time contract, shared with the pipeline manager.
    fn io(&self) -> Arc<dyn FilterIo>;

    /// One body run. Mutating `org` is allowed but unusual.
    fn process(&mut self, org: &mut FrameSet<'_>, dst: &mut FrameSet<'_>) -> bool;

    /// Handles a reconfiguration event. `None` means the action is unknown
    /// to this filter.
    fn handle_event(&mut self, _action: &str, _params: &Value) -> Option<bool> {
        None
    }

    /// Adds body-specific fields to the introspection dump.
    fn append_state(&self, _state: &mut Map<String, Value>) {}
}

struct Endpoints {
    readers: BTreeMap<EndpointId, Arc<Reader>>,
    writers: BTreeMap<EndpointId, Arc<Writer>>,
}

/// Frame-time pacing and synchronized-demand state.
struct Pacing {
    frame_time_us: u64,
    sync_ts: u64,
    ref_reader: Option<EndpointId>,
    sync_margin_us: u64,
}

struct OrgFrame {
    id: EndpointId,
    frame: FrameRef,
    new: bool,
}

/// Runtime node wrapping a [`FilterBody`].
pub struct Filter {
    id: FilterId,
    role: FilterRole,
    shape: FilterShape,
    io: Arc<dyn FilterIo>,
    body: Mutex<Box<dyn FilterBody>>,
    endpoints: Mutex<Endpoints>,
    events: EventQueue,
    pacing: Mutex<Pacing>,
    /// Serializes iterations: at most one `process_frame` is in flight.
    iteration: Mutex<()>,
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

impl Filter {
    #[must_use]
    pub fn new(id: FilterId, role: FilterRole, body: Box<dyn FilterBody>) -> Self {
        let shape = body.shape();
        let io = body.io();
        Self {
            id,
            role,
            shape,
            io,
            body: Mutex::new(body),
            endpoints: Mutex::new(Endpoints {
                readers: BTreeMap::new(),
                writers: BTreeMap::new(),
            }),
            events: EventQueue::new(),
            pacing: Mutex::new(Pacing {
                frame_time_us: 0,
                sync_ts: 0,
                ref_reader: None,
                sync_margin_us: 0,
            }),
            iteration: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn id(&self) -> FilterId {
        self.id
    }

    #[must_use]
    pub fn role(&self) -> FilterRole {
        self.role
    }

    #[must_use]
    pub fn shape(&self) -> FilterShape {
        self.shape
    }

    /// Frame-time budget; zero means best effort.
    pub fn set_frame_time(&self, frame_time: Duration) {
        self.pacing.lock().frame_time_us = frame_time.as_micros() as u64;
    }

    #[must_use]
    pub fn frame_time(&self) -> Duration {
        Duration::from_micros(self.pacing.lock().frame_time_us)
    }

    /// Reference reader for synchronized input alignment.
    pub fn set_ref_reader(&self, reader: Option<EndpointId>) {
        self.pacing.lock().ref_reader = reader;
    }

    /// Tolerance window around the reference reader's timestamp.
    pub fn set_sync_margin(&self, margin: Duration) {
        self.pacing.lock().sync_margin_us = margin.as_micros() as u64;
    }

    /// Thread-safe event enqueue; never blocks on a running iteration.
    pub fn push_event(&self, event: Event) {
        self.events.push(event);
    }

    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Topology
    // ─────────────────────────────────────────────────────────────────────

    #[must_use]
    pub fn reader(&self, id: EndpointId) -> Option<Arc<Reader>> {
        self.endpoints.lock().readers.get(&id).cloned()
    }

    #[must_use]
    pub fn writer(&self, id: EndpointId) -> Option<Arc<Writer>> {
        self.endpoints.lock().writers.get(&id).cloned()
    }

    /// Unique reader id: the default id for single-input shapes, a random
    /// unused id otherwise.
    #[must_use]
    pub fn generate_reader_id(&self) -> EndpointId {
        if self.shape.max_readers() == 1 {
            return DEFAULT_ID;
        }
        let endpoints = self.endpoints.lock();
        loop {
            let id = random_endpoint_id();
            if !endpoints.readers.contains_key(&id) {
                return id;
            }
        }
    }

    #[must_use]
    pub fn generate_writer_id(&self) -> EndpointId {
        if self.shape.max_writers() == 1 {
            return DEFAULT_ID;
        }
        let endpoints = self.endpoints.lock();
        loop {
            let id = random_endpoint_id();
            if !endpoints.writers.contains_key(&id) {
                return id;
            }
        }
    }

    /// Connects this filter's `writer_id` to `downstream`'s `reader_id`,
    /// allocating the queue through this filter's [`FilterIo`]. On failure
    /// the freshly created writer is rolled back and no state changes.
    pub fn connect(
        &self,
        downstream: &Filter,
        writer_id: EndpointId,
        reader_id: EndpointId,
    ) -> PipelineResult<()> {
        if let Some(reader) = downstream.reader(reader_id) {
            if reader.is_connected() {
                return Err(PipelineError::AlreadyConnected {
                    filter: downstream.id,
                    reader: reader_id,
                });
            }
        }

        {
            let mut endpoints = self.endpoints.lock();
            if endpoints.writers.len() >= self.shape.max_writers() {
                return Err(PipelineError::ArityExceeded {
                    filter: self.id,
                    kind: "writer",
                    limit: self.shape.max_writers(),
                });
            }
            if endpoints.writers.contains_key(&writer_id) {
                return Err(PipelineError::WriterRejected {
                    filter: self.id,
                    writer: writer_id,
                });
            }
            endpoints.writers.insert(writer_id, Arc::new(Writer::new()));
        }
        if !self.io.writer_config(writer_id) {
            self.delete_writer(writer_id);
            return Err(PipelineError::WriterRejected {
                filter: self.id,
                writer: writer_id,
            });
        }

        let conn = ConnectionData::new(self.id, writer_id, downstream.id, reader_id);
        let queue = match self.io.alloc_queue(&conn) {
            Ok(queue) => queue,
            Err(err) => {
                self.delete_writer(writer_id);
                return Err(err);
            }
        };

        if let Err(err) = downstream.set_reader(reader_id, queue.clone()) {
            self.delete_writer(writer_id);
            return Err(err);
        }

        let writer = self
            .writer(writer_id)
            .ok_or(PipelineError::WriterRejected {
                filter: self.id,
                writer: writer_id,
            })?;
        writer.set_queue(queue);
        writer.connect();
        log::info!(
            "[Filter] Connected {}:{} -> {}:{}",
            self.id,
            writer_id,
            downstream.id,
            reader_id
        );
        Ok(())
    }

    /// Connects with both endpoint ids auto-allocated.
    pub fn connect_one_to_one(&self, downstream: &Filter) -> PipelineResult<()> {
        let writer_id = self.generate_writer_id();
        let reader_id = downstream.generate_reader_id();
        self.connect(downstream, writer_id, reader_id)
    }

    /// Connects a chosen writer of a multi-output filter.
    pub fn connect_one_to_many(
        &self,
        downstream: &Filter,
        writer_id: EndpointId,
    ) -> PipelineResult<()> {
        let reader_id = downstream.generate_reader_id();
        self.connect(downstream, writer_id, reader_id)
    }

    /// Connects into a chosen reader of a multi-input filter.
    pub fn connect_many_to_one(
        &self,
        downstream: &Filter,
        reader_id: EndpointId,
    ) -> PipelineResult<()> {
        let writer_id = self.generate_writer_id();
        self.connect(downstream, writer_id, reader_id)
    }

    /// Connects with both endpoint ids chosen by the caller.
    pub fn connect_many_to_many(
        &self,
        downstream: &Filter,
        writer_id: EndpointId,
        reader_id: EndpointId,
    ) -> PipelineResult<()> {
        self.connect(downstream, writer_id, reader_id)
    }

    /// Attaches `other` as an additional consumer of this filter's
    /// `org_reader_id`, without duplicating the queue.
    pub fn share_reader(
        &self,
        other: &Filter,
        shared_reader_id: EndpointId,
        org_reader_id: EndpointId,
    ) -> PipelineResult<()> {
        if self.id == other.id {
            return Err(PipelineError::InvalidParameter(
                "cannot share a reader with the owning filter".into(),
            ));
        }
        let reader = self
            .reader(org_reader_id)
            .ok_or_else(|| PipelineError::InvalidParameter("reader to share does not exist".into()))?;
        if !reader.is_connected() {
            return Err(PipelineError::InvalidParameter(
                "reader to share is not connected".into(),
            ));
        }
        if let Some(existing) = other.reader(shared_reader_id) {
            if existing.is_connected() {
                return Err(PipelineError::AlreadyConnected {
                    filter: other.id,
                    reader: shared_reader_id,
                });
            }
        }
        {
            let mut endpoints = other.endpoints.lock();
            if endpoints.readers.len() >= other.shape.max_readers() {
                return Err(PipelineError::ArityExceeded {
                    filter: other.id,
                    kind: "reader",
                    limit: other.shape.max_readers(),
                });
            }
            if let Some(queue) = reader.queue() {
                if !other.io.reader_config(shared_reader_id, &queue) {
                    return Err(PipelineError::ReaderRejected {
                        filter: other.id,
                        reader: shared_reader_id,
                    });
                }
            }
            endpoints.readers.insert(shared_reader_id, reader.clone());
        }
        reader.add_sharer(other.id, shared_reader_id);
        Ok(())
    }

    /// Drops a writer endpoint, marking its queue disconnected.
    pub fn disconnect_writer(&self, writer_id: EndpointId) -> bool {
        match self.endpoints.lock().writers.remove(&writer_id) {
            Some(writer) => {
                writer.disconnect();
                true
            }
            None => {
                log::warn!("[Filter {}] Writer {} does not exist", self.id, writer_id);
                false
            }
        }
    }

    /// Drops a reader endpoint; shared readers only detach this filter.
    pub fn disconnect_reader(&self, reader_id: EndpointId) -> bool {
        match self.endpoints.lock().readers.remove(&reader_id) {
            Some(reader) => {
                reader.disconnect(self.id);
                true
            }
            None => false,
        }
    }

    /// Disconnects every endpoint (used at pipeline teardown).
    pub fn disconnect_all(&self) {
        let (readers, writers) = {
            let endpoints = self.endpoints.lock();
            (
                endpoints.readers.keys().copied().collect::<Vec<_>>(),
                endpoints.writers.keys().copied().collect::<Vec<_>>(),
            )
        };
        for id in writers {
            self.disconnect_writer(id);
        }
        for id in readers {
            self.disconnect_reader(id);
        }
    }

    /// True while any reader still has committed frames waiting.
    #[must_use]
    pub fn pending_jobs(&self) -> bool {
        self.endpoints
            .lock()
            .readers
            .values()
            .any(|r| r.queue_elements() > 0)
    }

    fn set_reader(
        &self,
        reader_id: EndpointId,
        queue: Arc<dyn FrameQueue>,
    ) -> PipelineResult<Arc<Reader>> {
        let mut endpoints = self.endpoints.lock();
        if endpoints.readers.len() >= self.shape.max_readers() {
            return Err(PipelineError::ArityExceeded {
                filter: self.id,
                kind: "reader",
                limit: self.shape.max_readers(),
            });
        }
        if endpoints.readers.contains_key(&reader_id) {
            return Err(PipelineError::AlreadyConnected {
                filter: self.id,
                reader: reader_id,
            });
        }
        if !self.io.reader_config(reader_id, &queue) {
            return Err(PipelineError::ReaderRejected {
                filter: self.id,
                reader: reader_id,
            });
        }
        let reader = Arc::new(Reader::new());
        reader.set_connection(queue);
        reader.add_sharer(self.id, reader_id);
        endpoints.readers.insert(reader_id, reader.clone());
        Ok(reader)
    }

    fn delete_writer(&self, writer_id: EndpointId) {
        self.endpoints.lock().writers.remove(&writer_id);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Iteration
    // ─────────────────────────────────────────────────────────────────────

    /// One processing iteration: drain eligible events, demand input and
    /// output frames, run the body, commit and acknowledge. Returns the
    /// progress hint and the filter ids to wake.
    pub fn process_frame(&self) -> (Progress, Vec<FilterId>) {
        let _iteration = self.iteration.lock();
        self.drain_events();
        match self.role {
            FilterRole::Regular => self.regular_iteration(),
            FilterRole::Server => self.server_iteration(),
        }
    }

    fn drain_events(&self) {
        let now = Instant::now();
        while let Some(event) = self.events.pop_ready(now) {
            let mut body = self.body.lock();
            match body.handle_event(event.action(), event.params()) {
                None => log::error!(
                    "[Filter {}] Unknown action '{}' while processing event",
                    self.id,
                    event.action()
                ),
                Some(false) => log::error!(
                    "[Filter {}] Event handler for '{}' failed",
                    self.id,
                    event.action()
                ),
                Some(true) => {}
            }
        }
    }

    fn regular_iteration(&self) -> (Progress, Vec<FilterId>) {
        let readers = self.live_readers();
        let writers = self.live_writers();

        let (org, org_ok) = self.demand_origin(&readers);
        let dst = self.demand_destination(&writers);
        let dst_ok = self.shape.max_writers() == 0 || !dst.is_empty();

        if !org_ok || !dst_ok {
            // Acknowledge whatever was reported new so stale frames cannot
            // wedge the queue; this is also how outdated frames are shed.
            self.ack_new(&readers, &org);
            return (Progress::Wait, Vec::new());
        }

        let wake = self.run_body(org, dst, &readers, &writers);
        (Progress::Worked, wake)
    }

    fn server_iteration(&self) -> (Progress, Vec<FilterId>) {
        let readers = self.live_readers();
        let writers = self.live_writers();
        let (org, _) = self.demand_origin(&readers);
        let dst = self.demand_destination(&writers);
        let wake = self.run_body(org, dst, &readers, &writers);
        (Progress::Worked, wake)
    }

    /// Readers snapshot with disconnected ones pruned.
    fn live_readers(&self) -> Vec<(EndpointId, Arc<Reader>)> {
        let snapshot: Vec<_> = {
            let endpoints = self.endpoints.lock();
            endpoints
                .readers
                .iter()
                .map(|(id, r)| (*id, r.clone()))
                .collect()
        };
        let mut live = Vec::with_capacity(snapshot.len());
        for (id, reader) in snapshot {
            if reader.is_dead() {
                log::debug!("[Filter {}] Dropping dead reader {}", self.id, id);
                self.disconnect_reader(id);
            } else {
                live.push((id, reader));
            }
        }
        live
    }

    fn live_writers(&self) -> Vec<(EndpointId, Arc<Writer>)> {
        let snapshot: Vec<_> = {
            let endpoints = self.endpoints.lock();
            endpoints
                .writers
                .iter()
                .map(|(id, w)| (*id, w.clone()))
                .collect()
        };
        let mut live = Vec::with_capacity(snapshot.len());
        for (id, writer) in snapshot {
            if writer.is_dead() {
                log::debug!("[Filter {}] Dropping dead writer {}", self.id, id);
                self.disconnect_writer(id);
            } else {
                live.push((id, writer));
            }
        }
        live
    }

    fn demand_origin(&self, readers: &[(EndpointId, Arc<Reader>)]) -> (Vec<OrgFrame>, bool) {
        if self.shape.max_readers() == 0 {
            return (Vec::new(), true);
        }
        if readers.is_empty() {
            return (Vec::new(), false);
        }
        let (frame_time, ref_reader) = {
            let pacing = self.pacing.lock();
            (pacing.frame_time_us, pacing.ref_reader)
        };
        let has_ref = ref_reader.is_some_and(|r| readers.iter().any(|(id, _)| *id == r));
        if frame_time == 0 && !has_ref {
            self.demand_best_effort(readers)
        } else if frame_time == 0 {
            self.demand_synchronized(readers, ref_reader.unwrap_or(DEFAULT_ID))
        } else {
            self.demand_paced(readers, frame_time)
        }
    }

    /// Pull from every reader; proceed with whatever is available as long
    /// as at least one frame is new.
    fn demand_best_effort(&self, readers: &[(EndpointId, Arc<Reader>)]) -> (Vec<OrgFrame>, bool) {
        let mut org = Vec::with_capacity(readers.len());
        let mut any_new = false;
        for (id, reader) in readers {
            let Some((frame, new)) = reader.get_frame(self.id, true) else {
                continue;
            };
            any_new |= new;
            org.push(OrgFrame {
                id: *id,
                frame,
                new,
            });
        }
        (org, any_new)
    }

    /// Align every reader inside `[T - margin, T + margin]` around the
    /// reference reader's presentation time `T`, discarding older frames.
    fn demand_synchronized(
        &self,
        readers: &[(EndpointId, Arc<Reader>)],
        ref_id: EndpointId,
    ) -> (Vec<OrgFrame>, bool) {
        let margin = self.pacing.lock().sync_margin_us;
        let Some((_, ref_reader)) = readers.iter().find(|(id, _)| *id == ref_id) else {
            return (Vec::new(), false);
        };
        let Some((ref_frame, ref_new)) = ref_reader.get_frame(self.id, true) else {
            return (Vec::new(), false);
        };
        let wall = ref_frame.lock().pts();
        let mut org = vec![OrgFrame {
            id: ref_id,
            frame: ref_frame,
            new: ref_new,
        }];

        for (id, reader) in readers {
            if *id == ref_id {
                continue;
            }
            let Some((mut frame, mut new)) = reader.get_frame(self.id, true) else {
                continue;
            };
            let mut pts = frame.lock().pts();
            // Shed frames that fell behind the window.
            while new && pts + margin < wall {
                reader.remove_frame(self.id);
                match reader.get_frame(self.id, true) {
                    Some((next, next_new)) => {
                        frame = next;
                        new = next_new;
                        pts = frame.lock().pts();
                    }
                    None => break,
                }
            }
            if pts + margin >= wall && pts <= wall + margin {
                org.push(OrgFrame {
                    id: *id,
                    frame,
                    new,
                });
            }
        }

        let ok = org.len() == readers.len() && org.iter().any(|o| o.new);
        (org, ok)
    }

    /// Accept only frames inside the window `[sync_ts, sync_ts +
    /// frame_time]`; older frames are outdated (shed via the failed-demand
    /// acknowledge), newer ones shift the window forward once no reader has
    /// an in-window frame.
    fn demand_paced(
        &self,
        readers: &[(EndpointId, Arc<Reader>)],
        frame_time: u64,
    ) -> (Vec<OrgFrame>, bool) {
        let mut pacing = self.pacing.lock();
        let mut org = Vec::with_capacity(readers.len());
        let mut out_of_scope: Option<u64> = None;
        let mut outdated = false;
        let mut valid = false;
        let mut any_new = false;

        for (id, reader) in readers {
            let Some((frame, new)) = reader.get_frame(self.id, true) else {
                continue;
            };
            let pts = frame.lock().pts();
            org.push(OrgFrame {
                id: *id,
                frame,
                new,
            });
            if !new {
                continue;
            }
            any_new = true;
            if pts > pacing.sync_ts + frame_time {
                out_of_scope = Some(out_of_scope.map_or(pts, |v| v.min(pts)));
                continue;
            }
            if pts < pacing.sync_ts {
                outdated = true;
                continue;
            }
            valid = true;
        }

        if !any_new {
            return (org, false);
        }
        if !valid {
            if let Some(oos) = out_of_scope {
                if oos > pacing.sync_ts && !outdated {
                    pacing.sync_ts = oos;
                    return (org, true);
                }
            }
            return (org, !outdated);
        }
        pacing.sync_ts += frame_time;
        (org, true)
    }

    fn demand_destination(
        &self,
        writers: &[(EndpointId, Arc<Writer>)],
    ) -> Vec<(EndpointId, FrameRef)> {
        let mut dst = Vec::with_capacity(writers.len());
        for (id, writer) in writers {
            if let Some(frame) = writer.get_frame(true) {
                dst.push((*id, frame));
            }
        }
        dst
    }

    fn ack_new(&self, readers: &[(EndpointId, Arc<Reader>)], org: &[OrgFrame]) {
        for frame in org.iter().filter(|o| o.new) {
            if let Some((_, reader)) = readers.iter().find(|(id, _)| *id == frame.id) {
                reader.remove_frame(self.id);
            }
        }
    }

    /// Secures all frames, runs the body, stamps committed outputs
    /// according to the shape, commits and acknowledges. No queue lock is
    /// held while the body runs; the frames themselves are.
    fn run_body(
        &self,
        org: Vec<OrgFrame>,
        dst: Vec<(EndpointId, FrameRef)>,
        readers: &[(EndpointId, Arc<Reader>)],
        writers: &[(EndpointId, Arc<Writer>)],
    ) -> Vec<FilterId> {
        let new_ids: Vec<EndpointId> = org.iter().filter(|o| o.new).map(|o| o.id).collect();

        let mut committed: Vec<EndpointId> = Vec::new();
        {
            let mut org_guards: Vec<_> = org
                .iter()
                .map(|o| (o.id, o.new, o.frame.lock()))
                .collect();
            let mut dst_guards: Vec<_> = dst.iter().map(|(id, f)| (*id, f.lock())).collect();

            for (_, new, guard) in &mut org_guards {
                guard.set_consumed(*new);
            }
            for (_, guard) in &mut dst_guards {
                guard.set_consumed(false);
            }

            let inherit = org_guards
                .first()
                .map(|(_, _, g)| (g.origin_ts(), g.sequence()));

            let mut org_set = FrameSet {
                frames: org_guards
                    .iter_mut()
                    .map(|(id, _, g)| (*id, &mut **g))
                    .collect::<BTreeMap<_, _>>(),
                new_ids: new_ids.clone(),
            };
            let mut dst_set = FrameSet {
                frames: dst_guards
                    .iter_mut()
                    .map(|(id, g)| (*id, &mut **g))
                    .collect::<BTreeMap<_, _>>(),
                new_ids: Vec::new(),
            };

            let ok = {
                let mut body = self.body.lock();
                body.process(&mut org_set, &mut dst_set)
            };

            if ok {
                for (id, frame) in dst_set.iter_mut() {
                    if !frame.consumed() {
                        continue;
                    }
                    match self.shape {
                        FilterShape::OneToMany(_) => {
                            if let Some((origin, sequence)) = inherit {
                                frame.set_origin_ts(origin);
                                frame.set_sequence(sequence);
                            }
                        }
                        FilterShape::OneToOne => {
                            if let Some((origin, _)) = inherit {
                                frame.set_origin_ts(origin);
                            }
                            if let Some((_, writer)) = writers.iter().find(|(w, _)| *w == id) {
                                frame.set_sequence(writer.next_sequence());
                            }
                        }
                        FilterShape::Head(_) | FilterShape::ManyToOne(_) => {
                            frame.refresh_origin();
                            if let Some((_, writer)) = writers.iter().find(|(w, _)| *w == id) {
                                frame.set_sequence(writer.next_sequence());
                            }
                        }
                        FilterShape::Tail(_) => {}
                    }
                    committed.push(id);
                }
            }
            // Guards drop here; commit and acknowledge happen lock-free.
        }

        let mut wake: Vec<FilterId> = Vec::new();
        for id in committed {
            if let Some((_, writer)) = writers.iter().find(|(w, _)| *w == id) {
                wake.extend(writer.add_frame());
            }
        }
        for id in &new_ids {
            if let Some((_, reader)) = readers.iter().find(|(r, _)| r == id) {
                reader.remove_frame(self.id);
            }
        }
        wake.sort_unstable();
        wake.dedup();
        wake
    }

    // ─────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────

    /// JSON dump of this filter's runtime state.
    #[must_use]
    pub fn state(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".into(), json!(self.id));
        map.insert("role".into(), json!(self.role.name()));
        map.insert("shape".into(), json!(self.shape.name()));
        {
            let body = self.body.lock();
            map.insert("type".into(), json!(body.type_name()));
            body.append_state(&mut map);
        }
        {
            let endpoints = self.endpoints.lock();
            let readers: Vec<Value> = endpoints
                .readers
                .iter()
                .map(|(id, r)| {
                    json!({
                        "id": id,
                        "connected": r.is_connected(),
                        "queue_elements": r.queue_elements(),
                        "avg_delay_us": r.avg_delay_us(),
                        "lost_blocks": r.lost_blocks(self.id),
                    })
                })
                .collect();
            let writers: Vec<Value> = endpoints
                .writers
                .iter()
                .map(|(id, w)| {
                    let queue = w.queue();
                    json!({
                        "id": id,
                        "connected": w.is_connected(),
                        "queue_elements": queue.as_ref().map_or(0, |q| q.elements()),
                        "discarded": queue.as_ref().map_or(0, |q| q.discarded()),
                    })
                })
                .collect();
            map.insert("readers".into(), Value::Array(readers));
            map.insert("writers".into(), Value::Array(writers));
        }
        {
            let pacing = self.pacing.lock();
            map.insert("frame_time_us".into(), json!(pacing.frame_time_us));
            map.insert("sync_ts".into(), json!(pacing.sync_ts));
        }
        map.insert("pending_events".into(), json!(self.events.len()));
        Value::Object(map)
    }
}
