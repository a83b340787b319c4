//! Pipeline construction and scheduling.
//!
//! The [`PipelineManager`] owns the filter registry, builds and validates
//! linear paths, connects them, and drives scheduling: one cooperative task
//! per filter, sleeping on wait hints and woken by commits into its input
//! queues. Stopping cancels every task, lets in-flight iterations finish,
//! then disconnects the graph in reverse topological order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::SchedulerConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::event::Event;
use crate::filter::{Filter, FilterRole, Progress};
use crate::monitor::{NoopObserver, PipelineEvent, PipelineObserver};
use crate::queue::{EndpointId, FilterId};
use crate::runtime::{TaskSpawner, TokioSpawner};

/// One linear chain from a head writer to a tail reader.
#[derive(Debug, Clone)]
pub struct Path {
    pub head: FilterId,
    pub head_writer: EndpointId,
    pub tail: FilterId,
    pub tail_reader: EndpointId,
    pub intermediates: Vec<FilterId>,
}

impl Path {
    /// All filters of the chain, upstream first.
    fn chain(&self) -> Vec<FilterId> {
        let mut ids = Vec::with_capacity(self.intermediates.len() + 2);
        ids.push(self.head);
        ids.extend(&self.intermediates);
        ids.push(self.tail);
        ids
    }
}

type WakeTable = Arc<DashMap<FilterId, Arc<Notify>>>;

/// Builds and runs a filter graph.
pub struct PipelineManager {
    filters: DashMap<FilterId, Arc<Filter>>,
    paths: DashMap<u32, Path>,
    path_order: Mutex<Vec<u32>>,
    wakes: WakeTable,
    scheduler: SchedulerConfig,
    observer: Arc<dyn PipelineObserver>,
    spawner: Arc<dyn TaskSpawner>,
    cancel: Mutex<CancellationToken>,
    tracker: Mutex<TaskTracker>,
    running: AtomicBool,
}

impl PipelineManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            filters: DashMap::new(),
            paths: DashMap::new(),
            path_order: Mutex::new(Vec::new()),
            wakes: Arc::new(DashMap::new()),
            scheduler: SchedulerConfig::default(),
            observer: Arc::new(NoopObserver),
            spawner: Arc::new(TokioSpawner),
            cancel: Mutex::new(CancellationToken::new()),
            tracker: Mutex::new(TaskTracker::new()),
            running: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn with_spawner(mut self, spawner: Arc<dyn TaskSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Registry
    // ─────────────────────────────────────────────────────────────────────

    /// Registers a filter under its own id.
    pub fn add_filter(&self, filter: Filter) -> PipelineResult<Arc<Filter>> {
        let id = filter.id();
        if self.filters.contains_key(&id) {
            return Err(PipelineError::DuplicateFilter(id));
        }
        let filter = Arc::new(filter);
        self.filters.insert(id, filter.clone());
        self.observer.notify(PipelineEvent::FilterAdded { filter: id });
        Ok(filter)
    }

    #[must_use]
    pub fn filter(&self, id: FilterId) -> Option<Arc<Filter>> {
        self.filters.get(&id).map(|f| f.value().clone())
    }

    /// Disconnects and removes one filter.
    pub fn remove_filter(&self, id: FilterId) -> PipelineResult<()> {
        let (_, filter) = self
            .filters
            .remove(&id)
            .ok_or(PipelineError::UnknownFilter(id))?;
        filter.disconnect_all();
        self.wakes.remove(&id);
        self.observer
            .notify(PipelineEvent::FilterRemoved { filter: id });
        Ok(())
    }

    #[must_use]
    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Paths
    // ─────────────────────────────────────────────────────────────────────

    /// Validates and records a linear path. Arity is checked up front so a
    /// later connect cannot fail halfway through the chain.
    pub fn create_path(
        &self,
        path_id: u32,
        head: FilterId,
        head_writer: EndpointId,
        tail: FilterId,
        tail_reader: EndpointId,
        intermediates: Vec<FilterId>,
    ) -> PipelineResult<()> {
        if self.paths.contains_key(&path_id) {
            return Err(PipelineError::InvalidPath(format!(
                "path {path_id} already exists"
            )));
        }
        let head_filter = self
            .filter(head)
            .ok_or(PipelineError::UnknownFilter(head))?;
        let tail_filter = self
            .filter(tail)
            .ok_or(PipelineError::UnknownFilter(tail))?;
        if head_filter.shape().max_writers() == 0 {
            return Err(PipelineError::InvalidPath(format!(
                "head filter {head} has no writers"
            )));
        }
        if tail_filter.shape().max_readers() == 0 {
            return Err(PipelineError::InvalidPath(format!(
                "tail filter {tail} has no readers"
            )));
        }
        for id in &intermediates {
            let filter = self.filter(*id).ok_or(PipelineError::UnknownFilter(*id))?;
            if filter.shape().max_readers() == 0 || filter.shape().max_writers() == 0 {
                return Err(PipelineError::InvalidPath(format!(
                    "intermediate filter {id} must read and write"
                )));
            }
        }
        self.paths.insert(
            path_id,
            Path {
                head,
                head_writer,
                tail,
                tail_reader,
                intermediates,
            },
        );
        self.path_order.lock().push(path_id);
        self.observer.notify(PipelineEvent::PathCreated { path: path_id });
        Ok(())
    }

    /// Connects every link of a recorded path. Endpoint ids at the path's
    /// edges are the recorded ones; intermediate links auto-allocate.
    pub fn connect_path(&self, path_id: u32) -> PipelineResult<()> {
        let path = self
            .paths
            .get(&path_id)
            .map(|p| p.value().clone())
            .ok_or(PipelineError::UnknownPath(path_id))?;
        let chain = path.chain();

        for window in chain.windows(2) {
            let (up_id, down_id) = (window[0], window[1]);
            let upstream = self.filter(up_id).ok_or(PipelineError::UnknownFilter(up_id))?;
            let downstream = self
                .filter(down_id)
                .ok_or(PipelineError::UnknownFilter(down_id))?;

            let writer_id = if up_id == path.head {
                path.head_writer
            } else {
                upstream.generate_writer_id()
            };
            let reader_id = if down_id == path.tail {
                path.tail_reader
            } else {
                downstream.generate_reader_id()
            };

            upstream.connect(&downstream, writer_id, reader_id)?;
            self.observer.notify(PipelineEvent::Connected {
                from: up_id,
                writer: writer_id,
                to: down_id,
                reader: reader_id,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn path(&self, path_id: u32) -> Option<Path> {
        self.paths.get(&path_id).map(|p| p.value().clone())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Scheduling
    // ─────────────────────────────────────────────────────────────────────

    /// Spawns one cooperative task per registered filter.
    pub fn start(&self) -> PipelineResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::AlreadyRunning);
        }
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        *self.cancel.lock() = cancel.clone();

        for entry in self.filters.iter() {
            let filter = entry.value().clone();
            let wake = Arc::new(Notify::new());
            self.wakes.insert(filter.id(), wake);
            let task = run_filter(
                filter,
                self.wakes.clone(),
                cancel.clone(),
                self.scheduler.wait(),
            );
            self.spawner.spawn(Box::pin(tracker.track_future(task)));
        }
        tracker.close();
        *self.tracker.lock() = tracker;

        self.observer.notify(PipelineEvent::Started {
            filters: self.filters.len(),
        });
        log::info!("[Pipeline] Started {} filters", self.filters.len());
        Ok(())
    }

    /// Cancels all filter tasks, waits for in-flight iterations to finish,
    /// then disconnects paths tail-first.
    pub async fn stop(&self) -> PipelineResult<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(PipelineError::NotRunning);
        }
        self.cancel.lock().cancel();
        let tracker = self.tracker.lock().clone();
        tracker.wait().await;
        self.running.store(false, Ordering::Release);

        let order: Vec<u32> = self.path_order.lock().iter().rev().copied().collect();
        for path_id in order {
            if let Some(path) = self.path(path_id) {
                for id in path.chain().into_iter().rev() {
                    if let Some(filter) = self.filter(id) {
                        filter.disconnect_all();
                    }
                }
            }
        }
        // Filters outside any path still release their endpoints.
        for entry in self.filters.iter() {
            entry.value().disconnect_all();
        }

        self.observer.notify(PipelineEvent::Stopped);
        log::info!("[Pipeline] Stopped");
        Ok(())
    }

    /// Enqueues an event on a filter and wakes it.
    pub fn push_event(&self, filter_id: FilterId, event: Event) -> PipelineResult<()> {
        let filter = self
            .filter(filter_id)
            .ok_or(PipelineError::UnknownFilter(filter_id))?;
        filter.push_event(event);
        if let Some(wake) = self.wakes.get(&filter_id) {
            wake.notify_one();
        }
        Ok(())
    }

    /// Aggregated JSON state of the whole pipeline.
    #[must_use]
    pub fn state(&self) -> Value {
        let mut filters = Map::new();
        for entry in self.filters.iter() {
            filters.insert(entry.key().to_string(), entry.value().state());
        }
        let paths: Vec<Value> = self
            .path_order
            .lock()
            .iter()
            .filter_map(|id| self.path(*id).map(|p| (id, p)))
            .map(|(id, p)| {
                json!({
                    "id": id,
                    "head": p.head,
                    "tail": p.tail,
                    "intermediates": p.intermediates,
                })
            })
            .collect();
        json!({
            "running": self.is_running(),
            "filters": filters,
            "paths": paths,
        })
    }
}

impl Default for PipelineManager {
    fn default() -> Self {
        Self::new()
    }
}

fn notify_filters(wakes: &WakeTable, ids: &[FilterId]) {
    for id in ids {
        if let Some(wake) = wakes.get(id) {
            wake.notify_one();
        }
    }
}

/// Per-filter scheduler loop.
///
/// REGULAR filters run whenever woken or after the wait hint elapses;
/// SERVER filters tick on their own cadence regardless of input.
async fn run_filter(
    filter: Arc<Filter>,
    wakes: WakeTable,
    cancel: CancellationToken,
    wait: Duration,
) {
    match filter.role() {
        FilterRole::Server => {
            let frame_time = filter.frame_time();
            let period = if frame_time.is_zero() { wait } else { frame_time };
            let mut metronome = tokio::time::interval(period);
            metronome.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = metronome.tick() => {
                        let (_, wake_ids) = filter.process_frame();
                        notify_filters(&wakes, &wake_ids);
                    }
                }
            }
        }
        FilterRole::Regular => {
            let notify = wakes
                .get(&filter.id())
                .map(|entry| entry.value().clone())
                .unwrap_or_else(|| Arc::new(Notify::new()));
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let (progress, wake_ids) = filter.process_frame();
                notify_filters(&wakes, &wake_ids);
                match progress {
                    Progress::Worked => tokio::task::yield_now().await,
                    Progress::Wait => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = notify.notified() => {}
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }
        }
    }
    log::debug!("[Pipeline] Filter {} task exited", filter.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::filter::builtin::{Collector, CollectorHandle, FrameSource, Passthrough};
    use crate::stream_info::{StreamInfo, VideoCodec, VideoStreamInfo};
    use serde_json::json;

    fn video_info() -> StreamInfo {
        StreamInfo::video(VideoStreamInfo {
            codec: VideoCodec::H264,
            pixel_format: None,
            width: 0,
            height: 0,
            annexb: false,
        })
    }

    fn server_source(id: FilterId) -> Filter {
        let filter = Filter::new(
            id,
            FilterRole::Server,
            Box::new(
                FrameSource::new(video_info(), QueueConfig::new(32)).with_pts_step_us(2_000),
            ),
        );
        filter.set_frame_time(Duration::from_millis(2));
        filter
    }

    fn passthrough(id: FilterId) -> Filter {
        Filter::new(
            id,
            FilterRole::Regular,
            Box::new(Passthrough::new(video_info(), QueueConfig::new(32))),
        )
    }

    fn collector(id: FilterId) -> (Filter, CollectorHandle) {
        let (body, handle) = Collector::new(1);
        (Filter::new(id, FilterRole::Regular, Box::new(body)), handle)
    }

    fn build_linear(manager: &PipelineManager) -> CollectorHandle {
        manager.add_filter(server_source(1)).unwrap();
        manager.add_filter(passthrough(2)).unwrap();
        let (sink, handle) = collector(3);
        manager.add_filter(sink).unwrap();
        manager
            .create_path(1, 1, crate::constants::DEFAULT_ID, 3, crate::constants::DEFAULT_ID, vec![2])
            .unwrap();
        manager.connect_path(1).unwrap();
        handle
    }

    async fn wait_for(handle: &CollectorHandle, count: usize) -> bool {
        for _ in 0..200 {
            if handle.len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    mod registry {
        use super::*;

        #[test]
        fn duplicate_filter_ids_are_rejected() {
            let manager = PipelineManager::new();
            manager.add_filter(passthrough(1)).unwrap();
            let err = manager.add_filter(passthrough(1)).unwrap_err();
            assert!(matches!(err, PipelineError::DuplicateFilter(1)));
        }

        #[test]
        fn remove_unknown_filter_fails() {
            let manager = PipelineManager::new();
            assert!(matches!(
                manager.remove_filter(9),
                Err(PipelineError::UnknownFilter(9))
            ));
        }
    }

    mod paths {
        use super::*;

        #[test]
        fn path_validation_checks_arity() {
            let manager = PipelineManager::new();
            manager.add_filter(server_source(1)).unwrap();
            let (sink, _) = collector(2);
            manager.add_filter(sink).unwrap();

            // Tail as head: has no writers.
            let err = manager.create_path(1, 2, 1, 1, 1, vec![]).unwrap_err();
            assert!(matches!(err, PipelineError::InvalidPath(_)));

            // Unknown intermediate.
            let err = manager.create_path(1, 1, 1, 2, 1, vec![42]).unwrap_err();
            assert!(matches!(err, PipelineError::UnknownFilter(42)));

            manager.create_path(1, 1, 1, 2, 1, vec![]).unwrap();
            let err = manager.create_path(1, 1, 1, 2, 1, vec![]).unwrap_err();
            assert!(matches!(err, PipelineError::InvalidPath(_)));
        }

        #[test]
        fn connect_path_wires_the_chain() {
            let manager = PipelineManager::new();
            let handle = build_linear(&manager);
            assert!(handle.is_empty());
            let source = manager.filter(1).unwrap();
            assert!(source.writer(crate::constants::DEFAULT_ID).unwrap().is_connected());
        }
    }

    mod scheduling {
        use super::*;

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn frames_flow_while_running() {
            let manager = PipelineManager::new();
            let handle = build_linear(&manager);

            manager.start().unwrap();
            assert!(manager.is_running());
            assert!(wait_for(&handle, 5).await, "sink should receive frames");

            manager.stop().await.unwrap();
            assert!(!manager.is_running());

            let frames = handle.frames();
            let pts: Vec<u64> = frames.iter().map(|f| f.pts).collect();
            let mut sorted = pts.clone();
            sorted.sort_unstable();
            assert_eq!(pts, sorted, "presentation times must be in order");
            assert_eq!(frames[0].pts, 0);
        }

        #[tokio::test(start_paused = true)]
        async fn virtual_time_drives_the_cadence() {
            // With paused time, sleeps auto-advance once every task is
            // idle, so the whole pipeline runs in virtual time.
            let manager = PipelineManager::new();
            let handle = build_linear(&manager);

            manager.start().unwrap();
            assert!(wait_for(&handle, 10).await, "cadence should tick virtually");
            manager.stop().await.unwrap();

            // Source emits every 2 ms with a 2000 µs pts step.
            let pts: Vec<u64> = handle.frames().iter().map(|f| f.pts).collect();
            assert_eq!(pts[..3].to_vec(), vec![0, 2_000, 4_000]);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn start_twice_fails_and_stop_recovers() {
            let manager = PipelineManager::new();
            let _handle = build_linear(&manager);

            manager.start().unwrap();
            assert!(matches!(manager.start(), Err(PipelineError::AlreadyRunning)));
            manager.stop().await.unwrap();
            assert!(matches!(
                manager.stop().await,
                Err(PipelineError::NotRunning)
            ));
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn events_reach_running_filters() {
            let manager = PipelineManager::new();
            let handle = build_linear(&manager);

            manager.start().unwrap();
            assert!(wait_for(&handle, 2).await);

            manager
                .push_event(1, Event::new("configure", json!({"pts_step_us": 7_000})))
                .unwrap();
            assert!(matches!(
                manager.push_event(99, Event::new("x", Value::Null)),
                Err(PipelineError::UnknownFilter(99))
            ));

            // The new step shows up in the source's introspection dump
            // once the event has been drained.
            let mut applied = false;
            for _ in 0..100 {
                if manager.filter(1).unwrap().state()["pts_step_us"] == 7_000 {
                    applied = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            manager.stop().await.unwrap();
            assert!(applied, "configure event should be applied");
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn stop_disconnects_the_graph() {
            let manager = PipelineManager::new();
            let handle = build_linear(&manager);
            manager.start().unwrap();
            assert!(wait_for(&handle, 1).await);
            manager.stop().await.unwrap();

            let source = manager.filter(1).unwrap();
            assert!(source.writer(crate::constants::DEFAULT_ID).is_none());
            let state = manager.state();
            assert_eq!(state["running"], false);
        }
    }

    mod introspection {
        use super::*;

        #[test]
        fn state_aggregates_filters_and_paths() {
            let manager = PipelineManager::new();
            build_linear(&manager);
            let state = manager.state();
            assert_eq!(state["running"], false);
            assert_eq!(state["paths"][0]["head"], 1);
            assert_eq!(state["filters"]["2"]["type"], "passthrough");
        }
    }
}
