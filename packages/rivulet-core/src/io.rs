//! Reader and Writer endpoints binding filters to queues.
//!
//! A [`Writer`] is owned by the producing filter and holds the per-writer
//! sequence counter. A [`Reader`] may be shared by several filters
//! consuming the same queue; it keeps per-sharer delivery statistics and
//! relays acknowledgements so the queue's front advances only when every
//! sharer is done. Both endpoints hold shared ownership of the queue, so a
//! disconnect can never leave a dangling reference: the queue lives while
//! either side still holds it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::queue::{EndpointId, FilterId, FrameQueue, FrameRef, ReaderData};
use crate::utils::now_micros;

/// Producer-side endpoint.
pub struct Writer {
    queue: Mutex<Option<Arc<dyn FrameQueue>>>,
    sequence: AtomicU64,
    saw_connected: AtomicBool,
}

impl Writer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(None),
            sequence: AtomicU64::new(0),
            saw_connected: AtomicBool::new(false),
        }
    }

    /// Attaches the queue this writer produces into.
    pub fn set_queue(&self, queue: Arc<dyn FrameQueue>) {
        *self.queue.lock() = Some(queue);
    }

    #[must_use]
    pub fn queue(&self) -> Option<Arc<dyn FrameQueue>> {
        self.queue.lock().clone()
    }

    /// Marks the attached queue connected, making it readable downstream.
    pub fn connect(&self) -> bool {
        match self.queue.lock().as_ref() {
            Some(queue) => {
                queue.set_connected(true);
                true
            }
            None => {
                log::error!("[Writer] Cannot connect without a queue");
                false
            }
        }
    }

    /// Detaches from the queue, marking it disconnected. The queue itself
    /// is freed once the readers drop their handles too.
    pub fn disconnect(&self) {
        if let Some(queue) = self.queue.lock().take() {
            queue.set_connected(false);
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        let connected = self
            .queue
            .lock()
            .as_ref()
            .is_some_and(|q| q.is_connected());
        if connected {
            self.saw_connected.store(true, Ordering::Relaxed);
        }
        connected
    }

    /// True once a previously working connection has gone away. Endpoints
    /// still being wired up are not dead.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.saw_connected.load(Ordering::Relaxed) && !self.is_connected()
    }

    /// Rear slot to fill next. With `force`, a slot is guaranteed by
    /// discarding the oldest committed frame when the queue is full.
    pub fn get_frame(&self, force: bool) -> Option<FrameRef> {
        let queue = self.queue.lock().clone()?;
        if !queue.is_connected() {
            log::error!("[Writer] The queue is not connected");
            return None;
        }
        match queue.get_rear() {
            Some(frame) => Some(frame),
            None if force => Some(queue.force_get_rear()),
            None => None,
        }
    }

    /// Commits the rear slot; returns the consumer filter ids to wake.
    pub fn add_frame(&self) -> Vec<FilterId> {
        match self.queue.lock().clone() {
            Some(queue) => queue.add_frame(),
            None => Vec::new(),
        }
    }

    /// Next value of the monotonic per-writer sequence.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-sharer delivery statistics.
#[derive(Debug, Default, Clone, Copy)]
struct SharerStats {
    last_sequence: Option<u64>,
    lost_blocks: u64,
    delay_sum_us: u64,
    delivered: u64,
}

struct SharerState {
    reader_id: EndpointId,
    stats: SharerStats,
}

/// Consumer-side endpoint, shareable across filters.
pub struct Reader {
    queue: Mutex<Option<Arc<dyn FrameQueue>>>,
    sharers: Mutex<HashMap<FilterId, SharerState>>,
    saw_connected: AtomicBool,
}

impl Reader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(None),
            sharers: Mutex::new(HashMap::new()),
            saw_connected: AtomicBool::new(false),
        }
    }

    /// Attaches the queue this reader consumes from. The reader reports
    /// connected only once the writer side has flipped the queue's flag.
    pub fn set_connection(&self, queue: Arc<dyn FrameQueue>) {
        *self.queue.lock() = Some(queue);
    }

    #[must_use]
    pub fn queue(&self) -> Option<Arc<dyn FrameQueue>> {
        self.queue.lock().clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        let connected = self
            .queue
            .lock()
            .as_ref()
            .is_some_and(|q| q.is_connected());
        if connected {
            self.saw_connected.store(true, Ordering::Relaxed);
        }
        connected
    }

    /// True once a previously working connection has gone away. Readers
    /// still being wired up are not dead.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.saw_connected.load(Ordering::Relaxed) && !self.is_connected()
    }

    /// Registers a sharing filter. The queue's connection metadata is
    /// extended so commits wake the new sharer too.
    pub fn add_sharer(&self, filter_id: FilterId, reader_id: EndpointId) {
        self.sharers.lock().insert(
            filter_id,
            SharerState {
                reader_id,
                stats: SharerStats::default(),
            },
        );
        if let Some(queue) = self.queue.lock().as_ref() {
            queue.add_sharer(ReaderData {
                filter_id,
                reader_id,
            });
        }
    }

    /// Front frame for the given sharer. `new_frame` is true on this
    /// sharer's first observation of the slot. With `force`, a drained
    /// queue yields the previously delivered frame instead of `None`.
    pub fn get_frame(&self, filter_id: FilterId, force: bool) -> Option<(FrameRef, bool)> {
        let queue = self.queue.lock().clone()?;
        if !queue.is_connected() {
            log::error!("[Reader] The queue is not connected");
            return None;
        }
        let mut found = queue.get_front(filter_id);
        if found.is_none() && force {
            found = queue.force_get_front(filter_id);
        }
        if let Some((frame, true)) = &found {
            self.record_delivery(filter_id, frame);
        }
        found
    }

    /// Acknowledges the current front for this sharer.
    pub fn remove_frame(&self, filter_id: FilterId) {
        if let Some(queue) = self.queue.lock().clone() {
            queue.remove_frame(filter_id);
        }
    }

    /// Detaches one sharer. When the last sharer leaves, the queue is
    /// marked disconnected and the handle dropped.
    pub fn disconnect(&self, filter_id: FilterId) {
        let empty = {
            let mut sharers = self.sharers.lock();
            sharers.remove(&filter_id);
            sharers.is_empty()
        };
        let mut slot = self.queue.lock();
        if let Some(queue) = slot.clone() {
            queue.remove_sharer(filter_id);
            if empty {
                queue.set_connected(false);
                *slot = None;
            }
        }
    }

    /// Committed frames currently waiting in the queue.
    #[must_use]
    pub fn queue_elements(&self) -> usize {
        self.queue.lock().as_ref().map_or(0, |q| q.elements())
    }

    /// Average origin-to-delivery delay over all new frames seen (µs).
    #[must_use]
    pub fn avg_delay_us(&self) -> u64 {
        let sharers = self.sharers.lock();
        let (sum, count) = sharers
            .values()
            .fold((0u64, 0u64), |(s, c), state| {
                (s + state.stats.delay_sum_us, c + state.stats.delivered)
            });
        if count == 0 {
            0
        } else {
            sum / count
        }
    }

    /// Sequence-number discontinuities observed by one sharer.
    #[must_use]
    pub fn lost_blocks(&self, filter_id: FilterId) -> u64 {
        self.sharers
            .lock()
            .get(&filter_id)
            .map_or(0, |s| s.stats.lost_blocks)
    }

    /// Reader id this sharer attached under.
    #[must_use]
    pub fn reader_id_for(&self, filter_id: FilterId) -> Option<EndpointId> {
        self.sharers.lock().get(&filter_id).map(|s| s.reader_id)
    }

    fn record_delivery(&self, filter_id: FilterId, frame: &FrameRef) {
        let (origin, sequence) = {
            let frame = frame.lock();
            (frame.origin_ts(), frame.sequence())
        };
        let mut sharers = self.sharers.lock();
        let Some(state) = sharers.get_mut(&filter_id) else {
            return;
        };
        let stats = &mut state.stats;
        stats.delivered += 1;
        stats.delay_sum_us += now_micros().saturating_sub(origin);
        if let Some(last) = stats.last_sequence {
            if sequence > last + 1 {
                stats.lost_blocks += sequence - last - 1;
            }
        }
        stats.last_sequence = Some(sequence);
    }
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}
