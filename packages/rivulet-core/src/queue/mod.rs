//! Bounded frame queues.
//!
//! Every connection between two filters is backed by one queue with a
//! single producing writer and one or more consuming filters (possibly
//! sharing a single reader). The [`FrameQueue`] trait is the whole contract:
//! slots are preallocated [`Frame`]s handed out by reference, committed with
//! `add_frame` and released with `remove_frame`. Nothing a producer writes
//! is visible to consumers before the commit.

mod audio;
mod framed;
mod sliced;

pub use audio::AudioCircularBuffer;
pub use framed::FramedQueue;
pub use sliced::SlicedVideoQueue;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::frame::Frame;
use crate::stream_info::StreamInfo;

/// Identifier of a filter within a pipeline.
pub type FilterId = u32;

/// Identifier of a reader or writer endpoint within a filter.
pub type EndpointId = u32;

/// Shared handle to one preallocated queue slot.
///
/// The ring indices live behind the queue's own short-held lock; each slot
/// carries its own mutex so the producer can fill a rear slot while
/// consumers read the committed front. Lock order is always queue state
/// first, slot second, and no slot guard is ever held across a queue index
/// operation.
pub type FrameRef = Arc<Mutex<Frame>>;

/// Coarse fill state of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    /// Pre-rolling; reads are not served yet.
    Buffering,
    /// Normal operation.
    Ok,
    /// Free space is (nearly) exhausted.
    Full,
}

/// One consuming endpoint of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReaderData {
    pub filter_id: FilterId,
    pub reader_id: EndpointId,
}

/// Connection metadata carried by every queue: who produces into it and
/// which (filter, reader) pairs consume from it. Reader sharing appends
/// entries after construction.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionData {
    pub writer_filter_id: FilterId,
    pub writer_id: EndpointId,
    pub readers: Vec<ReaderData>,
}

impl ConnectionData {
    /// Builds the metadata for a fresh single-reader connection.
    #[must_use]
    pub fn new(
        writer_filter_id: FilterId,
        writer_id: EndpointId,
        reader_filter_id: FilterId,
        reader_id: EndpointId,
    ) -> Self {
        Self {
            writer_filter_id,
            writer_id,
            readers: vec![ReaderData {
                filter_id: reader_filter_id,
                reader_id,
            }],
        }
    }

    /// Filter ids of all consumers, used to wake them after a commit.
    #[must_use]
    pub fn reader_filter_ids(&self) -> Vec<FilterId> {
        let mut ids: Vec<FilterId> = self.readers.iter().map(|r| r.filter_id).collect();
        ids.dedup();
        ids
    }
}

/// Contract of every queue between two filters.
///
/// Exactly one producer calls the rear-side operations; any number of
/// sharing consumers call the front-side operations with their own filter
/// id. All operations are safe under that concurrency.
pub trait FrameQueue: Send + Sync {
    /// Stream description negotiated for this connection.
    fn stream_info(&self) -> &StreamInfo;

    /// Slot the producer should fill next, `None` when the queue is full
    /// (backpressure).
    fn get_rear(&self) -> Option<FrameRef>;

    /// Like [`FrameQueue::get_rear`] but guaranteed to return a slot,
    /// flushing the oldest committed frame until space exists. Flushed
    /// frames count as discarded.
    fn force_get_rear(&self) -> FrameRef;

    /// Commits the current rear slot and returns the filter ids of the
    /// consumers that should be woken.
    fn add_frame(&self) -> Vec<FilterId>;

    /// Earliest committed frame for the given consumer, or `None` when the
    /// queue is empty, disconnected, or the delay gate still holds. The
    /// flag is `true` the first time this consumer observes this slot.
    fn get_front(&self, consumer: FilterId) -> Option<(FrameRef, bool)>;

    /// Like [`FrameQueue::get_front`], but when nothing is readable returns
    /// the previously delivered frame unchanged (duplicate-instead-of-
    /// starve; the flag is `false`). `None` only if nothing was ever
    /// delivered.
    fn force_get_front(&self, consumer: FilterId) -> Option<(FrameRef, bool)>;

    /// Acknowledges the current front for this consumer; the front advances
    /// once every sharing consumer has acknowledged it.
    fn remove_frame(&self, consumer: FilterId);

    /// Drops the oldest committed frame to make room. Counted as a discard.
    fn flush(&self);

    /// Committed, unconsumed frames currently in the queue.
    fn elements(&self) -> usize;

    /// Slot capacity.
    fn capacity(&self) -> usize;

    /// A queue can only be read while both sides are connected.
    fn is_connected(&self) -> bool;

    /// Flips the connected flag; consumers learn a producer died by this
    /// turning `false`.
    fn set_connected(&self, connected: bool);

    /// Snapshot of the connection metadata.
    fn connection(&self) -> ConnectionData;

    /// Registers an additional sharing consumer. Idempotent per filter id.
    fn add_sharer(&self, reader: ReaderData);

    /// Unregisters a sharing consumer; may advance the front if the leaver
    /// was the last missing acknowledgement.
    fn remove_sharer(&self, filter_id: FilterId);

    /// Coarse fill state.
    fn state(&self) -> QueueState;

    /// Frames dropped by this queue (forced rears, overflow).
    fn discarded(&self) -> u64;
}
