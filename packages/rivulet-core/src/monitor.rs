//! Pipeline lifecycle observation.
//!
//! The manager reports topology and scheduling happenings through a
//! [`PipelineObserver`] rather than a concrete transport, so embedders can
//! forward them to a UI, a control socket, or nowhere at all.

use crate::queue::{EndpointId, FilterId};

/// One lifecycle happening inside the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    FilterAdded {
        filter: FilterId,
    },
    FilterRemoved {
        filter: FilterId,
    },
    Connected {
        from: FilterId,
        writer: EndpointId,
        to: FilterId,
        reader: EndpointId,
    },
    PathCreated {
        path: u32,
    },
    Started {
        filters: usize,
    },
    Stopped,
}

/// Sink for pipeline lifecycle events.
pub trait PipelineObserver: Send + Sync {
    fn notify(&self, event: PipelineEvent);
}

/// Discards every event. Default for embedders that poll state instead.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {
    fn notify(&self, _event: PipelineEvent) {
        // No-op: state is available via PipelineManager::state()
    }
}

/// Logs every event at debug level.
pub struct LoggingObserver;

impl PipelineObserver for LoggingObserver {
    fn notify(&self, event: PipelineEvent) {
        tracing::debug!(?event, "pipeline_event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct RecordingObserver {
        events: Mutex<Vec<PipelineEvent>>,
    }

    impl PipelineObserver for RecordingObserver {
        fn notify(&self, event: PipelineEvent) {
            self.events.lock().push(event);
        }
    }

    #[test]
    fn recording_observer_sees_events_in_order() {
        let observer = Arc::new(RecordingObserver {
            events: Mutex::new(Vec::new()),
        });
        observer.notify(PipelineEvent::FilterAdded { filter: 1 });
        observer.notify(PipelineEvent::Started { filters: 1 });
        let events = observer.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], PipelineEvent::FilterAdded { filter: 1 });
    }
}
