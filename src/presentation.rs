//! Sinks that carry state snapshots to whatever renders them.
//!
//! Each state type has exactly one publisher (the supervisor, the pairing
//! monitor, the update orchestrator). The sink decides what to do with the
//! snapshot: forward it to a window, log it, or feed a `watch` channel.

use std::fmt::Debug;
use tokio::sync::watch;

/// Receives the latest snapshot of a state type whenever it changes
pub trait StateSink<T>: Send + Sync {
    fn publish(&self, snapshot: &T);
}

impl<T: Clone + Send + Sync> StateSink<T> for watch::Sender<T> {
    fn publish(&self, snapshot: &T) {
        self.send_replace(snapshot.clone());
    }
}

/// Adapter turning a closure into a sink
pub struct FnSink<F>(pub F);

impl<T, F> StateSink<T> for FnSink<F>
where
    F: Fn(&T) + Send + Sync,
{
    fn publish(&self, snapshot: &T) {
        (self.0)(snapshot)
    }
}

/// Sink that writes every snapshot to the log
pub struct LogSink {
    label: &'static str,
}

impl LogSink {
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }
}

impl<T: Debug> StateSink<T> for LogSink {
    fn publish(&self, snapshot: &T) {
        tracing::info!(target: "presentation", "{}: {:?}", self.label, snapshot);
    }
}

/// Sink that drops everything
pub struct NullSink;

impl<T> StateSink<T> for NullSink {
    fn publish(&self, _snapshot: &T) {}
}

/// Keeps every published snapshot, for inspection
#[cfg(test)]
pub struct RecordingSink<T> {
    snapshots: std::sync::Mutex<Vec<T>>,
}

#[cfg(test)]
impl<T: Clone> RecordingSink<T> {
    pub fn new() -> Self {
        Self {
            snapshots: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn snapshots(&self) -> Vec<T> {
        self.snapshots
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn last(&self) -> Option<T> {
        self.snapshots.lock().ok().and_then(|s| s.last().cloned())
    }
}

#[cfg(test)]
impl<T: Clone + Send> StateSink<T> for RecordingSink<T> {
    fn publish(&self, snapshot: &T) {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.push(snapshot.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_watch_sender_sink() {
        let (tx, rx) = watch::channel(0u32);
        tx.publish(&7);
        assert_eq!(*rx.borrow(), 7);
    }

    #[test]
    fn test_fn_sink_and_recording_sink() {
        let count = AtomicUsize::new(0);
        let sink = FnSink(|v: &u32| {
            count.fetch_add(*v as usize, Ordering::SeqCst);
        });
        sink.publish(&2);
        sink.publish(&3);
        assert_eq!(count.load(Ordering::SeqCst), 5);

        let recording = RecordingSink::new();
        recording.publish(&"a");
        recording.publish(&"b");
        assert_eq!(recording.len(), 2);
        assert_eq!(recording.last(), Some("b"));
    }
}
