//! Per-project fan-out of file change events to live event-stream
//! connections.
//!
//! The registry is one lock-protected map owned by [`FileChangeBroadcaster`].
//! Broadcasting snapshots a project's connections, writes outside the lock,
//! then removes any connection whose write failed. Sibling connections and
//! the producer never observe a failed write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::body::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum FileChangeKind {
    Connected,
    Changed,
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeEvent {
    #[serde(rename = "type")]
    pub kind: FileChangeKind,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl FileChangeEvent {
    pub fn new(project_id: &str, kind: FileChangeKind, path: Option<String>) -> Self {
        Self {
            kind,
            project_id: project_id.to_string(),
            path,
            timestamp: crate::now_unix_ms(),
        }
    }

    pub fn connected(project_id: &str) -> Self {
        Self::new(project_id, FileChangeKind::Connected, None)
    }

    /// `data: <json>\n\n`
    pub fn to_frame(&self) -> Bytes {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        Bytes::from(format!("data: {json}\n\n"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("connection buffer full")]
    Full,
}

/// One open event-stream consumer.
pub trait Connection: Send + Sync {
    fn id(&self) -> u64;
    fn write(&self, frame: Bytes) -> Result<(), ConnectionError>;
    fn close(&self);
    fn abort(&self, reason: &str);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Default)]
pub struct FileChangeBroadcaster {
    connections: Mutex<HashMap<String, Vec<Arc<dyn Connection>>>>,
    connection_ids: AtomicU64,
}

impl std::fmt::Debug for FileChangeBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChangeBroadcaster")
            .field("projects", &self.project_count())
            .finish()
    }
}

impl FileChangeBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids are unique for the lifetime of this broadcaster.
    pub fn next_connection_id(&self) -> u64 {
        self.connection_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// A fresh, unregistered [`SseConnection`] and the receiving end of its
    /// frames.
    pub fn open_sse(&self, capacity: usize) -> (Arc<SseConnection>, mpsc::Receiver<Bytes>) {
        SseConnection::channel(self.next_connection_id(), capacity)
    }

    /// Registers `connection` and sends it, and only it, a `connected` frame.
    pub fn add_connection(&self, project_id: &str, connection: Arc<dyn Connection>) {
        let frame = FileChangeEvent::connected(project_id).to_frame();
        if let Err(err) = connection.write(frame) {
            debug!(project_id = %project_id, connection_id = connection.id(), error = %err, "connection dropped before registration");
            connection.close();
            return;
        }
        self.lock()
            .entry(project_id.to_string())
            .or_default()
            .push(connection.clone());
        debug!(project_id = %project_id, connection_id = connection.id(), "event stream connected");
    }

    /// Removing an unknown connection is a no-op. Returns whether anything
    /// was removed.
    pub fn remove_connection(&self, project_id: &str, connection_id: u64) -> bool {
        let removed = {
            let mut connections = self.lock();
            let Some(list) = connections.get_mut(project_id) else {
                return false;
            };
            let before = list.len();
            list.retain(|conn| conn.id() != connection_id);
            let removed = list.len() != before;
            if list.is_empty() {
                connections.remove(project_id);
            }
            removed
        };
        if removed {
            debug!(project_id = %project_id, connection_id, "event stream disconnected");
        }
        removed
    }

    pub fn broadcast(&self, project_id: &str, event: &FileChangeEvent) -> BroadcastReport {
        self.broadcast_frame(project_id, event.to_frame())
    }

    /// Writes an SSE comment to every connection so dead peers are reaped.
    pub fn ping_all(&self) -> usize {
        let projects: Vec<String> = self.lock().keys().cloned().collect();
        projects
            .iter()
            .map(|project_id| {
                self.broadcast_frame(project_id, Bytes::from_static(b": ping\n\n"))
                    .dropped
            })
            .sum()
    }

    pub fn connection_count(&self, project_id: &str) -> usize {
        self.lock().get(project_id).map(Vec::len).unwrap_or(0)
    }

    pub fn project_count(&self) -> usize {
        self.lock().len()
    }

    fn broadcast_frame(&self, project_id: &str, frame: Bytes) -> BroadcastReport {
        let snapshot: Vec<Arc<dyn Connection>> = match self.lock().get(project_id) {
            Some(list) => list.clone(),
            None => return BroadcastReport::default(),
        };
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for connection in &snapshot {
            match connection.write(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(project_id = %project_id, connection_id = connection.id(), error = %err, "dropping event stream connection");
                    failed.push(connection.clone());
                }
            }
        }
        for connection in failed {
            if self.remove_connection(project_id, connection.id()) {
                report.dropped += 1;
            }
            connection.close();
        }
        report
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Arc<dyn Connection>>>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Connection that feeds an HTTP response body through a bounded channel.
/// A full or closed channel counts as a failed write.
#[derive(Debug)]
pub struct SseConnection {
    id: u64,
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl SseConnection {
    pub fn channel(id: u64, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let connection = Arc::new(Self {
            id,
            sender: Mutex::new(Some(sender)),
        });
        (connection, receiver)
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::Sender<Bytes>>> {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Connection for SseConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn write(&self, frame: Bytes) -> Result<(), ConnectionError> {
        let guard = self.sender();
        let sender = guard.as_ref().ok_or(ConnectionError::Closed)?;
        sender.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ConnectionError::Full,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    fn close(&self) {
        self.sender().take();
    }

    fn abort(&self, reason: &str) {
        if let Some(sender) = self.sender().take() {
            let payload = serde_json::json!({ "message": reason }).to_string();
            let _ = sender.try_send(Bytes::from(format!("event: error\ndata: {payload}\n\n")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingConnection {
        id: u64,
        frames: Mutex<Vec<String>>,
        broken: std::sync::atomic::AtomicBool,
        closed: std::sync::atomic::AtomicBool,
    }

    impl RecordingConnection {
        fn new(broadcaster: &FileChangeBroadcaster) -> Arc<Self> {
            Arc::new(Self {
                id: broadcaster.next_connection_id(),
                ..Default::default()
            })
        }

        fn frames(&self) -> Vec<String> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl Connection for RecordingConnection {
        fn id(&self) -> u64 {
            self.id
        }

        fn write(&self, frame: Bytes) -> Result<(), ConnectionError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ConnectionError::Closed);
            }
            self.frames
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&frame).to_string());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn abort(&self, _reason: &str) {
            self.close();
        }
    }

    fn changed(project_id: &str, path: &str) -> FileChangeEvent {
        FileChangeEvent::new(project_id, FileChangeKind::Changed, Some(path.to_string()))
    }

    #[test]
    fn connected_frame_goes_to_new_connection_only() {
        let broadcaster = FileChangeBroadcaster::new();
        let first = RecordingConnection::new(&broadcaster);
        let second = RecordingConnection::new(&broadcaster);
        broadcaster.add_connection("P1", first.clone());
        broadcaster.add_connection("P1", second.clone());
        assert_eq!(first.frames().len(), 1);
        assert_eq!(second.frames().len(), 1);
        assert!(first.frames()[0].starts_with(r#"data: {"type":"connected","projectId":"P1""#));
    }

    #[test]
    fn broadcast_is_scoped_to_project() {
        let broadcaster = FileChangeBroadcaster::new();
        let a = RecordingConnection::new(&broadcaster);
        let b = RecordingConnection::new(&broadcaster);
        let other = RecordingConnection::new(&broadcaster);
        broadcaster.add_connection("P1", a.clone());
        broadcaster.add_connection("P1", b.clone());
        broadcaster.add_connection("P2", other.clone());

        let report = broadcaster.broadcast("P1", &changed("P1", "src/App.tsx"));
        assert_eq!(report.delivered, 2);
        assert_eq!(a.frames().len(), 2);
        assert_eq!(b.frames().len(), 2);
        assert_eq!(other.frames().len(), 1);
    }

    #[test]
    fn failed_write_drops_only_that_connection() {
        let broadcaster = FileChangeBroadcaster::new();
        let healthy = RecordingConnection::new(&broadcaster);
        let broken = RecordingConnection::new(&broadcaster);
        broadcaster.add_connection("P1", healthy.clone());
        broadcaster.add_connection("P1", broken.clone());
        broken.broken.store(true, Ordering::SeqCst);

        let report = broadcaster.broadcast("P1", &changed("P1", "a.ts"));
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 1 });
        assert!(broken.closed.load(Ordering::SeqCst));
        assert_eq!(broadcaster.connection_count("P1"), 1);

        broadcaster.broadcast("P1", &changed("P1", "b.ts"));
        assert_eq!(healthy.frames().len(), 3);
    }

    #[test]
    fn remove_is_idempotent_and_prunes() {
        let broadcaster = FileChangeBroadcaster::new();
        let conn = RecordingConnection::new(&broadcaster);
        broadcaster.add_connection("P1", conn.clone());
        assert!(broadcaster.remove_connection("P1", conn.id()));
        assert!(!broadcaster.remove_connection("P1", conn.id()));
        assert_eq!(broadcaster.project_count(), 0);
    }

    #[tokio::test]
    async fn sse_connection_reports_full_and_closed() {
        let broadcaster = FileChangeBroadcaster::new();
        let (conn, mut receiver) = broadcaster.open_sse(1);
        let (second, _) = broadcaster.open_sse(1);
        assert_ne!(conn.id(), second.id());
        conn.write(Bytes::from_static(b"one")).unwrap();
        assert_eq!(conn.write(Bytes::from_static(b"two")), Err(ConnectionError::Full));
        assert_eq!(receiver.recv().await.unwrap(), Bytes::from_static(b"one"));
        conn.close();
        assert_eq!(conn.write(Bytes::from_static(b"three")), Err(ConnectionError::Closed));
        assert!(receiver.recv().await.is_none());
    }
}
