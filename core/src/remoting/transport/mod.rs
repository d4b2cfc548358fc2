//! # Transports
//!
//! A transport moves complete frames between two peers and reports the
//! lifecycle of every connection it creates. Two transports exist:
//!
//! - [`invm`] - channel pairs inside one process, looked up by server id
//! - [`tcp`] - length-delimited frames over TCP sockets
//!
//! Frames handed to [`TransportConnection::write`] carry their length
//! prefix; frames delivered to [`FrameHandler::frame_received`] do not.
//!
//! For every connection `connection_created` fires once before any frame,
//! and afterwards exactly one of `connection_destroyed` or
//! `connection_exception` fires. [`LifecycleNotifier`] enforces this and
//! reports the end of a connection from a fresh task, never from the I/O
//! task that noticed it.

pub mod invm;
pub mod tcp;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TransportConfig;
use crate::{CorvidError, Result};

pub use invm::{InVmAcceptor, InVmConnector, InVmRegistry};
pub use tcp::{TcpAcceptor, TcpConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    InVm,
    #[default]
    Tcp,
}

/// One physical connection, as seen by the remoting layer
pub trait TransportConnection: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn remote_address(&self) -> String;

    /// Queue a complete frame (length prefix included) for the peer
    fn write(&self, frame: Bytes) -> Result<()>;

    /// Close the connection; reports `connection_destroyed` unless the
    /// connection already ended
    fn close(&self);
}

pub trait ConnectionLifeCycleListener: Send + Sync {
    fn connection_created(&self, connection: Arc<dyn TransportConnection>);

    fn connection_destroyed(&self, connection_id: &str);

    fn connection_exception(&self, connection_id: &str, error: CorvidError);
}

pub trait FrameHandler: Send + Sync {
    /// A frame arrived; `frame` starts at the packet type byte
    fn frame_received(&self, connection_id: &str, frame: Bytes);
}

/// Everything a transport reports to its owner
pub trait TransportListener: ConnectionLifeCycleListener + FrameHandler {}

impl<T: ConnectionLifeCycleListener + FrameHandler> TransportListener for T {}

/// Guards the end-of-life callbacks of one connection
pub struct LifecycleNotifier {
    connection_id: String,
    listener: Arc<dyn TransportListener>,
    ended: AtomicBool,
}

impl fmt::Debug for LifecycleNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleNotifier")
            .field("connection_id", &self.connection_id)
            .field("ended", &self.ended.load(Ordering::Relaxed))
            .finish()
    }
}

impl LifecycleNotifier {
    pub fn new(connection_id: impl Into<String>, listener: Arc<dyn TransportListener>) -> Self {
        Self {
            connection_id: connection_id.into(),
            listener,
            ended: AtomicBool::new(false),
        }
    }

    pub fn listener(&self) -> &Arc<dyn TransportListener> {
        &self.listener
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub fn created(&self, connection: Arc<dyn TransportConnection>) {
        debug!(connection_id = %self.connection_id, "Connection created");
        self.listener.connection_created(connection);
    }

    pub fn frame(&self, frame: Bytes) {
        if !self.is_ended() {
            self.listener.frame_received(&self.connection_id, frame);
        }
    }

    /// Returns false when the end was already reported
    pub fn destroyed(&self) -> bool {
        if self.ended.swap(true, Ordering::AcqRel) {
            return false;
        }
        let listener = Arc::clone(&self.listener);
        let id = self.connection_id.clone();
        tokio::spawn(async move {
            listener.connection_destroyed(&id);
        });
        true
    }

    pub fn exception(&self, error: CorvidError) -> bool {
        if self.ended.swap(true, Ordering::AcqRel) {
            return false;
        }
        let listener = Arc::clone(&self.listener);
        let id = self.connection_id.clone();
        tokio::spawn(async move {
            listener.connection_exception(&id, error);
        });
        true
    }
}

/// Accepts inbound connections for one configured endpoint
pub trait Acceptor: Send + Sync + fmt::Debug {
    fn start(&self, listener: Arc<dyn TransportListener>) -> BoxFuture<'_, Result<()>>;

    /// Stop accepting and close the connections this acceptor created
    fn stop(&self);

    fn describe(&self) -> String;

    /// Port actually bound, for network acceptors
    fn bound_port(&self) -> Option<u16> {
        None
    }
}

/// Opens outbound connections to one configured endpoint
pub trait Connector: Send + Sync + fmt::Debug {
    fn connect(
        &self,
        listener: Arc<dyn TransportListener>,
    ) -> BoxFuture<'_, Result<Arc<dyn TransportConnection>>>;

    fn describe(&self) -> String;
}

/// Process-scoped transport state, created once and handed to every
/// server and session factory that should see each other in-VM
#[derive(Debug, Clone, Default)]
pub struct TransportContext {
    invm: Arc<InVmRegistry>,
}

impl TransportContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invm_registry(&self) -> &Arc<InVmRegistry> {
        &self.invm
    }
}

pub fn create_acceptor(
    config: &TransportConfig,
    context: &TransportContext,
    max_frame_size: usize,
) -> Box<dyn Acceptor> {
    match config.kind {
        TransportKind::InVm => Box::new(InVmAcceptor::new(
            config.server_id,
            Arc::clone(context.invm_registry()),
        )),
        TransportKind::Tcp => Box::new(TcpAcceptor::new(
            config.host.clone(),
            config.port,
            max_frame_size,
        )),
    }
}

pub fn create_connector(
    config: &TransportConfig,
    context: &TransportContext,
    max_frame_size: usize,
) -> Box<dyn Connector> {
    match config.kind {
        TransportKind::InVm => Box::new(InVmConnector::new(
            config.server_id,
            Arc::clone(context.invm_registry()),
        )),
        TransportKind::Tcp => Box::new(TcpConnector::new(
            config.host.clone(),
            config.port,
            max_frame_size,
        )),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Records every callback in arrival order
    #[derive(Default)]
    pub(crate) struct RecordingListener {
        pub(crate) events: Mutex<Vec<String>>,
        pub(crate) connections: Mutex<Vec<Arc<dyn TransportConnection>>>,
        pub(crate) frames: Mutex<Vec<Bytes>>,
    }

    impl RecordingListener {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn count(&self, prefix: &str) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|e| e.starts_with(prefix))
                .count()
        }

        pub(crate) async fn wait_for(&self, prefix: &str, n: usize) {
            for _ in 0..200 {
                if self.count(prefix) >= n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("timed out waiting for {n} {prefix} events: {:?}", self.events.lock());
        }
    }

    impl ConnectionLifeCycleListener for RecordingListener {
        fn connection_created(&self, connection: Arc<dyn TransportConnection>) {
            self.events.lock().push(format!("created:{}", connection.id()));
            self.connections.lock().push(connection);
        }

        fn connection_destroyed(&self, connection_id: &str) {
            self.events.lock().push(format!("destroyed:{connection_id}"));
        }

        fn connection_exception(&self, connection_id: &str, _error: CorvidError) {
            self.events.lock().push(format!("exception:{connection_id}"));
        }
    }

    impl FrameHandler for RecordingListener {
        fn frame_received(&self, _connection_id: &str, frame: Bytes) {
            self.frames.lock().push(frame);
        }
    }

    #[tokio::test]
    async fn test_notifier_reports_end_once() {
        let listener = RecordingListener::new();
        let notifier = LifecycleNotifier::new("c1", listener.clone());
        assert!(notifier.exception(CorvidError::ConnectionTimedOut));
        assert!(!notifier.destroyed());
        assert!(!notifier.exception(CorvidError::ConnectionTimedOut));

        listener.wait_for("exception", 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(listener.count("exception"), 1);
        assert_eq!(listener.count("destroyed"), 0);
    }

    #[tokio::test]
    async fn test_notifier_drops_frames_after_end() {
        let listener = RecordingListener::new();
        let notifier = LifecycleNotifier::new("c1", listener.clone());
        notifier.frame(Bytes::from_static(b"a"));
        notifier.destroyed();
        notifier.frame(Bytes::from_static(b"b"));
        assert_eq!(listener.frames.lock().len(), 1);
    }

    #[test]
    fn test_transport_kind_serde() {
        assert_eq!(serde_json::to_string(&TransportKind::InVm).unwrap(), "\"invm\"");
        assert_eq!(TransportKind::default(), TransportKind::Tcp);
    }
}
