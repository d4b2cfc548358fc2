//! Routes decoded packets to the handler registered for their channel

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{trace, warn};

use super::connection::RemotingConnection;
use super::executor::OrderedExecutor;
use crate::protocol::{Packet, CONTROL_CHANNEL_ID};
use crate::{CorvidError, Result};

/// Receives the packets addressed to one channel id
pub trait PacketHandler: Send + Sync {
    fn id(&self) -> u64;

    fn handle(&self, packet: Packet, connection: &Arc<RemotingConnection>);
}

pub struct PacketDispatcher {
    handlers: RwLock<HashMap<u64, Arc<dyn PacketHandler>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for PacketDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketDispatcher")
            .field("handlers", &self.handlers.read().len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for PacketDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(CONTROL_CHANNEL_ID + 1),
        }
    }

    /// Fresh channel id; the control channel id is never handed out
    pub fn generate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the handler previously registered under the same id
    pub fn register(&self, handler: Arc<dyn PacketHandler>) -> Option<Arc<dyn PacketHandler>> {
        let id = handler.id();
        trace!(handler_id = id, "Registering packet handler");
        self.handlers.write().insert(id, handler)
    }

    /// Unregistering an id that is not registered is a no-op
    pub fn unregister(&self, id: u64) -> Option<Arc<dyn PacketHandler>> {
        self.handlers.write().remove(&id)
    }

    pub fn handler(&self, id: u64) -> Option<Arc<dyn PacketHandler>> {
        self.handlers.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Hand `packet` to its handler on `executor`.
    ///
    /// An unknown channel is answered with an EXCEPTION when the packet
    /// expects a response, and only logged otherwise. Either way the error
    /// is returned to the caller and the connection stays open.
    pub fn dispatch(
        &self,
        packet: Packet,
        connection: &Arc<RemotingConnection>,
        executor: &OrderedExecutor,
    ) -> Result<()> {
        let channel_id = packet.channel_id;
        match self.handler(channel_id) {
            Some(handler) => {
                let connection = Arc::clone(connection);
                if !executor.execute(move || handler.handle(packet, &connection)) {
                    return Err(CorvidError::ConnectionFailed(
                        "connection executor shut down".to_string(),
                    ));
                }
                Ok(())
            }
            None => {
                let error = CorvidError::Protocol(format!(
                    "no handler registered for channel {channel_id}"
                ));
                if packet.is_request() {
                    connection.send_exception(channel_id, &error);
                } else {
                    warn!(
                        connection_id = %connection.id(),
                        channel_id,
                        packet_type = ?packet.packet_type(),
                        "Dropping packet for unknown channel"
                    );
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketBody;
    use crate::remoting::connection::tests::test_connection;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Recorder {
        id: u64,
        seen: Mutex<Vec<PacketBody>>,
    }

    impl PacketHandler for Recorder {
        fn id(&self) -> u64 {
            self.id
        }

        fn handle(&self, packet: Packet, _connection: &Arc<RemotingConnection>) {
            self.seen.lock().push(packet.body);
        }
    }

    fn recorder(id: u64) -> Arc<Recorder> {
        Arc::new(Recorder {
            id,
            seen: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_generated_ids_skip_control_channel() {
        let dispatcher = PacketDispatcher::new();
        let a = dispatcher.generate_id();
        let b = dispatcher.generate_id();
        assert!(a > CONTROL_CHANNEL_ID);
        assert_ne!(a, b);
    }

    #[test]
    fn test_unregister_unknown_id_is_noop() {
        let dispatcher = PacketDispatcher::new();
        dispatcher.register(recorder(5));
        assert!(dispatcher.unregister(42).is_none());
        assert!(dispatcher.unregister(42).is_none());
        assert_eq!(dispatcher.len(), 1);
        assert!(dispatcher.handler(5).is_some());

        assert!(dispatcher.unregister(5).is_some());
        assert!(dispatcher.unregister(5).is_none());
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_preserves_order() {
        let dispatcher = Arc::new(PacketDispatcher::new());
        let handler = recorder(9);
        dispatcher.register(handler.clone());
        let (connection, _transport) = test_connection(dispatcher.clone(), Duration::from_secs(1));
        let executor = OrderedExecutor::new("order");

        for i in 0..20 {
            let packet = Packet::new(9, PacketBody::PacketsConfirmed { command_id: i });
            dispatcher.dispatch(packet, &connection, &executor).unwrap();
        }
        for _ in 0..100 {
            if handler.seen.lock().len() == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let seen = handler.seen.lock().clone();
        let expected: Vec<PacketBody> = (0..20)
            .map(|i| PacketBody::PacketsConfirmed { command_id: i })
            .collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_unknown_target_request_gets_exception() {
        let dispatcher = Arc::new(PacketDispatcher::new());
        let (connection, transport) = test_connection(dispatcher.clone(), Duration::from_secs(1));
        let executor = OrderedExecutor::new("unknown");

        let request = Packet::new(77, PacketBody::SessCommit);
        assert!(dispatcher.dispatch(request, &connection, &executor).is_err());
        let written = transport.packets();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].channel_id, 77);
        assert!(matches!(written[0].body, PacketBody::Exception { .. }));

        let one_way = Packet::new(77, PacketBody::SessStart);
        assert!(dispatcher.dispatch(one_way, &connection, &executor).is_err());
        assert_eq!(transport.packets().len(), 1);
        assert!(!connection.is_destroyed());
    }
}
