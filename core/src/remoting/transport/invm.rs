//! In-VM transport
//!
//! Acceptors register under a numeric server id in an [`InVmRegistry`]
//! owned by the [`super::TransportContext`]; connectors look the id up and
//! receive one half of a channel pair.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Acceptor, Connector, LifecycleNotifier, TransportConnection, TransportListener,
};
use crate::protocol::codec::FRAME_LENGTH_SIZE;
use crate::{CorvidError, Result};

struct InVmEndpoint {
    listener: Arc<dyn TransportListener>,
    connections: DashMap<String, Arc<InVmConnection>>,
}

/// Live in-VM acceptors keyed by server id
#[derive(Default)]
pub struct InVmRegistry {
    endpoints: DashMap<u32, Arc<InVmEndpoint>>,
}

impl std::fmt::Debug for InVmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<u32> = self.endpoints.iter().map(|e| *e.key()).collect();
        f.debug_struct("InVmRegistry").field("server_ids", &ids).finish()
    }
}

impl InVmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering an id twice is a configuration error
    pub fn register(&self, server_id: u32, listener: Arc<dyn TransportListener>) -> Result<()> {
        match self.endpoints.entry(server_id) {
            Entry::Occupied(_) => Err(CorvidError::Config(format!(
                "an in-VM acceptor with id {server_id} is already registered"
            ))),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(InVmEndpoint {
                    listener,
                    connections: DashMap::new(),
                }));
                Ok(())
            }
        }
    }

    /// Remove the acceptor and close every connection it accepted
    pub fn unregister(&self, server_id: u32) -> bool {
        match self.endpoints.remove(&server_id) {
            Some((_, endpoint)) => {
                let connections: Vec<Arc<InVmConnection>> = endpoint
                    .connections
                    .iter()
                    .map(|e| Arc::clone(e.value()))
                    .collect();
                endpoint.connections.clear();
                for connection in connections {
                    connection.close();
                }
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, server_id: u32) -> bool {
        self.endpoints.contains_key(&server_id)
    }

    pub fn connect(
        &self,
        server_id: u32,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn TransportConnection>> {
        let endpoint = self
            .endpoints
            .get(&server_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| {
                CorvidError::ConnectionFailed(format!("no in-VM acceptor with id {server_id}"))
            })?;
        endpoint
            .connections
            .retain(|_, connection| !connection.notifier.is_ended());

        let (to_server, server_inbox) = mpsc::unbounded_channel();
        let (to_client, client_inbox) = mpsc::unbounded_channel();
        let server_side = Arc::new(InVmConnection::new(
            "invm-client".to_string(),
            to_client,
            Arc::clone(&endpoint.listener),
        ));
        let client_side = Arc::new(InVmConnection::new(
            format!("invm://{server_id}"),
            to_server,
            listener,
        ));

        endpoint
            .connections
            .insert(server_side.id.clone(), Arc::clone(&server_side));
        server_side.notifier.created(server_side.clone());
        client_side.notifier.created(client_side.clone());
        InVmConnection::spawn_reader(Arc::clone(&server_side), server_inbox);
        InVmConnection::spawn_reader(Arc::clone(&client_side), client_inbox);

        debug!(
            server_id,
            server_connection = %server_side.id,
            client_connection = %client_side.id,
            "In-VM connection established"
        );
        Ok(client_side)
    }
}

pub struct InVmConnection {
    id: String,
    peer: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    stop: Notify,
    notifier: LifecycleNotifier,
}

impl std::fmt::Debug for InVmConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InVmConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

impl InVmConnection {
    fn new(
        peer: String,
        outbound: mpsc::UnboundedSender<Bytes>,
        listener: Arc<dyn TransportListener>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            notifier: LifecycleNotifier::new(id.clone(), listener),
            id,
            peer,
            outbound: Mutex::new(Some(outbound)),
            stop: Notify::new(),
        }
    }

    fn spawn_reader(connection: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Bytes>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = inbox.recv() => match frame {
                        Some(frame) if frame.len() >= FRAME_LENGTH_SIZE => {
                            connection.notifier.frame(frame.slice(FRAME_LENGTH_SIZE..));
                        }
                        Some(frame) => {
                            warn!(connection_id = %connection.id, len = frame.len(), "Dropping short in-VM frame");
                        }
                        None => {
                            // peer closed
                            connection.outbound.lock().take();
                            connection.notifier.destroyed();
                            break;
                        }
                    },
                    _ = connection.stop.notified() => break,
                }
            }
        });
    }
}

impl TransportConnection for InVmConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_address(&self) -> String {
        self.peer.clone()
    }

    fn write(&self, frame: Bytes) -> Result<()> {
        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(sender) => sender
                .send(frame)
                .map_err(|_| CorvidError::ConnectionFailed(format!("{} is closed", self.id))),
            None => Err(CorvidError::ConnectionFailed(format!(
                "{} is closed",
                self.id
            ))),
        }
    }

    fn close(&self) {
        self.outbound.lock().take();
        self.stop.notify_one();
        self.notifier.destroyed();
    }
}

#[derive(Debug)]
pub struct InVmAcceptor {
    server_id: u32,
    registry: Arc<InVmRegistry>,
}

impl InVmAcceptor {
    pub fn new(server_id: u32, registry: Arc<InVmRegistry>) -> Self {
        Self {
            server_id,
            registry,
        }
    }
}

impl Acceptor for InVmAcceptor {
    fn start(&self, listener: Arc<dyn TransportListener>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.registry.register(self.server_id, listener)?;
            info!(server_id = self.server_id, "In-VM acceptor started");
            Ok(())
        })
    }

    fn stop(&self) {
        if self.registry.unregister(self.server_id) {
            info!(server_id = self.server_id, "In-VM acceptor stopped");
        }
    }

    fn describe(&self) -> String {
        format!("invm://{}", self.server_id)
    }
}

#[derive(Debug)]
pub struct InVmConnector {
    server_id: u32,
    registry: Arc<InVmRegistry>,
}

impl InVmConnector {
    pub fn new(server_id: u32, registry: Arc<InVmRegistry>) -> Self {
        Self {
            server_id,
            registry,
        }
    }
}

impl Connector for InVmConnector {
    fn connect(
        &self,
        listener: Arc<dyn TransportListener>,
    ) -> BoxFuture<'_, Result<Arc<dyn TransportConnection>>> {
        Box::pin(async move { self.registry.connect(self.server_id, listener) })
    }

    fn describe(&self) -> String {
        format!("invm://{}", self.server_id)
    }
}
