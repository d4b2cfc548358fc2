//! TCP transport
//!
//! Each socket is split: a writer task drains an unbounded queue of
//! complete frames, and a reader task decodes length-delimited frames with
//! [`LengthDelimitedCodec`] and hands them to the listener.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Acceptor, Connector, LifecycleNotifier, TransportConnection, TransportListener};
use crate::protocol::codec::FRAME_LENGTH_SIZE;
use crate::{CorvidError, Result};

pub struct TcpConnection {
    id: String,
    remote: SocketAddr,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    stop: Notify,
    notifier: LifecycleNotifier,
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

impl TcpConnection {
    /// Take ownership of a connected socket and start its I/O tasks
    pub fn spawn(
        stream: TcpStream,
        listener: Arc<dyn TransportListener>,
        max_frame_size: usize,
    ) -> Result<Arc<Self>> {
        let remote = stream.peer_addr()?;
        if let Err(e) = optimize_socket(&stream) {
            warn!(%remote, error = %e, "Failed to tune socket");
        }
        let (read_half, write_half) = stream.into_split();
        let (outbound, frames) = mpsc::unbounded_channel();
        let id = Uuid::new_v4().to_string();
        let connection = Arc::new(Self {
            notifier: LifecycleNotifier::new(id.clone(), listener),
            id,
            remote,
            outbound: Mutex::new(Some(outbound)),
            stop: Notify::new(),
        });

        connection.notifier.created(connection.clone());
        tokio::spawn(Self::write_loop(Arc::clone(&connection), write_half, frames));
        tokio::spawn(Self::read_loop(Arc::clone(&connection), read_half, max_frame_size));
        Ok(connection)
    }

    async fn write_loop(
        connection: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut frames: mpsc::UnboundedReceiver<Bytes>,
    ) {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                debug!(connection_id = %connection.id, error = %e, "Socket write failed");
                connection.outbound.lock().take();
                connection.notifier.exception(CorvidError::Io(e));
                return;
            }
        }
        // closed locally: everything queued before close has been written
        let _ = writer.shutdown().await;
    }

    async fn read_loop(connection: Arc<Self>, reader: OwnedReadHalf, max_frame_size: usize) {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(FRAME_LENGTH_SIZE)
            .max_frame_length(max_frame_size)
            .new_codec();
        let mut framed = FramedRead::new(reader, codec);

        loop {
            tokio::select! {
                next = framed.next() => match next {
                    Some(Ok(frame)) => connection.notifier.frame(frame.freeze()),
                    Some(Err(e)) => {
                        debug!(connection_id = %connection.id, error = %e, "Socket read failed");
                        connection.outbound.lock().take();
                        connection.notifier.exception(CorvidError::Io(e));
                        break;
                    }
                    None => {
                        debug!(connection_id = %connection.id, remote = %connection.remote, "Peer closed connection");
                        connection.outbound.lock().take();
                        connection.notifier.destroyed();
                        break;
                    }
                },
                _ = connection.stop.notified() => break,
            }
        }
    }
}

impl TransportConnection for TcpConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_address(&self) -> String {
        self.remote.to_string()
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

fn optimize_socket(stream: &TcpStream) -> std::io::Result<()> {
    let socket = socket2::SockRef::from(stream);
    socket.set_nodelay(true)?;
    socket.set_keepalive(true)?;
    Ok(())
}

#[derive(Debug)]
pub struct TcpAcceptor {
    host: String,
    port: u16,
    max_frame_size: usize,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown_tx: broadcast::Sender<()>,
    connections: Arc<DashMap<String, Arc<TcpConnection>>>,
}

impl TcpAcceptor {
    pub fn new(host: String, port: u16, max_frame_size: usize) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            host,
            port,
            max_frame_size,
            local_addr: Mutex::new(None),
            shutdown_tx,
            connections: Arc::new(DashMap::new()),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    async fn accept_loop(
        listener: TcpListener,
        transport_listener: Arc<dyn TransportListener>,
        connections: Arc<DashMap<String, Arc<TcpConnection>>>,
        max_frame_size: usize,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        match TcpConnection::spawn(stream, Arc::clone(&transport_listener), max_frame_size) {
                            Ok(connection) => {
                                debug!(%peer_addr, connection_id = %connection.id, "Accepted connection");
                                connections.retain(|_, c| !c.notifier.is_ended());
                                connections.insert(connection.id.clone(), connection);
                            }
                            Err(e) => warn!(%peer_addr, error = %e, "Failed to set up accepted connection"),
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                _ = shutdown_rx.recv() => break,
            }
        }
    }
}

impl Acceptor for TcpAcceptor {
    fn start(&self, listener: Arc<dyn TransportListener>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let bind_addr = format!("{}:{}", self.host, self.port);
            let tcp_listener = TcpListener::bind(&bind_addr).await?;
            let local_addr = tcp_listener.local_addr()?;
            *self.local_addr.lock() = Some(local_addr);
            info!(%local_addr, "TCP acceptor listening");

            tokio::spawn(Self::accept_loop(
                tcp_listener,
                listener,
                Arc::clone(&self.connections),
                self.max_frame_size,
                self.shutdown_tx.subscribe(),
            ));
            Ok(())
        })
    }

    fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let connections: Vec<Arc<TcpConnection>> = self
            .connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        self.connections.clear();
        for connection in connections {
            connection.close();
        }
        info!(acceptor = %self.describe(), "TCP acceptor stopped");
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    fn bound_port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }
}

#[derive(Debug)]
pub struct TcpConnector {
    host: String,
    port: u16,
    max_frame_size: usize,
}

impl TcpConnector {
    pub fn new(host: String, port: u16, max_frame_size: usize) -> Self {
        Self {
            host,
            port,
            max_frame_size,
        }
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        listener: Arc<dyn TransportListener>,
    ) -> BoxFuture<'_, Result<Arc<dyn TransportConnection>>> {
        Box::pin(async move {
            let addr = format!("{}:{}", self.host, self.port);
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|e| CorvidError::ConnectionFailed(format!("{addr}: {e}")))?;
            let connection: Arc<dyn TransportConnection> =
                TcpConnection::spawn(stream, listener, self.max_frame_size)?;
            Ok(connection)
        })
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_frame, encode_packet, Packet, PacketBody};
    use crate::remoting::transport::tests::RecordingListener;
    use std::time::Duration;

    async fn started_acceptor(listener: Arc<RecordingListener>) -> TcpAcceptor {
        let acceptor = TcpAcceptor::new("127.0.0.1".to_string(), 0, 1024 * 1024);
        acceptor.start(listener).await.unwrap();
        acceptor
    }

    async fn wait_for_frames(listener: &RecordingListener, n: usize) {
        for _ in 0..200 {
            if listener.frames.lock().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} frames");
    }

    #[tokio::test]
    async fn test_frames_round_trip_over_socket() {
        let server = RecordingListener::new();
        let client = RecordingListener::new();
        let acceptor = started_acceptor(server.clone()).await;
        let port = acceptor.bound_port().unwrap();

        let connector = TcpConnector::new("127.0.0.1".to_string(), port, 1024 * 1024);
        let connection = connector.connect(client.clone()).await.unwrap();
        let packet = Packet::new(7, PacketBody::Exception { code: 4, message: "late".into() });
        connection.write(encode_packet(&packet)).unwrap();
        connection.write(encode_packet(&Packet::new(1, PacketBody::Pong))).unwrap();

        wait_for_frames(&server, 2).await;
        let frames = server.frames.lock().clone();
        assert_eq!(decode_frame(frames[0].clone()).unwrap(), packet);
        assert_eq!(decode_frame(frames[1].clone()).unwrap().body, PacketBody::Pong);

        server.wait_for("created", 1).await;
        let server_side = server.connections.lock()[0].clone();
        server_side.write(encode_packet(&packet)).unwrap();
        wait_for_frames(&client, 1).await;
        acceptor.stop();
    }

    #[tokio::test]
    async fn test_peer_close_reports_destroyed_once() {
        let server = RecordingListener::new();
        let client = RecordingListener::new();
        let acceptor = started_acceptor(server.clone()).await;
        let connector =
            TcpConnector::new("127.0.0.1".to_string(), acceptor.bound_port().unwrap(), 1024);
        let connection = connector.connect(client.clone()).await.unwrap();
        server.wait_for("created", 1).await;

        connection.close();
        server.wait_for("destroyed", 1).await;
        client.wait_for("destroyed", 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.count("destroyed") + server.count("exception"), 1);
        assert_eq!(client.count("destroyed") + client.count("exception"), 1);
        acceptor.stop();
    }

    #[tokio::test]
    async fn test_oversized_frame_is_exception() {
        let server = RecordingListener::new();
        let acceptor = TcpAcceptor::new("127.0.0.1".to_string(), 0, 64);
        acceptor.start(server.clone()).await.unwrap();

        let mut raw = TcpStream::connect(("127.0.0.1", acceptor.bound_port().unwrap()))
            .await
            .unwrap();
        raw.write_all(&10_000u32.to_be_bytes()).await.unwrap();
        server.wait_for("exception", 1).await;
        acceptor.stop();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let acceptor = TcpAcceptor::new("127.0.0.1".to_string(), 0, 1024);
        acceptor.start(RecordingListener::new()).await.unwrap();
        let port = acceptor.bound_port().unwrap();
        acceptor.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = TcpConnector::new("127.0.0.1".to_string(), port, 1024)
            .connect(RecordingListener::new())
            .await;
        assert!(err.is_err());
    }
}
