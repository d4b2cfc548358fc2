//! Packet-level connection shared by client and server
//!
//! Wraps a [`TransportConnection`] with packet encoding, one blocking
//! request slot per channel, liveness bookkeeping and the failure fan-out.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::dispatcher::PacketDispatcher;
use super::executor::OrderedExecutor;
use super::transport::TransportConnection;
use crate::metrics::MetricsRegistry;
use crate::protocol::{
    decode_frame, encode_packet, frame_channel_id, Packet, PacketBody, CONTROL_CHANNEL_ID,
};
use crate::{CorvidError, Result};

/// Told once when the connection fails or is closed by the peer
pub trait FailureListener: Send + Sync {
    fn connection_failed(&self, error: &CorvidError);
}

type PendingResponse = oneshot::Sender<Result<Packet>>;

#[derive(Default)]
struct Channel {
    /// One blocking request in flight per channel
    call_lock: tokio::sync::Mutex<()>,
    pending: Mutex<Option<PendingResponse>>,
}

/// A channel held for one blocking call; the last holder removes the entry
struct ChannelLease<'a> {
    channels: &'a DashMap<u64, Arc<Channel>>,
    channel_id: u64,
    channel: Arc<Channel>,
}

impl Drop for ChannelLease<'_> {
    fn drop(&mut self) {
        self.channels.remove_if(&self.channel_id, |_, channel| {
            Arc::ptr_eq(channel, &self.channel) && Arc::strong_count(channel) == 2
        });
    }
}

pub struct RemotingConnection {
    id: String,
    transport: Arc<dyn TransportConnection>,
    dispatcher: Arc<PacketDispatcher>,
    executor: OrderedExecutor,
    channels: DashMap<u64, Arc<Channel>>,
    failure_listeners: Mutex<Vec<Arc<dyn FailureListener>>>,
    destroyed: AtomicBool,
    timed_out: AtomicBool,
    data_received: AtomicBool,
    last_received: Mutex<Instant>,
    ttl_ms: AtomicI64,
    call_timeout: Duration,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl std::fmt::Debug for RemotingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotingConnection")
            .field("id", &self.id)
            .field("remote", &self.transport.remote_address())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl RemotingConnection {
    pub fn new(
        transport: Arc<dyn TransportConnection>,
        dispatcher: Arc<PacketDispatcher>,
        call_timeout: Duration,
        ttl_ms: i64,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Arc<Self> {
        let id = transport.id().to_string();
        Arc::new(Self {
            executor: OrderedExecutor::new(id.clone()),
            id,
            transport,
            dispatcher,
            channels: DashMap::new(),
            failure_listeners: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            data_received: AtomicBool::new(false),
            last_received: Mutex::new(Instant::now()),
            ttl_ms: AtomicI64::new(ttl_ms),
            call_timeout,
            metrics,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_address(&self) -> String {
        self.transport.remote_address()
    }

    pub fn dispatcher(&self) -> &Arc<PacketDispatcher> {
        &self.dispatcher
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms.load(Ordering::Relaxed)
    }

    pub fn add_failure_listener(&self, listener: Arc<dyn FailureListener>) {
        self.failure_listeners.lock().push(listener);
    }

    pub fn clear_failure_listeners(&self) {
        self.failure_listeners.lock().clear();
    }

    /// One-way send
    pub fn write(&self, packet: Packet) -> Result<()> {
        if self.is_destroyed() {
            return Err(self.failure_error());
        }
        trace!(
            connection_id = %self.id,
            channel_id = packet.channel_id,
            packet_type = ?packet.packet_type(),
            "Sending packet"
        );
        self.transport.write(encode_packet(&packet))?;
        if let Some(metrics) = &self.metrics {
            metrics.packet_sent();
        }
        Ok(())
    }

    pub fn send_exception(&self, channel_id: u64, error: &CorvidError) {
        let packet = Packet::new(
            channel_id,
            PacketBody::Exception {
                code: error.code() as i32,
                message: error.to_string(),
            },
        );
        if let Err(e) = self.write(packet) {
            debug!(connection_id = %self.id, error = %e, "Could not report exception to peer");
        }
    }

    /// Send a request and wait for the response on the same channel.
    ///
    /// An EXCEPTION response becomes the error it encodes. The wait is
    /// bounded by the call timeout and ends early if the connection fails.
    pub async fn send_blocking(&self, channel_id: u64, body: PacketBody) -> Result<Packet> {
        let lease = self.lease(channel_id);
        let channel = &lease.channel;
        let _call = channel.call_lock.lock().await;

        let (tx, rx) = oneshot::channel();
        *channel.pending.lock() = Some(tx);
        if self.is_destroyed() {
            channel.pending.lock().take();
            return Err(self.failure_error());
        }
        if let Err(e) = self.write(Packet::new(channel_id, body)) {
            channel.pending.lock().take();
            return Err(e);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(Ok(packet))) => match packet.body {
                PacketBody::Exception { code, message } => {
                    Err(CorvidError::from_code(code, message))
                }
                _ => Ok(packet),
            },
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(self.failure_error()),
            Err(_) => {
                channel.pending.lock().take();
                Err(CorvidError::Timeout(self.call_timeout.as_millis() as u64))
            }
        }
    }

    /// Decode one inbound frame. A packet type this side does not know is
    /// skipped with a warning; any other failure means the stream is corrupt.
    pub fn decode(&self, frame: Bytes) -> Result<Option<Packet>> {
        match decode_frame(frame.clone()) {
            Ok(packet) => Ok(Some(packet)),
            Err(e) if e.is_unsupported_type() => {
                self.data_received.store(true, Ordering::Release);
                warn!(
                    connection_id = %self.id,
                    channel_id = ?frame_channel_id(&frame),
                    error = %e,
                    "Dropping unsupported packet"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Entry point for every decoded inbound packet
    pub fn packet_received(self: &Arc<Self>, packet: Packet) {
        if self.is_destroyed() {
            return;
        }
        self.data_received.store(true, Ordering::Release);
        *self.last_received.lock() = Instant::now();
        if let Some(metrics) = &self.metrics {
            metrics.packet_received();
        }

        match &packet.body {
            PacketBody::Ping { connection_ttl_ms } => {
                self.ttl_ms.store(*connection_ttl_ms, Ordering::Relaxed);
                if let Err(e) = self.write(Packet::new(CONTROL_CHANNEL_ID, PacketBody::Pong)) {
                    debug!(connection_id = %self.id, error = %e, "Failed to answer ping");
                }
                return;
            }
            PacketBody::Pong => return,
            _ => {}
        }

        if packet.is_response() {
            self.complete(packet);
            return;
        }

        let _ = self.dispatcher.dispatch(packet, self, &self.executor);
    }

    fn complete(&self, packet: Packet) {
        let channel = self
            .channels
            .get(&packet.channel_id)
            .map(|channel| Arc::clone(channel.value()));
        let waiter = channel.and_then(|channel| {
            let waiter = channel.pending.lock().take();
            waiter
        });
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(Ok(packet));
            }
            None => warn!(
                connection_id = %self.id,
                channel_id = packet.channel_id,
                packet_type = ?packet.packet_type(),
                "Response with no pending request"
            ),
        }
    }

    /// Whether any packet arrived since the last call
    pub fn take_data_received(&self) -> bool {
        self.data_received.swap(false, Ordering::AcqRel)
    }

    /// A connection with a positive TTL expires when nothing arrived within it
    pub fn is_expired(&self, now: Instant) -> bool {
        let ttl = self.ttl_ms();
        if ttl <= 0 {
            return false;
        }
        let last = *self.last_received.lock();
        now.saturating_duration_since(last) > Duration::from_millis(ttl as u64)
    }

    /// Tear the connection down: wake every blocked caller with `error`,
    /// notify the failure listeners and close the transport.
    ///
    /// Only the first call does anything; returns whether it was this one.
    pub fn fail(&self, error: CorvidError) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if matches!(error, CorvidError::ConnectionTimedOut) {
            self.timed_out.store(true, Ordering::Release);
        }
        debug!(connection_id = %self.id, error = %error, "Connection failed");

        let waiters: Vec<PendingResponse> = self
            .channels
            .iter()
            .filter_map(|channel| {
                let waiter = channel.pending.lock().take();
                waiter
            })
            .collect();
        for waiter in waiters {
            let _ = waiter.send(Err(connection_error(&error)));
        }

        let listeners = std::mem::take(&mut *self.failure_listeners.lock());
        for listener in listeners {
            listener.connection_failed(&error);
        }
        self.transport.close();
        true
    }

    /// Close without notifying failure listeners
    pub fn close(&self) {
        self.clear_failure_listeners();
        self.fail(CorvidError::ConnectionFailed("connection closed".to_string()));
    }

    fn failure_error(&self) -> CorvidError {
        if self.timed_out.load(Ordering::Acquire) {
            CorvidError::ConnectionTimedOut
        } else {
            CorvidError::ConnectionFailed(format!("connection {} is closed", self.id))
        }
    }

    fn lease(&self, channel_id: u64) -> ChannelLease<'_> {
        ChannelLease {
            channels: &self.channels,
            channel_id,
            channel: Arc::clone(self.channels.entry(channel_id).or_default().value()),
        }
    }

    /// Channels with a blocking call in flight or queued
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Client side: ping every `period` and fail the connection when a
    /// whole period passes without any inbound packet
    pub fn spawn_pinger(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let connection = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            connection.take_data_received();
            connection.ping();
            loop {
                interval.tick().await;
                if connection.is_destroyed() {
                    break;
                }
                if !connection.take_data_received() {
                    warn!(connection_id = %connection.id, "No data received from server, failing connection");
                    connection.fail(CorvidError::ConnectionTimedOut);
                    break;
                }
                connection.ping();
            }
        })
    }

    fn ping(&self) {
        let ttl = self.ttl_ms();
        if let Err(e) = self.write(Packet::new(
            CONTROL_CHANNEL_ID,
            PacketBody::Ping {
                connection_ttl_ms: ttl,
            },
        )) {
            debug!(connection_id = %self.id, error = %e, "Ping not sent");
        }
    }
}

/// Connection errors are not `Clone`; rebuild the same kind
fn connection_error(error: &CorvidError) -> CorvidError {
    match error {
        CorvidError::ConnectionTimedOut => CorvidError::ConnectionTimedOut,
        other => CorvidError::ConnectionFailed(other.to_string()),
    }
}
