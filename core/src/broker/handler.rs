//! Control channel handler and state shared by every server session
//!
//! Channel 1 of each connection carries session creation, session reattach
//! and queue administration. Sessions get their own channel ids from the
//! shared dispatcher. When a connection fails its temporary queues are
//! deleted and its sessions are detached (if they can be reattached) or
//! closed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::session::{ServerSession, SessionOptions};
use crate::config::{BrokerConfig, PROTOCOL_VERSION};
use crate::metrics::MetricsRegistry;
use crate::postoffice::PostOffice;
use crate::protocol::{Packet, PacketBody, CONTROL_CHANNEL_ID};
use crate::remoting::{
    FailureListener, PacketDispatcher, PacketHandler, RemotingConnection, ServerConnectionHandler,
};
use crate::security::{CheckType, Principal, SecurityGuard};
use crate::transaction::TransactionCoordinator;
use crate::{CorvidError, Result};

pub struct BrokerState {
    pub config: Arc<BrokerConfig>,
    pub post_office: Arc<PostOffice>,
    pub coordinator: Arc<TransactionCoordinator>,
    pub security: SecurityGuard,
    pub metrics: Arc<MetricsRegistry>,
    pub dispatcher: Arc<PacketDispatcher>,
    sessions: DashMap<String, Arc<ServerSession>>,
    /// Temporary queues by owning connection id
    temp_queues: DashMap<String, Vec<String>>,
    /// Principal authenticated on each connection
    principals: DashMap<String, Principal>,
}

impl std::fmt::Debug for BrokerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerState")
            .field("sessions", &self.sessions.len())
            .field("temp_queues", &self.temp_queues.len())
            .finish()
    }
}

impl BrokerState {
    pub fn new(
        config: Arc<BrokerConfig>,
        post_office: Arc<PostOffice>,
        coordinator: Arc<TransactionCoordinator>,
        metrics: Arc<MetricsRegistry>,
        dispatcher: Arc<PacketDispatcher>,
    ) -> Self {
        let security = SecurityGuard::from_config(&config.security);
        Self {
            config,
            post_office,
            coordinator,
            security,
            metrics,
            dispatcher,
            sessions: DashMap::new(),
            temp_queues: DashMap::new(),
            principals: DashMap::new(),
        }
    }

    pub fn session(&self, name: &str) -> Option<Arc<ServerSession>> {
        self.sessions.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn sessions(&self) -> Vec<Arc<ServerSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Register a session under its name and channel id
    pub fn add_session(&self, session: Arc<ServerSession>) -> Result<()> {
        match self.sessions.entry(session.name().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CorvidError::IllegalState(format!(
                    "session {} already exists",
                    session.name()
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&session));
            }
        }
        self.dispatcher.register(session);
        self.metrics.session_opened();
        Ok(())
    }

    /// Forget `session` if it is still the one registered under `name`
    pub fn remove_session(&self, name: &str, session: &ServerSession) {
        self.sessions
            .remove_if(name, |_, registered| std::ptr::eq(registered.as_ref(), session));
    }

    fn principal_for(&self, connection_id: &str) -> Result<Principal> {
        match self.principals.get(connection_id) {
            Some(principal) => Ok(principal.value().clone()),
            None if self.security.is_enabled() => Err(CorvidError::Security(
                "connection has not authenticated".to_string(),
            )),
            None => Ok(Principal::anonymous()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_queue(
        &self,
        principal: &Principal,
        connection_id: &str,
        address: &str,
        name: &str,
        filter: Option<&str>,
        durable: bool,
        temporary: bool,
    ) -> Result<()> {
        let check = if durable {
            CheckType::CreateDurableQueue
        } else {
            CheckType::CreateTempQueue
        };
        self.security.guard(principal, check, address, || {
            self.post_office
                .create_queue(address, name, filter, durable, temporary)
        })?;
        if temporary {
            self.temp_queues
                .entry(connection_id.to_string())
                .or_default()
                .push(name.to_string());
        }
        Ok(())
    }

    pub fn delete_queue(&self, principal: &Principal, name: &str) -> Result<()> {
        let queue = self
            .post_office
            .queue(name)
            .ok_or_else(|| CorvidError::InvalidDestination(name.to_string()))?;
        let check = if queue.is_durable() {
            CheckType::DeleteDurableQueue
        } else {
            CheckType::DeleteTempQueue
        };
        self.security.guard(principal, check, queue.address(), || {
            self.post_office.delete_queue(name)
        })?;
        if queue.is_temporary() {
            for mut entry in self.temp_queues.iter_mut() {
                entry.value_mut().retain(|queue_name| queue_name != name);
            }
        }
        Ok(())
    }

    /// Release everything the failed connection owned
    pub fn connection_closed(&self, connection_id: &str) {
        self.principals.remove(connection_id);

        let owned: Vec<Arc<ServerSession>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().connection().id() == connection_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in owned {
            if session.supports_reattach() {
                session.detach();
            } else {
                session.close();
            }
        }

        if let Some((_, names)) = self.temp_queues.remove(connection_id) {
            for name in names {
                match self.post_office.delete_queue(&name) {
                    Ok(_) => debug!(queue = %name, connection_id, "Temporary queue removed"),
                    Err(CorvidError::InvalidDestination(_)) => {}
                    Err(e) => warn!(queue = %name, error = %e, "Failed to remove temporary queue"),
                }
            }
        }
    }

    /// Close sessions detached for longer than `ttl`
    pub fn reap_detached(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<ServerSession>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().detach_expired(now, ttl))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in &expired {
            info!(session = %session.name(), "Detached session expired");
            session.close();
        }
        expired.len()
    }

    /// Close every session, used on shutdown
    pub fn close_all(&self) {
        for session in self.sessions() {
            session.close();
        }
    }
}

/// Handles channel 1 of every connection
pub struct ControlHandler {
    state: Arc<BrokerState>,
}

impl ControlHandler {
    pub fn new(state: Arc<BrokerState>) -> Arc<Self> {
        Arc::new(Self { state })
    }

    #[allow(clippy::too_many_arguments)]
    fn create_session(
        &self,
        connection: &Arc<RemotingConnection>,
        name: String,
        version: i32,
        username: Option<String>,
        password: Option<String>,
        options: SessionOptions,
    ) -> Result<PacketBody> {
        if version != PROTOCOL_VERSION {
            return Err(CorvidError::IncompatibleVersion {
                client: version,
                server: PROTOCOL_VERSION,
            });
        }
        let principal = self
            .state
            .security
            .authenticate(username.as_deref(), password.as_deref())?;
        self.state
            .principals
            .insert(connection.id().to_string(), principal.clone());

        let channel_id = self.state.dispatcher.generate_id();
        let session = ServerSession::new(
            name,
            channel_id,
            principal,
            options,
            Arc::clone(connection),
            Arc::clone(&self.state),
        );
        self.state.add_session(Arc::clone(&session))?;
        info!(
            session = %session.name(),
            channel_id,
            connection_id = %connection.id(),
            "Session created"
        );
        Ok(PacketBody::CreateSessionResp {
            session_channel_id: channel_id,
            server_version: PROTOCOL_VERSION,
        })
    }

    fn reattach_session(&self, connection: &Arc<RemotingConnection>, name: &str) -> PacketBody {
        let refused = PacketBody::ReattachSessionResp {
            reattached: false,
            session_channel_id: 0,
            last_received_command_id: -1,
        };
        let Some(session) = self.state.session(name) else {
            debug!(session = %name, "No session to reattach");
            return refused;
        };
        if !session.supports_reattach() {
            return refused;
        }
        match session.reattach(Arc::clone(connection)) {
            Ok(last_received_command_id) => {
                self.state
                    .principals
                    .insert(connection.id().to_string(), session.principal().clone());
                PacketBody::ReattachSessionResp {
                    reattached: true,
                    session_channel_id: session.channel_id(),
                    last_received_command_id,
                }
            }
            Err(e) => {
                debug!(session = %name, error = %e, "Reattach refused");
                refused
            }
        }
    }

    fn process(
        &self,
        body: PacketBody,
        connection: &Arc<RemotingConnection>,
    ) -> Result<Option<PacketBody>> {
        use PacketBody as B;
        match body {
            B::CreateSession {
                name,
                version,
                username,
                password,
                xa,
                auto_commit_sends,
                auto_commit_acks,
                pre_acknowledge,
                confirmation_batch_size,
            } => {
                let options = SessionOptions {
                    xa,
                    auto_commit_sends,
                    auto_commit_acks,
                    pre_acknowledge,
                    confirmation_batch_size,
                };
                self.create_session(connection, name, version, username, password, options)
                    .map(Some)
            }
            B::ReattachSession { name, .. } => Ok(Some(self.reattach_session(connection, &name))),
            B::CreateQueue {
                address,
                queue_name,
                filter,
                durable,
                temporary,
            } => {
                let principal = self.state.principal_for(connection.id())?;
                self.state.create_queue(
                    &principal,
                    connection.id(),
                    &address,
                    &queue_name,
                    filter.as_deref(),
                    durable,
                    temporary,
                )?;
                Ok(Some(B::NullResponse))
            }
            B::DeleteQueue { queue_name } => {
                let principal = self.state.principal_for(connection.id())?;
                self.state.delete_queue(&principal, &queue_name)?;
                Ok(Some(B::NullResponse))
            }
            B::Disconnect => {
                debug!(connection_id = %connection.id(), "Client disconnected");
                connection.fail(CorvidError::ConnectionFailed(
                    "client disconnected".to_string(),
                ));
                Ok(None)
            }
            other => Err(CorvidError::Protocol(format!(
                "unexpected {:?} on control channel",
                other.packet_type()
            ))),
        }
    }
}

impl PacketHandler for ControlHandler {
    fn id(&self) -> u64 {
        CONTROL_CHANNEL_ID
    }

    fn handle(&self, packet: Packet, connection: &Arc<RemotingConnection>) {
        let requires_response = packet.is_request();
        let packet_type = packet.packet_type();
        match self.process(packet.body, connection) {
            Ok(Some(response)) => {
                if let Err(e) = connection.write(Packet::new(CONTROL_CHANNEL_ID, response)) {
                    debug!(connection_id = %connection.id(), error = %e, "Response not written");
                }
            }
            Ok(None) => {}
            Err(e) if requires_response => connection.send_exception(CONTROL_CHANNEL_ID, &e),
            Err(e) => warn!(
                connection_id = %connection.id(),
                packet_type = ?packet_type,
                error = %e,
                "Control command failed"
            ),
        }
    }
}

struct ConnectionCleanup {
    state: Arc<BrokerState>,
    connection_id: String,
}

impl FailureListener for ConnectionCleanup {
    fn connection_failed(&self, error: &CorvidError) {
        debug!(connection_id = %self.connection_id, error = %error, "Cleaning up connection");
        self.state.connection_closed(&self.connection_id);
    }
}

impl ServerConnectionHandler for ControlHandler {
    fn connection_created(&self, connection: &Arc<RemotingConnection>) {
        connection.add_failure_listener(Arc::new(ConnectionCleanup {
            state: Arc::clone(&self.state),
            connection_id: connection.id().to_string(),
        }));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{RoleGrant, SecurityConfig, UserConfig};
    use crate::remoting::connection::tests::{test_connection, RecordingTransport};
    use crate::storage::InMemoryStorageManager;
    use tempfile::{tempdir, TempDir};

    pub(crate) fn state_with(config: BrokerConfig) -> (TempDir, Arc<BrokerState>) {
        let dir = tempdir().unwrap();
        let config = Arc::new(BrokerConfig {
            data_dir: dir.path().to_string_lossy().to_string(),
            ..config
        });
        let metrics = Arc::new(MetricsRegistry::new());
        let post_office = Arc::new(PostOffice::new(
            Arc::clone(&config),
            Arc::new(InMemoryStorageManager::new()),
            Arc::clone(&metrics),
        ));
        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::clone(&post_office),
            Arc::clone(&metrics),
            config.transaction_timeout_secs,
        ));
        let state = Arc::new(BrokerState::new(
            config,
            post_office,
            coordinator,
            metrics,
            Arc::new(PacketDispatcher::new()),
        ));
        (dir, state)
    }

    pub(crate) fn test_state() -> (TempDir, Arc<BrokerState>) {
        state_with(BrokerConfig::in_vm(0))
    }

    fn create_session(name: &str, confirmation_batch_size: i32) -> PacketBody {
        PacketBody::CreateSession {
            name: name.to_string(),
            version: PROTOCOL_VERSION,
            username: None,
            password: None,
            xa: false,
            auto_commit_sends: true,
            auto_commit_acks: true,
            pre_acknowledge: false,
            confirmation_batch_size,
        }
    }

    struct Control {
        handler: Arc<ControlHandler>,
        connection: Arc<RemotingConnection>,
        transport: Arc<RecordingTransport>,
    }

    impl Control {
        fn new(state: &Arc<BrokerState>) -> Self {
            let handler = ControlHandler::new(Arc::clone(state));
            let (connection, transport) =
                test_connection(Arc::clone(&state.dispatcher), Duration::from_secs(1));
            handler.connection_created(&connection);
            Self {
                handler,
                connection,
                transport,
            }
        }

        fn call(&self, body: PacketBody) -> PacketBody {
            self.handler
                .handle(Packet::new(CONTROL_CHANNEL_ID, body), &self.connection);
            self.transport.packets().pop().unwrap().body
        }
    }

    #[tokio::test]
    async fn test_create_session_registers_channel() {
        let (_dir, state) = test_state();
        let control = Control::new(&state);
        let PacketBody::CreateSessionResp {
            session_channel_id, ..
        } = control.call(create_session("s1", -1))
        else {
            panic!("expected a session response");
        };
        assert!(session_channel_id > CONTROL_CHANNEL_ID);
        assert!(state.dispatcher.handler(session_channel_id).is_some());
        assert_eq!(state.session_count(), 1);

        let duplicate = control.call(create_session("s1", -1));
        assert!(matches!(duplicate, PacketBody::Exception { .. }));
    }

    #[tokio::test]
    async fn test_incompatible_version_rejected() {
        let (_dir, state) = test_state();
        let control = Control::new(&state);
        let mut request = create_session("s1", -1);
        if let PacketBody::CreateSession { version, .. } = &mut request {
            *version = PROTOCOL_VERSION + 1;
        }
        match control.call(request) {
            PacketBody::Exception { code, .. } => {
                assert_eq!(code, crate::ErrorCode::IncompatibleVersion as i32)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_temporary_queue_removed_with_connection() {
        let (_dir, state) = test_state();
        let control = Control::new(&state);
        control.call(create_session("s1", -1));
        let response = control.call(PacketBody::CreateQueue {
            address: "tmp".into(),
            queue_name: "tmp".into(),
            filter: None,
            durable: false,
            temporary: true,
        });
        assert_eq!(response, PacketBody::NullResponse);
        assert!(state.post_office.queue("tmp").is_some());

        control.connection.fail(CorvidError::ConnectionFailed("gone".into()));
        assert!(state.post_office.queue("tmp").is_none());
        assert_eq!(state.session_count(), 0);
    }

    #[tokio::test]
    async fn test_reattachable_session_detached_then_reattached() {
        let (_dir, state) = test_state();
        let control = Control::new(&state);
        control.call(create_session("s1", 5));
        control.connection.fail(CorvidError::ConnectionTimedOut);
        let session = state.session("s1").unwrap();
        assert!(session.is_detached());

        let replacement = Control::new(&state);
        match replacement.call(PacketBody::ReattachSession {
            name: "s1".into(),
            last_received_command_id: -1,
        }) {
            PacketBody::ReattachSessionResp {
                reattached,
                session_channel_id,
                last_received_command_id,
            } => {
                assert!(reattached);
                assert_eq!(session_channel_id, session.channel_id());
                assert_eq!(last_received_command_id, -1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!session.is_detached());
        assert_eq!(session.connection().id(), replacement.connection.id());
    }

    #[tokio::test]
    async fn test_reattach_unknown_session_refused() {
        let (_dir, state) = test_state();
        let control = Control::new(&state);
        assert!(matches!(
            control.call(PacketBody::ReattachSession {
                name: "nobody".into(),
                last_received_command_id: 3,
            }),
            PacketBody::ReattachSessionResp {
                reattached: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_detached_sessions_reaped() {
        let (_dir, state) = test_state();
        let control = Control::new(&state);
        control.call(create_session("s1", 5));
        control.connection.fail(CorvidError::ConnectionTimedOut);
        assert_eq!(state.reap_detached(Duration::from_secs(60)), 0);
        assert_eq!(state.reap_detached(Duration::ZERO), 1);
        assert_eq!(state.session_count(), 0);
    }

    #[tokio::test]
    async fn test_security_denies_durable_queue() {
        let mut config = BrokerConfig::in_vm(0);
        config.security = SecurityConfig {
            enabled: true,
            users: vec![UserConfig {
                username: "guest".into(),
                password: "guest".into(),
                roles: vec!["guests".into()],
            }],
            grants: vec![RoleGrant {
                pattern: "#".into(),
                role: "guests".into(),
                permissions: vec![CheckType::CreateTempQueue, CheckType::Send],
            }],
        };
        let (_dir, state) = state_with(config);
        let control = Control::new(&state);

        let mut request = create_session("s1", -1);
        if let PacketBody::CreateSession {
            username, password, ..
        } = &mut request
        {
            *username = Some("guest".into());
            *password = Some("wrong".into());
        }
        assert!(matches!(control.call(request.clone()), PacketBody::Exception { .. }));

        if let PacketBody::CreateSession { password, .. } = &mut request {
            *password = Some("guest".into());
        }
        assert!(matches!(
            control.call(request),
            PacketBody::CreateSessionResp { .. }
        ));

        let denied = control.call(PacketBody::CreateQueue {
            address: "orders".into(),
            queue_name: "orders".into(),
            filter: None,
            durable: true,
            temporary: false,
        });
        match denied {
            PacketBody::Exception { code, .. } => {
                assert_eq!(code, crate::ErrorCode::Security as i32)
            }
            other => panic!("unexpected {other:?}"),
        }
        // the connection stays usable
        let allowed = control.call(PacketBody::CreateQueue {
            address: "orders".into(),
            queue_name: "orders-tmp".into(),
            filter: None,
            durable: false,
            temporary: true,
        });
        assert_eq!(allowed, PacketBody::NullResponse);
    }
}
