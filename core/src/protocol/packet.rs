//! Packet catalogue
//!
//! Every packet is a [`PacketBody`] addressed to a channel. Type codes are
//! stable across versions and never reassigned; new packets take unused
//! codes. Codes 92-98 are held back for a replication protocol that this
//! broker does not speak.

use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{
    get_bool, get_bytes, get_i32, get_i64, get_nullable_string, get_string, get_u32, get_u64,
    nullable_string_size, put_bool, put_bytes, put_nullable_string, put_string, string_size,
    CodecError, Result, FRAME_HEADER_SIZE, FRAME_LENGTH_SIZE,
};
use super::message::Message;

/// Channel carrying session creation, reattach and queue administration
pub const CONTROL_CHANNEL_ID: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Ping = 10,
    Pong = 11,
    Disconnect = 12,
    Exception = 20,
    NullResponse = 21,
    PacketsConfirmed = 22,
    CreateSession = 30,
    CreateSessionResp = 31,
    ReattachSession = 32,
    ReattachSessionResp = 33,
    CreateQueue = 34,
    DeleteQueue = 35,
    SessCreateConsumer = 40,
    SessProducerRequestCredits = 41,
    SessProducerCredits = 42,
    SessExpired = 43,
    SessAcknowledge = 44,
    SessConsumerFlowCredit = 45,
    SessCommit = 46,
    SessRollback = 47,
    SessQueueQuery = 48,
    SessQueueQueryResp = 49,
    SessBindingQuery = 50,
    SessBindingQueryResp = 51,
    SessXaStart = 56,
    SessXaEnd = 57,
    SessXaCommit = 58,
    SessXaPrepare = 59,
    SessXaResp = 60,
    SessXaRollback = 61,
    SessXaJoin = 62,
    SessXaSuspend = 63,
    SessXaResume = 64,
    SessXaForget = 65,
    SessXaInDoubtXids = 66,
    SessXaInDoubtXidsResp = 67,
    SessXaSetTimeout = 68,
    SessXaSetTimeoutResp = 69,
    SessXaGetTimeout = 70,
    SessXaGetTimeoutResp = 71,
    SessStart = 72,
    SessStop = 73,
    SessClose = 74,
    SessConsumerClose = 75,
    SessSend = 76,
    SessReceiveMsg = 77,
    SessFailoverComplete = 81,
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self> {
        use PacketType::*;
        let packet_type = match code {
            10 => Ping,
            11 => Pong,
            12 => Disconnect,
            20 => Exception,
            21 => NullResponse,
            22 => PacketsConfirmed,
            30 => CreateSession,
            31 => CreateSessionResp,
            32 => ReattachSession,
            33 => ReattachSessionResp,
            34 => CreateQueue,
            35 => DeleteQueue,
            40 => SessCreateConsumer,
            41 => SessProducerRequestCredits,
            42 => SessProducerCredits,
            43 => SessExpired,
            44 => SessAcknowledge,
            45 => SessConsumerFlowCredit,
            46 => SessCommit,
            47 => SessRollback,
            48 => SessQueueQuery,
            49 => SessQueueQueryResp,
            50 => SessBindingQuery,
            51 => SessBindingQueryResp,
            56 => SessXaStart,
            57 => SessXaEnd,
            58 => SessXaCommit,
            59 => SessXaPrepare,
            60 => SessXaResp,
            61 => SessXaRollback,
            62 => SessXaJoin,
            63 => SessXaSuspend,
            64 => SessXaResume,
            65 => SessXaForget,
            66 => SessXaInDoubtXids,
            67 => SessXaInDoubtXidsResp,
            68 => SessXaSetTimeout,
            69 => SessXaSetTimeoutResp,
            70 => SessXaGetTimeout,
            71 => SessXaGetTimeoutResp,
            72 => SessStart,
            73 => SessStop,
            74 => SessClose,
            75 => SessConsumerClose,
            76 => SessSend,
            77 => SessReceiveMsg,
            81 => SessFailoverComplete,
            92..=98 => return Err(CodecError::ReservedPacketType(code)),
            other => return Err(CodecError::UnknownPacketType(other)),
        };
        Ok(packet_type)
    }
}

impl PacketType {
    /// Packets that complete a blocking request on their channel
    pub fn is_response(self) -> bool {
        use PacketType::*;
        matches!(
            self,
            Exception
                | NullResponse
                | CreateSessionResp
                | ReattachSessionResp
                | SessQueueQueryResp
                | SessBindingQueryResp
                | SessXaResp
                | SessXaInDoubtXidsResp
                | SessXaSetTimeoutResp
                | SessXaGetTimeoutResp
        )
    }
}

/// Distributed transaction branch identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    pub format_id: i32,
    pub global_transaction_id: Bytes,
    pub branch_qualifier: Bytes,
}

impl Xid {
    pub fn new(
        format_id: i32,
        global_transaction_id: impl Into<Bytes>,
        branch_qualifier: impl Into<Bytes>,
    ) -> Self {
        Self {
            format_id,
            global_transaction_id: global_transaction_id.into(),
            branch_qualifier: branch_qualifier.into(),
        }
    }

    fn encoded_size(&self) -> usize {
        4 + 4 + self.global_transaction_id.len() + 4 + self.branch_qualifier.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.format_id);
        put_bytes(buf, &self.global_transaction_id);
        put_bytes(buf, &self.branch_qualifier);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            format_id: get_i32(buf)?,
            global_transaction_id: get_bytes(buf)?,
            branch_qualifier: get_bytes(buf)?,
        })
    }
}

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.format_id)?;
        for b in self.global_transaction_id.iter() {
            write!(f, "{b:02x}")?;
        }
        f.write_str(":")?;
        for b in self.branch_qualifier.iter() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    Ping {
        connection_ttl_ms: i64,
    },
    Pong,
    Disconnect,
    Exception {
        code: i32,
        message: String,
    },
    NullResponse,
    PacketsConfirmed {
        command_id: i64,
    },
    CreateSession {
        name: String,
        version: i32,
        username: Option<String>,
        password: Option<String>,
        xa: bool,
        auto_commit_sends: bool,
        auto_commit_acks: bool,
        pre_acknowledge: bool,
        confirmation_batch_size: i32,
    },
    CreateSessionResp {
        session_channel_id: u64,
        server_version: i32,
    },
    ReattachSession {
        name: String,
        last_received_command_id: i64,
    },
    ReattachSessionResp {
        reattached: bool,
        session_channel_id: u64,
        last_received_command_id: i64,
    },
    CreateQueue {
        address: String,
        queue_name: String,
        filter: Option<String>,
        durable: bool,
        temporary: bool,
    },
    DeleteQueue {
        queue_name: String,
    },
    SessCreateConsumer {
        consumer_id: u64,
        queue_name: String,
        filter: Option<String>,
        browse_only: bool,
    },
    SessProducerRequestCredits {
        address: String,
        credits: i32,
    },
    SessProducerCredits {
        address: String,
        credits: i32,
    },
    SessExpired {
        consumer_id: u64,
        message_id: u64,
    },
    SessAcknowledge {
        consumer_id: u64,
        message_id: u64,
        requires_response: bool,
    },
    SessConsumerFlowCredit {
        consumer_id: u64,
        credits: i32,
    },
    SessCommit,
    SessRollback,
    SessQueueQuery {
        queue_name: String,
    },
    SessQueueQueryResp {
        exists: bool,
        address: Option<String>,
        filter: Option<String>,
        durable: bool,
        temporary: bool,
        consumer_count: i32,
        message_count: i64,
    },
    SessBindingQuery {
        address: String,
    },
    SessBindingQueryResp {
        exists: bool,
        queue_names: Vec<String>,
    },
    SessXaStart {
        xid: Xid,
    },
    SessXaEnd {
        xid: Xid,
        failed: bool,
    },
    SessXaCommit {
        xid: Xid,
        one_phase: bool,
    },
    SessXaPrepare {
        xid: Xid,
    },
    SessXaResp {
        error: bool,
        response_code: i32,
        message: Option<String>,
    },
    SessXaRollback {
        xid: Xid,
    },
    SessXaJoin {
        xid: Xid,
    },
    SessXaSuspend,
    SessXaResume {
        xid: Xid,
    },
    SessXaForget {
        xid: Xid,
    },
    SessXaInDoubtXids,
    SessXaInDoubtXidsResp {
        xids: Vec<Xid>,
    },
    SessXaSetTimeout {
        timeout_seconds: i32,
    },
    SessXaSetTimeoutResp {
        ok: bool,
    },
    SessXaGetTimeout,
    SessXaGetTimeoutResp {
        timeout_seconds: i32,
    },
    SessStart,
    SessStop,
    SessClose,
    SessConsumerClose {
        consumer_id: u64,
    },
    SessSend {
        message: Message,
        requires_response: bool,
    },
    SessReceiveMsg {
        consumer_id: u64,
        delivery_count: i32,
        message: Message,
    },
    SessFailoverComplete {
        name: String,
    },
}

impl PacketBody {
    pub fn packet_type(&self) -> PacketType {
        use PacketBody as B;
        use PacketType as T;
        match self {
            B::Ping { .. } => T::Ping,
            B::Pong => T::Pong,
            B::Disconnect => T::Disconnect,
            B::Exception { .. } => T::Exception,
            B::NullResponse => T::NullResponse,
            B::PacketsConfirmed { .. } => T::PacketsConfirmed,
            B::CreateSession { .. } => T::CreateSession,
            B::CreateSessionResp { .. } => T::CreateSessionResp,
            B::ReattachSession { .. } => T::ReattachSession,
            B::ReattachSessionResp { .. } => T::ReattachSessionResp,
            B::CreateQueue { .. } => T::CreateQueue,
            B::DeleteQueue { .. } => T::DeleteQueue,
            B::SessCreateConsumer { .. } => T::SessCreateConsumer,
            B::SessProducerRequestCredits { .. } => T::SessProducerRequestCredits,
            B::SessProducerCredits { .. } => T::SessProducerCredits,
            B::SessExpired { .. } => T::SessExpired,
            B::SessAcknowledge { .. } => T::SessAcknowledge,
            B::SessConsumerFlowCredit { .. } => T::SessConsumerFlowCredit,
            B::SessCommit => T::SessCommit,
            B::SessRollback => T::SessRollback,
            B::SessQueueQuery { .. } => T::SessQueueQuery,
            B::SessQueueQueryResp { .. } => T::SessQueueQueryResp,
            B::SessBindingQuery { .. } => T::SessBindingQuery,
            B::SessBindingQueryResp { .. } => T::SessBindingQueryResp,
            B::SessXaStart { .. } => T::SessXaStart,
            B::SessXaEnd { .. } => T::SessXaEnd,
            B::SessXaCommit { .. } => T::SessXaCommit,
            B::SessXaPrepare { .. } => T::SessXaPrepare,
            B::SessXaResp { .. } => T::SessXaResp,
            B::SessXaRollback { .. } => T::SessXaRollback,
            B::SessXaJoin { .. } => T::SessXaJoin,
            B::SessXaSuspend => T::SessXaSuspend,
            B::SessXaResume { .. } => T::SessXaResume,
            B::SessXaForget { .. } => T::SessXaForget,
            B::SessXaInDoubtXids => T::SessXaInDoubtXids,
            B::SessXaInDoubtXidsResp { .. } => T::SessXaInDoubtXidsResp,
            B::SessXaSetTimeout { .. } => T::SessXaSetTimeout,
            B::SessXaSetTimeoutResp { .. } => T::SessXaSetTimeoutResp,
            B::SessXaGetTimeout => T::SessXaGetTimeout,
            B::SessXaGetTimeoutResp { .. } => T::SessXaGetTimeoutResp,
            B::SessStart => T::SessStart,
            B::SessStop => T::SessStop,
            B::SessClose => T::SessClose,
            B::SessConsumerClose { .. } => T::SessConsumerClose,
            B::SessSend { .. } => T::SessSend,
            B::SessReceiveMsg { .. } => T::SessReceiveMsg,
            B::SessFailoverComplete { .. } => T::SessFailoverComplete,
        }
    }

    /// Whether the sender waits for a response on the same channel
    pub fn is_request(&self) -> bool {
        use PacketBody as B;
        match self {
            B::CreateSession { .. }
            | B::ReattachSession { .. }
            | B::CreateQueue { .. }
            | B::DeleteQueue { .. }
            | B::SessCreateConsumer { .. }
            | B::SessCommit
            | B::SessRollback
            | B::SessQueueQuery { .. }
            | B::SessBindingQuery { .. }
            | B::SessXaStart { .. }
            | B::SessXaEnd { .. }
            | B::SessXaCommit { .. }
            | B::SessXaPrepare { .. }
            | B::SessXaRollback { .. }
            | B::SessXaJoin { .. }
            | B::SessXaSuspend
            | B::SessXaResume { .. }
            | B::SessXaForget { .. }
            | B::SessXaInDoubtXids
            | B::SessXaSetTimeout { .. }
            | B::SessXaGetTimeout
            | B::SessClose
            | B::SessConsumerClose { .. } => true,
            B::SessSend {
                requires_response, ..
            }
            | B::SessAcknowledge {
                requires_response, ..
            } => *requires_response,
            _ => false,
        }
    }

    pub fn is_response(&self) -> bool {
        self.packet_type().is_response()
    }

    /// Upper bound of the encoded body length
    pub fn body_size(&self) -> usize {
        use PacketBody as B;
        match self {
            B::Ping { .. } | B::PacketsConfirmed { .. } => 8,
            B::Pong
            | B::Disconnect
            | B::NullResponse
            | B::SessCommit
            | B::SessRollback
            | B::SessXaSuspend
            | B::SessXaInDoubtXids
            | B::SessXaGetTimeout
            | B::SessStart
            | B::SessStop
            | B::SessClose => 0,
            B::Exception { message, .. } => 4 + string_size(message),
            B::CreateSession {
                name,
                username,
                password,
                ..
            } => {
                string_size(name)
                    + 4
                    + nullable_string_size(username.as_deref())
                    + nullable_string_size(password.as_deref())
                    + 4
                    + 4
            }
            B::CreateSessionResp { .. } => 8 + 4,
            B::ReattachSession { name, .. } => string_size(name) + 8,
            B::ReattachSessionResp { .. } => 1 + 8 + 8,
            B::CreateQueue {
                address,
                queue_name,
                filter,
                ..
            } => {
                string_size(address)
                    + string_size(queue_name)
                    + nullable_string_size(filter.as_deref())
                    + 2
            }
            B::DeleteQueue { queue_name } | B::SessQueueQuery { queue_name } => {
                string_size(queue_name)
            }
            B::SessCreateConsumer {
                queue_name, filter, ..
            } => 8 + string_size(queue_name) + nullable_string_size(filter.as_deref()) + 1,
            B::SessProducerRequestCredits { address, .. }
            | B::SessProducerCredits { address, .. } => string_size(address) + 4,
            B::SessExpired { .. } => 16,
            B::SessAcknowledge { .. } => 17,
            B::SessConsumerFlowCredit { .. } => 12,
            B::SessQueueQueryResp {
                address, filter, ..
            } => {
                1 + nullable_string_size(address.as_deref())
                    + nullable_string_size(filter.as_deref())
                    + 2
                    + 4
                    + 8
            }
            B::SessBindingQuery { address } => string_size(address),
            B::SessBindingQueryResp { queue_names, .. } => {
                1 + 4 + queue_names.iter().map(|q| string_size(q)).sum::<usize>()
            }
            B::SessXaStart { xid }
            | B::SessXaPrepare { xid }
            | B::SessXaRollback { xid }
            | B::SessXaJoin { xid }
            | B::SessXaResume { xid }
            | B::SessXaForget { xid } => xid.encoded_size(),
            B::SessXaEnd { xid, .. } | B::SessXaCommit { xid, .. } => xid.encoded_size() + 1,
            B::SessXaResp { message, .. } => 1 + 4 + nullable_string_size(message.as_deref()),
            B::SessXaInDoubtXidsResp { xids } => {
                4 + xids.iter().map(Xid::encoded_size).sum::<usize>()
            }
            B::SessXaSetTimeout { .. } | B::SessXaGetTimeoutResp { .. } => 4,
            B::SessXaSetTimeoutResp { .. } => 1,
            B::SessConsumerClose { .. } => 8,
            B::SessSend { message, .. } => message.encoded_size() + 1,
            B::SessReceiveMsg { message, .. } => 8 + 4 + message.encoded_size(),
            B::SessFailoverComplete { name } => string_size(name),
        }
    }

    pub fn encode_body(&self, buf: &mut BytesMut) {
        use PacketBody as B;
        match self {
            B::Ping { connection_ttl_ms } => buf.put_i64(*connection_ttl_ms),
            B::Pong
            | B::Disconnect
            | B::NullResponse
            | B::SessCommit
            | B::SessRollback
            | B::SessXaSuspend
            | B::SessXaInDoubtXids
            | B::SessXaGetTimeout
            | B::SessStart
            | B::SessStop
            | B::SessClose => {}
            B::Exception { code, message } => {
                buf.put_i32(*code);
                put_string(buf, message);
            }
            B::PacketsConfirmed { command_id } => buf.put_i64(*command_id),
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
                put_string(buf, name);
                buf.put_i32(*version);
                put_nullable_string(buf, username.as_deref());
                put_nullable_string(buf, password.as_deref());
                put_bool(buf, *xa);
                put_bool(buf, *auto_commit_sends);
                put_bool(buf, *auto_commit_acks);
                put_bool(buf, *pre_acknowledge);
                buf.put_i32(*confirmation_batch_size);
            }
            B::CreateSessionResp {
                session_channel_id,
                server_version,
            } => {
                buf.put_u64(*session_channel_id);
                buf.put_i32(*server_version);
            }
            B::ReattachSession {
                name,
                last_received_command_id,
            } => {
                put_string(buf, name);
                buf.put_i64(*last_received_command_id);
            }
            B::ReattachSessionResp {
                reattached,
                session_channel_id,
                last_received_command_id,
            } => {
                put_bool(buf, *reattached);
                buf.put_u64(*session_channel_id);
                buf.put_i64(*last_received_command_id);
            }
            B::CreateQueue {
                address,
                queue_name,
                filter,
                durable,
                temporary,
            } => {
                put_string(buf, address);
                put_string(buf, queue_name);
                put_nullable_string(buf, filter.as_deref());
                put_bool(buf, *durable);
                put_bool(buf, *temporary);
            }
            B::DeleteQueue { queue_name } | B::SessQueueQuery { queue_name } => {
                put_string(buf, queue_name)
            }
            B::SessCreateConsumer {
                consumer_id,
                queue_name,
                filter,
                browse_only,
            } => {
                buf.put_u64(*consumer_id);
                put_string(buf, queue_name);
                put_nullable_string(buf, filter.as_deref());
                put_bool(buf, *browse_only);
            }
            B::SessProducerRequestCredits { address, credits }
            | B::SessProducerCredits { address, credits } => {
                put_string(buf, address);
                buf.put_i32(*credits);
            }
            B::SessExpired {
                consumer_id,
                message_id,
            } => {
                buf.put_u64(*consumer_id);
                buf.put_u64(*message_id);
            }
            B::SessAcknowledge {
                consumer_id,
                message_id,
                requires_response,
            } => {
                buf.put_u64(*consumer_id);
                buf.put_u64(*message_id);
                put_bool(buf, *requires_response);
            }
            B::SessConsumerFlowCredit {
                consumer_id,
                credits,
            } => {
                buf.put_u64(*consumer_id);
                buf.put_i32(*credits);
            }
            B::SessQueueQueryResp {
                exists,
                address,
                filter,
                durable,
                temporary,
                consumer_count,
                message_count,
            } => {
                put_bool(buf, *exists);
                put_nullable_string(buf, address.as_deref());
                put_nullable_string(buf, filter.as_deref());
                put_bool(buf, *durable);
                put_bool(buf, *temporary);
                buf.put_i32(*consumer_count);
                buf.put_i64(*message_count);
            }
            B::SessBindingQuery { address } => put_string(buf, address),
            B::SessBindingQueryResp {
                exists,
                queue_names,
            } => {
                put_bool(buf, *exists);
                buf.put_u32(queue_names.len() as u32);
                for name in queue_names {
                    put_string(buf, name);
                }
            }
            B::SessXaStart { xid }
            | B::SessXaPrepare { xid }
            | B::SessXaRollback { xid }
            | B::SessXaJoin { xid }
            | B::SessXaResume { xid }
            | B::SessXaForget { xid } => xid.encode(buf),
            B::SessXaEnd { xid, failed } => {
                xid.encode(buf);
                put_bool(buf, *failed);
            }
            B::SessXaCommit { xid, one_phase } => {
                xid.encode(buf);
                put_bool(buf, *one_phase);
            }
            B::SessXaResp {
                error,
                response_code,
                message,
            } => {
                put_bool(buf, *error);
                buf.put_i32(*response_code);
                put_nullable_string(buf, message.as_deref());
            }
            B::SessXaInDoubtXidsResp { xids } => {
                buf.put_u32(xids.len() as u32);
                for xid in xids {
                    xid.encode(buf);
                }
            }
            B::SessXaSetTimeout { timeout_seconds }
            | B::SessXaGetTimeoutResp { timeout_seconds } => buf.put_i32(*timeout_seconds),
            B::SessXaSetTimeoutResp { ok } => put_bool(buf, *ok),
            B::SessConsumerClose { consumer_id } => buf.put_u64(*consumer_id),
            B::SessSend {
                message,
                requires_response,
            } => {
                message.encode(buf);
                put_bool(buf, *requires_response);
            }
            B::SessReceiveMsg {
                consumer_id,
                delivery_count,
                message,
            } => {
                buf.put_u64(*consumer_id);
                buf.put_i32(*delivery_count);
                message.encode(buf);
            }
            B::SessFailoverComplete { name } => put_string(buf, name),
        }
    }

    pub fn decode_body(packet_type: PacketType, buf: &mut Bytes) -> Result<Self> {
        use PacketBody as B;
        use PacketType as T;
        let body = match packet_type {
            T::Ping => B::Ping {
                connection_ttl_ms: get_i64(buf)?,
            },
            T::Pong => B::Pong,
            T::Disconnect => B::Disconnect,
            T::Exception => B::Exception {
                code: get_i32(buf)?,
                message: get_string(buf)?,
            },
            T::NullResponse => B::NullResponse,
            T::PacketsConfirmed => B::PacketsConfirmed {
                command_id: get_i64(buf)?,
            },
            T::CreateSession => B::CreateSession {
                name: get_string(buf)?,
                version: get_i32(buf)?,
                username: get_nullable_string(buf)?,
                password: get_nullable_string(buf)?,
                xa: get_bool(buf)?,
                auto_commit_sends: get_bool(buf)?,
                auto_commit_acks: get_bool(buf)?,
                pre_acknowledge: get_bool(buf)?,
                confirmation_batch_size: get_i32(buf)?,
            },
            T::CreateSessionResp => B::CreateSessionResp {
                session_channel_id: get_u64(buf)?,
                server_version: get_i32(buf)?,
            },
            T::ReattachSession => B::ReattachSession {
                name: get_string(buf)?,
                last_received_command_id: get_i64(buf)?,
            },
            T::ReattachSessionResp => B::ReattachSessionResp {
                reattached: get_bool(buf)?,
                session_channel_id: get_u64(buf)?,
                last_received_command_id: get_i64(buf)?,
            },
            T::CreateQueue => B::CreateQueue {
                address: get_string(buf)?,
                queue_name: get_string(buf)?,
                filter: get_nullable_string(buf)?,
                durable: get_bool(buf)?,
                temporary: get_bool(buf)?,
            },
            T::DeleteQueue => B::DeleteQueue {
                queue_name: get_string(buf)?,
            },
            T::SessCreateConsumer => B::SessCreateConsumer {
                consumer_id: get_u64(buf)?,
                queue_name: get_string(buf)?,
                filter: get_nullable_string(buf)?,
                browse_only: get_bool(buf)?,
            },
            T::SessProducerRequestCredits => B::SessProducerRequestCredits {
                address: get_string(buf)?,
                credits: get_i32(buf)?,
            },
            T::SessProducerCredits => B::SessProducerCredits {
                address: get_string(buf)?,
                credits: get_i32(buf)?,
            },
            T::SessExpired => B::SessExpired {
                consumer_id: get_u64(buf)?,
                message_id: get_u64(buf)?,
            },
            T::SessAcknowledge => B::SessAcknowledge {
                consumer_id: get_u64(buf)?,
                message_id: get_u64(buf)?,
                requires_response: get_bool(buf)?,
            },
            T::SessConsumerFlowCredit => B::SessConsumerFlowCredit {
                consumer_id: get_u64(buf)?,
                credits: get_i32(buf)?,
            },
            T::SessCommit => B::SessCommit,
            T::SessRollback => B::SessRollback,
            T::SessQueueQuery => B::SessQueueQuery {
                queue_name: get_string(buf)?,
            },
            T::SessQueueQueryResp => B::SessQueueQueryResp {
                exists: get_bool(buf)?,
                address: get_nullable_string(buf)?,
                filter: get_nullable_string(buf)?,
                durable: get_bool(buf)?,
                temporary: get_bool(buf)?,
                consumer_count: get_i32(buf)?,
                message_count: get_i64(buf)?,
            },
            T::SessBindingQuery => B::SessBindingQuery {
                address: get_string(buf)?,
            },
            T::SessBindingQueryResp => {
                let exists = get_bool(buf)?;
                let count = get_u32(buf)? as usize;
                let mut queue_names = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    queue_names.push(get_string(buf)?);
                }
                B::SessBindingQueryResp {
                    exists,
                    queue_names,
                }
            }
            T::SessXaStart => B::SessXaStart {
                xid: Xid::decode(buf)?,
            },
            T::SessXaEnd => B::SessXaEnd {
                xid: Xid::decode(buf)?,
                failed: get_bool(buf)?,
            },
            T::SessXaCommit => B::SessXaCommit {
                xid: Xid::decode(buf)?,
                one_phase: get_bool(buf)?,
            },
            T::SessXaPrepare => B::SessXaPrepare {
                xid: Xid::decode(buf)?,
            },
            T::SessXaResp => B::SessXaResp {
                error: get_bool(buf)?,
                response_code: get_i32(buf)?,
                message: get_nullable_string(buf)?,
            },
            T::SessXaRollback => B::SessXaRollback {
                xid: Xid::decode(buf)?,
            },
            T::SessXaJoin => B::SessXaJoin {
                xid: Xid::decode(buf)?,
            },
            T::SessXaSuspend => B::SessXaSuspend,
            T::SessXaResume => B::SessXaResume {
                xid: Xid::decode(buf)?,
            },
            T::SessXaForget => B::SessXaForget {
                xid: Xid::decode(buf)?,
            },
            T::SessXaInDoubtXids => B::SessXaInDoubtXids,
            T::SessXaInDoubtXidsResp => {
                let count = get_u32(buf)? as usize;
                let mut xids = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    xids.push(Xid::decode(buf)?);
                }
                B::SessXaInDoubtXidsResp { xids }
            }
            T::SessXaSetTimeout => B::SessXaSetTimeout {
                timeout_seconds: get_i32(buf)?,
            },
            T::SessXaSetTimeoutResp => B::SessXaSetTimeoutResp {
                ok: get_bool(buf)?,
            },
            T::SessXaGetTimeout => B::SessXaGetTimeout,
            T::SessXaGetTimeoutResp => B::SessXaGetTimeoutResp {
                timeout_seconds: get_i32(buf)?,
            },
            T::SessStart => B::SessStart,
            T::SessStop => B::SessStop,
            T::SessClose => B::SessClose,
            T::SessConsumerClose => B::SessConsumerClose {
                consumer_id: get_u64(buf)?,
            },
            T::SessSend => B::SessSend {
                message: Message::decode(buf)?,
                requires_response: get_bool(buf)?,
            },
            T::SessReceiveMsg => B::SessReceiveMsg {
                consumer_id: get_u64(buf)?,
                delivery_count: get_i32(buf)?,
                message: Message::decode(buf)?,
            },
            T::SessFailoverComplete => B::SessFailoverComplete {
                name: get_string(buf)?,
            },
        };
        Ok(body)
    }
}

/// A packet addressed to a logical channel on a connection
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub channel_id: u64,
    pub body: PacketBody,
}

impl Packet {
    pub fn new(channel_id: u64, body: PacketBody) -> Self {
        Self { channel_id, body }
    }

    pub fn packet_type(&self) -> PacketType {
        self.body.packet_type()
    }

    pub fn is_request(&self) -> bool {
        self.body.is_request()
    }

    pub fn is_response(&self) -> bool {
        self.body.is_response()
    }

    /// Pre-allocation hint for the full frame, length prefix included
    pub fn required_buffer_size(&self) -> usize {
        FRAME_LENGTH_SIZE + FRAME_HEADER_SIZE + self.body.body_size()
    }
}
