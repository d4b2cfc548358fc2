//! # Wire protocol
//!
//! Packet model and binary codec shared by client and server.
//!
//! - [`packet`] - packet catalogue, stable type codes and body layouts
//! - [`message`] - the routable message and its encoding
//! - [`codec`] - framing, buffer helpers and [`CodecError`]

pub mod codec;
pub mod message;
pub mod packet;

pub use codec::{decode_frame, decode_packet, encode_packet, frame_channel_id, CodecError};
pub use message::{Message, PropertyValue, DUPLICATE_ID_PROPERTY};
pub use packet::{Packet, PacketBody, PacketType, Xid, CONTROL_CHANNEL_ID};
