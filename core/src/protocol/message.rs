//! Message model shared by the wire protocol and the page files.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{
    get_bool, get_bytes, get_f64, get_i64, get_string, get_u32, get_u64, get_u8, put_bool,
    put_bytes, put_string, string_size, CodecError, Result,
};

/// Property carrying the duplicate-detection id of a message
pub const DUPLICATE_ID_PROPERTY: &str = "_CV_DUPL_ID";

pub const MIN_PRIORITY: u8 = 0;
pub const MAX_PRIORITY: u8 = 9;
pub const DEFAULT_PRIORITY: u8 = 4;

const TAG_BOOL: u8 = 0;
const TAG_LONG: u8 = 1;
const TAG_DOUBLE: u8 = 2;
const TAG_STRING: u8 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Long(i64),
    Double(f64),
    String(String),
}

impl PropertyValue {
    fn encoded_size(&self) -> usize {
        1 + match self {
            PropertyValue::Bool(_) => 1,
            PropertyValue::Long(_) | PropertyValue::Double(_) => 8,
            PropertyValue::String(s) => string_size(s),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            PropertyValue::Bool(v) => {
                buf.put_u8(TAG_BOOL);
                put_bool(buf, *v);
            }
            PropertyValue::Long(v) => {
                buf.put_u8(TAG_LONG);
                buf.put_i64(*v);
            }
            PropertyValue::Double(v) => {
                buf.put_u8(TAG_DOUBLE);
                buf.put_f64(*v);
            }
            PropertyValue::String(v) => {
                buf.put_u8(TAG_STRING);
                put_string(buf, v);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        match get_u8(buf)? {
            TAG_BOOL => Ok(PropertyValue::Bool(get_bool(buf)?)),
            TAG_LONG => Ok(PropertyValue::Long(get_i64(buf)?)),
            TAG_DOUBLE => Ok(PropertyValue::Double(get_f64(buf)?)),
            TAG_STRING => Ok(PropertyValue::String(get_string(buf)?)),
            tag => Err(CodecError::InvalidFormat(format!(
                "unknown property tag {tag}"
            ))),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Long(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Long(i64::from(value))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Double(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

/// A routable message.
///
/// `message_id` is assigned by the server when the message is routed; a
/// client-built message carries 0 until then.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: u64,
    pub address: String,
    pub durable: bool,
    pub priority: u8,
    /// Absolute expiry in milliseconds since the epoch, 0 for never
    pub expiration: i64,
    pub timestamp: i64,
    pub properties: HashMap<String, PropertyValue>,
    pub body: Bytes,
}

impl Message {
    pub fn new(address: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            message_id: 0,
            address: address.into(),
            durable: false,
            priority: DEFAULT_PRIORITY,
            expiration: 0,
            timestamp: current_millis(),
            properties: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_expiration(mut self, expiration: i64) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn duplicate_id(&self) -> Option<String> {
        match self.properties.get(DUPLICATE_ID_PROPERTY)? {
            PropertyValue::String(s) => Some(s.clone()),
            PropertyValue::Long(v) => Some(v.to_string()),
            _ => None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expiration > 0 && current_millis() > self.expiration
    }

    /// Bytes this message occupies in memory accounting and on the wire
    pub fn encoded_size(&self) -> usize {
        let properties: usize = self
            .properties
            .iter()
            .map(|(k, v)| string_size(k) + v.encoded_size())
            .sum();
        8 + string_size(&self.address) + 1 + 1 + 8 + 8 + 4 + properties + 4 + self.body.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.message_id);
        put_string(buf, &self.address);
        put_bool(buf, self.durable);
        buf.put_u8(self.priority);
        buf.put_i64(self.expiration);
        buf.put_i64(self.timestamp);
        buf.put_u32(self.properties.len() as u32);
        for (key, value) in &self.properties {
            put_string(buf, key);
            value.encode(buf);
        }
        put_bytes(buf, &self.body);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let message_id = get_u64(buf)?;
        let address = get_string(buf)?;
        let durable = get_bool(buf)?;
        let priority = get_u8(buf)?;
        if priority > MAX_PRIORITY {
            return Err(CodecError::InvalidFormat(format!(
                "priority {priority} out of range"
            )));
        }
        let expiration = get_i64(buf)?;
        let timestamp = get_i64(buf)?;
        let count = get_u32(buf)? as usize;
        let mut properties = HashMap::with_capacity(count.min(64));
        for _ in 0..count {
            let key = get_string(buf)?;
            let value = PropertyValue::decode(buf)?;
            properties.insert(key, value);
        }
        let body = get_bytes(buf)?;

        Ok(Self {
            message_id,
            address,
            durable,
            priority,
            expiration,
            timestamp,
            properties,
            body,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf);
        buf.freeze()
    }
}

pub(crate) fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
