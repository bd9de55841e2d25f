//! Content header frames and basic-class message properties.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::errors::FramingError;
use super::types::{FieldTable, WireReader, WireWrite};

const FLAG_CONTENT_TYPE: u16 = 1 << 15;
const FLAG_CONTENT_ENCODING: u16 = 1 << 14;
const FLAG_HEADERS: u16 = 1 << 13;
const FLAG_DELIVERY_MODE: u16 = 1 << 12;
const FLAG_PRIORITY: u16 = 1 << 11;
const FLAG_CORRELATION_ID: u16 = 1 << 10;
const FLAG_REPLY_TO: u16 = 1 << 9;
const FLAG_EXPIRATION: u16 = 1 << 8;
const FLAG_MESSAGE_ID: u16 = 1 << 7;
const FLAG_TIMESTAMP: u16 = 1 << 6;
const FLAG_TYPE: u16 = 1 << 5;
const FLAG_USER_ID: u16 = 1 << 4;
const FLAG_APP_ID: u16 = 1 << 3;
const FLAG_CLUSTER_ID: u16 = 1 << 2;
/// Bits 0 (continuation) and 1 are never produced by this codec.
const UNSUPPORTED_FLAGS: u16 = 0b11;

/// Delivery mode value that marks a message persistent.
pub const PERSISTENT: u8 = 2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

impl BasicProperties {
    pub fn persistent() -> Self {
        Self {
            delivery_mode: Some(PERSISTENT),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_header(mut self, name: &str, value: super::types::FieldValue) -> Self {
        self.headers
            .get_or_insert_with(FieldTable::new)
            .insert(name, value);
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(PERSISTENT)
    }

    fn flags(&self) -> u16 {
        let mut flags = 0;
        let mut set = |present: bool, flag: u16| {
            if present {
                flags |= flag;
            }
        };
        set(self.content_type.is_some(), FLAG_CONTENT_TYPE);
        set(self.content_encoding.is_some(), FLAG_CONTENT_ENCODING);
        set(self.headers.is_some(), FLAG_HEADERS);
        set(self.delivery_mode.is_some(), FLAG_DELIVERY_MODE);
        set(self.priority.is_some(), FLAG_PRIORITY);
        set(self.correlation_id.is_some(), FLAG_CORRELATION_ID);
        set(self.reply_to.is_some(), FLAG_REPLY_TO);
        set(self.expiration.is_some(), FLAG_EXPIRATION);
        set(self.message_id.is_some(), FLAG_MESSAGE_ID);
        set(self.timestamp.is_some(), FLAG_TIMESTAMP);
        set(self.kind.is_some(), FLAG_TYPE);
        set(self.user_id.is_some(), FLAG_USER_ID);
        set(self.app_id.is_some(), FLAG_APP_ID);
        set(self.cluster_id.is_some(), FLAG_CLUSTER_ID);
        flags
    }

    fn decode(flags: u16, r: &mut WireReader<'_>) -> Result<Self, FramingError> {
        if flags & UNSUPPORTED_FLAGS != 0 {
            return Err(FramingError::malformed(
                "property flags",
                format!("unsupported flag bits in {flags:#06x}"),
            ));
        }
        let has = |flag: u16| flags & flag != 0;
        fn shortstr(
            r: &mut WireReader<'_>,
            present: bool,
        ) -> Result<Option<String>, FramingError> {
            if present {
                r.read_shortstr().map(Some)
            } else {
                Ok(None)
            }
        }
        Ok(Self {
            content_type: shortstr(r, has(FLAG_CONTENT_TYPE))?,
            content_encoding: shortstr(r, has(FLAG_CONTENT_ENCODING))?,
            headers: if has(FLAG_HEADERS) {
                Some(r.read_table()?)
            } else {
                None
            },
            delivery_mode: if has(FLAG_DELIVERY_MODE) {
                Some(r.read_octet()?)
            } else {
                None
            },
            priority: if has(FLAG_PRIORITY) {
                Some(r.read_octet()?)
            } else {
                None
            },
            correlation_id: shortstr(r, has(FLAG_CORRELATION_ID))?,
            reply_to: shortstr(r, has(FLAG_REPLY_TO))?,
            expiration: shortstr(r, has(FLAG_EXPIRATION))?,
            message_id: shortstr(r, has(FLAG_MESSAGE_ID))?,
            timestamp: if has(FLAG_TIMESTAMP) {
                Some(r.read_longlong()?)
            } else {
                None
            },
            kind: shortstr(r, has(FLAG_TYPE))?,
            user_id: shortstr(r, has(FLAG_USER_ID))?,
            app_id: shortstr(r, has(FLAG_APP_ID))?,
            cluster_id: shortstr(r, has(FLAG_CLUSTER_ID))?,
        })
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(self.flags());
        let strings_before = [&self.content_type, &self.content_encoding];
        for value in strings_before.into_iter().flatten() {
            dst.put_shortstr(value);
        }
        if let Some(headers) = &self.headers {
            dst.put_table(headers);
        }
        if let Some(mode) = self.delivery_mode {
            dst.put_u8(mode);
        }
        if let Some(priority) = self.priority {
            dst.put_u8(priority);
        }
        let strings_middle = [
            &self.correlation_id,
            &self.reply_to,
            &self.expiration,
            &self.message_id,
        ];
        for value in strings_middle.into_iter().flatten() {
            dst.put_shortstr(value);
        }
        if let Some(timestamp) = self.timestamp {
            dst.put_u64(timestamp);
        }
        let strings_after = [&self.kind, &self.user_id, &self.app_id, &self.cluster_id];
        for value in strings_after.into_iter().flatten() {
            dst.put_shortstr(value);
        }
    }
}

/// Payload of a content-header frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    pub class_id: u16,
    pub weight: u16,
    pub body_size: u64,
    pub properties: BasicProperties,
}

impl ContentHeader {
    pub fn basic(body_size: u64, properties: BasicProperties) -> Self {
        Self {
            class_id: super::methods::CLASS_BASIC,
            weight: 0,
            body_size,
            properties,
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FramingError> {
        let mut r = WireReader::new(payload);
        let class_id = r.read_short()?;
        let weight = r.read_short()?;
        let body_size = r.read_longlong()?;
        let flags = r.read_short()?;
        let properties = BasicProperties::decode(flags, &mut r)?;
        r.finish()?;
        Ok(Self {
            class_id,
            weight,
            body_size,
            properties,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(self.class_id);
        dst.put_u16(self.weight);
        dst.put_u64(self.body_size);
        self.properties.encode(dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::amqp::types::FieldValue;

    #[test]
    fn only_present_properties_are_written() {
        let header = ContentHeader::basic(5, BasicProperties::persistent().with_priority(7));
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        // class, weight, size, flags, delivery-mode, priority
        assert_eq!(buf.len(), 2 + 2 + 8 + 2 + 1 + 1);
        assert_eq!(&buf[12..14], &(FLAG_DELIVERY_MODE | FLAG_PRIORITY).to_be_bytes());
        assert_eq!(ContentHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn full_property_set_is_exact() {
        let properties = BasicProperties {
            content_type: Some("text/plain".into()),
            content_encoding: Some("utf-8".into()),
            headers: Some(FieldTable::new().with("k", FieldValue::string("v"))),
            delivery_mode: Some(1),
            priority: Some(3),
            correlation_id: Some("c".into()),
            reply_to: Some("r".into()),
            expiration: Some("1000".into()),
            message_id: Some("m".into()),
            timestamp: Some(42),
            kind: Some("t".into()),
            user_id: Some("guest".into()),
            app_id: Some("a".into()),
            cluster_id: Some(String::new()),
        };
        let header = ContentHeader::basic(0, properties);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let decoded = ContentHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        let mut again = BytesMut::new();
        decoded.encode(&mut again);
        assert_eq!(again, buf);
    }

    #[test]
    fn continuation_flag_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(60);
        buf.put_u16(0);
        buf.put_u64(0);
        buf.put_u16(0x0001);
        assert!(matches!(
            ContentHeader::decode(&buf),
            Err(FramingError::Malformed { .. })
        ));
    }
}
