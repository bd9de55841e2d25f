//! AMQP 0-9-1 wire format.

pub mod codec;
pub mod content;
pub mod errors;
pub mod frame;
pub mod methods;
pub mod types;

pub use codec::{body_chunk_size, AmqpCodecError, AmqpFrameCodec, Inbound};
pub use content::{BasicProperties, ContentHeader};
pub use errors::{ErrorCondition, FramingError, ReplyCode};
pub use frame::{Frame, FrameBody, ProtocolHeader};
pub use methods::{Method, XaStatus};
pub use types::{FieldTable, FieldValue, Xid};
