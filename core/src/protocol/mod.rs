//! # FluxQ Protocol Module
//!
//! Wire-level encoding for AMQP 0-9-1 as spoken by the broker.
//!
//! - [`amqp::types`]: integers, strings, field tables, Xids
//! - [`amqp::methods`]: the method table for the connection, channel, exchange,
//!   queue, basic, tx and dtx classes
//! - [`amqp::content`]: content headers and basic properties
//! - [`amqp::frame`]: the frame envelope and protocol header
//! - [`amqp::codec`]: `tokio_util` codec used by connections
//!
//! Decoding is strict. A truncated buffer is reported as
//! [`FramingError::Truncated`], and any structural problem inside a frame is a
//! typed [`FramingError`] carrying a symbolic [`ErrorCondition`]. Decoding a
//! valid frame and encoding it again reproduces the input byte for byte.

pub mod amqp;

#[cfg(test)]
mod tests;

pub use amqp::{
    AmqpCodecError, AmqpFrameCodec, BasicProperties, ContentHeader, ErrorCondition, FieldTable,
    FieldValue, Frame, FrameBody, FramingError, Inbound, Method, ProtocolHeader, ReplyCode,
    XaStatus, Xid,
};
