//! Method frames: `class:u16 | method:u16 | arguments`.
//!
//! Arguments are positional. Consecutive `bit` arguments share one octet,
//! least significant bit first.

use bytes::{BufMut, Bytes, BytesMut};

use super::errors::FramingError;
use super::types::{FieldTable, WireReader, WireWrite, Xid};

pub const CLASS_CONNECTION: u16 = 10;
pub const CLASS_CHANNEL: u16 = 20;
pub const CLASS_EXCHANGE: u16 = 40;
pub const CLASS_QUEUE: u16 = 50;
pub const CLASS_BASIC: u16 = 60;
pub const CLASS_TX: u16 = 90;
pub const CLASS_DTX: u16 = 100;

/// Outcome codes carried by the `dtx.*-ok` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum XaStatus {
    XaOk = 0,
    XaRbRollback = 1,
    XaRbTimeout = 2,
    XaHeurHaz = 3,
    XaHeurCom = 4,
    XaHeurRb = 5,
    XaHeurMix = 6,
    XaRdOnly = 7,
}

impl XaStatus {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => Self::XaOk,
            1 => Self::XaRbRollback,
            2 => Self::XaRbTimeout,
            3 => Self::XaHeurHaz,
            4 => Self::XaHeurCom,
            5 => Self::XaHeurRb,
            6 => Self::XaHeurMix,
            7 => Self::XaRdOnly,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        server_properties: FieldTable,
        mechanisms: Bytes,
        locales: Bytes,
    },
    ConnectionStartOk {
        client_properties: FieldTable,
        mechanism: String,
        response: Bytes,
        locale: String,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        virtual_host: String,
        capabilities: String,
        insist: bool,
    },
    ConnectionOpenOk {
        known_hosts: String,
    },
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ConnectionCloseOk,

    ChannelOpen {
        out_of_band: String,
    },
    ChannelOpenOk {
        channel_id: Bytes,
    },
    ChannelFlow {
        active: bool,
    },
    ChannelFlowOk {
        active: bool,
    },
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ChannelCloseOk,

    ExchangeDeclare {
        ticket: u16,
        exchange: String,
        kind: String,
        passive: bool,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    ExchangeDeclareOk,
    ExchangeDelete {
        ticket: u16,
        exchange: String,
        if_unused: bool,
        no_wait: bool,
    },
    ExchangeDeleteOk,

    QueueDeclare {
        ticket: u16,
        queue: String,
        passive: bool,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    QueueBind {
        ticket: u16,
        queue: String,
        exchange: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueBindOk,
    QueuePurge {
        ticket: u16,
        queue: String,
        no_wait: bool,
    },
    QueuePurgeOk {
        message_count: u32,
    },
    QueueDelete {
        ticket: u16,
        queue: String,
        if_unused: bool,
        if_empty: bool,
        no_wait: bool,
    },
    QueueDeleteOk {
        message_count: u32,
    },
    QueueUnbind {
        ticket: u16,
        queue: String,
        exchange: String,
        routing_key: String,
        arguments: FieldTable,
    },
    QueueUnbindOk,

    BasicQos {
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    },
    BasicQosOk,
    BasicConsume {
        ticket: u16,
        queue: String,
        consumer_tag: String,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    BasicCancel {
        consumer_tag: String,
        no_wait: bool,
    },
    BasicCancelOk {
        consumer_tag: String,
    },
    BasicPublish {
        ticket: u16,
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    },
    BasicReturn {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
    BasicDeliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
    BasicGet {
        ticket: u16,
        queue: String,
        no_ack: bool,
    },
    BasicGetOk {
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
        message_count: u32,
    },
    BasicGetEmpty {
        cluster_id: String,
    },
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicReject {
        delivery_tag: u64,
        requeue: bool,
    },
    BasicRecover {
        requeue: bool,
    },
    BasicRecoverOk,
    BasicNack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },

    TxSelect,
    TxSelectOk,
    TxCommit,
    TxCommitOk,
    TxRollback,
    TxRollbackOk,

    DtxSelect,
    DtxSelectOk,
    DtxStart {
        xid: Xid,
        join: bool,
        resume: bool,
    },
    DtxStartOk {
        status: XaStatus,
    },
    DtxEnd {
        xid: Xid,
        fail: bool,
        suspend: bool,
    },
    DtxEndOk {
        status: XaStatus,
    },
    DtxCommit {
        xid: Xid,
        one_phase: bool,
    },
    DtxCommitOk {
        status: XaStatus,
    },
    DtxForget {
        xid: Xid,
    },
    DtxForgetOk,
    DtxPrepare {
        xid: Xid,
    },
    DtxPrepareOk {
        status: XaStatus,
    },
    DtxRecover,
    DtxRecoverOk {
        xids: Vec<Xid>,
    },
    DtxRollback {
        xid: Xid,
    },
    DtxRollbackOk {
        status: XaStatus,
    },
}

fn bit(flags: u8, index: u8) -> bool {
    flags & (1 << index) != 0
}

fn put_bits(dst: &mut BytesMut, bits: &[bool]) {
    let flags = bits
        .iter()
        .enumerate()
        .fold(0u8, |acc, (i, b)| if *b { acc | (1 << i) } else { acc });
    dst.put_u8(flags);
}

/// Rejects bits beyond the ones a method defines, so that re-encoding is exact.
fn read_bits(r: &mut WireReader<'_>, count: u8) -> Result<u8, FramingError> {
    let flags = r.read_octet()?;
    if flags >> count != 0 {
        return Err(FramingError::malformed(
            "bit field",
            format!("reserved bits set in {flags:#010b}"),
        ));
    }
    Ok(flags)
}

fn read_status(r: &mut WireReader<'_>) -> Result<XaStatus, FramingError> {
    let raw = r.read_short()?;
    XaStatus::from_u16(raw)
        .ok_or_else(|| FramingError::malformed("xa status", format!("unknown status {raw}")))
}

impl Method {
    /// `(class id, method id)` pair identifying this method on the wire.
    pub fn ids(&self) -> (u16, u16) {
        use Method::*;
        match self {
            ConnectionStart { .. } => (CLASS_CONNECTION, 10),
            ConnectionStartOk { .. } => (CLASS_CONNECTION, 11),
            ConnectionTune { .. } => (CLASS_CONNECTION, 30),
            ConnectionTuneOk { .. } => (CLASS_CONNECTION, 31),
            ConnectionOpen { .. } => (CLASS_CONNECTION, 40),
            ConnectionOpenOk { .. } => (CLASS_CONNECTION, 41),
            ConnectionClose { .. } => (CLASS_CONNECTION, 50),
            ConnectionCloseOk => (CLASS_CONNECTION, 51),
            ChannelOpen { .. } => (CLASS_CHANNEL, 10),
            ChannelOpenOk { .. } => (CLASS_CHANNEL, 11),
            ChannelFlow { .. } => (CLASS_CHANNEL, 20),
            ChannelFlowOk { .. } => (CLASS_CHANNEL, 21),
            ChannelClose { .. } => (CLASS_CHANNEL, 40),
            ChannelCloseOk => (CLASS_CHANNEL, 41),
            ExchangeDeclare { .. } => (CLASS_EXCHANGE, 10),
            ExchangeDeclareOk => (CLASS_EXCHANGE, 11),
            ExchangeDelete { .. } => (CLASS_EXCHANGE, 20),
            ExchangeDeleteOk => (CLASS_EXCHANGE, 21),
            QueueDeclare { .. } => (CLASS_QUEUE, 10),
            QueueDeclareOk { .. } => (CLASS_QUEUE, 11),
            QueueBind { .. } => (CLASS_QUEUE, 20),
            QueueBindOk => (CLASS_QUEUE, 21),
            QueuePurge { .. } => (CLASS_QUEUE, 30),
            QueuePurgeOk { .. } => (CLASS_QUEUE, 31),
            QueueDelete { .. } => (CLASS_QUEUE, 40),
            QueueDeleteOk { .. } => (CLASS_QUEUE, 41),
            QueueUnbind { .. } => (CLASS_QUEUE, 50),
            QueueUnbindOk => (CLASS_QUEUE, 51),
            BasicQos { .. } => (CLASS_BASIC, 10),
            BasicQosOk => (CLASS_BASIC, 11),
            BasicConsume { .. } => (CLASS_BASIC, 20),
            BasicConsumeOk { .. } => (CLASS_BASIC, 21),
            BasicCancel { .. } => (CLASS_BASIC, 30),
            BasicCancelOk { .. } => (CLASS_BASIC, 31),
            BasicPublish { .. } => (CLASS_BASIC, 40),
            BasicReturn { .. } => (CLASS_BASIC, 50),
            BasicDeliver { .. } => (CLASS_BASIC, 60),
            BasicGet { .. } => (CLASS_BASIC, 70),
            BasicGetOk { .. } => (CLASS_BASIC, 71),
            BasicGetEmpty { .. } => (CLASS_BASIC, 72),
            BasicAck { .. } => (CLASS_BASIC, 80),
            BasicReject { .. } => (CLASS_BASIC, 90),
            BasicRecover { .. } => (CLASS_BASIC, 110),
            BasicRecoverOk => (CLASS_BASIC, 111),
            BasicNack { .. } => (CLASS_BASIC, 120),
            TxSelect => (CLASS_TX, 10),
            TxSelectOk => (CLASS_TX, 11),
            TxCommit => (CLASS_TX, 20),
            TxCommitOk => (CLASS_TX, 21),
            TxRollback => (CLASS_TX, 30),
            TxRollbackOk => (CLASS_TX, 31),
            DtxSelect => (CLASS_DTX, 10),
            DtxSelectOk => (CLASS_DTX, 11),
            DtxStart { .. } => (CLASS_DTX, 20),
            DtxStartOk { .. } => (CLASS_DTX, 21),
            DtxEnd { .. } => (CLASS_DTX, 30),
            DtxEndOk { .. } => (CLASS_DTX, 31),
            DtxCommit { .. } => (CLASS_DTX, 40),
            DtxCommitOk { .. } => (CLASS_DTX, 41),
            DtxForget { .. } => (CLASS_DTX, 50),
            DtxForgetOk => (CLASS_DTX, 51),
            DtxPrepare { .. } => (CLASS_DTX, 60),
            DtxPrepareOk { .. } => (CLASS_DTX, 61),
            DtxRecover => (CLASS_DTX, 70),
            DtxRecoverOk { .. } => (CLASS_DTX, 71),
            DtxRollback { .. } => (CLASS_DTX, 80),
            DtxRollbackOk { .. } => (CLASS_DTX, 81),
        }
    }

    pub fn class_id(&self) -> u16 {
        self.ids().0
    }

    pub fn method_id(&self) -> u16 {
        self.ids().1
    }

    /// Methods followed by a content header and body frames.
    pub fn carries_content(&self) -> bool {
        matches!(
            self,
            Method::BasicPublish { .. }
                | Method::BasicReturn { .. }
                | Method::BasicDeliver { .. }
                | Method::BasicGetOk { .. }
        )
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FramingError> {
        let mut r = WireReader::new(payload);
        let class_id = r.read_short()?;
        let method_id = r.read_short()?;
        let method = Self::decode_arguments(class_id, method_id, &mut r)?;
        r.finish()?;
        Ok(method)
    }

    fn decode_arguments(
        class_id: u16,
        method_id: u16,
        r: &mut WireReader<'_>,
    ) -> Result<Self, FramingError> {
        use Method::*;
        let method = match (class_id, method_id) {
            (CLASS_CONNECTION, 10) => ConnectionStart {
                version_major: r.read_octet()?,
                version_minor: r.read_octet()?,
                server_properties: r.read_table()?,
                mechanisms: r.read_longstr()?,
                locales: r.read_longstr()?,
            },
            (CLASS_CONNECTION, 11) => ConnectionStartOk {
                client_properties: r.read_table()?,
                mechanism: r.read_shortstr()?,
                response: r.read_longstr()?,
                locale: r.read_shortstr()?,
            },
            (CLASS_CONNECTION, 30) => ConnectionTune {
                channel_max: r.read_short()?,
                frame_max: r.read_long()?,
                heartbeat: r.read_short()?,
            },
            (CLASS_CONNECTION, 31) => ConnectionTuneOk {
                channel_max: r.read_short()?,
                frame_max: r.read_long()?,
                heartbeat: r.read_short()?,
            },
            (CLASS_CONNECTION, 40) => {
                let virtual_host = r.read_shortstr()?;
                let capabilities = r.read_shortstr()?;
                let flags = read_bits(r, 1)?;
                ConnectionOpen {
                    virtual_host,
                    capabilities,
                    insist: bit(flags, 0),
                }
            }
            (CLASS_CONNECTION, 41) => ConnectionOpenOk {
                known_hosts: r.read_shortstr()?,
            },
            (CLASS_CONNECTION, 50) => ConnectionClose {
                reply_code: r.read_short()?,
                reply_text: r.read_shortstr()?,
                class_id: r.read_short()?,
                method_id: r.read_short()?,
            },
            (CLASS_CONNECTION, 51) => ConnectionCloseOk,

            (CLASS_CHANNEL, 10) => ChannelOpen {
                out_of_band: r.read_shortstr()?,
            },
            (CLASS_CHANNEL, 11) => ChannelOpenOk {
                channel_id: r.read_longstr()?,
            },
            (CLASS_CHANNEL, 20) => ChannelFlow {
                active: bit(read_bits(r, 1)?, 0),
            },
            (CLASS_CHANNEL, 21) => ChannelFlowOk {
                active: bit(read_bits(r, 1)?, 0),
            },
            (CLASS_CHANNEL, 40) => ChannelClose {
                reply_code: r.read_short()?,
                reply_text: r.read_shortstr()?,
                class_id: r.read_short()?,
                method_id: r.read_short()?,
            },
            (CLASS_CHANNEL, 41) => ChannelCloseOk,

            (CLASS_EXCHANGE, 10) => {
                let ticket = r.read_short()?;
                let exchange = r.read_shortstr()?;
                let kind = r.read_shortstr()?;
                let flags = read_bits(r, 5)?;
                ExchangeDeclare {
                    ticket,
                    exchange,
                    kind,
                    passive: bit(flags, 0),
                    durable: bit(flags, 1),
                    auto_delete: bit(flags, 2),
                    internal: bit(flags, 3),
                    no_wait: bit(flags, 4),
                    arguments: r.read_table()?,
                }
            }
            (CLASS_EXCHANGE, 11) => ExchangeDeclareOk,
            (CLASS_EXCHANGE, 20) => {
                let ticket = r.read_short()?;
                let exchange = r.read_shortstr()?;
                let flags = read_bits(r, 2)?;
                ExchangeDelete {
                    ticket,
                    exchange,
                    if_unused: bit(flags, 0),
                    no_wait: bit(flags, 1),
                }
            }
            (CLASS_EXCHANGE, 21) => ExchangeDeleteOk,

            (CLASS_QUEUE, 10) => {
                let ticket = r.read_short()?;
                let queue = r.read_shortstr()?;
                let flags = read_bits(r, 5)?;
                QueueDeclare {
                    ticket,
                    queue,
                    passive: bit(flags, 0),
                    durable: bit(flags, 1),
                    exclusive: bit(flags, 2),
                    auto_delete: bit(flags, 3),
                    no_wait: bit(flags, 4),
                    arguments: r.read_table()?,
                }
            }
            (CLASS_QUEUE, 11) => QueueDeclareOk {
                queue: r.read_shortstr()?,
                message_count: r.read_long()?,
                consumer_count: r.read_long()?,
            },
            (CLASS_QUEUE, 20) => {
                let ticket = r.read_short()?;
                let queue = r.read_shortstr()?;
                let exchange = r.read_shortstr()?;
                let routing_key = r.read_shortstr()?;
                let flags = read_bits(r, 1)?;
                QueueBind {
                    ticket,
                    queue,
                    exchange,
                    routing_key,
                    no_wait: bit(flags, 0),
                    arguments: r.read_table()?,
                }
            }
            (CLASS_QUEUE, 21) => QueueBindOk,
            (CLASS_QUEUE, 30) => {
                let ticket = r.read_short()?;
                let queue = r.read_shortstr()?;
                let flags = read_bits(r, 1)?;
                QueuePurge {
                    ticket,
                    queue,
                    no_wait: bit(flags, 0),
                }
            }
            (CLASS_QUEUE, 31) => QueuePurgeOk {
                message_count: r.read_long()?,
            },
            (CLASS_QUEUE, 40) => {
                let ticket = r.read_short()?;
                let queue = r.read_shortstr()?;
                let flags = read_bits(r, 3)?;
                QueueDelete {
                    ticket,
                    queue,
                    if_unused: bit(flags, 0),
                    if_empty: bit(flags, 1),
                    no_wait: bit(flags, 2),
                }
            }
            (CLASS_QUEUE, 41) => QueueDeleteOk {
                message_count: r.read_long()?,
            },
            (CLASS_QUEUE, 50) => QueueUnbind {
                ticket: r.read_short()?,
                queue: r.read_shortstr()?,
                exchange: r.read_shortstr()?,
                routing_key: r.read_shortstr()?,
                arguments: r.read_table()?,
            },
            (CLASS_QUEUE, 51) => QueueUnbindOk,

            (CLASS_BASIC, 10) => {
                let prefetch_size = r.read_long()?;
                let prefetch_count = r.read_short()?;
                let flags = read_bits(r, 1)?;
                BasicQos {
                    prefetch_size,
                    prefetch_count,
                    global: bit(flags, 0),
                }
            }
            (CLASS_BASIC, 11) => BasicQosOk,
            (CLASS_BASIC, 20) => {
                let ticket = r.read_short()?;
                let queue = r.read_shortstr()?;
                let consumer_tag = r.read_shortstr()?;
                let flags = read_bits(r, 4)?;
                BasicConsume {
                    ticket,
                    queue,
                    consumer_tag,
                    no_local: bit(flags, 0),
                    no_ack: bit(flags, 1),
                    exclusive: bit(flags, 2),
                    no_wait: bit(flags, 3),
                    arguments: r.read_table()?,
                }
            }
            (CLASS_BASIC, 21) => BasicConsumeOk {
                consumer_tag: r.read_shortstr()?,
            },
            (CLASS_BASIC, 30) => {
                let consumer_tag = r.read_shortstr()?;
                let flags = read_bits(r, 1)?;
                BasicCancel {
                    consumer_tag,
                    no_wait: bit(flags, 0),
                }
            }
            (CLASS_BASIC, 31) => BasicCancelOk {
                consumer_tag: r.read_shortstr()?,
            },
            (CLASS_BASIC, 40) => {
                let ticket = r.read_short()?;
                let exchange = r.read_shortstr()?;
                let routing_key = r.read_shortstr()?;
                let flags = read_bits(r, 2)?;
                BasicPublish {
                    ticket,
                    exchange,
                    routing_key,
                    mandatory: bit(flags, 0),
                    immediate: bit(flags, 1),
                }
            }
            (CLASS_BASIC, 50) => BasicReturn {
                reply_code: r.read_short()?,
                reply_text: r.read_shortstr()?,
                exchange: r.read_shortstr()?,
                routing_key: r.read_shortstr()?,
            },
            (CLASS_BASIC, 60) => {
                let consumer_tag = r.read_shortstr()?;
                let delivery_tag = r.read_longlong()?;
                let flags = read_bits(r, 1)?;
                BasicDeliver {
                    consumer_tag,
                    delivery_tag,
                    redelivered: bit(flags, 0),
                    exchange: r.read_shortstr()?,
                    routing_key: r.read_shortstr()?,
                }
            }
            (CLASS_BASIC, 70) => {
                let ticket = r.read_short()?;
                let queue = r.read_shortstr()?;
                let flags = read_bits(r, 1)?;
                BasicGet {
                    ticket,
                    queue,
                    no_ack: bit(flags, 0),
                }
            }
            (CLASS_BASIC, 71) => {
                let delivery_tag = r.read_longlong()?;
                let flags = read_bits(r, 1)?;
                BasicGetOk {
                    delivery_tag,
                    redelivered: bit(flags, 0),
                    exchange: r.read_shortstr()?,
                    routing_key: r.read_shortstr()?,
                    message_count: r.read_long()?,
                }
            }
            (CLASS_BASIC, 72) => BasicGetEmpty {
                cluster_id: r.read_shortstr()?,
            },
            (CLASS_BASIC, 80) => {
                let delivery_tag = r.read_longlong()?;
                let flags = read_bits(r, 1)?;
                BasicAck {
                    delivery_tag,
                    multiple: bit(flags, 0),
                }
            }
            (CLASS_BASIC, 90) => {
                let delivery_tag = r.read_longlong()?;
                let flags = read_bits(r, 1)?;
                BasicReject {
                    delivery_tag,
                    requeue: bit(flags, 0),
                }
            }
            (CLASS_BASIC, 110) => BasicRecover {
                requeue: bit(read_bits(r, 1)?, 0),
            },
            (CLASS_BASIC, 111) => BasicRecoverOk,
            (CLASS_BASIC, 120) => {
                let delivery_tag = r.read_longlong()?;
                let flags = read_bits(r, 2)?;
                BasicNack {
                    delivery_tag,
                    multiple: bit(flags, 0),
                    requeue: bit(flags, 1),
                }
            }

            (CLASS_TX, 10) => TxSelect,
            (CLASS_TX, 11) => TxSelectOk,
            (CLASS_TX, 20) => TxCommit,
            (CLASS_TX, 21) => TxCommitOk,
            (CLASS_TX, 30) => TxRollback,
            (CLASS_TX, 31) => TxRollbackOk,

            (CLASS_DTX, 10) => DtxSelect,
            (CLASS_DTX, 11) => DtxSelectOk,
            (CLASS_DTX, 20) => {
                let xid = r.read_xid()?;
                let flags = read_bits(r, 2)?;
                DtxStart {
                    xid,
                    join: bit(flags, 0),
                    resume: bit(flags, 1),
                }
            }
            (CLASS_DTX, 21) => DtxStartOk {
                status: read_status(r)?,
            },
            (CLASS_DTX, 30) => {
                let xid = r.read_xid()?;
                let flags = read_bits(r, 2)?;
                DtxEnd {
                    xid,
                    fail: bit(flags, 0),
                    suspend: bit(flags, 1),
                }
            }
            (CLASS_DTX, 31) => DtxEndOk {
                status: read_status(r)?,
            },
            (CLASS_DTX, 40) => {
                let xid = r.read_xid()?;
                let flags = read_bits(r, 1)?;
                DtxCommit {
                    xid,
                    one_phase: bit(flags, 0),
                }
            }
            (CLASS_DTX, 41) => DtxCommitOk {
                status: read_status(r)?,
            },
            (CLASS_DTX, 50) => DtxForget { xid: r.read_xid()? },
            (CLASS_DTX, 51) => DtxForgetOk,
            (CLASS_DTX, 60) => DtxPrepare { xid: r.read_xid()? },
            (CLASS_DTX, 61) => DtxPrepareOk {
                status: read_status(r)?,
            },
            (CLASS_DTX, 70) => DtxRecover,
            (CLASS_DTX, 71) => {
                let count = r.read_long()? as usize;
                let mut xids = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    xids.push(r.read_xid()?);
                }
                DtxRecoverOk { xids }
            }
            (CLASS_DTX, 80) => DtxRollback { xid: r.read_xid()? },
            (CLASS_DTX, 81) => DtxRollbackOk {
                status: read_status(r)?,
            },

            (class_id, method_id) => {
                return Err(FramingError::UnknownMethod {
                    class_id,
                    method_id,
                })
            }
        };
        Ok(method)
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        use Method::*;
        let (class_id, method_id) = self.ids();
        dst.put_u16(class_id);
        dst.put_u16(method_id);
        match self {
            ConnectionStart {
                version_major,
                version_minor,
                server_properties,
                mechanisms,
                locales,
            } => {
                dst.put_u8(*version_major);
                dst.put_u8(*version_minor);
                dst.put_table(server_properties);
                dst.put_longstr(mechanisms);
                dst.put_longstr(locales);
            }
            ConnectionStartOk {
                client_properties,
                mechanism,
                response,
                locale,
            } => {
                dst.put_table(client_properties);
                dst.put_shortstr(mechanism);
                dst.put_longstr(response);
                dst.put_shortstr(locale);
            }
            ConnectionTune {
                channel_max,
                frame_max,
                heartbeat,
            }
            | ConnectionTuneOk {
                channel_max,
                frame_max,
                heartbeat,
            } => {
                dst.put_u16(*channel_max);
                dst.put_u32(*frame_max);
                dst.put_u16(*heartbeat);
            }
            ConnectionOpen {
                virtual_host,
                capabilities,
                insist,
            } => {
                dst.put_shortstr(virtual_host);
                dst.put_shortstr(capabilities);
                put_bits(dst, &[*insist]);
            }
            ConnectionOpenOk { known_hosts } => dst.put_shortstr(known_hosts),
            ConnectionClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            }
            | ChannelClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            } => {
                dst.put_u16(*reply_code);
                dst.put_shortstr(reply_text);
                dst.put_u16(*class_id);
                dst.put_u16(*method_id);
            }
            ChannelOpen { out_of_band } => dst.put_shortstr(out_of_band),
            ChannelOpenOk { channel_id } => dst.put_longstr(channel_id),
            ChannelFlow { active } | ChannelFlowOk { active } => put_bits(dst, &[*active]),
            ExchangeDeclare {
                ticket,
                exchange,
                kind,
                passive,
                durable,
                auto_delete,
                internal,
                no_wait,
                arguments,
            } => {
                dst.put_u16(*ticket);
                dst.put_shortstr(exchange);
                dst.put_shortstr(kind);
                put_bits(dst, &[*passive, *durable, *auto_delete, *internal, *no_wait]);
                dst.put_table(arguments);
            }
            ExchangeDelete {
                ticket,
                exchange,
                if_unused,
                no_wait,
            } => {
                dst.put_u16(*ticket);
                dst.put_shortstr(exchange);
                put_bits(dst, &[*if_unused, *no_wait]);
            }
            QueueDeclare {
                ticket,
                queue,
                passive,
                durable,
                exclusive,
                auto_delete,
                no_wait,
                arguments,
            } => {
                dst.put_u16(*ticket);
                dst.put_shortstr(queue);
                put_bits(dst, &[*passive, *durable, *exclusive, *auto_delete, *no_wait]);
                dst.put_table(arguments);
            }
            QueueDeclareOk {
                queue,
                message_count,
                consumer_count,
            } => {
                dst.put_shortstr(queue);
                dst.put_u32(*message_count);
                dst.put_u32(*consumer_count);
            }
            QueueBind {
                ticket,
                queue,
                exchange,
                routing_key,
                no_wait,
                arguments,
            } => {
                dst.put_u16(*ticket);
                dst.put_shortstr(queue);
                dst.put_shortstr(exchange);
                dst.put_shortstr(routing_key);
                put_bits(dst, &[*no_wait]);
                dst.put_table(arguments);
            }
            QueuePurge {
                ticket,
                queue,
                no_wait,
            } => {
                dst.put_u16(*ticket);
                dst.put_shortstr(queue);
                put_bits(dst, &[*no_wait]);
            }
            QueuePurgeOk { message_count } | QueueDeleteOk { message_count } => {
                dst.put_u32(*message_count)
            }
            QueueDelete {
                ticket,
                queue,
                if_unused,
                if_empty,
                no_wait,
            } => {
                dst.put_u16(*ticket);
                dst.put_shortstr(queue);
                put_bits(dst, &[*if_unused, *if_empty, *no_wait]);
            }
            QueueUnbind {
                ticket,
                queue,
                exchange,
                routing_key,
                arguments,
            } => {
                dst.put_u16(*ticket);
                dst.put_shortstr(queue);
                dst.put_shortstr(exchange);
                dst.put_shortstr(routing_key);
                dst.put_table(arguments);
            }
            BasicQos {
                prefetch_size,
                prefetch_count,
                global,
            } => {
                dst.put_u32(*prefetch_size);
                dst.put_u16(*prefetch_count);
                put_bits(dst, &[*global]);
            }
            BasicConsume {
                ticket,
                queue,
                consumer_tag,
                no_local,
                no_ack,
                exclusive,
                no_wait,
                arguments,
            } => {
                dst.put_u16(*ticket);
                dst.put_shortstr(queue);
                dst.put_shortstr(consumer_tag);
                put_bits(dst, &[*no_local, *no_ack, *exclusive, *no_wait]);
                dst.put_table(arguments);
            }
            BasicConsumeOk { consumer_tag } | BasicCancelOk { consumer_tag } => {
                dst.put_shortstr(consumer_tag)
            }
            BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                dst.put_shortstr(consumer_tag);
                put_bits(dst, &[*no_wait]);
            }
            BasicPublish {
                ticket,
                exchange,
                routing_key,
                mandatory,
                immediate,
            } => {
                dst.put_u16(*ticket);
                dst.put_shortstr(exchange);
                dst.put_shortstr(routing_key);
                put_bits(dst, &[*mandatory, *immediate]);
            }
            BasicReturn {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => {
                dst.put_u16(*reply_code);
                dst.put_shortstr(reply_text);
                dst.put_shortstr(exchange);
                dst.put_shortstr(routing_key);
            }
            BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                dst.put_shortstr(consumer_tag);
                dst.put_u64(*delivery_tag);
                put_bits(dst, &[*redelivered]);
                dst.put_shortstr(exchange);
                dst.put_shortstr(routing_key);
            }
            BasicGet {
                ticket,
                queue,
                no_ack,
            } => {
                dst.put_u16(*ticket);
                dst.put_shortstr(queue);
                put_bits(dst, &[*no_ack]);
            }
            BasicGetOk {
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
                message_count,
            } => {
                dst.put_u64(*delivery_tag);
                put_bits(dst, &[*redelivered]);
                dst.put_shortstr(exchange);
                dst.put_shortstr(routing_key);
                dst.put_u32(*message_count);
            }
            BasicGetEmpty { cluster_id } => dst.put_shortstr(cluster_id),
            BasicAck {
                delivery_tag,
                multiple,
            } => {
                dst.put_u64(*delivery_tag);
                put_bits(dst, &[*multiple]);
            }
            BasicReject {
                delivery_tag,
                requeue,
            } => {
                dst.put_u64(*delivery_tag);
                put_bits(dst, &[*requeue]);
            }
            BasicRecover { requeue } => put_bits(dst, &[*requeue]),
            BasicNack {
                delivery_tag,
                multiple,
                requeue,
            } => {
                dst.put_u64(*delivery_tag);
                put_bits(dst, &[*multiple, *requeue]);
            }
            DtxStart { xid, join, resume } => {
                dst.put_xid(xid);
                put_bits(dst, &[*join, *resume]);
            }
            DtxEnd { xid, fail, suspend } => {
                dst.put_xid(xid);
                put_bits(dst, &[*fail, *suspend]);
            }
            DtxCommit { xid, one_phase } => {
                dst.put_xid(xid);
                put_bits(dst, &[*one_phase]);
            }
            DtxForget { xid } | DtxPrepare { xid } | DtxRollback { xid } => dst.put_xid(xid),
            DtxStartOk { status }
            | DtxEndOk { status }
            | DtxCommitOk { status }
            | DtxPrepareOk { status }
            | DtxRollbackOk { status } => dst.put_u16(status.as_u16()),
            DtxRecoverOk { xids } => {
                dst.put_u32(xids.len() as u32);
                for xid in xids {
                    dst.put_xid(xid);
                }
            }
            ConnectionCloseOk | ChannelCloseOk | ExchangeDeclareOk | ExchangeDeleteOk
            | QueueBindOk | QueueUnbindOk | BasicQosOk | BasicRecoverOk | TxSelect
            | TxSelectOk | TxCommit | TxCommitOk | TxRollback | TxRollbackOk | DtxSelect
            | DtxSelectOk | DtxForgetOk | DtxRecover => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(method: &Method) -> BytesMut {
        let mut buf = BytesMut::new();
        method.encode(&mut buf);
        buf
    }

    #[test]
    fn tune_layout_matches_wire() {
        let buf = encoded(&Method::ConnectionTune {
            channel_max: 256,
            frame_max: 131072,
            heartbeat: 60,
        });
        assert_eq!(
            &buf[..],
            &[0, 10, 0, 30, 1, 0, 0, 2, 0, 0, 0, 60][..],
            "class 10 method 30, channel-max u16, frame-max u32, heartbeat u16"
        );
    }

    #[test]
    fn consecutive_bits_share_one_octet() {
        let buf = encoded(&Method::QueueDeclare {
            ticket: 0,
            queue: "q".into(),
            passive: false,
            durable: true,
            exclusive: false,
            auto_delete: true,
            no_wait: true,
            arguments: FieldTable::new(),
        });
        // class, method, ticket, "q", flags, empty table
        assert_eq!(buf.len(), 2 + 2 + 2 + 2 + 1 + 4);
        assert_eq!(buf[8], 0b11010);
        assert_eq!(Method::decode(&buf).unwrap(), {
            Method::QueueDeclare {
                ticket: 0,
                queue: "q".into(),
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: true,
                no_wait: true,
                arguments: FieldTable::new(),
            }
        });
    }

    #[test]
    fn unknown_method_is_not_implemented() {
        let err = Method::decode(&[0, 60, 0, 99]).unwrap_err();
        assert_eq!(
            err,
            FramingError::UnknownMethod {
                class_id: 60,
                method_id: 99
            }
        );
    }

    #[test]
    fn reserved_bits_are_rejected() {
        // basic.ack with tag 1 and bit 3 set
        let payload = [0, 60, 0, 80, 0, 0, 0, 0, 0, 0, 0, 1, 0b1000];
        assert!(matches!(
            Method::decode(&payload),
            Err(FramingError::Malformed { .. })
        ));
    }

    #[test]
    fn trailing_argument_bytes_are_rejected() {
        let mut buf = encoded(&Method::TxSelect);
        buf.put_u8(0);
        assert_eq!(Method::decode(&buf), Err(FramingError::TrailingBytes(1)));
    }

    #[test]
    fn dtx_recover_ok_lists_xids() {
        let method = Method::DtxRecoverOk {
            xids: vec![
                Xid::new(1, &b"g1"[..], &b"b1"[..]),
                Xid::new(2, &b"g2"[..], &b""[..]),
            ],
        };
        let buf = encoded(&method);
        assert_eq!(Method::decode(&buf).unwrap(), method);
    }
}
