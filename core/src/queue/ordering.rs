use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

use crate::message::ServerMessage;

/// Default header for last-value queues declared without a key.
pub const DEFAULT_LVQ_KEY: &str = "qpid.LVQ_key";
pub const MAX_PRIORITY_LEVELS: u8 = 10;

/// How entries are ordered inside a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OrderingPolicy {
    #[default]
    Fifo,
    /// Higher bands first, FIFO within a band.
    Priority { levels: u8 },
    /// Ascending by a message header, FIFO among equal values.
    Sorted { key: String },
    /// FIFO, but a new message replaces any available one with the same key.
    LastValue { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Rank {
    Arrival,
    Band(Reverse<u8>),
    SortKey(String),
}

/// Position of an entry: rank first, then arrival sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct EntryKey {
    rank: Rank,
    seq: u64,
}

impl OrderingPolicy {
    pub(crate) fn key_for(&self, message: &ServerMessage, seq: u64) -> EntryKey {
        let rank = match self {
            Self::Fifo | Self::LastValue { .. } => Rank::Arrival,
            Self::Priority { levels } => Rank::Band(Reverse(priority_band(
                message.metadata().priority(),
                *levels,
            ))),
            // a message without the header sorts as the empty string
            Self::Sorted { key } => Rank::SortKey(
                message
                    .metadata()
                    .header(key)
                    .and_then(|v| v.as_text())
                    .unwrap_or_default(),
            ),
        };
        EntryKey { rank, seq }
    }

    pub(crate) fn last_value_key(&self, message: &ServerMessage) -> Option<String> {
        match self {
            Self::LastValue { key } => message.metadata().header(key).and_then(|v| v.as_text()),
            _ => None,
        }
    }
}

/// Maps a 0-9 message priority onto `levels` bands.
pub fn priority_band(priority: u8, levels: u8) -> u8 {
    if levels <= 1 {
        return 0;
    }
    let scaled = (u16::from(priority.min(9)) * u16::from(levels)) / 10;
    (scaled as u8).min(levels - 1)
}
