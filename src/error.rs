/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use thiserror::Error;

/// Why a segment did not make it into a [crate::SegmentStore].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// Overlap resolution left nothing to insert.
    #[error("bad segment: overlap resolution consumed it entirely (seq {seq:#010x}, end {end_seq:#010x})")]
    BadSegment { seq: u32, end_seq: u32 },
    #[error("queued bytes limit {limit} reached")]
    QueuedBytesLimit { limit: u32 },
    #[error("queued segments limit {limit} reached")]
    QueuedSegmentsLimit { limit: u32 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("payload truncated: header declares {declared} bytes, {captured} captured")]
    Truncated { declared: usize, captured: usize },
    #[error("ip payload length: {0}")]
    IpPayloadLength(String),
    #[error("unsupported ip version {0}")]
    UnsupportedIpVersion(u8),
    #[error("ip protocol {0} is not tcp")]
    NotTcp(u8),
    #[error("header: {0}")]
    Header(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown stream policy '{0}'")]
    UnknownPolicy(String),
    #[error("prefix length {prefix_len} exceeds {max}")]
    BadPrefix { prefix_len: u8, max: u8 },
}
