/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */

//! TCP stream tracking and reassembly core of an IDS/IPS.
//!
//! Per-connection state machine, target-OS aware overlap resolution, inline normalization
//! and delivery of reassembled bytes to a [StreamObserver]. Start with [StreamTcp].

/// Modulo 2^32 sequence arithmetic.
pub mod seq;

mod config;
mod data_block;
mod error;
mod events;
mod fsm;
mod normalizer;
mod overlap;
mod packet;
mod segment;
mod segment_store;
mod session;
mod stats;
mod stream_tcp;
mod tcp_connection;
mod trace_macro;
mod tracker;

pub use config::*;
pub use data_block::TcpDataBlock;
pub use error::*;
pub use events::*;
pub use fsm::SLAM_MAX;
pub use normalizer::{BlockCategory, Normalizer, RepeatedSyn, RstRule, PAWS_24DAYS};
pub use overlap::{FullOverlap, LeftOverlap, ReassemblyPolicy, RightOverlap};
pub use packet::*;
pub use segment::TcpSegment;
pub use segment_store::{QueueLimits, SegmentStore};
pub use session::{SessionFlags, SessionState, StreamContext, StreamState, TcpSession, MAX_WINDOW_SCALE};
pub use stats::*;
pub use stream_tcp::{Flow, StreamTcp};
pub use tcp_connection::TcpConnection;
pub use tracker::*;
