/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::ConfigError;

pub const DEFAULT_SESSION_TIMEOUT: u32 = 30;
pub const DEFAULT_MAX_QUEUED_BYTES: u32 = 1_048_576;
pub const DEFAULT_MAX_QUEUED_SEGS: u32 = 2621;

/// Target operating system whose TCP stack decides how ambiguous traffic is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum StreamPolicy {
    First,
    Last,
    Linux,
    OldLinux,
    #[default]
    Bsd,
    MacOs,
    Solaris,
    Irix,
    Hpux11,
    Hpux10,
    Windows,
    Win2003,
    Vista,
    Proxy,
}

impl StreamPolicy {
    pub const ALL: [StreamPolicy; 14] = [
        StreamPolicy::First,
        StreamPolicy::Last,
        StreamPolicy::Linux,
        StreamPolicy::OldLinux,
        StreamPolicy::Bsd,
        StreamPolicy::MacOs,
        StreamPolicy::Solaris,
        StreamPolicy::Irix,
        StreamPolicy::Hpux11,
        StreamPolicy::Hpux10,
        StreamPolicy::Windows,
        StreamPolicy::Win2003,
        StreamPolicy::Vista,
        StreamPolicy::Proxy,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StreamPolicy::First => "first",
            StreamPolicy::Last => "last",
            StreamPolicy::Linux => "linux",
            StreamPolicy::OldLinux => "old-linux",
            StreamPolicy::Bsd => "bsd",
            StreamPolicy::MacOs => "macos",
            StreamPolicy::Solaris => "solaris",
            StreamPolicy::Irix => "irix",
            StreamPolicy::Hpux11 => "hpux11",
            StreamPolicy::Hpux10 => "hpux10",
            StreamPolicy::Windows => "windows",
            StreamPolicy::Win2003 => "win-2003",
            StreamPolicy::Vista => "vista",
            StreamPolicy::Proxy => "proxy",
        }
    }

    pub fn is_windows_family(self) -> bool {
        matches!(self, StreamPolicy::Windows | StreamPolicy::Win2003 | StreamPolicy::Vista)
    }
}

impl fmt::Display for StreamPolicy {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.name())
    }
}

impl FromStr for StreamPolicy {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        StreamPolicy::ALL
            .iter()
            .copied()
            .find(|policy| policy.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| ConfigError::UnknownPolicy(name.to_string()))
    }
}

/// Normalization mode of one category. `Off` only counts what would have been done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NormMode {
    #[default]
    Off,
    On,
}

impl NormMode {
    pub fn is_on(self) -> bool {
        self == NormMode::On
    }

    pub(crate) fn index(self) -> usize {
        match self {
            NormMode::Off => 0,
            NormMode::On => 1,
        }
    }
}

/// Inline normalization switch per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct NormalizationConfig {
    /// Rewrite overlapped payload with the bytes the target host keeps.
    pub ips: NormMode,
    pub trim_syn: NormMode,
    pub trim_rst: NormMode,
    pub trim_win: NormMode,
    pub trim_mss: NormMode,
    pub strip_ecn: NormMode,
    /// Block packets the tracker rejects.
    pub tcp_block: NormMode,
    /// Block or strip on timestamp option violations.
    pub opt_block: NormMode,
}

impl NormalizationConfig {
    /// Every category on.
    pub fn inline() -> Self {
        Self {
            ips: NormMode::On,
            trim_syn: NormMode::On,
            trim_rst: NormMode::On,
            trim_win: NormMode::On,
            trim_mss: NormMode::On,
            strip_ecn: NormMode::On,
            tcp_block: NormMode::On,
            opt_block: NormMode::On,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HostPolicy {
    pub network: IpAddr,
    pub prefix_len: u8,
    pub policy: StreamPolicy,
}

impl HostPolicy {
    /// An entry with a prefix longer than its address never matches.
    fn matches(&self, address: &IpAddr) -> bool {
        let prefix_len = self.prefix_len as u32;
        match (self.network, address) {
            (IpAddr::V4(network), IpAddr::V4(address)) => {
                let Some(shift) = 32u32.checked_sub(prefix_len) else {
                    return false;
                };
                let mask = u32::MAX.checked_shl(shift).unwrap_or(0);
                u32::from(network) & mask == u32::from(*address) & mask
            }
            (IpAddr::V6(network), IpAddr::V6(address)) => {
                let Some(shift) = 128u32.checked_sub(prefix_len) else {
                    return false;
                };
                let mask = u128::MAX.checked_shl(shift).unwrap_or(0);
                u128::from(network) & mask == u128::from(*address) & mask
            }
            _ => false,
        }
    }
}

/// Target policy per network, longest prefix wins.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HostPolicyTable {
    entries: Vec<HostPolicy>,
}

impl HostPolicyTable {
    pub fn insert(&mut self, network: IpAddr, prefix_len: u8, policy: StreamPolicy) -> Result<(), ConfigError> {
        let max = if network.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return Err(ConfigError::BadPrefix { prefix_len, max });
        }
        self.entries.retain(|entry| !(entry.network == network && entry.prefix_len == prefix_len));
        self.entries.push(HostPolicy {
            network,
            prefix_len,
            policy,
        });
        Ok(())
    }

    pub fn lookup(&self, address: &IpAddr) -> Option<StreamPolicy> {
        self.entries
            .iter()
            .filter(|entry| entry.matches(address))
            .max_by_key(|entry| entry.prefix_len)
            .map(|entry| entry.policy)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Configuration of TCP stream tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StreamTcpConfig {
    /// Policy for hosts missing in `host_policies`.
    pub policy: StreamPolicy,
    pub host_policies: HostPolicyTable,
    /// Idle seconds before a session expires.
    pub session_timeout: u32,
    /// Some: three-way handshake required, midstream pickup only within this many seconds
    /// of the first packet. None: midstream pickup always allowed.
    pub require_3whs: Option<u32>,
    /// Largest acceptable advertised (scaled) window, 0 means unlimited.
    pub max_window: u32,
    /// Overlaps per tracker before an excessive-overlap event, 0 means unlimited.
    pub overlap_limit: u32,
    pub max_queued_bytes: u32,
    pub max_queued_segs: u32,
    /// Streak of small segments that raises an event, 0 disables.
    pub max_consec_small_segs: u32,
    /// Payload size below which a segment counts as small.
    pub max_consec_small_seg_size: u32,
    pub normalization: NormalizationConfig,
    /// Connection ids to trace through `log::debug!`. `0` traces everything.
    pub trace_connections: Vec<u32>,
}

impl Default for StreamTcpConfig {
    fn default() -> Self {
        Self {
            policy: StreamPolicy::default(),
            host_policies: HostPolicyTable::default(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            require_3whs: None,
            max_window: 0,
            overlap_limit: 0,
            max_queued_bytes: DEFAULT_MAX_QUEUED_BYTES,
            max_queued_segs: DEFAULT_MAX_QUEUED_SEGS,
            max_consec_small_segs: 0,
            max_consec_small_seg_size: 0,
            normalization: NormalizationConfig::default(),
            trace_connections: Vec::new(),
        }
    }
}

impl StreamTcpConfig {
    pub fn require_3whs(&self) -> bool {
        self.require_3whs.is_some()
    }

    /// Midstream pickup is allowed while the handshake grace has not run out.
    pub fn midstream_allowed(&self, first_packet_time: u32, now: u32) -> bool {
        match self.require_3whs {
            None => true,
            Some(grace) => now.saturating_sub(first_packet_time) < grace,
        }
    }

    pub fn policy_for(&self, address: &IpAddr) -> StreamPolicy {
        self.host_policies.lookup(address).unwrap_or(self.policy)
    }
}
