/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::packet::Direction;

/// TCP session key: two IPs + two ports, oriented client -> server.
/// Both directions of a session share one key; the packet direction is derived from it.
/// Assumption, that IP Addresses are unique per VLAN, so VLAN is excluded from the tuple.
#[derive(Hash, Eq, PartialEq, PartialOrd, Ord, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TcpConnection {
    pub client_address: IpAddr,
    pub client_port: u16,

    pub server_address: IpAddr,
    pub server_port: u16,
}

impl Default for TcpConnection {
    fn default() -> Self {
        Self {
            client_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            client_port: 0,
            server_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            server_port: 0,
        }
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ip = if self.client_address.is_ipv6() { "ipv6" } else { "ip" };
        write!(
            formatter,
            "({ip}.addr == {} && {ip}.addr == {} && tcp.port == {} && tcp.port == {})",
            self.client_address, self.server_address, self.client_port, self.server_port,
        )
    }
}

impl TcpConnection {
    pub fn new(client_address: IpAddr, client_port: u16, server_address: IpAddr, server_port: u16) -> Self {
        Self {
            client_address,
            client_port,
            server_address,
            server_port,
        }
    }

    /// Same session seen with client and server roles swapped.
    pub fn get_reverse_connection(&self) -> Self {
        TcpConnection {
            client_address: self.server_address,
            client_port: self.server_port,

            server_address: self.client_address,
            server_port: self.client_port,
        }
    }

    /// Direction of a packet with the given source endpoint, `None` if the packet does not belong here.
    pub fn direction_of(&self, source_address: IpAddr, source_port: u16, destination_address: IpAddr, destination_port: u16) -> Option<Direction> {
        if source_address == self.client_address
            && source_port == self.client_port
            && destination_address == self.server_address
            && destination_port == self.server_port
        {
            Some(Direction::FromClient)
        } else if source_address == self.server_address
            && source_port == self.server_port
            && destination_address == self.client_address
            && destination_port == self.client_port
        {
            Some(Direction::FromServer)
        } else {
            None
        }
    }
}
