//! Tunnel wire format
//!
//! V2 header: `u16 sender (BE) | u16 receiver (BE) | payload`
//! V3 header: `u32 sender (LE) | u32 receiver (LE) | payload`
//!
//! Both versions share the ping sub-protocol (`0 -> 0`, 50 byte datagram,
//! 12 byte echo). V3 adds a command sub-packet addressed `0 -> 0xFFFFFFFF`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Total datagram length of a ping request
pub const PING_REQUEST_SIZE: usize = 50;
/// Number of leading request bytes echoed back to the pinger
pub const PING_RESPONSE_SIZE: usize = 12;

pub const V2_ID_SIZE: usize = 2;
pub const V3_ID_SIZE: usize = 4;

/// Receiver id addressing the V3 command channel
pub const COMMAND_RECEIVER_ID: u32 = u32::MAX;
pub const COMMAND_CODE_SIZE: usize = 1;
pub const COMMAND_DIGEST_SIZE: usize = 20;
/// Minimum datagram length of a V3 command
pub const COMMAND_PACKET_SIZE: usize = V3_ID_SIZE * 2 + COMMAND_CODE_SIZE + COMMAND_DIGEST_SIZE;

/// Sender and receiver ids carried in every tunnel datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sender_id: u32,
    pub receiver_id: u32,
}

impl PacketHeader {
    /// Both ids zero: ping request
    pub fn is_ping(&self) -> bool {
        self.sender_id == 0 && self.receiver_id == 0
    }

    /// A client addressing itself. Id 0 is exempt since `0 -> 0` is a ping.
    pub fn is_self_addressed(&self) -> bool {
        self.sender_id == self.receiver_id && self.sender_id != 0
    }
}

/// Decode a V2 header. Returns `None` for datagrams shorter than 4 bytes.
pub fn decode_v2(datagram: &[u8]) -> Option<PacketHeader> {
    let sender = datagram.get(0..V2_ID_SIZE)?;
    let receiver = datagram.get(V2_ID_SIZE..V2_ID_SIZE * 2)?;

    Some(PacketHeader {
        sender_id: u16::from_be_bytes([sender[0], sender[1]]) as u32,
        receiver_id: u16::from_be_bytes([receiver[0], receiver[1]]) as u32,
    })
}

/// Decode a V3 header. Returns `None` for datagrams shorter than 8 bytes.
pub fn decode_v3(datagram: &[u8]) -> Option<PacketHeader> {
    let sender: [u8; V3_ID_SIZE] = datagram.get(0..V3_ID_SIZE)?.try_into().ok()?;
    let receiver: [u8; V3_ID_SIZE] = datagram.get(V3_ID_SIZE..V3_ID_SIZE * 2)?.try_into().ok()?;

    Some(PacketHeader {
        sender_id: u32::from_le_bytes(sender),
        receiver_id: u32::from_le_bytes(receiver),
    })
}

/// V3 command sub-packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPacket {
    pub code: u8,
    pub digest: [u8; COMMAND_DIGEST_SIZE],
}

impl CommandPacket {
    /// Parse the command body of a datagram already known to be addressed
    /// `0 -> COMMAND_RECEIVER_ID`. Trailing bytes are ignored.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < COMMAND_PACKET_SIZE {
            return None;
        }

        let code_at = V3_ID_SIZE * 2;
        let digest_at = code_at + COMMAND_CODE_SIZE;
        let digest = datagram[digest_at..digest_at + COMMAND_DIGEST_SIZE].try_into().ok()?;

        Some(Self {
            code: datagram[code_at],
            digest,
        })
    }
}

/// Tunnel commands carried on the V3 command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelCommand {
    /// Toggle maintenance mode
    MaintenanceMode,
}

impl TryFrom<u8> for TunnelCommand {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::MaintenanceMode),
            other => Err(other),
        }
    }
}

/// Source endpoints that can never belong to a remote client.
///
/// IPv4-mapped IPv6 sources are checked as their IPv4 form.
pub fn is_valid_endpoint(endpoint: SocketAddr) -> bool {
    if endpoint.port() == 0 {
        return false;
    }

    match endpoint.ip().to_canonical() {
        IpAddr::V4(ip) => {
            ip != Ipv4Addr::LOCALHOST && ip != Ipv4Addr::UNSPECIFIED && ip != Ipv4Addr::BROADCAST
        }
        IpAddr::V6(ip) => ip != Ipv6Addr::LOCALHOST && ip != Ipv6Addr::UNSPECIFIED,
    }
}

/// Endpoint identity, ignoring the IPv4-mapped IPv6 spelling of an address
pub fn same_endpoint(a: SocketAddr, b: SocketAddr) -> bool {
    a.port() == b.port() && a.ip().to_canonical() == b.ip().to_canonical()
}
