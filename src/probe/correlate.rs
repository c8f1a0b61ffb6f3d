//! ICMP error parsing and probe-token recovery.
//!
//! The capture socket hands us whole IPv4 datagrams. For Time Exceeded and
//! Destination Unreachable we dig the quoted original IPv4/TCP headers out of
//! the ICMP payload and rebuild the [`ProbeToken`] the sender registered.

use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

use crate::state::{FlowKey, ProbeToken, ReplyKind};

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_TCP: u8 = 6;

const ICMP_HEADER_LEN: usize = 8;
const MIN_IPV4_HEADER_LEN: usize = 20;
/// RFC 792 guarantees 8 bytes of the original payload: enough for TCP ports
const MIN_QUOTED_L4_LEN: usize = 8;

/// Why a captured packet could not be correlated
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("not an IPv4 packet (version {0})")]
    NotIpv4(u8),
    #[error("bad IPv4 header length {0}")]
    BadHeaderLength(usize),
    #[error("outer protocol {0} is not ICMP")]
    NotIcmp(u8),
    #[error("ICMP type {0} is not an error we track")]
    Ignored(u8),
    #[error("quoted datagram carries protocol {0}, not TCP")]
    NotTcp(u8),
}

/// ICMP error matched back to the probe that caused it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub responder: IpAddr,
    pub kind: ReplyKind,
    pub token: ProbeToken,
    /// TTL left in the quoted header (0 or 1 for a well-behaved router)
    pub quoted_ttl: u8,
}

fn need(data: &[u8], len: usize) -> Result<(), PacketError> {
    if data.len() < len {
        return Err(PacketError::Truncated {
            need: len,
            have: data.len(),
        });
    }
    Ok(())
}

/// Parse an IPv4 header and return it together with its length in bytes
fn ipv4_header(data: &[u8]) -> Result<(Ipv4Packet<'_>, usize), PacketError> {
    need(data, MIN_IPV4_HEADER_LEN)?;
    let packet = Ipv4Packet::new(data).ok_or(PacketError::Truncated {
        need: MIN_IPV4_HEADER_LEN,
        have: data.len(),
    })?;

    let version = packet.get_version();
    if version != 4 {
        return Err(PacketError::NotIpv4(version));
    }

    let ihl = (packet.get_header_length() as usize) * 4;
    if ihl < MIN_IPV4_HEADER_LEN {
        return Err(PacketError::BadHeaderLength(ihl));
    }
    need(data, ihl)?;
    Ok((packet, ihl))
}

/// Parse a raw IPv4 datagram received on the capture socket
///
/// `responder` is the source address reported by the socket.
pub fn parse_icmp_reply(data: &[u8], responder: IpAddr) -> Result<ParsedReply, PacketError> {
    let (outer, ihl) = ipv4_header(data)?;

    let protocol = outer.get_next_level_protocol().0;
    if protocol != IPPROTO_ICMP {
        return Err(PacketError::NotIcmp(protocol));
    }

    let icmp_data = &data[ihl..];
    need(icmp_data, ICMP_HEADER_LEN)?;
    let icmp = IcmpPacket::new(icmp_data).ok_or(PacketError::Truncated {
        need: ICMP_HEADER_LEN,
        have: icmp_data.len(),
    })?;

    let kind = match icmp.get_icmp_type() {
        IcmpTypes::TimeExceeded => ReplyKind::TimeExceeded,
        IcmpTypes::DestinationUnreachable => ReplyKind::Unreachable(icmp.get_icmp_code().0),
        other => return Err(PacketError::Ignored(other.0)),
    };

    let (token, quoted_ttl) = parse_quoted_tcp(&icmp_data[ICMP_HEADER_LEN..])?;
    Ok(ParsedReply {
        responder,
        kind,
        token,
        quoted_ttl,
    })
}

/// Recover the probe token from the original datagram quoted in an ICMP error
///
/// Layout: original IPv4 header (IHL * 4 bytes), then at least 8 bytes of the
/// original TCP header (source port, destination port, sequence number).
fn parse_quoted_tcp(quoted: &[u8]) -> Result<(ProbeToken, u8), PacketError> {
    let (original, ihl) = ipv4_header(quoted)?;

    let protocol = original.get_next_level_protocol().0;
    if protocol != IPPROTO_TCP {
        return Err(PacketError::NotTcp(protocol));
    }
    need(quoted, ihl + MIN_QUOTED_L4_LEN)?;

    let tcp = &quoted[ihl..];
    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);

    let flow = FlowKey {
        src: SocketAddr::new(IpAddr::V4(original.get_source()), src_port),
        dst: SocketAddr::new(IpAddr::V4(original.get_destination()), dst_port),
    };
    Ok((
        ProbeToken::new(flow, original.get_total_length()),
        original.get_ttl(),
    ))
}
