//! Packet source boundary and TCP segment dissection
//!
//! A [`PacketSource`] yields timestamped link-layer frames; where those
//! frames come from (a capture file, a live interface) is a collaborator's
//! concern. Dissection extracts the TCP segment the reassembler consumes:
//! flow identity, sequence number, teardown flags, and payload.

use crate::error::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::Packet;
use std::net::{IpAddr, SocketAddr};

/// Link-layer framing of a packet source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet II frames
    Ethernet,
    /// Raw IP packets with no link-layer header
    RawIp,
}

/// One captured link-layer frame with its capture timestamp
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub timestamp: DateTime<Utc>,
    pub data: Bytes,
}

/// Source of captured packets
///
/// Implemented in-crate for pcap capture files; live-interface capture
/// plugs in through the same trait.
pub trait PacketSource: Send {
    fn link_type(&self) -> LinkType;

    /// Next packet, or `None` at end of capture
    fn next_packet(&mut self) -> Result<Option<CapturedPacket>>;
}

/// Directed flow identity of a TCP segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowKey {
    /// Direction-independent key shared by both halves of a connection
    pub fn bidi_key(&self) -> (SocketAddr, SocketAddr) {
        if self.src <= self.dst {
            (self.src, self.dst)
        } else {
            (self.dst, self.src)
        }
    }

    /// Index of this direction within its bidi pair (0 or 1)
    pub fn direction(&self) -> usize {
        usize::from(self.src > self.dst)
    }
}

/// A dissected TCP segment
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub timestamp: DateTime<Utc>,
    pub flow: FlowKey,
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Bytes,
}

/// Dissect a captured frame into a TCP segment
///
/// Returns `None` for anything that is not TCP over IPv4/IPv6; the capture
/// pipeline silently skips such packets.
pub fn dissect(link: LinkType, packet: &CapturedPacket) -> Option<TcpSegment> {
    let ip_bytes: &[u8] = match link {
        LinkType::Ethernet => {
            let eth = EthernetPacket::new(&packet.data)?;
            match eth.get_ethertype() {
                EtherTypes::Ipv4 | EtherTypes::Ipv6 => {
                    &packet.data[EthernetPacket::minimum_packet_size()..]
                }
                _ => return None,
            }
        }
        LinkType::RawIp => &packet.data,
    };

    let (src_ip, dst_ip, tcp_bytes) = dissect_ip(ip_bytes)?;
    let tcp = TcpPacket::new(tcp_bytes)?;
    let data_offset = tcp.get_data_offset() as usize * 4;
    if data_offset < 20 || data_offset > tcp_bytes.len() {
        return None;
    }
    let payload = &tcp_bytes[data_offset..];
    let flags = tcp.get_flags();
    let fin = flags & 0x01 != 0;
    let syn = flags & 0x02 != 0;
    let rst = flags & 0x04 != 0;

    Some(TcpSegment {
        timestamp: packet.timestamp,
        flow: FlowKey {
            src: SocketAddr::new(src_ip, tcp.get_source()),
            dst: SocketAddr::new(dst_ip, tcp.get_destination()),
        },
        seq: tcp.get_sequence(),
        syn,
        fin,
        rst,
        payload: Bytes::copy_from_slice(payload),
    })
}

/// Slice the TCP bytes out of an IP packet using the IP header's own length
/// fields, so link-layer trailer padding never leaks into the byte stream
fn dissect_ip(ip_bytes: &[u8]) -> Option<(IpAddr, IpAddr, &[u8])> {
    let version = ip_bytes.first()? >> 4;
    match version {
        4 => {
            let ipv4 = Ipv4Packet::new(ip_bytes)?;
            if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
                return None;
            }
            let header_len = ipv4.get_header_length() as usize * 4;
            let total_len = (ipv4.get_total_length() as usize).min(ip_bytes.len());
            if header_len < 20 || header_len > total_len {
                return None;
            }
            Some((
                IpAddr::V4(ipv4.get_source()),
                IpAddr::V4(ipv4.get_destination()),
                &ip_bytes[header_len..total_len],
            ))
        }
        6 => {
            let ipv6 = Ipv6Packet::new(ip_bytes)?;
            // extension headers are not chased; TCP must follow directly
            if ipv6.get_next_header() != IpNextHeaderProtocols::Tcp {
                return None;
            }
            let payload_len = ipv6.get_payload_length() as usize;
            let end = (40 + payload_len).min(ip_bytes.len());
            if end <= 40 {
                return None;
            }
            Some((
                IpAddr::V6(ipv6.get_source()),
                IpAddr::V6(ipv6.get_destination()),
                &ip_bytes[40..end],
            ))
        }
        _ => None,
    }
}
