use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use bytes::{BufMut, Bytes, BytesMut};
use pnet::packet::{
    ethernet::{EtherTypes, EthernetPacket},
    ip::{IpNextHeaderProtocol, IpNextHeaderProtocols},
    ipv4::Ipv4Packet,
    ipv6::Ipv6Packet,
    tcp::{TcpFlags, TcpPacket},
    Packet as _,
};

/// Size of an 802.1Q VLAN tag.
const VLAN_TAG_LEN: usize = 4;
/// Size of the BSD loopback (null) header.
const NULL_HEADER_LEN: usize = 4;
/// Size of the Linux cooked capture (SLL) header.
const SLL_HEADER_LEN: usize = 16;

/// The link-layer framing of captured data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Raw IPv4 or IPv6, no link header.
    Raw,
    /// BSD loopback encapsulation (4 byte address family header).
    Null,
    /// Linux cooked capture.
    LinuxSll,
    Unsupported(u32),
}

impl LinkType {
    /// Maps a pcap `LINKTYPE_*` / `DLT_*` value.
    pub fn from_dlt(dlt: u32) -> Self {
        match dlt {
            0 | 108 => Self::Null,
            1 => Self::Ethernet,
            // 12 and 14 are DLT_RAW on some BSDs, also used by tunnel interfaces
            12 | 14 | 101 | 228 | 229 => Self::Raw,
            113 => Self::LinuxSll,
            other => Self::Unsupported(other),
        }
    }
}

/// Network-layer identity of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkLayer {
    pub source: IpAddr,
    pub destination: IpAddr,
}

/// The TCP flags the reassembly cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

/// Transport-layer identity and payload of a TCP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub source_port: u16,
    pub destination_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in 32-bit words (the TCP data offset).
    pub header_len: u8,
    pub flags: SegmentFlags,
    pub payload: Bytes,
}

impl TcpSegment {
    /// A data segment without flags.
    pub fn new(source_port: u16, destination_port: u16, seq: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            source_port,
            destination_port,
            seq,
            ack: 0,
            header_len: 5,
            flags: SegmentFlags::default(),
            payload: payload.into(),
        }
    }

    pub fn with_flags(mut self, flags: SegmentFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }
}

/// A captured frame. Immutable once captured.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Capture timestamp, in UNIX nanoseconds.
    timestamp_nanos: u64,
    /// The full captured frame.
    data: Bytes,
    network: Option<NetworkLayer>,
    transport: Option<TcpSegment>,
}

impl Packet {
    /// Creates a packet from already decoded layers.
    pub fn new(
        timestamp_nanos: u64,
        data: impl Into<Bytes>,
        network: Option<NetworkLayer>,
        transport: Option<TcpSegment>,
    ) -> Self {
        Self { timestamp_nanos, data: data.into(), network, transport }
    }

    /// Decodes a captured frame. Layers that cannot be decoded are left empty; decoding never
    /// fails outright.
    pub fn decode(link: LinkType, data: impl Into<Bytes>, timestamp_nanos: u64) -> Self {
        let data = data.into();
        let (network, transport) = match ip_payload(link, &data) {
            Some(ip) => decode_ip(&data, ip),
            None => (None, None),
        };

        Self { timestamp_nanos, data, network, transport }
    }

    #[inline]
    pub fn timestamp_nanos(&self) -> u64 {
        self.timestamp_nanos
    }

    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn network(&self) -> Option<&NetworkLayer> {
        self.network.as_ref()
    }

    #[inline]
    pub fn transport(&self) -> Option<&TcpSegment> {
        self.transport.as_ref()
    }

    /// Returns the (source, destination) socket addresses of a TCP packet.
    pub fn endpoints(&self) -> Option<(SocketAddr, SocketAddr)> {
        let net = self.network?;
        let tcp = self.transport.as_ref()?;
        Some((
            SocketAddr::new(net.source, tcp.source_port),
            SocketAddr::new(net.destination, tcp.destination_port),
        ))
    }

    /// Identifies a segment: source ip, source port, destination ip, destination port, seq.
    pub fn id(&self) -> Option<Bytes> {
        let net = self.network?;
        let tcp = self.transport.as_ref()?;

        let mut id = BytesMut::with_capacity(44);
        put_ip(&mut id, net.source);
        id.put_u16(tcp.source_port);
        put_ip(&mut id, net.destination);
        id.put_u16(tcp.destination_port);
        id.put_u32(tcp.seq);

        Some(id.freeze())
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.endpoints(), self.network) {
            (Some((src, dst)), _) => write!(f, "tcp {src} -> {dst} ({} bytes)", self.data.len()),
            (None, Some(net)) => {
                write!(f, "ip {} -> {} ({} bytes)", net.source, net.destination, self.data.len())
            }
            (None, None) => write!(f, "unknown frame ({} bytes)", self.data.len()),
        }
    }
}

fn put_ip(dst: &mut BytesMut, ip: IpAddr) {
    match ip {
        IpAddr::V4(v4) => dst.put_slice(&v4.octets()),
        IpAddr::V6(v6) => dst.put_slice(&v6.octets()),
    }
}

/// Strips the link-layer header, returning the IP datagram.
fn ip_payload(link: LinkType, data: &[u8]) -> Option<&[u8]> {
    match link {
        LinkType::Ethernet => {
            let eth = EthernetPacket::new(data)?;
            let offset = EthernetPacket::minimum_packet_size();
            match eth.get_ethertype() {
                EtherTypes::Ipv4 | EtherTypes::Ipv6 => data.get(offset..),
                EtherTypes::Vlan => data.get(offset + VLAN_TAG_LEN..),
                _ => None,
            }
        }
        LinkType::Raw => Some(data),
        LinkType::Null => data.get(NULL_HEADER_LEN..),
        LinkType::LinuxSll => data.get(SLL_HEADER_LEN..),
        LinkType::Unsupported(_) => None,
    }
}

/// Decodes the network and transport layers. `frame` is the whole frame, `ip` a subslice of it.
fn decode_ip(frame: &Bytes, ip: &[u8]) -> (Option<NetworkLayer>, Option<TcpSegment>) {
    match ip.first().map(|b| b >> 4) {
        Some(4) => {
            let Some(v4) = Ipv4Packet::new(ip) else {
                return (None, None);
            };
            let network = NetworkLayer {
                source: IpAddr::V4(v4.get_source()),
                destination: IpAddr::V4(v4.get_destination()),
            };
            // Only first fragments carry the TCP header
            if v4.get_fragment_offset() != 0 {
                return (Some(network), None);
            }
            (Some(network), decode_tcp(frame, v4.get_next_level_protocol(), v4.payload()))
        }
        Some(6) => {
            let Some(v6) = Ipv6Packet::new(ip) else {
                return (None, None);
            };
            let network = NetworkLayer {
                source: IpAddr::V6(v6.get_source()),
                destination: IpAddr::V6(v6.get_destination()),
            };
            (Some(network), decode_tcp(frame, v6.get_next_header(), v6.payload()))
        }
        _ => (None, None),
    }
}

fn decode_tcp(frame: &Bytes, protocol: IpNextHeaderProtocol, data: &[u8]) -> Option<TcpSegment> {
    if protocol != IpNextHeaderProtocols::Tcp {
        return None;
    }

    let tcp = TcpPacket::new(data)?;
    let header_len = tcp.get_data_offset();
    if usize::from(header_len) * 4 > data.len() {
        return None;
    }

    let flags = tcp.get_flags();
    let payload = tcp.payload();

    Some(TcpSegment {
        source_port: tcp.get_source(),
        destination_port: tcp.get_destination(),
        seq: tcp.get_sequence(),
        ack: tcp.get_acknowledgement(),
        header_len,
        flags: SegmentFlags {
            syn: flags & TcpFlags::SYN != 0,
            fin: flags & TcpFlags::FIN != 0,
            rst: flags & TcpFlags::RST != 0,
        },
        payload: if payload.is_empty() { Bytes::new() } else { frame.slice_ref(payload) },
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::frame::TcpFrame;

    fn addrs() -> (SocketAddr, SocketAddr) {
        ("10.0.0.1:51000".parse().unwrap(), "10.0.0.2:80".parse().unwrap())
    }

    #[test]
    fn decode_ethernet_ipv4_tcp() {
        let (src, dst) = addrs();
        let frame = TcpFrame::new(src, dst, 1000).ack(7).payload(&b"GET / HTTP/1.1\r\n\r\n"[..]).build();

        let packet = Packet::decode(LinkType::Ethernet, frame, 42);

        assert_eq!(packet.timestamp_nanos(), 42);
        assert_eq!(packet.endpoints(), Some((src, dst)));
        let tcp = packet.transport().unwrap();
        assert_eq!(tcp.seq, 1000);
        assert_eq!(tcp.ack, 7);
        assert_eq!(tcp.header_len, 5);
        assert_eq!(tcp.flags, SegmentFlags::default());
        assert_eq!(&tcp.payload[..], b"GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn decode_flags_and_ipv6() {
        let src: SocketAddr = "[::1]:4000".parse().unwrap();
        let dst: SocketAddr = "[::2]:80".parse().unwrap();
        let frame = TcpFrame::new(src, dst, 5)
            .flags(SegmentFlags { syn: true, fin: false, rst: false })
            .build();

        let packet = Packet::decode(LinkType::Ethernet, frame, 0);
        let tcp = packet.transport().unwrap();
        assert!(tcp.flags.syn);
        assert!(tcp.payload.is_empty());
        assert_eq!(packet.endpoints(), Some((src, dst)));
    }

    #[test]
    fn decode_raw_and_loopback() {
        let (src, dst) = addrs();
        let frame = TcpFrame::new(src, dst, 1).payload(&b"x"[..]).build();
        // Drop the 14 byte ethernet header
        let raw = frame.slice(14..);

        let packet = Packet::decode(LinkType::from_dlt(12), raw.clone(), 0);
        assert_eq!(packet.endpoints(), Some((src, dst)));

        let mut null = vec![2, 0, 0, 0];
        null.extend_from_slice(&raw);
        let packet = Packet::decode(LinkType::from_dlt(0), null, 0);
        assert_eq!(&packet.transport().unwrap().payload[..], b"x");
    }

    #[test]
    fn non_tcp_has_network_only() {
        let mut ip = vec![0x45, 0, 0, 28, 0, 0, 0, 0, 64, 17, 0, 0];
        ip.extend_from_slice(&Ipv4Addr::new(1, 1, 1, 1).octets());
        ip.extend_from_slice(&Ipv4Addr::new(2, 2, 2, 2).octets());
        ip.extend_from_slice(&[0; 8]);

        let packet = Packet::decode(LinkType::Raw, ip, 0);
        assert!(packet.network().is_some());
        assert!(packet.transport().is_none());
    }

    #[test]
    fn garbage_decodes_to_nothing() {
        let packet = Packet::decode(LinkType::Ethernet, vec![1, 2, 3], 0);
        assert!(packet.network().is_none());
        assert!(packet.transport().is_none());

        let packet = Packet::decode(LinkType::from_dlt(9999), vec![0; 64], 0);
        assert!(packet.network().is_none());
    }

    #[test]
    fn packet_id() {
        let (src, dst) = addrs();
        let packet = Packet::decode(LinkType::Ethernet, TcpFrame::new(src, dst, 0x01020304).build(), 0);
        let id = packet.id().unwrap();
        assert_eq!(id.len(), 4 + 2 + 4 + 2 + 4);
        assert_eq!(&id[id.len() - 4..], &[1, 2, 3, 4]);
    }
}
