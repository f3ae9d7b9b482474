//! Builds Ethernet frames carrying a single TCP segment. Used to synthesize captures.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::SegmentFlags;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const PROTO_TCP: u8 = 6;
const TTL: u8 = 64;

const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;
const TCP_PSH: u8 = 0x08;
const TCP_ACK: u8 = 0x10;

/// Builder for an Ethernet + IP + TCP frame.
///
/// When the two addresses are of different families, the IPv4 one is mapped into IPv6.
#[derive(Debug, Clone)]
pub struct TcpFrame {
    source: SocketAddr,
    destination: SocketAddr,
    seq: u32,
    ack: u32,
    flags: SegmentFlags,
    payload: Bytes,
}

impl TcpFrame {
    pub fn new(source: SocketAddr, destination: SocketAddr, seq: u32) -> Self {
        Self { source, destination, seq, ack: 0, flags: SegmentFlags::default(), payload: Bytes::new() }
    }

    pub fn ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }

    pub fn flags(mut self, flags: SegmentFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Serializes the frame, computing the IP and TCP checksums.
    pub fn build(self) -> Bytes {
        let tcp = self.tcp_header();
        let mut frame = BytesMut::with_capacity(14 + 40 + tcp.len() + self.payload.len());

        // Locally administered, zero MACs
        frame.put_slice(&[0x02, 0, 0, 0, 0, 0x02]);
        frame.put_slice(&[0x02, 0, 0, 0, 0, 0x01]);

        let tcp_len = tcp.len() + self.payload.len();
        match (self.source.ip(), self.destination.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                frame.put_u16(ETHERTYPE_IPV4);

                let mut ip = [0u8; 20];
                ip[0] = 0x45;
                ip[2..4].copy_from_slice(&((20 + tcp_len) as u16).to_be_bytes());
                // Don't fragment
                ip[6] = 0x40;
                ip[8] = TTL;
                ip[9] = PROTO_TCP;
                ip[12..16].copy_from_slice(&src.octets());
                ip[16..20].copy_from_slice(&dst.octets());
                let sum = checksum(&[&ip]);
                ip[10..12].copy_from_slice(&sum.to_be_bytes());
                frame.put_slice(&ip);

                let pseudo = pseudo_header(&src.octets(), &dst.octets(), tcp_len);
                self.put_tcp(&mut frame, tcp, &pseudo);
            }
            (src, dst) => {
                let (src, dst) = (to_v6(src), to_v6(dst));
                frame.put_u16(ETHERTYPE_IPV6);

                frame.put_u32(0x6000_0000);
                frame.put_u16(tcp_len as u16);
                frame.put_u8(PROTO_TCP);
                frame.put_u8(TTL);
                frame.put_slice(&src.octets());
                frame.put_slice(&dst.octets());

                let pseudo = pseudo_header(&src.octets(), &dst.octets(), tcp_len);
                self.put_tcp(&mut frame, tcp, &pseudo);
            }
        }

        frame.freeze()
    }

    fn tcp_header(&self) -> [u8; 20] {
        let mut flags = 0;
        if self.flags.syn {
            flags |= TCP_SYN;
        }
        if self.flags.fin {
            flags |= TCP_FIN;
        }
        if self.flags.rst {
            flags |= TCP_RST;
        }
        if self.ack != 0 {
            flags |= TCP_ACK;
        }
        if !self.payload.is_empty() {
            flags |= TCP_PSH;
        }

        let mut tcp = [0u8; 20];
        tcp[0..2].copy_from_slice(&self.source.port().to_be_bytes());
        tcp[2..4].copy_from_slice(&self.destination.port().to_be_bytes());
        tcp[4..8].copy_from_slice(&self.seq.to_be_bytes());
        tcp[8..12].copy_from_slice(&self.ack.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = flags;
        tcp[14..16].copy_from_slice(&u16::MAX.to_be_bytes());
        tcp
    }

    fn put_tcp(&self, frame: &mut BytesMut, mut tcp: [u8; 20], pseudo: &[u8]) {
        let sum = checksum(&[pseudo, &tcp, &self.payload]);
        tcp[16..18].copy_from_slice(&sum.to_be_bytes());
        frame.put_slice(&tcp);
        frame.put_slice(&self.payload);
    }
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn pseudo_header(src: &[u8], dst: &[u8], tcp_len: usize) -> Vec<u8> {
    let mut pseudo = Vec::with_capacity(src.len() * 2 + 8);
    pseudo.extend_from_slice(src);
    pseudo.extend_from_slice(dst);
    if src.len() == 4 {
        pseudo.extend_from_slice(&[0, PROTO_TCP]);
        pseudo.extend_from_slice(&(tcp_len as u16).to_be_bytes());
    } else {
        pseudo.extend_from_slice(&(tcp_len as u32).to_be_bytes());
        pseudo.extend_from_slice(&[0, 0, 0, PROTO_TCP]);
    }
    pseudo
}

/// Internet checksum over the concatenation of `parts`.
fn checksum(parts: &[&[u8]]) -> u16 {
    let mut sum = 0u32;
    let mut odd: Option<u8> = None;

    for byte in parts.iter().flat_map(|p| p.iter().copied()) {
        match odd.take() {
            Some(hi) => sum += u32::from(u16::from_be_bytes([hi, byte])),
            None => odd = Some(byte),
        }
    }
    if let Some(hi) = odd {
        sum += u32::from(u16::from_be_bytes([hi, 0]));
    }

    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
