//! Lazy L2/L3/L4 header classification and the flow match key.
//!
//! Parsing never fails the pipeline: a frame too short for the layer being
//! parsed simply leaves the corresponding key fields empty, and a frame too
//! short for Ethernet yields no key at all (the caller counts a drop).

use std::net::IpAddr;

use crate::PortId;
use crate::buffer::PacketBuffer;
use crate::hash::{HashType, fingerprint64};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

const ETH_HDR_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;

/// Match-relevant header fields of one packet.
///
/// Fields beyond the layers actually present in the frame stay `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlowKey {
    pub in_port: PortId,
    pub eth_dst: [u8; 6],
    pub eth_src: [u8; 6],
    pub eth_type: u16,
    pub vlan_vid: Option<u16>,
    pub vlan_pcp: Option<u8>,
    pub ip_src: Option<IpAddr>,
    pub ip_dst: Option<IpAddr>,
    pub ip_proto: Option<u8>,
    /// TCP/UDP source port, or ICMP type.
    pub tp_src: Option<u16>,
    /// TCP/UDP destination port, or ICMP code.
    pub tp_dst: Option<u16>,
}

impl FlowKey {
    /// Parse a frame as far as its layers reach. Returns `None` for frames
    /// shorter than an Ethernet header.
    pub fn parse(frame: &[u8], in_port: PortId) -> Option<FlowKey> {
        if frame.len() < ETH_HDR_LEN {
            return None;
        }
        let mut key = FlowKey {
            in_port,
            ..FlowKey::default()
        };
        key.eth_dst.copy_from_slice(&frame[0..6]);
        key.eth_src.copy_from_slice(&frame[6..12]);
        let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
        let mut l3 = ETH_HDR_LEN;

        if ethertype == ETHERTYPE_VLAN {
            if frame.len() < ETH_HDR_LEN + VLAN_TAG_LEN {
                key.eth_type = ethertype;
                return Some(key);
            }
            let tci = u16::from_be_bytes([frame[14], frame[15]]);
            key.vlan_vid = Some(tci & 0x0fff);
            key.vlan_pcp = Some((tci >> 13) as u8);
            ethertype = u16::from_be_bytes([frame[16], frame[17]]);
            l3 += VLAN_TAG_LEN;
        }
        key.eth_type = ethertype;

        match ethertype {
            ETHERTYPE_IPV4 => parse_ipv4(&frame[l3..], &mut key),
            ETHERTYPE_IPV6 => parse_ipv6(&frame[l3..], &mut key),
            _ => {}
        }
        Some(key)
    }

    /// Classify a buffered packet, filling the metadata offsets and caching
    /// the key. Subsequent calls reuse the cache.
    pub fn classify(buf: &mut PacketBuffer) -> Option<FlowKey> {
        if let Some(ref key) = buf.meta.flow_key {
            return Some(key.clone());
        }
        let in_port = buf.meta.in_port.unwrap_or(0);
        let key = FlowKey::parse(buf.frame(), in_port)?;
        let (l3, l4) = offsets(buf.frame());
        buf.meta.l3_offset = l3;
        buf.meta.l4_offset = l4;
        buf.meta.flow_key = Some(key.clone());
        Some(key)
    }

    /// Canonical byte encoding of the full key, the flow-cache fingerprint
    /// input. Stable across platforms and releases.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.in_port.to_be_bytes());
        out.extend_from_slice(&self.eth_dst);
        out.extend_from_slice(&self.eth_src);
        out.extend_from_slice(&self.eth_type.to_be_bytes());
        out.extend_from_slice(&self.vlan_vid.unwrap_or(0xffff).to_be_bytes());
        encode_ip(&mut out, self.ip_src);
        encode_ip(&mut out, self.ip_dst);
        out.push(self.ip_proto.unwrap_or(0xff));
        out.extend_from_slice(&self.tp_src.unwrap_or(0xffff).to_be_bytes());
        out.extend_from_slice(&self.tp_dst.unwrap_or(0xffff).to_be_bytes());
        out
    }

    /// Cache fingerprint under the configured hash family.
    pub fn fingerprint(&self, hashtype: HashType) -> u64 {
        fingerprint64(&self.canonical_bytes(), hashtype)
    }

    /// Dispatch hash over the 5-tuple (or the available subset), used by
    /// `fifoness=flow` worker selection. Frozen to CityHash64 regardless of
    /// `--hashtype` so replays land on the same workers.
    pub fn dispatch_hash(&self) -> u64 {
        let mut out = Vec::with_capacity(40);
        match (self.ip_src, self.ip_dst) {
            (Some(src), Some(dst)) => {
                encode_ip(&mut out, Some(src));
                encode_ip(&mut out, Some(dst));
                out.push(self.ip_proto.unwrap_or(0xff));
                out.extend_from_slice(&self.tp_src.unwrap_or(0xffff).to_be_bytes());
                out.extend_from_slice(&self.tp_dst.unwrap_or(0xffff).to_be_bytes());
            }
            _ => {
                // Non-IP traffic: fall back to the L2 pair.
                out.extend_from_slice(&self.eth_dst);
                out.extend_from_slice(&self.eth_src);
                out.extend_from_slice(&self.eth_type.to_be_bytes());
            }
        }
        fingerprint64(&out, HashType::City64)
    }
}

fn encode_ip(out: &mut Vec<u8>, ip: Option<IpAddr>) {
    match ip {
        Some(IpAddr::V4(v4)) => {
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        Some(IpAddr::V6(v6)) => {
            out.push(6);
            out.extend_from_slice(&v6.octets());
        }
        None => out.push(0),
    }
}

fn parse_ipv4(l3: &[u8], key: &mut FlowKey) {
    if l3.len() < 20 {
        return;
    }
    let ihl = ((l3[0] & 0x0f) as usize) * 4;
    if (l3[0] >> 4) != 4 || ihl < 20 || l3.len() < ihl {
        return;
    }
    key.ip_proto = Some(l3[9]);
    key.ip_src = Some(IpAddr::from([l3[12], l3[13], l3[14], l3[15]]));
    key.ip_dst = Some(IpAddr::from([l3[16], l3[17], l3[18], l3[19]]));
    parse_l4(&l3[ihl..], l3[9], key);
}

fn parse_ipv6(l3: &[u8], key: &mut FlowKey) {
    if l3.len() < 40 {
        return;
    }
    let next = l3[6];
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&l3[8..24]);
    dst.copy_from_slice(&l3[24..40]);
    key.ip_proto = Some(next);
    key.ip_src = Some(IpAddr::from(src));
    key.ip_dst = Some(IpAddr::from(dst));
    // Extension headers are not walked; transport fields stay empty then.
    parse_l4(&l3[40..], next, key);
}

fn parse_l4(l4: &[u8], proto: u8, key: &mut FlowKey) {
    match proto {
        IPPROTO_TCP | IPPROTO_UDP => {
            if l4.len() >= 4 {
                key.tp_src = Some(u16::from_be_bytes([l4[0], l4[1]]));
                key.tp_dst = Some(u16::from_be_bytes([l4[2], l4[3]]));
            }
        }
        IPPROTO_ICMP | IPPROTO_ICMPV6 => {
            if l4.len() >= 2 {
                key.tp_src = Some(l4[0] as u16);
                key.tp_dst = Some(l4[1] as u16);
            }
        }
        _ => {}
    }
}

/// L3 and L4 offsets of a frame relative to its start, for the metadata
/// header cache.
fn offsets(frame: &[u8]) -> (Option<u16>, Option<u16>) {
    if frame.len() < ETH_HDR_LEN {
        return (None, None);
    }
    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let mut l3 = ETH_HDR_LEN;
    if ethertype == ETHERTYPE_VLAN {
        if frame.len() < ETH_HDR_LEN + VLAN_TAG_LEN {
            return (None, None);
        }
        ethertype = u16::from_be_bytes([frame[16], frame[17]]);
        l3 += VLAN_TAG_LEN;
    }
    match ethertype {
        ETHERTYPE_IPV4 if frame.len() >= l3 + 20 => {
            let ihl = ((frame[l3] & 0x0f) as usize) * 4;
            (Some(l3 as u16), Some((l3 + ihl) as u16))
        }
        ETHERTYPE_IPV6 if frame.len() >= l3 + 40 => (Some(l3 as u16), Some((l3 + 40) as u16)),
        _ => (Some(l3 as u16), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_frame() -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&[0x02, 0, 0, 0, 0, 2]); // dst
        f.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]); // src
        f.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        // IPv4, no options
        f.extend_from_slice(&[0x45, 0, 0, 40, 0, 0, 0, 0, 64, IPPROTO_TCP]);
        f.extend_from_slice(&[0, 0]); // checksum
        f.extend_from_slice(&[10, 0, 0, 1]);
        f.extend_from_slice(&[10, 0, 0, 2]);
        // TCP src/dst ports
        f.extend_from_slice(&1234u16.to_be_bytes());
        f.extend_from_slice(&80u16.to_be_bytes());
        f.extend_from_slice(&[0; 16]);
        f
    }

    #[test]
    fn parses_tcp_five_tuple() {
        let key = FlowKey::parse(&tcp_frame(), 3).unwrap();
        assert_eq!(key.in_port, 3);
        assert_eq!(key.eth_type, ETHERTYPE_IPV4);
        assert_eq!(key.ip_src, Some(IpAddr::from([10, 0, 0, 1])));
        assert_eq!(key.ip_dst, Some(IpAddr::from([10, 0, 0, 2])));
        assert_eq!(key.ip_proto, Some(IPPROTO_TCP));
        assert_eq!(key.tp_src, Some(1234));
        assert_eq!(key.tp_dst, Some(80));
    }

    #[test]
    fn parses_vlan_tag() {
        let mut f = tcp_frame();
        // Splice a VLAN tag with vid 100, pcp 5 after the MACs.
        let tci = (5u16 << 13) | 100;
        let mut tag = Vec::new();
        tag.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
        tag.extend_from_slice(&tci.to_be_bytes());
        f.splice(12..12, tag);
        let key = FlowKey::parse(&f, 0).unwrap();
        assert_eq!(key.vlan_vid, Some(100));
        assert_eq!(key.vlan_pcp, Some(5));
        assert_eq!(key.eth_type, ETHERTYPE_IPV4);
        assert_eq!(key.tp_dst, Some(80));
    }

    #[test]
    fn short_frame_yields_no_key() {
        assert!(FlowKey::parse(&[0; 13], 0).is_none());
    }

    #[test]
    fn truncated_l3_stops_cleanly() {
        let f = &tcp_frame()[..20]; // Ethernet + 6 bytes of IP
        let key = FlowKey::parse(f, 0).unwrap();
        assert_eq!(key.eth_type, ETHERTYPE_IPV4);
        assert_eq!(key.ip_src, None);
        assert_eq!(key.tp_src, None);
    }

    #[test]
    fn same_flow_same_dispatch_hash() {
        let a = FlowKey::parse(&tcp_frame(), 1).unwrap();
        let b = FlowKey::parse(&tcp_frame(), 2).unwrap();
        // Ingress port is not part of the 5-tuple dispatch hash.
        assert_eq!(a.dispatch_hash(), b.dispatch_hash());
        // But it is part of the cache fingerprint.
        assert_ne!(
            a.fingerprint(HashType::City64),
            b.fingerprint(HashType::City64)
        );
    }

    #[test]
    fn classify_caches_key_and_offsets() {
        use crate::buffer::{BufferKind, PacketBuffer};
        let mut buf = PacketBuffer::new(2048, 128, BufferKind::Heap);
        buf.set_frame(&tcp_frame()).unwrap();
        buf.meta.in_port = Some(7);
        let key = FlowKey::classify(&mut buf).unwrap();
        assert_eq!(key.in_port, 7);
        assert_eq!(buf.meta.l3_offset, Some(14));
        assert_eq!(buf.meta.l4_offset, Some(34));
        assert!(buf.meta.flow_key.is_some());
    }
}
