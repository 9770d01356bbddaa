//! MTP wire format: protocol constants, message codec, and the data-plane
//! hash. All MTP frames are raw Ethernet II with EtherType 0x8850; the MTP
//! payload starts at byte 14 with a one-byte message type.

pub const ETH_MTP_CTRL: u16 = 0x8850;
pub const ETH_IP_CTRL: u16 = 0x0800;
pub const ETH_HDR_LEN: usize = 14;

pub const VID_LEN: usize = 64;
pub const MAX_VIDS_PER_MSG: usize = 32;
pub const MAX_BUFFER_SIZE: usize = 9000;

pub const MTP_TYPE_HELLO_NR: u8 = 1;
pub const MTP_TYPE_JOIN_REQ: u8 = 3;
pub const MTP_TYPE_JOIN_RES: u8 = 4;
pub const MTP_TYPE_JOIN_ACK: u8 = 5;
pub const MTP_TYPE_KEEP_ALIVE: u8 = 6;
pub const MTP_TYPE_DATA_MSG: u8 = 7;
pub const MTP_TYPE_FAILURE_UPDATE: u8 = 8;
pub const MTP_TYPE_RECOVER_UPDATE: u8 = 9;
pub const MTP_TYPE_START_HELLO: u8 = 10;

pub const REACHABLE_OPTION: u8 = 1;
pub const UNREACHABLE_OPTION: u8 = 2;

/// MTP data header: type byte + two u16 VIDs.
pub const DATA_HDR_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    HelloNr { tier: u8, vids: Vec<String> },
    JoinReq { vids: Vec<String> },
    JoinRes { vids: Vec<String> },
    JoinAck { vids: Vec<String> },
    KeepAlive,
    StartHello,
    Data { src_vid: u16, dest_vid: u16, payload: Vec<u8> },
    FailureUpdate { option: u8, vids: Vec<String> },
    RecoverUpdate { option: u8, vids: Vec<String> },
}

impl Message {
    /// Encode the MTP payload (everything after the Ethernet header) into
    /// `buf`, returning the encoded length. `buf` must hold at least
    /// `MAX_BUFFER_SIZE` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        match self {
            Message::HelloNr { tier, vids } => {
                buf[0] = MTP_TYPE_HELLO_NR;
                buf[1] = *tier;
                2 + encode_vid_list(&mut buf[2..], vids)
            }
            Message::JoinReq { vids } => {
                buf[0] = MTP_TYPE_JOIN_REQ;
                1 + encode_vid_list(&mut buf[1..], vids)
            }
            Message::JoinRes { vids } => {
                buf[0] = MTP_TYPE_JOIN_RES;
                1 + encode_vid_list(&mut buf[1..], vids)
            }
            Message::JoinAck { vids } => {
                buf[0] = MTP_TYPE_JOIN_ACK;
                1 + encode_vid_list(&mut buf[1..], vids)
            }
            Message::KeepAlive => {
                buf[0] = MTP_TYPE_KEEP_ALIVE;
                1
            }
            Message::StartHello => {
                buf[0] = MTP_TYPE_START_HELLO;
                1
            }
            Message::Data { src_vid, dest_vid, payload } => {
                buf[0] = MTP_TYPE_DATA_MSG;
                buf[1..3].copy_from_slice(&src_vid.to_le_bytes());
                buf[3..5].copy_from_slice(&dest_vid.to_le_bytes());
                buf[DATA_HDR_LEN..DATA_HDR_LEN + payload.len()].copy_from_slice(payload);
                DATA_HDR_LEN + payload.len()
            }
            Message::FailureUpdate { option, vids } => {
                buf[0] = MTP_TYPE_FAILURE_UPDATE;
                buf[1] = *option;
                2 + encode_vid_list(&mut buf[2..], vids)
            }
            Message::RecoverUpdate { option, vids } => {
                buf[0] = MTP_TYPE_RECOVER_UPDATE;
                buf[1] = *option;
                2 + encode_vid_list(&mut buf[2..], vids)
            }
        }
    }

    /// Decode an MTP payload (starting at the type byte). Returns `None`
    /// for unknown types, truncated frames, or over-long VID lists; callers
    /// drop such frames silently.
    pub fn decode(payload: &[u8]) -> Option<Message> {
        let (&msg_type, body) = payload.split_first()?;
        match msg_type {
            MTP_TYPE_HELLO_NR => {
                let (&tier, rest) = body.split_first()?;
                Some(Message::HelloNr { tier, vids: decode_vid_list(rest)? })
            }
            MTP_TYPE_JOIN_REQ => Some(Message::JoinReq { vids: decode_vid_list(body)? }),
            MTP_TYPE_JOIN_RES => Some(Message::JoinRes { vids: decode_vid_list(body)? }),
            MTP_TYPE_JOIN_ACK => Some(Message::JoinAck { vids: decode_vid_list(body)? }),
            MTP_TYPE_KEEP_ALIVE => Some(Message::KeepAlive),
            MTP_TYPE_START_HELLO => Some(Message::StartHello),
            MTP_TYPE_DATA_MSG => {
                let (src_vid, dest_vid) = data_msg_vids(payload)?;
                Some(Message::Data {
                    src_vid,
                    dest_vid,
                    payload: body[4..].to_vec(),
                })
            }
            MTP_TYPE_FAILURE_UPDATE => {
                let (&option, rest) = body.split_first()?;
                Some(Message::FailureUpdate { option, vids: decode_vid_list(rest)? })
            }
            MTP_TYPE_RECOVER_UPDATE => {
                let (&option, rest) = body.split_first()?;
                Some(Message::RecoverUpdate { option, vids: decode_vid_list(rest)? })
            }
            _ => None,
        }
    }
}

/// Encode a VID list: u16 LE count, then count fixed-width 64-byte
/// zero-padded entries. VIDs longer than `VID_LEN` are never produced by
/// the protocol (a VID grows one dotted suffix per tier).
fn encode_vid_list(buf: &mut [u8], vids: &[String]) -> usize {
    buf[0..2].copy_from_slice(&(vids.len() as u16).to_le_bytes());
    let mut at = 2;
    for vid in vids {
        let bytes = vid.as_bytes();
        let n = bytes.len().min(VID_LEN);
        buf[at..at + n].copy_from_slice(&bytes[..n]);
        for b in &mut buf[at + n..at + VID_LEN] {
            *b = 0;
        }
        at += VID_LEN;
    }
    at
}

fn decode_vid_list(buf: &[u8]) -> Option<Vec<String>> {
    if buf.len() < 2 {
        return None;
    }
    let count = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    if count > MAX_VIDS_PER_MSG || buf.len() < 2 + count * VID_LEN {
        return None;
    }
    let mut vids = Vec::with_capacity(count);
    for i in 0..count {
        let at = 2 + i * VID_LEN;
        let raw = &buf[at..at + VID_LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(VID_LEN);
        let vid = std::str::from_utf8(&raw[..end]).ok()?;
        vids.push(vid.to_string());
    }
    Some(vids)
}

/// Pull the two binary VIDs out of a DATA_MSG payload without copying the
/// encapsulated packet.
pub fn data_msg_vids(payload: &[u8]) -> Option<(u16, u16)> {
    if payload.len() < DATA_HDR_LEN || payload[0] != MTP_TYPE_DATA_MSG {
        return None;
    }
    let src = u16::from_le_bytes([payload[1], payload[2]]);
    let dest = u16::from_le_bytes([payload[3], payload[4]]);
    Some((src, dest))
}

/// Multipath hash key for a DATA_MSG payload: the low two octets of the
/// inner source and destination IPv4 addresses.
pub fn data_msg_hash_key(payload: &[u8]) -> Option<[u8; 4]> {
    let ip = payload.get(DATA_HDR_LEN..)?;
    ipv4_hash_key(ip)
}

/// Multipath hash key straight from an IPv4 header.
pub fn ipv4_hash_key(ip: &[u8]) -> Option<[u8; 4]> {
    if ip.len() < 20 {
        return None;
    }
    Some([ip[14], ip[15], ip[18], ip[19]])
}

/// Jenkins one-at-a-time hash, used to spread flows over the available
/// offered ports.
pub fn jenkins_one_at_a_time(key: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &b in key {
        hash = hash.wrapping_add(b as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash = hash.wrapping_add(hash << 15);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let mut buf = [0u8; MAX_BUFFER_SIZE];
        let n = msg.encode_into(&mut buf);
        Message::decode(&buf[..n]).expect("decode failed")
    }

    fn vids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_hello_nr_roundtrip() {
        let msg = Message::HelloNr { tier: 1, vids: vids(&["7"]) };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_join_roundtrips() {
        for msg in [
            Message::JoinReq { vids: vids(&["1", "2"]) },
            Message::JoinRes { vids: vids(&["1.3", "2.3"]) },
            Message::JoinAck { vids: vids(&["1.3.2"]) },
        ] {
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn test_empty_bodies_roundtrip() {
        assert_eq!(roundtrip(Message::KeepAlive), Message::KeepAlive);
        assert_eq!(roundtrip(Message::StartHello), Message::StartHello);
    }

    #[test]
    fn test_data_roundtrip_is_bit_exact() {
        let msg = Message::Data {
            src_vid: 1,
            dest_vid: 513,
            payload: vec![0x45, 0x00, 0x00, 0x1c, 0xab, 0xcd],
        };
        let mut buf = [0u8; MAX_BUFFER_SIZE];
        let n = msg.encode_into(&mut buf);
        let mut buf2 = [0u8; MAX_BUFFER_SIZE];
        let n2 = roundtrip(msg).encode_into(&mut buf2);
        assert_eq!(&buf[..n], &buf2[..n2]);
    }

    #[test]
    fn test_update_roundtrips() {
        for msg in [
            Message::FailureUpdate { option: UNREACHABLE_OPTION, vids: vids(&["1", "4"]) },
            Message::FailureUpdate { option: REACHABLE_OPTION, vids: vids(&["1"]) },
            Message::RecoverUpdate { option: REACHABLE_OPTION, vids: vec![] },
            Message::RecoverUpdate { option: UNREACHABLE_OPTION, vids: vids(&["2"]) },
        ] {
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn test_vid_list_is_fixed_width() {
        let mut buf = [0u8; MAX_BUFFER_SIZE];
        let n = Message::JoinReq { vids: vids(&["1", "12.3"]) }.encode_into(&mut buf);
        // type + count + two padded slots
        assert_eq!(n, 1 + 2 + 2 * VID_LEN);
        assert_eq!(&buf[3..4], b"1");
        assert_eq!(buf[4], 0);
        assert_eq!(&buf[3 + VID_LEN..3 + VID_LEN + 4], b"12.3");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(Message::decode(&[]), None);
        assert_eq!(Message::decode(&[0xEE]), None);
        // HELLO_NR with a count pointing past the end of the frame
        assert_eq!(Message::decode(&[MTP_TYPE_HELLO_NR, 1, 5, 0]), None);
        // VID list count above the per-message cap
        let mut buf = vec![MTP_TYPE_JOIN_REQ];
        buf.extend_from_slice(&(MAX_VIDS_PER_MSG as u16 + 1).to_le_bytes());
        buf.resize(3 + 33 * VID_LEN, 0);
        assert_eq!(Message::decode(&buf), None);
        // truncated data message
        assert_eq!(Message::decode(&[MTP_TYPE_DATA_MSG, 1, 0]), None);
    }

    #[test]
    fn test_data_msg_accessors() {
        let mut ip = vec![0u8; 20];
        ip[12..16].copy_from_slice(&[10, 0, 1, 5]);
        ip[16..20].copy_from_slice(&[10, 0, 4, 7]);
        let msg = Message::Data { src_vid: 1, dest_vid: 4, payload: ip };
        let mut buf = [0u8; MAX_BUFFER_SIZE];
        let n = msg.encode_into(&mut buf);
        assert_eq!(data_msg_vids(&buf[..n]), Some((1, 4)));
        assert_eq!(data_msg_hash_key(&buf[..n]), Some([1, 5, 4, 7]));
    }

    #[test]
    fn test_jenkins_fixed_vectors() {
        assert_eq!(jenkins_one_at_a_time(&[0, 0, 0, 0]), 0);
        assert_eq!(jenkins_one_at_a_time(&[1]), 307_143_837);
    }

    #[test]
    fn test_jenkins_is_deterministic_and_spreads() {
        let a = jenkins_one_at_a_time(&[1, 5, 4, 7]);
        assert_eq!(a, jenkins_one_at_a_time(&[1, 5, 4, 7]));
        // nearby keys land on different hashes
        assert_ne!(a, jenkins_one_at_a_time(&[1, 5, 4, 8]));
        assert_ne!(a, jenkins_one_at_a_time(&[1, 6, 4, 7]));
    }
}
