//! Port registry and VID tables. Control ports live in one ordered vector
//! and everything else refers to them by index (`PortId`), so the accepted
//! and offered tables carry no back-pointers.

use fxhash::FxHashMap;

use crate::wire::{ETH_HDR_LEN, ETH_IP_CTRL, ETH_MTP_CTRL};

pub type PortId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailType {
    None,
    Miss,
    Detect,
}

#[derive(Debug)]
pub struct ControlPort {
    pub name: String,
    pub ifindex: u32,
    /// Prebuilt Ethernet II header: broadcast destination, live interface
    /// MAC as source, EtherType 0x8850.
    pub header: [u8; ETH_HDR_LEN],
    pub is_up: bool,
    pub start: bool,
    pub fail_type: FailType,
    pub last_sent_ms: i64,
    pub last_received_ms: i64,
    pub continue_count: u8,
}

impl ControlPort {
    pub fn new(name: String, ifindex: u32, mac: [u8; 6]) -> Self {
        ControlPort {
            name,
            ifindex,
            header: ethernet_header(mac, ETH_MTP_CTRL),
            is_up: false,
            start: false,
            fail_type: FailType::None,
            last_sent_ms: 0,
            last_received_ms: 0,
            continue_count: 0,
        }
    }
}

#[derive(Debug)]
pub struct ComputePort {
    pub name: String,
    pub ifindex: u32,
    pub header: [u8; ETH_HDR_LEN],
}

impl ComputePort {
    pub fn new(name: String, ifindex: u32, mac: [u8; 6]) -> Self {
        ComputePort {
            name,
            ifindex,
            header: ethernet_header(mac, ETH_IP_CTRL),
        }
    }
}

pub fn ethernet_header(src_mac: [u8; 6], ethertype: u16) -> [u8; ETH_HDR_LEN] {
    let mut header = [0xFFu8; ETH_HDR_LEN];
    header[6..12].copy_from_slice(&src_mac);
    header[12..14].copy_from_slice(&ethertype.to_be_bytes());
    header
}

/// One downstream port that completed the handshake: the VIDs learned
/// through it plus the set currently unreachable through it.
#[derive(Debug)]
pub struct AcceptedEntry {
    pub port: PortId,
    pub vids: Vec<String>,
    pub unreachable: Vec<String>,
}

/// One upstream port that completed the handshake: the VIDs offered
/// through it plus its reachable/unreachable sub-tables.
#[derive(Debug)]
pub struct OfferedEntry {
    pub port: PortId,
    pub vids: Vec<String>,
    pub reachable: Vec<String>,
    pub unreachable: Vec<String>,
}

impl OfferedEntry {
    pub fn is_clean(&self) -> bool {
        self.reachable.is_empty() && self.unreachable.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SwitchTables {
    pub control: Vec<ControlPort>,
    pub accepted: Vec<AcceptedEntry>,
    pub offered: Vec<OfferedEntry>,
    by_ifindex: FxHashMap<u32, PortId>,
}

impl SwitchTables {
    pub fn new(control: Vec<ControlPort>) -> Self {
        let by_ifindex = control
            .iter()
            .enumerate()
            .map(|(id, port)| (port.ifindex, id))
            .collect();
        SwitchTables {
            control,
            accepted: Vec::new(),
            offered: Vec::new(),
            by_ifindex,
        }
    }

    pub fn port_by_ifindex(&self, ifindex: u32) -> Option<PortId> {
        self.by_ifindex.get(&ifindex).copied()
    }

    pub fn port_by_name(&self, name: &str) -> Option<PortId> {
        self.control.iter().position(|p| p.name == name)
    }

    pub fn accepted_idx(&self, port: PortId) -> Option<usize> {
        self.accepted.iter().position(|e| e.port == port)
    }

    pub fn offered_idx(&self, port: PortId) -> Option<usize> {
        self.offered.iter().position(|e| e.port == port)
    }

    /// Record a VID learned from a downstream peer on `port`, creating the
    /// accepted entry on first use. Entries are never removed.
    pub fn learn_accepted(&mut self, port: PortId, vid: &str) {
        match self.accepted_idx(port) {
            Some(i) => push_unique(&mut self.accepted[i].vids, vid),
            None => self.accepted.push(AcceptedEntry {
                port,
                vids: vec![vid.to_string()],
                unreachable: Vec::new(),
            }),
        }
    }

    /// Record a VID offered upward on `port`.
    pub fn learn_offered(&mut self, port: PortId, vid: &str) {
        match self.offered_idx(port) {
            Some(i) => push_unique(&mut self.offered[i].vids, vid),
            None => self.offered.push(OfferedEntry {
                port,
                vids: vec![vid.to_string()],
                reachable: Vec::new(),
                unreachable: Vec::new(),
            }),
        }
    }

    /// Find the accepted entry owning `dest`: an entry whose VID set holds
    /// an extension of `dest` (that is, `dest` followed by a dot). The
    /// stored VIDs always carry at least one dotted suffix relative to the
    /// root, so an exact match cannot occur.
    pub fn accepted_idx_for_vid(&self, dest: &str) -> Option<usize> {
        self.accepted.iter().position(|e| {
            e.vids.iter().any(|v| {
                v.len() > dest.len()
                    && v.starts_with(dest)
                    && v.as_bytes()[dest.len()] == b'.'
            })
        })
    }

    /// Offered ports a data message for `dest` may use: the port is up and
    /// its sub-tables permit the destination. A non-empty reachable table
    /// is authoritative; otherwise the unreachable table acts as a block
    /// list; a clean port carries anything.
    pub fn available_offered(&self, dest: &str) -> Vec<PortId> {
        self.offered
            .iter()
            .filter(|e| self.control[e.port].is_up)
            .filter(|e| {
                if !e.reachable.is_empty() {
                    e.reachable.iter().any(|v| v == dest)
                } else if !e.unreachable.is_empty() {
                    !e.unreachable.iter().any(|v| v == dest)
                } else {
                    true
                }
            })
            .map(|e| e.port)
            .collect()
    }

    /// Root VIDs learned via every up downstream port.
    pub fn all_accepted_roots(&self) -> Vec<String> {
        let mut roots = Vec::new();
        for e in &self.accepted {
            if self.control[e.port].is_up {
                for vid in &e.vids {
                    roots.push(vid_root(vid).to_string());
                }
            }
        }
        roots
    }

    /// Root VIDs learned via one specific downstream port.
    pub fn accepted_roots_on(&self, port: PortId) -> Vec<String> {
        match self.accepted_idx(port) {
            Some(i) => self.accepted[i]
                .vids
                .iter()
                .map(|v| vid_root(v).to_string())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Union of the unreachable sub-tables across all up offered ports.
    pub fn offered_unreachable_roots(&self) -> Vec<String> {
        let mut roots = Vec::new();
        for e in &self.offered {
            if self.control[e.port].is_up {
                for vid in &e.unreachable {
                    roots.push(vid_root(vid).to_string());
                }
            }
        }
        roots
    }

    /// True when at least one offered port still has empty reachable and
    /// unreachable sub-tables. An empty offered table counts as not clean.
    pub fn any_offered_clean(&self) -> bool {
        self.offered.iter().any(|e| e.is_clean())
    }

    /// True when no offered port is up. Vacuously true before any offered
    /// entry exists.
    pub fn all_offered_down(&self) -> bool {
        !self.offered.iter().any(|e| self.control[e.port].is_up)
    }
}

pub fn push_unique(set: &mut Vec<String>, vid: &str) {
    if !set.iter().any(|v| v == vid) {
        set.push(vid.to_string());
    }
}

pub fn remove_vid(set: &mut Vec<String>, vid: &str) {
    set.retain(|v| v != vid);
}

/// The root prefix of a VID: everything before the first dot.
pub fn vid_root(vid: &str) -> &str {
    match vid.find('.') {
        Some(at) => &vid[..at],
        None => vid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, ifindex: u32) -> ControlPort {
        ControlPort::new(name.to_string(), ifindex, [0x02, 0, 0, 0, 0, ifindex as u8])
    }

    fn tables(names: &[&str]) -> SwitchTables {
        let control = names
            .iter()
            .enumerate()
            .map(|(i, n)| port(n, (i + 1) as u32))
            .collect();
        SwitchTables::new(control)
    }

    #[test]
    fn test_port_lookup() {
        let t = tables(&["T1-eth1", "T1-eth2"]);
        assert_eq!(t.port_by_ifindex(2), Some(1));
        assert_eq!(t.port_by_ifindex(9), None);
        assert_eq!(t.port_by_name("T1-eth1"), Some(0));
    }

    #[test]
    fn test_ethernet_header_layout() {
        let h = ethernet_header([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff], ETH_MTP_CTRL);
        assert_eq!(&h[0..6], &[0xFF; 6]);
        assert_eq!(&h[6..12], &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(&h[12..14], &[0x88, 0x50]);
    }

    #[test]
    fn test_learn_dedupes_per_port() {
        let mut t = tables(&["S1-eth1"]);
        t.learn_accepted(0, "1.2");
        t.learn_accepted(0, "1.2");
        t.learn_accepted(0, "2.2");
        assert_eq!(t.accepted.len(), 1);
        assert_eq!(t.accepted[0].vids, vec!["1.2", "2.2"]);
    }

    #[test]
    fn test_accepted_prefix_match_requires_dot_boundary() {
        let mut t = tables(&["S1-eth1", "S1-eth2"]);
        t.learn_accepted(0, "1.3");
        t.learn_accepted(1, "13.2");
        assert_eq!(t.accepted_idx_for_vid("1"), Some(0));
        assert_eq!(t.accepted_idx_for_vid("13"), Some(1));
        assert_eq!(t.accepted_idx_for_vid("3"), None);
        // an exact (unextended) VID is not a match
        assert_eq!(t.accepted_idx_for_vid("1.3"), None);
    }

    #[test]
    fn test_available_offered_three_way_rule() {
        let mut t = tables(&["L1-eth1", "L1-eth2", "L1-eth3"]);
        for p in 0..3 {
            t.learn_offered(p, "1");
            t.control[p].is_up = true;
        }
        // clean ports carry anything
        assert_eq!(t.available_offered("4"), vec![0, 1, 2]);
        // unreachable acts as a block list
        t.offered[0].unreachable.push("4".to_string());
        assert_eq!(t.available_offered("4"), vec![1, 2]);
        assert_eq!(t.available_offered("2"), vec![0, 1, 2]);
        // a non-empty reachable table is authoritative
        t.offered[1].reachable.push("2".to_string());
        assert_eq!(t.available_offered("4"), vec![2]);
        assert_eq!(t.available_offered("2"), vec![0, 1, 2]);
        // down ports never qualify
        t.control[2].is_up = false;
        assert_eq!(t.available_offered("4"), Vec::<PortId>::new());
    }

    #[test]
    fn test_root_gathering() {
        let mut t = tables(&["T1-eth1", "T1-eth2"]);
        t.learn_accepted(0, "1.2");
        t.learn_accepted(0, "2.2");
        t.learn_accepted(1, "3.1");
        t.control[0].is_up = true;
        assert_eq!(t.all_accepted_roots(), vec!["1", "2"]);
        assert_eq!(t.accepted_roots_on(0), vec!["1", "2"]);
        t.control[1].is_up = true;
        assert_eq!(t.all_accepted_roots(), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_clean_and_down_rules() {
        let mut t = tables(&["T1-eth1", "T1-eth2"]);
        // no offered entries: not clean, vacuously all down
        assert!(!t.any_offered_clean());
        assert!(t.all_offered_down());
        t.learn_offered(0, "1.2");
        t.learn_offered(1, "1.2");
        assert!(t.any_offered_clean());
        assert!(t.all_offered_down());
        t.control[0].is_up = true;
        assert!(!t.all_offered_down());
        t.offered[0].unreachable.push("4".to_string());
        assert!(t.any_offered_clean()); // the other port is still clean
        t.offered[1].reachable.push("1".to_string());
        assert!(!t.any_offered_clean());
    }

    #[test]
    fn test_vid_root() {
        assert_eq!(vid_root("1"), "1");
        assert_eq!(vid_root("1.3.2"), "1");
        assert_eq!(vid_root("12.4"), "12");
    }
}
