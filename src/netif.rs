//! Interface discovery and classification. The emulator names every veth
//! it gives a node with the node name as a prefix, so classification is a
//! `getifaddrs` walk filtered on that prefix: live `AF_INET` interfaces are
//! compute candidates (leaves only), live `AF_PACKET` interfaces become
//! control ports.

use std::ffi::CStr;
use std::io;
use std::net::Ipv4Addr;

use anyhow::{bail, Context, Result};
use fxhash::FxHashSet;

const IFNAMSIZ: usize = libc::IFNAMSIZ;

#[repr(C)]
struct IfReqHwaddr {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_hwaddr: libc::sockaddr,
    _pad: [u8; 24 - std::mem::size_of::<libc::sockaddr>()],
}

/// Result of the startup interface walk.
#[derive(Debug, Default)]
pub struct Discovered {
    /// Compute interface and its IPv4 address; the last live match wins.
    pub compute: Option<(String, Ipv4Addr)>,
    /// Control interface names in enumeration order.
    pub control: Vec<String>,
}

/// Walk the system interfaces once and classify everything prefixed with
/// the node name. Only leaves get a compute interface; the compute
/// interface is excluded from the control set.
pub fn discover(node_name: &str, is_leaf: bool) -> Result<Discovered> {
    let mut found = Discovered::default();
    for_each_interface(|name, family, up, addr| {
        if !up || !name.starts_with(node_name) {
            return;
        }
        match family {
            libc::AF_INET if is_leaf => {
                if let Some(ip) = addr {
                    found.compute = Some((name.to_string(), ip));
                }
            }
            libc::AF_PACKET => {
                if !found.control.iter().any(|n| n == name) {
                    found.control.push(name.to_string());
                }
            }
            _ => {}
        }
    })?;
    if let Some((compute_name, _)) = &found.compute {
        found.control.retain(|n| n != compute_name);
    }
    Ok(found)
}

/// Snapshot of the node's currently live control-capable interfaces, used
/// by the immediate failure detector each loop iteration.
pub fn live_control_ports(node_name: &str) -> Result<FxHashSet<String>> {
    let mut live = FxHashSet::default();
    for_each_interface(|name, family, up, _| {
        if family == libc::AF_PACKET && up && name.starts_with(node_name) {
            live.insert(name.to_string());
        }
    })?;
    Ok(live)
}

fn for_each_interface(mut f: impl FnMut(&str, i32, bool, Option<Ipv4Addr>)) -> Result<()> {
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(io::Error::last_os_error()).context("getifaddrs failed");
    }
    let mut cur = ifap;
    while !cur.is_null() {
        let ifa = unsafe { &*cur };
        if !ifa.ifa_addr.is_null() {
            let name = unsafe { CStr::from_ptr(ifa.ifa_name) }.to_string_lossy();
            let family = unsafe { (*ifa.ifa_addr).sa_family } as i32;
            let up = ifa.ifa_flags & libc::IFF_UP as u32 != 0;
            let addr = if family == libc::AF_INET {
                let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
                Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
            } else {
                None
            };
            f(&name, family, up, addr);
        }
        cur = ifa.ifa_next;
    }
    unsafe { libc::freeifaddrs(ifap) };
    Ok(())
}

/// The root VID of a leaf: one octet of its compute-subnet address,
/// formatted as a decimal string.
pub fn root_vid(addr: Ipv4Addr, octet: u8) -> String {
    addr.octets()[octet as usize - 1].to_string()
}

/// The digits following "eth" in an interface name; a VID is extended with
/// this suffix at each hop ("T1-eth3" contributes ".3").
pub fn eth_suffix(name: &str) -> Option<&str> {
    name.find("eth").map(|at| &name[at + 3..])
}

pub fn iface_mac(name: &str) -> Result<[u8; 6]> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error()).context("socket for SIOCGIFHWADDR failed");
    }

    let mut ifr = IfReqHwaddr {
        ifr_name: [0; IFNAMSIZ],
        ifr_hwaddr: libc::sockaddr {
            sa_family: 0,
            sa_data: [0; 14],
        },
        _pad: [0; 24 - std::mem::size_of::<libc::sockaddr>()],
    };
    write_ifname(&mut ifr.ifr_name, name)?;

    let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR as _, &mut ifr) };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if ret < 0 {
        return Err(err).with_context(|| format!("SIOCGIFHWADDR failed for {name}"));
    }

    let mut mac = [0u8; 6];
    for (i, slot) in mac.iter_mut().enumerate() {
        *slot = ifr.ifr_hwaddr.sa_data[i] as u8;
    }
    Ok(mac)
}

pub fn iface_index(name: &str) -> Result<u32> {
    let cname = std::ffi::CString::new(name).context("interface name contains NUL")?;
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("if_nametoindex failed for {name}"));
    }
    Ok(index)
}

fn write_ifname(dst: &mut [libc::c_char; IFNAMSIZ], name: &str) -> Result<()> {
    if name.len() >= IFNAMSIZ {
        bail!("interface name too long: {name}");
    }
    for b in dst.iter_mut() {
        *b = 0;
    }
    for (i, b) in name.as_bytes().iter().enumerate() {
        dst[i] = *b as libc::c_char;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_vid_picks_the_configured_octet() {
        let addr = Ipv4Addr::new(10, 0, 4, 7);
        assert_eq!(root_vid(addr, 3), "4");
        assert_eq!(root_vid(addr, 4), "7");
        assert_eq!(root_vid(addr, 1), "10");
    }

    #[test]
    fn test_eth_suffix() {
        assert_eq!(eth_suffix("L1-eth2"), Some("2"));
        assert_eq!(eth_suffix("T4-eth12"), Some("12"));
        assert_eq!(eth_suffix("lo"), None);
    }

    #[test]
    fn test_discover_with_unmatched_prefix_is_empty() {
        let found = discover("no-such-node-prefix", true).unwrap();
        assert!(found.compute.is_none());
        assert!(found.control.is_empty());
    }

    #[test]
    fn test_live_scan_sees_loopback() {
        // every Linux host has a live `lo`
        let live = live_control_ports("lo").unwrap();
        assert!(live.contains("lo"));
    }
}
