mod config;
mod netif;
mod switch;
mod tables;
mod wire;

use std::io;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, DEFAULT_VID_OCTET};
use crate::switch::{FrameSink, Switch};
use crate::tables::{ComputePort, ControlPort, SwitchTables};
use crate::wire::{ETH_HDR_LEN, ETH_IP_CTRL, ETH_MTP_CTRL, MAX_BUFFER_SIZE};

/// How long the event loop may sleep between periodic passes. Must stay
/// well under the keep-alive hello timer.
const EPOLL_TICK_MS: i32 = 50;

/// Settle delay before a leaf announces itself, giving the rest of the
/// emulated fabric time to come up.
const STARTUP_SETTLE: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "mtpd", version, about = "MTP-DCN switch daemon for emulated folded-Clos fabrics")]
struct Cli {
    /// Node name; every interface owned by this node is prefixed with it.
    node_name: String,
    /// Directory holding <node_name>.conf; <node_name>.log is appended there.
    config_directory: String,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_dir = Path::new(&cli.config_directory);
    if !config_dir.is_dir() {
        bail!("'{}' is not a valid directory", cli.config_directory);
    }

    init_tracing(&config_dir.join(format!("{}.log", cli.node_name)))?;
    install_signal_handlers()?;

    let cfg = Config::load(&config_dir.join(format!("{}.conf", cli.node_name)))?;
    run(&cli.node_name, cfg)
}

fn run(node_name: &str, cfg: Config) -> Result<()> {
    let discovered = netif::discover(node_name, cfg.is_leaf)?;

    let mut control = Vec::with_capacity(discovered.control.len());
    for name in &discovered.control {
        let mac = netif::iface_mac(name)?;
        let ifindex = netif::iface_index(name)?;
        info!("added interface {} as a control port", name);
        control.push(ControlPort::new(name.clone(), ifindex, mac));
    }

    let mut compute = None;
    let mut my_vid = String::new();
    if cfg.is_leaf {
        let (name, addr) = discovered
            .compute
            .context("leaf node has no live compute interface")?;
        let mac = netif::iface_mac(&name)?;
        let ifindex = netif::iface_index(&name)?;
        my_vid = netif::root_vid(addr, DEFAULT_VID_OCTET);
        info!("interface {} ({}) is the compute port", name, addr);
        compute = Some(ComputePort::new(name, ifindex, mac));
    }

    info!("=== MTP start-up config ===");
    info!(
        "tier = {}, isTopSpine = {}, isLeaf = {}, computeIntf = {}",
        cfg.tier,
        cfg.is_top_spine,
        cfg.is_leaf,
        compute.as_ref().map_or("None", |c| c.name.as_str()),
    );
    info!("root VID: {}", if my_vid.is_empty() { "None" } else { &my_vid });

    let mtp_fd = open_packet_socket(ETH_MTP_CTRL).context("failed to open MTP receive socket")?;
    let ip_fd = if cfg.is_leaf {
        Some(open_packet_socket(ETH_IP_CTRL).context("failed to open IPv4 receive socket")?)
    } else {
        None
    };
    let send_fd = open_packet_socket(0).context("failed to open send socket")?;

    let epfd = epoll_create()?;
    epoll_add(epfd, mtp_fd, libc::EPOLLIN as u32)?;
    if let Some(fd) = ip_fd {
        epoll_add(epfd, fd, libc::EPOLLIN as u32)?;
    }

    let compute_ifindex = compute.as_ref().map(|c| c.ifindex);
    let is_leaf = cfg.is_leaf;
    let mut sw = Switch::new(
        node_name.to_string(),
        cfg,
        my_vid,
        DEFAULT_VID_OCTET,
        SwitchTables::new(control),
        compute,
    );
    let mut sink = RawSink::new(send_fd);

    if is_leaf {
        // wait for the rest of the fabric to come up, then announce
        thread::sleep(STARTUP_SETTLE);
        sw.start_hello_wave(&mut sink);
    } else if sw.cfg.is_top_spine {
        info!("top-tier spine, waiting for hello messages");
    } else {
        info!("spine, waiting for hello messages");
    }

    let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 8];
    let mut buf = vec![0u8; MAX_BUFFER_SIZE];

    while !SHUTDOWN.load(Ordering::Relaxed) {
        epoll_wait(epfd, &mut events, EPOLL_TICK_MS)?;
        let now = unix_now_ms();

        while let Some((len, ifindex, outgoing)) = recv_frame(mtp_fd, &mut buf) {
            if outgoing || len <= ETH_HDR_LEN {
                continue;
            }
            let Some(port) = sw.tables.port_by_ifindex(ifindex) else {
                debug!("MTP frame on unknown ifindex {}, dropped", ifindex);
                continue;
            };
            sw.handle_frame(port, &buf[ETH_HDR_LEN..len], now, &mut sink);
        }

        if let (Some(fd), Some(compute_ifindex)) = (ip_fd, compute_ifindex) {
            while let Some((len, ifindex, outgoing)) = recv_frame(fd, &mut buf) {
                if outgoing || len <= ETH_HDR_LEN {
                    continue;
                }
                if ifindex != compute_ifindex {
                    debug!("IPv4 frame on non-compute ifindex {}, dropped", ifindex);
                    continue;
                }
                sw.handle_compute_frame(&buf[ETH_HDR_LEN..len], now, &mut sink);
            }
        }

        let live = netif::live_control_ports(&sw.node_name)?;
        sw.tick(unix_now_ms(), &live, &mut sink);
    }

    let stopped = unix_now_ms();
    info!("MTP stopped [{}]", stopped);
    if let Err(err) = std::fs::write("node_down.log", format!("{stopped}\n")) {
        warn!("stop time could not be written to node_down.log: {err}");
    }
    Ok(())
}

fn init_tracing(log_path: &Path) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("failed to open log file {}", log_path.display()))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Arc::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

fn install_signal_handlers() -> Result<()> {
    for sig in [libc::SIGHUP, libc::SIGINT, libc::SIGTERM] {
        let prev = unsafe { libc::signal(sig, handle_signal as *const () as libc::sighandler_t) };
        if prev == libc::SIG_ERR {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("failed to install handler for signal {sig}"));
        }
    }
    Ok(())
}

fn unix_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Open a raw AF_PACKET socket bound to `ethertype` (0 for the send-only
/// socket).
fn open_packet_socket(ethertype: u16) -> Result<RawFd> {
    let fd =
        unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, ethertype.to_be() as libc::c_int) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(fd)
}

/// Non-blocking receive. Returns the frame length, ingress ifindex, and
/// whether the kernel flagged the frame as our own transmission. `None`
/// when the socket is drained (transient errors are logged and swallowed).
fn recv_frame(fd: RawFd, buf: &mut [u8]) -> Option<(usize, u32, bool)> {
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            libc::MSG_DONTWAIT,
            &mut addr as *mut libc::sockaddr_ll as *mut libc::sockaddr,
            &mut addr_len,
        )
    };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            warn!("recvfrom failed: {err}");
        }
        return None;
    }
    Some((
        n as usize,
        addr.sll_ifindex as u32,
        addr.sll_pkttype == libc::PACKET_OUTGOING,
    ))
}

/// Production frame sink: stamps the port's prebuilt Ethernet header in
/// front of the payload and writes the frame through the shared send
/// socket.
struct RawSink {
    fd: RawFd,
    frame: Box<[u8; MAX_BUFFER_SIZE]>,
}

impl RawSink {
    fn new(fd: RawFd) -> Self {
        RawSink { fd, frame: Box::new([0u8; MAX_BUFFER_SIZE]) }
    }

    fn send_raw(
        &mut self,
        ifindex: u32,
        header: &[u8; ETH_HDR_LEN],
        payload: &[u8],
    ) -> io::Result<()> {
        let total = ETH_HDR_LEN + payload.len();
        if total > MAX_BUFFER_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
        }
        self.frame[..ETH_HDR_LEN].copy_from_slice(header);
        self.frame[ETH_HDR_LEN..total].copy_from_slice(payload);

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_ifindex = ifindex as i32;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&[0xFF; 6]);

        let ret = unsafe {
            libc::sendto(
                self.fd,
                self.frame.as_ptr().cast(),
                total,
                libc::MSG_NOSIGNAL,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            debug!("send on ifindex {} failed: {}", ifindex, err);
            return Err(err);
        }
        Ok(())
    }
}

impl FrameSink for RawSink {
    fn send(&mut self, port: &ControlPort, payload: &[u8]) -> io::Result<()> {
        self.send_raw(port.ifindex, &port.header, payload)
    }

    fn send_compute(&mut self, port: &ComputePort, payload: &[u8]) -> io::Result<()> {
        self.send_raw(port.ifindex, &port.header, payload)
    }
}

fn epoll_create() -> Result<RawFd> {
    let fd = unsafe { libc::epoll_create1(0) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(fd)
}

fn epoll_add(epfd: RawFd, fd: RawFd, events: u32) -> Result<()> {
    let mut event = libc::epoll_event { events, u64: fd as u64 };
    let ret = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut event) };
    if ret < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

fn epoll_wait(epfd: RawFd, events: &mut [libc::epoll_event], timeout_ms: i32) -> Result<usize> {
    let n = unsafe { libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as i32, timeout_ms) };
    if n < 0 {
        let err = io::Error::last_os_error();
        // interrupted by a shutdown signal; the loop re-checks the flag
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err.into());
    }
    Ok(n as usize)
}
