use anyhow::{Result, anyhow};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::IpAddr;
use std::os::fd::AsFd;
use std::time::Duration;

use crate::probe::interface::{InterfaceInfo, bind_socket_to_interface};

/// How long a blocking read waits before the listener rechecks cancellation
pub const CAPTURE_READ_TIMEOUT: Duration = Duration::from_millis(100);

const CAPTURE_RECV_BUFFER: usize = 1024 * 1024;
const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
/// TCP timestamp option as Linux lays it out (NOP, NOP, kind 8)
const TCP_TIMESTAMP_OPTION_LEN: usize = 12;

/// Raw ICMPv4 socket that receives every ICMP datagram on one interface
///
/// Opened once at startup and read only by the response listener.
#[derive(Debug)]
pub struct CaptureSocket {
    socket: Socket,
}

impl CaptureSocket {
    pub fn open(interface: &InterfaceInfo) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).map_err(|e| {
            anyhow!(
                "Insufficient permissions for raw ICMP capture: {}.\n\n\
                 Fix: run as root, or grant the capability once:\n  \
                 sudo setcap cap_net_raw+ep $(which zerotrace)",
                e
            )
        })?;

        if let Err(e) = socket.set_recv_buffer_size(CAPTURE_RECV_BUFFER) {
            tracing::warn!("Could not set capture receive buffer to 1MB: {}", e);
        }
        socket.set_read_timeout(Some(CAPTURE_READ_TIMEOUT))?;
        bind_socket_to_interface(&socket, interface)?;

        Ok(Self { socket })
    }

    /// Receive one IPv4 datagram (header included) and its source address
    ///
    /// Times out with `WouldBlock`/`TimedOut` after [`CAPTURE_READ_TIMEOUT`].
    #[cfg(unix)]
    pub fn recv(&self, buffer: &mut [u8]) -> io::Result<(usize, IpAddr)> {
        use std::os::fd::AsRawFd;

        let mut src_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut src_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let len = unsafe {
            libc::recvfrom(
                self.socket.as_raw_fd(),
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                0,
                &mut src_storage as *mut _ as *mut libc::sockaddr,
                &mut src_len,
            )
        };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }

        let source = parse_sockaddr_storage(&src_storage)?;
        Ok((len as usize, source))
    }
}

/// Parse sockaddr_storage to IpAddr
#[cfg(unix)]
fn parse_sockaddr_storage(storage: &libc::sockaddr_storage) -> io::Result<IpAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = unsafe { &*(storage as *const _ as *const _) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Ok(IpAddr::V4(ip))
        }
        libc::AF_INET6 => {
            let addr: &libc::sockaddr_in6 = unsafe { &*(storage as *const _ as *const _) };
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Ok(IpAddr::V6(ip))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Unknown address family: {}", family),
        )),
    }
}

/// Set the IPv4 TTL of outgoing segments on a connected socket
pub fn set_ttl<S: AsFd>(socket: &S, ttl: u32) -> io::Result<()> {
    SockRef::from(socket).set_ttl(ttl)
}

/// Current IPv4 TTL of a connected socket
pub fn ttl<S: AsFd>(socket: &S) -> io::Result<u32> {
    SockRef::from(socket).ttl()
}

/// Subset of TCP_INFO the sender relies on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpInfo {
    /// Total segments retransmitted over the connection's lifetime
    pub total_retrans: u32,
    /// Segments sent and not yet acknowledged
    pub unacked: u32,
    /// Timestamp option negotiated (adds 12 bytes to every segment)
    pub timestamps: bool,
}

impl TcpInfo {
    /// IPv4 + TCP header bytes in front of every data segment
    pub fn segment_overhead(&self) -> usize {
        let options = if self.timestamps {
            TCP_TIMESTAMP_OPTION_LEN
        } else {
            0
        };
        IPV4_HEADER_LEN + TCP_HEADER_LEN + options
    }
}

#[cfg(target_os = "linux")]
pub fn tcp_info<S: AsFd>(socket: &S) -> io::Result<TcpInfo> {
    use std::os::fd::AsRawFd;

    // tcp_info.tcpi_options bit, not exported by libc
    const TCPI_OPT_TIMESTAMPS: u8 = 1;

    let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            socket.as_fd().as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(TcpInfo {
        total_retrans: info.tcpi_total_retrans,
        unacked: info.tcpi_unacked,
        timestamps: info.tcpi_options & TCPI_OPT_TIMESTAMPS != 0,
    })
}

/// Without TCP_INFO assume timestamps (the common default) and no retransmits
#[cfg(not(target_os = "linux"))]
pub fn tcp_info<S: AsFd>(_socket: &S) -> io::Result<TcpInfo> {
    Ok(TcpInfo {
        total_retrans: 0,
        unacked: 0,
        timestamps: true,
    })
}
