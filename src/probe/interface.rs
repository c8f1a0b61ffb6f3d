//! Network interface validation and capture-socket binding
//!
//! The capture socket is pinned to the interface traced connections arrive
//! on, so ICMP errors from other uplinks never reach the listener.
//! - Linux: SO_BINDTODEVICE via socket2::bind_device()
//! - macOS: IP_BOUND_IF via socket2::bind_device_by_index_v4()

use anyhow::{Result, anyhow};
use pnet::datalink;
use socket2::Socket;
use std::net::{IpAddr, Ipv4Addr};

/// Validated interface information
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    /// Interface name (e.g., "eth0")
    pub name: String,
    /// Interface index (used for macOS binding)
    pub index: u32,
    /// First IPv4 address on the interface
    pub ipv4: Ipv4Addr,
}

/// Validate that an interface exists and carries an IPv4 address
pub fn validate_interface(name: &str) -> Result<InterfaceInfo> {
    let interfaces = datalink::interfaces();

    if let Some(iface) = interfaces.iter().find(|i| i.name == name) {
        // Prefer a routable address, fall back to loopback on lo
        let ipv4 = iface
            .ips
            .iter()
            .filter_map(|net| match net.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .min_by_key(|v4| v4.is_loopback());

        return match ipv4 {
            Some(ipv4) => Ok(InterfaceInfo {
                name: name.to_string(),
                index: iface.index,
                ipv4,
            }),
            None => Err(anyhow!(
                "Interface '{}' has no IPv4 address. Tracing requires IPv4.",
                name
            )),
        };
    }

    let available: Vec<_> = interfaces
        .iter()
        .filter(|i| !i.ips.is_empty())
        .map(|i| i.name.clone())
        .collect();

    Err(anyhow!(
        "Interface '{}' not found. Available interfaces: {}",
        name,
        if available.is_empty() {
            "(none with IP addresses)".to_string()
        } else {
            available.join(", ")
        }
    ))
}

/// Bind a socket to a specific network interface
///
/// On Linux this requires CAP_NET_RAW or root.
pub fn bind_socket_to_interface(socket: &Socket, info: &InterfaceInfo) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        socket.bind_device(Some(info.name.as_bytes())).map_err(|e| {
            anyhow!(
                "Failed to bind socket to interface '{}': {}. \
                 This requires CAP_NET_RAW capability or root privileges.",
                info.name,
                e
            )
        })
    }

    #[cfg(target_os = "macos")]
    {
        use std::num::NonZeroU32;
        socket
            .bind_device_by_index_v4(NonZeroU32::new(info.index))
            .map_err(|e| {
                anyhow!(
                    "Failed to bind socket to interface '{}' (index {}): {}",
                    info.name,
                    info.index,
                    e
                )
            })
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = (socket, info);
        Err(anyhow!(
            "Interface binding is not supported on this platform. \
             It is only available on Linux and macOS."
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_nonexistent_interface() {
        let result = validate_interface("nonexistent_interface_12345");
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("not found"));
        assert!(err.contains("Available interfaces"));
    }

    #[test]
    fn test_validate_loopback_interface() {
        // Loopback exists on every host we run on, with 127.0.0.1
        #[cfg(target_os = "linux")]
        let name = "lo";
        #[cfg(not(target_os = "linux"))]
        let name = "lo0";

        if let Ok(info) = validate_interface(name) {
            assert_eq!(info.name, name);
            assert!(info.ipv4.is_loopback());
        }
    }
}
