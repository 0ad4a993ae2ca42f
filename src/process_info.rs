//! Best-effort local peer process lookup, grounded on
//! `original_source/proxy/utils.go`'s `getClientProcessInfo` /
//! `getMacLinuxProcessInfo`. Shells out to `lsof` to map a loopback
//! client's port back to a PID and executable name; any failure is
//! swallowed by the caller (this is a nice-to-have, never load-bearing).

use std::net::IpAddr;
use std::process::Stdio;

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub application: String,
}

pub fn is_loopback(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Looks up the local process bound to `client_port`, skipping our own
/// PID (an outbound connection through the proxy to itself would
/// otherwise match). Only meaningful for loopback peers; callers should
/// check `is_loopback` first.
pub async fn lookup(client_port: u16, own_pid: u32) -> Option<ProcessInfo> {
    let output = tokio::process::Command::new("lsof")
        .args(["-i", &format!(":{client_port}"), "-F", "pc"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_lsof_output(&String::from_utf8_lossy(&output.stdout), own_pid)
}

/// `lsof -F pc` prints alternating `p<pid>` and `c<command>` lines, one
/// process block per match. We take the first block whose pid isn't ours.
fn parse_lsof_output(output: &str, own_pid: u32) -> Option<ProcessInfo> {
    let mut current_pid: Option<u32> = None;
    for line in output.lines() {
        if let Some(pid_str) = line.strip_prefix('p') {
            current_pid = pid_str.parse().ok();
        } else if let Some(command) = line.strip_prefix('c') {
            if let Some(pid) = current_pid {
                if pid != own_pid {
                    return Some(ProcessInfo {
                        pid,
                        application: command.to_string(),
                    });
                }
            }
        }
    }
    None
}

/// Learns this process's own LAN-facing IP by dialing a well-known
/// external address, mirroring `main.go`'s startup discovery of
/// `myLocalIP`. Used only to recognize traffic the proxy itself
/// originates as loopback-equivalent; never used for routing.
pub async fn discover_local_ip() -> Option<IpAddr> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("1.1.1.1:443").await.ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
