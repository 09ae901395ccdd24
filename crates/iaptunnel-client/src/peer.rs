//! Local peer identification
//!
//! Attributes an accepted loopback connection to the process and user that
//! opened it. On Linux this reads the kernel socket tables under `/proc/net`
//! and maps the socket inode back to a process through `/proc/<pid>/fd`.
//! Anything that cannot be determined is left as `None`.

use async_trait::async_trait;
use std::fmt::Debug;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, trace};

/// A local caller of a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPeer {
    /// Address the caller connected from
    pub addr: SocketAddr,

    /// Process that owns the caller's socket
    pub pid: Option<u32>,

    /// User that owns the caller's socket
    pub uid: Option<u32>,
}

impl LocalPeer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            pid: None,
            uid: None,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn is_loopback(&self) -> bool {
        canonical(self.addr).ip().is_loopback()
    }
}

/// Errors parsing kernel socket table entries
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerParseError {
    #[error("Malformed socket table line: {0}")]
    MalformedLine(String),

    #[error("Invalid socket address '{0}'")]
    InvalidAddress(String),
}

/// Resolves the identity of a local caller
#[async_trait]
pub trait PeerResolver: Send + Sync + Debug {
    /// Identify the caller connected from `peer` to our listener at `local`
    async fn resolve(&self, peer: SocketAddr, local: SocketAddr) -> LocalPeer;
}

/// Resolver backed by procfs
#[derive(Debug, Clone)]
pub struct ProcfsPeerResolver {
    root: PathBuf,
}

impl Default for ProcfsPeerResolver {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl ProcfsPeerResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read socket tables and process entries below `root` instead of `/proc`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Synchronous resolution; performs blocking filesystem reads
    pub fn resolve_blocking(&self, peer: SocketAddr, local: SocketAddr) -> LocalPeer {
        let mut resolved = LocalPeer::new(peer);

        let Some(entry) = self.find_socket(peer, local) else {
            debug!("No socket table entry for local peer {}", peer);
            return resolved;
        };

        resolved.uid = Some(entry.uid);
        resolved.pid = self.find_owner(entry.inode);

        trace!(
            "Resolved local peer {} to pid {:?} uid {:?}",
            peer,
            resolved.pid,
            resolved.uid
        );
        resolved
    }

    /// The caller's socket: its local end is `peer`, its remote end our listener
    fn find_socket(&self, peer: SocketAddr, local: SocketAddr) -> Option<SocketEntry> {
        let peer = canonical(peer);
        let local = canonical(local);

        for table in ["net/tcp", "net/tcp6"] {
            let Ok(contents) = std::fs::read_to_string(self.root.join(table)) else {
                continue;
            };

            // First line is the column header
            for line in contents.lines().skip(1) {
                match parse_socket_line(line) {
                    Ok(entry) if canonical(entry.local) == peer && canonical(entry.remote) == local => {
                        return Some(entry);
                    }
                    Ok(_) => {}
                    Err(e) => trace!("Skipping socket table line: {}", e),
                }
            }
        }

        None
    }

    fn find_owner(&self, inode: u64) -> Option<u32> {
        if inode == 0 {
            return None;
        }

        let target = format!("socket:[{}]", inode);

        let own = std::process::id();
        if self.process_owns(own, &target) {
            return Some(own);
        }

        let entries = std::fs::read_dir(&self.root).ok()?;
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };

            if pid != own && self.process_owns(pid, &target) {
                return Some(pid);
            }
        }

        None
    }

    fn process_owns(&self, pid: u32, target: &str) -> bool {
        let fd_dir = self.root.join(pid.to_string()).join("fd");
        let Ok(fds) = std::fs::read_dir(fd_dir) else {
            return false;
        };

        fds.flatten().any(|fd| {
            std::fs::read_link(fd.path()).is_ok_and(|link| link.to_str() == Some(target))
        })
    }
}

#[async_trait]
impl PeerResolver for ProcfsPeerResolver {
    async fn resolve(&self, peer: SocketAddr, local: SocketAddr) -> LocalPeer {
        let resolver = self.clone();
        tokio::task::spawn_blocking(move || resolver.resolve_blocking(peer, local))
            .await
            .unwrap_or_else(|e| {
                debug!("Peer resolution task failed: {}", e);
                LocalPeer::new(peer)
            })
    }
}

/// User id of this process, if the platform exposes it
pub fn current_uid() -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata("/proc/self").ok().map(|m| m.uid())
    }
    #[cfg(not(unix))]
    {
        None
    }
}

/// One row of `/proc/net/tcp` or `/proc/net/tcp6`
#[derive(Debug, Clone, PartialEq, Eq)]
struct SocketEntry {
    local: SocketAddr,
    remote: SocketAddr,
    uid: u32,
    inode: u64,
}

// sl local_address rem_address st tx_queue:rx_queue tr:tm->when retrnsmt uid timeout inode ...
fn parse_socket_line(line: &str) -> Result<SocketEntry, PeerParseError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return Err(PeerParseError::MalformedLine(line.trim().to_string()));
    }

    let malformed = || PeerParseError::MalformedLine(line.trim().to_string());

    Ok(SocketEntry {
        local: parse_hex_endpoint(fields[1])?,
        remote: parse_hex_endpoint(fields[2])?,
        uid: fields[7].parse().map_err(|_| malformed())?,
        inode: fields[9].parse().map_err(|_| malformed())?,
    })
}

/// Parse `ADDR:PORT` where each 32-bit address word is printed in host order
fn parse_hex_endpoint(s: &str) -> Result<SocketAddr, PeerParseError> {
    let invalid = || PeerParseError::InvalidAddress(s.to_string());

    let (addr, port) = s.split_once(':').ok_or_else(invalid)?;
    if !addr.is_ascii() {
        return Err(invalid());
    }

    let port = u16::from_str_radix(port, 16).map_err(|_| invalid())?;
    let word = |chunk: &str| u32::from_str_radix(chunk, 16).map_err(|_| invalid());

    let ip = match addr.len() {
        8 => IpAddr::V4(Ipv4Addr::from(word(addr)?.to_ne_bytes())),
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                chunk.copy_from_slice(&word(&addr[i * 8..i * 8 + 8])?.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(invalid()),
    };

    Ok(SocketAddr::new(ip, port))
}

/// Fold IPv4-mapped IPv6 addresses into plain IPv4
fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}
