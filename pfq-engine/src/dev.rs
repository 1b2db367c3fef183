//! Network device abstraction and registry.
//!
//! The engine treats devices as external collaborators behind a narrow
//! transmit contract. Registered devices get a small interface index used
//! by capture bindings and the forwarding log. Each device carries its own
//! transmit lock, held for the duration of one batch so `xmit_more`
//! coalescing stays meaningful.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tracing::info;

use crate::error::{PfqError, Result};

/// Data-plane transmit failure. Never bubbles up as a control error; the
/// Tx paths count it instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxError {
    /// Device is administratively or physically down.
    Down,
    /// Transient congestion; the frame was not queued.
    Busy,
}

/// The transmit contract a backing device implements.
///
/// `xmit_more` signals that more frames of the same batch follow, letting
/// the device defer its doorbell until the last one.
pub trait NetDevice: Send + Sync {
    fn name(&self) -> &str;

    fn mtu(&self) -> usize {
        1500
    }

    fn is_up(&self) -> bool {
        true
    }

    fn xmit(&self, frame: &[u8], hw_queue: i32, xmit_more: bool)
        -> std::result::Result<(), TxError>;
}

// ---------------------------------------------------------------------------
// Device Table
// ---------------------------------------------------------------------------

struct DeviceEntry {
    dev: Arc<dyn NetDevice>,
    tx_lock: Arc<Mutex<()>>,
}

/// Registry of devices, keyed by name and by the assigned ifindex.
/// Indices start at 1; at most 63 devices (capture masks are 64-bit).
pub struct DeviceTable {
    entries: RwLock<Vec<DeviceEntry>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        DeviceTable {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register a device and return its ifindex.
    pub fn register(&self, dev: Arc<dyn NetDevice>) -> Result<i32> {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.dev.name() == dev.name()) {
            return Err(PfqError::AlreadyExists);
        }
        if entries.len() >= 63 {
            return Err(PfqError::NoMemory);
        }
        entries.push(DeviceEntry {
            dev: dev.clone(),
            tx_lock: Arc::new(Mutex::new(())),
        });
        let ifindex = entries.len() as i32;
        info!(device = dev.name(), ifindex, "registered device");
        Ok(ifindex)
    }

    /// Resolve a device name to its ifindex.
    pub fn ifindex(&self, name: &str) -> Result<i32> {
        self.entries
            .read()
            .iter()
            .position(|e| e.dev.name() == name)
            .map(|i| (i + 1) as i32)
            .ok_or_else(|| PfqError::NotFound(name.to_string()))
    }

    pub fn get(&self, ifindex: i32) -> Result<Arc<dyn NetDevice>> {
        usize::try_from(ifindex)
            .ok()
            .filter(|&i| i >= 1)
            .and_then(|i| self.entries.read().get(i - 1).map(|e| e.dev.clone()))
            .ok_or_else(|| PfqError::NotFound(format!("ifindex {}", ifindex)))
    }

    /// Per-device transmit lock, held for one batch.
    pub fn tx_lock(&self, ifindex: i32) -> Result<Arc<Mutex<()>>> {
        usize::try_from(ifindex)
            .ok()
            .filter(|&i| i >= 1)
            .and_then(|i| self.entries.read().get(i - 1).map(|e| e.tx_lock.clone()))
            .ok_or_else(|| PfqError::NotFound(format!("ifindex {}", ifindex)))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        DeviceTable::new()
    }
}

// ---------------------------------------------------------------------------
// UDP Tunnel Device
// ---------------------------------------------------------------------------

/// Device that tunnels frames as UDP datagrams to a fixed peer. The
/// production egress path for environments without raw-socket privileges.
pub struct UdpDevice {
    name: String,
    socket: Socket,
    peer: SocketAddr,
    mtu: usize,
}

impl UdpDevice {
    pub fn open(name: impl Into<String>, peer: SocketAddr, mtu: usize) -> Result<Self> {
        let domain = if peer.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|_| PfqError::NoMemory)?;
        socket
            .set_nonblocking(true)
            .map_err(|_| PfqError::Internal("set_nonblocking failed".into()))?;
        Ok(UdpDevice {
            name: name.into(),
            socket,
            peer,
            mtu,
        })
    }
}

impl NetDevice for UdpDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn xmit(
        &self,
        frame: &[u8],
        _hw_queue: i32,
        _xmit_more: bool,
    ) -> std::result::Result<(), TxError> {
        match self.socket.send_to(frame, &self.peer.into()) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(TxError::Busy),
            Err(_) => Err(TxError::Down),
        }
    }
}

// ---------------------------------------------------------------------------
// In-Memory Device
// ---------------------------------------------------------------------------

/// Device that records transmitted frames in memory. Used as a sink in
/// simulation setups and throughout the test suite; congestion and
/// link-down conditions are scriptable.
pub struct MemDevice {
    name: String,
    up: AtomicBool,
    /// Start failing with `Busy` after this many accepted frames.
    congest_after: AtomicUsize,
    frames: Mutex<Vec<(Vec<u8>, bool)>>,
}

impl MemDevice {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(MemDevice {
            name: name.into(),
            up: AtomicBool::new(true),
            congest_after: AtomicUsize::new(usize::MAX),
            frames: Mutex::new(Vec::new()),
        })
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Release);
    }

    pub fn congest_after(&self, frames: usize) {
        self.congest_after.store(frames, Ordering::Release);
    }

    /// Transmitted frames with their `xmit_more` flags.
    pub fn frames(&self) -> Vec<(Vec<u8>, bool)> {
        self.frames.lock().clone()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }
}

impl NetDevice for MemDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    fn xmit(
        &self,
        frame: &[u8],
        _hw_queue: i32,
        xmit_more: bool,
    ) -> std::result::Result<(), TxError> {
        if !self.is_up() {
            return Err(TxError::Down);
        }
        let mut frames = self.frames.lock();
        if frames.len() >= self.congest_after.load(Ordering::Acquire) {
            return Err(TxError::Busy);
        }
        frames.push((frame.to_vec(), xmit_more));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let table = DeviceTable::new();
        let eth0 = MemDevice::new("eth0");
        let eth1 = MemDevice::new("eth1");

        assert_eq!(table.register(eth0).unwrap(), 1);
        assert_eq!(table.register(eth1).unwrap(), 2);
        assert_eq!(table.ifindex("eth1").unwrap(), 2);
        assert!(matches!(table.ifindex("wat0"), Err(PfqError::NotFound(_))));
        assert_eq!(table.get(2).unwrap().name(), "eth1");
        assert!(table.get(0).is_err());
        assert!(table.get(9).is_err());
    }

    #[test]
    fn duplicate_name_rejected() {
        let table = DeviceTable::new();
        table.register(MemDevice::new("eth0")).unwrap();
        assert_eq!(
            table.register(MemDevice::new("eth0")).unwrap_err(),
            PfqError::AlreadyExists
        );
    }

    #[test]
    fn mem_device_records_flags() {
        let dev = MemDevice::new("sink0");
        dev.xmit(b"a", -1, true).unwrap();
        dev.xmit(b"b", -1, false).unwrap();
        let frames = dev.frames();
        assert_eq!(frames[0], (b"a".to_vec(), true));
        assert_eq!(frames[1], (b"b".to_vec(), false));
    }

    #[test]
    fn mem_device_congestion_and_down() {
        let dev = MemDevice::new("sink0");
        dev.congest_after(1);
        dev.xmit(b"a", -1, false).unwrap();
        assert_eq!(dev.xmit(b"b", -1, false).unwrap_err(), TxError::Busy);

        dev.set_up(false);
        assert_eq!(dev.xmit(b"c", -1, false).unwrap_err(), TxError::Down);
    }
}
