//! `Stack`: the bundle of shared state threaded through every constructor
//! instead of living in process-wide globals — the stack's mac/ip identity,
//! config, rings, ARP cache, timer, TCP session table, and UDP socket
//! registry, grounded on the Python original's single process-global `Stack`
//! object, adapted into an explicit `Arc<Stack>` handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::arp_cache::ArpCache;
use crate::config::Config;
use crate::ring::Ring;
use crate::tcp::TcpSessionTable;
use crate::timer::StackTimer;
use crate::udp_socket::UdpSocket;
use crate::wire::{EthernetAddress, Ipv4Address};

const RING_CAPACITY: usize = 256;

/// Shared stack context: mac/ip identity plus every subsystem a
/// `PacketHandler` or `TcpSession` needs a handle to.
pub struct Stack {
    pub mac: EthernetAddress,
    pub ip: Ipv4Address,
    pub config: Arc<Config>,
    pub rx_ring: Arc<Ring>,
    pub tx_ring: Arc<Ring>,
    pub arp_cache: Arc<ArpCache>,
    pub timer: Arc<StackTimer>,
    pub tcp_sessions: Arc<TcpSessionTable>,
    udp_sockets: Mutex<HashMap<u16, Arc<UdpSocket>>>,
    pub dropped_frames: AtomicU64,
    claimed: AtomicBool,
}

impl Stack {
    pub fn new(mac: EthernetAddress, ip: Ipv4Address, config: Config) -> Arc<Stack> {
        let config = Arc::new(config);
        Arc::new(Stack {
            mac,
            ip,
            arp_cache: ArpCache::new(Arc::clone(&config)),
            timer: StackTimer::new(),
            tcp_sessions: TcpSessionTable::new(),
            config,
            rx_ring: Arc::new(Ring::new(RING_CAPACITY)),
            tx_ring: Arc::new(Ring::new(RING_CAPACITY)),
            udp_sockets: Mutex::new(HashMap::new()),
            dropped_frames: AtomicU64::new(0),
            claimed: AtomicBool::new(false),
        })
    }

    pub fn ip_address_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub(crate) fn set_ip_address_claimed(&self, claimed: bool) {
        self.claimed.store(claimed, Ordering::Release);
    }

    pub fn record_drop(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Register a UDP socket on `port`, replacing any previous registration.
    pub fn bind_udp(&self, port: u16) -> Arc<UdpSocket> {
        let socket = Arc::new(UdpSocket::new(port));
        self.udp_sockets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(port, Arc::clone(&socket));
        socket
    }

    pub fn udp_socket(&self, port: u16) -> Option<Arc<UdpSocket>> {
        self.udp_sockets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&port)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unclaimed_with_empty_registries() {
        let stack = Stack::new(
            EthernetAddress::new([0x02, 0, 0, 0, 0, 1]),
            Ipv4Address::new([10, 0, 0, 1]),
            Config::default(),
        );
        assert!(!stack.ip_address_claimed());
        assert!(stack.udp_socket(53).is_none());
        assert_eq!(stack.dropped_frames.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn bind_udp_registers_and_replaces() {
        let stack = Stack::new(
            EthernetAddress::new([0x02, 0, 0, 0, 0, 1]),
            Ipv4Address::new([10, 0, 0, 1]),
            Config::default(),
        );
        let first = stack.bind_udp(53);
        assert!(Arc::ptr_eq(&first, &stack.udp_socket(53).unwrap()));
        let second = stack.bind_udp(53);
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
