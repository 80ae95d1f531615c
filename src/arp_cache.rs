//! IPv4 -> MAC resolution cache with background aging and refresh.
//!
//! Grounded on the stack's original `ArpCache`: a plain map behind a mutex,
//! scanned once a second by a dedicated thread, the same shape the
//! teacher's thread-based `net::arp` module uses for its `Arc<Mutex<HashMap<..>>>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;

use log::debug;

use crate::config::Config;
use crate::time::Instant;
use crate::wire::{EthernetAddress, Ipv4Address};

#[derive(Debug, Clone, Copy)]
pub struct ArpEntry {
    pub mac: EthernetAddress,
    pub created_at: Instant,
    pub hits: u32,
}

/// Emits an ARP request for `ip`, either to refresh an aging entry or to
/// resolve a miss. Implemented by `PacketHandler`; the cache itself has no
/// notion of frames or rings.
pub trait ArpRequester: Send + Sync {
    fn send_request(&self, ip: Ipv4Address);
}

struct Inner {
    entries: HashMap<Ipv4Address, ArpEntry>,
}

pub struct ArpCache {
    config: Arc<Config>,
    inner: Mutex<Inner>,
    requester: Mutex<Option<Arc<dyn ArpRequester>>>,
    running: AtomicBool,
}

impl ArpCache {
    pub fn new(config: Arc<Config>) -> Arc<ArpCache> {
        Arc::new(ArpCache {
            config,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
            }),
            requester: Mutex::new(None),
            running: AtomicBool::new(true),
        })
    }

    /// Bind the component that can actually transmit ARP requests. Lookup
    /// misses and aging-driven refreshes no-op until this is set.
    pub fn bind_requester(&self, requester: Arc<dyn ArpRequester>) {
        *self.requester.lock().unwrap_or_else(|e| e.into_inner()) = Some(requester);
    }

    /// Insert or refresh a mapping. Idempotent on `(ip, mac)`: repeated
    /// calls collapse to one entry with a fresh `created_at` and `hits`
    /// reset to zero.
    pub fn add_entry(&self, ip: Ipv4Address, mac: EthernetAddress) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.insert(
            ip,
            ArpEntry {
                mac,
                created_at: Instant::now(),
                hits: 0,
            },
        );
    }

    /// Look up a mapping, incrementing its hit counter. On a miss, emits an
    /// ARP request (if a requester is bound) and returns `None`.
    pub fn find(&self, ip: Ipv4Address) -> Option<EthernetAddress> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.entries.get_mut(&ip) {
            entry.hits += 1;
            return Some(entry.mac);
        }
        drop(inner);
        if let Some(requester) = self.requester.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            requester.send_request(ip);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One sweep of the aging/refresh pass: age out expired entries, and
    /// emit a refresh request for entries past the pre-expiry window that
    /// have been used since they were created or last refreshed.
    fn sweep(&self) {
        let max_age = StdDuration::from_secs(self.config.arp_entry_max_age_secs);
        let refresh_window = StdDuration::from_secs(self.config.arp_entry_refresh_time_secs);
        let now = Instant::now();

        let mut to_refresh = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.entries.retain(|ip, entry| {
                let age = now.saturating_duration_since(entry.created_at).as_std();
                if age > max_age {
                    debug!("arp cache: entry for {ip} aged out");
                    return false;
                }
                if age > max_age.saturating_sub(refresh_window) && entry.hits > 0 {
                    entry.hits = 0;
                    to_refresh.push(*ip);
                }
                true
            });
        }

        if let Some(requester) = self.requester.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            for ip in to_refresh {
                requester.send_request(ip);
            }
        }
    }

    /// Spawn the 1 Hz aging/refresh thread. Call once per process.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        thread::spawn(move || {
            while cache.running.load(Ordering::Relaxed) {
                cache.sweep();
                thread::sleep(StdDuration::from_secs(1));
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(b: u8) -> EthernetAddress {
        EthernetAddress::new([0x02, 0, 0, 0, 0, b])
    }

    #[test]
    fn add_entry_is_idempotent_and_resets_hits() {
        let cache = ArpCache::new(Arc::new(Config::default()));
        let ip = Ipv4Address::new([10, 0, 0, 1]);
        cache.add_entry(ip, mac(1));
        cache.find(ip);
        cache.find(ip);
        assert_eq!(cache.len(), 1);

        cache.add_entry(ip, mac(1));
        let inner = cache.inner.lock().unwrap();
        assert_eq!(inner.entries[&ip].hits, 0);
    }

    #[test]
    fn find_increments_hits_on_present_entry() {
        let cache = ArpCache::new(Arc::new(Config::default()));
        let ip = Ipv4Address::new([10, 0, 0, 2]);
        cache.add_entry(ip, mac(2));
        cache.find(ip);
        cache.find(ip);
        let inner = cache.inner.lock().unwrap();
        assert_eq!(inner.entries[&ip].hits, 2);
    }

    #[test]
    fn find_on_miss_returns_none() {
        let cache = ArpCache::new(Arc::new(Config::default()));
        assert!(cache.find(Ipv4Address::new([10, 0, 0, 9])).is_none());
    }

    struct RecordingRequester {
        requests: Mutex<Vec<Ipv4Address>>,
    }

    impl ArpRequester for RecordingRequester {
        fn send_request(&self, ip: Ipv4Address) {
            self.requests.lock().unwrap().push(ip);
        }
    }

    #[test]
    fn miss_triggers_arp_request() {
        let cache = ArpCache::new(Arc::new(Config::default()));
        let requester = Arc::new(RecordingRequester {
            requests: Mutex::new(Vec::new()),
        });
        cache.bind_requester(requester.clone());
        let ip = Ipv4Address::new([10, 0, 0, 3]);
        assert!(cache.find(ip).is_none());
        assert_eq!(requester.requests.lock().unwrap().as_slice(), &[ip]);
    }

    #[test]
    fn sweep_ages_out_expired_entries() {
        let mut config = Config::default();
        config.arp_entry_max_age_secs = 0;
        let cache = ArpCache::new(Arc::new(config));
        let ip = Ipv4Address::new([10, 0, 0, 4]);
        cache.add_entry(ip, mac(4));
        std::thread::sleep(StdDuration::from_millis(5));
        cache.sweep();
        assert!(cache.is_empty());
    }
}
