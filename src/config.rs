//! Stack-wide tunables.
//!
//! A single `Config` is built once at bring-up and shared read-only
//! (`Arc<Config>`) by every component; nothing mutates it after construction.

/// Stack-wide tunables enumerated in the design spec, with their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// ARP cache entry lifetime ceiling, in seconds.
    pub arp_entry_max_age_secs: u64,
    /// Pre-expiry window during which a used entry triggers a refresh
    /// request, in seconds.
    pub arp_entry_refresh_time_secs: u64,
    /// Learn a mapping from an ARP request directly targeting our IP.
    pub learn_from_direct_request: bool,
    /// Learn a mapping from a gratuitous ARP reply (`spa == tpa`).
    pub learn_from_gratuitous_reply: bool,

    /// Delayed-ACK coalescing interval, in milliseconds.
    pub delayed_ack_delay_ms: i64,
    /// TIME_WAIT duration (our stand-in for 2*MSL), in milliseconds.
    pub time_wait_delay_ms: i64,
    /// Initial SYN / SYN+ACK retransmit delay, in milliseconds; doubles on
    /// each retry.
    pub packet_resend_delay_ms: i64,
    /// Number of handshake retransmits attempted before giving up.
    pub packet_resend_count: u8,
    /// Honor the peer's advertised window; if false, the sender collapses
    /// to sending one MSS-sized segment at a time.
    pub use_remote_win: bool,

    /// Window we advertise to peers.
    pub local_tcp_win: u16,
    /// MSS we advertise to peers.
    pub local_tcp_mss: u16,
    /// Link MTU, used to clamp the peer's advertised MSS
    /// (`mtu - 80`: IPv4 + TCP headers plus a safety margin for an
    /// Ethernet-medium link; a different link layer would need a different
    /// constant here).
    pub mtu: u16,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            arp_entry_max_age_secs: 60,
            arp_entry_refresh_time_secs: 10,
            learn_from_direct_request: true,
            learn_from_gratuitous_reply: true,

            delayed_ack_delay_ms: 200,
            time_wait_delay_ms: 15_000,
            packet_resend_delay_ms: 1_000,
            packet_resend_count: 4,
            use_remote_win: true,

            local_tcp_win: 65535,
            local_tcp_mss: 1460,
            mtu: 1500,
        }
    }
}

impl Config {
    pub fn clamp_peer_mss(&self, peer_mss: u16) -> usize {
        let link_ceiling = self.mtu.saturating_sub(80);
        peer_mss.min(link_ceiling).max(1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.arp_entry_max_age_secs, 60);
        assert_eq!(cfg.delayed_ack_delay_ms, 200);
        assert_eq!(cfg.time_wait_delay_ms, 15_000);
        assert_eq!(cfg.packet_resend_count, 4);
        assert!(cfg.use_remote_win);
    }

    #[test]
    fn clamp_peer_mss_respects_link_ceiling() {
        let cfg = Config::default();
        assert_eq!(cfg.clamp_peer_mss(9000), 1420);
        assert_eq!(cfg.clamp_peer_mss(500), 500);
    }
}
