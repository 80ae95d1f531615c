//! Bring up the stack on a tap interface so the host can `ping` it, and
//! exercise the blocking TCP API with a one-shot echo listener on port 7.
//!
//! `cargo run --example ping -- --tap tap0 --ip 192.168.69.1`

use std::sync::Arc;
use std::thread;

use getopts::Options;
use tundra_stack::handler::PacketHandler;
use tundra_stack::phy::TunTapDevice;
use tundra_stack::wire::{EthernetAddress, Ipv4Address};
use tundra_stack::{Config, Stack};

fn parse_mac(s: &str) -> EthernetAddress {
    let mut bytes = [0u8; 6];
    for (i, part) in s.split(':').enumerate().take(6) {
        bytes[i] = u8::from_str_radix(part, 16).expect("malformed --mac");
    }
    EthernetAddress::new(bytes)
}

fn parse_ipv4(s: &str) -> Ipv4Address {
    let mut bytes = [0u8; 4];
    for (i, part) in s.split('.').enumerate().take(4) {
        bytes[i] = part.parse().expect("malformed --ip");
    }
    Ipv4Address::new(bytes)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let mut opts = Options::new();
    opts.optopt("", "tap", "tap interface name", "NAME");
    opts.optopt("", "ip", "local IPv4 address", "ADDR");
    opts.optopt("", "mac", "local Ethernet address", "MAC");
    let matches = opts.parse(&args[1..]).expect("failed to parse arguments");

    let tap_name = matches.opt_str("tap").unwrap_or_else(|| "tap0".into());
    let ip = parse_ipv4(&matches.opt_str("ip").unwrap_or_else(|| "192.168.69.1".into()));
    let mac = parse_mac(&matches.opt_str("mac").unwrap_or_else(|| "02:00:00:00:00:01".into()));

    let device = Arc::new(TunTapDevice::open(&tap_name).expect("failed to open tap device"));
    let stack = Stack::new(mac, ip, Config::default());
    let handler = PacketHandler::new(Arc::clone(&stack));

    let (rx_pump, tx_pump) = device.spawn_pumps(Arc::clone(&stack.rx_ring), Arc::clone(&stack.tx_ring));
    stack.timer.spawn();
    stack.arp_cache.spawn();
    stack.tcp_sessions.spawn_reaper();
    handler.spawn_rx();

    println!("claiming {ip} on {tap_name}...");
    handler.claim_address();
    if stack.ip_address_claimed() {
        println!("{ip} claimed, reachable via ping and tcp:7 (echo)");
    } else {
        eprintln!("address conflict detected for {ip}, continuing unclaimed");
    }

    let echo_handler = Arc::clone(&handler);
    thread::spawn(move || {
        let _listener = echo_handler.tcp_listen(7);
        loop {
            let conn = echo_handler.tcp_accept(7);
            while let Some(chunk) = conn.receive(None) {
                conn.send(&chunk);
            }
            conn.close();
        }
    });

    rx_pump.join().ok();
    tx_pump.join().ok();
}
