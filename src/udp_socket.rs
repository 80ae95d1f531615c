//! Minimal UDP socket: a registered port and an inbound datagram queue.
//! `udp_in` demultiplexes solely by destination port, no wildcard-source
//! filtering, matching the thin-demultiplexer design.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::wire::Ipv4Address;

#[derive(Debug, Clone)]
pub struct Datagram {
    pub src_addr: Ipv4Address,
    pub src_port: u16,
    pub payload: Vec<u8>,
}

struct State {
    inbound: VecDeque<Datagram>,
}

/// A UDP socket bound to a local port. `recv` blocks for the next datagram;
/// `send` hands a built datagram to its owner for encoding and transmission
/// (the socket itself has no reference to a tx ring).
pub struct UdpSocket {
    pub local_port: u16,
    state: Mutex<State>,
    readable: Condvar,
}

impl UdpSocket {
    pub fn new(local_port: u16) -> UdpSocket {
        UdpSocket {
            local_port,
            state: Mutex::new(State {
                inbound: VecDeque::new(),
            }),
            readable: Condvar::new(),
        }
    }

    /// Called by `udp_in` when a datagram addressed to this port arrives.
    pub fn deliver(&self, datagram: Datagram) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.inbound.push_back(datagram);
        self.readable.notify_one();
    }

    /// Block until a datagram is available.
    pub fn recv(&self) -> Datagram {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(datagram) = state.inbound.pop_front() {
                return datagram;
            }
            state = self
                .readable
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn try_recv(&self) -> Option<Datagram> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .inbound
            .pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn try_recv_empty_is_none() {
        let socket = UdpSocket::new(53);
        assert!(socket.try_recv().is_none());
    }

    #[test]
    fn deliver_then_recv_returns_datagram() {
        let socket = UdpSocket::new(53);
        socket.deliver(Datagram {
            src_addr: Ipv4Address::new([10, 0, 0, 1]),
            src_port: 9000,
            payload: vec![1, 2, 3],
        });
        let datagram = socket.recv();
        assert_eq!(datagram.payload, vec![1, 2, 3]);
    }

    #[test]
    fn recv_blocks_until_delivery() {
        let socket = Arc::new(UdpSocket::new(53));
        let reader = {
            let socket = Arc::clone(&socket);
            thread::spawn(move || socket.recv())
        };
        thread::sleep(Duration::from_millis(20));
        socket.deliver(Datagram {
            src_addr: Ipv4Address::new([10, 0, 0, 2]),
            src_port: 1,
            payload: vec![9],
        });
        assert_eq!(reader.join().unwrap().payload, vec![9]);
    }
}
