//! Per-flow TCP session state machine, buffers, and session table.
//!
//! `session` holds the RFC 793 FSM and the blocking user API; `table` keys
//! sessions by 4-tuple plus a `(local_ip, local_port, 0, 0)` listening
//! wildcard, grounded on the stack's `tcp_sessions` dict keyed by a string
//! session id.

mod session;
mod table;

pub use session::{InboundSegment, Syscall, TcpSession, TcpTransmitter};
pub use table::TcpSessionTable;

use crate::wire::Ipv4Address;

/// The TCP session key: `(local_ip, local_port, remote_ip, remote_port)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub local_ip: Ipv4Address,
    pub local_port: u16,
    pub remote_ip: Ipv4Address,
    pub remote_port: u16,
}

impl std::fmt::Display for FourTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "tcp:{}:{}-{}:{}",
            self.local_ip, self.local_port, self.remote_ip, self.remote_port
        )
    }
}

/// The eleven RFC 793 states. `Closed` is the initial and terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    CloseWait,
    LastAck,
    TimeWait,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            State::Closed => "CLOSED",
            State::Listen => "LISTEN",
            State::SynSent => "SYN_SENT",
            State::SynRcvd => "SYN_RCVD",
            State::Established => "ESTABLISHED",
            State::FinWait1 => "FIN_WAIT_1",
            State::FinWait2 => "FIN_WAIT_2",
            State::Closing => "CLOSING",
            State::CloseWait => "CLOSE_WAIT",
            State::LastAck => "LAST_ACK",
            State::TimeWait => "TIME_WAIT",
        };
        write!(f, "{name}")
    }
}
