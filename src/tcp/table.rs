//! TCP session table: the stack's single registry of live flows, keyed by
//! 4-tuple plus a `(local_ip, local_port, 0.0.0.0, 0)` listening wildcard,
//! grounded on the stack's `tcp_sessions` dict. A background reaper thread
//! periodically drops entries whose FSM has returned to `Closed` and whose
//! only remaining handle is the table's own `Arc`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration as StdDuration;

use crate::config::Config;
use crate::timer::StackTimer;
use crate::wire::Ipv4Address;

use super::session::TcpTransmitter;
use super::{FourTuple, State, TcpSession};

struct Inner {
    entries: HashMap<FourTuple, Arc<TcpSession>>,
    accept_queues: HashMap<(Ipv4Address, u16), VecDeque<Arc<TcpSession>>>,
}

/// The shared table of active sessions and pending-accept queues. Sessions
/// never remove themselves; only the table's reaper and explicit `listen`
/// teardown mutate the map.
pub struct TcpSessionTable {
    inner: Mutex<Inner>,
    accept_ready: Condvar,
}

impl TcpSessionTable {
    pub fn new() -> Arc<TcpSessionTable> {
        Arc::new(TcpSessionTable {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                accept_queues: HashMap::new(),
            }),
            accept_ready: Condvar::new(),
        })
    }

    fn listener_key(local_ip: Ipv4Address, local_port: u16) -> FourTuple {
        FourTuple {
            local_ip,
            local_port,
            remote_ip: Ipv4Address::UNSPECIFIED,
            remote_port: 0,
        }
    }

    /// Create and register a listening session for `(local_ip, local_port)`.
    pub fn listen(
        self: &Arc<Self>,
        local_ip: Ipv4Address,
        local_port: u16,
        config: Arc<Config>,
        timer: Arc<StackTimer>,
        transmitter: Arc<dyn TcpTransmitter>,
    ) -> Arc<TcpSession> {
        let id = Self::listener_key(local_ip, local_port);
        let session = TcpSession::new(id, config, timer, transmitter, Arc::clone(self));
        session.listen();

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.insert(id, Arc::clone(&session));
        inner
            .accept_queues
            .entry((local_ip, local_port))
            .or_insert_with(VecDeque::new);
        session
    }

    /// Create and register a session for an outbound `connect()`.
    pub fn open(
        self: &Arc<Self>,
        local_ip: Ipv4Address,
        local_port: u16,
        remote_ip: Ipv4Address,
        remote_port: u16,
        config: Arc<Config>,
        timer: Arc<StackTimer>,
        transmitter: Arc<dyn TcpTransmitter>,
    ) -> Arc<TcpSession> {
        let id = FourTuple {
            local_ip,
            local_port,
            remote_ip,
            remote_port,
        };
        let session = TcpSession::new(id, config, timer, transmitter, Arc::clone(self));
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .insert(id, Arc::clone(&session));
        session
    }

    /// Called by a `LISTEN`-state session on an inbound SYN: inserts a fresh
    /// concrete 4-tuple session, leaving the listener itself untouched.
    pub fn fork(
        self: &Arc<Self>,
        local_ip: Ipv4Address,
        local_port: u16,
        remote_ip: Ipv4Address,
        remote_port: u16,
        config: Arc<Config>,
        timer: Arc<StackTimer>,
        transmitter: Arc<dyn TcpTransmitter>,
    ) -> Arc<TcpSession> {
        let id = FourTuple {
            local_ip,
            local_port,
            remote_ip,
            remote_port,
        };
        let session = TcpSession::new(id, config, timer, transmitter, Arc::clone(self));
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .insert(id, Arc::clone(&session));
        session
    }

    /// Called by a forked session once its handshake completes: hands it to
    /// whoever is blocked in `accept` on the owning listener.
    pub fn notify_accept(&self, id: FourTuple) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(session) = inner.entries.get(&id).cloned() else {
            return;
        };
        if let Some(queue) = inner
            .accept_queues
            .get_mut(&(id.local_ip, id.local_port))
        {
            queue.push_back(session);
            self.accept_ready.notify_all();
        }
    }

    /// Block until a completed connection is available for the listener at
    /// `(local_ip, local_port)`.
    pub fn accept(&self, local_ip: Ipv4Address, local_port: u16) -> Arc<TcpSession> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(queue) = inner.accept_queues.get_mut(&(local_ip, local_port)) {
                if let Some(session) = queue.pop_front() {
                    return session;
                }
            }
            inner = self
                .accept_ready
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn lookup(&self, id: &FourTuple) -> Option<Arc<TcpSession>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .get(id)
            .cloned()
    }

    pub fn lookup_listener(&self, local_ip: Ipv4Address, local_port: u16) -> Option<Arc<TcpSession>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .get(&Self::listener_key(local_ip, local_port))
            .cloned()
    }

    /// Drop every `Closed` session with no outstanding user handle. A
    /// session's own tick task and the accept queue hold no `Arc`, so
    /// `strong_count() == 1` means only the table itself still references it.
    fn reap_once(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entries
            .retain(|_, session| !(session.state() == State::Closed && Arc::strong_count(session) <= 1));
    }

    /// Spawn the 1 Hz reaper thread. Self-terminating once the table itself
    /// is dropped, via the same `Weak` pattern used for per-session ticks.
    pub fn spawn_reaper(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        thread::spawn(move || loop {
            thread::sleep(StdDuration::from_secs(1));
            match weak.upgrade() {
                Some(table) => table.reap_once(),
                None => break,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::TcpRepr;

    struct NullTransmitter;
    impl TcpTransmitter for NullTransmitter {
        fn send_tcp(&self, _id: FourTuple, _repr: TcpRepr, _payload: Vec<u8>) {}
    }

    #[test]
    fn listen_then_lookup_listener() {
        let table = TcpSessionTable::new();
        let timer = StackTimer::new();
        let ip = Ipv4Address::new([10, 0, 0, 1]);
        let session = table.listen(
            ip,
            80,
            Arc::new(Config::default()),
            Arc::clone(&timer),
            Arc::new(NullTransmitter),
        );
        assert_eq!(session.state(), State::Listen);
        assert!(table.lookup_listener(ip, 80).is_some());
    }

    #[test]
    fn reap_drops_closed_unreferenced_sessions() {
        let table = TcpSessionTable::new();
        let timer = StackTimer::new();
        let ip = Ipv4Address::new([10, 0, 0, 1]);
        let remote = Ipv4Address::new([10, 0, 0, 2]);
        let session = table.open(
            ip,
            1234,
            remote,
            80,
            Arc::new(Config::default()),
            Arc::clone(&timer),
            Arc::new(NullTransmitter),
        );
        let id = session.id();
        drop(session);
        table.reap_once();
        assert!(table.lookup(&id).is_none());
    }
}
