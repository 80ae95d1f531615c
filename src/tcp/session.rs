//! The per-flow TCP finite state machine, grounded directly on the stack's
//! `TcpSession`: one `tcp_fsm(packet?, syscall?, timer?)` entry point
//! serialized by a per-session mutex, dispatching to one handler per state.
//!
//! Sequence accounting, the sliding-window sender, and delayed ACK are
//! translated line-for-line from that source; the LISTEN-state "fork a new
//! session, mutate self into the accepted connection" dance is adapted into
//! the more idiomatic Rust shape of forking a fresh `Arc<TcpSession>` while
//! the listener keeps its own identity, since a shared `Arc` handle mutating
//! out from under other holders has no sound analogue here.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration as StdDuration;

use log::debug;

use crate::config::Config;
use crate::seq::SeqNumber;
use crate::timer::StackTimer;
use crate::wire::{Ipv4Address, TcpFlags as Flags, TcpRepr};

use super::table::TcpSessionTable;
use super::{FourTuple, State};

/// Reduce a segment's flags to the S/A/F/R pattern the per-state transition
/// table classifies on. PSH and URG are never part of that classification —
/// the original's handlers check `all({flag_syn, flag_ack}) and not
/// any({flag_fin, flag_rst})`-style patterns that never reference
/// `flag_psh`/`flag_urg` — so a real data segment with PSH set (which is
/// most of them) still matches the bare-ACK/FIN/SYN/RST cases below.
fn flag_pattern(flags: Flags) -> Flags {
    flags & (Flags::SYN | Flags::ACK | Flags::FIN | Flags::RST)
}

/// A syscall-like event injected into the FSM from the user-facing API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Listen,
    Connect,
    Close,
}

/// A parsed inbound TCP segment together with the payload bytes backing it
/// (the `Repr` only carries `payload_len`; sequence/rx-buffer accounting
/// needs the bytes themselves).
#[derive(Debug, Clone)]
pub struct InboundSegment {
    pub repr: TcpRepr,
    pub payload: Vec<u8>,
    /// The peer address from the enclosing IPv4 header; `TcpRepr` only
    /// carries ports. A listening session needs this to fork a concrete
    /// 4-tuple child for an inbound SYN.
    pub remote_ip: Ipv4Address,
}

/// Hands a fully-formed outbound segment to whatever can actually transmit
/// it (`PacketHandler::tcp_out`). The session itself knows nothing about
/// rings or Ethernet/IPv4 framing.
pub trait TcpTransmitter: Send + Sync {
    fn send_tcp(&self, id: FourTuple, repr: TcpRepr, payload: Vec<u8>);
}

struct FsmState {
    state: State,
    state_init: bool,

    local_seq_sent: SeqNumber,
    local_seq_ackd: SeqNumber,
    local_seq_fin: Option<SeqNumber>,

    remote_seq_rcvd: Option<SeqNumber>,
    remote_seq_ackd: Option<SeqNumber>,

    local_win: u16,
    local_mss: u16,
    remote_win: Option<u32>,
    remote_mss: Option<usize>,

    tx_buffer_seq_mod: SeqNumber,
    syn_resend_count: u8,
}

struct RxState {
    buffer: VecDeque<u8>,
    remote_closed: bool,
}

/// A single TCP flow: its identity, FSM state, send/receive buffers, and the
/// blocking socket-style API layered on top.
pub struct TcpSession {
    id: FourTuple,
    config: Arc<Config>,
    timer: Arc<StackTimer>,
    transmitter: Arc<dyn TcpTransmitter>,
    table: Arc<TcpSessionTable>,

    fsm: Mutex<FsmState>,
    tx: Mutex<VecDeque<u8>>,
    rx: Mutex<RxState>,
    rx_ready: Condvar,
    connect_signaled: Mutex<bool>,
    connect_ready: Condvar,
}

impl TcpSession {
    pub fn new(
        id: FourTuple,
        config: Arc<Config>,
        timer: Arc<StackTimer>,
        transmitter: Arc<dyn TcpTransmitter>,
        table: Arc<TcpSessionTable>,
    ) -> Arc<TcpSession> {
        let local_seq_init = SeqNumber::new(rand::random::<u32>());
        let local_win = config.local_tcp_win;
        let local_mss = config.local_tcp_mss;
        let session = Arc::new(TcpSession {
            id,
            config,
            timer: Arc::clone(&timer),
            transmitter,
            table,
            fsm: Mutex::new(FsmState {
                state: State::Closed,
                state_init: true,
                local_seq_sent: local_seq_init,
                local_seq_ackd: local_seq_init,
                local_seq_fin: None,
                remote_seq_rcvd: None,
                remote_seq_ackd: None,
                local_win: 0,
                local_mss: 0,
                remote_win: None,
                remote_mss: None,
                tx_buffer_seq_mod: local_seq_init + 1u32,
                syn_resend_count: 0,
            }),
            tx: Mutex::new(VecDeque::new()),
            rx: Mutex::new(RxState {
                buffer: VecDeque::new(),
                remote_closed: false,
            }),
            rx_ready: Condvar::new(),
            connect_signaled: Mutex::new(false),
            connect_ready: Condvar::new(),
        });

        {
            let mut fsm = session.fsm.lock().unwrap_or_else(|e| e.into_inner());
            fsm.local_win = local_win;
            fsm.local_mss = local_mss;
        }

        let weak = Arc::downgrade(&session);
        let weak_stop = Arc::downgrade(&session);
        session_tick_task(&timer, weak, weak_stop);
        session
    }

    pub fn id(&self) -> FourTuple {
        self.id
    }

    pub fn state(&self) -> State {
        self.fsm.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    fn timer_name(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.id)
    }

    fn change_state(&self, fsm: &mut FsmState, new_state: State) {
        debug!("{} state changed: {} -> {}", self.id, fsm.state, new_state);
        fsm.state = new_state;
        fsm.state_init = true;
    }

    fn notify_connect(&self) {
        *self.connect_signaled.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.connect_ready.notify_all();
    }

    fn notify_rx_closed(&self) {
        let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        rx.remote_closed = true;
        self.rx_ready.notify_all();
    }

    fn enqueue_rx(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        rx.buffer.extend(data.iter().copied());
        self.rx_ready.notify_all();
    }

    /// `send_packet` from the design spec: builds and transmits a segment,
    /// then advances `local_seq_sent`/`remote_seq_ackd` accordingly.
    fn send_packet(
        &self,
        fsm: &mut FsmState,
        seq: Option<SeqNumber>,
        syn: bool,
        ack: bool,
        fin: bool,
        rst: bool,
        data: &[u8],
    ) {
        let effective_seq = seq.unwrap_or(fsm.local_seq_sent);

        let mut flags = Flags::empty();
        if syn {
            flags |= Flags::SYN;
        }
        if ack {
            flags |= Flags::ACK;
        }
        if fin {
            flags |= Flags::FIN;
        }
        if rst {
            flags |= Flags::RST;
        }

        let repr = TcpRepr {
            src_port: self.id.local_port,
            dst_port: self.id.remote_port,
            seq_number: effective_seq,
            ack_number: ack.then_some(fsm.remote_seq_rcvd.unwrap_or(SeqNumber::new(0))),
            flags,
            window_len: fsm.local_win,
            max_seg_size: syn.then_some(fsm.local_mss),
            payload_len: data.len(),
        };

        self.transmitter.send_tcp(self.id, repr, data.to_vec());

        fsm.remote_seq_ackd = fsm.remote_seq_rcvd;
        let mut next = effective_seq + data.len();
        if syn {
            next = next + 1u32;
        }
        if fin {
            next = next + 1u32;
        }
        fsm.local_seq_sent = next;

        if fin {
            fsm.local_seq_fin = Some(fsm.local_seq_sent);
        }

        if fsm.state == State::Established {
            self.timer
                .register_timer(self.timer_name("delayed_ack"), self.config.delayed_ack_delay_ms);
        }
    }

    /// `process_ack` from the design spec.
    fn process_ack_packet(&self, fsm: &mut FsmState, segment: &InboundSegment, send_ack: bool) {
        let repr = &segment.repr;

        if let Some(ack) = repr.ack_number {
            fsm.local_seq_ackd = fsm.local_seq_ackd.max(ack);
        }

        let mut next = repr.seq_number + repr.payload_len;
        if repr.flags.contains(Flags::SYN) {
            next = next + 1u32;
        }
        if repr.flags.contains(Flags::FIN) {
            next = next + 1u32;
        }
        fsm.remote_seq_rcvd = Some(next);

        if !segment.payload.is_empty() {
            self.enqueue_rx(&segment.payload);
        }
        if send_ack && !segment.payload.is_empty() {
            self.send_packet(fsm, None, false, true, false, false, &[]);
        }

        let offset_ackd = (fsm.local_seq_ackd - fsm.tx_buffer_seq_mod).max(0) as usize;
        let drained = {
            let mut tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            let drained = offset_ackd.min(tx.len());
            tx.drain(0..drained);
            drained
        };
        fsm.tx_buffer_seq_mod = fsm.tx_buffer_seq_mod + drained as u32;
    }

    /// `send_data`: the sliding-window sender, run on every timer tick while
    /// `Established`/`CloseWait`.
    fn send_data(&self, fsm: &mut FsmState) {
        let tx_len = self.tx.lock().unwrap_or_else(|e| e.into_inner()).len();
        let offset_sent = (fsm.local_seq_sent - fsm.tx_buffer_seq_mod).max(0) as usize;
        let offset_ackd = (fsm.local_seq_ackd - fsm.tx_buffer_seq_mod).max(0) as usize;

        let unsent = tx_len.saturating_sub(offset_sent);
        if unsent == 0 {
            return;
        }

        let remote_mss = fsm.remote_mss.unwrap_or(self.config.local_tcp_mss as usize);
        let remote_win = if self.config.use_remote_win {
            fsm.remote_win.unwrap_or(remote_mss as u32) as i64
        } else {
            remote_mss as i64
        };
        let win_left = offset_ackd as i64 + remote_win - offset_sent as i64;
        if win_left <= 0 {
            return;
        }

        let send_len = unsent.min(remote_mss).min(win_left as usize);
        let data: Vec<u8> = {
            let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            tx.iter().skip(offset_sent).take(send_len).copied().collect()
        };
        debug!(
            "{} sliding window [{}|{}|+{remote_win}], sending {} bytes",
            self.id, fsm.local_seq_ackd, fsm.local_seq_sent, data.len()
        );
        self.send_packet(fsm, None, false, true, false, false, &data);
    }

    /// `delayed_ack`.
    fn delayed_ack(&self, fsm: &mut FsmState) {
        let name = self.timer_name("delayed_ack");
        if self.timer.timer_expired(&name) {
            if let (Some(rcvd), Some(ackd)) = (fsm.remote_seq_rcvd, fsm.remote_seq_ackd) {
                if rcvd > ackd {
                    self.send_packet(fsm, None, false, true, false, false, &[]);
                }
            }
            self.timer.register_timer(name, self.config.delayed_ack_delay_ms);
        }
    }

    /// Entry point called directly by a forking listener once it has created
    /// a concrete session for an inbound SYN: initializes peer parameters and
    /// moves straight to `SynRcvd`, sending the SYN+ACK.
    fn accept_syn(&self, repr: &TcpRepr) {
        let mut fsm = self.fsm.lock().unwrap_or_else(|e| e.into_inner());
        fsm.remote_mss = Some(self.config.clamp_peer_mss(repr.max_seg_size.unwrap_or(self.config.local_tcp_mss)));
        fsm.remote_win = Some(if self.config.use_remote_win {
            repr.window_len as u32
        } else {
            fsm.remote_mss.unwrap() as u32
        });
        fsm.remote_seq_rcvd = Some(repr.seq_number + 1u32);
        self.send_packet(&mut fsm, None, true, true, false, false, &[]);
        self.change_state(&mut fsm, State::SynRcvd);
    }

    // ---- per-state handlers, one per RFC 793 state ----

    fn handle_closed(&self, fsm: &mut FsmState, syscall: Option<Syscall>) {
        if fsm.state_init {
            fsm.state_init = false;
        }
        match syscall {
            Some(Syscall::Connect) => {
                self.send_packet(fsm, None, true, false, false, false, &[]);
                self.change_state(fsm, State::SynSent);
            }
            Some(Syscall::Listen) => {
                self.change_state(fsm, State::Listen);
            }
            _ => {}
        }
    }

    fn handle_listen(&self, fsm: &mut FsmState, packet: Option<&InboundSegment>, syscall: Option<Syscall>) {
        if fsm.state_init {
            fsm.state_init = false;
        }

        if let Some(segment) = packet {
            let repr = &segment.repr;
            if flag_pattern(repr.flags) == Flags::SYN && repr.ack_number.is_none() && repr.payload_len == 0 {
                let child = self.table.fork(
                    self.id.local_ip,
                    self.id.local_port,
                    segment.remote_ip,
                    repr.src_port,
                    Arc::clone(&self.config),
                    Arc::clone(&self.timer),
                    Arc::clone(&self.transmitter),
                );
                child.accept_syn(repr);
                return;
            }
        }

        if syscall == Some(Syscall::Close) {
            self.change_state(fsm, State::Closed);
        }
    }

    fn handle_syn_sent(&self, fsm: &mut FsmState, packet: Option<&InboundSegment>, syscall: Option<Syscall>, timer: bool) {
        if fsm.state_init {
            fsm.state_init = false;
            fsm.syn_resend_count = 0;
            self.timer
                .register_timer(self.timer_name("syn_sent"), self.config.packet_resend_delay_ms);
        }

        if timer && self.timer.timer_expired(&self.timer_name("syn_sent")) && fsm.local_seq_ackd < fsm.local_seq_sent {
            if fsm.syn_resend_count == self.config.packet_resend_count {
                self.change_state(fsm, State::Closed);
                self.notify_connect();
                return;
            }
            self.send_packet(fsm, Some(fsm.local_seq_ackd), true, false, false, false, &[]);
            fsm.syn_resend_count += 1;
            let delay = self.config.packet_resend_delay_ms * (1i64 << fsm.syn_resend_count);
            self.timer.register_timer(self.timer_name("syn_sent"), delay);
            return;
        }

        if let Some(segment) = packet {
            let repr = &segment.repr;
            if flag_pattern(repr.flags) == (Flags::SYN | Flags::ACK) && repr.ack_number == Some(fsm.local_seq_sent) && repr.payload_len == 0 {
                self.process_ack_packet(fsm, segment, false);
                fsm.remote_mss = Some(self.config.clamp_peer_mss(repr.max_seg_size.unwrap_or(self.config.local_tcp_mss)));
                fsm.remote_win = Some(if self.config.use_remote_win {
                    repr.window_len as u32
                } else {
                    fsm.remote_mss.unwrap() as u32
                });
                self.send_packet(fsm, None, false, true, false, false, &[]);
                self.change_state(fsm, State::Established);
                return;
            }
            if flag_pattern(repr.flags) == Flags::SYN && repr.ack_number.is_none() && repr.payload_len == 0 {
                self.send_packet(fsm, None, true, true, false, false, &[]);
                self.change_state(fsm, State::SynRcvd);
                return;
            }
            if flag_pattern(repr.flags) == Flags::RST {
                self.change_state(fsm, State::Closed);
                self.notify_connect();
                return;
            }
        }

        if syscall == Some(Syscall::Close) {
            self.change_state(fsm, State::Closed);
        }
    }

    fn handle_syn_rcvd(&self, fsm: &mut FsmState, packet: Option<&InboundSegment>, syscall: Option<Syscall>, timer: bool) {
        if fsm.state_init {
            fsm.state_init = false;
            fsm.syn_resend_count = 0;
            self.timer
                .register_timer(self.timer_name("syn_rcvd"), self.config.packet_resend_delay_ms);
        }

        if timer && self.timer.timer_expired(&self.timer_name("syn_rcvd")) && fsm.local_seq_ackd < fsm.local_seq_sent {
            if fsm.syn_resend_count == self.config.packet_resend_count {
                self.change_state(fsm, State::Closed);
                return;
            }
            self.send_packet(fsm, Some(fsm.local_seq_ackd), true, true, false, false, &[]);
            fsm.syn_resend_count += 1;
            let delay = self.config.packet_resend_delay_ms * (1i64 << fsm.syn_resend_count);
            self.timer.register_timer(self.timer_name("syn_rcvd"), delay);
            return;
        }

        if let Some(segment) = packet {
            let repr = &segment.repr;
            if flag_pattern(repr.flags) == Flags::ACK
                && Some(repr.seq_number) == fsm.remote_seq_rcvd
                && repr.ack_number == Some(fsm.local_seq_sent)
                && repr.payload_len == 0
            {
                self.process_ack_packet(fsm, segment, false);
                self.change_state(fsm, State::Established);
                return;
            }
        }

        if syscall == Some(Syscall::Close) {
            self.send_packet(fsm, None, false, true, true, false, &[]);
            self.change_state(fsm, State::FinWait1);
        }
    }

    fn handle_established(&self, fsm: &mut FsmState, packet: Option<&InboundSegment>, syscall: Option<Syscall>, timer: bool) {
        if fsm.state_init {
            fsm.state_init = false;
            self.table.notify_accept(self.id);
            self.notify_connect();
        }

        if timer {
            self.send_data(fsm);
            self.delayed_ack(fsm);
            return;
        }

        if let Some(segment) = packet {
            let repr = &segment.repr;
            if flag_pattern(repr.flags) == Flags::ACK && Some(repr.seq_number) == fsm.remote_seq_rcvd && repr.ack_number.unwrap() <= fsm.local_seq_sent {
                self.process_ack_packet(fsm, segment, false);
                return;
            }
            if flag_pattern(repr.flags) == (Flags::FIN | Flags::ACK) && Some(repr.seq_number) == fsm.remote_seq_rcvd && repr.ack_number.unwrap() <= fsm.local_seq_sent
            {
                self.process_ack_packet(fsm, segment, true);
                self.notify_rx_closed();
                self.change_state(fsm, State::CloseWait);
                return;
            }
        }

        if syscall == Some(Syscall::Close) {
            self.send_packet(fsm, None, false, true, true, false, &[]);
            self.change_state(fsm, State::FinWait1);
        }
    }

    fn handle_fin_wait_1(&self, fsm: &mut FsmState, packet: Option<&InboundSegment>) {
        if fsm.state_init {
            fsm.state_init = false;
        }

        let Some(segment) = packet else { return };
        let repr = &segment.repr;

        if flag_pattern(repr.flags) == Flags::ACK && Some(repr.seq_number) == fsm.remote_seq_rcvd && repr.ack_number.unwrap() <= fsm.local_seq_sent {
            let ack = repr.ack_number.unwrap();
            self.process_ack_packet(fsm, segment, true);
            if fsm.local_seq_fin.is_some_and(|fin| ack >= fin) {
                self.change_state(fsm, State::FinWait2);
            }
            return;
        }

        if flag_pattern(repr.flags) == (Flags::FIN | Flags::ACK) && Some(repr.seq_number) == fsm.remote_seq_rcvd && repr.ack_number.unwrap() <= fsm.local_seq_sent {
            let ack = repr.ack_number.unwrap();
            self.process_ack_packet(fsm, segment, false);
            self.send_packet(fsm, None, false, true, false, false, &[]);
            if fsm.local_seq_fin.is_some_and(|fin| ack >= fin) {
                self.change_state(fsm, State::TimeWait);
            } else {
                self.change_state(fsm, State::Closing);
            }
        }
    }

    fn handle_fin_wait_2(&self, fsm: &mut FsmState, packet: Option<&InboundSegment>) {
        if fsm.state_init {
            fsm.state_init = false;
        }

        let Some(segment) = packet else { return };
        let repr = &segment.repr;

        if flag_pattern(repr.flags) == Flags::ACK && Some(repr.seq_number) == fsm.remote_seq_rcvd && repr.ack_number.unwrap() <= fsm.local_seq_sent {
            self.process_ack_packet(fsm, segment, true);
            return;
        }

        if flag_pattern(repr.flags) == (Flags::FIN | Flags::ACK) && Some(repr.seq_number) == fsm.remote_seq_rcvd && repr.ack_number.unwrap() <= fsm.local_seq_sent {
            self.process_ack_packet(fsm, segment, false);
            self.send_packet(fsm, None, false, true, false, false, &[]);
            self.change_state(fsm, State::TimeWait);
        }
    }

    fn handle_closing(&self, fsm: &mut FsmState, packet: Option<&InboundSegment>) {
        if fsm.state_init {
            fsm.state_init = false;
        }
        let Some(segment) = packet else { return };
        let repr = &segment.repr;
        if flag_pattern(repr.flags) == Flags::ACK && repr.ack_number == Some(fsm.local_seq_sent) {
            fsm.local_seq_ackd = repr.ack_number.unwrap();
            self.change_state(fsm, State::TimeWait);
        }
    }

    fn handle_close_wait(&self, fsm: &mut FsmState, packet: Option<&InboundSegment>, syscall: Option<Syscall>, timer: bool) {
        if fsm.state_init {
            fsm.state_init = false;
        }

        if timer {
            self.send_data(fsm);
            self.delayed_ack(fsm);
            return;
        }

        if let Some(segment) = packet {
            let repr = &segment.repr;
            if flag_pattern(repr.flags) == Flags::ACK
                && Some(repr.seq_number) == fsm.remote_seq_rcvd
                && repr.ack_number.unwrap() <= fsm.local_seq_sent
                && repr.payload_len == 0
            {
                self.process_ack_packet(fsm, segment, false);
                return;
            }
            if flag_pattern(repr.flags) == Flags::RST && repr.ack_number.is_none() && Some(repr.seq_number) == fsm.remote_seq_rcvd {
                self.change_state(fsm, State::Closed);
                return;
            }
        }

        if syscall == Some(Syscall::Close) {
            self.send_packet(fsm, None, false, true, true, false, &[]);
            self.change_state(fsm, State::LastAck);
        }
    }

    fn handle_last_ack(&self, fsm: &mut FsmState, packet: Option<&InboundSegment>) {
        if fsm.state_init {
            fsm.state_init = false;
        }
        let Some(segment) = packet else { return };
        let repr = &segment.repr;
        if flag_pattern(repr.flags) == Flags::ACK && repr.ack_number == Some(fsm.local_seq_sent) {
            self.change_state(fsm, State::Closed);
            return;
        }
        if flag_pattern(repr.flags) == Flags::RST && repr.ack_number.is_none() && Some(repr.seq_number) == fsm.remote_seq_rcvd {
            self.change_state(fsm, State::Closed);
        }
    }

    fn handle_time_wait(&self, fsm: &mut FsmState, timer: bool) {
        if fsm.state_init {
            fsm.state_init = false;
            self.timer
                .register_timer(self.timer_name("time_wait"), self.config.time_wait_delay_ms);
        }
        if timer && self.timer.timer_expired(&self.timer_name("time_wait")) {
            self.change_state(fsm, State::Closed);
        }
    }

    /// The single FSM entry point: acquires the FSM mutex and dispatches to
    /// the current state's handler.
    pub fn tcp_fsm(&self, packet: Option<&InboundSegment>, syscall: Option<Syscall>, timer: bool) {
        let mut fsm = self.fsm.lock().unwrap_or_else(|e| e.into_inner());
        match fsm.state {
            State::Closed => self.handle_closed(&mut fsm, syscall),
            State::Listen => self.handle_listen(&mut fsm, packet, syscall),
            State::SynSent => self.handle_syn_sent(&mut fsm, packet, syscall, timer),
            State::SynRcvd => self.handle_syn_rcvd(&mut fsm, packet, syscall, timer),
            State::Established => self.handle_established(&mut fsm, packet, syscall, timer),
            State::FinWait1 => self.handle_fin_wait_1(&mut fsm, packet),
            State::FinWait2 => self.handle_fin_wait_2(&mut fsm, packet),
            State::Closing => self.handle_closing(&mut fsm, packet),
            State::CloseWait => self.handle_close_wait(&mut fsm, packet, syscall, timer),
            State::LastAck => self.handle_last_ack(&mut fsm, packet),
            State::TimeWait => self.handle_time_wait(&mut fsm, timer),
        }
    }

    // ---- user-facing API (spec 4.5.1) ----

    pub fn listen(&self) {
        self.tcp_fsm(None, Some(Syscall::Listen), false);
    }

    pub fn connect(&self) -> bool {
        *self.connect_signaled.lock().unwrap_or_else(|e| e.into_inner()) = false;
        self.tcp_fsm(None, Some(Syscall::Connect), false);

        let mut signaled = self.connect_signaled.lock().unwrap_or_else(|e| e.into_inner());
        while !*signaled {
            signaled = self.connect_ready.wait(signaled).unwrap_or_else(|e| e.into_inner());
        }
        drop(signaled);
        self.state() == State::Established
    }

    pub fn send(&self, data: &[u8]) -> usize {
        let state = self.state();
        if state == State::Established || state == State::CloseWait {
            let mut tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            tx.extend(data.iter().copied());
            data.len()
        } else {
            0
        }
    }

    pub fn receive(&self, max_bytes: Option<usize>) -> Option<Vec<u8>> {
        let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        while rx.buffer.is_empty() && !rx.remote_closed {
            rx = self.rx_ready.wait(rx).unwrap_or_else(|e| e.into_inner());
        }
        if rx.buffer.is_empty() && rx.remote_closed {
            return None;
        }
        let take = max_bytes.unwrap_or(rx.buffer.len()).min(rx.buffer.len());
        let out: Vec<u8> = rx.buffer.drain(0..take).collect();
        if !rx.buffer.is_empty() || rx.remote_closed {
            self.rx_ready.notify_all();
        }
        Some(out)
    }

    pub fn close(&self) {
        loop {
            if self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_empty() {
                break;
            }
            thread::sleep(StdDuration::from_millis(100));
        }
        self.tcp_fsm(None, Some(Syscall::Close), false);
    }
}

/// Registers the 1 ms FSM tick task; reaped automatically once the session
/// is dropped, via a stop predicate that checks the weak handle instead of
/// requiring an explicit `cancel_task` call at teardown.
fn session_tick_task(
    timer: &Arc<StackTimer>,
    weak: std::sync::Weak<TcpSession>,
    weak_stop: std::sync::Weak<TcpSession>,
) {
    timer.register_task(
        move || {
            if let Some(session) = weak.upgrade() {
                session.tcp_fsm(None, None, true);
            }
        },
        1,
        false,
        -1,
        Some(Box::new(move || weak_stop.upgrade().is_none())),
    );
}
