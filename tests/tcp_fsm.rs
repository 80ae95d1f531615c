//! End-to-end exercises of the TCP session FSM against synthetic inbound
//! segments, with a transmitter stub standing in for `PacketHandler`'s
//! framing/ARP/ring plumbing. The ARP probe-conflict scenario is covered in
//! `src/handler.rs`'s own tests instead, since it never touches TCP.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tundra_stack::config::Config;
use tundra_stack::seq::SeqNumber;
use tundra_stack::tcp::{FourTuple, InboundSegment, State, TcpSessionTable, TcpTransmitter};
use tundra_stack::timer::StackTimer;
use tundra_stack::wire::{Ipv4Address, TcpFlags, TcpRepr};

#[derive(Default)]
struct CapturingTransmitter {
    sent: Mutex<Vec<(FourTuple, TcpRepr, Vec<u8>)>>,
}

impl CapturingTransmitter {
    fn len(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn nth(&self, i: usize) -> (FourTuple, TcpRepr, Vec<u8>) {
        self.sent.lock().unwrap()[i].clone()
    }

    fn last(&self) -> (FourTuple, TcpRepr, Vec<u8>) {
        self.sent.lock().unwrap().last().unwrap().clone()
    }
}

impl TcpTransmitter for CapturingTransmitter {
    fn send_tcp(&self, id: FourTuple, repr: TcpRepr, payload: Vec<u8>) {
        self.sent.lock().unwrap().push((id, repr, payload));
    }
}

fn inbound(
    remote_port: u16,
    local_port: u16,
    seq: u32,
    ack: Option<u32>,
    flags: TcpFlags,
    remote_ip: Ipv4Address,
    payload: &[u8],
) -> InboundSegment {
    InboundSegment {
        repr: TcpRepr {
            src_port: remote_port,
            dst_port: local_port,
            seq_number: SeqNumber::new(seq),
            ack_number: ack.map(SeqNumber::new),
            flags,
            window_len: 8192,
            max_seg_size: Some(1460),
            payload_len: payload.len(),
        },
        payload: payload.to_vec(),
        remote_ip,
    }
}

#[test]
fn active_open_completes_handshake_and_transfers_established_state() {
    let local_ip = Ipv4Address::new([10, 0, 0, 1]);
    let remote_ip = Ipv4Address::new([10, 0, 0, 2]);
    let table = TcpSessionTable::new();
    let timer = StackTimer::new();
    let config = Arc::new(Config::default());
    let transmitter = Arc::new(CapturingTransmitter::default());

    let session = table.open(
        local_ip,
        49152,
        remote_ip,
        80,
        Arc::clone(&config),
        Arc::clone(&timer),
        Arc::clone(&transmitter) as Arc<dyn TcpTransmitter>,
    );

    let connecting = Arc::clone(&session);
    let connect_thread = thread::spawn(move || connecting.connect());

    // wait for the SYN to land, then reply as the peer would.
    for _ in 0..1000 {
        if transmitter.len() >= 1 {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    let (_, syn, _) = transmitter.nth(0);
    assert!(syn.flags.contains(TcpFlags::SYN) && !syn.flags.contains(TcpFlags::ACK));
    let isn = syn.seq_number;

    let syn_ack = inbound(
        80,
        49152,
        9000,
        Some((isn + 1u32).0),
        TcpFlags::SYN | TcpFlags::ACK,
        remote_ip,
        &[],
    );
    session.tcp_fsm(Some(&syn_ack), None, false);

    assert!(connect_thread.join().unwrap());
    assert_eq!(session.state(), State::Established);

    let (_, ack, _) = transmitter.last();
    assert!(ack.flags.contains(TcpFlags::ACK) && !ack.flags.contains(TcpFlags::SYN));
}

#[test]
fn passive_open_accepts_and_delivers_ordered_data() {
    let local_ip = Ipv4Address::new([10, 0, 0, 1]);
    let remote_ip = Ipv4Address::new([10, 0, 0, 2]);
    let table = TcpSessionTable::new();
    let timer = StackTimer::new();
    let config = Arc::new(Config::default());
    let transmitter = Arc::new(CapturingTransmitter::default());

    let listener = table.listen(
        local_ip,
        7,
        Arc::clone(&config),
        Arc::clone(&timer),
        Arc::clone(&transmitter) as Arc<dyn TcpTransmitter>,
    );
    assert_eq!(listener.state(), State::Listen);

    let client_isn = 9000u32;
    let syn = inbound(54321, 7, client_isn, None, TcpFlags::SYN, remote_ip, &[]);
    listener.tcp_fsm(Some(&syn), None, false);
    // the listener itself never moves out of LISTEN; a forked child handles the flow.
    assert_eq!(listener.state(), State::Listen);

    let child_id = FourTuple {
        local_ip,
        local_port: 7,
        remote_ip,
        remote_port: 54321,
    };
    let child = table.lookup(&child_id).expect("listen() should have forked a child session");
    assert_eq!(child.state(), State::SynRcvd);

    let (_, syn_ack, _) = transmitter.last();
    assert!(syn_ack.flags.contains(TcpFlags::SYN) && syn_ack.flags.contains(TcpFlags::ACK));
    let server_isn = syn_ack.seq_number;

    let final_ack = inbound(
        54321,
        7,
        client_isn + 1,
        Some((server_isn + 1u32).0),
        TcpFlags::ACK,
        remote_ip,
        &[],
    );
    child.tcp_fsm(Some(&final_ack), None, false);
    assert_eq!(child.state(), State::Established);

    let accepted = table.accept(local_ip, 7);
    assert!(Arc::ptr_eq(&accepted, &child));

    // real stacks set PSH on pushed data; the FSM must classify on S/A/F/R
    // only and ignore it.
    let data = inbound(
        54321,
        7,
        client_isn + 1,
        Some((server_isn + 1u32).0),
        TcpFlags::ACK | TcpFlags::PSH,
        remote_ip,
        b"hello",
    );
    child.tcp_fsm(Some(&data), None, false);

    assert_eq!(child.receive(Some(5)), Some(b"hello".to_vec()));
}

#[test]
fn peer_initiated_close_drains_through_close_wait_and_last_ack() {
    let local_ip = Ipv4Address::new([10, 0, 0, 1]);
    let remote_ip = Ipv4Address::new([10, 0, 0, 2]);
    let table = TcpSessionTable::new();
    let timer = StackTimer::new();
    let config = Arc::new(Config::default());
    let transmitter = Arc::new(CapturingTransmitter::default());

    let session = table.open(
        local_ip,
        49153,
        remote_ip,
        80,
        Arc::clone(&config),
        Arc::clone(&timer),
        Arc::clone(&transmitter) as Arc<dyn TcpTransmitter>,
    );
    let connecting = Arc::clone(&session);
    let connect_thread = thread::spawn(move || connecting.connect());

    for _ in 0..1000 {
        if transmitter.len() >= 1 {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    let isn = transmitter.nth(0).1.seq_number;
    let syn_ack = inbound(80, 49153, 5000, Some((isn + 1u32).0), TcpFlags::SYN | TcpFlags::ACK, remote_ip, &[]);
    session.tcp_fsm(Some(&syn_ack), None, false);
    assert!(connect_thread.join().unwrap());

    let local_seq_after_handshake = isn + 1u32;

    let fin = inbound(80, 49153, 5001, Some(local_seq_after_handshake.0), TcpFlags::FIN | TcpFlags::ACK, remote_ip, &[]);
    session.tcp_fsm(Some(&fin), None, false);
    assert_eq!(session.state(), State::CloseWait);

    session.close();
    assert_eq!(session.state(), State::LastAck);

    let (_, our_fin, _) = transmitter.last();
    assert!(our_fin.flags.contains(TcpFlags::FIN));
    let our_fin_seq = our_fin.seq_number;

    let last_ack = inbound(
        80,
        49153,
        5002,
        Some((our_fin_seq + 1u32).0),
        TcpFlags::ACK,
        remote_ip,
        &[],
    );
    session.tcp_fsm(Some(&last_ack), None, false);
    assert_eq!(session.state(), State::Closed);
}

#[test]
fn handshake_with_no_reply_retransmits_with_doubling_delay_and_gives_up() {
    let local_ip = Ipv4Address::new([10, 0, 0, 1]);
    let remote_ip = Ipv4Address::new([10, 0, 0, 2]);
    let table = TcpSessionTable::new();
    let timer = StackTimer::new();
    // scaled down from the stack's 1s base delay so the test doesn't take 30s;
    // the doubling shape (base, 2x, 4x, 8x, give up) is what's under test.
    let config = Arc::new(Config {
        packet_resend_delay_ms: 4,
        packet_resend_count: 4,
        ..Config::default()
    });
    let transmitter = Arc::new(CapturingTransmitter::default());

    let session = table.open(
        local_ip,
        49154,
        remote_ip,
        80,
        Arc::clone(&config),
        Arc::clone(&timer),
        Arc::clone(&transmitter) as Arc<dyn TcpTransmitter>,
    );

    let _tick = timer.spawn();
    let connecting = Arc::clone(&session);
    let connect_thread = thread::spawn(move || connecting.connect());

    // base 4, then 8/16/32/64ms backoff before giving up (~124ms); generous real-time margin below.
    for _ in 0..2000 {
        if session.state() == State::Closed {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    assert!(!connect_thread.join().unwrap());
    assert_eq!(session.state(), State::Closed);
    // initial SYN plus 4 retransmits
    assert_eq!(transmitter.len(), 5);
    for i in 0..transmitter.len() {
        let (_, repr, _) = transmitter.nth(i);
        assert!(repr.flags.contains(TcpFlags::SYN) && !repr.flags.contains(TcpFlags::ACK));
    }
    timer.stop();
}
