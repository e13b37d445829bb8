use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use parking_lot::Mutex;
use rtpmidi_service::{
    Channel, EndReason, Session, SessionHandler, SessionInfo, SessionOptions, Stream,
    codec::control::ControlMessage,
    stream::{INVITATION_ATTEMPTS, INVITATION_INTERVAL},
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Ready,
    Added(String),
    Removed(String, EndReason),
    Message(u32, Vec<u8>),
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl SessionHandler for Recorder {
    fn on_ready(&self, _: &SessionInfo) {
        self.0.lock().push(Event::Ready);
    }

    fn on_stream_added(&self, stream: &Stream) {
        self.0.lock().push(Event::Added(stream.name().to_string()));
    }

    fn on_stream_removed(&self, stream: &Stream, reason: EndReason) {
        self.0.lock().push(Event::Removed(stream.name().to_string(), reason));
    }

    fn on_message(&self, _: &Stream, delta_time: u32, message: &[u8]) {
        self.0.lock().push(Event::Message(delta_time, message.to_vec()));
    }

    fn on_control_message(&self, _: SocketAddr, _: &ControlMessage) {}
}

struct Peer {
    session: Session<Recorder>,
    recorder: Recorder,
    address: SocketAddr,
}

impl Peer {
    fn new(name: &str, port: u16, ssrc: u32, now: Instant) -> Self {
        let recorder = Recorder::default();
        let options = SessionOptions {
            local_name: name.to_string(),
            bonjour_name: name.to_string(),
            published: false,
            bundle: true,
            ssrc,
            port,
        };

        let mut session = Session::new(options, recorder.clone(), now);
        session.listening();
        session.listening();

        Self {
            address: SocketAddr::from(([127, 0, 0, 1], port)),
            recorder,
            session,
        }
    }

    fn source(&self, channel: Channel) -> SocketAddr {
        match channel {
            Channel::Control => self.address,
            Channel::Data => SocketAddr::new(self.address.ip(), self.address.port() + 1),
        }
    }

    fn owns(&self, to: SocketAddr) -> bool {
        to.port() & !1 == self.address.port()
    }
}

/// Run due timers of `from` and deliver its outbox to `to`.
fn step(from: &mut Peer, to: &mut Peer, now: Instant) -> (usize, usize) {
    from.session.poll_timers(now);

    let outgoing = from.session.drain_outgoing().collect::<Vec<_>>();
    let mut delivered = 0;
    for (channel, address, bytes) in &outgoing {
        if to.owns(*address) {
            assert_eq!(*channel, Channel::of_port(address.port()));
            to.session.handle_datagram(*channel, bytes, from.source(*channel), now);
            delivered += 1;
        }
    }

    (outgoing.len(), delivered)
}

/// Deliver datagrams between the two peers until both outboxes are empty.
fn pump(a: &mut Peer, b: &mut Peer, now: Instant) -> usize {
    let mut delivered = 0;
    loop {
        let (sent_a, delivered_a) = step(a, b, now);
        let (sent_b, delivered_b) = step(b, a, now);
        delivered += delivered_a + delivered_b;

        if sent_a + sent_b == 0 {
            return delivered;
        }
    }
}

fn peers(now: Instant) -> (Peer, Peer) {
    (Peer::new("alpha", 5004, 1, now), Peer::new("beta", 6004, 2, now))
}

#[test]
fn handshake_and_sync() -> Result<()> {
    let now = Instant::now();
    let (mut a, mut b) = peers(now);

    assert_eq!(a.recorder.take(), vec![Event::Ready]);
    assert_eq!(b.recorder.take(), vec![Event::Ready]);

    a.session.connect(b.address, now);
    pump(&mut a, &mut b, now);

    assert_eq!(a.recorder.take(), vec![Event::Added("beta".to_string())]);
    assert_eq!(b.recorder.take(), vec![Event::Added("alpha".to_string())]);

    let Some(stream) = a.session.streams().next() else {
        return Err(anyhow::anyhow!("no stream on initiator"));
    };

    assert!(stream.is_synchronized());
    assert_eq!(stream.ssrc(), Some(2));
    assert_eq!(stream.control_address(), Some(b.address));
    assert_eq!(stream.data_address(), Some(b.source(Channel::Data)));

    let Some(stream) = b.session.get_stream(1) else {
        return Err(anyhow::anyhow!("no stream on responder"));
    };

    assert!(stream.is_established());
    assert!(stream.is_synchronized());
    assert_eq!(stream.latency(), Some(0));
    assert_eq!(b.session.info().streams.len(), 1);

    Ok(())
}

#[test]
fn bundled_messages() -> Result<()> {
    let now = Instant::now();
    let (mut a, mut b) = peers(now);

    a.session.connect(b.address, now);
    pump(&mut a, &mut b, now);
    b.recorder.take();

    let ticks = a.session.ticks(now);
    a.session.send_message(Some(ticks + 20), &[0x80, 0x40, 0x00], now)?;
    a.session.send_message(None, &[0x90, 0x40, 0x7f], now)?;
    assert!(a.session.send_message(None, &[0x90, 0x40], now).is_err());

    // Nothing leaves before the flush task runs.
    assert_eq!(a.session.drain_outgoing().count(), 0);
    assert_eq!(a.session.next_deadline(), Some(now));

    assert_eq!(pump(&mut a, &mut b, now), 1);
    assert_eq!(
        b.recorder.take(),
        vec![
            Event::Message(0, vec![0x90, 0x40, 0x7f]),
            Event::Message(20, vec![0x80, 0x40, 0x00]),
        ]
    );

    Ok(())
}

#[test]
fn peer_end_removes_stream() -> Result<()> {
    let now = Instant::now();
    let (mut a, mut b) = peers(now);

    a.session.connect(b.address, now);
    pump(&mut a, &mut b, now);
    a.recorder.take();
    b.recorder.take();

    a.session.end(now);
    assert_eq!(a.session.ready_state(), 0);
    assert_eq!(a.session.next_deadline(), None);

    pump(&mut a, &mut b, now);

    assert_eq!(
        a.recorder.take(),
        vec![Event::Removed("beta".to_string(), EndReason::Local)]
    );

    assert_eq!(
        b.recorder.take(),
        vec![Event::Removed("alpha".to_string(), EndReason::Peer)]
    );

    assert_eq!(b.session.streams().count(), 0);
    assert!(b.session.all_streams().is_empty());

    Ok(())
}

#[test]
fn handshake_timeout_removes_stream() -> Result<()> {
    let mut now = Instant::now();
    let mut a = Peer::new("alpha", 5004, 1, now);
    a.recorder.take();

    let silent = SocketAddr::from(([127, 0, 0, 1], 7004));
    a.session.connect(silent, now);

    let mut invitations = 0;
    for _ in 0..=INVITATION_ATTEMPTS {
        a.session.poll_timers(now);
        invitations += a.session.drain_outgoing().count();
        now += INVITATION_INTERVAL;
    }

    assert_eq!(invitations, INVITATION_ATTEMPTS as usize);
    assert!(a.session.all_streams().is_empty());
    assert_eq!(
        a.recorder.take(),
        vec![Event::Removed(String::new(), EndReason::HandshakeTimeout)]
    );

    Ok(())
}

#[test]
fn stray_datagrams_are_dropped() -> Result<()> {
    let now = Instant::now();
    let mut a = Peer::new("alpha", 5004, 1, now);
    let from = SocketAddr::from(([127, 0, 0, 1], 7004));

    // Too short for anything, then a MIDI packet from nobody.
    a.session.handle_datagram(Channel::Data, &[0x80], from, now);
    a.session.handle_datagram(
        Channel::Data,
        &[0x80, 0x61, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 9, 0x03, 0x90, 0x40, 0x7f],
        from,
        now + Duration::from_millis(1),
    );

    // An acceptance for an invitation that was never sent.
    let mut bytes = bytes::BytesMut::new();
    let accepted = rtpmidi_service::codec::control::Invitation::new(5, 9, "stray");
    ControlMessage::InvitationAccepted(accepted).encode(&mut bytes);
    a.session.handle_datagram(Channel::Control, &bytes, from, now);

    assert!(a.session.all_streams().is_empty());
    assert_eq!(a.session.drain_outgoing().count(), 0);

    Ok(())
}
