use std::{
    collections::BTreeSet,
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use codec::{
    MidiMessage,
    control::{ControlMessage, Invitation, ReceiverFeedback, Synchronization},
    midi::MidiPayload,
    rtp::{PAYLOAD_TYPE_MIDI, RtpHeader, RtpPacket},
};

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::{
    Channel, Transport,
    clock::{ClockSync, sync_interval},
    session::Task,
    timer::{TimerToken, Timers},
};

/// Delay between two invitations of the same handshake stage.
pub const INVITATION_INTERVAL: Duration = Duration::from_millis(1500);

/// Invitations sent per handshake stage before giving up.
pub const INVITATION_ATTEMPTS: u32 = 40;

/// Quiet period after the last received packet before receiver feedback
/// is sent.
pub const RECEIVER_FEEDBACK_DELAY: Duration = Duration::from_secs(1);

/// Upper bound of the lost sequence number set.
pub const MAX_TRACKED_LOSSES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum StreamState {
    Idle,
    AwaitingInviteAccept1,
    AwaitingInviteAccept2,
    AwaitingChannel2Invite,
    Established,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum EndReason {
    /// Ended on this side.
    Local,
    /// The peer sent BY.
    Peer,
    /// The peer answered an invitation with NO.
    Rejected,
    /// A handshake stage ran out of invitation attempts.
    HandshakeTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamTimer {
    Invitation,
    Synchronization,
    ReceiverFeedback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Connected,
    Ended(EndReason),
}

/// What a stream needs from its session while handling an input.
pub struct Context<'a> {
    pub now: Instant,
    /// Session clock at `now`.
    pub ticks: u32,
    /// Session SSRC.
    pub ssrc: u32,
    /// Name announced in invitations and acceptances.
    pub name: &'a str,
    pub timers: &'a mut Timers<Task>,
    pub transport: &'a mut dyn Transport,
    pub events: &'a mut Vec<StreamEvent>,
    pub bytes: &'a mut BytesMut,
}

/// Snapshot of a stream, for listing and logging.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct StreamInfo {
    pub name: String,
    pub ssrc: Option<u32>,
    pub token: u32,
    pub state: StreamState,
    pub control: Option<SocketAddr>,
    pub data: Option<SocketAddr>,
    pub latency: Option<i64>,
    pub time_difference: Option<i64>,
    pub received_packets: u64,
    pub sent_packets: u64,
    pub lost_packets: usize,
}

/// One peer relationship inside a session.
///
/// A stream is created either by [`Stream::initiator`] followed by
/// [`Stream::connect`], or by [`Stream::responder`] when an invitation
/// arrives. It goes through the two channel handshake, then keeps its clock
/// synchronized and exchanges MIDI until either side ends it.
pub struct Stream {
    id: StreamId,
    role: Role,
    state: StreamState,
    token: u32,
    ssrc: Option<u32>,
    name: String,
    control: Option<SocketAddr>,
    data: Option<SocketAddr>,
    attempts: u32,
    invitation_timer: Option<TimerToken>,
    sync: ClockSync,
    sync_sent: u32,
    sync_timer: Option<TimerToken>,
    last_sent_sequence: u16,
    last_received_sequence: Option<u16>,
    lost: BTreeSet<u16>,
    feedback_timer: Option<TimerToken>,
    peer_acknowledged: Option<u16>,
    bitrate_limit: Option<u32>,
    received_packets: u64,
    sent_packets: u64,
}

impl Stream {
    fn new(id: StreamId, role: Role) -> Self {
        Self {
            id,
            role,
            state: StreamState::Idle,
            token: rand::random(),
            ssrc: None,
            name: String::new(),
            control: None,
            data: None,
            attempts: 0,
            invitation_timer: None,
            sync: ClockSync::default(),
            sync_sent: 0,
            sync_timer: None,
            last_sent_sequence: rand::random(),
            last_received_sequence: None,
            lost: BTreeSet::new(),
            feedback_timer: None,
            peer_acknowledged: None,
            bitrate_limit: None,
            received_packets: 0,
            sent_packets: 0,
        }
    }

    pub fn initiator(id: StreamId) -> Self {
        Self::new(id, Role::Initiator)
    }

    pub fn responder(id: StreamId) -> Self {
        Self::new(id, Role::Responder)
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == StreamState::Established
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    /// Peer SSRC, known once the peer has sent an invitation or acceptance.
    pub fn ssrc(&self) -> Option<u32> {
        self.ssrc
    }

    /// Peer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Peer control endpoint.
    pub fn control_address(&self) -> Option<SocketAddr> {
        self.control
    }

    /// Peer data endpoint.
    pub fn data_address(&self) -> Option<SocketAddr> {
        self.data
    }

    pub fn latency(&self) -> Option<i64> {
        self.sync.latency()
    }

    pub fn time_difference(&self) -> Option<i64> {
        self.sync.time_difference()
    }

    pub fn is_synchronized(&self) -> bool {
        self.sync.is_synchronized()
    }

    pub fn last_sent_sequence(&self) -> u16 {
        self.last_sent_sequence
    }

    pub fn last_received_sequence(&self) -> Option<u16> {
        self.last_received_sequence
    }

    /// Sequence numbers skipped over and not yet received late.
    pub fn lost_sequence_numbers(&self) -> Vec<u16> {
        self.lost.iter().copied().collect()
    }

    /// Last sequence number the peer reported with receiver feedback.
    pub fn peer_acknowledged(&self) -> Option<u16> {
        self.peer_acknowledged
    }

    /// Bitrate limit announced by the peer.
    pub fn bitrate_limit(&self) -> Option<u32> {
        self.bitrate_limit
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            name: self.name.clone(),
            ssrc: self.ssrc,
            token: self.token,
            state: self.state,
            control: self.control,
            data: self.data,
            latency: self.sync.latency(),
            time_difference: self.sync.time_difference(),
            received_packets: self.received_packets,
            sent_packets: self.sent_packets,
            lost_packets: self.lost.len(),
        }
    }

    /// Whether a control message belongs to this stream.
    ///
    /// Messages match by peer SSRC once it is known, and by initiator token
    /// during the handshake.
    pub fn matches(&self, message: &ControlMessage) -> bool {
        if self.ssrc == Some(message.ssrc()) {
            return true;
        }

        message.token() == Some(self.token)
    }

    /// Start the handshake towards the control port of a peer.
    pub fn connect(&mut self, address: SocketAddr, ctx: &mut Context) {
        if self.state != StreamState::Idle {
            return;
        }

        log::info!(
            "stream connect: id={:?}, address={}, token={}",
            self.id,
            address,
            self.token
        );

        self.control = Some(address);
        self.state = StreamState::AwaitingInviteAccept1;
        self.attempts = 0;
        self.send_invitation(ctx);
    }

    /// Handle a control message routed to this stream.
    pub fn handle_control_message(
        &mut self,
        channel: Channel,
        message: &ControlMessage,
        from: SocketAddr,
        ctx: &mut Context,
    ) {
        if self.state == StreamState::Ended {
            return;
        }

        match message {
            ControlMessage::Invitation(it) => self.on_invitation(channel, it, from, ctx),
            ControlMessage::InvitationAccepted(it) => {
                self.on_invitation_accepted(channel, it, from, ctx)
            }
            ControlMessage::InvitationRejected(it) => {
                log::warn!(
                    "stream invitation rejected: id={:?}, address={}, name={}",
                    self.id,
                    from,
                    it.name
                );

                self.finish(EndReason::Rejected, ctx);
            }
            ControlMessage::End(_) => {
                log::info!("stream ended by peer: id={:?}, name={}", self.id, self.name);

                self.finish(EndReason::Peer, ctx);
            }
            ControlMessage::Synchronization(it) => self.on_synchronization(it, from, ctx),
            ControlMessage::ReceiverFeedback(it) => {
                self.peer_acknowledged = Some(it.sequence_number);
            }
            ControlMessage::BitrateReceiveLimit(it) => {
                log::info!(
                    "stream bitrate receive limit: id={:?}, limit={}",
                    self.id,
                    it.limit
                );

                self.bitrate_limit = Some(it.limit);
            }
        }
    }

    fn on_invitation(&mut self, channel: Channel, invitation: &Invitation, from: SocketAddr, ctx: &mut Context) {
        match (self.state, channel) {
            (StreamState::Idle, Channel::Control) => {
                self.token = invitation.token;
                self.ssrc = Some(invitation.ssrc);
                self.name = invitation.name.clone();
                self.control = Some(from);
                self.state = StreamState::AwaitingChannel2Invite;

                log::info!(
                    "stream invited: id={:?}, address={}, name={}, ssrc={}",
                    self.id,
                    from,
                    self.name,
                    invitation.ssrc
                );

                self.accept(Channel::Control, from, ctx);
            }
            (StreamState::AwaitingChannel2Invite, Channel::Data) => {
                self.data = Some(from);
                self.accept(Channel::Data, from, ctx);
                self.establish(ctx);
            }
            // The peer did not get our acceptance, answer again.
            (StreamState::AwaitingChannel2Invite | StreamState::Established, _) => {
                self.accept(channel, from, ctx);
            }
            (state, channel) => {
                log::debug!(
                    "stream unexpected invitation: id={:?}, state={:?}, channel={:?}",
                    self.id,
                    state,
                    channel
                );
            }
        }
    }

    fn on_invitation_accepted(&mut self, channel: Channel, invitation: &Invitation, from: SocketAddr, ctx: &mut Context) {
        match (self.state, channel) {
            (StreamState::AwaitingInviteAccept1, Channel::Control) => {
                self.ssrc = Some(invitation.ssrc);
                self.name = invitation.name.clone();
                self.control = Some(from);
                self.data = Some(SocketAddr::new(from.ip(), from.port().wrapping_add(1)));
                self.state = StreamState::AwaitingInviteAccept2;
                self.attempts = 0;

                log::info!(
                    "stream control channel accepted: id={:?}, name={}, ssrc={}",
                    self.id,
                    self.name,
                    invitation.ssrc
                );

                self.send_invitation(ctx);
            }
            (StreamState::AwaitingInviteAccept2, Channel::Data) => {
                self.data = Some(from);
                self.establish(ctx);
            }
            (state, channel) => {
                log::debug!(
                    "stream unexpected acceptance: id={:?}, state={:?}, channel={:?}",
                    self.id,
                    state,
                    channel
                );
            }
        }
    }

    fn on_synchronization(&mut self, message: &Synchronization, from: SocketAddr, ctx: &mut Context) {
        if self.state != StreamState::Established {
            return;
        }

        let synchronized = self.sync.is_synchronized();
        if let Some(reply) = self.sync.respond(ctx.ssrc, message, ctx.ticks) {
            let to = self.data.unwrap_or(from);
            send_control(&ControlMessage::Synchronization(reply), Channel::Data, to, ctx);
        }

        if !synchronized && self.sync.is_synchronized() {
            log::info!(
                "stream synchronized: id={:?}, name={}, latency={:?}, time_difference={:?}",
                self.id,
                self.name,
                self.sync.latency(),
                self.sync.time_difference()
            );
        }
    }

    /// Handle an RTP-MIDI packet routed to this stream.
    ///
    /// Returns whether the commands should be delivered, which is only the
    /// case on an established stream.
    pub fn handle_midi_message(&mut self, message: &MidiMessage, ctx: &mut Context) -> bool {
        if self.state != StreamState::Established {
            return false;
        }

        self.track_sequence(message.rtp.header.sequence_number);
        self.received_packets += 1;

        if let Some(token) = self.feedback_timer.take() {
            ctx.timers.cancel(token);
        }

        self.feedback_timer = Some(ctx.timers.schedule(
            ctx.now + RECEIVER_FEEDBACK_DELAY,
            Task::Stream(self.id, StreamTimer::ReceiverFeedback),
        ));

        true
    }

    fn track_sequence(&mut self, sequence: u16) {
        let Some(last) = self.last_received_sequence else {
            self.last_received_sequence = Some(sequence);
            return;
        };

        // Half the sequence space ahead counts as newer, the rest as late.
        let gap = sequence.wrapping_sub(last);
        if gap == 0 {
            return;
        }

        if gap < 0x8000 {
            let mut missing = last.wrapping_add(1);
            while missing != sequence && self.lost.len() < MAX_TRACKED_LOSSES {
                self.lost.insert(missing);
                missing = missing.wrapping_add(1);
            }

            self.last_received_sequence = Some(sequence);
        } else {
            self.lost.remove(&sequence);
        }
    }

    /// Send a command list to the peer data port.
    ///
    /// Returns false and sends nothing until the stream is established and
    /// its clock synchronized.
    pub fn send_message(&mut self, payload: &MidiPayload, ctx: &mut Context) -> bool {
        if self.state != StreamState::Established || !self.sync.is_synchronized() {
            return false;
        }

        let Some(to) = self.data else {
            return false;
        };

        let mut body = BytesMut::new();
        if let Err(e) = payload.encode(&mut body) {
            log::warn!("stream encode midi failed: id={:?}, error={}", self.id, e);
            return false;
        }

        let sequence_number = self.last_sent_sequence.wrapping_add(1);
        let packet = RtpPacket {
            header: RtpHeader {
                payload_type: PAYLOAD_TYPE_MIDI,
                timestamp: ctx.ticks,
                ssrc: ctx.ssrc,
                sequence_number,
                ..Default::default()
            },
            payload: &body[..],
        };

        if let Err(e) = packet.encode(ctx.bytes) {
            log::warn!("stream encode rtp failed: id={:?}, error={}", self.id, e);
            return false;
        }

        ctx.transport.send(Channel::Data, to, ctx.bytes.split().freeze());
        self.last_sent_sequence = sequence_number;
        self.sent_packets += 1;
        true
    }

    /// Handle one of this stream's timers.
    pub fn handle_timer(&mut self, timer: StreamTimer, ctx: &mut Context) {
        match timer {
            StreamTimer::Invitation => {
                self.invitation_timer = None;
                if !matches!(
                    self.state,
                    StreamState::AwaitingInviteAccept1 | StreamState::AwaitingInviteAccept2
                ) {
                    return;
                }

                if self.attempts >= INVITATION_ATTEMPTS {
                    log::warn!(
                        "stream handshake timeout: id={:?}, state={:?}, address={:?}",
                        self.id,
                        self.state,
                        self.control
                    );

                    self.finish(EndReason::HandshakeTimeout, ctx);
                } else {
                    self.send_invitation(ctx);
                }
            }
            StreamTimer::Synchronization => {
                self.sync_timer = None;
                if self.state == StreamState::Established {
                    self.synchronize(ctx);
                }
            }
            StreamTimer::ReceiverFeedback => {
                self.feedback_timer = None;
                if self.state != StreamState::Established {
                    return;
                }

                if let (Some(to), Some(sequence_number)) = (self.control, self.last_received_sequence) {
                    let message = ControlMessage::ReceiverFeedback(ReceiverFeedback {
                        ssrc: ctx.ssrc,
                        sequence_number,
                    });

                    send_control(&message, Channel::Control, to, ctx);
                }
            }
        }
    }

    /// End the stream from this side.
    ///
    /// The peer gets a BY if it already knows about the stream.
    pub fn end(&mut self, ctx: &mut Context) {
        if self.state == StreamState::Ended {
            return;
        }

        let notify = matches!(
            self.state,
            StreamState::AwaitingInviteAccept2
                | StreamState::AwaitingChannel2Invite
                | StreamState::Established
        );

        if let (true, Some(to)) = (notify, self.control) {
            let message = ControlMessage::End(Invitation::new(self.token, ctx.ssrc, ctx.name));
            send_control(&message, Channel::Control, to, ctx);
        }

        log::info!("stream end: id={:?}, name={}", self.id, self.name);

        self.finish(EndReason::Local, ctx);
    }

    fn send_invitation(&mut self, ctx: &mut Context) {
        let (channel, target) = match self.state {
            StreamState::AwaitingInviteAccept1 => (Channel::Control, self.control),
            StreamState::AwaitingInviteAccept2 => (Channel::Data, self.data),
            _ => return,
        };

        let Some(to) = target else {
            return;
        };

        self.attempts += 1;

        let message = ControlMessage::Invitation(Invitation::new(self.token, ctx.ssrc, ctx.name));
        send_control(&message, channel, to, ctx);

        if let Some(token) = self.invitation_timer.take() {
            ctx.timers.cancel(token);
        }

        self.invitation_timer = Some(ctx.timers.schedule(
            ctx.now + INVITATION_INTERVAL,
            Task::Stream(self.id, StreamTimer::Invitation),
        ));
    }

    fn accept(&self, channel: Channel, to: SocketAddr, ctx: &mut Context) {
        let message = ControlMessage::InvitationAccepted(Invitation::new(self.token, ctx.ssrc, ctx.name));
        send_control(&message, channel, to, ctx);
    }

    fn establish(&mut self, ctx: &mut Context) {
        if let Some(token) = self.invitation_timer.take() {
            ctx.timers.cancel(token);
        }

        self.state = StreamState::Established;
        ctx.events.push(StreamEvent::Connected);

        log::info!(
            "stream established: id={:?}, name={}, control={:?}, data={:?}",
            self.id,
            self.name,
            self.control,
            self.data
        );

        self.sync_sent = 0;
        self.synchronize(ctx);
    }

    fn synchronize(&mut self, ctx: &mut Context) {
        if let Some(to) = self.data {
            let message = ClockSync::start_exchange(ctx.ssrc, ctx.ticks);
            send_control(&ControlMessage::Synchronization(message), Channel::Data, to, ctx);
        }

        self.sync_sent = self.sync_sent.saturating_add(1);
        self.sync_timer = Some(ctx.timers.schedule(
            ctx.now + sync_interval(self.sync_sent),
            Task::Stream(self.id, StreamTimer::Synchronization),
        ));
    }

    fn finish(&mut self, reason: EndReason, ctx: &mut Context) {
        if self.state == StreamState::Ended {
            return;
        }

        for token in [
            self.invitation_timer.take(),
            self.sync_timer.take(),
            self.feedback_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            ctx.timers.cancel(token);
        }

        self.state = StreamState::Ended;
        ctx.events.push(StreamEvent::Ended(reason));
    }
}

fn send_control(message: &ControlMessage, channel: Channel, to: SocketAddr, ctx: &mut Context) {
    message.encode(ctx.bytes);
    ctx.transport.send(channel, to, ctx.bytes.split().freeze());
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use codec::{
        control::{BitrateReceiveLimit, ControlCommand},
        midi::MidiCommand,
    };

    use super::*;
    use crate::clock::Clock;

    const PEER_SSRC: u32 = 0x0102_0304;
    const LOCAL_SSRC: u32 = 0x0a0b_0c0d;

    struct Harness {
        origin: Instant,
        now: Instant,
        timers: Timers<Task>,
        sent: Vec<(Channel, SocketAddr, Bytes)>,
        events: Vec<StreamEvent>,
        bytes: BytesMut,
    }

    impl Harness {
        fn new() -> Self {
            let now = Instant::now();
            Self {
                origin: now,
                now,
                timers: Timers::default(),
                sent: Vec::new(),
                events: Vec::new(),
                bytes: BytesMut::new(),
            }
        }

        fn ctx(&mut self) -> Context<'_> {
            Context {
                now: self.now,
                ticks: Clock::new(self.origin).ticks(self.now),
                ssrc: LOCAL_SSRC,
                name: "local",
                timers: &mut self.timers,
                transport: &mut self.sent,
                events: &mut self.events,
                bytes: &mut self.bytes,
            }
        }

        fn sent(&mut self) -> Vec<(SocketAddr, ControlMessage)> {
            self.sent
                .drain(..)
                .filter_map(|(_, to, bytes)| Some((to, ControlMessage::decode(&bytes).ok()?)))
                .collect()
        }

        /// Advance the clock and fire every due timer of `stream`.
        fn advance(&mut self, stream: &mut Stream, by: Duration) {
            self.now += by;
            while let Some(task) = self.timers.pop_expired(self.now) {
                if let Task::Stream(_, timer) = task {
                    stream.handle_timer(timer, &mut self.ctx());
                }
            }
        }
    }

    fn peer_control() -> SocketAddr {
        "10.0.0.2:5004".parse().unwrap()
    }

    fn peer_data() -> SocketAddr {
        "10.0.0.2:5005".parse().unwrap()
    }

    fn invitation(command: fn(Invitation) -> ControlMessage) -> ControlMessage {
        command(Invitation::new(7, PEER_SSRC, "peer"))
    }

    fn established(harness: &mut Harness) -> Stream {
        let mut stream = Stream::responder(StreamId(1));
        let message = invitation(ControlMessage::Invitation);
        stream.handle_control_message(Channel::Control, &message, peer_control(), &mut harness.ctx());
        stream.handle_control_message(Channel::Data, &message, peer_data(), &mut harness.ctx());
        harness.sent.clear();
        harness.events.clear();
        stream
    }

    fn midi(sequence_number: u16) -> MidiMessage<'static> {
        MidiMessage {
            rtp: RtpPacket {
                header: RtpHeader {
                    payload_type: PAYLOAD_TYPE_MIDI,
                    ssrc: PEER_SSRC,
                    sequence_number,
                    ..Default::default()
                },
                payload: &[],
            },
            payload: MidiPayload::new(vec![]),
        }
    }

    fn synchronize(stream: &mut Stream, harness: &mut Harness) {
        let message = ControlMessage::Synchronization(Synchronization {
            timestamps: [100, 150, 250],
            ssrc: PEER_SSRC,
            count: 2,
        });

        stream.handle_control_message(Channel::Data, &message, peer_data(), &mut harness.ctx());
    }

    #[test]
    fn responder_handshake() {
        let mut harness = Harness::new();
        let mut stream = Stream::responder(StreamId(1));
        let message = invitation(ControlMessage::Invitation);

        stream.handle_control_message(Channel::Control, &message, peer_control(), &mut harness.ctx());
        assert_eq!(stream.state(), StreamState::AwaitingChannel2Invite);
        assert_eq!(stream.token(), 7);
        assert_eq!(stream.ssrc(), Some(PEER_SSRC));
        assert_eq!(stream.name(), "peer");

        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer_control());
        assert_eq!(sent[0].1.command(), ControlCommand::InvitationAccepted);
        assert_eq!(sent[0].1.token(), Some(7));

        stream.handle_control_message(Channel::Data, &message, peer_data(), &mut harness.ctx());
        assert!(stream.is_established());
        assert_eq!(stream.data_address(), Some(peer_data()));
        assert_eq!(harness.events, vec![StreamEvent::Connected]);

        let sent = harness.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1.command(), ControlCommand::InvitationAccepted);
        assert_eq!(sent[1].0, peer_data());
        assert!(matches!(sent[1].1, ControlMessage::Synchronization(Synchronization { count: 0, .. })));
    }

    #[test]
    fn initiator_handshake() {
        let mut harness = Harness::new();
        let mut stream = Stream::initiator(StreamId(1));

        stream.connect(peer_control(), &mut harness.ctx());
        assert_eq!(stream.state(), StreamState::AwaitingInviteAccept1);

        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer_control());
        assert_eq!(sent[0].1.command(), ControlCommand::Invitation);
        assert_eq!(sent[0].1.token(), Some(stream.token()));

        let accepted = ControlMessage::InvitationAccepted(Invitation::new(stream.token(), PEER_SSRC, "peer"));
        stream.handle_control_message(Channel::Control, &accepted, peer_control(), &mut harness.ctx());
        assert_eq!(stream.state(), StreamState::AwaitingInviteAccept2);
        assert_eq!(stream.name(), "peer");

        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer_data());
        assert_eq!(sent[0].1.command(), ControlCommand::Invitation);

        // A late duplicate on the control channel changes nothing.
        stream.handle_control_message(Channel::Control, &accepted, peer_control(), &mut harness.ctx());
        assert_eq!(stream.state(), StreamState::AwaitingInviteAccept2);

        stream.handle_control_message(Channel::Data, &accepted, peer_data(), &mut harness.ctx());
        assert!(stream.is_established());
        assert_eq!(harness.events, vec![StreamEvent::Connected]);
    }

    #[test]
    fn handshake_timeout() {
        let mut harness = Harness::new();
        let mut stream = Stream::initiator(StreamId(1));
        stream.connect(peer_control(), &mut harness.ctx());

        for _ in 0..INVITATION_ATTEMPTS {
            harness.advance(&mut stream, INVITATION_INTERVAL);
        }

        let invitations = harness
            .sent()
            .into_iter()
            .filter(|(_, it)| it.command() == ControlCommand::Invitation)
            .count();

        assert_eq!(invitations, INVITATION_ATTEMPTS as usize);
        assert_eq!(stream.state(), StreamState::Ended);
        assert_eq!(harness.events, vec![StreamEvent::Ended(EndReason::HandshakeTimeout)]);
        assert!(harness.timers.is_empty());
    }

    #[test]
    fn rejected_invitation() {
        let mut harness = Harness::new();
        let mut stream = Stream::initiator(StreamId(1));
        stream.connect(peer_control(), &mut harness.ctx());

        let rejected = ControlMessage::InvitationRejected(Invitation::new(stream.token(), PEER_SSRC, "peer"));
        stream.handle_control_message(Channel::Control, &rejected, peer_control(), &mut harness.ctx());

        assert_eq!(stream.state(), StreamState::Ended);
        assert_eq!(harness.events, vec![StreamEvent::Ended(EndReason::Rejected)]);
        assert!(harness.timers.is_empty());
    }

    #[test]
    fn sync_burst_schedule() {
        let mut harness = Harness::new();
        let mut stream = established(&mut harness);

        for _ in 0..9 {
            harness.advance(&mut stream, Duration::from_millis(1500));
        }

        // Nine more after the one sent on establishment.
        assert_eq!(harness.sent().len(), 9);

        harness.advance(&mut stream, Duration::from_millis(1500));
        assert!(harness.sent().is_empty());

        harness.advance(&mut stream, Duration::from_millis(8500));
        assert_eq!(harness.sent().len(), 1);
    }

    #[test]
    fn lost_sequence_numbers() {
        let mut harness = Harness::new();
        let mut stream = established(&mut harness);

        for sequence in [1, 2, 4, 5] {
            assert!(stream.handle_midi_message(&midi(sequence), &mut harness.ctx()));
        }

        assert_eq!(stream.lost_sequence_numbers(), vec![3]);
        assert_eq!(stream.last_received_sequence(), Some(5));

        stream.handle_midi_message(&midi(3), &mut harness.ctx());
        assert!(stream.lost_sequence_numbers().is_empty());
        assert_eq!(stream.last_received_sequence(), Some(5));
    }

    #[test]
    fn lost_sequence_numbers_across_wrap() {
        let mut harness = Harness::new();
        let mut stream = established(&mut harness);

        for sequence in [65534, 1] {
            stream.handle_midi_message(&midi(sequence), &mut harness.ctx());
        }

        assert_eq!(stream.lost_sequence_numbers(), vec![0, 65535]);
    }

    #[test]
    fn receiver_feedback_is_debounced() {
        let mut harness = Harness::new();
        let mut stream = established(&mut harness);

        // Keep the sync timer out of the way.
        harness.timers.clear();

        for sequence in 10..15 {
            stream.handle_midi_message(&midi(sequence), &mut harness.ctx());
            harness.advance(&mut stream, Duration::from_millis(500));
        }

        assert!(harness.sent().is_empty());

        harness.advance(&mut stream, Duration::from_millis(500));
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer_control());
        assert_eq!(
            sent[0].1,
            ControlMessage::ReceiverFeedback(ReceiverFeedback {
                ssrc: LOCAL_SSRC,
                sequence_number: 14,
            })
        );
    }

    #[test]
    fn midi_before_established_is_dropped() {
        let mut harness = Harness::new();
        let mut stream = Stream::responder(StreamId(1));

        assert!(!stream.handle_midi_message(&midi(1), &mut harness.ctx()));
        assert_eq!(stream.last_received_sequence(), None);
    }

    #[test]
    fn send_requires_sync() {
        let mut harness = Harness::new();
        let mut stream = established(&mut harness);
        let payload = MidiPayload::new(vec![MidiCommand::new(0, &[0x90, 0x40, 0x7f]).unwrap()]);

        assert!(!stream.send_message(&payload, &mut harness.ctx()));
        assert!(harness.sent.is_empty());

        synchronize(&mut stream, &mut harness);
        assert!(stream.is_synchronized());
        assert_eq!(stream.latency(), Some(150));
        assert_eq!(stream.time_difference(), Some(-50));

        let first = stream.last_sent_sequence();
        assert!(stream.send_message(&payload, &mut harness.ctx()));
        assert_eq!(stream.last_sent_sequence(), first.wrapping_add(1));

        let (channel, to, bytes) = harness.sent.pop().unwrap();
        assert_eq!(channel, Channel::Data);
        assert_eq!(to, peer_data());

        let packet = RtpPacket::decode(&bytes).unwrap();
        assert_eq!(packet.header.payload_type, PAYLOAD_TYPE_MIDI);
        assert_eq!(packet.header.ssrc, LOCAL_SSRC);
        assert_eq!(packet.header.sequence_number, first.wrapping_add(1));
        assert_eq!(MidiPayload::decode(packet.payload).unwrap(), payload);
    }

    #[test]
    fn peer_end() {
        let mut harness = Harness::new();
        let mut stream = established(&mut harness);

        stream.handle_control_message(
            Channel::Control,
            &invitation(ControlMessage::End),
            peer_control(),
            &mut harness.ctx(),
        );

        assert_eq!(stream.state(), StreamState::Ended);
        assert_eq!(harness.events, vec![StreamEvent::Ended(EndReason::Peer)]);
        assert!(harness.sent.is_empty());
        assert!(harness.timers.is_empty());

        stream.end(&mut harness.ctx());
        assert_eq!(harness.events.len(), 1);
        assert!(harness.sent.is_empty());
    }

    #[test]
    fn local_end() {
        let mut harness = Harness::new();
        let mut stream = established(&mut harness);

        stream.end(&mut harness.ctx());

        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer_control());
        assert_eq!(sent[0].1.command(), ControlCommand::End);
        assert_eq!(harness.events, vec![StreamEvent::Ended(EndReason::Local)]);
    }

    #[test]
    fn feedback_and_limit_are_recorded() {
        let mut harness = Harness::new();
        let mut stream = established(&mut harness);

        let feedback = ControlMessage::ReceiverFeedback(ReceiverFeedback {
            ssrc: PEER_SSRC,
            sequence_number: 42,
        });

        let limit = ControlMessage::BitrateReceiveLimit(BitrateReceiveLimit {
            ssrc: PEER_SSRC,
            limit: 64_000,
        });

        stream.handle_control_message(Channel::Control, &feedback, peer_control(), &mut harness.ctx());
        stream.handle_control_message(Channel::Control, &limit, peer_control(), &mut harness.ctx());

        assert_eq!(stream.peer_acknowledged(), Some(42));
        assert_eq!(stream.bitrate_limit(), Some(64_000));
    }
}
