use std::{net::SocketAddr, time::Instant};

use bytes::{Bytes, BytesMut};
use codec::{
    DecodeResult, Decoder, Error, MidiMessage,
    control::ControlMessage,
    midi::{MidiCommand, MidiPayload},
};

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::{
    Channel, SessionHandler,
    clock::Clock,
    queue::OutboundQueue,
    stream::{Context, EndReason, Stream, StreamEvent, StreamId, StreamInfo, StreamTimer},
    timer::{TimerToken, Timers},
};

/// Deferred work of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Stream(StreamId, StreamTimer),
    Flush,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub local_name: String,
    /// Name announced to peers and advertised for discovery.
    pub bonjour_name: String,
    pub ssrc: u32,
    /// Control port, the data port is `port + 1`.
    pub port: u16,
    /// Coalesce the commands sent during one turn of the event loop into a
    /// single packet.
    pub bundle: bool,
    pub published: bool,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct SessionInfo {
    pub local_name: String,
    pub bonjour_name: String,
    pub ssrc: u32,
    pub port: u16,
    pub published: bool,
    pub ready_state: u8,
    pub streams: Vec<StreamInfo>,
}

struct Core {
    clock: Clock,
    ssrc: u32,
    name: String,
    timers: Timers<Task>,
    outgoing: Vec<(Channel, SocketAddr, Bytes)>,
    events: Vec<StreamEvent>,
    bytes: BytesMut,
}

impl Core {
    fn context(&mut self, now: Instant) -> Context<'_> {
        Context {
            ticks: self.clock.ticks(now),
            ssrc: self.ssrc,
            name: &self.name,
            timers: &mut self.timers,
            transport: &mut self.outgoing,
            events: &mut self.events,
            bytes: &mut self.bytes,
            now,
        }
    }
}

/// A local AppleMIDI endpoint and all of its peer streams.
///
/// The session is sans-io: it is driven entirely through its methods and
/// queues everything it wants to send in an outbox, see
/// [`Session::drain_outgoing`].
pub struct Session<T> {
    options: SessionOptions,
    core: Core,
    streams: Vec<Stream>,
    queue: OutboundQueue,
    flush_timer: Option<TimerToken>,
    next_id: u64,
    ready_state: u8,
    handler: T,
}

impl<T> Session<T>
where
    T: SessionHandler,
{
    pub fn new(options: SessionOptions, handler: T, now: Instant) -> Self {
        Self {
            core: Core {
                clock: Clock::new(now),
                ssrc: options.ssrc,
                name: options.bonjour_name.clone(),
                timers: Timers::default(),
                outgoing: Vec::with_capacity(16),
                events: Vec::with_capacity(4),
                bytes: BytesMut::with_capacity(1500),
            },
            streams: Vec::new(),
            queue: OutboundQueue::default(),
            flush_timer: None,
            ready_state: 0,
            next_id: 0,
            options,
            handler,
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn handler(&self) -> &T {
        &self.handler
    }

    pub fn ssrc(&self) -> u32 {
        self.core.ssrc
    }

    /// Session clock at `now`, in ticks.
    pub fn ticks(&self, now: Instant) -> u32 {
        self.core.clock.ticks(now)
    }

    /// Number of bound sockets, from 0 to 2.
    pub fn ready_state(&self) -> u8 {
        self.ready_state
    }

    pub fn is_ready(&self) -> bool {
        self.ready_state == 2
    }

    /// Record that one of the two sockets is listening.
    ///
    /// The session becomes ready once both are.
    pub fn listening(&mut self) {
        if self.ready_state >= 2 {
            return;
        }

        self.ready_state += 1;
        if self.ready_state == 2 {
            log::info!(
                "session ready: name={}, port={}, ssrc={}",
                self.options.local_name,
                self.options.port,
                self.core.ssrc
            );

            self.handler.on_ready(&self.info());
        }
    }

    /// Established streams, in creation order.
    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.iter().filter(|it| it.is_established())
    }

    /// Every stream, including those still in their handshake.
    pub fn all_streams(&self) -> &[Stream] {
        &self.streams
    }

    /// Find a stream by peer SSRC.
    pub fn get_stream(&self, ssrc: u32) -> Option<&Stream> {
        self.streams.iter().find(|it| it.ssrc() == Some(ssrc))
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            local_name: self.options.local_name.clone(),
            bonjour_name: self.options.bonjour_name.clone(),
            ssrc: self.core.ssrc,
            port: self.options.port,
            published: self.options.published,
            ready_state: self.ready_state,
            streams: self.streams().map(|it| it.info()).collect(),
        }
    }

    /// Invite a peer, `address` is its control port.
    pub fn connect(&mut self, address: SocketAddr, now: Instant) -> StreamId {
        self.next_id += 1;

        let id = StreamId(self.next_id);
        let mut stream = Stream::initiator(id);
        stream.connect(address, &mut self.core.context(now));
        self.streams.push(stream);
        id
    }

    /// Handle one datagram received on `channel`.
    ///
    /// Malformed datagrams and datagrams that belong to no stream are
    /// logged and dropped.
    pub fn handle_datagram(&mut self, channel: Channel, bytes: &[u8], from: SocketAddr, now: Instant) {
        match Decoder::decode(bytes) {
            Ok(DecodeResult::Control(message)) => {
                self.handle_control_message(channel, message, from, now)
            }
            Ok(DecodeResult::Midi(message)) => self.handle_midi_message(message, from, now),
            Err(e) => {
                log::warn!(
                    "session drop malformed datagram: from={}, channel={:?}, size={}, error={}",
                    from,
                    channel,
                    bytes.len(),
                    e
                );
            }
        }
    }

    fn handle_control_message(&mut self, channel: Channel, message: ControlMessage, from: SocketAddr, now: Instant) {
        self.handler.on_control_message(from, &message);

        let index = match self.streams.iter().position(|it| it.matches(&message)) {
            Some(index) => index,
            None => {
                if channel != Channel::Control || !matches!(message, ControlMessage::Invitation(_)) {
                    log::debug!(
                        "session drop control message: from={}, channel={:?}, command={}",
                        from,
                        channel,
                        message.command().name()
                    );

                    return;
                }

                self.next_id += 1;
                self.streams.push(Stream::responder(StreamId(self.next_id)));
                self.streams.len() - 1
            }
        };

        self.streams[index].handle_control_message(channel, &message, from, &mut self.core.context(now));
        self.dispatch(index);
    }

    fn handle_midi_message(&mut self, message: MidiMessage, from: SocketAddr, now: Instant) {
        let ssrc = message.rtp.header.ssrc;
        let Some(index) = self.streams.iter().position(|it| it.ssrc() == Some(ssrc)) else {
            log::debug!("session drop midi from unknown peer: from={}, ssrc={}", from, ssrc);
            return;
        };

        if !self.streams[index].handle_midi_message(&message, &mut self.core.context(now)) {
            return;
        }

        let stream = &self.streams[index];
        let mut delta_time = 0u32;
        for command in &message.payload.commands {
            delta_time = delta_time.wrapping_add(command.delta_time);
            self.handler.on_message(stream, delta_time, &command.to_bytes());
        }
    }

    /// Queue a MIDI command for every established stream.
    ///
    /// `comex_time` is the session tick at which the command should take
    /// effect, `None` means now. With bundling enabled the command waits
    /// for [`Session::poll_timers`] to flush the queue, otherwise it is
    /// sent right away.
    pub fn send_message(&mut self, comex_time: Option<u32>, message: &[u8], now: Instant) -> Result<(), Error> {
        let command = MidiCommand::new(0, message)?;
        let comex_time = comex_time.unwrap_or_else(|| self.core.clock.ticks(now));
        self.queue.push(comex_time, command);

        if !self.options.bundle {
            self.flush(now);
        } else if self.flush_timer.is_none() {
            self.flush_timer = Some(self.core.timers.schedule(now, Task::Flush));
        }

        Ok(())
    }

    /// Send everything queued as one packet per established stream.
    pub fn flush(&mut self, now: Instant) {
        if let Some(token) = self.flush_timer.take() {
            self.core.timers.cancel(token);
        }

        if self.queue.is_empty() {
            return;
        }

        let payload = MidiPayload::new(self.queue.drain(self.core.clock.ticks(now)));
        let mut ctx = self.core.context(now);
        for stream in self.streams.iter_mut().filter(|it| it.is_established()) {
            if !stream.send_message(&payload, &mut ctx) {
                log::trace!("session midi not sent: stream={:?}, synchronized={}", stream.id(), stream.is_synchronized());
            }
        }
    }

    /// Earliest instant at which [`Session::poll_timers`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.core.timers.next_deadline()
    }

    /// Run every task due at `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        while let Some(task) = self.core.timers.pop_expired(now) {
            match task {
                Task::Flush => {
                    self.flush_timer = None;
                    self.flush(now);
                }
                Task::Stream(id, timer) => {
                    let Some(index) = self.streams.iter().position(|it| it.id() == id) else {
                        continue;
                    };

                    self.streams[index].handle_timer(timer, &mut self.core.context(now));
                    self.dispatch(index);
                }
            }
        }
    }

    /// End every stream, one after the other, and stop the session.
    ///
    /// The BY messages are left in the outbox; the caller is expected to
    /// send them before closing its sockets.
    pub fn end(&mut self, now: Instant) {
        while !self.streams.is_empty() {
            let mut stream = self.streams.remove(0);
            stream.end(&mut self.core.context(now));
            self.core.events.clear();
            self.handler.on_stream_removed(&stream, EndReason::Local);
        }

        log::info!("session end: name={}, port={}", self.options.local_name, self.options.port);

        self.core.timers.clear();
        self.queue.clear();
        self.flush_timer = None;
        self.ready_state = 0;
    }

    /// Datagrams waiting to be sent, with the socket to send them from and
    /// their destination.
    pub fn drain_outgoing(&mut self) -> std::vec::Drain<'_, (Channel, SocketAddr, Bytes)> {
        self.core.outgoing.drain(..)
    }

    fn dispatch(&mut self, index: usize) {
        let mut ended = false;
        for event in self.core.events.drain(..) {
            match event {
                StreamEvent::Connected => self.handler.on_stream_added(&self.streams[index]),
                StreamEvent::Ended(reason) => {
                    self.handler.on_stream_removed(&self.streams[index], reason);
                    ended = true;
                }
            }
        }

        if ended {
            self.streams.remove(index);
        }
    }
}
