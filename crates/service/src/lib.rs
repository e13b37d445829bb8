//! AppleMIDI session engine.
//!
//! Everything in this crate is synchronous and runtime free. The caller owns
//! the sockets and the wall clock: it feeds received datagrams into
//! [`Session::handle_datagram`], fires due timers with
//! [`Session::poll_timers`], and sends whatever [`Session::drain_outgoing`]
//! returns.

pub mod clock;
pub mod queue;
pub mod session;
pub mod stream;
pub mod timer;

pub use self::{
    session::{Session, SessionInfo, SessionOptions},
    stream::{EndReason, Stream, StreamInfo, StreamState},
};

pub use codec;

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use codec::control::ControlMessage;

/// The two UDP ports of a session.
///
/// The control port is always even and the data port is always the control
/// port plus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Control,
    Data,
}

impl Channel {
    /// Which channel a port belongs to, by parity.
    ///
    /// # Test
    ///
    /// ```
    /// use rtpmidi_service::Channel;
    ///
    /// assert_eq!(Channel::of_port(5004), Channel::Control);
    /// assert_eq!(Channel::of_port(5005), Channel::Data);
    /// ```
    pub fn of_port(port: u16) -> Self {
        if port % 2 == 0 {
            Self::Control
        } else {
            Self::Data
        }
    }
}

/// Where outbound datagrams go.
///
/// The session never touches a socket, it only asks its transport to send
/// from the socket of `channel`.
pub trait Transport {
    fn send(&mut self, channel: Channel, to: SocketAddr, bytes: Bytes);
}

impl Transport for Vec<(Channel, SocketAddr, Bytes)> {
    fn send(&mut self, channel: Channel, to: SocketAddr, bytes: Bytes) {
        self.push((channel, to, bytes));
    }
}

/// Session events.
///
/// All methods have empty default bodies, implement only the ones you need.
pub trait SessionHandler: Send + Sync {
    /// Both session ports are bound and listening.
    #[allow(unused_variables)]
    fn on_ready(&self, session: &SessionInfo) {}

    /// A stream finished its handshake on both channels.
    #[allow(unused_variables)]
    fn on_stream_added(&self, stream: &Stream) {}

    /// A stream has ended and is about to be dropped.
    ///
    /// Streams that never finished their handshake are reported here as well
    /// when they time out or get rejected.
    #[allow(unused_variables)]
    fn on_stream_removed(&self, stream: &Stream, reason: EndReason) {}

    /// A MIDI command arrived on an established stream.
    ///
    /// `delta_time` is the accumulated delta of the command within its
    /// packet, in session ticks. `message` carries the raw MIDI octets,
    /// status first.
    #[allow(unused_variables)]
    fn on_message(&self, stream: &Stream, delta_time: u32, message: &[u8]) {}

    /// Any well formed control message, before it is dispatched.
    #[allow(unused_variables)]
    fn on_control_message(&self, from: SocketAddr, message: &ControlMessage) {}
}

impl<T: SessionHandler + ?Sized> SessionHandler for Arc<T> {
    fn on_ready(&self, session: &SessionInfo) {
        (**self).on_ready(session)
    }

    fn on_stream_added(&self, stream: &Stream) {
        (**self).on_stream_added(stream)
    }

    fn on_stream_removed(&self, stream: &Stream, reason: EndReason) {
        (**self).on_stream_removed(stream, reason)
    }

    fn on_message(&self, stream: &Stream, delta_time: u32, message: &[u8]) {
        (**self).on_message(stream, delta_time, message)
    }

    fn on_control_message(&self, from: SocketAddr, message: &ControlMessage) {
        (**self).on_control_message(from, message)
    }
}
