use std::{net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use service::{
    EndReason, SessionHandler, SessionInfo, Stream, codec::control::ControlMessage,
};

use crate::mtc::MtcTracker;

/// Default session handler, logs session events and follows time code.
#[derive(Clone)]
pub struct Handler {
    session: Arc<str>,
    mtc: Arc<Mutex<MtcTracker>>,
}

impl Handler {
    pub fn new(session: &str) -> Self {
        Self {
            session: session.into(),
            mtc: Default::default(),
        }
    }

    /// Time code and song position received so far on this session.
    pub fn mtc(&self) -> MtcTracker {
        self.mtc.lock().clone()
    }
}

impl SessionHandler for Handler {
    fn on_ready(&self, session: &SessionInfo) {
        log::info!(
            "session ready: name={}, bonjour_name={}, port={}, ssrc={}",
            session.local_name,
            session.bonjour_name,
            session.port,
            session.ssrc
        );
    }

    fn on_stream_added(&self, stream: &Stream) {
        log::info!(
            "stream added: session={}, name={}, ssrc={:?}, address={:?}",
            self.session,
            stream.name(),
            stream.ssrc(),
            stream.control_address()
        );
    }

    fn on_stream_removed(&self, stream: &Stream, reason: EndReason) {
        log::info!(
            "stream removed: session={}, name={}, ssrc={:?}, reason={:?}",
            self.session,
            stream.name(),
            stream.ssrc(),
            reason
        );
    }

    fn on_message(&self, stream: &Stream, delta_time: u32, message: &[u8]) {
        let mut mtc = self.mtc.lock();
        if mtc.handle(message) {
            log::debug!(
                "time code: session={}, position={}, song_position={}",
                self.session,
                mtc.time_code(),
                mtc.song_position()
            );
        }

        log::trace!(
            "midi message: session={}, stream={}, delta_time={}, message={:02x?}",
            self.session,
            stream.name(),
            delta_time,
            message
        );
    }

    fn on_control_message(&self, from: SocketAddr, message: &ControlMessage) {
        log::trace!(
            "control message: session={}, from={}, command={}",
            self.session,
            from,
            message.command().name()
        );
    }
}
