use std::{
    io::{self, ErrorKind},
    time::{Duration, Instant},
};

use bytes::BytesMut;
use service::{Channel, Session, SessionHandler};
use tokio::{
    net::UdpSocket,
    sync::{
        mpsc::{UnboundedReceiver, error::TryRecvError},
        oneshot,
    },
    time,
};

use super::Command;

/// Large enough for any RTP-MIDI packet, which carries at most 4095 octets
/// of commands plus headers and journal.
const MAX_DATAGRAM_SIZE: usize = 8192;

/// Wake up interval when no timer is pending.
const IDLE_WAKEUP: Duration = Duration::from_secs(60);

/// Consecutive receive failures after which a socket is considered gone.
const MAX_RECV_ERRORS: u32 = 16;

/// Session event loop.
///
/// Owns both sockets. Every turn handles one input (a datagram, a command
/// or a due timer) plus every command already waiting, runs the timers that
/// became due, then sends whatever the session queued.
pub(super) async fn run<T>(
    mut session: Session<T>,
    control: UdpSocket,
    data: UdpSocket,
    mut receiver: UnboundedReceiver<Command>,
) where
    T: SessionHandler,
{
    let mut control_buffer = BytesMut::zeroed(MAX_DATAGRAM_SIZE);
    let mut data_buffer = BytesMut::zeroed(MAX_DATAGRAM_SIZE);
    let mut control_errors = RecvErrors::default();
    let mut data_errors = RecvErrors::default();
    let mut ended: Option<oneshot::Sender<()>> = None;
    let mut closing = false;

    loop {
        let deadline = session
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_WAKEUP);

        tokio::select! {
            ret = control.recv_from(&mut control_buffer) => match ret {
                Ok((size, addr)) => {
                    control_errors.succeeded();
                    session.handle_datagram(Channel::Control, &control_buffer[..size], addr, Instant::now());
                }
                Err(e) => closing = control_errors.failed(Channel::Control, &e),
            },
            ret = data.recv_from(&mut data_buffer) => match ret {
                Ok((size, addr)) => {
                    data_errors.succeeded();
                    session.handle_datagram(Channel::Data, &data_buffer[..size], addr, Instant::now());
                }
                Err(e) => closing = data_errors.failed(Channel::Data, &e),
            },
            command = receiver.recv() => match command {
                Some(command) => closing = handle_command(&mut session, command, &mut ended),
                // Every handle is gone.
                None => closing = true,
            },
            _ = time::sleep_until(time::Instant::from_std(deadline)) => (),
        }

        // Commands already waiting belong to this turn, so that messages
        // sent together leave in one bundle.
        while !closing {
            match receiver.try_recv() {
                Ok(command) => closing = handle_command(&mut session, command, &mut ended),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => closing = true,
            }
        }

        if closing {
            session.end(Instant::now());
        } else {
            session.poll_timers(Instant::now());
        }

        flush(&mut session, &control, &data).await;

        if closing {
            break;
        }
    }

    // Handles see the session as closed from here on.
    drop(receiver);

    log::info!(
        "session closed: name={}, port={}",
        session.options().local_name,
        session.options().port
    );

    if let Some(reply) = ended {
        let _ = reply.send(());
    }
}

/// Apply one command, returns whether the session should close.
fn handle_command<T>(session: &mut Session<T>, command: Command, ended: &mut Option<oneshot::Sender<()>>) -> bool
where
    T: SessionHandler,
{
    match command {
        Command::Connect(address) => {
            session.connect(address, Instant::now());
        }
        Command::SendMessage {
            comex_time,
            message,
            reply,
        } => {
            let _ = reply.send(session.send_message(comex_time, &message, Instant::now()));
        }
        Command::Info(reply) => {
            let _ = reply.send(session.info());
        }
        Command::End(reply) => {
            *ended = Some(reply);
            return true;
        }
    }

    false
}

async fn flush<T>(session: &mut Session<T>, control: &UdpSocket, data: &UdpSocket)
where
    T: SessionHandler,
{
    let outgoing = session.drain_outgoing().collect::<Vec<_>>();
    for (channel, to, bytes) in outgoing {
        let socket = match channel {
            Channel::Control => control,
            Channel::Data => data,
        };

        if let Err(e) = socket.send_to(&bytes, to).await {
            if e.kind() != ErrorKind::ConnectionReset {
                log::warn!(
                    "session send failed: to={}, channel={:?}, size={}, error={}",
                    to,
                    channel,
                    bytes.len(),
                    e
                );
            }
        }
    }
}

/// Consecutive receive failures of one socket.
#[derive(Debug, Default)]
struct RecvErrors(u32);

impl RecvErrors {
    /// Record a failed receive, returns whether the socket should be given
    /// up.
    fn failed(&mut self, channel: Channel, error: &io::Error) -> bool {
        // Note: An error is also reported when a peer host is shut down,
        // which says nothing about our socket.
        if matches!(
            error.kind(),
            ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused | ErrorKind::Interrupted
        ) {
            return false;
        }

        self.0 += 1;
        if self.0 >= MAX_RECV_ERRORS {
            log::error!(
                "session socket failed: channel={:?}, errors={}, error={}",
                channel,
                self.0,
                error
            );

            return true;
        }

        log::warn!("session recv_from failed: channel={:?}, error={}", channel, error);
        false
    }

    fn succeeded(&mut self) {
        self.0 = 0;
    }
}
