mod udp;

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use anyhow::{Result, anyhow};
use service::{Session, SessionHandler, SessionInfo, SessionOptions, StreamInfo};
use tokio::{
    net::UdpSocket,
    sync::{
        mpsc::{UnboundedSender, unbounded_channel},
        oneshot,
    },
};

pub(crate) enum Command {
    Connect(SocketAddr),
    SendMessage {
        comex_time: Option<u32>,
        message: Vec<u8>,
        reply: oneshot::Sender<Result<(), codec::Error>>,
    },
    Info(oneshot::Sender<SessionInfo>),
    End(oneshot::Sender<()>),
}

/// Handle to a running session.
///
/// Cheap to clone. The session keeps running until [`SessionHandle::end`]
/// is called or every handle is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    options: Arc<SessionOptions>,
    local_addr: SocketAddr,
    sender: UnboundedSender<Command>,
}

impl SessionHandle {
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Local control socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Invite a peer, `address` is its control port.
    pub fn connect(&self, address: SocketAddr) -> Result<()> {
        self.send(Command::Connect(address))
    }

    /// Send a MIDI command to every established stream.
    ///
    /// `comex_time` is the session tick at which the command should take
    /// effect, `None` means now.
    pub async fn send_message(&self, comex_time: Option<u32>, message: &[u8]) -> Result<()> {
        let (reply, receiver) = oneshot::channel();
        self.send(Command::SendMessage {
            message: message.to_vec(),
            comex_time,
            reply,
        })?;

        receiver.await??;
        Ok(())
    }

    pub async fn info(&self) -> Result<SessionInfo> {
        let (reply, receiver) = oneshot::channel();
        self.send(Command::Info(reply))?;
        Ok(receiver.await?)
    }

    /// Established streams.
    pub async fn streams(&self) -> Result<Vec<StreamInfo>> {
        Ok(self.info().await?.streams)
    }

    /// End every stream, then close both sockets.
    ///
    /// Resolves once the BY messages are sent. Ending a session that is
    /// already closed is not an error.
    pub async fn end(&self) -> Result<()> {
        let (reply, receiver) = oneshot::channel();
        if self.send(Command::End(reply)).is_ok() {
            let _ = receiver.await;
        }

        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| anyhow!("session is closed: name={}", self.options.local_name))
    }
}

/// Bind the control and data sockets of a session and run it.
///
/// The control port must be even, the data port is the one right after it.
/// `handler` is told about the session being ready before this returns.
pub async fn start_session<T>(options: SessionOptions, ip: IpAddr, handler: T) -> Result<SessionHandle>
where
    T: SessionHandler + 'static,
{
    if options.port == 0 || options.port % 2 != 0 {
        return Err(anyhow!("control port must be even: port={}", options.port));
    }

    let mut session = Session::new(options.clone(), handler, Instant::now());

    let control = UdpSocket::bind(SocketAddr::new(ip, options.port)).await?;
    session.listening();

    let data = UdpSocket::bind(SocketAddr::new(ip, options.port + 1)).await?;
    session.listening();

    let local_addr = control.local_addr()?;
    let (sender, receiver) = unbounded_channel();
    tokio::spawn(udp::run(session, control, data, receiver));

    log::info!(
        "session started: name={}, control={}, data={}",
        options.local_name,
        local_addr,
        SocketAddr::new(local_addr.ip(), local_addr.port() + 1)
    );

    Ok(SessionHandle {
        options: Arc::new(options),
        local_addr,
        sender,
    })
}
