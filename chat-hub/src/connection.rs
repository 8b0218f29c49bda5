//! Per-connection state and the two tasks that move bytes for it.
//!
//! The inbound half decodes one packet at a time and hands it to the
//! [`Coordinator`]. The outbound half drains the connection's queue and writes
//! each frame under a deadline. They run independently so a peer that stops
//! reading never holds up anyone's input.

use std::{io, net::SocketAddr, sync::OnceLock, time::Duration};

use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
    time,
};
use tracing::{debug, info, warn};

use crate::{
    hub::{ConnectionId, Outbox},
    protocol::{ClientPacket, Frame, ProtocolError, ServerPacket, encode_frame, read_packet, write_frame},
    session::{Coordinator, Flow},
    store::Account,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

impl From<&Account> for Identity {
    fn from(account: &Account) -> Self {
        Self {
            user_id: account.id.clone(),
            username: account.username.clone(),
        }
    }
}

/// Timeouts and limits applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub outbound_capacity: usize,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_frame_len: usize,
}

/// One live session. The identity is bound at most once.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    identity: OnceLock<Identity>,
    outbox: Outbox,
}

impl Connection {
    pub fn new(outbox: Outbox, peer: Option<SocketAddr>) -> Self {
        Self {
            id: outbox.id(),
            peer,
            identity: OnceLock::new(),
            outbox,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    /// Binds the authenticated identity, handing it back if one is already bound.
    pub fn bind_identity(&self, identity: Identity) -> Result<(), Identity> {
        self.identity.set(identity)
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Queues a packet for this connection only. Dropped if the queue is full.
    pub fn send(&self, packet: &ServerPacket) {
        let frame = match encode_frame(packet) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(conn = self.id, error = %err, "failed to encode packet");
                return;
            }
        };
        if let Err(err) = self.outbox.try_push(frame) {
            debug!(conn = self.id, error = %err, "packet dropped");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    PeerClosed,
    Quit,
    IdleTimeout,
    OutboundClosed,
}

/// Runs a connection to completion: registers it, serves packets until the
/// peer leaves or the connection is torn down, then cleans up.
pub async fn serve_connection<S>(
    stream: S,
    id: ConnectionId,
    peer: Option<SocketAddr>,
    coordinator: &Coordinator,
    settings: ConnectionSettings,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (outbox, queue) = Outbox::channel(id, settings.outbound_capacity);
    let connection = Connection::new(outbox.clone(), peer);
    let outbound = tokio::spawn(run_outbound(writer, queue, outbox.clone(), settings.write_timeout));

    info!(conn = id, ?peer, "connection accepted");
    coordinator.attach(&connection);

    let mut reader = BufReader::new(reader);
    match run_inbound(&mut reader, &connection, coordinator, &settings).await {
        Ok(reason) => debug!(conn = id, ?reason, "inbound path finished"),
        Err(err) => warn!(conn = id, error = %err, "inbound path failed"),
    }

    coordinator.detach(&connection).await;
    outbox.close();
    if let Err(err) = outbound.await {
        warn!(conn = id, error = ?err, "outbound task failed");
    }

    let username = connection.identity().map(|identity| identity.username.as_str());
    info!(conn = id, ?peer, ?username, "connection closed");
}

async fn run_inbound<R>(
    reader: &mut R,
    connection: &Connection,
    coordinator: &Coordinator,
    settings: &ConnectionSettings,
) -> Result<Disconnect, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let read = select! {
            () = connection.outbox().closed() => return Ok(Disconnect::OutboundClosed),
            read = time::timeout(
                settings.idle_timeout,
                read_packet::<_, ClientPacket>(reader, settings.max_frame_len),
            ) => read,
        };

        let Ok(read) = read else {
            return Ok(Disconnect::IdleTimeout);
        };

        match read {
            Ok(Some(packet)) => {
                if coordinator.dispatch(connection, packet).await == Flow::Close {
                    return Ok(Disconnect::Quit);
                }
            }
            Ok(None) => return Ok(Disconnect::PeerClosed),
            Err(ProtocolError::Malformed(err)) => {
                debug!(conn = connection.id(), error = %err, "malformed packet");
                connection.send(&ServerPacket::error(format!("malformed packet: {err}")));
            }
            Err(err) => return Err(err),
        }
    }
}

async fn run_outbound<W>(
    mut writer: W,
    mut queue: mpsc::Receiver<Frame>,
    outbox: Outbox,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let id = outbox.id();
    loop {
        let next = select! {
            biased;
            frame = queue.recv() => frame,
            () = outbox.closed() => None,
        };
        let Some(frame) = next else {
            break;
        };
        if let Err(err) = write_with_deadline(&mut writer, &frame, write_timeout).await {
            debug!(conn = id, error = %err, "write failed; tearing down connection");
            outbox.close();
            return;
        }
    }

    // Flush what was queued before the close, e.g. the reply to `quit`.
    queue.close();
    while let Some(frame) = queue.recv().await {
        if let Err(err) = write_with_deadline(&mut writer, &frame, write_timeout).await {
            debug!(conn = id, error = %err, "write failed while draining");
            return;
        }
    }

    if let Ok(Err(err)) = time::timeout(write_timeout, writer.shutdown()).await {
        debug!(conn = id, error = %err, "failed to shut down writer cleanly");
    }
}

async fn write_with_deadline<W>(writer: &mut W, frame: &[u8], deadline: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match time::timeout(deadline, write_frame(writer, frame)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
    }
}
