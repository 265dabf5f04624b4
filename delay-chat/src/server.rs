use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Result, bail};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::{
    codec::IdcCodec,
    commands::Dispatcher,
    directory::Directory,
    error::UserError,
    message::{Message, recover_label},
    session::{Session, SessionId},
};

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(listener: TcpListener, directory: Directory) -> Self {
        Self {
            listener,
            state: Arc::new(ServerState::new(directory)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Shared by every connection task.
pub struct ServerState {
    dispatcher: Dispatcher,
    next_id: AtomicU64,
}

impl ServerState {
    pub fn new(directory: Directory) -> Self {
        Self {
            dispatcher: Dispatcher::new(Arc::new(directory)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, state: &Arc<ServerState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, state).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

/// Drives one connection from accept to close.
///
/// Works over any byte stream, so tests can use in-memory pipes. Decode
/// errors are answered and the loop continues; a read, write, or framing
/// error ends the connection. Either way the session leaves its account on
/// the way out.
pub async fn handle_connection<S>(stream: S, state: Arc<ServerState>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = state.next_id();
    let (reader, writer) = tokio::io::split(stream);
    let mut frames = FramedRead::new(reader, IdcCodec::default());

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_outbound(
        FramedWrite::new(writer, IdcCodec::default()),
        outbound_rx,
        id,
    ));

    let mut session = Session::new(id, outbound_tx);
    info!(session = id, "connection opened");

    let result = run_session(&mut frames, &mut session, state.dispatcher()).await;

    session.close().await;
    // Dropping the last sender lets the writer flush what is queued and stop.
    drop(session);
    if let Err(err) = writer_task.await {
        debug!(session = id, error = ?err, "writer task failed");
    }
    info!(session = id, "connection closed");

    result
}

async fn run_session<R>(
    frames: &mut FramedRead<R, IdcCodec>,
    session: &mut Session,
    dispatcher: &Dispatcher,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    // A failed write drops the outbound receiver, which ends the read loop.
    let writer = session.handle().clone();
    loop {
        let frame = select! {
            frame = frames.next() => frame,
            _ = writer.closed() => bail!("connection is no longer writable"),
        };
        let Some(frame) = frame else {
            break;
        };
        let line = frame?;
        match Message::decode(&line) {
            Ok(Some(message)) => {
                debug!(session = session.id(), command = message.command(), "received");
                dispatcher.handle(session, &message).await;
            }
            Ok(None) => continue,
            Err(err) => {
                debug!(session = session.id(), error = %err, "failed to decode line");
                let label = recover_label(&line);
                session.reply(&UserError::from(err).to_reply(label.as_deref()));
            }
        }
    }
    Ok(())
}

async fn write_outbound<W>(
    mut sink: FramedWrite<W, IdcCodec>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    id: SessionId,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = outbound.recv().await {
        if let Err(err) = sink.send(payload).await {
            debug!(session = id, error = ?err, "failed to write to connection");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{AccountConfig, DirectoryConfig, OFFLINE_MESSAGES},
        delivery,
    };
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadBuf},
        time::timeout,
    };

    /// Reads from a pipe but refuses every write, like a peer that vanished.
    struct WriteFails(DuplexStream);

    impl AsyncRead for WriteFails {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for WriteFails {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn state() -> Arc<ServerState> {
        let directory = Directory::from_config(&DirectoryConfig {
            accounts: vec![AccountConfig::new("alice", "pw").with_option(OFFLINE_MESSAGES)],
            channels: Vec::new(),
        })
        .expect("valid directory");
        Arc::new(ServerState::new(directory))
    }

    async fn read_line<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("read line");
        line
    }

    #[tokio::test]
    async fn malformed_line_is_answered_and_connection_continues() {
        let state = state();
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(server, Arc::clone(&state)));
        let (reader, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(reader);

        writer
            .write_all(b"PING\tLABEL=7\tCOOKIE=a\\qb\r\n\r\nPING\tCOOKIE=ok\r\n")
            .await
            .unwrap();

        let error = Message::decode(read_line(&mut reader).await.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(error.command(), "ERROR");
        assert_eq!(error.arg("PROBLEM"), Some("ERR_UNKNOWN_ESCAPE"));
        assert_eq!(error.arg("LABEL"), Some("7"));

        assert_eq!(read_line(&mut reader).await, "PONG\tCOOKIE=ok\r\n");

        writer.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closing_the_connection_detaches_the_session() {
        let state = state();
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(server, Arc::clone(&state)));
        let (reader, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(reader);

        writer
            .write_all(b"LOGIN\tUSERNAME=alice\tPASSWORD=pw\r\n")
            .await
            .unwrap();
        assert!(read_line(&mut reader).await.starts_with("LOGIN_GOOD"));
        assert_eq!(read_line(&mut reader).await, "END_ROSTER\r\n");
        assert_eq!(read_line(&mut reader).await, "END_OFFLINE_MESSAGES\r\n");

        let alice = state.dispatcher().directory().find_account("alice").unwrap();
        assert_eq!(alice.live_session_count().await, 1);

        writer.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(alice.live_session_count().await, 0);
    }

    #[tokio::test]
    async fn failed_write_closes_the_session_and_queues_later_messages() {
        let state = state();
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(WriteFails(server), Arc::clone(&state)));

        client
            .write_all(b"LOGIN\tUSERNAME=alice\tPASSWORD=pw\r\n")
            .await
            .unwrap();

        let result = timeout(Duration::from_secs(1), task)
            .await
            .expect("connection ends once its writer fails")
            .unwrap();
        assert!(result.is_err());

        let alice = state.dispatcher().directory().find_account("alice").unwrap();
        assert_eq!(alice.live_session_count().await, 0);

        let note = Message::new("PRIVMSG")
            .with("SOURCE", "bob")
            .with("TARGET", "alice")
            .with("MESSAGE", "are you there?");
        let delivered = delivery::deliver_to_account(&alice, &note, true)
            .await
            .unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(alice.pending_count().await, 1);
    }
}
