use crate::record::Sid;
use crate::transport::api::PeerTransport;
use crate::transport::frame::{encode_frame, FrameDecoder, FrameError, HaMessage, MessageKind};
use crate::transport::manager::ConnectionManager;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub(super) enum HandshakeError {
    #[error("io failure during handshake: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed before identifying")]
    PeerClosed,
    #[error("handshake timed out")]
    Elapsed,
    #[error("bad identity frame: {0}")]
    Frame(#[from] FrameError),
    #[error("expected an identity frame, got {0:?}")]
    NotIdentity(MessageKind),
    #[error("dialed sid {expected} but reached sid {actual}")]
    WrongPeer { expected: Sid, actual: Sid },
    #[error("peer has no address in the member table")]
    UnknownPeer,
}

async fn send_identity(stream: &mut TcpStream, my_sid: Sid) -> Result<(), HandshakeError> {
    let frame = encode_frame(&HaMessage::identity(my_sid))?;
    stream.write_all(&frame).await?;
    Ok(())
}

/// Reads until one full frame decodes, enforcing the deadline. On success the
/// decoder may hold bytes past the identity frame; the caller must hand it to
/// the connection read loop rather than discard it.
async fn await_identity(
    stream: &mut TcpStream,
    decoder: &mut FrameDecoder,
    cap: Duration,
) -> Result<Sid, HandshakeError> {
    let deadline = Instant::now() + cap;
    let mut buf = [0u8; 1024];
    loop {
        if let Some(msg) = decoder.next()? {
            if msg.kind != MessageKind::Identity {
                return Err(HandshakeError::NotIdentity(msg.kind));
            }
            return Ok(msg.sid);
        }
        let read = tokio::time::timeout_at(deadline, stream.read(&mut buf))
            .await
            .map_err(|_| HandshakeError::Elapsed)??;
        if read == 0 {
            return Err(HandshakeError::PeerClosed);
        }
        decoder.feed(&buf[..read]);
    }
}

/// Accept side of the peer channel. Reads the dialer's identity, applies the
/// arbitration rule (a dialer ranked below us is refused and our own dialer
/// toward it woken instead), then identifies back and registers the link.
pub(super) async fn run_acceptor(
    logger: slog::Logger,
    manager: Arc<ConnectionManager>,
    listener: TcpListener,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                slog::info!(logger, "Acceptor stopping");
                return;
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote_addr)) => {
                let logger = logger.new(slog::o!("remote" => remote_addr.to_string()));
                tokio::task::spawn(handle_inbound(logger, manager.clone(), stream));
            }
            Err(e) => {
                slog::warn!(logger, "Accept failed, pausing: {:?}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn handle_inbound(logger: slog::Logger, manager: Arc<ConnectionManager>, mut stream: TcpStream) {
    let mut decoder = FrameDecoder::new();
    let handshake_timeout = manager.tuning().handshake_timeout;
    let remote_sid = match await_identity(&mut stream, &mut decoder, handshake_timeout).await {
        Ok(sid) => sid,
        Err(e) => {
            slog::debug!(logger, "Dropping inbound connection: {}", e);
            return;
        }
    };
    if !manager.is_member(remote_sid) {
        slog::warn!(logger, "Refusing connection from unknown sid"; "sid" => remote_sid.into_inner());
        return;
    }
    if remote_sid == manager.my_sid() {
        slog::error!(logger, "Refusing connection claiming my own sid"; "sid" => remote_sid.into_inner());
        return;
    }
    if remote_sid < manager.my_sid() {
        slog::info!(
            logger,
            "Refusing lower-ranked dialer, waking own dialer instead";
            "sid" => remote_sid.into_inner(),
        );
        manager.nudge_dialer(remote_sid);
        return;
    }
    if let Err(e) = send_identity(&mut stream, manager.my_sid()).await {
        slog::debug!(logger, "Dropping inbound connection: {}", e);
        return;
    }
    manager.register_accepted(remote_sid, stream, decoder);
}

/// One background dialer per peer. Parks while a live link exists, retries
/// with jittered exponential backoff while it does not. A nudge cuts the wait
/// short in either case.
pub(super) async fn run_dialer(
    logger: slog::Logger,
    manager: Arc<ConnectionManager>,
    peer_sid: Sid,
    nudge: Arc<Notify>,
    canceller: CancellationToken,
) {
    let floor = manager.tuning().dial_retry_floor;
    let cap = manager.tuning().dial_retry_cap;
    let mut backoff = floor;
    loop {
        if canceller.is_cancelled() {
            return;
        }
        if manager.has_live_connection(peer_sid) {
            backoff = floor;
            tokio::select! {
                _ = canceller.cancelled() => return,
                _ = nudge.notified() => {}
            }
            continue;
        }
        match try_dial(&manager, peer_sid).await {
            Ok(()) => {
                backoff = floor;
            }
            Err(e) => {
                slog::debug!(logger, "Dial attempt failed: {}", e);
                let wait = jittered(backoff);
                tokio::select! {
                    _ = canceller.cancelled() => return,
                    _ = nudge.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
                backoff = std::cmp::min(backoff * 2, cap);
            }
        }
    }
}

async fn try_dial(manager: &Arc<ConnectionManager>, peer_sid: Sid) -> Result<(), HandshakeError> {
    let addr = manager.member_addr(peer_sid).ok_or(HandshakeError::UnknownPeer)?;
    let handshake_timeout = manager.tuning().handshake_timeout;
    let mut stream = tokio::time::timeout(handshake_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| HandshakeError::Elapsed)??;
    send_identity(&mut stream, manager.my_sid()).await?;
    let mut decoder = FrameDecoder::new();
    let remote_sid = await_identity(&mut stream, &mut decoder, handshake_timeout).await?;
    if remote_sid != peer_sid {
        return Err(HandshakeError::WrongPeer {
            expected: peer_sid,
            actual: remote_sid,
        });
    }
    manager.register_dialed(peer_sid, stream, decoder);
    Ok(())
}

fn jittered(backoff: Duration) -> Duration {
    rand::thread_rng().gen_range(backoff..=backoff * 3 / 2)
}
