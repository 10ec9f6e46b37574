use crate::record::Sid;
use crate::transport::frame::FrameDecoder;
use crate::transport::manager::ConnectionManager;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Spawns the read loop, the write loop and a supervisor for one registered
/// link. Whichever loop exits first cancels its sibling via the shared token;
/// the supervisor waits for both and then deregisters the link, which drops
/// the socket halves on every exit path.
pub(super) fn spawn_connection(
    logger: slog::Logger,
    manager: Arc<ConnectionManager>,
    peer_sid: Sid,
    conn_id: u64,
    stream: TcpStream,
    decoder: FrameDecoder,
    outbound_rx: mpsc::Receiver<Bytes>,
    canceller: CancellationToken,
    write_stall_cap: Duration,
) {
    let (read_half, write_half) = stream.into_split();

    let read_task = tokio::task::spawn(run_read_loop(
        logger.clone(),
        manager.clone(),
        peer_sid,
        read_half,
        decoder,
        canceller.clone(),
    ));
    let write_task = tokio::task::spawn(run_write_loop(
        logger.clone(),
        write_half,
        outbound_rx,
        canceller.clone(),
        write_stall_cap,
    ));

    tokio::task::spawn(async move {
        let _ = read_task.await;
        let _ = write_task.await;
        manager.deregister(peer_sid, conn_id);
        slog::info!(logger, "Connection closed");
    });
}

async fn run_read_loop(
    logger: slog::Logger,
    manager: Arc<ConnectionManager>,
    peer_sid: Sid,
    mut read_half: OwnedReadHalf,
    mut decoder: FrameDecoder,
    canceller: CancellationToken,
) {
    let mut buf = [0u8; 16 * 1024];
    loop {
        // The handshake may have left complete frames in the decoder, so
        // drain before reading.
        loop {
            match decoder.next() {
                Ok(Some(msg)) => {
                    if msg.sid != peer_sid {
                        slog::warn!(
                            logger,
                            "Frame claims a different sender than the handshake, closing";
                            "claimed" => msg.sid.into_inner(),
                        );
                        canceller.cancel();
                        return;
                    }
                    if let Err(e) = manager.dispatch(msg) {
                        slog::warn!(logger, "Closing connection on undecodable payload: {:?}", e);
                        canceller.cancel();
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    slog::warn!(logger, "Closing connection on frame error: {:?}", e);
                    canceller.cancel();
                    return;
                }
            }
        }

        tokio::select! {
            _ = canceller.cancelled() => {
                return;
            }
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    slog::debug!(logger, "Peer closed the connection");
                    canceller.cancel();
                    return;
                }
                Ok(n) => decoder.feed(&buf[..n]),
                Err(e) => {
                    slog::warn!(logger, "Closing connection on read error: {:?}", e);
                    canceller.cancel();
                    return;
                }
            }
        }
    }
}

async fn run_write_loop(
    logger: slog::Logger,
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    canceller: CancellationToken,
    write_stall_cap: Duration,
) {
    loop {
        let frame = tokio::select! {
            _ = canceller.cancelled() => {
                return;
            }
            maybe_frame = outbound_rx.recv() => match maybe_frame {
                Some(frame) => frame,
                None => {
                    canceller.cancel();
                    return;
                }
            }
        };

        match tokio::time::timeout(write_stall_cap, write_half.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                slog::warn!(logger, "Closing connection on write error: {:?}", e);
                canceller.cancel();
                return;
            }
            Err(_elapsed) => {
                slog::warn!(
                    logger,
                    "Write stalled past cap, closing connection";
                    "cap_ms" => write_stall_cap.as_millis() as u64,
                );
                canceller.cancel();
                return;
            }
        }
    }
}
