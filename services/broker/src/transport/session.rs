//! One task per client connection.
//!
//! The read loop frames LF-terminated command lines and dispatches them; a
//! separate writer task is the *only* code that ever writes to the socket, so
//! acks and fan-out deliveries interleave at line boundaries and never
//! mid-frame. The writer exits when the outbound queue closes or a write
//! fails; the read loop exits on EOF, read error, cancellation, or shutdown.
//! Whichever loop stops first terminates the session.
use crate::config::ServerConfig;
use bytes::Bytes;
use relay_broker::{Broker, SessionHandle, SessionId};
use relay_wire::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

// How long a terminating session may spend flushing already-queued frames
// before the rest are abandoned. Keeps shutdown bounded even when the peer
// stops reading.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) async fn run(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
    config: ServerConfig,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(%peer, error = %err, "set_nodelay failed");
    }
    let (handle, outbound_rx) = broker.register_session(peer);
    let session_id = handle.id();
    tracing::info!(session = %session_id, %peer, "session started");

    let (read_half, write_half) = stream.into_split();
    let mut writer = tokio::spawn(run_writer_loop(write_half, outbound_rx, session_id));

    let writer_done = tokio::select! {
        () = run_read_loop(read_half, &handle, &broker, &config, shutdown) => false,
        // A write failure terminates the session just like a read failure.
        _ = &mut writer => true,
    };

    // Terminating: drop every subscription and leave the session table before
    // anything else, so no later publish can reach this session. Dropping
    // `handle` afterwards closes the outbound queue, which lets the writer
    // flush what is already queued and then stop.
    broker.remove_session(session_id);
    drop(handle);
    if !writer_done
        && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
    {
        writer.abort();
    }
    tracing::info!(session = %session_id, %peer, "session closed");
}

async fn run_read_loop<R>(
    read_half: R,
    handle: &SessionHandle,
    broker: &Broker,
    config: &ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut cancel = handle.cancel_signal();
    // The limit caps how much of the stream one line may consume and is reset
    // per line; `read_until` stopping short of LF means the cap was hit or
    // the peer closed mid-line.
    let mut reader = BufReader::new(read_half).take(0);
    let mut line = Vec::with_capacity(256);
    loop {
        reader.set_limit(config.max_line_bytes as u64 + 1);
        line.clear();
        let read = tokio::select! {
            result = reader.read_until(b'\n', &mut line) => result,
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
                continue;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                if line.last() != Some(&b'\n') {
                    if line.len() > config.max_line_bytes {
                        metrics::counter!("relay_oversized_lines_total").increment(1);
                        tracing::warn!(
                            session = %handle.id(),
                            limit = config.max_line_bytes,
                            "command line exceeds limit, dropping session"
                        );
                    }
                    // Otherwise the peer closed mid-line; nothing complete to
                    // process either way.
                    break;
                }
                dispatch(&line[..line.len() - 1], handle, broker);
            }
            Err(err) => {
                tracing::info!(session = %handle.id(), error = %err, "session read failed");
                break;
            }
        }
    }
}

// Every command line produces exactly one response line, pushed through the
// same outbound queue as fan-out deliveries so acks stay in command order on
// the connection. Protocol errors are answered, never fatal.
fn dispatch(command: &[u8], handle: &SessionHandle, broker: &Broker) {
    let response = match Request::parse(command) {
        Ok(Request::Publish { topic, payload }) => {
            broker.publish(&topic, &payload);
            Response::Published
        }
        Ok(Request::Subscribe { topic }) => {
            broker.subscribe(topic.clone(), handle);
            Response::Subscribed(topic)
        }
        Ok(Request::Unsubscribe { topic }) => {
            broker.unsubscribe(&topic, handle.id());
            Response::Unsubscribed(topic)
        }
        Ok(Request::Ping) => Response::Pong,
        Err(err) => {
            metrics::counter!("relay_protocol_errors_total").increment(1);
            tracing::debug!(session = %handle.id(), code = err.code(), "protocol error");
            Response::Error(err)
        }
    };
    handle.deliver(response.encode());
}

// Sole writer on the connection. Drains the outbound queue in FIFO order and
// stops once the queue closes or a write fails.
async fn run_writer_loop<W>(mut write: W, mut outbound_rx: mpsc::Receiver<Bytes>, session_id: SessionId)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound_rx.recv().await {
        if let Err(err) = write.write_all(&frame).await {
            tracing::info!(session = %session_id, error = %err, "session write failed");
            break;
        }
    }
    let _ = write.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer() -> SocketAddr {
        "127.0.0.1:50000".parse().expect("addr")
    }

    #[tokio::test]
    async fn dispatch_queues_one_ack_per_command() {
        let broker = Broker::new();
        let (handle, mut outbound) = broker.register_session(test_peer());
        dispatch(b"SUBSCRIBE:t", &handle, &broker);
        dispatch(b"PUBLISH:t:one", &handle, &broker);
        dispatch(b"PING", &handle, &broker);
        dispatch(b"BOGUS", &handle, &broker);
        let mut lines = Vec::new();
        while let Ok(frame) = outbound.try_recv() {
            lines.push(String::from_utf8(frame.to_vec()).expect("utf8"));
        }
        // The self-subscribed delivery is queued by publish before its ack.
        assert_eq!(
            lines,
            vec![
                "OK:SUBSCRIBED:t\n",
                "MESSAGE:t:one\n",
                "OK:PUBLISHED\n",
                "PONG\n",
                "ERROR:UNKNOWN_COMMAND\n",
            ]
        );
    }

    #[tokio::test]
    async fn writer_flushes_queued_frames_after_queue_closes() {
        let broker = Broker::new();
        let (handle, outbound_rx) = broker.register_session(test_peer());
        let (client, server) = tokio::io::duplex(1024);
        let writer = tokio::spawn(run_writer_loop(server, outbound_rx, handle.id()));
        assert!(handle.deliver(Bytes::from_static(b"MESSAGE:t:1\n")));
        assert!(handle.deliver(Bytes::from_static(b"PONG\n")));
        broker.remove_session(handle.id());
        drop(handle);
        writer.await.expect("writer join");

        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("read");
        assert_eq!(line, "MESSAGE:t:1\n");
        line.clear();
        reader.read_line(&mut line).await.expect("read");
        assert_eq!(line, "PONG\n");
        line.clear();
        // Queue closed, writer shut the stream down: clean EOF.
        assert_eq!(reader.read_line(&mut line).await.expect("eof"), 0);
    }

    #[tokio::test]
    async fn read_loop_disconnects_on_oversized_line() {
        let broker = Broker::new();
        let (handle, mut outbound) = broker.register_session(test_peer());
        let config = ServerConfig {
            listen: test_peer(),
            metrics_bind: test_peer(),
            max_line_bytes: 16,
            outbound_queue_depth: 8,
            stats_interval_secs: 0,
            log_connections: false,
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"PING\n")
            .await
            .expect("write short line");
        client
            .write_all(&[b'a'; 64])
            .await
            .expect("write oversized line");
        run_read_loop(server, &handle, &broker, &config, shutdown_rx).await;
        drop(shutdown_tx);
        // The short line was processed, the oversized one ended the loop.
        assert_eq!(
            outbound.try_recv().expect("pong frame").as_ref(),
            b"PONG\n"
        );
        assert!(outbound.try_recv().is_err());
    }
}
