//! Line-oriented TCP listeners feeding the agent's stores
//!
//! The log intake appends every received line to a log buffer; the graphite
//! intake parses plaintext `<metric> <value> [timestamp]` lines into the
//! nested metrics store. Both accept any number of concurrent connections and
//! stop accepting when their token is cancelled.

use crate::store::{LogBuffers, NestedMetricsStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Longest accepted line in bytes, newline excluded. Longer lines close the connection.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept connections until cancelled, handing each line to `on_line`
async fn serve_lines<F>(listener: TcpListener, shutdown: CancellationToken, on_line: F)
where
    F: Fn(String) + Clone + Send + Sync + 'static,
{
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };

        debug!(peer = %peer, "Intake connection opened");
        let on_line = on_line.clone();
        let token = shutdown.child_token();
        tokio::spawn(async move {
            let lines = read_lines(stream, token, on_line).await;
            debug!(peer = %peer, lines, "Intake connection closed");
        });
    }
}

async fn read_lines<R, F>(reader: R, shutdown: CancellationToken, on_line: F) -> usize
where
    R: AsyncRead + Unpin,
    F: Fn(String),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut count = 0;
    loop {
        buf.clear();
        let limit = (MAX_LINE_LENGTH + 1) as u64;
        let mut limited = (&mut reader).take(limit);
        let read = tokio::select! {
            read = limited.read_until(b'\n', &mut buf) => read,
            _ = shutdown.cancelled() => break,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                } else if buf.len() > MAX_LINE_LENGTH {
                    warn!(limit = MAX_LINE_LENGTH, "Intake line too long, closing connection");
                    break;
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches('\r');
                if line.is_empty() {
                    continue;
                }
                on_line(line.to_string());
                count += 1;
            }
            Err(e) => {
                warn!(error = %e, "Intake read failed");
                break;
            }
        }
    }
    count
}

/// Append every received line to `buffer`
pub async fn serve_log_intake(
    listener: TcpListener,
    buffers: Arc<LogBuffers>,
    buffer: String,
    shutdown: CancellationToken,
) {
    let buffer = Arc::new(buffer);
    serve_lines(listener, shutdown, move |line| {
        buffers.append(&buffer, line);
    })
    .await
}

/// Merge every valid graphite line into `metrics`; malformed lines are skipped
pub async fn serve_graphite_intake(
    listener: TcpListener,
    metrics: Arc<NestedMetricsStore>,
    shutdown: CancellationToken,
) {
    serve_lines(listener, shutdown, move |line| {
        if !metrics.submit_graphite_line(&line) {
            trace!(line = %line, "Skipping malformed graphite line");
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_log_intake_appends_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let buffers = Arc::new(LogBuffers::new());
        let token = CancellationToken::new();
        let server = tokio::spawn(serve_log_intake(
            listener,
            Arc::clone(&buffers),
            "tcp".to_string(),
            token.clone(),
        ));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"first\r\n\nsecond\nthird").await.unwrap();
        stream.shutdown().await.unwrap();

        assert!(wait_for(|| buffers.len("tcp") == 3).await);
        assert_eq!(buffers.lines("tcp"), vec!["first", "second", "third"]);

        token.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_graphite_intake_merges_metrics() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics = Arc::new(NestedMetricsStore::new());
        let token = CancellationToken::new();
        let server = tokio::spawn(serve_graphite_intake(
            listener,
            Arc::clone(&metrics),
            token.clone(),
        ));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"servers.web1.cpu 42.5 1700000000\ngarbage\nservers.web1.mem 7\n")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();

        assert!(wait_for(|| metrics.leaf("servers.web1", "mem").is_some()).await);
        assert_eq!(metrics.leaf("servers.web1", "cpu"), Some(42.5));

        token.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_overlong_line_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let buffers = Arc::new(LogBuffers::new());
        let token = CancellationToken::new();
        let server = tokio::spawn(serve_log_intake(
            listener,
            Arc::clone(&buffers),
            "tcp".to_string(),
            token.clone(),
        ));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut payload = b"before\n".to_vec();
        payload.extend(std::iter::repeat(b'x').take(MAX_LINE_LENGTH + 10));
        payload.extend(b"\nhidden\n");
        let _ = stream.write_all(&payload).await;
        let _ = stream.shutdown().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"after\n").await.unwrap();
        stream.shutdown().await.unwrap();

        assert!(wait_for(|| buffers.len("tcp") == 2).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut lines = buffers.lines("tcp");
        lines.sort();
        assert_eq!(lines, vec!["after", "before"]);

        token.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_line_at_limit_is_kept() {
        let line = "y".repeat(MAX_LINE_LENGTH);
        let input = format!("{}\nnext", line);
        let seen = std::sync::Mutex::new(Vec::new());
        let count = read_lines(input.as_bytes(), CancellationToken::new(), |l| {
            seen.lock().unwrap().push(l)
        })
        .await;
        let seen = seen.into_inner().unwrap();
        assert_eq!(count, 2);
        assert_eq!(seen, vec![line, "next".to_string()]);
    }
}
