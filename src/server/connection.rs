//! Connection handling for individual client connections

use super::Server;
use super::handler;
use crate::ProtocolError;
use crate::protocol::parser::find_crlf;
use crate::protocol::{Command, ParseResult, ResponseWriter, parse};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

/// Handle a single client connection
pub async fn handle(
    server: Arc<Server>,
    mut stream: TcpStream,
    _permit: OwnedSemaphorePermit,
) -> anyhow::Result<()> {
    let mut read_buf = BytesMut::with_capacity(server.config.read_buffer_size);
    let mut response = ResponseWriter::new(server.config.write_buffer_size);
    let idle = (server.config.connection_timeout_secs > 0)
        .then(|| Duration::from_secs(server.config.connection_timeout_secs));
    // Bytes of a rejected data block still to be dropped
    let mut discard = 0usize;

    let result = async {
        loop {
            tokio::select! {
                _ = server.cancel_token.cancelled() => break,
                _ = idle_timeout(idle) => {
                    debug!("Closing idle connection");
                    break;
                }
                result = stream.read_buf(&mut read_buf) => {
                    let n = match result {
                        // Connection closed
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            debug!("Read error: {}", e);
                            break;
                        }
                    };
                    server.metrics.bytes_read.inc_by(n as u64);

                    let quit = process(&server, &mut read_buf, &mut discard, &mut response);

                    if !response.is_empty() {
                        let buf = response.take();
                        server.metrics.bytes_written.inc_by(buf.len() as u64);
                        stream.write_all(&buf).await?;
                    }
                    if quit {
                        break;
                    }
                }
            }
        }
        anyhow::Ok(())
    }
    .await;

    server.metrics.active_connections.dec();
    result
}

async fn idle_timeout(idle: Option<Duration>) {
    match idle {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Drop up to `discard` bytes from the front of the buffer
fn skip_pending(read_buf: &mut BytesMut, discard: &mut usize) {
    let n = (*discard).min(read_buf.len());
    let _ = read_buf.split_to(n);
    *discard -= n;
}

/// Execute every complete command in the buffer; returns true on `quit`
fn process(
    server: &Arc<Server>,
    read_buf: &mut BytesMut,
    discard: &mut usize,
    response: &mut ResponseWriter,
) -> bool {
    loop {
        skip_pending(read_buf, discard);
        if *discard > 0 {
            return false;
        }

        match parse(read_buf) {
            ParseResult::Complete(cmd, consumed) => {
                if matches!(cmd, Command::Quit) {
                    return true;
                }

                let noreply = cmd.is_noreply();
                let mark = response.len();
                let timer = server.metrics.cmd_latency.start_timer();
                handler::execute(server, cmd, response);
                timer.observe_duration();
                if noreply {
                    response.truncate(mark);
                }

                let _ = read_buf.split_to(consumed);
            }
            ParseResult::NeedMoreData => return false,
            ParseResult::Error(e) => {
                server.metrics.protocol_errors.inc();
                debug!("Protocol error: {}", e);
                match e {
                    ProtocolError::InvalidCommand(_) => response.error(),
                    ProtocolError::ValueTooLarge(bytes) => {
                        response.server_error("object too large for cache");
                        // The data block and its CRLF follow the header line
                        *discard = bytes.saturating_add(2);
                    }
                    other => response.client_error(&other.to_string()),
                }

                // Try to recover by skipping the offending line
                if let Some(pos) = find_crlf(read_buf) {
                    let _ = read_buf.split_to(pos + 2);
                } else {
                    read_buf.clear();
                }
            }
        }
    }
}
