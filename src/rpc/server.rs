//! Inbound side of the RPC transport: accept loop and per-connection
//! dispatch.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use super::messages::{MessageType, RequestSpecific};
use super::DEFAULT_REQUEST_TIMEOUT;

/// How long the accept loop waits between polls of the non-blocking
/// listener. Lower values reduce shutdown latency but increase idle CPU.
pub(crate) const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Serves the node's side of every RPC operation.
///
/// The transport decodes the closed request set and stays agnostic of the
/// protocol semantics; a handler may answer with a response or an error.
pub trait HandleRequest: Send + Sync + 'static {
    fn handle_request(&self, request: RequestSpecific) -> MessageType;
}

/// Accept loop: one thread per accepted connection so peers cannot block
/// one another. Runs until `shutdown` disconnects.
pub(crate) fn serve(
    listener: TcpListener,
    handler: Arc<dyn HandleRequest>,
    shutdown: flume::Receiver<()>,
) {
    loop {
        match listener.accept() {
            Ok((stream, from)) => {
                trace!(%from, "Accepted RPC connection");

                let handler = handler.clone();
                thread::spawn(move || handle_connection(stream, handler));
            }
            Err(error) => {
                if error.kind() != ErrorKind::WouldBlock {
                    debug!(?error, "Error accepting RPC connection");
                }

                match shutdown.recv_timeout(ACCEPT_POLL_INTERVAL) {
                    Err(flume::RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
            }
        }
    }
}

/// Read one request, dispatch it, write one reply.
///
/// An undecodable payload drops the connection without a reply, no retry.
fn handle_connection(mut stream: TcpStream, handler: Arc<dyn HandleRequest>) {
    let _ = stream.set_read_timeout(Some(DEFAULT_REQUEST_TIMEOUT));
    let _ = stream.set_write_timeout(Some(DEFAULT_REQUEST_TIMEOUT));

    let mut buf = Vec::new();
    if let Err(error) = stream.read_to_end(&mut buf) {
        debug!(?error, "Error reading request");
        return;
    }

    let request = match MessageType::from_bytes(&buf) {
        Ok(MessageType::Request(request)) => request,
        Ok(message) => {
            debug!(?message, "Expected a request, dropping connection");
            return;
        }
        Err(error) => {
            debug!(?error, "Failed to decode request, dropping connection");
            return;
        }
    };

    trace!(context = "rpc_request_handling", ?request);

    let reply = handler.handle_request(request);

    match reply.to_bytes() {
        Ok(bytes) => {
            let _ = stream.write_all(&bytes).map_err(|error| {
                debug!(?error, "Error sending reply");
            });
        }
        Err(error) => {
            debug!(?error, "Failed to encode reply");
        }
    }
}
