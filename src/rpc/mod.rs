//! Blocking JSON-over-TCP RPC between ring nodes.

pub mod config;
pub mod messages;
pub(crate) mod server;

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use tracing::{debug, trace};

use crate::{Error, Result};
use messages::{MessageType, RequestSpecific, ResponseSpecific};

pub use server::HandleRequest;

/// Default request timeout before a peer is treated as unreachable.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds

/// Dials a peer, delivers one request, and blocks until its response.
///
/// Every call is bounded by the request timeout so a dead peer cannot stall
/// the caller indefinitely.
#[derive(Debug, Clone)]
pub struct RpcClient {
    request_timeout: Duration,
}

impl RpcClient {
    pub fn new(request_timeout: Duration) -> RpcClient {
        RpcClient { request_timeout }
    }

    /// Deliver `request` to the node at `address` and block for the result.
    ///
    /// Fails with [Error::RemoteUnreachable] on connect failure, timeout, or
    /// a dropped connection; the caller must treat that as "this peer may be
    /// dead".
    pub fn call(
        &self,
        address: std::net::SocketAddrV4,
        request: RequestSpecific,
    ) -> Result<ResponseSpecific> {
        trace!(context = "rpc_request_sending", %address, ?request);

        let bytes = MessageType::Request(request)
            .to_bytes()
            .map_err(Error::MalformedRequest)?;

        let mut stream = TcpStream::connect_timeout(&address.into(), self.request_timeout)
            .map_err(|_| Error::RemoteUnreachable(address))?;

        stream
            .set_read_timeout(Some(self.request_timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.request_timeout)))
            .map_err(|_| Error::RemoteUnreachable(address))?;

        // One request per connection: write it, half-close, read to EOF.
        stream
            .write_all(&bytes)
            .and_then(|_| stream.shutdown(Shutdown::Write))
            .map_err(|_| Error::RemoteUnreachable(address))?;

        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .map_err(|_| Error::RemoteUnreachable(address))?;

        if buf.is_empty() {
            return Err(Error::RemoteUnreachable(address));
        }

        match MessageType::from_bytes(&buf).map_err(Error::MalformedResponse)? {
            MessageType::Response(response) => {
                trace!(context = "rpc_response_received", %address, ?response);
                Ok(response)
            }
            MessageType::Error(error) => {
                debug!(%address, ?error, "Remote node reported an error");
                Err(Error::Remote(error))
            }
            MessageType::Request(_) => Err(Error::MalformedResponse(serde::de::Error::custom(
                "got a request in response position",
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::{SocketAddr, SocketAddrV4, TcpListener};
    use std::sync::Arc;
    use std::thread;

    use super::messages::ErrorSpecific;
    use super::server::serve;
    use super::*;
    use crate::common::Id;

    /// Serves lookups by echoing the requested id; fails every `get`.
    struct Echo;

    impl HandleRequest for Echo {
        fn handle_request(&self, request: RequestSpecific) -> MessageType {
            match request {
                RequestSpecific::Ping => MessageType::Response(ResponseSpecific::Pong),
                RequestSpecific::FindSuccessor { id } => {
                    MessageType::Response(ResponseSpecific::NodeId { id })
                }
                RequestSpecific::Get { .. } => MessageType::Error(ErrorSpecific {
                    code: 201,
                    description: "Generic Error".to_string(),
                }),
                _ => MessageType::Response(ResponseSpecific::Done),
            }
        }
    }

    fn spawn_server() -> (SocketAddrV4, flume::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();

        let address = match listener.local_addr().unwrap() {
            SocketAddr::V4(address) => address,
            SocketAddr::V6(_) => unreachable!(),
        };

        let (shutdown_tx, shutdown_rx) = flume::bounded(1);
        thread::spawn(move || serve(listener, Arc::new(Echo), shutdown_rx));

        (address, shutdown_tx)
    }

    #[test]
    fn request_response() {
        let (address, _shutdown) = spawn_server();
        let client = RpcClient::new(DEFAULT_REQUEST_TIMEOUT);

        let response = client
            .call(address, RequestSpecific::FindSuccessor { id: Id::new(5) })
            .unwrap();
        assert_eq!(response, ResponseSpecific::NodeId { id: Id::new(5) });

        let response = client.call(address, RequestSpecific::Ping).unwrap();
        assert_eq!(response, ResponseSpecific::Pong);
    }

    #[test]
    fn error_response() {
        let (address, _shutdown) = spawn_server();
        let client = RpcClient::new(DEFAULT_REQUEST_TIMEOUT);

        let result = client.call(
            address,
            RequestSpecific::Get {
                key: "missing".to_string(),
            },
        );

        match result {
            Err(Error::Remote(error)) => assert_eq!(error.code, 201),
            other => panic!("expected a remote error, got {:?}", other),
        }
    }

    #[test]
    fn unreachable_peer() {
        // Grab a free port and release it so nothing is listening there.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = match listener.local_addr().unwrap() {
            SocketAddr::V4(address) => address,
            SocketAddr::V6(_) => unreachable!(),
        };
        drop(listener);

        let client = RpcClient::new(Duration::from_millis(100));

        assert!(matches!(
            client.call(address, RequestSpecific::Ping),
            Err(Error::RemoteUnreachable(_))
        ));
    }

    #[test]
    fn malformed_response() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = match listener.local_addr().unwrap() {
            SocketAddr::V4(address) => address,
            SocketAddr::V6(_) => unreachable!(),
        };

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let _ = Read::read_to_end(&mut stream, &mut buf);
            let _ = Write::write_all(&mut stream, b"not json");
        });

        let client = RpcClient::new(DEFAULT_REQUEST_TIMEOUT);

        assert!(matches!(
            client.call(address, RequestSpecific::Ping),
            Err(Error::MalformedResponse(_))
        ));
    }
}
