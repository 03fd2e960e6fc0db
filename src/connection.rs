use std::net::TcpStream;

use log::{debug, warn};

use crate::resp::{ProtocolError, RESPConnection, RESP};

/// Per-connection driver: keep pulling complete frames off the socket and
/// hand each to the role-specific handler until the peer goes away.
///
/// Malformed framing gets a single `-ERR Protocol error` reply, then the
/// connection is dropped.
pub trait ConnectionHandler {
    fn handle_connection(&mut self, stream: TcpStream) -> anyhow::Result<()> {
        let peer = stream.peer_addr()?;
        let mut connection = RESPConnection::new(stream);
        loop {
            match self.handle_message(&mut connection) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("connection to {} finished", peer);
                    return Ok(());
                }
                Err(err) => {
                    if let Some(protocol_err) = err.downcast_ref::<ProtocolError>() {
                        warn!("protocol error from {}: {}", peer, protocol_err.0);
                        // best effort; the peer may already be gone
                        let _ = connection.send_message(&RESP::Error(protocol_err.to_string()));
                        return Ok(());
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Handle one inbound frame. `Ok(false)` ends the connection loop.
    fn handle_message(&mut self, connection: &mut RESPConnection) -> anyhow::Result<bool>;
}
