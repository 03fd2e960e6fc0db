use std::net::TcpStream;

use anyhow::{bail, Result};
use log::debug;

use crate::net::Binding;
use crate::resp::{RESPConnection, RESP};

/// RESP client a replica uses for the handshake against its leader. After
/// PSYNC the same connection carries the leader's command stream.
pub struct ReplicaClient {
    connection: RESPConnection,
}

impl ReplicaClient {
    pub fn connect(leader: &Binding) -> Result<Self> {
        let stream = TcpStream::connect(leader.to_string())?;
        debug!("connected to leader {}", leader);
        Ok(ReplicaClient { connection: RESPConnection::new(stream) })
    }

    pub fn ping_pong(&mut self) -> Result<()> {
        self.connection.send_message(&RESP::command(&["PING"]))?;
        match self.read_reply()? {
            RESP::String(reply) if reply.eq_ignore_ascii_case("PONG") => Ok(()),
            other => bail!("ping failed: {}", other),
        }
    }

    pub fn replconf(&mut self, params: &[&str]) -> Result<()> {
        let mut parts = vec!["REPLCONF"];
        parts.extend_from_slice(params);
        self.connection.send_message(&RESP::command(&parts))?;
        match self.read_reply()? {
            RESP::String(reply) if reply.eq_ignore_ascii_case("OK") => Ok(()),
            other => bail!("replconf {:?} failed: {}", params, other),
        }
    }

    /// `PSYNC ? -1`: expect `+FULLRESYNC <replid> <offset>` followed by the
    /// snapshot blob.
    pub fn psync(&mut self, repl_id: &str, offset: i64) -> Result<Vec<u8>> {
        self.connection
            .send_message(&RESP::command(&["PSYNC", repl_id, &offset.to_string()]))?;
        match self.read_reply()? {
            RESP::String(reply) if reply.to_ascii_uppercase().starts_with("FULLRESYNC ") => {
                debug!("leader replied: {}", reply);
                self.connection.read_snapshot()
            }
            other => bail!("psync failed: {}", other),
        }
    }

    /// Next command frame of the replication stream.
    pub fn read_command(&mut self) -> Result<(usize, RESP)> {
        match self.connection.read_message()? {
            Some((frame, message @ RESP::Array(_))) => Ok((frame.len(), message)),
            Some((_, other)) => bail!("replication stream must carry arrays, got: {}", other),
            None => bail!("leader closed the replication stream"),
        }
    }

    fn read_reply(&mut self) -> Result<RESP> {
        match self.connection.read_message()? {
            Some((_, message)) => Ok(message),
            None => bail!("connection closed by leader"),
        }
    }
}
