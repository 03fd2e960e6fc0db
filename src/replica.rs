use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};

use crate::client::ReplicaClient;
use crate::command::Command;
use crate::connection::ConnectionHandler;
use crate::net::Binding;
use crate::redis::RedisServer;
use crate::resp::{RESPConnection, RESP};
use crate::session::Session;

/// Client-facing handler on a replica: the same session pipeline as on the
/// master, minus fan-out (a replica has no replicas of its own).
pub struct ReplicaConnection {
    session: Session,
}

impl ReplicaConnection {
    pub fn new(redis: RedisServer) -> Self {
        ReplicaConnection { session: Session::new(redis) }
    }
}

impl ConnectionHandler for ReplicaConnection {
    fn handle_message(&mut self, connection: &mut RESPConnection) -> Result<bool> {
        let Some((frame, message)) = connection.read_message()? else {
            return Ok(false);
        };
        let reply = self.session.handle(frame, Command::parse(&message));
        connection.send_message(&reply.message)?;
        Ok(true)
    }
}

/// Handshake with the leader, then consume its command stream on the same
/// socket. Replicated commands are applied with replies suppressed; the
/// batch path keeps a replicated BLPOP from ever suspending this thread.
fn replicate_from(redis: &RedisServer, leader: &Binding) -> Result<()> {
    let mut client = ReplicaClient::connect(leader)?;
    client.ping_pong()?;
    client.replconf(&["listening-port", &redis.binding.port.to_string()])?;
    client.replconf(&["capa", "psync2"])?;
    let snapshot = client.psync("?", -1)?;
    info!("attached to leader {} (snapshot of {} bytes)", leader, snapshot.len());

    loop {
        let (_, message) = client.read_command()?;
        match Command::parse(&message) {
            Ok(command) => {
                debug!("applying replicated {}", command);
                let outcome = redis.execute_batch(std::slice::from_ref(&command));
                if let Some(RESP::Error(err)) = outcome.into_iter().next().map(|o| o.reply) {
                    warn!("replicated {} failed: {}", command, err);
                }
            }
            Err(err) => warn!("ignoring unparsable replicated command: {}", err),
        }
    }
}

/// Background replication task, started once at boot when `--replicaof` is
/// configured. A dropped link re-runs the whole handshake after a pause.
pub fn start_replication(redis: RedisServer, leader: Binding) -> Result<()> {
    thread::Builder::new().name(format!("replica-of-{}", leader)).spawn(move || loop {
        if let Err(err) = replicate_from(&redis, &leader) {
            warn!("replication link to {} failed: {:?}; reconnecting", leader, err);
        }
        thread::sleep(Duration::from_secs(2));
    })?;
    Ok(())
}

/// Accept loop for ordinary clients on the replica's own port.
pub fn serve(listener: TcpListener, redis: RedisServer) -> Result<()> {
    info!("replica listening on {}", redis.binding);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let redis = redis.clone();
                let peer = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                thread::Builder::new().name(format!("client-{}", peer)).spawn(move || {
                    let mut handler = ReplicaConnection::new(redis);
                    if let Err(err) = handler.handle_connection(stream) {
                        warn!("client {} connection ended: {:?}", peer, err);
                    }
                })?;
            }
            Err(err) => warn!("accept failed: {:?}", err),
        }
    }
    Ok(())
}
