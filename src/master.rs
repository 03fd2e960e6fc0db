use std::net::TcpListener;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, RwLock};
use std::thread;

use anyhow::Result;
use bytes::Bytes;
use log::{debug, info, warn};

use crate::command::Command;
use crate::connection::ConnectionHandler;
use crate::rdb::empty_rdb;
use crate::redis::RedisServer;
use crate::resp::{RESPConnection, RESP};
use crate::session::Session;

/// Handle to one attached replica. Frames pushed here are written out by the
/// connection thread that accepted its PSYNC.
struct ReplicaSink {
    sender: Sender<Bytes>,
}

/// A leader: the shared server state plus the registry of attached replicas.
#[derive(Clone)]
pub struct MasterServer {
    pub redis: RedisServer,
    replicas: Arc<RwLock<Vec<ReplicaSink>>>,
}

impl MasterServer {
    pub fn new(redis: RedisServer) -> Self {
        MasterServer { redis, replicas: Arc::new(RwLock::new(vec![])) }
    }

    /// Forward the original request bytes of one mutation to every replica,
    /// best effort: a replica whose channel is gone is dropped.
    pub fn fan_out(&self, frame: &Bytes) {
        let mut replicas = self.replicas.write().unwrap();
        if replicas.is_empty() {
            return;
        }
        let before = replicas.len();
        replicas.retain(|replica| replica.sender.send(frame.clone()).is_ok());
        if replicas.len() < before {
            info!("dropped {} dead replica(s), {} remain", before - replicas.len(), replicas.len());
        }
    }

    fn register_replica(&self) -> Receiver<Bytes> {
        let (sender, receiver) = mpsc::channel();
        let mut replicas = self.replicas.write().unwrap();
        replicas.push(ReplicaSink { sender });
        info!("replica attached, {} total", replicas.len());
        receiver
    }
}

/// Per-client handler on the leader. REPLCONF and PSYNC are answered here;
/// everything else goes through the session pipeline and mutations fan out.
pub struct MasterConnection {
    master: MasterServer,
    session: Session,
}

impl MasterConnection {
    pub fn new(master: MasterServer) -> Self {
        let session = Session::new(master.redis.clone());
        MasterConnection { master, session }
    }

    /// PSYNC turns this client connection into a replication sink: reply
    /// FULLRESYNC plus the empty snapshot, then stream every mutation frame
    /// until the replica goes away.
    fn serve_replica_sink(&mut self, connection: &mut RESPConnection) -> Result<()> {
        let full_resync =
            RESP::String(format!("FULLRESYNC {} 0", self.master.redis.master_replid));
        connection.send_messages(&[&full_resync, &RESP::File(empty_rdb())])?;
        let frames = self.master.register_replica();
        for frame in frames {
            connection.send_raw(&frame)?;
        }
        Ok(())
    }
}

impl ConnectionHandler for MasterConnection {
    fn handle_message(&mut self, connection: &mut RESPConnection) -> Result<bool> {
        let Some((frame, message)) = connection.read_message()? else {
            return Ok(false);
        };
        debug!("received: {}", message);
        match Command::parse(&message) {
            Ok(Command::Psync { .. }) => {
                self.serve_replica_sink(connection)?;
                Ok(false)
            }
            Ok(Command::Replconf(args)) => {
                debug!("REPLCONF {:?} acknowledged", args);
                connection.send_message(&RESP::String("OK".to_string()))?;
                Ok(true)
            }
            parsed => {
                let reply = self.session.handle(frame, parsed);
                connection.send_message(&reply.message)?;
                for frame in reply.propagate {
                    self.master.fan_out(&frame);
                }
                Ok(true)
            }
        }
    }
}

/// Accept loop: one named thread per client connection.
pub fn serve(listener: TcpListener, master: MasterServer) -> Result<()> {
    info!("master listening on {}", master.redis.binding);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let master = master.clone();
                let peer = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                thread::Builder::new().name(format!("client-{}", peer)).spawn(move || {
                    let mut handler = MasterConnection::new(master);
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
