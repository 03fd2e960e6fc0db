use bytes::Bytes;
use log::debug;

use crate::command::{Command, CommandError};
use crate::redis::RedisServer;
use crate::resp::RESP;

/// Outcome for one inbound frame: the reply to send, plus the original
/// frames of any executed mutations, for replica fan-out.
pub struct SessionReply {
    pub message: RESP,
    pub propagate: Vec<Bytes>,
}

impl SessionReply {
    fn message(message: RESP) -> Self {
        Self { message, propagate: vec![] }
    }

    fn ok() -> Self {
        Self::message(RESP::String("OK".to_string()))
    }

    fn error(err: impl ToString) -> Self {
        Self::message(RESP::Error(err.to_string()))
    }
}

struct Queued {
    command: Command,
    frame: Bytes,
}

/// Per-connection command pipeline: the MULTI/EXEC/DISCARD state machine in
/// front of the executor. `queue` is `None` outside a transaction; `Some`
/// accumulates commands verbatim until EXEC or DISCARD.
pub struct Session {
    server: RedisServer,
    queue: Option<Vec<Queued>>,
    dirty: bool,
}

impl Session {
    pub fn new(server: RedisServer) -> Self {
        Session { server, queue: None, dirty: false }
    }

    pub fn handle(&mut self, frame: Bytes, parsed: Result<Command, CommandError>) -> SessionReply {
        match parsed {
            Err(err) => {
                if self.queue.is_some() {
                    // poison the open transaction; EXEC will abort
                    self.dirty = true;
                }
                SessionReply::error(err)
            }
            Ok(command) => self.step(command, frame),
        }
    }

    fn step(&mut self, command: Command, frame: Bytes) -> SessionReply {
        match command {
            Command::Multi => {
                if self.queue.is_some() {
                    return SessionReply::error("ERR MULTI calls can not be nested");
                }
                self.queue = Some(Vec::new());
                SessionReply::ok()
            }
            Command::Exec => match self.queue.take() {
                None => SessionReply::error("ERR EXEC without MULTI"),
                Some(_) if self.dirty => {
                    self.dirty = false;
                    SessionReply::error("EXECABORT Transaction discarded because of previous errors")
                }
                Some(queue) => {
                    debug!("EXEC of {} queued commands", queue.len());
                    let (commands, frames): (Vec<_>, Vec<_>) =
                        queue.into_iter().map(|queued| (queued.command, queued.frame)).unzip();
                    let outcomes = self.server.execute_batch(&commands);
                    let propagate = frames
                        .into_iter()
                        .zip(&outcomes)
                        .filter(|(_, outcome)| outcome.mutated)
                        .map(|(frame, _)| frame)
                        .collect();
                    let replies = outcomes.into_iter().map(|outcome| outcome.reply).collect();
                    SessionReply { message: RESP::Array(replies), propagate }
                }
            },
            Command::Discard => match self.queue.take() {
                None => SessionReply::error("ERR DISCARD without MULTI"),
                Some(_) => {
                    self.dirty = false;
                    SessionReply::ok()
                }
            },
            command => match &mut self.queue {
                Some(queue) => {
                    queue.push(Queued { command, frame });
                    SessionReply::message(RESP::String("QUEUED".to_string()))
                }
                None => {
                    let outcome = self.server.execute(&command);
                    let propagate = if outcome.mutated { vec![frame] } else { vec![] };
                    SessionReply { message: outcome.reply, propagate }
                }
            },
        }
    }
}
