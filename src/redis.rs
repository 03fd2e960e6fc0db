use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use log::debug;
use uuid::Uuid;

use crate::command::{Command, RangeBound, ReadCursor};
use crate::net::Binding;
use crate::resp::RESP;
use crate::store::{now_unix_ms, KVStore, StoreError};
use crate::stream::{RecordId, StreamRecord};
use crate::waiters::{WaitRegistry, Waiter};

/// Result of executing one command: the reply plus whether the keyspace was
/// mutated. The connection driver forwards the original frame of every
/// mutating command to the replicas.
pub struct ExecOutcome {
    pub reply: RESP,
    pub mutated: bool,
}

impl ExecOutcome {
    fn reply(reply: RESP) -> Self {
        Self { reply, mutated: false }
    }

    fn mutation(reply: RESP) -> Self {
        Self { reply, mutated: true }
    }

    fn error(err: impl ToString) -> Self {
        Self { reply: RESP::Error(err.to_string()), mutated: false }
    }
}

/// Deferred waiter signals, delivered only after the store lock is dropped so
/// woken clients always observe the mutation.
enum Wakeup {
    List { key: Vec<u8>, pushed: usize },
    Stream { key: Vec<u8> },
}

/// Root handle for the process-wide state: keyspace, wait registry, identity.
/// Cloned into every connection thread.
#[derive(Clone)]
pub struct RedisServer {
    pub binding: Binding,
    store: Arc<RwLock<KVStore>>,
    waiters: Arc<WaitRegistry>,
    pub master_replid: String,
    pub is_master: bool,
}

impl RedisServer {
    pub fn new(binding: Binding, is_master: bool) -> Self {
        let master_replid: String =
            format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
                .chars()
                .take(40)
                .collect();
        RedisServer {
            binding,
            store: Arc::new(RwLock::new(KVStore::new())),
            waiters: Arc::new(WaitRegistry::new()),
            master_replid,
            is_master,
        }
    }

    /// Execute one command. Blocking commands park the calling thread here;
    /// everything else runs under a single store lock acquisition.
    pub fn execute(&self, command: &Command) -> ExecOutcome {
        match command {
            Command::Blpop { key, timeout_secs } => self.blpop(key, *timeout_secs),
            Command::Xread { block_ms: Some(block_ms), streams } => {
                self.xread_blocking(streams, *block_ms)
            }
            _ => {
                let mut wakeups = Vec::new();
                let outcome = {
                    let mut store = self.store.write().unwrap();
                    apply(&mut store, command, &mut wakeups)
                };
                self.wake(wakeups);
                outcome
            }
        }
    }

    /// EXEC path: the whole queue runs under one lock acquisition so its
    /// effects serialize as a single unit. Blocking commands degrade to
    /// their immediate attempt; a transaction never suspends.
    pub fn execute_batch(&self, commands: &[Command]) -> Vec<ExecOutcome> {
        let mut wakeups = Vec::new();
        let outcomes = {
            let mut store = self.store.write().unwrap();
            commands
                .iter()
                .map(|command| apply(&mut store, command, &mut wakeups))
                .collect()
        };
        self.wake(wakeups);
        outcomes
    }

    fn wake(&self, wakeups: Vec<Wakeup>) {
        for wakeup in wakeups {
            match wakeup {
                Wakeup::List { key, pushed } => self.waiters.notify_pushed(&key, pushed),
                Wakeup::Stream { key } => self.waiters.notify_stream(&key),
            }
        }
    }

    /// BLPOP: immediate attempt, then FIFO wait with re-register on a lost
    /// race. Timeout 0 waits indefinitely; expiry answers a null array.
    fn blpop(&self, key: &[u8], timeout_secs: f64) -> ExecOutcome {
        let deadline =
            (timeout_secs > 0.0).then(|| Instant::now() + Duration::from_secs_f64(timeout_secs));
        if let Some(outcome) = self.try_pop_front(key) {
            return outcome;
        }
        let waiter = Arc::new(Waiter::new());
        loop {
            // register before re-checking, or a push in between goes unseen
            self.waiters.register_list(key, Arc::downgrade(&waiter));
            if let Some(outcome) = self.try_pop_front(key) {
                return outcome;
            }
            if !waiter.wait_until(deadline) {
                // a push may have picked this waiter right at the deadline;
                // one last attempt keeps that element from going unclaimed
                if let Some(outcome) = self.try_pop_front(key) {
                    return outcome;
                }
                debug!("BLPOP timed out on {:?}", String::from_utf8_lossy(key));
                return ExecOutcome::reply(RESP::NullArray);
            }
        }
    }

    fn try_pop_front(&self, key: &[u8]) -> Option<ExecOutcome> {
        let mut store = self.store.write().unwrap();
        match store.lpop(key, 1) {
            Err(err) => Some(ExecOutcome::error(err)),
            Ok(popped) => popped.into_iter().next().map(|value| {
                ExecOutcome::mutation(RESP::Array(vec![RESP::bulk(key), RESP::Bulk(value)]))
            }),
        }
    }

    /// XREAD BLOCK: `$` cursors resolve to the tail at registration time, the
    /// waiter registers on every watched key once, and each wakeup recomputes
    /// the full multi-stream result until something is readable.
    fn xread_blocking(&self, streams: &[(Vec<u8>, ReadCursor)], block_ms: u64) -> ExecOutcome {
        let cursors = {
            let store = self.store.read().unwrap();
            match resolve_cursors(&store, streams) {
                Ok(cursors) => cursors,
                Err(err) => return ExecOutcome::error(err),
            }
        };
        let deadline = (block_ms > 0).then(|| Instant::now() + Duration::from_millis(block_ms));
        let waiter = Arc::new(Waiter::new());
        for (key, _) in &cursors {
            self.waiters.register_stream(key, Arc::downgrade(&waiter));
        }
        loop {
            let result = {
                let store = self.store.read().unwrap();
                read_streams(&store, &cursors)
            };
            match result {
                Err(err) => return ExecOutcome::error(err),
                Ok(Some(reply)) => return ExecOutcome::reply(reply),
                Ok(None) => {
                    if !waiter.wait_until(deadline) {
                        debug!("blocked XREAD timed out");
                        return ExecOutcome::reply(RESP::NullArray);
                    }
                }
            }
        }
    }
}

/// Apply one non-suspending command against the locked keyspace.
fn apply(store: &mut KVStore, command: &Command, wakeups: &mut Vec<Wakeup>) -> ExecOutcome {
    match command {
        Command::Ping => ExecOutcome::reply(RESP::String("PONG".to_string())),
        Command::Echo(message) => ExecOutcome::reply(RESP::Bulk(message.clone())),
        Command::Set { key, value, ttl } => {
            store.set_string(key, value.clone(), *ttl);
            ExecOutcome::mutation(RESP::String("OK".to_string()))
        }
        Command::Get(key) => {
            ExecOutcome::reply(store.get_string(key).map_or(RESP::Null, RESP::Bulk))
        }
        Command::Incr(key) => match store.incr(key) {
            Ok(value) => ExecOutcome::mutation(RESP::Int(value)),
            Err(err) => ExecOutcome::error(err),
        },
        Command::Rpush { key, values } => match store.rpush(key, values.clone()) {
            Ok(len) => {
                wakeups.push(Wakeup::List { key: key.clone(), pushed: values.len() });
                ExecOutcome::mutation(RESP::Int(len as i64))
            }
            Err(err) => ExecOutcome::error(err),
        },
        Command::Lpush { key, values } => match store.lpush(key, values.clone()) {
            Ok(len) => {
                wakeups.push(Wakeup::List { key: key.clone(), pushed: values.len() });
                ExecOutcome::mutation(RESP::Int(len as i64))
            }
            Err(err) => ExecOutcome::error(err),
        },
        Command::Lrange { key, start, stop } => match store.lrange(key, *start, *stop) {
            Ok(values) => {
                ExecOutcome::reply(RESP::Array(values.into_iter().map(RESP::Bulk).collect()))
            }
            Err(err) => ExecOutcome::error(err),
        },
        Command::Llen(key) => match store.llen(key) {
            Ok(len) => ExecOutcome::reply(RESP::Int(len as i64)),
            Err(err) => ExecOutcome::error(err),
        },
        Command::Lpop { key, count } => match store.lpop(key, count.unwrap_or(1) as usize) {
            Ok(popped) => {
                let mutated = !popped.is_empty();
                let reply = match popped.len() {
                    0 => RESP::Null,
                    1 => RESP::Bulk(popped.into_iter().next().unwrap()),
                    _ => RESP::Array(popped.into_iter().map(RESP::Bulk).collect()),
                };
                ExecOutcome { reply, mutated }
            }
            Err(err) => ExecOutcome::error(err),
        },
        Command::Blpop { key, .. } => {
            // inside EXEC a transaction never suspends
            match store.lpop(key, 1) {
                Ok(popped) => match popped.into_iter().next() {
                    Some(value) => ExecOutcome::mutation(RESP::Array(vec![
                        RESP::bulk(key),
                        RESP::Bulk(value),
                    ])),
                    None => ExecOutcome::reply(RESP::NullArray),
                },
                Err(err) => ExecOutcome::error(err),
            }
        }
        Command::Type(key) => ExecOutcome::reply(RESP::String(store.type_of(key).to_string())),
        Command::Xadd { key, id, fields } => {
            match store.xadd(key, id, fields.clone(), now_unix_ms()) {
                Ok(id) => {
                    wakeups.push(Wakeup::Stream { key: key.clone() });
                    ExecOutcome::mutation(RESP::bulk(id.to_string()))
                }
                Err(err) => ExecOutcome::error(err),
            }
        }
        Command::Xrange { key, start, end } => {
            let from = match start {
                RangeBound::Min => RecordId::MIN,
                RangeBound::Max => RecordId::MAX,
                RangeBound::At(ms, seq) => RecordId::new(*ms, seq.unwrap_or(0)),
            };
            let to = match end {
                RangeBound::Min => RecordId::MIN,
                RangeBound::Max => RecordId::MAX,
                RangeBound::At(ms, seq) => RecordId::new(*ms, seq.unwrap_or(u64::MAX)),
            };
            match store.xrange(key, from, to) {
                Ok(records) => ExecOutcome::reply(encode_records(&records)),
                Err(err) => ExecOutcome::error(err),
            }
        }
        Command::Xread { streams, .. } => {
            // the blocking variant is handled upstream; inside EXEC it
            // degrades to this immediate read
            let read = match resolve_cursors(store, streams) {
                Ok(cursors) => read_streams(store, &cursors),
                Err(err) => Err(err),
            };
            match read {
                Ok(Some(reply)) => ExecOutcome::reply(reply),
                Ok(None) => ExecOutcome::reply(RESP::NullArray),
                Err(err) => ExecOutcome::error(err),
            }
        }
        Command::Replconf(_) => ExecOutcome::reply(RESP::String("OK".to_string())),
        Command::Psync { .. } => ExecOutcome::error("ERR PSYNC is only valid on a master"),
        // the session layer consumes these before execution
        Command::Multi | Command::Exec | Command::Discard => {
            ExecOutcome::error(format!("ERR {} not allowed in this context", command.name()))
        }
    }
}

fn resolve_cursors(
    store: &KVStore,
    streams: &[(Vec<u8>, ReadCursor)],
) -> Result<Vec<(Vec<u8>, RecordId)>, StoreError> {
    streams
        .iter()
        .map(|(key, cursor)| {
            let id = match cursor {
                ReadCursor::Latest => store.last_stream_id(key)?,
                ReadCursor::At(ms, seq) => RecordId::new(*ms, seq.unwrap_or(0)),
            };
            Ok((key.clone(), id))
        })
        .collect()
}

/// Entries strictly newer than each cursor, keyed per stream, in command
/// order. `None` when every stream comes up empty.
fn read_streams(
    store: &KVStore,
    cursors: &[(Vec<u8>, RecordId)],
) -> Result<Option<RESP>, StoreError> {
    let mut results = Vec::new();
    for (key, cursor) in cursors {
        let records = store.xread_after(key, *cursor)?;
        if records.is_empty() {
            continue;
        }
        results.push(RESP::Array(vec![RESP::bulk(key), encode_records(&records)]));
    }
    Ok((!results.is_empty()).then(|| RESP::Array(results)))
}

fn encode_records(records: &[StreamRecord]) -> RESP {
    RESP::Array(
        records
            .iter()
            .map(|record| {
                let mut fields = Vec::with_capacity(record.fields.len() * 2);
                for (name, value) in &record.fields {
                    fields.push(RESP::Bulk(name.clone()));
                    fields.push(RESP::Bulk(value.clone()));
                }
                RESP::Array(vec![RESP::bulk(record.id.to_string()), RESP::Array(fields)])
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandError;
    use crate::net::Binding;

    fn server() -> RedisServer {
        RedisServer::new(Binding::local(0), true)
    }

    fn run(server: &RedisServer, parts: &[&str]) -> ExecOutcome {
        let command = Command::parse(&RESP::command(parts)).expect("valid command");
        server.execute(&command)
    }

    #[test]
    fn replid_is_40_hex_chars() {
        let server = server();
        assert_eq!(server.master_replid.len(), 40);
        assert!(server.master_replid.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn set_get_and_mutation_flags() {
        let server = server();
        let set = run(&server, &["SET", "foo", "bar"]);
        assert_eq!(set.reply, RESP::String("OK".to_string()));
        assert!(set.mutated);

        let get = run(&server, &["GET", "foo"]);
        assert_eq!(get.reply, RESP::bulk("bar"));
        assert!(!get.mutated);

        assert_eq!(run(&server, &["GET", "missing"]).reply, RESP::Null);
        assert_eq!(run(&server, &["PING"]).reply, RESP::String("PONG".to_string()));
        assert_eq!(run(&server, &["ECHO", "hey"]).reply, RESP::bulk("hey"));
    }

    #[test]
    fn incr_replies_and_errors() {
        let server = server();
        assert_eq!(run(&server, &["INCR", "n"]).reply, RESP::Int(1));
        assert_eq!(run(&server, &["INCR", "n"]).reply, RESP::Int(2));

        run(&server, &["SET", "s", "abc"]);
        let err = run(&server, &["INCR", "s"]);
        assert_eq!(err.reply, RESP::Error(StoreError::NotInteger.to_string()));
        assert!(!err.mutated);
    }

    #[test]
    fn lpop_reply_shapes() {
        let server = server();
        run(&server, &["RPUSH", "l", "a", "b", "c"]);
        assert_eq!(run(&server, &["LPOP", "l"]).reply, RESP::bulk("a"));
        assert_eq!(
            run(&server, &["LPOP", "l", "2"]).reply,
            RESP::Array(vec![RESP::bulk("b"), RESP::bulk("c")])
        );
        let empty = run(&server, &["LPOP", "l"]);
        assert_eq!(empty.reply, RESP::Null);
        assert!(!empty.mutated);
        // count hitting a single survivor collapses to a bulk
        run(&server, &["RPUSH", "l", "z"]);
        assert_eq!(run(&server, &["LPOP", "l", "5"]).reply, RESP::bulk("z"));
    }

    #[test]
    fn wrongtype_replies_do_not_mutate() {
        let server = server();
        run(&server, &["SET", "s", "v"]);
        let err = run(&server, &["RPUSH", "s", "a"]);
        assert_eq!(err.reply, RESP::Error(StoreError::WrongType.to_string()));
        assert!(!err.mutated);
        assert_eq!(run(&server, &["GET", "s"]).reply, RESP::bulk("v"));
        assert_eq!(run(&server, &["TYPE", "s"]).reply, RESP::String("string".to_string()));
        assert_eq!(run(&server, &["TYPE", "none"]).reply, RESP::String("none".to_string()));
    }

    #[test]
    fn xadd_and_xrange_shapes() {
        let server = server();
        assert_eq!(run(&server, &["XADD", "s", "1-1", "f", "v"]).reply, RESP::bulk("1-1"));
        let dup = run(&server, &["XADD", "s", "1-1", "f", "v"]);
        assert_eq!(dup.reply, RESP::Error(StoreError::IdTooSmall.to_string()));
        let zero = run(&server, &["XADD", "s", "0-0", "f", "v"]);
        assert_eq!(zero.reply, RESP::Error(StoreError::IdZero.to_string()));

        assert_eq!(
            run(&server, &["XRANGE", "s", "-", "+"]).reply,
            RESP::Array(vec![RESP::Array(vec![
                RESP::bulk("1-1"),
                RESP::Array(vec![RESP::bulk("f"), RESP::bulk("v")]),
            ])])
        );
    }

    #[test]
    fn xrange_defaults_omitted_sequences() {
        let server = server();
        run(&server, &["XADD", "s", "5-1", "a", "1"]);
        run(&server, &["XADD", "s", "5-2", "a", "2"]);
        run(&server, &["XADD", "s", "6-0", "a", "3"]);
        // bare "5" covers 5-0..=5-max, bare end "5" too
        let RESP::Array(entries) = run(&server, &["XRANGE", "s", "5", "5"]).reply else {
            panic!("expected array");
        };
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn xread_immediate_and_dollar() {
        let server = server();
        run(&server, &["XADD", "s", "1-1", "f", "v"]);
        assert_eq!(
            run(&server, &["XREAD", "STREAMS", "s", "0-0"]).reply,
            RESP::Array(vec![RESP::Array(vec![
                RESP::bulk("s"),
                RESP::Array(vec![RESP::Array(vec![
                    RESP::bulk("1-1"),
                    RESP::Array(vec![RESP::bulk("f"), RESP::bulk("v")]),
                ])]),
            ])])
        );
        // nothing newer than the tail
        assert_eq!(run(&server, &["XREAD", "STREAMS", "s", "1-1"]).reply, RESP::NullArray);
    }

    #[test]
    fn blpop_times_out_with_null_array() {
        let server = server();
        let started = Instant::now();
        let outcome = run(&server, &["BLPOP", "missing", "0.05"]);
        assert_eq!(outcome.reply, RESP::NullArray);
        assert!(!outcome.mutated);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn blpop_immediate_when_data_is_present() {
        let server = server();
        run(&server, &["RPUSH", "k", "hello"]);
        let outcome = run(&server, &["BLPOP", "k", "0"]);
        assert_eq!(outcome.reply, RESP::Array(vec![RESP::bulk("k"), RESP::bulk("hello")]));
        assert!(outcome.mutated);
        assert_eq!(run(&server, &["TYPE", "k"]).reply, RESP::String("none".to_string()));
    }

    #[test]
    fn blpop_wakes_on_push_from_another_thread() {
        let server = server();
        let blocked = {
            let server = server.clone();
            std::thread::spawn(move || run(&server, &["BLPOP", "waitkey", "5"]))
        };
        std::thread::sleep(Duration::from_millis(50));
        run(&server, &["RPUSH", "waitkey", "hello"]);
        let outcome = blocked.join().unwrap();
        assert_eq!(
            outcome.reply,
            RESP::Array(vec![RESP::bulk("waitkey"), RESP::bulk("hello")])
        );
        assert!(outcome.mutated);
    }

    #[test]
    fn blocked_xread_wakes_on_xadd() {
        let server = server();
        let blocked = {
            let server = server.clone();
            std::thread::spawn(move || {
                run(&server, &["XREAD", "BLOCK", "5000", "STREAMS", "s", "$"])
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        run(&server, &["XADD", "s", "7-7", "f", "v"]);
        let outcome = blocked.join().unwrap();
        let RESP::Array(streams) = outcome.reply else {
            panic!("expected array reply");
        };
        assert_eq!(streams.len(), 1);
        assert_eq!(
            streams[0],
            RESP::Array(vec![
                RESP::bulk("s"),
                RESP::Array(vec![RESP::Array(vec![
                    RESP::bulk("7-7"),
                    RESP::Array(vec![RESP::bulk("f"), RESP::bulk("v")]),
                ])]),
            ])
        );
    }

    #[test]
    fn batch_runs_atomically_and_flags_each_mutation() {
        let server = server();
        let commands = vec![
            Command::parse(&RESP::command(&["INCR", "k"])).unwrap(),
            Command::parse(&RESP::command(&["INCR", "k"])).unwrap(),
            Command::parse(&RESP::command(&["GET", "k"])).unwrap(),
        ];
        let outcomes = server.execute_batch(&commands);
        assert_eq!(outcomes[0].reply, RESP::Int(1));
        assert_eq!(outcomes[1].reply, RESP::Int(2));
        assert_eq!(outcomes[2].reply, RESP::bulk("2"));
        assert!(outcomes[0].mutated && outcomes[1].mutated && !outcomes[2].mutated);
    }

    #[test]
    fn parse_error_taxonomy_reaches_the_wire_text() {
        assert_eq!(
            CommandError::Unknown("FOO".to_string()).to_string(),
            "ERR unknown command 'FOO'"
        );
        assert_eq!(
            CommandError::Arity("set").to_string(),
            "ERR wrong number of arguments for 'set' command"
        );
        assert_eq!(
            StoreError::WrongType.to_string(),
            "WRONGTYPE Operation against a key holding the wrong kind of value"
        );
    }
}
