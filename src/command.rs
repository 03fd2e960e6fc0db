use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::resp::RESP;
use crate::stream::{EntryIdSpec, RecordId};

/// Parse/validation failures. `Display` is the exact wire message, code
/// prefix included.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    #[error("ERR unknown command '{0}'")]
    Unknown(String),
    #[error("ERR wrong number of arguments for '{0}' command")]
    Arity(&'static str),
    #[error("ERR syntax error")]
    Syntax,
    #[error("ERR value is not an integer or out of range")]
    NotInteger,
    #[error("ERR Invalid stream ID specified as stream command argument")]
    InvalidStreamId,
    #[error("ERR count must be positive")]
    CountNotPositive,
    #[error("ERR timeout is not a float or out of range")]
    BadTimeout,
    #[error("ERR timeout is negative")]
    NegativeTimeout,
    #[error("ERR invalid command")]
    Invalid,
}

/// XRANGE bound: `-`, `+`, or `ms[-seq]`. An omitted sequence is `None` and
/// is defaulted per end by the executor (0 for start, max for end).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RangeBound {
    Min,
    Max,
    At(u64, Option<u64>),
}

/// XREAD cursor: `$` (the stream tail at registration time) or `ms[-seq]`
/// with an omitted sequence reading as 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadCursor {
    Latest,
    At(u64, Option<u64>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Echo(Vec<u8>),
    Set { key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration> },
    Get(Vec<u8>),
    Incr(Vec<u8>),
    Rpush { key: Vec<u8>, values: Vec<Vec<u8>> },
    Lpush { key: Vec<u8>, values: Vec<Vec<u8>> },
    Lrange { key: Vec<u8>, start: i64, stop: i64 },
    Llen(Vec<u8>),
    Lpop { key: Vec<u8>, count: Option<u64> },
    Blpop { key: Vec<u8>, timeout_secs: f64 },
    Type(Vec<u8>),
    Xadd { key: Vec<u8>, id: EntryIdSpec, fields: Vec<(Vec<u8>, Vec<u8>)> },
    Xrange { key: Vec<u8>, start: RangeBound, end: RangeBound },
    Xread { block_ms: Option<u64>, streams: Vec<(Vec<u8>, ReadCursor)> },
    Multi,
    Exec,
    Discard,
    Replconf(Vec<String>),
    Psync { repl_id: String, offset: i64 },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::Echo(_) => "ECHO",
            Command::Set { .. } => "SET",
            Command::Get(_) => "GET",
            Command::Incr(_) => "INCR",
            Command::Rpush { .. } => "RPUSH",
            Command::Lpush { .. } => "LPUSH",
            Command::Lrange { .. } => "LRANGE",
            Command::Llen(_) => "LLEN",
            Command::Lpop { .. } => "LPOP",
            Command::Blpop { .. } => "BLPOP",
            Command::Type(_) => "TYPE",
            Command::Xadd { .. } => "XADD",
            Command::Xrange { .. } => "XRANGE",
            Command::Xread { .. } => "XREAD",
            Command::Multi => "MULTI",
            Command::Exec => "EXEC",
            Command::Discard => "DISCARD",
            Command::Replconf(_) => "REPLCONF",
            Command::Psync { .. } => "PSYNC",
        }
    }

    /// Map a decoded frame to a typed command. Commands are arrays of bulk
    /// strings; only the name and numeric arguments are interpreted as ASCII,
    /// keys and values stay opaque bytes.
    pub fn parse(message: &RESP) -> Result<Command, CommandError> {
        let RESP::Array(items) = message else {
            return Err(CommandError::Invalid);
        };
        let mut parts: Vec<&[u8]> = Vec::with_capacity(items.len());
        for item in items {
            match item {
                RESP::Bulk(bulk) => parts.push(bulk),
                _ => return Err(CommandError::Invalid),
            }
        }
        let [name, args @ ..] = &parts[..] else {
            return Err(CommandError::Invalid);
        };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();

        match name.as_str() {
            "PING" => exactly(args, 0, "ping").map(|_| Command::Ping),
            "ECHO" => exactly(args, 1, "echo").map(|args| Command::Echo(args[0].to_vec())),
            "SET" => parse_set(args),
            "GET" => exactly(args, 1, "get").map(|args| Command::Get(args[0].to_vec())),
            "INCR" => exactly(args, 1, "incr").map(|args| Command::Incr(args[0].to_vec())),
            "RPUSH" => parse_push(args, "rpush").map(|(key, values)| Command::Rpush { key, values }),
            "LPUSH" => parse_push(args, "lpush").map(|(key, values)| Command::Lpush { key, values }),
            "LRANGE" => {
                let args = exactly(args, 3, "lrange")?;
                Ok(Command::Lrange {
                    key: args[0].to_vec(),
                    start: number(args[1])?,
                    stop: number(args[2])?,
                })
            }
            "LLEN" => exactly(args, 1, "llen").map(|args| Command::Llen(args[0].to_vec())),
            "LPOP" => parse_lpop(args),
            "BLPOP" => parse_blpop(args),
            "TYPE" => exactly(args, 1, "type").map(|args| Command::Type(args[0].to_vec())),
            "XADD" => parse_xadd(args),
            "XRANGE" => {
                let args = exactly(args, 3, "xrange")?;
                Ok(Command::Xrange {
                    key: args[0].to_vec(),
                    start: parse_range_bound(args[1])?,
                    end: parse_range_bound(args[2])?,
                })
            }
            "XREAD" => parse_xread(args),
            "MULTI" => exactly(args, 0, "multi").map(|_| Command::Multi),
            "EXEC" => exactly(args, 0, "exec").map(|_| Command::Exec),
            "DISCARD" => exactly(args, 0, "discard").map(|_| Command::Discard),
            "REPLCONF" => Ok(Command::Replconf(
                args.iter().map(|arg| String::from_utf8_lossy(arg).into_owned()).collect(),
            )),
            "PSYNC" => {
                let args = exactly(args, 2, "psync")?;
                Ok(Command::Psync {
                    repl_id: String::from_utf8_lossy(args[0]).into_owned(),
                    offset: number(args[1])?,
                })
            }
            _ => Err(CommandError::Unknown(name)),
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn exactly<'a, 'b>(
    args: &'a [&'b [u8]],
    count: usize,
    name: &'static str,
) -> Result<&'a [&'b [u8]], CommandError> {
    if args.len() == count {
        Ok(args)
    } else {
        Err(CommandError::Arity(name))
    }
}

fn number<T: FromStr>(arg: &[u8]) -> Result<T, CommandError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CommandError::NotInteger)
}

fn parse_set(args: &[&[u8]]) -> Result<Command, CommandError> {
    let (key, value) = match args {
        [key, value, ..] => (key.to_vec(), value.to_vec()),
        _ => return Err(CommandError::Arity("set")),
    };
    let ttl = match &args[2..] {
        [] => None,
        [option, amount] => {
            let unit_ms: u64 = match option.to_ascii_uppercase().as_slice() {
                b"EX" => 1000,
                b"PX" => 1,
                _ => return Err(CommandError::Syntax),
            };
            let amount: u64 = number(amount)?;
            let millis = amount.checked_mul(unit_ms).ok_or(CommandError::NotInteger)?;
            Some(Duration::from_millis(millis))
        }
        _ => return Err(CommandError::Syntax),
    };
    Ok(Command::Set { key, value, ttl })
}

fn parse_push(args: &[&[u8]], name: &'static str) -> Result<(Vec<u8>, Vec<Vec<u8>>), CommandError> {
    match args {
        [key, values @ ..] if !values.is_empty() => {
            Ok((key.to_vec(), values.iter().map(|v| v.to_vec()).collect()))
        }
        _ => Err(CommandError::Arity(name)),
    }
}

fn parse_lpop(args: &[&[u8]]) -> Result<Command, CommandError> {
    match args {
        [key] => Ok(Command::Lpop { key: key.to_vec(), count: None }),
        [key, count] => {
            let count: i64 = number(count)?;
            if count <= 0 {
                return Err(CommandError::CountNotPositive);
            }
            Ok(Command::Lpop { key: key.to_vec(), count: Some(count as u64) })
        }
        _ => Err(CommandError::Arity("lpop")),
    }
}

fn parse_blpop(args: &[&[u8]]) -> Result<Command, CommandError> {
    let args = exactly(args, 2, "blpop")?;
    let timeout_secs: f64 = std::str::from_utf8(args[1])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CommandError::BadTimeout)?;
    if timeout_secs < 0.0 {
        return Err(CommandError::NegativeTimeout);
    }
    Ok(Command::Blpop { key: args[0].to_vec(), timeout_secs })
}

fn parse_xadd(args: &[&[u8]]) -> Result<Command, CommandError> {
    let [key, id, pairs @ ..] = args else {
        return Err(CommandError::Arity("xadd"));
    };
    if pairs.is_empty() || pairs.len() % 2 != 0 {
        return Err(CommandError::Arity("xadd"));
    }
    let fields = pairs
        .chunks(2)
        .map(|pair| (pair[0].to_vec(), pair[1].to_vec()))
        .collect();
    Ok(Command::Xadd { key: key.to_vec(), id: parse_entry_id(id)?, fields })
}

/// XADD ID: `*`, `ms-*`, or `ms-seq`. A bare `ms` is not a valid XADD ID.
fn parse_entry_id(arg: &[u8]) -> Result<EntryIdSpec, CommandError> {
    let text = std::str::from_utf8(arg).map_err(|_| CommandError::InvalidStreamId)?;
    if text == "*" {
        return Ok(EntryIdSpec::Auto);
    }
    if let Some(ms) = text.strip_suffix("-*") {
        let ms = ms.parse().map_err(|_| CommandError::InvalidStreamId)?;
        return Ok(EntryIdSpec::Partial(ms));
    }
    match RecordId::parse_parts(text) {
        Some((ms, Some(seq))) => Ok(EntryIdSpec::Explicit(RecordId::new(ms, seq))),
        _ => Err(CommandError::InvalidStreamId),
    }
}

fn parse_range_bound(arg: &[u8]) -> Result<RangeBound, CommandError> {
    let text = std::str::from_utf8(arg).map_err(|_| CommandError::InvalidStreamId)?;
    match text {
        "-" => Ok(RangeBound::Min),
        "+" => Ok(RangeBound::Max),
        _ => parse_position(text).map(|(ms, seq)| RangeBound::At(ms, seq)),
    }
}

fn parse_read_cursor(arg: &[u8]) -> Result<ReadCursor, CommandError> {
    let text = std::str::from_utf8(arg).map_err(|_| CommandError::InvalidStreamId)?;
    match text {
        "$" => Ok(ReadCursor::Latest),
        _ => parse_position(text).map(|(ms, seq)| ReadCursor::At(ms, seq)),
    }
}

fn parse_position(text: &str) -> Result<(u64, Option<u64>), CommandError> {
    RecordId::parse_parts(text).ok_or(CommandError::InvalidStreamId)
}

/// XREAD [BLOCK ms] STREAMS key... id...
fn parse_xread(args: &[&[u8]]) -> Result<Command, CommandError> {
    let mut rest = args;
    let mut block_ms = None;
    if rest.first().map(|arg| arg.to_ascii_uppercase()) == Some(b"BLOCK".to_vec()) {
        let amount = rest.get(1).ok_or(CommandError::Syntax)?;
        block_ms = Some(number(amount).map_err(|_| CommandError::Syntax)?);
        rest = &rest[2..];
    }
    let streams_at = rest
        .iter()
        .position(|arg| arg.to_ascii_uppercase() == b"STREAMS")
        .ok_or(CommandError::Syntax)?;
    let pairs = &rest[streams_at + 1..];
    if pairs.is_empty() || pairs.len() % 2 != 0 {
        return Err(CommandError::Arity("xread"));
    }
    let (keys, cursors) = pairs.split_at(pairs.len() / 2);
    let streams = keys
        .iter()
        .zip(cursors)
        .map(|(key, cursor)| Ok((key.to_vec(), parse_read_cursor(cursor)?)))
        .collect::<Result<Vec<_>, CommandError>>()?;
    Ok(Command::Xread { block_ms, streams })
}
