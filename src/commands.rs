use std::time::Duration;

use bytes::Bytes;

use crate::errors::CommandError;
use crate::stream::{parse_range_end, parse_range_start, IdSpec, ReadStart, StreamId};
use crate::tokenizer::Resp;

#[derive(Debug, Clone)]
pub enum RedisCommands {
    Ping,
    Echo(Bytes),
    Info(Option<InfoSection>),
    Set(SetOptions),
    Get(Bytes),
    Incr(Bytes),
    Type(Bytes),
    LPush(Bytes, Vec<Bytes>),
    RPush(Bytes, Vec<Bytes>),
    LPop(Bytes, Option<u64>),
    LLen(Bytes),
    LRange(Bytes, i64, i64),
    BLPop(Bytes, Option<Duration>),
    XAdd(XAddOptions),
    XRange(Bytes, StreamId, StreamId),
    XRead(XReadOptions),
    Multi,
    Exec,
    Discard,
    ReplConf(ReplConfMode),
    PSync(String, i64),
    Wait(usize, u64),
}

impl RedisCommands {
    /// Commands that mutate the keyspace and therefore enter the replication
    /// stream on a master.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            RedisCommands::Set(_)
                | RedisCommands::Incr(_)
                | RedisCommands::LPush(..)
                | RedisCommands::RPush(..)
                | RedisCommands::LPop(..)
                | RedisCommands::XAdd(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct SetOptions {
    pub key: Bytes,
    pub value: Bytes,
    /// Relative PX expiry in milliseconds.
    pub expire: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct XAddOptions {
    pub key: Bytes,
    pub id: IdSpec,
    pub fields: Vec<(Bytes, Bytes)>,
}

#[derive(Debug, Clone)]
pub struct XReadOptions {
    /// `None`: no BLOCK clause. `Some(0)`: block without a deadline.
    pub block_ms: Option<u64>,
    pub streams: Vec<(Bytes, ReadStart)>,
}

#[derive(Debug, Clone)]
pub enum InfoSection {
    Replication,
}

#[derive(Debug, Clone)]
pub enum ReplConfMode {
    ListeningPort(u16),
    Capability(String),
    GetAck(String),
    Ack(u64),
}

impl TryFrom<(&str, &str)> for ReplConfMode {
    type Error = CommandError;

    fn try_from(value: (&str, &str)) -> Result<Self, CommandError> {
        match value.0.to_lowercase().as_ref() {
            "listening-port" => {
                let port = value.1.parse().map_err(|_| CommandError::Syntax)?;
                Ok(ReplConfMode::ListeningPort(port))
            }
            "capa" => Ok(ReplConfMode::Capability(value.1.to_string())),
            "getack" => Ok(ReplConfMode::GetAck(value.1.to_string())),
            "ack" => {
                let offset = value.1.parse().map_err(|_| CommandError::Syntax)?;
                Ok(ReplConfMode::Ack(offset))
            }
            _ => Err(CommandError::Syntax),
        }
    }
}

impl From<ReplConfMode> for Vec<Resp> {
    fn from(val: ReplConfMode) -> Self {
        match val {
            ReplConfMode::ListeningPort(port) => vec![
                Resp::bulk("listening-port"),
                Resp::bulk(port.to_string()),
            ],
            ReplConfMode::Capability(capa) => vec![Resp::bulk("capa"), Resp::bulk(capa)],
            ReplConfMode::GetAck(target) => vec![Resp::bulk("GETACK"), Resp::bulk(target)],
            ReplConfMode::Ack(offset) => {
                vec![Resp::bulk("ACK"), Resp::bulk(offset.to_string())]
            }
        }
    }
}

/// Lowercased command name of a raw frame, used to route MULTI control
/// commands before full parsing.
pub fn command_name(frame: &Resp) -> Option<String> {
    let Resp::Array(array) = frame else {
        return None;
    };
    let Some(Resp::BulkString(name)) = array.first() else {
        return None;
    };
    Some(String::from_utf8_lossy(name).to_lowercase())
}

fn bulk_arg<'a>(
    args: &'a [Resp],
    idx: usize,
    command: &'static str,
) -> Result<&'a Bytes, CommandError> {
    match args.get(idx) {
        Some(Resp::BulkString(data)) => Ok(data),
        Some(_) => Err(CommandError::Syntax),
        None => Err(CommandError::WrongArity(command)),
    }
}

fn text_arg<'a>(
    args: &'a [Resp],
    idx: usize,
    command: &'static str,
) -> Result<&'a str, CommandError> {
    std::str::from_utf8(bulk_arg(args, idx, command)?).map_err(|_| CommandError::Syntax)
}

fn int_arg<T: std::str::FromStr>(
    args: &[Resp],
    idx: usize,
    command: &'static str,
) -> Result<T, CommandError> {
    text_arg(args, idx, command)?
        .parse()
        .map_err(|_| CommandError::NotAnInteger)
}

fn expect_arity(args: &[Resp], len: usize, command: &'static str) -> Result<(), CommandError> {
    if args.len() == len {
        Ok(())
    } else {
        Err(CommandError::WrongArity(command))
    }
}

impl TryFrom<Resp> for RedisCommands {
    type Error = CommandError;

    fn try_from(value: Resp) -> Result<Self, CommandError> {
        let Resp::Array(array) = value else {
            return Err(CommandError::Syntax);
        };
        let Some(Resp::BulkString(command)) = array.first() else {
            return Err(CommandError::Syntax);
        };
        let name = String::from_utf8_lossy(command).to_lowercase();
        let args = &array[1..];
        match name.as_str() {
            "ping" => Ok(RedisCommands::Ping),
            "echo" => {
                expect_arity(args, 1, "echo")?;
                Ok(RedisCommands::Echo(bulk_arg(args, 0, "echo")?.clone()))
            }
            "info" => match args.first() {
                None => Ok(RedisCommands::Info(None)),
                Some(_) => {
                    let section = match text_arg(args, 0, "info")?.to_lowercase().as_str() {
                        "replication" => Some(InfoSection::Replication),
                        _ => None,
                    };
                    Ok(RedisCommands::Info(section))
                }
            },
            "set" => {
                if args.len() != 2 && args.len() != 4 {
                    return Err(CommandError::WrongArity("set"));
                }
                let key = bulk_arg(args, 0, "set")?.clone();
                let value = bulk_arg(args, 1, "set")?.clone();
                let expire = if args.len() == 4 {
                    if !text_arg(args, 2, "set")?.eq_ignore_ascii_case("px") {
                        return Err(CommandError::Syntax);
                    }
                    Some(int_arg::<u64>(args, 3, "set")?)
                } else {
                    None
                };
                Ok(RedisCommands::Set(SetOptions { key, value, expire }))
            }
            "get" => {
                expect_arity(args, 1, "get")?;
                Ok(RedisCommands::Get(bulk_arg(args, 0, "get")?.clone()))
            }
            "incr" => {
                expect_arity(args, 1, "incr")?;
                Ok(RedisCommands::Incr(bulk_arg(args, 0, "incr")?.clone()))
            }
            "type" => {
                expect_arity(args, 1, "type")?;
                Ok(RedisCommands::Type(bulk_arg(args, 0, "type")?.clone()))
            }
            "lpush" | "rpush" => {
                let command = if name == "lpush" { "lpush" } else { "rpush" };
                if args.len() < 2 {
                    return Err(CommandError::WrongArity(command));
                }
                let key = bulk_arg(args, 0, command)?.clone();
                let mut elements = Vec::with_capacity(args.len() - 1);
                for idx in 1..args.len() {
                    elements.push(bulk_arg(args, idx, command)?.clone());
                }
                if name == "lpush" {
                    Ok(RedisCommands::LPush(key, elements))
                } else {
                    Ok(RedisCommands::RPush(key, elements))
                }
            }
            "lpop" => {
                if args.is_empty() || args.len() > 2 {
                    return Err(CommandError::WrongArity("lpop"));
                }
                let key = bulk_arg(args, 0, "lpop")?.clone();
                let count = if args.len() == 2 {
                    Some(int_arg::<u64>(args, 1, "lpop")?)
                } else {
                    None
                };
                Ok(RedisCommands::LPop(key, count))
            }
            "llen" => {
                expect_arity(args, 1, "llen")?;
                Ok(RedisCommands::LLen(bulk_arg(args, 0, "llen")?.clone()))
            }
            "lrange" => {
                expect_arity(args, 3, "lrange")?;
                Ok(RedisCommands::LRange(
                    bulk_arg(args, 0, "lrange")?.clone(),
                    int_arg(args, 1, "lrange")?,
                    int_arg(args, 2, "lrange")?,
                ))
            }
            "blpop" => {
                expect_arity(args, 2, "blpop")?;
                let key = bulk_arg(args, 0, "blpop")?.clone();
                let seconds: f64 = text_arg(args, 1, "blpop")?
                    .parse()
                    .map_err(|_| CommandError::Syntax)?;
                if seconds.is_sign_negative() {
                    return Err(CommandError::NegativeTimeout);
                }
                if !seconds.is_finite() {
                    return Err(CommandError::Syntax);
                }
                let timeout = (seconds > 0.0).then(|| Duration::from_secs_f64(seconds));
                Ok(RedisCommands::BLPop(key, timeout))
            }
            "xadd" => {
                if args.len() < 4 || args.len() % 2 != 0 {
                    return Err(CommandError::WrongArity("xadd"));
                }
                let key = bulk_arg(args, 0, "xadd")?.clone();
                let id = IdSpec::parse(text_arg(args, 1, "xadd")?)?;
                let mut fields = Vec::with_capacity((args.len() - 2) / 2);
                let mut idx = 2;
                while idx < args.len() {
                    fields.push((
                        bulk_arg(args, idx, "xadd")?.clone(),
                        bulk_arg(args, idx + 1, "xadd")?.clone(),
                    ));
                    idx += 2;
                }
                Ok(RedisCommands::XAdd(XAddOptions { key, id, fields }))
            }
            "xrange" => {
                expect_arity(args, 3, "xrange")?;
                Ok(RedisCommands::XRange(
                    bulk_arg(args, 0, "xrange")?.clone(),
                    parse_range_start(text_arg(args, 1, "xrange")?)?,
                    parse_range_end(text_arg(args, 2, "xrange")?)?,
                ))
            }
            "xread" => {
                let mut idx = 0;
                let mut block_ms = None;
                if args
                    .first()
                    .and_then(|arg| match arg {
                        Resp::BulkString(data) => std::str::from_utf8(data).ok(),
                        _ => None,
                    })
                    .is_some_and(|text| text.eq_ignore_ascii_case("block"))
                {
                    block_ms = Some(int_arg::<u64>(args, 1, "xread")?);
                    idx = 2;
                }
                if !text_arg(args, idx, "xread")?.eq_ignore_ascii_case("streams") {
                    return Err(CommandError::Syntax);
                }
                idx += 1;
                let rest = args.len() - idx;
                if rest == 0 || rest % 2 != 0 {
                    return Err(CommandError::Syntax);
                }
                let count = rest / 2;
                let mut streams = Vec::with_capacity(count);
                for offset in 0..count {
                    let key = bulk_arg(args, idx + offset, "xread")?.clone();
                    let start = ReadStart::parse(text_arg(args, idx + count + offset, "xread")?)?;
                    streams.push((key, start));
                }
                Ok(RedisCommands::XRead(XReadOptions { block_ms, streams }))
            }
            "multi" => Ok(RedisCommands::Multi),
            "exec" => Ok(RedisCommands::Exec),
            "discard" => Ok(RedisCommands::Discard),
            "replconf" => {
                expect_arity(args, 2, "replconf")?;
                let mode = ReplConfMode::try_from((
                    text_arg(args, 0, "replconf")?,
                    text_arg(args, 1, "replconf")?,
                ))?;
                Ok(RedisCommands::ReplConf(mode))
            }
            "psync" => {
                expect_arity(args, 2, "psync")?;
                let repl_id = text_arg(args, 0, "psync")?.to_string();
                let offset = text_arg(args, 1, "psync")?
                    .parse()
                    .map_err(|_| CommandError::Syntax)?;
                Ok(RedisCommands::PSync(repl_id, offset))
            }
            "wait" => {
                expect_arity(args, 2, "wait")?;
                Ok(RedisCommands::Wait(
                    int_arg(args, 0, "wait")?,
                    int_arg(args, 1, "wait")?,
                ))
            }
            _ => Err(CommandError::UnknownCommand(name)),
        }
    }
}

impl From<RedisCommands> for Resp {
    fn from(val: RedisCommands) -> Self {
        match val {
            RedisCommands::Ping => Resp::Array(vec![Resp::bulk("PING")]),
            RedisCommands::Echo(text) => {
                Resp::Array(vec![Resp::bulk("ECHO"), Resp::BulkString(text)])
            }
            RedisCommands::Info(section) => {
                let mut parts = vec![Resp::bulk("INFO")];
                if let Some(InfoSection::Replication) = section {
                    parts.push(Resp::bulk("replication"));
                }
                Resp::Array(parts)
            }
            RedisCommands::Set(opts) => {
                let mut parts = vec![
                    Resp::bulk("SET"),
                    Resp::BulkString(opts.key),
                    Resp::BulkString(opts.value),
                ];
                if let Some(expire) = opts.expire {
                    parts.push(Resp::bulk("PX"));
                    parts.push(Resp::bulk(expire.to_string()));
                }
                Resp::Array(parts)
            }
            RedisCommands::Get(key) => Resp::Array(vec![Resp::bulk("GET"), Resp::BulkString(key)]),
            RedisCommands::Incr(key) => {
                Resp::Array(vec![Resp::bulk("INCR"), Resp::BulkString(key)])
            }
            RedisCommands::Type(key) => {
                Resp::Array(vec![Resp::bulk("TYPE"), Resp::BulkString(key)])
            }
            RedisCommands::LPush(key, elements) => push_to_resp("LPUSH", key, elements),
            RedisCommands::RPush(key, elements) => push_to_resp("RPUSH", key, elements),
            RedisCommands::LPop(key, count) => {
                let mut parts = vec![Resp::bulk("LPOP"), Resp::BulkString(key)];
                if let Some(count) = count {
                    parts.push(Resp::bulk(count.to_string()));
                }
                Resp::Array(parts)
            }
            RedisCommands::LLen(key) => {
                Resp::Array(vec![Resp::bulk("LLEN"), Resp::BulkString(key)])
            }
            RedisCommands::LRange(key, start, stop) => Resp::Array(vec![
                Resp::bulk("LRANGE"),
                Resp::BulkString(key),
                Resp::bulk(start.to_string()),
                Resp::bulk(stop.to_string()),
            ]),
            RedisCommands::BLPop(key, timeout) => {
                let seconds = timeout.map_or(0.0, |timeout| timeout.as_secs_f64());
                Resp::Array(vec![
                    Resp::bulk("BLPOP"),
                    Resp::BulkString(key),
                    Resp::bulk(seconds.to_string()),
                ])
            }
            RedisCommands::XAdd(opts) => {
                let mut parts = vec![
                    Resp::bulk("XADD"),
                    Resp::BulkString(opts.key),
                    Resp::bulk(opts.id.to_string()),
                ];
                for (field, value) in opts.fields {
                    parts.push(Resp::BulkString(field));
                    parts.push(Resp::BulkString(value));
                }
                Resp::Array(parts)
            }
            RedisCommands::XRange(key, start, end) => Resp::Array(vec![
                Resp::bulk("XRANGE"),
                Resp::BulkString(key),
                Resp::bulk(start.to_string()),
                Resp::bulk(end.to_string()),
            ]),
            RedisCommands::XRead(opts) => {
                let mut parts = vec![Resp::bulk("XREAD")];
                if let Some(block_ms) = opts.block_ms {
                    parts.push(Resp::bulk("BLOCK"));
                    parts.push(Resp::bulk(block_ms.to_string()));
                }
                parts.push(Resp::bulk("STREAMS"));
                let (keys, starts): (Vec<_>, Vec<_>) = opts.streams.into_iter().unzip();
                for key in keys {
                    parts.push(Resp::BulkString(key));
                }
                for start in starts {
                    parts.push(Resp::bulk(start.to_string()));
                }
                Resp::Array(parts)
            }
            RedisCommands::Multi => Resp::Array(vec![Resp::bulk("MULTI")]),
            RedisCommands::Exec => Resp::Array(vec![Resp::bulk("EXEC")]),
            RedisCommands::Discard => Resp::Array(vec![Resp::bulk("DISCARD")]),
            RedisCommands::ReplConf(mode) => {
                let mut parts = vec![Resp::bulk("REPLCONF")];
                let mode_resp: Vec<Resp> = mode.into();
                parts.extend(mode_resp);
                Resp::Array(parts)
            }
            RedisCommands::PSync(repl_id, offset) => Resp::Array(vec![
                Resp::bulk("PSYNC"),
                Resp::bulk(repl_id),
                Resp::bulk(offset.to_string()),
            ]),
            RedisCommands::Wait(num_replicas, timeout) => Resp::Array(vec![
                Resp::bulk("WAIT"),
                Resp::bulk(num_replicas.to_string()),
                Resp::bulk(timeout.to_string()),
            ]),
        }
    }
}

fn push_to_resp(name: &'static str, key: Bytes, elements: Vec<Bytes>) -> Resp {
    let mut parts = vec![Resp::bulk(name), Resp::BulkString(key)];
    for element in elements {
        parts.push(Resp::BulkString(element));
    }
    Resp::Array(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::{tokenize_bytes, Decoded};

    fn parse(wire: &[u8]) -> Result<RedisCommands, CommandError> {
        match tokenize_bytes(wire).unwrap() {
            Decoded::Complete(frame, rest) => {
                assert!(rest.is_empty());
                RedisCommands::try_from(frame)
            }
            Decoded::Partial => panic!("incomplete frame"),
        }
    }

    #[test]
    fn parses_set_with_px() {
        let cmd = parse(b"*5\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\npx\r\n$3\r\n100\r\n");
        match cmd.unwrap() {
            RedisCommands::Set(opts) => {
                assert_eq!(&opts.key[..], b"k");
                assert_eq!(&opts.value[..], b"v");
                assert_eq!(opts.expire, Some(100));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn set_rejects_unknown_option() {
        let cmd = parse(b"*5\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\nEX\r\n$3\r\n100\r\n");
        assert_eq!(cmd.unwrap_err(), CommandError::Syntax);
    }

    #[test]
    fn parses_blpop_timeouts() {
        match parse(b"*3\r\n$5\r\nBLPOP\r\n$1\r\nk\r\n$1\r\n0\r\n").unwrap() {
            RedisCommands::BLPop(_, timeout) => assert_eq!(timeout, None),
            other => panic!("unexpected command: {other:?}"),
        }
        match parse(b"*3\r\n$5\r\nBLPOP\r\n$1\r\nk\r\n$3\r\n0.5\r\n").unwrap() {
            RedisCommands::BLPop(_, timeout) => {
                assert_eq!(timeout, Some(Duration::from_millis(500)))
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(
            parse(b"*3\r\n$5\r\nBLPOP\r\n$1\r\nk\r\n$2\r\n-1\r\n").unwrap_err(),
            CommandError::NegativeTimeout
        );
    }

    #[test]
    fn parses_xadd_id_specs() {
        match parse(b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$1\r\n*\r\n$1\r\nf\r\n$1\r\nv\r\n").unwrap() {
            RedisCommands::XAdd(opts) => {
                assert_eq!(opts.id, IdSpec::Auto);
                assert_eq!(opts.fields.len(), 1);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        match parse(b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$3\r\n5-*\r\n$1\r\nf\r\n$1\r\nv\r\n").unwrap()
        {
            RedisCommands::XAdd(opts) => assert_eq!(opts.id, IdSpec::AutoSeq(5)),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn xadd_requires_field_pairs() {
        assert_eq!(
            parse(b"*3\r\n$4\r\nXADD\r\n$1\r\ns\r\n$1\r\n*\r\n").unwrap_err(),
            CommandError::WrongArity("xadd")
        );
        assert_eq!(
            parse(b"*4\r\n$4\r\nXADD\r\n$1\r\ns\r\n$1\r\n*\r\n$1\r\nf\r\n").unwrap_err(),
            CommandError::WrongArity("xadd")
        );
    }

    #[test]
    fn parses_xread_with_block() {
        let wire = b"*6\r\n$5\r\nXREAD\r\n$5\r\nblock\r\n$3\r\n500\r\n$7\r\nSTREAMS\r\n$1\r\ns\r\n$1\r\n$\r\n";
        match parse(wire).unwrap() {
            RedisCommands::XRead(opts) => {
                assert_eq!(opts.block_ms, Some(500));
                assert_eq!(opts.streams.len(), 1);
                assert_eq!(opts.streams[0].1, ReadStart::Latest);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn xread_needs_matching_keys_and_ids() {
        let wire = b"*4\r\n$5\r\nXREAD\r\n$7\r\nSTREAMS\r\n$1\r\ns\r\n$1\r\n0\r\n";
        match parse(wire).unwrap() {
            RedisCommands::XRead(opts) => assert_eq!(opts.streams.len(), 1),
            other => panic!("unexpected command: {other:?}"),
        }
        let wire = b"*3\r\n$5\r\nXREAD\r\n$7\r\nSTREAMS\r\n$1\r\ns\r\n";
        assert_eq!(parse(wire).unwrap_err(), CommandError::Syntax);
    }

    #[test]
    fn unknown_commands_keep_their_name() {
        assert_eq!(
            parse(b"*1\r\n$5\r\nHELLO\r\n").unwrap_err(),
            CommandError::UnknownCommand("hello".to_string())
        );
    }

    #[test]
    fn command_names_are_case_insensitive() {
        assert!(matches!(
            parse(b"*1\r\n$4\r\npInG\r\n").unwrap(),
            RedisCommands::Ping
        ));
    }

    #[test]
    fn reencodes_propagated_writes() {
        let cmd = RedisCommands::Set(SetOptions {
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"v"),
            expire: None,
        });
        assert_eq!(
            Resp::from(cmd).encode_to_bytes(),
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n"
        );
        let getack = RedisCommands::ReplConf(ReplConfMode::GetAck("*".to_string()));
        assert_eq!(
            Resp::from(getack).encode_to_bytes(),
            b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n"
        );
    }

    #[test]
    fn replconf_ack_round_trips() {
        let wire = b"*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$2\r\n42\r\n";
        match parse(wire).unwrap() {
            RedisCommands::ReplConf(ReplConfMode::Ack(offset)) => assert_eq!(offset, 42),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
