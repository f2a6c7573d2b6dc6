use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use log::{debug, info, warn};

use crate::commands::{command_name, RedisCommands, ReplConfMode, XAddOptions};
use crate::errors::{CommandError, ProtocolError};
use crate::replication;
use crate::server::Shared;
use crate::store::StoreInner;
use crate::stream::{range_reply, xread_reply, IdSpec, ReadStart};
use crate::tokenizer::{tokenize_bytes, Decoded, Resp};

/// What the connection does next after a command is handled.
enum Flow {
    Continue,
    /// PSYNC happened: the socket now belongs to the replica registry and
    /// this thread switches to reading its ACK frames.
    Enrolled(u64),
}

/// One client connection. Commands are processed and replied strictly in
/// order; blocking commands park this thread without holding the store lock.
pub struct Session {
    stream: TcpStream,
    shared: Arc<Shared>,
    in_transaction: bool,
    queued: Vec<Resp>,
}

impl Session {
    pub fn new(stream: TcpStream, shared: Arc<Shared>) -> Session {
        Session {
            stream,
            shared,
            in_transaction: false,
            queued: Vec::new(),
        }
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            while let Some(frame) = next_frame(&mut buf)? {
                match self.handle_frame(frame)? {
                    Flow::Continue => {}
                    Flow::Enrolled(id) => return self.read_replica_acks(buf, id),
                }
            }
            let mut chunk = [0u8; 4096];
            let read = self.stream.read(&mut chunk)?;
            if read == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..read]);
        }
    }

    fn handle_frame(&mut self, frame: Resp) -> anyhow::Result<Flow> {
        if self.in_transaction {
            let name = command_name(&frame).unwrap_or_default();
            if !matches!(name.as_str(), "multi" | "exec" | "discard") {
                self.queued.push(frame);
                self.reply(Resp::simple("QUEUED"))?;
                return Ok(Flow::Continue);
            }
        }
        let command = match RedisCommands::try_from(frame) {
            Ok(command) => command,
            Err(err) => {
                self.reply(Resp::Error(err.to_string()))?;
                return Ok(Flow::Continue);
            }
        };
        self.dispatch(command)
    }

    fn dispatch(&mut self, command: RedisCommands) -> anyhow::Result<Flow> {
        match command {
            RedisCommands::Multi => {
                if self.in_transaction {
                    self.reply(Resp::Error(CommandError::NestedMulti.to_string()))?;
                } else {
                    self.in_transaction = true;
                    self.reply(Resp::simple("OK"))?;
                }
            }
            RedisCommands::Exec => self.exec()?,
            RedisCommands::Discard => {
                if self.in_transaction {
                    self.in_transaction = false;
                    self.queued.clear();
                    self.reply(Resp::simple("OK"))?;
                } else {
                    self.reply(Resp::Error(CommandError::DiscardWithoutMulti.to_string()))?;
                }
            }
            RedisCommands::Info(_) => {
                let info = self.shared.repl.info_string();
                self.reply(Resp::bulk(info))?;
            }
            RedisCommands::ReplConf(mode) => match mode {
                ReplConfMode::ListeningPort(_) | ReplConfMode::Capability(_) => {
                    self.reply(Resp::simple("OK"))?;
                }
                // GETACK is master-to-replica traffic; a client sending it
                // gets the same acknowledgement
                ReplConfMode::GetAck(_) => self.reply(Resp::simple("OK"))?,
                ReplConfMode::Ack(_) => self.reply(Resp::Empty)?,
            },
            RedisCommands::PSync(_, _) => return self.enroll_replica(),
            RedisCommands::Wait(wanted, timeout_ms) => {
                let count = self.shared.repl.wait_for_acks(wanted, timeout_ms);
                self.reply(Resp::Integer(count as i64))?;
            }
            RedisCommands::BLPop(key, timeout) => {
                let reply = match self.shared.store.blpop(&key, timeout) {
                    Ok(Some(element)) => {
                        Resp::Array(vec![Resp::BulkString(key), Resp::BulkString(element)])
                    }
                    Ok(None) => Resp::NullArray,
                    Err(err) => Resp::Error(err.to_string()),
                };
                self.reply(reply)?;
            }
            RedisCommands::XRead(opts) if opts.block_ms.is_some() => {
                let hits = self.shared.store.xread(opts.streams, opts.block_ms);
                self.reply(xread_reply(&hits))?;
            }
            command => {
                if command.is_write() && self.shared.repl.is_replica() {
                    self.reply(Resp::Error(CommandError::ReadOnlyReplica.to_string()))?;
                    return Ok(Flow::Continue);
                }
                let reply = {
                    let mut inner = self.shared.store.lock();
                    let (reply, propagate) = apply(&command, &self.shared, &mut inner);
                    // fan out before releasing the lock so replicas see
                    // writes in keyspace order
                    if let Some(propagate) = propagate {
                        self.shared
                            .repl
                            .propagate(&Resp::from(propagate).encode_to_bytes());
                    }
                    reply
                };
                self.reply(reply)?;
            }
        }
        Ok(Flow::Continue)
    }

    /// EXEC: the whole queue runs under one continuous store lock, so the
    /// transaction is atomic with respect to every other connection. Each
    /// command's reply (errors included) lands in the aggregate array.
    fn exec(&mut self) -> anyhow::Result<()> {
        if !self.in_transaction {
            return self.reply(Resp::Error(CommandError::ExecWithoutMulti.to_string()));
        }
        self.in_transaction = false;
        let queued = std::mem::take(&mut self.queued);
        let mut replies = Vec::with_capacity(queued.len());
        {
            let mut inner = self.shared.store.lock();
            for frame in queued {
                match RedisCommands::try_from(frame) {
                    Ok(command) => {
                        let (reply, propagate) = apply(&command, &self.shared, &mut inner);
                        if let Some(propagate) = propagate {
                            self.shared
                                .repl
                                .propagate(&Resp::from(propagate).encode_to_bytes());
                        }
                        replies.push(reply);
                    }
                    Err(err) => replies.push(Resp::Error(err.to_string())),
                }
            }
        }
        self.reply(Resp::Array(replies))
    }

    /// `PSYNC ? -1`: full resync. Send the header and the CRLF-less RDB
    /// frame, then hand the socket to the replica registry.
    fn enroll_replica(&mut self) -> anyhow::Result<Flow> {
        let Some((repl_id, offset)) = self.shared.repl.full_resync() else {
            self.reply(Resp::Error(
                "ERR PSYNC can only be used with a master".to_string(),
            ))?;
            return Ok(Flow::Continue);
        };
        let rdb = replication::empty_rdb_bytes()?;
        let mut payload = Resp::simple(format!("FULLRESYNC {repl_id} {offset}")).encode_to_bytes();
        payload.extend_from_slice(b"$");
        payload.extend_from_slice(rdb.len().to_string().as_bytes());
        payload.extend_from_slice(b"\r\n");
        payload.extend_from_slice(&rdb);
        self.stream.write_all(&payload)?;
        let id = self.shared.repl.register_replica(self.stream.try_clone()?);
        Ok(Flow::Enrolled(id))
    }

    /// After enrollment the socket only ever carries `REPLCONF ACK` frames
    /// back to us; propagation happens on other threads via the registry.
    fn read_replica_acks(mut self, mut buf: BytesMut, id: u64) -> anyhow::Result<()> {
        let result = self.ack_loop(&mut buf, id);
        self.shared.repl.deregister_replica(id);
        result
    }

    fn ack_loop(&mut self, buf: &mut BytesMut, id: u64) -> anyhow::Result<()> {
        loop {
            while let Some(frame) = next_frame(buf)? {
                match RedisCommands::try_from(frame) {
                    Ok(RedisCommands::ReplConf(ReplConfMode::Ack(offset))) => {
                        debug!("replica {id} acked offset {offset}");
                        self.shared.repl.record_ack(id, offset);
                    }
                    Ok(other) => warn!("unexpected frame from replica {id}: {other:?}"),
                    Err(err) => warn!("undecodable frame from replica {id}: {err}"),
                }
            }
            let mut chunk = [0u8; 4096];
            let read = self.stream.read(&mut chunk)?;
            if read == 0 {
                info!("replica {id} disconnected");
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..read]);
        }
    }

    fn reply(&mut self, resp: Resp) -> anyhow::Result<()> {
        self.stream.write_all(&resp.encode_to_bytes())?;
        Ok(())
    }
}

/// Pops the next complete frame off the buffer, if one is there.
fn next_frame(buf: &mut BytesMut) -> Result<Option<Resp>, ProtocolError> {
    let decoded = match tokenize_bytes(&buf[..])? {
        Decoded::Complete(frame, rest) => Some((frame, buf.len() - rest.len())),
        Decoded::Partial => None,
    };
    Ok(decoded.map(|(frame, consumed)| {
        buf.advance(consumed);
        frame
    }))
}

/// Executes one command against the locked keyspace. Returns the RESP reply
/// plus, for successful writes, the command to propagate to replicas (XADD
/// is rewritten to its resolved id so replicas converge).
///
/// Blocking commands take their non-blocking shape here: this path serves
/// EXEC bodies and the replica apply loop, where suspending is not an
/// option. That covers WAIT too, which reports the caught-up replica count
/// without probing or parking.
pub fn apply(
    command: &RedisCommands,
    shared: &Shared,
    inner: &mut StoreInner,
) -> (Resp, Option<RedisCommands>) {
    match command {
        RedisCommands::Ping => (Resp::simple("PONG"), None),
        RedisCommands::Echo(text) => (Resp::BulkString(text.clone()), None),
        RedisCommands::Set(opts) => {
            inner.set(opts.key.clone(), opts.value.clone(), opts.expire);
            (Resp::simple("OK"), Some(command.clone()))
        }
        RedisCommands::Get(key) => match inner.get(key) {
            Ok(Some(value)) => (Resp::BulkString(value), None),
            Ok(None) => (Resp::NullBulkString, None),
            Err(err) => (Resp::Error(err.to_string()), None),
        },
        RedisCommands::Incr(key) => match inner.incr(key) {
            Ok(value) => (Resp::Integer(value), Some(command.clone())),
            Err(err) => (Resp::Error(err.to_string()), None),
        },
        RedisCommands::Type(key) => (Resp::simple(inner.type_name(key)), None),
        RedisCommands::LPush(key, elements) => match inner.push(key, elements.clone(), true) {
            Ok(len) => (Resp::Integer(len as i64), Some(command.clone())),
            Err(err) => (Resp::Error(err.to_string()), None),
        },
        RedisCommands::RPush(key, elements) => match inner.push(key, elements.clone(), false) {
            Ok(len) => (Resp::Integer(len as i64), Some(command.clone())),
            Err(err) => (Resp::Error(err.to_string()), None),
        },
        RedisCommands::LPop(key, None) => match inner.pop_front(key) {
            Ok(Some(element)) => (Resp::BulkString(element), Some(command.clone())),
            Ok(None) => (Resp::NullBulkString, None),
            Err(err) => (Resp::Error(err.to_string()), None),
        },
        RedisCommands::LPop(key, Some(count)) => match inner.pop_count(key, *count) {
            Ok(elements) => {
                let propagate = (!elements.is_empty()).then(|| command.clone());
                (
                    Resp::Array(elements.into_iter().map(Resp::BulkString).collect()),
                    propagate,
                )
            }
            Err(err) => (Resp::Error(err.to_string()), None),
        },
        RedisCommands::LLen(key) => match inner.llen(key) {
            Ok(len) => (Resp::Integer(len as i64), None),
            Err(err) => (Resp::Error(err.to_string()), None),
        },
        RedisCommands::LRange(key, start, stop) => match inner.lrange(key, *start, *stop) {
            Ok(elements) => (
                Resp::Array(elements.into_iter().map(Resp::BulkString).collect()),
                None,
            ),
            Err(err) => (Resp::Error(err.to_string()), None),
        },
        RedisCommands::BLPop(key, _) => match inner.pop_front(key) {
            Ok(Some(element)) => (
                Resp::Array(vec![
                    Resp::BulkString(key.clone()),
                    Resp::BulkString(element),
                ]),
                None,
            ),
            Ok(None) => (Resp::NullArray, None),
            Err(err) => (Resp::Error(err.to_string()), None),
        },
        RedisCommands::XAdd(opts) => match inner.xadd(&opts.key, opts.id, opts.fields.clone()) {
            Ok(id) => {
                let resolved = RedisCommands::XAdd(XAddOptions {
                    key: opts.key.clone(),
                    id: IdSpec::Explicit(id),
                    fields: opts.fields.clone(),
                });
                (Resp::bulk(id.to_string()), Some(resolved))
            }
            Err(err) => (Resp::Error(err.to_string()), None),
        },
        RedisCommands::XRange(key, start, end) => match inner.xrange(key, *start, *end) {
            Ok(entries) => (range_reply(&entries), None),
            Err(err) => (Resp::Error(err.to_string()), None),
        },
        RedisCommands::XRead(opts) => {
            let resolved: Vec<_> = opts
                .streams
                .iter()
                .map(|(key, start)| {
                    let after = match start {
                        ReadStart::Latest => inner.last_stream_id(key),
                        ReadStart::After(id) => *id,
                    };
                    (key.clone(), after)
                })
                .collect();
            (xread_reply(&inner.read_streams(&resolved)), None)
        }
        RedisCommands::Info(_) => (Resp::bulk(shared.repl.info_string()), None),
        RedisCommands::ReplConf(ReplConfMode::Ack(_)) => (Resp::Empty, None),
        RedisCommands::ReplConf(_) => (Resp::simple("OK"), None),
        RedisCommands::Wait(..) => (Resp::Integer(shared.repl.acked_count() as i64), None),
        // PSYNC converts the socket into a replica feed, which cannot happen
        // mid-aggregate; MULTI/EXEC/DISCARD never reach here (the session
        // handles them before queueing) and share the arm for exhaustiveness
        RedisCommands::PSync(..) => (
            Resp::Error(CommandError::NotAllowedInTransaction("PSYNC").to_string()),
            None,
        ),
        RedisCommands::Multi => (
            Resp::Error(CommandError::NotAllowedInTransaction("MULTI").to_string()),
            None,
        ),
        RedisCommands::Exec => (
            Resp::Error(CommandError::NotAllowedInTransaction("EXEC").to_string()),
            None,
        ),
        RedisCommands::Discard => (
            Resp::Error(CommandError::NotAllowedInTransaction("DISCARD").to_string()),
            None,
        ),
    }
}
