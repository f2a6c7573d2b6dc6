use std::io::{Read, Write};
use std::net::TcpStream;
use std::num::ParseIntError;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use bytes::{Buf, Bytes, BytesMut};
use log::{debug, info, warn};

use crate::commands::{RedisCommands, ReplConfMode};
use crate::server::Shared;
use crate::session;
use crate::tokenizer::{tokenize_bytes, tokenize_rdb, Decoded, Resp};

/// Fixed replication id; a production deployment would randomize this at
/// master startup.
pub const DEFAULT_REPL_ID: &str = "8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb";

/// An empty RDB snapshot shipped verbatim during full resync. Replicas
/// discard it; the bytes exist only to satisfy the handshake.
const EMPTY_RDB: &str = "524544495330303131fa0972656469732d76657205372e322e30fa0a72656469732d62697473c040fa056374696d65c26d08bc65fa08757365642d6d656dc2b0c41000fa08616f662d62617365c000fff06e3bfec0ff5aa2";

pub struct MasterStatus {
    repl_id: String,
    /// Every byte fanned out to replica sockets, GETACK probes included.
    repl_offset: u64,
    /// The offset as of the last propagated write; WAIT targets this.
    repl_data_offset: u64,
    next_replica_id: u64,
    replicas: Vec<ReplicaHandle>,
}

struct ReplicaHandle {
    id: u64,
    stream: TcpStream,
    acked_offset: u64,
}

pub struct ReplicaStatus {
    master_host: String,
    master_port: u16,
}

pub enum ServerType {
    Master(MasterStatus),
    Replica(ReplicaStatus),
}

impl ServerType {
    fn encode_to_info_string(&self) -> String {
        match self {
            ServerType::Master(status) => format!(
                "role:master\r\n\
                    master_replid:{}\r\n\
                    master_repl_offset:{}",
                status.repl_id, status.repl_offset
            ),
            ServerType::Replica(_) => "role:slave".to_string(),
        }
    }
}

/// Role state plus the replica registry. WAIT parks on `ack_signal`, which
/// fires whenever a replica raises its acked offset.
pub struct Replication {
    state: Mutex<ServerType>,
    ack_signal: Condvar,
}

impl Replication {
    pub fn new_master() -> Replication {
        Replication {
            state: Mutex::new(ServerType::Master(MasterStatus {
                repl_id: DEFAULT_REPL_ID.to_string(),
                repl_offset: 0,
                repl_data_offset: 0,
                next_replica_id: 0,
                replicas: Vec::new(),
            })),
            ack_signal: Condvar::new(),
        }
    }

    pub fn new_replica(master_host: String, master_port: u16) -> Replication {
        Replication {
            state: Mutex::new(ServerType::Replica(ReplicaStatus {
                master_host,
                master_port,
            })),
            ack_signal: Condvar::new(),
        }
    }

    pub fn is_replica(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), ServerType::Replica(_))
    }

    pub fn master_address(&self) -> Option<(String, u16)> {
        match &*self.state.lock().unwrap() {
            ServerType::Replica(status) => {
                Some((status.master_host.clone(), status.master_port))
            }
            ServerType::Master(_) => None,
        }
    }

    pub fn info_string(&self) -> String {
        self.state.lock().unwrap().encode_to_info_string()
    }

    /// Replication id and offset for a `+FULLRESYNC` header; `None` when this
    /// server is not a master.
    pub fn full_resync(&self) -> Option<(String, u64)> {
        match &*self.state.lock().unwrap() {
            ServerType::Master(status) => Some((status.repl_id.clone(), status.repl_offset)),
            ServerType::Replica(_) => None,
        }
    }

    pub fn register_replica(&self, stream: TcpStream) -> u64 {
        let mut state = self.state.lock().unwrap();
        let ServerType::Master(master) = &mut *state else {
            return 0;
        };
        let id = master.next_replica_id;
        master.next_replica_id += 1;
        master.replicas.push(ReplicaHandle {
            id,
            stream,
            acked_offset: 0,
        });
        info!("master added replica {id}");
        id
    }

    pub fn deregister_replica(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        if let ServerType::Master(master) = &mut *state {
            master.replicas.retain(|replica| replica.id != id);
            info!("master removed replica {id}");
        }
        self.ack_signal.notify_all();
    }

    /// Appends one write command's raw bytes to every replica socket. Callers
    /// hold the store lock, so the fan-out order is the keyspace mutation
    /// order. Dead sockets drop out of the registry here.
    pub fn propagate(&self, frame: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let ServerType::Master(master) = &mut *state else {
            return;
        };
        master.replicas.retain_mut(|replica| {
            match replica.stream.write_all(frame) {
                Ok(()) => true,
                Err(err) => {
                    warn!("dropping replica {}: {err}", replica.id);
                    false
                }
            }
        });
        master.repl_offset += frame.len() as u64;
        master.repl_data_offset = master.repl_offset;
    }

    /// `REPLCONF ACK <n>`: offsets only move forward.
    pub fn record_ack(&self, id: u64, offset: u64) {
        let mut state = self.state.lock().unwrap();
        if let ServerType::Master(master) = &mut *state {
            if let Some(replica) = master.replicas.iter_mut().find(|replica| replica.id == id) {
                if offset > replica.acked_offset {
                    replica.acked_offset = offset;
                }
            }
        }
        self.ack_signal.notify_all();
    }

    /// Replicas currently caught up to the write offset, without probing or
    /// parking. This is WAIT's non-blocking shape, used inside transactions.
    pub fn acked_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        let target = match &*state {
            ServerType::Master(master) => master.repl_data_offset,
            ServerType::Replica(_) => return 0,
        };
        if target == 0 {
            return match &*state {
                ServerType::Master(master) => master.replicas.len(),
                ServerType::Replica(_) => 0,
            };
        }
        count_acked(&state, target)
    }

    #[cfg(test)]
    fn replica_count(&self) -> usize {
        match &*self.state.lock().unwrap() {
            ServerType::Master(master) => master.replicas.len(),
            ServerType::Replica(_) => 0,
        }
    }

    /// WAIT: count replicas that acked the current write offset, probing with
    /// one `REPLCONF GETACK *` broadcast and parking until the count is
    /// reached or the deadline passes. A zero timeout waits indefinitely.
    pub fn wait_for_acks(&self, wanted: usize, timeout_ms: u64) -> usize {
        let mut state = self.state.lock().unwrap();
        let target = match &*state {
            ServerType::Master(master) => master.repl_data_offset,
            ServerType::Replica(_) => return 0,
        };
        if target == 0 {
            // nothing was ever written, so every replica is trivially caught up
            return match &*state {
                ServerType::Master(master) => master.replicas.len(),
                ServerType::Replica(_) => 0,
            };
        }
        let acked = count_acked(&state, target);
        if acked >= wanted {
            return acked;
        }
        if let ServerType::Master(master) = &mut *state {
            let getack =
                Resp::from(RedisCommands::ReplConf(ReplConfMode::GetAck("*".to_string())))
                    .encode_to_bytes();
            master.replicas.retain_mut(|replica| {
                match replica.stream.write_all(&getack) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!("dropping replica {}: {err}", replica.id);
                        false
                    }
                }
            });
            master.repl_offset += getack.len() as u64;
        }
        let deadline =
            (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        loop {
            let acked = count_acked(&state, target);
            if acked >= wanted {
                return acked;
            }
            state = match deadline {
                None => self.ack_signal.wait(state).unwrap(),
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return acked;
                    };
                    self.ack_signal.wait_timeout(state, remaining).unwrap().0
                }
            };
        }
    }
}

fn count_acked(state: &ServerType, target: u64) -> usize {
    match state {
        ServerType::Master(master) => master
            .replicas
            .iter()
            .filter(|replica| replica.acked_offset >= target)
            .count(),
        ServerType::Replica(_) => 0,
    }
}

pub fn empty_rdb_bytes() -> Result<Vec<u8>, ParseIntError> {
    decode_hex(EMPTY_RDB)
}

fn decode_hex(s: &str) -> Result<Vec<u8>, ParseIntError> {
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
        .collect()
}

/// Replica side: handshake with the master, discard the RDB snapshot, then
/// apply the propagated command stream silently. Runs on its own thread for
/// the life of the process.
pub fn connect_master(shared: Arc<Shared>, own_port: u16) -> anyhow::Result<()> {
    let (host, port) = shared
        .repl
        .master_address()
        .ok_or_else(|| anyhow!("connect_master called on a master"))?;
    let mut stream = TcpStream::connect(format!("{host}:{port}"))
        .with_context(|| format!("failed to reach master at {host}:{port}"))?;
    let mut buf = BytesMut::with_capacity(4096);

    send_command(&mut stream, RedisCommands::Ping)?;
    expect_simple(&mut stream, &mut buf, "PONG")?;

    send_command(
        &mut stream,
        RedisCommands::ReplConf(ReplConfMode::ListeningPort(own_port)),
    )?;
    expect_simple(&mut stream, &mut buf, "OK")?;

    send_command(
        &mut stream,
        RedisCommands::ReplConf(ReplConfMode::Capability("psync2".to_string())),
    )?;
    expect_simple(&mut stream, &mut buf, "OK")?;

    send_command(&mut stream, RedisCommands::PSync("?".to_string(), -1))?;
    let (reply, _) = read_frame(&mut stream, &mut buf)?;
    match reply {
        Resp::SimpleString(text) if text.starts_with("FULLRESYNC") => {
            info!("replica handshake complete: {text}");
        }
        other => bail!("unexpected PSYNC reply: {other:?}"),
    }
    let rdb = read_rdb(&mut stream, &mut buf)?;
    debug!("discarded {} byte RDB snapshot", rdb.len());

    // Propagation loop. Commands apply without replies; only GETACK answers,
    // reporting the offset before the GETACK itself is counted.
    let mut bytes_processed: u64 = 0;
    loop {
        let (frame, consumed) = match read_frame(&mut stream, &mut buf) {
            Ok(next) => next,
            Err(err) => {
                info!("master link ended: {err:#}");
                return Ok(());
            }
        };
        match RedisCommands::try_from(frame) {
            Ok(RedisCommands::ReplConf(ReplConfMode::GetAck(_))) => {
                let ack = RedisCommands::ReplConf(ReplConfMode::Ack(bytes_processed));
                stream.write_all(&Resp::from(ack).encode_to_bytes())?;
            }
            Ok(RedisCommands::Ping) => {}
            Ok(cmd) => {
                let mut inner = shared.store.lock();
                let (reply, _) = session::apply(&cmd, &shared, &mut inner);
                if let Resp::Error(text) = reply {
                    warn!("replica failed to apply {cmd:?}: {text}");
                }
            }
            Err(err) => warn!("replica skipping unparseable command: {err}"),
        }
        bytes_processed += consumed as u64;
    }
}

fn send_command(stream: &mut TcpStream, command: RedisCommands) -> anyhow::Result<()> {
    stream.write_all(&Resp::from(command).encode_to_bytes())?;
    Ok(())
}

fn expect_simple(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    expected: &str,
) -> anyhow::Result<()> {
    let (reply, _) = read_frame(stream, buf)?;
    match reply {
        Resp::SimpleString(text) if text == expected => Ok(()),
        other => bail!("unexpected handshake reply {other:?}, wanted +{expected}"),
    }
}

/// Blocking read of the next complete frame, returning it with its wire
/// length.
fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> anyhow::Result<(Resp, usize)> {
    loop {
        let decoded = match tokenize_bytes(&buf[..])? {
            Decoded::Complete(frame, rest) => Some((frame, buf.len() - rest.len())),
            Decoded::Partial => None,
        };
        if let Some((frame, consumed)) = decoded {
            buf.advance(consumed);
            return Ok((frame, consumed));
        }
        let mut chunk = [0u8; 4096];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            bail!("connection closed");
        }
        buf.extend_from_slice(&chunk[..read]);
    }
}

fn read_rdb(stream: &mut TcpStream, buf: &mut BytesMut) -> anyhow::Result<Bytes> {
    loop {
        let decoded = tokenize_rdb(&buf[..])?
            .map(|(payload, rest)| (payload, buf.len() - rest.len()));
        if let Some((payload, consumed)) = decoded {
            buf.advance(consumed);
            return Ok(payload);
        }
        let mut chunk = [0u8; 4096];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            bail!("connection closed during RDB transfer");
        }
        buf.extend_from_slice(&chunk[..read]);
    }
}
