//! Memcached-backed store, speaking the text protocol.
//!
//! Keys are sharded over the configured endpoints by a stable hash, so
//! every process pointed at the same endpoint list agrees on placement.
//! One lazily-opened connection is held per endpoint; any I/O error or
//! timeout drops the connection and the next operation reconnects.
//!
//! The protocol delimits commands with CRLF and key tokens with spaces, so
//! key text is rendered for the wire before it reaches a command line:
//! delimiter and control bytes travel percent-encoded, and a rendering that
//! outgrows the protocol's key cap collapses to a digested form. A key byte
//! can therefore never terminate a command or smuggle in a second one.
//!
//! Entries travel as the entry envelope with wire flags `0`; raw counter
//! entries are stored as bare ASCII decimals with flags `1` so the server's
//! native `incr`/`decr` can operate on them. Physical TTLs are padded with
//! the grace window, otherwise the server would drop entries the moment
//! they logically expire and there would be nothing stale left to serve.
//!
//! The regeneration lease rides on `add`: first writer of the lease key
//! wins, the server expires abandoned leases. That makes the lease work
//! across processes, which the in-memory table cannot.

use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime, PrimitiveDateTime};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

use crate::codec::{decode_envelope, encode_envelope};
use crate::entry::{CacheEntry, resolve_expiry};
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::stampede::LeaseToken;

use super::{CacheStore, WriteOptions};

const BACKEND: &str = "memcached";

/// Wire flags bit marking a bare (non-enveloped) counter value.
const FLAG_RAW_VALUE: u32 = 1;

/// Default item size limit of an untuned memcached server. The server is
/// authoritative; this is only reported when it rejects an oversized item.
const DEFAULT_ITEM_LIMIT_BYTES: usize = 1024 * 1024;

/// Relative exptimes above this are interpreted by the server as absolute
/// unix timestamps.
const THIRTY_DAYS_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct MemcachedConfig {
    /// `host:port` endpoints; keys are sharded across them.
    pub endpoints: Vec<String>,
    /// Budget for any single protocol exchange, connect included.
    pub op_timeout: std::time::Duration,
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:11211".to_owned()],
            op_timeout: std::time::Duration::from_secs(1),
        }
    }
}

struct Connection {
    stream: BufStream<TcpStream>,
}

impl Connection {
    async fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        let read = self.stream.read_line(&mut line).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            ));
        }
        Ok(line.trim_end().to_owned())
    }

    async fn command(&mut self, line: String) -> io::Result<String> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        self.read_line().await
    }

    async fn storage(
        &mut self,
        verb: &str,
        key: &str,
        flags: u32,
        exptime: u32,
        data: &[u8],
    ) -> io::Result<String> {
        let header = format!("{verb} {key} {flags} {exptime} {}", data.len());
        self.stream.write_all(header.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.write_all(data).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        self.read_line().await
    }

    /// `get` for one or more keys. Returns `(key, flags, data)` per hit.
    async fn retrieve(&mut self, keys: &[String]) -> io::Result<Vec<(String, u32, Vec<u8>)>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut request = String::from("get");
        for key in keys {
            request.push(' ');
            request.push_str(key);
        }
        request.push_str("\r\n");
        self.stream.write_all(request.as_bytes()).await?;
        self.stream.flush().await?;

        let mut values = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "END" {
                return Ok(values);
            }
            let Some(header) = line.strip_prefix("VALUE ") else {
                return Err(protocol_error(&line));
            };
            let mut parts = header.split_ascii_whitespace();
            let (Some(key), Some(flags), Some(len)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(protocol_error(&line));
            };
            let flags: u32 = flags.parse().map_err(|_| protocol_error(&line))?;
            let len: usize = len.parse().map_err(|_| protocol_error(&line))?;

            // Data block plus its trailing \r\n.
            let mut data = vec![0u8; len + 2];
            self.stream.read_exact(&mut data).await?;
            data.truncate(len);
            values.push((key.to_owned(), flags, data));
        }
    }
}

fn protocol_error(line: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected server reply: {line}"),
    )
}

enum StorageReply {
    Stored,
    NotStored,
    TooLarge,
}

fn classify_storage(line: &str) -> io::Result<StorageReply> {
    match line {
        "STORED" => Ok(StorageReply::Stored),
        "NOT_STORED" => Ok(StorageReply::NotStored),
        _ if line.starts_with("SERVER_ERROR") && line.contains("too large") => {
            Ok(StorageReply::TooLarge)
        }
        _ => Err(protocol_error(line)),
    }
}

enum ArithReply {
    Value(u64),
    NotFound,
    NonNumeric,
}

fn classify_arith(line: &str) -> io::Result<ArithReply> {
    if let Ok(value) = line.parse::<u64>() {
        return Ok(ArithReply::Value(value));
    }
    match line {
        "NOT_FOUND" => Ok(ArithReply::NotFound),
        _ if line.starts_with("CLIENT_ERROR") => Ok(ArithReply::NonNumeric),
        _ => Err(protocol_error(line)),
    }
}

/// Store over one or more memcached servers.
pub struct MemcachedStore {
    config: MemcachedConfig,
    connections: Vec<Mutex<Option<Connection>>>,
}

impl MemcachedStore {
    pub fn new(config: MemcachedConfig) -> Result<Self, CacheError> {
        if config.endpoints.is_empty() {
            return Err(CacheError::configuration(
                "memcached backend requires at least one endpoint",
            ));
        }
        let connections = config.endpoints.iter().map(|_| Mutex::new(None)).collect();
        Ok(Self {
            config,
            connections,
        })
    }

    fn shard_for(&self, key: &str) -> usize {
        let digest = Sha256::digest(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % self.connections.len() as u64) as usize
    }

    async fn ensure_connected<'a>(
        &self,
        slot: &'a mut Option<Connection>,
        shard: usize,
    ) -> Result<&'a mut Connection, CacheError> {
        if slot.is_none() {
            let addr = &self.config.endpoints[shard];
            let stream = timeout(self.config.op_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    CacheError::unavailable(BACKEND, format!("connect to {addr} timed out"))
                })?
                .map_err(|err| {
                    CacheError::unavailable(BACKEND, format!("connect to {addr} failed: {err}"))
                })?;
            tracing::debug!(endpoint = %addr, "connected to memcached");
            *slot = Some(Connection {
                stream: BufStream::new(stream),
            });
        }
        slot.as_mut()
            .ok_or_else(|| CacheError::unavailable(BACKEND, "connection slot empty"))
    }

    async fn fetch_one(
        &self,
        key: &CacheKey,
    ) -> Result<Option<(u32, Vec<u8>)>, CacheError> {
        let shard = self.shard_for(key.as_str());
        let mut slot = self.connections[shard].lock().await;
        let conn = self.ensure_connected(&mut slot, shard).await?;
        let keys = [wire_key(key)];
        let outcome = timeout(self.config.op_timeout, conn.retrieve(&keys)).await;
        let mut values = settle(&mut slot, outcome, "get")?;
        Ok(values.pop().map(|(_, flags, data)| (flags, data)))
    }

    async fn store_one(
        &self,
        verb: &str,
        key: &CacheKey,
        flags: u32,
        exptime: u32,
        data: &[u8],
    ) -> Result<StorageReply, CacheError> {
        let shard = self.shard_for(key.as_str());
        let mut slot = self.connections[shard].lock().await;
        let conn = self.ensure_connected(&mut slot, shard).await?;
        let outcome = timeout(
            self.config.op_timeout,
            conn.storage(verb, &wire_key(key), flags, exptime, data),
        )
        .await;
        let line = settle(&mut slot, outcome, verb)?;
        classify_storage(&line).map_err(|err| fail_protocol(&mut slot, err))
    }

    async fn arith_one(
        &self,
        verb: &str,
        key: &CacheKey,
        delta: u64,
    ) -> Result<ArithReply, CacheError> {
        let shard = self.shard_for(key.as_str());
        let mut slot = self.connections[shard].lock().await;
        let conn = self.ensure_connected(&mut slot, shard).await?;
        let outcome = timeout(
            self.config.op_timeout,
            conn.command(format!("{verb} {} {delta}", wire_key(key))),
        )
        .await;
        let line = settle(&mut slot, outcome, verb)?;
        classify_arith(&line).map_err(|err| fail_protocol(&mut slot, err))
    }

    /// Seed-then-retry shared by both counter directions. `seed` is the
    /// value an absent counter initializes to.
    async fn bump_counter(
        &self,
        verb: &str,
        key: &CacheKey,
        delta: u64,
        seed: u64,
        options: &WriteOptions,
    ) -> Result<u64, CacheError> {
        match self.arith_one(verb, key, delta).await? {
            ArithReply::Value(value) => return Ok(value),
            ArithReply::NonNumeric => return Err(CacheError::type_mismatch(key.as_str())),
            ArithReply::NotFound => {}
        }

        let now = OffsetDateTime::now_utc();
        let expires_at = resolve_expiry(options.expires_in, options.expires_at, now);
        let exptime = exptime_for(expires_at, Duration::ZERO, now);
        match self
            .store_one("add", key, FLAG_RAW_VALUE, exptime, seed.to_string().as_bytes())
            .await?
        {
            StorageReply::Stored => Ok(seed),
            StorageReply::TooLarge => {
                Err(CacheError::entry_too_large(key.as_str(), DEFAULT_ITEM_LIMIT_BYTES))
            }
            // Lost the seeding race; the counter now exists.
            StorageReply::NotStored => match self.arith_one(verb, key, delta).await? {
                ArithReply::Value(value) => Ok(value),
                ArithReply::NonNumeric => Err(CacheError::type_mismatch(key.as_str())),
                ArithReply::NotFound => Err(CacheError::unavailable(
                    BACKEND,
                    "counter expired while being seeded",
                )),
            },
        }
    }

    fn lease_key(key: &CacheKey) -> CacheKey {
        // Re-deriving through CacheKey keeps the suffixed key under the
        // protocol's length cap.
        CacheKey::new(format!("{}+lease", key.as_str()))
    }
}

fn settle<T>(
    slot: &mut Option<Connection>,
    outcome: Result<io::Result<T>, Elapsed>,
    op: &str,
) -> Result<T, CacheError> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            *slot = None;
            Err(CacheError::unavailable(BACKEND, format!("{op} failed: {err}")))
        }
        Err(_) => {
            *slot = None;
            Err(CacheError::unavailable(BACKEND, format!("{op} timed out")))
        }
    }
}

/// A reply we could read but not understand; the stream state is unknown,
/// so the connection is dropped along with reporting the error.
fn fail_protocol(slot: &mut Option<Connection>, err: io::Error) -> CacheError {
    *slot = None;
    CacheError::unavailable(BACKEND, err.to_string())
}

/// Render `key` for a protocol line. Space, CRLF, and the other control
/// bytes would act as delimiters, so they and the escape byte itself are
/// percent-encoded; re-deriving through [`CacheKey`] digests a rendering
/// that outgrew the length cap. Distinct keys always render distinctly.
fn wire_key(key: &CacheKey) -> String {
    let mut rendered = String::with_capacity(key.as_str().len());
    for ch in key.as_str().chars() {
        let code = ch as u32;
        if code <= 0x20 || code == 0x7F || ch == '%' {
            rendered.push_str(&format!("%{code:02X}"));
        } else {
            rendered.push(ch);
        }
    }
    CacheKey::new(rendered).into_string()
}

fn decode_value(flags: u32, data: Vec<u8>) -> Result<CacheEntry, CacheError> {
    if flags & FLAG_RAW_VALUE != 0 {
        // The server owns expiry for bare counters.
        Ok(CacheEntry::raw(Bytes::from(data), None))
    } else {
        decode_envelope(Bytes::from(data))
    }
}

/// Physical TTL for the server: the logical deadline padded by the grace
/// window, rounded up to whole seconds, switching to an absolute epoch past
/// the protocol's 30-day threshold.
fn exptime_for(
    expires_at: Option<OffsetDateTime>,
    race_pad: Duration,
    now: OffsetDateTime,
) -> u32 {
    let Some(at) = expires_at else { return 0 };
    let deadline = at
        .checked_add(race_pad)
        .unwrap_or(PrimitiveDateTime::MAX.assume_utc());
    let remaining = deadline - now;
    let mut secs = remaining.whole_seconds();
    if remaining.subsec_nanoseconds() > 0 {
        secs += 1;
    }
    if secs <= 0 {
        return 1;
    }
    if secs > THIRTY_DAYS_SECS {
        deadline.unix_timestamp().clamp(1, i64::from(u32::MAX)) as u32
    } else {
        secs as u32
    }
}

fn ceil_secs(duration: Duration) -> u32 {
    let mut secs = duration.whole_seconds();
    if duration.subsec_nanoseconds() > 0 {
        secs = secs.saturating_add(1);
    }
    secs.clamp(1, i64::from(u32::MAX)) as u32
}

#[async_trait]
impl CacheStore for MemcachedStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn read_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        match self.fetch_one(key).await? {
            Some((flags, data)) => Ok(Some(decode_value(flags, data)?)),
            None => Ok(None),
        }
    }

    async fn write_entry(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        options: &WriteOptions,
    ) -> Result<bool, CacheError> {
        let now = OffsetDateTime::now_utc();
        let exptime = exptime_for(entry.expires_at(), options.race_ttl(), now);
        let verb = if options.unless_exist { "add" } else { "set" };
        let (flags, data) = if entry.is_raw() {
            (FLAG_RAW_VALUE, entry.payload().clone())
        } else {
            (0, encode_envelope(&entry))
        };

        match self.store_one(verb, key, flags, exptime, &data).await? {
            StorageReply::Stored => Ok(true),
            StorageReply::NotStored => Ok(false),
            StorageReply::TooLarge => {
                Err(CacheError::entry_too_large(key.as_str(), DEFAULT_ITEM_LIMIT_BYTES))
            }
        }
    }

    async fn delete_entry(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let shard = self.shard_for(key.as_str());
        let mut slot = self.connections[shard].lock().await;
        let conn = self.ensure_connected(&mut slot, shard).await?;
        let outcome = timeout(
            self.config.op_timeout,
            conn.command(format!("delete {}", wire_key(key))),
        )
        .await;
        let line = settle(&mut slot, outcome, "delete")?;
        match line.as_str() {
            "DELETED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            other => Err(fail_protocol(&mut slot, protocol_error(other))),
        }
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(match self.read_entry(key).await? {
            Some(entry) => !entry.is_expired(OffsetDateTime::now_utc()),
            None => false,
        })
    }

    async fn increment(
        &self,
        key: &CacheKey,
        delta: u64,
        options: &WriteOptions,
    ) -> Result<u64, CacheError> {
        self.bump_counter("incr", key, delta, delta, options).await
    }

    async fn decrement(
        &self,
        key: &CacheKey,
        delta: u64,
        options: &WriteOptions,
    ) -> Result<u64, CacheError> {
        // decr clamps at zero server-side; an absent counter starts there.
        self.bump_counter("decr", key, delta, 0, options).await
    }

    async fn try_acquire_lease(
        &self,
        key: &CacheKey,
        ttl: Duration,
    ) -> Result<Option<LeaseToken>, CacheError> {
        let token = LeaseToken::mint();
        let reply = self
            .store_one(
                "add",
                &Self::lease_key(key),
                0,
                ceil_secs(ttl),
                token.render().as_bytes(),
            )
            .await?;
        Ok(match reply {
            StorageReply::Stored => Some(token),
            StorageReply::NotStored => None,
            StorageReply::TooLarge => None,
        })
    }

    async fn release_lease(&self, key: &CacheKey, token: LeaseToken) -> Result<(), CacheError> {
        let lease_key = Self::lease_key(key);
        // Only the holder may release: check the stored token first. A
        // lease reclaimed between the get and the delete is still deleted,
        // so one duplicate regeneration can slip through that window;
        // closing it would take a `gets`/`cas` tombstone exchange.
        let holder = match self.fetch_one(&lease_key).await? {
            Some((_, data)) => String::from_utf8(data)
                .ok()
                .and_then(|raw| LeaseToken::parse(&raw)),
            None => return Ok(()),
        };
        if holder == Some(token) {
            self.delete_entry(&lease_key).await?;
        }
        Ok(())
    }

    async fn delete_matched(&self, _pattern: &str) -> Result<usize, CacheError> {
        // The protocol has no key enumeration.
        Err(CacheError::Unsupported {
            backend: BACKEND,
            operation: "delete_matched",
        })
    }

    async fn cleanup(&self, _now: OffsetDateTime) -> Result<usize, CacheError> {
        // The server expires entries itself.
        Err(CacheError::Unsupported {
            backend: BACKEND,
            operation: "cleanup",
        })
    }

    async fn clear(&self) -> Result<(), CacheError> {
        for shard in 0..self.connections.len() {
            let mut slot = self.connections[shard].lock().await;
            let conn = self.ensure_connected(&mut slot, shard).await?;
            let outcome = timeout(self.config.op_timeout, conn.command("flush_all".to_owned())).await;
            let line = settle(&mut slot, outcome, "flush_all")?;
            if line != "OK" {
                return Err(fail_protocol(&mut slot, protocol_error(&line)));
            }
        }
        Ok(())
    }

    async fn read_entries(
        &self,
        keys: &[CacheKey],
    ) -> Result<Vec<Option<CacheEntry>>, CacheError> {
        // The server replies with wire-rendered keys, so the reverse
        // mapping goes through the same rendering.
        let wire_keys: Vec<String> = keys.iter().map(wire_key).collect();
        let mut by_shard: Vec<Vec<String>> = vec![Vec::new(); self.connections.len()];
        for (key, wire) in keys.iter().zip(&wire_keys) {
            by_shard[self.shard_for(key.as_str())].push(wire.clone());
        }

        let mut found: HashMap<String, CacheEntry> = HashMap::with_capacity(keys.len());
        for (shard, shard_keys) in by_shard.iter().enumerate() {
            if shard_keys.is_empty() {
                continue;
            }
            let mut slot = self.connections[shard].lock().await;
            let conn = self.ensure_connected(&mut slot, shard).await?;
            let outcome = timeout(self.config.op_timeout, conn.retrieve(shard_keys)).await;
            for (key, flags, data) in settle(&mut slot, outcome, "get multi")? {
                found.insert(key, decode_value(flags, data)?);
            }
        }
        Ok(wire_keys.iter().map(|wire| found.remove(wire.as_str())).collect())
    }
}
