use std::collections::BTreeSet;
use std::fmt::Debug;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use super::BatchWriter;
use super::StoreClient;
use super::StoreReader;
use super::WriteBatch;
use super::WriteOp;
use crate::error::CacheError;
use crate::error::Result;

/// Single Redis node behind an auto-reconnecting connection manager.
#[derive(Clone)]
pub struct RedisStore {
    name:          String,
    conn:          ConnectionManager,
    atomic_writes: bool,
}

impl RedisStore {
    /// Connects and verifies the server with a `PING`.
    pub async fn connect(url: &str, atomic_writes: bool) -> Result<Self> {
        let name = display_url(url);
        let client = Client::open(url).map_err(|err| CacheError::unavailable(&name, err))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(|err| CacheError::unavailable(&name, err))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|err| CacheError::unavailable(&name, err))?;
        if pong != "PONG" {
            return Err(CacheError::unavailable(&name, format!("unexpected PING reply '{pong}'")));
        }

        info!("Connected to redis at {name}");
        Ok(Self {
            name,
            conn,
            atomic_writes,
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    fn failure(&self, err: redis::RedisError) -> CacheError {
        CacheError::unavailable(&self.name, err)
    }
}

/// Hides credentials of a connection URL.
fn display_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => format!("{}://{}", &url[..scheme_end], &url[at + 1..]),
        _ => url.to_string(),
    }
}

impl Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("name", &self.name)
            .field("atomic_writes", &self.atomic_writes)
            .finish()
    }
}

#[async_trait]
impl StoreReader for RedisStore {
    async fn get_values(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut self.conn())
            .await
            .map_err(|err| self.failure(err))
    }

    async fn hash_values(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut self.conn())
            .await
            .map_err(|err| self.failure(err))
    }

    async fn set_members(&self, keys: &[String]) -> Result<Vec<BTreeSet<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("SMEMBERS").arg(key);
        }
        pipe.query_async(&mut self.conn()).await.map_err(|err| self.failure(err))
    }

    #[instrument(level = "trace", skip(self))]
    async fn scan_set(&self, key: &str, pattern: Option<&str>, count: usize) -> Result<BTreeSet<String>> {
        let mut conn = self.conn();
        let mut members = BTreeSet::new();
        let mut cursor = 0u64;
        loop {
            let mut cmd = redis::cmd("SSCAN");
            cmd.arg(key).arg(cursor);
            if let Some(pattern) = pattern {
                cmd.arg("MATCH").arg(pattern);
            }
            cmd.arg("COUNT").arg(count.max(1));

            let (next, page): (u64, Vec<String>) = cmd.query_async(&mut conn).await.map_err(|err| self.failure(err))?;
            members.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(members)
    }

    async fn set_contains(&self, key: &str, members: &[String]) -> Result<Vec<bool>> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for member in members {
            pipe.cmd("SISMEMBER").arg(key).arg(member);
        }
        pipe.query_async(&mut self.conn()).await.map_err(|err| self.failure(err))
    }
}

#[async_trait]
impl BatchWriter for RedisStore {
    fn supports_atomic_batches(&self) -> bool {
        self.atomic_writes
    }

    #[instrument(level = "trace", skip_all, fields(store = %self.name, ops = batch.len()))]
    async fn write(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        if self.atomic_writes {
            pipe.atomic();
        }

        for op in batch.into_ops() {
            match op {
                WriteOp::Set { key, value } => {
                    pipe.cmd("SET").arg(key).arg(value).ignore();
                }
                WriteOp::Del { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
                WriteOp::SAdd { key, members } => {
                    pipe.cmd("SADD").arg(key).arg(members).ignore();
                }
                WriteOp::SRem { key, members } => {
                    pipe.cmd("SREM").arg(key).arg(members).ignore();
                }
                WriteOp::HSet { key, field, value } => {
                    pipe.cmd("HSET").arg(key).arg(field).arg(value).ignore();
                }
                WriteOp::HDel { key, fields } => {
                    pipe.cmd("HDEL").arg(key).arg(fields).ignore();
                }
                WriteOp::Expire { key, seconds } => {
                    pipe.cmd("EXPIRE").arg(key).arg(seconds).ignore();
                }
            }
        }

        let _: () = pipe.query_async(&mut self.conn()).await.map_err(|err| self.failure(err))?;
        debug!("[{}] batch applied", self.name);
        Ok(())
    }
}

impl StoreClient for RedisStore {
    fn name(&self) -> &str {
        &self.name
    }
}
