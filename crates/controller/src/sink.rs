//! Remote telemetry log store.
//!
//! Each log is a JSON array under `<root>/<key>`, rewritten in full on every
//! append (read, push, write).  Nothing here makes that atomic: two writers
//! on the same key race and the last write wins.  This process only ever
//! has one writer per key (channel logs from the main loop, `controller`
//! from the snapshot worker), but a second controller instance pointed at
//! the same database can silently drop records.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::SinkConfig;

/// Records kept per key by [`MemorySink`].
const MEMORY_LOG_CAP: usize = 200;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request for '{key}' failed: {source}")]
    Http {
        key: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("'{key}' returned status {status}")]
    Status { key: String, status: u16 },
    #[error("'{key}' holds something other than a record list")]
    NotAList { key: String },
    #[error("record for '{key}' could not be encoded: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn read_log(&self, key: &str) -> Result<Vec<Value>, SinkError>;
    async fn write_log(&self, key: &str, records: &[Value]) -> Result<(), SinkError>;
}

/// Read-append-write one record onto `key`.
pub async fn append(sink: &dyn TelemetrySink, key: &str, record: Value) -> Result<usize, SinkError> {
    let mut records = sink.read_log(key).await?;
    records.push(record);
    sink.write_log(key, &records).await?;
    Ok(records.len())
}

pub fn from_config(cfg: &SinkConfig) -> anyhow::Result<Arc<dyn TelemetrySink>> {
    if cfg.url.is_empty() {
        tracing::warn!("no sink url configured — telemetry kept in memory only");
        return Ok(Arc::new(MemorySink::default()));
    }
    let sink = FirebaseSink::new(cfg).context("failed to build telemetry sink client")?;
    tracing::info!(url = %cfg.url, root = %cfg.root, "telemetry sink ready");
    Ok(Arc::new(sink))
}

// ---------------------------------------------------------------------------
// Realtime-database REST sink
// ---------------------------------------------------------------------------

pub struct FirebaseSink {
    client: reqwest::Client,
    base_url: String,
    root: String,
    auth_token: Option<String>,
}

impl FirebaseSink {
    pub fn new(cfg: &SinkConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.url.trim_end_matches('/').to_string(),
            root: cfg.root.trim_matches('/').to_string(),
            auth_token: cfg.auth_token.clone(),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}/{key}.json", self.base_url, self.root)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.query(&[("auth", token)]),
            None => builder,
        }
    }
}

/// The database returns `null` for a missing path and may hand back an
/// array as an object keyed by index.
fn records_from_body(key: &str, body: Value) -> Result<Vec<Value>, SinkError> {
    match body {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items.into_iter().filter(|v| !v.is_null()).collect()),
        Value::Object(map) => {
            let mut entries: Vec<(u64, Value)> = Vec::with_capacity(map.len());
            for (k, v) in map {
                let idx = k
                    .parse::<u64>()
                    .map_err(|_| SinkError::NotAList { key: key.to_string() })?;
                entries.push((idx, v));
            }
            entries.sort_by_key(|(idx, _)| *idx);
            Ok(entries.into_iter().map(|(_, v)| v).collect())
        }
        _ => Err(SinkError::NotAList {
            key: key.to_string(),
        }),
    }
}

#[async_trait]
impl TelemetrySink for FirebaseSink {
    async fn read_log(&self, key: &str) -> Result<Vec<Value>, SinkError> {
        let http = |source| SinkError::Http {
            key: key.to_string(),
            source,
        };
        let resp = self
            .request(self.client.get(self.url(key)))
            .send()
            .await
            .map_err(http)?;
        if !resp.status().is_success() {
            return Err(SinkError::Status {
                key: key.to_string(),
                status: resp.status().as_u16(),
            });
        }
        let body: Value = resp.json().await.map_err(http)?;
        records_from_body(key, body)
    }

    async fn write_log(&self, key: &str, records: &[Value]) -> Result<(), SinkError> {
        let resp = self
            .request(self.client.put(self.url(key)))
            .json(records)
            .send()
            .await
            .map_err(|source| SinkError::Http {
                key: key.to_string(),
                source,
            })?;
        if !resp.status().is_success() {
            return Err(SinkError::Status {
                key: key.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory sink (offline mode and tests)
// ---------------------------------------------------------------------------

/// Bounded per-key ring of records; the oldest entries fall off.
#[derive(Clone, Default)]
pub struct MemorySink {
    logs: Arc<Mutex<HashMap<String, VecDeque<Value>>>>,
}

impl MemorySink {
    pub fn log(&self, key: &str) -> Vec<Value> {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn read_log(&self, key: &str) -> Result<Vec<Value>, SinkError> {
        Ok(self.log(key))
    }

    async fn write_log(&self, key: &str, records: &[Value]) -> Result<(), SinkError> {
        let skip = records.len().saturating_sub(MEMORY_LOG_CAP);
        let ring: VecDeque<Value> = records[skip..].iter().cloned().collect();
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), ring);
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
