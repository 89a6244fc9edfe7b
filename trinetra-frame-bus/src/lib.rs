//! Frame bus client.
//!
//! The frame bus is a set of per-camera, append-only, bounded streams with
//! consumer-group delivery (Redis Streams). The ingestor appends; inference
//! workers read through the shared consumer group and ack after publishing
//! downstream. Entries beyond the per-stream cap are tail-dropped by the
//! server (approximate trim), which is how backpressure becomes visible.

use redis::{
    aio::ConnectionManager,
    streams::{StreamMaxlen, StreamReadOptions, StreamReadReply},
    AsyncCommands, Value,
};

use trinetra_types::{EnvelopeError, FrameEnvelope, FRAME_STREAM_PREFIX};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("redis error: {source}")]
    Redis {
        #[from]
        source: redis::RedisError,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// One delivered stream entry.
///
/// The envelope carries its own schema-check result so that a consumer can
/// still ack entries whose fields fail validation.
#[derive(Debug)]
pub struct FrameBusEntry {
    pub stream: String,
    pub id: String,
    pub envelope: std::result::Result<FrameEnvelope, EnvelopeError>,
}

#[derive(Clone)]
pub struct FrameBus {
    conn: ConnectionManager,
}

impl FrameBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(FrameBus { conn })
    }

    /// Append one frame, trimming the stream to approximately `maxlen`.
    ///
    /// The approximate trim is O(1); an exact MAXLEN would be O(N).
    pub async fn append(
        &mut self,
        stream: &str,
        envelope: &FrameEnvelope,
        maxlen: usize,
    ) -> Result<String> {
        let fields = envelope.to_field_pairs();
        let id: String = self
            .conn
            .xadd_maxlen(stream, StreamMaxlen::Approx(maxlen), "*", &fields)
            .await?;
        Ok(id)
    }

    /// Current number of entries in `stream`.
    pub async fn len(&mut self, stream: &str) -> Result<usize> {
        let n: usize = self.conn.xlen(stream).await?;
        Ok(n)
    }

    /// Create `group` on `stream`, creating the stream if needed.
    ///
    /// Idempotent: an already-existing group (BUSYGROUP) is success.
    pub async fn ensure_group(&mut self, stream: &str, group: &str) -> Result<()> {
        let created: std::result::Result<(), redis::RedisError> = self
            .conn
            .xgroup_create_mkstream(stream, group, "0")
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::debug!("consumer group \"{group}\" already exists on \"{stream}\"");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All frame streams currently present on the bus.
    pub async fn discover_streams(&mut self) -> Result<Vec<String>> {
        let pattern = format!("{FRAME_STREAM_PREFIX}*");
        let mut streams = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut self.conn)
                .await?;
            streams.extend(keys);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        streams.sort();
        streams.dedup();
        Ok(streams)
    }

    /// Blocking consumer-group read across `streams`.
    ///
    /// Returns at most `count` new entries per stream, waiting up to
    /// `block_ms` when nothing is pending. Each entry is delivered to exactly
    /// one consumer in the group until acked.
    pub async fn read_group(
        &mut self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block_ms: usize,
    ) -> Result<Vec<FrameBusEntry>> {
        if streams.is_empty() {
            return Ok(Vec::new());
        }
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);
        let keys: Vec<&str> = streams.iter().map(|s| s.as_str()).collect();
        let ids: Vec<&str> = streams.iter().map(|_| ">").collect();
        let reply: StreamReadReply = self.conn.xread_options(&keys, &ids, &opts).await?;

        let mut entries = Vec::new();
        for stream_key in reply.keys {
            for stream_id in stream_key.ids {
                let pairs: Vec<(String, Vec<u8>)> = stream_id
                    .map
                    .iter()
                    .filter_map(|(k, v)| value_bytes(v).map(|b| (k.clone(), b)))
                    .collect();
                entries.push(FrameBusEntry {
                    stream: stream_key.key.clone(),
                    id: stream_id.id.clone(),
                    envelope: FrameEnvelope::from_field_pairs(&pairs),
                });
            }
        }
        Ok(entries)
    }

    /// Acknowledge one delivered entry.
    pub async fn ack(&mut self, stream: &str, group: &str, id: &str) -> Result<()> {
        let _n: i64 = self.conn.xack(stream, group, &[id]).await?;
        Ok(())
    }
}

/// Raw bytes of a stream field value, if it has any.
fn value_bytes(v: &Value) -> Option<Vec<u8>> {
    match v {
        Value::BulkString(b) => Some(b.clone()),
        Value::SimpleString(s) => Some(s.as_bytes().to_vec()),
        Value::Int(i) => Some(i.to_string().into_bytes()),
        _ => None,
    }
}

#[test]
fn test_value_bytes() {
    assert_eq!(
        value_bytes(&Value::BulkString(b"abc".to_vec())),
        Some(b"abc".to_vec())
    );
    assert_eq!(
        value_bytes(&Value::SimpleString("ok".into())),
        Some(b"ok".to_vec())
    );
    assert_eq!(value_bytes(&Value::Int(7)), Some(b"7".to_vec()));
    assert_eq!(value_bytes(&Value::Nil), None);
}
