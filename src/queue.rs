//! Downstream result queue.
//!
//! Alive hosts are published to a persistent Redis list as they are observed;
//! a sentinel finish value tells the downstream scanner the engine is done.
//! Status strings (dead-host counts, advisory errors) go to a separate list.
//!
//! The [`ResultSink`] trait is the seam between the engine and Redis: the
//! engine only ever talks to a `Box<dyn ResultSink>`, so tests (and the CLI
//! dry-run mode) can swap in [`MemorySink`] and assert on exactly what was
//! published.

use std::sync::{Arc, Mutex};

use thiserror::Error;

/// List key the downstream scanner pops alive hosts from.
pub const HOST_QUEUE_KEY: &str = "alive_detection";

/// Sentinel value marking the end of the host stream.
pub const FINISH_SENTINEL: &str = "finish";

/// List key for formatted status strings (progress and advisory errors).
pub const STATUS_KEY: &str = "internal/results";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connect failed for '{address}': {source}")]
    Connect {
        address: String,
        source: redis::RedisError,
    },

    #[error("queue push failed: {0}")]
    Push(#[from] redis::RedisError),
}

/// Destination for everything the engine publishes.
///
/// `push_finish` must be idempotent: the finish sentinel is a hard
/// postcondition attempted from several paths (scan-cap hit, normal
/// completion, the teardown guard) and must reach the queue exactly once.
pub trait ResultSink: Send {
    /// Publish one alive host (canonical dotted/colon form).
    fn push_host(&mut self, addr: &str) -> Result<(), QueueError>;

    /// Publish the terminal finish sentinel. Later calls are no-ops.
    fn push_finish(&mut self) -> Result<(), QueueError>;

    /// Publish a formatted status string on the auxiliary channel.
    fn push_status(&mut self, msg: &str) -> Result<(), QueueError>;
}

/// Format the end-of-scan dead-host count for the status channel.
pub fn dead_hosts_status(count: u64) -> String {
    format!("DEADHOST||| ||| ||| |||{count}")
}

/// Format an advisory error message for the status channel.
pub fn errmsg_status(text: &str) -> String {
    format!("ERRMSG||| ||| ||| |||{text}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Redis implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Redis-backed result sink: `LPUSH` onto the host and status lists of the
/// database selected by `db_id`.
pub struct RedisQueue {
    conn: redis::Connection,
    finish_sent: bool,
}

impl RedisQueue {
    /// Connect to the queue and select the scan's database.
    ///
    /// `address` is either a redis URL or a bare unix socket path (leading
    /// slash), the two forms the `db_address` preference carries.
    pub fn connect(address: &str, db_id: u32) -> Result<Self, QueueError> {
        let url = if address.starts_with('/') {
            format!("redis+unix://{address}")
        } else if address.contains("://") {
            address.to_string()
        } else {
            format!("redis://{address}")
        };

        let wrap = |source| QueueError::Connect {
            address: address.to_string(),
            source,
        };

        let client = redis::Client::open(url.as_str()).map_err(wrap)?;
        let mut conn = client.get_connection().map_err(wrap)?;
        redis::cmd("SELECT")
            .arg(db_id)
            .query::<()>(&mut conn)
            .map_err(wrap)?;

        Ok(RedisQueue {
            conn,
            finish_sent: false,
        })
    }

    fn lpush(&mut self, key: &str, value: &str) -> Result<(), QueueError> {
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query::<()>(&mut self.conn)?;
        Ok(())
    }
}

impl ResultSink for RedisQueue {
    fn push_host(&mut self, addr: &str) -> Result<(), QueueError> {
        self.lpush(HOST_QUEUE_KEY, addr)
    }

    fn push_finish(&mut self) -> Result<(), QueueError> {
        if self.finish_sent {
            return Ok(());
        }
        self.lpush(HOST_QUEUE_KEY, FINISH_SENTINEL)?;
        self.finish_sent = true;
        Ok(())
    }

    fn push_status(&mut self, msg: &str) -> Result<(), QueueError> {
        self.lpush(STATUS_KEY, msg)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory implementation (tests, dry-run)
// ─────────────────────────────────────────────────────────────────────────────

/// One message recorded by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueMessage {
    Host(String),
    Finish,
    Status(String),
}

/// In-memory sink recording every publication in order.
///
/// Cloning shares the underlying log, so a test can keep a handle while the
/// engine owns the boxed sink.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    log: Arc<Mutex<Vec<QueueMessage>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far.
    pub fn messages(&self) -> Vec<QueueMessage> {
        self.log.lock().expect("sink log poisoned").clone()
    }

    /// Hosts published so far, in order, not counting the sentinel.
    pub fn hosts(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                QueueMessage::Host(h) => Some(h),
                _ => None,
            })
            .collect()
    }

    /// Number of finish sentinels published (must end up exactly 1).
    pub fn finish_count(&self) -> usize {
        self.messages()
            .iter()
            .filter(|m| matches!(m, QueueMessage::Finish))
            .count()
    }

    /// Status strings published so far, in order.
    pub fn statuses(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                QueueMessage::Status(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

impl ResultSink for MemorySink {
    fn push_host(&mut self, addr: &str) -> Result<(), QueueError> {
        self.log
            .lock()
            .expect("sink log poisoned")
            .push(QueueMessage::Host(addr.to_string()));
        Ok(())
    }

    fn push_finish(&mut self) -> Result<(), QueueError> {
        let mut log = self.log.lock().expect("sink log poisoned");
        if !log.contains(&QueueMessage::Finish) {
            log.push(QueueMessage::Finish);
        }
        Ok(())
    }

    fn push_status(&mut self, msg: &str) -> Result<(), QueueError> {
        self.log
            .lock()
            .expect("sink log poisoned")
            .push(QueueMessage::Status(msg.to_string()));
        Ok(())
    }
}
