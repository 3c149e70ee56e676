//! Idle keep-alive connections kept for reuse.
//!
//! WHY: Scans hit the same address over and over; reusing a keep-alive
//! connection skips the TCP (and TLS) handshake.
//!
//! WHAT: Idle [`HttpConnection`]s stored per dial key, each bucket behind
//! its own lock. `checkout` hands back the most recently returned live
//! connection, `checkin` stores one and drops the oldest past the per-key
//! limit, `cleanup_stale` evicts connections idle longer than the limit.
//!
//! HOW: Synchronous `Mutex`es. The outer map lock is only held to find or
//! create a bucket, so different keys never contend on the bucket lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::HttpConnection;

/// Connections retained per dial key.
pub const DEFAULT_MAX_PER_KEY: usize = 10;
const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(120);

/// Entry in a bucket: (`returned_at`, connection).
type PooledEntry = (Instant, HttpConnection);
type Bucket = Arc<Mutex<VecDeque<PooledEntry>>>;

pub struct ConnectionPool {
    pub max_per_key: usize,
    pub max_idle_time: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl core::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("ConnectionPool");
        debug
            .field("max_per_key", &self.max_per_key)
            .field("max_idle_time", &self.max_idle_time);

        match self.buckets.lock() {
            Ok(buckets) => {
                let idle: Vec<(String, usize)> = buckets
                    .iter()
                    .map(|(key, bucket)| (key.clone(), bucket.lock().map_or(0, |queue| queue.len())))
                    .collect();
                debug.field("idle", &idle).finish()
            }
            Err(_) => debug.field("idle", &"<poisoned>").finish(),
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_KEY, DEFAULT_MAX_IDLE_TIME)
    }
}

impl ConnectionPool {
    #[must_use]
    pub fn new(max_per_key: usize, max_idle_time: Duration) -> Self {
        Self {
            max_per_key,
            max_idle_time,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn bucket(&self, key: &str, create: bool) -> Option<Bucket> {
        let mut buckets = self.buckets.lock().ok()?;
        if let Some(bucket) = buckets.get(key) {
            return Some(bucket.clone());
        }
        if !create {
            return None;
        }
        let bucket = Bucket::default();
        buckets.insert(key.to_string(), bucket.clone());
        Some(bucket)
    }

    /// Most recently returned connection for `key` that is neither expired
    /// nor stale. Dead ones found on the way are closed.
    #[must_use]
    pub fn checkout(&self, key: &str) -> Option<HttpConnection> {
        let bucket = self.bucket(key, false)?;
        let mut queue = bucket.lock().ok()?;

        while let Some((returned_at, connection)) = queue.pop_back() {
            if returned_at.elapsed() <= self.max_idle_time && !connection.is_stale() {
                return Some(connection);
            }
            tracing::debug!("Discarding dead pooled connection for {key}");
            connection.close();
        }
        None
    }

    /// Stores an idle connection under its own key. When the bucket is full
    /// the oldest entry is closed.
    pub fn checkin(&self, connection: HttpConnection) {
        let Some(bucket) = self.bucket(connection.key(), true) else {
            connection.close();
            return;
        };
        let Ok(mut queue) = bucket.lock() else {
            connection.close();
            return;
        };

        queue.push_back((Instant::now(), connection));
        while queue.len() > self.max_per_key {
            if let Some((_, oldest)) = queue.pop_front() {
                oldest.close();
            }
        }
    }

    /// Closes connections idle longer than `max_idle_time` and forgets
    /// empty buckets.
    pub fn cleanup_stale(&self) {
        let Ok(mut buckets) = self.buckets.lock() else {
            return;
        };

        let mut evicted = 0usize;
        buckets.retain(|_, bucket| {
            let Ok(mut queue) = bucket.lock() else {
                return false;
            };
            while queue
                .front()
                .is_some_and(|(returned_at, _)| returned_at.elapsed() > self.max_idle_time)
            {
                if let Some((_, connection)) = queue.pop_front() {
                    connection.close();
                    evicted += 1;
                }
            }
            !queue.is_empty()
        });

        if evicted > 0 {
            tracing::debug!("Evicted {evicted} idle pooled connection(s)");
        }
    }

    /// Idle connections currently held for `key`.
    #[must_use]
    pub fn idle_count(&self, key: &str) -> usize {
        self.bucket(key, false)
            .and_then(|bucket| bucket.lock().ok().map(|queue| queue.len()))
            .unwrap_or(0)
    }

    /// Closes and drops every pooled connection.
    pub fn clear(&self) {
        let drained: Vec<Bucket> = match self.buckets.lock() {
            Ok(mut buckets) => buckets.drain().map(|(_, bucket)| bucket).collect(),
            Err(_) => return,
        };
        for bucket in drained {
            if let Ok(mut queue) = bucket.lock() {
                for (_, connection) in queue.drain(..) {
                    connection.close();
                }
            }
        }
    }
}
