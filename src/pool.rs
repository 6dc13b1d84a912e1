//! Keyed idle-connection pool.
//!
//! Idle connections are cached per [`ConnKey`] and handed out with
//! at-most-once semantics: checkout removes the entry under the lock, so
//! two requests can never share a connection. Per-key lists are LIFO
//! (most recently returned first), which keeps warm connections warm and
//! lets cap enforcement and reaping work from the stale tail.
//!
//! Nothing blocks under the pool lock: dialing happens in the manager,
//! and evicted or reaped connections are closed only after the lock is
//! released.

use std::collections::HashMap;
use std::mem;
use std::net::IpAddr;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, trace};

use crate::connection::Connection;
use crate::error::ErrorKind;

/// Identifies the class of server a connection can be reused for.
///
/// A tunnelled connection gets its own variant so the cache can never
/// confuse it with a direct TLS connection to the same host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnKey {
    /// Plain HTTP, directly to the origin.
    Raw {
        /// Pre-resolved address, when the request carried one.
        host_addr: Option<IpAddr>,
        /// Origin host.
        host: String,
        /// Origin port.
        port: u16,
    },
    /// HTTPS, directly to the origin.
    Secure {
        /// Pre-resolved address, when the request carried one.
        host_addr: Option<IpAddr>,
        /// Origin host.
        host: String,
        /// Origin port.
        port: u16,
    },
    /// HTTPS tunnelled through an HTTP proxy via CONNECT.
    Proxy {
        /// Proxy host.
        proxy_host: String,
        /// Proxy port.
        proxy_port: u16,
        /// Credential material sent as `Proxy-Authorization`, if any.
        proxy_auth: Option<Bytes>,
        /// Ultimate destination host.
        host: String,
        /// Ultimate destination port.
        port: u16,
    },
}

struct IdleConn {
    conn: Connection,
    inserted_at: Instant,
}

/// Pool state: open with an index of idle connections, or terminally
/// closed.
enum ConnsMap {
    Closed,
    Open {
        // total across all keys; kept alongside the map so cap checks
        // don't walk every list
        idle_count: usize,
        map: HashMap<ConnKey, Vec<IdleConn>>,
    },
}

struct PoolShared {
    state: Mutex<ConnsMap>,
    wake: Condvar,
    per_key: usize,
    global: usize,
    ttl: Duration,
}

/// Shared handle to the idle-connection pool.
#[derive(Clone)]
pub(crate) struct Pool {
    inner: Arc<PoolShared>,
}

impl Pool {
    /// Create a pool and start its background reaper.
    pub(crate) fn new(per_key: usize, global: usize, ttl: Duration) -> Self {
        let inner = Arc::new(PoolShared {
            state: Mutex::new(ConnsMap::Open {
                idle_count: 0,
                map: HashMap::new(),
            }),
            wake: Condvar::new(),
            per_key,
            global,
            ttl,
        });
        let weak = Arc::downgrade(&inner);
        let _ = thread::Builder::new()
            .name("wireline-http-reaper".into())
            .spawn(move || reap_loop(weak));
        Self { inner }
    }

    /// Take the most recently returned idle connection for `key`, along
    /// with how long it sat idle. `None` means the caller must dial.
    pub(crate) fn checkout(
        &self,
        key: &ConnKey,
    ) -> Result<Option<(Connection, Duration)>, ErrorKind> {
        let mut guard = self.inner.state.lock().unwrap();
        match &mut *guard {
            ConnsMap::Closed => Err(ErrorKind::ManagerClosed),
            ConnsMap::Open { idle_count, map } => {
                let Some(list) = map.get_mut(key) else {
                    return Ok(None);
                };
                let idle = list.remove(0);
                if list.is_empty() {
                    map.remove(key);
                }
                *idle_count -= 1;
                let idle_for = idle.inserted_at.elapsed();
                trace!("pool: reusing connection {} (idle {:?})", idle.conn.id(), idle_for);
                Ok(Some((idle.conn, idle_for)))
            }
        }
    }

    /// Return a healthy connection to the idle set. Enforces the per-key
    /// and global caps; returns false when the pool is closed and the
    /// connection was destroyed instead.
    pub(crate) fn put(&self, key: ConnKey, conn: Connection) -> bool {
        let mut evicted: Vec<Connection> = Vec::new();
        let pooled = {
            let mut guard = self.inner.state.lock().unwrap();
            match &mut *guard {
                ConnsMap::Closed => {
                    evicted.push(conn);
                    false
                }
                ConnsMap::Open { idle_count, map } => {
                    trace!("pool: returning connection {}", conn.id());
                    let list = map.entry(key).or_default();
                    list.insert(
                        0,
                        IdleConn {
                            conn,
                            inserted_at: Instant::now(),
                        },
                    );
                    *idle_count += 1;
                    while list.len() > self.inner.per_key {
                        let dropped = list.pop().expect("capped list is non-empty");
                        *idle_count -= 1;
                        evicted.push(dropped.conn);
                    }
                    while *idle_count > self.inner.global {
                        let oldest = map
                            .iter()
                            .min_by_key(|(_, list)| {
                                list.last().map(|idle| idle.inserted_at)
                            })
                            .map(|(key, _)| key.clone())
                            .expect("global cap exceeded implies a non-empty map");
                        let list = map.get_mut(&oldest).expect("key just observed");
                        let dropped = list.pop().expect("pool lists are non-empty");
                        if list.is_empty() {
                            map.remove(&oldest);
                        }
                        *idle_count -= 1;
                        evicted.push(dropped.conn);
                    }
                    true
                }
            }
        };
        for mut conn in evicted {
            debug!("pool: evicting connection {}", conn.id());
            let _ = conn.close();
        }
        pooled
    }

    /// Shut the pool down: close every idle connection and fail all
    /// later checkouts. Terminal.
    pub(crate) fn close(&self) {
        let drained: Vec<IdleConn> = {
            let mut guard = self.inner.state.lock().unwrap();
            match mem::replace(&mut *guard, ConnsMap::Closed) {
                ConnsMap::Closed => Vec::new(),
                ConnsMap::Open { map, .. } => map.into_values().flatten().collect(),
            }
        };
        self.inner.wake.notify_all();
        debug!("pool: closed, dropping {} idle connections", drained.len());
        for mut idle in drained {
            let _ = idle.conn.close();
        }
    }

    /// Total idle connections, for diagnostics and tests.
    pub(crate) fn idle_count(&self) -> usize {
        match &*self.inner.state.lock().unwrap() {
            ConnsMap::Closed => 0,
            ConnsMap::Open { idle_count, .. } => *idle_count,
        }
    }

    /// Idle connections held for one key.
    #[cfg(test)]
    pub(crate) fn idle_count_for(&self, key: &ConnKey) -> usize {
        match &*self.inner.state.lock().unwrap() {
            ConnsMap::Closed => 0,
            ConnsMap::Open { map, .. } => map.get(key).map_or(0, Vec::len),
        }
    }

    /// Close idle connections older than the pool TTL.
    fn reap(&self) -> bool {
        let mut stale: Vec<IdleConn> = Vec::new();
        {
            let mut guard = self.inner.state.lock().unwrap();
            match &mut *guard {
                ConnsMap::Closed => return false,
                ConnsMap::Open { idle_count, map } => {
                    let now = Instant::now();
                    map.retain(|_, list| {
                        while let Some(last) = list.last() {
                            if now.duration_since(last.inserted_at) > self.inner.ttl {
                                stale.push(list.pop().expect("just observed"));
                            } else {
                                break;
                            }
                        }
                        !list.is_empty()
                    });
                    *idle_count -= stale.len();
                }
            }
        }
        if !stale.is_empty() {
            debug!("pool: reaping {} stale connections", stale.len());
        }
        for mut idle in stale {
            let _ = idle.conn.close();
        }
        true
    }

    /// Backdate every idle entry, so tests can drive the reaper without
    /// sleeping.
    #[cfg(test)]
    fn age_all(&self, by: Duration) {
        if let ConnsMap::Open { map, .. } = &mut *self.inner.state.lock().unwrap() {
            for idle in map.values_mut().flatten() {
                idle.inserted_at -= by;
            }
        }
    }
}

fn reap_loop(shared: Weak<PoolShared>) {
    loop {
        let Some(inner) = shared.upgrade() else {
            return;
        };
        let interval = (inner.ttl / 4).max(Duration::from_secs(1));
        {
            let guard = inner.state.lock().unwrap();
            if matches!(&*guard, ConnsMap::Closed) {
                return;
            }
            let _unused = inner.wake.wait_timeout(guard, interval).unwrap();
        }
        let pool = Pool {
            inner: Arc::clone(&inner),
        };
        drop(inner);
        if !pool.reap() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::connection::testing::scripted;

    fn raw_key(host: &str) -> ConnKey {
        ConnKey::Raw {
            host_addr: None,
            host: host.to_string(),
            port: 80,
        }
    }

    fn pool(per_key: usize, global: usize) -> Pool {
        Pool::new(per_key, global, Duration::from_secs(90))
    }

    #[test]
    fn keys_are_discriminated() {
        let raw = raw_key("example.com");
        let secure = ConnKey::Secure {
            host_addr: None,
            host: "example.com".to_string(),
            port: 80,
        };
        let tunnel = ConnKey::Proxy {
            proxy_host: "proxy".to_string(),
            proxy_port: 3128,
            proxy_auth: None,
            host: "example.com".to_string(),
            port: 80,
        };
        assert_ne!(raw, secure);
        assert_ne!(secure, tunnel);
        assert_ne!(raw, tunnel);
    }

    #[test]
    fn checkout_on_empty_pool_dials() {
        let p = pool(10, 512);
        assert!(p.checkout(&raw_key("a")).unwrap().is_none());
    }

    #[test]
    fn checkout_is_lifo() {
        let p = pool(10, 512);
        let (first, _) = scripted(vec![]);
        let (second, _) = scripted(vec![]);
        let second_id = second.id();
        p.put(raw_key("a"), first);
        p.put(raw_key("a"), second);

        let (conn, _) = p.checkout(&raw_key("a")).unwrap().unwrap();
        assert_eq!(conn.id(), second_id);
        assert_eq!(p.idle_count(), 1);
    }

    #[test]
    fn checkout_is_at_most_once() {
        let p = pool(16, 512);
        let key = raw_key("a");
        for _ in 0..8 {
            let (conn, _) = scripted(vec![]);
            p.put(key.clone(), conn);
        }

        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let p = p.clone();
            let key = key.clone();
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                let got = p.checkout(&key).unwrap().map(|(c, _)| c.id());
                tx.send(got).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        drop(tx);

        let mut ids: Vec<u64> = rx.iter().map(|got| got.unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8, "two checkouts returned the same connection");
        assert_eq!(p.idle_count(), 0);
    }

    #[test]
    fn per_key_cap_drops_oldest() {
        let p = pool(2, 512);
        let key = raw_key("a");
        let mut states = Vec::new();
        for _ in 0..3 {
            let (conn, state) = scripted(vec![]);
            states.push(state);
            p.put(key.clone(), conn);
        }
        assert_eq!(p.idle_count_for(&key), 2);
        // the first-returned connection fell off the tail
        assert_eq!(states[0].lock().unwrap().shutdowns, 1);
        assert_eq!(states[2].lock().unwrap().shutdowns, 0);
    }

    #[test]
    fn global_cap_evicts_globally_oldest() {
        let p = pool(10, 2);
        let (a, a_state) = scripted(vec![]);
        let (b, _) = scripted(vec![]);
        let (c, _) = scripted(vec![]);
        p.put(raw_key("a"), a);
        p.put(raw_key("b"), b);
        p.put(raw_key("c"), c);
        assert_eq!(p.idle_count(), 2);
        assert_eq!(p.idle_count_for(&raw_key("a")), 0);
        assert_eq!(a_state.lock().unwrap().shutdowns, 1);
    }

    #[test]
    fn caps_hold_under_churn() {
        let p = pool(3, 5);
        for host in ["a", "b", "c", "d"] {
            for _ in 0..4 {
                let (conn, _) = scripted(vec![]);
                p.put(raw_key(host), conn);
            }
        }
        assert!(p.idle_count() <= 5);
        for host in ["a", "b", "c", "d"] {
            assert!(p.idle_count_for(&raw_key(host)) <= 3);
        }
    }

    #[test]
    fn close_is_terminal() {
        let p = pool(10, 512);
        let (conn, state) = scripted(vec![]);
        p.put(raw_key("a"), conn);
        p.close();
        assert_eq!(state.lock().unwrap().shutdowns, 1);
        assert!(matches!(
            p.checkout(&raw_key("a")),
            Err(ErrorKind::ManagerClosed)
        ));

        // returns after close destroy the connection
        let (late, late_state) = scripted(vec![]);
        assert!(!p.put(raw_key("a"), late));
        assert_eq!(late_state.lock().unwrap().shutdowns, 1);
    }

    #[test]
    fn reap_closes_only_stale_entries() {
        let p = Pool::new(10, 512, Duration::from_secs(90));
        let (old, old_state) = scripted(vec![]);
        p.put(raw_key("a"), old);
        p.age_all(Duration::from_secs(120));
        let (fresh, fresh_state) = scripted(vec![]);
        p.put(raw_key("a"), fresh);

        assert!(p.reap());
        assert_eq!(p.idle_count(), 1);
        assert_eq!(old_state.lock().unwrap().shutdowns, 1);
        assert_eq!(fresh_state.lock().unwrap().shutdowns, 0);
    }
}
