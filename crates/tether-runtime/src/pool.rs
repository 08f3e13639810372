//! The connection pool.
//!
//! At most one session per server id. Acquisitions stamp last-used time and
//! a use counter; crossing the use budget schedules a background renewal.
//! Concurrent opens for the same id are merged. A background sweeper
//! disconnects idle sessions, and the fleet cap is enforced by LRU eviction
//! of not-in-use entries — with overage accepted rather than blocking when
//! nothing is evictable.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use tether_session::McpSession;
use tether_types::{McpError, McpEvent, PoolConfig, ServerConfig};

struct PoolEntry {
    session: Arc<McpSession>,
    last_used: Instant,
    in_use: bool,
    use_count: u64,
}

/// Shared outcome of one in-flight open, fanned out to every joiner.
type ConnectResult = Result<Arc<McpSession>, Arc<McpError>>;

#[derive(Default)]
struct PoolInner {
    entries: HashMap<String, PoolEntry>,
    connecting: HashMap<String, broadcast::Sender<ConnectResult>>,
    renewing: HashSet<String>,
}

enum Acquired {
    Cached(Arc<McpSession>),
    Wait(broadcast::Receiver<ConnectResult>),
}

/// Bounded fleet of MCP sessions, keyed by server id.
pub struct SessionPool {
    config: PoolConfig,
    inner: Arc<Mutex<PoolInner>>,
    events: broadcast::Sender<McpEvent>,
    disposed: Arc<AtomicBool>,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

impl SessionPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let pool = Arc::new(Self {
            config,
            inner: Arc::new(Mutex::new(PoolInner::default())),
            events,
            disposed: Arc::new(AtomicBool::new(false)),
            background: StdMutex::new(Vec::new()),
        });

        let sweeper = tokio::spawn(run_idle_sweeper(
            Arc::clone(&pool.inner),
            pool.config.clone(),
            Arc::clone(&pool.disposed),
            pool.events.clone(),
        ));
        let reaper = tokio::spawn(run_dead_session_reaper(
            Arc::clone(&pool.inner),
            pool.events.subscribe(),
        ));
        pool.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([sweeper, reaper]);

        pool
    }

    /// Subscribe to the pool's lifecycle event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<McpEvent> {
        self.events.subscribe()
    }

    pub async fn entry_count(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn contains(&self, server_id: &str) -> bool {
        self.inner.lock().await.entries.contains_key(server_id)
    }

    /// Get a live session for the server, opening one on cache miss.
    ///
    /// Concurrent callers for the same id share a single open. A cached but
    /// dead session is dropped and replaced, never handed out.
    pub async fn acquire(
        self: &Arc<Self>,
        config: &ServerConfig,
    ) -> Result<Arc<McpSession>, McpError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(McpError::Disposed);
        }

        let acquired = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;

            if let Some(entry) = inner.entries.get_mut(&config.id) {
                if entry.session.is_connected() {
                    entry.last_used = Instant::now();
                    entry.in_use = true;
                    entry.use_count += 1;
                    let session = Arc::clone(&entry.session);
                    let over_budget = entry.use_count > self.config.max_use_count;
                    if over_budget && !inner.renewing.contains(&config.id) {
                        inner.renewing.insert(config.id.clone());
                        self.spawn_renewal(config.clone());
                    }
                    Acquired::Cached(session)
                } else {
                    // Stale entry; drop it and fall through to a fresh open.
                    let entry = inner
                        .entries
                        .remove(&config.id)
                        .expect("entry present under lock");
                    tokio::spawn(async move { entry.session.disconnect().await });
                    self.begin_open(inner, config)?
                }
            } else if let Some(tx) = inner.connecting.get(&config.id) {
                Acquired::Wait(tx.subscribe())
            } else {
                self.begin_open(inner, config)?
            }
        };

        match acquired {
            Acquired::Cached(session) => Ok(session),
            Acquired::Wait(mut rx) => match rx.recv().await {
                Ok(Ok(session)) => {
                    self.stamp(config).await;
                    Ok(session)
                }
                Ok(Err(e)) => Err(e.duplicate()),
                Err(_) => Err(McpError::NotConnected {
                    server: config.id.clone(),
                }),
            },
        }
    }

    /// Mark the session idle-but-warm again.
    pub async fn release(&self, server_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(server_id) {
            entry.in_use = false;
            entry.last_used = Instant::now();
        }
    }

    /// Concurrently ping every pooled session; dead ones are disconnected
    /// and removed. Returns health per server id.
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let snapshot: Vec<(String, Arc<McpSession>)> = {
            let inner = self.inner.lock().await;
            inner
                .entries
                .iter()
                .map(|(id, entry)| (id.clone(), Arc::clone(&entry.session)))
                .collect()
        };

        let checks = snapshot.iter().map(|(id, session)| {
            let id = id.clone();
            let session = Arc::clone(session);
            async move { (id, session.ping().await) }
        });
        let results: HashMap<String, bool> = join_all(checks).await.into_iter().collect();

        for (id, healthy) in &results {
            if *healthy {
                continue;
            }
            let removed = {
                let mut inner = self.inner.lock().await;
                inner.entries.remove(id)
            };
            if let Some(entry) = removed {
                tracing::warn!(server_id = %id, "health check failed, dropping session");
                let _ = self.events.send(McpEvent::ConnectionClosed {
                    server_id: id.clone(),
                });
                tokio::spawn(async move { entry.session.disconnect().await });
            }
        }

        results
    }

    /// Dispose the pool: reject new acquisitions, disconnect everything.
    pub async fn shutdown(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        for task in self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }

        let entries: Vec<(String, PoolEntry)> = {
            let mut inner = self.inner.lock().await;
            inner.connecting.clear();
            inner.entries.drain().collect()
        };
        let disconnects = entries.into_iter().map(|(id, entry)| {
            let events = self.events.clone();
            async move {
                let done =
                    tokio::time::timeout(Duration::from_secs(10), entry.session.disconnect())
                        .await;
                if done.is_err() {
                    tracing::warn!(server_id = %id, "session disconnect overran shutdown deadline");
                    let _ = events.send(McpEvent::CleanupError {
                        server_id: id.clone(),
                        detail: "disconnect timed out during shutdown".into(),
                    });
                }
                let _ = events.send(McpEvent::ConnectionClosed { server_id: id });
            }
        });
        join_all(disconnects).await;
    }

    /// Register an in-flight open and spawn the task that drives it.
    ///
    /// The open always runs to completion and populates the pool even if
    /// every waiting caller goes away.
    fn begin_open(
        self: &Arc<Self>,
        inner: &mut PoolInner,
        config: &ServerConfig,
    ) -> Result<Acquired, McpError> {
        // Already over cap with nothing evictable: refuse further opens.
        if inner.entries.len() > self.config.max_connections
            && !inner.entries.values().any(|e| !e.in_use)
        {
            return Err(McpError::PoolCapExceeded);
        }

        let (tx, rx) = broadcast::channel(4);
        inner.connecting.insert(config.id.clone(), tx.clone());
        let pool = Arc::clone(self);
        let config = config.clone();
        tokio::spawn(async move {
            let outcome = pool.open_session(&config).await;
            let _ = tx.send(outcome);
        });
        Ok(Acquired::Wait(rx))
    }

    async fn open_session(self: &Arc<Self>, config: &ServerConfig) -> ConnectResult {
        let session = Arc::new(McpSession::new(
            config,
            config.request_timeout(&self.config),
            self.events.clone(),
        ));

        let connect_timeout = config.connect_timeout(&self.config);
        let connected = tokio::time::timeout(connect_timeout, session.connect()).await;
        let outcome: ConnectResult = match connected {
            Ok(Ok(())) => Ok(session),
            Ok(Err(e)) => Err(Arc::new(e)),
            Err(_) => {
                let stale = Arc::clone(&session);
                tokio::spawn(async move { stale.disconnect().await });
                Err(Arc::new(McpError::Timeout {
                    method: "connect".into(),
                    timeout_ms: connect_timeout.as_millis() as u64,
                }))
            }
        };

        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            inner.connecting.remove(&config.id);
            if let Ok(session) = &outcome {
                // The pool may have been disposed while we were connecting.
                if self.disposed.load(Ordering::SeqCst) {
                    let stale = Arc::clone(session);
                    tokio::spawn(async move { stale.disconnect().await });
                    return Err(Arc::new(McpError::Disposed));
                }
                inner.entries.insert(
                    config.id.clone(),
                    PoolEntry {
                        session: Arc::clone(session),
                        last_used: Instant::now(),
                        in_use: false,
                        use_count: 0,
                    },
                );
                evicted = evict_over_cap(&mut inner, &self.config, &config.id);
            }
        }

        match &outcome {
            Ok(_) => {
                let _ = self.events.send(McpEvent::ConnectionCreated {
                    server_id: config.id.clone(),
                });
            }
            Err(e) => {
                tracing::warn!(server_id = %config.id, error = %e, "failed to open session");
            }
        }
        for (id, session) in evicted {
            tracing::info!(server_id = %id, "evicting least-recently-used session");
            let _ = self.events.send(McpEvent::ConnectionClosed {
                server_id: id.clone(),
            });
            tokio::spawn(async move { session.disconnect().await });
        }

        outcome
    }

    /// Count an acquisition against an entry that a joined open produced.
    async fn stamp(self: &Arc<Self>, config: &ServerConfig) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let Some(entry) = inner.entries.get_mut(&config.id) else {
            return;
        };
        entry.last_used = Instant::now();
        entry.in_use = true;
        entry.use_count += 1;
        if entry.use_count > self.config.max_use_count && !inner.renewing.contains(&config.id) {
            inner.renewing.insert(config.id.clone());
            self.spawn_renewal(config.clone());
        }
    }

    /// Replace a session that exhausted its use budget.
    ///
    /// With `keep_alive` the replacement connects before the old session is
    /// disposed; otherwise the old session is torn down first for servers
    /// that cannot tolerate a double connection.
    fn spawn_renewal(self: &Arc<Self>, config: ServerConfig) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(server_id = %config.id, "renewing session past its use budget");

            if !config.keep_alive {
                let old = pool.inner.lock().await.entries.remove(&config.id);
                if let Some(entry) = old {
                    entry.session.disconnect().await;
                }
            }

            let session = Arc::new(McpSession::new(
                &config,
                config.request_timeout(&pool.config),
                pool.events.clone(),
            ));
            let connect_timeout = config.connect_timeout(&pool.config);
            let connected = tokio::time::timeout(connect_timeout, session.connect()).await;

            match connected {
                Ok(Ok(())) => {
                    let old = {
                        let mut inner = pool.inner.lock().await;
                        inner.renewing.remove(&config.id);
                        inner.entries.insert(
                            config.id.clone(),
                            PoolEntry {
                                session,
                                last_used: Instant::now(),
                                in_use: false,
                                use_count: 0,
                            },
                        )
                    };
                    if let Some(entry) = old {
                        // In-flight requests on the old session get their
                        // full timeout window before it is disposed.
                        let grace = config.request_timeout(&pool.config);
                        tokio::spawn(async move {
                            tokio::time::sleep(grace).await;
                            entry.session.disconnect().await;
                        });
                    }
                    let _ = pool.events.send(McpEvent::ConnectionRenewed {
                        server_id: config.id.clone(),
                    });
                }
                other => {
                    let detail = match other {
                        Ok(Err(e)) => e.to_string(),
                        _ => "connect timed out".to_string(),
                    };
                    pool.inner.lock().await.renewing.remove(&config.id);
                    tracing::warn!(server_id = %config.id, error = %detail, "renewal failed, keeping old session");
                    let _ = pool.events.send(McpEvent::RenewalFailed {
                        server_id: config.id.clone(),
                        detail,
                    });
                }
            }
        });
    }
}

/// Evict not-in-use LRU entries until the fleet fits the cap. The entry
/// named by `keep` (the one just admitted) is never the victim. Returns the
/// evicted sessions for the caller to disconnect outside the lock.
fn evict_over_cap(
    inner: &mut PoolInner,
    config: &PoolConfig,
    keep: &str,
) -> Vec<(String, Arc<McpSession>)> {
    let mut evicted = Vec::new();
    while inner.entries.len() > config.max_connections {
        let victim = inner
            .entries
            .iter()
            .filter(|(id, entry)| !entry.in_use && *id != keep)
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(id, _)| id.clone());
        match victim {
            Some(id) => {
                if let Some(entry) = inner.entries.remove(&id) {
                    evicted.push((id, entry.session));
                }
            }
            // Nothing evictable: accept the overage rather than block.
            None => break,
        }
    }
    evicted
}

/// Periodically disconnect sessions idle past the timeout.
async fn run_idle_sweeper(
    inner: Arc<Mutex<PoolInner>>,
    config: PoolConfig,
    disposed: Arc<AtomicBool>,
    events: broadcast::Sender<McpEvent>,
) {
    let mut ticker = tokio::time::interval(config.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if disposed.load(Ordering::SeqCst) {
            return;
        }

        let idle: Vec<(String, PoolEntry)> = {
            let mut inner = inner.lock().await;
            let expired: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, entry)| {
                    !entry.in_use && entry.last_used.elapsed() > config.idle_timeout()
                })
                .map(|(id, _)| id.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|id| inner.entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (id, entry) in idle {
            tracing::info!(server_id = %id, "disconnecting idle session");
            entry.session.disconnect().await;
            let _ = events.send(McpEvent::ConnectionClosed { server_id: id });
        }
    }
}

/// Drop entries whose sessions died out from under the pool.
async fn run_dead_session_reaper(
    inner: Arc<Mutex<PoolInner>>,
    mut events: broadcast::Receiver<McpEvent>,
) {
    loop {
        let server_id = match events.recv().await {
            Ok(McpEvent::ConnectionLost { server_id, .. })
            | Ok(McpEvent::ConnectionError { server_id, .. }) => server_id,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let mut inner = inner.lock().await;
        let dead = inner
            .entries
            .get(&server_id)
            .is_some_and(|entry| !entry.session.is_connected());
        if dead {
            tracing::debug!(server_id = %server_id, "removing dead session from pool");
            inner.entries.remove(&server_id);
        }
    }
}
