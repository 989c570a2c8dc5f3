//! Session registry
//!
//! Process-wide index of live sessions. The registry is the single mutator
//! of PTY and workspace lifecycles: connections acquire and release handles
//! by session id, and a periodic reaper destroys quiescent sessions once
//! the idle TTL expires. Creation and destruction are serialized per key so
//! at most one PTY exists per session at any instant.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pty::{PtySession, PtySupervisor};
use crate::workspace::WorkspaceManager;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use terminus_types::ServerFrame;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A live session: the PTY, its workspace, and the per-session event bus
/// used to fan frames out to every attached connection.
pub struct LiveSession {
    pub session_id: i64,
    pub pty: Arc<PtySession>,
    pub workspace_path: PathBuf,
    events: broadcast::Sender<ServerFrame>,
    ref_count: AtomicUsize,
    last_activity: RwLock<Instant>,
}

impl LiveSession {
    /// Subscribe to session-scoped frames (file-change notifications).
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerFrame> {
        self.events.subscribe()
    }

    /// Fan a frame out to every attached connection.
    pub fn broadcast(&self, frame: ServerFrame) {
        let _ = self.events.send(frame);
    }

    pub fn connections(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    async fn idle_for(&self) -> std::time::Duration {
        self.last_activity.read().await.elapsed()
    }
}

pub struct SessionRegistry {
    config: Arc<Config>,
    supervisor: PtySupervisor,
    workspace: Arc<WorkspaceManager>,
    sessions: RwLock<HashMap<i64, Arc<LiveSession>>>,
    /// Per-key creation/destruction locks (single-writer discipline).
    key_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new(config: Arc<Config>, workspace: Arc<WorkspaceManager>) -> Result<Self> {
        let supervisor = PtySupervisor::new(config.clone())?;
        Ok(Self {
            config,
            supervisor,
            workspace,
            sessions: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Attach to a session, creating its workspace and PTY if absent.
    /// Increments the connection ref-count.
    pub async fn acquire(&self, session_id: i64) -> Result<Arc<LiveSession>> {
        let key_lock = self.key_lock(session_id).await;
        let _guard = key_lock.lock().await;

        let existing = {
            let sessions = self.sessions.read().await;
            sessions.get(&session_id).cloned()
        };
        if let Some(live) = existing {
            if live.pty.is_alive() {
                live.ref_count.fetch_add(1, Ordering::SeqCst);
                live.touch().await;
                return Ok(live);
            }
            // Shell died underneath us; replace it.
            debug!(session_id, "replacing dead pty session");
            let _ = live.pty.kill(None).await;
            self.sessions.write().await.remove(&session_id);
        }

        let workspace_path = self.workspace.materialize(session_id).await?;
        let pty = self
            .supervisor
            .spawn(session_id, &workspace_path, &[])
            .await?;
        let (events, _) = broadcast::channel(256);

        let live = Arc::new(LiveSession {
            session_id,
            pty,
            workspace_path,
            events,
            ref_count: AtomicUsize::new(1),
            last_activity: RwLock::new(Instant::now()),
        });
        self.sessions.write().await.insert(session_id, live.clone());
        info!(session_id, "session attached (pty spawned)");
        Ok(live)
    }

    /// Drop one connection reference. The session stays live until the
    /// reaper finds it quiescent past the idle TTL.
    pub async fn release(&self, session_id: i64) {
        let live = {
            let sessions = self.sessions.read().await;
            sessions.get(&session_id).cloned()
        };
        if let Some(live) = live {
            let remaining = live
                .ref_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
                .unwrap_or(0)
                .saturating_sub(1);
            live.touch().await;
            debug!(session_id, remaining, "connection released");
        }
    }

    /// Look up a live session without touching the ref-count.
    pub async fn lookup(&self, session_id: i64) -> Result<Arc<LiveSession>> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(Error::SessionNotFound(session_id))
    }

    /// Kill the PTY and drop the entry regardless of ref-count. Used when
    /// the session row is deleted; the workspace directory is the caller's
    /// concern.
    pub async fn destroy(&self, session_id: i64) -> Result<()> {
        let key_lock = self.key_lock(session_id).await;
        let _guard = key_lock.lock().await;

        let removed = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&session_id)
        };
        if let Some(live) = removed {
            live.pty.kill(None).await?;
            info!(session_id, "session destroyed");
        }
        Ok(())
    }

    pub async fn live_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// One reaper pass: destroy quiescent sessions past the idle TTL,
    /// keeping their workspaces on disk. Returns how many were reaped.
    pub async fn reap_once(&self) -> usize {
        let ttl = self.config.idle_session_ttl;
        let candidates: Vec<i64> = {
            let sessions = self.sessions.read().await;
            let mut ids = Vec::new();
            for (id, live) in sessions.iter() {
                if live.connections() == 0 && live.idle_for().await >= ttl {
                    ids.push(*id);
                }
            }
            ids
        };

        let mut reaped = 0;
        for session_id in candidates {
            let key_lock = self.key_lock(session_id).await;
            let _guard = key_lock.lock().await;

            let still_quiescent = {
                let sessions = self.sessions.read().await;
                match sessions.get(&session_id) {
                    Some(live) => live.connections() == 0 && live.idle_for().await >= ttl,
                    None => false,
                }
            };
            if !still_quiescent {
                continue;
            }

            let removed = {
                let mut sessions = self.sessions.write().await;
                sessions.remove(&session_id)
            };
            if let Some(live) = removed {
                if let Err(e) = live.pty.kill(None).await {
                    warn!(session_id, %e, "reaper failed to kill pty");
                }
                info!(session_id, "quiescent session reaped");
                reaped += 1;
            }
        }
        reaped
    }

    /// Periodic reaper task; runs until the token is cancelled.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.reaper_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        registry.reap_once().await;
                    }
                    _ = shutdown.cancelled() => {
                        debug!("reaper shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn key_lock(&self, session_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
