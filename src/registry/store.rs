//! Session registry implementation
//!
//! The registry is the only authority on which identities have a live
//! session. Every identity has a slot: an async creation lock contended only
//! by callers for that identity, and the published session pointer.
//! The map lock is held for lookups only, never across an await.
//!
//! Lock order: creation lock, then map, then session pointer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinSet;

use crate::error::SessionError;

use super::config::RegistryConfig;
use super::session::{remove_output_dir, Session};

#[derive(Default)]
struct Slot {
    create: tokio::sync::Mutex<()>,
    current: RwLock<Option<Arc<Session>>>,
}

impl Slot {
    fn live(&self) -> Option<Arc<Session>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|s| s.is_active())
            .cloned()
    }

    fn is_empty(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Central registry of transcoding sessions, keyed by identity
///
/// Shared as `Arc<SessionRegistry>` between every connection handler and the
/// delivery side.
pub struct SessionRegistry {
    slots: Mutex<HashMap<String, Arc<Slot>>>,

    /// Scheduled output directory removals, keyed by identity. Held across
    /// the removal itself so a new session never races a deletion.
    removals: Arc<tokio::sync::Mutex<HashMap<String, u64>>>,
    removal_seq: AtomicU64,

    sessions_created: AtomicU64,
    closed: AtomicBool,

    config: RegistryConfig,
}

impl SessionRegistry {
    /// Create a new session registry with default configuration
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new session registry with custom configuration
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            removals: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            removal_seq: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Return the live session for `identity`, creating one if needed
    ///
    /// A predecessor that is still stopping is awaited first, so two
    /// transcoders never share a directory. Creation failures leave no entry
    /// behind.
    pub async fn get_or_create(self: &Arc<Self>, identity: &str) -> Result<Arc<Session>, SessionError> {
        validate_identity(identity)?;

        loop {
            if self.is_closed() {
                return Err(SessionError::RegistryClosed);
            }

            let slot = self.slot(identity);
            if let Some(session) = slot.live() {
                tracing::debug!(identity = identity, "Reusing active session");
                return Ok(session);
            }

            let _create = slot.create.lock().await;

            if !self.is_current_slot(identity, &slot) {
                // Retired while we waited
                continue;
            }
            if let Some(session) = slot.live() {
                tracing::debug!(identity = identity, "Reusing session created concurrently");
                return Ok(session);
            }

            // A stopping predecessor still owns the directory and the
            // transcoder; wait until its supervisor has released it
            let stopping = slot
                .current
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(stopping) = stopping {
                drop(_create);
                tracing::debug!(identity = identity, "Waiting for previous session to terminate");
                stopping.wait_terminated().await;
                continue;
            }

            self.cancel_removal(identity).await;

            let session = match Session::start(identity, &self.config, Arc::downgrade(self)).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(identity = identity, error = %e, "Failed to create session");
                    self.retire_if_empty(identity, &slot);
                    return Err(e);
                }
            };

            *slot.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&session));
            self.sessions_created.fetch_add(1, Ordering::Relaxed);

            if self.is_closed() {
                drop(_create);
                session.stop().await;
                return Err(SessionError::RegistryClosed);
            }

            return Ok(session);
        }
    }

    /// Get the live session for `identity` without creating one
    pub fn get(&self, identity: &str) -> Option<Arc<Session>> {
        let slot = self.lock_slots().get(identity).cloned()?;
        slot.live()
    }

    /// Identities with an active session, sorted
    pub fn active_identities(&self) -> Vec<String> {
        let slots = self.lock_slots();
        let mut identities: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| slot.live().is_some())
            .map(|(identity, _)| identity.clone())
            .collect();
        identities.sort();
        identities
    }

    /// Number of active sessions
    pub fn session_count(&self) -> usize {
        self.lock_slots()
            .values()
            .filter(|slot| slot.live().is_some())
            .count()
    }

    /// Total number of sessions created since startup
    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::Relaxed)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse new sessions and stop every live one
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let sessions: Vec<Arc<Session>> = self
            .lock_slots()
            .values()
            .filter_map(|slot| slot.live())
            .collect();

        tracing::info!(sessions = sessions.len(), "Stopping all sessions");

        let mut stops = JoinSet::new();
        for session in sessions {
            stops.spawn(async move {
                session.stop().await;
            });
        }
        while let Some(result) = stops.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Session stop task failed");
            }
        }
    }

    /// Drop the entry for `session` and schedule removal of its directory
    ///
    /// Both happen under the slot's creation lock, so a creation for the same
    /// identity either runs first (and this is a no-op) or sees the removal
    /// and cancels it.
    pub(super) async fn release(&self, session: &Arc<Session>, cleanup_delay: Duration) {
        let identity = session.identity();

        loop {
            let slot = self.slot(identity);
            let _create = slot.create.lock().await;
            if !self.is_current_slot(identity, &slot) {
                continue;
            }

            {
                let mut current = slot.current.write().unwrap_or_else(PoisonError::into_inner);
                match current.as_ref() {
                    Some(published) if Arc::ptr_eq(published, session) => {
                        *current = None;
                    }
                    Some(_) => {
                        tracing::debug!(identity = identity, "Session already replaced, keeping directory");
                        return;
                    }
                    None => {}
                }
            }

            self.schedule_removal(identity, session.output_dir().to_path_buf(), cleanup_delay)
                .await;
            self.retire_if_empty(identity, &slot);
            tracing::debug!(identity = identity, "Session released");
            return;
        }
    }

    /// Schedule best-effort removal of an identity's output directory
    ///
    /// Caller holds the slot's creation lock. A later session for the same
    /// identity cancels the removal.
    async fn schedule_removal(&self, identity: &str, dir: PathBuf, delay: Duration) {
        let seq = self.removal_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.removals.lock().await.insert(identity.to_string(), seq);

        let removals = Arc::clone(&self.removals);
        let identity = identity.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let mut pending = removals.lock().await;
            if pending.get(&identity) != Some(&seq) {
                return;
            }
            pending.remove(&identity);
            remove_output_dir(&identity, &dir).await;
        });
    }

    /// Number of directory removals scheduled since startup
    pub fn removals_scheduled(&self) -> u64 {
        self.removal_seq.load(Ordering::Relaxed)
    }

    /// Whether a directory removal is scheduled and not yet done
    pub async fn removal_pending(&self, identity: &str) -> bool {
        self.removals.lock().await.contains_key(identity)
    }

    async fn cancel_removal(&self, identity: &str) {
        if self.removals.lock().await.remove(identity).is_some() {
            tracing::debug!(identity = identity, "Cancelled pending directory cleanup");
        }
    }

    fn slot(&self, identity: &str) -> Arc<Slot> {
        Arc::clone(self.lock_slots().entry(identity.to_string()).or_default())
    }

    fn is_current_slot(&self, identity: &str, slot: &Arc<Slot>) -> bool {
        self.lock_slots()
            .get(identity)
            .map(|s| Arc::ptr_eq(s, slot))
            .unwrap_or(false)
    }

    /// Remove an empty slot from the map. Caller holds its creation lock.
    fn retire_if_empty(&self, identity: &str, slot: &Arc<Slot>) {
        let mut slots = self.lock_slots();
        let retire = slots
            .get(identity)
            .map(|s| Arc::ptr_eq(s, slot) && slot.is_empty())
            .unwrap_or(false);
        if retire {
            slots.remove(identity);
        }
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Identities become directory names under the output base
fn validate_identity(identity: &str) -> Result<(), SessionError> {
    let invalid = identity.is_empty()
        || identity == "."
        || identity == ".."
        || identity.contains(['/', '\\', '\0']);

    if invalid {
        Err(SessionError::InvalidIdentity)
    } else {
        Ok(())
    }
}
