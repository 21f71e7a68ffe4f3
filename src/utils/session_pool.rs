// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::{AppError, AppResult};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process wide unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a pooled session, stored as an `AtomicU8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl SessionState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Created,
            1 => SessionState::Running,
            2 => SessionState::Stopping,
            _ => SessionState::Stopped,
        }
    }
}

/// What a pool needs to know about the sessions it owns.
pub trait PooledSession: Send + Sync + 'static {
    fn id(&self) -> SessionId;
    fn remote(&self) -> SocketAddr;
    fn is_running(&self) -> bool;
    fn stop(&self);
}

/// Slot map of live sessions plus an endpoint index.
///
/// The pool is meant to be the state of a manager [`Strand`](super::Strand): every
/// `&mut self` method runs on that strand only. Readers outside the strand may use
/// the [`directory`](Self::directory), a read-mostly mirror of the endpoint index
/// that is only ever written from here.
#[derive(Debug)]
pub struct SessionPool<S: PooledSession> {
    name: String,
    capacity: usize,
    slots: HashMap<SessionId, Arc<S>>,
    endpoints: HashMap<SocketAddr, SessionId>,
    directory: Arc<DashMap<SocketAddr, Arc<S>>>,
}

impl<S: PooledSession> SessionPool<S> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            slots: HashMap::with_capacity(capacity.min(1024)),
            endpoints: HashMap::with_capacity(capacity.min(1024)),
            directory: Arc::new(DashMap::new()),
        }
    }

    pub fn directory(&self) -> Arc<DashMap<SocketAddr, Arc<S>>> {
        self.directory.clone()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Returns the live session for `remote`, erasing a dead one if found.
    pub fn get_live(&mut self, remote: &SocketAddr) -> Option<Arc<S>> {
        let id = *self.endpoints.get(remote)?;
        match self.slots.get(&id) {
            Some(session) if session.is_running() => Some(session.clone()),
            _ => {
                self.remove(id);
                None
            }
        }
    }

    /// Erases every session that reports it is no longer running.
    pub fn sweep(&mut self) -> usize {
        let dead: Vec<SessionId> = self
            .slots
            .iter()
            .filter(|(_, session)| !session.is_running())
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            self.remove(*id);
        }
        if !dead.is_empty() {
            debug!(
                "{} swept {} dead sessions, {} left",
                self.name,
                dead.len(),
                self.slots.len()
            );
        }
        dead.len()
    }

    /// Returns the live session for `remote` or builds one with `make`.
    ///
    /// Dead sessions are swept before the capacity check; when the pool is still
    /// full the request is refused, a live session is never evicted.
    pub fn get_or_insert_with<F>(&mut self, remote: SocketAddr, make: F) -> AppResult<Arc<S>>
    where
        F: FnOnce(SessionId) -> AppResult<Arc<S>>,
    {
        if let Some(session) = self.get_live(&remote) {
            return Ok(session);
        }
        self.insert_new(remote, make)
    }

    /// Adds a session built by `make` for an endpoint that has no live session.
    pub fn insert_new<F>(&mut self, remote: SocketAddr, make: F) -> AppResult<Arc<S>>
    where
        F: FnOnce(SessionId) -> AppResult<Arc<S>>,
    {
        if self.get_live(&remote).is_some() {
            return Err(AppError::IllegalStateError(format!(
                "{} already has a live session to {}",
                self.name, remote
            )));
        }
        if self.is_full() {
            self.sweep();
        }
        if self.is_full() {
            return Err(AppError::CapacityExceeded(format!(
                "{} reached max session num {}",
                self.name, self.capacity
            )));
        }
        let id = SessionId::next();
        let session = make(id)?;
        trace!("{} insert session {} for {}", self.name, id, remote);
        self.slots.insert(id, session.clone());
        self.endpoints.insert(remote, id);
        self.directory.insert(remote, session.clone());
        Ok(session)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Arc<S>> {
        let session = self.slots.remove(&id)?;
        let remote = session.remote();
        if self.endpoints.get(&remote) == Some(&id) {
            self.endpoints.remove(&remote);
            self.directory.remove(&remote);
        }
        Some(session)
    }

    /// Empties the pool, handing every session back to the caller.
    pub fn drain(&mut self) -> Vec<Arc<S>> {
        self.endpoints.clear();
        self.directory.clear();
        self.slots.drain().map(|(_, session)| session).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Debug)]
    struct FakeSession {
        id: SessionId,
        remote: SocketAddr,
        running: AtomicBool,
    }

    impl FakeSession {
        fn new(id: SessionId, remote: SocketAddr) -> Arc<Self> {
            Arc::new(Self {
                id,
                remote,
                running: AtomicBool::new(true),
            })
        }
    }

    impl PooledSession for FakeSession {
        fn id(&self) -> SessionId {
            self.id
        }
        fn remote(&self) -> SocketAddr {
            self.remote
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::Acquire)
        }
        fn stop(&self) {
            self.running.store(false, Ordering::Release);
        }
    }

    fn ep(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_get_or_insert_reuses_live_session() -> AppResult<()> {
        let mut pool = SessionPool::new("test", 4);
        let first = pool.get_or_insert_with(ep(1), |id| Ok(FakeSession::new(id, ep(1))))?;
        let second = pool.get_or_insert_with(ep(1), |_| panic!("must not build twice"))?;
        assert_eq!(first.id(), second.id());
        assert_eq!(pool.len(), 1);
        assert!(pool.directory().contains_key(&ep(1)));
        Ok(())
    }

    #[test]
    fn test_capacity_refuses_instead_of_evicting() -> AppResult<()> {
        let mut pool = SessionPool::new("test", 2);
        let a = pool.get_or_insert_with(ep(1), |id| Ok(FakeSession::new(id, ep(1))))?;
        pool.get_or_insert_with(ep(2), |id| Ok(FakeSession::new(id, ep(2))))?;

        let refused = pool.get_or_insert_with(ep(3), |id| Ok(FakeSession::new(id, ep(3))));
        assert!(matches!(refused, Err(AppError::CapacityExceeded(_))));
        assert_eq!(pool.len(), 2);

        // once a session dies its slot is reclaimed by the sweep before the check
        a.stop();
        pool.get_or_insert_with(ep(3), |id| Ok(FakeSession::new(id, ep(3))))?;
        assert_eq!(pool.len(), 2);
        assert!(!pool.directory().contains_key(&ep(1)));
        Ok(())
    }

    #[test]
    fn test_dead_session_is_replaced() -> AppResult<()> {
        let mut pool = SessionPool::new("test", 2);
        let old = pool.get_or_insert_with(ep(1), |id| Ok(FakeSession::new(id, ep(1))))?;
        old.stop();
        assert!(pool.get_live(&ep(1)).is_none());
        let new = pool.get_or_insert_with(ep(1), |id| Ok(FakeSession::new(id, ep(1))))?;
        assert_ne!(old.id(), new.id());
        Ok(())
    }

    #[test]
    fn test_sweep_and_drain() -> AppResult<()> {
        let mut pool = SessionPool::new("test", 8);
        let sessions: Vec<_> = (1..=4)
            .map(|p| pool.get_or_insert_with(ep(p), |id| Ok(FakeSession::new(id, ep(p)))))
            .collect::<AppResult<_>>()?;
        sessions[0].stop();
        sessions[2].stop();
        assert_eq!(pool.sweep(), 2);
        assert_eq!(pool.len(), 2);

        let drained = pool.drain();
        assert_eq!(drained.len(), 2);
        assert!(pool.is_empty());
        assert!(pool.directory().is_empty());
        Ok(())
    }

    #[test]
    fn test_failed_build_leaves_pool_untouched() {
        let mut pool: SessionPool<FakeSession> = SessionPool::new("test", 2);
        let result = pool.get_or_insert_with(ep(1), |_| {
            Err(AppError::IllegalStateError("bind failed".into()))
        });
        assert!(result.is_err());
        assert!(pool.is_empty());
    }
}
