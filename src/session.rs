//! Per-user responder sessions

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

/// Concurrent map from user OpenID to the session of that user
///
/// Cloning shares the underlying map. Entries live until [`Sessions::remove`] is called,
/// which the dispatcher does when a user unsubscribes.
#[derive(Debug)]
pub struct Sessions<S> {
    inner: Arc<DashMap<String, Arc<Mutex<S>>>>,
}

impl<S> Clone for Sessions<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> Default for Sessions<S> {
    fn default() -> Self {
        Self {
            inner: Default::default(),
        }
    }
}

impl<S> Sessions<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session of `user`, creating it with `init` on a miss.
    ///
    /// `init` runs at most once per user, while the map shard of the user is locked.
    pub fn get_or_create(&self, user: &str, init: impl FnOnce() -> S) -> Arc<Mutex<S>> {
        if let Some(session) = self.inner.get(user) {
            return session.clone();
        }
        self.inner
            .entry(user.to_owned())
            .or_insert_with(|| {
                tracing::debug!(user, "new session");
                Arc::new(Mutex::new(init()))
            })
            .clone()
    }

    pub fn remove(&self, user: &str) -> Option<Arc<Mutex<S>>> {
        self.inner.remove(user).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
