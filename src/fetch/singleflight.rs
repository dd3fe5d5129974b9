//! Single-flight group
//!
//! At most one in-flight call per key. The first caller (the leader) runs the
//! work and keeps its own result; everyone who arrives while it runs (the
//! followers) receives a clonable summary of that result.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;

/// The leader went away before publishing a summary.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("in-flight call abandoned")]
pub struct Abandoned;

/// Which side of a call this caller ended up on.
#[derive(Debug)]
pub enum Joined<R, S> {
    /// Ran the work; owns its result
    Leader(R),
    /// Waited on a leader; holds the published summary
    Follower(S),
}

impl<R, S> Joined<R, S> {
    pub fn is_follower(&self) -> bool {
        matches!(self, Joined::Follower(_))
    }
}

// == Group ==
pub struct Group<S> {
    calls: Mutex<HashMap<String, watch::Receiver<Option<S>>>>,
}

impl<S> Default for Group<S> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

enum Role<S> {
    Leader(watch::Sender<Option<S>>),
    Follower(watch::Receiver<Option<S>>),
}

/// Removes the call from the table when the leader finishes or is dropped.
struct CallGuard<'a, S> {
    group: &'a Group<S>,
    key: &'a str,
}

impl<S> Drop for CallGuard<'_, S> {
    fn drop(&mut self) {
        self.group.calls.lock().remove(self.key);
    }
}

impl<S: Clone + Send + Sync> Group<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` unless a call for `key` is already in flight, in which case
    /// waits for that call's summary instead.
    ///
    /// `work` yields the leader's own result and the summary to publish.
    /// Followers get [`Abandoned`] if the leader is dropped mid-flight.
    pub async fn work<F, R>(&self, key: &str, work: F) -> Result<Joined<R, S>, Abandoned>
    where
        F: Future<Output = (R, S)>,
    {
        let role = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    calls.insert(key.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                let summary = rx
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| Abandoned)?
                    .clone();
                summary.map(Joined::Follower).ok_or(Abandoned)
            }
            Role::Leader(tx) => {
                let _guard = CallGuard { group: self, key };
                let (result, summary) = work.await;
                tx.send_replace(Some(summary));
                Ok(Joined::Leader(result))
            }
        }
    }

    /// Number of calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}
