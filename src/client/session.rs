use std::{
    cmp::Ordering,
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use bson::{spec::BinarySubtype, Binary, Document, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Struct modeling a cluster time reported by the server.
///
/// See [the server documentation](https://docs.ferrodb.dev/manual/core/causal-consistency/)
/// for more information.
#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,
    pub(crate) signature: Document,
}

impl Eq for ClusterTime {}

impl std::hash::Hash for ClusterTime {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.cluster_time.hash(state);
    }
}

impl PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClusterTime {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        lhs.cmp(&rhs)
    }
}

/// The duration before a session expires within which the driver will no longer attempt to
/// reuse it.
const MINIMUM_SESSION_EXPIRATION_BUFFER: Duration = Duration::from_secs(60);

/// A server-side session, tracked so that retried writes can reuse the same session id and
/// transaction number for server-side deduplication.
#[derive(Debug)]
pub(crate) struct ServerSession {
    /// The id of the server session to which this corresponds.
    pub(crate) id: Document,

    /// The last time an operation was executed with this session.
    last_use: Instant,

    /// A monotonically increasing transaction number for this session.
    txn_number: i64,

    /// Whether a network error was encountered while using this session.
    dirty: bool,
}

impl ServerSession {
    fn new() -> Self {
        let binary = Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        };

        Self {
            id: bson::doc! { "id": binary },
            last_use: Instant::now(),
            txn_number: 0,
            dirty: false,
        }
    }

    /// Determines if this server session is about to expire in a short amount of time (1
    /// minute).
    fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        let timeout = match logical_session_timeout {
            Some(timeout) => timeout,
            None => return false,
        };
        let expiration_time = self.last_use + timeout;
        let minimum_reuse_time = Instant::now() + MINIMUM_SESSION_EXPIRATION_BUFFER;

        expiration_time <= minimum_reuse_time
    }

    pub(crate) fn update_last_use(&mut self) {
        self.last_use = Instant::now();
    }

    /// Increments the transaction number and returns the new value.
    pub(crate) fn get_and_increment_txn_number(&mut self) -> i64 {
        self.txn_number += 1;
        self.txn_number
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// A pool of server sessions, checked out for implicit use by operations that support
/// sessions.
#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Checks out a server session from the pool. Before doing so, it prunes any sessions
    /// which will expire within the next minute.
    pub(crate) fn check_out(&self, logical_session_timeout: Option<Duration>) -> ServerSession {
        let mut pool = self.pool.lock().unwrap();
        while let Some(session) = pool.pop_front() {
            if session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            return session;
        }
        ServerSession::new()
    }

    /// Checks in a server session to the pool. If it is about to expire or is dirty, it will
    /// be discarded.
    pub(crate) fn check_in(
        &self,
        session: ServerSession,
        logical_session_timeout: Option<Duration>,
    ) {
        let mut pool = self.pool.lock().unwrap();
        if !session.dirty && !session.is_about_to_expire(logical_session_timeout) {
            pool.push_front(session);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn txn_numbers_are_monotonic() {
        let mut session = ServerSession::new();
        assert_eq!(session.get_and_increment_txn_number(), 1);
        assert_eq!(session.get_and_increment_txn_number(), 2);
    }

    #[test]
    fn dirty_sessions_are_discarded() {
        let pool = ServerSessionPool::new();
        let timeout = Some(Duration::from_secs(30 * 60));

        let mut session = pool.check_out(timeout);
        let id = session.id.clone();
        session.mark_dirty();
        pool.check_in(session, timeout);

        // The dirty session must not be reused.
        let session = pool.check_out(timeout);
        assert_ne!(session.id, id);
    }

    #[test]
    fn sessions_are_reused_most_recently_returned_first() {
        let pool = ServerSessionPool::new();
        let timeout = Some(Duration::from_secs(30 * 60));

        let first = pool.check_out(timeout);
        let second = pool.check_out(timeout);
        let first_id = first.id.clone();
        let second_id = second.id.clone();
        assert_ne!(first_id, second_id);

        pool.check_in(first, timeout);
        pool.check_in(second, timeout);

        assert_eq!(pool.check_out(timeout).id, second_id);
        assert_eq!(pool.check_out(timeout).id, first_id);
    }

    #[test]
    fn cluster_time_ordering() {
        let older = ClusterTime {
            cluster_time: Timestamp {
                time: 1,
                increment: 2,
            },
            signature: Document::new(),
        };
        let newer = ClusterTime {
            cluster_time: Timestamp {
                time: 2,
                increment: 0,
            },
            signature: Document::new(),
        };
        assert!(older < newer);
        assert_eq!(std::cmp::max(&older, &newer), &newer);
    }
}
