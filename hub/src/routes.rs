use crate::connection::ConnectionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::{Duration, Instant};

struct Route {
    connection: ConnectionId,
    recorded_at: Instant,
}

/// Request id to the connection that issued it, so a reply reaches exactly that
/// socket. Entries are taken on delivery and swept when their handler never answered.
#[derive(Default)]
pub(crate) struct RouteTable {
    entries: DashMap<String, Route>,
}

impl RouteTable {
    /// Records `connection` as the origin of `request_id`. Returns `false`, leaving
    /// the table untouched, when another connection already holds that id.
    pub(crate) fn record(&self, request_id: String, connection: ConnectionId) -> bool {
        match self.entries.entry(request_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().connection != connection {
                    return false;
                }
                entry.get_mut().recorded_at = Instant::now();
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(Route {
                    connection,
                    recorded_at: Instant::now(),
                });
                true
            }
        }
    }

    pub(crate) fn origin(&self, request_id: &str) -> Option<ConnectionId> {
        self.entries
            .get(request_id)
            .map(|route| route.connection.clone())
    }

    /// Removes and returns the route for `request_id` in one step, so a reply is
    /// delivered to its origin at most once.
    pub(crate) fn take(&self, request_id: &str) -> Option<ConnectionId> {
        self.entries
            .remove(request_id)
            .map(|(_, route)| route.connection)
    }

    pub(crate) fn release(&self, request_id: &str) {
        self.entries.remove(request_id);
    }

    /// Drops routes older than `ttl`; if the table is still above `ceiling`, drops
    /// everything. Returns how many entries were removed.
    pub(crate) fn sweep(&self, now: Instant, ttl: Duration, ceiling: usize) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, route| now.saturating_duration_since(route.recorded_at) < ttl);

        if self.entries.len() > ceiling {
            self.entries.clear();
        }
        before.saturating_sub(self.entries.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
