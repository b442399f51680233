//! Duplicate suppression for publishes relayed between brokers.
//!
//! In a mesh with more than one path between two brokers the same publish can
//! arrive over several links. Per `(origin, topic)` the first link that carries
//! it becomes the designated link and only publishes arriving there are
//! accepted. Every path forwards every publish for a topic it carries, so the
//! designated link alone yields each publish exactly once, in order.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::transport::{ConnectionId, NodeId};

#[derive(Debug, Clone, Copy)]
struct Route {
    link: ConnectionId,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct RouteTable {
    routes: HashMap<(NodeId, String), Route>,
    idle: Duration,
    next_sweep: Option<Instant>,
}

impl RouteTable {
    /// Designations not refreshed for `idle` may move to another link.
    pub fn new(idle: Duration) -> Self {
        Self {
            routes: HashMap::new(),
            idle,
            next_sweep: None,
        }
    }

    /// Whether a publish from `origin` on `topic` that arrived over `link`
    /// should be delivered.
    pub fn admit(&mut self, origin: NodeId, topic: &str, link: ConnectionId, now: Instant) -> bool {
        self.sweep(now);
        let idle = self.idle;
        match self.routes.get_mut(&(origin, topic.to_string())) {
            Some(route) if route.link == link => {
                route.last_seen = now;
                true
            }
            Some(route) if now.duration_since(route.last_seen) < idle => false,
            Some(route) => {
                *route = Route {
                    link,
                    last_seen: now,
                };
                true
            }
            None => {
                self.routes.insert(
                    (origin, topic.to_string()),
                    Route {
                        link,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Drops designations idle for longer than `idle`, at most once per
    /// `idle` period.
    fn sweep(&mut self, now: Instant) {
        if self.next_sweep.is_some_and(|at| now < at) {
            return;
        }
        let idle = self.idle;
        self.routes
            .retain(|_, route| now.saturating_duration_since(route.last_seen) < idle);
        self.next_sweep = Some(now + idle);
    }

    /// Releases every designation held by a closed link.
    pub fn forget_link(&mut self, link: ConnectionId) {
        self.routes.retain(|_, route| route.link != link);
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
