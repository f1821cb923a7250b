use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::models::event::JobEvent;

struct LiveSession {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<JobEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Which user/connection pairs are currently live. A user may hold several
/// sessions (phone + web); events address users, and every live session of
/// that user receives a copy.
pub struct SessionRegistry {
    sessions: DashMap<Uuid, LiveSession>,
    by_user: DashMap<Uuid, Vec<Uuid>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    pub fn register(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<JobEvent>) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        self.sessions.insert(session_id, LiveSession { user_id, tx });
        self.by_user.entry(user_id).or_default().push(session_id);

        (session_id, rx)
    }

    pub fn unregister(&self, session_id: Uuid) {
        let Some((_, session)) = self.sessions.remove(&session_id) else {
            return;
        };

        if let Some(mut ids) = self.by_user.get_mut(&session.user_id) {
            ids.retain(|id| *id != session_id);
        }
        self.by_user
            .remove_if(&session.user_id, |_, ids| ids.is_empty());
    }

    pub fn send_to_user(&self, user_id: Uuid, event: &JobEvent) -> Delivery {
        let session_ids: Vec<Uuid> = self
            .by_user
            .get(&user_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();

        let mut delivery = Delivery {
            delivered: 0,
            failed: 0,
        };
        let mut dead = Vec::new();

        for session_id in session_ids {
            let Some(session) = self.sessions.get(&session_id) else {
                continue;
            };
            if session.tx.send(event.clone()).is_ok() {
                delivery.delivered += 1;
            } else {
                delivery.failed += 1;
                dead.push(session_id);
            }
        }

        for session_id in dead {
            debug!(session_id = %session_id, user_id = %user_id, "dropping dead session");
            self.unregister(session_id);
        }

        delivery
    }

    /// Directed send, used to replay missed events to one reconnecting
    /// session without re-broadcasting them to the user's other sessions.
    pub fn send_to_session(&self, session_id: Uuid, event: JobEvent) -> bool {
        match self.sessions.get(&session_id) {
            Some(session) => session.tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self, user_id: Uuid) -> bool {
        self.by_user
            .get(&user_id)
            .map(|ids| !ids.is_empty())
            .unwrap_or(false)
    }

    pub fn live_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::SessionRegistry;
    use crate::models::event::{EventPayload, JobEvent};

    fn event() -> JobEvent {
        JobEvent {
            job_id: Uuid::new_v4(),
            seq: 0,
            at: Utc::now(),
            payload: EventPayload::Resync,
        }
    }

    #[test]
    fn delivers_to_every_session_of_a_user() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();
        let (_, mut rx_a) = registry.register(user);
        let (_, mut rx_b) = registry.register(user);

        let delivery = registry.send_to_user(user, &event());

        assert_eq!(delivery.delivered, 2);
        assert_eq!(delivery.failed, 0);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn unregistered_session_no_longer_receives() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();
        let (session_id, mut rx) = registry.register(user);

        registry.unregister(session_id);
        let delivery = registry.send_to_user(user, &event());

        assert_eq!(delivery.delivered, 0);
        assert!(rx.try_recv().is_err());
        assert!(!registry.is_connected(user));
    }

    #[test]
    fn dead_receiver_is_swept_on_send() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();
        let (_, rx) = registry.register(user);
        drop(rx);

        let delivery = registry.send_to_user(user, &event());

        assert_eq!(delivery.failed, 1);
        assert!(!registry.is_connected(user));
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn directed_send_reaches_only_that_session() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();
        let (session_a, mut rx_a) = registry.register(user);
        let (_, mut rx_b) = registry.register(user);

        assert!(registry.send_to_session(session_a, event()));

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }
}
