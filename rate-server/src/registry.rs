use crate::config::ClientId;
use crossbeam_channel::{Sender, TrySendError};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Очередь исходящих строк клиента (пишет отдельный поток)
pub(crate) type Outbox = Sender<Arc<str>>;

#[derive(Debug, Error, PartialEq)]
pub(crate) enum RegistryError {
    #[error("Rate data not found for {0}")]
    UnknownTopic(String),

    #[error("You already have a subscription for {0}")]
    AlreadySubscribed(String),

    #[error("You do not have subscription to {0}")]
    NotSubscribed(String),
}

impl RegistryError {
    /// Строка ответа клиенту
    pub(crate) fn reply(&self) -> String {
        match self {
            RegistryError::UnknownTopic(_) => format!("ERROR|{self}"),
            _ => format!("INFO|{self}"),
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct BroadcastStats {
    pub(crate) sent: usize,
    pub(crate) dropped_full: usize,
    pub(crate) dropped_dead: usize,
}

impl fmt::Display for BroadcastStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent={} dropped_full={} dropped_dead={}",
            self.sent, self.dropped_full, self.dropped_dead
        )
    }
}

impl AddAssign for BroadcastStats {
    fn add_assign(&mut self, rhs: Self) {
        self.sent += rhs.sent;
        self.dropped_full += rhs.dropped_full;
        self.dropped_dead += rhs.dropped_dead;
    }
}

impl BroadcastStats {
    pub(crate) fn not_empty(&self) -> bool {
        self.sent + self.dropped_dead + self.dropped_full > 0
    }
}

struct Subscriber {
    cid: ClientId,
    tx: Outbox,
}

/// Топик -> подписчики.
///
/// На топик допускается один подписчик: повторная подписка отклоняется,
/// а отписка снимает топик целиком, кто бы её ни прислал.
pub(crate) struct SubscriberRegistry {
    known_topics: HashSet<String>,
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    subscriber_count: AtomicUsize,
}

impl SubscriberRegistry {
    pub(crate) fn new(known_topics: impl IntoIterator<Item = String>) -> Self {
        Self {
            known_topics: known_topics.into_iter().collect(),
            topics: Mutex::new(HashMap::new()),
            subscriber_count: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        match self.topics.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(), // продолжаем, несмотря на poison
        }
    }

    pub(crate) fn subscribe(
        &self,
        topic: &str,
        cid: ClientId,
        tx: Outbox,
    ) -> Result<(), RegistryError> {
        if !self.known_topics.contains(topic) {
            return Err(RegistryError::UnknownTopic(topic.to_string()));
        }

        let mut topics = self.lock();
        if topics.contains_key(topic) {
            return Err(RegistryError::AlreadySubscribed(topic.to_string()));
        }

        topics.insert(topic.to_string(), vec![Subscriber { cid, tx }]);
        self.subscriber_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn unsubscribe(&self, topic: &str) -> Result<(), RegistryError> {
        if !self.known_topics.contains(topic) {
            return Err(RegistryError::UnknownTopic(topic.to_string()));
        }

        let mut topics = self.lock();
        match topics.remove(topic) {
            Some(_) => {
                self.subscriber_count.fetch_sub(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(RegistryError::NotSubscribed(topic.to_string())),
        }
    }

    /// Снимает все топики клиента, возвращает их число
    pub(crate) fn remove_client(&self, cid: ClientId) -> usize {
        let mut topics = self.lock();
        let before = topics.len();

        topics.retain(|_, subs| {
            subs.retain(|s| s.cid != cid);
            !subs.is_empty()
        });

        let removed = before - topics.len();
        self.subscriber_count.fetch_sub(removed, Ordering::Relaxed);
        removed
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Relaxed)
    }

    /// Снимок топиков, на которые сейчас кто-то подписан
    pub(crate) fn active_topics(&self) -> Vec<String> {
        let mut out: Vec<String> = self.lock().keys().cloned().collect();
        out.sort();
        out
    }

    pub(crate) fn broadcast(&self, topic: &str, msg: Arc<str>) -> BroadcastStats {
        let snapshot: Vec<(ClientId, Outbox)> = {
            let topics = self.lock();
            match topics.get(topic) {
                Some(subs) => subs.iter().map(|s| (s.cid, s.tx.clone())).collect(),
                None => return BroadcastStats::default(),
            }
        };

        let mut stats = BroadcastStats::default();
        let mut dead: Vec<ClientId> = Vec::new();

        for (cid, tx) in snapshot.iter() {
            match tx.try_send(msg.clone()) {
                Ok(()) => stats.sent += 1,
                Err(TrySendError::Disconnected(_)) => dead.push(*cid),
                Err(TrySendError::Full(_)) => stats.dropped_full += 1,
            }
        }

        for cid in &dead {
            self.remove_client(*cid);
        }
        stats.dropped_dead = dead.len();

        stats
    }
}
