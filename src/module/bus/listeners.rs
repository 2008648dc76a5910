//! Listener types and topic-keyed registration tables
//!
//! Registrations are grouped by topic. A registration is identified by its
//! endpoint (a local callback, compared by pointer, or a peer id) plus its
//! filter; registering the same pair again bumps its ref count instead of
//! adding a second entry. A topic entry disappears with its last reference.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::module::bus::error::BusError;
use crate::module::bus::scope::{authorize, AccessScope};

/// Bus peer identifier (the module id of a worker)
pub type PeerId = String;

/// Where a delivered event or request came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Sent from this process
    Local,
    /// Arrived from the coordinator (worker side)
    Upstream,
    /// Arrived from an attached worker (coordinator side)
    Peer(PeerId),
}

#[derive(Debug, Clone)]
pub struct BusEvent {
    pub topic: String,
    pub metadata: AccessScope,
    pub params: Vec<Value>,
    pub origin: Origin,
}

#[derive(Debug, Clone)]
pub struct BusRequest {
    pub topic: String,
    pub metadata: AccessScope,
    pub params: Vec<Value>,
    pub origin: Origin,
}

impl BusRequest {
    /// Deserialize the parameter at `index`
    pub fn param<T: DeserializeOwned>(&self, index: usize) -> Result<T, BusError> {
        let value = self.params.get(index).cloned().ok_or_else(|| {
            BusError::validation(format!("{}: missing parameter {}", self.topic, index))
        })?;
        serde_json::from_value(value).map_err(|e| {
            BusError::validation(format!("{}: parameter {}: {}", self.topic, index, e))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "added" => Some(ChangeKind::Added),
            "removed" => Some(ChangeKind::Removed),
            _ => None,
        }
    }
}

/// Notification that an event listener was added or removed somewhere
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberChange {
    pub topic: String,
    pub kind: ChangeKind,
    /// Filter of the registration that changed
    pub filter: AccessScope,
    /// Total references on the topic after the change
    pub listeners: usize,
}

/// Request handler registered on a topic
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: BusRequest) -> anyhow::Result<Value>;
}

pub type EventFn = dyn Fn(&BusEvent) + Send + Sync;
pub type SubscriberFn = dyn Fn(&SubscriberChange) + Send + Sync;

pub type EventCallback = Arc<EventFn>;
pub type SubscriberCallback = Arc<SubscriberFn>;
pub type RequestHandlerRef = Arc<dyn RequestHandler>;

/// Wrap a closure as an event listener
pub fn event_listener<F>(f: F) -> EventCallback
where
    F: Fn(&BusEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a subscriber listener
pub fn subscriber_listener<F>(f: F) -> SubscriberCallback
where
    F: Fn(&SubscriberChange) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap an async closure as a request handler
pub fn request_handler<F, Fut>(f: F) -> RequestHandlerRef
where
    F: Fn(BusRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(BusRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, request: BusRequest) -> anyhow::Result<Value> {
        (self.0)(request).await
    }
}

/// Who receives deliveries for a registration
pub(crate) enum Endpoint<C: ?Sized> {
    Local(Arc<C>),
    Peer(PeerId),
}

impl<C: ?Sized> Clone for Endpoint<C> {
    fn clone(&self) -> Self {
        match self {
            Endpoint::Local(callback) => Endpoint::Local(Arc::clone(callback)),
            Endpoint::Peer(peer) => Endpoint::Peer(peer.clone()),
        }
    }
}

impl<C: ?Sized> Endpoint<C> {
    fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Endpoint::Local(a), Endpoint::Local(b)) => {
                std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
            }
            (Endpoint::Peer(a), Endpoint::Peer(b)) => a == b,
            _ => false,
        }
    }
}

pub(crate) struct Registration<C: ?Sized> {
    pub endpoint: Endpoint<C>,
    pub filter: AccessScope,
    pub refs: usize,
}

/// Outcome of looking up the handler for a request
pub(crate) enum Lookup<C: ?Sized> {
    /// No registration on the topic at all
    Empty,
    /// Registrations exist but none admits the caller
    Denied,
    Found(Endpoint<C>),
}

pub(crate) struct TopicTable<C: ?Sized> {
    topics: HashMap<String, Vec<Registration<C>>>,
}

impl<C: ?Sized> Default for TopicTable<C> {
    fn default() -> Self {
        Self {
            topics: HashMap::new(),
        }
    }
}

impl<C: ?Sized> TopicTable<C> {
    /// Add a reference; returns the registration's new ref count
    pub fn add(&mut self, topic: &str, endpoint: Endpoint<C>, filter: AccessScope) -> usize {
        let registrations = self.topics.entry(topic.to_string()).or_default();
        if let Some(existing) = registrations
            .iter_mut()
            .find(|r| r.endpoint.same(&endpoint) && r.filter == filter)
        {
            existing.refs += 1;
            return existing.refs;
        }
        registrations.push(Registration {
            endpoint,
            filter,
            refs: 1,
        });
        1
    }

    /// Drop a reference; `None` when the registration does not exist
    pub fn remove(&mut self, topic: &str, endpoint: &Endpoint<C>, filter: &AccessScope) -> Option<usize> {
        let registrations = self.topics.get_mut(topic)?;
        let position = registrations
            .iter()
            .position(|r| r.endpoint.same(endpoint) && &r.filter == filter)?;
        registrations[position].refs -= 1;
        let remaining = registrations[position].refs;
        if remaining == 0 {
            registrations.remove(position);
        }
        if registrations.is_empty() {
            self.topics.remove(topic);
        }
        Some(remaining)
    }

    pub fn contains_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Sum of references on a topic
    pub fn ref_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|regs| regs.iter().map(|r| r.refs).sum())
            .unwrap_or(0)
    }

    /// Local callbacks on `topic` that admit `call`, each once
    pub fn local_matching(&self, topic: &str, call: &AccessScope) -> Vec<Arc<C>> {
        let mut matched: Vec<Arc<C>> = Vec::new();
        for registration in self.topics.get(topic).into_iter().flatten() {
            if let Endpoint::Local(callback) = &registration.endpoint {
                if authorize(call, &registration.filter)
                    && !matched.iter().any(|m| {
                        std::ptr::eq(Arc::as_ptr(m) as *const (), Arc::as_ptr(callback) as *const ())
                    })
                {
                    matched.push(Arc::clone(callback));
                }
            }
        }
        matched
    }

    /// All local callbacks on `topic`, ignoring filters
    pub fn locals(&self, topic: &str) -> Vec<Arc<C>> {
        self.topics
            .get(topic)
            .into_iter()
            .flatten()
            .filter_map(|r| match &r.endpoint {
                Endpoint::Local(callback) => Some(Arc::clone(callback)),
                Endpoint::Peer(_) => None,
            })
            .collect()
    }

    /// Peers holding a registration on `topic` that admits `call`, each once
    pub fn peers_matching(&self, topic: &str, call: &AccessScope) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = Vec::new();
        for registration in self.topics.get(topic).into_iter().flatten() {
            if let Endpoint::Peer(peer) = &registration.endpoint {
                if authorize(call, &registration.filter) && !peers.contains(peer) {
                    peers.push(peer.clone());
                }
            }
        }
        peers
    }

    /// Peers holding any registration on `topic`, each once
    pub fn peers(&self, topic: &str) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = Vec::new();
        for registration in self.topics.get(topic).into_iter().flatten() {
            if let Endpoint::Peer(peer) = &registration.endpoint {
                if !peers.contains(peer) {
                    peers.push(peer.clone());
                }
            }
        }
        peers
    }

    /// First registration on `topic` that admits `call`
    pub fn first_authorized(&self, topic: &str, call: &AccessScope) -> Lookup<C> {
        let Some(registrations) = self.topics.get(topic) else {
            return Lookup::Empty;
        };
        registrations
            .iter()
            .find(|r| authorize(call, &r.filter))
            .map(|r| Lookup::Found(r.endpoint.clone()))
            .unwrap_or(Lookup::Denied)
    }

    /// Remove everything a peer registered; returns `(topic, filter)` per registration
    pub fn drop_peer(&mut self, peer: &str) -> Vec<(String, AccessScope)> {
        let mut dropped = Vec::new();
        self.topics.retain(|topic, registrations| {
            registrations.retain(|r| match &r.endpoint {
                Endpoint::Peer(p) if p == peer => {
                    dropped.push((topic.clone(), r.filter.clone()));
                    false
                }
                _ => true,
            });
            !registrations.is_empty()
        });
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callback() -> EventCallback {
        event_listener(|_| {})
    }

    #[test]
    fn test_duplicate_registration_bumps_ref_count() {
        let mut table: TopicTable<EventFn> = TopicTable::default();
        let cb = callback();
        let open = AccessScope::unrestricted();

        assert_eq!(table.add("t", Endpoint::Local(cb.clone()), open.clone()), 1);
        assert_eq!(table.add("t", Endpoint::Local(cb.clone()), open.clone()), 2);
        assert_eq!(table.ref_count("t"), 2);
        assert_eq!(table.local_matching("t", &open).len(), 1);

        assert_eq!(table.remove("t", &Endpoint::Local(cb.clone()), &open), Some(1));
        assert!(table.contains_topic("t"));
        assert_eq!(table.remove("t", &Endpoint::Local(cb.clone()), &open), Some(0));
        assert!(!table.contains_topic("t"));
        assert_eq!(table.remove("t", &Endpoint::Local(cb), &open), None);
    }

    #[test]
    fn test_distinct_callbacks_are_distinct_registrations() {
        let mut table: TopicTable<EventFn> = TopicTable::default();
        let open = AccessScope::unrestricted();
        let (a, b) = (callback(), callback());
        table.add("t", Endpoint::Local(a.clone()), open.clone());
        table.add("t", Endpoint::Local(b.clone()), open.clone());
        assert_eq!(table.ref_count("t"), 2);

        table.remove("t", &Endpoint::Local(a), &open);
        let remaining = table.local_matching("t", &open);
        assert_eq!(remaining.len(), 1);
        assert!(Arc::ptr_eq(&remaining[0], &b));
    }

    #[test]
    fn test_first_authorized() {
        let mut table: TopicTable<EventFn> = TopicTable::default();
        assert!(matches!(
            table.first_authorized("t", &AccessScope::unrestricted()),
            Lookup::Empty
        ));
        table.add("t", Endpoint::Peer("w1".to_string()), AccessScope::scoped(["x"]));
        assert!(matches!(
            table.first_authorized("t", &AccessScope::unrestricted()),
            Lookup::Denied
        ));
        assert!(matches!(
            table.first_authorized("t", &AccessScope::scoped(["x", "y"])),
            Lookup::Found(Endpoint::Peer(p)) if p == "w1"
        ));
    }

    #[test]
    fn test_drop_peer() {
        let mut table: TopicTable<EventFn> = TopicTable::default();
        table.add("a", Endpoint::Peer("w1".to_string()), AccessScope::unrestricted());
        table.add("b", Endpoint::Peer("w1".to_string()), AccessScope::system());
        table.add("b", Endpoint::Peer("w2".to_string()), AccessScope::unrestricted());

        let mut dropped = table.drop_peer("w1");
        dropped.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(dropped.len(), 2);
        assert_eq!(dropped[0].0, "a");
        assert!(!table.contains_topic("a"));
        assert_eq!(table.peers("b"), vec!["w2".to_string()]);
    }
}
