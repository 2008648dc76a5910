//! Per-process message bus
//!
//! The coordinator bus owns the authoritative listener tables: its own local
//! listeners plus one entry per registration made by each attached worker.
//! A worker bus keeps only its local listeners, mirrors every registration to
//! the coordinator, and sends everything it cannot satisfy locally upstream.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use rand::Rng;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::module::bus::error::BusError;
use crate::module::bus::listeners::{
    BusEvent, BusRequest, ChangeKind, Endpoint, EventCallback, EventFn, Lookup, Origin, PeerId,
    RequestHandler, RequestHandlerRef, SubscriberCallback, SubscriberChange, SubscriberFn,
    TopicTable,
};
use crate::module::bus::protocol::{CorrelationId, Envelope, EnvelopeType};
use crate::module::bus::scope::{AccessScope, ScopeSet};
use crate::module::bus::transport::{Inbound, Transport};

/// Correlation ids stay below 2^53 - 1 so they survive a round trip through
/// any JSON consumer as exact integers
pub const CORRELATION_ID_CEILING: u64 = (1 << 53) - 1;

type ResponseSender = oneshot::Sender<Result<Value, BusError>>;
type ResponseReceiver = oneshot::Receiver<Result<Value, BusError>>;

/// Resolves once everything a peer sent before its link closed was handled
pub type PeerDrained = oneshot::Receiver<()>;

enum Role {
    Coordinator,
    Worker { upstream: Arc<dyn Transport> },
}

struct PendingResponse {
    tx: ResponseSender,
    /// Peer expected to answer; `None` on a worker (answers come upstream)
    target: Option<PeerId>,
}

struct PeerLink {
    transport: Arc<dyn Transport>,
    generation: u64,
    /// Upper bound on the scopes this peer's calls may carry
    granted: ScopeSet,
}

#[derive(Default)]
struct BusState {
    events: TopicTable<EventFn>,
    requests: TopicTable<dyn RequestHandler>,
    subscribers: TopicTable<SubscriberFn>,
    pending: HashMap<(String, CorrelationId), PendingResponse>,
    peers: HashMap<PeerId, PeerLink>,
}

struct BusInner {
    role: Role,
    state: Mutex<BusState>,
    next_correlation_id: AtomicU64,
    next_generation: AtomicU64,
    closed: watch::Sender<bool>,
}

/// Where a request goes once routing has been decided
enum Dispatch {
    Done(Result<Value, BusError>),
    Local(RequestHandlerRef, BusRequest),
    Awaiting(ResponseReceiver),
}

/// Handle to this process's bus
///
/// Cheap to clone; all clones share one set of listener tables.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.inner.role {
            Role::Coordinator => "coordinator",
            Role::Worker { .. } => "worker",
        };
        f.debug_struct("MessageBus").field("role", &role).finish()
    }
}

fn validate(topic: &str, scope: &AccessScope) -> Result<(), BusError> {
    if topic.trim().is_empty() {
        return Err(BusError::validation("topic must be a non-empty string"));
    }
    scope.validate()
}

async fn finish(dispatch: Dispatch) -> Result<Value, BusError> {
    match dispatch {
        Dispatch::Done(result) => result,
        Dispatch::Local(handler, request) => invoke(handler, request).await,
        Dispatch::Awaiting(rx) => rx
            .await
            .unwrap_or_else(|_| Err(BusError::transport("link closed before response"))),
    }
}

async fn invoke(handler: RequestHandlerRef, request: BusRequest) -> Result<Value, BusError> {
    let topic = request.topic.clone();
    handler
        .handle(request)
        .await
        .map_err(|e| BusError::from_handler(&topic, e))
}

impl MessageBus {
    fn with_role(role: Role) -> Self {
        let seed = rand::thread_rng().gen_range(1..CORRELATION_ID_CEILING);
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(BusInner {
                role,
                state: Mutex::new(BusState::default()),
                next_correlation_id: AtomicU64::new(seed),
                next_generation: AtomicU64::new(1),
                closed,
            }),
        }
    }

    /// Create the coordinator bus
    pub fn coordinator() -> Self {
        Self::with_role(Role::Coordinator)
    }

    /// Create a worker bus linked to the coordinator
    ///
    /// Must be called inside a tokio runtime; a task pumps `inbound` for the
    /// life of the link.
    pub fn worker<T: Transport>(upstream: T, inbound: Inbound) -> Self {
        let bus = Self::with_role(Role::Worker {
            upstream: Arc::new(upstream),
        });
        tokio::spawn(Self::pump_upstream(Arc::downgrade(&bus.inner), inbound));
        bus
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self.inner.role, Role::Coordinator)
    }

    fn next_correlation_id(&self) -> CorrelationId {
        let advance = |id: u64| {
            Some(if id + 1 >= CORRELATION_ID_CEILING {
                1
            } else {
                id + 1
            })
        };
        match self
            .inner
            .next_correlation_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, advance)
        {
            Ok(id) | Err(id) => id,
        }
    }

    // ---- events ----

    /// Publish an event; best effort, never waits on listeners
    pub async fn send_event(
        &self,
        topic: &str,
        metadata: AccessScope,
        params: Vec<Value>,
    ) -> Result<(), BusError> {
        validate(topic, &metadata)?;
        self.deliver_event(BusEvent {
            topic: topic.to_string(),
            metadata,
            params,
            origin: Origin::Local,
        })
        .await
    }

    async fn deliver_event(&self, event: BusEvent) -> Result<(), BusError> {
        let (locals, peers) = {
            let state = self.inner.state.lock().await;
            let locals = state.events.local_matching(&event.topic, &event.metadata);
            let peers: Vec<(PeerId, Arc<dyn Transport>)> = match self.inner.role {
                Role::Coordinator => state
                    .events
                    .peers_matching(&event.topic, &event.metadata)
                    .into_iter()
                    .filter(|peer| !matches!(&event.origin, Origin::Peer(from) if from == peer))
                    .filter_map(|peer| {
                        let transport = state.peers.get(&peer)?.transport.clone();
                        Some((peer, transport))
                    })
                    .collect(),
                Role::Worker { .. } => Vec::new(),
            };
            (locals, peers)
        };

        for callback in locals {
            callback(&event);
        }

        if !peers.is_empty() {
            let envelope = Envelope::event(&event.topic, event.metadata.clone(), event.params.clone());
            for (peer, transport) in peers {
                if let Err(e) = transport.send(envelope.clone()) {
                    debug!("Event {} not delivered to {}: {}", event.topic, peer, e);
                }
            }
        }

        if let (Role::Worker { upstream }, Origin::Local) = (&self.inner.role, &event.origin) {
            upstream.send(Envelope::event(&event.topic, event.metadata, event.params))?;
        }
        Ok(())
    }

    pub async fn add_event_listener(
        &self,
        topic: &str,
        filter: AccessScope,
        callback: EventCallback,
    ) -> Result<(), BusError> {
        validate(topic, &filter)?;
        let listeners = {
            let mut state = self.inner.state.lock().await;
            state.events.add(topic, Endpoint::Local(callback), filter.clone());
            state.events.ref_count(topic)
        };
        match &self.inner.role {
            Role::Coordinator => {
                self.notify_subscribers(SubscriberChange {
                    topic: topic.to_string(),
                    kind: ChangeKind::Added,
                    filter,
                    listeners,
                })
                .await;
                Ok(())
            }
            Role::Worker { upstream } => upstream.send(Envelope::registration(
                EnvelopeType::AddEventListener,
                topic,
                filter,
            )),
        }
    }

    /// Drop one reference to a listener; rejects if it was never added
    pub async fn remove_event_listener(
        &self,
        topic: &str,
        filter: AccessScope,
        callback: &EventCallback,
    ) -> Result<(), BusError> {
        validate(topic, &filter)?;
        let removed = {
            let mut state = self.inner.state.lock().await;
            state
                .events
                .remove(topic, &Endpoint::Local(callback.clone()), &filter)
                .map(|_| state.events.ref_count(topic))
        };
        let Some(listeners) = removed else {
            warn!("Event listener on {} removed more times than it was added", topic);
            return Err(BusError::NotRegistered {
                topic: topic.to_string(),
            });
        };
        match &self.inner.role {
            Role::Coordinator => {
                self.notify_subscribers(SubscriberChange {
                    topic: topic.to_string(),
                    kind: ChangeKind::Removed,
                    filter,
                    listeners,
                })
                .await;
                Ok(())
            }
            Role::Worker { upstream } => upstream.send(Envelope::registration(
                EnvelopeType::RemoveEventListener,
                topic,
                filter,
            )),
        }
    }

    /// References held on `topic`; on the coordinator this counts workers too
    pub async fn event_listener_count(&self, topic: &str) -> usize {
        self.inner.state.lock().await.events.ref_count(topic)
    }

    // ---- subscriber meta-channel ----

    /// Watch listener additions and removals on `topic` across the system
    pub async fn add_event_subscriber_listener(
        &self,
        topic: &str,
        callback: SubscriberCallback,
    ) -> Result<(), BusError> {
        validate(topic, &AccessScope::unrestricted())?;
        self.inner.state.lock().await.subscribers.add(
            topic,
            Endpoint::Local(callback),
            AccessScope::unrestricted(),
        );
        if let Role::Worker { upstream } = &self.inner.role {
            upstream.send(Envelope::subscriber_registration(
                EnvelopeType::AddEventSubscriberListener,
                topic,
            ))?;
        }
        Ok(())
    }

    pub async fn remove_event_subscriber_listener(
        &self,
        topic: &str,
        callback: &SubscriberCallback,
    ) -> Result<(), BusError> {
        validate(topic, &AccessScope::unrestricted())?;
        let removed = self.inner.state.lock().await.subscribers.remove(
            topic,
            &Endpoint::Local(callback.clone()),
            &AccessScope::unrestricted(),
        );
        if removed.is_none() {
            warn!("Subscriber listener on {} removed more times than it was added", topic);
            return Err(BusError::NotRegistered {
                topic: topic.to_string(),
            });
        }
        if let Role::Worker { upstream } = &self.inner.role {
            upstream.send(Envelope::subscriber_registration(
                EnvelopeType::RemoveEventSubscriberListener,
                topic,
            ))?;
        }
        Ok(())
    }

    async fn notify_subscribers(&self, change: SubscriberChange) {
        let (locals, peers) = {
            let state = self.inner.state.lock().await;
            let peers: Vec<(PeerId, Arc<dyn Transport>)> = state
                .subscribers
                .peers(&change.topic)
                .into_iter()
                .filter_map(|peer| {
                    let transport = state.peers.get(&peer)?.transport.clone();
                    Some((peer, transport))
                })
                .collect();
            (state.subscribers.locals(&change.topic), peers)
        };
        for callback in locals {
            callback(&change);
        }
        if !peers.is_empty() {
            let envelope = Envelope::subscriber_changed(&change);
            for (peer, transport) in peers {
                if let Err(e) = transport.send(envelope.clone()) {
                    debug!("Subscriber change on {} not delivered to {}: {}", change.topic, peer, e);
                }
            }
        }
    }

    // ---- requests ----

    pub async fn add_request_listener(
        &self,
        topic: &str,
        filter: AccessScope,
        handler: RequestHandlerRef,
    ) -> Result<(), BusError> {
        validate(topic, &filter)?;
        self.inner
            .state
            .lock()
            .await
            .requests
            .add(topic, Endpoint::Local(handler), filter.clone());
        if let Role::Worker { upstream } = &self.inner.role {
            upstream.send(Envelope::registration(
                EnvelopeType::AddRequestListener,
                topic,
                filter,
            ))?;
        }
        Ok(())
    }

    pub async fn remove_request_listener(
        &self,
        topic: &str,
        filter: AccessScope,
        handler: &RequestHandlerRef,
    ) -> Result<(), BusError> {
        validate(topic, &filter)?;
        let removed = self.inner.state.lock().await.requests.remove(
            topic,
            &Endpoint::Local(handler.clone()),
            &filter,
        );
        if removed.is_none() {
            warn!("Request listener on {} removed more times than it was added", topic);
            return Err(BusError::NotRegistered {
                topic: topic.to_string(),
            });
        }
        if let Role::Worker { upstream } = &self.inner.role {
            upstream.send(Envelope::registration(
                EnvelopeType::RemoveRequestListener,
                topic,
                filter,
            ))?;
        }
        Ok(())
    }

    /// Call the handler registered on `topic`
    ///
    /// Fails at once with `NoListener` when nothing handles the topic and
    /// with `Permissions` when no handler admits the caller. There is no
    /// timeout: a handler that never answers leaves the call pending.
    pub async fn send_request(
        &self,
        topic: &str,
        metadata: AccessScope,
        params: Vec<Value>,
    ) -> Result<Value, BusError> {
        validate(topic, &metadata)?;
        let request = BusRequest {
            topic: topic.to_string(),
            metadata,
            params,
            origin: Origin::Local,
        };
        let dispatch = match &self.inner.role {
            Role::Coordinator => self.dispatch_request(request).await,
            Role::Worker { upstream } => {
                let upstream = upstream.clone();
                self.dispatch_upstream(upstream, request).await
            }
        };
        finish(dispatch).await
    }

    /// Coordinator routing: first registration whose filter admits the caller
    async fn dispatch_request(&self, request: BusRequest) -> Dispatch {
        let mut state = self.inner.state.lock().await;
        let lookup = state
            .requests
            .first_authorized(&request.topic, &request.metadata);
        match lookup {
            Lookup::Empty => Dispatch::Done(Err(BusError::NoListener {
                topic: request.topic,
            })),
            Lookup::Denied => {
                debug!("Request on {} denied for {:?}", request.topic, request.metadata);
                Dispatch::Done(Err(BusError::Permissions {
                    topic: request.topic,
                }))
            }
            Lookup::Found(Endpoint::Local(handler)) => Dispatch::Local(handler, request),
            Lookup::Found(Endpoint::Peer(peer)) => {
                let Some(transport) = state.peers.get(&peer).map(|link| link.transport.clone())
                else {
                    return Dispatch::Done(Err(BusError::transport(format!(
                        "peer {} is not attached",
                        peer
                    ))));
                };
                let correlation_id = self.next_correlation_id();
                let key = (request.topic.clone(), correlation_id);
                let (tx, rx) = oneshot::channel();
                state.pending.insert(
                    key.clone(),
                    PendingResponse {
                        tx,
                        target: Some(peer.clone()),
                    },
                );
                let envelope = Envelope::request(
                    &request.topic,
                    correlation_id,
                    request.metadata,
                    request.params,
                );
                if let Err(e) = transport.send(envelope) {
                    state.pending.remove(&key);
                    return Dispatch::Done(Err(e));
                }
                debug!("Routed {} #{} to {}", key.0, correlation_id, peer);
                Dispatch::Awaiting(rx)
            }
        }
    }

    /// Worker routing: a local handler that admits the caller, else upstream
    async fn dispatch_upstream(
        &self,
        upstream: Arc<dyn Transport>,
        request: BusRequest,
    ) -> Dispatch {
        let mut state = self.inner.state.lock().await;
        let lookup = state
            .requests
            .first_authorized(&request.topic, &request.metadata);
        if let Lookup::Found(Endpoint::Local(handler)) = lookup {
            return Dispatch::Local(handler, request);
        }
        if *self.inner.closed.borrow() {
            return Dispatch::Done(Err(BusError::transport("upstream closed")));
        }

        let correlation_id = self.next_correlation_id();
        let key = (request.topic.clone(), correlation_id);
        let (tx, rx) = oneshot::channel();
        state
            .pending
            .insert(key.clone(), PendingResponse { tx, target: None });
        let envelope = Envelope::request(
            &request.topic,
            correlation_id,
            request.metadata,
            request.params,
        );
        if let Err(e) = upstream.send(envelope) {
            state.pending.remove(&key);
            return Dispatch::Done(Err(e));
        }
        Dispatch::Awaiting(rx)
    }

    async fn resolve_pending(&self, envelope: Envelope, from: Option<&PeerId>) {
        let Some(correlation_id) = envelope.correlation_id else {
            warn!("Response on {} without correlation id", envelope.topic);
            return;
        };
        let key = (envelope.topic.clone(), correlation_id);
        let pending = {
            let mut state = self.inner.state.lock().await;
            match state.pending.get(&key) {
                Some(p) if p.target.as_ref() == from => state.pending.remove(&key),
                _ => None,
            }
        };
        match pending {
            Some(pending) => {
                let _ = pending.tx.send(envelope.into_result());
            }
            None => debug!(
                "Dropping response {} #{} with no pending request",
                key.0, correlation_id
            ),
        }
    }

    // ---- peers (coordinator) ----

    /// Attach a worker link
    ///
    /// Calls arriving on the link keep only the scopes in `granted`.
    /// Re-attaching an id first detaches the previous link.
    pub async fn attach_peer<T: Transport>(
        &self,
        peer: impl Into<PeerId>,
        granted: ScopeSet,
        transport: T,
        inbound: Inbound,
    ) -> Result<PeerDrained, BusError> {
        if !self.is_coordinator() {
            return Err(BusError::validation("only the coordinator accepts peers"));
        }
        let peer = peer.into();
        if peer.is_empty() {
            return Err(BusError::validation("peer id must be non-empty"));
        }
        self.detach(&peer, None).await;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        self.inner.state.lock().await.peers.insert(
            peer.clone(),
            PeerLink {
                transport: Arc::new(transport),
                generation,
                granted,
            },
        );
        let (drained_tx, drained_rx) = oneshot::channel();
        tokio::spawn(Self::pump_peer(
            Arc::downgrade(&self.inner),
            peer.clone(),
            generation,
            inbound,
            drained_tx,
        ));
        debug!("Attached bus peer {}", peer);
        Ok(drained_rx)
    }

    /// Drop a worker link with everything it registered
    ///
    /// Requests waiting on that worker fail with a transport error.
    pub async fn detach_peer(&self, peer: &str) -> bool {
        self.detach(peer, None).await
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.inner.state.lock().await.peers.keys().cloned().collect();
        peers.sort();
        peers
    }

    async fn detach(&self, peer: &str, generation: Option<u64>) -> bool {
        let (changes, rejected) = {
            let mut state = self.inner.state.lock().await;
            match state.peers.get(peer) {
                Some(link) if generation.map_or(true, |g| g == link.generation) => {}
                _ => return false,
            }
            state.peers.remove(peer);
            let dropped = state.events.drop_peer(peer);
            state.requests.drop_peer(peer);
            state.subscribers.drop_peer(peer);

            let keys: Vec<(String, CorrelationId)> = state
                .pending
                .iter()
                .filter(|(_, p)| p.target.as_deref() == Some(peer))
                .map(|(key, _)| key.clone())
                .collect();
            let rejected: Vec<PendingResponse> =
                keys.iter().filter_map(|key| state.pending.remove(key)).collect();

            let changes: Vec<SubscriberChange> = dropped
                .into_iter()
                .map(|(topic, filter)| {
                    let listeners = state.events.ref_count(&topic);
                    SubscriberChange {
                        topic,
                        kind: ChangeKind::Removed,
                        filter,
                        listeners,
                    }
                })
                .collect();
            (changes, rejected)
        };

        for pending in rejected {
            let _ = pending
                .tx
                .send(Err(BusError::transport(format!("peer {} detached", peer))));
        }
        for change in changes {
            self.notify_subscribers(change).await;
        }
        info!("Detached bus peer {}", peer);
        true
    }

    async fn pump_peer(
        weak: Weak<BusInner>,
        peer: PeerId,
        generation: u64,
        mut inbound: Inbound,
        drained: oneshot::Sender<()>,
    ) {
        while let Some(envelope) = inbound.recv().await {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            MessageBus { inner }
                .handle_from_peer(&peer, generation, envelope)
                .await;
        }
        if let Some(inner) = weak.upgrade() {
            MessageBus { inner }.detach(&peer, Some(generation)).await;
        }
        let _ = drained.send(());
    }

    async fn handle_from_peer(&self, peer: &PeerId, generation: u64, envelope: Envelope) {
        let granted = {
            let state = self.inner.state.lock().await;
            match state.peers.get(peer) {
                Some(link) if link.generation == generation => link.granted.clone(),
                _ => {
                    debug!("Ignoring {:?} from stale link {}", envelope.kind, peer);
                    return;
                }
            }
        };

        let kind = envelope.kind;
        match kind {
            EnvelopeType::Event => {
                let event = BusEvent {
                    topic: envelope.topic,
                    metadata: envelope.metadata.unwrap_or_default().confine(&granted),
                    params: envelope.params,
                    origin: Origin::Peer(peer.clone()),
                };
                if let Err(e) = self.deliver_event(event).await {
                    debug!("Event from {} not delivered: {}", peer, e);
                }
            }
            EnvelopeType::Request => {
                let Some(correlation_id) = envelope.correlation_id else {
                    warn!("Request on {} from {} without correlation id", envelope.topic, peer);
                    return;
                };
                let topic = envelope.topic.clone();
                let metadata = envelope.metadata.unwrap_or_default().confine(&granted);
                let dispatch = match validate(&topic, &metadata) {
                    Err(e) => Dispatch::Done(Err(e)),
                    Ok(()) => {
                        self.dispatch_request(BusRequest {
                            topic: envelope.topic,
                            metadata,
                            params: envelope.params,
                            origin: Origin::Peer(peer.clone()),
                        })
                        .await
                    }
                };
                let bus = self.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    let result = finish(dispatch).await.map_err(BusError::for_wire);
                    bus.reply_to_peer(&peer, Envelope::response(&topic, correlation_id, result))
                        .await;
                });
            }
            EnvelopeType::Response => self.resolve_pending(envelope, Some(peer)).await,
            EnvelopeType::AddEventListener => {
                let filter = envelope.metadata.unwrap_or_default();
                let listeners = {
                    let mut state = self.inner.state.lock().await;
                    state.events.add(
                        &envelope.topic,
                        Endpoint::Peer(peer.clone()),
                        filter.clone(),
                    );
                    state.events.ref_count(&envelope.topic)
                };
                self.notify_subscribers(SubscriberChange {
                    topic: envelope.topic,
                    kind: ChangeKind::Added,
                    filter,
                    listeners,
                })
                .await;
            }
            EnvelopeType::RemoveEventListener => {
                let filter = envelope.metadata.unwrap_or_default();
                let removed = {
                    let mut state = self.inner.state.lock().await;
                    state
                        .events
                        .remove(&envelope.topic, &Endpoint::Peer(peer.clone()), &filter)
                        .map(|_| state.events.ref_count(&envelope.topic))
                };
                match removed {
                    Some(listeners) => {
                        self.notify_subscribers(SubscriberChange {
                            topic: envelope.topic,
                            kind: ChangeKind::Removed,
                            filter,
                            listeners,
                        })
                        .await
                    }
                    None => warn!(
                        "{} removed an event listener on {} below zero",
                        peer, envelope.topic
                    ),
                }
            }
            EnvelopeType::AddRequestListener => {
                let filter = envelope.metadata.unwrap_or_default();
                self.inner.state.lock().await.requests.add(
                    &envelope.topic,
                    Endpoint::Peer(peer.clone()),
                    filter,
                );
            }
            EnvelopeType::RemoveRequestListener => {
                let filter = envelope.metadata.unwrap_or_default();
                let removed = self.inner.state.lock().await.requests.remove(
                    &envelope.topic,
                    &Endpoint::Peer(peer.clone()),
                    &filter,
                );
                if removed.is_none() {
                    warn!(
                        "{} removed a request listener on {} below zero",
                        peer, envelope.topic
                    );
                }
            }
            EnvelopeType::AddEventSubscriberListener => {
                self.inner.state.lock().await.subscribers.add(
                    &envelope.topic,
                    Endpoint::Peer(peer.clone()),
                    AccessScope::unrestricted(),
                );
            }
            EnvelopeType::RemoveEventSubscriberListener => {
                let removed = self.inner.state.lock().await.subscribers.remove(
                    &envelope.topic,
                    &Endpoint::Peer(peer.clone()),
                    &AccessScope::unrestricted(),
                );
                if removed.is_none() {
                    warn!(
                        "{} removed a subscriber listener on {} below zero",
                        peer, envelope.topic
                    );
                }
            }
            EnvelopeType::EventSubscriberChanged => {
                warn!("Ignoring subscriber notification sent by worker {}", peer);
            }
        }
    }

    async fn reply_to_peer(&self, peer: &str, envelope: Envelope) {
        let transport = self
            .inner
            .state
            .lock()
            .await
            .peers
            .get(peer)
            .map(|link| link.transport.clone());
        match transport {
            Some(transport) => {
                if let Err(e) = transport.send(envelope) {
                    debug!("Response to {} lost: {}", peer, e);
                }
            }
            None => debug!("Response to {} lost: peer detached", peer),
        }
    }

    // ---- upstream (worker) ----

    async fn pump_upstream(weak: Weak<BusInner>, mut inbound: Inbound) {
        while let Some(envelope) = inbound.recv().await {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            MessageBus { inner }.handle_from_upstream(envelope).await;
        }
        if let Some(inner) = weak.upgrade() {
            MessageBus { inner }.upstream_closed().await;
        }
    }

    async fn handle_from_upstream(&self, envelope: Envelope) {
        let Role::Worker { upstream } = &self.inner.role else {
            return;
        };

        let kind = envelope.kind;
        match kind {
            EnvelopeType::Event => {
                let event = BusEvent {
                    topic: envelope.topic,
                    metadata: envelope.metadata.unwrap_or_default(),
                    params: envelope.params,
                    origin: Origin::Upstream,
                };
                let _ = self.deliver_event(event).await;
            }
            EnvelopeType::Request => {
                let Some(correlation_id) = envelope.correlation_id else {
                    warn!("Request on {} without correlation id", envelope.topic);
                    return;
                };
                let request = BusRequest {
                    topic: envelope.topic,
                    metadata: envelope.metadata.unwrap_or_default(),
                    params: envelope.params,
                    origin: Origin::Upstream,
                };
                let lookup = self
                    .inner
                    .state
                    .lock()
                    .await
                    .requests
                    .first_authorized(&request.topic, &request.metadata);
                let upstream = upstream.clone();
                tokio::spawn(async move {
                    let topic = request.topic.clone();
                    let result = match lookup {
                        Lookup::Found(Endpoint::Local(handler)) => invoke(handler, request).await,
                        Lookup::Found(Endpoint::Peer(_)) | Lookup::Denied => {
                            Err(BusError::Permissions {
                                topic: topic.clone(),
                            })
                        }
                        Lookup::Empty => Err(BusError::NoListener {
                            topic: topic.clone(),
                        }),
                    };
                    let response =
                        Envelope::response(&topic, correlation_id, result.map_err(BusError::for_wire));
                    if let Err(e) = upstream.send(response) {
                        debug!("Response on {} lost: {}", topic, e);
                    }
                });
            }
            EnvelopeType::Response => self.resolve_pending(envelope, None).await,
            EnvelopeType::EventSubscriberChanged => {
                let Some(change) = envelope.to_subscriber_change() else {
                    warn!("Malformed subscriber notification on {}", envelope.topic);
                    return;
                };
                let locals = self.inner.state.lock().await.subscribers.locals(&change.topic);
                for callback in locals {
                    callback(&change);
                }
            }
            other => warn!("Ignoring {:?} on {} from coordinator", other, envelope.topic),
        }
    }

    async fn upstream_closed(&self) {
        self.inner.closed.send_replace(true);
        let pending: Vec<PendingResponse> = {
            let mut state = self.inner.state.lock().await;
            state.pending.drain().map(|(_, p)| p).collect()
        };
        for p in pending {
            let _ = p.tx.send(Err(BusError::transport("upstream closed")));
        }
        info!("Bus upstream closed");
    }

    /// Resolves once a worker's link to the coordinator is gone
    ///
    /// Never resolves on the coordinator.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::bus::listeners::{event_listener, request_handler};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_correlation_ids_wrap_below_ceiling() {
        let bus = MessageBus::coordinator();
        bus.inner
            .next_correlation_id
            .store(CORRELATION_ID_CEILING - 1, Ordering::Relaxed);
        assert_eq!(bus.next_correlation_id(), CORRELATION_ID_CEILING - 1);
        assert_eq!(bus.next_correlation_id(), 1);
        assert_eq!(bus.next_correlation_id(), 2);
    }

    #[test]
    fn test_correlation_seed_is_in_range() {
        for _ in 0..32 {
            let bus = MessageBus::coordinator();
            let id = bus.next_correlation_id();
            assert!(id >= 1 && id < CORRELATION_ID_CEILING);
        }
    }

    #[tokio::test]
    async fn test_empty_topic_is_rejected() {
        let bus = MessageBus::coordinator();
        let result = bus
            .send_event("  ", AccessScope::unrestricted(), vec![])
            .await;
        assert!(matches!(result, Err(BusError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_local_event_and_request() {
        let bus = MessageBus::coordinator();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        bus.add_event_listener(
            "tick",
            AccessScope::unrestricted(),
            event_listener(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
        bus.send_event("tick", AccessScope::unrestricted(), vec![])
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        bus.add_request_listener(
            "echo",
            AccessScope::unrestricted(),
            request_handler(|req| async move { Ok(json!(req.params)) }),
        )
        .await
        .unwrap();
        let value = bus
            .send_request("echo", AccessScope::unrestricted(), vec![json!("hi")])
            .await
            .unwrap();
        assert_eq!(value, json!(["hi"]));
    }

    #[tokio::test]
    async fn test_worker_rejects_peers() {
        let ((upstream, inbound), _coordinator_side) = crate::module::bus::memory_pair();
        let worker = MessageBus::worker(upstream, inbound);
        let ((t, _), (_, inbound)) = crate::module::bus::memory_pair();
        assert!(worker
            .attach_peer("w", ScopeSet::new(), t, inbound)
            .await
            .is_err());
    }
}
