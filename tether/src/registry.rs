//! Process-wide instance registry. Maps every marshal-by-reference object to
//! a stable identifier, tracks which peers hold references through per-entry
//! bit vectors, and materialises proxies for identifiers owned elsewhere.
//!
//! The registry is shared across every connection of the process. A process
//! that is simultaneously client to one peer and server to another must see
//! a single table, otherwise an object cannot round-trip through it.

use crate::error::{RemotingError, RemotingResult};
use crate::ident::{IdentifierSource, ObjectId};
use crate::lock;
use crate::logging::{self, Logger};
use crate::object::{MethodId, RemoteObject, RemoteRef};
use crate::proxy::{CallRouter, ProxyFactory};
use crate::value::DelegateRef;
use hashbrown::HashMap;
use indexmap::IndexMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, Weak};

/// Peer references are tracked in a 64-bit vector; a process talking to more
/// peers than that is refused.
pub const MAX_PEERS: usize = 64;

/// Outcome of a registration: the canonical identity plus what the peer
/// already knows about it.
#[derive(Debug)]
pub struct RegisteredRef {
    pub id: ObjectId,
    pub type_name: String,
    pub interfaces: Vec<String>,
    /// True when the destination peer had not been told about this object yet.
    pub first_for_peer: bool,
    /// True when the destination peer is the one the object originated from;
    /// such references are always written as plain remote references.
    pub back_to_origin: bool,
}

struct SlotState {
    /// Held while the object is in use by remoting (local entries only).
    strong: Option<RemoteRef>,
    /// Tracks the object once remoting no longer pins it; local callers keep
    /// proxies alive through this slot.
    weak: Weak<dyn RemoteObject>,
    /// Bit *i* set iff peer *i* has been told about this object.
    reference_bits: u64,
}

struct InstanceEntry {
    id: ObjectId,
    type_name: String,
    interfaces: Vec<String>,
    is_local: bool,
    /// Registry instance that created the entry.
    #[allow(dead_code)]
    owner: u32,
    /// Peer the proxy was materialised from (remote entries only).
    origin: Option<String>,
    state: Mutex<SlotState>,
}

impl InstanceEntry {
    /// The live object behind the slot, if any.
    fn live(&self) -> Option<RemoteRef> {
        let state = lock(&self.state);
        state.strong.clone().or_else(|| state.weak.upgrade())
    }

    fn matches_ptr(&self, key: usize) -> bool {
        match self.live() {
            Some(obj) => ptr_key(&obj) == key,
            None => false,
        }
    }
}

#[inline]
fn ptr_key(obj: &RemoteRef) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

pub struct InstanceRegistry {
    ids: IdentifierSource,
    owner: u32,
    factory: Arc<ProxyFactory>,
    /// Global identifier → entry map.
    entries: Mutex<HashMap<String, Arc<InstanceEntry>>>,
    /// Reverse object → identifier map, keyed by the object address. Guarded
    /// by its own monitor; taken before `entries` when both are needed.
    reverse: Mutex<HashMap<usize, ObjectId>>,
    /// Peer identifier → bit index. Insertion order is the index.
    peers: Mutex<IndexMap<String, usize>>,
    /// Process prefix → router able to reach the owning process.
    routes: Mutex<HashMap<String, Arc<dyn CallRouter>>>,
    log: Logger,
}

impl InstanceRegistry {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        factory: Arc<ProxyFactory>,
        log: L,
    ) -> InstanceRegistry {
        let ids = IdentifierSource::new();
        let log = match log.into() {
            Some(log) => log.new(logging::o!("prefix" => ids.prefix().to_string())),
            None => logging::discard(),
        };

        InstanceRegistry {
            owner: ids.sequence(),
            ids,
            factory,
            entries: Mutex::new(HashMap::new()),
            reverse: Mutex::new(HashMap::new()),
            peers: Mutex::new(IndexMap::new()),
            routes: Mutex::new(HashMap::new()),
            log,
        }
    }

    /// The process identifier owned by this registry.
    #[inline]
    pub fn own_prefix(&self) -> &str {
        self.ids.prefix()
    }

    #[inline]
    pub fn is_local(&self, id: &ObjectId) -> bool {
        id.prefix() == self.ids.prefix()
    }

    #[inline]
    pub fn proxy_factory(&self) -> &Arc<ProxyFactory> {
        &self.factory
    }

    /// Bit index assigned to the peer, allocating one on first contact.
    pub fn peer_index(&self, peer: &str) -> RemotingResult<usize> {
        let mut peers = lock(&self.peers);

        if let Some(&index) = peers.get(peer) {
            return Ok(index);
        }

        if peers.len() >= MAX_PEERS {
            logging::error!(self.log, "peer table full, refusing peer";
                            "peer" => peer,
                            "max_peers" => MAX_PEERS);
            return Err(RemotingError::TooManyPeers);
        }

        let index = peers.len();
        peers.insert(peer.to_string(), index);
        Ok(index)
    }

    fn known_peer_index(&self, peer: &str) -> Option<usize> {
        lock(&self.peers).get(peer).copied()
    }

    /// Register a local object, minting an identifier on first sight. When
    /// `sent_to` names a peer, its reference bit is set. Registering an
    /// already-known object (including a proxy) is idempotent and returns
    /// the existing identity.
    pub fn register(
        &self,
        obj: &RemoteRef,
        sent_to: Option<&str>,
    ) -> RemotingResult<RegisteredRef> {
        let mut reverse = lock(&self.reverse);
        let key = ptr_key(obj);

        let known = match reverse.get(&key).cloned() {
            Some(id) => {
                let entry = lock(&self.entries).get(id.as_str()).cloned();
                match entry {
                    // Guard against a recycled address pointing at a stale slot.
                    Some(entry) if entry.matches_ptr(key) => Some(entry),
                    _ => {
                        reverse.remove(&key);
                        None
                    }
                }
            }
            None => None,
        };

        let entry = match known {
            Some(entry) => entry,
            None => {
                let id = self.ids.next();
                let entry = Arc::new(InstanceEntry {
                    id: id.clone(),
                    type_name: obj.type_name().to_string(),
                    interfaces: obj.interface_names(),
                    is_local: true,
                    owner: self.owner,
                    origin: None,
                    state: Mutex::new(SlotState {
                        strong: Some(obj.clone()),
                        weak: Arc::downgrade(obj),
                        reference_bits: 0,
                    }),
                });

                lock(&self.entries).insert(id.as_str().to_string(), entry.clone());
                reverse.insert(key, id);
                entry
            }
        };

        self.finish_registration(&entry, obj, sent_to)
    }

    /// Register under a caller-supplied identifier (delegate targets, shared
    /// statics). Registration is add-or-update: a live object already under
    /// the id wins and the incoming instance is discarded, unless `strict`
    /// was requested; a released slot is revived by installing the incoming
    /// instance as the new strong reference.
    pub fn register_with_id(
        &self,
        id: ObjectId,
        obj: &RemoteRef,
        sent_to: Option<&str>,
        strict: bool,
    ) -> RemotingResult<RegisteredRef> {
        let mut reverse = lock(&self.reverse);
        let key = ptr_key(obj);
        let is_local = self.is_local(&id);

        let entry = {
            let mut entries = lock(&self.entries);
            match entries.get(id.as_str()) {
                Some(existing) => existing.clone(),
                None => {
                    let entry = Arc::new(InstanceEntry {
                        id: id.clone(),
                        type_name: obj.type_name().to_string(),
                        interfaces: obj.interface_names(),
                        is_local,
                        owner: self.owner,
                        origin: None,
                        state: Mutex::new(SlotState {
                            strong: match is_local {
                                true => Some(obj.clone()),
                                false => None,
                            },
                            weak: Arc::downgrade(obj),
                            reference_bits: 0,
                        }),
                    });
                    entries.insert(id.as_str().to_string(), entry.clone());
                    entry
                }
            }
        };

        let canonical = {
            let mut state = lock(&entry.state);
            let live = state.strong.clone().or_else(|| state.weak.upgrade());
            match live {
                Some(winner) => {
                    if !Arc::ptr_eq(&winner, obj) && strict {
                        return Err(RemotingError::DuplicateRegistration(id));
                    }
                    Arc::ptr_eq(&winner, obj)
                }
                None => {
                    state.strong = match entry.is_local {
                        true => Some(obj.clone()),
                        false => None,
                    };
                    state.weak = Arc::downgrade(obj);
                    true
                }
            }
        };

        if canonical {
            reverse.insert(key, entry.id.clone());
        }

        self.finish_registration(&entry, obj, sent_to)
    }

    fn finish_registration(
        &self,
        entry: &Arc<InstanceEntry>,
        obj: &RemoteRef,
        sent_to: Option<&str>,
    ) -> RemotingResult<RegisteredRef> {
        let mut first_for_peer = false;
        let mut back_to_origin = false;

        {
            let mut state = lock(&entry.state);

            if entry.is_local && state.strong.is_none() {
                match state.weak.upgrade() {
                    Some(live) => state.strong = Some(live),
                    None => {
                        // Released slot: revive it with the incoming instance.
                        state.strong = Some(obj.clone());
                        state.weak = Arc::downgrade(obj);
                    }
                }
            }

            if let Some(peer) = sent_to {
                let bit = 1u64 << self.peer_index(peer)?;
                first_for_peer = state.reference_bits & bit == 0;
                state.reference_bits |= bit;
                back_to_origin = entry.origin.as_deref() == Some(peer);
            }
        }

        Ok(RegisteredRef {
            id: entry.id.clone(),
            type_name: entry.type_name.clone(),
            interfaces: entry.interfaces.clone(),
            first_for_peer,
            back_to_origin,
        })
    }

    /// Register a delegate target under its deterministic identifier. The
    /// same method and receiver always map to the same id, so remote add and
    /// remove of handlers match up.
    pub fn register_delegate(
        &self,
        delegate: &DelegateRef,
        sent_to: Option<&str>,
    ) -> RemotingResult<ObjectId> {
        if let Some(id) = delegate.target_id() {
            if self.is_local(id) {
                self.register_with_id(id.clone(), delegate.target(), sent_to, false)?;
            }
            return Ok(id.clone());
        }

        let id = self.ids.delegate(delegate_token(delegate.method(), delegate.target()));
        self.register_with_id(id.clone(), delegate.target(), sent_to, false)?;
        Ok(id)
    }

    /// Resolve an identifier to its object. A local entry whose strong slot
    /// was dropped but whose object is still alive is resurrected.
    pub fn try_get(&self, id: &ObjectId) -> Option<RemoteRef> {
        let entry = lock(&self.entries).get(id.as_str()).cloned()?;
        let mut state = lock(&entry.state);

        if let Some(obj) = state.strong.clone() {
            return Some(obj);
        }

        match state.weak.upgrade() {
            Some(obj) => {
                if entry.is_local {
                    state.strong = Some(obj.clone());
                }
                Some(obj)
            }
            None => None,
        }
    }

    /// Reverse lookup. Falls back to a linear scan when the reverse slot has
    /// been dropped, which keeps registration idempotent across sweeps.
    pub fn try_get_id(&self, obj: &RemoteRef) -> Option<(ObjectId, String)> {
        let key = ptr_key(obj);

        if let Some(id) = lock(&self.reverse).get(&key).cloned() {
            if let Some(entry) = lock(&self.entries).get(id.as_str()).cloned() {
                if entry.matches_ptr(key) {
                    return Some((entry.id.clone(), entry.type_name.clone()));
                }
            }
        }

        let entries: Vec<_> = lock(&self.entries).values().cloned().collect();
        for entry in entries {
            if entry.matches_ptr(key) {
                lock(&self.reverse).insert(key, entry.id.clone());
                return Some((entry.id.clone(), entry.type_name.clone()));
            }
        }

        None
    }

    /// Return the materialised object for an identifier, synthesising a
    /// proxy routed at the owning process if needed. Identifiers owned by
    /// this process never yield a proxy: the original is returned, or the
    /// call fails.
    pub fn create_or_get_proxy(
        &self,
        type_name: &str,
        id: &ObjectId,
        interfaces: &[String],
        hint: &Arc<dyn CallRouter>,
    ) -> RemotingResult<RemoteRef> {
        if self.is_local(id) {
            return self
                .try_get(id)
                .ok_or_else(|| RemotingError::InstanceNotFound(id.clone()));
        }

        if let Some(obj) = self.try_get(id) {
            return Ok(obj);
        }

        let router = self.route_for(id.prefix(), hint);
        let proxy =
            self.factory
                .materialize(type_name, id.clone(), interfaces.to_vec(), router.clone());

        self.adopt_proxy(id, &proxy, router.peer_id())
    }

    /// The router responsible for a process prefix. Unknown prefixes are
    /// recorded against the hint, i.e. the link the reference arrived on;
    /// that is the best-effort fallback for transitively introduced parties.
    fn route_for(&self, prefix: &str, hint: &Arc<dyn CallRouter>) -> Arc<dyn CallRouter> {
        let mut routes = lock(&self.routes);
        match routes.get(prefix) {
            Some(router) => router.clone(),
            None => {
                routes.insert(prefix.to_string(), hint.clone());
                hint.clone()
            }
        }
    }

    /// Install a freshly materialised proxy for a remote identifier. When a
    /// racing materialisation already produced a live entry, that one wins
    /// and the incoming proxy is discarded.
    pub(crate) fn adopt_proxy(
        &self,
        id: &ObjectId,
        proxy: &RemoteRef,
        origin: &str,
    ) -> RemotingResult<RemoteRef> {
        let entry = Arc::new(InstanceEntry {
            id: id.clone(),
            type_name: proxy.type_name().to_string(),
            interfaces: proxy.interface_names(),
            is_local: false,
            owner: self.owner,
            origin: Some(origin.to_string()),
            state: Mutex::new(SlotState {
                strong: None,
                weak: Arc::downgrade(proxy),
                reference_bits: 0,
            }),
        });

        {
            let mut entries = lock(&self.entries);
            if let Some(existing) = entries.get(id.as_str()) {
                if let Some(winner) = existing.live() {
                    return Ok(winner);
                }
            }
            entries.insert(id.as_str().to_string(), entry);
        }

        lock(&self.reverse).insert(ptr_key(proxy), id.clone());
        Ok(proxy.clone())
    }

    /// Clear the peer's reference bit. When no peer holds a reference any
    /// more the strong slot is dropped, and with `really_remove` the entry
    /// is deleted. Calling this twice is a no-op after the first.
    pub fn remove(&self, id: &ObjectId, peer: &str, really_remove: bool) {
        let entry = match lock(&self.entries).get(id.as_str()).cloned() {
            Some(entry) => entry,
            None => return,
        };

        let mut delete = false;
        let live_key;
        {
            let mut state = lock(&entry.state);

            if let Some(index) = self.known_peer_index(peer) {
                state.reference_bits &= !(1u64 << index);
            }

            if state.reference_bits == 0 {
                state.strong = None;
                delete = really_remove;
            }

            live_key = state.weak.upgrade().map(|obj| ptr_key(&obj));
        }

        if delete {
            lock(&self.entries).remove(id.as_str());
            let mut reverse = lock(&self.reverse);
            match live_key {
                Some(key) => {
                    reverse.remove(&key);
                }
                None => reverse.retain(|_, mapped| mapped != id),
            }

            logging::debug!(self.log, "entry removed"; "id" => %id, "peer" => peer);
        }
    }

    /// Drop the strong slot so the entry no longer pins its object.
    pub fn mark_unused(&self, id: &ObjectId) {
        if let Some(entry) = lock(&self.entries).get(id.as_str()).cloned() {
            lock(&entry.state).strong = None;
        }
    }

    /// Sweep proxies materialised from the router's peer whose local callers
    /// are gone, erase them, and tell the owner to drop its references. With
    /// `drop_all` every proxy from that peer is reported regardless of
    /// liveness, and the peer's bits are cleared from local entries; that is
    /// the disconnect path.
    pub fn perform_gc(&self, router: &Arc<dyn CallRouter>, drop_all: bool) -> RemotingResult<usize> {
        let peer = router.peer_id();
        let mut dead = Vec::new();

        {
            let entries = lock(&self.entries);
            for entry in entries.values() {
                if entry.is_local || entry.origin.as_deref() != Some(peer) {
                    continue;
                }

                let released = entry.live().is_none();
                if drop_all || released {
                    dead.push(entry.id.clone());
                }
            }
        }

        if drop_all {
            if let Some(index) = self.known_peer_index(peer) {
                let bit = 1u64 << index;
                let entries: Vec<_> = lock(&self.entries).values().cloned().collect();
                for entry in entries {
                    if !entry.is_local {
                        continue;
                    }
                    let mut state = lock(&entry.state);
                    state.reference_bits &= !bit;
                    if state.reference_bits == 0 {
                        state.strong = None;
                    }
                }
            }
        }

        if dead.is_empty() {
            return Ok(0);
        }

        {
            let mut entries = lock(&self.entries);
            for id in &dead {
                entries.remove(id.as_str());
            }
        }
        lock(&self.reverse).retain(|_, mapped| !dead.contains(mapped));

        logging::debug!(self.log, "gc sweep";
                        "peer" => peer,
                        "drop_all" => drop_all,
                        "released" => dead.len());

        router.send_gc_cleanup(&dead)?;
        Ok(dead.len())
    }

    /// Test escape hatch for processes hosting several registries.
    pub fn clear(&self, fully: bool) {
        lock(&self.entries).clear();
        lock(&self.reverse).clear();

        if fully {
            lock(&self.peers).clear();
            lock(&self.routes).clear();
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    #[inline]
    pub fn contains(&self, id: &ObjectId) -> bool {
        lock(&self.entries).contains_key(id.as_str())
    }

    /// Reference bit vector of an entry, for diagnostics and tests.
    pub fn reference_bits(&self, id: &ObjectId) -> Option<u64> {
        let entry = lock(&self.entries).get(id.as_str()).cloned()?;
        let state = lock(&entry.state);
        Some(state.reference_bits)
    }
}

fn delegate_token(method: &MethodId, target: &RemoteRef) -> u64 {
    let mut hasher = DefaultHasher::new();
    method.as_str().hash(&mut hasher);
    ptr_key(target).hash(&mut hasher);
    hasher.finish()
}
