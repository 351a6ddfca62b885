//! Connection registry, priority queue, and admission control.
//!
//! All scheduler state lives behind one lock. Every operation mutates
//! under the lock, collects the calls it owes the outside world
//! (subscriber notifications, handler starts, interaction hooks), and
//! dispatches them after the lock is dropped, so a callback that
//! re-enters the scheduler takes the lock again and never observes a
//! list mid-mutation. Scheduling passes are never run inline from a
//! mutation: mutations set a coalesced flag and the owner drives
//! [`Scheduler::tick`] / [`Scheduler::run_deferred`] from its event
//! loop.

use crate::blacklist::{BlacklistFlags, BlacklistTable};
use crate::config::{NetworkConfig, SchedulerConfig};
use crate::error::ConnectionError;
use crate::host::HostTracker;
use crate::keepalive::{KeepAlivePool, KeepAliveSlot};
use crate::protocol::{CancelHandle, ProtocolData, ProtocolHandler, TlsSession, Transport};
use crate::request::{
    CacheMode, ConnectionRequest, DetachState, LoadFlags, RequestKey, Restartability,
};
use crate::state::{ConnectionState, LoadPriority};
use crate::status::{LoadStatus, StatusCallback, StatusSubscriber, SubscriberKey};
use parking_lot::Mutex;
use slotmap::SlotMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use timer::TimerQueue;
use url::Url;

/// Hook invoked (outside the lock) when a request enters a failed
/// state an external layer may want to override: bad login or a
/// certificate/cipher/downgrade problem. The layer answers by calling
/// [`Scheduler::allow_and_retry`] or releasing its subscriber.
pub type InteractionHook = Arc<dyn Fn(&Scheduler, RequestKey, &ConnectionError) + Send + Sync>;

/// Parameters for [`Scheduler::load`].
pub struct LoadRequest {
    /// Target URL.
    pub url: String,
    /// Referrer, if any.
    pub referrer: Option<String>,
    /// Priority this caller contributes.
    pub priority: LoadPriority,
    /// Cache interaction mode.
    pub cache_mode: CacheMode,
    /// Caller-granted permissions.
    pub flags: LoadFlags,
    /// Byte offset to start from.
    pub position: u64,
    /// Notification callback.
    pub on_status: Option<StatusCallback>,
}

impl LoadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            referrer: None,
            priority: LoadPriority::Normal,
            cache_mode: CacheMode::Normal,
            flags: LoadFlags::empty(),
            position: 0,
            on_status: None,
        }
    }

    pub fn with_priority(mut self, priority: LoadPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn with_flags(mut self, flags: LoadFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_position(mut self, position: u64) -> Self {
        self.position = position;
        self
    }

    pub fn on_status(mut self, callback: impl Fn(&LoadStatus) + Send + Sync + 'static) -> Self {
        self.on_status = Some(Arc::new(callback));
        self
    }
}

/// Read-only counters for status displays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Requests queued, waiting for admission.
    pub queued: usize,
    /// Requests occupying a connection slot.
    pub running: usize,
    /// Requests currently receiving a body.
    pub transferring: usize,
    /// Idle sockets in the keepalive pool.
    pub keepalive_sockets: usize,
}

/// Read-only snapshot of one request, for protocol handlers.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    pub url: Url,
    pub referrer: Option<String>,
    pub cache_mode: CacheMode,
    pub flags: LoadFlags,
    pub start_position: u64,
    pub tries: u32,
    pub state: ConnectionState,
}

/// Timer payloads routed back into the scheduler.
enum TimerEvent {
    RequestTimeout(RequestKey),
    StatsTick(RequestKey),
}

/// A call owed to the outside world, dispatched after the lock drops.
enum Outcall {
    Notify {
        subscriber: SubscriberKey,
        status: LoadStatus,
        callback: StatusCallback,
        /// Terminal notifications are delivered even though their
        /// subscriber entry is already removed.
        terminal: bool,
    },
    Start {
        handler: Arc<dyn ProtocolHandler>,
        request: RequestKey,
        resumed: bool,
    },
    Interact {
        hook: InteractionHook,
        request: RequestKey,
        error: ConnectionError,
    },
}

/// The connection scheduler. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    config: SchedulerConfig,
    handlers: HashMap<String, Arc<dyn ProtocolHandler>>,
    requests: SlotMap<RequestKey, ConnectionRequest>,
    subscribers: SlotMap<SubscriberKey, StatusSubscriber>,
    /// Waiting requests, ascending priority, ties by insertion order.
    queue: Vec<RequestKey>,
    hosts: HostTracker,
    keepalive: KeepAlivePool,
    blacklist: BlacklistTable,
    timers: TimerQueue<TimerEvent>,
    next_serial: u64,
    running_count: usize,
    /// Coalesced deferred-pass flag; any number of schedule requests
    /// collapse into one pass.
    pass_pending: bool,
    interaction_hook: Option<InteractionHook>,
}

/// Dedup key: the URL as routed, so the same URL through different
/// proxies never shares a connection.
fn normalize_key(url: &Url, net: &NetworkConfig) -> String {
    match (&net.http_proxy, url.scheme()) {
        (Some(proxy), "http" | "https") => format!("proxy:{proxy}:{url}"),
        _ => url.to_string(),
    }
}

/// Phase timeout for the request's current state, if it needs one.
fn timeout_for(req: &ConnectionRequest, config: &SchedulerConfig) -> Option<Duration> {
    if !req.state.is_active() {
        return None;
    }
    if req.state.is_connect_phase() {
        // Scaled so multi-address fallback gets time on later tries.
        return Some(config.connect_timeout * (req.tries + 1));
    }
    if req.restartability > Restartability::Full {
        Some(config.unrestartable_timeout)
    } else {
        Some(config.receive_timeout)
    }
}

impl Scheduler {
    /// Create a scheduler with the given configuration.
    pub fn new(config: SchedulerConfig) -> Self {
        let keepalive = KeepAlivePool::new(config.keepalive_capacity);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                config,
                handlers: HashMap::new(),
                requests: SlotMap::with_key(),
                subscribers: SlotMap::with_key(),
                queue: Vec::new(),
                hosts: HostTracker::new(),
                keepalive,
                blacklist: BlacklistTable::new(),
                timers: TimerQueue::new(),
                next_serial: 1,
                running_count: 0,
                pass_pending: false,
                interaction_hook: None,
            })),
        }
    }

    /// Register the protocol handler for its scheme.
    pub fn register_handler(&self, handler: Arc<dyn ProtocolHandler>) {
        let mut inner = self.inner.lock();
        inner.handlers.insert(handler.scheme().to_string(), handler);
    }

    /// Install the hook consulted on login/security failures.
    pub fn set_interaction_hook(&self, hook: InteractionHook) {
        self.inner.lock().interaction_hook = Some(hook);
    }

    /// Replace the network configuration. Pooled sockets were routed
    /// under the old one, so the pool is flushed; in-flight requests
    /// keep their snapshot and simply will not donate their sockets.
    pub fn set_network_config(&self, network: NetworkConfig) {
        let mut inner = self.inner.lock();
        inner.config.network = network;
        inner.keepalive.clear();
    }

    /// Ask for a URL to be fetched. Either attaches to an existing
    /// in-flight request for the identical normalized URL or queues a
    /// new one; scheduling itself happens on the next deferred pass.
    pub fn load(&self, load: LoadRequest) -> Result<SubscriberKey, ConnectionError> {
        let LoadRequest {
            url,
            referrer,
            priority,
            cache_mode,
            flags,
            position,
            on_status,
        } = load;
        let mut inner = self.inner.lock();
        let url = Url::parse(&url).map_err(|e| ConnectionError::BadUrl(e.to_string()))?;
        if !inner.handlers.contains_key(url.scheme()) {
            return Err(ConnectionError::SchemeDisallowed(url.scheme().to_string()));
        }
        let normalized = normalize_key(&url, &inner.config.network);

        // Share an existing live, attached request for the same URL.
        let existing = inner
            .requests
            .iter()
            .find(|(_, r)| {
                r.normalized == normalized
                    && r.detach == DetachState::Attached
                    && !r.state.is_terminal()
            })
            .map(|(k, _)| k);
        if let Some(key) = existing {
            let sub = inner
                .subscribers
                .insert(StatusSubscriber::new(priority, key, on_status));
            let mut promoted = false;
            let mut seed = LoadStatus::initial();
            if let Some(req) = inner.requests.get_mut(key) {
                let before = req.effective_priority();
                req.add_ref(priority);
                req.subscribers.push(sub);
                promoted = before.map_or(true, |b| priority < b);
                seed = LoadStatus {
                    state: req.state.clone(),
                    prev_error: req.last_error.clone(),
                    received: req.received,
                    est_length: req.est_length,
                    bytes_per_sec: req.rate.bytes_per_sec,
                    eta: req.rate.eta,
                };
                tracing::debug!(serial = req.serial, ?priority, "attached to in-flight request");
            }
            if let Some(s) = inner.subscribers.get_mut(sub) {
                s.last = seed;
            }
            if promoted {
                inner.requeue(key);
                inner.pass_pending = true;
            }
            return Ok(sub);
        }

        // New request.
        let serial = inner.next_serial;
        inner.next_serial += 1;
        let now = Instant::now();
        let network = inner.config.network.clone();
        let mut req = ConnectionRequest::new(serial, url, normalized, referrer, network, now);
        req.cache_mode = cache_mode;
        req.flags = flags;
        req.start_position = position;
        req.add_ref(priority);
        let key = inner.requests.insert(req);
        let sub = inner
            .subscribers
            .insert(StatusSubscriber::new(priority, key, on_status));
        if let Some(req) = inner.requests.get_mut(key) {
            req.subscribers.push(sub);
        }
        inner.enqueue(key);
        inner.pass_pending = true;
        tracing::debug!(serial, ?priority, "queued new request");
        Ok(sub)
    }

    /// Move a subscriber's contribution to a different priority level.
    pub fn change_priority(&self, sub: SubscriberKey, priority: LoadPriority) {
        let mut inner = self.inner.lock();
        let Some(s) = inner.subscribers.get_mut(sub) else {
            tracing::warn!("change_priority on unknown subscriber");
            return;
        };
        let old = s.priority;
        if old == priority {
            return;
        }
        s.priority = priority;
        let key = s.request;
        if let Some(req) = inner.requests.get_mut(key) {
            req.remove_ref(old);
            req.add_ref(priority);
        }
        inner.requeue(key);
        inner.pass_pending = true;
    }

    /// Release a subscriber. The last attached subscriber going away
    /// aborts the request. Releasing twice is a safe no-op.
    pub fn release(&self, sub: SubscriberKey) {
        let mut out = Vec::new();
        {
            let mut inner = self.inner.lock();
            let Some(s) = inner.subscribers.get(sub) else {
                tracing::warn!("release of unknown or already-released subscriber");
                return;
            };
            let key = s.request;
            let priority = s.priority;
            let mut abandoned = false;
            if let Some(req) = inner.requests.get_mut(key) {
                req.remove_ref(priority);
                abandoned = req.total_refs() == 0 && req.detach == DetachState::Attached;
                if !abandoned {
                    req.subscribers.retain(|&k| k != sub);
                }
            } else {
                inner.subscribers.remove(sub);
                return;
            }
            if abandoned {
                // The last subscriber stays registered so the terminal
                // Interrupted fan-out still reaches it.
                inner.destroy_locked(key, ConnectionState::Interrupted, &mut out);
            } else {
                inner.subscribers.remove(sub);
                inner.requeue(key);
                inner.pass_pending = true;
            }
        }
        self.dispatch(out);
    }

    /// Let the caller disappear while the transfer continues for the
    /// cache. Only valid while exactly one subscriber remains. With
    /// `want_restart` and a new `position`, the transfer is torn down
    /// and resubmitted at that offset; a running request keeps its
    /// connection slot, a queued one waits for admission again.
    pub fn detach(
        &self,
        sub: SubscriberKey,
        position: Option<u64>,
        want_restart: bool,
    ) -> Result<(), ConnectionError> {
        let mut out = Vec::new();
        {
            let mut inner = self.inner.lock();
            let Some(s) = inner.subscribers.get(sub) else {
                return Err(ConnectionError::InvariantViolation("unknown subscriber"));
            };
            let key = s.request;
            let priority = s.priority;
            let single = inner
                .requests
                .get(key)
                .map_or(false, |r| r.subscribers.len() == 1);
            if !single {
                return Err(ConnectionError::InvariantViolation(
                    "detach requires exactly one subscriber",
                ));
            }
            inner.subscribers.remove(sub);
            let cancel_tier = inner.config.cancel_tier;
            let mut restart = false;
            if let Some(req) = inner.requests.get_mut(key) {
                req.subscribers.clear();
                // The interest survives the caller, demoted to the
                // cancel tier so the background sweep bounds it.
                req.move_refs(priority, cancel_tier);
                req.detach = DetachState::Background;
                if want_restart {
                    if let Some(pos) = position {
                        if pos != req.start_position {
                            req.detach = DetachState::Restarting;
                            req.socket = None;
                            req.tls = None;
                            req.protocol_data = None;
                            req.address_cursor = 0;
                            req.start_position = pos;
                            req.received = 0;
                            req.restartability = Restartability::Full;
                            // Only a request holding a slot restarts in
                            // place; a queued one keeps waiting for
                            // admission with the new offset.
                            restart = req.running;
                        }
                    }
                }
                tracing::debug!(serial = req.serial, restart, "request detached");
            }
            if restart {
                // Resubmit in place: host/global accounting is kept.
                inner.set_state_locked(key, ConnectionState::Connecting, &mut out);
                inner.emit_start(key, false, &mut out);
            }
            inner.requeue(key);
            inner.pass_pending = true;
        }
        self.dispatch(out);
        Ok(())
    }

    /// Record the user's decision for this request's host and retry
    /// once, regardless of the remaining try budget.
    pub fn allow_and_retry(&self, key: RequestKey, flags: BlacklistFlags) {
        let mut out = Vec::new();
        {
            let mut inner = self.inner.lock();
            let Some(req) = inner.requests.get(key) else {
                return;
            };
            let host = req.host().to_string();
            let error = req.last_error.clone().unwrap_or(ConnectionError::Interrupted);
            inner.blacklist.add_flags(&host, flags);
            inner.retry_locked(key, error, &mut out);
        }
        self.dispatch(out);
    }

    // --- handler-facing state machine entry points ---

    /// Drive the request into a new non-terminal state. Terminal
    /// outcomes go through [`Scheduler::finish`] and
    /// [`Scheduler::fail`] instead.
    pub fn set_state(&self, key: RequestKey, state: ConnectionState) {
        if state.is_terminal() {
            tracing::warn!(?state, "set_state with terminal state ignored; use finish/fail");
            return;
        }
        let mut out = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.set_state_locked(key, state, &mut out);
        }
        self.dispatch(out);
    }

    /// Record body progress. Resets the phase timeout; subscriber
    /// notification is left to the throttled stats timer.
    pub fn report_progress(&self, key: RequestKey, received: u64, est_length: Option<u64>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let now = Instant::now();
        let Some(req) = inner.requests.get_mut(key) else {
            return;
        };
        req.received = received;
        if est_length.is_some() {
            req.est_length = est_length;
        }
        if received > 0 && req.restartability == Restartability::Full {
            req.restartability = Restartability::Partial;
        }
        if let Some(old) = req.timeout_timer.take() {
            inner.timers.cancel(old);
        }
        if let Some(dur) = timeout_for(req, &inner.config) {
            req.timeout_timer = Some(
                inner
                    .timers
                    .schedule(now + dur, TimerEvent::RequestTimeout(key)),
            );
        }
    }

    /// Lower the request's restart safety (never raises it).
    pub fn set_restartability(&self, key: RequestKey, level: Restartability) {
        let mut inner = self.inner.lock();
        if let Some(req) = inner.requests.get_mut(key) {
            if level > req.restartability {
                req.restartability = level;
            }
        }
    }

    /// Give the request its established socket.
    pub fn set_socket(&self, key: RequestKey, socket: Box<dyn Transport>) {
        let mut inner = self.inner.lock();
        if let Some(req) = inner.requests.get_mut(key) {
            req.socket = Some(socket);
        }
    }

    /// Attach the negotiated TLS session.
    pub fn set_tls(&self, key: RequestKey, tls: TlsSession) {
        let mut inner = self.inner.lock();
        if let Some(req) = inner.requests.get_mut(key) {
            req.tls = Some(tls);
        }
    }

    /// Record resolved addresses for multi-address fallback.
    pub fn set_addresses(&self, key: RequestKey, addresses: Vec<IpAddr>) {
        let mut inner = self.inner.lock();
        if let Some(req) = inner.requests.get_mut(key) {
            req.addresses = addresses;
            req.address_cursor = 0;
        }
    }

    /// Next address to try, advancing the fallback cursor.
    pub fn next_address(&self, key: RequestKey) -> Option<IpAddr> {
        let mut inner = self.inner.lock();
        inner.requests.get_mut(key).and_then(|r| r.next_address())
    }

    /// Register the cancel handle for an in-flight DNS lookup.
    pub fn set_dns_cancel(&self, key: RequestKey, cancel: CancelHandle) {
        let mut inner = self.inner.lock();
        if let Some(req) = inner.requests.get_mut(key) {
            req.dns_cancel = Some(cancel);
        }
    }

    /// Attach the cache entry this transfer fills (owned by the cache).
    pub fn set_cache_token(&self, key: RequestKey, token: u64) {
        let mut inner = self.inner.lock();
        if let Some(req) = inner.requests.get_mut(key) {
            req.cache_token = Some(token);
        }
    }

    /// Take the protocol state spliced in from a keepalive slot.
    pub fn take_protocol_data(&self, key: RequestKey) -> Option<ProtocolData> {
        let mut inner = self.inner.lock();
        inner.requests.get_mut(key).and_then(|r| r.protocol_data.take())
    }

    /// Follow a redirect. Fails the request with `CyclicRedirect` when
    /// it points back at the originating URL or the redirect budget is
    /// spent; otherwise the request restarts against the new URL on
    /// its existing connection slot.
    pub fn redirect(&self, key: RequestKey, location: &str) -> Result<(), ConnectionError> {
        let mut out = Vec::new();
        let result;
        {
            let mut inner = self.inner.lock();
            let Some(req) = inner.requests.get(key) else {
                return Err(ConnectionError::InvariantViolation("unknown request"));
            };
            let new_url = req
                .url
                .join(location)
                .map_err(|e| ConnectionError::BadUrl(e.to_string()))?;
            let cyclic = new_url == req.origin_url || req.redirects + 1 > inner.config.max_redirects;
            if cyclic {
                inner.destroy_locked(
                    key,
                    ConnectionState::Failed(ConnectionError::CyclicRedirect),
                    &mut out,
                );
                result = Err(ConnectionError::CyclicRedirect);
            } else {
                let old_host = inner
                    .requests
                    .get(key)
                    .map(|r| r.host().to_string())
                    .unwrap_or_default();
                let network = inner.config.network.clone();
                let running = if let Some(req) = inner.requests.get_mut(key) {
                    req.redirects += 1;
                    req.normalized = normalize_key(&new_url, &network);
                    req.url = new_url;
                    req.socket = None;
                    req.tls = None;
                    req.protocol_data = None;
                    req.addresses.clear();
                    req.address_cursor = 0;
                    req.running
                } else {
                    false
                };
                // Running slots follow the request to its new host.
                if running {
                    let new_host = inner
                        .requests
                        .get(key)
                        .map(|r| r.host().to_string())
                        .unwrap_or_default();
                    if new_host != old_host {
                        inner.hosts.decrement(&old_host);
                        inner.hosts.increment(&new_host);
                    }
                }
                inner.set_state_locked(key, ConnectionState::Connecting, &mut out);
                inner.emit_start(key, false, &mut out);
                result = Ok(());
            }
        }
        self.dispatch(out);
        result
    }

    /// Clean completion: pool the socket when policy allows, then
    /// destroy the request and free its slot.
    pub fn finish(&self, key: RequestKey) {
        let mut out = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !inner.requests.contains_key(key) {
                return;
            }
            inner.maybe_pool_locked(key, Instant::now());
            inner.destroy_locked(key, ConnectionState::Done, &mut out);
        }
        self.dispatch(out);
    }

    /// Failure: retried while the error and the request allow it,
    /// escalated to the interaction hook for login/security problems,
    /// terminal otherwise.
    pub fn fail(&self, key: RequestKey, error: ConnectionError) {
        let mut out = Vec::new();
        {
            let mut inner = self.inner.lock();
            let Some(req) = inner.requests.get(key) else {
                return;
            };
            let max_tries = inner.config.max_tries;
            if error.is_retryable() && req.is_restartable(max_tries) {
                inner.retry_locked(key, error, &mut out);
            } else if error.is_interactive() && inner.interaction_hook.is_some() {
                inner.set_state_locked(key, ConnectionState::Failed(error.clone()), &mut out);
                if let Some(req) = inner.requests.get_mut(key) {
                    req.last_error = Some(error.clone());
                }
                if let Some(hook) = inner.interaction_hook.clone() {
                    out.push(Outcall::Interact {
                        hook,
                        request: key,
                        error,
                    });
                }
            } else {
                inner.destroy_locked(key, ConnectionState::Failed(error), &mut out);
            }
        }
        self.dispatch(out);
    }

    // --- event-loop surface ---

    /// Fire due timers, then run the deferred pass if one is owed.
    pub fn tick(&self, now: Instant) {
        let out = {
            let mut inner = self.inner.lock();
            let events = inner.timers.pop_due(now);
            let mut out = Vec::new();
            for event in events {
                match event {
                    TimerEvent::RequestTimeout(key) => inner.handle_timeout(key, &mut out),
                    TimerEvent::StatsTick(key) => inner.handle_stats_tick(key, now, &mut out),
                }
            }
            out
        };
        self.dispatch(out);
        self.run_deferred_at(now);
    }

    /// Run the coalesced scheduling pass, if one is pending.
    pub fn run_deferred(&self) {
        self.run_deferred_at(Instant::now());
    }

    fn run_deferred_at(&self, now: Instant) {
        let out = {
            let mut inner = self.inner.lock();
            if !inner.pass_pending {
                return;
            }
            inner.pass_pending = false;
            let mut out = Vec::new();
            inner.check_queue(now, &mut out);
            out
        };
        self.dispatch(out);
    }

    /// Earliest pending timer deadline, for event-loop sleeping.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.lock().timers.next_deadline()
    }

    // --- introspection ---

    /// Counters for status displays.
    pub fn stats(&self) -> SchedulerStats {
        let mut inner = self.inner.lock();
        inner.keepalive.maintain(Instant::now());
        SchedulerStats {
            queued: inner.queue.len(),
            running: inner.running_count,
            transferring: inner
                .requests
                .values()
                .filter(|r| r.state == ConnectionState::Transferring)
                .count(),
            keepalive_sockets: inner.keepalive.len(),
        }
    }

    /// Last status a subscriber observed.
    pub fn status(&self, sub: SubscriberKey) -> Option<LoadStatus> {
        self.inner.lock().subscribers.get(sub).map(|s| s.last.clone())
    }

    /// Request a subscriber is attached to.
    pub fn request_of(&self, sub: SubscriberKey) -> Option<RequestKey> {
        self.inner.lock().subscribers.get(sub).map(|s| s.request)
    }

    /// Current state of a request.
    pub fn request_state(&self, key: RequestKey) -> Option<ConnectionState> {
        self.inner.lock().requests.get(key).map(|r| r.state.clone())
    }

    /// Read-only snapshot of a request, for protocol handlers.
    pub fn request_info(&self, key: RequestKey) -> Option<RequestInfo> {
        self.inner.lock().requests.get(key).map(|r| RequestInfo {
            url: r.url.clone(),
            referrer: r.referrer.clone(),
            cache_mode: r.cache_mode,
            flags: r.flags,
            start_position: r.start_position,
            tries: r.tries,
            state: r.state.clone(),
        })
    }

    // --- blacklist, consulted and updated by protocol handlers ---

    /// Policy flags recorded for a host.
    pub fn blacklist_flags(&self, host: &str) -> BlacklistFlags {
        self.inner.lock().blacklist.flags(host)
    }

    /// Merge policy flags for a host.
    pub fn add_blacklist_flags(&self, host: &str, flags: BlacklistFlags) {
        self.inner.lock().blacklist.add_flags(host, flags);
    }

    /// Clear policy flags for a host.
    pub fn remove_blacklist_flags(&self, host: &str, flags: BlacklistFlags) {
        self.inner.lock().blacklist.remove_flags(host, flags);
    }

    /// Deliver the out-calls collected under the lock. Each delivery
    /// re-checks liveness so a callback that released a subscriber or
    /// request aborts the rest of that fan-out.
    fn dispatch(&self, outcalls: Vec<Outcall>) {
        for call in outcalls {
            match call {
                Outcall::Notify {
                    subscriber,
                    status,
                    callback,
                    terminal,
                } => {
                    if !terminal && !self.inner.lock().subscribers.contains_key(subscriber) {
                        continue;
                    }
                    callback(&status);
                }
                Outcall::Start {
                    handler,
                    request,
                    resumed,
                } => {
                    if !self.inner.lock().requests.contains_key(request) {
                        continue;
                    }
                    handler.start(self, request, resumed);
                }
                Outcall::Interact {
                    hook,
                    request,
                    error,
                } => {
                    if !self.inner.lock().requests.contains_key(request) {
                        continue;
                    }
                    hook(self, request, &error);
                }
            }
        }
    }
}

impl Inner {
    /// Insert a waiting request after every queued request at the same
    /// or a more urgent level.
    fn enqueue(&mut self, key: RequestKey) {
        let pri = self
            .requests
            .get(key)
            .and_then(|r| r.effective_priority())
            .unwrap_or(LoadPriority::Speculative);
        let pos = self
            .queue
            .iter()
            .position(|&k| {
                self.requests
                    .get(k)
                    .and_then(|r| r.effective_priority())
                    .map_or(false, |p| p > pri)
            })
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, key);
    }

    /// Re-place a request after a priority change; running requests
    /// simply leave the queue.
    fn requeue(&mut self, key: RequestKey) {
        self.queue.retain(|&k| k != key);
        if self
            .requests
            .get(key)
            .is_some_and(|r| r.state == ConnectionState::Wait)
        {
            self.enqueue(key);
        }
    }

    fn emit_start(&mut self, key: RequestKey, resumed: bool, out: &mut Vec<Outcall>) {
        let Some(scheme) = self.requests.get(key).map(|r| r.url.scheme().to_string()) else {
            return;
        };
        match self.handlers.get(&scheme).cloned() {
            Some(handler) => out.push(Outcall::Start {
                handler,
                request: key,
                resumed,
            }),
            // A redirect can land on a scheme nothing serves.
            None => {
                tracing::warn!(scheme = %scheme, "no handler for scheme");
                self.destroy_locked(
                    key,
                    ConnectionState::Failed(ConnectionError::SchemeDisallowed(scheme)),
                    out,
                );
            }
        }
    }

    /// Enter a new state: manage the stats and phase-timeout timers
    /// and fan the change out to every subscriber, capturing the
    /// previous error as context.
    fn set_state_locked(&mut self, key: RequestKey, state: ConnectionState, out: &mut Vec<Outcall>) {
        let now = Instant::now();
        let Some(req) = self.requests.get_mut(key) else {
            return;
        };
        let was_transferring = req.state == ConnectionState::Transferring;
        let prev_error = req.last_error.clone();
        if req.detach == DetachState::Restarting && state.is_active() {
            req.detach = DetachState::Background;
        }
        req.state = state;
        let is_transferring = req.state == ConnectionState::Transferring;

        if is_transferring && !was_transferring {
            let deadline = now + self.config.stats_interval;
            let timer = self.timers.schedule(deadline, TimerEvent::StatsTick(key));
            if let Some(req) = self.requests.get_mut(key) {
                if let Some(old) = req.stats_timer.replace(timer) {
                    self.timers.cancel(old);
                }
            }
        } else if was_transferring && !is_transferring {
            if let Some(req) = self.requests.get_mut(key) {
                if let Some(old) = req.stats_timer.take() {
                    self.timers.cancel(old);
                }
            }
        }

        // Every transition re-arms (or clears) the phase timeout.
        if let Some(req) = self.requests.get_mut(key) {
            if let Some(old) = req.timeout_timer.take() {
                self.timers.cancel(old);
            }
        }
        let deadline = self
            .requests
            .get(key)
            .and_then(|r| timeout_for(r, &self.config))
            .map(|d| now + d);
        if let Some(deadline) = deadline {
            let timer = self.timers.schedule(deadline, TimerEvent::RequestTimeout(key));
            if let Some(req) = self.requests.get_mut(key) {
                req.timeout_timer = Some(timer);
            }
        }

        let status = {
            let Some(req) = self.requests.get_mut(key) else {
                return;
            };
            req.last_notify = Some(now);
            LoadStatus {
                state: req.state.clone(),
                prev_error,
                received: req.received,
                est_length: req.est_length,
                bytes_per_sec: req.rate.bytes_per_sec,
                eta: req.rate.eta,
            }
        };
        self.fan_out(key, status, out);
    }

    /// Queue a notification for every subscriber of `key`.
    fn fan_out(&mut self, key: RequestKey, status: LoadStatus, out: &mut Vec<Outcall>) {
        let subs = match self.requests.get(key) {
            Some(r) => r.subscribers.clone(),
            None => return,
        };
        for sub_key in subs {
            if let Some(sub) = self.subscribers.get_mut(sub_key) {
                sub.last = status.clone();
                if let Some(callback) = sub.callback.clone() {
                    out.push(Outcall::Notify {
                        subscriber: sub_key,
                        status: status.clone(),
                        callback,
                        terminal: false,
                    });
                }
            }
        }
    }

    /// One scheduling pass over the queue.
    fn check_queue(&mut self, now: Instant, out: &mut Vec<Outcall>) {
        self.keepalive.maintain(now);
        // Snapshot: requests suspended during this pass are requeued
        // but not reconsidered until the next pass.
        let snapshot = self.queue.clone();
        for pri in LoadPriority::ALL {
            let mut level: Vec<RequestKey> = snapshot
                .iter()
                .copied()
                .filter(|&k| {
                    self.requests.get(k).map_or(false, |r| {
                        r.state == ConnectionState::Wait && r.effective_priority() == Some(pri)
                    })
                })
                .collect();
            // Requests with an idle pooled socket go first: reuse is
            // cheaper than opening a new slot.
            level.sort_by_key(|&k| !self.has_keepalive_match(k));
            for key in level {
                self.try_connection(key, now, out);
            }
        }
        self.background_sweep(out);
    }

    fn has_keepalive_match(&self, key: RequestKey) -> bool {
        let Some(req) = self.requests.get(key) else {
            return false;
        };
        if req.tries != 0
            || req.restartability != Restartability::Full
            || req.flags.contains(LoadFlags::NO_KEEPALIVE)
        {
            return false;
        }
        let Some(handler) = self.handlers.get(req.url.scheme()) else {
            return false;
        };
        let Some(identity) = handler.keepalive_identity(&req.url) else {
            return false;
        };
        let port = req.url.port_or_known_default().unwrap_or(0);
        self.keepalive.has_match(handler.scheme(), &identity, port)
    }

    /// Attempt admission for one waiting request.
    fn try_connection(&mut self, key: RequestKey, now: Instant, out: &mut Vec<Outcall>) -> bool {
        let (host, pri) = match self.requests.get(key) {
            Some(r) if r.state == ConnectionState::Wait => (
                r.host().to_string(),
                r.effective_priority().unwrap_or(LoadPriority::Speculative),
            ),
            _ => return false,
        };
        let per_host = self.config.max_connections_per_host as u32;
        if self.hosts.count(&host) >= per_host {
            // The per-host cap binds: only a same-host victim helps.
            if !self.suspend_victim(pri, Some(&host), out) {
                tracing::debug!(host = %host, "admission blocked by per-host cap");
                return false;
            }
        }
        if self.running_count >= self.config.max_connections {
            if !self.suspend_victim(pri, None, out) {
                tracing::debug!(host = %host, "admission blocked by global cap");
                return false;
            }
        }

        let resumed = self.try_splice_keepalive(key);
        let Some(req) = self.requests.get_mut(key) else {
            return false;
        };
        req.running = true;
        req.last_scheduled = now;
        let serial = req.serial;
        self.hosts.increment(&host);
        self.running_count += 1;
        self.queue.retain(|&k| k != key);
        // A spliced socket skips the connect phases entirely.
        let first = if resumed {
            ConnectionState::Sent
        } else {
            ConnectionState::Connecting
        };
        self.set_state_locked(key, first, out);
        self.emit_start(key, resumed, out);
        tracing::debug!(serial, host = %host, resumed, "connection admitted");
        true
    }

    /// Free a slot by suspending the least-recently-scheduled running
    /// request strictly less urgent than `pri`, optionally restricted
    /// to one host. The victim loses its socket and returns to WAIT
    /// without consuming a try.
    fn suspend_victim(
        &mut self,
        pri: LoadPriority,
        same_host: Option<&str>,
        out: &mut Vec<Outcall>,
    ) -> bool {
        let mut best: Option<(RequestKey, Instant)> = None;
        for (k, req) in &self.requests {
            if !req.running || !req.state.is_active() {
                continue;
            }
            if let Some(host) = same_host {
                if req.host() != host {
                    continue;
                }
            }
            let Some(p) = req.effective_priority() else {
                continue;
            };
            if p <= pri {
                continue;
            }
            match best {
                Some((_, t)) if req.last_scheduled >= t => {}
                _ => best = Some((k, req.last_scheduled)),
            }
        }
        let Some((victim, _)) = best else {
            return false;
        };

        let host = {
            let Some(req) = self.requests.get_mut(victim) else {
                return false;
            };
            req.socket = None;
            req.tls = None;
            req.protocol_data = None;
            req.address_cursor = 0;
            if let Some(cancel) = req.dns_cancel.take() {
                cancel.cancel();
            }
            req.running = false;
            tracing::debug!(serial = req.serial, "suspending less urgent connection");
            req.host().to_string()
        };
        self.hosts.decrement(&host);
        if self.running_count == 0 {
            tracing::error!("global running count underflow");
        } else {
            self.running_count -= 1;
        }
        self.set_state_locked(victim, ConnectionState::Wait, out);
        self.enqueue(victim);
        true
    }

    /// Splice an idle pooled socket into a fresh request. Under a
    /// one-try policy the splice pre-exhausts the try counter so a
    /// first failure on the possibly half-closed socket is terminal.
    fn try_splice_keepalive(&mut self, key: RequestKey) -> bool {
        if !self.has_keepalive_match(key) {
            return false;
        }
        let (scheme, identity, port) = {
            let Some(req) = self.requests.get(key) else {
                return false;
            };
            let Some(handler) = self.handlers.get(req.url.scheme()) else {
                return false;
            };
            let Some(identity) = handler.keepalive_identity(&req.url) else {
                return false;
            };
            (
                handler.scheme(),
                identity,
                req.url.port_or_known_default().unwrap_or(0),
            )
        };
        let Some(slot) = self.keepalive.take(scheme, &identity, port) else {
            return false;
        };
        let one_try = self.config.max_tries == 1;
        let Some(req) = self.requests.get_mut(key) else {
            return false;
        };
        req.socket = Some(slot.socket);
        req.tls = slot.tls;
        req.protocol_data = slot.protocol_data;
        req.addresses = slot.addresses;
        req.address_cursor = 0;
        if one_try {
            req.pre_exhausted = true;
        }
        tracing::debug!(serial = req.serial, identity = %identity, "reusing keepalive socket");
        true
    }

    /// Abort cancel-tier work: anything still waiting, and anything
    /// whose transfer has exceeded the background byte budget.
    fn background_sweep(&mut self, out: &mut Vec<Outcall>) {
        let cancel_tier = self.config.cancel_tier;
        let budget = self.config.background_byte_budget;
        let victims: Vec<RequestKey> = self
            .requests
            .iter()
            .filter(|(_, r)| {
                r.effective_priority()
                    .map_or(false, |p| p >= cancel_tier)
                    && !r.state.is_terminal()
                    && (r.state == ConnectionState::Wait || r.received > budget)
            })
            .map(|(k, _)| k)
            .collect();
        for key in victims {
            tracing::debug!("background sweep aborting cancel-tier request");
            self.destroy_locked(key, ConnectionState::Interrupted, out);
        }
    }

    /// Phase timeout fired. In a connect phase this means "try the
    /// next address"; otherwise the request timed out and is retried
    /// or dropped.
    fn handle_timeout(&mut self, key: RequestKey, out: &mut Vec<Outcall>) {
        let Some(req) = self.requests.get_mut(key) else {
            return;
        };
        req.timeout_timer = None;
        let serial = req.serial;
        if req.state.is_connect_phase() && req.address_cursor < req.addresses.len() {
            tracing::debug!(serial, "connect timeout; trying alternate address");
            self.set_state_locked(key, ConnectionState::ConnectingAlt, out);
            self.emit_start(key, false, out);
            return;
        }
        tracing::debug!(serial, "request timed out");
        self.set_state_locked(key, ConnectionState::TimedOut, out);
        let max_tries = self.config.max_tries;
        let restartable = self
            .requests
            .get(key)
            .map_or(false, |r| r.is_restartable(max_tries));
        if restartable {
            self.retry_locked(key, ConnectionError::Timeout, out);
        } else {
            self.destroy_locked(key, ConnectionState::Failed(ConnectionError::Timeout), out);
        }
    }

    /// Periodic statistics tick while transferring: recompute the
    /// rate/ETA window and notify subscribers, throttled to the
    /// configured cadence.
    fn handle_stats_tick(&mut self, key: RequestKey, now: Instant, out: &mut Vec<Outcall>) {
        let interval = self.config.stats_interval;
        let Some(req) = self.requests.get_mut(key) else {
            return;
        };
        req.stats_timer = None;
        if req.state != ConnectionState::Transferring {
            return;
        }
        let received = req.received;
        let est_length = req.est_length;
        req.rate.sample(now, received, est_length);
        let due = req
            .last_notify
            .map_or(true, |t| now.duration_since(t) >= interval);
        let status = if due {
            req.last_notify = Some(now);
            Some(LoadStatus {
                state: req.state.clone(),
                prev_error: req.last_error.clone(),
                received,
                est_length,
                bytes_per_sec: req.rate.bytes_per_sec,
                eta: req.rate.eta,
            })
        } else {
            None
        };
        let timer = self
            .timers
            .schedule(now + interval, TimerEvent::StatsTick(key));
        if let Some(req) = self.requests.get_mut(key) {
            req.stats_timer = Some(timer);
        }
        if let Some(status) = status {
            self.fan_out(key, status, out);
        }
    }

    /// Re-submit to the protocol handler directly, keeping the
    /// connection slot; the prior error rides along as context.
    fn retry_locked(&mut self, key: RequestKey, error: ConnectionError, out: &mut Vec<Outcall>) {
        let Some(req) = self.requests.get_mut(key) else {
            return;
        };
        req.tries += 1;
        req.last_error = Some(error);
        req.socket = None;
        req.tls = None;
        req.protocol_data = None;
        req.address_cursor = 0;
        if let Some(cancel) = req.dns_cancel.take() {
            cancel.cancel();
        }
        tracing::debug!(serial = req.serial, tries = req.tries, "retrying connection");
        self.set_state_locked(key, ConnectionState::Connecting, out);
        self.emit_start(key, false, out);
    }

    /// Hand a finished request's socket to the keepalive pool, if the
    /// protocol, the TLS safety budget, and the network configuration
    /// all allow reuse. Refusal just means the socket is dropped.
    fn maybe_pool_locked(&mut self, key: RequestKey, now: Instant) {
        let (scheme, identity, port, timeout) = {
            let Some(req) = self.requests.get(key) else {
                return;
            };
            if req.flags.contains(LoadFlags::NO_KEEPALIVE) {
                return;
            }
            let Some(handler) = self.handlers.get(req.url.scheme()) else {
                return;
            };
            let Some(identity) = handler.keepalive_identity(&req.url) else {
                return;
            };
            if req.net_snapshot != self.config.network {
                tracing::debug!(serial = req.serial, "network configuration changed; not pooling");
                return;
            }
            if let Some(tls) = &req.tls {
                if tls.cipher == crate::protocol::CipherClass::Weak
                    && req.received > self.config.weak_cipher_byte_budget
                {
                    tracing::debug!(
                        serial = req.serial,
                        received = req.received,
                        "weak cipher over byte budget; not pooling"
                    );
                    return;
                }
            }
            (
                handler.scheme(),
                identity,
                req.url.port_or_known_default().unwrap_or(0),
                handler
                    .keepalive_timeout()
                    .unwrap_or(self.config.keepalive_timeout),
            )
        };
        let Some(req) = self.requests.get_mut(key) else {
            return;
        };
        let Some(socket) = req.socket.take() else {
            return;
        };
        let slot = KeepAliveSlot {
            scheme,
            identity,
            port,
            socket,
            tls: req.tls.take(),
            added: now,
            timeout,
            protocol_data: req.protocol_data.take(),
            addresses: std::mem::take(&mut req.addresses),
        };
        self.keepalive.insert(slot);
    }

    /// Tear a request down: leave the queue, cancel timers and DNS,
    /// free the connection slot, notify and drop every subscriber,
    /// close the socket, and owe the queue a scheduling pass.
    fn destroy_locked(&mut self, key: RequestKey, final_state: ConnectionState, out: &mut Vec<Outcall>) {
        self.queue.retain(|&k| k != key);
        let Some(req) = self.requests.remove(key) else {
            return;
        };
        if let Some(t) = req.timeout_timer {
            self.timers.cancel(t);
        }
        if let Some(t) = req.stats_timer {
            self.timers.cancel(t);
        }
        if let Some(cancel) = &req.dns_cancel {
            cancel.cancel();
        }
        if req.running {
            self.hosts.decrement(req.host());
            if self.running_count == 0 {
                tracing::error!("global running count underflow");
            } else {
                self.running_count -= 1;
            }
        }
        let status = LoadStatus {
            state: final_state,
            prev_error: req.last_error.clone(),
            received: req.received,
            est_length: req.est_length,
            bytes_per_sec: req.rate.bytes_per_sec,
            eta: req.rate.eta,
        };
        for sub_key in &req.subscribers {
            if let Some(sub) = self.subscribers.remove(*sub_key) {
                if let Some(callback) = sub.callback {
                    out.push(Outcall::Notify {
                        subscriber: *sub_key,
                        status: status.clone(),
                        callback,
                        terminal: true,
                    });
                }
            }
        }
        tracing::debug!(serial = req.serial, state = ?status.state, "connection removed");
        self.pass_pending = true;
        // Dropping the request closes any socket it still owns.
    }
}
