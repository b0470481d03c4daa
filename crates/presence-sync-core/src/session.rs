//! Role & session controller: the owned context that runs one participant.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  SyncSession (cheap to clone, Arc inside)                        │
//! │  ├── core: Mutex<Option<Core>>      None until init / after stop │
//! │  │   ├── state + sequencer + history                             │
//! │  │   ├── reliability (pending ACKs, one retry task each)         │
//! │  │   ├── cursor / scroll throttles (+ trailing scroll tasks)     │
//! │  │   └── tasks: listener, heartbeat, snapshot ticker, bootstrap  │
//! │  ├── hub: SubscriberHub             state observers              │
//! │  └── events: broadcast::Sender<SyncEvent>                        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every local call, inbound frame and timer callback takes the core lock,
//! mutates synchronously, and releases it. Observers are notified only after
//! the lock is released, so a callback may call back into the session. Each
//! published state carries a revision taken under the lock; the hub drops
//! any that arrive after a newer one.
//!
//! Each `init` starts a new epoch. Timer tasks carry the epoch they were
//! spawned in and do nothing if the session has since been shut down or
//! re-initialized.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

use crate::clock::{Clock, TokioClock};
use crate::config::{SessionConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::hub::{SubscriberHub, Subscription};
use crate::state::{DetailAction, LocalAction, StateDelta};
use crate::sync::envelope::{
    CursorPayload, DeltaPayload, Envelope, HeartbeatPayload, ScrollPayload, SyncMessage,
};
use crate::sync::events::{SyncEvent, SyncStats};
use crate::sync::history::DeltaHistory;
use crate::sync::presence::{self, CursorThrottle, ScrollDecision, ScrollThrottle};
use crate::sync::reliability::{ReliabilityLayer, RetryDecision};
use crate::sync::sequencer::{SeqVerdict, Sequencer};
use crate::sync::snapshot::{self, ResyncReason, SnapshotReason};
use crate::sync::transport::{Transport, TransportEvent};
use crate::types::{
    ClientId, CursorPosition, JsonMap, Rect, Role, ScrollPosition, SessionId, SharedState,
};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

struct SessionShared {
    core: Mutex<Option<Core>>,
    hub: SubscriberHub,
    events: broadcast::Sender<SyncEvent>,
    next_epoch: AtomicU64,
    // Bumped under the core lock for every published state
    revision: AtomicU64,
}

/// Handle to one participant's synchronized state
#[derive(Clone)]
pub struct SyncSession {
    shared: Arc<SessionShared>,
}

impl SyncSession {
    /// Create an uninitialized session. Call [`SyncSession::init`] to start it.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(SessionShared {
                core: Mutex::new(None),
                hub: SubscriberHub::new(),
                events,
                next_epoch: AtomicU64::new(0),
                revision: AtomicU64::new(0),
            }),
        }
    }

    /// Create and initialize in one step.
    pub fn start(config: SessionConfig, transport: Arc<dyn Transport>) -> SyncResult<Self> {
        let session = Self::new();
        session.init(config, transport)?;
        Ok(session)
    }

    /// Bind role, identity and transport, and start the timers.
    ///
    /// Must be called from within a tokio runtime. Re-initializing a running
    /// session discards its state and timers; observers are kept.
    pub fn init(&self, config: SessionConfig, transport: Arc<dyn Transport>) -> SyncResult<()> {
        self.init_with_clock(config, transport, Arc::new(TokioClock::new()))
    }

    /// [`SyncSession::init`] with an explicit time source.
    pub fn init_with_clock(
        &self,
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<()> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            SyncError::InvalidConfig("init must be called inside a tokio runtime".into())
        })?;

        let previous = self.shared.core.lock().take();
        if let Some(mut previous) = previous {
            info!(client_id = %previous.client_id, "Re-initializing session");
            previous.cancel_timers();
        }

        let epoch = self.shared.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let mut core = Core::new(
            epoch,
            config,
            transport,
            clock,
            runtime,
            Arc::downgrade(&self.shared),
            self.shared.events.clone(),
        );
        core.start_tasks();
        info!(
            client_id = %core.client_id,
            session_id = %core.session_id,
            role = %core.role,
            epoch,
            "Sync session initialized"
        );

        let initial = Arc::new(core.state.clone());
        let revision = {
            let mut guard = self.shared.core.lock();
            *guard = Some(core);
            self.next_revision()
        };
        self.shared.hub.publish(revision, initial);
        Ok(())
    }

    /// Cancel every timer, detach from the transport, and drop all observers.
    pub fn shutdown(&self) {
        let core = self.shared.core.lock().take();
        if let Some(mut core) = core {
            info!(client_id = %core.client_id, "Shutting down sync session");
            core.cancel_timers();
        }
        self.shared.hub.clear();
    }

    pub fn is_running(&self) -> bool {
        self.shared.core.lock().is_some()
    }

    pub fn role(&self) -> Option<Role> {
        self.shared.core.lock().as_ref().map(|c| c.role)
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.shared.core.lock().as_ref().map(|c| c.client_id.clone())
    }

    /// Immutable copy of the current state (empty when not running).
    pub fn state(&self) -> Arc<SharedState> {
        let guard = self.shared.core.lock();
        match guard.as_ref() {
            Some(core) => Arc::new(core.state.clone()),
            None => Arc::new(SharedState::default()),
        }
    }

    /// Last applied (or, on the Authority, last issued) sequence
    pub fn last_seq(&self) -> u64 {
        self.shared
            .core
            .lock()
            .as_ref()
            .map_or(0, |c| c.sequencer.last_applied())
    }

    /// Observe every state change.
    pub fn on_state_change(
        &self,
        callback: impl Fn(Arc<SharedState>) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.hub.subscribe(callback)
    }

    /// Diagnostic events (published only while telemetry is enabled)
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> SyncStats {
        self.shared
            .core
            .lock()
            .as_ref()
            .map(|c| c.stats.clone())
            .unwrap_or_default()
    }

    /// Sequences still awaiting an ACK
    pub fn pending_acks(&self) -> Vec<u64> {
        self.shared
            .core
            .lock()
            .as_ref()
            .map(|c| c.reliability.pending_seqs())
            .unwrap_or_default()
    }

    /// Recently applied deltas, oldest first
    pub fn recent_deltas(&self) -> Vec<(u64, StateDelta)> {
        self.shared
            .core
            .lock()
            .as_ref()
            .map(|c| c.history.entries())
            .unwrap_or_default()
    }

    /// Validate and apply a local action.
    ///
    /// On the Authority the change is sequenced and broadcast; on a Replica
    /// it is applied optimistically and not sent. Returns the state's
    /// sequence after the action.
    pub fn apply_local_action(&self, action: LocalAction) -> SyncResult<u64> {
        self.with_core(|core| core.apply_local_action(action))
    }

    pub fn navigate(&self, view: &str, params: JsonMap) -> SyncResult<u64> {
        self.apply_local_action(LocalAction::Navigate {
            view: view.to_string(),
            params,
        })
    }

    pub fn share_packages(&self, packages: Vec<String>) -> SyncResult<u64> {
        self.apply_local_action(LocalAction::SharePackages(packages))
    }

    pub fn toggle_compare(&self, id: impl Into<String>) -> SyncResult<u64> {
        self.apply_local_action(LocalAction::ToggleCompare(id.into()))
    }

    pub fn set_compare(&self, ids: Vec<String>) -> SyncResult<u64> {
        self.apply_local_action(LocalAction::SetCompare(ids))
    }

    pub fn select(&self, id: impl Into<String>) -> SyncResult<u64> {
        self.apply_local_action(LocalAction::Select(id.into()))
    }

    pub fn unselect(&self, id: impl Into<String>) -> SyncResult<u64> {
        self.apply_local_action(LocalAction::Unselect(id.into()))
    }

    pub fn detail_action(&self, action: DetailAction) -> SyncResult<u64> {
        self.apply_local_action(LocalAction::Detail(action))
    }

    pub fn set_payment_step(&self, step: impl Into<String>) -> SyncResult<u64> {
        self.apply_local_action(LocalAction::PaymentStep(step.into()))
    }

    /// Record our pointer as fractions of the tracked element.
    ///
    /// Returns whether a CURSOR frame went out (Authority only, rate capped).
    pub fn update_cursor(&self, x_percent: f64, y_percent: f64) -> SyncResult<bool> {
        self.with_core(|core| Ok(core.update_cursor(x_percent, y_percent)))
    }

    /// Record an absolute pointer position tracked against `bounds`.
    pub fn update_cursor_in(&self, bounds: Rect, x: f64, y: f64) -> SyncResult<bool> {
        let (x_percent, y_percent) = bounds.fraction_of(x, y);
        self.update_cursor(x_percent, y_percent)
    }

    /// Record a container's scroll fractions.
    ///
    /// Returns whether a SCROLL frame went out immediately; a throttled
    /// sample is sent on the trailing edge of the window.
    pub fn update_scroll(
        &self,
        container_id: impl Into<String>,
        percent_y: f64,
        percent_x: f64,
    ) -> SyncResult<bool> {
        let container_id = container_id.into();
        self.with_core(|core| Ok(core.update_scroll(container_id, percent_y, percent_x)))
    }

    /// Broadcast a snapshot request (only the Authority answers).
    pub fn request_snapshot(&self, reason: ResyncReason) -> SyncResult<()> {
        self.with_core(|core| {
            core.request_snapshot(reason);
            Ok(())
        })
    }

    /// Broadcast a full snapshot. Authority only.
    pub fn send_snapshot(&self, reason: SnapshotReason) -> SyncResult<()> {
        self.with_core(|core| core.send_snapshot(reason))
    }

    /// Process one inbound frame.
    ///
    /// Malformed frames and frames for another session are dropped and
    /// reported as `Err`; they never disturb the state.
    pub fn handle_message(&self, raw: &str) -> SyncResult<()> {
        self.with_core(|core| core.handle_message(raw))
    }

    /// Prune stale cursors and broadcast presence. Driven by the heartbeat
    /// ticker.
    pub fn tick_heartbeat(&self) -> SyncResult<()> {
        self.with_core(|core| {
            core.heartbeat();
            Ok(())
        })
    }

    /// Run `f` against the live core of `epoch`, if it is still current.
    ///
    /// Returns false once that epoch has ended.
    fn with_epoch(&self, epoch: u64, f: impl FnOnce(&mut Core)) -> bool {
        self.with_core(|core| {
            if core.epoch != epoch {
                return Ok(false);
            }
            f(core);
            Ok(true)
        })
        .unwrap_or(false)
    }

    fn with_core<R>(&self, f: impl FnOnce(&mut Core) -> SyncResult<R>) -> SyncResult<R> {
        let (result, published) = {
            let mut guard = self.shared.core.lock();
            let core = guard.as_mut().ok_or(SyncError::NotInitialized)?;
            let span = core.span.clone();
            let _entered = span.enter();
            let result = f(core);
            let published = std::mem::take(&mut core.dirty)
                .then(|| (self.next_revision(), Arc::new(core.state.clone())));
            (result, published)
        };
        if let Some((revision, state)) = published {
            self.shared.hub.publish(revision, state);
        }
        result
    }

    fn next_revision(&self) -> u64 {
        self.shared.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn from_weak(weak: &Weak<SessionShared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }
}

impl Default for SyncSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything owned by one initialized epoch
struct Core {
    epoch: u64,
    role: Role,
    client_id: ClientId,
    session_id: SessionId,
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    runtime: Handle,
    me: Weak<SessionShared>,
    events: broadcast::Sender<SyncEvent>,
    span: Span,

    state: SharedState,
    dirty: bool,
    sequencer: Sequencer,
    reliability: ReliabilityLayer,
    history: DeltaHistory,
    cursor_throttle: CursorThrottle,
    scroll_throttle: ScrollThrottle,
    last_resync_request_ms: Option<i64>,
    stats: SyncStats,

    tasks: Vec<JoinHandle<()>>,
    scroll_timers: HashMap<String, JoinHandle<()>>,
}

impl Core {
    fn new(
        epoch: u64,
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        runtime: Handle,
        me: Weak<SessionShared>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        let SessionConfig {
            role,
            client_id,
            session_id,
            sync,
        } = config;
        let span = info_span!("sync_session", client_id = %client_id, role = %role);
        Self {
            epoch,
            role,
            client_id,
            state: SharedState::new(session_id.clone()),
            session_id,
            transport,
            clock,
            runtime,
            me,
            events,
            span,
            dirty: false,
            sequencer: Sequencer::new(),
            reliability: ReliabilityLayer::new(sync.ack_timeout(), sync.max_retries),
            history: DeltaHistory::new(sync.history_size),
            cursor_throttle: CursorThrottle::new(sync.cursor_interval().as_millis() as i64),
            scroll_throttle: ScrollThrottle::new(sync.scroll_throttle_ms as i64),
            last_resync_request_ms: None,
            stats: SyncStats::default(),
            tasks: Vec::new(),
            scroll_timers: HashMap::new(),
            config: sync,
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn start_tasks(&mut self) {
        self.spawn_listener();
        self.spawn_ticker(self.config.heartbeat_interval(), |core| core.heartbeat());
        if self.role.is_authority() {
            self.spawn_ticker(self.config.snapshot_interval(), |core| {
                if let Err(e) = core.send_snapshot(SnapshotReason::Interval) {
                    warn!(error = %e, "Periodic snapshot failed");
                }
            });
        } else {
            let me = self.me.clone();
            let epoch = self.epoch;
            let delay = self.config.bootstrap_delay();
            let task = self.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(session) = SyncSession::from_weak(&me) {
                    session.with_epoch(epoch, |core| core.request_snapshot(ResyncReason::Bootstrap));
                }
            }
            .instrument(self.span.clone()));
            self.tasks.push(task);
        }
    }

    fn spawn_listener(&mut self) {
        let mut inbound = self.transport.subscribe();
        let me = self.me.clone();
        let epoch = self.epoch;
        let task = self.runtime.spawn(async move {
            while let Some(event) = inbound.recv().await {
                let Some(session) = SyncSession::from_weak(&me) else {
                    break;
                };
                if !session.with_epoch(epoch, |core| core.handle_transport_event(event)) {
                    break;
                }
            }
            debug!(epoch, "Transport listener ended");
        }
        .instrument(self.span.clone()));
        self.tasks.push(task);
    }

    fn spawn_ticker(&mut self, period: Duration, tick: fn(&mut Core)) {
        let me = self.me.clone();
        let epoch = self.epoch;
        let task = self.runtime.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(session) = SyncSession::from_weak(&me) else {
                    break;
                };
                if !session.with_epoch(epoch, tick) {
                    break;
                }
            }
        }
        .instrument(self.span.clone()));
        self.tasks.push(task);
    }

    fn arm_retry(&mut self, seq: u64, generation: u64, first_delay: Duration) {
        let me = self.me.clone();
        let epoch = self.epoch;
        let task = self.runtime.spawn(async move {
            let mut delay = first_delay;
            loop {
                tokio::time::sleep(delay).await;
                let Some(session) = SyncSession::from_weak(&me) else {
                    return;
                };
                let mut next = None;
                session.with_epoch(epoch, |core| next = core.on_retry_timeout(seq, generation));
                match next {
                    Some(next_delay) => delay = next_delay,
                    None => return,
                }
            }
        }
        .instrument(self.span.clone()));
        self.reliability.attach_timer(seq, generation, task);
    }

    fn arm_scroll_flush(&mut self, container_id: String, delay: Duration) {
        let me = self.me.clone();
        let epoch = self.epoch;
        let key = container_id.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(session) = SyncSession::from_weak(&me) {
                session.with_epoch(epoch, |core| core.flush_scroll(&container_id));
            }
        }
        .instrument(self.span.clone()));
        if let Some(previous) = self.scroll_timers.insert(key, task) {
            previous.abort();
        }
    }

    fn cancel_timers(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for (_, task) in self.scroll_timers.drain() {
            task.abort();
        }
        self.reliability.cancel_all();
        self.scroll_throttle.clear();
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn emit(&mut self, event: SyncEvent) {
        self.stats.record(&event);
        if self.config.telemetry {
            let _ = self.events.send(event);
        }
    }

    fn encode(&self, message: &SyncMessage, seq: u64) -> SyncResult<String> {
        Envelope::seal(
            message,
            &self.session_id,
            seq,
            &self.client_id,
            self.clock.now_ms(),
        )?
        .to_json()
    }

    fn send_frame(&mut self, op: &str, frame: String, to: Option<&ClientId>) {
        let bytes = frame.len();
        if bytes > self.config.max_envelope_bytes {
            warn!(op, bytes, limit = self.config.max_envelope_bytes, "Oversized envelope");
            self.emit(SyncEvent::OversizedEnvelope {
                op: op.to_string(),
                bytes,
            });
        }
        if let Err(e) = self.transport.send(frame, to) {
            warn!(op, error = %e, "Failed to send frame");
            self.emit(SyncEvent::SendFailed {
                op: op.to_string(),
                error: e.to_string(),
            });
        }
    }

    /// Encode and send an unsequenced message stamped with the current seq.
    fn broadcast(&mut self, message: SyncMessage) {
        self.send_to(message, None);
    }

    fn send_to(&mut self, message: SyncMessage, to: Option<&ClientId>) {
        let op = message.op();
        match self.encode(&message, self.sequencer.last_applied()) {
            Ok(frame) => self.send_frame(op.as_str(), frame, to),
            Err(e) => warn!(%op, error = %e, "Failed to encode message"),
        }
    }

    // ------------------------------------------------------------------
    // Local actions
    // ------------------------------------------------------------------

    fn reject(&mut self, action: &str, error: SyncError) -> SyncError {
        warn!(action, role = %self.role, error = %error, "Action rejected");
        self.emit(SyncEvent::ActionRejected {
            action: action.to_string(),
            reason: error.to_string(),
        });
        error
    }

    fn apply_local_action(&mut self, action: LocalAction) -> SyncResult<u64> {
        if let Err(e) = action.check_permission(self.role) {
            return Err(self.reject(action.name(), e));
        }
        let delta = match action.to_delta(&self.state, self.role) {
            Ok(delta) => delta,
            Err(e) => return Err(self.reject(action.name(), e)),
        };

        if self.role.is_authority() {
            Ok(self.commit_authoritative(delta))
        } else {
            delta.apply_to(&mut self.state);
            self.dirty = true;
            debug!(action = action.name(), "Applied optimistic local action");
            Ok(self.state.seq)
        }
    }

    /// Apply, stamp, record, broadcast and track one authoritative delta.
    fn commit_authoritative(&mut self, delta: StateDelta) -> u64 {
        delta.apply_to(&mut self.state);
        let seq = self.sequencer.stamp();
        self.state.seq = seq;
        self.state.last_updated_by = Some(Role::Authority);
        self.history.push(seq, delta.clone());
        self.dirty = true;

        let message = SyncMessage::Delta(DeltaPayload { delta });
        match self.encode(&message, seq) {
            Ok(frame) => {
                self.send_frame(message.op().as_str(), frame.clone(), None);
                let generation = self.reliability.track(seq, frame);
                let first_delay = self.reliability.delay_for(1);
                self.arm_retry(seq, generation, first_delay);
                debug!(seq, "Broadcast delta");
                self.emit(SyncEvent::DeltaSent { seq });
            }
            Err(e) => warn!(seq, error = %e, "Failed to encode delta"),
        }
        seq
    }

    fn on_retry_timeout(&mut self, seq: u64, generation: u64) -> Option<Duration> {
        match self.reliability.on_timeout(seq, generation) {
            RetryDecision::Stale => None,
            RetryDecision::Retransmit {
                frame,
                attempt,
                next_delay,
            } => {
                debug!(seq, attempt, "Retransmitting unacknowledged delta");
                self.send_frame("DELTA", frame, None);
                self.emit(SyncEvent::Retransmitted { seq, attempt });
                Some(next_delay)
            }
            RetryDecision::Exhausted { attempts } => {
                warn!(seq, attempts, "Delta presumed lost");
                self.emit(SyncEvent::DeltaPresumedLost { seq, attempts });
                None
            }
        }
    }

    fn update_cursor(&mut self, x_percent: f64, y_percent: f64) -> bool {
        let now = self.clock.now_ms();
        self.state.cursors.insert(
            self.client_id.to_string(),
            CursorPosition {
                x_percent,
                y_percent,
                last_seen_seq: self.state.seq,
                timestamp: now,
            },
        );
        self.dirty = true;

        if !self.role.is_authority() || !self.cursor_throttle.admit(now) {
            return false;
        }
        self.broadcast(SyncMessage::Cursor(CursorPayload {
            x_percent,
            y_percent,
            user_id: self.client_id.to_string(),
        }));
        true
    }

    fn update_scroll(&mut self, container_id: String, percent_y: f64, percent_x: f64) -> bool {
        let now = self.clock.now_ms();
        self.state.scroll_positions.insert(
            container_id.clone(),
            ScrollPosition {
                percent_y,
                percent_x,
                timestamp: now,
            },
        );
        self.dirty = true;

        let sample = ScrollPayload {
            container_id: container_id.clone(),
            percent_y,
            percent_x,
        };
        match self.scroll_throttle.offer(sample.clone(), now) {
            ScrollDecision::SendNow => {
                self.broadcast(SyncMessage::Scroll(sample));
                true
            }
            ScrollDecision::Schedule { delay_ms } => {
                self.arm_scroll_flush(container_id, Duration::from_millis(delay_ms.max(0) as u64));
                false
            }
            ScrollDecision::Coalesced => false,
        }
    }

    fn flush_scroll(&mut self, container_id: &str) {
        let now = self.clock.now_ms();
        if let Some(sample) = self.scroll_throttle.take_pending(container_id, now) {
            trace!(container_id, "Trailing scroll flush");
            self.broadcast(SyncMessage::Scroll(sample));
        }
        self.scroll_timers.remove(container_id);
    }

    fn send_snapshot(&mut self, reason: SnapshotReason) -> SyncResult<()> {
        if !self.role.is_authority() {
            return Err(self.reject(
                "send-snapshot",
                SyncError::NotAuthority("send-snapshot".into()),
            ));
        }
        let seq = self.sequencer.last_applied();
        self.broadcast(snapshot::snapshot_message(&self.state, reason));
        debug!(seq, %reason, "Broadcast snapshot");
        self.emit(SyncEvent::SnapshotSent {
            seq,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn request_snapshot(&mut self, reason: ResyncReason) {
        self.last_resync_request_ms = Some(self.clock.now_ms());
        self.broadcast(snapshot::request_message(reason));
        info!(%reason, "Requested snapshot");
        self.emit(SyncEvent::SnapshotRequested {
            reason: reason.to_string(),
        });
    }

    fn heartbeat(&mut self) {
        let now = self.clock.now_ms();
        let ttl = self.config.cursor_ttl_ms as i64;
        let pruned = presence::prune_stale(&mut self.state.cursors, now, ttl);
        if !pruned.is_empty() {
            debug!(?pruned, "Pruned stale cursors");
            self.dirty = true;
        }
        self.broadcast(SyncMessage::Heartbeat(HeartbeatPayload {
            cursors: self.state.cursors.clone(),
        }));
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message { data, .. } => {
                // Errors are already logged and counted.
                let _ = self.handle_message(&data);
            }
            TransportEvent::PeerJoined(peer_id) => {
                info!(peer = %peer_id, "Peer joined");
                self.emit(SyncEvent::PeerJoined {
                    peer_id: peer_id.clone(),
                });
                if self.role.is_authority() {
                    let _ = self.send_snapshot(SnapshotReason::PeerJoined);
                }
            }
            TransportEvent::PeerLeft(peer_id) => {
                info!(peer = %peer_id, "Peer left");
                if self.state.cursors.remove(peer_id.as_str()).is_some() {
                    self.dirty = true;
                }
                self.emit(SyncEvent::PeerLeft { peer_id });
            }
            TransportEvent::Disconnected => {
                warn!(client_id = %self.client_id, "Transport disconnected");
                self.emit(SyncEvent::Disconnected);
            }
        }
    }

    fn handle_message(&mut self, raw: &str) -> SyncResult<()> {
        let envelope = match Envelope::from_json(raw) {
            Ok(envelope) => envelope,
            Err(e) => return Err(self.malformed(e)),
        };
        if envelope.client_id == self.client_id {
            trace!(op = %envelope.op, "Ignoring self-originated envelope");
            return Ok(());
        }
        if envelope.session_id != self.session_id {
            debug!(op = %envelope.op, session = %envelope.session_id, "Envelope for another session");
            return Err(SyncError::SessionMismatch {
                expected: self.session_id.to_string(),
                actual: envelope.session_id.to_string(),
            });
        }
        let message = match envelope.open() {
            Ok(message) => message,
            Err(e) => return Err(self.malformed(e)),
        };

        trace!(op = %envelope.op, seq = envelope.seq, from = %envelope.client_id, "Inbound envelope");
        match message {
            SyncMessage::Delta(payload) => self.on_delta(&envelope, payload.delta),
            SyncMessage::Snapshot(payload) => {
                let previous = snapshot::restore(
                    &mut self.state,
                    &mut self.sequencer,
                    payload,
                    envelope.seq,
                );
                self.last_resync_request_ms = None;
                self.dirty = true;
                info!(seq = envelope.seq, previous_seq = previous, "Applied snapshot");
                self.emit(SyncEvent::SnapshotApplied {
                    seq: envelope.seq,
                    previous_seq: previous,
                });
            }
            SyncMessage::SnapshotRequest(payload) => {
                if self.role.is_authority() {
                    debug!(reason = %payload.reason, from = %envelope.client_id, "Snapshot requested");
                    self.send_snapshot(SnapshotReason::Requested)?;
                }
            }
            SyncMessage::Ack => {
                if self.role.is_authority() {
                    if self.reliability.acknowledge(envelope.seq) {
                        trace!(seq = envelope.seq, from = %envelope.client_id, "Delta acknowledged");
                        self.emit(SyncEvent::AckReceived {
                            seq: envelope.seq,
                            from: envelope.client_id.clone(),
                        });
                    } else {
                        trace!(seq = envelope.seq, "ACK for untracked sequence");
                    }
                }
            }
            SyncMessage::Heartbeat(payload) => {
                let now = self.clock.now_ms();
                let ttl = self.config.cursor_ttl_ms as i64;
                if presence::merge_heartbeat(
                    &mut self.state.cursors,
                    self.client_id.as_str(),
                    payload.cursors,
                    envelope.timestamp,
                    now,
                    ttl,
                ) {
                    self.dirty = true;
                }
            }
            SyncMessage::Cursor(payload) => {
                let now = self.clock.now_ms();
                self.state.cursors.insert(
                    payload.user_id,
                    CursorPosition {
                        x_percent: payload.x_percent,
                        y_percent: payload.y_percent,
                        last_seen_seq: envelope.seq,
                        timestamp: now,
                    },
                );
                self.dirty = true;
            }
            SyncMessage::Scroll(payload) => {
                let now = self.clock.now_ms();
                self.state.scroll_positions.insert(
                    payload.container_id,
                    ScrollPosition {
                        percent_y: payload.percent_y,
                        percent_x: payload.percent_x,
                        timestamp: now,
                    },
                );
                self.dirty = true;
            }
        }
        Ok(())
    }

    fn malformed(&mut self, error: SyncError) -> SyncError {
        warn!(error = %error, "Dropping malformed envelope");
        self.emit(SyncEvent::MalformedEnvelope {
            error: error.to_string(),
        });
        error
    }

    fn on_delta(&mut self, envelope: &Envelope, delta: StateDelta) {
        let seq = envelope.seq;
        if self.role.is_authority() {
            debug!(seq, from = %envelope.client_id, "Authority ignoring foreign delta");
            return;
        }

        match self.sequencer.classify(seq) {
            SeqVerdict::Next => {
                delta.apply_to(&mut self.state);
                self.sequencer.advance(seq);
                self.state.seq = seq;
                self.state.last_updated_by = Some(Role::Authority);
                self.history.push(seq, delta);
                self.dirty = true;
                debug!(seq, "Applied delta");
                self.emit(SyncEvent::DeltaApplied { seq });

                match self.encode(&SyncMessage::Ack, seq) {
                    Ok(frame) => {
                        self.send_frame("ACK", frame, Some(&envelope.client_id));
                        self.stats.acks_sent += 1;
                    }
                    Err(e) => warn!(seq, error = %e, "Failed to encode ACK"),
                }
            }
            SeqVerdict::Duplicate => {
                let last_applied = self.sequencer.last_applied();
                debug!(seq, last_applied, "Dropping duplicate delta");
                self.emit(SyncEvent::DuplicateDelta { seq, last_applied });
            }
            SeqVerdict::Gap { expected } => {
                warn!(seq, expected, "Sequence gap, dropping delta and resyncing");
                self.emit(SyncEvent::GapDetected { seq, expected });
                let now = self.clock.now_ms();
                let recently_requested = self
                    .last_resync_request_ms
                    .is_some_and(|at| now - at < self.config.ack_timeout_ms as i64);
                if recently_requested {
                    debug!(seq, "Resync already requested");
                } else {
                    self.request_snapshot(ResyncReason::Gap);
                }
            }
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}
