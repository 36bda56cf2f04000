//! # Telemetry Engine
//!
//! Event-driven update scheduler and transaction engine on top of UAVTalk.
//!
//! Object events flow into two bounded FIFO queues (priority first) and are
//! drained through a transaction table that allows at most one in-flight
//! transaction per object id, with timeout-driven retry and a fatal cancel
//! once the retry budget is exhausted. A single recurring timer advances
//! per-object countdowns for periodic traffic, and a connection gate keeps
//! everything but the handshake objects off the wire while disconnected.
//!
//! The engine runs as one tokio task owning all state. External callers —
//! object event sources, the UAVTalk codec, stats readers — talk to it
//! through a cloneable [`TelemetryHandle`], which marshals commands onto
//! the engine loop.

mod events;
mod subscription;
mod transaction;
mod wheel;

pub use events::{EventKind, EventMask};

use crate::error::{GcsTelemetryError, Result};
use crate::objects::{
    ObjId, ObjectRegistry, RegistryEvent, UavObject, UpdateMode, GCS_TELEMETRY_STATS,
    OBJECT_PERSISTENCE, OPLINK_SETTINGS,
};
use crate::uavtalk::{ConnectionStatus, UavTalkLink};
use events::QueuedEvent;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use subscription::SubscriptionTable;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use transaction::{Transaction, TransactionTable};
use wheel::UpdateWheel;

/// Bound on each of the two event queues
pub const MAX_QUEUE_SIZE: usize = 20;

/// Retries before a transaction is declared failed
pub const MAX_RETRIES: u32 = 2;

/// Per-attempt transaction deadline in milliseconds
pub const REQ_TIMEOUT_MS: u64 = 250;

/// Floor on the update wheel's re-arm interval
pub const MIN_UPDATE_PERIOD_MS: i32 = 1;

/// Ceiling on the update wheel's re-arm interval
pub const MAX_UPDATE_PERIOD_MS: i32 = 1000;

/// Objects allowed to transact while the connection is not established
const CONNECTION_WHITELIST: [ObjId; 3] =
    [GCS_TELEMETRY_STATS, OPLINK_SETTINGS, OBJECT_PERSISTENCE];

/// Telemetry counters: the codec's own numbers plus the engine's local
/// error and retry counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_object_bytes: u64,
    pub rx_object_bytes: u64,
    pub rx_objects: u32,
    pub tx_objects: u32,
    /// Local queue/transaction failures plus the codec's transmit errors
    pub tx_errors: u32,
    pub rx_errors: u32,
    /// Transaction reissues after timeout (local only)
    pub tx_retries: u32,
}

enum Command {
    ObjectEvent {
        obj: Arc<UavObject>,
        kind: EventKind,
    },
    TransactionCompleted {
        id: ObjId,
        success: bool,
    },
    GetStats {
        reply: oneshot::Sender<TelemetryStats>,
    },
    ResetStats,
    Shutdown,
}

/// Cloneable front door to the engine.
///
/// Every method marshals a command onto the engine loop; calls from foreign
/// threads are safe and non-blocking. Commands to a stopped engine are
/// silently dropped, except [`TelemetryHandle::stats`] which reports it.
#[derive(Clone)]
pub struct TelemetryHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl TelemetryHandle {
    fn event(&self, obj: &Arc<UavObject>, kind: EventKind) {
        let _ = self.commands.send(Command::ObjectEvent {
            obj: Arc::clone(obj),
            kind,
        });
    }

    /// The object changed through a local auto-update
    pub fn object_updated(&self, obj: &Arc<UavObject>) {
        self.event(obj, EventKind::Updated);
    }

    /// The user explicitly updated the object
    pub fn object_updated_manual(&self, obj: &Arc<UavObject>) {
        self.event(obj, EventKind::UpdatedManual);
    }

    /// The object reported its own periodic update
    pub fn object_updated_periodic(&self, obj: &Arc<UavObject>) {
        self.event(obj, EventKind::UpdatedPeriodic);
    }

    /// The codec decoded an incoming copy of the object
    pub fn object_unpacked(&self, obj: &Arc<UavObject>) {
        self.event(obj, EventKind::Unpacked);
    }

    /// Local code wants the remote copy of the object
    pub fn update_requested(&self, obj: &Arc<UavObject>) {
        self.event(obj, EventKind::UpdateRequested);
    }

    /// Codec callback: the pending transaction for `id` settled
    pub fn transaction_completed(&self, id: ObjId, success: bool) {
        let _ = self
            .commands
            .send(Command::TransactionCompleted { id, success });
    }

    /// Aggregated engine + codec counters
    pub async fn stats(&self) -> Result<TelemetryStats> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::GetStats { reply: tx })
            .map_err(|_| GcsTelemetryError::EngineStopped)?;
        rx.await.map_err(|_| GcsTelemetryError::EngineStopped)
    }

    /// Zero both the engine's and the codec's counters
    pub fn reset_stats(&self) {
        let _ = self.commands.send(Command::ResetStats);
    }

    /// Stop the engine: pending queued events are discarded and in-flight
    /// transactions are dropped without completion signals
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// The telemetry engine task. Build with [`Telemetry::new`], then drive it
/// with [`Telemetry::run`] on the runtime.
pub struct Telemetry {
    registry: Arc<ObjectRegistry>,
    link: Arc<dyn UavTalkLink>,
    status: watch::Receiver<ConnectionStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
    registry_events: mpsc::UnboundedReceiver<RegistryEvent>,
    subscriptions: SubscriptionTable,
    wheel: UpdateWheel,
    transactions: TransactionTable,
    prio_queue: VecDeque<QueuedEvent>,
    regular_queue: VecDeque<QueuedEvent>,
    next_tick: Instant,
    tx_errors: u32,
    tx_retries: u32,
    running: bool,
}

impl Telemetry {
    /// Build the engine. Every object already in the registry is registered
    /// for updates, and catalog notifications keep the binding current.
    ///
    /// `status` is the read-only view of the connection handshake;
    /// `rng_seed` feeds the phase de-bunching of periodic objects.
    pub fn new(
        registry: Arc<ObjectRegistry>,
        link: Arc<dyn UavTalkLink>,
        status: watch::Receiver<ConnectionStatus>,
        rng_seed: u64,
    ) -> (Self, TelemetryHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let registry_events = registry.subscribe();

        let mut engine = Self {
            link,
            status,
            commands: commands_rx,
            registry_events,
            subscriptions: SubscriptionTable::default(),
            wheel: UpdateWheel::new(rng_seed),
            transactions: TransactionTable::default(),
            prio_queue: VecDeque::new(),
            regular_queue: VecDeque::new(),
            // First wheel pass one second after construction
            next_tick: Instant::now() + Duration::from_secs(1),
            tx_errors: 0,
            tx_retries: 0,
            running: true,
            registry,
        };

        for obj in engine.registry.objects() {
            engine.register_object(&obj);
        }

        (
            engine,
            TelemetryHandle {
                commands: commands_tx,
            },
        )
    }

    /// Engine loop: commands, catalog notifications, the periodic wheel and
    /// transaction deadlines, serialized on one task. Returns when a
    /// shutdown command arrives or every handle is dropped.
    pub async fn run(mut self) {
        info!("telemetry engine started");
        while self.running {
            let transaction_deadline = self.transactions.next_deadline();
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    self.dispatch(command);
                    // Ingest the whole burst before draining, so admission
                    // control sees the queues as they fill
                    while self.running {
                        match self.commands.try_recv() {
                            Ok(command) => self.dispatch(command),
                            Err(_) => break,
                        }
                    }
                }
                event = self.registry_events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_registry_event(event);
                    while let Ok(event) = self.registry_events.try_recv() {
                        self.handle_registry_event(event);
                    }
                }
                _ = time::sleep_until(self.next_tick) => {
                    self.process_periodic_updates();
                }
                _ = Self::sleep_until_deadline(transaction_deadline) => {
                    self.process_transaction_timeouts();
                }
            }
            self.drain_queues();
        }

        let discarded = self.prio_queue.len() + self.regular_queue.len();
        self.prio_queue.clear();
        self.regular_queue.clear();
        let in_flight = self.transactions.len();
        self.transactions.clear();
        info!(discarded, in_flight, "telemetry engine stopped");
    }

    async fn sleep_until_deadline(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }

    fn dispatch(&mut self, command: Command) {
        match command {
            Command::ObjectEvent { obj, kind } => self.object_event(obj, kind),
            Command::TransactionCompleted { id, success } => {
                self.transaction_completed(id, success)
            }
            Command::GetStats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::ResetStats => self.reset_stats(),
            Command::Shutdown => self.running = false,
        }
    }

    fn handle_registry_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::NewObject(obj) | RegistryEvent::NewInstance(obj) => {
                self.register_object(&obj);
            }
        }
    }

    /// Track a (possibly new) object type and install its subscription set
    fn register_object(&mut self, obj: &Arc<UavObject>) {
        self.wheel.register(obj);
        self.update_object(obj, EventKind::None);
    }

    /// Subscription binder: derive the event mask for the object's update
    /// mode and replace the subscriptions of all its instances.
    ///
    /// For THROTTLED objects the mask depends on the triggering event: a
    /// periodic tick re-admits the periodic event, anything else narrows
    /// the mask to change events until the next tick.
    fn update_object(&mut self, obj: &Arc<UavObject>, event: EventKind) {
        let metadata = obj.metadata();
        let mut mask = match metadata.update_mode {
            UpdateMode::Periodic => {
                self.wheel.set_period(obj.id(), metadata.update_period_ms);
                EventMask::UPDATED_MANUAL
                    | EventMask::UPDATE_REQUESTED
                    | EventMask::UPDATED_PERIODIC
            }
            UpdateMode::OnChange => {
                self.wheel.set_period(obj.id(), 0);
                EventMask::UPDATED | EventMask::UPDATED_MANUAL | EventMask::UPDATE_REQUESTED
            }
            UpdateMode::Throttled => {
                if matches!(event, EventKind::None | EventKind::UpdatedPeriodic) {
                    if event == EventKind::None {
                        self.wheel.set_period(obj.id(), metadata.update_period_ms);
                    }
                    EventMask::UPDATED
                        | EventMask::UPDATED_MANUAL
                        | EventMask::UPDATE_REQUESTED
                        | EventMask::UPDATED_PERIODIC
                } else {
                    EventMask::UPDATED | EventMask::UPDATED_MANUAL | EventMask::UPDATE_REQUESTED
                }
            }
            UpdateMode::Manual => {
                self.wheel.set_period(obj.id(), 0);
                EventMask::UPDATED_MANUAL | EventMask::UPDATE_REQUESTED
            }
        };
        if obj.is_meta() {
            // Remote metadata edits must be observed
            mask |= EventMask::UNPACKED;
        }
        self.subscriptions
            .apply(&self.registry.instances(obj.id()), mask);
    }

    /// Intake of a subscription-gated event
    fn object_event(&mut self, obj: Arc<UavObject>, kind: EventKind) {
        if !self.subscriptions.admits(&obj, kind) {
            debug!(object = obj.name(), ?kind, "event not admitted by subscription mask");
            return;
        }
        self.process_object_updates(obj, kind, false, true);
    }

    /// Queue admission. Overflow fails the event immediately: the error
    /// counter bumps and the object observes a failed transaction.
    fn process_object_updates(
        &mut self,
        obj: Arc<UavObject>,
        kind: EventKind,
        all_instances: bool,
        priority: bool,
    ) {
        let event = QueuedEvent {
            obj,
            kind,
            all_instances,
        };
        let queue = if priority {
            &mut self.prio_queue
        } else {
            &mut self.regular_queue
        };
        if queue.len() < MAX_QUEUE_SIZE {
            queue.push_back(event);
        } else {
            self.tx_errors += 1;
            event.obj.notify_transaction(false);
            if priority {
                warn!(object = event.obj.name(), "priority event queue full, event lost");
            } else {
                debug!(object = event.obj.name(), "event queue full, event lost");
            }
        }
        // Queues are drained when the current dispatch round finishes
    }

    fn drain_queues(&mut self) {
        while self.process_object_queue() {}
    }

    /// One drain step: dequeue (priority first), gate, transact, and give
    /// the binder its touch-up. Returns false once both queues are empty.
    fn process_object_queue(&mut self) -> bool {
        let Some(event) = self
            .prio_queue
            .pop_front()
            .or_else(|| self.regular_queue.pop_front())
        else {
            return false;
        };

        // Connection gate: while the handshake is not complete, drop all
        // regular traffic and fail everything but the handshake objects.
        if *self.status.borrow() != ConnectionStatus::Connected {
            self.regular_queue.clear();
            if !CONNECTION_WHITELIST.contains(&event.obj.id()) {
                event.obj.notify_transaction(false);
                return true;
            }
        }

        let metadata = event.obj.metadata();
        // No wire traffic for incoming objects, nor for the periodic tick
        // of a throttled object (there it is a control signal for the
        // binder)
        let throttled_tick = event.kind == EventKind::UpdatedPeriodic
            && metadata.update_mode == UpdateMode::Throttled;
        if event.kind != EventKind::Unpacked && !throttled_tick {
            if self.transactions.contains(event.obj.id()) {
                debug!(
                    object = event.obj.name(),
                    "starting a transaction while the previous one is still in flight"
                );
            }
            self.transactions.insert(Transaction {
                obj: Arc::clone(&event.obj),
                all_instances: event.all_instances,
                acked: metadata.acked,
                obj_request: event.kind == EventKind::UpdateRequested,
                retries_remaining: MAX_RETRIES,
                deadline: None,
            });
            self.process_object_transaction(event.obj.id());
        }

        // Binder touch-up: a meta-object dequeue means the parent's
        // metadata may have changed; everything else re-derives its own
        // mask (the throttled toggle lives here).
        if let Some(parent) = event.obj.parent_object() {
            self.update_object(&parent, EventKind::None);
        } else {
            self.update_object(&event.obj, event.kind);
        }

        true
    }

    /// Issue (or reissue) the transaction for `id` on the link and arm its
    /// deadline when a response is expected. Fire-and-forget sends settle
    /// immediately.
    fn process_object_transaction(&mut self, id: ObjId) {
        let Some(transaction) = self.transactions.get_mut(id) else {
            return;
        };
        if transaction.obj_request {
            self.link
                .send_object_request(&transaction.obj, transaction.all_instances);
        } else {
            self.link
                .send_object(&transaction.obj, transaction.acked, transaction.all_instances);
        }
        if transaction.expects_response() {
            transaction.deadline = Some(Instant::now() + Duration::from_millis(REQ_TIMEOUT_MS));
            return;
        }
        self.transactions.remove(id);
    }

    /// Codec callback: settle the pending transaction for `id`
    fn transaction_completed(&mut self, id: ObjId, success: bool) {
        match self.transactions.remove(id) {
            Some(transaction) => {
                transaction.obj.notify_transaction(success);
                // The dispatch-round trampoline drains the next event
            }
            None => debug!(id = %id, "unexpected transaction completion"),
        }
    }

    /// Deadline sweep: reissue while retries remain, cancel otherwise
    fn process_transaction_timeouts(&mut self) {
        let now = Instant::now();
        for id in self.transactions.expired(now) {
            let retry = match self.transactions.get_mut(id) {
                Some(transaction) if transaction.retries_remaining > 0 => {
                    transaction.retries_remaining -= 1;
                    true
                }
                Some(_) => false,
                None => continue,
            };
            if retry {
                self.process_object_transaction(id);
                self.tx_retries += 1;
            } else if let Some(transaction) = self.transactions.remove(id) {
                self.link.cancel_transaction(&transaction.obj);
                transaction.obj.notify_transaction(false);
                self.tx_errors += 1;
                warn!(
                    object = transaction.obj.name(),
                    "transaction failed after {} retries", MAX_RETRIES
                );
            }
        }
    }

    /// One pass of the update wheel: advance every countdown by the elapsed
    /// interval, emit periodic events for entries that came due, and re-arm
    /// the timer for the smallest pending delay.
    fn process_periodic_updates(&mut self) {
        let mut min_delay = MAX_UPDATE_PERIOD_MS;
        for index in 0..self.wheel.len() {
            if let Some(obj) = self.wheel.advance(index) {
                let started = Instant::now();
                self.process_object_updates(obj, EventKind::UpdatedPeriodic, true, false);
                let spent = started.elapsed().as_millis().min(i32::MAX as u128) as i32;
                self.wheel.add_elapsed(spent);
            }
            if let Some(delay) = self.wheel.pending_delay(index) {
                min_delay = min_delay.min(delay);
            }
        }
        let delay = min_delay.clamp(MIN_UPDATE_PERIOD_MS, MAX_UPDATE_PERIOD_MS);
        self.wheel.set_delta(delay);
        self.next_tick = Instant::now() + Duration::from_millis(delay as u64);
    }

    fn stats(&self) -> TelemetryStats {
        let link = self.link.stats();
        TelemetryStats {
            tx_bytes: link.tx_bytes,
            rx_bytes: link.rx_bytes,
            tx_object_bytes: link.tx_object_bytes,
            rx_object_bytes: link.rx_object_bytes,
            rx_objects: link.rx_objects,
            tx_objects: link.tx_objects,
            tx_errors: link.tx_errors + self.tx_errors,
            rx_errors: link.rx_errors,
            tx_retries: self.tx_retries,
        }
    }

    fn reset_stats(&mut self) {
        self.link.reset_stats();
        self.tx_errors = 0;
        self.tx_retries = 0;
    }
}

#[cfg(test)]
mod tests;
