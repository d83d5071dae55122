/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

#![allow(clippy::module_name_repetitions)]

use std::collections::{HashMap, VecDeque};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::Channel;
use tokio::sync::{watch, Notify, RwLock};
use tracing::{error, info, warn};

use relayq_broker::{
    agent_response_queue, ensure_org_topology, ensure_response_topology, publish_response, Broker,
    BrokerError,
};
use relayq_client::{spawn_depth_sampler, BackpressureController, Producer, PublishOutcome};
use relayq_config::{Config, CoordinatorConfig};
use relayq_protocol::{Priority, RequestMessage, Response, ResponseBody};
use relayq_store::{spawn_writer, AuditHandle, AuditRecord, DlqRecord, Store, StoreError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const SERVICE_NAME: &str = "coordinator";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const TOPOLOGY_ATTEMPTS: u32 = 5;
/// Unacked ceiling on the shared response channel; this is what makes the
/// `block` overflow policy exert real backpressure on the broker.
const RESPONSE_PREFETCH: u16 = 100;

const EXIT_CONFIG: i32 = 2;
const EXIT_BROKER: i32 = 3;
const EXIT_STORE: i32 = 4;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("config error: {0}")]
    Config(String),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("agent not registered: {0}")]
    UnknownAgent(String),
}

impl RelayError {
    fn exit_code(&self) -> i32 {
        match self {
            RelayError::Config(_) => EXIT_CONFIG,
            RelayError::Broker(_) => EXIT_BROKER,
            RelayError::Store(_) => EXIT_STORE,
            RelayError::UnknownAgent(_) => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Mailboxes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OverflowPolicy {
    /// Stop consuming for this agent until the mailbox drains.
    Block,
    /// Discard the oldest non-P0 frame to make room.
    DropOldestNonP0,
}

impl OverflowPolicy {
    fn parse(value: &str) -> OverflowPolicy {
        match value {
            "drop_oldest_non_p0" => OverflowPolicy::DropOldestNonP0,
            "block" => OverflowPolicy::Block,
            other => {
                warn!(policy = other, "unknown overflow policy, using block");
                OverflowPolicy::Block
            }
        }
    }
}

enum PushOutcome {
    Stored,
    /// A frame was displaced to make room; the caller emits the
    /// `progress{note:dropped}` notice for it.
    Displaced(Response),
    /// Mailbox full under the block policy (or full of P0 frames).
    Full,
}

struct MailboxInner {
    frames: VecDeque<Response>,
    full_since: Option<Instant>,
    last_poll: Instant,
    dropped: u64,
}

/// Bounded in-memory buffer between the broker consumer and one local
/// agent. Frames arrive from the consumer task and leave through
/// [`Mailbox::pop`] / [`Mailbox::pop_matching`].
struct Mailbox {
    capacity: usize,
    policy: OverflowPolicy,
    inner: Mutex<MailboxInner>,
    notify: Notify,
}

impl Mailbox {
    fn new(capacity: usize, policy: OverflowPolicy) -> Mailbox {
        Mailbox {
            capacity,
            policy,
            inner: Mutex::new(MailboxInner {
                frames: VecDeque::new(),
                full_since: None,
                last_poll: Instant::now(),
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn push(&self, frame: Response) -> PushOutcome {
        let Ok(mut inner) = self.inner.lock() else {
            return PushOutcome::Full;
        };
        if inner.frames.len() < self.capacity {
            inner.frames.push_back(frame);
            inner.full_since = None;
            drop(inner);
            self.notify.notify_waiters();
            return PushOutcome::Stored;
        }
        match self.policy {
            OverflowPolicy::Block => {
                if inner.full_since.is_none() {
                    inner.full_since = Some(Instant::now());
                }
                PushOutcome::Full
            }
            OverflowPolicy::DropOldestNonP0 => {
                let victim = inner
                    .frames
                    .iter()
                    .position(|f| f.priority != Some(Priority::P0));
                match victim {
                    Some(index) => {
                        let displaced = inner.frames.remove(index);
                        inner.frames.push_back(frame);
                        inner.dropped += 1;
                        inner.full_since = None;
                        drop(inner);
                        self.notify.notify_waiters();
                        match displaced {
                            Some(displaced) => PushOutcome::Displaced(displaced),
                            None => PushOutcome::Stored,
                        }
                    }
                    None => {
                        // Every buffered frame is P0; nothing may be dropped.
                        if inner.full_since.is_none() {
                            inner.full_since = Some(Instant::now());
                        }
                        PushOutcome::Full
                    }
                }
            }
        }
    }

    fn try_pop(&self) -> Option<Response> {
        let mut inner = self.inner.lock().ok()?;
        inner.last_poll = Instant::now();
        let frame = inner.frames.pop_front();
        if frame.is_some() {
            inner.full_since = None;
            drop(inner);
            self.notify.notify_waiters();
        }
        frame
    }

    async fn pop(&self) -> Response {
        loop {
            // Register the waiter before re-checking so a push between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            notified.await;
        }
    }

    /// Remove the first buffered frame for a specific request, leaving
    /// other requests' frames in place.
    fn pop_matching(&self, request_id: &str) -> Option<Response> {
        let mut inner = self.inner.lock().ok()?;
        inner.last_poll = Instant::now();
        let index = inner
            .frames
            .iter()
            .position(|f| f.request_id == request_id)?;
        let frame = inner.frames.remove(index);
        if frame.is_some() {
            inner.full_since = None;
            drop(inner);
            self.notify.notify_waiters();
        }
        frame
    }

    fn drain(&self) -> Vec<Response> {
        let Ok(mut inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner.full_since = None;
        inner.frames.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.inner.lock().map(|i| i.frames.len()).unwrap_or(0)
    }

    fn full_for(&self) -> Option<Duration> {
        self.inner
            .lock()
            .ok()
            .and_then(|i| i.full_since.map(|at| at.elapsed()))
    }

    fn idle_for(&self) -> Duration {
        self.inner
            .lock()
            .map(|i| i.last_poll.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    fn dropped(&self) -> u64 {
        self.inner.lock().map(|i| i.dropped).unwrap_or(0)
    }

    async fn wait_for_space(&self) {
        loop {
            let notified = self.notify.notified();
            {
                let Ok(inner) = self.inner.lock() else { return };
                if inner.frames.len() < self.capacity {
                    return;
                }
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Agent registrations
// ---------------------------------------------------------------------------

struct AgentEntry {
    agent_id: String,
    mailbox: Arc<Mailbox>,
    consumer_tag: String,
    active: AtomicBool,
    misroutes: AtomicU32,
}

/// Handle returned by [`Coordinator::register`]; the agent's view of its
/// subscription.
pub struct SubscriptionHandle {
    agent_id: String,
    mailbox: Arc<Mailbox>,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Next response for this agent, in delivery order. Each call counts
    /// as an agent heartbeat for the liveness loop.
    pub async fn recv(&self) -> Response {
        self.mailbox.pop().await
    }

    /// Lazy finite sequence of frames for one request, ending at the
    /// terminal `result` / `stream_complete` / `error` frame.
    #[must_use]
    pub fn stream(&self, request_id: &str) -> ResponseStream {
        ResponseStream {
            mailbox: Arc::clone(&self.mailbox),
            request_id: request_id.to_string(),
            done: false,
        }
    }
}

/// Per-request response stream. `next` resolves frames in arrival order
/// and returns `None` after the terminal frame has been yielded.
pub struct ResponseStream {
    mailbox: Arc<Mailbox>,
    request_id: String,
    done: bool,
}

impl ResponseStream {
    pub async fn next(&mut self) -> Option<Response> {
        if self.done {
            return None;
        }
        loop {
            let notified = self.mailbox.notify.notified();
            if let Some(frame) = self.mailbox.pop_matching(&self.request_id) {
                if frame.body.is_terminal() {
                    self.done = true;
                }
                return Some(frame);
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// One per server: owns the broker connection, consumes every local
/// agent's response queue, and hands frames to in-memory mailboxes so
/// agents never hold broker connections themselves.
pub struct Coordinator {
    org_id: String,
    config: CoordinatorConfig,
    broker: Arc<Broker>,
    channel: Channel,
    /// Confirm-selected: reroute republishes must not be lost, since the
    /// original delivery is acked only once the copy is confirmed.
    reroute_channel: Channel,
    producer: Arc<Producer>,
    audit: AuditHandle,
    agents: RwLock<HashMap<String, Arc<AgentEntry>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Coordinator {
    async fn new(
        org_id: String,
        config: CoordinatorConfig,
        broker: Arc<Broker>,
        producer: Arc<Producer>,
        audit: AuditHandle,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Coordinator, RelayError> {
        let channel = broker.create_channel().await?;
        channel
            .basic_qos(RESPONSE_PREFETCH, BasicQosOptions::default())
            .await
            .map_err(BrokerError::from)?;
        let reroute_channel = broker.create_confirmed_channel().await?;
        Ok(Coordinator {
            org_id,
            config,
            broker,
            channel,
            reroute_channel,
            producer,
            audit,
            agents: RwLock::new(HashMap::new()),
            shutdown_rx,
        })
    }

    fn policy_for(&self, agent_id: &str) -> OverflowPolicy {
        let name = self
            .config
            .overflow_policy_overrides
            .get(agent_id)
            .unwrap_or(&self.config.overflow_policy);
        OverflowPolicy::parse(name)
    }

    /// Declare and bind the agent's response queue, open a consumer, and
    /// create the mailbox. Idempotent per agent.
    pub async fn register(
        coordinator: &Arc<Coordinator>,
        agent_id: &str,
    ) -> Result<SubscriptionHandle, RelayError> {
        {
            let agents = coordinator.agents.read().await;
            if let Some(entry) = agents.get(agent_id) {
                return Ok(SubscriptionHandle {
                    agent_id: agent_id.to_string(),
                    mailbox: Arc::clone(&entry.mailbox),
                });
            }
        }

        ensure_response_topology(
            &coordinator.broker,
            &coordinator.org_id,
            agent_id,
            TOPOLOGY_ATTEMPTS,
        )
        .await?;

        let consumer_tag = format!("{SERVICE_NAME}-{agent_id}");
        let consumer = coordinator
            .channel
            .basic_consume(
                &agent_response_queue(agent_id),
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::from)?;

        let entry = Arc::new(AgentEntry {
            agent_id: agent_id.to_string(),
            mailbox: Arc::new(Mailbox::new(
                coordinator.config.mailbox_capacity,
                coordinator.policy_for(agent_id),
            )),
            consumer_tag,
            active: AtomicBool::new(true),
            misroutes: AtomicU32::new(0),
        });

        coordinator
            .agents
            .write()
            .await
            .insert(agent_id.to_string(), Arc::clone(&entry));

        let task_coordinator = Arc::clone(coordinator);
        let consumer_entry = Arc::clone(&entry);
        tokio::spawn(async move {
            task_coordinator
                .run_agent_consumer(consumer, consumer_entry)
                .await;
        });

        info!(agent_id, "agent registered");
        metrics::gauge!("coordinator_registered_agents").increment(1.0);
        Ok(SubscriptionHandle {
            agent_id: agent_id.to_string(),
            mailbox: Arc::clone(&entry.mailbox),
        })
    }

    /// Cancel the consumer, drain the mailbox up to the deadline, and
    /// schedule the response queue for deletion after the grace period.
    pub async fn unregister(coordinator: &Arc<Coordinator>, agent_id: &str) {
        let Some(entry) = coordinator.agents.write().await.remove(agent_id) else {
            return;
        };
        entry.active.store(false, Ordering::SeqCst);
        if let Err(e) = coordinator
            .channel
            .basic_cancel(&entry.consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!(agent_id, error = %e, "consumer cancel failed");
        }

        let deadline =
            Instant::now() + Duration::from_secs(coordinator.config.drain_deadline_secs);
        while entry.mailbox.len() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let leftover = entry.mailbox.drain();
        if !leftover.is_empty() {
            warn!(agent_id, frames = leftover.len(), "mailbox drained past deadline");
        }

        // Queue deletion is deferred so a reconnecting agent can pick its
        // queue back up; skipped if the agent re-registered meanwhile.
        let task_coordinator = Arc::clone(coordinator);
        let agent = agent_id.to_string();
        let grace = Duration::from_secs(coordinator.config.queue_delete_grace_secs);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if task_coordinator.agents.read().await.contains_key(&agent) {
                return;
            }
            if let Err(e) = task_coordinator
                .channel
                .queue_delete(&agent_response_queue(&agent), QueueDeleteOptions::default())
                .await
            {
                warn!(agent_id = %agent, error = %e, "deferred queue delete failed");
            }
        });

        info!(agent_id, "agent unregistered");
        metrics::gauge!("coordinator_registered_agents").decrement(1.0);
    }

    /// Publish a request on behalf of a local agent.
    pub async fn send(&self, msg: RequestMessage) -> PublishOutcome {
        self.producer.publish(msg).await
    }

    /// Next response for an agent, or an error when it is not registered
    /// here.
    pub async fn get_response_for(&self, agent_id: &str) -> Result<Response, RelayError> {
        let mailbox = {
            let agents = self.agents.read().await;
            agents
                .get(agent_id)
                .map(|e| Arc::clone(&e.mailbox))
                .ok_or_else(|| RelayError::UnknownAgent(agent_id.to_string()))?
        };
        Ok(mailbox.pop().await)
    }

    async fn run_agent_consumer(
        self: Arc<Self>,
        mut consumer: lapin::Consumer,
        entry: Arc<AgentEntry>,
    ) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            let delivery = tokio::select! {
                delivery = consumer.next() => delivery,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { break; }
                    continue;
                }
            };
            let Some(delivery) = delivery else { break };
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    error!(agent_id = %entry.agent_id, error = %e, "response consumer error");
                    break;
                }
            };

            let frame: Response = match serde_json::from_slice(&delivery.data) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(agent_id = %entry.agent_id, error = %e, "malformed response frame dropped");
                    let _ = delivery.acker.ack(BasicAckOptions::default()).await;
                    continue;
                }
            };

            if !entry.active.load(Ordering::SeqCst) {
                // The original is acked only after the rerouted copy (or
                // its DLQ record) is durably accepted; otherwise the nack
                // leaves redelivery to the broker.
                match self.reroute(&entry, frame).await {
                    Ok(()) => {
                        let _ = delivery.acker.ack(BasicAckOptions::default()).await;
                    }
                    Err(e) => {
                        warn!(agent_id = %entry.agent_id, error = %e,
                              "reroute failed, nacking delivery");
                        let _ = delivery
                            .acker
                            .nack(BasicNackOptions {
                                requeue: false,
                                ..BasicNackOptions::default()
                            })
                            .await;
                    }
                }
                continue;
            }

            metrics::counter!(
                "coordinator_forwarded_total",
                "type" => frame.body.kind_label(),
            )
            .increment(1);

            match entry.mailbox.push(frame) {
                PushOutcome::Stored => {
                    let _ = delivery.acker.ack(BasicAckOptions::default()).await;
                }
                PushOutcome::Displaced(displaced) => {
                    let _ = delivery.acker.ack(BasicAckOptions::default()).await;
                    metrics::counter!("coordinator_dropped_total", "agent_id" => entry.agent_id.clone())
                        .increment(1);
                    // Best-effort notice that an older frame was discarded.
                    let notice = Response {
                        request_id: displaced.request_id.clone(),
                        agent_id: entry.agent_id.clone(),
                        timestamp: chrono::Utc::now(),
                        priority: displaced.priority,
                        body: ResponseBody::Progress {
                            percent: None,
                            note: Some("dropped".to_string()),
                        },
                    };
                    let _ = entry.mailbox.push(notice);
                }
                PushOutcome::Full => {
                    // Block policy: hold the unacked delivery until the
                    // agent drains; prefetch stalls the broker meanwhile.
                    entry.mailbox.wait_for_space().await;
                    if let Ok(frame) = serde_json::from_slice::<Response>(&delivery.data) {
                        let _ = entry.mailbox.push(frame);
                    }
                    let _ = delivery.acker.ack(BasicAckOptions::default()).await;
                }
            }
            metrics::gauge!("mailbox_depth", "agent_id" => entry.agent_id.clone())
                .set(entry.mailbox.len() as f64);
        }
    }

    /// A frame arrived for an agent no longer hosted here: push it back
    /// through the response exchange so the hosting server's coordinator
    /// picks it up. Persistent misrouting marks the agent dead and parks
    /// the frame in `dlq_messages` instead. Either way the outcome must be
    /// durable before the caller acks the original delivery.
    async fn reroute(&self, entry: &AgentEntry, frame: Response) -> Result<(), RelayError> {
        let misses = entry.misroutes.fetch_add(1, Ordering::SeqCst) + 1;
        if misses >= self.config.misroute_threshold {
            warn!(agent_id = %entry.agent_id, misses, "persistent misrouting, marking agent dead");
            metrics::counter!("coordinator_agent_dead_total", "reason" => "misrouted")
                .increment(1);
            self.dead_letter_frame(&entry.agent_id, frame, "agent_unreachable")
                .await;
            self.audit.flush().await?;
            return Ok(());
        }
        publish_response(&self.reroute_channel, &self.org_id, &frame, true).await?;
        Ok(())
    }

    async fn dead_letter_frame(&self, agent_id: &str, frame: Response, reason: &str) {
        self.audit
            .record(AuditRecord::Dlq(DlqRecord {
                org_id: self.org_id.clone(),
                original_message: serde_json::to_value(&frame).unwrap_or(serde_json::Value::Null),
                error_history: serde_json::json!([{
                    "kind": reason,
                    "detail": format!("response frame for {agent_id} undeliverable"),
                }]),
                can_replay: false,
            }))
            .await;
    }

    /// Liveness sweep: emit per-agent heartbeats, unregister agents that
    /// stopped polling with work waiting, and quarantine runaway agents
    /// whose mailboxes stay full.
    async fn liveness_sweep(coordinator: &Arc<Coordinator>) {
        let interval = Duration::from_secs(coordinator.config.heartbeat_interval_secs);
        let missed_budget = interval * coordinator.config.missed_heartbeats;
        let runaway_after = Duration::from_secs(coordinator.config.runaway_secs);

        let snapshot: Vec<Arc<AgentEntry>> =
            coordinator.agents.read().await.values().cloned().collect();
        for entry in snapshot {
            metrics::counter!("coordinator_heartbeat_total", "agent_id" => entry.agent_id.clone())
                .increment(1);
            metrics::gauge!("mailbox_depth", "agent_id" => entry.agent_id.clone())
                .set(entry.mailbox.len() as f64);

            if let Some(full_for) = entry.mailbox.full_for() {
                if full_for >= runaway_after {
                    warn!(agent_id = %entry.agent_id, full_secs = full_for.as_secs(),
                          dropped = entry.mailbox.dropped(), "runaway agent, quarantining mailbox");
                    metrics::counter!("coordinator_agent_dead_total", "reason" => "runaway")
                        .increment(1);
                    for frame in entry.mailbox.drain() {
                        coordinator
                            .dead_letter_frame(&entry.agent_id, frame, "agent_runaway")
                            .await;
                    }
                    Coordinator::unregister(coordinator, &entry.agent_id).await;
                    continue;
                }
            }

            // An agent with frames waiting that has not polled for N
            // heartbeat intervals is treated as gone.
            if entry.mailbox.len() > 0 && entry.mailbox.idle_for() >= missed_budget {
                warn!(agent_id = %entry.agent_id,
                      idle_secs = entry.mailbox.idle_for().as_secs(),
                      "agent missed heartbeats, unregistering");
                metrics::counter!("coordinator_agent_dead_total", "reason" => "missed_heartbeats")
                    .increment(1);
                Coordinator::unregister(coordinator, &entry.agent_id).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Service loops
// ---------------------------------------------------------------------------

/// Crash-only reconnection: a dropped broker connection exits the process
/// with the broker-unavailable code; the supervisor restarts it, boot
/// re-connects with backoff, and all bindings are re-declared idempotently.
/// Responses delivered but never acked redeliver from the broker.
async fn connection_watch(coordinator: Arc<Coordinator>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if !coordinator.broker.is_connected() {
                    error!("broker connection lost, exiting for supervised restart");
                    process::exit(EXIT_BROKER);
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { break; }
            }
        }
    }
}

async fn heartbeat_loop(coordinator: Arc<Coordinator>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = Duration::from_secs(coordinator.config.heartbeat_interval_secs);
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tick.tick() => Coordinator::liveness_sweep(&coordinator).await,
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { break; }
            }
        }
    }
    info!("heartbeat loop stopped");
}

/// Demo drain for the default agent: logs every response it receives,
/// standing in for a hosted agent polling its subscription.
async fn demo_drain_loop(handle: SubscriptionHandle, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            frame = handle.recv() => {
                info!(
                    agent_id = %handle.agent_id(),
                    request_id = %frame.request_id,
                    frame_type = frame.body.kind_label(),
                    "response delivered"
                );
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { break; }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

struct AppState {
    coordinator: Arc<Coordinator>,
    audit: AuditHandle,
    audit_task: tokio::task::JoinHandle<()>,
    sampler: tokio::task::JoinHandle<()>,
}

async fn init_state(
    config: &Config,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<AppState, RelayError> {
    let broker = Arc::new(Broker::connect(&config.broker).await?);
    let store = Store::connect(&config.event_store).await?;
    let (audit, audit_task) = spawn_writer(store.clone(), &config.audit);

    let org_id = config.relayq.org_id.clone();
    ensure_org_topology(&broker, &org_id, TOPOLOGY_ATTEMPTS).await?;

    let controller = Arc::new(BackpressureController::new(&config.backpressure));
    let sampler = spawn_depth_sampler(
        broker.create_channel().await?,
        config.effective_org_ids(),
        Arc::clone(&controller),
        Duration::from_secs(config.backpressure.sample_interval_secs),
        shutdown_rx.clone(),
    );

    let producer =
        Arc::new(Producer::new(&broker, store, audit.clone(), controller, &config.producer).await?);

    let coordinator = Arc::new(
        Coordinator::new(
            org_id,
            config.coordinator.clone(),
            broker,
            producer,
            audit.clone(),
            shutdown_rx,
        )
        .await?,
    );

    Ok(AppState {
        coordinator,
        audit,
        audit_task,
        sampler,
    })
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("fatal: failed to load config: {e}");
        process::exit(EXIT_CONFIG);
    });

    let _telemetry_guard = relayq_telemetry::init_telemetry(SERVICE_NAME, &config.telemetry)
        .unwrap_or_else(|e| {
            eprintln!("fatal: telemetry init failed: {e}");
            process::exit(1);
        });
    if let Err(e) = relayq_telemetry::init_metrics(&config.metrics) {
        error!(error = %e, "metrics exporter init failed, continuing without /metrics");
    }

    info!(
        service = SERVICE_NAME,
        version = SERVICE_VERSION,
        org_id = %config.relayq.org_id,
        "starting coordinator"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = match init_state(&config, shutdown_rx.clone()).await {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "fatal: failed to initialise coordinator");
            process::exit(e.exit_code());
        }
    };

    // Pre-register the locally hosted agents.
    let mut demo_handle = None;
    for agent_id in config.effective_agent_ids() {
        match Coordinator::register(&state.coordinator, &agent_id).await {
            Ok(handle) => {
                if demo_handle.is_none() {
                    demo_handle = Some(handle);
                }
            }
            Err(e) => {
                error!(agent_id = %agent_id, error = %e, "fatal: agent registration failed");
                process::exit(e.exit_code());
            }
        }
    }

    let hb_coordinator = Arc::clone(&state.coordinator);
    let hb_shutdown = shutdown_rx.clone();
    let heartbeat_handle = tokio::spawn(async move {
        heartbeat_loop(hb_coordinator, hb_shutdown).await;
    });

    let watch_coordinator = Arc::clone(&state.coordinator);
    let watch_shutdown = shutdown_rx.clone();
    let watch_handle = tokio::spawn(async move {
        connection_watch(watch_coordinator, watch_shutdown).await;
    });

    let drain_handle = demo_handle.map(|handle| {
        let drain_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            demo_drain_loop(handle, drain_shutdown).await;
        })
    });

    relayq_runtime::shutdown_signal().await;
    info!("initiating graceful shutdown");
    let _ = shutdown_tx.send(true);

    let agent_ids: Vec<String> = {
        let agents = state.coordinator.agents.read().await;
        agents.keys().cloned().collect()
    };
    for agent_id in agent_ids {
        Coordinator::unregister(&state.coordinator, &agent_id).await;
    }

    let shutdown_timeout = Duration::from_secs(10);
    match tokio::time::timeout(shutdown_timeout, async {
        if let Err(e) = heartbeat_handle.await {
            warn!(error = %e, "heartbeat task panicked");
        }
        if let Some(handle) = drain_handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "demo drain task panicked");
            }
        }
        if let Err(e) = state.sampler.await {
            warn!(error = %e, "depth sampler task panicked");
        }
        if let Err(e) = watch_handle.await {
            warn!(error = %e, "connection watch task panicked");
        }
    })
    .await
    {
        Ok(()) => info!("all background tasks stopped"),
        Err(_) => warn!("shutdown timed out after {shutdown_timeout:?}, forcing exit"),
    }

    if let Err(e) = state.audit.flush().await {
        warn!(error = %e, "final audit flush failed");
    }
    drop(state.coordinator);
    drop(state.audit);
    let _ = state.audit_task.await;

    info!("coordinator shutdown complete");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn frame(request_id: &str, priority: Option<Priority>, body: ResponseBody) -> Response {
        Response {
            request_id: request_id.to_string(),
            agent_id: "agent-1".to_string(),
            timestamp: Utc::now(),
            priority,
            body,
        }
    }

    fn result_frame(request_id: &str, priority: Option<Priority>) -> Response {
        frame(request_id, priority, ResponseBody::Result { data: json!({}) })
    }

    fn chunk_frame(request_id: &str, index: u32) -> Response {
        frame(
            request_id,
            Some(Priority::P2),
            ResponseBody::StreamChunk {
                chunk: json!("x"),
                chunk_index: index,
            },
        )
    }

    #[test]
    fn test_overflow_policy_parse() {
        assert_eq!(OverflowPolicy::parse("block"), OverflowPolicy::Block);
        assert_eq!(
            OverflowPolicy::parse("drop_oldest_non_p0"),
            OverflowPolicy::DropOldestNonP0
        );
        assert_eq!(OverflowPolicy::parse("typo"), OverflowPolicy::Block);
    }

    #[test]
    fn test_mailbox_fifo_order() {
        let mailbox = Mailbox::new(10, OverflowPolicy::Block);
        assert!(matches!(
            mailbox.push(result_frame("r1", None)),
            PushOutcome::Stored
        ));
        assert!(matches!(
            mailbox.push(result_frame("r2", None)),
            PushOutcome::Stored
        ));
        assert_eq!(mailbox.try_pop().unwrap().request_id, "r1");
        assert_eq!(mailbox.try_pop().unwrap().request_id, "r2");
        assert!(mailbox.try_pop().is_none());
    }

    #[test]
    fn test_block_policy_reports_full() {
        let mailbox = Mailbox::new(1, OverflowPolicy::Block);
        assert!(matches!(
            mailbox.push(result_frame("r1", None)),
            PushOutcome::Stored
        ));
        assert!(matches!(
            mailbox.push(result_frame("r2", None)),
            PushOutcome::Full
        ));
        assert!(mailbox.full_for().is_some());
        // Draining clears the full marker
        mailbox.try_pop();
        assert!(mailbox.full_for().is_none());
    }

    #[test]
    fn test_drop_policy_displaces_oldest_non_p0() {
        let mailbox = Mailbox::new(2, OverflowPolicy::DropOldestNonP0);
        mailbox.push(result_frame("p0", Some(Priority::P0)));
        mailbox.push(result_frame("old", Some(Priority::P2)));
        let outcome = mailbox.push(result_frame("new", Some(Priority::P1)));
        match outcome {
            PushOutcome::Displaced(displaced) => assert_eq!(displaced.request_id, "old"),
            _ => panic!("expected displacement"),
        }
        assert_eq!(mailbox.dropped(), 1);
        // P0 frame survives at the front
        assert_eq!(mailbox.try_pop().unwrap().request_id, "p0");
        assert_eq!(mailbox.try_pop().unwrap().request_id, "new");
    }

    #[test]
    fn test_drop_policy_never_drops_p0() {
        let mailbox = Mailbox::new(2, OverflowPolicy::DropOldestNonP0);
        mailbox.push(result_frame("p0-a", Some(Priority::P0)));
        mailbox.push(result_frame("p0-b", Some(Priority::P0)));
        assert!(matches!(
            mailbox.push(result_frame("new", Some(Priority::P3))),
            PushOutcome::Full
        ));
        assert_eq!(mailbox.len(), 2);
        assert_eq!(mailbox.dropped(), 0);
    }

    #[test]
    fn test_pop_matching_leaves_other_requests() {
        let mailbox = Mailbox::new(10, OverflowPolicy::Block);
        mailbox.push(chunk_frame("a", 0));
        mailbox.push(chunk_frame("b", 0));
        mailbox.push(chunk_frame("a", 1));

        let first = mailbox.pop_matching("a").unwrap();
        match first.body {
            ResponseBody::StreamChunk { chunk_index, .. } => assert_eq!(chunk_index, 0),
            _ => panic!("expected chunk"),
        }
        let second = mailbox.pop_matching("a").unwrap();
        match second.body {
            ResponseBody::StreamChunk { chunk_index, .. } => assert_eq!(chunk_index, 1),
            _ => panic!("expected chunk"),
        }
        assert!(mailbox.pop_matching("a").is_none());
        assert_eq!(mailbox.len(), 1, "request b's frame is untouched");
    }

    #[tokio::test]
    async fn test_stream_ends_after_terminal_frame() {
        let mailbox = Arc::new(Mailbox::new(10, OverflowPolicy::Block));
        mailbox.push(chunk_frame("req", 0));
        mailbox.push(chunk_frame("req", 1));
        mailbox.push(frame(
            "req",
            Some(Priority::P2),
            ResponseBody::StreamComplete { total_chunks: 2 },
        ));

        let mut stream = ResponseStream {
            mailbox: Arc::clone(&mailbox),
            request_id: "req".to_string(),
            done: false,
        };
        let mut kinds = Vec::new();
        while let Some(frame) = stream.next().await {
            kinds.push(frame.body.kind_label());
        }
        assert_eq!(kinds, vec!["stream_chunk", "stream_chunk", "stream_complete"]);
        // After the terminal frame, the stream stays finished.
        mailbox.push(chunk_frame("req", 2));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let mailbox = Arc::new(Mailbox::new(10, OverflowPolicy::Block));
        let popper = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move { mailbox.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mailbox.push(result_frame("r1", None));
        let frame = tokio::time::timeout(Duration::from_secs(1), popper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.request_id, "r1");
    }

    #[test]
    fn test_drain_empties_mailbox() {
        let mailbox = Mailbox::new(10, OverflowPolicy::Block);
        mailbox.push(result_frame("r1", None));
        mailbox.push(result_frame("r2", None));
        let drained = mailbox.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(mailbox.len(), 0);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RelayError::Config("x".to_string()).exit_code(), EXIT_CONFIG);
        assert_eq!(
            RelayError::Broker(BrokerError::NotConfirmed).exit_code(),
            EXIT_BROKER
        );
        assert_eq!(
            RelayError::Store(StoreError::Unavailable("down".to_string())).exit_code(),
            EXIT_STORE
        );
        assert_eq!(RelayError::UnknownAgent("a".to_string()).exit_code(), 1);
    }
}
