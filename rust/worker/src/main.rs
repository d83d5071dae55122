/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use lapin::Channel;
use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use relayq_broker::{
    ensure_org_topology, ensure_response_topology, publish_dlq, publish_response, queue_depth,
    request_queue, schedule_retry, Broker, BrokerError,
};
use relayq_config::Config;
use relayq_protocol::{
    decide_retry, jittered, status, ErrorKind, HandlerError, MessageType, RequestMessage, Response,
};
use relayq_store::{
    audit_completed, audit_dead_letter, audit_dequeued_processing, audit_duplicate_skipped,
    audit_failed_then_retry, audit_poison_quarantined, push_error_history, spawn_writer,
    AuditHandle, Store, StoreError,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const SERVICE_NAME: &str = "worker";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const RETRY_JITTER_FRAC: f64 = 0.1;
const TOPOLOGY_ATTEMPTS: u32 = 5;

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
    #[error("telemetry error: {0}")]
    Telemetry(String),
}

impl RelayError {
    fn exit_code(&self) -> i32 {
        match self {
            RelayError::Config(_) => EXIT_CONFIG,
            RelayError::Broker(_) => EXIT_BROKER,
            RelayError::Store(_) => EXIT_STORE,
            RelayError::Telemetry(_) => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Response emission
// ---------------------------------------------------------------------------

/// Sequencing state for one request's response frames: contiguous chunk
/// indices starting at zero, and exactly one terminal frame.
struct FrameSequencer {
    next_chunk: AtomicU32,
    terminal_sent: AtomicBool,
}

impl FrameSequencer {
    fn new() -> FrameSequencer {
        FrameSequencer {
            next_chunk: AtomicU32::new(0),
            terminal_sent: AtomicBool::new(false),
        }
    }

    fn claim_chunk_index(&self) -> u32 {
        self.next_chunk.fetch_add(1, Ordering::SeqCst)
    }

    fn chunks_emitted(&self) -> u32 {
        self.next_chunk.load(Ordering::SeqCst)
    }

    /// Returns `true` for the first terminal frame; later attempts lose.
    fn claim_terminal(&self) -> bool {
        !self.terminal_sent.swap(true, Ordering::SeqCst)
    }

    fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }
}

/// Handle handlers use to stream frames back to the originating agent.
///
/// Frames route through the org response exchange keyed by the request's
/// `agent_id` (falling back to the worker's default agent for legacy
/// messages that omit it).
pub struct ResponseEmitter {
    channel: Channel,
    request: RequestMessage,
    agent_id: String,
    sequencer: FrameSequencer,
}

impl ResponseEmitter {
    fn new(channel: Channel, request: RequestMessage, default_agent_id: &str) -> ResponseEmitter {
        let agent_id = resolve_agent_id(&request, default_agent_id);
        ResponseEmitter {
            channel,
            request,
            agent_id,
            sequencer: FrameSequencer::new(),
        }
    }

    async fn publish(&self, response: Response) {
        metrics::counter!(
            "response_published_total",
            "type" => response.body.kind_label(),
        )
        .increment(1);
        if let Err(e) =
            publish_response(&self.channel, &self.request.org_id, &response, false).await
        {
            warn!(request_id = %self.request.message_id, agent_id = %self.agent_id,
                  error = %e, "response publish failed");
        }
    }

    /// Immediate receipt confirmation, sent before the handler runs.
    pub async fn acknowledgment(&self, stage: &str) {
        self.publish(Response::acknowledgment(&self.request, &self.agent_id, stage))
            .await;
    }

    /// Best-effort progress for long-running work.
    pub async fn progress(&self, percent: Option<u8>, note: Option<&str>) {
        self.publish(Response::progress(&self.request, &self.agent_id, percent, note))
            .await;
    }

    /// Emit one stream chunk; indices are assigned here and are contiguous
    /// per request. Chunks after the terminal frame are dropped.
    pub async fn stream_chunk(&self, chunk: Value) {
        if self.sequencer.terminal_sent() {
            warn!(request_id = %self.request.message_id,
                  "stream chunk after terminal frame dropped");
            return;
        }
        let index = self.sequencer.claim_chunk_index();
        metrics::counter!("stream_chunk_published_total", "agent_id" => self.agent_id.clone())
            .increment(1);
        self.publish(Response::stream_chunk(
            &self.request,
            &self.agent_id,
            chunk,
            index,
        ))
        .await;
    }

    /// Terminate a streaming response. Exactly one terminal frame wins.
    pub async fn stream_complete(&self) {
        if !self.sequencer.claim_terminal() {
            return;
        }
        let total = self.sequencer.chunks_emitted();
        self.publish(Response::stream_complete(&self.request, &self.agent_id, total))
            .await;
    }

    async fn result(&self, data: Value) {
        if !self.sequencer.claim_terminal() {
            return;
        }
        self.publish(Response::result(&self.request, &self.agent_id, data))
            .await;
    }

    async fn error(&self, kind: ErrorKind, detail: &str) {
        if !self.sequencer.claim_terminal() {
            return;
        }
        self.publish(Response::error(&self.request, &self.agent_id, kind, detail))
            .await;
    }

    fn terminal_sent(&self) -> bool {
        self.sequencer.terminal_sent()
    }
}

fn resolve_agent_id(msg: &RequestMessage, default_agent_id: &str) -> String {
    msg.agent_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .unwrap_or(default_agent_id)
        .to_string()
}

// ---------------------------------------------------------------------------
// Handler contract and built-in handlers
// ---------------------------------------------------------------------------

/// Business-logic seam. Handlers are external in production; the built-ins
/// below are the same kind of stand-ins the platform ships for smoke tests.
///
/// A handler either returns a result value (the worker emits the terminal
/// `result` frame) or drives the emitter itself and finishes with
/// `stream_complete` before returning.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        msg: &RequestMessage,
        emitter: &ResponseEmitter,
    ) -> Result<Value, HandlerError>;
}

/// Echoes the message context back, standing in for agent-to-agent sends.
struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(
        &self,
        msg: &RequestMessage,
        _emitter: &ResponseEmitter,
    ) -> Result<Value, HandlerError> {
        Ok(json!({"echo": msg.context.clone().unwrap_or(Value::Null)}))
    }
}

/// Stand-in for model invocations. Streams when the payload asks for it
/// (`{"stream": true, "chunks": [...]}`), returns a plain result otherwise.
struct ModelCallHandler;

#[async_trait]
impl Handler for ModelCallHandler {
    async fn handle(
        &self,
        msg: &RequestMessage,
        emitter: &ResponseEmitter,
    ) -> Result<Value, HandlerError> {
        let wants_stream = msg
            .payload
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !wants_stream {
            return Ok(json!({"status": "ok", "type": msg.message_type.as_str()}));
        }
        let chunks = msg
            .payload
            .get("chunks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for chunk in chunks {
            emitter.stream_chunk(chunk).await;
        }
        emitter.stream_complete().await;
        Ok(Value::Null)
    }
}

/// Stub for operation types whose real handlers live elsewhere.
struct PassthroughHandler;

#[async_trait]
impl Handler for PassthroughHandler {
    async fn handle(
        &self,
        msg: &RequestMessage,
        _emitter: &ResponseEmitter,
    ) -> Result<Value, HandlerError> {
        Ok(json!({"status": "ok", "type": msg.message_type.as_str()}))
    }
}

/// Handlers keyed by operation type. Every type has a default so an
/// unconfigured worker still drains its queue.
pub struct HandlerRegistry {
    handlers: HashMap<MessageType, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    fn with_defaults() -> HandlerRegistry {
        let passthrough: Arc<dyn Handler> = Arc::new(PassthroughHandler);
        let mut handlers: HashMap<MessageType, Arc<dyn Handler>> = HashMap::new();
        handlers.insert(MessageType::AgentMessage, Arc::new(EchoHandler));
        handlers.insert(MessageType::ModelCall, Arc::new(ModelCallHandler));
        for message_type in [
            MessageType::ToolCall,
            MessageType::MemorySave,
            MessageType::MemoryRetrieve,
            MessageType::MemoryUpdate,
            MessageType::AgentSpawn,
            MessageType::AgentTerminate,
        ] {
            handlers.insert(message_type, Arc::clone(&passthrough));
        }
        HandlerRegistry { handlers }
    }

    pub fn register(&mut self, message_type: MessageType, handler: Arc<dyn Handler>) {
        self.handlers.insert(message_type, handler);
    }

    fn get(&self, message_type: MessageType) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&message_type).cloned()
    }
}

/// Producers can force a failure for retry-path drills by setting
/// `context.force_error` (optionally with `context.force_error_kind`).
fn forced_error(msg: &RequestMessage) -> Option<HandlerError> {
    let context = msg.context.as_ref()?;
    if !context
        .get("force_error")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return None;
    }
    let detail = "forced error for retry testing".to_string();
    Some(
        match context.get("force_error_kind").and_then(Value::as_str) {
            Some("rate_limit") => HandlerError::RateLimit(detail),
            Some("transient_io") => HandlerError::TransientIo(detail),
            Some("permanent_upstream") => HandlerError::PermanentUpstream(detail),
            Some("validation") => HandlerError::Validation(detail),
            _ => HandlerError::Other(detail),
        },
    )
}

/// Accumulate this attempt's failure into the message's rolling error
/// history (carried in `context` so the DLQ row has the full trail).
fn append_error_history(msg: &mut RequestMessage, kind: ErrorKind, detail: &str) {
    let mut context = match msg.context.take() {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    let history = context.remove("error_history").unwrap_or(Value::Null);
    let history = push_error_history(history, kind, detail, msg.retry_count);
    context.insert("error_history".to_string(), history);
    msg.context = Some(Value::Object(context));
}

fn error_history_of(msg: &RequestMessage) -> Value {
    msg.context
        .as_ref()
        .and_then(|c| c.get("error_history"))
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()))
}

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

struct AppState {
    config: Config,
    /// Holds the broker connection open for the channels below.
    _broker: Broker,
    store: Store,
    audit: AuditHandle,
    registry: HandlerRegistry,
    /// Bounds in-flight handler executions; effective concurrency is
    /// min(prefetch, permits).
    semaphore: Arc<Semaphore>,
    consume_channel: Channel,
    response_channel: Channel,
    /// Confirm-selected: retry parks and DLQ ships must not be lost.
    publish_channel: Channel,
    worker_id: String,
}

// ---------------------------------------------------------------------------
// Per-message processing
// ---------------------------------------------------------------------------

async fn process_delivery(state: Arc<AppState>, delivery: lapin::message::Delivery) {
    let started = Instant::now();
    let org_id = &state.config.relayq.org_id;

    let mut msg: RequestMessage = match serde_json::from_slice(&delivery.data) {
        Ok(msg) => msg,
        Err(e) => {
            error!(error = %e, "malformed message body, discarding");
            metrics::counter!("worker_malformed_total").increment(1);
            let _ = delivery
                .acker
                .nack(BasicNackOptions {
                    requeue: false,
                    ..BasicNackOptions::default()
                })
                .await;
            return;
        }
    };
    let msg_type = msg.message_type;
    metrics::counter!("dequeue_total", "org_id" => org_id.clone()).increment(1);

    audit_dequeued_processing(&state.audit, &msg, &state.worker_id).await;

    // Replay collapse: a promotion re-publish or an ack that raced a
    // redelivery leaves a second broker copy behind. The stored terminal
    // status is the arbiter; no handler work for the losing copy.
    match state.store.message_status(&msg.message_id).await {
        Ok(Some(stored)) if status::is_terminal(&stored) => {
            audit_duplicate_skipped(&state.audit, &msg, msg.dedup_key_or_id()).await;
            metrics::counter!("worker_message_total", "status" => "duplicate", "type" => msg_type.as_str())
                .increment(1);
            let _ = delivery.acker.ack(BasicAckOptions::default()).await;
            return;
        }
        Ok(_) => {}
        Err(e) => {
            // Fail open: at-least-once delivery tolerates the rare double
            // run; blocking the queue on a store blip does not.
            warn!(message_id = %msg.message_id, error = %e, "status lookup failed");
        }
    }

    let emitter = Arc::new(ResponseEmitter::new(
        state.response_channel.clone(),
        msg.clone(),
        &state.config.relayq.agent_id,
    ));

    if msg.is_expired(chrono::Utc::now()) {
        emitter
            .error(ErrorKind::PermanentUpstream, "message expired before processing")
            .await;
        dead_letter(&state, &delivery, &msg, "expired", error_history_of(&msg)).await;
        return;
    }

    // Poison gate: count the delivery attempt before the handler runs so a
    // crash-before-ack still leaves a trace. Decremented again on success.
    let mut poison_counted = false;
    if let Some(dedup_key) = msg.dedup_key.clone() {
        poison_counted = true;
        let count = match state.store.poison_increment(&msg.org_id, &dedup_key).await {
            Ok(count) => count,
            Err(e) => {
                warn!(dedup_key = %dedup_key, error = %e, "poison counter unavailable");
                1
            }
        };
        if count > state.config.worker.poison_threshold {
            warn!(message_id = %msg.message_id, dedup_key = %dedup_key, count,
                  "poison threshold exceeded, quarantining");
            audit_poison_quarantined(&state.audit, &msg, &dedup_key, count).await;
            metrics::counter!("poison_quarantined_total", "type" => msg_type.as_str())
                .increment(1);
            emitter
                .error(ErrorKind::Poison, "quarantined after repeated failures")
                .await;
            dead_letter(&state, &delivery, &msg, "poison", error_history_of(&msg)).await;
            return;
        }
    }

    emitter.acknowledgment("processing").await;

    // Progress watchdog: long-running handlers surface liveness even when
    // they never emit progress themselves.
    let watchdog = {
        let emitter = Arc::clone(&emitter);
        let interval = Duration::from_secs(state.config.worker.progress_interval_secs);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // first tick fires immediately; skip it
            loop {
                tick.tick().await;
                emitter.progress(None, Some("in_flight")).await;
            }
        })
    };

    let handler_timeout = Duration::from_secs(state.config.worker.handler_timeout_secs);
    let outcome = match forced_error(&msg) {
        Some(e) => Err(e),
        None => match state.registry.get(msg_type) {
            Some(handler) => {
                match tokio::time::timeout(handler_timeout, handler.handle(&msg, &emitter)).await {
                    Ok(result) => result,
                    Err(_) => Err(HandlerError::Timeout(handler_timeout)),
                }
            }
            None => Err(HandlerError::Validation(format!(
                "no handler registered for {msg_type}"
            ))),
        },
    };
    watchdog.abort();
    metrics::histogram!("handler_duration_seconds", "type" => msg_type.as_str())
        .record(started.elapsed().as_secs_f64());

    match outcome {
        Ok(data) => {
            if !emitter.terminal_sent() {
                emitter.result(data).await;
            }
            audit_completed(&state.audit, &msg, &state.worker_id).await;
            // The completed event must be durable before the ack; a failed
            // flush leaves the delivery unacked for another worker.
            if let Err(e) = state.audit.flush().await {
                error!(message_id = %msg.message_id, error = %e,
                       "terminal audit flush failed, leaving delivery unacked");
                let _ = delivery
                    .acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    })
                    .await;
                return;
            }
            let _ = delivery.acker.ack(BasicAckOptions::default()).await;
            if poison_counted {
                if let Some(dedup_key) = msg.dedup_key.as_deref() {
                    if let Err(e) = state.store.poison_decrement(&msg.org_id, dedup_key).await {
                        warn!(dedup_key, error = %e, "poison decrement failed");
                    }
                }
            }
            metrics::counter!("worker_message_total", "status" => "success", "type" => msg_type.as_str())
                .increment(1);
        }
        Err(handler_error) => {
            let kind = handler_error.kind();
            let detail = handler_error.to_string();
            warn!(message_id = %msg.message_id, error_kind = kind.as_str(), detail = %detail,
                  "handler failed");

            let previous_priority = msg.priority;
            let decision = decide_retry(&msg, kind);
            append_error_history(&mut msg, kind, &detail);

            if decision.should_retry {
                // Not terminal yet: the exactly-one-error guarantee reserves
                // the error frame for the final failure.
                emitter.progress(None, Some("retry_scheduled")).await;
                msg.priority = decision.next_priority;
                msg.retry_count = decision.next_retry_count;
                let delay_ms = jittered(decision.delay_ms, RETRY_JITTER_FRAC);
                match schedule_retry(&state.publish_channel, &msg, delay_ms).await {
                    Ok(()) => {
                        audit_failed_then_retry(
                            &state.audit,
                            &msg,
                            &decision,
                            &detail,
                            previous_priority,
                        )
                        .await;
                        metrics::counter!("retry_total", "error_kind" => kind.as_str())
                            .increment(1);
                        if decision.demotes(previous_priority) {
                            metrics::counter!(
                                "demotion_total",
                                "from" => previous_priority.label(),
                                "to" => msg.priority.label(),
                            )
                            .increment(1);
                        }
                        let _ = delivery.acker.ack(BasicAckOptions::default()).await;
                    }
                    Err(e) => {
                        error!(message_id = %msg.message_id, error = %e,
                               "retry park failed, requeueing delivery");
                        let _ = delivery
                            .acker
                            .nack(BasicNackOptions {
                                requeue: true,
                                ..BasicNackOptions::default()
                            })
                            .await;
                    }
                }
                metrics::counter!("worker_message_total", "status" => "retry", "type" => msg_type.as_str())
                    .increment(1);
            } else {
                emitter.error(kind, &detail).await;
                dead_letter(
                    &state,
                    &delivery,
                    &msg,
                    kind.as_str(),
                    error_history_of(&msg),
                )
                .await;
            }
        }
    }
}

/// Terminal failure path: broker DLQ copy, durable DLQ row + dead_letter
/// event, then ack. A failed ship or flush requeues the delivery instead.
async fn dead_letter(
    state: &Arc<AppState>,
    delivery: &lapin::message::Delivery,
    msg: &RequestMessage,
    reason: &str,
    error_history: Value,
) {
    if let Err(e) = publish_dlq(&state.publish_channel, msg, reason).await {
        error!(message_id = %msg.message_id, error = %e, "dlq publish failed, requeueing");
        let _ = delivery
            .acker
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await;
        return;
    }
    audit_dead_letter(&state.audit, msg, reason, error_history).await;
    if let Err(e) = state.audit.flush().await {
        error!(message_id = %msg.message_id, error = %e,
               "terminal audit flush failed, leaving delivery unacked");
        let _ = delivery
            .acker
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await;
        return;
    }
    let _ = delivery.acker.ack(BasicAckOptions::default()).await;
    metrics::counter!("dlq_total", "type" => msg.message_type.as_str()).increment(1);
    metrics::counter!("worker_message_total", "status" => "dead_letter", "type" => msg.message_type.as_str())
        .increment(1);
}

// ---------------------------------------------------------------------------
// Consumer loop
// ---------------------------------------------------------------------------

async fn run_consumer(
    state: Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let org_id = state.config.relayq.org_id.clone();
    let queue = request_queue(&org_id);
    let consumer_tag = format!("{SERVICE_NAME}-{}", state.worker_id);

    state
        .consume_channel
        .basic_qos(state.config.worker.prefetch, BasicQosOptions::default())
        .await
        .map_err(BrokerError::from)?;

    let mut consumer = state
        .consume_channel
        .basic_consume(
            &queue,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(BrokerError::from)?;

    info!(queue = %queue, prefetch = state.config.worker.prefetch,
          concurrency = state.config.worker.concurrency, "consuming org queue");

    loop {
        tokio::select! {
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let permit = match Arc::clone(&state.semaphore).acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };
                        let task_state = Arc::clone(&state);
                        tokio::spawn(async move {
                            process_delivery(task_state, delivery).await;
                            drop(permit);
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "consumer stream error");
                        return Err(RelayError::Broker(BrokerError::Amqp(e)));
                    }
                    None => {
                        info!("consumer stream ended");
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Stop new deliveries, then give in-flight handlers the grace period.
    // Whatever is still unacked afterwards redelivers to another worker;
    // the poison counter bounds repeat offenders.
    if let Err(e) = state
        .consume_channel
        .basic_cancel(&consumer_tag, BasicCancelOptions::default())
        .await
    {
        warn!(error = %e, "consumer cancel failed");
    }
    let grace = Duration::from_secs(state.config.worker.shutdown_grace_secs);
    let all_permits = state.config.worker.concurrency;
    match tokio::time::timeout(grace, state.semaphore.acquire_many(all_permits)).await {
        Ok(Ok(_)) => info!("all in-flight handlers finished"),
        Ok(Err(_)) => {}
        Err(_) => warn!(grace_secs = grace.as_secs(), "shutdown grace expired with handlers in flight"),
    }
    Ok(())
}

/// Crash-only reconnection: when the broker connection drops, exit with
/// the broker-unavailable code and let the supervisor restart the process.
/// Boot already retries the connect with backoff and re-declares topology
/// idempotently, and unacked deliveries redeliver to surviving workers.
async fn connection_watch(state: Arc<AppState>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if !state._broker.is_connected() {
                    error!("broker connection lost, exiting for supervised restart");
                    process::exit(EXIT_BROKER);
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Periodically poll queue depth for visibility (the gauge the autoscaler
/// and dashboards read).
async fn depth_sample_loop(state: Arc<AppState>, mut shutdown_rx: watch::Receiver<bool>) {
    let org_id = state.config.relayq.org_id.clone();
    let interval = Duration::from_secs(state.config.worker.depth_sample_secs);
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                match queue_depth(&state.consume_channel, &org_id).await {
                    Ok(depth) => {
                        metrics::gauge!("queue_depth", "org_id" => org_id.clone())
                            .set(depth as f64);
                    }
                    Err(e) => warn!(error = %e, "queue depth probe failed"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

async fn init_state(config: Config) -> Result<(AppState, tokio::task::JoinHandle<()>), RelayError> {
    let broker = Broker::connect(&config.broker).await?;
    let store = Store::connect(&config.event_store).await?;
    let (audit, audit_task) = spawn_writer(store.clone(), &config.audit);

    let org_id = config.relayq.org_id.clone();
    ensure_org_topology(&broker, &org_id, TOPOLOGY_ATTEMPTS).await?;
    ensure_response_topology(&broker, &org_id, &config.relayq.agent_id, TOPOLOGY_ATTEMPTS).await?;

    let worker_id = format!("{}-{}", SERVICE_NAME, Uuid::new_v4());
    let concurrency = config.worker.concurrency as usize;
    let state = AppState {
        consume_channel: broker.create_channel().await?,
        response_channel: broker.create_channel().await?,
        publish_channel: broker.create_confirmed_channel().await?,
        _broker: broker,
        store,
        audit,
        registry: HandlerRegistry::with_defaults(),
        semaphore: Arc::new(Semaphore::new(concurrency)),
        worker_id,
        config,
    };
    Ok((state, audit_task))
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
        "starting worker"
    );

    let (state, audit_task) = match init_state(config).await {
        Ok(parts) => parts,
        Err(e) => {
            error!(error = %e, "fatal: failed to initialise worker");
            process::exit(e.exit_code());
        }
    };
    let state = Arc::new(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer_state = Arc::clone(&state);
    let consumer_shutdown = shutdown_rx.clone();
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = run_consumer(consumer_state, consumer_shutdown).await {
            error!(error = %e, "consumer loop failed");
        }
    });

    let depth_state = Arc::clone(&state);
    let depth_shutdown = shutdown_rx.clone();
    let depth_handle = tokio::spawn(async move {
        depth_sample_loop(depth_state, depth_shutdown).await;
    });

    let watch_state = Arc::clone(&state);
    let watch_shutdown = shutdown_rx.clone();
    let watch_handle = tokio::spawn(async move {
        connection_watch(watch_state, watch_shutdown).await;
    });

    relayq_runtime::shutdown_signal().await;
    info!("initiating graceful shutdown");
    let _ = shutdown_tx.send(true);

    let shutdown_timeout =
        Duration::from_secs(state.config.worker.shutdown_grace_secs.saturating_add(5));
    match tokio::time::timeout(shutdown_timeout, async {
        if let Err(e) = consumer_handle.await {
            warn!(error = %e, "consumer task panicked");
        }
        if let Err(e) = depth_handle.await {
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

    // Final audit flush so buffered lifecycle events are not lost.
    if let Err(e) = state.audit.flush().await {
        warn!(error = %e, "final audit flush failed");
    }
    drop(state);
    let _ = audit_task.await;

    info!("worker shutdown complete");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relayq_protocol::{CreatedBy, CreatedByKind, Priority};

    fn message(priority: Priority) -> RequestMessage {
        RequestMessage {
            message_id: "m-1".to_string(),
            schema_version: relayq_protocol::SCHEMA_VERSION.to_string(),
            org_id: "acme".to_string(),
            agent_id: Some("agent-1".to_string()),
            user_id: None,
            goal_id: Some("g".to_string()),
            task_id: Some("t".to_string()),
            parent_message_id: None,
            created_by: CreatedBy {
                kind: CreatedByKind::System,
                id: "test".to_string(),
            },
            message_type: MessageType::ModelCall,
            priority,
            created_at: Utc::now(),
            expires_at: None,
            retry_count: 0,
            max_retries: 3,
            dedup_key: None,
            no_demote: false,
            context: None,
            resource_limits: None,
            payload: json!({}),
        }
    }

    #[test]
    fn test_sequencer_chunk_indices_are_contiguous() {
        let seq = FrameSequencer::new();
        assert_eq!(seq.claim_chunk_index(), 0);
        assert_eq!(seq.claim_chunk_index(), 1);
        assert_eq!(seq.claim_chunk_index(), 2);
        assert_eq!(seq.chunks_emitted(), 3);
    }

    #[test]
    fn test_sequencer_single_terminal_frame() {
        let seq = FrameSequencer::new();
        assert!(!seq.terminal_sent());
        assert!(seq.claim_terminal(), "first terminal claim wins");
        assert!(!seq.claim_terminal(), "second terminal claim loses");
        assert!(seq.terminal_sent());
    }

    #[test]
    fn test_registry_covers_every_message_type() {
        let registry = HandlerRegistry::with_defaults();
        for message_type in [
            MessageType::ModelCall,
            MessageType::ToolCall,
            MessageType::AgentMessage,
            MessageType::MemorySave,
            MessageType::MemoryRetrieve,
            MessageType::MemoryUpdate,
            MessageType::AgentSpawn,
            MessageType::AgentTerminate,
        ] {
            assert!(registry.get(message_type).is_some(), "{message_type} missing");
        }
    }

    #[test]
    fn test_resolve_agent_id_prefers_message() {
        let msg = message(Priority::P2);
        assert_eq!(resolve_agent_id(&msg, "fallback"), "agent-1");
    }

    #[test]
    fn test_resolve_agent_id_falls_back_for_legacy_messages() {
        let mut msg = message(Priority::P2);
        msg.agent_id = None;
        assert_eq!(resolve_agent_id(&msg, "fallback"), "fallback");
        msg.agent_id = Some(String::new());
        assert_eq!(resolve_agent_id(&msg, "fallback"), "fallback");
    }

    #[test]
    fn test_forced_error_parses_kind() {
        let mut msg = message(Priority::P2);
        assert!(forced_error(&msg).is_none());

        msg.context = Some(json!({"force_error": true}));
        assert!(matches!(forced_error(&msg), Some(HandlerError::Other(_))));

        msg.context = Some(json!({"force_error": true, "force_error_kind": "rate_limit"}));
        assert!(matches!(forced_error(&msg), Some(HandlerError::RateLimit(_))));

        msg.context = Some(json!({"force_error": false}));
        assert!(forced_error(&msg).is_none());
    }

    #[test]
    fn test_error_history_accumulates_across_attempts() {
        let mut msg = message(Priority::P1);
        msg.context = Some(json!({"demo": true}));
        append_error_history(&mut msg, ErrorKind::TransientIo, "conn reset");
        msg.retry_count = 1;
        append_error_history(&mut msg, ErrorKind::TransientIo, "conn reset");

        let history = error_history_of(&msg);
        let entries = history.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["retry_count"], 0);
        assert_eq!(entries[1]["retry_count"], 1);
        // Pre-existing context keys survive
        assert_eq!(msg.context.as_ref().unwrap()["demo"], true);
    }

    #[test]
    fn test_retry_sequence_demotes_one_class_per_attempt() {
        // A P1 message failing with rate_limit twice is observed at
        // priorities 1, 2, 3 across its three dequeues.
        let mut msg = message(Priority::P1);
        let mut observed = vec![msg.priority.as_u8()];
        for _ in 0..2 {
            let decision = decide_retry(&msg, ErrorKind::RateLimit);
            assert!(decision.should_retry);
            msg.priority = decision.next_priority;
            msg.retry_count = decision.next_retry_count;
            observed.push(msg.priority.as_u8());
        }
        assert_eq!(observed, vec![1, 2, 3]);
    }

    #[test]
    fn test_exhausted_retries_route_to_dlq() {
        let mut msg = message(Priority::P2);
        msg.retry_count = msg.max_retries;
        let decision = decide_retry(&msg, ErrorKind::TransientIo);
        assert!(!decision.should_retry, "retry_count == max_retries goes to DLQ");
    }

    #[tokio::test]
    async fn test_streaming_handler_contract() {
        // The streaming handler must leave nothing for the worker to emit:
        // it finishes with stream_complete before returning.
        let msg = {
            let mut m = message(Priority::P2);
            m.payload = json!({"stream": true, "chunks": ["a", "b", "c"]});
            m
        };
        let wants_stream = msg.payload.get("stream").and_then(Value::as_bool).unwrap();
        assert!(wants_stream);
        let chunks = msg.payload.get("chunks").and_then(Value::as_array).unwrap();
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            RelayError::Config("bad".to_string()).exit_code(),
            EXIT_CONFIG
        );
        assert_eq!(
            RelayError::Broker(BrokerError::NotConfirmed).exit_code(),
            EXIT_BROKER
        );
        assert_eq!(
            RelayError::Store(StoreError::Unavailable("down".to_string())).exit_code(),
            EXIT_STORE
        );
    }
}
