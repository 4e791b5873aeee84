use crate::batch::PendingBatch;
use crate::endpoint::ChannelEndpoint;
use crate::error::RegistryError;
use crate::experience::Experience;
use crate::net::{LearnConfig, LearnProgress, LearnSummary, Network, NetworkSpawner};
use crate::protocol::{
    Envelope, EndpointId, MetricsWindow, ModelReply, ModelRequest, ReplyPayload, RequestId,
};
use crate::schema::TensorSchema;
use crate::timer::FlushTimer;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use spt_util::math::{Histogram, RunningAverage};
use std::collections::HashMap;
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, span, Level};

/// Batching parameters shared by every subscription point of the registry.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_size: usize,
    pub timeout: Duration,
}

impl BatchConfig {
    pub fn new(max_size: usize, timeout_ns: u64) -> Self {
        BatchConfig {
            max_size,
            timeout: Duration::from_nanos(timeout_ns),
        }
    }
}

struct MetricsLock {
    scope: String,
    step: u64,
    batch_latency: Histogram,
    request_delay: Histogram,
    batch_size: Histogram,
}

enum HandleState {
    Ready(Box<dyn Network>),
    /// Weights are temporarily moved out to the learn task. Serving and any
    /// weight mutation on this name are rejected until they return.
    Learning,
}

/// A named, mutable network resource plus its batching state.
struct ModelHandle {
    state: HandleState,
    schema: Arc<TensorSchema>,
    batch: PendingBatch,
    /// Identifies the current unflushed batch; a timer firing for an older
    /// generation is stale and ignored.
    generation: u64,
    timer: Option<FlushTimer>,
    lock: Option<MetricsLock>,
}

impl ModelHandle {
    fn new(network: Box<dyn Network>, schema: Arc<TensorSchema>) -> Self {
        ModelHandle {
            state: HandleState::Ready(network),
            batch: PendingBatch::new(schema.clone()),
            schema,
            generation: 0,
            timer: None,
            lock: None,
        }
    }
}

struct EndpointSlot {
    reply_tx: mpsc::UnboundedSender<ModelReply>,
    subscription: Option<String>,
}

pub enum RegistryMsg {
    FromEndpoint {
        endpoint: EndpointId,
        envelope: Envelope,
    },
    NewEndpoint {
        subscription: Option<String>,
        reply: oneshot::Sender<
            Result<(EndpointId, mpsc::UnboundedReceiver<ModelReply>), RegistryError>,
        >,
    },
    TimerFired {
        name: String,
        generation: u64,
    },
    LearnFinished {
        name: String,
        network: Box<dyn Network>,
        endpoint: EndpointId,
        id: RequestId,
        summary: LearnSummary,
    },
}

/// Cheap cloneable handle for opening endpoints to the registry task.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<RegistryMsg>,
}

impl RegistryHandle {
    async fn open_endpoint(
        &self,
        subscription: Option<String>,
    ) -> Result<ChannelEndpoint, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryMsg::NewEndpoint { subscription, reply })
            .map_err(|_| RegistryError::Closed)?;

        let (endpoint_id, replies) = rx.await.map_err(|_| RegistryError::Closed)??;
        Ok(ChannelEndpoint::new(endpoint_id, self.tx.clone(), replies))
    }

    /// An endpoint with no subscription, for registry-level operations.
    pub async fn controller(&self) -> Result<ChannelEndpoint, RegistryError> {
        self.open_endpoint(None).await
    }

    /// Registers a new caller whose predictions are routed through the shared
    /// batch accumulator of the named model.
    pub async fn subscribe(&self, name: &str) -> Result<ChannelEndpoint, RegistryError> {
        self.open_endpoint(Some(name.to_string())).await
    }
}

/// Owns every loaded model and runs the batch scheduler against them.
///
/// Everything here executes on one logical task: batch scheduling, weight
/// mutation and metrics bookkeeping are interleaved, never parallel, so no
/// locks guard the internal state. The only cross-task rule — never learn and
/// serve one name at once — is enforced by moving the weights out for the
/// duration of the learn episode.
struct ModelRegistry {
    spawner: Arc<dyn NetworkSpawner>,
    schema: Arc<TensorSchema>,
    batch_cfg: BatchConfig,
    models: HashMap<String, ModelHandle>,
    endpoints: HashMap<EndpointId, EndpointSlot>,
    next_endpoint: u64,
    /// Weak so the actor does not keep itself alive; timers and learn tasks
    /// hold upgraded clones only while they run.
    self_tx: mpsc::WeakUnboundedSender<RegistryMsg>,
    rx: mpsc::UnboundedReceiver<RegistryMsg>,
}

pub fn spawn_registry(spawner: Arc<dyn NetworkSpawner>, batch_cfg: BatchConfig) -> RegistryHandle {
    let (tx, rx) = mpsc::unbounded_channel();

    let registry = ModelRegistry {
        schema: Arc::new(spawner.schema()),
        spawner,
        batch_cfg,
        models: HashMap::new(),
        endpoints: HashMap::new(),
        next_endpoint: 0,
        self_tx: tx.downgrade(),
        rx,
    };

    tokio::spawn(registry.run());

    RegistryHandle { tx }
}

impl ModelRegistry {
    async fn run(mut self) {
        let span = span!(Level::INFO, "ModelRegistry");
        let _enter = span.enter();

        while let Some(msg) = self.rx.recv().await {
            self.handle_msg(msg);
        }

        info!(
            "Registry shutting down, releasing {} model(s).",
            self.models.len()
        );
    }

    fn handle_msg(&mut self, msg: RegistryMsg) {
        match msg {
            RegistryMsg::FromEndpoint { endpoint, envelope } => {
                self.handle_envelope(endpoint, envelope)
            }
            RegistryMsg::NewEndpoint { subscription, reply } => {
                let _ = reply.send(self.open_endpoint(subscription));
            }
            RegistryMsg::TimerFired { name, generation } => {
                let is_current = self
                    .models
                    .get(&name)
                    .is_some_and(|h| h.generation == generation);

                // A stale generation means a size-triggered flush won the race.
                if is_current {
                    self.flush_model(&name);
                }
            }
            RegistryMsg::LearnFinished {
                name,
                network,
                endpoint,
                id,
                summary,
            } => {
                if let Some(handle) = self.models.get_mut(&name) {
                    handle.state = HandleState::Ready(network);
                }
                self.reply(endpoint, id, true, Ok(ReplyPayload::LearnDone(summary)));
            }
        }
    }

    fn open_endpoint(
        &mut self,
        subscription: Option<String>,
    ) -> Result<(EndpointId, mpsc::UnboundedReceiver<ModelReply>), RegistryError> {
        if let Some(name) = &subscription {
            if !self.models.contains_key(name) {
                return Err(RegistryError::UnknownModel(name.clone()));
            }
        }

        let id = EndpointId(self.next_endpoint);
        self.next_endpoint += 1;

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        self.endpoints.insert(
            id,
            EndpointSlot {
                reply_tx,
                subscription,
            },
        );

        Ok((id, reply_rx))
    }

    fn reply(
        &self,
        endpoint: EndpointId,
        id: RequestId,
        done: bool,
        result: Result<ReplyPayload, RegistryError>,
    ) {
        let Some(slot) = self.endpoints.get(&endpoint) else {
            return;
        };

        let _ = slot.reply_tx.send(ModelReply {
            id,
            done,
            result: result.map_err(|e| e.to_string()),
        });
    }

    fn handle_envelope(&mut self, endpoint: EndpointId, envelope: Envelope) {
        let Envelope { id, request } = envelope;

        match request {
            ModelRequest::Predict { slots } => self.op_predict(endpoint, id, slots),
            ModelRequest::Learn {
                name,
                samples,
                config,
            } => self.op_learn(endpoint, id, name, samples, config),
            ModelRequest::Close => self.op_close(endpoint, id),
            other => {
                let result = self.op_sync(other);
                self.reply(endpoint, id, true, result);
            }
        }
    }

    /// Single-reply operations with no completion routing of their own.
    fn op_sync(&mut self, request: ModelRequest) -> Result<ReplyPayload, RegistryError> {
        match request {
            ModelRequest::Load { name, source, seed } => self.op_load(name, source, seed),
            ModelRequest::CloneModel { name, new_name } => self.op_clone(name, new_name),
            ModelRequest::CopyTo { from, to } => self.op_copy_to(from, to),
            ModelRequest::Lock { name, scope, step } => self.op_lock(name, scope, step),
            ModelRequest::Unlock { name } => self.op_unlock(name),
            ModelRequest::Save { name, path } => self.op_save(name, path),
            ModelRequest::Unload { name } => self.op_unload(name),
            ModelRequest::Predict { .. } | ModelRequest::Learn { .. } | ModelRequest::Close => {
                unreachable!("routed before op_sync")
            }
        }
    }

    fn op_predict(&mut self, endpoint: EndpointId, id: RequestId, slots: Vec<ndarray::ArrayD<f32>>) {
        let (name, reply_tx) = {
            let Some(slot) = self.endpoints.get(&endpoint) else {
                return;
            };
            let Some(name) = slot.subscription.clone() else {
                self.reply(endpoint, id, true, Err(RegistryError::NotSubscribed));
                return;
            };
            (name, slot.reply_tx.clone())
        };

        let add_result = {
            let Some(handle) = self.models.get_mut(&name) else {
                self.reply(
                    endpoint,
                    id,
                    true,
                    Err(RegistryError::UnknownModel(name)),
                );
                return;
            };

            if matches!(handle.state, HandleState::Learning) {
                self.reply(endpoint, id, true, Err(RegistryError::Learning(name)));
                return;
            }

            handle.batch.add(
                slots,
                Box::new(move |output| {
                    let _ = reply_tx.send(ModelReply {
                        id,
                        done: true,
                        result: Ok(ReplyPayload::Prediction(output)),
                    });
                }),
            )
        };

        if let Err(schema_err) = add_result {
            self.reply(endpoint, id, true, Err(schema_err.into()));
            return;
        }

        self.check_triggers(&name);
    }

    /// Size and time triggers, evaluated after every accepted request.
    fn check_triggers(&mut self, name: &str) {
        let Some(handle) = self.models.get_mut(name) else {
            return;
        };

        if handle.batch.len() >= self.batch_cfg.max_size {
            self.flush_model(name);
            return;
        }

        if handle.timer.is_none() {
            let Some(self_tx) = self.self_tx.upgrade() else {
                return;
            };
            let generation = handle.generation;
            let fired_name = name.to_string();

            handle.timer = Some(FlushTimer::arm(self.batch_cfg.timeout, move || {
                let _ = self_tx.send(RegistryMsg::TimerFired {
                    name: fired_name,
                    generation,
                });
            }));
        }
    }

    /// Swaps the accumulator for a fresh one and executes the old batch.
    /// Flushing an empty batch only clears the timer.
    fn flush_model(&mut self, name: &str) {
        let Some(handle) = self.models.get_mut(name) else {
            return;
        };

        if let Some(timer) = handle.timer.take() {
            timer.cancel();
        }

        if handle.batch.is_empty() {
            return;
        }

        let HandleState::Ready(network) = &handle.state else {
            // Predictions are rejected while learning, so nothing can be queued.
            return;
        };

        handle.generation += 1;
        let batch = mem::replace(&mut handle.batch, PendingBatch::new(handle.schema.clone()));

        let size = batch.len();
        let inputs = batch.stacked_inputs();

        let started = Instant::now();
        let outputs = network.forward(&inputs);
        let latency = started.elapsed();

        if let Some(lock) = &mut handle.lock {
            lock.batch_latency.record(latency.as_secs_f64());
            lock.batch_size.record(size as f64);
            for delay in batch.queue_delays(started) {
                lock.request_delay.record(delay.as_secs_f64());
            }
        }

        debug!("Flushed batch of {size} on '{name}' in {latency:?}");

        batch
            .resolve(outputs)
            .expect("model output violates its declared schema");
    }

    fn build_network(
        &self,
        source: Option<PathBuf>,
        seed: Option<u64>,
    ) -> Result<Box<dyn Network>, RegistryError> {
        let network = match source {
            Some(path) => self
                .spawner
                .load(&path)
                .map_err(|e| RegistryError::Load(e.to_string()))?,
            None => self.spawner.fresh(seed.unwrap_or(0)),
        };

        if *network.schema() != *self.schema {
            return Err(RegistryError::Load(format!(
                "loaded schema {:?} does not match registry schema {:?}",
                network.schema(),
                self.schema
            )));
        }

        Ok(network)
    }

    fn op_load(
        &mut self,
        name: String,
        source: Option<PathBuf>,
        seed: Option<u64>,
    ) -> Result<ReplyPayload, RegistryError> {
        if self.models.contains_key(&name) {
            return Err(RegistryError::DuplicateModel(name));
        }

        let network = self.build_network(source, seed)?;

        info!("Loaded model '{name}'");
        self.models
            .insert(name, ModelHandle::new(network, self.schema.clone()));

        Ok(ReplyPayload::Ack)
    }

    fn ready_network(&self, name: &str) -> Result<&dyn Network, RegistryError> {
        let handle = self
            .models
            .get(name)
            .ok_or_else(|| RegistryError::UnknownModel(name.to_string()))?;

        match &handle.state {
            HandleState::Ready(network) => Ok(network.as_ref()),
            HandleState::Learning => Err(RegistryError::Learning(name.to_string())),
        }
    }

    fn op_clone(&mut self, name: String, new_name: String) -> Result<ReplyPayload, RegistryError> {
        if self.models.contains_key(&new_name) {
            return Err(RegistryError::DuplicateModel(new_name));
        }

        let weights = self.ready_network(&name)?.export_weights();

        let mut network = self.spawner.fresh(0);
        network.import_weights(&weights)?;

        info!("Cloned model '{name}' into '{new_name}'");
        self.models
            .insert(new_name, ModelHandle::new(network, self.schema.clone()));

        Ok(ReplyPayload::Ack)
    }

    fn op_copy_to(&mut self, from: String, to: String) -> Result<ReplyPayload, RegistryError> {
        if from == to {
            return Ok(ReplyPayload::Ack);
        }

        let weights = self.ready_network(&from)?.export_weights();

        let target = self
            .models
            .get_mut(&to)
            .ok_or_else(|| RegistryError::UnknownModel(to.clone()))?;

        match &mut target.state {
            HandleState::Ready(network) => network.import_weights(&weights)?,
            HandleState::Learning => return Err(RegistryError::Learning(to)),
        }

        debug!("Copied weights '{from}' -> '{to}'");
        Ok(ReplyPayload::Ack)
    }

    fn op_lock(
        &mut self,
        name: String,
        scope: String,
        step: u64,
    ) -> Result<ReplyPayload, RegistryError> {
        let handle = self
            .models
            .get_mut(&name)
            .ok_or_else(|| RegistryError::UnknownModel(name.clone()))?;

        match &handle.lock {
            None => {
                handle.lock = Some(MetricsLock {
                    scope,
                    step,
                    batch_latency: Histogram::new(),
                    request_delay: Histogram::new(),
                    batch_size: Histogram::new(),
                });
                Ok(ReplyPayload::Ack)
            }
            Some(lock) if lock.scope == scope && lock.step == step => Ok(ReplyPayload::Ack),
            Some(lock) => Err(RegistryError::ScopeAlreadyLocked {
                name,
                scope: lock.scope.clone(),
                step: lock.step,
                requested: scope,
            }),
        }
    }

    fn op_unlock(&mut self, name: String) -> Result<ReplyPayload, RegistryError> {
        let handle = self
            .models
            .get_mut(&name)
            .ok_or_else(|| RegistryError::UnknownModel(name.clone()))?;

        let lock = handle
            .lock
            .take()
            .ok_or_else(|| RegistryError::NotLocked(name))?;

        Ok(ReplyPayload::MetricsWindow(MetricsWindow {
            scope: lock.scope,
            step: lock.step,
            batch_latency: lock.batch_latency.summary(),
            request_delay: lock.request_delay.summary(),
            batch_size: lock.batch_size.summary(),
        }))
    }

    fn op_save(&mut self, name: String, path: PathBuf) -> Result<ReplyPayload, RegistryError> {
        self.ready_network(&name)?
            .save(&path)
            .map_err(|e| RegistryError::Save(e.to_string()))?;

        Ok(ReplyPayload::Ack)
    }

    fn op_unload(&mut self, name: String) -> Result<ReplyPayload, RegistryError> {
        {
            let handle = self
                .models
                .get(&name)
                .ok_or_else(|| RegistryError::UnknownModel(name.clone()))?;

            if matches!(handle.state, HandleState::Learning) {
                return Err(RegistryError::Learning(name));
            }
        }

        // Dropping the handle drops its unflushed batch: those in-flight
        // requests are never resolved, per the close/cancellation contract.
        self.models.remove(&name);

        let closing: Vec<EndpointId> = self
            .endpoints
            .iter()
            .filter(|(_, slot)| slot.subscription.as_deref() == Some(name.as_str()))
            .map(|(id, _)| *id)
            .collect();

        for endpoint in closing {
            self.endpoints.remove(&endpoint);
        }

        info!("Unloaded model '{name}'");
        Ok(ReplyPayload::Ack)
    }

    fn op_learn(
        &mut self,
        endpoint: EndpointId,
        id: RequestId,
        name: String,
        samples: Arc<Vec<Experience>>,
        config: LearnConfig,
    ) {
        let reply_tx = match self.endpoints.get(&endpoint) {
            Some(slot) => slot.reply_tx.clone(),
            None => return,
        };

        // Serve whatever is queued before the weights go away.
        self.flush_model(&name);

        let Some(self_tx) = self.self_tx.upgrade() else {
            self.reply(endpoint, id, true, Err(RegistryError::Closed));
            return;
        };

        let Some(handle) = self.models.get_mut(&name) else {
            self.reply(endpoint, id, true, Err(RegistryError::UnknownModel(name)));
            return;
        };

        let mut network = match mem::replace(&mut handle.state, HandleState::Learning) {
            HandleState::Ready(network) => network,
            HandleState::Learning => {
                self.reply(endpoint, id, true, Err(RegistryError::Learning(name)));
                return;
            }
        };

        // The external collaborator computes the actual gradients; this task
        // only sequences epochs and streams progress back under one id.
        tokio::task::spawn_blocking(move || {
            let started = Instant::now();

            let mut total_loss = RunningAverage::new();
            let mut total_batches = 0usize;
            let mut indices: Vec<usize> = (0..samples.len()).collect();

            for epoch in 0..config.epochs {
                let mut rng =
                    StdRng::seed_from_u64(config.shuffle_seed.wrapping_add(epoch as u64));
                indices.shuffle(&mut rng);

                let mut epoch_loss = RunningAverage::new();
                let mut batches = 0usize;

                for chunk in indices.chunks(config.batch_size.max(1)) {
                    let batch: Vec<&Experience> = chunk.iter().map(|&i| &samples[i]).collect();
                    let loss = network.train_step(&batch, config.learning_rate);

                    epoch_loss.add_sample(loss as f64);
                    total_loss.add_sample(loss as f64);
                    batches += 1;
                }

                total_batches += batches;

                let _ = reply_tx.send(ModelReply {
                    id,
                    done: false,
                    result: Ok(ReplyPayload::LearnProgress(LearnProgress {
                        epoch,
                        batches,
                        epoch_loss: epoch_loss.get_average() as f32,
                    })),
                });
            }

            let summary = LearnSummary {
                epochs: config.epochs,
                batches: total_batches,
                mean_loss: total_loss.get_average() as f32,
                duration_ms: started.elapsed().as_millis() as u64,
            };

            let _ = self_tx.send(RegistryMsg::LearnFinished {
                name,
                network,
                endpoint,
                id,
                summary,
            });
        });
    }

    fn op_close(&mut self, endpoint: EndpointId, id: RequestId) {
        // Drain: anything this endpoint queued earlier sits in its model's
        // accumulator; flushing it resolves those requests before we confirm.
        let subscription = self
            .endpoints
            .get(&endpoint)
            .and_then(|slot| slot.subscription.clone());

        if let Some(name) = subscription {
            self.flush_model(&name);
        }

        self.reply(endpoint, id, true, Ok(ReplyPayload::Closed));
        self.endpoints.remove(&endpoint);
    }
}
