//! Sequencing of the tasks.
//!
//! A task runs through the phases
//!
//! ```text
//! NotStarted -> BroadcastingStart -> Accumulating -> ComputingStats -> BroadcastingResults -> Done
//! ```
//!
//! and may fail at any point. [`TaskOrchestrator::start_task`] moves every registered client into
//! the active state of the task and broadcasts the start command. The clients then stream their
//! messages, which [`TaskOrchestrator::handle_message`] feeds into the [`AggregationStore`].
//! Whenever a client finishes, the barrier is checked: once no client is left in the active
//! state, exactly one caller completes the phase. For the init task this derives and broadcasts
//! the statistics of every chromosome.
//!
//! [`TaskOrchestrator::supervise`] watches a run, warns about stalled barriers and enforces the
//! optional deadline.

mod run;
#[cfg(test)]
mod tests;

pub use self::run::{TaskPhase, TaskRun};

use std::sync::{Arc, RwLock};

use displaydoc::Display;
use ndarray::Array1;
use thiserror::Error;
use tokio::time::{self, Instant as TokioInstant};
use tracing::{debug, error, error_span, info, warn};
use tracing_futures::Instrument;
use validator::{Validate, ValidationErrors};

use crate::{
    channel::{ChannelError, MessageChannel},
    messages::{ClientMessage, QcBroadcast, StatsBroadcast, TaskRequest},
    registry::{ClientRegistry, RegistryError, TaskKind, TaskState},
    report::ReportGenerator,
    settings::TaskSettings,
    stats::{QcThresholds, StatsComputer},
    storage::{AggregationError, AggregationStore, ArrayStore, Chunk, MalformedPartial},
    utils::{read, write},
};

/// Errors which can occur while handling a client message. They only affect that message.
#[derive(Debug, Display, Error)]
pub enum MessageError {
    /// Client {0} is not registered.
    UnknownClient(String),
    /// Malformed message: {0}.
    Malformed(#[from] MalformedPartial),
    /// No task is running.
    NoActiveTask,
    /// The message belongs to task {got} but task {expected} is running.
    UnexpectedTask { expected: TaskKind, got: TaskKind },
    /// Client {client} is in state {state} and does not take part in the running task.
    NotParticipating { client: String, state: TaskState },
    /// Aggregation failed: {0}.
    Aggregation(AggregationError),
    /// Registry request failed: {0}.
    Registry(#[from] RegistryError),
}

impl From<AggregationError> for MessageError {
    fn from(err: AggregationError) -> Self {
        match err {
            AggregationError::Malformed(malformed) => MessageError::Malformed(malformed),
            err => MessageError::Aggregation(err),
        }
    }
}

/// Errors of a task run.
#[derive(Debug, Display, Error)]
pub enum OrchestratorError {
    /// Task {0} is still running.
    TaskActive(TaskKind),
    /// Invalid QC thresholds: {0}.
    InvalidThresholds(#[from] ValidationErrors),
    /// The QC requires the statistics of a completed init task.
    MissingStatistics,
    /// Broadcast failed: {0}.
    Channel(#[from] ChannelError),
    /// Aggregation failed: {0}.
    Aggregation(#[from] AggregationError),
    /// Registry request failed: {0}.
    Registry(#[from] RegistryError),
    /// Task {task} missed its deadline, pending clients: {pending:?}.
    BarrierStall { task: TaskKind, pending: Vec<String> },
    /// Task {task} completed without the clients {failed:?} which missed the deadline.
    PartialCompletion { task: TaskKind, failed: Vec<String> },
    /// Task {0} failed.
    TaskFailed(TaskKind),
}

/// The state shared by the request handlers of the coordinator.
pub struct CoordinatorContext<S> {
    pub registry: ClientRegistry,
    pub store: AggregationStore<S>,
    current: RwLock<Option<Arc<TaskRun>>>,
}

impl<S> CoordinatorContext<S>
where
    S: ArrayStore,
{
    pub fn new(registry: ClientRegistry, store: AggregationStore<S>) -> Self {
        Self {
            registry,
            store,
            current: RwLock::new(None),
        }
    }

    /// The latest run, whether it is still active or not.
    pub fn current_run(&self) -> Option<Arc<TaskRun>> {
        read(&self.current).clone()
    }

    /// The run accepting messages, if any.
    pub fn active_run(&self) -> Option<Arc<TaskRun>> {
        self.current_run().filter(|run| run.is_active())
    }
}

/// Drives the tasks of the coordinator.
pub struct TaskOrchestrator<S> {
    ctx: Arc<CoordinatorContext<S>>,
    channel: Arc<dyn MessageChannel>,
    stats: Arc<StatsComputer>,
    report: Arc<dyn ReportGenerator>,
    settings: Arc<TaskSettings>,
}

impl<S> Clone for TaskOrchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            channel: self.channel.clone(),
            stats: self.stats.clone(),
            report: self.report.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<S> TaskOrchestrator<S>
where
    S: ArrayStore,
{
    pub fn new(
        ctx: Arc<CoordinatorContext<S>>,
        channel: Arc<dyn MessageChannel>,
        stats: StatsComputer,
        report: Arc<dyn ReportGenerator>,
        settings: TaskSettings,
    ) -> Self {
        Self {
            ctx,
            channel,
            stats: Arc::new(stats),
            report,
            settings: Arc::new(settings),
        }
    }

    pub fn context(&self) -> &CoordinatorContext<S> {
        &self.ctx
    }

    /// Starts a task.
    ///
    /// Every registered client is moved into the active state of the task and the start command
    /// is broadcast. For the QC task, the retained loci of every chromosome are computed from the
    /// statistics of the init task, stored and broadcast instead.
    ///
    /// # Errors
    /// Fails if another run is active, if the QC thresholds are invalid or the statistics they
    /// apply to are missing, or if the start command could not be broadcast. The returned run is
    /// failed in the latter cases.
    pub async fn start_task(
        &self,
        request: TaskRequest,
    ) -> Result<Arc<TaskRun>, OrchestratorError> {
        if let TaskRequest::Qc(thresholds) = &request {
            thresholds.validate()?;
        }

        let run = {
            let mut current = write(&self.ctx.current);
            if let Some(run) = current.as_ref().filter(|run| run.is_active()) {
                return Err(OrchestratorError::TaskActive(run.kind()));
            }
            let run = Arc::new(TaskRun::new(request));
            *current = Some(run.clone());
            run
        };

        let span = error_span!("task", id = %run.id(), kind = %run.kind());
        async {
            info!("starting task");
            if let Err(err) = self.launch(&run).await {
                error!("failed to start task: {}", err);
                run.advance(TaskPhase::Failed);
                return Err(err);
            }
            Ok(run.clone())
        }
        .instrument(span)
        .await
    }

    async fn launch(&self, run: &TaskRun) -> Result<(), OrchestratorError> {
        run.advance(TaskPhase::BroadcastingStart);
        let kind = run.kind();
        let retained = match run.request() {
            TaskRequest::Init => {
                // the counts are additive: a new init run starts from scratch
                self.ctx.store.reset()?;
                Vec::new()
            }
            TaskRequest::Qc(thresholds) => {
                self.ctx.store.begin_task(kind);
                self.retained_loci(&thresholds)?
            }
        };

        for client in self.ctx.registry.list_clients() {
            self.ctx
                .registry
                .set_state(&client.name, kind.active_state())?;
        }

        match run.request() {
            TaskRequest::Init => {
                self.channel
                    .broadcast("init", &self.settings.env, None)
                    .await?
            }
            TaskRequest::Qc(thresholds) => {
                for (chrom, retained) in retained {
                    self.ctx.store.record_retained(&chrom, retained.clone())?;
                    let kept = retained.iter().filter(|keep| **keep).count();
                    info!(
                        "retaining {} of {} loci in chromosome {}",
                        kept,
                        retained.len(),
                        chrom
                    );
                    let payload = bincode::serialize(&QcBroadcast {
                        chrom,
                        thresholds,
                        retained,
                    })
                    .map_err(ChannelError::from)?;
                    self.channel
                        .broadcast("qc", &self.settings.env, Some(payload))
                        .await?;
                }
            }
        }

        run.advance(TaskPhase::Accumulating);
        self.check_barrier(run).await;
        Ok(())
    }

    /// Computes the retained loci of every chromosome.
    fn retained_loci(
        &self,
        thresholds: &QcThresholds,
    ) -> Result<Vec<(String, Array1<bool>)>, OrchestratorError> {
        let chromosomes = self.ctx.store.chromosomes();
        if chromosomes.is_empty() {
            return Err(OrchestratorError::MissingStatistics);
        }
        chromosomes
            .into_iter()
            .map(|chrom| {
                let stats = self
                    .ctx
                    .store
                    .stats(&chrom)
                    .ok_or(OrchestratorError::MissingStatistics)?;
                Ok((chrom, thresholds.retained(&stats)))
            })
            .collect()
    }

    /// Handles a message of a client.
    ///
    /// An error only rejects the message: the store is left untouched and the task goes on.
    pub async fn handle_message(&self, client: &str, bytes: &[u8]) -> Result<(), MessageError> {
        let span = error_span!("message", client = client);
        async {
            let result = self.process_message(client, bytes).await;
            if let Err(err) = &result {
                warn!("rejected message: {}", err);
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn process_message(&self, client: &str, bytes: &[u8]) -> Result<(), MessageError> {
        if !self.ctx.registry.contains(client) {
            return Err(MessageError::UnknownClient(client.to_string()));
        }
        let message = ClientMessage::decode(bytes)?;
        let run = self.ctx.active_run().ok_or(MessageError::NoActiveTask)?;
        let kind = run.kind();
        if message.task() != kind {
            return Err(MessageError::UnexpectedTask {
                expected: kind,
                got: message.task(),
            });
        }

        match message {
            ClientMessage::Positions {
                chrom, positions, ..
            } => {
                self.ensure_participating(client, kind)?;
                self.ctx
                    .store
                    .record_positions(client, &chrom, Array1::from(positions))?;
            }
            ClientMessage::Counts {
                subtask,
                chrom,
                n,
                counts,
                start,
                end,
                ..
            } => {
                self.ensure_participating(client, kind)?;
                debug!(
                    "{} counts for chromosome {} (subtask {:?})",
                    kind, chrom, subtask
                );
                let chunk = Chunk {
                    chrom: &chrom,
                    n,
                    counts: counts.view(),
                    start,
                    end,
                };
                let outcome = self.ctx.store.record_counts(client, kind, chunk)?;
                if outcome.end {
                    self.client_finished(&run, client).await?;
                }
            }
            ClientMessage::Finished { .. } => self.client_finished(&run, client).await?,
        }
        Ok(())
    }

    fn ensure_participating(&self, client: &str, kind: TaskKind) -> Result<(), MessageError> {
        let state = self.ctx.registry.state(client)?;
        if state != kind.active_state() {
            return Err(MessageError::NotParticipating {
                client: client.to_string(),
                state,
            });
        }
        Ok(())
    }

    /// Marks a client as done with its part of the run and checks the barrier.
    async fn client_finished(&self, run: &TaskRun, client: &str) -> Result<(), MessageError> {
        let kind = run.kind();
        let moved = self.ctx.registry.transition(
            client,
            kind.active_state(),
            kind.reported_state(),
        )?;
        if moved {
            info!("{} finished task {}", client, kind);
            self.check_barrier(run).await;
        } else {
            debug!("ignoring repeated end of {}", client);
        }
        Ok(())
    }

    /// Completes the phase if no client is left in the active state.
    async fn check_barrier(&self, run: &TaskRun) {
        let pending = self.ctx.registry.count_in_state(run.kind().active_state());
        if pending == 0 && run.try_fire() {
            info!("all clients finished task {}", run.kind());
            self.finish(run).await;
        }
    }

    async fn finish(&self, run: &TaskRun) {
        if let Err(err) = self.complete_phase(run).await {
            error!("task {} failed: {}", run.kind(), err);
            run.advance(TaskPhase::Failed);
        }
    }

    async fn complete_phase(&self, run: &TaskRun) -> Result<(), OrchestratorError> {
        let kind = run.kind();
        if let TaskRequest::Init = run.request() {
            run.advance(TaskPhase::ComputingStats);
            info!("Transferring QC summary stats.");
            let n = self.ctx.store.total_individuals();
            let mut results = Vec::new();
            for chrom in self.ctx.store.chromosomes() {
                let counts = match self.ctx.store.counts(&chrom) {
                    Some(counts) => counts,
                    None => {
                        warn!("chromosome {} has positions but no counts", chrom);
                        continue;
                    }
                };
                let stats = self.stats.compute(counts.view(), n);
                self.ctx.store.finalize_chromosome(&chrom, stats.clone())?;
                results.push(StatsBroadcast {
                    task: kind,
                    subtask: "STATS".to_string(),
                    chrom,
                    stats,
                });
            }

            run.advance(TaskPhase::BroadcastingResults);
            for result in results {
                let payload = bincode::serialize(&result).map_err(ChannelError::from)?;
                self.channel
                    .broadcast("init/stats", &self.settings.env, Some(payload))
                    .await?;
            }
        }

        for client in self.ctx.registry.list_clients() {
            if client.state != TaskState::Failed {
                self.ctx.registry.set_state(&client.name, kind.done_state())?;
            }
        }
        run.advance(TaskPhase::Done);
        info!(
            "task {} took roughly {:.1} seconds",
            kind,
            run.started().elapsed().as_secs_f64()
        );

        let output = match kind {
            TaskKind::Init => "QC_pre_filter.png",
            TaskKind::Qc => "QC_post_filter.png",
        };
        self.report
            .generate_report(self.ctx.store.array_store().path(), output);
        Ok(())
    }

    /// Watches a run until it is over.
    ///
    /// While the barrier is pending, a warning with the pending clients is logged at the
    /// configured interval. If a deadline is configured and elapses, the pending clients are
    /// marked as failed. The run then either completes with the messages received so far or
    /// fails, depending on the settings.
    ///
    /// # Errors
    /// Fails with [`OrchestratorError::PartialCompletion`] or
    /// [`OrchestratorError::BarrierStall`] if the deadline elapsed, and with
    /// [`OrchestratorError::TaskFailed`] if the run failed otherwise.
    pub async fn supervise(&self, run: Arc<TaskRun>) -> Result<(), OrchestratorError> {
        let span = error_span!("supervise", id = %run.id(), kind = %run.kind());
        async {
            let period = self.settings.stall_warning();
            let mut stall = time::interval_at(TokioInstant::now() + period, period);
            let deadline = self
                .settings
                .deadline()
                .map(|deadline| TokioInstant::from_std(run.started()) + deadline);
            let mut phases = run.subscribe();

            loop {
                if run.phase().is_terminal() {
                    return self.outcome(&run);
                }
                let expired = async {
                    match deadline {
                        Some(deadline) => time::sleep_until(deadline).await,
                        None => futures::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = phases.changed() => {}
                    _ = stall.tick() => {
                        let pending = self.ctx.registry.clients_in_state(run.kind().active_state());
                        warn!(
                            "task {} waits for {} clients after {:.1} seconds: {:?}",
                            run.kind(),
                            pending.len(),
                            run.started().elapsed().as_secs_f64(),
                            pending,
                        );
                    }
                    _ = expired => return self.enforce_deadline(&run).await,
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn enforce_deadline(&self, run: &TaskRun) -> Result<(), OrchestratorError> {
        let kind = run.kind();
        if !run.try_fire() {
            // the barrier fired in the meantime
            let mut phases = run.subscribe();
            while !run.phase().is_terminal() {
                if phases.changed().await.is_err() {
                    break;
                }
            }
            return self.outcome(run);
        }

        let pending = self.ctx.registry.clients_in_state(kind.active_state());
        for client in &pending {
            self.ctx
                .registry
                .transition(client, kind.active_state(), TaskState::Failed)?;
        }
        if pending.is_empty() {
            self.finish(run).await;
            return self.outcome(run);
        }
        warn!("task {} missed its deadline, failed clients: {:?}", kind, pending);

        if self.settings.partial_completion {
            self.finish(run).await;
            match run.phase() {
                TaskPhase::Done => Err(OrchestratorError::PartialCompletion {
                    task: kind,
                    failed: pending,
                }),
                _ => Err(OrchestratorError::TaskFailed(kind)),
            }
        } else {
            run.advance(TaskPhase::Failed);
            Err(OrchestratorError::BarrierStall {
                task: kind,
                pending,
            })
        }
    }

    fn outcome(&self, run: &TaskRun) -> Result<(), OrchestratorError> {
        match run.phase() {
            TaskPhase::Done => Ok(()),
            _ => Err(OrchestratorError::TaskFailed(run.kind())),
        }
    }

    /// Registers a client.
    pub fn register_client(&self, name: &str, address: Option<String>) {
        self.ctx.registry.register(name, address);
    }
}
