//! The round coordinator: samples per-participant configurations, gates on
//! quorum, aggregates, updates the policy and schedules evaluation.

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use fx_policy::{ActionSpace, PolicySnapshot, PolicyState, PolicyUpdater, SearchAspect, SearchSpace};
use fx_types::{
    ClientMessage, ClientUpdate, Dispatch, EvalReport, FedExConfig, FeedbackError, FxError,
    FxResult, ModelParams, ParticipantId,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::Aggregator;
use crate::buffer::{BufferOutcome, RoundBuffer};
use crate::eval::EvalSummary;
use crate::events::{CoordinatorEvent, CoordinatorState, DropReason, RunSummary};
use crate::sink::{JsonFileSink, PolicySink};
use crate::stopper::EarlyStopper;
use crate::transport::Transport;

/// Drives a FedEx run round by round.
///
/// All state changes go through `&mut self`, so sampling, policy mutation and
/// dispatch are strictly ordered. Participant results are fed in through
/// [`RoundCoordinator::handle_message`].
pub struct RoundCoordinator<T, A, E> {
    config: FedExConfig,
    transport: T,
    aggregator: A,
    stopper: E,
    sink: Option<Box<dyn PolicySink>>,
    events: Option<Sender<CoordinatorEvent>>,
    rng: StdRng,
    action_space: ActionSpace,
    policy: PolicyState,
    updater: PolicyUpdater,
    model: ModelParams,
    state: CoordinatorState,
    round: u64,
    rounds_completed: u64,
    train_buffer: RoundBuffer<ClientUpdate>,
    eval_buffer: RoundBuffer<EvalReport>,
    evaluations: Vec<EvalSummary>,
    early_stopped: bool,
    run_id: Uuid,
    started_at: Option<DateTime<Utc>>,
    summary: Option<RunSummary>,
}

impl<T, A, E> RoundCoordinator<T, A, E>
where
    T: Transport,
    A: Aggregator,
    E: EarlyStopper,
{
    /// Build a coordinator with a uniform policy over the expanded search space.
    ///
    /// A [`JsonFileSink`] is attached when the configuration names an output directory.
    pub fn new(
        config: FedExConfig,
        search_space: &SearchSpace,
        model: ModelParams,
        transport: T,
        aggregator: A,
        stopper: E,
    ) -> FxResult<Self> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let action_space = ActionSpace::build(search_space, &config, &mut rng)?;
        let policy = PolicyState::new(action_space.clone(), config.eta0, config.entropy_cutoff);
        let updater = PolicyUpdater::new(&config, &policy);
        let sink = config
            .outdir
            .as_ref()
            .map(|dir| Box::new(JsonFileSink::new(dir)) as Box<dyn PolicySink>);

        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            aspects = ?action_space.sizes(),
            schedule = %config.step_schedule,
            rounds = config.total_round_budget,
            "created coordinator"
        );

        Ok(Self {
            config,
            transport,
            aggregator,
            stopper,
            sink,
            events: None,
            rng,
            action_space,
            policy,
            updater,
            model,
            state: CoordinatorState::Idle,
            round: 0,
            rounds_completed: 0,
            train_buffer: RoundBuffer::new(),
            eval_buffer: RoundBuffer::new(),
            evaluations: Vec::new(),
            early_stopped: false,
            run_id,
            started_at: None,
            summary: None,
        })
    }

    pub fn with_policy_sink(mut self, sink: Box<dyn PolicySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_events(mut self, events: Sender<CoordinatorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the uniform policy with a persisted one. Only allowed before [`start`](Self::start).
    pub fn restore_policy(&mut self, snapshot: &PolicySnapshot) -> FxResult<()> {
        if self.state != CoordinatorState::Idle {
            return Err(FxError::State(format!(
                "cannot restore a policy while {}",
                self.state
            )));
        }
        self.policy = PolicyState::restore(
            self.action_space.clone(),
            snapshot,
            self.config.eta0,
            self.config.entropy_cutoff,
        )?;
        self.updater = PolicyUpdater::new(&self.config, &self.policy);
        info!(entropy = self.policy.entropy(), "restored policy");
        Ok(())
    }

    pub fn config(&self) -> &FedExConfig {
        &self.config
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn rounds_completed(&self) -> u64 {
        self.rounds_completed
    }

    pub fn policy(&self) -> &PolicyState {
        &self.policy
    }

    pub fn updater(&self) -> &PolicyUpdater {
        &self.updater
    }

    pub fn action_space(&self) -> &ActionSpace {
        &self.action_space
    }

    pub fn model(&self) -> &ModelParams {
        &self.model
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn evaluations(&self) -> &[EvalSummary] {
        &self.evaluations
    }

    /// Available once the run has finished.
    pub fn summary(&self) -> Option<&RunSummary> {
        self.summary.as_ref()
    }

    /// Leave `Idle` and dispatch the first round.
    pub async fn start(&mut self) -> FxResult<()> {
        if self.state != CoordinatorState::Idle {
            return Err(FxError::State(format!(
                "start called while {}",
                self.state
            )));
        }
        self.started_at = Some(Utc::now());
        info!(run_id = %self.run_id, "starting run");
        self.begin_round().await
    }

    /// Accept one participant message and advance as far as it allows.
    ///
    /// Late or unexpected messages are logged and dropped; they never fail the run.
    pub async fn handle_message(&mut self, message: ClientMessage) -> FxResult<()> {
        let (round, sender) = (message.round(), message.sender());
        if self.state.is_finished() {
            let current = self.round;
            self.drop_message(
                round,
                sender,
                FeedbackError::LateArrival {
                    round,
                    participant: sender,
                    current,
                },
            );
            return Ok(());
        }

        match message {
            ClientMessage::Train { update, .. } => {
                if let Err(err) = self.updater.check_feedback(&self.policy, &update.feedback()) {
                    let malformed = FeedbackError::Malformed {
                        round,
                        participant: sender,
                        reason: err.to_string(),
                    };
                    self.drop_message(round, sender, malformed);
                    return Ok(());
                }
                match self.train_buffer.insert(round, sender, update) {
                    Ok(outcome) => {
                        self.buffered(round, sender, outcome);
                        if let BufferOutcome::QuorumReached { .. } = outcome {
                            self.complete_training_round(round).await?;
                        }
                    }
                    Err(err) => self.drop_message(round, sender, err),
                }
            }
            ClientMessage::Eval { report, .. } => {
                match self.eval_buffer.insert(round, sender, report) {
                    Ok(outcome) => {
                        self.buffered(round, sender, outcome);
                        if let BufferOutcome::QuorumReached { .. } = outcome {
                            self.complete_evaluation(round).await?;
                        }
                    }
                    Err(err) => self.drop_message(round, sender, err),
                }
            }
        }
        Ok(())
    }

    /// Abort the run: push the round past the budget and finish.
    pub async fn force_stop(&mut self) -> FxResult<()> {
        if self.state.is_finished() {
            return Ok(());
        }
        warn!(round = self.round, state = %self.state, "force stopping run");
        self.round = self.round.max(self.config.total_round_budget + 1);
        self.finish().await
    }

    async fn begin_round(&mut self) -> FxResult<()> {
        let round = self.round;
        self.set_state(CoordinatorState::Sampling(round));
        let receivers = self.select_receivers()?;
        self.train_buffer.open(round, receivers.clone());

        let mut dispatches = Vec::with_capacity(receivers.len());
        for &participant in &receivers {
            let sample = self.policy.sample(&mut self.rng)?;
            let hyperparams = self.action_space.merge(&sample.configs);
            debug!(round, participant, arms = ?sample.arms, "sampled arms");
            dispatches.push((
                participant,
                Dispatch::Train {
                    round,
                    model: self.model.clone(),
                    arms: sample.arms,
                    hyperparams,
                },
            ));
        }

        self.set_state(CoordinatorState::AwaitingFeedback(round));
        info!(round, receivers = receivers.len(), "started training round");
        self.emit(CoordinatorEvent::RoundStarted {
            round,
            receivers: receivers.iter().copied().collect(),
        });
        for (participant, dispatch) in dispatches {
            self.transport.dispatch(participant, dispatch).await?;
        }
        Ok(())
    }

    fn select_receivers(&mut self) -> FxResult<BTreeSet<ParticipantId>> {
        let participants = self.transport.participants();
        let requested = self.config.sample_client_num;
        if participants.is_empty() || requested > participants.len() {
            return Err(FxError::InsufficientParticipants {
                requested: requested.max(1),
                available: participants.len(),
            });
        }
        if requested == 0 {
            return Ok(participants.into_iter().collect());
        }
        Ok(
            rand::seq::index::sample(&mut self.rng, participants.len(), requested)
                .into_iter()
                .map(|i| participants[i])
                .collect(),
        )
    }

    async fn complete_training_round(&mut self, round: u64) -> FxResult<()> {
        let results = self.train_buffer.take(round);
        let mut updates = Vec::with_capacity(results.len());
        let mut feedback = Vec::with_capacity(results.len());
        for update in results.into_values() {
            feedback.push(update.feedback());
            updates.push((update.sample_size, update.model));
        }
        self.updater.validate(&self.policy, &feedback)?;

        self.set_state(CoordinatorState::Aggregating(round));
        let model = self.aggregator.aggregate(&updates, &self.model)?;
        self.emit(CoordinatorEvent::Aggregated {
            round,
            participants: updates.len(),
        });

        self.set_state(CoordinatorState::PolicyUpdating(round));
        let report = self.updater.update(&mut self.policy, &feedback)?;
        self.model = model;
        self.rounds_completed += 1;
        if report.stopped_exploration {
            self.emit(CoordinatorEvent::ExplorationStopped {
                round,
                entropy: report.entropy,
            });
        }
        self.emit(CoordinatorEvent::PolicyUpdated { round, report });

        self.advance().await
    }

    async fn advance(&mut self) -> FxResult<()> {
        self.round += 1;
        let budget = self.config.total_round_budget;
        if self.round >= budget || self.round % self.config.eval_frequency == 0 {
            self.begin_evaluation().await
        } else {
            self.begin_round().await
        }
    }

    async fn begin_evaluation(&mut self) -> FxResult<()> {
        let round = self.round;
        self.set_state(CoordinatorState::Evaluating(round));
        let participants = self.transport.participants();
        if participants.is_empty() {
            warn!(round, "no participants to evaluate with, skipping evaluation");
            return self.after_evaluation().await;
        }

        self.eval_buffer
            .open(round, participants.iter().copied().collect());
        info!(round, participants = participants.len(), "started evaluation");
        self.emit(CoordinatorEvent::EvaluationStarted {
            round,
            participants: participants.len(),
        });
        for participant in participants {
            let dispatch = Dispatch::Evaluate {
                round,
                model: self.model.clone(),
            };
            self.transport.dispatch(participant, dispatch).await?;
        }
        Ok(())
    }

    async fn complete_evaluation(&mut self, round: u64) -> FxResult<()> {
        let reports = self.eval_buffer.take(round);
        let summary = EvalSummary::merge(round, &reports);
        info!(
            round,
            participants = summary.participants,
            metrics = ?summary.weighted_avg,
            "merged evaluation"
        );

        match summary.tracked_value(&self.config.tracked_metric) {
            Some(metric) => {
                if self.stopper.track_and_check(metric) {
                    info!(round, metric, "early stopping triggered");
                    self.early_stopped = true;
                    self.round = self.round.max(self.config.total_round_budget + 1);
                    self.emit(CoordinatorEvent::EarlyStopped { round, metric });
                }
            }
            None => warn!(
                round,
                metric = %self.config.tracked_metric,
                "tracked metric missing from evaluation"
            ),
        }

        self.emit(CoordinatorEvent::EvaluationMerged {
            summary: summary.clone(),
        });
        self.evaluations.push(summary);
        self.after_evaluation().await
    }

    async fn after_evaluation(&mut self) -> FxResult<()> {
        if self.round >= self.config.total_round_budget {
            self.finish().await
        } else {
            self.begin_round().await
        }
    }

    async fn finish(&mut self) -> FxResult<()> {
        self.train_buffer.seal();
        self.eval_buffer.seal();
        self.set_state(CoordinatorState::Finished);

        if let Some(sink) = self.sink.as_mut() {
            sink.persist(&self.policy.snapshot())?;
        }

        for participant in self.transport.participants() {
            let dispatch = Dispatch::Finish {
                round: self.round,
                model: self.model.clone(),
            };
            if let Err(err) = self.transport.dispatch(participant, dispatch).await {
                warn!(participant, error = %err, "failed to deliver finish message");
            }
        }

        let finished_at = Utc::now();
        let summary = RunSummary {
            run_id: self.run_id,
            started_at: self.started_at.unwrap_or(finished_at),
            finished_at,
            rounds_completed: self.rounds_completed,
            early_stopped: self.early_stopped,
            final_entropy: self.policy.entropy(),
            final_mle: self.policy.mle(),
            best_arms: self.policy.aspects().iter().map(SearchAspect::argmax).collect(),
            last_evaluation: self.evaluations.last().cloned(),
        };
        info!(
            run_id = %summary.run_id,
            rounds = summary.rounds_completed,
            early_stopped = summary.early_stopped,
            entropy = summary.final_entropy,
            mle = summary.final_mle,
            "run finished"
        );
        self.emit(CoordinatorEvent::Finished {
            summary: summary.clone(),
        });
        self.summary = Some(summary);
        Ok(())
    }

    fn buffered(&self, round: u64, participant: ParticipantId, outcome: BufferOutcome) {
        let (received, required) = match outcome {
            BufferOutcome::Pending { received, required } => (received, required),
            BufferOutcome::QuorumReached { received } => (received, received),
        };
        debug!(round, participant, received, required, "buffered result");
        self.emit(CoordinatorEvent::FeedbackBuffered {
            round,
            participant,
            received,
            required,
        });
    }

    fn drop_message(&self, round: u64, participant: ParticipantId, err: FeedbackError) {
        let reason = match err {
            FeedbackError::LateArrival { .. } => DropReason::Late,
            _ => DropReason::Unexpected,
        };
        warn!(round, participant, state = %self.state, error = %err, "dropping message");
        self.emit(CoordinatorEvent::MessageDropped {
            round,
            participant,
            reason,
        });
    }

    fn set_state(&mut self, to: CoordinatorState) {
        let from = self.state;
        self.state = to;
        debug!(%from, %to, "state transition");
        self.emit(CoordinatorEvent::StateChanged { from, to });
    }

    fn emit(&self, event: CoordinatorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::WeightedAverageAggregator;
    use crate::sink::POLICY_FILE;
    use crate::stopper::{NeverStop, ObjectiveDirection, PatienceStopper};
    use crate::transport::ChannelTransport;
    use fx_types::ParameterValue;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc::UnboundedReceiver;

    type Inboxes = Vec<(ParticipantId, UnboundedReceiver<Dispatch>)>;

    fn search_space() -> SearchSpace {
        SearchSpace::new()
            .add_fixed("epochs", 1i64)
            .add_choice("lr", vec![json!(0.1), json!(0.01), json!(0.001)])
    }

    fn base_config() -> FedExConfig {
        FedExConfig::default()
            .with_seed(7)
            .with_rounds(5, 100)
    }

    fn setup<E: EarlyStopper>(
        config: FedExConfig,
        clients: u32,
        stopper: E,
    ) -> (RoundCoordinator<ChannelTransport, WeightedAverageAggregator, E>, Inboxes) {
        let transport = ChannelTransport::new();
        let inboxes = (1..=clients).map(|id| (id, transport.register(id))).collect();
        let coordinator = RoundCoordinator::new(
            config,
            &search_space(),
            ModelParams::new().with_tensor("w", vec![0.0, 0.0]),
            transport,
            WeightedAverageAggregator,
            stopper,
        )
        .unwrap();
        (coordinator, inboxes)
    }

    fn train_reply(dispatch: Dispatch, sender: ParticipantId, loss_after: f64) -> ClientMessage {
        match dispatch {
            Dispatch::Train { round, arms, .. } => ClientMessage::Train {
                round,
                sender,
                update: ClientUpdate {
                    sample_size: 10.0,
                    model: ModelParams::new().with_tensor("w", vec![sender as f64, 1.0]),
                    arms,
                    loss_before: 1.0,
                    loss_after,
                },
            },
            other => panic!("expected a training dispatch, got {}", other.kind()),
        }
    }

    fn eval_reply(round: u64, sender: ParticipantId, loss: f64) -> ClientMessage {
        ClientMessage::Eval {
            round,
            sender,
            report: EvalReport {
                sample_size: 10.0,
                metrics: BTreeMap::from([("test_loss".to_string(), loss)]),
            },
        }
    }

    fn pending(inboxes: &mut Inboxes) -> Vec<(ParticipantId, Dispatch)> {
        let mut out = Vec::new();
        for (id, rx) in inboxes.iter_mut() {
            while let Ok(dispatch) = rx.try_recv() {
                out.push((*id, dispatch));
            }
        }
        out
    }

    /// Answer every dispatch until the run finishes; returns Finish messages seen.
    async fn drive<E: EarlyStopper>(
        coordinator: &mut RoundCoordinator<ChannelTransport, WeightedAverageAggregator, E>,
        inboxes: &mut Inboxes,
        eval_loss: f64,
    ) -> usize {
        let mut finishes = 0;
        for _ in 0..1000 {
            let batch = pending(inboxes);
            if batch.is_empty() && coordinator.state().is_finished() {
                break;
            }
            for (id, dispatch) in batch {
                let reply = match dispatch {
                    Dispatch::Train { .. } => train_reply(dispatch, id, 0.5),
                    Dispatch::Evaluate { round, .. } => eval_reply(round, id, eval_loss),
                    Dispatch::Finish { .. } => {
                        finishes += 1;
                        continue;
                    }
                };
                coordinator.handle_message(reply).await.unwrap();
            }
        }
        finishes
    }

    #[tokio::test]
    async fn quorum_gates_round_advance() {
        let (mut coordinator, mut inboxes) = setup(base_config(), 3, NeverStop);
        coordinator.start().await.unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::AwaitingFeedback(0));

        let mut batch = pending(&mut inboxes);
        assert_eq!(batch.len(), 3);
        let (last_id, last) = batch.pop().unwrap();
        for (id, dispatch) in batch {
            coordinator.handle_message(train_reply(dispatch, id, 0.5)).await.unwrap();
            assert_eq!(coordinator.state(), CoordinatorState::AwaitingFeedback(0));
        }
        assert_eq!(coordinator.rounds_completed(), 0);

        coordinator.handle_message(train_reply(last, last_id, 0.5)).await.unwrap();
        assert_eq!(coordinator.rounds_completed(), 1);
        assert_eq!(coordinator.state(), CoordinatorState::AwaitingFeedback(1));
        assert_eq!(pending(&mut inboxes).len(), 3);
    }

    #[tokio::test]
    async fn dispatch_carries_fixed_and_sampled_values() {
        let (mut coordinator, mut inboxes) = setup(base_config(), 2, NeverStop);
        coordinator.start().await.unwrap();
        for (_, dispatch) in pending(&mut inboxes) {
            let Dispatch::Train { round, arms, hyperparams, model } = dispatch else {
                panic!("expected a training dispatch");
            };
            assert_eq!(round, 0);
            assert_eq!(model.get("w"), Some(&[0.0, 0.0][..]));
            assert_eq!(arms.len(), 1);
            assert_eq!(hyperparams.get("epochs"), Some(&ParameterValue::Int(1)));
            assert_eq!(
                hyperparams,
                coordinator
                    .action_space()
                    .merge(&[coordinator.action_space().aspects()[0][arms[0]].clone()])
            );
        }
    }

    #[tokio::test]
    async fn grid_dispatch_sends_one_merged_configuration() {
        let transport = ChannelTransport::new();
        let mut inbox = transport.register(1);
        let space = search_space().add_choice("momentum", vec![json!(0.0), json!(0.9)]);
        let mut coordinator = RoundCoordinator::new(
            base_config().with_flatten(false),
            &space,
            ModelParams::new(),
            transport,
            WeightedAverageAggregator,
            NeverStop,
        )
        .unwrap();
        coordinator.start().await.unwrap();

        let Ok(Dispatch::Train { arms, hyperparams, .. }) = inbox.try_recv() else {
            panic!("expected a training dispatch");
        };
        assert_eq!(arms.len(), 2);
        assert_eq!(
            hyperparams.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["epochs", "lr", "momentum"]
        );
        let aspects = coordinator.action_space().aspects();
        let sampled = [aspects[0][arms[0]].clone(), aspects[1][arms[1]].clone()];
        assert_eq!(hyperparams, coordinator.action_space().merge(&sampled));
    }

    #[tokio::test]
    async fn malformed_results_are_dropped_before_quorum() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (coordinator, mut inboxes) = setup(base_config(), 2, NeverStop);
        let mut coordinator = coordinator.with_events(tx);
        coordinator.start().await.unwrap();
        let batch = pending(&mut inboxes);
        let (first_id, first) = batch[0].clone();
        let (second_id, second) = batch[1].clone();

        coordinator.handle_message(train_reply(first, first_id, 0.5)).await.unwrap();
        let ClientMessage::Train {
            round,
            sender,
            mut update,
        } = train_reply(second, second_id, 0.5)
        else {
            unreachable!()
        };
        let bad_updates = [
            ClientUpdate { arms: vec![99], ..update.clone() },
            ClientUpdate { arms: vec![0, 0], ..update.clone() },
            ClientUpdate { sample_size: 0.0, ..update.clone() },
            ClientUpdate { loss_after: f64::NAN, ..update.clone() },
        ];
        for bad in bad_updates {
            coordinator
                .handle_message(ClientMessage::Train { round, sender, update: bad })
                .await
                .unwrap();
            assert_eq!(coordinator.state(), CoordinatorState::AwaitingFeedback(0));
            assert_eq!(coordinator.model().get("w"), Some(&[0.0, 0.0][..]));
        }
        let dropped = rx
            .try_iter()
            .filter(|e| {
                matches!(
                    e,
                    CoordinatorEvent::MessageDropped {
                        reason: DropReason::Unexpected,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(dropped, 4);

        update.loss_after = 0.25;
        coordinator
            .handle_message(ClientMessage::Train { round, sender, update })
            .await
            .unwrap();
        assert_eq!(coordinator.rounds_completed(), 1);
        assert_eq!(coordinator.state(), CoordinatorState::AwaitingFeedback(1));
        assert_eq!(coordinator.model().get("w"), Some(&[1.5, 1.0][..]));
    }

    #[tokio::test]
    async fn unsupported_schedule_fails_before_the_model_changes() {
        let config = base_config().with_schedule("cosine");
        let (mut coordinator, mut inboxes) = setup(config, 1, NeverStop);
        coordinator.start().await.unwrap();
        let (id, dispatch) = pending(&mut inboxes).remove(0);

        let err = coordinator
            .handle_message(train_reply(dispatch, id, 0.5))
            .await
            .unwrap_err();
        assert!(matches!(err, FxError::UnsupportedSchedule(_)));
        assert_eq!(coordinator.model().get("w"), Some(&[0.0, 0.0][..]));
        assert_eq!(coordinator.updater().trace().rounds(), 0);
    }

    #[tokio::test]
    async fn aggregates_models_by_sample_size() {
        let (mut coordinator, mut inboxes) = setup(base_config(), 2, NeverStop);
        coordinator.start().await.unwrap();
        for (id, dispatch) in pending(&mut inboxes) {
            coordinator.handle_message(train_reply(dispatch, id, 0.5)).await.unwrap();
        }
        assert_eq!(coordinator.model().get("w"), Some(&[1.5, 1.0][..]));
    }

    #[tokio::test]
    async fn duplicate_results_replace_earlier_ones() {
        let (mut coordinator, mut inboxes) = setup(base_config(), 2, NeverStop);
        coordinator.start().await.unwrap();
        let batch = pending(&mut inboxes);
        let (first_id, first) = batch[0].clone();
        let (second_id, second) = batch[1].clone();

        coordinator.handle_message(train_reply(first.clone(), first_id, 0.9)).await.unwrap();
        coordinator.handle_message(train_reply(first, first_id, 0.1)).await.unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::AwaitingFeedback(0));

        coordinator.handle_message(train_reply(second, second_id, 0.1)).await.unwrap();
        assert_eq!(coordinator.rounds_completed(), 1);
        let trace = coordinator.updater().trace();
        assert_eq!(trace.last(fx_policy::TraceKey::Refine), Some(0.1));
    }

    #[tokio::test]
    async fn late_and_unexpected_messages_are_dropped() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let config = base_config().with_sample_client_num(1);
        let (coordinator, mut inboxes) = setup(config, 3, NeverStop);
        let mut coordinator = coordinator.with_events(tx);
        coordinator.start().await.unwrap();

        let batch = pending(&mut inboxes);
        assert_eq!(batch.len(), 1);
        let (receiver, dispatch) = batch[0].clone();
        let outsider = (1..=3).find(|id| *id != receiver).unwrap();

        coordinator
            .handle_message(train_reply(dispatch.clone(), outsider, 0.5))
            .await
            .unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::AwaitingFeedback(0));

        coordinator.handle_message(train_reply(dispatch.clone(), receiver, 0.5)).await.unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::AwaitingFeedback(1));

        coordinator.handle_message(train_reply(dispatch, receiver, 0.5)).await.unwrap();
        coordinator.handle_message(eval_reply(1, receiver, 0.5)).await.unwrap();
        assert_eq!(coordinator.rounds_completed(), 1);

        let reasons: Vec<_> = rx
            .try_iter()
            .filter_map(|event| match event {
                CoordinatorEvent::MessageDropped { reason, .. } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(
            reasons,
            vec![DropReason::Unexpected, DropReason::Late, DropReason::Unexpected]
        );
    }

    #[tokio::test]
    async fn full_run_evaluates_and_persists_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let config = base_config().with_rounds(4, 2).with_outdir(dir.path());
        let (coordinator, mut inboxes) = setup(config, 2, NeverStop);
        let mut coordinator = coordinator.with_events(tx);

        coordinator.start().await.unwrap();
        let finishes = drive(&mut coordinator, &mut inboxes, 0.25).await;

        assert!(coordinator.state().is_finished());
        assert_eq!(finishes, 2);
        assert_eq!(coordinator.rounds_completed(), 4);
        let rounds: Vec<u64> = coordinator.evaluations().iter().map(|e| e.round).collect();
        assert_eq!(rounds, vec![2, 4]);
        assert_eq!(coordinator.updater().trace().rounds(), 4);

        let summary = coordinator.summary().unwrap();
        assert!(!summary.early_stopped);
        assert_eq!(summary.best_arms.len(), 1);
        assert_eq!(summary.last_evaluation.as_ref().map(|e| e.round), Some(4));

        let saved = JsonFileSink::load(dir.path().join(POLICY_FILE)).unwrap();
        assert_eq!(saved.log_probs.len(), 1);
        assert_eq!(saved.log_probs[0].len(), coordinator.action_space().sizes()[0]);

        let events: Vec<_> = rx.try_iter().collect();
        let started = events
            .iter()
            .filter(|e| matches!(e, CoordinatorEvent::RoundStarted { .. }))
            .count();
        assert_eq!(started, 4);
        assert!(matches!(events.last(), Some(CoordinatorEvent::Finished { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            CoordinatorEvent::StateChanged {
                to: CoordinatorState::Evaluating(2),
                ..
            }
        )));

        let late = eval_reply(4, 1, 0.25);
        coordinator.handle_message(late).await.unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            CoordinatorEvent::MessageDropped {
                reason: DropReason::Late,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn evaluation_waits_for_every_participant() {
        let config = base_config().with_rounds(3, 1);
        let (mut coordinator, mut inboxes) = setup(config, 2, NeverStop);
        coordinator.start().await.unwrap();
        for (id, dispatch) in pending(&mut inboxes) {
            coordinator.handle_message(train_reply(dispatch, id, 0.5)).await.unwrap();
        }
        assert_eq!(coordinator.state(), CoordinatorState::Evaluating(1));
        assert_eq!(pending(&mut inboxes).len(), 2);

        coordinator.handle_message(eval_reply(1, 1, 0.5)).await.unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Evaluating(1));
        coordinator.handle_message(eval_reply(1, 2, 0.7)).await.unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::AwaitingFeedback(1));
        assert!((coordinator.evaluations()[0].tracked_value("test_loss").unwrap() - 0.6).abs() < 1e-12);
    }

    #[tokio::test]
    async fn early_stop_finishes_before_budget() {
        let config = base_config().with_rounds(10, 1);
        let stopper = PatienceStopper::new(1, 0.0, ObjectiveDirection::Minimize);
        let (mut coordinator, mut inboxes) = setup(config, 2, stopper);

        coordinator.start().await.unwrap();
        let finishes = drive(&mut coordinator, &mut inboxes, 1.0).await;

        assert_eq!(finishes, 2);
        assert_eq!(coordinator.rounds_completed(), 2);
        assert_eq!(coordinator.evaluations().len(), 2);
        assert!(coordinator.round() > coordinator.config().total_round_budget);
        assert!(coordinator.summary().unwrap().early_stopped);
    }

    #[tokio::test]
    async fn insufficient_participants_is_an_error() {
        let config = base_config().with_sample_client_num(5);
        let (mut coordinator, _inboxes) = setup(config, 2, NeverStop);
        assert!(matches!(
            coordinator.start().await,
            Err(FxError::InsufficientParticipants {
                requested: 5,
                available: 2
            })
        ));
    }

    #[tokio::test]
    async fn start_twice_is_a_state_error() {
        let (mut coordinator, _inboxes) = setup(base_config(), 1, NeverStop);
        coordinator.start().await.unwrap();
        assert!(matches!(coordinator.start().await, Err(FxError::State(_))));
    }

    #[tokio::test]
    async fn force_stop_finishes_and_notifies() {
        let (mut coordinator, mut inboxes) = setup(base_config(), 2, NeverStop);
        coordinator.start().await.unwrap();
        let batch = pending(&mut inboxes);

        coordinator.force_stop().await.unwrap();
        assert!(coordinator.state().is_finished());
        assert_eq!(coordinator.rounds_completed(), 0);
        let finishes = pending(&mut inboxes)
            .into_iter()
            .filter(|(_, d)| matches!(d, Dispatch::Finish { .. }))
            .count();
        assert_eq!(finishes, 2);

        for (id, dispatch) in batch {
            coordinator.handle_message(train_reply(dispatch, id, 0.5)).await.unwrap();
        }
        assert_eq!(coordinator.rounds_completed(), 0);
        coordinator.force_stop().await.unwrap();
    }

    #[tokio::test]
    async fn restore_policy_only_before_start() {
        let (mut coordinator, _inboxes) = setup(base_config(), 1, NeverStop);
        let size = coordinator.action_space().sizes()[0];
        let mut log_prob = vec![f64::NEG_INFINITY; size];
        log_prob[0] = 0.0;
        let snapshot = PolicySnapshot {
            log_probs: vec![log_prob],
            exploration_stopped: true,
        };

        coordinator.restore_policy(&snapshot).unwrap();
        assert!(coordinator.policy().exploration_stopped());
        assert_eq!(coordinator.policy().mle(), 1.0);
        assert_eq!(coordinator.policy().snapshot(), snapshot);

        coordinator.start().await.unwrap();
        assert!(matches!(
            coordinator.restore_policy(&snapshot),
            Err(FxError::State(_))
        ));
    }

    #[test]
    fn rejects_invalid_configuration() {
        let transport = ChannelTransport::new();
        let result = RoundCoordinator::new(
            FedExConfig::default().with_rounds(0, 1),
            &search_space(),
            ModelParams::new(),
            transport,
            WeightedAverageAggregator,
            NeverStop,
        );
        assert!(matches!(result, Err(FxError::Config(_))));
    }
}
