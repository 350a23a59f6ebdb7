//! Simulated FedEx run: in-process clients whose training outcome depends on
//! the sampled learning rate.

use anyhow::{bail, Context};
use fx_coordinator::{
    ChannelTransport, NeverStop, ObjectiveDirection, PatienceStopper, RoundCoordinator,
    WeightedAverageAggregator,
};
use fx_policy::SearchSpace;
use fx_types::{ClientMessage, ClientUpdate, Dispatch, EvalReport, FedExConfig, HyperConfig, ModelParams, ParticipantId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const TARGET: f64 = 1.0;
const LOCAL_STEPS: usize = 5;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SimSetup {
    config: FedExConfig,
    search_space: Option<SearchSpace>,
    clients: u32,
    /// Patience of the early stopper; 0 runs to the full budget.
    patience: usize,
}

impl Default for SimSetup {
    fn default() -> Self {
        Self {
            config: FedExConfig::default().with_rounds(30, 5).with_seed(42),
            search_space: None,
            clients: 8,
            patience: 0,
        }
    }
}

fn default_search_space() -> SearchSpace {
    SearchSpace::new()
        .add_fixed("local_steps", LOCAL_STEPS as i64)
        .add_log_uniform("lr", 1e-3, 1.5)
}

fn loss(w: f64) -> f64 {
    (w - TARGET).powi(2)
}

fn learning_rate(hyperparams: &HyperConfig) -> f64 {
    hyperparams
        .get("lr")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.01)
}

async fn run_client(
    id: ParticipantId,
    mut inbox: UnboundedReceiver<Dispatch>,
    outbox: UnboundedSender<ClientMessage>,
) {
    let mut rng = StdRng::seed_from_u64(u64::from(id));
    let sample_size = rng.random_range(50..200) as f64;
    let offset = rng.random_range(-0.2..0.2);

    while let Some(dispatch) = inbox.recv().await {
        let message = match dispatch {
            Dispatch::Train {
                round,
                model,
                arms,
                hyperparams,
            } => {
                let lr = learning_rate(&hyperparams);
                let mut w = model.get("w").and_then(|t| t.first().copied()).unwrap_or(0.0);
                let loss_before = loss(w - offset);
                for _ in 0..LOCAL_STEPS {
                    let noise = rng.random_range(-0.01..0.01);
                    w -= lr * (2.0 * (w - offset - TARGET) + noise);
                }
                let loss_after = loss(w - offset).min(1e6);
                debug!(client = id, round, lr, loss_before, loss_after, "trained");
                ClientMessage::Train {
                    round,
                    sender: id,
                    update: ClientUpdate {
                        sample_size,
                        model: ModelParams::new().with_tensor("w", vec![w.clamp(-1e3, 1e3)]),
                        arms,
                        loss_before,
                        loss_after,
                    },
                }
            }
            Dispatch::Evaluate { round, model } => {
                let w = model.get("w").and_then(|t| t.first().copied()).unwrap_or(0.0);
                ClientMessage::Eval {
                    round,
                    sender: id,
                    report: EvalReport {
                        sample_size,
                        metrics: BTreeMap::from([("test_loss".to_string(), loss(w - offset))]),
                    },
                }
            }
            Dispatch::Finish { round, .. } => {
                debug!(client = id, round, "client finished");
                break;
            }
        };
        if outbox.send(message).is_err() {
            break;
        }
    }
}

async fn run<E: fx_coordinator::EarlyStopper>(setup: SimSetup, stopper: E) -> anyhow::Result<()> {
    let search_space = setup.search_space.unwrap_or_else(default_search_space);
    let transport = ChannelTransport::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    for id in 1..=setup.clients {
        let inbox = transport.register(id);
        tokio::spawn(run_client(id, inbox, tx.clone()));
    }
    drop(tx);

    let mut coordinator = RoundCoordinator::new(
        setup.config,
        &search_space,
        ModelParams::new().with_tensor("w", vec![0.0]),
        transport,
        WeightedAverageAggregator,
        stopper,
    )?;
    coordinator.start().await?;

    while !coordinator.state().is_finished() {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else {
                    bail!("all clients disconnected before the run finished");
                };
                coordinator.handle_message(message).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                coordinator.force_stop().await?;
            }
        }
    }

    let summary = coordinator
        .summary()
        .context("finished run has no summary")?;
    info!(rounds = summary.rounds_completed, "simulation complete");

    for (aspect, probs) in coordinator
        .policy()
        .aspects()
        .iter()
        .zip(coordinator.policy().probabilities())
    {
        for (candidate, p) in aspect.candidates().iter().zip(probs) {
            println!("{p:>8.4}  {}", serde_json::to_string(candidate)?);
        }
    }
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let setup = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?
        }
        None => SimSetup::default(),
    };
    setup.config.validate()?;
    if setup.clients == 0 {
        bail!("at least one client is required");
    }

    if setup.patience > 0 {
        let stopper = PatienceStopper::new(setup.patience, 1e-4, ObjectiveDirection::Minimize);
        run(setup, stopper).await
    } else {
        run(setup, NeverStop).await
    }
}
