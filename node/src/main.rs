use std::{env, io, sync::Arc};

use comms::specs::{DType, EngineSpec};
use futures::future;
use log::{error, info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    signal,
};

use train_actor::{
    ActorConfig, OrchestratorBuilder, TrainingStepOrchestrator,
    checkpoint::FsCheckpointStore,
    collective::ProcessGroup,
    gateway::DirGateway,
    memory::{MODEL_TAG, tags},
    sync::{EngineHandle, EngineLock, LocalRolloutEngine, RemoteRolloutEngine, RolloutEngine, serve_engine},
    training::BigramPolicy,
};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_VOCAB: usize = 32;
const DEFAULT_ROLLOUTS: u64 = 1;

fn var_or<T: std::str::FromStr>(key: &str, default: T) -> io::Result<T> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| io::Error::other(format!("invalid {key}: {value}"))),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("engine") => run_engine().await,
        Some("trainer") => {
            let path = args
                .next()
                .ok_or_else(|| io::Error::other("usage: node trainer <config.json>"))?;
            run_trainer(&path).await
        }
        _ => Err(io::Error::other("usage: node <engine|trainer> [config.json]")),
    }
}

/// Serves a rollout engine to every trainer rank that connects.
async fn run_engine() -> io::Result<()> {
    let addr = format!(
        "{}:{}",
        env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
        env::var("PORT").map_err(io::Error::other)?,
    );

    let spec = EngineSpec {
        tp_rank: var_or("TP_RANK", 0)?,
        tp_size: var_or("TP_SIZE", EngineSpec::default().tp_size)?,
        dtype: match env::var("DTYPE").as_deref() {
            Ok("bf16") => DType::Bf16,
            _ => DType::F32,
        },
    };
    let engine = Arc::new(LocalRolloutEngine::new(var_or("ENGINE_ID", 0)?, spec));

    let list = TcpListener::bind(&addr).await?;
    info!("engine {} listening at {addr} with {spec:?}", engine.id());

    tokio::select! {
        ret = accept_trainers(list, Arc::clone(&engine)) => ret,
        _ = signal::ctrl_c() => {
            info!("received SIGTERM, serving weights version {}", engine.version().await);
            Ok(())
        }
    }
}

async fn accept_trainers(list: TcpListener, engine: Arc<LocalRolloutEngine>) -> io::Result<()> {
    loop {
        let (stream, peer) = list.accept().await?;
        info!("trainer connected from {peer}");

        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let (rx, tx) = stream.into_split();
            let (rx, tx) = comms::channel(rx, tx);
            if let Err(e) = serve_engine(&engine, rx, tx).await {
                warn!("lost trainer {peer}: {e}");
            }
        });
    }
}

/// Trains on the rollouts found under `ROLLOUT_DIR` with `DP_SIZE` ranks,
/// pushing weights to the engines listed in `ENGINES` after every step.
async fn run_trainer(config_path: &str) -> io::Result<()> {
    let config = ActorConfig::from_path(config_path)?;
    let rollout_dir = env::var("ROLLOUT_DIR").map_err(io::Error::other)?;
    let vocab = var_or("VOCAB", DEFAULT_VOCAB)?;
    let rollouts = var_or("ROLLOUTS", DEFAULT_ROLLOUTS)?;
    let dp_size = var_or("DP_SIZE", 1usize)?.max(1);

    let engines = connect_engines().await?;
    let lock = EngineLock::default();

    let ranks = rank_groups(&config, dp_size).into_iter().map(|group| {
        let engines = rank_engines(&engines, group.rank(), dp_size, config.colocate);
        run_rank(
            config.clone(),
            group,
            engines,
            Arc::clone(&lock),
            &rollout_dir,
            vocab,
            rollouts,
        )
    });

    tokio::select! {
        ret = future::try_join_all(ranks) => {
            ret?;
            info!("wrapping up, disconnecting...");
        }
        _ = signal::ctrl_c() => {
            info!("received SIGTERM");
        }
    }

    Ok(())
}

async fn connect_engines() -> io::Result<Vec<EngineHandle>> {
    let mut engines: Vec<EngineHandle> = Vec::new();
    if let Ok(addrs) = env::var("ENGINES") {
        for (id, addr) in addrs.split(',').filter(|a| !a.is_empty()).enumerate() {
            let stream = TcpStream::connect(addr).await?;
            let (rx, tx) = stream.into_split();
            let (rx, tx) = comms::channel(rx, tx);
            engines.push(Arc::new(RemoteRolloutEngine::connect(id, rx, tx).await?));
            info!("connected to engine {id} at {addr}");
        }
    }
    Ok(engines)
}

/// One process group per data-parallel rank, collectives give up after the configured timeout.
fn rank_groups(config: &ActorConfig, dp_size: usize) -> Vec<ProcessGroup> {
    ProcessGroup::new_group(dp_size, config.collective_timeout())
}

/// Colocated engines are split among the ranks, every rank sees all of them otherwise.
fn rank_engines(
    engines: &[EngineHandle],
    rank: usize,
    dp_size: usize,
    colocate: bool,
) -> Vec<EngineHandle> {
    engines
        .iter()
        .enumerate()
        .filter(|(i, _)| !colocate || i % dp_size == rank)
        .map(|(_, engine)| Arc::clone(engine))
        .collect()
}

async fn run_rank(
    config: ActorConfig,
    group: ProcessGroup,
    engines: Vec<EngineHandle>,
    lock: EngineLock,
    rollout_dir: &str,
    vocab: usize,
    rollouts: u64,
) -> io::Result<()> {
    let rank = group.rank();
    let (mut actor, start) = OrchestratorBuilder::new(
        config,
        Arc::new(BigramPolicy::new(vocab)),
        Arc::new(FsCheckpointStore),
    )
    .gateway(Arc::new(DirGateway::new(rollout_dir)))
    .group(group)
    .init()
    .await?;

    actor.connect_rollout_engines(engines, lock).await?;

    // engines start serving the loaded weights before the first rollout
    if let Some(version) = actor.update_weights().await? {
        info!("rank {rank}: engines serve initial weights version {version}");
    }

    train_loop(&mut actor, start, rollouts).await
}

async fn train_loop(
    actor: &mut TrainingStepOrchestrator,
    start: u64,
    rollouts: u64,
) -> io::Result<()> {
    let offload = actor.config().offload;
    let rank = actor.group().rank();

    for rollout_id in start..start + rollouts {
        let data_ref = format!("rollout_{rollout_id}.json");
        match actor.train(rollout_id, &data_ref.as_str().into()).await {
            Ok(report) => info!(
                "rank {rank} rollout {rollout_id}: {} samples, {} optimizer steps",
                report.samples, report.optimizer_steps
            ),
            Err(e) if e.is_fatal() => {
                error!("giving up: {e}");
                return Err(e.into());
            }
            Err(e) => {
                warn!("skipping rollout {rollout_id}: {e}");
                continue;
            }
        }

        if let Some(version) = actor.update_weights().await? {
            info!("rank {rank}: engines serve weights version {version}");
        }

        if offload {
            actor.offload(&tags([MODEL_TAG]))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use train_actor::ActorErr;

    use super::*;

    fn handles(n: usize) -> Vec<EngineHandle> {
        (0..n)
            .map(|id| Arc::new(LocalRolloutEngine::new(id, EngineSpec::default())) as EngineHandle)
            .collect()
    }

    fn ids(engines: &[EngineHandle]) -> Vec<usize> {
        engines.iter().map(|e| e.id()).collect()
    }

    #[test]
    fn colocated_engines_are_split_among_ranks() {
        let engines = handles(5);
        assert_eq!(ids(&rank_engines(&engines, 0, 2, true)), [0, 2, 4]);
        assert_eq!(ids(&rank_engines(&engines, 1, 2, true)), [1, 3]);
        assert_eq!(ids(&rank_engines(&engines, 1, 2, false)), [0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn rank_groups_time_out_as_configured() {
        let config = ActorConfig {
            collective_timeout_ms: 20,
            ..Default::default()
        };
        let mut groups = rank_groups(&config, 2);
        assert_eq!(groups.len(), 2);
        let lonely = groups.swap_remove(0);

        let started = Instant::now();
        let err = lonely.barrier("init").await.unwrap_err();
        assert!(matches!(err, ActorErr::CollectiveTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
