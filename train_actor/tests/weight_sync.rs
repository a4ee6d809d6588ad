use std::{
    io,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use comms::specs::{DType, EngineSpec};
use parking_lot::Mutex;
use train_actor::{
    ActorErr,
    collective::ProcessGroup,
    params::{Location, ParameterSet, ParameterStore, Role, Schema, TensorDesc},
    sync::{
        DirectTransfer, DistributedBroadcast, EngineHandle, EngineId, EngineLock,
        LocalRolloutEngine, RolloutEngine, WeightSynchronizer, WeightVersion, WireTensor,
    },
};

const TIMEOUT: Duration = Duration::from_millis(200);

/// A local engine that can be told to never acknowledge, and logs every call.
struct FlakyEngine {
    inner: LocalRolloutEngine,
    mute: AtomicBool,
    events: Arc<Mutex<Vec<String>>>,
}

impl FlakyEngine {
    fn new(id: EngineId, spec: EngineSpec, events: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalRolloutEngine::new(id, spec),
            mute: AtomicBool::new(false),
            events,
        })
    }

    fn log(&self, event: &str, version: WeightVersion) {
        self.events
            .lock()
            .push(format!("{event} {version}@{}", self.inner.id()));
    }
}

#[async_trait]
impl RolloutEngine for FlakyEngine {
    fn id(&self) -> EngineId {
        self.inner.id()
    }

    fn spec(&self) -> EngineSpec {
        self.inner.spec()
    }

    async fn stage(&self, version: WeightVersion, bucket: Vec<WireTensor>) -> io::Result<()> {
        self.log("stage", version);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.inner.stage(version, bucket).await
    }

    async fn ready(&self, version: WeightVersion) -> io::Result<WeightVersion> {
        if self.mute.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.ready(version).await
    }

    async fn commit(&self, version: WeightVersion) -> io::Result<()> {
        self.log("commit", version);
        self.inner.commit(version).await
    }

    async fn abort(&self, version: WeightVersion) -> io::Result<()> {
        self.log("abort", version);
        self.inner.abort(version).await
    }
}

fn store(values: Vec<f32>) -> ParameterStore {
    let schema = Schema::new(vec![TensorDesc::new("w", vec![2, 2])]).unwrap();
    ParameterStore::new(ParameterSet::from_tensors(&schema, Location::Device, vec![values]).unwrap())
}

fn engines(n: usize, spec: EngineSpec) -> (Vec<Arc<FlakyEngine>>, Arc<Mutex<Vec<String>>>) {
    let events = Arc::default();
    let engines = (1..=n)
        .map(|id| FlakyEngine::new(id, spec, Arc::clone(&events)))
        .collect();
    (engines, events)
}

fn handles(engines: &[Arc<FlakyEngine>]) -> Vec<EngineHandle> {
    engines.iter().map(|e| Arc::clone(e) as EngineHandle).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_engine_fails_the_whole_push() {
    let (engines, events) = engines(3, EngineSpec::default());
    let sync = DirectTransfer::new(1 << 20, TIMEOUT);
    sync.connect_rollout_engines(handles(&engines), EngineLock::default())
        .unwrap();

    let store = store(vec![1., 2., 3., 4.]);
    assert_eq!(sync.update_weights(&store).await.unwrap(), 1);

    engines[1].mute.store(true, Ordering::SeqCst);
    events.lock().clear();

    let err = sync.update_weights(&store).await.unwrap_err();
    assert!(err.is_fatal());
    match err {
        ActorErr::PartialSync {
            version,
            unreachable,
        } => {
            assert_eq!(version, 2);
            assert_eq!(unreachable, vec![2]);
        }
        other => panic!("expected a partial sync, got {other:?}"),
    }

    for engine in &engines {
        assert_eq!(engine.inner.version().await, 1);
    }
    let acked = sync.acked_versions().await;
    assert!(acked.values().all(|&v| v == 1));
    assert!(!events.lock().iter().any(|e| e.starts_with("commit")));
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_pushes_never_overlap() {
    let (engines, events) = engines(2, EngineSpec::default());
    let sync = DirectTransfer::new(4, TIMEOUT);
    sync.connect_rollout_engines(handles(&engines), EngineLock::default())
        .unwrap();

    let store = store(vec![1., 2., 3., 4.]);
    let (a, b) = tokio::join!(sync.update_weights(&store), sync.update_weights(&store));
    let mut versions = vec![a.unwrap(), b.unwrap()];
    versions.sort();
    assert_eq!(versions, vec![1, 2]);

    let events = events.lock();
    let last_commit_1 = events.iter().rposition(|e| e.starts_with("commit 1")).unwrap();
    let first_stage_2 = events.iter().position(|e| e.starts_with("stage 2")).unwrap();
    assert!(last_commit_1 < first_stage_2, "{events:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnecting_requires_a_disconnect() {
    let sync = DirectTransfer::new(1 << 20, TIMEOUT);
    let (engines, _) = engines(1, EngineSpec::default());

    sync.connect_rollout_engines(handles(&engines), EngineLock::default())
        .unwrap();
    let err = sync
        .connect_rollout_engines(handles(&engines), EngineLock::default())
        .unwrap_err();
    assert!(matches!(err, ActorErr::AlreadyConnected { engines: 1 }));

    assert_eq!(sync.disconnect_rollout_engines().map(|e| e.len()), Some(1));
    assert!(
        sync.connect_rollout_engines(handles(&engines), EngineLock::default())
            .is_ok()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_transfer_reshards_for_each_engine() {
    let spec = |tp_rank| EngineSpec {
        tp_rank,
        tp_size: NonZeroUsize::new(2).unwrap(),
        dtype: DType::Bf16,
    };
    let events = Arc::default();
    let engines = vec![
        FlakyEngine::new(0, spec(0), Arc::clone(&events)),
        FlakyEngine::new(1, spec(1), Arc::clone(&events)),
    ];

    let sync = DirectTransfer::new(1 << 20, TIMEOUT);
    sync.connect_rollout_engines(handles(&engines), EngineLock::default())
        .unwrap();
    sync.update_weights(&store(vec![1., 2., 3., 4.])).await.unwrap();

    let first = engines[0].inner.weights().await;
    let second = engines[1].inner.weights().await;
    assert_eq!(first.values("w").unwrap().unwrap(), vec![1., 2.]);
    assert_eq!(second.values("w").unwrap().unwrap(), vec![3., 4.]);
    assert_eq!(first.tensors["w"].spec.dtype, DType::Bf16);
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_lock_holds_pushes_back() {
    let (engines, _) = engines(1, EngineSpec::default());
    let lock = EngineLock::default();
    let sync = DirectTransfer::new(1 << 20, TIMEOUT);
    sync.connect_rollout_engines(handles(&engines), Arc::clone(&lock))
        .unwrap();

    let serving = lock.lock().await;
    let store = store(vec![0.; 4]);
    let push = sync.update_weights(&store);
    tokio::pin!(push);

    assert!(
        tokio::time::timeout(Duration::from_millis(50), &mut push)
            .await
            .is_err()
    );
    drop(serving);
    assert_eq!(push.await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_pushes_from_the_root_only() {
    let (engines, events) = engines(2, EngineSpec::default());
    let mut group = ProcessGroup::new_group(2, Duration::from_secs(5));
    let second = DistributedBroadcast::new(group.pop().unwrap(), 1 << 20, TIMEOUT);
    let root = DistributedBroadcast::new(group.pop().unwrap(), 1 << 20, TIMEOUT);

    let lock = EngineLock::default();
    for sync in [&root, &second] {
        sync.connect_rollout_engines(handles(&engines), Arc::clone(&lock))
            .unwrap();
    }

    let store = store(vec![1., 2., 3., 4.]);
    let (a, b) = tokio::join!(root.update_weights(&store), second.update_weights(&store));
    assert_eq!((a.unwrap(), b.unwrap()), (1, 1));

    for engine in &engines {
        let weights = engine.inner.weights().await;
        assert_eq!(weights.values("w").unwrap().unwrap(), vec![1., 2., 3., 4.]);
    }
    let stages = events.lock().iter().filter(|e| e.starts_with("stage")).count();
    assert_eq!(stages, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_failure_reaches_every_rank() {
    let (engines, _) = engines(2, EngineSpec::default());
    engines[0].mute.store(true, Ordering::SeqCst);

    let mut group = ProcessGroup::new_group(2, Duration::from_secs(5));
    let second = DistributedBroadcast::new(group.pop().unwrap(), 1 << 20, TIMEOUT);
    let root = DistributedBroadcast::new(group.pop().unwrap(), 1 << 20, TIMEOUT);

    let lock = EngineLock::default();
    for sync in [&root, &second] {
        sync.connect_rollout_engines(handles(&engines), Arc::clone(&lock))
            .unwrap();
    }

    let store = store(vec![0.; 4]);
    let (a, b) = tokio::join!(root.update_weights(&store), second.update_weights(&store));
    assert!(matches!(a, Err(ActorErr::PartialSync { ref unreachable, .. }) if unreachable == &[1]));
    assert!(matches!(b, Err(ActorErr::PartialSync { ref unreachable, .. }) if unreachable == &[1]));
    assert_eq!(engines[1].inner.version().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn released_actor_is_pushed_from_its_host_snapshot() {
    let (engines, _) = engines(1, EngineSpec::default());
    let sync = DirectTransfer::new(1 << 20, TIMEOUT);
    sync.connect_rollout_engines(handles(&engines), EngineLock::default())
        .unwrap();

    let mut store = store(vec![5., 6., 7., 8.]);
    store.snapshot_to_host(Role::Actor).unwrap();
    store.release_device();

    assert_eq!(sync.update_weights(&store).await.unwrap(), 1);
    let weights = engines[0].inner.weights().await;
    assert_eq!(weights.values("w").unwrap().unwrap(), vec![5., 6., 7., 8.]);
    assert!(!store.is_resident());
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_without_actor_weights_names_every_engine() {
    let (engines, events) = engines(2, EngineSpec::default());
    let mut group = ProcessGroup::new_group(2, Duration::from_secs(5));
    let second = DistributedBroadcast::new(group.pop().unwrap(), 1 << 20, TIMEOUT);
    let root = DistributedBroadcast::new(group.pop().unwrap(), 1 << 20, TIMEOUT);

    let lock = EngineLock::default();
    for sync in [&root, &second] {
        sync.connect_rollout_engines(handles(&engines), Arc::clone(&lock))
            .unwrap();
    }

    // released without a snapshot, the root has nothing to send
    let mut empty = store(vec![0.; 4]);
    empty.release_device();
    let full = store(vec![0.; 4]);

    let (a, b) = tokio::join!(root.update_weights(&empty), second.update_weights(&full));
    assert!(matches!(a, Err(ActorErr::RoleNotFound { role: Role::Actor })));
    assert!(matches!(b, Err(ActorErr::PartialSync { ref unreachable, .. }) if unreachable == &[1, 2]));
    assert!(events.lock().is_empty());
}
