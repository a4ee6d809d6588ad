use std::time::Duration;

use comms::specs::EngineSpec;
use futures::future::join_all;
use log::{debug, warn};
use tokio::time;

use super::{EngineHandle, EngineId, WeightVersion, WireTensor};

/// Pushes `version` to every engine in two phases.
///
/// Every engine stages its buckets and acknowledges the version concurrently.
/// Only once all of them acknowledged are they told to commit, otherwise every
/// engine is told to abort and keeps serving its previous version.
///
/// # Arguments
/// * `engines` - The engines to push to.
/// * `version` - The version being pushed.
/// * `timeout` - How long a single engine may take for each phase.
/// * `make_buckets` - Builds the buckets each engine receives out of its layout.
///
/// # Returns
/// The ids of the engines that failed, if any.
pub(super) async fn push_all<F>(
    engines: &[EngineHandle],
    version: WeightVersion,
    timeout: Duration,
    make_buckets: F,
) -> Result<(), Vec<EngineId>>
where
    F: Fn(&EngineSpec) -> Vec<Vec<WireTensor>>,
{
    let staged = join_all(engines.iter().map(|engine| {
        let buckets = make_buckets(&engine.spec());

        async move {
            let id = engine.id();
            let prepare = async {
                for bucket in buckets {
                    engine.stage(version, bucket).await?;
                }
                engine.ready(version).await
            };

            match time::timeout(timeout, prepare).await {
                Ok(Ok(acked)) if acked == version => Ok(id),
                Ok(Ok(acked)) => {
                    warn!("engine {id} acknowledged version {acked} instead of {version}");
                    Err(id)
                }
                Ok(Err(e)) => {
                    warn!("engine {id} failed to stage version {version}: {e}");
                    Err(id)
                }
                Err(_) => {
                    warn!("engine {id} did not acknowledge version {version} in {timeout:?}");
                    Err(id)
                }
            }
        }
    }))
    .await;

    let failed: Vec<EngineId> = staged.into_iter().filter_map(Result::err).collect();
    if !failed.is_empty() {
        abort_all(engines, version, timeout).await;
        return Err(failed);
    }

    let committed = join_all(engines.iter().map(|engine| async move {
        match time::timeout(timeout, engine.commit(version)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("engine {} failed to commit version {version}: {e}", engine.id());
                Err(engine.id())
            }
            Err(_) => {
                warn!("engine {} did not commit version {version} in {timeout:?}", engine.id());
                Err(engine.id())
            }
        }
    }))
    .await;

    let failed: Vec<EngineId> = committed.into_iter().filter_map(Result::err).collect();
    if !failed.is_empty() {
        return Err(failed);
    }

    debug!("version {version} committed on {} engines", engines.len());
    Ok(())
}

async fn abort_all(engines: &[EngineHandle], version: WeightVersion, timeout: Duration) {
    join_all(engines.iter().map(|engine| async move {
        if let Ok(Err(e)) = time::timeout(timeout, engine.abort(version)).await {
            warn!("engine {} failed to abort version {version}: {e}", engine.id());
        }
    }))
    .await;
}
