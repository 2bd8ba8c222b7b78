//! The update executor: a single-writer queue over chute state.
//!
//! A dispatcher task fans submitted updates out to one worker task
//! per chute, so at most one operation is in flight per chute name
//! while different chutes proceed in parallel.  Every update resolves
//! its completion channel exactly once, and a failed operation always
//! leaves the stored state matching reality as closely as we can
//! manage, with a warning attached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::errors::ChuteError;
use crate::network::NetworkResourceManager;
use crate::runtime::ContainerRuntime;
use crate::store::ChuteStore;
use crate::types::{
    valid_name, Chute, ChuteState, Update, UpdateClass, UpdateType,
};

const SUBMIT_QUEUE_DEPTH: usize = 64;
const WORKER_QUEUE_DEPTH: usize = 32;

struct Ctx {
    store: Arc<ChuteStore>,
    runtime: Arc<dyn ContainerRuntime>,
    net: Arc<NetworkResourceManager>,
}

/// Cloneable handle used to submit updates and mint tokens.
#[derive(Clone)]
pub struct ExecutorHandle {
    tx: mpsc::Sender<Update>,
    token: Arc<AtomicU64>,
}

impl ExecutorHandle {
    /// Next value of the monotonically increasing ordering key.
    pub fn next_token(&self) -> u64 {
        self.token.fetch_add(1, Ordering::SeqCst)
    }

    /// Fire and forget; the result arrives on the update's completion
    /// channel.
    pub async fn submit(&self, update: Update) {
        if let Err(err) = self.tx.send(update).await {
            let mut update = err.0;
            update.complete(false, "update executor is not running");
        }
    }
}

/// Spawn the dispatcher and return a handle for submitters.
pub fn spawn(
    store: Arc<ChuteStore>,
    runtime: Arc<dyn ContainerRuntime>,
    net: Arc<NetworkResourceManager>,
) -> ExecutorHandle {
    let (tx, mut rx) = mpsc::channel::<Update>(SUBMIT_QUEUE_DEPTH);
    let ctx = Arc::new(Ctx { store, runtime, net });

    tokio::spawn(async move {
        let mut queues: HashMap<String, mpsc::Sender<Update>> = HashMap::new();
        while let Some(update) = rx.recv().await {
            let key = update.key();
            let worker_tx = match queues.get(&key) {
                Some(tx) if !tx.is_closed() => tx.clone(),
                _ => {
                    let (wtx, wrx) = mpsc::channel(WORKER_QUEUE_DEPTH);
                    tokio::spawn(worker(Arc::clone(&ctx), wrx));
                    queues.insert(key, wtx.clone());
                    wtx
                }
            };
            if let Err(err) = worker_tx.send(update).await {
                let mut update = err.0;
                update.complete(false, "worker queue is gone");
            }
        }
        info!("update executor shutting down");
    });

    ExecutorHandle {
        tx,
        token: Arc::new(AtomicU64::new(1)),
    }
}

async fn worker(ctx: Arc<Ctx>, mut rx: mpsc::Receiver<Update>) {
    let mut last_token = 0u64;
    while let Some(mut update) = rx.recv().await {
        if update.token < last_token {
            update.complete(
                false,
                format!("superseded by a newer update (token {})", last_token),
            );
            continue;
        }
        last_token = update.token;

        match apply(&ctx, &update).await {
            Ok(message) => update.complete(true, message),
            Err(err) => {
                let message = err.to_string();
                resolve_safe_state(&ctx, &update, &err).await;
                update.complete(false, message);
            }
        }
    }
}

async fn apply(ctx: &Ctx, update: &Update) -> Result<String, ChuteError> {
    match update.class {
        UpdateClass::Chute => apply_chute(ctx, update).await,
        UpdateClass::Router => Err(ChuteError::Unsupported(
            "router updates are applied by the host configuration layer".into(),
        )),
    }
}

async fn apply_chute(ctx: &Ctx, update: &Update) -> Result<String, ChuteError> {
    let name = &update.name;
    match update.update_type {
        UpdateType::Create => {
            if !valid_name(name) {
                return Err(ChuteError::InvalidSpec(format!("invalid chute name: {}", name)));
            }
            if ctx.store.get(name).await.is_some() {
                return Err(ChuteError::AlreadyExists(name.clone()));
            }
            let config = update.payload.clone().ok_or_else(|| {
                ChuteError::InvalidSpec("create requires a chute configuration".into())
            })?;
            let chute = Chute::new(name.clone(), config);
            ctx.store.put(&chute).await?;
            Ok(format!("chute {} created", name))
        }

        UpdateType::Start => {
            let mut chute = fetch(ctx, name).await?;
            if chute.state == ChuteState::Running {
                return Err(ChuteError::InvalidTransition {
                    op: "start",
                    name: name.clone(),
                    state: chute.state,
                });
            }
            let fresh = chute.state == ChuteState::Created;
            ctx.net.allocate(&mut chute).await?;
            // The lease must hit disk before the container exists, or
            // a crash in between would leak it.
            ctx.store.put(&chute).await?;
            if fresh {
                ctx.runtime
                    .build_and_start(&chute, progress_sink(update, name))
                    .await?;
            } else {
                ctx.runtime.restart(&chute).await?;
            }
            chute.state = ChuteState::Running;
            ctx.store.put(&chute).await?;
            Ok(format!("chute {} started", name))
        }

        UpdateType::Stop => {
            let mut chute = fetch(ctx, name).await?;
            if !matches!(chute.state, ChuteState::Running | ChuteState::Failed) {
                return Err(ChuteError::InvalidTransition {
                    op: "stop",
                    name: name.clone(),
                    state: chute.state,
                });
            }
            chute.state = ChuteState::Stopping;
            ctx.store.put(&chute).await?;
            ctx.runtime.stop(&chute).await?;
            ctx.net.reclaim(&mut chute).await;
            chute.state = ChuteState::Stopped;
            ctx.store.put(&chute).await?;
            Ok(format!("chute {} stopped", name))
        }

        UpdateType::Restart => {
            let mut chute = fetch(ctx, name).await?;
            let initial = chute.state;
            if matches!(initial, ChuteState::Running | ChuteState::Failed) {
                chute.state = ChuteState::Stopping;
                ctx.store.put(&chute).await?;
                ctx.runtime.stop(&chute).await?;
            }
            ctx.net.reclaim(&mut chute).await;
            ctx.net.allocate(&mut chute).await?;
            ctx.store.put(&chute).await?;
            if initial == ChuteState::Created {
                ctx.runtime
                    .build_and_start(&chute, progress_sink(update, name))
                    .await?;
            } else {
                ctx.runtime.restart(&chute).await?;
            }
            chute.state = ChuteState::Running;
            ctx.store.put(&chute).await?;
            Ok(format!("chute {} restarted", name))
        }

        UpdateType::Remove => {
            let mut chute = fetch(ctx, name).await?;
            ctx.runtime.remove(&chute).await?;
            ctx.net.reclaim(&mut chute).await;
            ctx.store.delete(name).await?;
            Ok(format!("chute {} removed", name))
        }

        UpdateType::SetHostConfig => {
            let mut chute = fetch(ctx, name).await?;
            let config = update.payload.clone().ok_or_else(|| {
                ChuteError::InvalidSpec("sethostconfig requires a chute configuration".into())
            })?;
            chute.config.host_config = config.host_config;

            // Host configuration is fixed at container creation, so a
            // live chute is rebuilt with the new options.
            let initial = chute.state;
            if matches!(initial, ChuteState::Running | ChuteState::Failed) {
                chute.state = ChuteState::Stopping;
                ctx.store.put(&chute).await?;
                ctx.runtime.stop(&chute).await?;
                ctx.runtime.remove(&chute).await?;
                ctx.net.reclaim(&mut chute).await;
                ctx.net.allocate(&mut chute).await?;
                ctx.store.put(&chute).await?;
                ctx.runtime
                    .build_and_start(&chute, progress_sink(update, name))
                    .await?;
                chute.state = ChuteState::Running;
                ctx.store.put(&chute).await?;
                Ok(format!("host configuration updated, chute {} restarted", name))
            } else {
                if initial == ChuteState::Stopped {
                    // Drop the stale container so the next start
                    // rebuilds with the new options.
                    ctx.runtime.remove(&chute).await?;
                    chute.state = ChuteState::Created;
                }
                ctx.store.put(&chute).await?;
                Ok(format!(
                    "host configuration updated, applied when chute {} starts",
                    name
                ))
            }
        }
    }
}

async fn fetch(ctx: &Ctx, name: &str) -> Result<Chute, ChuteError> {
    ctx.store
        .get(name)
        .await
        .ok_or_else(|| ChuteError::NotFound(name.to_string()))
}

/// The caller's progress sink, or a logging drain if none was given.
fn progress_sink(update: &Update, name: &str) -> mpsc::Sender<String> {
    if let Some(tx) = &update.progress {
        return tx.clone();
    }
    let (tx, mut rx) = mpsc::channel(32);
    let name = name.to_string();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            info!("build[{}]: {}", name, line);
        }
    });
    tx
}

/// Translate a failure into an accurately recorded chute state.
///
/// Build, runtime, and storage failures resolve to `stopped` with the
/// lease reclaimed.  A network bind failure resolves to `failed`: the
/// container is up without connectivity and the caller decides what
/// happens next.  Rejections (bad name, wrong state) touch nothing.
async fn resolve_safe_state(ctx: &Ctx, update: &Update, err: &ChuteError) {
    if update.class != UpdateClass::Chute || err.is_rejection() {
        return;
    }
    let Some(mut chute) = ctx.store.get(&update.name).await else {
        return;
    };

    match err {
        ChuteError::NetworkBindFailure(_) => {
            chute.state = ChuteState::Failed;
            chute
                .warnings
                .push(format!("chute started without network connectivity: {}", err));
        }
        _ => {
            ctx.net.reclaim(&mut chute).await;
            chute.state = ChuteState::Stopped;
            chute
                .warnings
                .push(format!("{} failed: {}", update.update_type, err));
        }
    }

    if let Err(e) = ctx.store.put(&chute).await {
        error!("failed to persist safe state for chute {}: {}", chute.name, e);
    } else {
        warn!(
            "chute {} resolved to state {} after failed {}",
            chute.name, chute.state, update.update_type
        );
    }
}
