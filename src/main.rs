use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use statekeep::checkpoint::{CheckpointHooks, NavigationMetadata, RestoreStatus, StateArea};
use statekeep::config::CoreConfig;
use statekeep::context::CoreContext;
use statekeep::navigation::{ActivatedUnit, PlatformHandle, UnitKindRegistry};
use statekeep::store::{self, CompressionHint, FsObjectStore, ObjectStore};

/// Root screen payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HomeView {
    visits: u32,
}

/// Detail screen payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DetailView {
    item: u32,
}

/// Persists how many navigation engines the host runs.
struct HostHooks {
    navigation_engines: usize,
}

#[async_trait]
impl CheckpointHooks<NavigationMetadata> for HostHooks {
    async fn save_auxiliary_data(
        &self,
        store: &dyn ObjectStore,
        area: &StateArea,
        metadata: &mut NavigationMetadata,
    ) -> bool {
        metadata.navigation_engines_pre_save = self.navigation_engines;
        let key = format!("{}/0", area.navigation());
        match store::save(store, &key, &self.navigation_engines, CompressionHint::Compact).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Failed to save navigation engines");
                false
            }
        }
    }

    fn link_unit(&self, unit: &Arc<ActivatedUnit>, depth: usize) -> bool {
        tracing::debug!(kind = unit.kind(), depth, "Linking restored unit");
        true
    }
}

async fn show_view(_platform: PlatformHandle, unit: Arc<ActivatedUnit>, animate: bool) -> bool {
    tracing::info!(kind = unit.kind(), depth = unit.depth(), animate, "Showing view");
    true
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false);

    match std::env::var("STATEKEEP_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "statekeep.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = CoreConfig::from_env()?;
    let data_dir = std::env::var("STATEKEEP_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"));

    eprintln!("statekeep host v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Data: {}", data_dir.display());
    eprintln!("   Press Ctrl+C to exit.\n");

    let mut registry = UnitKindRegistry::new();
    registry
        .register::<HomeView, _>(config.checkpoint.root_kind.clone(), show_view)
        .register::<DetailView, _>("detail", show_view);

    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(data_dir));
    let ctx = CoreContext::new(config, store, registry);
    let scheduler_engine = ctx.start_scheduler();

    let checkpointer = ctx.checkpointer::<NavigationMetadata, _>(HostHooks {
        navigation_engines: 1,
    });
    checkpointer.attach_engine(scheduler_engine);

    let platform: PlatformHandle = Arc::new(());
    let restored = match checkpointer.check_restore_status().await {
        RestoreStatus::AutomaticRestore => checkpointer.restore_state(&platform).await,
        RestoreStatus::PromptForRestore => {
            tracing::info!("Saved state is old, starting fresh");
            checkpointer.notify_invalid_state();
            false
        }
        RestoreStatus::NoStateSaved => {
            checkpointer.notify_invalid_state();
            false
        }
    };

    let stack = Arc::clone(ctx.stack());
    if !restored || stack.is_empty() {
        stack.clear();
        stack.push(Arc::new(ActivatedUnit::with_payload(
            ctx.config().checkpoint.root_kind.clone(),
            &HomeView::default(),
        )?));
    }
    tracing::info!(restored, depth = stack.depth(), "Navigation ready");

    let checkpoint_engine = ctx.start_engine("checkpoint", checkpointer.clone());
    tracing::debug!(engine = %checkpoint_engine.id(), "Checkpoint engine running");

    // Simulated navigation: open a detail view every few seconds, going back
    // to the root after three.
    let navigator = {
        let stack = Arc::clone(&stack);
        let scheduler = ctx.scheduler().clone();
        tokio::spawn(async move {
            let mut item = 0u32;
            loop {
                tokio::time::sleep(Duration::from_secs(4)).await;
                item += 1;
                if stack.depth() > 3 {
                    stack.reset_to_root(1);
                    continue;
                }
                match ActivatedUnit::with_payload("detail", &DetailView { item }) {
                    Ok(unit) => {
                        stack.push(Arc::new(unit));
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to build detail view"),
                }
                scheduler.enqueue("prefetch", Some("navigator".into()), move || async move {
                    tracing::info!(item, "Prefetched detail data");
                    Ok(())
                });
            }
        })
    };

    shutdown_signal().await;
    navigator.abort();
    ctx.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Unable to install Ctrl+C handler");
    }
}
