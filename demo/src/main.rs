use mbus_core::{BroadcastDirection, BusConfig, MessageBus, Topic};
use mbus_macros::listener;
use mbus_scope::{Scope, ScopeConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
#[error("file is read-only: {0}")]
struct ReadOnly(String);

#[listener]
trait FileEvents {
    fn saved(&self, path: String, bytes: usize) -> anyhow::Result<()>;
    fn deleted(&self, path: String);
}

#[listener]
trait BuildStatus {
    fn finished(&self, module: String, ok: bool);
}

/// 保存文件后在所属模块总线上发布构建结果
struct Rebuilder {
    module: String,
    bus: MessageBus,
    status: Topic<dyn BuildStatus>,
}

impl FileEvents for Rebuilder {
    fn saved(&self, path: String, bytes: usize) -> anyhow::Result<()> {
        if path.ends_with(".lock") {
            return Err(ReadOnly(path).into());
        }
        tracing::info!(module = %self.module, %path, bytes, "rebuilding");
        self.bus
            .publisher(&self.status)?
            .finished(self.module.clone(), true)?;
        Ok(())
    }

    fn deleted(&self, path: String) {
        tracing::info!(module = %self.module, %path, "file removed");
    }
}

#[derive(Default)]
struct StatusBar {
    finished: AtomicUsize,
}

impl BuildStatus for StatusBar {
    fn finished(&self, module: String, ok: bool) {
        self.finished.fetch_add(1, Ordering::Relaxed);
        tracing::info!(%module, ok, "build finished");
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let app = Scope::application(
        ScopeConfig::builder()
            .application("ide")
            .bus(BusConfig::builder().drain_warn_threshold(10_000).build())
            .build(),
    );
    let project = app.open_project("shop")?;

    let files: Topic<dyn FileEvents> = Topic::new("files");
    let status: Topic<dyn BuildStatus> =
        Topic::with_direction("build-status", BroadcastDirection::ToParent);
    app.bus().register_topic(&files)?;

    let status_bar = Arc::new(StatusBar::default());
    app.subscribe(&status, status_bar.clone() as Arc<dyn BuildStatus>)?;

    for name in ["web", "api"] {
        let module = project.open_module(name)?;
        let connection = module.connect()?;
        connection.subscribe_named(
            "files",
            Arc::new(Rebuilder {
                module: name.to_string(),
                bus: module.bus().clone(),
                status: status.clone(),
            }) as Arc<dyn FileEvents>,
        )?;
    }

    let publisher = app.publisher(&files)?;
    publisher.saved("src/main.rs".into(), 512)?;
    publisher.deleted("README.md".into())?;

    if let Err(err) = publisher.saved("Cargo.lock".into(), 64) {
        for failure in err.listener_failures() {
            tracing::warn!(%failure, "listener rejected the save");
        }
    }

    println!("{}", serde_json::to_string_pretty(&app.bus().snapshot())?);
    tracing::info!(
        builds = status_bar.finished.load(Ordering::Relaxed),
        "closing project"
    );

    project.dispose()?;
    app.dispose()?;
    Ok(())
}
