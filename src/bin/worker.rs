//! Standalone worker: claims stage jobs and template-pipeline jobs, runs
//! them under per-stage timeouts, and re-evaluates the pipeline after each
//! completion. Stops claiming on SIGINT/SIGTERM and drains in-flight work.
//!
//! Configuration comes from the environment:
//! - `DATABASE_URL` (default `sqlite://siteline.db`)
//! - `RUST_LOG` for tracing filters

use std::sync::Arc;

use miette::IntoDiagnostic;

use siteline::ai::StubAiClient;
use siteline::collaborators::{MemoryObjectStore, StubRunner, ValidationRunner};
use siteline::events::{NotificationBus, TracingSink};
use siteline::queue::{WorkerContext, WorkerRuntime};
use siteline::store::PipelineStore;
use siteline::templates::jobs::default_handlers;

#[tokio::main]
async fn main() -> miette::Result<()> {
    dotenvy::dotenv().ok();
    siteline::telemetry::init("info,siteline=debug");

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://siteline.db".to_string());
    let store = PipelineStore::connect(&database_url).await.into_diagnostic()?;
    store.seed_default_policies().await.into_diagnostic()?;

    let runners: Vec<Arc<dyn ValidationRunner>> = vec![
        Arc::new(StubRunner::lighthouse_passing()),
        Arc::new(StubRunner::axe_clean()),
        Arc::new(StubRunner::content_passing()),
    ];
    let ctx = WorkerContext {
        store,
        bus: NotificationBus::with_sink(TracingSink),
        ai: Arc::new(StubAiClient),
        objects: Arc::new(MemoryObjectStore::default()),
        runners,
    };
    let handlers = default_handlers(&ctx);
    let runtime = WorkerRuntime::new(ctx, handlers);
    runtime.run().await.into_diagnostic()?;
    Ok(())
}
