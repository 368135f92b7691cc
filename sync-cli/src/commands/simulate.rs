//! Run several engines against one in-memory backend.
//!
//! Every engine behaves like an application window: it subscribes to the
//! shared invalidation bus and pulls snapshots from the shared store. The
//! command commits a series of mutations, waits for every window to
//! converge and prints how much work each window did.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sync_client::{
    MemoryApplier, MemoryTransport, RevisionSync, SnapshotProvider, SyncErrorContext,
    SyncSettings, TransportError,
};
use sync_types::{Revision, SnapshotEnvelope, Topic};

const DEFAULT_TOPIC: &str = "simulation";
const CONVERGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Arguments of the simulate command.
#[derive(Debug, Clone)]
pub struct SimulateArgs {
    /// Number of engines.
    pub windows: usize,
    /// Number of committed mutations.
    pub mutations: u64,
    /// Optional settings file.
    pub config: Option<PathBuf>,
    /// Simulated fetch latency in milliseconds.
    pub delay_ms: u64,
}

/// What one window did during the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowReport {
    /// Window label.
    pub label: String,
    /// Snapshot fetches issued by this window.
    pub fetches: usize,
    /// Snapshots applied by this window.
    pub applies: usize,
    /// Errors reported by this window.
    pub errors: usize,
    /// Local revision at the end of the run.
    pub revision: Revision,
}

/// Outcome of a simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationReport {
    /// Revision of the last mutation.
    pub latest: Revision,
    /// One entry per window.
    pub windows: Vec<WindowReport>,
}

impl SimulationReport {
    /// True if every window ended on the latest revision.
    pub fn converged(&self) -> bool {
        self.windows.iter().all(|w| w.revision == self.latest)
    }
}

/// Provider wrapper counting the fetches of a single window.
struct CountingProvider {
    inner: MemoryTransport<u64>,
    fetches: Arc<AtomicUsize>,
}

#[async_trait]
impl SnapshotProvider<u64> for CountingProvider {
    async fn get_snapshot(&self) -> Result<SnapshotEnvelope<u64>, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.get_snapshot().await
    }
}

struct Window {
    label: String,
    sync: RevisionSync<u64>,
    applier: MemoryApplier<u64>,
    fetches: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
}

/// Run the simulate command.
pub async fn run(args: SimulateArgs) -> Result<()> {
    let report = simulate(&args).await?;

    println!(
        "{:<16} {:>8} {:>8} {:>8} {:>10}",
        "window", "fetches", "applies", "errors", "revision"
    );
    for w in &report.windows {
        println!(
            "{:<16} {:>8} {:>8} {:>8} {:>10}",
            w.label,
            w.fetches,
            w.applies,
            w.errors,
            w.revision.to_string()
        );
    }
    println!();
    println!(
        "{} mutations, latest revision {}",
        args.mutations, report.latest
    );

    if !report.converged() {
        bail!("windows did not converge on revision {}", report.latest);
    }
    println!("all {} windows converged", report.windows.len());
    Ok(())
}

/// Commit `args.mutations` changes and wait for every window to catch up.
pub async fn simulate(args: &SimulateArgs) -> Result<SimulationReport> {
    if args.windows == 0 {
        bail!("--windows must be at least 1");
    }

    let settings = match &args.config {
        Some(path) => SyncSettings::from_file(path)?,
        None => SyncSettings::new(Topic::new(DEFAULT_TOPIC)?),
    };
    let topic = settings.topic.clone();

    let transport = MemoryTransport::new(Revision::ZERO, 0u64);
    transport.set_fetch_delay(Duration::from_millis(args.delay_ms));

    let mut windows = Vec::with_capacity(args.windows);
    for i in 0..args.windows {
        let label = match &settings.label {
            Some(prefix) => format!("{}-{}", prefix, i),
            None => format!("window-{}", i),
        };
        let fetches = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let applier = MemoryApplier::new();

        let provider = CountingProvider {
            inner: transport.clone(),
            fetches: Arc::clone(&fetches),
        };
        let error_count = Arc::clone(&errors);
        let sync = settings
            .builder(transport.clone(), provider, applier.clone())
            .label(label.clone())
            .on_error(move |_: &SyncErrorContext<'_>| {
                error_count.fetch_add(1, Ordering::SeqCst);
            })
            .build()?;

        sync.start()
            .await
            .with_context(|| format!("starting {}", label))?;
        windows.push(Window {
            label,
            sync,
            applier,
            fetches,
            errors,
        });
    }
    tracing::info!(windows = args.windows, topic = %topic, "windows started");

    for mutation in 1..=args.mutations {
        transport.commit(&topic, mutation);
        tokio::task::yield_now().await;
    }
    let latest = transport.latest();
    tracing::info!(latest = %latest, "mutations committed");

    let converged = tokio::time::timeout(CONVERGE_TIMEOUT, async {
        while windows.iter().any(|w| w.sync.local_revision() < latest) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if converged.is_err() {
        tracing::warn!(latest = %latest, "timed out waiting for convergence");
    }

    let reports = windows
        .iter()
        .map(|w| {
            w.sync.stop();
            WindowReport {
                label: w.label.clone(),
                fetches: w.fetches.load(Ordering::SeqCst),
                applies: w.applier.applied_count(),
                errors: w.errors.load(Ordering::SeqCst),
                revision: w.sync.local_revision(),
            }
        })
        .collect();

    Ok(SimulationReport {
        latest,
        windows: reports,
    })
}
