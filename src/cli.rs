use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::contract::{EventRecorder, ResourceClient};
use crate::controller::{Controller, ReconcileOutcome, RetryPolicy};
use crate::events::TracingRecorder;
use crate::hooks::{WebhookMetadataExtractor, WebhookMutator, WebhookValidator};
use crate::load_config::{load_asset, load_config};
use crate::loader::ArchiveLoader;
use crate::model::{AssetResource, AssetStatus, Phase, FINALIZER};
use crate::pipeline::ContentPipeline;
use crate::reconciler::AssetReconciler;
use crate::resource::MemoryResourceClient;
use crate::store::DirectoryStore;
use crate::webhook::{template_resolver, WebhookGateway};

/// CLI for asset-pipeline: publish declarative content assets into a bucket.
#[derive(Parser)]
#[clap(
    name = "asset-pipeline",
    version,
    about = "Pull, mutate, validate and publish content assets into a directory-backed object store"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reconcile an asset manifest until it settles and print its status
    Publish(Target),
    /// Remove an asset's published content from the store
    Unpublish(Target),
}

#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Path to the asset manifest (YAML)
    #[clap(long)]
    pub asset: PathBuf,
    /// Directory holding the buckets
    #[clap(long)]
    pub store_dir: PathBuf,
    /// Path to the YAML config file
    #[clap(long)]
    pub config: Option<PathBuf>,
    /// Upper bound on reconcile passes
    #[clap(long, default_value_t = 16)]
    pub max_rounds: usize,
}

/// Wire the production collaborators into a [`Controller`].
pub fn build_controller(
    config: &Config,
    client: Arc<dyn ResourceClient>,
    store: Arc<DirectoryStore>,
) -> Result<Controller> {
    let gateway = WebhookGateway::new(template_resolver(config.webhook.url_template.clone()))?;
    let recorder: Arc<dyn EventRecorder> = Arc::new(TracingRecorder);
    let loader = ArchiveLoader::new(&config.temporary_directory, config.download_timeout())?;

    let pipeline = ContentPipeline::new(
        Arc::new(loader),
        Arc::new(WebhookMutator::new(gateway.clone(), config.webhook.mutation())),
        Arc::new(WebhookValidator::new(gateway.clone(), config.webhook.validation())),
        Arc::new(WebhookMetadataExtractor::new(gateway, config.webhook.metadata())),
        store.clone(),
        recorder.clone(),
    );
    let reconciler = AssetReconciler::new(
        store.clone(),
        store,
        pipeline,
        recorder,
        config.relist_interval(),
    );
    Ok(Controller::new(
        client,
        reconciler,
        RetryPolicy {
            max_attempts: config.status_update.max_attempts,
            backoff: Duration::from_millis(config.status_update.backoff_ms),
        },
    ))
}

struct Session {
    client: Arc<MemoryResourceClient>,
    controller: Controller,
    asset: AssetResource,
    max_rounds: usize,
}

impl Session {
    async fn open(target: &Target) -> Result<Self> {
        let config = load_config(target.config.as_deref())?;
        let mut asset = load_asset(&target.asset)?;
        asset.status = AssetStatus::default();

        let store = Arc::new(open_store(&target.store_dir, config.store.upload_workers)?);
        store
            .create_bucket(&asset.metadata.namespace, &asset.spec.bucket_ref.name)
            .await?;

        let client = Arc::new(MemoryResourceClient::new());
        let controller = build_controller(&config, client.clone(), store)?;
        Ok(Self {
            client,
            controller,
            asset,
            max_rounds: target.max_rounds,
        })
    }

    /// Reconcile until nothing changes any more.
    async fn settle(&self, cancel: &CancellationToken) -> Result<ReconcileOutcome> {
        let meta = &self.asset.metadata;
        for round in 1..=self.max_rounds {
            let outcome = self
                .controller
                .reconcile(cancel, &meta.namespace, &meta.name, Utc::now())
                .await?;
            info!(round, outcome = ?outcome, "Reconcile pass finished");
            if matches!(outcome, ReconcileOutcome::Unchanged | ReconcileOutcome::Gone) {
                return Ok(outcome);
            }
        }
        anyhow::bail!("asset did not settle within {} reconcile passes", self.max_rounds)
    }

    async fn current(&self) -> Result<Option<AssetResource>> {
        let meta = &self.asset.metadata;
        Ok(self.client.get(&meta.namespace, &meta.name).await?)
    }
}

fn open_store(dir: &Path, upload_workers: usize) -> Result<DirectoryStore> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create store directory {dir:?}"))?;
    let root = dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve store directory {dir:?}"))?;
    let base_url = format!("file://{}", root.display());
    Ok(DirectoryStore::new(root, base_url, upload_workers))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            signal.cancel();
        }
    });
    token
}

async fn publish(target: &Target, cancel: &CancellationToken) -> Result<()> {
    let session = Session::open(target).await?;
    session.client.apply(session.asset.clone()).await;
    session.settle(cancel).await?;
    let resource = session
        .current()
        .await?
        .context("asset disappeared while publishing")?;
    println!("{}", serde_yaml::to_string(&resource.status)?);
    if resource.status.is(Phase::Failed) {
        anyhow::bail!("asset failed: {}", resource.status.message);
    }
    Ok(())
}

async fn unpublish(target: &Target, cancel: &CancellationToken) -> Result<()> {
    let mut session = Session::open(target).await?;
    // Published content is guarded by the finalizer; start from that state.
    session.asset.metadata.finalizers = vec![FINALIZER.to_string()];
    session.client.apply(session.asset.clone()).await;
    let meta = &session.asset.metadata;
    session
        .client
        .request_deletion(&meta.namespace, &meta.name)
        .await?;
    session.settle(cancel).await?;
    println!("Unpublished {}", meta.prefix());
    Ok(())
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");
    let cancel = cancel_on_ctrl_c();

    let result = match &cli.command {
        Commands::Publish(target) => publish(target, &cancel).await,
        Commands::Unpublish(target) => unpublish(target, &cancel).await,
    };

    let exit_span = tracing::info_span!("exit");
    exit_span.in_scope(|| {
        tracing::info!(success = result.is_ok(), "CLI run finished");
    });
    result
}
