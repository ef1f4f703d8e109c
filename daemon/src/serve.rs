use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use meridian_rs::config::load_config;

use crate::hypervisor::LocalHypervisor;
use crate::manager::VmMgr;
use crate::pull::ImageMgr;
use crate::sandbox::UnixSandbox;
use crate::store::LocalBackend;

pub struct AppStateInner {
    mgr: Arc<VmMgr>,
}

impl AppStateInner {
    pub fn mgr(&self) -> &Arc<VmMgr> {
        &self.mgr
    }

    pub fn images(&self) -> &Arc<ImageMgr> {
        self.mgr.images()
    }
}

#[derive(Clone)]
pub struct AppState(Arc<AppStateInner>);

impl AppState {
    pub fn new(mgr: Arc<VmMgr>) -> Self {
        AppState(Arc::new(AppStateInner { mgr }))
    }
}

impl Deref for AppState {
    type Target = AppStateInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, clap::Args)]
pub struct ServeCommand {
    /// Path to the TOML configuration file
    #[arg(short = 'c', long = "config", env = "MERIDIAN_CONFIG")]
    config: Option<PathBuf>,
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    #[rustfmt::skip]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => event!(Level::INFO, "Received SIGINT"),
        _ = sigterm.recv() => event!(Level::INFO, "Received SIGTERM"),
    }
    token.cancel();
    Ok(())
}

pub async fn serve(serve_command: ServeCommand) -> Result<()> {
    let config = load_config(serve_command.config.as_deref()).context("load configuration")?;

    let backend = LocalBackend::open(&config.daemon)
        .await
        .context("open record store")?;
    let images = ImageMgr::new(
        backend.images.clone(),
        config.images.clone(),
        config.daemon.cache_dir(),
    );
    let hypervisor = Arc::new(LocalHypervisor::new(
        config.clone(),
        serve_command.config.clone(),
        images.clone(),
    ));
    let api_socket = config.daemon.api_socket();
    let sandbox = Arc::new(UnixSandbox::new(config.timeouts.sandbox_request));
    let mgr = VmMgr::new(
        config,
        backend.machines.clone(),
        images,
        hypervisor,
        sandbox,
    )
    .await?;

    let shutdown = CancellationToken::new();
    let background = mgr.spawn_background(shutdown.clone());

    match tokio::fs::remove_file(&api_socket).await {
        Ok(()) => event!(Level::INFO, ?api_socket, "Removed stale API socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
        Err(e) => return Err(e).context("remove stale API socket"),
    }
    let listener = UnixListener::bind(&api_socket)
        .with_context(|| format!("bind API socket {api_socket:?}"))?;
    event!(Level::INFO, ?api_socket, "Bound server");

    let router = crate::routes::build_router(AppState::new(mgr));
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let token = shutdown.clone();
    let res = axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("(server exited)");

    shutdown.cancel();
    if let Err(e) = background.await {
        event!(Level::WARN, ?e, "Background task failed");
    }
    let _ = tokio::fs::remove_file(&api_socket).await;
    res
}
