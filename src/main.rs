use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use spc_auth::{
    Audience, Connector, Credentials, DeviceCodeCallback, DeviceCodePrompt, Permissions,
    Registration, SessionRegistry,
};
use spc_profile::{EnvSecrets, ProfileManager};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Connect to a tenant using a saved connection profile
#[derive(Debug, Parser)]
#[command(name = "spconnect", version)]
struct Cli {
    /// Name of the profile to connect with
    profile: String,

    /// Directory holding profile files
    #[arg(long, env = "SPCONNECT_PROFILE_DIR")]
    profile_dir: Option<PathBuf>,

    /// Build the session without making it the current connection
    #[arg(long)]
    detached: bool,

    /// Also fetch a token for the directory graph
    #[arg(long)]
    graph: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut manager = match cli.profile_dir {
        Some(dir) => ProfileManager::new(dir),
        None => ProfileManager::with_default_dir().await?,
    };
    let profile = manager.load_profile(&cli.profile).await?.clone();

    let mut request = profile.to_request(&EnvSecrets).await?;
    if let Credentials::DeviceCode { callback, .. } | Credentials::GraphDeviceCode { callback, .. } =
        &mut request.credentials
    {
        let print: DeviceCodeCallback = Arc::new(|prompt: &DeviceCodePrompt| eprintln!("{}", prompt.message));
        *callback = Some(print);
    }

    let registry = Arc::new(SessionRegistry::new());
    let connector = Connector::new(profile.connect_config(), registry.clone())?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling login");
            on_interrupt.cancel();
        }
    });

    let registration = if cli.detached {
        Registration::Detached
    } else {
        Registration::MakeCurrent
    };

    let Some(session) = connector
        .connect_with_cancel(request, registration, &cancel)
        .await
        .with_context(|| format!("Failed to connect with profile '{}'", profile.name))?
    else {
        bail!("Login for profile '{}' was not completed", profile.name);
    };

    info!(
        "Connected as {:?} ({:?} site), tenant {}",
        session.provenance(),
        session.classification(),
        session.tenant_id().unwrap_or("unknown")
    );

    if cli.graph {
        let token = session
            .get_token(Audience::DirectoryGraph, &Permissions::Bypass)
            .await
            .context("Failed to get a directory graph token")?;
        info!(
            "Graph token valid until {}",
            token
                .expires_at()
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string())
        );
    }

    if cli.detached {
        session.teardown().await;
    } else {
        registry.clear().await?;
    }

    Ok(())
}
