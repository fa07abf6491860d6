use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use observer::{
    api,
    config::Config,
    instruction::{HttpInstructionFetcher, InstructionFetcher},
    monitor::MonitorSettings,
    orchestrator::{ObserverSettings, OrchestratorController},
    workflow::{DryRunWorkflowClient, NfigWorkflowClient, WorkflowClient},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "observer=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(port = config.port, log_dir = %config.log_dir.display(), "observer starting");

    std::fs::create_dir_all(&config.log_dir)?;

    let workflow: Arc<dyn WorkflowClient> = match config.nfig_api_key.clone() {
        Some(api_key) => Arc::new(NfigWorkflowClient::new(
            config.nfig_api_base_url.clone(),
            api_key,
            config.remote_timeout,
        )?),
        None => {
            warn!("NFIG_API_KEY not set; remote workflows will not be launched (dry run)");
            Arc::new(DryRunWorkflowClient)
        }
    };
    let instructions: Arc<dyn InstructionFetcher> = Arc::new(HttpInstructionFetcher::new(
        config.internal_url.clone(),
        config.remote_timeout,
    )?);

    let controller = OrchestratorController::new(
        ObserverSettings {
            log_dir: config.log_dir.clone(),
            display_url: config.display_url.clone(),
            workflow_goal: config.workflow_goal.clone(),
            monitor: MonitorSettings {
                poll_interval: config.poll_interval,
                timeout: config.session_timeout,
            },
        },
        workflow,
        instructions,
    );

    let state = Arc::new(AppState { controller });

    let app = api::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
