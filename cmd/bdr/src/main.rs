use bdr_core::report::CycleStatus;
use bdr_core::util::config::Config;
use bdr_core::util::shutdown::shutdown_signal;
use bdr_core::util::usage;
use bdr_core::{api, jobs, obs};
use std::future::Future;
use tracing_subscriber::EnvFilter;

const APP_VERSION: &str = match option_env!("BDR_APP_VERSION") {
    Some(value) => value,
    None => env!("CARGO_PKG_VERSION"),
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if usage::handle_cli_flags(usage::DAEMON_USAGE, "bdr", APP_VERSION) {
        return Ok(());
    }

    init_tracing();

    let config = Config::load()?;
    let metrics = obs::Metrics::new();
    let state = api::AppState::new(config, metrics).await?;

    if usage::has_flag("--once") {
        return run_once(state).await;
    }
    run_daemon(state).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(std::env::var("BDR_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_once(state: api::AppState) -> Result<(), Box<dyn std::error::Error>> {
    let reports = jobs::run_all_cycles_once(&state).await;
    let mut failed = Vec::new();
    for (kind, report) in &reports {
        println!("{}", serde_json::json!({ "cycle": kind.as_str(), "report": report }));
        if report.status == CycleStatus::Failure {
            failed.push(kind.as_str());
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(format!("cycles failed: {}", failed.join(", ")).into())
    }
}

async fn run_daemon(state: api::AppState) -> Result<(), Box<dyn std::error::Error>> {
    let listen = state.config.metrics_listen.clone();
    let server = api::spawn_server(&listen, api::metrics_router(state.clone()))?;
    jobs::start_background_jobs(state);
    wait_for_exit(async {
        let _ = server.await;
    })
    .await;
    Ok(())
}

async fn wait_for_exit<F>(serve: F)
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = serve => {
            tracing::warn!("metrics listener stopped");
        },
        _ = shutdown_signal() => {},
    }
}
