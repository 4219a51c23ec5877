use bdr_core::meta::models::DrTestKind;
use bdr_core::report::{self, CycleKind};
use bdr_core::util::config::Config;
use bdr_core::util::usage;
use bdr_core::{api, obs};
use tracing_subscriber::EnvFilter;

const APP_VERSION: &str = match option_env!("BDR_APP_VERSION") {
    Some(value) => value,
    None => env!("CARGO_PKG_VERSION"),
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if usage::handle_cli_flags(usage::DRILL_USAGE, "bdr-drill", APP_VERSION) {
        return Ok(());
    }

    let kind = match usage::positional().as_deref().and_then(DrTestKind::parse) {
        Some(kind) => kind,
        None => {
            usage::print_usage(usage::DRILL_USAGE);
            return Err("drill kind must be one of backup, restore, failover, full_dr".into());
        }
    };

    init_tracing();

    let config = Config::load()?;
    let metrics = obs::Metrics::new();
    let state = api::AppState::new(config, metrics).await?;

    let harness = state.drill_harness()?;
    let run = harness.run(kind).await;
    let cycle = run.report();
    match report::persist(&state.config.reports_dir, CycleKind::DrRun, &cycle).await {
        Ok(path) => tracing::info!(path = %path.display(), "drill report written"),
        Err(err) => tracing::warn!(error = %err, "drill report write failed"),
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "run": run, "report": cycle }))?
    );
    if run.passed() {
        Ok(())
    } else {
        Err(format!("{} drill failed", kind.as_str()).into())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(std::env::var("BDR_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
