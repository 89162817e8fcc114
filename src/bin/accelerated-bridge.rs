use accelerated_bridge::commands::run_cni;
use accelerated_bridge::types::ErrorResult;
use anyhow::Result;
use tracing::{error, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Generic CNI error code for failures not covered by a well-known code.
const ERR_INTERNAL: u32 = 999;

fn main() -> Result<()> {
    // stdout carries the CNI result, logs go to stderr
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);

    if let Err(err) = run_cni() {
        error!("CNI plugin error: {:#}", err);

        let reply = ErrorResult {
            cni_version: "1.0.0".to_string(),
            code: ERR_INTERNAL,
            msg: err.to_string(),
            details: format!("{:#}", err),
        };
        println!("{}", serde_json::to_string(&reply)?);
        std::process::exit(1);
    }

    Ok(())
}
