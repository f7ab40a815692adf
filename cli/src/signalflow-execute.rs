use anyhow::{Context, Result};
use lib_signalflow::loggers::setup_logging;
use lib_signalflow::{Client, Computation, DataMessage};
use std::collections::HashSet;
use std::path::PathBuf;

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();

    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    let log_path = setup_logging(&log_dir, "signalflow_execute", &log_level).context("failed to set up logging")?;
    log::info!("Logging to {}", log_path.display());

    let request = config.execute_request()?;
    let client = Client::new(config.client_options()).context("invalid SignalFlow client configuration")?;

    log::info!("Executing: {}", request.program);
    let computation = client.execute(request).await.context("failed to start computation")?;

    tokio::select! {
        _ = report(&computation) => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted; stopping computation '{}'", computation.name());
            if let Err(e) = computation.stop_with_reason("interrupted").await {
                log::warn!("Could not stop computation: {}", e);
            }
        }
    }

    let outcome = computation.err();
    client.close();

    match outcome {
        Some(e) => Err(e).context("computation failed"),
        None => {
            log::info!("Computation '{}' finished", computation.name());
            Ok(())
        }
    }
}

/// Logs job metadata once known, then a summary per data batch until the
/// computation ends.
async fn report(computation: &Computation) {
    if let Some(handle) = computation.handle().await {
        log::info!("Job handle: {}", handle);
    }
    if let Some(resolution) = computation.resolution().await {
        log::info!("Resolution: {:?}", resolution);
    }
    if let Some(lag) = computation.lag().await {
        log::info!("Detected lag: {:?}", lag);
    }
    if let (Some(matched), Some(limit)) = (computation.matched_size().await, computation.limit_size().await) {
        log::warn!("Result set limited: {} series matched, limit {}", matched, limit);
    }

    let Some(mut data) = computation.data() else {
        computation.done().await;
        return;
    };

    let mut described = HashSet::new();
    while let Some(batch) = data.recv().await {
        describe_new_series(computation, &batch, &mut described).await;
        log_batch(&batch);
    }
}

async fn describe_new_series(computation: &Computation, batch: &DataMessage, described: &mut HashSet<lib_signalflow::Tsid>) {
    for payload in &batch.payloads {
        if !described.insert(payload.tsid) {
            continue;
        }
        match computation.tsid_metadata(payload.tsid).await {
            Some(meta) => log::info!(
                "Series {}: metric={} properties={}",
                payload.tsid,
                meta.metric().unwrap_or("?"),
                serde_json::Value::Object(meta.properties.clone())
            ),
            None => log::debug!("Series {} has no metadata yet", payload.tsid),
        }
    }
}

fn log_batch(batch: &DataMessage) {
    let values: Vec<f64> = batch
        .payloads
        .iter()
        .filter_map(|p| p.value())
        .map(|v| v.as_f64())
        .collect();
    if values.is_empty() {
        log::info!("[{}] empty batch", batch.timestamp_ms);
        return;
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    log::info!(
        "[{}] {} series: min={:.3} mean={:.3} max={:.3}",
        batch.timestamp_ms,
        values.len(),
        min,
        mean,
        max
    );
}
