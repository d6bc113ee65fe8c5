// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod listener;

use std::{env, path::PathBuf, sync::Arc};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use intake::{
    InMemoryFaultStore, Intake, IntakeConfig, IntakeDeps, JsonLinesSink, StaticKeyAuthority,
};
use listener::{IntakeListener, ListenerConfig};
use tokio_util::sync::CancellationToken;

const RETRY_FAILED_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_INTAKE_PORT: u16 = 8126;
const INTAKE_HOST: &str = "0.0.0.0";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("INTAKE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();
    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = match IntakeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}. Shutting down intake server.");
            return;
        }
    };
    debug!("Loaded configuration: {:?}", config);

    let api_keys: Vec<String> = env::var("INTAKE_API_KEYS")
        .map(|val| {
            val.split(',')
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if api_keys.is_empty() && config.token_secret.is_none() {
        warn!(
            "Neither INTAKE_API_KEYS nor INTAKE_TOKEN_SECRET is set, every request will be rejected"
        );
    }
    let host = env::var("INTAKE_HOST").unwrap_or_else(|_| INTAKE_HOST.to_string());
    let port = env::var("INTAKE_PORT")
        .ok()
        .and_then(|port| port.parse::<u16>().ok())
        .unwrap_or(DEFAULT_INTAKE_PORT);
    let output_dir = env::var("INTAKE_OUTPUT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));

    let deps = IntakeDeps {
        key_authority: Arc::new(StaticKeyAuthority::new(api_keys)),
        log_sink: Arc::new(JsonLinesSink::new(output_dir.join("logs.ndjson"))),
        notice_sink: Arc::new(JsonLinesSink::new(output_dir.join("notices.ndjson"))),
        fault_store: Arc::new(InMemoryFaultStore::new()),
    };
    let intake = match Intake::new(&config, deps) {
        Ok(intake) => Arc::new(intake),
        Err(e) => {
            error!("Failed to start intake pipeline: {e}");
            return;
        }
    };

    let cancel_token = CancellationToken::new();
    let listener_config = ListenerConfig {
        host,
        port,
        api_key_header: config.api_key_header.clone(),
    };
    let listener =
        match IntakeListener::new(&listener_config, Arc::clone(&intake), cancel_token.clone())
            .await
        {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    "Unable to bind intake listener to {}:{}: {e}",
                    listener_config.host, listener_config.port
                );
                intake.shutdown().await;
                return;
            }
        };
    match listener.local_addr() {
        Ok(addr) => info!("Intake listening on {addr}, writing to {}", output_dir.display()),
        Err(e) => warn!("Intake listening on an unknown address: {e}"),
    }
    let listener_task = tokio::spawn(listener.spin());

    let mut retry_interval = interval(RETRY_FAILED_INTERVAL);
    retry_interval.tick().await; // discard first tick, which is instantaneous

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = retry_interval.tick() => {
                let metrics = intake.metrics();
                debug!("Intake metrics: {:?}", metrics);
                if metrics.logs.failed_items + metrics.notices.failed_items == 0 {
                    continue;
                }
                match intake.retry_failed().await {
                    Ok(count) => info!("Recovered {count} failed items"),
                    Err(e) => warn!("Retrying failed items: {e}"),
                }
            }
        }
    }

    info!("Shutting down intake server");
    cancel_token.cancel();
    if let Err(e) = listener_task.await {
        error!("Intake listener task failed: {e}");
    }
    intake.shutdown().await;

    let metrics = intake.metrics();
    let lost = metrics.logs.failed_items + metrics.notices.failed_items;
    if lost > 0 {
        error!("{lost} items could not be written before shutdown");
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!("Unable to listen for SIGTERM: {e}");
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Unable to listen for Ctrl-C: {e}");
                    }
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for Ctrl-C: {e}");
        }
    }
}
