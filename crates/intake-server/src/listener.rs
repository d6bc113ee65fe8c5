// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP listener that feeds JSON envelopes into the intake pipeline.
//!
//! Each datagram carries one envelope:
//!
//! ```json
//! {"api_key": "...", "token": "...", "logs": [...], "occurrence": {...}}
//! ```
//!
//! Credentials are turned into request headers so the pipeline authenticates
//! them exactly as it would an HTTP request. The outcome is logged per datagram.

use std::net::SocketAddr;
use std::sync::Arc;

use http::{header, HeaderMap, HeaderName, HeaderValue};
use intake::{Intake, IngestError, LogRecordInput, Occurrence};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    /// Header the pipeline expects the API key in.
    pub api_key_header: String,
}

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    logs: Option<Vec<LogRecordInput>>,
    #[serde(default)]
    occurrence: Option<Occurrence>,
}

pub struct IntakeListener {
    cancel_token: CancellationToken,
    socket: UdpSocket,
    intake: Arc<Intake>,
    api_key_header: HeaderName,
}

impl IntakeListener {
    pub async fn new(
        config: &ListenerConfig,
        intake: Arc<Intake>,
        cancel_token: CancellationToken,
    ) -> std::io::Result<Self> {
        let api_key_header = HeaderName::from_bytes(config.api_key_header.as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let socket = UdpSocket::bind(format!("{}:{}", config.host, config.port)).await?;
        Ok(Self {
            cancel_token,
            socket,
            intake,
            api_key_header,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives datagrams until cancelled. Each one is handled on its own task,
    /// and every in-flight handler finishes before this returns, so their
    /// records reach the pipeline ahead of its final flush.
    pub async fn spin(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut handlers = JoinSet::new();
        loop {
            let (len, src) = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                Some(finished) = handlers.join_next() => {
                    log_handler_exit(finished);
                    continue;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        error!("Failed to receive datagram: {e}");
                        continue;
                    }
                },
            };
            trace!("Received {len} bytes from {src}");

            let envelope = match serde_json::from_slice::<Envelope>(&buf[..len]) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Discarding malformed envelope from {src}: {e}");
                    continue;
                }
            };
            let intake = Arc::clone(&self.intake);
            let headers = self.headers_for(&envelope);
            handlers.spawn(async move { handle_envelope(&intake, envelope, headers, src).await });
        }

        if !handlers.is_empty() {
            debug!("Waiting for {} in-flight envelopes", handlers.len());
        }
        while let Some(finished) = handlers.join_next().await {
            log_handler_exit(finished);
        }
        debug!("Intake listener stopped");
    }

    fn headers_for(&self, envelope: &Envelope) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(key) = envelope.api_key.as_deref() {
            if let Ok(value) = HeaderValue::from_str(key) {
                headers.insert(self.api_key_header.clone(), value);
            }
        }
        if let Some(token) = envelope.token.as_deref() {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(header::AUTHORIZATION, value);
            }
        }
        headers
    }
}

async fn handle_envelope(intake: &Intake, envelope: Envelope, headers: HeaderMap, src: SocketAddr) {
    let identity = match intake.authenticate(&headers).await {
        Ok(identity) => identity,
        Err(e) => {
            log_rejection(&e, src);
            return;
        }
    };

    if let Some(logs) = envelope.logs {
        match intake.ingest_batch(logs, &identity).await {
            Ok(summary) => {
                for item in &summary.errors {
                    debug!("Record {} from {src} rejected: {}", item.index, item.error);
                }
                info!(
                    "Accepted {} log records from {src}, rejected {}",
                    summary.accepted, summary.rejected
                );
            }
            Err(e) => log_rejection(&e, src),
        }
    }

    if let Some(occurrence) = envelope.occurrence {
        match intake.report_occurrence(occurrence, &identity).await {
            Ok(receipt) => info!(
                notice_id = %receipt.id,
                fault_id = %receipt.fault_id,
                "Recorded occurrence from {src}"
            ),
            Err(e) => log_rejection(&e, src),
        }
    }
}

fn log_handler_exit(finished: Result<(), JoinError>) {
    if let Err(e) = finished {
        if e.is_panic() {
            error!("Envelope handler panicked: {e:?}");
        }
    }
}

fn log_rejection(error: &IngestError, src: SocketAddr) {
    match error {
        IngestError::AuthRejected(reason) => {
            warn!(%reason, "Rejected envelope from {src}: {error}");
        }
        IngestError::AdmissionRejected | IngestError::ValidationFailed(_) => {
            warn!("Rejected envelope from {src}: {error}");
        }
        _ => error!("Failed to process envelope from {src}: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use intake::errors::AuthorityError;
    use intake::{
        InMemoryFaultStore, IntakeConfig, IntakeDeps, JsonLinesSink, KeyAuthority, LogRecord,
        StaticKeyAuthority,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Running {
        intake: Arc<Intake>,
        addr: SocketAddr,
        cancel: CancellationToken,
        spin: JoinHandle<()>,
        logs: Arc<JsonLinesSink>,
        faults: Arc<InMemoryFaultStore>,
        _dir: tempfile::TempDir,
    }

    /// Accepts every key, but only after stalling mid-lookup.
    #[derive(Default)]
    struct StallingAuthority {
        entered: AtomicBool,
    }

    #[async_trait]
    impl KeyAuthority for StallingAuthority {
        async fn lookup_active_key(&self, _key: &str) -> Result<bool, AuthorityError> {
            self.entered.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(true)
        }
    }

    async fn start() -> Running {
        start_with(Arc::new(StaticKeyAuthority::new(["good-key"]))).await
    }

    async fn start_with(key_authority: Arc<dyn KeyAuthority>) -> Running {
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(JsonLinesSink::new(dir.path().join("logs.ndjson")));
        let faults = Arc::new(InMemoryFaultStore::new());
        let config = IntakeConfig {
            flush_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let intake = Arc::new(
            Intake::new(
                &config,
                IntakeDeps {
                    key_authority,
                    log_sink: logs.clone(),
                    notice_sink: Arc::new(JsonLinesSink::new(dir.path().join("notices.ndjson"))),
                    fault_store: faults.clone(),
                },
            )
            .unwrap(),
        );

        let cancel = CancellationToken::new();
        let listener = IntakeListener::new(
            &ListenerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                api_key_header: config.api_key_header.clone(),
            },
            Arc::clone(&intake),
            cancel.clone(),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let spin = tokio::spawn(listener.spin());

        Running {
            intake,
            addr,
            cancel,
            spin,
            logs,
            faults,
            _dir: dir,
        }
    }

    async fn send(addr: SocketAddr, payload: &str) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(payload.as_bytes(), addr).await.unwrap();
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_envelope_logs_are_ingested() {
        let running = start().await;
        send(
            running.addr,
            r#"{"api_key":"good-key","logs":[{"service":"checkout","message":"paid"},{"service":"","message":"x"}]}"#,
        )
        .await;

        let intake = Arc::clone(&running.intake);
        wait_for(|| intake.logs().len() == 1).await;

        running.cancel.cancel();
        running.intake.shutdown().await;
        let written = tokio::fs::read_to_string(running.logs.path()).await.unwrap();
        let record: LogRecord = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(record.message, "paid");
    }

    #[tokio::test]
    async fn test_envelope_occurrence_creates_fault() {
        let running = start().await;
        send(
            running.addr,
            r#"{"api_key":"good-key","occurrence":{"project_id":"p1","error_class":"Boom","location":"a.rs:1"}}"#,
        )
        .await;

        let faults = Arc::clone(&running.faults);
        wait_for(|| faults.faults().len() == 1).await;
        assert_eq!(running.faults.faults()[0].environment, "production");
        running.cancel.cancel();
        running.intake.shutdown().await;
    }

    #[tokio::test]
    async fn test_unauthenticated_and_malformed_envelopes_dropped() {
        let running = start().await;
        send(running.addr, r#"{"api_key":"bad-key","logs":[{"service":"a","message":"b"}]}"#).await;
        send(running.addr, "not json").await;
        send(running.addr, r#"{"api_key":"good-key","logs":[{"service":"a","message":"ok"}]}"#).await;

        let intake = Arc::clone(&running.intake);
        wait_for(|| intake.logs().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(running.intake.logs().len(), 1);
        running.cancel.cancel();
        running.intake.shutdown().await;
    }

    #[tokio::test]
    async fn test_spin_waits_for_in_flight_envelopes() {
        let authority = Arc::new(StallingAuthority::default());
        let running = start_with(authority.clone()).await;
        send(
            running.addr,
            r#"{"api_key":"slow-key","logs":[{"service":"checkout","message":"late"}]}"#,
        )
        .await;

        wait_for(|| authority.entered.load(Ordering::SeqCst)).await;
        assert!(running.intake.logs().is_empty());
        running.cancel.cancel();
        running.spin.await.unwrap();
        assert_eq!(running.intake.logs().len(), 1);

        running.intake.shutdown().await;
        let written = tokio::fs::read_to_string(running.logs.path()).await.unwrap();
        let record: LogRecord = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(record.message, "late");
    }
}
