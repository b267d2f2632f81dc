use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::gateway::{MeteringRecorder, UsageTap};

const RELAY_CHANNEL_CAPACITY: usize = 16;

/// What the relay needs to record usage once the upstream body ends.
pub(super) struct MeteringContext {
    pub(super) recorder: MeteringRecorder,
    pub(super) request_id: String,
    pub(super) label: String,
    pub(super) request_model: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RelayEnd {
    Completed,
    UpstreamError,
    DrainTimedOut,
}

/// Streams `upstream` to the caller through a spawned pump task.
///
/// Chunks reach the caller in upstream order and unmodified while the same bytes feed `tap`.
/// If the caller goes away, the pump keeps reading (for at most `drain_timeout`) so a
/// trailing usage event can still be recorded.
pub(super) fn relay_body<S>(
    upstream: S,
    tap: UsageTap,
    metering: MeteringContext,
    drain_timeout: Duration,
) -> Body
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(RELAY_CHANNEL_CAPACITY);
    tokio::spawn(pump(upstream, tx, tap, metering, drain_timeout));

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    Body::from_stream(stream)
}

async fn pump<S>(
    upstream: S,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    mut tap: UsageTap,
    metering: MeteringContext,
    drain_timeout: Duration,
) where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let mut upstream = Box::pin(upstream);
    let mut drain_deadline: Option<Instant> = None;
    let mut bytes_relayed: u64 = 0;
    let end = loop {
        let next = match drain_deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, upstream.next()).await {
                Ok(next) => next,
                Err(_) => break RelayEnd::DrainTimedOut,
            },
            None => upstream.next().await,
        };

        match next {
            Some(Ok(chunk)) => {
                tap.ingest(&chunk);
                if drain_deadline.is_none() {
                    bytes_relayed = bytes_relayed.saturating_add(chunk.len() as u64);
                    if tx.send(Ok(chunk)).await.is_err() {
                        tracing::debug!(
                            request_id = %metering.request_id,
                            "client disconnected; draining upstream for usage"
                        );
                        drain_deadline = Some(Instant::now() + drain_timeout);
                    }
                }
                if drain_deadline.is_some() && tap.is_complete() {
                    break RelayEnd::Completed;
                }
            }
            Some(Err(err)) => {
                tracing::warn!(
                    request_id = %metering.request_id,
                    error = %err,
                    "upstream body failed mid-stream"
                );
                if drain_deadline.is_none() {
                    let _ = tx.send(Err(std::io::Error::other(err))).await;
                }
                break RelayEnd::UpstreamError;
            }
            None => break RelayEnd::Completed,
        }
    };

    drop(tx);
    drop(upstream);

    tracing::debug!(
        request_id = %metering.request_id,
        end = ?end,
        bytes_relayed,
        client_disconnected = drain_deadline.is_some(),
        "relay finished"
    );

    let usage = tap.finish(metering.request_model.as_deref());
    metering
        .recorder
        .record(&metering.request_id, &metering.label, usage)
        .await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::to_bytes;

    use super::*;
    use crate::gateway::PricingTable;
    use crate::utils::test_support::MemoryStore;

    fn metering(sink: Arc<MemoryStore>) -> MeteringContext {
        MeteringContext {
            recorder: MeteringRecorder::new(Arc::new(PricingTable::with_defaults()), sink),
            request_id: "req-1".to_string(),
            label: "team-a".to_string(),
            request_model: Some("gpt-4o".to_string()),
        }
    }

    fn upstream(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static {
        futures_util::stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok::<_, reqwest::Error>(Bytes::from_static(chunk.as_bytes()))),
        )
    }

    const CHUNKS: [&str; 4] = [
        "data: {\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
        "data: {\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
        "data: {\"model\":\"gpt-4o\",\"choices\":[],\"usage\":{\"prompt_tokens\":1000,\"completion_tokens\":1000}}\n\n",
        "data: [DONE]\n\n",
    ];

    #[tokio::test]
    async fn relays_bytes_in_order_and_records_usage() {
        let sink = Arc::new(MemoryStore::default());
        let tap = UsageTap::for_response(200, Some("text/event-stream"), 1024);
        let body = relay_body(
            upstream(CHUNKS.to_vec()),
            tap,
            metering(sink.clone()),
            Duration::from_secs(1),
        );

        let relayed = to_bytes(body, usize::MAX).await.expect("body");
        assert_eq!(relayed, Bytes::from(CHUNKS.concat()));

        let rows = sink.wait_for_rows(1).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].prompt_tokens, 1000);
        let cost = rows[0].cost_usd.expect("cost");
        assert!((cost - 0.02).abs() < 1e-9, "cost={cost}");
    }

    #[tokio::test]
    async fn records_usage_after_client_disconnect() {
        let sink = Arc::new(MemoryStore::default());
        let tap = UsageTap::for_response(200, Some("text/event-stream"), 1024);
        let body = relay_body(
            upstream(CHUNKS.to_vec()),
            tap,
            metering(sink.clone()),
            Duration::from_secs(1),
        );
        drop(body);

        let rows = sink.wait_for_rows(1).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].label, "team-a");
    }

    #[tokio::test]
    async fn error_statuses_are_relayed_without_metering() {
        let sink = Arc::new(MemoryStore::default());
        let tap = UsageTap::for_response(429, Some("application/json"), 1024);
        let body = relay_body(
            upstream(vec![r#"{"error":{"message":"slow down","usage":{"prompt_tokens":1,"completion_tokens":1}}}"#]),
            tap,
            metering(sink.clone()),
            Duration::from_secs(1),
        );
        let relayed = to_bytes(body, usize::MAX).await.expect("body");
        assert!(relayed.starts_with(b"{\"error\""));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.rows().is_empty());
    }
}
