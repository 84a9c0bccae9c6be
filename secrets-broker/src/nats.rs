use std::sync::Arc;

use async_nats::{Client, HeaderMap, Message, Subscriber};
use futures::StreamExt;
use secrets_core::{Abort, Sealed};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

use crate::state::AppState;
use crate::telemetry::{CORRELATION_ID_HEADER, CorrelationId, request_span};

pub async fn run(client: Client, state: AppState) -> anyhow::Result<()> {
    let client = Arc::new(client);

    let get = client.subscribe(state.subjects.get.clone()).await?;
    let xkey = client.subscribe(state.subjects.server_xkey.clone()).await?;
    info!(
        get = %state.subjects.get,
        server_xkey = %state.subjects.server_xkey,
        "listening for secret requests"
    );

    let tasks = vec![
        spawn_listener(client.clone(), "backend.get", get, state.clone(), Handler::Get),
        spawn_listener(client, "backend.server_xkey", xkey, state, Handler::ServerXkey),
    ];

    for result in futures::future::try_join_all(tasks).await? {
        result?;
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum Handler {
    Get,
    ServerXkey,
}

/// Each inbound message gets its own task; a slow store call never blocks the
/// subscription loop.
fn spawn_listener(
    client: Arc<Client>,
    span_name: &'static str,
    mut subscriber: Subscriber,
    state: AppState,
    handler: Handler,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move {
        while let Some(message) = subscriber.next().await {
            let correlation = extract_correlation(&message);
            let span = request_span(span_name, &correlation.0);
            let client = client.clone();
            let state = state.clone();
            tokio::spawn(
                async move {
                    match handler {
                        Handler::Get => handle_get(&client, &state, message, &correlation).await,
                        Handler::ServerXkey => {
                            handle_server_xkey(&client, &state, message, &correlation).await
                        }
                    }
                }
                .instrument(span),
            );
        }
        Ok(())
    })
}

async fn handle_get(client: &Client, state: &AppState, message: Message, correlation: &CorrelationId) {
    if message.reply.is_none() {
        warn!(subject = %message.subject, "get request has no reply subject; ignoring");
        return;
    }

    match execute_get(state, &message.payload).await {
        Ok(mut sealed) => {
            let body = match sealed.envelope.to_vec() {
                Ok(body) => body,
                Err(err) => {
                    warn!(error = %err, "failed to encode response envelope");
                    return;
                }
            };
            let delivered = if respond(client, &message, body, correlation).await {
                sealed.mark_sent()
            } else {
                sealed.mark_undelivered()
            };
            if let Err(err) = delivered {
                warn!(error = %err, "request cycle out of order");
            }
            match sealed.error_code() {
                Some(code) => info!(code = %code, "secret request answered with error"),
                None => info!(stage = ?sealed.stage(), "secret request answered"),
            }
        }
        Err(abort) => {
            warn!(error = %abort, "secret request dropped without reply");
        }
    }
}

async fn handle_server_xkey(
    client: &Client,
    state: &AppState,
    message: Message,
    correlation: &CorrelationId,
) {
    let key = execute_server_xkey(state);
    if respond(client, &message, key.into_bytes(), correlation).await {
        debug!("served service public key");
    }
}

/// Run one encrypted get request against the orchestrator.
pub async fn execute_get(state: &AppState, payload: &[u8]) -> Result<Sealed, Abort> {
    state.orchestrator.handle_get(payload).await
}

pub fn execute_server_xkey(state: &AppState) -> String {
    state.orchestrator.server_xkey()
}

async fn respond(
    client: &Client,
    message: &Message,
    payload: Vec<u8>,
    correlation: &CorrelationId,
) -> bool {
    let Some(reply) = &message.reply else {
        warn!(subject = %message.subject, "request has no reply subject; dropping response");
        return false;
    };
    let mut headers = HeaderMap::new();
    headers.insert(CORRELATION_ID_HEADER, correlation.0.as_str());
    match client
        .publish_with_headers(reply.clone(), headers, payload.into())
        .await
    {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "failed to publish response");
            false
        }
    }
}

fn extract_correlation(message: &Message) -> CorrelationId {
    let inbound = message
        .headers
        .as_ref()
        .and_then(|headers| headers.get(CORRELATION_ID_HEADER))
        .map(|value| value.as_str());
    CorrelationId::from_header(inbound)
}
