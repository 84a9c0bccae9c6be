use tracing::{Span, info_span};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn generate() -> Self {
        CorrelationId(Uuid::new_v4().to_string())
    }

    /// Reuse an inbound id when present, otherwise mint a new one.
    pub fn from_header(value: Option<&str>) -> Self {
        value
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| CorrelationId(value.to_string()))
            .unwrap_or_else(Self::generate)
    }
}

pub fn init() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false),
        )
        .try_init()
        .ok();

    Ok(())
}

pub fn request_span(name: &str, correlation_id: &str) -> Span {
    info_span!(
        "backend.op",
        operation = name,
        correlation_id = %correlation_id
    )
}
