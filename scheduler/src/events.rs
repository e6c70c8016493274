use async_trait::async_trait;
use db::dtos::JobEvent;
use tracing::{debug, error, info};

/// Subject job events are published on.
pub static JOB_EVENTS_SUBJECT: &str = "job.events";

/// Destination for job events. Publishing is best-effort and never fails a cycle.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &JobEvent);
}

/// Publishes events as JSON on NATS.
pub struct NatsEventSink {
    client: async_nats::Client,
    subject: String,
}

impl NatsEventSink {
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            client,
            subject: JOB_EVENTS_SUBJECT.to_string(),
        }
    }
}

#[async_trait]
impl EventSink for NatsEventSink {
    async fn publish(&self, event: &JobEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(error) => {
                error!("Failed to serialize job event: {error:?}");
                return;
            }
        };

        if let Err(error) = self.client.publish(self.subject.clone(), payload.into()).await {
            error!("Failed to publish job event: {error:?}");
        } else {
            debug!(subject = %self.subject, "Published job event");
        }
    }
}

/// Writes events to the log when no broker is configured.
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn publish(&self, event: &JobEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(event = %json, "Job event"),
            Err(error) => error!("Failed to serialize job event: {error:?}"),
        }
    }
}
