//! Contract of the message broker: topic publishing and manually
//! acknowledged consumption.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::Result;

#[async_trait]
pub trait Message: Send + Sync {
    fn id(&self) -> &str;

    fn body(&self) -> &[u8];

    /// Number of deliveries so far, starting at 1.
    fn attempts(&self) -> u16;

    /// The handler becomes responsible for finishing or requeueing.
    fn disable_auto_response(&self);

    /// Pushes the visibility timeout further away.
    async fn touch(&self) -> anyhow::Result<()>;

    async fn finish(&self) -> anyhow::Result<()>;

    /// Requeue after a real failure, the consumer backs off.
    async fn requeue(&self, delay: Duration) -> anyhow::Result<()>;

    /// Requeue a message that only waits for capacity, no back off.
    async fn requeue_without_backoff(&self, delay: Duration) -> anyhow::Result<()>;
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, msg: Arc<dyn Message>) -> Result<()>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> anyhow::Result<()>;

    /// Starts consuming `topic` on `channel`, delivering at most
    /// `max_in_flight` unfinished messages at once.
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
        max_in_flight: watch::Receiver<usize>,
    ) -> anyhow::Result<()>;
}

pub(crate) async fn publish_json<T>(broker: &dyn Broker, topic: &str, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(value).map_err(anyhow::Error::from)?;
    broker.publish(topic, body).await?;
    Ok(())
}
