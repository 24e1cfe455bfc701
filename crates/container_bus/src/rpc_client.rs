use std::{future::pending, time::Duration};

use serde::{Serialize, de::DeserializeOwned};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    broker::{MessageProperties, Publish},
    error::{BusError, BusResult},
    metrics::{metrics, queue_attr},
    reply_resolver::ReplyResolver,
    routing::{DIRECT_EXCHANGE, DIRECT_REPLY_TO},
    settings::BusTimings,
};

/// Per-call overrides for [`RpcClient::call_with`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Per-attempt reply timeout; falls back to the client's.
    pub timeout: Option<Duration>,
    /// Give up once this much time has passed since the call started.
    pub deadline: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Request/reply over the direct exchange.
///
/// Each attempt gets a fresh correlation id; a timed out or failed attempt
/// is abandoned entirely and the whole cycle starts over.
#[derive(Clone)]
pub struct RpcClient {
    resolver: ReplyResolver,
    timeout: Duration,
    retry_delay: Duration,
    confirm_timeout: Duration,
}

impl RpcClient {
    pub fn new(resolver: ReplyResolver, timings: &BusTimings) -> Self {
        Self {
            resolver,
            timeout: timings.rpc_timeout,
            retry_delay: timings.rpc_retry_delay,
            confirm_timeout: timings.confirm_timeout,
        }
    }

    /// Sends `payload` to `routing_key` and waits for the reply, retrying
    /// for as long as it takes.
    pub async fn call(&self, routing_key: &str, payload: &[u8]) -> BusResult<Vec<u8>> {
        self.call_with(routing_key, payload, CallOptions::default()).await
    }

    /// [`call`](Self::call) bounded by a deadline and/or cancellation token.
    /// Every call ends with `Shutdown` once the bus is shut down.
    pub async fn call_with(&self, routing_key: &str, payload: &[u8], options: CallOptions) -> BusResult<Vec<u8>> {
        metrics().rpc_calls.add(1, &queue_attr(routing_key));
        let attempt_timeout = options.timeout.unwrap_or(self.timeout);
        let deadline_at = options.deadline.map(|d| Instant::now() + d);
        let cancel = options.cancel.as_ref();

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancelled(cancel) => return Err(BusError::Cancelled),
                _ = expired(deadline_at) => return Err(deadline_error(&options)),
                _ = self.resolver.stopped() => return Err(BusError::Shutdown),
                outcome = self.attempt(routing_key, payload, attempt_timeout) => outcome,
            };
            let err = match outcome {
                Ok(reply) => {
                    if attempt > 1 {
                        debug!("call to `{routing_key}` answered on attempt {attempt}");
                    }
                    return Ok(reply);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            metrics().rpc_retries.add(1, &queue_attr(routing_key));
            warn!("call to `{routing_key}` failed (attempt {attempt}): {err}; retrying in {:?}", self.retry_delay);
            tokio::select! {
                biased;
                _ = cancelled(cancel) => return Err(BusError::Cancelled),
                _ = expired(deadline_at) => return Err(deadline_error(&options)),
                _ = self.resolver.stopped() => return Err(BusError::Shutdown),
                _ = sleep(self.retry_delay) => {}
            }
        }
    }

    /// Serializes `request`, calls, and deserializes the reply.
    pub async fn call_json<Req, Resp>(&self, routing_key: &str, request: &Req) -> BusResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)?;
        let reply = self.call(routing_key, &payload).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    async fn attempt(&self, routing_key: &str, payload: &[u8], reply_timeout: Duration) -> BusResult<Vec<u8>> {
        let channel = self.resolver.reply_channel().await?;
        let correlation_id = Uuid::new_v4().to_string();
        // dropping `pending` on any early return removes the table entry
        let mut pending = self.resolver.register(&correlation_id)?;

        let request = Publish {
            exchange: DIRECT_EXCHANGE,
            routing_key,
            payload,
            properties: MessageProperties::json()
                .with_correlation_id(correlation_id.as_str())
                .with_reply_to(DIRECT_REPLY_TO),
            mandatory: true,
        };
        timeout(self.confirm_timeout, channel.publish(request))
            .await
            .map_err(|_| BusError::Timeout("publisher confirm", self.confirm_timeout))??;
        debug!("📤 call {correlation_id} sent to `{routing_key}`");

        timeout(reply_timeout, pending.wait())
            .await
            .map_err(|_| BusError::Timeout("rpc reply", reply_timeout))?
    }
}

fn deadline_error(options: &CallOptions) -> BusError {
    BusError::DeadlineExceeded(options.deadline.unwrap_or_default())
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => pending().await,
    }
}

async fn expired(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}
