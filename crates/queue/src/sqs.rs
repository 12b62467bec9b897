//! AWS SQS FIFO task queue.
//!
//! Message group is a digest of the series key and the deduplication ID is
//! the task ID,
//! so SQS itself drops resubmissions inside its five-minute dedup interval.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_sqs::config::{BehaviorVersion, Region};
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use geoanomaly_core::config::{AwsConfig, QueueConfig};
use geoanomaly_core::TaskId;

use crate::codec::TaskPayload;
use crate::error::QueueError;
use crate::queue::{Delivery, QueueHealth, SubmitOutcome, TaskQueue};

/// SQS refuses visibility timeouts above 12 hours.
const MAX_VISIBILITY_SECS: u64 = 43_200;

/// SQS-backed task queue.
pub struct SqsTaskQueue {
    client: Client,
    queue_url: String,
    dlq_url: Option<String>,
    visibility_timeout_secs: i32,
    /// Receipt handle of the latest delivery of each in-flight task.
    receipts: Mutex<HashMap<TaskId, String>>,
}

impl SqsTaskQueue {
    /// Create a new SQS queue client from project config.
    pub async fn new(aws: &AwsConfig, queue: &QueueConfig) -> Result<Self, QueueError> {
        let queue_url = queue
            .queue_url
            .clone()
            .ok_or_else(|| QueueError::Connection("QUEUE_URL not set".into()))?;
        let region = Region::new(aws.region.clone());

        let mut sqs_config = match (&aws.access_key_id, &aws.secret_access_key) {
            // Static credentials (local dev / explicit config).
            (Some(key_id), Some(secret)) => {
                let creds = Credentials::new(
                    key_id,
                    secret,
                    aws.session_token.clone(),
                    None,
                    "geoanomaly-queue-static",
                );
                aws_sdk_sqs::Config::builder()
                    .region(region)
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(creds)
            }
            // Default provider chain (instance profile, SSO, env).
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_sqs::config::Builder::from(&shared)
            }
        };

        if let Some(ref endpoint) = aws.endpoint_url {
            if !endpoint.is_empty() {
                let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                    endpoint.clone()
                } else {
                    format!("https://{endpoint}")
                };
                sqs_config = sqs_config.endpoint_url(&url);
            }
        }

        let client = Client::from_conf(sqs_config.build());

        info!(
            queue_url = %queue_url,
            region = %aws.region,
            "SQS task queue initialized"
        );

        Ok(Self {
            client,
            queue_url,
            dlq_url: queue.dlq_url.clone(),
            visibility_timeout_secs: queue.visibility_timeout_secs as i32,
            receipts: Mutex::new(HashMap::new()),
        })
    }

    async fn receipt(&self, task_id: &TaskId) -> Result<String, QueueError> {
        self.receipts
            .lock()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| QueueError::Ack(format!("no receipt handle for task {task_id}")))
    }

    async fn change_visibility(&self, task_id: &TaskId, secs: u64) -> Result<(), QueueError> {
        let receipt_handle = self.receipt(task_id).await?;
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(secs.min(MAX_VISIBILITY_SECS) as i32)
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS visibility change failed: {e:?}")))?;
        self.receipts.lock().await.remove(task_id);
        Ok(())
    }

    async fn approximate_count(&self, url: &str) -> Result<Option<u64>, QueueError> {
        let resp = self
            .client
            .get_queue_attributes()
            .queue_url(url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesDelayed)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS attribute query failed: {e:?}")))?;

        let attrs = match resp.attributes() {
            Some(attrs) => attrs,
            None => return Ok(None),
        };
        let read = |name: &QueueAttributeName| {
            attrs.get(name).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0)
        };
        Ok(Some(
            read(&QueueAttributeName::ApproximateNumberOfMessages)
                + read(&QueueAttributeName::ApproximateNumberOfMessagesDelayed),
        ))
    }
}

#[async_trait]
impl TaskQueue for SqsTaskQueue {
    async fn submit(
        &self,
        task_id: &TaskId,
        payload: TaskPayload,
    ) -> Result<SubmitOutcome, QueueError> {
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(payload.body)
            .message_group_id(payload.group)
            .message_deduplication_id(task_id.as_str())
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS send failed: {e:?}")))?;

        // SQS drops deduplicated sends silently, so every send reports Accepted.
        debug!(task_id = %task_id, "Sent task to SQS");
        Ok(SubmitOutcome::Accepted)
    }

    async fn receive(&self, max: u32) -> Result<Vec<Delivery>, QueueError> {
        // SQS caps at 10 messages per request.
        let capped = max.clamp(1, 10) as i32;

        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(capped)
            .wait_time_seconds(20)
            .visibility_timeout(self.visibility_timeout_secs)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS receive failed: {e:?}")))?;

        let sqs_messages = resp.messages.unwrap_or_default();
        debug!(count = sqs_messages.len(), "Received SQS messages");

        let mut receipts = self.receipts.lock().await;
        let mut deliveries = Vec::with_capacity(sqs_messages.len());
        for msg in sqs_messages {
            let receipt_handle = msg
                .receipt_handle()
                .ok_or_else(|| QueueError::Parse("missing receipt handle".into()))?
                .to_string();

            let attrs = msg.attributes();
            let task_id = match attrs
                .and_then(|a| a.get(&MessageSystemAttributeName::MessageDeduplicationId))
            {
                Some(id) => TaskId::from_raw(id.as_str()),
                None => {
                    warn!(message_id = ?msg.message_id(), "SQS message without deduplication id");
                    continue;
                }
            };

            let attempt = attrs
                .and_then(|a| a.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|c| c.parse::<u32>().ok())
                .unwrap_or(1);

            receipts.insert(task_id.clone(), receipt_handle);
            deliveries.push(Delivery {
                task_id,
                body: msg.body().unwrap_or("").to_string(),
                attempt,
            });
        }

        Ok(deliveries)
    }

    async fn ack(&self, task_id: &TaskId) -> Result<(), QueueError> {
        let receipt_handle = self.receipt(task_id).await?;
        debug!(task_id = %task_id, "Acking SQS message");

        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Ack(format!("SQS delete failed: {e:?}")))?;

        self.receipts.lock().await.remove(task_id);
        Ok(())
    }

    async fn nack(&self, task_id: &TaskId, requeue: bool) -> Result<(), QueueError> {
        if requeue {
            debug!(task_id = %task_id, "Nacking SQS message (visibility=0)");
            self.change_visibility(task_id, 0).await
        } else {
            debug!(task_id = %task_id, "Dropping SQS message");
            self.ack(task_id).await
        }
    }

    async fn nack_after(&self, task_id: &TaskId, delay: Duration) -> Result<(), QueueError> {
        debug!(task_id = %task_id, delay_secs = delay.as_secs(), "Delaying SQS message");
        self.change_visibility(task_id, delay.as_secs()).await
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        // Deleting needs a receipt handle, which only a receive hands out.
        debug!(task_id = %task_id, "SQS cannot cancel unclaimed messages");
        Ok(false)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.approximate_count(&self.queue_url).await?.unwrap_or(0))
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let count = self
            .approximate_count(&self.queue_url)
            .await
            .map_err(|e| QueueError::Connection(format!("SQS health check failed: {e}")))?;

        Ok(QueueHealth {
            connected: true,
            approximate_message_count: count,
            provider: "sqs".to_string(),
        })
    }

    async fn dlq_depth(&self) -> Result<Option<u64>, QueueError> {
        match &self.dlq_url {
            Some(url) => self.approximate_count(url).await,
            None => Ok(None),
        }
    }
}
