//! Registration request model and validation.
//!
//! The wire shape keeps the field names existing callers already send
//! (`logicAppInfo` / `triggerConfig` with PascalCase members). Validation turns
//! a request into a [`SubscriptionRecord`] or reports every problem at once.

use serde::{Deserialize, Serialize};

use crate::errors::{ValidationError, ValidationErrors};
use crate::{BrokerTarget, CallbackUrl, ConnectionString, SubscriptionRecord, WorkflowId};

/// Who owns the trigger and where to call back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TriggerOwner {
    #[serde(default)]
    pub workflow_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub callback_url: String,
}

/// Which broker entity to listen on and with which credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TriggerConfig {
    #[serde(default)]
    pub service_bus_connection_string: Option<String>,
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub topic_name: Option<String>,
    #[serde(default)]
    pub subscription_name: Option<String>,
}

/// Body of a subscribe call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    #[serde(rename = "logicAppInfo")]
    pub owner: TriggerOwner,
    #[serde(rename = "triggerConfig")]
    pub config: TriggerConfig,
}

/// Body of an unsubscribe call. Other owner fields may be present and are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UnsubscribeRequest {
    pub workflow_id: String,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn reject(errors: &mut Vec<ValidationError>, field: &str, message: &str) {
    errors.push(ValidationError {
        field: field.to_owned(),
        message: message.to_owned(),
    });
}

impl SubscriptionRequest {
    /// Validates the request and builds the record to register.
    ///
    /// `default_credential` is the process-wide connection string; a request
    /// without its own connection string is only valid if a default exists.
    pub fn validate(
        &self,
        default_credential: Option<&ConnectionString>,
    ) -> Result<SubscriptionRecord, ValidationErrors> {
        let mut errors = Vec::new();

        let workflow_id = WorkflowId::new(self.owner.workflow_id.trim());
        if workflow_id.is_none() {
            reject(&mut errors, "WorkflowId", "a workflow id is required");
        }

        if self.owner.name.trim().is_empty() {
            reject(&mut errors, "Name", "a trigger name is required");
        }

        let callback_url = if self.owner.callback_url.trim().is_empty() {
            reject(&mut errors, "CallbackUrl", "a callback URL is required");
            None
        } else {
            let parsed = CallbackUrl::parse(self.owner.callback_url.trim());
            if parsed.is_none() {
                reject(
                    &mut errors,
                    "CallbackUrl",
                    "the callback URL must be an absolute http or https URL",
                );
            }
            parsed
        };

        let connection_credential =
            non_empty(&self.config.service_bus_connection_string).and_then(ConnectionString::new);
        if connection_credential.is_none() && default_credential.is_none() {
            reject(
                &mut errors,
                "ServiceBusConnectionString",
                "no connection string supplied and no default connection string is configured",
            );
        }

        let broker_target = self.broker_target(&mut errors);

        match (
            workflow_id,
            callback_url,
            broker_target,
            ValidationErrors::from_vec(errors),
        ) {
            (Some(workflow_id), Some(callback_url), Some(broker_target), None) => {
                Ok(SubscriptionRecord {
                    workflow_id,
                    display_name: self.owner.name.trim().to_owned(),
                    callback_url,
                    broker_target,
                    connection_credential,
                })
            }
            (_, _, _, Some(errors)) => Err(errors),
            // Every `None` above is recorded as an error first.
            _ => unreachable!("rejected field without a validation error"),
        }
    }

    fn broker_target(&self, errors: &mut Vec<ValidationError>) -> Option<BrokerTarget> {
        let queue = non_empty(&self.config.queue_name);
        let topic = non_empty(&self.config.topic_name);
        let subscription = non_empty(&self.config.subscription_name);

        match (queue, topic, subscription) {
            (None, None, None) => {
                reject(
                    errors,
                    "QueueName",
                    "supply a queue name, or a topic name and a subscription name",
                );
                None
            }
            (Some(name), None, None) => Some(BrokerTarget::Queue {
                name: name.to_owned(),
            }),
            (Some(_), _, _) => {
                reject(
                    errors,
                    "QueueName",
                    "when listening on a queue, TopicName and SubscriptionName must be omitted",
                );
                None
            }
            (None, Some(topic), Some(subscription)) => Some(BrokerTarget::TopicSubscription {
                topic: topic.to_owned(),
                subscription_name: subscription.to_owned(),
            }),
            (None, _, _) => {
                reject(
                    errors,
                    "TopicName",
                    "when listening on a topic, both TopicName and SubscriptionName are required",
                );
                None
            }
        }
    }
}
