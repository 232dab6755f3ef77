//! AWS `CloudFormation` implementation of the provisioning API.
//!
//! This is the only place where remote error text is inspected. Sentinel
//! messages are turned into typed [`ProvisionError`] variants here.

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_cloudformation::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_cloudformation::primitives::DateTime as AwsDateTime;
use aws_sdk_cloudformation::types::{Capability, OnFailure, Parameter, Stack, Tag};
use aws_sdk_cloudformation::Client;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ProvisionError, Result};
use crate::resource::{StackResourceSummary, TemplateSource};

use super::provisioner::StackProvisioner;
use super::types::{CreateStackInput, RemoteStack, UpdateStackInput};

/// Message fragment returned when an update changes nothing.
const NO_UPDATES_MESSAGE: &str = "No updates are to be performed";

/// Message fragment returned for an unknown stack.
const DOES_NOT_EXIST_MESSAGE: &str = "does not exist";

/// Error code returned when requests are throttled.
const THROTTLING_CODE: &str = "Throttling";

/// `CloudFormation`-backed provisioner.
#[derive(Debug, Clone)]
pub struct CloudFormationProvisioner {
    /// SDK client.
    client: Client,
}

impl CloudFormationProvisioner {
    /// Creates a provisioner from the ambient AWS configuration.
    ///
    /// Every SDK operation, retries included, is bounded by `operation_timeout`.
    pub async fn new(region: Option<&str>, operation_timeout: Duration) -> Self {
        let timeouts = TimeoutConfig::builder()
            .operation_timeout(operation_timeout)
            .build();

        let mut loader = aws_config::from_env().timeout_config(timeouts);
        if let Some(region_str) = region {
            loader = loader.region(aws_config::Region::new(region_str.to_string()));
        }
        let config = loader.load().await;

        Self {
            client: Client::new(&config),
        }
    }

    /// Creates a provisioner with an existing client.
    #[must_use]
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StackProvisioner for CloudFormationProvisioner {
    async fn get_stack(&self, stack: &str) -> Result<RemoteStack> {
        debug!("Describing stack: {stack}");

        let output = self
            .client
            .describe_stacks()
            .stack_name(stack)
            .send()
            .await
            .map_err(|e| map_sdk_error(stack, &e))?;

        let described = output
            .stacks()
            .first()
            .ok_or_else(|| ProvisionError::StackNotFound {
                stack: stack.to_string(),
            })?;

        Ok(to_remote_stack(described))
    }

    async fn get_stack_resources(&self, stack_id: &str) -> Result<Vec<StackResourceSummary>> {
        let output = self
            .client
            .describe_stack_resources()
            .stack_name(stack_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(stack_id, &e))?;

        Ok(output
            .stack_resources()
            .iter()
            .map(|r| StackResourceSummary {
                logical_id: r.logical_resource_id().unwrap_or_default().to_string(),
                physical_id: r.physical_resource_id().map(String::from),
                resource_type: r.resource_type().unwrap_or_default().to_string(),
                status: r
                    .resource_status()
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_default(),
                status_reason: r.resource_status_reason().map(String::from),
            })
            .collect())
    }

    async fn create_stack(&self, input: CreateStackInput) -> Result<String> {
        info!("Submitting create for stack: {}", input.stack_name);

        let (template_body, template_url) = split_template(input.template);

        let output = self
            .client
            .create_stack()
            .stack_name(&input.stack_name)
            .set_template_body(template_body)
            .set_template_url(template_url)
            .set_parameters(Some(to_parameters(&input.parameters)))
            .set_tags(Some(to_tags(&input.tags)))
            .set_capabilities(Some(to_capabilities(&input.capabilities)))
            .set_role_arn(input.role_arn)
            .set_notification_arns(Some(input.notification_arns))
            .set_on_failure(input.on_failure.as_deref().map(OnFailure::from))
            .send()
            .await
            .map_err(|e| map_sdk_error(&input.stack_name, &e))?;

        output.stack_id().map(String::from).ok_or_else(|| {
            ProvisionError::InvalidResponse {
                message: String::from("CreateStack returned no stack ID"),
            }
            .into()
        })
    }

    async fn update_stack(&self, input: UpdateStackInput) -> Result<()> {
        info!("Submitting update for stack: {}", input.stack_name);

        let (template_body, template_url) = split_template(input.template);

        self.client
            .update_stack()
            .stack_name(&input.stack_name)
            .set_template_body(template_body)
            .set_template_url(template_url)
            .set_parameters(Some(to_parameters(&input.parameters)))
            .set_tags(Some(to_tags(&input.tags)))
            .set_capabilities(Some(to_capabilities(&input.capabilities)))
            .set_role_arn(input.role_arn)
            .set_notification_arns(Some(input.notification_arns))
            .send()
            .await
            .map_err(|e| map_sdk_error(&input.stack_name, &e))?;

        Ok(())
    }

    async fn delete_stack(&self, stack: &str) -> Result<()> {
        info!("Submitting delete for stack: {stack}");

        self.client
            .delete_stack()
            .stack_name(stack)
            .send()
            .await
            .map_err(|e| map_sdk_error(stack, &e))?;

        Ok(())
    }
}

/// Maps an SDK failure onto a typed provisioning error.
fn map_sdk_error<E, R>(stack: &str, err: &SdkError<E, R>) -> ProvisionError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            ProvisionError::network(DisplayErrorContext(err).to_string())
        }
        _ => classify_error(stack, err.code(), err.message().unwrap_or_default()),
    }
}

/// Classifies a service error by code and message.
fn classify_error(stack: &str, code: Option<&str>, message: &str) -> ProvisionError {
    if message.contains(NO_UPDATES_MESSAGE) {
        ProvisionError::NoUpdates {
            stack: stack.to_string(),
        }
    } else if message.contains(DOES_NOT_EXIST_MESSAGE) {
        ProvisionError::StackNotFound {
            stack: stack.to_string(),
        }
    } else if code == Some(THROTTLING_CODE) {
        ProvisionError::Throttled {
            message: message.to_string(),
        }
    } else {
        ProvisionError::api_error(code.unwrap_or("Unknown"), message)
    }
}

fn split_template(template: TemplateSource) -> (Option<String>, Option<String>) {
    match template {
        TemplateSource::Body(body) => (Some(body), None),
        TemplateSource::Url(url) => (None, Some(url)),
    }
}

fn to_parameters(parameters: &BTreeMap<String, String>) -> Vec<Parameter> {
    parameters
        .iter()
        .map(|(key, value)| {
            Parameter::builder()
                .parameter_key(key)
                .parameter_value(value)
                .build()
        })
        .collect()
}

fn to_tags(tags: &BTreeMap<String, String>) -> Vec<Tag> {
    tags.iter()
        .map(|(key, value)| Tag::builder().key(key).value(value).build())
        .collect()
}

fn to_capabilities(capabilities: &[String]) -> Vec<Capability> {
    capabilities
        .iter()
        .map(|c| Capability::from(c.as_str()))
        .collect()
}

fn to_datetime(value: Option<&AwsDateTime>) -> Option<DateTime<Utc>> {
    value.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
}

/// Converts an SDK stack description.
fn to_remote_stack(stack: &Stack) -> RemoteStack {
    RemoteStack {
        stack_id: stack.stack_id().unwrap_or_default().to_string(),
        stack_name: stack.stack_name().unwrap_or_default().to_string(),
        stack_status: stack
            .stack_status()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        creation_time: to_datetime(stack.creation_time()),
        last_updated_time: to_datetime(stack.last_updated_time()),
        outputs: stack
            .outputs()
            .iter()
            .filter_map(|o| Some((o.output_key()?.to_string(), o.output_value()?.to_string())))
            .collect(),
        tags: stack
            .tags()
            .iter()
            .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
            .collect(),
        role_arn: stack.role_arn().filter(|r| !r.is_empty()).map(String::from),
    }
}
