//! Bridge-backed implementation of the facade
//!
//! Every round trip goes through `round_trip`: publish the typed request,
//! await the correlated reply, then classify. A `FAULT` outcome becomes
//! `RemoteOperationFailed`; a success body of the wrong variant is a
//! protocol error; timeouts and transport failures propagate unchanged.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use usm_bridge::MessageBridge;
use usm_common::{
    ApplicationDescriptor, Context, Dataset, DatasetExtension, DatasetFilter, OperationAck,
    ReplyBody, RequestBody, ResponseBody, Result, UserContext, UserPreference, UsmError,
};

use crate::service::UsmService;

/// Reply deadline applied to every round trip
const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct UsmClientConfig {
    pub reply_timeout: Duration,
}

impl Default for UsmClientConfig {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }
}

pub struct UsmClient {
    bridge: Arc<MessageBridge>,
    config: UsmClientConfig,
}

impl UsmClient {
    pub fn new(bridge: Arc<MessageBridge>) -> Self {
        Self::with_config(bridge, UsmClientConfig::default())
    }

    pub fn with_config(bridge: Arc<MessageBridge>, config: UsmClientConfig) -> Self {
        Self { bridge, config }
    }

    async fn round_trip(&self, body: RequestBody) -> Result<ResponseBody> {
        match self.bridge.request(body, self.config.reply_timeout).await? {
            ReplyBody::Success(response) => Ok(response),
            ReplyBody::Fault(fault) => {
                error!(
                    code = fault.code,
                    message = %fault.message,
                    "remote service returned a fault"
                );
                Err((&fault).into())
            }
        }
    }

    /// Fetch the descriptor or fail when the application is unknown
    async fn require_application(&self, application_name: &str) -> Result<ApplicationDescriptor> {
        self.get_application_definition(application_name)
            .await?
            .ok_or_else(|| UsmError::ApplicationNotFound(application_name.to_string()))
    }
}

fn unexpected(expected: &str, got: &ResponseBody) -> UsmError {
    UsmError::protocol(format!("expected {} reply, got {}", expected, got.kind()))
}

fn require_ok(ack: &OperationAck, operation: &str) -> Result<()> {
    if ack.is_ok() {
        Ok(())
    } else {
        Err(UsmError::RemoteOperationFailed {
            code: 0,
            message: format!("{} rejected by remote service: {}", operation, ack.response),
        })
    }
}

#[async_trait]
impl UsmService for UsmClient {
    async fn get_application_definition(
        &self,
        application_name: &str,
    ) -> Result<Option<ApplicationDescriptor>> {
        debug!(application = %application_name, "fetching application definition");
        let response = self
            .round_trip(RequestBody::GetDeploymentDescriptor {
                application_name: application_name.to_string(),
            })
            .await?;
        match response {
            ResponseBody::DeploymentDescriptor { application } => Ok(application),
            other => Err(unexpected("DEPLOYMENT_DESCRIPTOR", &other)),
        }
    }

    async fn deploy_application(&self, descriptor: &ApplicationDescriptor) -> Result<()> {
        debug!(application = %descriptor.name, "deploying application descriptor");
        let response = self
            .round_trip(RequestBody::DeployApplication {
                application: descriptor.clone(),
            })
            .await?;
        match response {
            ResponseBody::DeployAck(ack) => {
                require_ok(&ack, "deploy")?;
                info!(application = %descriptor.name, "application registered with remote service");
                Ok(())
            }
            other => Err(unexpected("DEPLOY_ACK", &other)),
        }
    }

    async fn redeploy_application(&self, descriptor: &ApplicationDescriptor) -> Result<()> {
        debug!(application = %descriptor.name, "redeploying application descriptor");
        let response = self
            .round_trip(RequestBody::RedeployApplication {
                application: descriptor.clone(),
            })
            .await?;
        match response {
            ResponseBody::RedeployAck(ack) => {
                require_ok(&ack, "redeploy")?;
                info!(application = %descriptor.name, "application re-registered with remote service");
                Ok(())
            }
            other => Err(unexpected("REDEPLOY_ACK", &other)),
        }
    }

    async fn get_option_default_value(
        &self,
        option_name: &str,
        application_name: &str,
    ) -> Result<Option<String>> {
        let application = self.require_application(application_name).await?;
        Ok(application
            .option_default_value(option_name)
            .map(str::to_string))
    }

    async fn set_option_default_value(
        &self,
        key: &str,
        value: &str,
        application_name: &str,
    ) -> Result<()> {
        let mut application = self.require_application(application_name).await?;
        application.set_option(key, value);
        self.redeploy_application(&application).await
    }

    async fn get_full_user_context(
        &self,
        username: &str,
        application_name: &str,
    ) -> Result<UserContext> {
        debug!(user = %username, application = %application_name, "fetching user context");
        let response = self
            .round_trip(RequestBody::GetUserContext {
                application_name: application_name.to_string(),
                username: username.to_string(),
            })
            .await?;
        match response {
            ResponseBody::UserContext { context } => Ok(context),
            other => Err(unexpected("USER_CONTEXT", &other)),
        }
    }

    async fn get_user_context(
        &self,
        username: &str,
        application_name: &str,
        role: &str,
        scope: &str,
    ) -> Result<Context> {
        let full_context = self.get_full_user_context(username, application_name).await?;
        full_context
            .matching_context(role, scope)
            .cloned()
            .ok_or_else(|| UsmError::ContextNotFound {
                username: username.to_string(),
                role: role.to_string(),
                scope: (!scope.trim().is_empty()).then(|| scope.to_string()),
            })
    }

    async fn get_user_preference(
        &self,
        preference_name: &str,
        username: &str,
        application_name: &str,
        role: &str,
        scope: &str,
    ) -> Result<Option<String>> {
        let context = self
            .get_user_context(username, application_name, role, scope)
            .await?;
        Ok(context.preference_value(preference_name).map(str::to_string))
    }

    async fn put_user_preference(&self, preference: UserPreference) -> Result<()> {
        let response = self
            .round_trip(RequestBody::PutPreference { preference })
            .await?;
        match response {
            ResponseBody::PreferenceAck(ack) => {
                debug!(response = %ack.response, "preference stored");
                Ok(())
            }
            other => Err(unexpected("PREFERENCE_ACK", &other)),
        }
    }

    async fn get_datasets_per_category(
        &self,
        category: &str,
        username: &str,
        application_name: &str,
        role: &str,
        scope: &str,
    ) -> Result<Vec<Dataset>> {
        let context = self
            .get_user_context(username, application_name, role, scope)
            .await?;
        Ok(context
            .datasets_per_category(category)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn create_dataset(
        &self,
        application_name: &str,
        dataset_name: &str,
        discriminator: Option<&str>,
        category: Option<&str>,
        description: Option<&str>,
    ) -> Result<()> {
        if application_name.is_empty() || dataset_name.is_empty() {
            return Err(UsmError::validation(
                "application name and dataset name are required",
            ));
        }
        let response = self
            .round_trip(RequestBody::CreateDataset {
                dataset: DatasetExtension {
                    application_name: application_name.to_string(),
                    name: dataset_name.to_string(),
                    category: category.map(str::to_string),
                    discriminator: discriminator.map(str::to_string),
                    description: description.map(str::to_string),
                },
            })
            .await?;
        match response {
            ResponseBody::DatasetAck(ack) => {
                debug!(dataset = %dataset_name, response = %ack.response, "dataset created");
                Ok(())
            }
            other => Err(unexpected("DATASET_ACK", &other)),
        }
    }

    async fn delete_dataset(&self, application_name: &str, dataset_name: &str) -> Result<()> {
        let response = self
            .round_trip(RequestBody::DeleteDataset {
                application_name: application_name.to_string(),
                dataset_name: dataset_name.to_string(),
            })
            .await?;
        match response {
            ResponseBody::DatasetAck(ack) => {
                debug!(dataset = %dataset_name, response = %ack.response, "dataset deleted");
                Ok(())
            }
            other => Err(unexpected("DATASET_ACK", &other)),
        }
    }

    async fn find_datasets_by_discriminator(
        &self,
        application_name: &str,
        discriminator: &str,
    ) -> Result<Vec<DatasetExtension>> {
        let response = self
            .round_trip(RequestBody::FindDataset {
                filter: DatasetFilter {
                    application_name: application_name.to_string(),
                    discriminator: discriminator.to_string(),
                },
            })
            .await?;
        match response {
            ResponseBody::Datasets { datasets } => Ok(datasets),
            other => Err(unexpected("DATASETS", &other)),
        }
    }

    async fn get_user_features(
        &self,
        username: &str,
        application_name: &str,
        role: &str,
        scope: &str,
    ) -> Result<HashSet<String>> {
        let context = self
            .get_user_context(username, application_name, role, scope)
            .await?;
        Ok(context.feature_names())
    }
}
