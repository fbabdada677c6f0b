//! The facade seam consumed by REST resources and the bootstrap initializer

use std::collections::HashSet;

use async_trait::async_trait;

use usm_common::{
    ApplicationDescriptor, Context, Dataset, DatasetExtension, Result, UserContext, UserPreference,
};

/// Typed operations against the remote administrative service
#[async_trait]
pub trait UsmService: Send + Sync {
    /// Fetch the registered deployment descriptor; `None` when the
    /// application is unknown to the remote service
    async fn get_application_definition(
        &self,
        application_name: &str,
    ) -> Result<Option<ApplicationDescriptor>>;

    /// Register the application descriptor for the first time
    async fn deploy_application(&self, descriptor: &ApplicationDescriptor) -> Result<()>;

    /// Replace the registered descriptor wholesale
    async fn redeploy_application(&self, descriptor: &ApplicationDescriptor) -> Result<()>;

    /// Default value of a configured option, matched case-insensitively
    /// over the fetched descriptor
    async fn get_option_default_value(
        &self,
        option_name: &str,
        application_name: &str,
    ) -> Result<Option<String>>;

    /// Read-modify-write: update (exact name) or append the option in the
    /// fetched descriptor, then redeploy the whole descriptor. The remote
    /// protocol has no partial-field update.
    async fn set_option_default_value(
        &self,
        key: &str,
        value: &str,
        application_name: &str,
    ) -> Result<()>;

    /// Every context the remote service holds for the user in this
    /// application
    async fn get_full_user_context(
        &self,
        username: &str,
        application_name: &str,
    ) -> Result<UserContext>;

    /// The single context matching role (case-insensitive) and scope
    /// (case-insensitive, only checked when non-blank)
    async fn get_user_context(
        &self,
        username: &str,
        application_name: &str,
        role: &str,
        scope: &str,
    ) -> Result<Context>;

    async fn get_user_preference(
        &self,
        preference_name: &str,
        username: &str,
        application_name: &str,
        role: &str,
        scope: &str,
    ) -> Result<Option<String>>;

    async fn put_user_preference(&self, preference: UserPreference) -> Result<()>;

    /// Datasets of the matched context's scope, filtered by category
    async fn get_datasets_per_category(
        &self,
        category: &str,
        username: &str,
        application_name: &str,
        role: &str,
        scope: &str,
    ) -> Result<Vec<Dataset>>;

    async fn create_dataset(
        &self,
        application_name: &str,
        dataset_name: &str,
        discriminator: Option<&str>,
        category: Option<&str>,
        description: Option<&str>,
    ) -> Result<()>;

    async fn delete_dataset(&self, application_name: &str, dataset_name: &str) -> Result<()>;

    async fn find_datasets_by_discriminator(
        &self,
        application_name: &str,
        discriminator: &str,
    ) -> Result<Vec<DatasetExtension>>;

    /// Names of the features granted by the matched context's role
    async fn get_user_features(
        &self,
        username: &str,
        application_name: &str,
        role: &str,
        scope: &str,
    ) -> Result<HashSet<String>>;
}
