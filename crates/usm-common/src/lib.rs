use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ============================================================================
// Correlation
// ============================================================================

/// Per-request token used to match an asynchronous reply to its originating
/// call. Generated at publish time, owned by exactly one pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(uuid::Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// ============================================================================
// Wire Envelopes
// ============================================================================

/// Outbound request envelope sent to the administrative service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub correlation_id: CorrelationId,
    pub sent_at: DateTime<Utc>,
    pub body: RequestBody,
}

impl MessageEnvelope {
    pub fn new(body: RequestBody) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            sent_at: Utc::now(),
            body,
        }
    }
}

/// One variant per administrative action exposed by the remote service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestBody {
    GetDeploymentDescriptor {
        application_name: String,
    },
    DeployApplication {
        application: ApplicationDescriptor,
    },
    RedeployApplication {
        application: ApplicationDescriptor,
    },
    GetUserContext {
        application_name: String,
        username: String,
    },
    PutPreference {
        preference: UserPreference,
    },
    CreateDataset {
        dataset: DatasetExtension,
    },
    DeleteDataset {
        application_name: String,
        dataset_name: String,
    },
    FindDataset {
        filter: DatasetFilter,
    },
}

/// Inbound reply envelope; `body` carries the success/fault discriminator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub correlation_id: CorrelationId,
    pub body: ReplyBody,
}

/// Success or fault, distinguished by an explicit `outcome` tag rather than
/// by which shape happens to decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", content = "body", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyBody {
    Success(ResponseBody),
    Fault(ServiceFault),
}

/// One variant per success shape the remote service can return
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseBody {
    /// `application` is absent when the queried name is not registered
    DeploymentDescriptor {
        application: Option<ApplicationDescriptor>,
    },
    DeployAck(OperationAck),
    RedeployAck(OperationAck),
    UserContext {
        context: UserContext,
    },
    PreferenceAck(OperationAck),
    DatasetAck(OperationAck),
    Datasets {
        datasets: Vec<DatasetExtension>,
    },
}

impl ResponseBody {
    /// Stable variant label, used when a reply has an unexpected shape
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeploymentDescriptor { .. } => "DEPLOYMENT_DESCRIPTOR",
            Self::DeployAck(_) => "DEPLOY_ACK",
            Self::RedeployAck(_) => "REDEPLOY_ACK",
            Self::UserContext { .. } => "USER_CONTEXT",
            Self::PreferenceAck(_) => "PREFERENCE_ACK",
            Self::DatasetAck(_) => "DATASET_ACK",
            Self::Datasets { .. } => "DATASETS",
        }
    }
}

/// Acknowledgement body for write operations; "OK" means accepted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationAck {
    pub response: String,
}

impl OperationAck {
    pub fn ok() -> Self {
        Self {
            response: "OK".to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.response.eq_ignore_ascii_case("OK")
    }
}

/// Explicit error payload returned by the remote service in place of a
/// success body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceFault {
    pub code: i32,
    pub message: String,
}

// ============================================================================
// Application Descriptor
// ============================================================================

/// Structured definition of an application's deployment: its name plus the
/// configurable options it registers with the remote service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub options: Vec<OptionDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptionDefinition {
    pub name: String,
    pub default_value: String,
}

impl ApplicationDescriptor {
    /// Default value of the named option, matched case-insensitively
    pub fn option_default_value(&self, option_name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|opt| opt.name.eq_ignore_ascii_case(option_name))
            .map(|opt| opt.default_value.as_str())
    }

    /// Update an existing option by exact name, or append a new one.
    /// Applying the same key/value twice leaves a single entry.
    pub fn set_option(&mut self, name: &str, default_value: &str) {
        for opt in &mut self.options {
            if opt.name == name {
                opt.default_value = default_value.to_string();
                return;
            }
        }
        self.options.push(OptionDefinition {
            name: name.to_string(),
            default_value: default_value.to_string(),
        });
    }
}

// ============================================================================
// User Context
// ============================================================================

/// Everything the remote service knows about a user within one application:
/// all role/scope contexts, each with its preferences.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub contexts: Vec<Context>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Context {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub preferences: Vec<Preference>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scope {
    pub name: String,
    #[serde(default)]
    pub datasets: Vec<Dataset>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Preference {
    pub option_name: String,
    pub option_value: String,
}

impl UserContext {
    /// First context matching the requested role and scope, if any
    pub fn matching_context(&self, role: &str, scope: &str) -> Option<&Context> {
        self.contexts.iter().find(|ctx| ctx.matches(role, scope))
    }
}

impl Context {
    /// Role names match case-insensitively. A non-blank requested scope must
    /// match the context scope case-insensitively; a context without a scope
    /// never satisfies a scope-qualified lookup.
    pub fn matches(&self, role: &str, scope: &str) -> bool {
        if !self.role.name.eq_ignore_ascii_case(role) {
            return false;
        }
        if scope.trim().is_empty() {
            return true;
        }
        match &self.scope {
            Some(ctx_scope) => ctx_scope.name.eq_ignore_ascii_case(scope),
            None => false,
        }
    }

    /// Value of the named preference; preference names are case-sensitive
    pub fn preference_value(&self, preference_name: &str) -> Option<&str> {
        self.preferences
            .iter()
            .find(|pref| pref.option_name == preference_name)
            .map(|pref| pref.option_value.as_str())
    }

    /// Datasets of this context's scope filtered by category
    /// (case-insensitive); empty when the context has no scope
    pub fn datasets_per_category(&self, category: &str) -> Vec<&Dataset> {
        match &self.scope {
            Some(scope) => scope
                .datasets
                .iter()
                .filter(|ds| ds.category.eq_ignore_ascii_case(category))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Names of the features granted by this context's role
    pub fn feature_names(&self) -> HashSet<String> {
        self.role.features.iter().cloned().collect()
    }
}

// ============================================================================
// Datasets & Preferences
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dataset {
    pub name: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Dataset qualified with the owning application, as exchanged on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetExtension {
    pub application_name: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetFilter {
    pub application_name: String,
    pub discriminator: String,
}

/// Write shape for storing a user preference
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserPreference {
    pub application_name: String,
    pub option_name: String,
    pub option_value: String,
    pub scope_name: String,
    pub role_name: String,
    pub username: String,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum UsmError {
    #[error("timed out waiting for reply to message {correlation_id}")]
    Timeout { correlation_id: CorrelationId },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote operation failed with code {code}: {message}")]
    RemoteOperationFailed { code: i32, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("local configuration error: {0}")]
    LocalConfiguration(String),

    #[error("correlation id {0} is already registered")]
    DuplicateCorrelation(CorrelationId),

    #[error("no context found for user {username} with role {role} and scope {scope:?}")]
    ContextNotFound {
        username: String,
        role: String,
        scope: Option<String>,
    },

    #[error("application {0} is not registered with the remote service")]
    ApplicationNotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl UsmError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn local_configuration(message: impl Into<String>) -> Self {
        Self::LocalConfiguration(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Transient failure classes the bootstrap initializer may retry.
    /// Everything else is either a caller problem or a local defect.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Transport(_) | Self::RemoteOperationFailed { .. }
        )
    }
}

impl From<&ServiceFault> for UsmError {
    fn from(fault: &ServiceFault) -> Self {
        Self::RemoteOperationFailed {
            code: fault.code,
            message: fault.message.clone(),
        }
    }
}

pub type Result<T> = std::result::Result<T, UsmError>;
