pub mod auth;
pub mod catalog;
pub mod config;
pub mod content;
pub mod engine;
pub mod http;
pub mod injectable;
pub mod lifecycle;
pub mod provider;
pub mod registry;
pub mod render;
pub mod resolver;
pub mod store;
pub mod template;
pub mod tenancy;
pub mod validator;

use crate::template::VersionState;
use crate::validator::ValidationReport;

/// A specialized result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur during engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A request or entity field failed validation.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The request carried no usable credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The authenticated identity may not perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// The bearer token could not be verified.
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// The bearer token is past its expiration.
    #[error("token expired")]
    TokenExpired,
    /// The version is not in a state that permits the edit.
    #[error("cannot edit version in state {0}")]
    CannotEditInState(VersionState),
    /// The version has already been published.
    #[error("version already published")]
    VersionAlreadyPublished,
    /// A schedule was requested for a non-future instant.
    #[error("scheduled time is in the past")]
    ScheduledTimeInPast,
    /// Another version of the same template is already scheduled at that instant.
    #[error("another version is scheduled at the same time")]
    ScheduledTimeConflict,
    /// Removing the workspace's last OWNER member was refused.
    #[error("cannot remove the last owner of a workspace")]
    CannotRemoveOwner,
    /// A concurrent writer won the state transition.
    #[error("concurrent modification detected")]
    OptimisticLock,
    /// Another template of the same workspace and classification already
    /// has a published version.
    #[error("classification `{0}` already has a published template in this workspace")]
    ClassificationConflict(String),
    /// Externally sourced injectables were neither supplied nor resolvable.
    #[error("missing required injectables: {}", .0.join(", "))]
    MissingInjectables(Vec<String>),
    /// The injector dependency graph contains a cycle.
    #[error("circular injector dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),
    /// A critical injector failed to produce a value.
    #[error("critical injector `{code}` failed: {cause}")]
    CriticalInjectorFailed { code: String, cause: String },
    /// The registered request mapper rejected the raw body.
    #[error("request mapping failed: {0}")]
    MappingFailed(String),
    /// A workspace-provider code collides with a registry code.
    #[error("injectable code collision: `{0}`")]
    CodeCollision(String),
    /// An injector was registered twice under the same code.
    #[error("duplicate injector code: `{0}`")]
    DuplicateCode(String),
    /// The portable document failed content validation.
    #[error("content validation failed: {} error(s)", .0.errors.len())]
    ContentValidation(ValidationReport),
    /// A publish was attempted on a version with no content.
    #[error("version content is empty")]
    EmptyContent,
    /// The render admission controller is saturated.
    #[error("renderer busy")]
    Busy,
    /// The typesetter binary is absent or not executable.
    #[error("typesetter binary unavailable: {0}")]
    TypesetterMissing(String),
    /// The typesetter subprocess exceeded its deadline and was killed.
    #[error("typesetter timed out")]
    TypesetterTimeout,
    /// The typesetter subprocess exited non-zero.
    #[error("typesetter failed: {0}")]
    Typesetter(String),
    /// The request was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,
    /// OIDC provider metadata or key material could not be obtained.
    #[error("provider metadata unavailable: {0}")]
    ProviderMetadata(String),
    #[error("tenant `{0}` not found")]
    TenantNotFound(String),
    #[error("workspace `{0}` not found")]
    WorkspaceNotFound(String),
    #[error("document classification `{0}` not found")]
    ClassificationNotFound(String),
    #[error("template `{0}` not found")]
    TemplateNotFound(String),
    #[error("template version `{0}` not found")]
    VersionNotFound(String),
    #[error("injectable `{0}` not found")]
    InjectableNotFound(String),
    #[error("user `{0}` not found")]
    UserNotFound(String),
    /// An I/O error occurred (e.g., temp workdir creation failed).
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A database query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Configuration could not be loaded or deserialized.
    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
    /// The injector catalog file could not be parsed.
    #[error("catalog error: {0}")]
    Catalog(String),
    /// An unexpected internal failure (task join, poisoned state).
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// True for errors surfaced to clients as conflicts (HTTP 409).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::CannotEditInState(_)
                | EngineError::VersionAlreadyPublished
                | EngineError::ScheduledTimeInPast
                | EngineError::ScheduledTimeConflict
                | EngineError::CannotRemoveOwner
                | EngineError::OptimisticLock
                | EngineError::ClassificationConflict(_)
        )
    }
}
