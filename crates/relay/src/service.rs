//! Registration service: the calls the HTTP layer makes.

use tracing::{debug, instrument};
use triggers::{RegisteredTrigger, RelayError, SubscriptionRequest, ValidationErrors, WorkflowId};

use crate::registry::TriggerRegistry;

/// Which workflow ids this process accepts registrations for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScopePolicy {
    /// Any workflow id.
    #[default]
    Unrestricted,
    /// Only workflow ids whose scope segment (the third `/`-separated part)
    /// equals this value.
    LimitTo(String),
}

impl ScopePolicy {
    fn admits(&self, workflow_id: &WorkflowId) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::LimitTo(scope) => workflow_id.scope_segment() == Some(scope.as_str()),
        }
    }
}

/// Thin orchestration over the registry: scope check, validation, delegation.
#[derive(Clone)]
pub struct RegistrationService {
    registry: TriggerRegistry,
    scope: ScopePolicy,
}

impl RegistrationService {
    pub fn new(registry: TriggerRegistry, scope: ScopePolicy) -> Self {
        Self { registry, scope }
    }

    pub fn registry(&self) -> &TriggerRegistry {
        &self.registry
    }

    /// Creates or replaces a trigger.
    ///
    /// The scope check and validation both happen before the registry is
    /// touched.
    #[instrument(skip_all, fields(workflow_id = %request.owner.workflow_id))]
    pub async fn subscribe(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<RegisteredTrigger, RelayError> {
        // An empty id is reported by validation instead.
        if let Some(workflow_id) = WorkflowId::new(request.owner.workflow_id.trim()) {
            if !self.scope.admits(&workflow_id) {
                debug!(scope = ?self.scope, "workflow id outside configured scope");
                return Err(RelayError::ScopeMismatch { workflow_id });
            }
        }

        let record = request
            .validate(self.registry.config().default_connection_string.as_ref())
            .map_err(RelayError::Validation)?;
        self.registry.register(record).await
    }

    /// Removes a trigger. An empty id is a validation error.
    pub async fn unsubscribe(&self, workflow_id: &str) -> Result<(), RelayError> {
        let Some(id) = WorkflowId::new(workflow_id.trim()) else {
            return Err(RelayError::Validation(ValidationErrors::single(
                "WorkflowId",
                "a workflow id is required",
            )));
        };
        self.registry.unregister(&id).await
    }

    pub fn list(&self) -> Vec<RegisteredTrigger> {
        self.registry.list_all()
    }
}
