use thiserror::Error;

use crate::approvals::ApprovalError;
use crate::domain::policy::PolicyValidationError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    InvalidPolicy(#[from] PolicyValidationError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<ApprovalError> for ApplicationError {
    fn from(value: ApprovalError) -> Self {
        Self::Domain(DomainError::Approval(value))
    }
}

impl From<PolicyValidationError> for ApplicationError {
    fn from(value: PolicyValidationError) -> Self {
        Self::Domain(DomainError::InvalidPolicy(value))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Conflict { .. } => "The item was already decided or changed by someone else.",
            Self::NotFound { .. } => "The requested approval or policy does not exist.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = || "unassigned".to_owned();
        match value {
            ApplicationError::Domain(DomainError::Approval(error)) => {
                let message = error.to_string();
                match error {
                    ApprovalError::AlreadyDecided { .. }
                    | ApprovalError::ActiveInstanceExists { .. } => {
                        Self::Conflict { message, correlation_id: unassigned() }
                    }
                    ApprovalError::PolicyNotFound { .. }
                    | ApprovalError::InstanceNotFound { .. }
                    | ApprovalError::WorkItemNotFound { .. } => {
                        Self::NotFound { message, correlation_id: unassigned() }
                    }
                    ApprovalError::HierarchyResolutionFailed { .. } => {
                        Self::ServiceUnavailable { message, correlation_id: unassigned() }
                    }
                    _ => Self::BadRequest { message, correlation_id: unassigned() },
                }
            }
            ApplicationError::Domain(DomainError::InvalidPolicy(error)) => {
                Self::BadRequest { message: error.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::Domain(DomainError::InvariantViolation(_)) => Self::BadRequest {
                message: "domain validation failed".to_owned(),
                correlation_id: unassigned(),
            },
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: unassigned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::approvals::ApprovalError;
    use crate::domain::instance::InstanceId;
    use crate::errors::{ApplicationError, DomainError, InterfaceError};

    #[test]
    fn domain_error_maps_to_bad_request_interface_error() {
        let interface = ApplicationError::from(DomainError::InvariantViolation(
            "missing required field".to_owned(),
        ))
        .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn self_approval_is_a_bad_request() {
        let interface = ApplicationError::from(ApprovalError::SelfApprovalForbidden {
            instance_id: InstanceId("inst-1".to_owned()),
            actor_id: "u-sam".to_owned(),
        })
        .into_interface("req-2");

        assert!(matches!(interface, InterfaceError::BadRequest { .. }));
        assert_eq!(interface.correlation_id(), "req-2");
    }

    #[test]
    fn already_decided_escaping_the_service_maps_to_conflict() {
        let interface = ApplicationError::from(ApprovalError::AlreadyDecided {
            instance_id: InstanceId("inst-1".to_owned()),
            level: 1,
        })
        .into_interface("req-3");

        assert!(matches!(interface, InterfaceError::Conflict { .. }));
    }

    #[test]
    fn missing_instance_maps_to_not_found() {
        let interface = ApplicationError::from(ApprovalError::InstanceNotFound {
            instance_id: InstanceId("inst-404".to_owned()),
        })
        .into_interface("req-4");

        assert!(matches!(interface, InterfaceError::NotFound { .. }));
    }

    #[test]
    fn hierarchy_outage_and_persistence_map_to_service_unavailable() {
        let hierarchy = ApplicationError::from(ApprovalError::HierarchyResolutionFailed {
            reason: "directory timeout".to_owned(),
        })
        .into_interface("req-5");
        let persistence = ApplicationError::Persistence("database lock timeout".to_owned())
            .into_interface("req-6");

        assert!(matches!(hierarchy, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(
            persistence.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }

    #[test]
    fn configuration_error_maps_to_internal() {
        let interface = ApplicationError::Configuration("invalid breach threshold".to_owned())
            .into_interface("req-7");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert_eq!(interface.user_message(), "An unexpected internal error occurred.");
    }
}
