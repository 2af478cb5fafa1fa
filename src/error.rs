// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::cloud::CloudError;
use thiserror::Error;

/// Broad failure classes that decide how the controller requeues a failed pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed desired state; reported and parked until the Service changes
    Validation,
    /// Throttling, timeouts and eventual-consistency lag; retried with backoff
    Transient,
    /// Some sub-step failed after an earlier one succeeded; retried with backoff
    PartialFailure,
    /// A resource exists that we do not own; reported, never adopted
    Conflict,
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Cloud backend error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Invalid load balancer configuration: {0}")]
    Validation(String),

    #[error("Ownership conflict: {0}")]
    Conflict(String),

    #[error("Instance lookup failed for node {node}: {message}")]
    InstanceLookup { node: String, message: String },

    #[error("Reconciliation partially failed: {0}")]
    PartialFailure(String),

    #[error("Deletion still in progress: {0}")]
    DeletionPending(String),

    #[error("Controller is shutting down")]
    ShuttingDown,
}

impl ControllerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ControllerError::Validation(_) => ErrorClass::Validation,
            ControllerError::Conflict(_) => ErrorClass::Conflict,
            ControllerError::PartialFailure(_) => ErrorClass::PartialFailure,
            ControllerError::Cloud(CloudError::InvalidRequest(_)) => ErrorClass::Validation,
            _ => ErrorClass::Transient,
        }
    }

    /// Terminal errors are not retried until the Service spec changes
    pub fn is_terminal(&self) -> bool {
        matches!(self.class(), ErrorClass::Validation | ErrorClass::Conflict)
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_is_terminal() {
        let err = ControllerError::Validation("bad kind".to_string());
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(err.is_terminal());
    }

    #[test]
    fn test_conflict_is_terminal() {
        assert!(ControllerError::Conflict("foreign lb".to_string()).is_terminal());
    }

    #[test]
    fn test_throttling_is_transient() {
        let err = ControllerError::from(CloudError::Throttled("rate exceeded".to_string()));
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_partial_failure_is_retried() {
        let err = ControllerError::PartialFailure("1 deregistration failed".to_string());
        assert_eq!(err.class(), ErrorClass::PartialFailure);
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_rejected_request_is_validation() {
        let err = ControllerError::from(CloudError::InvalidRequest("bad subnet".to_string()));
        assert!(err.is_terminal());
    }
}
