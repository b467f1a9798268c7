//! Reconciliation errors.

use thiserror::Error;

use crate::instance::BoxError;

/// Errors returned by the manager.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Endpoints were set for a service the manager does not know.
    #[error("service {0} does not exist")]
    ServiceNotFound(String),

    #[error("failed to add service {service}: {source}")]
    AddService {
        service: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to delete service {service}: {source}")]
    DeleteService {
        service: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to add flow {flow}: {source}")]
    AddFlow {
        flow: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to delete flow {flow}: {source}")]
    DeleteFlow {
        flow: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to add target {endpoint} (slot {slot}) to service {service}: {source}")]
    AddTarget {
        service: String,
        endpoint: String,
        slot: u32,
        #[source]
        source: BoxError,
    },

    #[error("failed to delete target {endpoint} (slot {slot}) from service {service}: {source}")]
    DeleteTarget {
        service: String,
        endpoint: String,
        slot: u32,
        #[source]
        source: BoxError,
    },

    /// Every slot of the service is held by another endpoint.
    #[error("no free slot for endpoint {endpoint} in service {service} (max {max_targets})")]
    Capacity {
        service: String,
        endpoint: String,
        max_targets: u32,
    },

    /// The pre-assigned slot is out of range or already held.
    #[error("slot {slot} requested by endpoint {endpoint} in service {service} is unavailable")]
    SlotUnavailable {
        service: String,
        endpoint: String,
        slot: u32,
    },

    /// Several units failed within one call.
    #[error("{}", join_errors(.0))]
    Aggregate(Vec<ReconcileError>),
}

fn join_errors(errors: &[ReconcileError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ReconcileError {
    /// Collapse per-unit failures into one result.
    pub fn from_errors(mut errors: Vec<ReconcileError>) -> Result<(), ReconcileError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ReconcileError::Aggregate(errors)),
        }
    }

    /// Flattened list of the individual failures.
    pub fn errors(&self) -> Vec<&ReconcileError> {
        match self {
            ReconcileError::Aggregate(errors) => errors.iter().flat_map(|e| e.errors()).collect(),
            other => vec![other],
        }
    }

    /// Returns true for failures caused by exhausted slot capacity.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            ReconcileError::Capacity { .. } | ReconcileError::SlotUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_errors() {
        assert!(ReconcileError::from_errors(vec![]).is_ok());

        let single = ReconcileError::from_errors(vec![ReconcileError::ServiceNotFound(
            "svc-a".to_string(),
        )])
        .unwrap_err();
        assert!(matches!(single, ReconcileError::ServiceNotFound(_)));

        let aggregate = ReconcileError::from_errors(vec![
            ReconcileError::ServiceNotFound("svc-a".to_string()),
            ReconcileError::Capacity {
                service: "svc-b".to_string(),
                endpoint: "uid-3".to_string(),
                max_targets: 2,
            },
        ])
        .unwrap_err();

        assert_eq!(aggregate.errors().len(), 2);
        assert_eq!(
            aggregate.to_string(),
            "service svc-a does not exist; no free slot for endpoint uid-3 in service svc-b (max 2)"
        );
    }
}
