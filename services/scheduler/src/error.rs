//! Error types for the scheduler.

use shepherd_coord::CoordError;
use shepherd_id::{InstanceId, ServiceId};
use thiserror::Error;

/// Result type for record access.
pub type RecordResult<T> = Result<T, RecordError>;

/// Result type for reconciliation operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors reading or writing records.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Coord(#[from] CoordError),

    /// A stored payload is not a valid record.
    #[error("failed to decode record at {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),
}

impl RecordError {
    /// Returns true if the record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Coord(e) if e.is_no_node())
    }

    /// Returns true for a lost compare-and-set.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Coord(CoordError::BadVersion { .. }))
    }
}

/// Errors from a [`HostSelector`](crate::selector::HostSelector).
#[derive(Debug, Error)]
pub enum SelectError {
    /// No host can take an instance of the service.
    #[error("no eligible hosts for service {0}")]
    NoEligibleHosts(ServiceId),

    #[error(transparent)]
    Records(#[from] RecordError),
}

/// Errors from the reconciliation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Placement found no host for a new instance.
    #[error("no host available for service {0}")]
    NoHost(ServiceId),

    #[error(transparent)]
    Records(#[from] RecordError),

    /// Lock acquisition or release failed.
    #[error("instance lock: {0}")]
    Lock(#[source] CoordError),

    /// The service record disappeared while instances were being started.
    #[error("service {0} no longer exists")]
    ServiceGone(ServiceId),

    /// An instance's host record kept changing under a compare-and-set.
    #[error("instance {0} host record is contended")]
    Contended(InstanceId),

    /// Several per-instance operations of one batch failed.
    #[error("{failed} operations failed, first: {first}")]
    Batch {
        failed: usize,
        #[source]
        first: Box<EngineError>,
    },
}

impl From<SelectError> for EngineError {
    fn from(err: SelectError) -> Self {
        match err {
            SelectError::NoEligibleHosts(service_id) => Self::NoHost(service_id),
            SelectError::Records(e) => Self::Records(e),
        }
    }
}

impl EngineError {
    /// Number of underlying failures this error stands for.
    pub fn failures(&self) -> usize {
        match self {
            Self::Batch { failed, .. } => *failed,
            _ => 1,
        }
    }

    fn into_first(self) -> EngineError {
        match self {
            Self::Batch { first, .. } => *first,
            other => other,
        }
    }

    /// Fold per-instance failures into one result.
    pub(crate) fn collect(errors: Vec<EngineError>) -> EngineResult<()> {
        let failed: usize = errors.iter().map(EngineError::failures).sum();
        let mut errors = errors.into_iter();
        match errors.next() {
            None => Ok(()),
            Some(first) if failed == 1 => Err(first),
            Some(first) => Err(Self::Batch {
                failed,
                first: Box::new(first.into_first()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc() -> ServiceId {
        ServiceId::parse("web").unwrap()
    }

    #[test]
    fn test_no_eligible_hosts_maps_to_no_host() {
        let err = EngineError::from(SelectError::NoEligibleHosts(svc()));
        assert!(matches!(err, EngineError::NoHost(id) if id == svc()));
    }

    #[test]
    fn test_collect_empty_is_ok() {
        assert!(EngineError::collect(Vec::new()).is_ok());
    }

    #[test]
    fn test_collect_single_is_unwrapped() {
        let err = EngineError::collect(vec![EngineError::NoHost(svc())]).unwrap_err();
        assert!(matches!(err, EngineError::NoHost(_)));
    }

    #[test]
    fn test_collect_flattens_batches() {
        let inner = EngineError::Batch {
            failed: 3,
            first: Box::new(EngineError::ServiceGone(svc())),
        };
        let err = EngineError::collect(vec![inner, EngineError::NoHost(svc())]).unwrap_err();
        match err {
            EngineError::Batch { failed, first } => {
                assert_eq!(failed, 4);
                assert!(matches!(*first, EngineError::ServiceGone(_)));
            }
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[test]
    fn test_not_found() {
        let err = RecordError::from(CoordError::NoNode("/services/web".into()));
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
    }
}
