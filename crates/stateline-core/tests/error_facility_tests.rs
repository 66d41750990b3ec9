#![allow(clippy::unwrap_used, clippy::expect_used)]

use stateline_core::errors::{ErrorKind, SlError, StatelineError};

#[test]
fn test_not_found_verifiable_by_kind() {
    let err = StatelineError::ObjectNotFound {
        identity: "Person#7".to_string(),
    };

    let sl_err: SlError = err.into();

    assert_eq!(sl_err.kind(), ErrorKind::NotFound);
    assert_eq!(sl_err.code(), "ERR_NOT_FOUND");
    assert_eq!(sl_err.identity(), Some("Person#7"));
}

#[test]
fn test_stale_reference_distinct_from_wrong_context() {
    let stale: SlError = StatelineError::StaleObjectRef { slot: 3 }.into();
    let foreign: SlError = StatelineError::WrongContext {
        expected: "ctx_1".to_string(),
        actual: "ctx_2".to_string(),
    }
    .into();

    assert_eq!(stale.kind(), ErrorKind::StaleReference);
    assert_eq!(foreign.kind(), ErrorKind::WrongContext);
    assert_ne!(stale.code(), foreign.code());
    assert!(foreign.message().contains("ctx_2"));
}

#[test]
fn test_optimistic_aggregate_keeps_nested_failures() {
    let err = StatelineError::OptimisticConflicts {
        failures: vec![
            StatelineError::OptimisticConflict {
                identity: "Person#1".to_string(),
                expected: Some(1),
                actual: Some(2),
            },
            StatelineError::OptimisticConflict {
                identity: "Person#2".to_string(),
                expected: Some(4),
                actual: None,
            },
        ],
    };
    assert!(err.is_optimistic());
    assert!(err.is_retryable());
    assert_eq!(err.nested().len(), 2);

    let sl_err: SlError = err.into();

    assert_eq!(sl_err.kind(), ErrorKind::OptimisticConflict);
    assert_eq!(sl_err.op(), Some("flush"));
    assert_eq!(sl_err.nested().len(), 2);
    assert_eq!(sl_err.nested()[1].identity(), Some("Person#2"));
    assert!(sl_err.to_string().contains("(2 nested)"));
}

#[test]
fn test_operation_carried_into_structured_error() {
    let err = StatelineError::TransactionNotActive {
        op: "flush".to_string(),
    };

    let sl_err: SlError = err.into();

    assert_eq!(sl_err.kind(), ErrorKind::TransactionState);
    assert_eq!(sl_err.op(), Some("flush"));
    assert!(sl_err.to_string().starts_with("[ERR_TRANSACTION_STATE] in operation 'flush'"));
}

#[test]
fn test_error_kind_code_mapping() {
    // Each kind has a stable, unique code
    let kinds = vec![
        (ErrorKind::InvalidInput, "ERR_INVALID_INPUT"),
        (ErrorKind::ClassNotPersistable, "ERR_CLASS_NOT_PERSISTABLE"),
        (ErrorKind::WrongContext, "ERR_WRONG_CONTEXT"),
        (ErrorKind::StaleReference, "ERR_STALE_REFERENCE"),
        (ErrorKind::NotDetachable, "ERR_NOT_DETACHABLE"),
        (ErrorKind::DuplicateObject, "ERR_DUPLICATE_OBJECT"),
        (ErrorKind::InvalidState, "ERR_INVALID_STATE"),
        (ErrorKind::TransactionState, "ERR_TRANSACTION_STATE"),
        (ErrorKind::InconsistentRelation, "ERR_INCONSISTENT_RELATION"),
        (ErrorKind::UnsupportedOption, "ERR_UNSUPPORTED_OPTION"),
        (ErrorKind::NotFound, "ERR_NOT_FOUND"),
        (ErrorKind::OptimisticConflict, "ERR_OPTIMISTIC_CONFLICT"),
        (ErrorKind::TransitionFailed, "ERR_TRANSITION_FAILED"),
        (ErrorKind::BatchFailed, "ERR_BATCH_FAILED"),
        (ErrorKind::FlushIncomplete, "ERR_FLUSH_INCOMPLETE"),
        (ErrorKind::Persistence, "ERR_PERSISTENCE"),
        (ErrorKind::Serialization, "ERR_SERIALIZATION"),
        (ErrorKind::Fatal, "ERR_FATAL"),
        (ErrorKind::Internal, "ERR_INTERNAL"),
    ];

    let mut seen = std::collections::HashSet::new();
    for (kind, code) in kinds {
        assert_eq!(kind.code(), code);
        assert!(seen.insert(code), "duplicate code {}", code);
    }
}

#[test]
fn test_serde_failure_maps_to_serialization() {
    let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
    let err: StatelineError = parse.unwrap_err().into();

    assert_eq!(err.kind(), ErrorKind::Serialization);
    assert!(!err.is_user_error());
}
