//! Canonical schema constants for structured logging and events
//!
//! These constants keep field names consistent across the engine and the
//! storage adapters. Tracing keys must be written as identifiers at the
//! call site, so the engine spells them out and its tests read emitted
//! events back through these names.

// Canonical field keys for structured logging
pub const FIELD_COMPONENT: &str = "component";
pub const FIELD_OP: &str = "op";
pub const FIELD_EVENT: &str = "event";
pub const FIELD_DURATION_MS: &str = "duration_ms";
pub const FIELD_CONTEXT_ID: &str = "context_id";
pub const FIELD_TX_ID: &str = "tx_id";

// Object identifiers
pub const FIELD_IDENTITY: &str = "identity";
pub const FIELD_CLASS: &str = "class";

// Collection sizes
pub const FIELD_DIRTY_LEN: &str = "dirty_len";
pub const FIELD_ENLISTED_LEN: &str = "enlisted_len";
pub const FIELD_FLUSH_ROUND: &str = "flush_round";

// Error fields
pub const FIELD_ERR_KIND: &str = "err_kind";
pub const FIELD_ERR_CODE: &str = "err_code";

// Canonical event names
pub const EVENT_START: &str = "start";
pub const EVENT_END: &str = "end";
pub const EVENT_END_ERROR: &str = "end_error";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_accessibility() {
        assert!(!FIELD_COMPONENT.is_empty());
        assert!(!FIELD_OP.is_empty());
        assert!(!FIELD_IDENTITY.is_empty());
        assert!(!EVENT_START.is_empty());
        assert!(!EVENT_END.is_empty());
        assert!(!EVENT_END_ERROR.is_empty());
    }

    #[test]
    fn test_event_names_are_distinct() {
        assert_ne!(EVENT_START, EVENT_END);
        assert_ne!(EVENT_START, EVENT_END_ERROR);
        assert_ne!(EVENT_END, EVENT_END_ERROR);
    }
}
