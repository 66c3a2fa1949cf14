use serde::{Deserialize, Serialize};

/// Record-level workflow flags.
///
/// `checked`/`passed` are `None` until the checker has run at least once —
/// the check stage selects on that absence. Flags only move forward: nothing
/// in the pipeline un-checks or un-sends a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFlags {
    pub checked: Option<bool>,
    pub passed: Option<bool>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub timeout: bool,
    #[serde(default)]
    pub sent: bool,
}

impl StatusFlags {
    /// Display value: first true flag in precedence order
    /// `sent > timeout > resolved > passed > checked`, else empty.
    pub fn value(&self) -> &'static str {
        if self.sent {
            "SENT"
        } else if self.timeout {
            "TIMEOUT"
        } else if self.resolved {
            "RESOLVED"
        } else if self.passed == Some(true) {
            "PASSED"
        } else if self.checked == Some(true) {
            "CHECKED"
        } else {
            ""
        }
    }

    /// Ready for the send stage: resolved or timed out, not yet sent.
    pub fn is_sendable(&self) -> bool {
        matches!(self.value(), "RESOLVED" | "TIMEOUT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(
        checked: Option<bool>,
        passed: Option<bool>,
        resolved: bool,
        timeout: bool,
        sent: bool,
    ) -> StatusFlags {
        StatusFlags {
            checked,
            passed,
            resolved,
            timeout,
            sent,
        }
    }

    #[test]
    fn precedence_follows_flag_order() {
        assert_eq!(flags(Some(true), Some(true), true, true, true).value(), "SENT");
        assert_eq!(flags(Some(true), Some(true), true, true, false).value(), "TIMEOUT");
        assert_eq!(flags(Some(true), Some(false), true, false, false).value(), "RESOLVED");
        assert_eq!(flags(Some(true), Some(true), false, false, false).value(), "PASSED");
        assert_eq!(flags(Some(true), Some(false), false, false, false).value(), "CHECKED");
        assert_eq!(flags(None, None, false, false, false).value(), "");
    }

    #[test]
    fn failed_check_displays_checked_only() {
        let f = flags(Some(true), Some(false), false, false, false);
        assert_eq!(f.value(), "CHECKED");
        assert!(!f.is_sendable());
    }

    #[test]
    fn resolved_without_passed_is_sendable() {
        // Manual resolve is allowed even when the automated check failed.
        let f = flags(Some(true), Some(false), true, false, false);
        assert_eq!(f.value(), "RESOLVED");
        assert!(f.is_sendable());
    }

    #[test]
    fn sent_records_are_not_sendable_again() {
        assert!(!flags(Some(true), Some(false), false, true, true).is_sendable());
        assert!(flags(Some(true), Some(false), false, true, false).is_sendable());
    }

    #[test]
    fn unchecked_record_has_empty_value() {
        assert_eq!(StatusFlags::default().value(), "");
    }
}
