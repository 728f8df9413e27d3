//! Panic recovery for user logic.
//!
//! Function logic, duties and governance activities are arbitrary code. A
//! panic in any of them must not unwind through a team worker, so every call
//! into user logic is wrapped here and a panic surfaces as a
//! [`faults::PANIC`] fault that escalates like any other.

use std::panic::{catch_unwind, AssertUnwindSafe};

use super::fault::{faults, Fault};

/// Execute user logic with panic recovery.
///
/// If the logic panics, the panic is captured, logged, and converted to a
/// `Panic` fault.
///
/// # Example
/// ```
/// use floor_kernel::kernel::{faults, with_recovery};
///
/// let result: Result<(), _> = with_recovery(|| panic!("boom"), "my_function");
/// assert!(result.unwrap_err().is_a(&faults::PANIC));
/// ```
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T, Fault>
where
    F: FnOnce() -> Result<T, Fault>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(&panic_payload);
            tracing::error!(
                "panic_recovered: operation={}, panic={}",
                operation_name,
                panic_msg
            );

            Err(Fault::new(
                &faults::PANIC,
                format!("Panic in {}: {}", operation_name, panic_msg),
            ))
        }
    }
}

/// Run a closure that must not unwind, logging and swallowing any panic.
///
/// Used by team workers around `Job::run` so a worker thread survives.
pub(crate) fn guard_panics<F: FnOnce() -> R, R>(operation: F, operation_name: &str) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => Some(result),
        Err(panic_payload) => {
            tracing::error!(
                "panic_contained: operation={}, panic={}",
                operation_name,
                extract_panic_message(&panic_payload)
            );
            None
        }
    }
}

/// Extract panic message from panic payload.
fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_recovery_success() {
        let result = with_recovery(|| Ok(42), "test_operation");
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_with_recovery_preserves_fault() {
        let original = Fault::application("specific failure");
        let id = original.id();
        let result: Result<(), Fault> = with_recovery(|| Err(original), "test_operation");

        let fault = result.unwrap_err();
        assert_eq!(fault.id(), id);
        assert!(fault.is_a(&faults::APPLICATION));
    }

    #[test]
    fn test_with_recovery_panic_str() {
        let result: Result<(), Fault> = with_recovery(
            || {
                panic!("test panic");
            },
            "test_operation",
        );

        let fault = result.unwrap_err();
        assert!(fault.is_a(&faults::PANIC));
        assert!(fault.message().contains("Panic in test_operation"));
        assert!(fault.message().contains("test panic"));
    }

    #[test]
    fn test_with_recovery_panic_string() {
        let result: Result<(), Fault> = with_recovery(
            || {
                panic!("{}", "dynamic panic message");
            },
            "test_operation",
        );

        assert!(result.unwrap_err().message().contains("dynamic panic message"));
    }

    #[test]
    fn test_guard_panics() {
        assert_eq!(guard_panics(|| 7, "ok"), Some(7));
        assert_eq!(guard_panics(|| -> u32 { panic!("nope") }, "bad"), None);
    }

    #[test]
    fn test_extract_panic_message_str() {
        let panic_result = std::panic::catch_unwind(|| {
            panic!("test message");
        });

        match panic_result {
            Err(payload) => {
                let msg = extract_panic_message(&payload);
                assert_eq!(msg, "test message");
            }
            Ok(_) => panic!("Expected panic"),
        }
    }
}
