use crate::domain::events::Recovery;
use crate::domain::intent::{IntentStatus, PaymentIntent};
use crate::error::{DeviceError, DeviceErrorCode, FailureCause};
use std::time::Duration;

/// Bounded, linear retry schedule for capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

impl CapturePolicy {
    /// Delay before the next attempt after `attempts` failed ones, or `None`
    /// when the budget is spent.
    pub fn next_delay(&self, attempts: u32) -> Option<Duration> {
        (attempts < self.max_attempts).then_some(self.delay)
    }
}

/// Capture attempts made for one intent.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CaptureAttempts {
    intent_id: Option<String>,
    count: u32,
}

impl CaptureAttempts {
    /// Starts counting for `intent_id`. Re-entering with the same intent keeps
    /// the count.
    pub fn enter(&mut self, intent_id: &str) {
        if self.intent_id.as_deref() != Some(intent_id) {
            self.intent_id = Some(intent_id.to_string());
            self.count = 0;
        }
    }

    pub fn record_attempt(&mut self) -> u32 {
        self.count += 1;
        self.count
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// How a processing failure should be handled.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingVerdict {
    pub recovery: Recovery,
    pub status: Option<IntentStatus>,
    /// The intent to resume from or report: the server's updated copy when the
    /// error carried one, the intent that was sent otherwise.
    pub intent: PaymentIntent,
    pub message: &'static str,
}

impl ProcessingVerdict {
    /// Terminal cause for a fatal verdict.
    pub fn failure_cause(&self, error: DeviceError) -> FailureCause {
        if error.code == DeviceErrorCode::NotConnected {
            return FailureCause::ReaderDisconnected(error);
        }
        match self.status {
            Some(status) => FailureCause::ProcessingFailed { status, error },
            None => FailureCause::ProcessingFailedUnknown(error),
        }
    }
}

/// Classifies a processing failure by the status of the server's updated
/// intent.
pub fn classify_processing_failure(error: &DeviceError, sent: &PaymentIntent) -> ProcessingVerdict {
    let status = error.intent_status();
    let intent = error.intent.clone().unwrap_or_else(|| sent.clone());
    let (recovery, message) = match status {
        Some(IntentStatus::RequiresConfirmation) => (
            Recovery::ResumeAtProcessing,
            "Failed to process your payment. Please try again.",
        ),
        Some(IntentStatus::RequiresPaymentMethod) => (
            Recovery::ResumeAtCollection,
            "Your payment was declined. Please try another card.",
        ),
        Some(_) => (
            Recovery::Fatal,
            "We were unable to process your payment. Please exit and try again.",
        ),
        None => (
            Recovery::Fatal,
            "Uh oh, something went wrong. Please exit and try again.",
        ),
    };
    ProcessingVerdict {
        recovery,
        status,
        intent,
        message,
    }
}

/// Terminal cause for a failed collection that was not a cancellation.
pub fn collection_failure(error: DeviceError) -> FailureCause {
    match error.code {
        DeviceErrorCode::NotConnected => FailureCause::ReaderDisconnected(error),
        _ => FailureCause::CollectionFailed(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent() -> PaymentIntent {
        PaymentIntent::new("pi_1", "pi_1_secret").with_status(IntentStatus::RequiresConfirmation)
    }

    fn failure_with(status: IntentStatus) -> DeviceError {
        DeviceError::new(DeviceErrorCode::Declined, "declined")
            .with_intent(PaymentIntent::new("pi_1", "pi_1_secret").with_status(status))
    }

    #[test]
    fn test_requires_confirmation_resumes_at_processing() {
        let verdict = classify_processing_failure(
            &failure_with(IntentStatus::RequiresConfirmation),
            &intent(),
        );
        assert_eq!(verdict.recovery, Recovery::ResumeAtProcessing);
        assert_eq!(verdict.intent.status, IntentStatus::RequiresConfirmation);
    }

    #[test]
    fn test_requires_payment_method_resumes_at_collection() {
        let verdict = classify_processing_failure(
            &failure_with(IntentStatus::RequiresPaymentMethod),
            &intent(),
        );
        assert_eq!(verdict.recovery, Recovery::ResumeAtCollection);
        assert_eq!(verdict.intent.status, IntentStatus::RequiresPaymentMethod);
    }

    #[test]
    fn test_other_status_is_fatal_but_keeps_updated_intent() {
        let error = failure_with(IntentStatus::Canceled);
        let verdict = classify_processing_failure(&error, &intent());
        assert_eq!(verdict.recovery, Recovery::Fatal);
        assert_eq!(verdict.intent.status, IntentStatus::Canceled);
        assert!(matches!(
            verdict.failure_cause(error),
            FailureCause::ProcessingFailed {
                status: IntentStatus::Canceled,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_status_falls_back_to_sent_intent() {
        let error = DeviceError::new(DeviceErrorCode::Timeout, "timeout");
        let verdict = classify_processing_failure(&error, &intent());
        assert_eq!(verdict.recovery, Recovery::Fatal);
        assert_eq!(verdict.status, None);
        assert_eq!(verdict.intent, intent());
        assert!(matches!(
            verdict.failure_cause(error),
            FailureCause::ProcessingFailedUnknown(_)
        ));
    }

    #[test]
    fn test_disconnect_during_processing_reports_reader() {
        let error = DeviceError::new(DeviceErrorCode::NotConnected, "gone");
        let verdict = classify_processing_failure(&error, &intent());
        assert!(matches!(
            verdict.failure_cause(error),
            FailureCause::ReaderDisconnected(_)
        ));
    }

    #[test]
    fn test_capture_policy_is_linear_and_bounded() {
        let policy = CapturePolicy::default();
        for attempts in 1..5 {
            assert_eq!(policy.next_delay(attempts), Some(Duration::from_secs(1)));
        }
        assert_eq!(policy.next_delay(5), None);
        assert_eq!(policy.next_delay(6), None);
    }

    #[test]
    fn test_capture_attempts_reset_per_intent() {
        let mut attempts = CaptureAttempts::default();
        attempts.enter("pi_1");
        attempts.record_attempt();
        attempts.record_attempt();
        attempts.enter("pi_1");
        assert_eq!(attempts.count(), 2);

        attempts.enter("pi_2");
        assert_eq!(attempts.count(), 0);
        assert_eq!(attempts.record_attempt(), 1);
    }
}
