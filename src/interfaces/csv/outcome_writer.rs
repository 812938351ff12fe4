use crate::domain::events::LifecycleEvent;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Succeeded,
    Failed,
    Cancelled,
    /// The row could not be read as a checkout request.
    Rejected,
}

/// One output row per checkout.
#[derive(Debug, Serialize, PartialEq, Clone)]
pub struct CheckoutOutcome {
    pub reference: String,
    pub outcome: OutcomeKind,
    pub intent: Option<String>,
    pub capture_attempts: u32,
    pub message: String,
}

impl CheckoutOutcome {
    /// Builds the row for a terminal lifecycle event; `None` for any other
    /// event.
    pub fn from_event(
        reference: impl Into<String>,
        event: &LifecycleEvent,
        capture_attempts: u32,
    ) -> Option<Self> {
        let (outcome, intent, message) = match event {
            LifecycleEvent::Succeeded(intent) => {
                (OutcomeKind::Succeeded, Some(intent.id.clone()), String::new())
            }
            LifecycleEvent::Failed { cause, intent } => (
                OutcomeKind::Failed,
                intent.as_ref().map(|i| i.id.clone()),
                cause.to_string(),
            ),
            LifecycleEvent::Cancelled { intent } => (
                OutcomeKind::Cancelled,
                intent.as_ref().map(|i| i.id.clone()),
                String::new(),
            ),
            _ => return None,
        };
        Some(Self {
            reference: reference.into(),
            outcome,
            intent,
            capture_attempts,
            message,
        })
    }

    pub fn rejected(reference: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            reference: reference.into(),
            outcome: OutcomeKind::Rejected,
            intent: None,
            capture_attempts: 0,
            message: reason.to_string(),
        }
    }
}

/// Writes checkout outcomes as CSV with a header row.
pub struct OutcomeWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> OutcomeWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    /// Writes and flushes one row.
    pub fn write_outcome(&mut self, outcome: &CheckoutOutcome) -> Result<()> {
        self.writer.serialize(outcome)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::intent::{IntentStatus, PaymentIntent};
    use crate::error::FailureCause;

    fn render(outcomes: &[CheckoutOutcome]) -> String {
        let mut buffer = Vec::new();
        {
            let mut writer = OutcomeWriter::new(&mut buffer);
            for outcome in outcomes {
                writer.write_outcome(outcome).unwrap();
            }
        }
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_terminal_events_become_rows() {
        let intent = PaymentIntent::new("pi_1", "pi_1_secret").with_status(IntentStatus::Succeeded);
        let succeeded =
            CheckoutOutcome::from_event("ord-1", &LifecycleEvent::Succeeded(intent.clone()), 3).unwrap();
        let failed = CheckoutOutcome::from_event(
            "ord-2",
            &LifecycleEvent::Failed {
                cause: FailureCause::ReaderNotConnected,
                intent: None,
            },
            0,
        )
        .unwrap();

        let output = render(&[succeeded, failed]);
        let mut lines = output.lines();
        assert_eq!(
            lines.next(),
            Some("reference,outcome,intent,capture_attempts,message")
        );
        assert_eq!(lines.next(), Some("ord-1,succeeded,pi_1,3,"));
        let failed_line = lines.next().unwrap();
        assert!(failed_line.starts_with("ord-2,failed,,0,"));
    }

    #[test]
    fn test_non_terminal_events_are_skipped() {
        assert!(CheckoutOutcome::from_event("ord-1", &LifecycleEvent::IntentLoadingStarted, 0).is_none());
    }

    #[test]
    fn test_rejected_row() {
        let output = render(&[CheckoutOutcome::rejected("row 3", "Amount must be positive")]);
        assert!(output.contains("row 3,rejected,,0,Amount must be positive"));
    }
}
