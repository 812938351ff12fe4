use crate::error::TerminalError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Represents a positive monetary amount to be charged.
///
/// Ensures that checkout amounts are always positive.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, TerminalError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(TerminalError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = TerminalError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

/// Which server endpoint the intent is created against.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum PaymentKind {
    /// A regular order; the correlation id is the order id.
    Regular,
    /// An event-scoped payment; the correlation id is the event id.
    Event,
}

/// What is being charged in one checkout attempt. Read-only once created.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct PaymentRequest {
    pub kind: PaymentKind,
    #[serde(rename = "reference")]
    pub correlation_id: String,
    pub amount: Amount,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "usd".to_string()
}

impl PaymentRequest {
    pub fn new(
        kind: PaymentKind,
        correlation_id: impl Into<String>,
        amount: Amount,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            correlation_id: correlation_id.into(),
            amount,
            currency: currency.into(),
        }
    }

    pub fn regular(order_id: impl Into<String>, amount: Amount) -> Self {
        Self::new(PaymentKind::Regular, order_id, amount, default_currency())
    }

    pub fn event(event_id: impl Into<String>, amount: Amount) -> Self {
        Self::new(PaymentKind::Event, event_id, amount, default_currency())
    }

    /// Checks the request can be sent to the server at all.
    pub fn validate(&self) -> Result<(), String> {
        if self.correlation_id.trim().is_empty() {
            return Err(match self.kind {
                PaymentKind::Regular => "order id is missing".to_string(),
                PaymentKind::Event => "event id is missing".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_must_be_positive() {
        assert!(Amount::new(dec!(12.50)).is_ok());
        assert!(Amount::new(dec!(0)).is_err());
        assert!(Amount::new(dec!(-1.0)).is_err());
    }

    #[test]
    fn test_request_deserialization() {
        let csv = "kind, reference, amount, currency\nevent, evt-9, 12.50, usd";
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(csv.as_bytes());

        let request: PaymentRequest = reader.deserialize().next().unwrap().unwrap();
        assert_eq!(request.kind, PaymentKind::Event);
        assert_eq!(request.correlation_id, "evt-9");
        assert_eq!(request.amount.value(), dec!(12.50));
    }

    #[test]
    fn test_request_rejects_non_positive_amount() {
        let csv = "kind, reference, amount, currency\nregular, ord-1, 0, usd";
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(csv.as_bytes());

        let result: Option<std::result::Result<PaymentRequest, csv::Error>> =
            reader.deserialize().next();
        assert!(result.unwrap().is_err());
    }

    #[test]
    fn test_event_request_without_id_is_invalid() {
        let request = PaymentRequest::event("  ", Amount::new(dec!(5)).unwrap());
        assert_eq!(request.validate(), Err("event id is missing".to_string()));
        assert!(
            PaymentRequest::regular("ord-1", Amount::new(dec!(5)).unwrap())
                .validate()
                .is_ok()
        );
    }
}
