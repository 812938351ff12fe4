use crate::domain::request::PaymentRequest;
use crate::error::{Result, TerminalError};
use std::io::Read;

/// Reads checkout requests from a CSV source with the header
/// `kind,reference,amount,currency`.
///
/// Fields are trimmed; a missing `currency` column defaults to `usd`.
pub struct RequestReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> RequestReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes one request per record.
    pub fn requests(self) -> impl Iterator<Item = Result<PaymentRequest>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(TerminalError::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::PaymentKind;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reader_valid_stream() {
        let data = "kind, reference, amount, currency\nregular, ord-1, 12.50, usd\nevent, evt-9, 40, eur";
        let results: Vec<Result<PaymentRequest>> = RequestReader::new(data.as_bytes()).requests().collect();

        assert_eq!(results.len(), 2);
        let first = results[0].as_ref().unwrap();
        assert_eq!(first.kind, PaymentKind::Regular);
        assert_eq!(first.correlation_id, "ord-1");
        assert_eq!(first.amount.value(), dec!(12.50));
        let second = results[1].as_ref().unwrap();
        assert_eq!(second.kind, PaymentKind::Event);
        assert_eq!(second.currency, "eur");
    }

    #[test]
    fn test_missing_currency_defaults() {
        let data = "kind,reference,amount\nregular,ord-2,3.00";
        let results: Vec<Result<PaymentRequest>> = RequestReader::new(data.as_bytes()).requests().collect();
        assert_eq!(results[0].as_ref().unwrap().currency, "usd");
    }

    #[test]
    fn test_empty_reference_is_read_and_left_to_validation() {
        let data = "kind,reference,amount,currency\nevent,,5.00,usd";
        let results: Vec<Result<PaymentRequest>> = RequestReader::new(data.as_bytes()).requests().collect();
        let request = results[0].as_ref().unwrap();
        assert_eq!(request.validate(), Err("event id is missing".to_string()));
    }

    #[test]
    fn test_reader_malformed_lines() {
        let data = "kind,reference,amount,currency\nrefund,ord-3,1.0,usd\nregular,ord-4,-2,usd";
        let results: Vec<Result<PaymentRequest>> = RequestReader::new(data.as_bytes()).requests().collect();

        assert!(results[0].is_err());
        assert!(results[1].is_err());
    }
}
