mod common;

use paydesk::domain::request::PaymentRequest;
use paydesk::interfaces::csv::request_reader::RequestReader;
use std::fs::File;

#[test]
fn test_generated_checkouts_are_readable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("generated.csv");
    common::generate_checkouts(&path, 25).expect("Failed to generate CSV");

    let content = std::fs::read_to_string(&path).expect("Failed to read file");
    // Header + 25 rows
    assert_eq!(content.lines().count(), 26);

    let requests: Vec<PaymentRequest> = RequestReader::new(File::open(&path).unwrap())
        .requests()
        .collect::<Result<_, _>>()
        .expect("generated rows should parse");
    assert_eq!(requests.len(), 25);
    assert!(requests.iter().all(|r| r.validate().is_ok()));
}
