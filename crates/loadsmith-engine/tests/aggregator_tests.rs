use loadsmith_common::ExportFormat;
use loadsmith_engine::aggregator::{read_records, write_records};
use loadsmith_engine::{FailureKind, MetricsAggregator, ObservationRecord, Outcome};
use std::sync::Arc;
use std::time::Duration;

fn tricky_records() -> Vec<ObservationRecord> {
    let ms = Duration::from_millis;
    let mut empty_endpoint = ObservationRecord::success(ms(125), 204, 0, "post_flood", Some(""));
    empty_endpoint.size = 7;
    vec![
        ObservationRecord::success(ms(250), 200, 512, "http_flood", Some("/api/notes")),
        ObservationRecord::failure(ms(0), &FailureKind::Timeout, "http_flood", Some("/a,b")),
        ObservationRecord::failure(
            ms(1500),
            &FailureKind::Transport("reset by \"peer\"\nline two".to_string()),
            "connection_hold",
            Some("slow_connection"),
        ),
        ObservationRecord::failure(ms(75), &FailureKind::Application(503), "hybrid", None),
        empty_endpoint,
    ]
}

#[tokio::test]
async fn test_concurrent_adds_are_all_kept() {
    let aggregator = Arc::new(MetricsAggregator::new());
    let mut tasks = Vec::new();
    for task in 0..8 {
        let aggregator = Arc::clone(&aggregator);
        tasks.push(tokio::spawn(async move {
            for i in 0..250 {
                let endpoint = format!("/t{}/{}", task, i);
                aggregator.add(ObservationRecord::success(
                    Duration::from_millis(1),
                    200,
                    1,
                    "http_flood",
                    Some(&endpoint),
                ));
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    assert_eq!(aggregator.len(), 2000);
    assert_eq!(aggregator.snapshot().len(), 2000);
}

#[test]
fn test_clear_empties_and_is_idempotent() {
    let aggregator = MetricsAggregator::new();
    for r in tricky_records() {
        aggregator.add(r);
    }
    aggregator.clear();
    assert!(aggregator.snapshot().is_empty());
    aggregator.clear();
    assert!(aggregator.is_empty());
}

#[test]
fn test_snapshot_is_a_copy() {
    let aggregator = MetricsAggregator::new();
    aggregator.add(tricky_records().remove(0));
    let snap = aggregator.snapshot();
    aggregator.clear();
    assert_eq!(snap.len(), 1);
}

#[test]
fn test_csv_round_trip_preserves_values_and_order() {
    let records = tricky_records();
    let mut buf = Vec::new();
    write_records(&records, ExportFormat::Csv, &mut buf).unwrap();

    let text = String::from_utf8(buf.clone()).unwrap();
    assert!(text.starts_with(
        "timestamp,response_time,status_code,size,attack_type,endpoint,error\n"
    ));

    let back = read_records(ExportFormat::Csv, buf.as_slice()).unwrap();
    assert_eq!(back, records);
    assert_eq!(back[3].endpoint, None);
    assert_eq!(back[4].endpoint.as_deref(), Some(""));
}

#[test]
fn test_json_round_trip_preserves_values_and_order() {
    let records = tricky_records();
    let mut buf = Vec::new();
    write_records(&records, ExportFormat::Json, &mut buf).unwrap();

    let raw: serde_json::Value = serde_json::from_slice(&buf).unwrap();
    assert_eq!(raw.as_array().unwrap().len(), records.len());
    assert!(raw[3]["endpoint"].is_null());
    assert_eq!(raw[0]["attack_type"], "http_flood");

    let back = read_records(ExportFormat::Json, buf.as_slice()).unwrap();
    assert_eq!(back, records);
}

#[test]
fn test_timestamp_has_millisecond_format() {
    let mut buf = Vec::new();
    write_records(&tricky_records()[..1], ExportFormat::Json, &mut buf).unwrap();
    let raw: serde_json::Value = serde_json::from_slice(&buf).unwrap();
    let ts = raw[0]["timestamp"].as_str().unwrap();
    // YYYY-MM-DD HH:MM:SS.mmm
    assert_eq!(ts.len(), 23);
    assert_eq!(&ts[10..11], " ");
    assert_eq!(&ts[19..20], ".");
}

#[test]
fn test_export_and_import_through_files() {
    let dir = tempfile::tempdir().unwrap();
    let source = MetricsAggregator::new();
    for r in tricky_records() {
        source.add(r);
    }

    for format in [ExportFormat::Csv, ExportFormat::Json] {
        let path = dir.path().join(format!("session.{}", format.extension()));
        source.export_to_path(format, &path).unwrap();

        let restored = MetricsAggregator::new();
        let n = restored.import_from_path(format, &path).unwrap();
        assert_eq!(n, 5);
        assert_eq!(restored.snapshot(), source.snapshot());
    }
}

#[test]
fn test_import_rejects_bad_header() {
    let data = "when,rt\n2024-01-01 00:00:00.000,0.1\n";
    assert!(read_records(ExportFormat::Csv, data.as_bytes()).is_err());
}

#[test]
fn test_summary_counts() {
    let aggregator = MetricsAggregator::new();
    for r in tricky_records() {
        aggregator.add(r);
    }
    let summary = aggregator.summary();
    assert_eq!(summary.total, 5);
    assert_eq!(summary.successful, 2);
    assert_eq!(summary.failed, 3);
    assert_eq!(summary.min_response_time, 0.0);
    assert_eq!(summary.max_response_time, 1.5);
    assert_eq!(summary.status_codes.get(&0), Some(&2));
    assert_eq!(summary.status_codes.get(&503), Some(&1));
    assert_eq!(summary.per_strategy.get("http_flood"), Some(&2));
}

#[test]
fn test_outcome_classes() {
    let records = tricky_records();
    assert_eq!(records[0].outcome(), Outcome::Success);
    assert_eq!(records[1].outcome(), Outcome::Timeout);
    assert_eq!(records[2].outcome(), Outcome::Transport);
    assert_eq!(records[3].outcome(), Outcome::ApplicationError);
    assert_eq!(records[3].status_code, 503);
    assert!(records[3].error.is_some());
    assert!(!records[0].is_failure());
}

#[test]
fn test_redirect_counts_as_successful() {
    let aggregator = MetricsAggregator::new();
    aggregator.add(ObservationRecord::success(
        Duration::from_millis(5),
        302,
        0,
        "http_flood",
        Some("/login"),
    ));
    aggregator.add(
        ObservationRecord::failure(
            Duration::from_millis(5),
            &FailureKind::Application(404),
            "http_flood",
            Some("/missing"),
        )
        .with_size(9),
    );

    let summary = aggregator.summary();
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.successful + summary.failed, summary.total);
    assert_eq!(aggregator.snapshot()[1].size, 9);
}
