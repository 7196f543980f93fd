mod common;

use std::time::Duration;

use common::{MockWarehouse, TestWorkspace, fast_config, sales_csv};
use flatfile_bridge::{
    error::TransferError,
    retry::{CancelToken, RetryPolicy},
    schema::{Column, Schema, TypeTag},
    source::SourceKind,
    transfer::{BatchTransferEngine, ResultPayload, TransferConfig, TransferStatus},
};

#[test]
fn batches_follow_source_order_in_chunks_of_one_thousand() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", &sales_csv(2500));
    let warehouse = MockWarehouse::new();
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    let result = engine
        .ingest_file(&input, None, "sales", None)
        .expect("ingest succeeds");

    assert_eq!(result.status, TransferStatus::Completed);
    assert_eq!(result.rows_written, 2500);
    assert_eq!(result.row_errors, 0);
    assert_eq!(result.batches, 3);
    assert_eq!(warehouse.batch_sizes(), vec![1000, 1000, 500]);

    let rows = warehouse.rows("`sales`");
    assert_eq!(rows.len(), 2500);
    assert_eq!(rows[0], r#""0","item 0","2024-01-01""#);
    assert_eq!(rows[2499], r#""2499","item 2499","2024-01-08""#);

    let state = warehouse.state();
    assert!(state.inserts[0].0.starts_with("INSERT INTO `sales` FORMAT CSV"));
}

#[test]
fn exact_multiple_of_batch_size_has_no_trailing_flush() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", &sales_csv(2000));
    let warehouse = MockWarehouse::new();
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    engine.ingest_file(&input, None, "sales", None).unwrap();
    assert_eq!(warehouse.batch_sizes(), vec![1000, 1000]);
}

#[test]
fn malformed_rows_are_counted_and_skipped() {
    let mut csv = sales_csv(1000);
    let mut lines = csv.lines().map(str::to_string).collect::<Vec<_>>();
    lines.insert(5, "oops".to_string());
    lines.insert(400, "1,too,many,fields".to_string());
    lines.insert(900, "2,missing".to_string());
    csv = lines.join("\n");
    csv.push('\n');

    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", &csv);
    let warehouse = MockWarehouse::new();
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    let result = engine.ingest_file(&input, None, "sales", None).unwrap();
    assert_eq!(result.status, TransferStatus::Completed);
    assert_eq!(result.rows_written, 1000);
    assert_eq!(result.row_errors, 3);
    assert_eq!(warehouse.batch_sizes(), vec![1000]);
}

#[test]
fn values_outside_the_inferred_type_are_skipped_after_the_sample() {
    let mut csv = sales_csv(20);
    // Row 12 (header is row 1) falls outside the 10-row sample.
    csv = csv.replacen("10,item 10,", "abc,item 10,", 1);
    csv.push_str("21,late,yesterday\n");

    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", &csv);
    let warehouse = MockWarehouse::new();
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    let result = engine.ingest_file(&input, None, "sales", None).unwrap();
    assert_eq!(result.status, TransferStatus::Completed);
    assert_eq!(result.rows_written, 19);
    assert_eq!(result.row_errors, 2);
    let rows = warehouse.rows("`sales`");
    assert!(rows.iter().all(|row| !row.contains("abc") && !row.contains("yesterday")));
}

#[test]
fn huge_batch_size_loads_everything_in_one_flush() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", &sales_csv(3));
    let warehouse = MockWarehouse::new();
    let config =
        TransferConfig::new(usize::MAX, RetryPolicy::new(3, Duration::ZERO).unwrap()).unwrap();
    let engine = BatchTransferEngine::new(warehouse.clone(), config);

    let result = engine.ingest_file(&input, None, "sales", None).unwrap();
    assert_eq!(result.rows_written, 3);
    assert_eq!(warehouse.batch_sizes(), vec![3]);
}

#[test]
fn row_errors_survive_a_failed_batch() {
    let mut lines = sales_csv(1500)
        .lines()
        .map(str::to_string)
        .collect::<Vec<_>>();
    lines.insert(20, "broken".to_string());
    lines.insert(1200, "also,broken".to_string());
    let csv = lines.join("\n") + "\n";

    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", &csv);
    let warehouse = MockWarehouse::new();
    warehouse.fail_insert_attempts([2, 3, 4]);
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    let err = engine
        .ingest_file(&input, None, "sales", None)
        .unwrap_err();
    assert!(matches!(
        err,
        TransferError::BatchInsert {
            batch: 2,
            rows_committed: 1000,
            row_errors: 2,
            ..
        }
    ));
    assert_eq!(err.row_errors(), 2);
}

#[test]
fn exhausted_batch_aborts_without_touching_later_batches() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", &sales_csv(2500));
    let warehouse = MockWarehouse::new();
    // Attempts 2..=4 are the three tries of the second batch.
    warehouse.fail_insert_attempts([2, 3, 4]);
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    let result = engine.ingest_file(&input, None, "sales", None);
    let payload = ResultPayload::from_ingest(&result);
    match result {
        Err(TransferError::BatchInsert {
            batch,
            attempts,
            rows_committed,
            ..
        }) => {
            assert_eq!(batch, 2);
            assert_eq!(attempts, 3);
            assert_eq!(rows_committed, 1000);
        }
        other => panic!("expected batch insert failure, got {other:?}"),
    }
    assert_eq!(payload.status, TransferStatus::Failed);
    assert_eq!(payload.count, 1000);

    // First batch stays committed; the third is never attempted.
    assert_eq!(warehouse.rows("`sales`").len(), 1000);
    assert_eq!(warehouse.state().insert_attempts, 4);
}

#[test]
fn transient_insert_failure_is_retried() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", &sales_csv(1500));
    let warehouse = MockWarehouse::new();
    warehouse.fail_insert_attempts([1]);
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    let result = engine.ingest_file(&input, None, "sales", None).unwrap();
    assert_eq!(result.rows_written, 1500);
    assert_eq!(result.batch_retries, 1);
    assert_eq!(warehouse.batch_sizes(), vec![1000, 500]);
}

#[test]
fn every_attempt_releases_its_connection() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", &sales_csv(1500));
    let warehouse = MockWarehouse::new();
    warehouse.fail_insert_attempts([1, 2]);
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    engine.ingest_file(&input, None, "sales", None).unwrap();
    let state = warehouse.state();
    // One for DDL, three for the first batch, one for the second.
    assert_eq!(state.opened, 5);
    assert_eq!(state.released, state.opened);
}

#[test]
fn repeated_ingestion_replaces_the_table() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", &sales_csv(1200));
    let warehouse = MockWarehouse::new();
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    engine.ingest_file(&input, None, "sales", None).unwrap();
    let first = engine.row_count("sales").unwrap();
    engine.ingest_file(&input, None, "sales", None).unwrap();
    let second = engine.row_count("sales").unwrap();

    assert_eq!(first, 1200);
    assert_eq!(second, 1200);

    let state = warehouse.state();
    let ddl = state
        .statements
        .iter()
        .filter(|s| s.starts_with("DROP") || s.starts_with("CREATE"))
        .map(|s| s.split_whitespace().next().unwrap_or_default())
        .collect::<Vec<_>>();
    assert_eq!(ddl, vec!["DROP", "CREATE", "DROP", "CREATE"]);
}

#[test]
fn inferred_ddl_orders_by_the_first_datetime_column() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", &sales_csv(3));
    let warehouse = MockWarehouse::new();
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    engine.ingest_file(&input, None, "sales", None).unwrap();
    let state = warehouse.state();
    let create = state
        .statements
        .iter()
        .find(|s| s.starts_with("CREATE"))
        .expect("create statement issued");
    assert_eq!(
        create,
        "CREATE TABLE IF NOT EXISTS `sales` (`id` Int32, `label` String, `sold_at` DateTime) \
         ENGINE=MergeTree ORDER BY `sold_at`"
    );
}

#[test]
fn table_creation_failure_moves_no_data() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", &sales_csv(10));
    let warehouse = MockWarehouse::new();
    warehouse.state().fail_execute = true;
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    let err = engine
        .ingest_file(&input, None, "sales", None)
        .unwrap_err();
    assert!(matches!(err, TransferError::TableCreation { attempts: 3, .. }));
    assert_eq!(warehouse.state().insert_attempts, 0);
}

#[test]
fn refused_connections_are_retried_for_ddl() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", &sales_csv(10));
    let warehouse = MockWarehouse::new();
    warehouse.state().refuse_connections = 2;
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    let result = engine.ingest_file(&input, None, "sales", None).unwrap();
    assert_eq!(result.rows_written, 10);
}

#[test]
fn record_sources_load_one_object_per_line_with_sanitized_keys() {
    let workspace = TestWorkspace::new();
    let input = workspace.write(
        "events.json",
        r#"[
            {"Event Id": 1, "Happened At": "2024-03-01 08:00:00", "Note": "first"},
            {"Event Id": 2, "Happened At": "2024-03-02 09:30:00", "Note": {"nested": true}},
            42,
            {"Event Id": 3, "Happened At": "2024-03-03", "Note": null}
        ]"#,
    );
    let warehouse = MockWarehouse::new();
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    let result = engine.ingest_file(&input, None, "events", None).unwrap();
    assert_eq!(result.rows_written, 2);
    assert_eq!(result.row_errors, 2);
    assert_eq!(
        warehouse.rows("`events`"),
        vec![
            r#"{"event_id":1,"happened_at":"2024-03-01 08:00:00","note":"first"}"#,
            r#"{"event_id":3,"happened_at":"2024-03-03","note":null}"#,
        ]
    );
    let state = warehouse.state();
    assert!(state.inserts[0].0.ends_with("FORMAT JSONEachRow"));
    assert!(state
        .statements
        .iter()
        .any(|s| s.ends_with("ORDER BY `happened_at`")));
}

#[test]
fn explicit_kind_overrides_the_extension() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("upload.tmp", &sales_csv(5));
    let warehouse = MockWarehouse::new();
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    let err = engine
        .ingest_file(&input, None, "sales", None)
        .unwrap_err();
    assert!(matches!(err, TransferError::UnsupportedFormat { .. }));

    let result = engine
        .ingest_file(&input, Some(SourceKind::Delimited), "sales", None)
        .unwrap();
    assert_eq!(result.rows_written, 5);
}

#[test]
fn supplied_schema_skips_inference_but_must_match_width() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", &sales_csv(5));
    let warehouse = MockWarehouse::new();
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    let all_strings = Schema {
        columns: ["id", "label", "sold_at"]
            .iter()
            .map(|name| Column {
                name: name.to_string(),
                data_type: TypeTag::String,
            })
            .collect(),
    };
    engine
        .ingest_file(&input, None, "sales", Some(all_strings.clone()))
        .unwrap();
    assert!(warehouse
        .state()
        .statements
        .iter()
        .any(|s| s.contains("`id` String") && s.ends_with("ORDER BY `id`")));

    let narrow = Schema {
        columns: all_strings.columns[..2].to_vec(),
    };
    let issued = warehouse.state().statements.len();
    let err = engine
        .ingest_file(&input, None, "sales", Some(narrow))
        .unwrap_err();
    assert!(matches!(err, TransferError::InvalidSource { .. }));
    // Rejected before the table is dropped.
    assert_eq!(warehouse.state().statements.len(), issued);
}

#[test]
fn header_only_csv_creates_an_empty_table() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("empty.csv", "id,name\n");
    let warehouse = MockWarehouse::new();
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    let result = engine.ingest_file(&input, None, "empty", None).unwrap();
    assert_eq!(result.rows_written, 0);
    assert_eq!(result.batches, 0);
    assert!(warehouse.state().tables.contains_key("`empty`"));
}

#[test]
fn empty_sources_are_rejected_before_any_ddl() {
    let workspace = TestWorkspace::new();
    let csv = workspace.write("blank.csv", "");
    let json = workspace.write("blank.json", "[]");
    let warehouse = MockWarehouse::new();
    let engine = BatchTransferEngine::new(warehouse.clone(), fast_config());

    for input in [csv, json] {
        let err = engine.ingest_file(&input, None, "t", None).unwrap_err();
        assert!(matches!(err, TransferError::EmptySource { .. }), "{err}");
    }
    assert!(warehouse.state().statements.is_empty());
}

#[test]
fn cancelled_transfer_stops_immediately() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", &sales_csv(10));
    let warehouse = MockWarehouse::new();
    let token = CancelToken::new();
    token.cancel();
    let engine =
        BatchTransferEngine::new(warehouse.clone(), fast_config()).with_cancel_token(token);

    let result = engine.ingest_file(&input, None, "sales", None);
    assert_eq!(
        ResultPayload::from_ingest(&result).status,
        TransferStatus::Cancelled
    );
    assert!(matches!(result, Err(TransferError::Cancelled)));
    assert_eq!(warehouse.state().opened, 0);
}
