//! Checkpoint round-trips (memory- and disk-backed) and commit-time WAL
//! emission.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int32Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;

use strata_storage::{
    FileBlockStore, MemBlockStore, MemoryWal, PersistentTableData, TableDataWriter, WalEntry,
};
use strata_table::{
    ColumnDefinition, Constraint, DataTable, Database, TableScanState, Transaction,
    UniqueConstraint,
};

fn columns() -> Vec<ColumnDefinition> {
    vec![
        ColumnDefinition::new("id", DataType::Int32, 0),
        ColumnDefinition::new("name", DataType::Utf8, 1),
    ]
}

fn constraints() -> Vec<Constraint> {
    vec![Constraint::Unique(UniqueConstraint {
        columns: vec![0],
        is_primary_key: true,
    })]
}

fn chunk(ids: Vec<i32>, names: Vec<&str>) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int32, true),
        Field::new("name", DataType::Utf8, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int32Array::from(ids)) as ArrayRef,
            Arc::new(StringArray::from(names)) as ArrayRef,
        ],
    )
    .expect("chunk")
}

fn insert_committed(db: &Arc<Database>, table: &Arc<DataTable>, batch: &RecordBatch) {
    let txn = db.begin_transaction();
    table.local_append_chunk(&txn, batch).expect("local append");
    txn.commit(None).expect("commit");
}

fn scan_pairs(table: &Arc<DataTable>, txn: &Transaction) -> Vec<(i32, String)> {
    let mut state = TableScanState::new();
    table
        .initialize_scan_txn(txn, &mut state, vec![0, 1], None)
        .expect("initialize scan");
    let mut out = Vec::new();
    while let Some(batch) = table.scan(txn, &mut state).expect("scan") {
        let ids = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .expect("ids");
        let names = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("names");
        for i in 0..batch.num_rows() {
            out.push((ids.value(i), names.value(i).to_string()));
        }
    }
    out
}

#[test]
fn checkpoint_restart_scan_round_trip() {
    let store = MemBlockStore::new();

    let root = {
        let db = Database::new("main");
        let table = db
            .create_table("main", "items", columns(), constraints())
            .expect("create table");
        insert_committed(&db, &table, &chunk(vec![1, 2, 3], vec!["a", "b", "c"]));

        table
            .checkpoint(db.transaction_manager(), TableDataWriter::new(&store))
            .expect("checkpoint")
    };

    // Restart: load the pointer block and rebuild the table.
    let db = Database::new("main");
    let data = PersistentTableData::load(&store, root).expect("load");
    assert_eq!(data.pointer.table, "items");
    assert_eq!(data.pointer.cardinality, 3);
    assert_eq!(data.pointer.indexes.len(), 1);
    assert!(data.pointer.indexes[0].is_unique);

    let restored = db
        .restore_table("main", "items", columns(), constraints(), &data)
        .expect("restore");
    assert_eq!(restored.info().cardinality(), 3);

    let txn = db.begin_transaction();
    assert_eq!(
        scan_pairs(&restored, &txn),
        vec![
            (1, "a".to_string()),
            (2, "b".to_string()),
            (3, "c".to_string()),
        ]
    );

    // The rebuilt unique index still enforces the constraint.
    let err = restored
        .local_append_chunk(&txn, &chunk(vec![2], vec!["dup"]))
        .unwrap_err();
    assert!(matches!(err, strata_result::Error::ConstraintViolation(_)));
}

#[test]
fn checkpoint_reclaims_tombstoned_rows() {
    let store = MemBlockStore::new();

    let root = {
        let db = Database::new("main");
        let table = db
            .create_table("main", "items", columns(), vec![])
            .expect("create table");
        insert_committed(&db, &table, &chunk(vec![1, 2, 3], vec!["a", "b", "c"]));

        let deleter = db.begin_transaction();
        assert_eq!(table.delete(&deleter, &[1]).expect("delete"), 1);
        deleter.commit(None).expect("commit");

        table
            .checkpoint(db.transaction_manager(), TableDataWriter::new(&store))
            .expect("checkpoint")
    };

    let db = Database::new("main");
    let data = PersistentTableData::load(&store, root).expect("load");
    let restored = db
        .restore_table("main", "items", columns(), vec![], &data)
        .expect("restore");

    // The deleted row was physically reclaimed at checkpoint.
    assert_eq!(restored.get_total_rows(), 2);
    let txn = db.begin_transaction();
    assert_eq!(
        scan_pairs(&restored, &txn),
        vec![(1, "a".to_string()), (3, "c".to_string())]
    );
}

#[test]
fn checkpoint_round_trip_through_files() {
    let tmp = tempfile::TempDir::new().expect("tempdir");

    let root = {
        let store = FileBlockStore::open(tmp.path()).expect("open store");
        let db = Database::new("main");
        let table = db
            .create_table("main", "items", columns(), vec![])
            .expect("create table");
        insert_committed(&db, &table, &chunk(vec![10, 20], vec!["x", "y"]));

        table
            .checkpoint(db.transaction_manager(), TableDataWriter::new(&store))
            .expect("checkpoint")
    };

    // Reopen the directory in a fresh session.
    let store = FileBlockStore::open(tmp.path()).expect("reopen store");
    let db = Database::new("main");
    let data = PersistentTableData::load(&store, root).expect("load");
    let restored = db
        .restore_table("main", "items", columns(), vec![], &data)
        .expect("restore");

    let txn = db.begin_transaction();
    assert_eq!(
        scan_pairs(&restored, &txn),
        vec![(10, "x".to_string()), (20, "y".to_string())]
    );
}

#[test]
fn commit_emits_the_appended_range_to_the_wal() {
    let db = Database::new("main");
    let table = db
        .create_table("main", "items", columns(), vec![])
        .expect("create table");

    let wal = MemoryWal::new();
    let txn = db.begin_transaction();
    table
        .local_append_chunk(&txn, &chunk(vec![1, 2, 3], vec!["a", "b", "c"]))
        .expect("local append");
    txn.commit(Some(&wal)).expect("commit");

    let entries = wal.entries();
    assert_eq!(entries.len(), 2);
    match &entries[0] {
        WalEntry::SetTable { schema, table } => {
            assert_eq!(schema, "main");
            assert_eq!(table, "items");
        }
        other => panic!("expected set-table entry, got {other:?}"),
    }
    match &entries[1] {
        WalEntry::Insert(batch) => assert_eq!(batch.num_rows(), 3),
        other => panic!("expected insert entry, got {other:?}"),
    }
}

#[test]
fn wal_skip_flag_suppresses_emission() {
    let db = Database::new("main");
    let table = db
        .create_table("main", "items", columns(), vec![])
        .expect("create table");

    let wal = MemoryWal::skipping();
    let txn = db.begin_transaction();
    table
        .local_append_chunk(&txn, &chunk(vec![1], vec!["a"]))
        .expect("local append");
    txn.commit(Some(&wal)).expect("commit");

    assert!(wal.entries().is_empty());
    assert_eq!(table.info().cardinality(), 1);
}
