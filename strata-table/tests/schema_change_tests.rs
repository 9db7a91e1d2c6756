//! Online schema change: the five constructors, root demotion, and the
//! conservative index dependency rules.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;

use strata_expr::{BoundExpression, ScalarLiteral};
use strata_result::Error;
use strata_table::{
    ColumnDefinition, Constraint, DataTable, Database, NotNullConstraint, TableScanState,
    Transaction, UniqueConstraint,
};

fn chunk(ids: Vec<Option<i32>>, names: Vec<Option<&str>>) -> RecordBatch {
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

fn plain_table(db: &Arc<Database>) -> Arc<DataTable> {
    db.create_table(
        "main",
        "items",
        vec![
            ColumnDefinition::new("id", DataType::Int32, 0),
            ColumnDefinition::new("name", DataType::Utf8, 1),
        ],
        vec![],
    )
    .expect("create table")
}

fn indexed_table(db: &Arc<Database>) -> Arc<DataTable> {
    db.create_table(
        "main",
        "keyed",
        vec![
            ColumnDefinition::new("id", DataType::Int32, 0),
            ColumnDefinition::new("name", DataType::Utf8, 1),
        ],
        vec![Constraint::Unique(UniqueConstraint {
            columns: vec![0],
            is_primary_key: true,
        })],
    )
    .expect("create table")
}

fn insert_committed(db: &Arc<Database>, table: &Arc<DataTable>, batch: &RecordBatch) {
    let txn = db.begin_transaction();
    table.local_append_chunk(&txn, batch).expect("local append");
    txn.commit(None).expect("commit");
}

fn scan_column(table: &Arc<DataTable>, txn: &Transaction, column: usize) -> RecordBatch {
    let mut state = TableScanState::new();
    table
        .initialize_scan_txn(txn, &mut state, vec![column], None)
        .expect("initialize scan");
    table.scan(txn, &mut state).expect("scan").expect("batch")
}

#[test]
fn add_column_with_default_demotes_the_parent() {
    let db = Database::new("main");
    let parent = plain_table(&db);
    insert_committed(
        &db,
        &parent,
        &chunk(
            (0..5).map(Some).collect(),
            vec![Some("a"), Some("b"), Some("c"), Some("d"), Some("e")],
        ),
    );

    let txn = db.begin_transaction();
    let default = BoundExpression::literal(ScalarLiteral::Int64(7));
    let successor = DataTable::from_add_column(
        &parent,
        &txn,
        ColumnDefinition::new("d", DataType::Int32, 2),
        Some(&default),
    )
    .expect("add column");

    assert!(!parent.is_root());
    assert!(successor.is_root());
    // The catalog now resolves to the successor.
    let resolved = db.get_table("main", "items").expect("resolved");
    assert!(Arc::ptr_eq(&resolved, &successor));

    // Every committed row sees the default in the new column.
    let batch = scan_column(&successor, &txn, 2);
    let values = batch
        .column(0)
        .as_any()
        .downcast_ref::<Int32Array>()
        .expect("defaults");
    assert_eq!(batch.num_rows(), 5);
    assert!(values.iter().all(|v| v == Some(7)));

    // The demoted parent rejects new writes.
    let late_txn = db.begin_transaction();
    let err = parent
        .local_append_chunk(&late_txn, &chunk(vec![Some(9)], vec![Some("x")]))
        .unwrap_err();
    assert!(matches!(err, Error::TransactionConflict(_)));

    // Cardinality is shared through the common table info.
    assert_eq!(successor.info().cardinality(), 5);
    assert!(Arc::ptr_eq(parent.info(), successor.info()));
}

#[test]
fn add_column_mirrors_outstanding_local_rows() {
    let db = Database::new("main");
    let parent = plain_table(&db);

    let txn = db.begin_transaction();
    parent
        .local_append_chunk(&txn, &chunk(vec![Some(1)], vec![Some("a")]))
        .expect("local append");

    let default = BoundExpression::literal(ScalarLiteral::Int64(3));
    let successor = DataTable::from_add_column(
        &parent,
        &txn,
        ColumnDefinition::new("extra", DataType::Int32, 2),
        Some(&default),
    )
    .expect("add column");

    // The transaction's local row carries the default in the new column.
    let batch = scan_column(&successor, &txn, 2);
    let values = batch
        .column(0)
        .as_any()
        .downcast_ref::<Int32Array>()
        .expect("values");
    assert_eq!(values.value(0), 3);

    txn.commit(None).expect("commit");
    let reader = db.begin_transaction();
    let batch = scan_column(&successor, &reader, 2);
    assert_eq!(batch.num_rows(), 1);
}

#[test]
fn drop_column_on_indexed_column_is_rejected() {
    let db = Database::new("main");
    let table = indexed_table(&db);
    insert_committed(&db, &table, &chunk(vec![Some(1)], vec![Some("a")]));

    let txn = db.begin_transaction();
    let err = DataTable::from_drop_column(&table, &txn, 0).unwrap_err();
    match err {
        Error::CatalogError(message) => assert!(message.contains("an index depends on it")),
        other => panic!("expected catalog error, got {other:?}"),
    }

    // The table is untouched: still root, same column set.
    assert!(table.is_root());
    assert_eq!(table.column_definitions().len(), 2);
    assert!(Arc::ptr_eq(
        &db.get_table("main", "keyed").expect("resolved"),
        &table
    ));
}

#[test]
fn drop_column_before_an_indexed_column_is_rejected() {
    let db = Database::new("main");
    // Unique index on the second column; dropping the first would shift it.
    let table = db
        .create_table(
            "main",
            "shifted",
            vec![
                ColumnDefinition::new("a", DataType::Int32, 0),
                ColumnDefinition::new("b", DataType::Int32, 1),
            ],
            vec![Constraint::Unique(UniqueConstraint {
                columns: vec![1],
                is_primary_key: false,
            })],
        )
        .expect("create table");

    let txn = db.begin_transaction();
    let err = DataTable::from_drop_column(&table, &txn, 0).unwrap_err();
    match err {
        Error::CatalogError(message) => {
            assert!(message.contains("depends on a column after it"));
        }
        other => panic!("expected catalog error, got {other:?}"),
    }
    assert!(table.is_root());
}

#[test]
fn drop_column_projects_storage_and_recompacts_ordinals() {
    let db = Database::new("main");
    let parent = plain_table(&db);
    insert_committed(
        &db,
        &parent,
        &chunk(vec![Some(1), Some(2)], vec![Some("a"), Some("b")]),
    );

    let txn = db.begin_transaction();
    let successor = DataTable::from_drop_column(&parent, &txn, 0).expect("drop column");

    assert!(!parent.is_root());
    assert_eq!(successor.column_definitions().len(), 1);
    assert_eq!(successor.column_definitions()[0].name(), "name");
    assert_eq!(successor.column_definitions()[0].ordinal(), 0);
    assert_eq!(successor.column_definitions()[0].storage_ordinal(), Some(0));

    let batch = scan_column(&successor, &txn, 0);
    let names = batch
        .column(0)
        .as_any()
        .downcast_ref::<StringArray>()
        .expect("names");
    assert_eq!(names.value(0), "a");
    assert_eq!(names.value(1), "b");
}

#[test]
fn change_type_converts_data_and_updates_the_definition() {
    let db = Database::new("main");
    let parent = plain_table(&db);
    insert_committed(
        &db,
        &parent,
        &chunk(vec![Some(5), Some(6)], vec![Some("a"), Some("b")]),
    );

    let txn = db.begin_transaction();
    let cast_expr = BoundExpression::column(0).cast_to(DataType::Int64);
    let successor = DataTable::from_change_type(
        &parent,
        &txn,
        0,
        DataType::Int64,
        &[0],
        &cast_expr,
    )
    .expect("change type");

    assert!(!parent.is_root());
    assert_eq!(
        successor.column_definitions()[0].logical_type(),
        &DataType::Int64
    );

    let batch = scan_column(&successor, &txn, 0);
    let values = batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("converted values");
    assert_eq!(values.values(), &[5, 6]);

    // Statistics were recomputed for the converted column.
    let stats = successor.get_statistics(0).expect("stats");
    assert_eq!(stats.min(), Some(&strata_storage::StatsValue::Int64(5)));
    assert_eq!(stats.max(), Some(&strata_storage::StatsValue::Int64(6)));
}

#[test]
fn change_type_of_an_indexed_column_is_rejected() {
    let db = Database::new("main");
    let table = indexed_table(&db);

    let txn = db.begin_transaction();
    let cast_expr = BoundExpression::column(0).cast_to(DataType::Int64);
    let err =
        DataTable::from_change_type(&table, &txn, 0, DataType::Int64, &[0], &cast_expr)
            .unwrap_err();
    assert!(matches!(err, Error::CatalogError(_)));
    assert!(table.is_root());
}

#[test]
fn add_not_null_constraint_verifies_existing_rows() {
    let db = Database::new("main");
    let parent = plain_table(&db);
    insert_committed(
        &db,
        &parent,
        &chunk(vec![Some(1), Some(2)], vec![Some("a"), Some("b")]),
    );

    let txn = db.begin_transaction();
    let successor = DataTable::from_add_constraint(
        &parent,
        &txn,
        Constraint::NotNull(NotNullConstraint { column: 0 }),
    )
    .expect("add constraint");

    assert!(!parent.is_root());
    assert_eq!(successor.constraints().len(), 1);

    // The new constraint is enforced on subsequent appends.
    let err = successor
        .local_append_chunk(&txn, &chunk(vec![None], vec![Some("x")]))
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
}

#[test]
fn add_not_null_constraint_fails_on_offending_rows() {
    let db = Database::new("main");
    let parent = plain_table(&db);
    insert_committed(&db, &parent, &chunk(vec![Some(1), None], vec![Some("a"), Some("b")]));

    let txn = db.begin_transaction();
    let err = DataTable::from_add_constraint(
        &parent,
        &txn,
        Constraint::NotNull(NotNullConstraint { column: 0 }),
    )
    .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
    assert!(parent.is_root());
}

#[test]
fn add_not_null_constraint_checks_transaction_local_rows() {
    let db = Database::new("main");
    let parent = plain_table(&db);

    let txn = db.begin_transaction();
    parent
        .local_append_chunk(&txn, &chunk(vec![None], vec![Some("pending")]))
        .expect("local append");

    let err = DataTable::from_add_constraint(
        &parent,
        &txn,
        Constraint::NotNull(NotNullConstraint { column: 0 }),
    )
    .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
}

#[test]
fn add_constraint_supports_only_not_null() {
    let db = Database::new("main");
    let parent = plain_table(&db);

    let txn = db.begin_transaction();
    let err = DataTable::from_add_constraint(
        &parent,
        &txn,
        Constraint::Unique(UniqueConstraint {
            columns: vec![0],
            is_primary_key: false,
        }),
    )
    .unwrap_err();
    assert!(matches!(err, Error::NotImplemented(_)));
}

#[test]
fn local_rows_flow_through_a_schema_change_into_commit() {
    let db = Database::new("main");
    let parent = plain_table(&db);

    let txn = db.begin_transaction();
    parent
        .local_append_chunk(&txn, &chunk(vec![Some(1)], vec![Some("a")]))
        .expect("local append");

    let successor = DataTable::from_add_constraint(
        &parent,
        &txn,
        Constraint::NotNull(NotNullConstraint { column: 0 }),
    )
    .expect("add constraint");

    // The local row follows the successor and commits into it.
    txn.commit(None).expect("commit");
    assert_eq!(successor.info().cardinality(), 1);

    let reader = db.begin_transaction();
    let batch = scan_column(&successor, &reader, 0);
    assert_eq!(batch.num_rows(), 1);
}
