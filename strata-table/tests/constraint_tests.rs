//! Constraint verification across persistent and transaction-local state.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int32Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashSet;

use strata_expr::parse_scalar_expression;
use strata_result::Error;
use strata_table::{
    CheckConstraint, ColumnDefinition, ConflictInfo, ConflictManager, Constraint, DataTable,
    Database, ForeignKeyInfo, ForeignKeyType, NotNullConstraint, TableScanState, Transaction,
    UniqueConstraint, VerifyExistenceType,
};

fn int_chunk(values: Vec<Option<i32>>) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int32, true)]));
    RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values)) as ArrayRef])
        .expect("chunk")
}

fn two_column_chunk(ids: Vec<Option<i32>>, names: Vec<Option<&str>>) -> RecordBatch {
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

fn insert_committed(db: &Arc<Database>, table: &Arc<DataTable>, chunk: &RecordBatch) {
    let txn = db.begin_transaction();
    table.local_append_chunk(&txn, chunk).expect("local append");
    txn.commit(None).expect("commit");
}

fn scan_ints(table: &Arc<DataTable>, txn: &Transaction, column: usize) -> Vec<i32> {
    let mut state = TableScanState::new();
    table
        .initialize_scan_txn(txn, &mut state, vec![column], None)
        .expect("initialize scan");
    let mut out = Vec::new();
    while let Some(batch) = table.scan(txn, &mut state).expect("scan") {
        let values = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .expect("ints");
        out.extend(values.iter().flatten());
    }
    out
}

// ---------------------------------------------------------------------------
// NOT NULL and CHECK
// ---------------------------------------------------------------------------

#[test]
fn not_null_violation_names_the_column() {
    let db = Database::new("main");
    let table = db
        .create_table(
            "main",
            "items",
            vec![
                ColumnDefinition::new("id", DataType::Int32, 0),
                ColumnDefinition::new("name", DataType::Utf8, 1),
            ],
            vec![Constraint::NotNull(NotNullConstraint { column: 0 })],
        )
        .expect("create table");

    let txn = db.begin_transaction();
    let err = table
        .local_append_chunk(&txn, &two_column_chunk(vec![None], vec![Some("x")]))
        .unwrap_err();
    match err {
        Error::ConstraintViolation(message) => {
            assert!(message.contains("NOT NULL"));
            assert!(message.contains("items.id"));
        }
        other => panic!("expected constraint violation, got {other:?}"),
    }
    drop(txn);
    assert_eq!(table.info().cardinality(), 0);
}

#[test]
fn check_constraint_rejects_failing_rows() {
    let db = Database::new("main");
    let expression = parse_scalar_expression("qty > 0", &["qty"]).expect("parse");
    let bound_columns = expression.referenced_columns();
    let table = db
        .create_table(
            "main",
            "stock",
            vec![ColumnDefinition::new("qty", DataType::Int32, 0)],
            vec![Constraint::Check(CheckConstraint {
                expression,
                bound_columns,
            })],
        )
        .expect("create table");

    insert_committed(&db, &table, &int_chunk(vec![Some(3)]));

    let txn = db.begin_transaction();
    let err = table
        .local_append_chunk(&txn, &int_chunk(vec![Some(0)]))
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));

    // NULL check results pass.
    table
        .local_append_chunk(&txn, &int_chunk(vec![None]))
        .expect("null passes check");
}

#[test]
fn check_constraint_applies_to_updates_of_bound_columns() {
    let db = Database::new("main");
    let expression = parse_scalar_expression("qty > 0", &["qty"]).expect("parse");
    let bound_columns = expression.referenced_columns();
    let table = db
        .create_table(
            "main",
            "stock",
            vec![ColumnDefinition::new("qty", DataType::Int32, 0)],
            vec![Constraint::Check(CheckConstraint {
                expression,
                bound_columns,
            })],
        )
        .expect("create table");
    insert_committed(&db, &table, &int_chunk(vec![Some(5)]));

    let txn = db.begin_transaction();
    let err = table
        .update(&txn, &[0], &[0], &int_chunk(vec![Some(-1)]))
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));

    table
        .update(&txn, &[0], &[0], &int_chunk(vec![Some(8)]))
        .expect("valid update");
    assert_eq!(scan_ints(&table, &txn, 0), vec![8]);
}

// ---------------------------------------------------------------------------
// UNIQUE
// ---------------------------------------------------------------------------

fn unique_table(db: &Arc<Database>) -> Arc<DataTable> {
    db.create_table(
        "main",
        "keyed",
        vec![
            ColumnDefinition::new("k", DataType::Int32, 0),
            ColumnDefinition::new("v", DataType::Utf8, 1),
        ],
        vec![Constraint::Unique(UniqueConstraint {
            columns: vec![0],
            is_primary_key: true,
        })],
    )
    .expect("create table")
}

#[test]
fn unique_violation_against_committed_rows() {
    let db = Database::new("main");
    let table = unique_table(&db);
    insert_committed(
        &db,
        &table,
        &two_column_chunk(vec![Some(1), Some(2)], vec![Some("a"), Some("b")]),
    );

    let txn = db.begin_transaction();
    let err = table
        .local_append_chunk(&txn, &two_column_chunk(vec![Some(2)], vec![Some("dup")]))
        .unwrap_err();
    match err {
        Error::ConstraintViolation(message) => assert!(message.contains("Duplicate key")),
        other => panic!("expected constraint violation, got {other:?}"),
    }
}

#[test]
fn unique_violation_within_one_transaction() {
    let db = Database::new("main");
    let table = unique_table(&db);

    let txn = db.begin_transaction();
    table
        .local_append_chunk(&txn, &two_column_chunk(vec![Some(7)], vec![Some("a")]))
        .expect("first");
    // The transaction-local index catches the duplicate before commit.
    let err = table
        .local_append_chunk(&txn, &two_column_chunk(vec![Some(7)], vec![Some("b")]))
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
}

#[test]
fn write_write_unique_conflict_surfaces_at_commit() {
    let db = Database::new("main");
    let table = unique_table(&db);

    let first = db.begin_transaction();
    let second = db.begin_transaction();
    table
        .local_append_chunk(&first, &two_column_chunk(vec![Some(5)], vec![Some("a")]))
        .expect("first append");
    table
        .local_append_chunk(&second, &two_column_chunk(vec![Some(5)], vec![Some("b")]))
        .expect("second append");

    first.commit(None).expect("first commit");
    let err = second.commit(None).unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));

    // The failed flush reverted cleanly.
    assert_eq!(table.info().cardinality(), 1);
    let reader = db.begin_transaction();
    assert_eq!(scan_ints(&table, &reader, 0), vec![5]);
}

#[test]
fn conflict_manager_scan_phase_records_target_matches() {
    let db = Database::new("main");
    let table = unique_table(&db);
    insert_committed(
        &db,
        &table,
        &two_column_chunk(vec![Some(1), Some(2)], vec![Some("a"), Some("b")]),
    );

    let txn = db.begin_transaction();
    let chunk = two_column_chunk(vec![Some(2), Some(3)], vec![Some("p"), Some("q")]);

    // Conflict target covers the unique index: conflicts are collected, not
    // raised.
    let conflict_info = ConflictInfo::new(FxHashSet::from_iter([0usize]));
    let mut manager = ConflictManager::new(VerifyExistenceType::Append, 2, Some(&conflict_info));
    table
        .verify_append_constraints(&txn, &chunk, Some(&mut manager))
        .expect("scan-mode verification");
    manager.finalize();
    let matches = manager.conflicts();
    assert_eq!(matches.count(), 1);
    assert_eq!(matches.get(0), 0);
    assert_eq!(manager.index_count(), 1);
}

#[test]
fn conflict_manager_throws_for_indexes_outside_the_target() {
    let db = Database::new("main");
    let table = unique_table(&db);
    insert_committed(
        &db,
        &table,
        &two_column_chunk(vec![Some(1)], vec![Some("a")]),
    );

    let txn = db.begin_transaction();
    let chunk = two_column_chunk(vec![Some(1)], vec![Some("dup")]);

    // Conflict target names a different column set: the unique index is
    // verified in throw mode and fails.
    let conflict_info = ConflictInfo::new(FxHashSet::from_iter([1usize]));
    let mut manager = ConflictManager::new(VerifyExistenceType::Append, 1, Some(&conflict_info));
    let err = table
        .verify_append_constraints(&txn, &chunk, Some(&mut manager))
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
}

// ---------------------------------------------------------------------------
// FOREIGN KEY
// ---------------------------------------------------------------------------

/// Parent/child pair: child.fk references parent.k (both storage ordinal 0).
fn fk_pair(db: &Arc<Database>) -> (Arc<DataTable>, Arc<DataTable>) {
    let parent = db
        .create_table(
            "main",
            "parent",
            vec![ColumnDefinition::new("k", DataType::Int32, 0)],
            vec![
                Constraint::Unique(UniqueConstraint {
                    columns: vec![0],
                    is_primary_key: true,
                }),
                Constraint::ForeignKey(ForeignKeyInfo {
                    fk_type: ForeignKeyType::PrimaryKeyTable,
                    schema: "main".to_string(),
                    table: "child".to_string(),
                    fk_keys: vec![0],
                    pk_keys: vec![0],
                }),
            ],
        )
        .expect("create parent");
    let child = db
        .create_table(
            "main",
            "child",
            vec![ColumnDefinition::new("fk", DataType::Int32, 0)],
            vec![Constraint::ForeignKey(ForeignKeyInfo {
                fk_type: ForeignKeyType::ForeignKeyTable,
                schema: "main".to_string(),
                table: "parent".to_string(),
                fk_keys: vec![0],
                pk_keys: vec![0],
            })],
        )
        .expect("create child");
    (parent, child)
}

#[test]
fn foreign_key_append_requires_a_parent_key() {
    let db = Database::new("main");
    let (parent, child) = fk_pair(&db);
    insert_committed(&db, &parent, &int_chunk(vec![Some(1), Some(2), Some(3)]));

    let txn = db.begin_transaction();
    child
        .local_append_chunk(&txn, &int_chunk(vec![Some(2)]))
        .expect("existing parent key");

    let err = child
        .local_append_chunk(&txn, &int_chunk(vec![Some(4)]))
        .unwrap_err();
    match err {
        Error::ConstraintViolation(message) => {
            assert!(message.contains("does not exist in the referenced table"));
        }
        other => panic!("expected constraint violation, got {other:?}"),
    }
}

#[test]
fn foreign_key_append_satisfied_by_transaction_local_parent_rows() {
    let db = Database::new("main");
    let (parent, child) = fk_pair(&db);
    insert_committed(&db, &parent, &int_chunk(vec![Some(1), Some(2), Some(3)]));

    let txn = db.begin_transaction();
    // Insert the parent key locally first; the child append must see it
    // through the transaction-local side of the check.
    parent
        .local_append_chunk(&txn, &int_chunk(vec![Some(4)]))
        .expect("local parent insert");
    child
        .local_append_chunk(&txn, &int_chunk(vec![Some(4)]))
        .expect("child insert against local parent");

    txn.commit(None).expect("commit");
    let reader = db.begin_transaction();
    assert_eq!(scan_ints(&parent, &reader, 0), vec![1, 2, 3, 4]);
    assert_eq!(scan_ints(&child, &reader, 0), vec![4]);
}

#[test]
fn foreign_key_append_fails_without_the_local_parent_insert() {
    let db = Database::new("main");
    let (parent, child) = fk_pair(&db);
    insert_committed(&db, &parent, &int_chunk(vec![Some(1), Some(2), Some(3)]));

    let txn = db.begin_transaction();
    let err = child
        .local_append_chunk(&txn, &int_chunk(vec![Some(4)]))
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
}

#[test]
fn null_foreign_keys_are_not_checked() {
    let db = Database::new("main");
    let (parent, child) = fk_pair(&db);
    insert_committed(&db, &parent, &int_chunk(vec![Some(1)]));

    let txn = db.begin_transaction();
    child
        .local_append_chunk(&txn, &int_chunk(vec![None]))
        .expect("null key is exempt");
}

#[test]
fn foreign_key_delete_rejects_referenced_parent_rows() {
    let db = Database::new("main");
    let (parent, child) = fk_pair(&db);
    insert_committed(&db, &parent, &int_chunk(vec![Some(1), Some(2), Some(3)]));
    insert_committed(&db, &child, &int_chunk(vec![Some(2)]));

    let txn = db.begin_transaction();
    // Parent row id 1 carries key 2, which the child references.
    let err = parent.delete(&txn, &[1]).unwrap_err();
    match err {
        Error::ConstraintViolation(message) => {
            assert!(message.contains("still referenced by a foreign key"));
        }
        other => panic!("expected constraint violation, got {other:?}"),
    }

    // Unreferenced parent rows delete fine.
    assert_eq!(parent.delete(&txn, &[0]).expect("delete"), 1);
}

#[test]
fn foreign_key_delete_checks_transaction_local_child_rows() {
    let db = Database::new("main");
    let (parent, child) = fk_pair(&db);
    insert_committed(&db, &parent, &int_chunk(vec![Some(1), Some(2)]));

    let txn = db.begin_transaction();
    child
        .local_append_chunk(&txn, &int_chunk(vec![Some(1)]))
        .expect("local child insert");

    // The uncommitted child row already pins the parent key.
    let err = parent.delete(&txn, &[0]).unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
}

#[test]
fn self_referencing_foreign_key_accepts_keys_from_the_same_chunk_table() {
    let db = Database::new("main");
    let table = db
        .create_table(
            "main",
            "tree",
            vec![
                ColumnDefinition::new("id", DataType::Int32, 0),
                ColumnDefinition::new("parent_id", DataType::Int32, 1),
            ],
            vec![
                Constraint::Unique(UniqueConstraint {
                    columns: vec![0],
                    is_primary_key: true,
                }),
                Constraint::ForeignKey(ForeignKeyInfo {
                    fk_type: ForeignKeyType::SelfReferenceTable,
                    schema: "main".to_string(),
                    table: "tree".to_string(),
                    fk_keys: vec![1],
                    pk_keys: vec![0],
                }),
            ],
        )
        .expect("create table");

    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int32, true),
        Field::new("parent_id", DataType::Int32, true),
    ]));
    let tree_chunk = |ids: Vec<Option<i32>>, parents: Vec<Option<i32>>| {
        RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int32Array::from(ids)) as ArrayRef,
                Arc::new(Int32Array::from(parents)) as ArrayRef,
            ],
        )
        .expect("chunk")
    };

    let txn = db.begin_transaction();
    // Root first (null parent), then a child referencing it locally.
    table
        .local_append_chunk(&txn, &tree_chunk(vec![Some(1)], vec![None]))
        .expect("root");
    let child_chunk = tree_chunk(vec![Some(2)], vec![Some(1)]);
    table
        .local_append_chunk(&txn, &child_chunk)
        .expect("self reference satisfied locally");

    let err = table
        .local_append_chunk(&txn, &tree_chunk(vec![Some(3)], vec![Some(9)]))
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
}
