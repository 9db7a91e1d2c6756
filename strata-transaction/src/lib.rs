//! Transaction-identifier allocation and snapshot visibility.
//!
//! The identifier space is split in two: commit identifiers are allocated
//! from 1 upward and transaction identifiers from [`TRANSACTION_ID_START`]
//! upward. A row stamp below `TRANSACTION_ID_START` therefore always denotes
//! a committed write, and a stamp at or above it denotes an in-flight (or
//! aborted) transaction whose outcome is resolved through the
//! [`TransactionManager`] status map.

#![forbid(unsafe_code)]

pub mod mvcc;

pub use mvcc::{
    NOT_DELETED_ID, TRANSACTION_ID_START, TransactionManager, TransactionSnapshot, TxnId,
    TxnStatus,
};
