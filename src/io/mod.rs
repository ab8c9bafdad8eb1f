//! I/O module
//!
//! Handles scenario parsing and ledger output.
//!
//! # Components
//!
//! - `csv_format` - CSV format handling (record conversion, output serialization)
//! - `sync_reader` - Synchronous CSV reader with iterator interface

pub mod csv_format;
pub mod sync_reader;

pub use csv_format::{
    convert_scenario_record, write_transactions_csv, LedgerRow, ScenarioAction, ScenarioRecord,
};
pub use sync_reader::SyncReader;
