//! Synchronous CSV reader with iterator interface
//!
//! Provides a streaming iterator over scenario actions from a CSV file.
//! Delegates CSV format concerns to the csv_format module.
//!
//! # Iterator Interface
//!
//! SyncReader implements the Iterator trait, yielding
//! `Result<ScenarioAction, EscrowError>` for each CSV row:
//!
//! ```no_run
//! use campus_escrow::io::sync_reader::SyncReader;
//! use std::path::Path;
//!
//! let reader = SyncReader::new(Path::new("scenario.csv")).unwrap();
//! for result in reader {
//!     match result {
//!         Ok(action) => println!("Replaying: {:?}", action),
//!         Err(e) => eprintln!("Error: {}", e),
//!     }
//! }
//! ```
//!
//! # Error Handling
//!
//! - A missing file is returned from `new()` as `FileNotFound`
//! - Individual row errors are yielded as `Parse` errors carrying the line
//!   number (header is line 1), and iteration continues with the next row

use crate::io::csv_format::{convert_scenario_record, ScenarioAction, ScenarioRecord};
use crate::types::EscrowError;
use csv::{ReaderBuilder, Trim};
use std::fs::File;
use std::path::Path;

/// Synchronous CSV reader
///
/// Reads one record at a time, so memory use does not grow with the file.
#[derive(Debug)]
pub struct SyncReader {
    reader: csv::Reader<File>,
    line_num: u64,
}

impl SyncReader {
    /// Create a new SyncReader from a file path
    ///
    /// The CSV reader is configured to:
    /// - Trim whitespace from all fields
    /// - Allow flexible field counts (trailing optional columns may be omitted)
    /// - Use an 8KB buffer for efficient I/O
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the scenario file
    ///
    /// # Returns
    ///
    /// * `Ok(SyncReader)` if file opened successfully
    /// * `Err(EscrowError::FileNotFound)` if the file does not exist
    /// * `Err(EscrowError::Io)` for any other open failure
    pub fn new(path: &Path) -> Result<Self, EscrowError> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EscrowError::FileNotFound {
                path: path.display().to_string(),
            },
            _ => EscrowError::from(e),
        })?;

        let reader = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .buffer_capacity(8 * 1024)
            .from_reader(file);

        Ok(Self {
            reader,
            line_num: 0,
        })
    }
}

impl Iterator for SyncReader {
    type Item = Result<ScenarioAction, EscrowError>;

    /// Get the next scenario action from the CSV file
    ///
    /// # Returns
    ///
    /// * `Some(Ok(ScenarioAction))` - Successfully parsed row
    /// * `Some(Err(EscrowError::Parse))` - Parse or conversion error with line number
    /// * `None` - End of file reached
    fn next(&mut self) -> Option<Self::Item> {
        let mut deserializer = self.reader.deserialize::<ScenarioRecord>();
        let record = deserializer.next()?;
        self.line_num += 1;
        let line = Some(self.line_num + 1);

        Some(match record {
            Ok(record) => convert_scenario_record(record)
                .map_err(|message| EscrowError::Parse { line, message }),
            Err(e) => Err(EscrowError::Parse {
                line,
                message: e.to_string(),
            }),
        })
    }
}
