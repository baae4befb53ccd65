use csv::{Writer, WriterBuilder};
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::SimulationError;

/// Writes serializable records to a CSV file, only flushing to disk once a batch of records has been queued.
pub struct BatchedWriter {
    path: PathBuf,
    batch_size: u32,
    pending: u32,
    writer: Writer<File>,
}

impl BatchedWriter {
    /// Creates the results file (and its directory, if needed). Any existing file is truncated.
    pub fn new(
        directory: &Path,
        file_name: &str,
        batch_size: u32,
    ) -> Result<BatchedWriter, SimulationError> {
        if batch_size == 0 {
            return Err(SimulationError::ValidationError(
                "batch size must be at least 1".to_string(),
            ));
        }

        fs::create_dir_all(directory)?;
        let path = directory.join(file_name);
        let writer = WriterBuilder::new().from_path(&path)?;

        Ok(BatchedWriter {
            path,
            batch_size,
            pending: 0,
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds a record to the current batch, writing the batch out once it is full.
    pub fn queue<S: Serialize>(&mut self, record: S) -> Result<(), SimulationError> {
        if let Err(e) = self.writer.serialize(record) {
            // Keep what was already queued before surfacing the error.
            if let Err(flush_err) = self.flush() {
                log::error!("Error flushing {} to disk: {flush_err}", self.path.display());
            }
            return Err(SimulationError::CsvError(e));
        }

        self.pending += 1;
        if self.pending >= self.batch_size {
            return self.flush();
        }

        Ok(())
    }

    /// Writes every queued record to disk, regardless of batch size.
    pub fn flush(&mut self) -> Result<(), SimulationError> {
        self.pending = 0;
        self.writer.flush()?;
        Ok(())
    }
}
