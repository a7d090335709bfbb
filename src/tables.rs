use anyhow::{Context, Result};
use csv::Writer;
use log::{error, info};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::config::{FieldSchema, PRIMARY_TABLE_NAME, VALUATION_TABLE_NAME};

/// Destination for flattened rows. Owned by the transformer thread only.
pub trait TableSink: Send {
    fn write_primary(&mut self, row: &[String]) -> Result<()>;
    fn write_valuations(&mut self, rows: &[Vec<String>]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn report_rows_written(&self) -> HashMap<String, usize>;
}

/// `opa.csv` and `opa-val.csv`, headers written and flushed on creation.
pub struct CsvTables {
    primary: Writer<File>,
    valuation: Writer<File>,
    primary_path: PathBuf,
    valuation_path: PathBuf,
    primary_rows: usize,
    valuation_rows: usize,
}

fn create_table(path: &Path, header: &[String]) -> Result<Writer<File>> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create output table: {}", path.display()))?;
    let mut writer = Writer::from_writer(file);
    writer.write_record(header)
        .with_context(|| format!("Failed to write header to {}", path.display()))?;
    writer.flush()?;
    Ok(writer)
}

impl CsvTables {
    pub fn create(primary_path: &Path, valuation_path: &Path, schema: &FieldSchema) -> Result<Self> {
        let primary = create_table(primary_path, &schema.primary_header())?;
        let valuation = create_table(valuation_path, &schema.valuation_header())?;
        info!("Output tables: {} and {}", primary_path.display(), valuation_path.display());
        Ok(Self {
            primary,
            valuation,
            primary_path: primary_path.to_path_buf(),
            valuation_path: valuation_path.to_path_buf(),
            primary_rows: 0,
            valuation_rows: 0,
        })
    }
}

impl TableSink for CsvTables {
    fn write_primary(&mut self, row: &[String]) -> Result<()> {
        self.primary.write_record(row)
            .with_context(|| format!("Failed to write row to {}", self.primary_path.display()))?;
        self.primary.flush()?;
        self.primary_rows += 1;
        Ok(())
    }

    fn write_valuations(&mut self, rows: &[Vec<String>]) -> Result<()> {
        for row in rows {
            self.valuation.write_record(row)
                .with_context(|| format!("Failed to write row to {}", self.valuation_path.display()))?;
            self.valuation_rows += 1;
        }
        self.valuation.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut flush_errors = Vec::new();
        if let Err(e) = self.primary.flush() {
            flush_errors.push(format!("Failed to flush {}: {}", self.primary_path.display(), e));
        }
        if let Err(e) = self.valuation.flush() {
            flush_errors.push(format!("Failed to flush {}: {}", self.valuation_path.display(), e));
        }
        if flush_errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("Errors occurred during flush:\n - {}", flush_errors.join("\n - ")))
        }
    }

    fn report_rows_written(&self) -> HashMap<String, usize> {
        HashMap::from([
            (PRIMARY_TABLE_NAME.to_string(), self.primary_rows),
            (VALUATION_TABLE_NAME.to_string(), self.valuation_rows),
        ])
    }
}

impl Drop for CsvTables {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("Error flushing CSV tables during cleanup: {}", e);
        }
    }
}
