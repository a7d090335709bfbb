use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const DEFAULT_BASE_URL: &str = "http://services.phila.gov/OPA/v1.0/account";
pub const PRIMARY_TABLE_NAME: &str = "opa.csv";
pub const VALUATION_TABLE_NAME: &str = "opa-val.csv";
pub const FOREIGN_KEY_COLUMN: &str = "opa_id";
const DOWNLOAD_DIR_PREFIX: &str = "opa-downloads";

fn names(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| f.to_string()).collect()
}

/// Ordered field lists per response section. Header order and cell order
/// both follow these lists.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FieldSchema {
    pub property: Vec<String>,
    pub owner: Vec<String>,
    pub characteristics: Vec<String>,
    pub sale: Vec<String>,
    pub geometry: Vec<String>,
    pub valuation: Vec<String>,
}

impl Default for FieldSchema {
    fn default() -> Self {
        Self {
            property: names(&["property_id", "account_number", "full_address", "unit", "zip"]),
            owner: names(&["name", "street", "city", "state", "zip"]),
            characteristics: names(&[
                "description", "beginning_point", "land_area", "improvement_area", "improvement_description",
                "exterior_condition", "zoning", "zoning_description", "building_code", "eq_id", "gma", "homestead",
            ]),
            sale: names(&["sales_date", "sales_price", "sales_type"]),
            geometry: names(&["x", "y"]),
            valuation: names(&[
                "id", "certification_year", "assessment_date", "market_value_date", "market_value", "land_taxable",
                "land_exempt", "improvement_taxable", "improvement_exempt", "total_exempt", "exempt_code",
                "exempt_date", "exempt_description", "taxes", "certified",
            ]),
        }
    }
}

impl FieldSchema {
    /// Loads a YAML override. Sections left out keep their built-in lists.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open schema file: {}", path.display()))?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse schema YAML from {}", path.display()))
    }

    pub fn primary_header(&self) -> Vec<String> {
        [&self.property, &self.owner, &self.characteristics, &self.sale, &self.geometry]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn valuation_header(&self) -> Vec<String> {
        let mut header = self.valuation.clone();
        header.push(FOREIGN_KEY_COLUMN.to_string());
        header
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub base_url: String,
    pub workers: usize,
    pub output_dir: PathBuf,
    pub download_dir: PathBuf,
    pub worker_channel_capacity: usize,
    pub row_queue_capacity: usize,
    pub schema: FieldSchema,
}

impl PipelineConfig {
    /// Single worker against the public endpoint, raw files in a fresh
    /// `opa-downloads-<uuid>` directory under `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        let download_dir = output_dir.join(format!("{}-{}", DOWNLOAD_DIR_PREFIX, Uuid::new_v4().simple()));
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            workers: 1,
            output_dir,
            download_dir,
            worker_channel_capacity: 100,
            row_queue_capacity: 1000,
            schema: FieldSchema::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_download_dir(mut self, download_dir: impl Into<PathBuf>) -> Self {
        self.download_dir = download_dir.into();
        self
    }

    pub fn with_schema(mut self, schema: FieldSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn primary_table_path(&self) -> PathBuf {
        self.output_dir.join(PRIMARY_TABLE_NAME)
    }

    pub fn valuation_table_path(&self) -> PathBuf {
        self.output_dir.join(VALUATION_TABLE_NAME)
    }
}
