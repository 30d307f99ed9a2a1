use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ImportsError, Result};
use crate::schema::{placeholder, region, scheme};

pub const CO2: &str = "Carbon Dioxide (CO2)";
pub const CH4: &str = "Methane (CH4)";
pub const N2O: &str = "Nitrous Oxide (N2O)";

/// Top-level pipeline configuration, one YAML document per data vintage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root for every relative path below.
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    pub year: i32,
    #[serde(default)]
    pub currency_year: Option<i32>,
    #[serde(default = "default_price_type")]
    pub price_type: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default = "default_flows")]
    pub flows: Vec<String>,
    /// Scheme column holding the model's sector codes after renaming.
    #[serde(default = "default_model_scheme")]
    pub model_scheme: String,
    pub model: ModelConfig,
    #[serde(default)]
    pub weighting: WeightingSource,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default)]
    pub outlier: OutlierFilter,
    pub imports: ImportsSource,
    pub regions: RegionMappingConfig,
    pub concordances: Vec<ConcordanceSource>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

/// Basis for the country-within-region contribution coefficients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingSource {
    #[default]
    IndustryOutput,
    BilateralTrade,
}

/// Sector level of the terminal import-weighted relation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Detail,
    #[default]
    Summary,
}

impl Granularity {
    pub fn scheme(self) -> &'static str {
        match self {
            Granularity::Detail => scheme::BEA_DETAIL,
            Granularity::Summary => scheme::BEA_SUMMARY,
        }
    }
}

/// Sector level the raw imports statistics are reported at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectorLevel {
    Detail,
    #[default]
    Summary,
}

/// Known-bad-data filter on the multiplier matrix.
///
/// Country-sectors whose `reference_flow` multiplier is at or above
/// `threshold` are dropped from both the weights and the multipliers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlierFilter {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reference_flow")]
    pub reference_flow: String,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl Default for OutlierFilter {
    fn default() -> Self {
        Self {
            enabled: true,
            reference_flow: default_reference_flow(),
            threshold: default_threshold(),
        }
    }
}

/// Multi-region IO model snapshot files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// region, sector, indout
    pub industry_output: PathBuf,
    /// region, sector, one column per stressor
    pub multipliers: PathBuf,
    /// region, sector, one column per importing region
    #[serde(default)]
    pub bilateral_trade: Option<PathBuf>,
    #[serde(default = "default_importer")]
    pub importer: String,
    /// Optional external rename document merged over the inline maps.
    #[serde(default)]
    pub rename_config: Option<PathBuf>,
    #[serde(flatten)]
    pub rename: ModelFieldConfig,
}

/// Rename map from model-internal labels to pipeline names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFieldConfig {
    #[serde(default = "default_fields")]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub flows: BTreeMap<String, String>,
}

impl Default for ModelFieldConfig {
    fn default() -> Self {
        Self {
            fields: default_fields(),
            flows: BTreeMap::new(),
        }
    }
}

impl ModelFieldConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = read_config_text(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Entries of `other` win over entries already present.
    pub fn merged(&self, other: &ModelFieldConfig) -> ModelFieldConfig {
        let mut fields = self.fields.clone();
        fields.extend(other.fields.clone());
        let mut flows = self.flows.clone();
        flows.extend(other.flows.clone());
        ModelFieldConfig { fields, flows }
    }

    /// Combined rename map, fields first then flows.
    pub fn all(&self) -> BTreeMap<String, String> {
        let mut all = self.fields.clone();
        all.extend(self.flows.clone());
        all
    }
}

/// Country → macro-region mapping table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionMappingConfig {
    pub file: PathBuf,
    #[serde(default = "default_iso_column")]
    pub country_column: String,
    #[serde(default = "default_region_column")]
    pub region_column: String,
    /// Column naming each country the way the BEA services API expects.
    #[serde(default = "default_bea_area_column")]
    pub bea_area_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImportsSource {
    RegionMatrices(RegionMatrixConfig),
    ApiCache(ApiImportsConfig),
}

impl ImportsSource {
    pub fn sector_level(&self) -> SectorLevel {
        match self {
            ImportsSource::RegionMatrices(c) => c.sector_level,
            ImportsSource::ApiCache(c) => c.sector_level,
        }
    }
}

/// One sector × partner matrix per macro-region, read from static files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionMatrixConfig {
    /// Contains `__region__`, may contain `__year__`.
    pub file_template: PathBuf,
    /// File region name → macro-region code.
    pub regions: BTreeMap<String, String>,
    #[serde(default)]
    pub header_rows: usize,
    #[serde(default)]
    pub footer_rows: usize,
    /// Defaults to the first column.
    #[serde(default)]
    pub code_column: Option<String>,
    #[serde(default)]
    pub drop_codes: Vec<String>,
    #[serde(default)]
    pub drop_columns: Vec<String>,
    /// Sum only these columns instead of every numeric column.
    #[serde(default)]
    pub value_columns: Option<Vec<String>>,
    /// Zero positive (export) values before negating.
    #[serde(default = "default_true")]
    pub zero_exports: bool,
    #[serde(default)]
    pub sector_level: SectorLevel,
}

/// BEA services and Census goods imports, fetched once and replayed from cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiImportsConfig {
    pub cache_dir: PathBuf,
    pub bea_request: PathBuf,
    pub census_request: PathBuf,
    /// Pipe-delimited Census country list (Code | Name | ISO Code).
    pub census_countries: PathBuf,
    /// API BEA Service, BEA Sector
    pub bea_mapping: PathBuf,
    /// NAICS, BEA Sector
    pub census_mapping: PathBuf,
    #[serde(default = "default_census_skip_codes")]
    pub census_skip_codes: Vec<String>,
    #[serde(default)]
    pub sector_level: SectorLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcordanceSource {
    pub name: String,
    pub path: PathBuf,
    #[serde(flatten)]
    pub layout: ConcordanceLayout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum ConcordanceLayout {
    /// Rows are one scheme, columns the other, "1" marks a mapping.
    BinaryMatrix {
        row_scheme: String,
        column_scheme: String,
        /// Column holding the row codes, defaults to the first column.
        #[serde(default)]
        row_id_column: Option<String>,
        #[serde(default)]
        drop_columns: Vec<String>,
        #[serde(default)]
        drop_trailing_columns: usize,
        #[serde(default)]
        skip_data_rows: usize,
        #[serde(default = "default_indicator")]
        indicator: String,
    },
    /// Two columns of a code-pair table.
    Direct {
        source_column: String,
        target_column: String,
        source_scheme: String,
        target_scheme: String,
        #[serde(default)]
        strip_leading_zeros: Vec<String>,
    },
}

/// Declarative description of one statistics API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    pub url: UrlComponents,
    pub years: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlComponents {
    pub base_url: String,
    #[serde(default)]
    pub api_path: Option<String>,
    #[serde(default)]
    pub url_params: BTreeMap<String, String>,
}

impl RequestConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = read_config_text(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

impl PipelineConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = read_config_text(path)?;
        let mut config: PipelineConfig = serde_yaml::from_str(&text)?;
        if config.base_path.is_relative() {
            if let Some(parent) = path.parent() {
                config.base_path = parent.join(&config.base_path);
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.flows.is_empty() {
            return Err(ImportsError::Config("at least one flow is required".into()));
        }
        if self.outlier.enabled && !self.flows.contains(&self.outlier.reference_flow) {
            return Err(ImportsError::Config(format!(
                "outlier reference flow '{}' is not among the configured flows",
                self.outlier.reference_flow
            )));
        }
        if self.weighting == WeightingSource::BilateralTrade && self.model.bilateral_trade.is_none() {
            return Err(ImportsError::Config(
                "bilateral_trade weighting requires model.bilateral_trade".into(),
            ));
        }
        if self.granularity == Granularity::Detail
            && self.imports.sector_level() == SectorLevel::Summary
        {
            return Err(ImportsError::Config(
                "detail granularity requires imports reported at detail level".into(),
            ));
        }
        if let ImportsSource::RegionMatrices(m) = &self.imports {
            if !m.file_template.to_string_lossy().contains(placeholder::REGION) {
                return Err(ImportsError::Config(format!(
                    "imports.file_template must contain {}",
                    placeholder::REGION
                )));
            }
        }
        Ok(())
    }

    /// Resolve a configured path against `base_path` and substitute the year.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let raw = path
            .to_string_lossy()
            .replace(placeholder::YEAR, &self.year.to_string());
        let p = PathBuf::from(raw);
        if p.is_absolute() {
            p
        } else {
            self.base_path.join(p)
        }
    }

    pub fn currency_year(&self) -> i32 {
        self.currency_year.unwrap_or(self.year)
    }

    /// Inline rename maps merged with the external rename document, if any.
    pub fn model_rename(&self) -> Result<ModelFieldConfig> {
        match &self.model.rename_config {
            Some(p) => {
                let external = ModelFieldConfig::from_yaml_file(&self.resolve(p))?;
                Ok(self.model.rename.merged(&external))
            }
            None => Ok(self.model.rename.clone()),
        }
    }
}

fn read_config_text(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(ImportsError::MissingFile(path.display().to_string()));
    }
    Ok(fs::read_to_string(path)?)
}

fn default_base_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_price_type() -> String {
    "Basic".to_string()
}

fn default_unit() -> String {
    "kg/USD".to_string()
}

fn default_flows() -> Vec<String> {
    vec![CO2.to_string(), CH4.to_string(), N2O.to_string()]
}

fn default_model_scheme() -> String {
    scheme::EXIOBASE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_reference_flow() -> String {
    CO2.to_string()
}

fn default_threshold() -> f64 {
    100.0
}

fn default_importer() -> String {
    "US".to_string()
}

fn default_fields() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("region".to_string(), region::COUNTRY.to_string()),
        ("sector".to_string(), scheme::EXIOBASE.to_string()),
    ])
}

fn default_iso_column() -> String {
    "ISO 3166-alpha-2".to_string()
}

fn default_region_column() -> String {
    region::TIVA_REGION.to_string()
}

fn default_bea_area_column() -> String {
    "BEA_AREAORCOUNTRY".to_string()
}

fn default_census_skip_codes() -> Vec<String> {
    vec!["1000".to_string()]
}

fn default_indicator() -> String {
    "1".to_string()
}
