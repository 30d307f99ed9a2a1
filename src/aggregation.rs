use std::path::{Path, PathBuf};

use polars::prelude::*;

use crate::config::PipelineConfig;
use crate::error::{ImportsError, Result};
use crate::schema::{export, multiplier, weighted};
use crate::tables;

/// Metadata columns attached to every exported factor row.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportMetadata {
    pub unit: String,
    pub currency_year: i32,
    pub data_year: i32,
    pub price_type: String,
}

impl ExportMetadata {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            unit: config.unit.clone(),
            currency_year: config.currency_year(),
            data_year: config.year,
            price_type: config.price_type.clone(),
        }
    }
}

/// Σ Amount per (sector, Flow), sorted.
pub fn aggregate(df: &DataFrame, sector: &str) -> Result<DataFrame> {
    tables::require_columns(df, &[sector, multiplier::FLOW, weighted::AMOUNT])?;
    Ok(df
        .clone()
        .lazy()
        .group_by_stable([col(sector), col(multiplier::FLOW)])
        .agg([col(weighted::AMOUNT).sum()])
        .sort([sector, multiplier::FLOW], SortMultipleOptions::default())
        .collect()?)
}

/// Fail when any key combination occurs more than once.
pub fn ensure_unique(df: &DataFrame, keys: &[&str], table: &str) -> Result<()> {
    tables::require_columns(df, keys)?;
    let dupes = df
        .clone()
        .lazy()
        .group_by_stable(keys.iter().map(|k| col(*k)).collect::<Vec<_>>())
        .agg([len().alias("_rows")])
        .filter(col("_rows").gt(lit(1)))
        .collect()?;
    if dupes.height() == 0 {
        return Ok(());
    }

    let columns: Vec<Vec<Option<String>>> = keys
        .iter()
        .map(|k| tables::string_values(&dupes, k))
        .collect::<Result<_>>()?;
    let listed: Vec<String> = (0..dupes.height())
        .map(|i| {
            columns
                .iter()
                .map(|c| c[i].clone().unwrap_or_else(|| "null".into()))
                .collect::<Vec<_>>()
                .join("/")
        })
        .collect();
    Err(ImportsError::DuplicateKeys {
        table: table.to_string(),
        keys: listed.join(", "),
    })
}

pub fn with_metadata(df: &DataFrame, meta: &ExportMetadata) -> Result<DataFrame> {
    Ok(df
        .clone()
        .lazy()
        .with_columns([
            lit(meta.unit.as_str()).alias(export::UNIT),
            lit(meta.currency_year).alias(export::CURRENCY_YEAR),
            lit(meta.data_year).alias(export::DATA_YEAR),
            lit(meta.price_type.as_str()).alias(export::PRICE_TYPE),
        ])
        .collect()?)
}

/// Importer-facing factor table: one row per (sector, Flow) with metadata.
pub fn export_factors(df: &DataFrame, sector: &str, meta: &ExportMetadata) -> Result<DataFrame> {
    let aggregated = aggregate(df, sector)?;
    ensure_unique(&aggregated, &[sector, multiplier::FLOW], "import factors")?;
    with_metadata(&aggregated, meta)
}

/// Writes the run's tables under one directory, each name suffixed by year.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    dir: PathBuf,
    year: i32,
}

impl OutputWriter {
    pub fn new(dir: &Path, year: i32) -> Self {
        Self {
            dir: dir.to_path_buf(),
            year,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}_{}.csv", self.year))
    }

    pub fn write(&self, name: &str, df: &DataFrame) -> Result<PathBuf> {
        let path = self.path(name);
        tables::write_csv(df, &path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CH4, CO2};
    use crate::schema::scheme;
    use std::fs;

    fn meta() -> ExportMetadata {
        ExportMetadata {
            unit: "kg/USD".into(),
            currency_year: 2019,
            data_year: 2020,
            price_type: "Basic".into(),
        }
    }

    #[test]
    fn export_sums_sorts_and_attaches_metadata() {
        let df = df!(
            scheme::BEA_SUMMARY => &["211", "111CA", "111CA", "111CA"],
            multiplier::FLOW => &[CO2, CH4, CO2, CO2],
            weighted::AMOUNT => &[1.0, 0.5, 0.25, 0.75]
        )
        .unwrap();
        let out = export_factors(&df, scheme::BEA_SUMMARY, &meta()).unwrap();
        assert_eq!(out.height(), 3);
        assert_eq!(
            out.get_column_names_str(),
            vec![
                scheme::BEA_SUMMARY,
                multiplier::FLOW,
                weighted::AMOUNT,
                export::UNIT,
                export::CURRENCY_YEAR,
                export::DATA_YEAR,
                export::PRICE_TYPE
            ]
        );
        assert_eq!(
            tables::float_values(&out, weighted::AMOUNT).unwrap(),
            vec![Some(1.0), Some(0.5), Some(1.0)]
        );
    }

    #[test]
    fn duplicate_keys_are_a_hard_error() {
        let df = df!(
            scheme::BEA_SUMMARY => &["111CA", "111CA"],
            multiplier::FLOW => &[CO2, CO2]
        )
        .unwrap();
        let err = ensure_unique(&df, &[scheme::BEA_SUMMARY, multiplier::FLOW], "t").unwrap_err();
        match err {
            ImportsError::DuplicateKeys { keys, .. } => assert!(keys.contains("111CA/")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn writer_names_files_by_year() {
        let dir = tempfile::tempdir().unwrap();
        let writer = OutputWriter::new(&dir.path().join("out"), 2020);
        let df = df!("a" => &[1i64]).unwrap();
        let path = writer.write("import_factors", &df).unwrap();
        assert!(path.ends_with("import_factors_2020.csv"));
        assert_eq!(fs::read_to_string(path).unwrap(), "a\n1\n");
    }
}
