use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Cursor;
use std::path::Path;

use polars::prelude::*;

use crate::error::{ImportsError, Result};

/// Read a CSV file with all columns as String dtype.
/// Trims whitespace from column names and applies optional rename.
pub fn read_csv_as_strings(
    path: &Path,
    rename: Option<&BTreeMap<String, String>>,
) -> Result<DataFrame> {
    if !path.exists() {
        return Err(ImportsError::MissingFile(path.display().to_string()));
    }
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0)) // all columns as String
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;
    tidy_columns(df, rename)
}

/// Read a CSV file after dropping `header_rows` leading lines and
/// `footer_rows` trailing data lines.
pub fn read_csv_trimmed(path: &Path, header_rows: usize, footer_rows: usize) -> Result<DataFrame> {
    if !path.exists() {
        return Err(ImportsError::MissingFile(path.display().to_string()));
    }
    let text = fs::read_to_string(path)?;
    let lines: Vec<&str> = text
        .lines()
        .skip(header_rows)
        .filter(|l| !l.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return Err(ImportsError::InvalidData(format!(
            "{} has no header after skipping {header_rows} rows",
            path.display()
        )));
    }
    // first remaining line is the header
    let keep = lines.len().saturating_sub(footer_rows).max(1);
    let body = lines[..keep].join("\n");
    read_csv_str(body)
}

/// Parse CSV text held in memory, all columns as String dtype.
pub fn read_csv_str(text: String) -> Result<DataFrame> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .into_reader_with_file_handle(Cursor::new(text.into_bytes()))
        .finish()?;
    tidy_columns(df, None)
}

fn tidy_columns(mut df: DataFrame, rename: Option<&BTreeMap<String, String>>) -> Result<DataFrame> {
    let trimmed: Vec<String> = df
        .get_column_names_str()
        .iter()
        .map(|c| c.trim().to_string())
        .collect();
    df.set_column_names(trimmed.as_slice())?;

    if let Some(map) = rename {
        let present: BTreeSet<String> = trimmed.into_iter().collect();
        let (old, new): (Vec<&str>, Vec<&str>) = map
            .iter()
            .filter(|(k, _)| present.contains(k.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .unzip();
        if !old.is_empty() {
            df = df.lazy().rename(old, new, true).collect()?;
        }
    }
    Ok(df)
}

pub fn require_columns(df: &DataFrame, required: &[&str]) -> Result<()> {
    for &col_name in required {
        if df.column(col_name).is_err() {
            return Err(ImportsError::MissingColumn(col_name.to_string()));
        }
    }
    Ok(())
}

/// Strip whitespace and cast string columns to Float64; unparsable cells become null.
pub fn parse_float_columns(lf: LazyFrame, columns: &[&str]) -> LazyFrame {
    lf.with_columns(
        columns
            .iter()
            .map(|c| {
                col(*c)
                    .str()
                    .strip_chars(lit(" \t\r\n"))
                    .cast(DataType::Float64)
            })
            .collect::<Vec<_>>(),
    )
}

pub fn string_values(df: &DataFrame, column: &str) -> Result<Vec<Option<String>>> {
    let values = df
        .column(column)
        .map_err(|_| ImportsError::MissingColumn(column.to_string()))?
        .str()?
        .into_iter()
        .map(|v| v.map(|s| s.to_string()))
        .collect();
    Ok(values)
}

pub fn float_values(df: &DataFrame, column: &str) -> Result<Vec<Option<f64>>> {
    let values = df
        .column(column)
        .map_err(|_| ImportsError::MissingColumn(column.to_string()))?
        .f64()?
        .into_iter()
        .collect();
    Ok(values)
}

/// Write a DataFrame as CSV, creating parent directories as needed.
pub fn write_csv(df: &DataFrame, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = df.clone();
    let mut file = fs::File::create(path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut out)?;
    log::info!("Wrote {} rows to {}", out.height(), path.display());
    Ok(())
}

/// Long form of numeric columns under a composite row key.
///
/// `value_columns` must already be Float64. Output is column-major:
/// every row of the first value column, then the second, and so on.
pub fn melt_numeric(
    df: &DataFrame,
    id_columns: &[&str],
    value_columns: &[String],
    variable_name: &str,
    value_name: &str,
) -> Result<DataFrame> {
    let ids: Vec<Vec<Option<String>>> = id_columns
        .iter()
        .map(|c| string_values(df, c))
        .collect::<Result<_>>()?;

    let mut out_ids: Vec<Vec<Option<String>>> = vec![Vec::new(); id_columns.len()];
    let mut variables: Vec<String> = Vec::new();
    let mut values: Vec<Option<f64>> = Vec::new();

    for name in value_columns {
        for (i, v) in float_values(df, name)?.into_iter().enumerate() {
            for (k, id) in ids.iter().enumerate() {
                out_ids[k].push(id[i].clone());
            }
            variables.push(name.clone());
            values.push(v);
        }
    }

    let mut columns: Vec<Column> = id_columns
        .iter()
        .zip(out_ids.iter())
        .map(|(name, vals)| Column::new((*name).into(), vals))
        .collect();
    columns.push(Column::new(variable_name.into(), &variables));
    columns.push(Column::new(value_name.into(), &values));
    Ok(DataFrame::new(columns)?)
}

/// Wide table held as `(row id, column id) → value`.
///
/// Backs every wide→long reshape in the pipeline so the reshape never
/// depends on a frame library's unpivot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WideTable {
    pub row_header: String,
    pub row_ids: Vec<String>,
    pub column_ids: Vec<String>,
    cells: BTreeMap<(usize, usize), String>,
}

impl WideTable {
    pub fn new(row_header: &str, row_ids: Vec<String>, column_ids: Vec<String>) -> Self {
        Self {
            row_header: row_header.to_string(),
            row_ids,
            column_ids,
            cells: BTreeMap::new(),
        }
    }

    /// Build from a string DataFrame. Rows with a null id are skipped.
    pub fn from_frame(df: &DataFrame, row_id_column: &str, value_columns: &[String]) -> Result<Self> {
        let ids = string_values(df, row_id_column)?;
        let mut table = WideTable::new(row_id_column, Vec::new(), value_columns.to_vec());

        let value_series: Vec<&StringChunked> = value_columns
            .iter()
            .map(|c| {
                df.column(c)
                    .map_err(|_| ImportsError::MissingColumn(c.clone()))
                    .and_then(|s| Ok(s.str()?))
            })
            .collect::<Result<_>>()?;

        for (i, id) in ids.iter().enumerate() {
            let Some(id) = id else { continue };
            let r = table.row_ids.len();
            table.row_ids.push(id.clone());
            for (c, series) in value_series.iter().enumerate() {
                if let Some(v) = series.get(i) {
                    table.cells.insert((r, c), v.to_string());
                }
            }
        }
        Ok(table)
    }

    pub fn set(&mut self, row: usize, column: usize, value: &str) {
        self.cells.insert((row, column), value.to_string());
    }

    pub fn get(&self, row: &str, column: &str) -> Option<&str> {
        let r = self.row_ids.iter().position(|x| x == row)?;
        let c = self.column_ids.iter().position(|x| x == column)?;
        self.cells.get(&(r, c)).map(|s| s.as_str())
    }

    /// Long form: (row id, column id, value), column-major like a melt.
    pub fn melt(&self) -> Vec<(&str, &str, &str)> {
        let mut out = Vec::with_capacity(self.cells.len());
        for (c, column_id) in self.column_ids.iter().enumerate() {
            for (r, row_id) in self.row_ids.iter().enumerate() {
                if let Some(v) = self.cells.get(&(r, c)) {
                    out.push((row_id.as_str(), column_id.as_str(), v.as_str()));
                }
            }
        }
        out
    }

    /// (row id, column id) pairs whose trimmed value equals `indicator`.
    pub fn melt_where(&self, indicator: &str) -> Vec<(String, String)> {
        self.melt()
            .into_iter()
            .filter(|(_, _, v)| v.trim() == indicator)
            .map(|(r, c, _)| (r.to_string(), c.to_string()))
            .collect()
    }
}
