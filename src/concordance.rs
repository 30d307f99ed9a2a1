use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use polars::prelude::*;

use crate::config::{ConcordanceLayout, ConcordanceSource, PipelineConfig};
use crate::error::{ImportsError, Result};
use crate::scheme_graph::SchemeGraph;
use crate::tables::{self, WideTable};

/// Two-column code mapping between classification schemes.
///
/// `frame` holds exactly the two scheme columns, both String. The target
/// column may be null where a chained lookup found no path.
#[derive(Debug, Clone)]
pub struct Concordance {
    pub name: String,
    pub source: String,
    pub target: String,
    pub frame: DataFrame,
}

impl Concordance {
    pub fn new(name: &str, source: &str, target: &str, frame: DataFrame) -> Result<Self> {
        tables::require_columns(&frame, &[source, target])?;
        let frame = frame.select([source, target])?;
        Ok(Self {
            name: name.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            frame,
        })
    }

    /// Build from (source code, target code) pairs.
    pub fn from_pairs(name: &str, source: &str, target: &str, pairs: &[(String, String)]) -> Result<Self> {
        let (s, t): (Vec<String>, Vec<String>) = pairs.iter().cloned().unzip();
        let frame = DataFrame::new(vec![
            Column::new(source.into(), &s),
            Column::new(target.into(), &t),
        ])?;
        Self::new(name, source, target, frame)
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    /// Source codes whose target is null.
    pub fn unmapped(&self) -> Result<BTreeSet<String>> {
        let src = tables::string_values(&self.frame, &self.source)?;
        let tgt = tables::string_values(&self.frame, &self.target)?;
        Ok(src
            .into_iter()
            .zip(tgt)
            .filter_map(|(s, t)| match (s, t) {
                (Some(s), None) => Some(s),
                _ => None,
            })
            .collect())
    }

    /// Re-pivot to a wide incidence matrix: rows are source codes, columns
    /// target codes, "1" where a mapping exists. Both axes sorted.
    pub fn to_incidence(&self) -> Result<WideTable> {
        let src = tables::string_values(&self.frame, &self.source)?;
        let tgt = tables::string_values(&self.frame, &self.target)?;
        let pairs: BTreeSet<(String, String)> = src
            .into_iter()
            .zip(tgt)
            .filter_map(|(s, t)| Some((s?, t?)))
            .collect();
        let rows: Vec<String> = pairs.iter().map(|(s, _)| s.clone()).collect::<BTreeSet<_>>().into_iter().collect();
        let columns: Vec<String> = pairs.iter().map(|(_, t)| t.clone()).collect::<BTreeSet<_>>().into_iter().collect();

        let mut table = WideTable::new(&self.source, rows, columns);
        for (s, t) in &pairs {
            let r = table.row_ids.iter().position(|x| x == s);
            let c = table.column_ids.iter().position(|x| x == t);
            if let (Some(r), Some(c)) = (r, c) {
                table.set(r, c, "1");
            }
        }
        Ok(table)
    }
}

/// Long-form mapping from a wide incidence matrix.
///
/// Each (row, column) cell equal to `indicator` becomes one
/// (row code, column code) pair.
pub fn from_incidence(
    name: &str,
    table: &WideTable,
    row_scheme: &str,
    column_scheme: &str,
    indicator: &str,
) -> Result<Concordance> {
    let pairs = table.melt_where(indicator);
    Concordance::from_pairs(name, row_scheme, column_scheme, &pairs)
}

/// Load a binary incidence matrix concordance.
#[allow(clippy::too_many_arguments)]
pub fn load_binary_matrix(
    path: &Path,
    name: &str,
    row_scheme: &str,
    column_scheme: &str,
    row_id_column: Option<&str>,
    drop_columns: &[String],
    drop_trailing_columns: usize,
    skip_data_rows: usize,
    indicator: &str,
) -> Result<Concordance> {
    let raw = tables::read_csv_as_strings(path, None)?;
    let names: Vec<String> = raw
        .get_column_names_str()
        .iter()
        .map(|s| s.to_string())
        .collect();
    let row_id = match row_id_column {
        Some(c) => c.to_string(),
        None => names
            .first()
            .cloned()
            .ok_or_else(|| ImportsError::InvalidData(format!("{} has no columns", path.display())))?,
    };
    tables::require_columns(&raw, &[row_id.as_str()])?;

    // metadata columns
    let mut value_columns: Vec<String> = names
        .into_iter()
        .filter(|c| *c != row_id && !drop_columns.contains(c))
        .collect();
    value_columns.truncate(value_columns.len().saturating_sub(drop_trailing_columns));

    // metadata rows
    let height = raw.height();
    let data = raw.slice(skip_data_rows.min(height) as i64, height.saturating_sub(skip_data_rows));

    let table = WideTable::from_frame(&data, &row_id, &value_columns)?;
    let concordance = from_incidence(name, &table, row_scheme, column_scheme, indicator)?;
    log::info!(
        "Loaded binary concordance '{name}': {} rows x {} columns -> {} mappings",
        table.row_ids.len(),
        table.column_ids.len(),
        concordance.height()
    );
    Ok(concordance)
}

/// Load a direct code-pair concordance.
///
/// Columns named in `strip_leading_zeros` (by scheme) lose their leading
/// zeros; codes left empty or null become "0".
pub fn load_direct(
    path: &Path,
    name: &str,
    source_column: &str,
    target_column: &str,
    source_scheme: &str,
    target_scheme: &str,
    strip_leading_zeros: &[String],
) -> Result<Concordance> {
    let raw = tables::read_csv_as_strings(path, None)?;
    tables::require_columns(&raw, &[source_column, target_column])?;

    let mut lf = raw
        .lazy()
        .select([col(source_column), col(target_column)])
        .rename([source_column, target_column], [source_scheme, target_scheme], true);

    for scheme in strip_leading_zeros {
        lf = lf.with_column(strip_zeros(scheme));
    }

    let frame = lf.collect()?;
    log::info!("Loaded direct concordance '{name}': {} rows", frame.height());
    Concordance::new(name, source_scheme, target_scheme, frame)
}

fn strip_zeros(column: &str) -> Expr {
    let stripped = col(column).str().strip_chars_start(lit("0"));
    when(stripped.clone().is_null().or(stripped.clone().eq(lit(""))))
        .then(lit("0"))
        .otherwise(stripped)
        .alias(column)
}

pub fn load_source(base: &PipelineConfig, source: &ConcordanceSource) -> Result<Concordance> {
    let path = base.resolve(&source.path);
    match &source.layout {
        ConcordanceLayout::BinaryMatrix {
            row_scheme,
            column_scheme,
            row_id_column,
            drop_columns,
            drop_trailing_columns,
            skip_data_rows,
            indicator,
        } => load_binary_matrix(
            &path,
            &source.name,
            row_scheme,
            column_scheme,
            row_id_column.as_deref(),
            drop_columns,
            *drop_trailing_columns,
            *skip_data_rows,
            indicator,
        ),
        ConcordanceLayout::Direct {
            source_column,
            target_column,
            source_scheme,
            target_scheme,
            strip_leading_zeros,
        } => load_direct(
            &path,
            &source.name,
            source_column,
            target_column,
            source_scheme,
            target_scheme,
            strip_leading_zeros,
        ),
    }
}

/// Chain concordances by successive left joins on their shared scheme
/// column, then keep the distinct (from, to) pairs.
///
/// Fan-out in intermediate stages is expected; duplicates are removed only
/// once, at the end. A `from` code with no path keeps a null `to`.
pub fn chain(steps: &[&Concordance], from: &str, to: &str) -> Result<Concordance> {
    let first = steps
        .first()
        .ok_or_else(|| ImportsError::InvalidData("empty concordance chain".into()))?;
    if first.source != from && first.target != from {
        return Err(ImportsError::InvalidData(format!(
            "concordance '{}' does not start at '{from}'",
            first.name
        )));
    }

    let mut present: HashSet<String> = [first.source.clone(), first.target.clone()].into();
    let mut lf = first.frame.clone().lazy();

    for step in &steps[1..] {
        let (on, added) = if present.contains(&step.source) {
            (&step.source, &step.target)
        } else if present.contains(&step.target) {
            (&step.target, &step.source)
        } else {
            return Err(ImportsError::InvalidData(format!(
                "concordance '{}' shares no scheme with the chain so far",
                step.name
            )));
        };
        lf = lf.join(
            step.frame.clone().lazy(),
            [col(on.as_str())],
            [col(on.as_str())],
            JoinArgs::new(JoinType::Left),
        );
        present.insert(added.clone());
    }

    if !present.contains(to) {
        return Err(ImportsError::NoConcordancePath {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    let wide = lf.collect()?;
    log::debug!("Chained {} concordances: {} wide rows", steps.len(), wide.height());
    let frame = distinct_pairs(&wide, from, to)?;
    let name = steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join("+");
    Concordance::new(&name, from, to, frame)
}

/// Distinct (a, b) rows in first-seen order; null `a` rows are dropped.
///
/// A null `b` survives only for `a` codes with no non-null `b` at all, so a
/// code whose fan-out hits one dead end and one live branch is mapped.
pub fn distinct_pairs(df: &DataFrame, a: &str, b: &str) -> Result<DataFrame> {
    let av = tables::string_values(df, a)?;
    let bv = tables::string_values(df, b)?;
    let reached: HashSet<&str> = av
        .iter()
        .zip(bv.iter())
        .filter_map(|(x, y)| y.as_ref().and(x.as_deref()))
        .collect();

    let mut seen = HashSet::new();
    let mut out_a: Vec<String> = Vec::new();
    let mut out_b: Vec<Option<String>> = Vec::new();
    for (x, y) in av.iter().zip(bv.iter()) {
        let Some(x) = x else { continue };
        if y.is_none() && reached.contains(x.as_str()) {
            continue;
        }
        if seen.insert((x.as_str(), y.as_deref())) {
            out_a.push(x.clone());
            out_b.push(y.clone());
        }
    }
    Ok(DataFrame::new(vec![
        Column::new(a.into(), &out_a),
        Column::new(b.into(), &out_b),
    ])?)
}

/// All configured concordances plus the scheme graph linking them.
pub struct ConcordanceRegistry {
    concordances: Vec<Concordance>,
    graph: SchemeGraph,
}

impl ConcordanceRegistry {
    pub fn new(concordances: Vec<Concordance>) -> Self {
        let graph = SchemeGraph::from_links(
            concordances
                .iter()
                .map(|c| (c.source.as_str(), c.target.as_str())),
        );
        Self {
            concordances,
            graph,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let concordances = config
            .concordances
            .iter()
            .map(|s| load_source(config, s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(concordances))
    }

    pub fn connects(&self, from: &str, to: &str) -> bool {
        self.graph.path(from, to).is_ok()
    }

    /// Mapping from `from` codes to `to` codes through the shortest chain.
    pub fn resolve(&self, from: &str, to: &str) -> Result<Concordance> {
        let path = self.graph.path(from, to)?;
        let steps: Vec<&Concordance> = path.iter().map(|&i| &self.concordances[i]).collect();
        log::info!(
            "Resolved '{from}' -> '{to}' via {}",
            steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(" -> ")
        );
        let resolved = chain(&steps, from, to)?;
        let unmapped = resolved.unmapped()?;
        if !unmapped.is_empty() {
            log::warn!(
                "{} '{from}' codes have no path to '{to}': {:?}",
                unmapped.len(),
                unmapped
            );
        }
        Ok(resolved)
    }
}
