use std::collections::BTreeSet;

use polars::prelude::*;

use crate::error::Result;
use crate::schema::{contribution as share, diagnostics, imports, multiplier, region, weighted};
use crate::tables;

/// One aggregation level of the weighted multipliers: rows keyed by
/// `keys` and Flow, weighted by `share`.
#[derive(Debug, Clone)]
pub struct WeightingLevel {
    pub name: &'static str,
    pub share: &'static str,
    pub keys: Vec<String>,
}

impl WeightingLevel {
    pub fn new(name: &'static str, share: &'static str, keys: &[&str]) -> Self {
        Self {
            name,
            share,
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    /// Exporting region × model sector.
    pub fn sector(model_sector: &str) -> Self {
        Self::new("sector", share::SHARE_SECTOR, &[region::TIVA_REGION, model_sector])
    }

    pub fn detail(detail: &str) -> Self {
        Self::new("detail", share::SHARE_DETAIL, &[region::TIVA_REGION, detail])
    }

    pub fn summary(summary: &str) -> Self {
        Self::new("summary", share::SHARE_SUMMARY, &[region::TIVA_REGION, summary])
    }
}

/// Country-sectors carrying weight but absent from the multiplier matrix.
#[derive(Debug, Clone, Default)]
pub struct MissingMultipliers {
    pub pairs: BTreeSet<String>,
}

/// Left-join multipliers onto the contribution coefficients by Country and
/// model sector.
///
/// Coefficient rows with no multiplier at all are reported and dropped;
/// they carry no flow to weight.
pub fn attach_multipliers(
    coefficients: &DataFrame,
    multipliers: &DataFrame,
    model_sector: &str,
) -> Result<(DataFrame, MissingMultipliers)> {
    tables::require_columns(multipliers, &[region::COUNTRY, model_sector, multiplier::FLOW, multiplier::EF])?;
    let joined = coefficients
        .clone()
        .lazy()
        .join(
            multipliers.clone().lazy(),
            [col(region::COUNTRY), col(model_sector)],
            [col(region::COUNTRY), col(model_sector)],
            JoinArgs::new(JoinType::Left),
        )
        .collect()?;

    let orphans = joined
        .clone()
        .lazy()
        .filter(col(multiplier::FLOW).is_null())
        .collect()?;
    let mut missing = MissingMultipliers::default();
    if orphans.height() > 0 {
        let countries = tables::string_values(&orphans, region::COUNTRY)?;
        let sectors = tables::string_values(&orphans, model_sector)?;
        missing.pairs = countries
            .into_iter()
            .zip(sectors)
            .map(|(c, s)| format!("{}/{}", c.unwrap_or_default(), s.unwrap_or_default()))
            .collect();
        log::warn!(
            "{} weighted country-sectors have no multipliers: {:?}",
            missing.pairs.len(),
            missing.pairs
        );
    }

    let df = joined
        .lazy()
        .filter(col(multiplier::FLOW).is_not_null())
        .with_column(col(multiplier::EF).fill_null(lit(0.0)))
        .collect()?;
    log::info!("Joined multipliers: {} weighted rows", df.height());
    Ok((df, missing))
}

/// Σ EF × share per (level keys, Flow). Rows with an unmapped key are left
/// out; their share is 0 by construction.
pub fn weighted_sum(joined: &DataFrame, level: &WeightingLevel) -> Result<DataFrame> {
    let mut keys: Vec<&str> = level.keys.iter().map(|k| k.as_str()).collect();
    keys.push(multiplier::FLOW);
    tables::require_columns(joined, &keys)?;
    tables::require_columns(joined, &[level.share, multiplier::EF])?;

    let mapped = level
        .keys
        .iter()
        .map(|k| col(k.as_str()).is_not_null())
        .reduce(|a, b| a.and(b))
        .unwrap_or_else(|| lit(true));

    let df = joined
        .clone()
        .lazy()
        .filter(mapped)
        .group_by_stable(keys.iter().map(|k| col(*k)).collect::<Vec<_>>())
        .agg([(col(multiplier::EF) * col(level.share)).sum().alias(weighted::AMOUNT)])
        .sort(keys.clone(), SortMultipleOptions::default())
        .collect()?;
    log::info!("Weighted multipliers at {} level: {} rows", level.name, df.height());
    Ok(df)
}

/// Terminal relation: Σ over regions of the region's weighted multiplier
/// times the region's share of the sector's imports, per (sector, Flow).
///
/// `import_shares` carries `sector`, TiVA Region and the imports share; a
/// region with no imports in a sector contributes 0.
pub fn import_weighted(level_weighted: &DataFrame, import_shares: &DataFrame, sector: &str) -> Result<DataFrame> {
    tables::require_columns(import_shares, &[sector, region::TIVA_REGION, share::SHARE_IMPORTS])?;
    let shares = import_shares.clone().lazy().select([
        col(sector),
        col(region::TIVA_REGION),
        col(share::SHARE_IMPORTS),
    ]);

    let df = level_weighted
        .clone()
        .lazy()
        .join(
            shares,
            [col(region::TIVA_REGION), col(sector)],
            [col(region::TIVA_REGION), col(sector)],
            JoinArgs::new(JoinType::Left),
        )
        .with_column(col(share::SHARE_IMPORTS).fill_null(lit(0.0)))
        .group_by_stable([col(sector), col(multiplier::FLOW)])
        .agg([(col(weighted::AMOUNT) * col(share::SHARE_IMPORTS)).sum().alias(weighted::AMOUNT)])
        .sort([sector, multiplier::FLOW], SortMultipleOptions::default())
        .collect()?;
    log::info!("Import-weighted multipliers: {} rows", df.height());
    Ok(df)
}

/// Sectors with imports but no nonzero weighted multiplier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageReport {
    pub with_imports: BTreeSet<String>,
    pub with_factors: BTreeSet<String>,
    pub missing: BTreeSet<String>,
}

impl CoverageReport {
    /// One row per uncovered sector: sector, Issue.
    pub fn to_frame(&self, sector: &str) -> Result<DataFrame> {
        let sectors: Vec<String> = self.missing.iter().cloned().collect();
        let issues = vec![diagnostics::NO_EMISSION_FACTOR; sectors.len()];
        Ok(DataFrame::new(vec![
            Column::new(sector.into(), &sectors),
            Column::new(diagnostics::ISSUE.into(), issues),
        ])?)
    }
}

/// Set difference between sectors with positive imports and sectors with a
/// nonzero weighted multiplier for any flow.
pub fn coverage(imports_df: &DataFrame, level_weighted: &DataFrame, sector: &str) -> Result<CoverageReport> {
    let with_imports: BTreeSet<String> = tables::string_values(
        &imports_df
            .clone()
            .lazy()
            .filter(col(imports::IMPORT_QUANTITY).gt(lit(0.0)))
            .collect()?,
        sector,
    )?
    .into_iter()
    .flatten()
    .collect();

    let with_factors: BTreeSet<String> = tables::string_values(
        &level_weighted
            .clone()
            .lazy()
            .filter(col(weighted::AMOUNT).neq(lit(0.0)))
            .collect()?,
        sector,
    )?
    .into_iter()
    .flatten()
    .collect();

    let missing: BTreeSet<String> = with_imports.difference(&with_factors).cloned().collect();
    if !missing.is_empty() {
        log::warn!(
            "{} sectors have imports but no emission factor: {:?}",
            missing.len(),
            missing
        );
    }
    Ok(CoverageReport {
        with_imports,
        with_factors,
        missing,
    })
}
