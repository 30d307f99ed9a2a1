use std::path::Path;

use polars::prelude::*;

use crate::config::{ModelFieldConfig, OutlierFilter, PipelineConfig, WeightingSource};
use crate::error::{ImportsError, Result};
use crate::schema::{multiplier, region, weights};
use crate::tables;

const EXCLUDED: &str = "_excluded";

/// Weighting quantities and emission multipliers taken from one
/// multi-region IO model snapshot.
#[derive(Debug, Clone)]
pub struct ModelSnapshot {
    /// Country, model sector, Weight Quantity
    pub weights: DataFrame,
    /// Country, model sector, Flow, EF
    pub multipliers: DataFrame,
    /// Country, model sector pairs removed by the outlier filter.
    pub excluded: DataFrame,
}

/// Industry output vector: (Country, sector) → Weight Quantity.
pub fn load_industry_output(path: &Path, rename: &ModelFieldConfig, sector: &str) -> Result<DataFrame> {
    let raw = tables::read_csv_as_strings(path, Some(&rename.fields))?;
    tables::require_columns(&raw, &[region::COUNTRY, sector, weights::INDUSTRY_OUTPUT])?;

    let df = tables::parse_float_columns(raw.lazy(), &[weights::INDUSTRY_OUTPUT])
        .select([
            col(region::COUNTRY),
            col(sector),
            col(weights::INDUSTRY_OUTPUT)
                .fill_null(lit(0.0))
                .alias(weights::QUANTITY),
        ])
        .collect()?;

    warn_negative(&df, "industry output")?;
    log::info!("Loaded industry output for {} country-sectors", df.height());
    Ok(df)
}

/// Bilateral trade towards `importer`: (Country, sector) → Weight Quantity.
///
/// Only strictly positive flows are kept; zero-trade pairs take no part in
/// any denominator.
pub fn load_bilateral_trade(
    path: &Path,
    rename: &ModelFieldConfig,
    sector: &str,
    importer: &str,
) -> Result<DataFrame> {
    let raw = tables::read_csv_as_strings(path, Some(&rename.fields))?;
    tables::require_columns(&raw, &[region::COUNTRY, sector, importer])?;
    let total = raw.height();

    let df = tables::parse_float_columns(raw.lazy(), &[importer])
        .select([
            col(region::COUNTRY),
            col(sector),
            col(importer).alias(weights::QUANTITY),
        ])
        .filter(col(weights::QUANTITY).gt(lit(0.0)))
        .collect()?;

    log::info!(
        "Loaded bilateral trade to {importer}: kept {} of {} country-sectors with positive trade",
        df.height(),
        total
    );
    Ok(df)
}

/// Multiplier matrix in long form: (Country, sector, Flow) → EF.
///
/// Only stressor columns named in the flow rename map and listed in
/// `flows` are kept.
pub fn load_multipliers(
    path: &Path,
    rename: &ModelFieldConfig,
    sector: &str,
    flows: &[String],
) -> Result<DataFrame> {
    let raw = tables::read_csv_as_strings(path, Some(&rename.all()))?;
    tables::require_columns(&raw, &[region::COUNTRY, sector])?;

    let present: Vec<String> = flows
        .iter()
        .filter(|f| raw.column(f.as_str()).is_ok())
        .cloned()
        .collect();
    if present.is_empty() {
        return Err(ImportsError::InvalidData(format!(
            "{} contains none of the flows {:?} after renaming",
            path.display(),
            flows
        )));
    }
    for missing in flows.iter().filter(|f| !present.contains(f)) {
        log::warn!("Flow '{missing}' not found in {}", path.display());
    }

    let flow_refs: Vec<&str> = present.iter().map(|s| s.as_str()).collect();
    let parsed = tables::parse_float_columns(raw.lazy(), &flow_refs).collect()?;
    let long = tables::melt_numeric(
        &parsed,
        &[region::COUNTRY, sector],
        &present,
        multiplier::FLOW,
        multiplier::EF,
    )?;
    log::info!(
        "Loaded {} multipliers ({} flows x {} country-sectors)",
        long.height(),
        present.len(),
        parsed.height()
    );
    Ok(long)
}

/// Country-sectors whose reference-flow multiplier is at or above the threshold.
pub fn outlier_keys(multipliers: &DataFrame, filter: &OutlierFilter, sector: &str) -> Result<DataFrame> {
    let keys = multipliers
        .clone()
        .lazy()
        .filter(
            col(multiplier::FLOW)
                .eq(lit(filter.reference_flow.as_str()))
                .and(col(multiplier::EF).gt_eq(lit(filter.threshold))),
        )
        .select([col(region::COUNTRY), col(sector)])
        .collect()?;
    Ok(keys)
}

/// Drop rows of `df` whose (Country, sector) appears in `keys`.
pub fn exclude_keys(df: &DataFrame, keys: &DataFrame, sector: &str) -> Result<DataFrame> {
    if keys.height() == 0 {
        return Ok(df.clone());
    }
    let keep: Vec<Expr> = df
        .get_column_names_str()
        .iter()
        .map(|c| col(*c))
        .collect();
    let marked = keys
        .clone()
        .lazy()
        .select([col(region::COUNTRY), col(sector)])
        .with_column(lit(true).alias(EXCLUDED));
    let out = df
        .clone()
        .lazy()
        .join(
            marked,
            [col(region::COUNTRY), col(sector)],
            [col(region::COUNTRY), col(sector)],
            JoinArgs::new(JoinType::Left),
        )
        .filter(col(EXCLUDED).is_null())
        .select(keep)
        .collect()?;
    Ok(out)
}

/// Load weights and multipliers for the configured vintage and weighting
/// source, with outliers removed from both.
pub fn extract(config: &PipelineConfig) -> Result<ModelSnapshot> {
    let rename = config.model_rename()?;
    let sector = config.model_scheme.as_str();

    let raw_weights = match config.weighting {
        WeightingSource::IndustryOutput => {
            load_industry_output(&config.resolve(&config.model.industry_output), &rename, sector)?
        }
        WeightingSource::BilateralTrade => {
            let path = config.model.bilateral_trade.as_ref().ok_or_else(|| {
                ImportsError::Config("bilateral_trade weighting requires model.bilateral_trade".into())
            })?;
            load_bilateral_trade(&config.resolve(path), &rename, sector, &config.model.importer)?
        }
    };
    let raw_multipliers = load_multipliers(
        &config.resolve(&config.model.multipliers),
        &rename,
        sector,
        &config.flows,
    )?;

    if !config.outlier.enabled {
        let excluded = raw_multipliers.clear().select([region::COUNTRY, sector])?;
        return Ok(ModelSnapshot {
            weights: raw_weights,
            multipliers: raw_multipliers,
            excluded,
        });
    }

    let excluded = outlier_keys(&raw_multipliers, &config.outlier, sector)?;
    if excluded.height() > 0 {
        let countries = tables::string_values(&excluded, region::COUNTRY)?;
        let sectors = tables::string_values(&excluded, sector)?;
        let listed: Vec<String> = countries
            .iter()
            .zip(sectors.iter())
            .map(|(c, s)| format!("{}/{}", c.as_deref().unwrap_or("?"), s.as_deref().unwrap_or("?")))
            .collect();
        log::warn!(
            "Excluding {} country-sectors with {} >= {}: {}",
            excluded.height(),
            config.outlier.reference_flow,
            config.outlier.threshold,
            listed.join(", ")
        );
    }

    Ok(ModelSnapshot {
        weights: exclude_keys(&raw_weights, &excluded, sector)?,
        multipliers: exclude_keys(&raw_multipliers, &excluded, sector)?,
        excluded,
    })
}

fn warn_negative(df: &DataFrame, what: &str) -> Result<()> {
    let negative = df
        .clone()
        .lazy()
        .filter(col(weights::QUANTITY).lt(lit(0.0)))
        .collect()?;
    if negative.height() > 0 {
        let countries = tables::string_values(&negative, region::COUNTRY)?;
        log::warn!(
            "{} negative {what} values (countries: {:?})",
            negative.height(),
            countries.into_iter().flatten().collect::<Vec<_>>()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CO2;
    use crate::schema::scheme;
    use std::collections::BTreeMap;
    use std::fs;

    fn rename() -> ModelFieldConfig {
        ModelFieldConfig {
            fields: BTreeMap::from([
                ("region".into(), region::COUNTRY.into()),
                ("sector".into(), scheme::EXIOBASE.into()),
            ]),
            flows: BTreeMap::from([
                ("CO2 - combustion - air".into(), CO2.into()),
                ("CH4 - combustion - air".into(), "Methane (CH4)".into()),
            ]),
        }
    }

    #[test]
    fn multipliers_are_renamed_and_melted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.csv");
        fs::write(
            &path,
            "region,sector,CO2 - combustion - air,CH4 - combustion - air,Water use\n\
             AT,Paddy rice,2.0,0.5,100\n\
             CN,Paddy rice,1.0,0.25,200\n",
        )
        .unwrap();

        let flows = vec![CO2.to_string(), "Methane (CH4)".to_string()];
        let m = load_multipliers(&path, &rename(), scheme::EXIOBASE, &flows).unwrap();
        assert_eq!(m.height(), 4);
        assert_eq!(
            m.get_column_names_str(),
            vec![region::COUNTRY, scheme::EXIOBASE, multiplier::FLOW, multiplier::EF]
        );
        let efs = tables::float_values(&m, multiplier::EF).unwrap();
        assert_eq!(efs, vec![Some(2.0), Some(1.0), Some(0.5), Some(0.25)]);
    }

    #[test]
    fn multipliers_without_known_flows_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.csv");
        fs::write(&path, "region,sector,Water use\nAT,Paddy rice,1\n").unwrap();
        let err = load_multipliers(&path, &rename(), scheme::EXIOBASE, &[CO2.to_string()]).unwrap_err();
        assert!(matches!(err, ImportsError::InvalidData(_)));
    }

    #[test]
    fn bilateral_trade_keeps_strictly_positive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.csv");
        fs::write(
            &path,
            "region,sector,US,CA\nAT,s1,5,1\nAT,s2,0,3\nCN,s1,-1,0\nCN,s2,2.5,0\n",
        )
        .unwrap();
        let b = load_bilateral_trade(&path, &rename(), scheme::EXIOBASE, "US").unwrap();
        assert_eq!(b.height(), 2);
        assert_eq!(tables::float_values(&b, weights::QUANTITY).unwrap(), vec![Some(5.0), Some(2.5)]);
    }

    #[test]
    fn outlier_filter_removes_pairs_from_weights_and_multipliers() {
        let multipliers = df!(
            region::COUNTRY => &["A", "A", "B", "B"],
            scheme::EXIOBASE => &["S", "S", "S", "S"],
            multiplier::FLOW => &[CO2, "Methane (CH4)", CO2, "Methane (CH4)"],
            multiplier::EF => &[100.0, 1.0, 99.9, 500.0]
        )
        .unwrap();
        let weights = df!(
            region::COUNTRY => &["A", "B"],
            scheme::EXIOBASE => &["S", "S"],
            weights::QUANTITY => &[30.0, 70.0]
        )
        .unwrap();

        let keys = outlier_keys(&multipliers, &OutlierFilter::default(), scheme::EXIOBASE).unwrap();
        assert_eq!(keys.height(), 1);

        let w = exclude_keys(&weights, &keys, scheme::EXIOBASE).unwrap();
        assert_eq!(tables::string_values(&w, region::COUNTRY).unwrap(), vec![Some("B".to_string())]);
        assert_eq!(w.get_column_names_str(), weights.get_column_names_str());

        let m = exclude_keys(&multipliers, &keys, scheme::EXIOBASE).unwrap();
        assert_eq!(m.height(), 2);
        assert!(tables::string_values(&m, region::COUNTRY)
            .unwrap()
            .iter()
            .all(|c| c.as_deref() == Some("B")));
    }
}
