use std::collections::{BTreeMap, BTreeSet};

use polars::prelude::*;

use crate::config::RegionMappingConfig;
use crate::error::{ImportsError, Result};
use crate::schema::region;
use crate::tables;

/// Country → macro-region mapping, one region per country.
#[derive(Debug, Clone)]
pub struct RegionMapping {
    /// Country, TiVA Region
    pub frame: DataFrame,
    /// Country → BEA area name, for countries that have one.
    pub bea_areas: BTreeMap<String, String>,
}

impl RegionMapping {
    pub fn load(path: &std::path::Path, cfg: &RegionMappingConfig) -> Result<Self> {
        let raw = tables::read_csv_as_strings(path, None)?;
        tables::require_columns(&raw, &[cfg.country_column.as_str(), cfg.region_column.as_str()])?;

        let bea_areas = if raw.column(&cfg.bea_area_column).is_ok() {
            let countries = tables::string_values(&raw, &cfg.country_column)?;
            let areas = tables::string_values(&raw, &cfg.bea_area_column)?;
            countries
                .into_iter()
                .zip(areas)
                .filter_map(|(c, a)| Some((c?, a?)))
                .collect()
        } else {
            BTreeMap::new()
        };

        let frame = raw
            .lazy()
            .select([
                col(cfg.country_column.as_str()).alias(region::COUNTRY),
                col(cfg.region_column.as_str()).alias(region::TIVA_REGION),
            ])
            .filter(col(region::COUNTRY).is_not_null())
            .collect()?;

        let mapping = Self::from_frame(frame)?;
        log::info!(
            "Loaded region mapping: {} countries in {} regions",
            mapping.frame.height(),
            mapping.regions()?.len()
        );
        Ok(Self { bea_areas, ..mapping })
    }

    /// Validates that each country maps to exactly one region.
    pub fn from_frame(frame: DataFrame) -> Result<Self> {
        tables::require_columns(&frame, &[region::COUNTRY, region::TIVA_REGION])?;
        let countries = tables::string_values(&frame, region::COUNTRY)?;
        let regions = tables::string_values(&frame, region::TIVA_REGION)?;

        let mut seen: BTreeMap<String, Option<String>> = BTreeMap::new();
        let mut conflicts = BTreeSet::new();
        let mut keep = Vec::with_capacity(countries.len());
        for (c, r) in countries.iter().zip(regions.iter()) {
            let Some(c) = c else {
                keep.push(false);
                continue;
            };
            match seen.get(c) {
                Some(prev) if prev != r => {
                    conflicts.insert(c.clone());
                    keep.push(false);
                }
                Some(_) => keep.push(false),
                None => {
                    seen.insert(c.clone(), r.clone());
                    keep.push(true);
                }
            }
        }
        if !conflicts.is_empty() {
            return Err(ImportsError::DuplicateKeys {
                table: "region mapping".into(),
                keys: conflicts.into_iter().collect::<Vec<_>>().join(", "),
            });
        }

        let mask = BooleanChunked::from_slice("keep".into(), &keep);
        let frame = frame.filter(&mask)?;
        Ok(Self {
            frame,
            bea_areas: BTreeMap::new(),
        })
    }

    pub fn regions(&self) -> Result<BTreeSet<String>> {
        Ok(tables::string_values(&self.frame, region::TIVA_REGION)?
            .into_iter()
            .flatten()
            .collect())
    }

    pub fn region_of(&self) -> Result<BTreeMap<String, String>> {
        let countries = tables::string_values(&self.frame, region::COUNTRY)?;
        let regions = tables::string_values(&self.frame, region::TIVA_REGION)?;
        Ok(countries
            .into_iter()
            .zip(regions)
            .filter_map(|(c, r)| Some((c?, r?)))
            .collect())
    }

    /// Left-join the region onto `df` by its Country column, warning about
    /// countries that have none.
    pub fn attach(&self, df: &DataFrame) -> Result<DataFrame> {
        let joined = df
            .clone()
            .lazy()
            .join(
                self.frame.clone().lazy(),
                [col(region::COUNTRY)],
                [col(region::COUNTRY)],
                JoinArgs::new(JoinType::Left),
            )
            .collect()?;

        let orphans = joined
            .clone()
            .lazy()
            .filter(col(region::TIVA_REGION).is_null())
            .collect()?;
        if orphans.height() > 0 {
            let countries: BTreeSet<String> = tables::string_values(&orphans, region::COUNTRY)?
                .into_iter()
                .flatten()
                .collect();
            log::warn!(
                "{} rows from {} countries have no region and carry no weight: {:?}",
                orphans.height(),
                countries.len(),
                countries
            );
        }
        Ok(joined)
    }
}
