use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use polars::prelude::*;

use crate::config::{ApiImportsConfig, PipelineConfig, RegionMatrixConfig};
use crate::contribution::{self, ShareSpec, ShareValidation};
use crate::error::{ImportsError, Result};
use crate::fetch::ResponseCache;
use crate::regions::RegionMapping;
use crate::schema::{contribution as share, imports, placeholder, region};
use crate::tables;

pub const BEA: &str = "BEA";
pub const CENSUS: &str = "Census";

/// BEA services values are reported in millions of USD.
const BEA_SCALE: f64 = 1e6;
const API_SERVICE_COLUMN: &str = "API BEA Service";

/// Sector × region matrix accumulated in first-seen sector order.
#[derive(Debug, Default)]
struct SectorRegionMatrix {
    sectors: Vec<String>,
    index: HashMap<String, usize>,
    regions: Vec<String>,
    values: BTreeMap<(usize, usize), f64>,
}

impl SectorRegionMatrix {
    fn add(&mut self, sector: &str, region_code: &str, value: f64) {
        let s = match self.index.get(sector) {
            Some(&i) => i,
            None => {
                self.sectors.push(sector.to_string());
                self.index.insert(sector.to_string(), self.sectors.len() - 1);
                self.sectors.len() - 1
            }
        };
        let r = match self.regions.iter().position(|x| x == region_code) {
            Some(i) => i,
            None => {
                self.regions.push(region_code.to_string());
                self.regions.len() - 1
            }
        };
        *self.values.entry((s, r)).or_insert(0.0) += value;
    }

    /// Long form, region-major; a sector absent from one region counts 0.
    fn to_long(&self, sector_column: &str, region_column: &str) -> Result<DataFrame> {
        let n = self.sectors.len() * self.regions.len();
        let mut sectors = Vec::with_capacity(n);
        let mut regions = Vec::with_capacity(n);
        let mut values = Vec::with_capacity(n);
        for (r, region_code) in self.regions.iter().enumerate() {
            for (s, sector) in self.sectors.iter().enumerate() {
                sectors.push(sector.clone());
                regions.push(region_code.clone());
                values.push(self.values.get(&(s, r)).copied().unwrap_or(0.0));
            }
        }
        Ok(DataFrame::new(vec![
            Column::new(sector_column.into(), &sectors),
            Column::new(region_column.into(), &regions),
            Column::new(imports::IMPORT_QUANTITY.into(), &values),
        ])?)
    }
}

/// Sector totals of one region's sector × partner matrix: the chosen value
/// columns are summed per row, duplicate sector codes are summed together.
pub fn read_region_matrix(path: &Path, cfg: &RegionMatrixConfig) -> Result<Vec<(String, f64)>> {
    let df = tables::read_csv_trimmed(path, cfg.header_rows, cfg.footer_rows)?;
    let names: Vec<String> = df
        .get_column_names_str()
        .iter()
        .map(|s| s.to_string())
        .collect();
    let code_column = match &cfg.code_column {
        Some(c) => c.clone(),
        None => names
            .first()
            .cloned()
            .ok_or_else(|| ImportsError::InvalidData(format!("{} has no columns", path.display())))?,
    };
    let value_columns: Vec<String> = match &cfg.value_columns {
        Some(v) => v.clone(),
        None => names
            .iter()
            .filter(|c| **c != code_column && !cfg.drop_columns.contains(*c))
            .cloned()
            .collect(),
    };
    let mut required: Vec<&str> = vec![code_column.as_str()];
    required.extend(value_columns.iter().map(|s| s.as_str()));
    tables::require_columns(&df, &required)?;

    let total = value_columns
        .iter()
        .map(|c| col(c.as_str()).fill_null(lit(0.0)))
        .reduce(|a, b| a + b)
        .unwrap_or_else(|| lit(0.0));
    let value_refs: Vec<&str> = value_columns.iter().map(|s| s.as_str()).collect();
    let summed = tables::parse_float_columns(df.lazy(), &value_refs)
        .select([
            col(code_column.as_str()).str().strip_chars(lit(" \t")).alias("code"),
            total.cast(DataType::Float64).alias("total"),
        ])
        .collect()?;

    let codes = tables::string_values(&summed, "code")?;
    let totals = tables::float_values(&summed, "total")?;
    let mut order: Vec<String> = Vec::new();
    let mut sums: HashMap<String, f64> = HashMap::new();
    for (code, value) in codes.into_iter().zip(totals) {
        let Some(code) = code.filter(|c| !c.is_empty()) else { continue };
        if cfg.drop_codes.contains(&code) {
            continue;
        }
        match sums.get_mut(&code) {
            Some(acc) => *acc += value.unwrap_or(0.0),
            None => {
                sums.insert(code.clone(), value.unwrap_or(0.0));
                order.push(code);
            }
        }
    }
    Ok(order
        .into_iter()
        .map(|c| {
            let v = sums.get(&c).copied().unwrap_or(0.0);
            (c, v)
        })
        .collect())
}

/// Zero positive values (exports under the signed trade convention).
pub fn remove_exports(lf: LazyFrame, column: &str) -> LazyFrame {
    lf.with_column(
        when(col(column).gt(lit(0.0)))
            .then(lit(0.0))
            .otherwise(col(column))
            .alias(column),
    )
}

/// Flip the sign so imports read as positive magnitudes.
pub fn negate(lf: LazyFrame, column: &str) -> LazyFrame {
    lf.with_column((lit(0.0) - col(column)).alias(column))
}

/// Combine every region's matrix into BEA Sector, TiVA Region, Import Quantity.
pub fn assemble_region_matrices(config: &PipelineConfig, cfg: &RegionMatrixConfig) -> Result<DataFrame> {
    let mut matrix = SectorRegionMatrix::default();
    for (file_region, code) in &cfg.regions {
        let template = cfg.file_template.to_string_lossy().replace(placeholder::REGION, file_region);
        let path = config.resolve(Path::new(&template));
        let totals = read_region_matrix(&path, cfg)?;
        log::info!("Read {} sectors for region {code} from {}", totals.len(), path.display());
        for (sector, value) in totals {
            matrix.add(&sector, code, value);
        }
    }

    let mut lf = matrix
        .to_long(imports::BEA_SECTOR, region::TIVA_REGION)?
        .lazy();
    if cfg.zero_exports {
        lf = remove_exports(lf, imports::IMPORT_QUANTITY);
    }
    let df = negate(lf, imports::IMPORT_QUANTITY).collect()?;
    warn_negative_imports(&df)?;
    Ok(df)
}

/// One row of the Census country list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CensusCountry {
    pub code: String,
    pub name: String,
    pub iso: String,
}

/// Parse the pipe-delimited Census country list. Lines with fewer than three
/// fields are notes; the first remaining line is the header.
pub fn parse_census_countries(text: &str) -> Result<Vec<CensusCountry>> {
    let mut rows = text
        .lines()
        .map(|l| l.split('|').map(|f| f.trim().to_string()).collect::<Vec<_>>())
        .filter(|fields| fields.len() >= 3);
    let header = rows
        .next()
        .ok_or_else(|| ImportsError::InvalidData("census country list has no header".into()))?;
    let find = |name: &str| {
        header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| ImportsError::MissingColumn(format!("census country list: {name}")))
    };
    let (code_at, name_at, iso_at) = (find("Code")?, find("Name")?, find("ISO Code")?);

    Ok(rows
        .filter_map(|r| {
            let iso = r.get(iso_at)?.clone();
            if iso.is_empty() {
                return None;
            }
            Some(CensusCountry {
                code: r.get(code_at)?.clone(),
                name: r.get(name_at).cloned().unwrap_or_default(),
                iso,
            })
        })
        .collect())
}

/// ISO country code → identifiers used by each statistics API.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountrySchema {
    pub bea: BTreeMap<String, String>,
    pub census: BTreeMap<String, String>,
}

impl CountrySchema {
    /// Restricted to countries present in the region mapping.
    pub fn build(mapping: &RegionMapping, census: &[CensusCountry]) -> Result<Self> {
        let known = mapping.region_of()?;
        let bea = mapping
            .bea_areas
            .iter()
            .filter(|(iso, _)| known.contains_key(*iso))
            .map(|(iso, area)| (iso.clone(), area.clone()))
            .collect();
        let census = census
            .iter()
            .filter(|c| known.contains_key(&c.iso))
            .map(|c| (c.iso.clone(), c.code.clone()))
            .collect();
        Ok(Self { bea, census })
    }

    pub fn bea_areas(&self) -> Vec<String> {
        self.bea.values().cloned().collect()
    }

    pub fn census_codes(&self) -> Vec<String> {
        self.census.values().cloned().collect()
    }

    fn reverse(map: &BTreeMap<String, String>) -> HashMap<&str, &str> {
        map.iter().map(|(iso, id)| (id.as_str(), iso.as_str())).collect()
    }
}

fn parse_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

fn long_frame(
    rows: Vec<(String, String, f64)>,
    source: &str,
    year: i32,
) -> Result<DataFrame> {
    let n = rows.len();
    let mut sectors = Vec::with_capacity(n);
    let mut countries = Vec::with_capacity(n);
    let mut values = Vec::with_capacity(n);
    for (s, c, v) in rows {
        sectors.push(s);
        countries.push(c);
        values.push(v);
    }
    Ok(DataFrame::new(vec![
        Column::new(imports::BEA_SECTOR.into(), &sectors),
        Column::new(region::COUNTRY.into(), &countries),
        Column::new(imports::IMPORT_QUANTITY.into(), &values),
        Column::new(imports::UNIT.into(), vec!["USD"; n]),
        Column::new(imports::SOURCE.into(), vec![source; n]),
        Column::new(imports::YEAR.into(), vec![year; n]),
    ])?)
}

/// BEA services imports: BEA Sector, Country, Import Quantity (USD), Unit,
/// Source, Year.
///
/// `mapping` carries `API BEA Service` and `BEA Sector`; every mapping row
/// yields a sector, services with no data count 0. A sector reached by two
/// services is an error.
pub fn parse_bea_services(cache: &ResponseCache, schema: &CountrySchema, mapping: &DataFrame) -> Result<DataFrame> {
    tables::require_columns(mapping, &[API_SERVICE_COLUMN, imports::BEA_SECTOR])?;
    let iso_of = CountrySchema::reverse(&schema.bea);

    // country → service → value
    let mut by_country: BTreeMap<String, HashMap<String, f64>> = BTreeMap::new();
    for resp in cache.responses.values() {
        let Some(iso) = iso_of.get(resp.country.as_str()) else {
            log::warn!("BEA response for unknown area '{}' skipped", resp.country);
            continue;
        };
        let data = resp
            .data
            .pointer("/BEAAPI/Results/Data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| {
                ImportsError::InvalidData(format!("BEA response for '{}' has no Results.Data", resp.country))
            })?;
        let services = by_country.entry(iso.to_string()).or_default();
        for item in data {
            let Some(service) = item.get("TypeOfService").and_then(|s| s.as_str()) else {
                continue;
            };
            if let Some(v) = item.get("DataValue").and_then(parse_number) {
                services.insert(service.to_string(), v);
            }
        }
    }

    let services = tables::string_values(mapping, API_SERVICE_COLUMN)?;
    let sectors = tables::string_values(mapping, imports::BEA_SECTOR)?;
    let pairs: Vec<(String, String)> = services
        .into_iter()
        .zip(sectors)
        .filter_map(|(s, b)| Some((s?, b?)))
        .collect();

    let mut seen = BTreeSet::new();
    let duplicates: BTreeSet<&str> = pairs
        .iter()
        .filter(|(_, b)| !seen.insert(b.as_str()))
        .map(|(_, b)| b.as_str())
        .collect();
    if !duplicates.is_empty() {
        return Err(ImportsError::DuplicateKeys {
            table: "BEA service mapping".into(),
            keys: duplicates.into_iter().collect::<Vec<_>>().join(", "),
        });
    }

    let mut rows = Vec::with_capacity(pairs.len() * by_country.len());
    for (iso, values) in &by_country {
        for (service, sector) in &pairs {
            let v = values.get(service).copied().unwrap_or(0.0);
            rows.push((sector.clone(), iso.clone(), v * BEA_SCALE));
        }
    }
    log::info!(
        "Parsed BEA services for {} countries and {} sectors",
        by_country.len(),
        pairs.len()
    );
    long_frame(rows, BEA, cache.year)
}

/// Census goods imports by NAICS, mapped to BEA sectors: BEA Sector,
/// Country, Import Quantity (USD), Unit, Source, Year.
///
/// `mapping` carries `NAICS` and `BEA Sector`. Values are truncated to whole
/// dollars; NAICS codes with no BEA sector are dropped with a warning.
pub fn parse_census_goods(cache: &ResponseCache, schema: &CountrySchema, mapping: &DataFrame) -> Result<DataFrame> {
    tables::require_columns(mapping, &[imports::NAICS, imports::BEA_SECTOR])?;
    let iso_of = CountrySchema::reverse(&schema.census);

    let naics = tables::string_values(mapping, imports::NAICS)?;
    let sectors = tables::string_values(mapping, imports::BEA_SECTOR)?;
    let mut sector_of: HashMap<String, Vec<String>> = HashMap::new();
    for (n, s) in naics.into_iter().zip(sectors) {
        if let (Some(n), Some(s)) = (n, s) {
            sector_of.entry(n).or_default().push(s);
        }
    }

    let mut totals: BTreeMap<(String, String), f64> = BTreeMap::new();
    let mut unmapped = BTreeSet::new();
    for resp in cache.responses.values() {
        let Some(iso) = iso_of.get(resp.country.as_str()) else {
            log::warn!("Census response for unknown code '{}' skipped", resp.country);
            continue;
        };
        let table = resp.data.as_array().ok_or_else(|| {
            ImportsError::InvalidData(format!("Census response for '{}' is not a table", resp.country))
        })?;
        let Some(header) = table.first().and_then(|h| h.as_array()) else {
            continue;
        };
        let position = |name: &str| {
            header
                .iter()
                .position(|h| h.as_str() == Some(name))
                .ok_or_else(|| ImportsError::MissingColumn(format!("Census response: {name}")))
        };
        let (naics_at, value_at) = (position(imports::NAICS)?, position("GEN_CIF_YR")?);

        for row in table.iter().skip(1).filter_map(|r| r.as_array()) {
            let Some(code) = row.get(naics_at).and_then(|c| c.as_str()) else {
                continue;
            };
            let value = row.get(value_at).and_then(parse_number).unwrap_or(0.0).trunc();
            match sector_of.get(code) {
                Some(targets) => {
                    for sector in targets {
                        *totals.entry((sector.clone(), iso.to_string())).or_insert(0.0) += value;
                    }
                }
                None => {
                    unmapped.insert(code.to_string());
                }
            }
        }
    }
    if !unmapped.is_empty() {
        log::warn!("{} NAICS codes have no BEA sector: {:?}", unmapped.len(), unmapped);
    }

    // sector-major like the services frame
    let mut rows: Vec<(String, String, f64)> = totals
        .into_iter()
        .map(|((s, c), v)| (s, c, v))
        .collect();
    rows.sort_by(|a, b| (&a.1, &a.0).cmp(&(&b.1, &b.0)));
    log::info!("Parsed {} Census goods import cells", rows.len());
    long_frame(rows, CENSUS, cache.year)
}

/// Replay cached BEA and Census responses for the configured year.
pub fn load_api_imports(
    config: &PipelineConfig,
    cfg: &ApiImportsConfig,
    mapping: &RegionMapping,
) -> Result<DataFrame> {
    let census_path = config.resolve(&cfg.census_countries);
    if !census_path.exists() {
        return Err(ImportsError::MissingFile(census_path.display().to_string()));
    }
    let census_countries = parse_census_countries(&fs::read_to_string(&census_path)?)?;
    let schema = CountrySchema::build(mapping, &census_countries)?;
    let cache_dir = config.resolve(&cfg.cache_dir);

    let bea_mapping = tables::read_csv_as_strings(&config.resolve(&cfg.bea_mapping), None)?;
    let census_mapping = tables::read_csv_as_strings(&config.resolve(&cfg.census_mapping), None)?;

    let bea = parse_bea_services(&ResponseCache::read(&cache_dir, BEA, config.year)?, &schema, &bea_mapping)?;
    let census = parse_census_goods(
        &ResponseCache::read(&cache_dir, CENSUS, config.year)?,
        &schema,
        &census_mapping,
    )?;
    Ok(census.vstack(&bea)?)
}

/// Country-level imports summed to macro-regions: BEA Sector, TiVA Region,
/// Import Quantity. Countries without a region are dropped with a warning.
pub fn regionalize(country_imports: &DataFrame, mapping: &RegionMapping) -> Result<DataFrame> {
    let joined = mapping.attach(country_imports)?;
    let df = joined
        .lazy()
        .filter(col(region::TIVA_REGION).is_not_null())
        .group_by_stable([col(imports::BEA_SECTOR), col(region::TIVA_REGION)])
        .agg([col(imports::IMPORT_QUANTITY).sum()])
        .sort(
            [imports::BEA_SECTOR, region::TIVA_REGION],
            SortMultipleOptions::default(),
        )
        .collect()?;
    warn_negative_imports(&df)?;
    Ok(df)
}

/// Imports for the configured source at its reported sector level.
pub fn assemble(config: &PipelineConfig, mapping: &RegionMapping) -> Result<DataFrame> {
    match &config.imports {
        crate::config::ImportsSource::RegionMatrices(cfg) => assemble_region_matrices(config, cfg),
        crate::config::ImportsSource::ApiCache(cfg) => {
            let by_country = load_api_imports(config, cfg, mapping)?;
            regionalize(&by_country, mapping)
        }
    }
}

/// Re-key imports from `from` codes to `to` codes through `concordance` and
/// sum. Codes with no target are dropped with a warning.
pub fn roll_up(
    df: &DataFrame,
    from: &str,
    to: &str,
    concordance: &crate::concordance::Concordance,
) -> Result<DataFrame> {
    let lookup = concordance
        .frame
        .clone()
        .lazy()
        .select([col(concordance.source.as_str()).alias(from), col(concordance.target.as_str()).alias(to)]);
    let joined = df
        .clone()
        .lazy()
        .join(lookup, [col(from)], [col(from)], JoinArgs::new(JoinType::Left))
        .collect()?;
    let lost = joined.clone().lazy().filter(col(to).is_null()).collect()?;
    if lost.height() > 0 {
        let codes: BTreeSet<String> = tables::string_values(&lost, from)?.into_iter().flatten().collect();
        log::warn!("{} import codes have no '{to}' sector: {:?}", codes.len(), codes);
    }
    Ok(joined
        .lazy()
        .filter(col(to).is_not_null())
        .group_by_stable([col(to), col(region::TIVA_REGION)])
        .agg([col(imports::IMPORT_QUANTITY).sum()])
        .sort([to, region::TIVA_REGION], SortMultipleOptions::default())
        .collect()?)
}

/// Append each region's share of total imports within its sector, with the
/// range and group-sum findings for that share.
pub fn import_shares(df: &DataFrame, sector: &str) -> Result<(DataFrame, ShareValidation)> {
    let spec = ShareSpec::new(share::SHARE_IMPORTS, &[sector], &[region::TIVA_REGION, sector]);
    let out = contribution::contribution_coefficients(df, imports::IMPORT_QUANTITY, &[spec.clone()])?;
    let findings = contribution::validate_shares(&out, &spec)?;
    Ok((out, findings))
}

pub fn warn_negative_imports(df: &DataFrame) -> Result<()> {
    let negative = df
        .clone()
        .lazy()
        .filter(col(imports::IMPORT_QUANTITY).lt(lit(0.0)))
        .collect()?;
    if negative.height() > 0 {
        let sectors: BTreeSet<String> = tables::string_values(&negative, negative.get_column_names_str()[0])?
            .into_iter()
            .flatten()
            .collect();
        log::warn!(
            "{} negative import quantities, sectors: {:?}",
            negative.height(),
            sectors
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::CachedResponse;
    use chrono::Utc;
    use serde_json::json;

    fn matrix_cfg() -> RegionMatrixConfig {
        serde_yaml::from_str(
            r#"
file_template: "Import Matrix, __region__.csv"
regions: {}
header_rows: 2
footer_rows: 1
drop_columns: ["Name"]
drop_codes: ["Total"]
"#,
        )
        .unwrap()
    }

    #[test]
    fn region_matrix_sums_partner_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.csv");
        fs::write(
            &path,
            "Import matrix\nMillions of dollars\nCode,Name,P1,P2\n111CA,Farms,-10,-5\n211,Oil,3,-2\n111CA,Farms,-1,\nTotal,,-15,-7\n",
        )
        .unwrap();
        let totals = read_region_matrix(&path, &matrix_cfg()).unwrap();
        assert_eq!(
            totals,
            vec![("111CA".to_string(), -16.0), ("211".to_string(), 1.0)]
        );
    }

    #[test]
    fn exports_are_zeroed_then_imports_negated() {
        let df = df!(imports::IMPORT_QUANTITY => &[-16.0, 1.0, 0.0]).unwrap();
        let lf = remove_exports(df.lazy(), imports::IMPORT_QUANTITY);
        let out = negate(lf, imports::IMPORT_QUANTITY).collect().unwrap();
        assert_eq!(
            tables::float_values(&out, imports::IMPORT_QUANTITY).unwrap(),
            vec![Some(16.0), Some(0.0), Some(0.0)]
        );
    }

    #[test]
    fn assembled_matrices_fill_missing_sectors_with_zero() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("Import Matrix, Canada.csv"),
            "h\nh\nCode,Name,P1\n111CA,Farms,-4\nTotal,,-4\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("Import Matrix, China.csv"),
            "h\nh\nCode,Name,P1\n211,Oil,-6\nTotal,,-6\n",
        )
        .unwrap();
        let mut cfg = matrix_cfg();
        cfg.regions = BTreeMap::from([("Canada".into(), "CA".into()), ("China".into(), "CN".into())]);

        let mut config = crate::config::PipelineConfig::from_yaml_str(
            r#"
year: 2020
model: { industry_output: x.csv, multipliers: m.csv }
imports: { kind: region_matrices, file_template: "Import Matrix, __region__.csv", regions: {} }
regions: { file: r.csv }
concordances: []
"#,
        )
        .unwrap();
        config.base_path = dir.path().to_path_buf();

        let df = assemble_region_matrices(&config, &cfg).unwrap();
        assert_eq!(df.height(), 4);
        assert_eq!(
            tables::float_values(&df, imports::IMPORT_QUANTITY).unwrap(),
            vec![Some(4.0), Some(0.0), Some(0.0), Some(6.0)]
        );
        assert_eq!(
            tables::string_values(&df, region::TIVA_REGION).unwrap()[3].as_deref(),
            Some("CN")
        );
    }

    #[test]
    fn census_country_list_skips_notes() {
        let text = "Schedule C country codes\n\nCode | Name | ISO Code\n1000 | United States of America | US\n5700 | China | CN\n4280 | Germany | DE\n";
        let list = parse_census_countries(text).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[1], CensusCountry { code: "5700".into(), name: "China".into(), iso: "CN".into() });
    }

    fn schema() -> CountrySchema {
        CountrySchema {
            bea: BTreeMap::from([("CN".into(), "China".into()), ("DE".into(), "Germany".into())]),
            census: BTreeMap::from([("CN".into(), "5700".into()), ("DE".into(), "4280".into())]),
        }
    }

    fn cache(source: &str, responses: Vec<(&str, serde_json::Value)>) -> ResponseCache {
        ResponseCache {
            source: source.into(),
            year: 2020,
            fetched_at: Utc::now(),
            responses: responses
                .into_iter()
                .map(|(c, data)| (format!("2020_{c}"), CachedResponse { country: c.into(), data }))
                .collect(),
        }
    }

    fn bea_data(items: serde_json::Value) -> serde_json::Value {
        json!({ "BEAAPI": { "Results": { "Data": items } } })
    }

    #[test]
    fn bea_services_scale_and_map_every_sector() {
        let c = cache(
            BEA,
            vec![
                ("China", bea_data(json!([
                    { "TypeOfService": "Transport", "DataValue": "1.5" },
                    { "TypeOfService": "Travel", "DataValue": "(D)" }
                ]))),
                ("Germany", bea_data(json!([{ "TypeOfService": "Travel", "DataValue": "2" }]))),
            ],
        );
        let mapping = df!(
            API_SERVICE_COLUMN => &["Transport", "Travel", "Insurance"],
            imports::BEA_SECTOR => &["48", "721", "524"]
        )
        .unwrap();

        let df = parse_bea_services(&c, &schema(), &mapping).unwrap();
        assert_eq!(df.height(), 6);
        assert_eq!(
            tables::float_values(&df, imports::IMPORT_QUANTITY).unwrap(),
            vec![Some(1.5e6), Some(0.0), Some(0.0), Some(0.0), Some(2e6), Some(0.0)]
        );
        assert_eq!(tables::string_values(&df, region::COUNTRY).unwrap()[0].as_deref(), Some("CN"));
    }

    #[test]
    fn bea_duplicate_sectors_are_an_error() {
        let c = cache(BEA, vec![("China", bea_data(json!([])))]);
        let mapping = df!(
            API_SERVICE_COLUMN => &["Transport", "Freight"],
            imports::BEA_SECTOR => &["48", "48"]
        )
        .unwrap();
        let err = parse_bea_services(&c, &schema(), &mapping).unwrap_err();
        assert!(matches!(err, ImportsError::DuplicateKeys { .. }));
    }

    #[test]
    fn census_goods_truncate_and_sum_by_sector() {
        let c = cache(
            CENSUS,
            vec![(
                "5700",
                json!([
                    ["NAICS", "GEN_CIF_YR", "CTY_CODE"],
                    ["111", "10.9", "5700"],
                    ["112", "5", "5700"],
                    ["999", "7", "5700"]
                ]),
            )],
        );
        let mapping = df!(
            imports::NAICS => &["111", "112"],
            imports::BEA_SECTOR => &["111CA", "111CA"]
        )
        .unwrap();

        let df = parse_census_goods(&c, &schema(), &mapping).unwrap();
        assert_eq!(df.height(), 1);
        assert_eq!(tables::float_values(&df, imports::IMPORT_QUANTITY).unwrap(), vec![Some(15.0)]);
        assert_eq!(tables::string_values(&df, imports::SOURCE).unwrap()[0].as_deref(), Some(CENSUS));
    }

    #[test]
    fn regionalize_sums_countries_and_drops_orphans() {
        let mapping = RegionMapping::from_frame(
            df!(region::COUNTRY => &["CN", "DE", "FR"], region::TIVA_REGION => &["CN", "EU", "EU"]).unwrap(),
        )
        .unwrap();
        let df = df!(
            imports::BEA_SECTOR => &["48", "48", "48", "48"],
            region::COUNTRY => &["DE", "FR", "CN", "ZZ"],
            imports::IMPORT_QUANTITY => &[1.0, 2.0, 4.0, 8.0]
        )
        .unwrap();
        let out = regionalize(&df, &mapping).unwrap();
        assert_eq!(
            tables::string_values(&out, region::TIVA_REGION).unwrap(),
            vec![Some("CN".to_string()), Some("EU".to_string())]
        );
        assert_eq!(
            tables::float_values(&out, imports::IMPORT_QUANTITY).unwrap(),
            vec![Some(4.0), Some(3.0)]
        );
    }

    #[test]
    fn import_shares_split_each_sector_over_regions() {
        let df = df!(
            imports::BEA_SECTOR => &["111CA", "111CA", "211"],
            region::TIVA_REGION => &["CA", "CN", "CA"],
            imports::IMPORT_QUANTITY => &[1.0, 3.0, 0.0]
        )
        .unwrap();
        let (out, findings) = import_shares(&df, imports::BEA_SECTOR).unwrap();
        assert_eq!(
            tables::float_values(&out, share::SHARE_IMPORTS).unwrap(),
            vec![Some(0.25), Some(0.75), Some(0.0)]
        );
        assert!(findings.is_clean());
    }

    #[test]
    fn net_exporting_region_is_reported_by_import_shares() {
        // CA kept a net export, so its share goes negative and CN's exceeds 1
        let df = df!(
            imports::BEA_SECTOR => &["111CA", "111CA"],
            region::TIVA_REGION => &["CA", "CN"],
            imports::IMPORT_QUANTITY => &[-1.0, 3.0]
        )
        .unwrap();
        let (_, findings) = import_shares(&df, imports::BEA_SECTOR).unwrap();
        assert_eq!(findings.share, share::SHARE_IMPORTS);
        assert_eq!(findings.out_of_range.len(), 2);
        assert!(!findings.is_clean());
    }
}
