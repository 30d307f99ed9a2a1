use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use polars::prelude::*;

use crate::aggregation::{self, ExportMetadata, OutputWriter};
use crate::concordance::{Concordance, ConcordanceRegistry};
use crate::config::{Granularity, ImportsSource, PipelineConfig, RequestConfig, SectorLevel};
use crate::contribution::{self, ShareSpec, ShareValidation};
use crate::error::{ImportsError, Result};
use crate::fetch::{self, Fetcher};
use crate::imports::{self, CountrySchema};
use crate::mrio::{self, ModelSnapshot};
use crate::regions::RegionMapping;
use crate::schema::{contribution as share, imports as imports_col, region, scheme, weights};
use crate::weighting::{self, CoverageReport, WeightingLevel};

/// Model sector → BEA sector mappings used to key the weights.
#[derive(Debug, Clone)]
pub struct SectorLevels {
    /// model sector → BEA Detail, when the concordances reach detail level.
    pub to_detail: Option<Concordance>,
    /// BEA Detail → BEA Summary when `to_detail` is set, otherwise
    /// model sector → BEA Summary.
    pub to_summary: Concordance,
}

/// Every relation produced by one run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub coefficients: DataFrame,
    pub sector_weighted: DataFrame,
    pub detail_weighted: Option<DataFrame>,
    pub summary_weighted: DataFrame,
    pub import_shares: DataFrame,
    pub factors: DataFrame,
    pub excluded: DataFrame,
    pub report: PipelineReport,
}

/// Non-fatal findings collected during a run.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub share_findings: Vec<ShareValidation>,
    pub missing_multipliers: BTreeSet<String>,
    pub coverage: CoverageReport,
    pub excluded_pairs: usize,
}

impl PipelineReport {
    pub fn is_clean(&self) -> bool {
        self.share_findings.iter().all(|f| f.is_clean())
            && self.missing_multipliers.is_empty()
            && self.coverage.missing.is_empty()
    }
}

pub struct ImportFactorPipeline {
    config: PipelineConfig,
}

impl ImportFactorPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn model_sector(&self) -> &str {
        self.config.model_scheme.as_str()
    }

    fn terminal_scheme(&self) -> &'static str {
        self.config.granularity.scheme()
    }

    // ── Fetch phase ─────────────────────────────────────────────────────────

    /// Request every configured BEA and Census year, then replace the cache
    /// in one step. A failed request leaves the previous cache untouched.
    pub fn fetch(&self, fetcher: &dyn Fetcher, api_key: Option<&str>) -> Result<Vec<PathBuf>> {
        let ImportsSource::ApiCache(api) = &self.config.imports else {
            return Err(ImportsError::Config(
                "fetch requires imports.kind = api_cache".into(),
            ));
        };
        let mapping = RegionMapping::load(&self.config.resolve(&self.config.regions.file), &self.config.regions)?;
        let census_path = self.config.resolve(&api.census_countries);
        if !census_path.exists() {
            return Err(ImportsError::MissingFile(census_path.display().to_string()));
        }
        let census = imports::parse_census_countries(&fs::read_to_string(&census_path)?)?;
        let schema = CountrySchema::build(&mapping, &census)?;
        let cache_dir = self.config.resolve(&api.cache_dir);

        let bea_cfg = RequestConfig::from_yaml_file(&self.config.resolve(&api.bea_request))?;
        let bea_reqs = fetch::build_requests(&bea_cfg, &schema.bea_areas(), &[], api_key);
        let census_cfg = RequestConfig::from_yaml_file(&self.config.resolve(&api.census_request))?;
        let census_reqs = fetch::build_requests(
            &census_cfg,
            &schema.census_codes(),
            &api.census_skip_codes,
            api_key,
        );

        fetch::fetch_and_cache(
            fetcher,
            &[(imports::BEA, &bea_reqs), (imports::CENSUS, &census_reqs)],
            &cache_dir,
        )
    }

    // ── Processing phase ────────────────────────────────────────────────────

    pub fn resolve_levels(&self, registry: &ConcordanceRegistry) -> Result<SectorLevels> {
        let model = self.model_sector();
        if registry.connects(model, scheme::BEA_DETAIL) {
            return Ok(SectorLevels {
                to_detail: Some(registry.resolve(model, scheme::BEA_DETAIL)?),
                to_summary: registry.resolve(scheme::BEA_DETAIL, scheme::BEA_SUMMARY)?,
            });
        }
        if self.config.granularity == Granularity::Detail {
            return Err(ImportsError::NoConcordancePath {
                from: model.to_string(),
                to: scheme::BEA_DETAIL.to_string(),
            });
        }
        Ok(SectorLevels {
            to_detail: None,
            to_summary: registry.resolve(model, scheme::BEA_SUMMARY)?,
        })
    }

    /// Weights keyed by region and every BEA level they reach. Unmapped
    /// sectors keep null level keys.
    pub fn prepare(&self, weights_df: &DataFrame, mapping: &RegionMapping, levels: &SectorLevels) -> Result<DataFrame> {
        let model = self.model_sector();
        let mut lf = mapping.attach(weights_df)?.lazy();
        let join = |lf: LazyFrame, c: &Concordance| {
            lf.join(
                c.frame.clone().lazy(),
                [col(c.source.as_str())],
                [col(c.source.as_str())],
                JoinArgs::new(JoinType::Left),
            )
        };
        match &levels.to_detail {
            Some(to_detail) => {
                lf = join(lf, to_detail);
                lf = join(lf, &levels.to_summary);
            }
            None => lf = join(lf, &levels.to_summary),
        }
        let df = lf.collect()?;

        let unmapped = df
            .clone()
            .lazy()
            .filter(col(scheme::BEA_SUMMARY).is_null())
            .collect()?;
        if unmapped.height() > 0 {
            let sectors: BTreeSet<String> = crate::tables::string_values(&unmapped, model)?
                .into_iter()
                .flatten()
                .collect();
            log::warn!(
                "{} weight rows have no BEA Summary sector and carry no weight there: {:?}",
                unmapped.height(),
                sectors
            );
        }
        log::info!("Prepared {} weight rows ({} input)", df.height(), weights_df.height());
        Ok(df)
    }

    fn share_specs(&self, levels: &SectorLevels) -> Vec<ShareSpec> {
        let model = self.model_sector();
        let entity = [region::COUNTRY, model];
        let mut specs = vec![ShareSpec::new(share::SHARE_SECTOR, &[region::TIVA_REGION, model], &entity)];
        if levels.to_detail.is_some() {
            specs.push(ShareSpec::new(share::SHARE_DETAIL, &[region::TIVA_REGION, scheme::BEA_DETAIL], &entity));
        }
        specs.push(ShareSpec::new(share::SHARE_SUMMARY, &[region::TIVA_REGION, scheme::BEA_SUMMARY], &entity));
        specs
    }

    /// Imports at the terminal level with each region's share per sector.
    pub fn import_shares(
        &self,
        registry: &ConcordanceRegistry,
        mapping: &RegionMapping,
    ) -> Result<(DataFrame, ShareValidation)> {
        let reported = match self.config.imports.sector_level() {
            SectorLevel::Detail => scheme::BEA_DETAIL,
            SectorLevel::Summary => scheme::BEA_SUMMARY,
        };
        let raw = imports::assemble(&self.config, mapping)?
            .lazy()
            .rename([imports_col::BEA_SECTOR], [reported], true)
            .collect()?;

        let terminal = self.terminal_scheme();
        let at_terminal = if reported == terminal {
            raw
        } else {
            let to_summary = registry.resolve(reported, terminal)?;
            imports::roll_up(&raw, reported, terminal, &to_summary)?
        };
        imports::import_shares(&at_terminal, terminal)
    }

    /// Run every processing stage on cached or static inputs.
    pub fn run(&self) -> Result<PipelineOutput> {
        let config = &self.config;
        log::info!(
            "Running import factor pipeline for {} ({:?} weighting, {:?} granularity)",
            config.year,
            config.weighting,
            config.granularity
        );
        let model = self.model_sector();

        let registry = ConcordanceRegistry::from_config(config)?;
        let levels = self.resolve_levels(&registry)?;
        let mapping = RegionMapping::load(&config.resolve(&config.regions.file), &config.regions)?;
        let ModelSnapshot {
            weights: weights_df,
            multipliers,
            excluded,
        } = mrio::extract(config)?;

        let prepared = self.prepare(&weights_df, &mapping, &levels)?;
        let specs = self.share_specs(&levels);
        let coefficients = contribution::contribution_coefficients(&prepared, weights::QUANTITY, &specs)?;
        let mut share_findings = specs
            .iter()
            .map(|s| contribution::validate_shares(&coefficients, s))
            .collect::<Result<Vec<_>>>()?;

        let (joined, missing) = weighting::attach_multipliers(&coefficients, &multipliers, model)?;
        let sector_weighted = weighting::weighted_sum(&joined, &WeightingLevel::sector(model))?;
        let detail_weighted = match levels.to_detail {
            Some(_) => Some(weighting::weighted_sum(&joined, &WeightingLevel::detail(scheme::BEA_DETAIL))?),
            None => None,
        };
        let summary_weighted = weighting::weighted_sum(&joined, &WeightingLevel::summary(scheme::BEA_SUMMARY))?;

        let (import_shares, import_findings) = self.import_shares(&registry, &mapping)?;
        share_findings.push(import_findings);
        let terminal = self.terminal_scheme();
        let level_weighted = match config.granularity {
            Granularity::Summary => &summary_weighted,
            Granularity::Detail => detail_weighted.as_ref().ok_or_else(|| ImportsError::NoConcordancePath {
                from: model.to_string(),
                to: scheme::BEA_DETAIL.to_string(),
            })?,
        };
        let weighted_imports = weighting::import_weighted(level_weighted, &import_shares, terminal)?;
        let coverage = weighting::coverage(&import_shares, level_weighted, terminal)?;
        let factors = aggregation::export_factors(&weighted_imports, terminal, &ExportMetadata::from_config(config))?;

        let report = PipelineReport {
            share_findings,
            missing_multipliers: missing.pairs,
            coverage,
            excluded_pairs: excluded.height(),
        };
        log::info!(
            "Produced {} import factors; {} sectors without coverage",
            factors.height(),
            report.coverage.missing.len()
        );
        Ok(PipelineOutput {
            coefficients,
            sector_weighted,
            detail_weighted,
            summary_weighted,
            import_shares,
            factors,
            excluded,
            report,
        })
    }

    /// Persist every relation of `output` under the configured output dir.
    pub fn write(&self, output: &PipelineOutput) -> Result<Vec<PathBuf>> {
        let writer = OutputWriter::new(&self.config.resolve(&self.config.output_dir), self.config.year);
        let mut written = vec![
            writer.write("import_factors", &output.factors)?,
            writer.write("weighted_multipliers_sector", &output.sector_weighted)?,
            writer.write("weighted_multipliers_summary", &output.summary_weighted)?,
            writer.write("import_shares", &output.import_shares)?,
            writer.write("contribution_coefficients", &output.coefficients)?,
            writer.write("excluded_outliers", &output.excluded)?,
            writer.write("coverage_gaps", &output.report.coverage.to_frame(self.terminal_scheme())?)?,
        ];
        if let Some(detail) = &output.detail_weighted {
            written.push(writer.write("weighted_multipliers_detail", detail)?);
        }
        Ok(written)
    }

    pub fn run_and_write(&self) -> Result<(PipelineOutput, Vec<PathBuf>)> {
        let output = self.run()?;
        let written = self.write(&output)?;
        Ok((output, written))
    }
}
