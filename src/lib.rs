//! Import-weighted greenhouse-gas emission factors.
//!
//! Country-sector multipliers from a multi-region IO model are blended into
//! region averages by output or trade weights, mapped onto BEA sectors
//! through chained concordances, and weighted again by each region's share
//! of U.S. imports.

pub mod aggregation;
pub mod concordance;
pub mod config;
pub mod contribution;
pub mod error;
pub mod fetch;
pub mod imports;
pub mod mrio;
pub mod pipeline;
pub mod regions;
pub mod schema;
pub mod scheme_graph;
pub mod tables;
pub mod weighting;

pub use concordance::{Concordance, ConcordanceRegistry};
pub use config::PipelineConfig;
pub use error::{ImportsError, Result};
pub use fetch::{Fetcher, HttpFetcher};
pub use pipeline::{ImportFactorPipeline, PipelineOutput, PipelineReport};
