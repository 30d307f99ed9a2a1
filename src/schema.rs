/// Column-name constants for the imports emission-factor pipeline.
/// Single source of truth for every relation passed between stages.

// ── Classification schemes ──────────────────────────────────────────────────
pub mod scheme {
    pub const GLORIA: &str = "GLORIA Sector";
    pub const HSCPC: &str = "HSCPC Sector";
    pub const ISIC4: &str = "ISIC4 Sector";
    pub const NAICS_2012: &str = "NAICS 2012 Sector";
    pub const EXIOBASE: &str = "Exiobase Sector";
    pub const BEA_DETAIL: &str = "BEA Detail";
    pub const BEA_SUMMARY: &str = "BEA Summary";
}

// ── Region mapping columns ──────────────────────────────────────────────────
pub mod region {
    pub const COUNTRY: &str = "Country";
    pub const TIVA_REGION: &str = "TiVA Region";
}

// ── Imports columns ─────────────────────────────────────────────────────────
pub mod imports {
    pub const BEA_SECTOR: &str = "BEA Sector";
    pub const NAICS: &str = "NAICS";
    pub const IMPORT_QUANTITY: &str = "Import Quantity";
    pub const UNIT: &str = "Unit";
    pub const SOURCE: &str = "Source";
    pub const YEAR: &str = "Year";
}

// ── Model weighting columns ─────────────────────────────────────────────────
pub mod weights {
    pub const QUANTITY: &str = "Weight Quantity";
    pub const INDUSTRY_OUTPUT: &str = "indout";
}

// ── Emission multiplier columns ─────────────────────────────────────────────
pub mod multiplier {
    pub const FLOW: &str = "Flow";
    pub const EF: &str = "EF";
}

// ── Contribution coefficient columns ────────────────────────────────────────
pub mod contribution {
    pub const SHARE_SECTOR: &str = "region_contributions_sector";
    pub const SHARE_DETAIL: &str = "region_contributions_detail";
    pub const SHARE_SUMMARY: &str = "region_contributions_summary";
    pub const SHARE_IMPORTS: &str = "region_contributions_imports";
}

// ── Weighted multiplier columns ─────────────────────────────────────────────
pub mod weighted {
    pub const AMOUNT: &str = "Amount";
}

// ── Export metadata columns ─────────────────────────────────────────────────
pub mod export {
    pub const UNIT: &str = "Unit";
    pub const CURRENCY_YEAR: &str = "CurrencyYear";
    pub const DATA_YEAR: &str = "DataYear";
    pub const PRICE_TYPE: &str = "PriceType";
}

// ── Diagnostics columns ─────────────────────────────────────────────────────
pub mod diagnostics {
    pub const ISSUE: &str = "Issue";
    pub const NO_EMISSION_FACTOR: &str = "imports without emission factor";
}

/// Placeholder tokens substituted into paths and request templates.
pub mod placeholder {
    pub const YEAR: &str = "__year__";
    pub const COUNTRY: &str = "__areaorcountry__";
    pub const REGION: &str = "__region__";
    pub const API_KEY: &str = "__key__";
}
