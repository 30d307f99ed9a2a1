use polars::prelude::*;

use crate::error::Result;
use crate::tables;

/// Tolerance for share range and group-sum checks.
pub const SHARE_TOLERANCE: f64 = 1e-5;

/// One contribution coefficient column.
///
/// `share = quantity / Σ quantity` within each `group`. A row whose entity
/// (e.g. one country-sector) repeats inside a group because of concordance
/// fan-out contributes its quantity once in total, split evenly over the
/// repeats. Rows with a null group key are unmapped: they get share 0 and
/// add nothing to any denominator.
#[derive(Debug, Clone)]
pub struct ShareSpec {
    pub name: String,
    pub group: Vec<String>,
    pub entity: Vec<String>,
}

impl ShareSpec {
    pub fn new(name: &str, group: &[&str], entity: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            group: group.iter().map(|s| s.to_string()).collect(),
            entity: entity.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn partition(&self) -> Vec<Expr> {
        let mut keys: Vec<&String> = self.entity.iter().collect();
        for g in &self.group {
            if !keys.contains(&g) {
                keys.push(g);
            }
        }
        keys.into_iter().map(|k| col(k.as_str())).collect()
    }

    fn group_exprs(&self) -> Vec<Expr> {
        self.group.iter().map(|g| col(g.as_str())).collect()
    }

    fn mapped(&self) -> Expr {
        self.group
            .iter()
            .map(|g| col(g.as_str()).is_not_null())
            .reduce(|a, b| a.and(b))
            .unwrap_or_else(|| lit(true))
    }
}

/// Append one share column per `ShareSpec`, side by side; nothing is composed.
pub fn contribution_coefficients(df: &DataFrame, quantity: &str, specs: &[ShareSpec]) -> Result<DataFrame> {
    tables::require_columns(df, &[quantity])?;
    for spec in specs {
        let keys: Vec<&str> = spec
            .group
            .iter()
            .chain(spec.entity.iter())
            .map(|s| s.as_str())
            .collect();
        tables::require_columns(df, &keys)?;
    }

    let mut keep: Vec<Expr> = df
        .get_column_names_str()
        .iter()
        .map(|c| col(*c))
        .collect();
    let mut lf = df
        .clone()
        .lazy()
        .with_column(col(quantity).fill_null(lit(0.0)).alias(quantity));

    for spec in specs {
        let weight = format!("_w_{}", spec.name);
        // entity weight, split over fan-out repeats, zero when unmapped
        lf = lf.with_column(
            when(spec.mapped())
                .then(col(quantity) / col(quantity).count().over(spec.partition()).cast(DataType::Float64))
                .otherwise(lit(0.0))
                .alias(weight.as_str()),
        );
        let total = col(weight.as_str()).sum().over(spec.group_exprs());
        lf = lf.with_column(
            when(total.clone().eq(lit(0.0)))
                .then(lit(0.0))
                .otherwise(col(weight.as_str()) / total)
                .alias(spec.name.as_str()),
        );
        keep.push(col(spec.name.as_str()));
    }

    let out = lf.select(keep).collect()?;
    log::debug!("Computed {} share columns over {} rows", specs.len(), out.height());
    Ok(out)
}

/// Findings from checking one share column. Never fatal.
#[derive(Debug, Clone, Default)]
pub struct ShareValidation {
    pub share: String,
    /// Rows with a share outside [0, 1], described by their group keys.
    pub out_of_range: Vec<String>,
    /// Groups with a nonzero denominator whose shares do not sum to 1.
    pub bad_group_sums: Vec<(String, f64)>,
}

impl ShareValidation {
    pub fn is_clean(&self) -> bool {
        self.out_of_range.is_empty() && self.bad_group_sums.is_empty()
    }
}

/// Check range and group sums of `spec.name`, logging every finding with
/// the offending keys.
pub fn validate_shares(df: &DataFrame, spec: &ShareSpec) -> Result<ShareValidation> {
    let share = spec.name.as_str();
    let mut report = ShareValidation {
        share: share.to_string(),
        ..Default::default()
    };

    let mut described: Vec<Expr> = spec.group_exprs();
    for e in &spec.entity {
        if !spec.group.contains(e) {
            described.push(col(e.as_str()));
        }
    }
    described.push(col(share));

    let bad_rows = df
        .clone()
        .lazy()
        .filter(
            col(share)
                .is_null()
                .or(col(share).lt(lit(-SHARE_TOLERANCE)))
                .or(col(share).gt(lit(1.0 + SHARE_TOLERANCE))),
        )
        .select(described)
        .collect()?;
    let shares = tables::float_values(&bad_rows, share)?;
    let mut key_columns: Vec<&String> = spec.group.iter().collect();
    key_columns.extend(spec.entity.iter().filter(|e| !spec.group.contains(e)));
    for (i, key) in describe_rows(&bad_rows, &key_columns)?.into_iter().enumerate() {
        report
            .out_of_range
            .push(format!("{key} = {:?}", shares[i]));
    }

    let sums = df
        .clone()
        .lazy()
        .filter(spec.mapped())
        .group_by_stable(spec.group_exprs())
        .agg([col(share).sum().alias("_share_sum")])
        // zero-denominator groups legitimately sum to 0
        .filter(
            outside(col("_share_sum"), 1.0).and(outside(col("_share_sum"), 0.0)),
        )
        .collect()?;
    let totals = tables::float_values(&sums, "_share_sum")?;
    let group_columns: Vec<&String> = spec.group.iter().collect();
    for (i, key) in describe_rows(&sums, &group_columns)?.into_iter().enumerate() {
        report.bad_group_sums.push((key, totals[i].unwrap_or(f64::NAN)));
    }

    for row in &report.out_of_range {
        log::warn!("Share '{share}' outside [0,1]: {row}");
    }
    for (group, total) in &report.bad_group_sums {
        log::warn!("Share '{share}' sums to {total} in group {group}");
    }
    Ok(report)
}

fn outside(value: Expr, target: f64) -> Expr {
    value
        .clone()
        .lt(lit(target - SHARE_TOLERANCE))
        .or(value.gt(lit(target + SHARE_TOLERANCE)))
}

fn describe_rows(df: &DataFrame, columns: &[&String]) -> Result<Vec<String>> {
    let values: Vec<Vec<Option<String>>> = columns
        .iter()
        .map(|c| tables::string_values(df, c))
        .collect::<Result<_>>()?;
    Ok((0..df.height())
        .map(|i| {
            columns
                .iter()
                .zip(values.iter())
                .map(|(c, v)| format!("{c}={}", v[i].as_deref().unwrap_or("<null>")))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const R: &str = "TiVA Region";
    const C: &str = "Country";
    const S: &str = "Exiobase Sector";
    const SUM: &str = "BEA Summary";
    const Q: &str = "q";

    fn share_of(df: &DataFrame, share: &str) -> Vec<f64> {
        tables::float_values(df, share)
            .unwrap()
            .into_iter()
            .map(|v| v.unwrap())
            .collect()
    }

    #[test]
    fn two_countries_split_by_output() {
        let df = df!(
            R => &["R", "R"],
            C => &["A", "B"],
            S => &["S", "S"],
            Q => &[30.0, 70.0]
        )
        .unwrap();
        let spec = ShareSpec::new("share", &[R, S], &[C, S]);
        let out = contribution_coefficients(&df, Q, &[spec.clone()]).unwrap();
        let shares = share_of(&out, "share");
        assert!((shares[0] - 0.3).abs() < 1e-12);
        assert!((shares[1] - 0.7).abs() < 1e-12);
        assert!(validate_shares(&out, &spec).unwrap().is_clean());
    }

    #[test]
    fn zero_total_group_gets_zero_shares() {
        let df = df!(
            R => &["R", "R", "Q"],
            C => &["A", "B", "C"],
            S => &["S", "S", "S"],
            Q => &[0.0, 0.0, 5.0]
        )
        .unwrap();
        let spec = ShareSpec::new("share", &[R, S], &[C, S]);
        let out = contribution_coefficients(&df, Q, &[spec.clone()]).unwrap();
        assert_eq!(share_of(&out, "share"), vec![0.0, 0.0, 1.0]);
        assert!(validate_shares(&out, &spec).unwrap().is_clean());
    }

    #[test]
    fn fan_out_rows_count_once_per_group() {
        // A/S maps to two detail codes that both roll up to summary X
        let df = df!(
            R => &["R", "R", "R"],
            C => &["A", "A", "B"],
            S => &["S", "S", "S"],
            SUM => &["X", "X", "X"],
            Q => &[30.0, 30.0, 70.0]
        )
        .unwrap();
        let spec = ShareSpec::new("share", &[R, SUM], &[C, S]);
        let out = contribution_coefficients(&df, Q, &[spec]).unwrap();
        let shares = share_of(&out, "share");
        assert!((shares[0] - 0.15).abs() < 1e-12);
        assert!((shares[1] - 0.15).abs() < 1e-12);
        assert!((shares[2] - 0.7).abs() < 1e-12);
    }

    #[test]
    fn unmapped_rows_get_zero_and_stay_out_of_denominators() {
        let df = df!(
            R => &[Some("R"), Some("R"), None],
            C => &["A", "B", "Z"],
            S => &["S", "S", "S"],
            SUM => &[Some("X"), None, Some("X")],
            Q => &[30.0, 70.0, 50.0]
        )
        .unwrap();
        let spec = ShareSpec::new("share", &[R, SUM], &[C, S]);
        let out = contribution_coefficients(&df, Q, &[spec.clone()]).unwrap();
        assert_eq!(share_of(&out, "share"), vec![1.0, 0.0, 0.0]);
        assert!(validate_shares(&out, &spec).unwrap().is_clean());
    }

    #[test]
    fn side_by_side_shares_answer_different_groupings() {
        let df = df!(
            R => &["R", "R", "R"],
            C => &["A", "B", "A"],
            S => &["S1", "S1", "S2"],
            SUM => &["X", "X", "X"],
            Q => &[10.0, 30.0, 60.0]
        )
        .unwrap();
        let by_sector = ShareSpec::new("by_sector", &[R, S], &[C, S]);
        let by_summary = ShareSpec::new("by_summary", &[R, SUM], &[C, S]);
        let out = contribution_coefficients(&df, Q, &[by_sector, by_summary]).unwrap();
        assert_eq!(share_of(&out, "by_sector"), vec![0.25, 0.75, 1.0]);
        assert_eq!(share_of(&out, "by_summary"), vec![0.1, 0.3, 0.6]);
        assert_eq!(out.width(), df.width() + 2);
    }

    #[test]
    fn nonzero_groups_sum_to_one() {
        // deterministic spread of quantities over 4 regions x 5 sectors
        let mut regions = Vec::new();
        let mut countries = Vec::new();
        let mut sectors = Vec::new();
        let mut quantities = Vec::new();
        let mut seed: u64 = 7;
        for c in 0..12 {
            for s in 0..5 {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                regions.push(format!("R{}", c % 4));
                countries.push(format!("C{c}"));
                sectors.push(format!("S{s}"));
                quantities.push(((seed >> 33) % 1000) as f64 / 7.0);
            }
        }
        let df = df!(R => &regions, C => &countries, S => &sectors, Q => &quantities).unwrap();
        let spec = ShareSpec::new("share", &[R, S], &[C, S]);
        let out = contribution_coefficients(&df, Q, &[spec.clone()]).unwrap();

        let mut sums: BTreeMap<(String, String), (f64, f64)> = BTreeMap::new();
        let shares = share_of(&out, "share");
        for i in 0..out.height() {
            let e = sums.entry((regions[i].clone(), sectors[i].clone())).or_default();
            e.0 += shares[i];
            e.1 += quantities[i];
        }
        for ((r, s), (share_sum, q_sum)) in sums {
            if q_sum > 0.0 {
                assert!((share_sum - 1.0).abs() < SHARE_TOLERANCE, "{r}/{s} sums to {share_sum}");
            } else {
                assert_eq!(share_sum, 0.0);
            }
        }
        assert!(validate_shares(&out, &spec).unwrap().is_clean());
    }

    #[test]
    fn validation_flags_out_of_range_and_bad_sums() {
        let df = df!(
            R => &["R", "R", "Q"],
            C => &["A", "B", "C"],
            S => &["S", "S", "S"],
            "share" => &[1.5, 0.2, 0.4]
        )
        .unwrap();
        let spec = ShareSpec::new("share", &[R, S], &[C, S]);
        let report = validate_shares(&df, &spec).unwrap();
        assert_eq!(report.out_of_range.len(), 1);
        assert!(report.out_of_range[0].contains("Country=A"));
        assert_eq!(report.bad_group_sums.len(), 2);
        assert!(!report.is_clean());
    }
}
