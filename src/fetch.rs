use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RequestConfig;
use crate::error::{ImportsError, Result};
use crate::schema::placeholder;

const USER_AGENT: &str = concat!("imports-ef/", env!("CARGO_PKG_VERSION"));
const TIMEOUT_SECS: u64 = 60;

/// One concrete GET against a statistics API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub year: i32,
    /// Country identifier as the API knows it (BEA area name, Census code).
    pub country: String,
    pub url: String,
}

impl ApiRequest {
    pub fn key(&self) -> String {
        format!("{}_{}", self.year, self.country)
    }
}

/// URL template shared by every request: base, optional path, then the
/// `key=value` parameters joined by `&`.
pub fn url_template(cfg: &RequestConfig) -> String {
    let mut url = cfg.url.base_url.clone();
    if let Some(path) = &cfg.url.api_path {
        url.push_str(path);
    }
    let params: Vec<String> = cfg
        .url
        .url_params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    url.push_str(&params.join("&"));
    url
}

/// Requests for every configured year and every country not in `skip`,
/// grouped by year.
pub fn build_requests(
    cfg: &RequestConfig,
    countries: &[String],
    skip: &[String],
    api_key: Option<&str>,
) -> BTreeMap<i32, Vec<ApiRequest>> {
    let mut template = url_template(cfg);
    if let Some(key) = api_key {
        template = template.replace(placeholder::API_KEY, key);
    }

    cfg.years
        .iter()
        .map(|&year| {
            let requests = countries
                .iter()
                .filter(|c| !skip.contains(c))
                .map(|country| ApiRequest {
                    year,
                    country: country.clone(),
                    url: template
                        .replace(placeholder::COUNTRY, country)
                        .replace(placeholder::YEAR, &year.to_string()),
                })
                .collect();
            (year, requests)
        })
        .collect()
}

/// Source of raw API responses.
pub trait Fetcher {
    fn get_json(&self, url: &str) -> Result<serde_json::Value>;
}

/// Blocking HTTP fetcher.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .map_err(|e| ImportsError::Http {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        // reqwest embeds the full URL, key included, in its own message
        let http = |e: reqwest::Error| ImportsError::Http {
            url: redact(url),
            message: redact(&e.without_url().to_string()),
        };
        let response = self.client.get(url).send().map_err(http)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ImportsError::Http {
                url: redact(url),
                message: format!("status {status}"),
            });
        }
        response.json().map_err(http)
    }
}

/// API keys travel as query parameters; keep them out of logs and errors.
fn redact(url: &str) -> String {
    url.split('&')
        .map(|part| {
            let lower = part.to_ascii_lowercase();
            if lower.contains("userid=") || lower.contains("key=") {
                match part.split_once('=') {
                    Some((k, _)) => format!("{k}=***"),
                    None => part.to_string(),
                }
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub country: String,
    pub data: serde_json::Value,
}

/// Every response for one source and year, persisted for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseCache {
    pub source: String,
    pub year: i32,
    pub fetched_at: DateTime<Utc>,
    /// Keyed by `{year}_{country}`.
    pub responses: BTreeMap<String, CachedResponse>,
}

impl ResponseCache {
    pub fn file_name(source: &str, year: i32) -> String {
        format!("{}_responses_{year}.json", source.to_ascii_lowercase())
    }

    pub fn path(dir: &Path, source: &str, year: i32) -> PathBuf {
        dir.join(Self::file_name(source, year))
    }

    fn staging_path(path: &Path) -> PathBuf {
        path.with_extension("json.tmp")
    }

    /// Serialize next to the final path without touching it. Returns the
    /// (staged, final) pair for [`commit`].
    fn stage(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let path = Self::path(dir, &self.source, self.year);
        let tmp = Self::staging_path(&path);
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        Ok((tmp, path))
    }

    pub fn read(dir: &Path, source: &str, year: i32) -> Result<Self> {
        let path = Self::path(dir, source, year);
        if !path.exists() {
            return Err(ImportsError::MissingFile(format!(
                "{} (run the fetch command first)",
                path.display()
            )));
        }
        let cache: ResponseCache = serde_json::from_slice(&fs::read(&path)?)?;
        log::debug!("Read {} cached {source} responses for {year}", cache.responses.len());
        Ok(cache)
    }
}

/// Issue every request for one year. The first failure aborts the batch.
pub fn fetch_year(
    fetcher: &dyn Fetcher,
    source: &str,
    year: i32,
    requests: &[ApiRequest],
) -> Result<ResponseCache> {
    let mut responses = BTreeMap::new();
    for req in requests {
        log::debug!("GET {} {} {}", source, req.year, req.country);
        let data = fetcher.get_json(&req.url)?;
        responses.insert(
            req.key(),
            CachedResponse {
                country: req.country.clone(),
                data,
            },
        );
    }
    log::info!("Collected {} {source} responses for {year}", responses.len());
    Ok(ResponseCache {
        source: source.to_string(),
        year,
        fetched_at: Utc::now(),
        responses,
    })
}

/// Issue every request of one source, all years, without touching the cache.
pub fn fetch_source(
    fetcher: &dyn Fetcher,
    source: &str,
    requests: &BTreeMap<i32, Vec<ApiRequest>>,
) -> Result<Vec<ResponseCache>> {
    requests
        .iter()
        .map(|(&year, reqs)| fetch_year(fetcher, source, year, reqs))
        .collect()
}

/// Replace the cached documents for `caches` as one unit.
///
/// Every document is staged to a temporary file first; the live files are
/// only renamed over once all of them are staged. A staging failure removes
/// the temporaries and leaves the previous cache as it was.
pub fn commit(caches: &[ResponseCache], dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut staged = Vec::with_capacity(caches.len());
    for cache in caches {
        match cache.stage(dir) {
            Ok(pair) => staged.push(pair),
            Err(e) => {
                for (tmp, _) in &staged {
                    let _ = fs::remove_file(tmp);
                }
                let failed = ResponseCache::path(dir, &cache.source, cache.year);
                let _ = fs::remove_file(ResponseCache::staging_path(&failed));
                return Err(e);
            }
        }
    }

    let mut written = Vec::with_capacity(staged.len());
    for ((tmp, path), cache) in staged.into_iter().zip(caches) {
        fs::rename(&tmp, &path)?;
        log::info!(
            "Cached {} {} responses for {} to {}",
            cache.responses.len(),
            cache.source,
            cache.year,
            path.display()
        );
        written.push(path);
    }
    Ok(written)
}

/// Fetch every source, then replace their cache documents together. Any
/// failed request aborts before the cache directory is touched.
pub fn fetch_and_cache(
    fetcher: &dyn Fetcher,
    sources: &[(&str, &BTreeMap<i32, Vec<ApiRequest>>)],
    cache_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let mut caches = Vec::new();
    for (source, requests) in sources {
        caches.extend(fetch_source(fetcher, source, requests)?);
    }
    commit(&caches, cache_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    struct MockFetcher {
        calls: RefCell<Vec<String>>,
        fail_on: Option<String>,
    }

    impl MockFetcher {
        fn new(fail_on: Option<&str>) -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                fail_on: fail_on.map(String::from),
            }
        }
    }

    impl Fetcher for MockFetcher {
        fn get_json(&self, url: &str) -> Result<serde_json::Value> {
            self.calls.borrow_mut().push(url.to_string());
            if let Some(f) = &self.fail_on {
                if url.contains(f.as_str()) {
                    return Err(ImportsError::Http {
                        url: url.to_string(),
                        message: "status 500".into(),
                    });
                }
            }
            Ok(json!({ "url": url }))
        }
    }

    fn request_config() -> RequestConfig {
        serde_yaml::from_str(
            r#"
url:
  base_url: "https://api.census.gov/data/"
  api_path: "timeseries/intltrade/imports/naics?"
  url_params:
    get: "NAICS,GEN_CIF_YR"
    CTY_CODE: "__areaorcountry__"
    YEAR: "__year__"
    key: "__key__"
years: [2019, 2020]
"#,
        )
        .unwrap()
    }

    #[test]
    fn requests_substitute_country_and_year() {
        let cfg = request_config();
        let countries = vec!["1000".to_string(), "5700".to_string(), "4280".to_string()];
        let reqs = build_requests(&cfg, &countries, &["1000".to_string()], Some("secret"));

        assert_eq!(reqs.len(), 2);
        let y2020 = &reqs[&2020];
        assert_eq!(y2020.len(), 2);
        assert_eq!(y2020[0].key(), "2020_5700");
        assert_eq!(
            y2020[0].url,
            "https://api.census.gov/data/timeseries/intltrade/imports/naics?\
             CTY_CODE=5700&YEAR=2020&get=NAICS,GEN_CIF_YR&key=secret"
        );
    }

    #[test]
    fn redact_hides_keys() {
        assert_eq!(
            redact("https://x/?UserID=abc&Year=2020"),
            "https://x/?UserID=***&Year=2020"
        );
    }

    #[test]
    fn fetch_writes_one_cache_per_year_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = request_config();
        let reqs = build_requests(&cfg, &["5700".to_string()], &[], None);
        let fetcher = MockFetcher::new(None);

        let written = fetch_and_cache(&fetcher, &[("Census", &reqs)], dir.path()).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(fetcher.calls.borrow().len(), 2);

        let cache = ResponseCache::read(dir.path(), "Census", 2019).unwrap();
        assert_eq!(cache.responses.len(), 1);
        assert_eq!(cache.responses["2019_5700"].country, "5700");
        assert!(!dir.path().join("census_responses_2019.json.tmp").exists());
    }

    #[test]
    fn a_failed_request_aborts_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = request_config();
        let countries = vec!["5700".to_string(), "4280".to_string()];
        let reqs = build_requests(&cfg, &countries, &[], None);
        let fetcher = MockFetcher::new(Some("CTY_CODE=4280"));

        let err = fetch_and_cache(&fetcher, &[("Census", &reqs)], dir.path()).unwrap_err();
        assert!(matches!(err, ImportsError::Http { .. }));
        assert!(ResponseCache::read(dir.path(), "Census", 2019).is_err());
    }

    #[test]
    fn a_failure_in_any_source_keeps_every_previous_document() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = request_config();
        let bea = build_requests(&cfg, &["5700".to_string()], &[], None);
        let census = build_requests(&cfg, &["5700".to_string(), "4280".to_string()], &[], None);

        fetch_and_cache(&MockFetcher::new(None), &[("BEA", &bea), ("Census", &census)], dir.path()).unwrap();
        let bea_path = ResponseCache::path(dir.path(), "BEA", 2020);
        let census_path = ResponseCache::path(dir.path(), "Census", 2020);
        let before = (fs::read(&bea_path).unwrap(), fs::read(&census_path).unwrap());

        let failing = MockFetcher::new(Some("CTY_CODE=4280"));
        let err = fetch_and_cache(&failing, &[("BEA", &bea), ("Census", &census)], dir.path()).unwrap_err();
        assert!(matches!(err, ImportsError::Http { .. }));
        // the BEA requests all ran before Census failed
        assert!(failing.calls.borrow().len() >= 3);

        let after = (fs::read(&bea_path).unwrap(), fs::read(&census_path).unwrap());
        assert_eq!(before, after);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn transport_errors_never_carry_the_key() {
        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher
            .get_json("http://127.0.0.1:1/api?UserID=SECRETKEY&Year=2020")
            .unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, ImportsError::Http { .. }));
        assert!(!msg.contains("SECRETKEY"), "{msg}");
    }

    #[test]
    fn redact_masks_keys_inside_free_text() {
        let text = "error sending request for url (http://h/api?UserID=abc&Year=2020)";
        assert!(!redact(text).contains("abc"));
    }

    #[test]
    fn missing_cache_names_fetch_command() {
        let dir = tempfile::tempdir().unwrap();
        let err = ResponseCache::read(dir.path(), "BEA", 2020).unwrap_err();
        assert!(err.to_string().contains("fetch"));
    }
}
