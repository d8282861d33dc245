//! Process settings and pipeline defaults.
//!
//! Credentials and connection details come from the environment (the binary
//! loads `.env` first). Pipeline defaults come from an optional TOML file and
//! are overridden by command-line flags.

use crate::data::coingecko::ApiPlan;
use crate::data::normalize::AlignPolicy;
use crate::sink::ConflictPolicy;
use reqwest::Url;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const API_KEY: &str = "API_KEY";
pub const API_PLAN: &str = "API_PLAN";
pub const API_BASE_URL: &str = "API_BASE_URL";
pub const DATABASE_URL: &str = "DATABASE_URL";
/// Discrete connection components, used when `DATABASE_URL` is unset.
pub const DB_PARTS: [&str; 5] = ["DB_HOST", "DB_PORT", "DB_NAME", "DB_USER", "DB_PASSWORD"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("required setting {0} is not set")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("incomplete database settings: {missing} not set (set DATABASE_URL or all of DB_HOST, DB_PORT, DB_NAME, DB_USER, DB_PASSWORD)")]
    IncompleteDatabase { missing: String },

    #[error("config file: {0}")]
    File(String),
}

/// Environment-derived credentials and endpoints.
#[derive(Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_key: String,
    pub api_plan: ApiPlan,
    pub api_base_url: Option<String>,
    pub database_url: Option<String>,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("api_key", &"***")
            .field("api_plan", &self.api_plan)
            .field("api_base_url", &self.api_base_url)
            .field("database_url", &self.database_url.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key = get(API_KEY).ok_or(SettingsError::Missing(API_KEY))?;
        let api_plan = match get(API_PLAN) {
            Some(plan) => plan.parse().map_err(|reason| SettingsError::Invalid {
                name: API_PLAN,
                reason,
            })?,
            None => ApiPlan::default(),
        };

        let database_url = match get(DATABASE_URL) {
            Some(url) => Some(url),
            None => database_url_from_parts(&get)?,
        };

        Ok(Self {
            api_key,
            api_plan,
            api_base_url: get(API_BASE_URL),
            database_url,
        })
    }

    /// The base URL requests go to.
    pub fn base_url(&self) -> &str {
        self.api_base_url
            .as_deref()
            .unwrap_or_else(|| self.api_plan.base_url())
    }

    /// Connection string, required by the table sink.
    pub fn require_database_url(&self) -> Result<&str, SettingsError> {
        self.database_url
            .as_deref()
            .ok_or(SettingsError::Missing(DATABASE_URL))
    }
}

/// `postgresql://{user}:{password}@{host}:{port}/{name}` from the five parts.
///
/// All five or none: a partial set is an error rather than a silent fallback.
fn database_url_from_parts(
    get: &impl Fn(&str) -> Option<String>,
) -> Result<Option<String>, SettingsError> {
    let values: Vec<Option<String>> = DB_PARTS.iter().map(|&name| get(name)).collect();
    if values.iter().all(Option::is_none) {
        return Ok(None);
    }

    let missing: Vec<&str> = DB_PARTS
        .iter()
        .zip(&values)
        .filter(|(_, v)| v.is_none())
        .map(|(name, _)| *name)
        .collect();
    if !missing.is_empty() {
        return Err(SettingsError::IncompleteDatabase {
            missing: missing.join(", "),
        });
    }

    let [host, port, name, user, password] = <[Option<String>; 5]>::try_from(values)
        .map_err(|_| SettingsError::IncompleteDatabase {
            missing: "DB_*".into(),
        })?
        .map(Option::unwrap_or_default);

    let port: u16 = port.parse().map_err(|e| SettingsError::Invalid {
        name: "DB_PORT",
        reason: format!("{e}"),
    })?;

    let mut url = Url::parse(&format!("postgresql://{host}:{port}/{name}")).map_err(|e| {
        SettingsError::Invalid {
            name: "DB_HOST",
            reason: e.to_string(),
        }
    })?;
    let invalid_credentials = |_| SettingsError::Invalid {
        name: "DB_USER",
        reason: "cannot be embedded in a connection URL".into(),
    };
    url.set_username(&user).map_err(invalid_credentials)?;
    url.set_password(Some(&password)).map_err(invalid_credentials)?;

    Ok(Some(url.to_string()))
}

/// Which upstream window an invocation fetches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One dated snapshot; the invocation date is required.
    #[default]
    Snapshot,
    /// The latest `days`-day market chart; no date.
    Chart,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snapshot" => Ok(Mode::Snapshot),
            "chart" => Ok(Mode::Chart),
            other => Err(format!("unknown mode '{other}' (expected snapshot or chart)")),
        }
    }
}

/// Where records go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Table,
    /// CSV and Parquet side by side.
    Files,
}

impl std::str::FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "table" => Ok(SinkKind::Table),
            "files" => Ok(SinkKind::Files),
            other => Err(format!("unknown sink '{other}' (expected table or files)")),
        }
    }
}

/// Pipeline defaults, loadable from TOML.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub asset_id: String,
    pub currency: String,
    pub days: u32,
    pub mode: Mode,
    pub sink: SinkKind,
    pub table: Option<String>,
    pub out_dir: PathBuf,
    pub policy: ConflictPolicy,
    pub align: AlignPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            asset_id: "bitcoin".into(),
            currency: "usd".into(),
            days: 1,
            mode: Mode::default(),
            sink: SinkKind::default(),
            table: None,
            out_dir: PathBuf::from("data"),
            policy: ConflictPolicy::default(),
            align: AlignPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Load defaults from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::File(format!("read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse defaults from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        toml::from_str(content).map_err(|e| SettingsError::File(format!("parse TOML: {e}")))
    }

    /// Explicit table name, or the per-mode default.
    pub fn table_name(&self) -> String {
        match (&self.table, self.mode) {
            (Some(table), _) => table.clone(),
            (None, Mode::Snapshot) => "history_market_data".into(),
            (None, Mode::Chart) => "market_chart_data".into(),
        }
    }

    /// `{out_dir}/{asset}_market_chart.{ext}`
    pub fn file_path(&self, extension: &str) -> PathBuf {
        self.out_dir
            .join(format!("{}_market_chart.{extension}", self.asset_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn api_key_is_required() {
        assert_eq!(
            Settings::from_lookup(lookup(&[])),
            Err(SettingsError::Missing(API_KEY))
        );
        assert_eq!(
            Settings::from_lookup(lookup(&[(API_KEY, "  ")])),
            Err(SettingsError::Missing(API_KEY))
        );
    }

    #[test]
    fn database_url_wins_over_parts() {
        let s = Settings::from_lookup(lookup(&[
            (API_KEY, "k"),
            (DATABASE_URL, "postgresql://a:b@c:5432/d"),
            ("DB_HOST", "ignored"),
        ]))
        .unwrap();
        assert_eq!(s.database_url.as_deref(), Some("postgresql://a:b@c:5432/d"));
    }

    #[test]
    fn database_url_from_five_parts() {
        let s = Settings::from_lookup(lookup(&[
            (API_KEY, "k"),
            ("DB_HOST", "db"),
            ("DB_PORT", "5432"),
            ("DB_NAME", "market"),
            ("DB_USER", "etl"),
            ("DB_PASSWORD", "p@ss:word"),
        ]))
        .unwrap();
        assert_eq!(
            s.require_database_url().unwrap(),
            "postgresql://etl:p%40ss%3Aword@db:5432/market"
        );
    }

    #[test]
    fn partial_database_parts_are_rejected() {
        let err = Settings::from_lookup(lookup(&[
            (API_KEY, "k"),
            ("DB_HOST", "db"),
            ("DB_PORT", "5432"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            SettingsError::IncompleteDatabase {
                missing: "DB_NAME, DB_USER, DB_PASSWORD".into()
            }
        );
    }

    #[test]
    fn bad_port_is_rejected() {
        let err = Settings::from_lookup(lookup(&[
            (API_KEY, "k"),
            ("DB_HOST", "db"),
            ("DB_PORT", "five"),
            ("DB_NAME", "market"),
            ("DB_USER", "etl"),
            ("DB_PASSWORD", "pw"),
        ]))
        .unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { name: "DB_PORT", .. }));
    }

    #[test]
    fn plan_and_base_url() {
        let s = Settings::from_lookup(lookup(&[(API_KEY, "k"), (API_PLAN, "pro")])).unwrap();
        assert_eq!(s.api_plan, ApiPlan::Pro);
        assert_eq!(s.base_url(), ApiPlan::Pro.base_url());
        assert!(s.require_database_url().is_err());

        let s = Settings::from_lookup(lookup(&[(API_KEY, "k"), (API_BASE_URL, "http://localhost:9")]))
            .unwrap();
        assert_eq!(s.base_url(), "http://localhost:9");

        assert!(matches!(
            Settings::from_lookup(lookup(&[(API_KEY, "k"), (API_PLAN, "enterprise")])),
            Err(SettingsError::Invalid { name: API_PLAN, .. })
        ));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let s = Settings::from_lookup(lookup(&[
            (API_KEY, "super-secret"),
            (DATABASE_URL, "postgresql://a:hunter2@c/d"),
        ]))
        .unwrap();
        let shown = format!("{s:?}");
        assert!(!shown.contains("super-secret"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn pipeline_config_from_toml() {
        let cfg = PipelineConfig::from_toml(
            r#"
asset_id = "ethereum"
mode = "chart"
days = 7
sink = "files"
policy = "replace_all"
align = "strict"
out_dir = "out"
"#,
        )
        .unwrap();
        assert_eq!(cfg.asset_id, "ethereum");
        assert_eq!(cfg.currency, "usd");
        assert_eq!(cfg.mode, Mode::Chart);
        assert_eq!(cfg.policy, ConflictPolicy::ReplaceAll);
        assert_eq!(cfg.align, AlignPolicy::Strict);
        assert_eq!(cfg.table_name(), "market_chart_data");
        assert_eq!(cfg.file_path("csv"), PathBuf::from("out/ethereum_market_chart.csv"));
    }

    #[test]
    fn pipeline_config_rejects_unknown_keys() {
        assert!(PipelineConfig::from_toml("asset = \"bitcoin\"").is_err());
    }

    #[test]
    fn default_table_names_per_mode() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.table_name(), "history_market_data");
        let cfg = PipelineConfig {
            table: Some("custom".into()),
            ..PipelineConfig::default()
        };
        assert_eq!(cfg.table_name(), "custom");
    }
}
