//! MarketETL CLI: run the fetch-normalize-persist pipeline once per invocation.
//!
//! Commands:
//! - `run [DATE]` fetch one asset's data and persist it to a table or files
//! - `ping` check that the upstream API answers

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use marketetl_core::data::{AlignPolicy, CoinGeckoClient, FetchRequest};
use marketetl_core::settings::{Mode, PipelineConfig, Settings, SinkKind};
use marketetl_core::sink::{ConflictPolicy, FileFormat, FileSink, TableSink};
use marketetl_core::Pipeline;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Invocation date format.
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Parser)]
#[command(
    name = "marketetl",
    version,
    about = "MarketETL: fetch, normalize, and persist cryptocurrency market data"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch market data for one asset and persist it.
    Run {
        /// Snapshot date (YYYY-MM-DD). Required in snapshot mode, rejected in chart mode.
        date: Option<String>,

        /// snapshot (one dated record) or chart (rolling window).
        #[arg(long)]
        mode: Option<Mode>,

        /// Upstream asset id, e.g. bitcoin.
        #[arg(long)]
        asset: Option<String>,

        /// Quote currency, e.g. usd.
        #[arg(long)]
        currency: Option<String>,

        /// Market chart window in days.
        #[arg(long)]
        days: Option<u32>,

        /// table (SQL database) or files (CSV + Parquet).
        #[arg(long)]
        sink: Option<SinkKind>,

        /// Destination table. Defaults per mode.
        #[arg(long)]
        table: Option<String>,

        /// append (fail on existing timestamps) or replace (drop prior contents).
        #[arg(long)]
        policy: Option<ConflictPolicy>,

        /// Output directory for the files sink.
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// inner (keep common timestamps) or strict (fail on misaligned series).
        #[arg(long)]
        align: Option<AlignPolicy>,

        /// TOML file with pipeline defaults.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Check that the upstream API is reachable.
    Ping,
}

/// Flags for `run`, before they are merged over the config file.
#[derive(Debug, Default)]
struct RunArgs {
    date: Option<String>,
    mode: Option<Mode>,
    asset: Option<String>,
    currency: Option<String>,
    days: Option<u32>,
    sink: Option<SinkKind>,
    table: Option<String>,
    policy: Option<ConflictPolicy>,
    out_dir: Option<PathBuf>,
    align: Option<AlignPolicy>,
}

fn main() -> ExitCode {
    // A missing .env is fine; the environment may already be populated.
    dotenv::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    match dispatch(cli.command) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn dispatch(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Run {
            date,
            mode,
            asset,
            currency,
            days,
            sink,
            table,
            policy,
            out_dir,
            align,
            config,
        } => {
            let base = match config {
                Some(path) => PipelineConfig::from_file(&path)?,
                None => PipelineConfig::default(),
            };
            let args = RunArgs {
                date,
                mode,
                asset,
                currency,
                days,
                sink,
                table,
                policy,
                out_dir,
                align,
            };
            run_pipeline(base, args)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Ping => run_ping(),
    }
}

fn run_pipeline(base: PipelineConfig, args: RunArgs) -> Result<()> {
    let (cfg, request) = resolve(base, args)?;
    let settings = Settings::from_env()?;

    let client = CoinGeckoClient::new(settings.api_plan, &settings.api_key)
        .map_err(|e| anyhow!("building HTTP client: {e}"))?
        .with_base_url(settings.base_url());

    let mut pipeline = Pipeline::new(&client).with_align_policy(cfg.align);
    match cfg.sink {
        SinkKind::Table => {
            let url = settings.require_database_url()?;
            pipeline = pipeline.with_sink(TableSink::new(url, cfg.table_name(), cfg.policy)?);
        }
        SinkKind::Files => {
            for format in [FileFormat::Csv, FileFormat::Parquet] {
                pipeline = pipeline.with_sink(FileSink::new(cfg.file_path(format.extension()), format));
            }
        }
    }

    let report = pipeline
        .run(&request)
        .with_context(|| format!("pipeline failed for {request}"))?;

    for warning in &report.warnings {
        warn!(%warning, "completed with data-quality warning");
    }
    info!(records = report.records, "{request} complete");
    Ok(())
}

/// Merge flags over the config file and build the request.
fn resolve(mut cfg: PipelineConfig, args: RunArgs) -> Result<(PipelineConfig, FetchRequest)> {
    if let Some(mode) = args.mode {
        cfg.mode = mode;
    }
    if let Some(asset) = args.asset {
        cfg.asset_id = asset;
    }
    if let Some(currency) = args.currency {
        cfg.currency = currency;
    }
    if let Some(days) = args.days {
        cfg.days = days;
    }
    if let Some(sink) = args.sink {
        cfg.sink = sink;
    }
    if args.table.is_some() {
        cfg.table = args.table;
    }
    if let Some(policy) = args.policy {
        cfg.policy = policy;
    }
    if let Some(out_dir) = args.out_dir {
        cfg.out_dir = out_dir;
    }
    if let Some(align) = args.align {
        cfg.align = align;
    }

    let request = match (cfg.mode, args.date.as_deref()) {
        (Mode::Snapshot, Some(raw)) => {
            FetchRequest::daily_snapshot(&cfg.asset_id, &cfg.currency, parse_date(raw)?)
        }
        (Mode::Snapshot, None) => {
            bail!("a date argument is required in snapshot mode, please use \"yyyy-mm-dd\"")
        }
        (Mode::Chart, None) => FetchRequest::market_chart(&cfg.asset_id, &cfg.currency, cfg.days),
        (Mode::Chart, Some(raw)) => {
            bail!("chart mode fetches the latest {} day(s) and takes no date (got '{raw}')", cfg.days)
        }
    };
    request.validate()?;
    Ok((cfg, request))
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|_| anyhow!("invalid date format '{raw}', please use \"yyyy-mm-dd\""))
}

fn run_ping() -> Result<ExitCode> {
    let settings = Settings::from_env()?;
    let client = CoinGeckoClient::new(settings.api_plan, &settings.api_key)
        .map_err(|e| anyhow!("building HTTP client: {e}"))?
        .with_base_url(settings.base_url());

    match client.ping() {
        Ok(true) => {
            info!(base = client.base_url(), "API reachable");
            Ok(ExitCode::SUCCESS)
        }
        Ok(false) => {
            error!(base = client.base_url(), "API answered with an error status");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            error!(base = client.base_url(), error = %e, "API unreachable");
            Ok(ExitCode::FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use marketetl_core::data::Window;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn snapshot_date_is_parsed() {
        let (cfg, request) = resolve(
            PipelineConfig::default(),
            RunArgs {
                date: Some("2025-07-04".into()),
                ..RunArgs::default()
            },
        )
        .unwrap();
        assert_eq!(request.window, Window::DailySnapshot {
            date: NaiveDate::from_ymd_opt(2025, 7, 4).unwrap()
        });
        assert_eq!(request.asset_id, "bitcoin");
        assert_eq!(cfg.table_name(), "history_market_data");
    }

    #[test]
    fn bad_or_missing_date_is_rejected() {
        for date in [None, Some("04-07-2025"), Some("2025-13-01"), Some("yesterday")] {
            let err = resolve(
                PipelineConfig::default(),
                RunArgs {
                    date: date.map(String::from),
                    ..RunArgs::default()
                },
            )
            .unwrap_err();
            assert!(err.to_string().contains("yyyy-mm-dd"), "{err}");
        }
    }

    #[test]
    fn chart_mode_takes_days_not_date() {
        let (cfg, request) = resolve(
            PipelineConfig::default(),
            RunArgs {
                mode: Some(Mode::Chart),
                days: Some(7),
                asset: Some("ethereum".into()),
                ..RunArgs::default()
            },
        )
        .unwrap();
        assert_eq!(request.window, Window::MarketChart { days: 7 });
        assert_eq!(cfg.table_name(), "market_chart_data");

        assert!(resolve(
            PipelineConfig::default(),
            RunArgs {
                mode: Some(Mode::Chart),
                date: Some("2025-07-04".into()),
                ..RunArgs::default()
            },
        )
        .is_err());
    }

    #[test]
    fn flags_override_config_file() {
        let base = PipelineConfig {
            currency: "eur".into(),
            policy: ConflictPolicy::ReplaceAll,
            ..PipelineConfig::default()
        };
        let (cfg, request) = resolve(
            base,
            RunArgs {
                date: Some("2025-07-04".into()),
                policy: Some(ConflictPolicy::Append),
                table: Some("btc_daily".into()),
                ..RunArgs::default()
            },
        )
        .unwrap();
        assert_eq!(request.currency, "eur");
        assert_eq!(cfg.policy, ConflictPolicy::Append);
        assert_eq!(cfg.table_name(), "btc_daily");
    }

    #[test]
    fn invalid_asset_id_is_rejected_before_any_request() {
        assert!(resolve(
            PipelineConfig::default(),
            RunArgs {
                date: Some("2025-07-04".into()),
                asset: Some("bit coin/../x".into()),
                ..RunArgs::default()
            },
        )
        .is_err());
    }

    #[test]
    fn run_subcommand_parses_flags() {
        let cli = Cli::try_parse_from([
            "marketetl", "run", "2025-07-04", "--sink", "files", "--policy", "replace", "--align", "strict",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { date, sink, policy, align, .. } => {
                assert_eq!(date.as_deref(), Some("2025-07-04"));
                assert_eq!(sink, Some(SinkKind::Files));
                assert_eq!(policy, Some(ConflictPolicy::ReplaceAll));
                assert_eq!(align, Some(AlignPolicy::Strict));
            }
            Commands::Ping => panic!("expected run"),
        }
    }
}
