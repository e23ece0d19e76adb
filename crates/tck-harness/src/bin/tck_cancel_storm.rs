use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use tck_harness::config::TckConfig;
use tck_harness::driver::Driver;
use tck_harness::logging::{DEFAULT_FILTER, init_tracing};
use tck_harness::registry::ConnectionFactoryRegistry;
use tck_harness::sqlite_driver::SqliteDriver;
use tck_harness::{Expectation, run_concurrent_harness};

#[derive(Debug, Default)]
struct CliConfig {
    config: Option<PathBuf>,
    queries: Option<PathBuf>,
    url: Option<String>,
    seed: Option<u64>,
    output: Option<PathBuf>,
}

fn print_help() {
    let help = "\
tck_cancel_storm: run queries from many workers while cancelling them at random

USAGE:
    cargo run -p tck-harness --bin tck_cancel_storm -- --queries <PATH> [OPTIONS]

OPTIONS:
    --config <PATH>       TOML run configuration (defaults when omitted)
    --queries <PATH>      File with one SQL query per line; blank lines and
                          lines starting with '#' are skipped
    --url <URL>           SQLite database, overriding [connection] url
    --seed <u64>          Base seed, overriding config and TCK_SEED
    --output <PATH>       Write the JSON run report to a file (stdout when omitted)
    -h, --help            Show this help

Exit status is 0 for a clean run, 1 when the run collected errors and 2 when
setup failed.
";
    println!("{help}");
}

fn parse_u64(value: &str) -> Result<u64, String> {
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).map_err(|_| format!("invalid hex u64 value: {value}"))
    } else {
        value
            .parse::<u64>()
            .map_err(|_| format!("invalid u64 value: {value}"))
    }
}

fn parse_args(args: &[String]) -> Result<CliConfig, String> {
    let mut config = CliConfig::default();
    let mut index = 0;
    while index < args.len() {
        let flag = args[index].as_str();
        let mut value = || {
            index += 1;
            args.get(index)
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))
        };
        match flag {
            "--config" => config.config = Some(PathBuf::from(value()?)),
            "--queries" => config.queries = Some(PathBuf::from(value()?)),
            "--url" => config.url = Some(value()?),
            "--seed" => config.seed = Some(parse_u64(&value()?)?),
            "--output" => config.output = Some(PathBuf::from(value()?)),
            "-h" | "--help" => {
                print_help();
                return Err(String::new());
            }
            unknown => return Err(format!("unknown option: {unknown}")),
        }
        index += 1;
    }
    Ok(config)
}

fn load_queries(path: &Path) -> Result<Vec<Expectation>, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|error| format!("cannot read queries {}: {error}", path.display()))?;
    let queries: Vec<Expectation> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|sql| Expectation::sql(sql).build())
        .collect();
    if queries.is_empty() {
        return Err(format!("no queries in {}", path.display()));
    }
    Ok(queries)
}

/// Returns whether the run was clean.
fn run(args: &[String]) -> Result<bool, String> {
    let cli = parse_args(args)?;
    let mut config = match &cli.config {
        Some(path) => TckConfig::load(path).map_err(|e| e.to_string())?,
        None => TckConfig::default(),
    };
    config.apply_env_overrides().map_err(|e| e.to_string())?;
    if let Some(seed) = cli.seed {
        config.harness.seed = seed;
    }
    if let Some(url) = cli.url {
        config.connection.url = url;
    }
    if config.connection.url.is_empty() {
        return Err("no database: pass --url or set [connection] url".to_owned());
    }
    let queries_path = cli
        .queries
        .as_ref()
        .ok_or_else(|| "--queries is required".to_owned())?;
    let queries: Arc<[Expectation]> = load_queries(queries_path)?.into();

    let registry = ConnectionFactoryRegistry::new(
        config.connection.credentials(),
        config.harness.acquire_timeout(),
    );
    let driver: Arc<dyn Driver> = Arc::new(SqliteDriver);
    let factory = registry
        .factory(&driver, &config.connection.url, config.harness.connection_source)
        .map_err(|e| e.to_string())?;
    let report = run_concurrent_harness(factory, queries, &config.harness_config())
        .map_err(|e| e.to_string())?;
    registry.shutdown();

    let payload = report.to_json().map_err(|e| e.to_string())?;
    if let Some(output) = &cli.output {
        std::fs::write(output, payload.as_bytes())
            .map_err(|error| format!("cannot write report {}: {error}", output.display()))?;
    } else {
        println!("{payload}");
    }
    Ok(report.is_clean())
}

fn main() -> ExitCode {
    init_tracing(DEFAULT_FILTER);
    let args: Vec<String> = env::args().skip(1).collect();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(error) if error.is_empty() => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("ERROR tck_cancel_storm failed: {error}");
            ExitCode::from(2)
        }
    }
}
