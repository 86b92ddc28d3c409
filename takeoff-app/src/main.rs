use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use takeoff_config::{AppConfig, ConfigError};
use takeoff_engine::TakeoffReport;
use takeoff_engine::services::{DrawingConverter, DxfPassthrough};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

mod report;
mod settings;

use settings::Overrides;

const USAGE: &str = "用法：takeoff [--config PATH] [--json] [--merge-similar] \
                     [--raw-units] [--no-filter] <FILE.dxf>...";

#[derive(Debug, Default)]
struct CliArgs {
    config: Option<PathBuf>,
    json: bool,
    overrides: Overrides,
    inputs: Vec<PathBuf>,
}

fn main() {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    let config = load_configuration(args.config.clone());
    init_logging(&config);
    info!(inputs = args.inputs.len(), "启动工程量统计");

    if let Err(err) = run(&args, &config) {
        error!(error = %format!("{err:#}"), "算量失败");
        eprintln!("错误：{err:#}");
        std::process::exit(1);
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CliArgs> {
    let mut parsed = CliArgs::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let Some(path) = args.next() else {
                    bail!("`--config` 需要提供配置文件路径");
                };
                parsed.config = Some(PathBuf::from(path));
            }
            "--json" => parsed.json = true,
            "--merge-similar" => parsed.overrides.merge_similar = true,
            "--raw-units" => parsed.overrides.raw_units = true,
            "--no-filter" => parsed.overrides.no_filter = true,
            other if other.starts_with("--") => bail!("未知参数：{other}"),
            path => parsed.inputs.push(PathBuf::from(path)),
        }
    }
    if parsed.inputs.is_empty() {
        bail!("缺少输入图纸");
    }
    Ok(parsed)
}

fn run(args: &CliArgs, config: &AppConfig) -> Result<()> {
    let engine = settings::build_engine(config, args.overrides).context("构建算量引擎失败")?;
    let converter = DxfPassthrough;

    let mut reports: Vec<TakeoffReport> = Vec::with_capacity(args.inputs.len());
    for input in &args.inputs {
        let drawing = converter
            .convert(input)
            .with_context(|| format!("无法准备图纸 {}", input.display()))?;
        let report = engine
            .run(&drawing)
            .with_context(|| format!("统计图纸 {} 失败", drawing.display()))?;
        if report.stats.errors > 0 {
            warn!(
                path = %drawing.display(),
                errors = report.stats.errors,
                discarded = report.stats.discarded,
                "图纸包含无法解析的实体"
            );
        }
        reports.push(report);
    }

    if args.json {
        println!("{}", report::render_json(&reports).context("序列化报告失败")?);
    } else {
        for report in &reports {
            print!("{}", report::render_text(report));
        }
    }
    Ok(())
}

fn load_configuration(override_path: Option<PathBuf>) -> AppConfig {
    match override_path {
        Some(path) => AppConfig::from_file(&path).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "加载指定配置失败，使用默认配置");
            AppConfig::default()
        }),
        None => match AppConfig::discover() {
            Ok(cfg) => cfg,
            Err(err) => {
                match &err {
                    ConfigError::Io { path, .. } | ConfigError::Parse { path, .. } => {
                        warn!(
                            path = %path.display(),
                            error = %err,
                            "加载默认配置失败，使用内建默认值"
                        );
                    }
                    ConfigError::Context { .. } => {
                        warn!(error = %err, "加载默认配置失败，使用内建默认值");
                    }
                }
                AppConfig::default()
            }
        },
    }
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}
