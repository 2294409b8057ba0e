use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context as _, Result};
use clap::{Parser, Subcommand};
use qgraph::{
    dispatch_graph, export_graph, load_native_graph, QuantizationSetting, SimpleQuantizationSetting,
    TargetPlatform,
};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

fn setup_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(filter)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).context("setting up logging")?;
    } else {
        let subscriber = tracing_subscriber::fmt()
            .pretty()
            .compact()
            .with_level(true)
            .with_target(true)
            .with_env_filter(filter)
            .finish();
        tracing::subscriber::set_global_default(subscriber).context("setting up logging")?;
    };
    Ok(())
}

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Should the logs be printed in json format or not
    #[arg(long, env, global = true)]
    json: bool,

    #[command(subcommand)]
    run_mode: RunMode,
}

#[derive(Subcommand)]
enum RunMode {
    /// Format a native graph, dispatch it for a platform and export the result
    Dispatch {
        /// The native graph to dispatch
        #[arg(short = 'g', long)]
        graph: PathBuf,

        /// Target platform name, e.g. PPL_CUDA_INT8. Taken from the simple setting when omitted.
        #[arg(short = 'p', long, env = "QGRAPH_PLATFORM")]
        platform: Option<String>,

        /// A complete quantization setting, as JSON
        #[arg(long, conflicts_with = "simple_setting")]
        setting: Option<PathBuf>,

        /// A simple quantization setting, as JSON
        #[arg(long)]
        simple_setting: Option<PathBuf>,

        /// Where to write the dispatched graph, the postfix of the native format is appended
        #[arg(short = 'o', long)]
        output: PathBuf,
    },
    /// Expand a simple quantization setting into the complete setting tree
    Convert {
        #[arg(short = 's', long)]
        simple_setting: PathBuf,

        #[arg(short = 'o', long)]
        output: PathBuf,
    },
}

/// Settles the platform and the setting of a dispatch from the command line arguments.
fn resolve_setting(
    platform: Option<String>,
    setting: Option<PathBuf>,
    simple_setting: Option<PathBuf>,
) -> Result<(TargetPlatform, QuantizationSetting)> {
    let platform = platform
        .map(|name| name.parse::<TargetPlatform>())
        .transpose()?;
    match (setting, simple_setting) {
        (Some(path), _) => {
            let platform = platform.ok_or(anyhow!("--platform is required with --setting"))?;
            let (setting, unknown) = QuantizationSetting::from_file(&path)?;
            if !unknown.is_empty() {
                warn!("ignored setting entries: {}", unknown.join(", "));
            }
            Ok((platform, setting))
        }
        (None, Some(path)) => {
            let (simple, unknown) = SimpleQuantizationSetting::from_file(&path)?;
            if !unknown.is_empty() {
                warn!("ignored setting entries: {}", unknown.join(", "));
            }
            Ok((
                platform.unwrap_or(simple.platform),
                simple.convert_to_full_setting(),
            ))
        }
        (None, None) => {
            let platform = platform.ok_or(anyhow!("--platform is required without a setting"))?;
            Ok((platform, QuantizationSetting::default()))
        }
    }
}

fn config_path(output: &Path) -> PathBuf {
    let mut path = output.as_os_str().to_owned();
    path.push(".json");
    PathBuf::from(path)
}

fn run_dispatch(
    graph: PathBuf,
    platform: Option<String>,
    setting: Option<PathBuf>,
    simple_setting: Option<PathBuf>,
    output: PathBuf,
) -> Result<()> {
    let (platform, setting) = resolve_setting(platform, setting, simple_setting)?;
    let mut loaded = load_native_graph(&graph)
        .with_context(|| format!("loading graph {}", graph.display()))?;
    let table = dispatch_graph(&mut loaded, platform, &setting)?;

    let config = config_path(&output);
    for warning in export_graph(&loaded, TargetPlatform::Native, &output, Some(&config))? {
        warn!("{warning}");
    }
    let per_platform = table.values().fold(
        std::collections::BTreeMap::<TargetPlatform, usize>::new(),
        |mut acc, platform| {
            *acc.entry(*platform).or_default() += 1;
            acc
        },
    );
    info!(
        "dispatched {} for {}: {}",
        graph.display(),
        platform,
        serde_json::to_string(&per_platform)?
    );
    Ok(())
}

fn run_convert(simple_setting: PathBuf, output: PathBuf) -> Result<()> {
    let (simple, unknown) = SimpleQuantizationSetting::from_file(&simple_setting)?;
    if !unknown.is_empty() {
        warn!("ignored setting entries: {}", unknown.join(", "));
    }
    let setting = simple.convert_to_full_setting();
    if let Some(warning) = setting.to_json(&output)? {
        warn!("{warning}");
    }
    info!(
        "setting for {} written to {}",
        simple.platform,
        output.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.json)?;

    match args.run_mode {
        RunMode::Dispatch {
            graph,
            platform,
            setting,
            simple_setting,
            output,
        } => run_dispatch(graph, platform, setting, simple_setting, output),
        RunMode::Convert {
            simple_setting,
            output,
        } => run_convert(simple_setting, output),
    }
}
