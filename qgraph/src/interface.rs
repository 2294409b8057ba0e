//! Entry points sequencing the whole pipeline: load, format, dispatch, quantize and export.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::{
    dispatch::{commit, reconcile, DispatcherKind, DispatchingTable},
    error::{DispatchError, Result},
    format,
    io::{builder_for, check_output_path, exporter_for, EXPORTING_POSTFIX},
    ir::Graph,
    platform::{NetworkFramework, TargetPlatform},
    quantizer::{quantizer_for, CalibrationSource, QuantizationBackend, Quantizer},
    setting::QuantizationSetting,
    switch::insert_switchers,
};

/// Reads a graph with the builder registered for `framework`, without formatting it.
pub fn load_graph(path: &Path, framework: NetworkFramework) -> Result<Graph> {
    builder_for(framework)?.build(path)
}

/// Reads a graph written by the native exporter and formats it.
pub fn load_native_graph(path: &Path) -> Result<Graph> {
    let mut graph = load_graph(path, NetworkFramework::Native)?;
    format_graph(&mut graph)?;
    Ok(graph)
}

/// Runs every formatting command on `graph`, see [`format::FORMAT_SEQUENCE`].
pub fn format_graph(graph: &mut Graph) -> Result<()> {
    Ok(format::format_graph(graph)?)
}

/// Assigns a platform to every operation of `graph` and inserts the device switches between
/// platforms. Operations the quantizer of `platform` can handle are left `UNSPECIFIED`, for the
/// quantizer to settle. Overrides of `setting` win over the automatic decision.
///
/// Nothing is written to the graph when the platform, the dispatcher or an override is invalid.
pub fn dispatch_graph(
    graph: &mut Graph,
    platform: TargetPlatform,
    setting: &QuantizationSetting,
) -> Result<DispatchingTable> {
    let quantizer = quantizer_for(platform)?;
    let kind: DispatcherKind = setting.dispatcher.parse()?;
    let dispatcher = kind.dispatcher(setting.dispatching_precedence);

    let table = dispatcher.dispatch(
        graph,
        quantizer.quant_operation_types(),
        TargetPlatform::Unspecified,
        TargetPlatform::Fp32,
        TargetPlatform::ShapeOrIndex,
    )?;
    let table = reconcile(graph, &table, &setting.dispatching_table)?;
    commit(graph, &table)?;
    let switches = insert_switchers(graph)?;
    info!(
        "dispatched {} operations of graph {} with the {} dispatcher, {} switches inserted",
        table.len(),
        graph.name(),
        kind,
        switches
    );
    Ok(table)
}

/// What [`quantize_native_model`] should do.
pub struct QuantizeRequest<'a> {
    pub platform: TargetPlatform,
    /// Defaults to [`QuantizationSetting::default`].
    pub setting: Option<QuantizationSetting>,
    pub calibration: Option<&'a dyn CalibrationSource>,
    pub calibration_steps: usize,
    /// Stop after dispatching when false.
    pub do_quantize: bool,
}

impl QuantizeRequest<'_> {
    pub fn new(platform: TargetPlatform) -> Self {
        Self {
            platform,
            setting: None,
            calibration: None,
            calibration_steps: 32,
            do_quantize: true,
        }
    }
}

/// Loads, formats and dispatches a native graph, then hands it to `backend`. Every precondition
/// is checked before the file is read.
pub fn quantize_native_model(
    path: &Path,
    request: QuantizeRequest<'_>,
    backend: &dyn QuantizationBackend,
) -> Result<Graph> {
    let platform = request.platform;
    if !platform.is_quantized_platform() {
        return Err(DispatchError::NonQuantizedPlatform(platform));
    }
    let quantizer = quantizer_for(platform)?;
    let calibration = match (request.do_quantize, request.calibration) {
        (false, calibration) => calibration,
        (true, None) => {
            return Err(DispatchError::CalibrationPrecondition(
                "no calibration source given".to_string(),
            ))
        }
        (true, Some(_)) if request.calibration_steps == 0 => {
            return Err(DispatchError::CalibrationPrecondition(
                "calibration steps must be positive".to_string(),
            ))
        }
        (true, Some(source)) if source.num_batches() == 0 => {
            return Err(DispatchError::CalibrationPrecondition(
                "calibration source is empty".to_string(),
            ))
        }
        (true, calibration) => calibration,
    };
    let setting = request.setting.unwrap_or_default();

    let mut graph = load_native_graph(path)?;
    dispatch_graph(&mut graph, platform, &setting)?;

    if let (true, Some(calibration)) = (request.do_quantize, calibration) {
        backend.quantize(
            &mut graph,
            quantizer,
            &setting,
            calibration,
            request.calibration_steps,
        )?;
        info!("quantized graph {} for {}", graph.name(), quantizer.platform());
    }
    Ok(graph)
}

/// Writes `graph` for `platform`. The platform postfix is appended to `graph_save_to`. Returns
/// the warnings about overwritten files.
pub fn export_graph(
    graph: &Graph,
    platform: TargetPlatform,
    graph_save_to: &Path,
    config_save_to: Option<&Path>,
) -> Result<Vec<String>> {
    let mut graph_path = graph_save_to.as_os_str().to_owned();
    if let Some(postfix) = EXPORTING_POSTFIX.get(&platform) {
        graph_path.push(postfix);
    }
    let graph_path = PathBuf::from(graph_path);

    let mut warnings = vec![];
    for path in std::iter::once(graph_path.as_path()).chain(config_save_to) {
        warnings.extend(check_output_path(path)?);
    }
    let exporter = exporter_for(platform).ok_or(DispatchError::UnsupportedExport(platform))?;
    exporter.export(graph, &graph_path, config_save_to)?;
    Ok(warnings)
}

/// Exports `graph` as `quantized` and `quantized.json` inside `working_directory`.
pub fn export_to_directory(
    working_directory: &Path,
    graph: &Graph,
    platform: TargetPlatform,
) -> Result<Vec<String>> {
    export_graph(
        graph,
        platform,
        &working_directory.join("quantized"),
        Some(&working_directory.join("quantized.json")),
    )
}
