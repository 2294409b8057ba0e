use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use anyhow::Context;
use tracing::info;

use super::{GraphBuilder, GraphExporter};
use crate::{error::Result, ir::Graph};

/// Reads graphs serialized by [`NativeExporter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeImporter;

impl GraphBuilder for NativeImporter {
    fn build(&self, path: &Path) -> Result<Graph> {
        let file = File::open(path)
            .with_context(|| format!("opening native graph {}", path.display()))?;
        let graph: Graph = serde_json::from_reader(BufReader::new(file))?;
        info!(
            "loaded graph {} from {}: {} operations, {} variables",
            graph.name(),
            path.display(),
            graph.operations().len(),
            graph.variables().len()
        );
        Ok(graph)
    }
}

/// Writes the graph as JSON, and the platform of every operation as a JSON object when a config
/// path is given.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeExporter;

impl GraphExporter for NativeExporter {
    fn export(&self, graph: &Graph, file_path: &Path, config_path: Option<&Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(file_path)?);
        serde_json::to_writer(&mut writer, graph)?;
        writer.flush()?;

        if let Some(config_path) = config_path {
            let dispatchings: BTreeMap<&str, &str> = graph
                .operations()
                .values()
                .map(|op| (op.name(), op.platform().name()))
                .collect();
            let mut writer = BufWriter::new(File::create(config_path)?);
            serde_json::to_writer_pretty(&mut writer, &dispatchings)?;
            writer.flush()?;
        }
        info!("exported graph {} to {}", graph.name(), file_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{platform::TargetPlatform, testing::conv_chain};

    #[test]
    fn test_export_then_import() {
        let dir = tempfile::tempdir().unwrap();
        let graph_path = dir.path().join("graph.native");
        let config_path = dir.path().join("graph.json");
        let mut graph = conv_chain(2);
        graph.set_platform("shape", TargetPlatform::ShapeOrIndex).unwrap();

        NativeExporter
            .export(&graph, &graph_path, Some(&config_path))
            .unwrap();
        let back = NativeImporter.build(&graph_path).unwrap();
        assert_eq!(back, graph);

        let config: BTreeMap<String, String> =
            serde_json::from_str(&std::fs::read_to_string(&config_path).unwrap()).unwrap();
        assert_eq!(config.len(), graph.operations().len());
        assert_eq!(config["shape"], "SHAPE_OR_INDEX");
        assert_eq!(config["conv_0"], "UNSPECIFIED");
    }

    #[test]
    fn test_import_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(NativeImporter.build(&dir.path().join("nope.native")).is_err());
    }
}
