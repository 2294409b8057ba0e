//! Reading graphs from files and writing them back for a target platform.
//!
//! Only the crate's own JSON format is handled here, foreign exchange formats plug in through
//! [`GraphBuilder`] and [`GraphExporter`].

mod native;

use once_cell::sync::Lazy;
use std::{collections::BTreeMap, path::Path};
use tracing::warn;

use crate::{
    error::{DispatchError, Result},
    ir::Graph,
    platform::{NetworkFramework, TargetPlatform},
};
pub use native::{NativeExporter, NativeImporter};

/// Builds a [`Graph`] out of a model file.
pub trait GraphBuilder {
    fn build(&self, path: &Path) -> Result<Graph>;
}

/// Writes a dispatched [`Graph`], and optionally its dispatching configuration, to files.
pub trait GraphExporter {
    fn export(&self, graph: &Graph, file_path: &Path, config_path: Option<&Path>) -> Result<()>;
}

/// File extension appended to exported graphs, per platform.
pub static EXPORTING_POSTFIX: Lazy<BTreeMap<TargetPlatform, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        (TargetPlatform::PplDspInt8, ".caffemodel"),
        (TargetPlatform::PplDspTiInt8, ".caffemodel"),
        (TargetPlatform::PplCudaInt8, ".onnx"),
        (TargetPlatform::SnpeInt8, ".caffemodel"),
        (TargetPlatform::NxpInt8, ".caffemodel"),
        (TargetPlatform::Onnx, ".onnx"),
        (TargetPlatform::OnnxRuntime, ".onnx"),
        (TargetPlatform::Caffe, ".caffemodel"),
        (TargetPlatform::Native, ".native"),
        (TargetPlatform::Extension, ".ext"),
        (TargetPlatform::OrtOosInt8, ".onnx"),
        (TargetPlatform::MetaxInt8C, ".onnx"),
        (TargetPlatform::MetaxInt8T, ".onnx"),
    ])
});

/// Returns the builder able to read graphs of `framework`.
pub fn builder_for(framework: NetworkFramework) -> Result<Box<dyn GraphBuilder>> {
    match framework {
        NetworkFramework::Native => Ok(Box::new(NativeImporter)),
        NetworkFramework::Onnx | NetworkFramework::Caffe => {
            Err(DispatchError::UnsupportedFramework(framework))
        }
    }
}

/// Returns the exporter writing graphs for `platform`, if there is one.
pub fn exporter_for(platform: TargetPlatform) -> Option<Box<dyn GraphExporter>> {
    match platform {
        TargetPlatform::Native => Some(Box::new(NativeExporter)),
        _ => None,
    }
}

/// Checks that a file can be written at `path`. Overwriting an existing file is allowed and
/// reported by the returned warning, an existing directory is an error.
pub(crate) fn check_output_path(path: &Path) -> Result<Option<String>> {
    if path.is_dir() {
        return Err(DispatchError::PathIsDirectory(path.display().to_string()));
    }
    if path.exists() {
        let warning = format!("file {} already exists, it will be overwritten", path.display());
        warn!("{}", warning);
        return Ok(Some(warning));
    }
    Ok(None)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_check_output_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("graph.native");
        assert_eq!(check_output_path(&file).unwrap(), None);
        std::fs::write(&file, "{}").unwrap();
        assert!(check_output_path(&file).unwrap().is_some());
        assert!(matches!(
            check_output_path(dir.path()),
            Err(DispatchError::PathIsDirectory(_))
        ));
    }

    #[test]
    fn test_registries() {
        assert!(builder_for(NetworkFramework::Native).is_ok());
        assert!(matches!(
            builder_for(NetworkFramework::Onnx),
            Err(DispatchError::UnsupportedFramework(NetworkFramework::Onnx))
        ));
        assert!(exporter_for(TargetPlatform::Native).is_some());
        assert!(exporter_for(TargetPlatform::PplCudaInt8).is_none());
        assert_eq!(EXPORTING_POSTFIX.get(&TargetPlatform::Native), Some(&".native"));
    }
}
