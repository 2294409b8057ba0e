//! Graph formatting and platform dispatching ahead of quantized inference.
//!
//! A network is loaded into a [`Graph`], normalized by [`format_graph`], then every operation is
//! assigned a [`TargetPlatform`] by [`dispatch_graph`], which also inserts device switches on the
//! edges crossing two platforms. Quantization itself is left to a [`QuantizationBackend`].

pub mod dispatch;
pub mod error;
pub mod format;
pub mod interface;
pub mod io;
pub mod ir;
pub mod platform;
pub mod quantizer;
pub mod setting;
pub mod switch;
pub mod testing;

pub use error::{DispatchError, Result};
pub use interface::{
    dispatch_graph, export_graph, export_to_directory, format_graph, load_graph,
    load_native_graph, quantize_native_model, QuantizeRequest,
};
pub use ir::Graph;
pub use platform::{NetworkFramework, TargetPlatform};
pub use quantizer::{CalibrationSource, QuantizationBackend, Quantizer};
pub use setting::{QuantizationSetting, SimpleQuantizationSetting};
