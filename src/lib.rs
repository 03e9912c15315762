pub mod codegen;
pub mod config;
pub mod error;
pub mod render;
pub mod runtime;
pub mod script;

#[cfg(feature = "cpal")]
pub mod audio;

pub use codegen::midi::{MidiEvent, MidiQueue, MidiStatus};
pub use codegen::value::ValueKind;
pub use config::{FloatMode, OptLevel, RuntimeConfig};
pub use error::{
    BackendError, CodegenError, CompileError, CompileReport, ExportError, RuntimeError, SourcePos,
};
pub use runtime::exporter::{ExportFormat, Exporter, LoadedExport};
pub use runtime::node::{CustomNode, IoNode, NodeKind, Waveform};
pub use runtime::processor::Processor;
pub use runtime::types::{GroupId, NodeKey, NodeState, PortRef, SurfaceKey};
pub use runtime::{CompileSummary, Runtime};
