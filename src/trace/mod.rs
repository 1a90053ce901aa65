pub mod compiler;
pub mod heuristics;
pub mod model;
pub mod recording;
pub mod selector;

pub use compiler::{compile, compile_str, infer_kind, parse_trace, parse_trace_as, CompileError};
pub use model::{Params, Pagination, Step, Trace, TraceKind};
pub use recording::RawRecording;
