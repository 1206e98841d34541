pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod modules;
pub mod pool;
pub mod script;
pub mod supervisor;

/// Tracing target for lines logged by scripts.
pub const TRACE_TARGET_SCRIPT: &str = "lumen::script";

pub use config::ProjectConfig;
pub use engine::{ChildEngine, Engine, EngineBuilder, EnvMap, Module};
pub use error::{Error, ErrorKind, Result};
pub use handler::ScriptHandler;
pub use modules::http::{HttpRequest, HttpResponse};
pub use script::{CompiledScript, ScriptCache};
