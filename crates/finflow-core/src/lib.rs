pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod text;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use context::{ContextDelta, ExecutionContext};
pub use error::{FinflowError, Result};
pub use event::EventBus;
pub use types::*;
