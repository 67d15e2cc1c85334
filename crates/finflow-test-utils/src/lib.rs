//! Mocks and fixtures shared by finflow's test suites.
//!
//! ```rust,ignore
//! let worker = MockWorker::new("analyst")
//!     .with_response("tech looks strong")
//!     .with_delay(Duration::from_millis(50));
//! ```

mod fixtures;
mod mock_llm;
mod mock_tool;
mod mock_worker;

pub use fixtures::*;
pub use mock_llm::{test_model_config, MockLlmClient};
pub use mock_tool::MockTool;
pub use mock_worker::MockWorker;
