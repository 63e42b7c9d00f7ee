//! Background execution of repository work.
//!
//! ```ignore
//! use pgvc::tasks::TaskRunner;
//!
//! let runner = TaskRunner::new(64)?;
//! let repo = repo.clone();
//! let handle = runner.submit("auto snapshot", move |cancel| {
//!     repo.auto_snapshot("hourly", "scheduler", cancel)
//! })?;
//! let outcome = handle.wait()?;
//! ```

mod error;
mod runner;

pub use error::{TaskError, TaskResult};
pub use runner::{TaskHandle, TaskRunner, DEFAULT_QUEUE_CAPACITY};
