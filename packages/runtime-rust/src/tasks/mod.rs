//! Supervision of background work: cooperative tokio tasks and OS threads.

mod handle;
mod supervisor;
mod timer;

pub use handle::{StopFlag, TaskHandle, TaskKind, TaskOutcome};
pub use supervisor::{TaskBody, TaskError, TaskSupervisor, ThreadBody};
pub use timer::TimerSpec;

pub(crate) use supervisor::panic_message;
