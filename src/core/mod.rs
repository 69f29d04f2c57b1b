pub mod ids;
pub mod progress;
pub mod scheduler;

pub use ids::{ConnectionId, IdPool, TaskId};
pub use progress::{OperationSnapshot, Progress};
pub use scheduler::{Scheduler, Task, TaskEvent, TaskFuture, TaskJob, TaskOutcome};
