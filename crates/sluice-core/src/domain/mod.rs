//! Domain model (IDs, tasks, states, events).

pub mod events;
pub mod ids;
pub mod state;
pub mod task;

pub use events::{AlertLevel, Event};
pub use ids::{BatchId, TaskId};
pub use state::TaskStatus;
pub use task::{NewTask, Priority, StatusChange, Task, TaskType};
