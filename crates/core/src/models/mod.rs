pub mod task;

pub use task::{Task, TaskStatus, INITIAL_PROGRESS};
