pub mod app;
pub mod shutdown;

pub use app::{AppMode, Application};
pub use shutdown::{wait_for_signal, ShutdownManager};
