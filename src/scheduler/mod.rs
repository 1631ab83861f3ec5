pub mod assignment;
pub mod dispatcher;
pub mod item;
pub mod pool;
pub mod progress;
pub mod queue;

pub use assignment::{Assignment, AssignmentTable};
pub use dispatcher::{Admission, DispatchStats, Dispatcher, QueueStatus, RecordedAnswer};
pub use item::WorkItem;
pub use pool::ItemPool;
pub use progress::{SessionProgress, StepOutcome};
pub use queue::WaitQueue;
