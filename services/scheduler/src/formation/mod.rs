//! Desired state: the controller's formation stream and the table the
//! scheduler keeps from it.

mod stream;
mod table;

pub use stream::FormationStream;
pub use table::{
    FormationEntry, FormationSnapshot, FormationState, FormationTable, JobLocation, TrackedJob,
    TrackedState,
};
pub(crate) use table::Retry;
