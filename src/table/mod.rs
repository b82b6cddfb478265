//! Tables of chunks and their process-level manager.

pub mod manager;
pub mod net_table;
pub mod template;

pub use manager::NetTableManager;
pub use net_table::{
    disjoint_fields_policy, AcquisitionCallback, AutoMergePolicy, NetTable, TableTrigger,
    TrackerExtractor,
};
pub use template::{InvalidDescriptor, TableDescriptor};
