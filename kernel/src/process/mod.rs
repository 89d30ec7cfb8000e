//! Process and thread object model, the bucket-array storage substrate
//! backing it, and the lifecycle operations (`manager`) that build and
//! tear processes down.

pub mod bucket;
pub mod manager;
pub mod process;

pub use process::{DebugSection, MappingDescriptor, Process, ProcessId, Thread, ThreadFrame, ThreadId, ThreadState};

pub fn init() {
    log::info!("process management initialized ({} process slots per bucket)", crate::config::PROCESS_BUCKET_SIZE);
}
