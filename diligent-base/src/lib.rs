//! Lowest level crate of `diligent`. Includes the spinlock, intrusive reference counting, a free-list
//! allocator and the deferred release queue that the rest of the engine builds on.

pub mod memory;

pub mod spin_lock;
pub use spin_lock::LockFlag;
pub use spin_lock::LockHelper;

pub mod ref_counting;
pub use ref_counting::DetachedRef;
pub use ref_counting::MakeNewRcObj;
pub use ref_counting::Object;
pub use ref_counting::RcSubObject;
pub use ref_counting::RefCntAutoPtr;
pub use ref_counting::RefCntWeakPtr;
pub use ref_counting::ReferenceCounters;

mod variable_size_allocations_manager;
pub use variable_size_allocations_manager::VariableSizeAllocation;
pub use variable_size_allocations_manager::VariableSizeAllocationsManager;

mod release_queue;
pub use release_queue::DynamicStaleResourceWrapper;
pub use release_queue::ResourceReleaseQueue;
