//! Mark and address allocation for gateway-managed entities.
//!
//! Both allocators are rebuilt from persisted cluster state the first time
//! they are used and then shared for the life of the process through
//! [`AllocatorRegistry`].

pub mod error;
pub mod mark;
pub mod pool;
pub mod registry;

pub use error::*;
pub use mark::*;
pub use pool::*;
pub use registry::*;
