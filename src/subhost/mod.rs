mod allocator;
mod nat;

pub use allocator::*;
pub use nat::*;
