mod downstream;
mod manager;
mod types;
mod upstream;

pub use downstream::*;
pub use manager::*;
pub use types::*;
pub use upstream::*;
