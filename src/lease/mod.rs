mod lease;
mod reconciler;
mod watch;

pub use lease::*;
pub use reconciler::*;
pub use watch::*;
