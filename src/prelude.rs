pub use anyhow::bail;
pub use anyhow::anyhow;
pub use anyhow::Context as _;

pub use crate::host::{HostData, IpDataMap};
pub use crate::prefix::Prefix;

pub type Void = anyhow::Result<()>;
pub type Res<T> = anyhow::Result<T>;
