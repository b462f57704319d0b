use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;

fn stamp(path: &PathBuf) -> Option<(SystemTime, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

/// Polls `path` and posts `event` on the loop channel whenever its
/// modification time or size moves. Stops once the receiver is gone.
pub fn watch_lease_file<T>(
    path: PathBuf,
    period: Duration,
    tx: UnboundedSender<T>,
    event: T,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
{
    tokio::spawn(async move {
        let mut last = stamp(&path);
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            let cur = stamp(&path);
            if cur == last {
                continue;
            }
            last = cur;
            debug!(path = %path.display(), "lease file changed");
            if tx.send(event.clone()).is_err() {
                break;
            }
        }
    })
}
