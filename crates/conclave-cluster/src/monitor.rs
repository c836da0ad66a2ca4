//! Leadership monitor: tells the production subsystem when this member
//! becomes leader.

use std::sync::Arc;

use conclave_raft::LeaderWatch;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Entry point of the subsystem that acts on acquired leadership.
pub trait LeadershipFeed: Send + Sync + 'static {
    fn feed_leadership(&self);
}

impl<F> LeadershipFeed for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn feed_leadership(&self) {
        self()
    }
}

/// Feed that does nothing, for nodes with no production subsystem.
pub struct NoFeed;

impl LeadershipFeed for NoFeed {
    fn feed_leadership(&self) {}
}

/// Background task watching one store's leader changes.
pub struct LeadershipMonitor {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LeadershipMonitor {
    pub fn spawn(member: u64, leaders: LeaderWatch, feed: Arc<dyn LeadershipFeed>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(run(member, leaders, feed, rx));
        Self { shutdown, task }
    }

    /// Stop watching and wait for the task to end.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "leadership monitor ended abnormally");
        }
    }
}

async fn run(
    member: u64,
    mut leaders: LeaderWatch,
    feed: Arc<dyn LeadershipFeed>,
    mut shutdown: watch::Receiver<bool>,
) {
    let member_hex = format!("{member:x}");
    let mut leading = false;
    debug!(member = %member_hex, "leadership monitor started");

    loop {
        tokio::select! {
            change = leaders.changed() => {
                let Some(leader) = change else {
                    debug!(member = %member_hex, "store stopped, leadership monitor exiting");
                    break;
                };
                info!(
                    member = %member_hex,
                    leader = ?leader.map(|l| format!("{l:x}")),
                    "leader changed"
                );
                let is_leader = leader == Some(member);
                if is_leader && !leading {
                    info!(member = %member_hex, "feeding leadership");
                    feed.feed_leadership();
                }
                leading = is_leader;
            }
            _ = shutdown.changed() => {
                debug!(member = %member_hex, "leadership monitor shutting down");
                break;
            }
        }
    }
}
