//! Online/offline signal shared between the health probe, the replay worker
//! and the queue.

use crate::remote::HttpInventoryClient;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Owner of the signal. Dropping it freezes every `Connectivity` at the last value.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    /// Publish a reading. Returns `true` if it changed the state.
    pub fn set_online(&self, online: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> Connectivity {
        Connectivity {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of the signal.
#[derive(Debug, Clone)]
pub struct Connectivity {
    rx: watch::Receiver<bool>,
}

impl Connectivity {
    /// A signal pinned to `online`, for callers without a monitor.
    pub fn fixed(online: bool) -> Self {
        let (_tx, rx) = watch::channel(online);
        Self { rx }
    }

    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the next transition and return the new state.
    /// `None` once the monitor is gone.
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        let online = *self.rx.borrow_and_update();
        Some(online)
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> bool;
}

#[async_trait]
impl HealthCheck for HttpInventoryClient {
    async fn check(&self) -> bool {
        self.ping().await
    }
}

/// Take one reading and publish it.
pub async fn probe_once<H>(monitor: &ConnectivityMonitor, health: &H) -> bool
where
    H: HealthCheck + ?Sized,
{
    let online = health.check().await;
    if monitor.set_online(online) {
        if online {
            info!("inventory service reachable; online");
        } else {
            warn!("inventory service unreachable; offline");
        }
    }
    online
}

/// Poll the health endpoint forever.
pub async fn probe_loop<H>(monitor: &ConnectivityMonitor, health: &H, every: Duration)
where
    H: HealthCheck + ?Sized,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        probe_once(monitor, health).await;
    }
}
