//! Daemon orchestration: wires the tracker, the transport and the
//! membership worker together and runs until interrupted.

use std::sync::Arc;
use std::time::Duration;

use replicat_net::{AppState, Broadcaster, ClusterView, Credentials, OwnershipLedger, PeerClient};
use replicat_proto::NodeDescriptor;
use replicat_tracker::{FilesystemTracker, NullListener, StorageTracker};
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::errors::{DaemonError, Result};
use crate::membership::{heartbeat, MembershipWorker};

/// How often operation counters are written to the log.
pub const STATS_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(settings: Settings) -> Result<()> {
    let credentials: Credentials = settings
        .manager_credentials
        .parse()
        .map_err(|_| DaemonError::Config("manager_credentials must be user:password".into()))?;
    let client = Arc::new(PeerClient::new(credentials.clone())?);
    let (cluster, membership_rx) = ClusterView::new(settings.name.clone());
    let ledger = Arc::new(OwnershipLedger::new());

    let broadcaster = Arc::new(Broadcaster::new(
        Arc::clone(&client),
        Arc::clone(&cluster),
        Arc::clone(&ledger),
        settings.manager.clone(),
    ));
    let tracker = Arc::new(FilesystemTracker::new(
        &settings.directory,
        settings.name.clone(),
        broadcaster,
        Arc::new(NullListener),
    ));
    let tracker_dyn: Arc<dyn StorageTracker> = tracker.clone();

    let descriptor = NodeDescriptor::new(
        settings.cluster_key.clone(),
        settings.name.clone(),
        settings.address.clone(),
    );
    tracker.initialize(&descriptor).await?;
    info!(
        "initial scan of {:?} complete, {} entries",
        settings.directory,
        tracker.snapshot().await.len()
    );

    // An unbindable listener means peers can never reach this node;
    // refuse to start rather than run write-only.
    let listener = tokio::net::TcpListener::bind(&settings.address).await?;
    let state = AppState::new(
        tracker_dyn.clone(),
        Arc::clone(&ledger),
        Arc::clone(&cluster),
        credentials,
    );
    tokio::spawn(async move {
        if let Err(e) = replicat_net::serve(listener, state).await {
            error!("http surface stopped: {}", e);
        }
    });
    info!("listening on {}", settings.address);

    tracker.start()?;

    let worker = MembershipWorker::new(
        Arc::clone(&cluster),
        tracker_dyn.clone(),
        Arc::clone(&client),
    );
    tokio::spawn(worker.run(membership_rx));

    if let Some(manager) = settings.manager.clone() {
        // First contact with the manager; the heartbeat retries forever
        // if the manager is not up yet.
        {
            let mut first = descriptor.clone();
            first.status = tracker.status();
            first.current_state = tracker.snapshot().await;
            if let Err(e) = client.register(&manager, &first).await {
                warn!("initial registration failed, heartbeat will retry: {}", e);
            }
        }
        // Every status transition is reported immediately; the
        // heartbeat covers the steady state.
        {
            let mut status_rx = tracker.subscribe_status();
            let client = Arc::clone(&client);
            let manager = manager.clone();
            let descriptor = descriptor.clone();
            tokio::spawn(async move {
                while status_rx.changed().await.is_ok() {
                    let mut update = descriptor.clone();
                    update.status = *status_rx.borrow();
                    if let Err(e) = client.register(&manager, &update).await {
                        warn!("status report to manager failed: {}", e);
                    }
                }
            });
        }
        tokio::spawn(heartbeat(
            Arc::clone(&client),
            tracker_dyn.clone(),
            manager,
            descriptor,
        ));
    } else {
        info!("no manager configured, awaiting node map pushes");
    }
    tokio::spawn(publish_stats(tracker_dyn.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutting down {}", settings.name);
    Ok(())
}

async fn publish_stats(tracker: Arc<dyn StorageTracker>) {
    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let snapshot = tracker.statistics().snapshot();
        info!(
            "stats: files={} folders={} sent={} received={} deleted={} catalogs_out={} catalogs_in={}",
            snapshot["TotalFiles"],
            snapshot["TotalFolders"],
            snapshot["FilesSent"],
            snapshot["FilesReceived"],
            snapshot["FilesDeleted"],
            snapshot["CatalogsSent"],
            snapshot["CatalogsReceived"],
        );
    }
}
