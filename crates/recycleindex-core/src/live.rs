//! Live subscription: one channel and one worker task per event kind.
//!
//! ```text
//!   Feed ──► ManufacturerRegistered ch ──► worker ─┐
//!        ──► ProductCreated ch         ──► worker ─┤
//!        ──► ProductItemsAdded ch      ──► worker ─┼──► Pipeline ──► Store
//!        ──► ProductItemsStatusChanged ──► worker ─┤
//!        ──► ToxicItemCreated ch       ──► worker ─┘
//! ```
//!
//! Order is preserved within a kind; kinds run concurrently.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::IndexerError;
use crate::feed::{EventKind, EventReceiver, Feed};
use crate::pipeline::Pipeline;
use crate::types::IndexPhase;

/// Lifecycle of a [`LiveSubscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    Uninitialized,
    Connected,
    Subscribed,
    TornDown,
}

impl std::fmt::Display for LiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Connected => write!(f, "connected"),
            Self::Subscribed => write!(f, "subscribed"),
            Self::TornDown => write!(f, "torn down"),
        }
    }
}

struct Lifecycle {
    state: LiveState,
    workers: Vec<JoinHandle<()>>,
}

pub struct LiveSubscription {
    feed: Arc<dyn Feed>,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl LiveSubscription {
    pub fn new(feed: Arc<dyn Feed>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            feed,
            pipeline,
            cancel: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: LiveState::Uninitialized,
                workers: Vec::new(),
            }),
        }
    }

    /// Tie the workers to an outer shutdown token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn state(&self) -> LiveState {
        self.lifecycle.lock().await.state
    }

    /// Open the feed connection.
    pub async fn connect(&self) -> Result<(), IndexerError> {
        let mut lc = self.lifecycle.lock().await;
        if lc.state != LiveState::Uninitialized {
            return Err(invalid("connect", lc.state));
        }
        self.feed.connect().await?;
        lc.state = LiveState::Connected;
        debug!("live feed connected");
        Ok(())
    }

    /// Register one handler per event kind and spawn its worker.
    pub async fn subscribe_all(&self) -> Result<(), IndexerError> {
        let mut lc = self.lifecycle.lock().await;
        if lc.state != LiveState::Connected {
            return Err(invalid("subscribe", lc.state));
        }
        for kind in EventKind::ALL {
            let rx = self.feed.subscribe(kind).await?;
            let pipeline = Arc::clone(&self.pipeline);
            let cancel = self.cancel.clone();
            lc.workers
                .push(tokio::spawn(run_worker(kind, rx, pipeline, cancel)));
        }
        lc.state = LiveState::Subscribed;
        info!(kinds = EventKind::ALL.len(), "live subscription started");
        Ok(())
    }

    /// `connect` followed by `subscribe_all`.
    pub async fn start(&self) -> Result<(), IndexerError> {
        self.connect().await?;
        self.subscribe_all().await
    }

    /// Cancel the workers, deregister every handler and release the
    /// connection. Calling it again is a no-op.
    pub async fn stop(&self) -> Result<(), IndexerError> {
        let mut lc = self.lifecycle.lock().await;
        if lc.state == LiveState::TornDown {
            return Ok(());
        }

        self.cancel.cancel();
        for handle in lc.workers.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "live worker ended abnormally");
            }
        }

        if lc.state != LiveState::Uninitialized {
            if let Err(e) = self.feed.unsubscribe_all().await {
                warn!(error = %e, "unsubscribe failed during teardown");
            }
            if let Err(e) = self.feed.disconnect().await {
                warn!(error = %e, "disconnect failed during teardown");
            }
        }

        lc.state = LiveState::TornDown;
        info!("live subscription stopped");
        Ok(())
    }
}

fn invalid(operation: &str, state: LiveState) -> IndexerError {
    IndexerError::InvalidState {
        operation: operation.to_string(),
        state: state.to_string(),
    }
}

async fn run_worker(
    kind: EventKind,
    mut rx: EventReceiver,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
) {
    debug!(%kind, "live worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => next,
        };
        let Some(event) = next else {
            warn!(%kind, "live channel closed, worker exiting");
            break;
        };
        // Per-event failures are logged by the pipeline; only shutdown ends the loop.
        if let Err(IndexerError::Cancelled) =
            pipeline.process(&event, IndexPhase::Live, &cancel).await
        {
            break;
        }
    }
    debug!(%kind, "live worker stopped");
}
