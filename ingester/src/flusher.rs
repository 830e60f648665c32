//! The cooperative flusher task: evaluates cut triggers and uploads frozen
//! blocks.

use std::sync::Arc;

use backoff::{Backoff, BackoffConfig};
use observability_deps::tracing::warn;
use tokio_util::sync::CancellationToken;

use crate::ingester::Ingester;

/// Periodically drive the freeze / upload cycle until cancelled.
///
/// Upload failures are logged and left in place; the frozen block is picked
/// up again on a later cycle, which is what retries a partially uploaded
/// block. Consecutive failing cycles back off so a struggling backend is not
/// hammered at the flush cadence.
pub(crate) async fn run(ingester: Arc<Ingester>, cancel: CancellationToken) {
    let mut backoff = Backoff::new(&BackoffConfig::default());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ingester.time().sleep(ingester.config().flush_check_period) => {}
        }
        match ingester.flush_cycle(false).await {
            Ok(()) => backoff.reset(),
            Err(e) => {
                warn!(error = %e, "flush cycle failed; backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff.next()) => {}
                }
            }
        }
    }
}
