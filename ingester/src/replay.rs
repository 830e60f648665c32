//! WAL replay: rebuilding head blocks on startup.

use data_types::TraceId;
use observability_deps::tracing::{info, warn};
use tracedb_time::Time;

use crate::{codec, tenant::TenantShard, Error, Result};

/// Replay every closed segment of one tenant into its head block.
///
/// Corrupt records are skipped with a warning and replay continues; an
/// unreadable segment aborts startup, because silently dropping a whole
/// segment would violate the durability contract.
pub(crate) async fn replay_tenant(shard: &TenantShard, now: Time) -> Result<usize> {
    let mut restored = 0usize;
    let mut skipped = 0usize;

    for segment in shard.wal.closed_segments() {
        let mut reader = shard
            .wal
            .reader_for_segment(segment.id())
            .await
            .map_err(|source| Error::Replay { source })?;

        loop {
            match reader.next_record().await {
                Ok(Some(record)) => {
                    match codec::decode_span_entry(&record.payload) {
                        Some((payload, attributes, _encoding)) => {
                            shard.restore(record.trace_id, payload, &attributes, now);
                            restored += 1;
                        }
                        None => {
                            warn_skipped(shard, record.trace_id, segment.id());
                            skipped += 1;
                        }
                    }
                }
                Ok(None) => break,
                Err(e @ wal::Error::CorruptRecord { .. }) => {
                    warn!(
                        tenant = %shard.tenant,
                        segment = %segment.id(),
                        error = %e,
                        "skipping corrupt wal record during replay"
                    );
                    skipped += 1;
                }
                Err(source) => return Err(Error::Replay { source }),
            }
        }
    }

    info!(
        tenant = %shard.tenant,
        restored,
        skipped,
        "wal replay finished"
    );
    Ok(restored)
}

fn warn_skipped(shard: &TenantShard, trace_id: TraceId, segment: wal::SegmentId) {
    warn!(
        tenant = %shard.tenant,
        %trace_id,
        %segment,
        "skipping undecodable span entry during replay"
    );
}
