//! Execution of one compaction job: a k-way merge over the input blocks.

use std::sync::Arc;

use block_store::{
    block_reader, mark_compacted, BlockWrite, DynObjectStore, PrefetchIterator, TraceIterator,
    TraceObject,
};
use bytes::Bytes;
use data_types::{BlockId, BlockMeta, TraceId};
use observability_deps::tracing::warn;
use tracedb_time::TimeProvider;

use crate::{plan::CompactionJob, Error, Result};

/// Merge the job's inputs into one output block at `max(level) + 1`.
///
/// Records stream through prefetched iterators in trace-id order; equal ids
/// across inputs are collapsed into a single record whose span lists
/// concatenate in input (block-id) order, making the merge deterministic
/// given the same inputs. Inputs are marked compacted only after the output
/// meta is durable.
pub async fn compact_job(
    store: Arc<DynObjectStore>,
    tenant: &data_types::TenantId,
    job: CompactionJob,
    block_config: block_store::BlockConfig,
    prefetch_buffer: usize,
    time: &dyn TimeProvider,
) -> Result<BlockMeta> {
    let encoding = job.inputs[0].encoding.clone();
    for input in &job.inputs[1..] {
        if input.encoding != encoding {
            return Err(Error::MixedEncodings {
                a: encoding.to_string(),
                b: input.encoding.to_string(),
            });
        }
    }

    let output_level = job.output_level();
    let expected_objects: u64 = job.inputs.iter().map(|m| m.total_objects).sum();
    let start = job.inputs.iter().map(|m| m.start).min().expect("non-empty job");
    let end = job.inputs.iter().map(|m| m.end).max().expect("non-empty job");

    // Open a prefetched iterator per input.
    let mut iters: Vec<PrefetchIterator> = Vec::with_capacity(job.inputs.len());
    for meta in &job.inputs {
        let reader = block_reader(Arc::clone(&store), meta.clone());
        let iter = reader.iter().await?;
        iters.push(PrefetchIterator::new(Box::new(iter), prefetch_buffer));
    }

    let output_id = BlockId::new_at(time.now());
    let mut write = BlockWrite::new(
        Arc::clone(&store),
        tenant.clone(),
        output_id,
        block_config,
        encoding,
        output_level,
        expected_objects,
    )
    .await?;

    match merge_into(&mut iters, &mut write, output_id).await {
        Ok(()) => {}
        Err(e) => {
            close_all(&mut iters).await;
            if let Err(abort_err) = write.abort().await {
                warn!(error = %abort_err, "failed to abort compaction output");
            }
            return Err(e);
        }
    }
    close_all(&mut iters).await;

    let output = write.complete(start, end).await?;

    // The output is visible; supersede the inputs.
    let now = time.now();
    for input in &job.inputs {
        mark_compacted(&*store, tenant, input.block_id, now).await?;
    }
    Ok(output)
}

/// Advance all iterators in lockstep, writing merged records to `write`.
async fn merge_into(
    iters: &mut [PrefetchIterator],
    write: &mut BlockWrite,
    output_id: BlockId,
) -> Result<()> {
    // The current head record of each input, pulled on demand.
    let mut heads: Vec<Option<(TraceId, Bytes)>> = Vec::with_capacity(iters.len());
    for iter in iters.iter_mut() {
        heads.push(iter.next().await?);
    }

    loop {
        let Some(min_id) = heads
            .iter()
            .filter_map(|h| h.as_ref().map(|(id, _)| *id))
            .min()
        else {
            return Ok(());
        };

        // Collapse every input's record for `min_id`, in input order.
        let mut merged: Option<Bytes> = None;
        for (head, iter) in heads.iter_mut().zip(iters.iter_mut()) {
            while matches!(head, Some((id, _)) if *id == min_id) {
                let (_, bytes) = head.take().expect("head matched above");
                merged = Some(match merged {
                    None => bytes,
                    Some(existing) => {
                        TraceObject::merge(&existing, &bytes, min_id, output_id)?
                    }
                });
                *head = iter.next().await?;
            }
        }

        write
            .append(min_id, merged.expect("at least one input held min_id"))
            .await?;
    }
}

async fn close_all(iters: &mut [PrefetchIterator]) {
    for iter in iters.iter_mut() {
        iter.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_store::{list_blocks, BlockConfig};
    use data_types::{DataEncoding, TenantId, TraceAttributes};
    use object_store::memory::InMemory;
    use tracedb_time::{MockProvider, Time};

    fn tenant() -> TenantId {
        TenantId::new("single-tenant").unwrap()
    }

    fn id(n: u8) -> TraceId {
        TraceId::from_bytes([n; 16])
    }

    fn object(span: &str, start: u64) -> Bytes {
        TraceObject {
            attributes: TraceAttributes {
                root_service_name: "svc".into(),
                root_span_name: "op".into(),
                start_unix_nanos: start,
                end_unix_nanos: start + 10,
                error: false,
                tags: vec![],
            },
            encoding: DataEncoding::default(),
            spans: vec![Bytes::copy_from_slice(span.as_bytes())],
        }
        .encode()
    }

    async fn build_block(
        store: &Arc<DynObjectStore>,
        records: &[(u8, &str)],
        created_ms: i64,
    ) -> BlockMeta {
        let mut write = BlockWrite::new(
            Arc::clone(store),
            tenant(),
            BlockId::new_at(Time::from_timestamp_millis(created_ms)),
            BlockConfig::default(),
            DataEncoding::default(),
            0,
            records.len() as u64,
        )
        .await
        .unwrap();
        for (n, span) in records {
            write.append(id(*n), object(span, u64::from(*n))).await.unwrap();
        }
        write
            .complete(
                Time::from_timestamp_nanos(0),
                Time::from_timestamp_nanos(1_000),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn merge_collapses_duplicate_trace_ids() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let time = MockProvider::new(Time::from_timestamp_millis(10_000));

        // Two blocks both holding trace X, with different spans.
        let a = build_block(&store, &[(1, "α"), (5, "only-a")], 1_000).await;
        let b = build_block(&store, &[(1, "β"), (9, "only-b")], 2_000).await;

        let output = compact_job(
            Arc::clone(&store),
            &tenant(),
            CompactionJob {
                inputs: vec![a.clone(), b.clone()],
            },
            BlockConfig::default(),
            4,
            &time,
        )
        .await
        .unwrap();

        assert_eq!(output.compaction_level, 1);
        assert_eq!(output.total_objects, 3);

        // The merged record concatenates spans in input order.
        let reader = block_reader(Arc::clone(&store), output.clone());
        let merged = reader.find_trace(id(1)).await.unwrap().unwrap();
        let merged = TraceObject::decode(&merged, output.block_id).unwrap();
        assert_eq!(
            merged.spans,
            vec![
                Bytes::copy_from_slice("α".as_bytes()),
                Bytes::copy_from_slice("β".as_bytes())
            ]
        );

        // Inputs are superseded but still present for the grace period.
        let list = list_blocks(Arc::clone(&store), &tenant()).await.unwrap();
        assert_eq!(list.live.len(), 1);
        assert!(list.live.contains_key(&output.block_id));
        assert!(list.compacted.contains_key(&a.block_id));
        assert!(list.compacted.contains_key(&b.block_id));
    }

    #[tokio::test]
    async fn merge_is_deterministic_across_runs() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let time = MockProvider::new(Time::from_timestamp_millis(10_000));

        let a = build_block(&store, &[(1, "α")], 1_000).await;
        let b = build_block(&store, &[(1, "β")], 2_000).await;

        let first = compact_job(
            Arc::clone(&store),
            &tenant(),
            CompactionJob {
                inputs: vec![a.clone(), b.clone()],
            },
            BlockConfig::default(),
            4,
            &time,
        )
        .await
        .unwrap();

        let reader = block_reader(Arc::clone(&store), first.clone());
        let merged_bytes = reader.find_trace(id(1)).await.unwrap().unwrap();

        // Re-running over the same (still readable) inputs produces the same
        // record bytes, under a fresh output block id.
        let second = compact_job(
            Arc::clone(&store),
            &tenant(),
            CompactionJob {
                inputs: vec![a, b],
            },
            BlockConfig::default(),
            4,
            &time,
        )
        .await
        .unwrap();
        assert_ne!(first.block_id, second.block_id);

        let reader = block_reader(Arc::clone(&store), second.clone());
        let again = reader.find_trace(id(1)).await.unwrap().unwrap();
        assert_eq!(merged_bytes, again);
    }
}
