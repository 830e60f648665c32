use data_types::{TenantId, TraceId};
use wal::{SegmentId, Wal};

fn tenant() -> TenantId {
    TenantId::new("single-tenant").unwrap()
}

fn trace(b: u8) -> TraceId {
    TraceId::from_bytes([b; 16])
}

#[tokio::test]
async fn crud() {
    let dir = test_helpers::tmp_dir().unwrap();

    let wal = Wal::new(dir.path()).await.unwrap();
    let tenant_wal = wal.for_tenant(&tenant()).await.unwrap();

    // Just-created WALs have no closed segments.
    let closed = tenant_wal.closed_segments();
    assert!(
        closed.is_empty(),
        "Expected empty closed segments; got {closed:?}"
    );

    // Can write records to the open segment; fsynced on return.
    let summary = tenant_wal.append(trace(1), b"span one").await.unwrap();
    let first_len = summary.total_bytes;
    assert_eq!(summary.bytes_written, first_len);

    let summary = tenant_wal.append(trace(2), b"span two").await.unwrap();
    assert!(summary.total_bytes > first_len);

    // Can't read records from the open segment; have to rotate first.
    let closed_segment = tenant_wal.rotate().await.unwrap();
    assert_eq!(closed_segment.size(), summary.total_bytes);

    let closed = tenant_wal.closed_segments();
    let ids: Vec<_> = closed.iter().map(|c| c.id()).collect();
    assert_eq!(ids, &[closed_segment.id()]);

    // Can read the written records back from the closed segment.
    let mut reader = tenant_wal
        .reader_for_segment(closed_segment.id())
        .await
        .unwrap();
    let record = reader.next_record().await.unwrap().unwrap();
    assert_eq!(record.trace_id, trace(1));
    assert_eq!(&record.payload[..], b"span one");
    let record = reader.next_record().await.unwrap().unwrap();
    assert_eq!(record.trace_id, trace(2));
    assert!(reader.next_record().await.unwrap().is_none());

    // Can delete a segment, leaving no closed segments again.
    tenant_wal.delete(closed_segment.id()).await.unwrap();
    let closed = tenant_wal.closed_segments();
    assert!(
        closed.is_empty(),
        "Expected empty closed segments; got {closed:?}"
    );
}

#[tokio::test]
async fn replay() {
    let dir = test_helpers::tmp_dir().unwrap();

    // Create a WAL with a record, rotate to close the segment, write another
    // record into the new open segment, then drop the WAL.
    {
        let wal = Wal::new(dir.path()).await.unwrap();
        let tenant_wal = wal.for_tenant(&tenant()).await.unwrap();
        tenant_wal.append(trace(42), b"before rotate").await.unwrap();
        tenant_wal.rotate().await.unwrap();
        tenant_wal.append(trace(43), b"after rotate").await.unwrap();
    }

    // A new WAL instance over the same directory recovers both segments.
    // Replayed WALs treat all files as closed, because effectively they are.
    let wal = Wal::new(dir.path()).await.unwrap();
    assert_eq!(wal.tenants(), vec![tenant()]);
    let tenant_wal = wal.for_tenant(&tenant()).await.unwrap();

    let closed = tenant_wal.closed_segments();
    assert_eq!(closed.len(), 2);

    let mut reader = tenant_wal.reader_for_segment(closed[0].id()).await.unwrap();
    let record = reader.next_record().await.unwrap().unwrap();
    assert_eq!(record.trace_id, trace(42));

    let mut reader = tenant_wal.reader_for_segment(closed[1].id()).await.unwrap();
    let record = reader.next_record().await.unwrap().unwrap();
    assert_eq!(record.trace_id, trace(43));
}

#[tokio::test]
async fn ordering() {
    let dir = test_helpers::tmp_dir().unwrap();

    // Two closed segments and an open one with a record, then drop.
    {
        let wal = Wal::new(dir.path()).await.unwrap();
        let tenant_wal = wal.for_tenant(&tenant()).await.unwrap();

        tenant_wal.append(trace(1), b"a").await.unwrap();
        tenant_wal.rotate().await.unwrap();
        tenant_wal.append(trace(2), b"b").await.unwrap();
        tenant_wal.rotate().await.unwrap();
        tenant_wal.append(trace(3), b"c").await.unwrap();
    }

    let wal = Wal::new(dir.path()).await.unwrap();
    let tenant_wal = wal.for_tenant(&tenant()).await.unwrap();

    // All three files recovered, in creation order.
    let ids: Vec<_> = tenant_wal
        .closed_segments()
        .iter()
        .map(|c| c.id().get())
        .collect();
    assert_eq!(ids, &[0, 1, 2]);

    // New segments created after replay sort later.
    let closed = tenant_wal.rotate().await.unwrap();
    assert_eq!(closed.id(), SegmentId::new(3));
    let closed = tenant_wal.rotate().await.unwrap();
    assert_eq!(closed.id(), SegmentId::new(4));
}

#[tokio::test]
async fn torn_tail_is_discarded() {
    let dir = test_helpers::tmp_dir().unwrap();

    let segment_path = {
        let wal = Wal::new(dir.path()).await.unwrap();
        let tenant_wal = wal.for_tenant(&tenant()).await.unwrap();
        tenant_wal.append(trace(1), b"intact").await.unwrap();
        let closed = tenant_wal.rotate().await.unwrap();
        closed.path().to_owned()
    };

    // Simulate a crash mid-append: a header promising more bytes than exist.
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&segment_path)
            .unwrap();
        f.write_all(&[200, 0, 0, 0, 1, 2, 3, 4, 0xde, 0xad]).unwrap();
    }

    let wal = Wal::new(dir.path()).await.unwrap();
    let tenant_wal = wal.for_tenant(&tenant()).await.unwrap();
    let closed = tenant_wal.closed_segments();
    let mut reader = tenant_wal.reader_for_segment(closed[0].id()).await.unwrap();

    // The intact record reads back, the torn tail is dropped.
    let record = reader.next_record().await.unwrap().unwrap();
    assert_eq!(&record.payload[..], b"intact");
    assert!(reader.next_record().await.unwrap().is_none());
}

#[tokio::test]
async fn tokens_round_trip() {
    let dir = test_helpers::tmp_dir().unwrap();

    assert_eq!(wal::load_tokens(dir.path()).await.unwrap(), None);

    let tokens: Vec<u32> = (0..128).map(|i| i * 33_554_432).collect();
    wal::store_tokens(dir.path(), &tokens).await.unwrap();

    let loaded = wal::load_tokens(dir.path()).await.unwrap();
    assert_eq!(loaded, Some(tokens));
}
