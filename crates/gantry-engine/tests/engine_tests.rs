//! End-to-end scenarios for the fabric engine: one-sided transfers,
//! striping, notification ordering, reconnects, and topology routing.

mod common;

use common::{linked_pair, pattern, poll_complete, two_gpu_domain, uniform_domain, wait_notifs};

use gantry_api::{
    BackendEngine, BackendError, EngineConfig, MemoryKind, MemoryRegion, MetaDesc, XferArgs,
    XferOp, XferStatus,
};

#[test]
fn test_host_to_host_write_with_notification() {
    // Two agents, 64 MiB of host memory each; A writes into B and
    // attaches the message "done".
    let domain = uniform_domain(2);
    let (a, b) = linked_pair(&domain, "A", "B", EngineConfig::default());

    const LEN: usize = 64 * 1024 * 1024;
    let src = pattern(LEN);
    let dst = vec![0u8; LEN];

    let a_md = a.register_mem(&MemoryRegion::of_slice(&src, 0)).unwrap();
    let b_md = b.register_mem(&MemoryRegion::of_slice(&dst, 0)).unwrap();

    let blob = b.get_public_data(&b_md).unwrap();
    let b_public = a.load_remote_md(&blob, MemoryKind::Host, "B").unwrap();

    let local = [MetaDesc::new(MemoryRegion::of_slice(&src, 0), &a_md)];
    let remote = [MetaDesc::new(MemoryRegion::of_slice(&dst, 0), &b_public)];

    let args = XferArgs::with_notif("done");
    let mut handle = a.prep_xfer(XferOp::Write, &local, &remote, "B", Some(&args)).unwrap();
    a.post_xfer(XferOp::Write, &local, &remote, "B", &mut handle, Some(&args)).unwrap();
    poll_complete(&a, &mut handle);

    let notifs = wait_notifs(&b, 1);
    assert_eq!(notifs[0].from, "A");
    assert_eq!(notifs[0].msg, "done");
    assert_eq!(dst, src, "target buffer must match byte for byte");

    a.release_req(handle).unwrap();
    assert_eq!(a.data_requests_in_flight(), 0);

    a.deregister_mem(a_md).unwrap();
    b.deregister_mem(b_md).unwrap();
}

#[test]
fn test_striping_emits_one_chunk_per_rail() {
    // 8 MiB at a 1 MiB threshold over 4 rails: 4 chunks of 2 MiB.
    let domain = uniform_domain(4);
    let mut config = EngineConfig::default();
    config.striping_threshold = 1024 * 1024;
    let (a, b) = linked_pair(&domain, "SA", "SB", config);

    const LEN: usize = 8 * 1024 * 1024;
    let src = pattern(LEN);
    let dst = vec![0u8; LEN];

    let a_md = a.register_mem(&MemoryRegion::of_slice(&src, 0)).unwrap();
    let b_md = b.register_mem(&MemoryRegion::of_slice(&dst, 0)).unwrap();
    let b_public =
        a.load_remote_md(&b.get_public_data(&b_md).unwrap(), MemoryKind::Host, "SB").unwrap();

    let local = [MetaDesc::new(MemoryRegion::of_slice(&src, 0), &a_md)];
    let remote = [MetaDesc::new(MemoryRegion::of_slice(&dst, 0), &b_public)];
    let mut handle = a.prep_xfer(XferOp::Write, &local, &remote, "SB", None).unwrap();
    a.post_xfer(XferOp::Write, &local, &remote, "SB", &mut handle, None).unwrap();
    poll_complete(&a, &mut handle);

    assert_eq!(handle.total_requests(), 4);
    assert_eq!(handle.completed_requests(), 4);
    assert_eq!(dst, src);
}

#[test]
fn test_sequential_small_writes_round_robin() {
    // 100 sequential 4 KiB writes stay below the striping threshold:
    // one request each, notifications delivered in submission order.
    let domain = uniform_domain(4);
    let (a, b) = linked_pair(&domain, "RA", "RB", EngineConfig::default());

    const LEN: usize = 4 * 1024;
    let src = pattern(LEN);
    let dst = vec![0u8; LEN];

    let a_md = a.register_mem(&MemoryRegion::of_slice(&src, 0)).unwrap();
    let b_md = b.register_mem(&MemoryRegion::of_slice(&dst, 0)).unwrap();
    let b_public =
        a.load_remote_md(&b.get_public_data(&b_md).unwrap(), MemoryKind::Host, "RB").unwrap();

    let local = [MetaDesc::new(MemoryRegion::of_slice(&src, 0), &a_md)];
    let remote = [MetaDesc::new(MemoryRegion::of_slice(&dst, 0), &b_public)];

    for i in 0..100 {
        let args = XferArgs::with_notif(format!("write-{i:03}"));
        let mut handle = a.prep_xfer(XferOp::Write, &local, &remote, "RB", Some(&args)).unwrap();
        a.post_xfer(XferOp::Write, &local, &remote, "RB", &mut handle, Some(&args)).unwrap();
        poll_complete(&a, &mut handle);
        assert_eq!(handle.total_requests(), 1);
        a.release_req(handle).unwrap();
    }

    let notifs = wait_notifs(&b, 100);
    assert!(notifs.iter().all(|n| n.from == "RA"));

    // Every write is announced exactly once...
    let mut msgs: Vec<&str> = notifs.iter().map(|n| n.msg.as_str()).collect();
    msgs.sort_unstable();
    let expected: Vec<String> = (0..100).map(|i| format!("write-{i:03}")).collect();
    assert_eq!(msgs, expected.iter().map(String::as_str).collect::<Vec<_>>());

    // ...and within each rail (writes rotate over 4 rails) delivery
    // preserves submission order.
    for rail in 0..4 {
        let on_rail: Vec<&str> = notifs
            .iter()
            .map(|n| n.msg.as_str())
            .filter(|msg| msg[6..].parse::<usize>().unwrap() % 4 == rail)
            .collect();
        let mut sorted = on_rail.clone();
        sorted.sort_unstable();
        assert_eq!(on_rail, sorted, "rail {rail} deliveries out of submission order");
    }

    assert_eq!(a.data_requests_in_flight(), 0);
    assert_eq!(dst, src);
}

#[test]
fn test_notification_gated_on_data_visibility() {
    // The receiver's management thread sees the notification before
    // the receiver ever drains its data completions; delivery must
    // wait for the writes.
    let domain = uniform_domain(4);
    let mut config = EngineConfig::default();
    config.striping_threshold = 1024 * 1024;
    let (a, b) = linked_pair(&domain, "GA", "GB", config);

    const LEN: usize = 4 * 1024 * 1024;
    let src = pattern(LEN);
    let dst = vec![0u8; LEN];

    let a_md = a.register_mem(&MemoryRegion::of_slice(&src, 0)).unwrap();
    let b_md = b.register_mem(&MemoryRegion::of_slice(&dst, 0)).unwrap();
    let b_public =
        a.load_remote_md(&b.get_public_data(&b_md).unwrap(), MemoryKind::Host, "GB").unwrap();

    let local = [MetaDesc::new(MemoryRegion::of_slice(&src, 0), &a_md)];
    let remote = [MetaDesc::new(MemoryRegion::of_slice(&dst, 0), &b_public)];
    let args = XferArgs::with_notif("gated");
    let mut handle = a.prep_xfer(XferOp::Write, &local, &remote, "GB", Some(&args)).unwrap();
    a.post_xfer(XferOp::Write, &local, &remote, "GB", &mut handle, Some(&args)).unwrap();
    poll_complete(&a, &mut handle);

    // Once delivered, the data named by the notification is fully
    // visible.
    let notifs = wait_notifs(&b, 1);
    assert_eq!(notifs[0].msg, "gated");
    assert_eq!(dst, src);
}

#[test]
fn test_read_pulls_remote_region() {
    let domain = uniform_domain(2);
    let (a, b) = linked_pair(&domain, "RdA", "RdB", EngineConfig::default());

    const LEN: usize = 1024 * 1024;
    let dst = vec![0u8; LEN];
    let src = pattern(LEN);

    let a_md = a.register_mem(&MemoryRegion::of_slice(&dst, 0)).unwrap();
    let b_md = b.register_mem(&MemoryRegion::of_slice(&src, 0)).unwrap();
    let b_public =
        a.load_remote_md(&b.get_public_data(&b_md).unwrap(), MemoryKind::Host, "RdB").unwrap();

    let local = [MetaDesc::new(MemoryRegion::of_slice(&dst, 0), &a_md)];
    let remote = [MetaDesc::new(MemoryRegion::of_slice(&src, 0), &b_public)];
    let mut handle = a.prep_xfer(XferOp::Read, &local, &remote, "RdB", None).unwrap();
    a.post_xfer(XferOp::Read, &local, &remote, "RdB", &mut handle, None).unwrap();
    poll_complete(&a, &mut handle);

    assert_eq!(dst, src);
}

#[test]
fn test_disconnect_then_reconnect() {
    let domain = uniform_domain(2);
    let (a, b) = linked_pair(&domain, "CA", "CB", EngineConfig::default());

    a.disconnect("CB").unwrap();
    assert!(matches!(a.disconnect("CB"), Err(BackendError::NotFound { .. })));

    // The record survives teardown; a fresh connect re-establishes.
    a.connect("CB").unwrap();

    const LEN: usize = 64 * 1024;
    let src = pattern(LEN);
    let dst = vec![0u8; LEN];
    let a_md = a.register_mem(&MemoryRegion::of_slice(&src, 0)).unwrap();
    let b_md = b.register_mem(&MemoryRegion::of_slice(&dst, 0)).unwrap();
    let b_public =
        a.load_remote_md(&b.get_public_data(&b_md).unwrap(), MemoryKind::Host, "CB").unwrap();

    let local = [MetaDesc::new(MemoryRegion::of_slice(&src, 0), &a_md)];
    let remote = [MetaDesc::new(MemoryRegion::of_slice(&dst, 0), &b_public)];
    let mut handle = a.prep_xfer(XferOp::Write, &local, &remote, "CB", None).unwrap();
    a.post_xfer(XferOp::Write, &local, &remote, "CB", &mut handle, None).unwrap();
    poll_complete(&a, &mut handle);
    assert_eq!(dst, src);
}

#[test]
fn test_self_transfer_uses_same_api() {
    // Local transfers run the remote code path over the loopback
    // connection created at construction.
    let domain = uniform_domain(2);
    let (a, _b) = linked_pair(&domain, "Solo", "Other", EngineConfig::default());

    const LEN: usize = 256 * 1024;
    let src = pattern(LEN);
    let dst = vec![0u8; LEN];

    let src_md = a.register_mem(&MemoryRegion::of_slice(&src, 0)).unwrap();
    let dst_md = a.register_mem(&MemoryRegion::of_slice(&dst, 0)).unwrap();
    let dst_public = a.load_local_md(&dst_md).unwrap();

    let local = [MetaDesc::new(MemoryRegion::of_slice(&src, 0), &src_md)];
    let remote = [MetaDesc::new(MemoryRegion::of_slice(&dst, 0), &dst_public)];
    let args = XferArgs::with_notif("self-done");
    let mut handle = a.prep_xfer(XferOp::Write, &local, &remote, "Solo", Some(&args)).unwrap();
    a.post_xfer(XferOp::Write, &local, &remote, "Solo", &mut handle, Some(&args)).unwrap();
    poll_complete(&a, &mut handle);

    let notifs = wait_notifs(&a, 1);
    assert_eq!(notifs[0].from, "Solo");
    assert_eq!(notifs[0].msg, "self-done");
    assert_eq!(dst, src);
}

#[test]
fn test_two_gpu_regions_use_disjoint_rails() {
    // R0 on GPU 0 and R1 on GPU 1 map to disjoint rail sets; writing
    // both at once completes each within its own set.
    let domain = two_gpu_domain();
    let (a, b) = linked_pair(&domain, "MA", "MB", EngineConfig::default());

    const LEN: usize = 2 * 1024 * 1024;
    let src0 = pattern(LEN);
    let src1: Vec<u8> = pattern(LEN).into_iter().rev().collect();
    let dst0 = vec![0u8; LEN];
    let dst1 = vec![0u8; LEN];

    let region = |buf: &Vec<u8>, gpu| MemoryRegion::device(buf.as_ptr() as u64, buf.len(), gpu);

    let a_md0 = a.register_mem(&region(&src0, 0)).unwrap();
    let a_md1 = a.register_mem(&region(&src1, 1)).unwrap();
    let b_md0 = b.register_mem(&region(&dst0, 0)).unwrap();
    let b_md1 = b.register_mem(&region(&dst1, 1)).unwrap();

    let rails0 = a_md0.selected_rails().to_vec();
    let rails1 = a_md1.selected_rails().to_vec();
    assert!(!rails0.is_empty() && !rails1.is_empty());
    assert!(
        rails0.iter().all(|rail| !rails1.contains(rail)),
        "GPU 0 and GPU 1 rails must be disjoint: {rails0:?} vs {rails1:?}"
    );

    let b_public0 =
        a.load_remote_md(&b.get_public_data(&b_md0).unwrap(), MemoryKind::Device, "MB").unwrap();
    let b_public1 =
        a.load_remote_md(&b.get_public_data(&b_md1).unwrap(), MemoryKind::Device, "MB").unwrap();

    let local0 = [MetaDesc::new(region(&src0, 0), &a_md0)];
    let remote0 = [MetaDesc::new(region(&dst0, 0), &b_public0)];
    let local1 = [MetaDesc::new(region(&src1, 1), &a_md1)];
    let remote1 = [MetaDesc::new(region(&dst1, 1), &b_public1)];

    let mut h0 = a.prep_xfer(XferOp::Write, &local0, &remote0, "MB", None).unwrap();
    let mut h1 = a.prep_xfer(XferOp::Write, &local1, &remote1, "MB", None).unwrap();
    a.post_xfer(XferOp::Write, &local0, &remote0, "MB", &mut h0, None).unwrap();
    a.post_xfer(XferOp::Write, &local1, &remote1, "MB", &mut h1, None).unwrap();
    poll_complete(&a, &mut h0);
    poll_complete(&a, &mut h1);

    assert_eq!(dst0, src0);
    assert_eq!(dst1, src1);
}

#[test]
fn test_progress_thread_mode_completes_transfers() {
    // Same write flow with the background progress thread enabled.
    let domain = uniform_domain(2);
    let mut config = EngineConfig::default();
    config.enable_progress_thread = true;
    config.progress_thread_delay_us = 50;
    let (a, b) = linked_pair(&domain, "PA", "PB", config);

    const LEN: usize = 1024 * 1024;
    let src = pattern(LEN);
    let dst = vec![0u8; LEN];
    let a_md = a.register_mem(&MemoryRegion::of_slice(&src, 0)).unwrap();
    let b_md = b.register_mem(&MemoryRegion::of_slice(&dst, 0)).unwrap();
    let b_public =
        a.load_remote_md(&b.get_public_data(&b_md).unwrap(), MemoryKind::Host, "PB").unwrap();

    let local = [MetaDesc::new(MemoryRegion::of_slice(&src, 0), &a_md)];
    let remote = [MetaDesc::new(MemoryRegion::of_slice(&dst, 0), &b_public)];
    let args = XferArgs::with_notif("threaded");
    let mut handle = a.prep_xfer(XferOp::Write, &local, &remote, "PB", Some(&args)).unwrap();
    a.post_xfer(XferOp::Write, &local, &remote, "PB", &mut handle, Some(&args)).unwrap();
    poll_complete(&a, &mut handle);

    let notifs = wait_notifs(&b, 1);
    assert_eq!(notifs[0].msg, "threaded");
    assert_eq!(dst, src);
}

#[test]
fn test_standalone_notification() {
    let domain = uniform_domain(1);
    let (a, b) = linked_pair(&domain, "NA", "NB", EngineConfig::default());

    a.gen_notif("NB", "standalone").unwrap();
    let notifs = wait_notifs(&b, 1);
    assert_eq!(notifs[0].from, "NA");
    assert_eq!(notifs[0].msg, "standalone");

    assert!(matches!(a.gen_notif("nobody", "x"), Err(BackendError::NotFound { .. })));
}

#[test]
fn test_get_notifs_empty_is_in_progress() {
    let domain = uniform_domain(1);
    let (a, _b) = linked_pair(&domain, "EA", "EB", EngineConfig::default());
    let mut out = Vec::new();
    assert_eq!(a.get_notifs(&mut out).unwrap(), XferStatus::InProgress);
    assert!(out.is_empty());
}

#[test]
fn test_unreachable_device_registration_not_supported() {
    let domain = two_gpu_domain();
    let (a, _b) = linked_pair(&domain, "UA", "UB", EngineConfig::default());

    let buf = vec![0u8; 4096];
    let err = a
        .register_mem(&MemoryRegion::device(buf.as_ptr() as u64, buf.len(), 7))
        .unwrap_err();
    assert!(matches!(err, BackendError::NotSupported { .. }));
}
