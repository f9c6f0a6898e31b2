#![allow(dead_code)]

//! Shared fixtures for engine integration tests: in-process fabric
//! domains and linked agent pairs.

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use gantry_api::{BackendEngine, EngineConfig, InitParams, Notification, XferStatus};
use gantry_engine::{FabricEngine, FabricXferHandle};
use gantry_fabric::{FabricDomain, NicLocation};

/// How long polls wait before declaring a scenario stuck.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);

static TRACING: Once = Once::new();

/// Route engine logs into the test harness once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// A domain where every NIC sits on NUMA node 0 with no GPU affinity.
pub fn uniform_domain(nics: usize) -> Arc<FabricDomain> {
    let domain = FabricDomain::new();
    for i in 0..nics {
        domain.add_nic(&format!("nic{i}"), NicLocation { numa_node: 0, gpu: None });
    }
    domain
}

/// A two-GPU host: nic0/nic1 beside GPU 0 on NUMA 0, nic2/nic3 beside
/// GPU 1 on NUMA 1.
pub fn two_gpu_domain() -> Arc<FabricDomain> {
    let domain = FabricDomain::new();
    domain.add_nic("nic0", NicLocation { numa_node: 0, gpu: Some(0) });
    domain.add_nic("nic1", NicLocation { numa_node: 0, gpu: Some(0) });
    domain.add_nic("nic2", NicLocation { numa_node: 1, gpu: Some(1) });
    domain.add_nic("nic3", NicLocation { numa_node: 1, gpu: Some(1) });
    domain
}

/// Two engines with each other's endpoints loaded and `a -> b`
/// connected.
pub fn linked_pair(
    domain: &Arc<FabricDomain>,
    a_name: &str,
    b_name: &str,
    config: EngineConfig,
) -> (FabricEngine, FabricEngine) {
    init_tracing();
    let a =
        FabricEngine::new(InitParams::new(a_name).with_config(config.clone()), domain).unwrap();
    let b = FabricEngine::new(InitParams::new(b_name).with_config(config), domain).unwrap();

    a.load_remote_conn_info(b_name, &b.get_conn_info().unwrap()).unwrap();
    b.load_remote_conn_info(a_name, &a.get_conn_info().unwrap()).unwrap();
    a.connect(b_name).unwrap();
    (a, b)
}

/// Poll a handle until the engine reports completion.
pub fn poll_complete(engine: &FabricEngine, handle: &mut FabricXferHandle) {
    let deadline = Instant::now() + POLL_TIMEOUT;
    loop {
        match engine.check_xfer(handle).unwrap() {
            XferStatus::Completed => return,
            XferStatus::InProgress => {
                assert!(Instant::now() < deadline, "transfer did not complete in time");
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// Drain notifications until `count` have arrived.
pub fn wait_notifs(engine: &FabricEngine, count: usize) -> Vec<Notification> {
    let deadline = Instant::now() + POLL_TIMEOUT;
    let mut notifs = Vec::new();
    while notifs.len() < count {
        let _ = engine.get_notifs(&mut notifs).unwrap();
        if notifs.len() < count {
            assert!(Instant::now() < deadline, "expected {count} notifications, got {}", notifs.len());
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    notifs
}

/// A deterministic, non-repeating payload pattern.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
