#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Node-local agent core. Assembles the Service sync engine with its
//! bounded-frequency runner and re-exports the policy priority assigner;
//! informer wiring, leader election and the concrete OpenFlow client live
//! with the embedding process.

pub use ovs_agent_core::{
    endpoints_port_map, service_port_map, Endpoint, EndpointPort, EndpointSubset, Endpoints,
    GroupId, OpenFlowClient, PolicyPriority, Priority, Protocol, ResourceId, Service, ServiceInfo,
    ServicePort, ServicePortName,
};
pub use ovs_agent_policy::{
    initial_of_priority, Assignment, OutOfSpace, PriorityAssigner, PriorityUpdates, Revert,
    POLICY_BOTTOM_PRIORITY, POLICY_TOP_PRIORITY,
};
pub use ovs_agent_proxy::{
    BoundedFrequencyRunner, EndpointsChangesTracker, Proxier, ProxyHandle, RunnerHandle,
    ServiceChangesTracker, Syncer,
};

use std::time::Duration;
use tracing::{info_span, Instrument};

const SYNC_RUNNER_NAME: &str = "proxy-sync";
const MIN_SYNC_INTERVAL: Duration = Duration::ZERO;
const MAX_SYNC_INTERVAL: Duration = Duration::from_secs(30);
const SYNC_BURST: u32 = 2;

/// The assembled Service proxy: the sync engine paired with its runner.
pub struct Proxy<C> {
    runner: BoundedFrequencyRunner,
    proxier: Proxier<C>,
    handle: ProxyHandle,
}

impl<C: OpenFlowClient> Proxy<C> {
    pub fn new(of_client: C) -> Self {
        let runner = BoundedFrequencyRunner::new(
            SYNC_RUNNER_NAME,
            MIN_SYNC_INTERVAL,
            MAX_SYNC_INTERVAL,
            SYNC_BURST,
        );
        let proxier = Proxier::new(of_client);
        let handle = proxier.handle(runner.handle());
        Self {
            runner,
            proxier,
            handle,
        }
    }

    /// The event-source and query surface. Clone freely across tasks.
    pub fn handle(&self) -> ProxyHandle {
        self.handle.clone()
    }

    /// Drives the sync loop until `shutdown` fires; an in-flight sync runs
    /// to completion first. Spawn this on the runtime and keep feeding
    /// events through the handle.
    pub async fn run(self, shutdown: drain::Watch) {
        self.runner
            .run(self.proxier, shutdown)
            .instrument(info_span!("proxy"))
            .await
    }
}
