#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The Service load-balancing half of the agent: change trackers coalesce
//! Service and Endpoints events, a bounded-frequency runner serializes sync
//! invocations, and the sync engine converges the switch's flows and
//! groups to the desired state.

mod group;
mod proxier;
mod runner;
mod tracker;


pub use self::{
    group::GroupCounter,
    proxier::{Proxier, ProxyHandle},
    runner::{BoundedFrequencyRunner, RunnerHandle, Syncer},
    tracker::{
        EndpointsChangesTracker, EndpointsMap, ServiceChangesTracker, ServiceMap, StaleEndpoints,
    },
};
