#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Core data model shared by the agent's policy and proxy paths, plus the
//! seam to the OpenFlow programming library.

mod priority;
mod service;

pub use self::{
    priority::{PolicyPriority, Priority},
    service::{
        endpoints_port_map, service_port_map, Endpoint, EndpointPort, EndpointSubset, Endpoints,
        GroupId, Protocol, ResourceId, Service, ServiceInfo, ServicePort, ServicePortName,
    },
};

use anyhow::Result;
use std::net::IpAddr;

/// The OpenFlow programming capabilities the sync engine drives. The real
/// client lives outside this crate; tests substitute a recording double.
#[async_trait::async_trait]
pub trait OpenFlowClient: Send + Sync + 'static {
    async fn install_service_flows(
        &self,
        group_id: GroupId,
        ip: IpAddr,
        port: u16,
        protocol: Protocol,
        sticky_max_age_seconds: u16,
    ) -> Result<()>;

    async fn uninstall_service_flows(&self, ip: IpAddr, port: u16, protocol: Protocol)
        -> Result<()>;

    async fn install_load_balancer_service_flows(
        &self,
        group_id: GroupId,
        ingress_ip: IpAddr,
        port: u16,
        protocol: Protocol,
        sticky_max_age_seconds: u16,
    ) -> Result<()>;

    async fn install_endpoint_flows(&self, protocol: Protocol, endpoints: &[Endpoint])
        -> Result<()>;

    async fn uninstall_endpoint_flows(&self, protocol: Protocol, endpoint: &Endpoint)
        -> Result<()>;

    async fn install_service_group(
        &self,
        group_id: GroupId,
        with_session_affinity: bool,
        endpoints: &[Endpoint],
    ) -> Result<()>;

    async fn uninstall_service_group(&self, group_id: GroupId) -> Result<()>;
}
