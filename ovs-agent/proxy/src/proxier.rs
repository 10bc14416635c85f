use crate::{
    group::GroupCounter,
    runner::{RunnerHandle, Syncer},
    tracker::{EndpointsChangesTracker, EndpointsMap, ServiceChangesTracker, ServiceMap, StaleEndpoints},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use ovs_agent_core::{Endpoints, OpenFlowClient, Service, ServicePortName};
use parking_lot::Mutex;
use std::{sync::Arc, time::Instant};
use tracing::{debug, error};

/// Converges the flows and groups installed on the switch to the desired
/// state accumulated by the change trackers.
///
/// All mutation happens in [`Proxier::sync_proxy_rules`], which only ever
/// runs from the bounded-frequency runner's serialized invocation; the
/// desired- and installed-state maps are owned here and need no locks.
pub struct Proxier<C> {
    service_changes: Arc<ServiceChangesTracker>,
    endpoints_changes: Arc<EndpointsChangesTracker>,
    /// Services we expect to be installed.
    pub(crate) service_map: ServiceMap,
    /// Services we actually installed.
    pub(crate) service_installed_map: ServiceMap,
    /// Endpoints we expect to be installed.
    pub(crate) endpoints_map: EndpointsMap,
    /// Endpoint identities acknowledged by the switch, per Service port.
    pub(crate) endpoint_installed_map: HashMap<ServicePortName, HashSet<String>>,
    /// Reverse index from `ClusterIP:Port/Proto` to the Service port,
    /// shared with query paths on other tasks.
    service_string_map: Arc<Mutex<HashMap<String, ServicePortName>>>,
    pub(crate) group_counter: GroupCounter,
    of_client: C,
}

impl<C: OpenFlowClient> Proxier<C> {
    pub fn new(of_client: C) -> Self {
        Self {
            service_changes: Arc::new(ServiceChangesTracker::default()),
            endpoints_changes: Arc::new(EndpointsChangesTracker::default()),
            service_map: ServiceMap::new(),
            service_installed_map: ServiceMap::new(),
            endpoints_map: EndpointsMap::new(),
            endpoint_installed_map: HashMap::new(),
            service_string_map: Arc::new(Mutex::new(HashMap::new())),
            group_counter: GroupCounter::new(),
            of_client,
        }
    }

    /// The event-source and query surface, shared with informer tasks.
    /// `runner` is pinged whenever a change makes a sync worthwhile.
    pub fn handle(&self, runner: RunnerHandle) -> ProxyHandle {
        ProxyHandle {
            service_changes: self.service_changes.clone(),
            endpoints_changes: self.endpoints_changes.clone(),
            service_string_map: self.service_string_map.clone(),
            runner,
        }
    }

    fn is_initialized(&self) -> bool {
        self.service_changes.synced() && self.endpoints_changes.synced()
    }

    /// Applies pending tracker changes and converges the switch: stale
    /// endpoints are removed first, then stale services, then missing or
    /// changed services are installed. A Service re-binding its ClusterIP
    /// therefore never briefly points at stale endpoints.
    pub async fn sync_proxy_rules(&mut self) {
        let start = Instant::now();
        if !self.is_initialized() {
            debug!("not syncing rules until both Services and Endpoints have been synced");
            return;
        }

        let stale_endpoints = self.endpoints_changes.update(&mut self.endpoints_map);
        self.service_changes.update(&mut self.service_map);

        self.remove_stale_endpoints(stale_endpoints).await;
        self.remove_stale_services().await;
        self.install_services().await;
        debug!(elapsed = ?start.elapsed(), "synced proxy rules");
    }

    async fn remove_stale_endpoints(&mut self, stale_endpoints: StaleEndpoints) {
        for (svc_port_name, endpoints) in stale_endpoints {
            let protocol = svc_port_name.protocol;
            for (id, endpoint) in endpoints {
                if let Err(error) = self
                    .of_client
                    .uninstall_endpoint_flows(protocol, &endpoint)
                    .await
                {
                    error!(service = %svc_port_name, endpoint = %endpoint, %error, "failed to remove endpoint flows");
                    continue;
                }
                if let Some(installed) = self.endpoint_installed_map.get_mut(&svc_port_name) {
                    installed.remove(&id);
                    if installed.is_empty() {
                        self.endpoint_installed_map.remove(&svc_port_name);
                    }
                }
            }
        }
    }

    /// Tears down services that are installed but no longer desired. Any
    /// uninstall failure leaves the service's bookkeeping in place so the
    /// whole teardown is retried on the next cycle.
    async fn remove_stale_services(&mut self) {
        let stale: Vec<_> = self
            .service_installed_map
            .iter()
            .filter(|(name, _)| !self.service_map.contains_key(*name))
            .map(|(name, info)| (name.clone(), info.clone()))
            .collect();
        'services: for (svc_port_name, svc_info) in stale {
            if let Err(error) = self
                .of_client
                .uninstall_service_flows(svc_info.cluster_ip, svc_info.port, svc_info.protocol)
                .await
            {
                error!(service = %svc_port_name, %error, "failed to remove service flows");
                continue;
            }
            for &ingress in &svc_info.load_balancer_ips {
                if let Err(error) = self
                    .of_client
                    .uninstall_service_flows(ingress, svc_info.port, svc_info.protocol)
                    .await
                {
                    error!(service = %svc_port_name, %ingress, %error, "failed to remove load balancer service flows");
                    continue 'services;
                }
            }
            if let Some(endpoints) = self.endpoints_map.get(&svc_port_name) {
                for endpoint in endpoints.values() {
                    if let Err(error) = self
                        .of_client
                        .uninstall_endpoint_flows(svc_info.protocol, endpoint)
                        .await
                    {
                        error!(service = %svc_port_name, endpoint = %endpoint, %error, "failed to remove endpoint flows");
                        continue 'services;
                    }
                }
            }
            let group_id = self.group_counter.get(&svc_port_name);
            if let Err(error) = self.of_client.uninstall_service_group(group_id).await {
                error!(service = %svc_port_name, group = %group_id, %error, "failed to remove service group");
                continue;
            }
            self.service_installed_map.remove(&svc_port_name);
            self.delete_service_by_ip(&svc_info.service_string());
            self.group_counter.recycle(&svc_port_name);
        }
    }

    async fn install_services(&mut self) {
        let services: Vec<_> = self
            .service_map
            .iter()
            .map(|(name, info)| (name.clone(), info.clone()))
            .collect();
        for (svc_port_name, svc_info) in services {
            let Some(endpoints) = self.endpoints_map.get(&svc_port_name) else {
                continue;
            };
            if endpoints.is_empty() {
                continue;
            }
            let group_id = self.group_counter.get(&svc_port_name);

            let service_changed = self
                .service_installed_map
                .get(&svc_port_name)
                .map_or(true, |installed| installed != &svc_info);
            let installed = self
                .endpoint_installed_map
                .entry(svc_port_name.clone())
                .or_default();

            let mut need_update = service_changed;
            let mut endpoint_update_list = Vec::with_capacity(endpoints.len());
            for (id, endpoint) in endpoints {
                if !installed.contains(id) {
                    need_update = true;
                    installed.insert(id.clone());
                }
                endpoint_update_list.push(endpoint.clone());
            }
            if !need_update {
                continue;
            }

            if let Err(error) = self
                .of_client
                .install_endpoint_flows(svc_info.protocol, &endpoint_update_list)
                .await
            {
                error!(service = %svc_port_name, %error, "failed to install endpoint flows");
                // Nothing is acknowledged; retry the whole set next cycle.
                self.endpoint_installed_map.remove(&svc_port_name);
                continue;
            }
            let with_affinity = svc_info.sticky_max_age_seconds != 0;
            if let Err(error) = self
                .of_client
                .install_service_group(group_id, with_affinity, &endpoint_update_list)
                .await
            {
                error!(service = %svc_port_name, group = %group_id, %error, "failed to install service group");
                // Force a full endpoint re-install on the next cycle.
                self.endpoint_installed_map.remove(&svc_port_name);
                continue;
            }
            if !service_changed {
                continue;
            }
            if let Err(error) = self
                .of_client
                .install_service_flows(
                    group_id,
                    svc_info.cluster_ip,
                    svc_info.port,
                    svc_info.protocol,
                    svc_info.sticky_max_age_seconds,
                )
                .await
            {
                // Endpoints stay recorded; only the service flows retry
                // next cycle.
                error!(service = %svc_port_name, %error, "failed to install service flows");
                continue;
            }
            for &ingress in &svc_info.load_balancer_ips {
                if let Err(error) = self
                    .of_client
                    .install_load_balancer_service_flows(
                        group_id,
                        ingress,
                        svc_info.port,
                        svc_info.protocol,
                        svc_info.sticky_max_age_seconds,
                    )
                    .await
                {
                    error!(service = %svc_port_name, %ingress, %error, "failed to install load balancer service flows");
                    continue;
                }
            }
            self.add_service_by_ip(svc_info.service_string(), svc_port_name.clone());
            self.service_installed_map.insert(svc_port_name, svc_info);
        }
    }

    fn add_service_by_ip(&self, service_string: String, svc_port_name: ServicePortName) {
        self.service_string_map
            .lock()
            .insert(service_string, svc_port_name);
    }

    fn delete_service_by_ip(&self, service_string: &str) {
        self.service_string_map.lock().remove(service_string);
    }
}

#[async_trait::async_trait]
impl<C: OpenFlowClient> Syncer for Proxier<C> {
    async fn sync(&mut self) {
        self.sync_proxy_rules().await;
    }
}

/// Shared entry points: the event-source notification surface and the
/// reverse-index query API. Cloneable across informer and query tasks.
#[derive(Clone)]
pub struct ProxyHandle {
    service_changes: Arc<ServiceChangesTracker>,
    endpoints_changes: Arc<EndpointsChangesTracker>,
    service_string_map: Arc<Mutex<HashMap<String, ServicePortName>>>,
    runner: RunnerHandle,
}

impl ProxyHandle {
    pub fn on_service_add(&self, service: &Service) {
        self.on_service_update(None, Some(service));
    }

    pub fn on_service_update(&self, old: Option<&Service>, new: Option<&Service>) {
        if self.service_changes.on_update(old, new) && self.is_initialized() {
            self.runner.run();
        }
    }

    pub fn on_service_delete(&self, service: &Service) {
        self.on_service_update(Some(service), None);
    }

    pub fn on_services_synced(&self) {
        self.service_changes.on_synced();
        if self.is_initialized() {
            self.runner.run();
        }
    }

    pub fn on_endpoints_add(&self, endpoints: &Endpoints) {
        self.on_endpoints_update(None, Some(endpoints));
    }

    pub fn on_endpoints_update(&self, old: Option<&Endpoints>, new: Option<&Endpoints>) {
        if self.endpoints_changes.on_update(old, new) && self.is_initialized() {
            self.runner.run();
        }
    }

    pub fn on_endpoints_delete(&self, endpoints: &Endpoints) {
        self.on_endpoints_update(Some(endpoints), None);
    }

    pub fn on_endpoints_synced(&self) {
        self.endpoints_changes.on_synced();
        if self.is_initialized() {
            self.runner.run();
        }
    }

    /// Resolves a programmed `ClusterIP:Port/Proto` string back to its
    /// Service port. Only services whose flows were acknowledged by the
    /// switch are resolvable.
    pub fn get_service_by_ip(&self, service_string: &str) -> Option<ServicePortName> {
        self.service_string_map.lock().get(service_string).cloned()
    }

    fn is_initialized(&self) -> bool {
        self.service_changes.synced() && self.endpoints_changes.synced()
    }
}
