use ahash::AHashMap as HashMap;
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

/// Transport protocols the switch pipeline understands.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Sctp => "SCTP",
        }
    }

    /// Maps a Kubernetes protocol string onto the switch protocol. The
    /// conversion is total: anything unrecognized programs as TCP.
    pub fn parse(s: &str) -> Self {
        match s {
            "UDP" => Protocol::Udp,
            "SCTP" => Protocol::Sctp,
            _ => Protocol::Tcp,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a switch group programmed to balance across endpoints.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Namespace/name pair identifying an event-source object. Trackers key
/// their pending diffs by this, never by object reference.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The identity of a single Service port: the owning Service plus the
/// port's name and protocol.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServicePortName {
    pub namespace: String,
    pub name: String,
    pub port: String,
    pub protocol: Protocol,
}

impl fmt::Display for ServicePortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)?;
        if !self.port.is_empty() {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

/// Everything the data plane needs to know about one Service port. Equality
/// against the installed copy decides whether flows must be re-programmed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInfo {
    pub cluster_ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    /// Session-affinity window in seconds; zero disables stickiness.
    pub sticky_max_age_seconds: u16,
    pub load_balancer_ips: Vec<IpAddr>,
}

impl ServiceInfo {
    /// Canonical `ClusterIP:Port/Proto` form, the reverse-index key.
    pub fn service_string(&self) -> String {
        format!(
            "{}/{}",
            SocketAddr::new(self.cluster_ip, self.port),
            self.protocol
        )
    }
}

/// A single backend address. Its `Display` form (`ip:port`) is the identity
/// string used for installed-endpoint bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SocketAddr::new(self.ip, self.port).fmt(f)
    }
}

/// A Service object as delivered by the event source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Service {
    pub namespace: String,
    pub name: String,
    /// None for headless Services, which program nothing.
    pub cluster_ip: Option<IpAddr>,
    pub ports: Vec<ServicePort>,
    /// ClientIP session-affinity timeout; None when affinity is off.
    pub affinity_timeout_seconds: Option<u16>,
    pub load_balancer_ips: Vec<IpAddr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
}

/// An Endpoints object as delivered by the event source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub namespace: String,
    pub name: String,
    pub subsets: Vec<EndpointSubset>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointSubset {
    pub addresses: Vec<IpAddr>,
    pub ports: Vec<EndpointPort>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointPort {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
}

/// Expands a Service object into the per-port map the trackers diff.
pub fn service_port_map(service: &Service) -> HashMap<ServicePortName, ServiceInfo> {
    let mut ports = HashMap::new();
    let Some(cluster_ip) = service.cluster_ip else {
        return ports;
    };
    for port in &service.ports {
        let key = ServicePortName {
            namespace: service.namespace.clone(),
            name: service.name.clone(),
            port: port.name.clone(),
            protocol: port.protocol,
        };
        ports.insert(
            key,
            ServiceInfo {
                cluster_ip,
                port: port.port,
                protocol: port.protocol,
                sticky_max_age_seconds: service.affinity_timeout_seconds.unwrap_or(0),
                load_balancer_ips: service.load_balancer_ips.clone(),
            },
        );
    }
    ports
}

/// Expands an Endpoints object into per-port endpoint sets keyed by the
/// endpoints' identity strings.
pub fn endpoints_port_map(
    endpoints: &Endpoints,
) -> HashMap<ServicePortName, HashMap<String, Endpoint>> {
    let mut by_port: HashMap<ServicePortName, HashMap<String, Endpoint>> = HashMap::new();
    for subset in &endpoints.subsets {
        for port in &subset.ports {
            let key = ServicePortName {
                namespace: endpoints.namespace.clone(),
                name: endpoints.name.clone(),
                port: port.name.clone(),
                protocol: port.protocol,
            };
            let entry = by_port.entry(key).or_default();
            for &ip in &subset.addresses {
                let endpoint = Endpoint { ip, port: port.port };
                entry.insert(endpoint.to_string(), endpoint);
            }
        }
    }
    by_port
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn protocol_conversion_is_total() {
        assert_eq!(Protocol::parse("TCP"), Protocol::Tcp);
        assert_eq!(Protocol::parse("UDP"), Protocol::Udp);
        assert_eq!(Protocol::parse("SCTP"), Protocol::Sctp);
        assert_eq!(Protocol::parse("ICMP"), Protocol::Tcp);
        assert_eq!(Protocol::parse(""), Protocol::Tcp);
    }

    #[test]
    fn service_string_is_canonical() {
        let info = ServiceInfo {
            cluster_ip: ip("10.96.0.10"),
            port: 53,
            protocol: Protocol::Udp,
            sticky_max_age_seconds: 0,
            load_balancer_ips: vec![],
        };
        assert_eq!(info.service_string(), "10.96.0.10:53/UDP");
    }

    #[test]
    fn headless_service_expands_to_nothing() {
        let svc = Service {
            namespace: "ns".into(),
            name: "headless".into(),
            cluster_ip: None,
            ports: vec![ServicePort {
                name: "http".into(),
                port: 80,
                protocol: Protocol::Tcp,
            }],
            ..Default::default()
        };
        assert!(service_port_map(&svc).is_empty());
    }

    #[test]
    fn endpoints_expand_per_port_and_address() {
        let eps = Endpoints {
            namespace: "ns".into(),
            name: "svc".into(),
            subsets: vec![EndpointSubset {
                addresses: vec![ip("10.0.0.1"), ip("10.0.0.2")],
                ports: vec![
                    EndpointPort {
                        name: "http".into(),
                        port: 8080,
                        protocol: Protocol::Tcp,
                    },
                    EndpointPort {
                        name: "dns".into(),
                        port: 5353,
                        protocol: Protocol::Udp,
                    },
                ],
            }],
        };
        let map = endpoints_port_map(&eps);
        assert_eq!(map.len(), 2);
        let http = ServicePortName {
            namespace: "ns".into(),
            name: "svc".into(),
            port: "http".into(),
            protocol: Protocol::Tcp,
        };
        let by_id = &map[&http];
        assert_eq!(by_id.len(), 2);
        assert_eq!(by_id["10.0.0.1:8080"], Endpoint { ip: ip("10.0.0.1"), port: 8080 });
    }
}
