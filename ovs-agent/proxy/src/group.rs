use ahash::AHashMap as HashMap;
use ovs_agent_core::{GroupId, ServicePortName};
use tracing::warn;

/// Allocates the stable switch group id each Service port balances through.
/// Ids are handed out lazily on first use and returned to a free pool when
/// the Service port's flows are torn down.
#[derive(Debug, Default)]
pub struct GroupCounter {
    last: u32,
    groups: HashMap<ServicePortName, GroupId>,
    recycled: Vec<GroupId>,
}

impl GroupCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The group id for this Service port, allocating one on first use.
    /// Repeated calls return the same id until it is recycled.
    pub fn get(&mut self, svc_port_name: &ServicePortName) -> GroupId {
        if let Some(&id) = self.groups.get(svc_port_name) {
            return id;
        }
        let id = self.recycled.pop().unwrap_or_else(|| {
            self.last += 1;
            GroupId(self.last)
        });
        self.groups.insert(svc_port_name.clone(), id);
        id
    }

    /// Returns the Service port's id to the free pool. Recycling a port
    /// that holds no id is a bookkeeping error; it is logged and ignored.
    pub fn recycle(&mut self, svc_port_name: &ServicePortName) -> bool {
        match self.groups.remove(svc_port_name) {
            Some(id) => {
                self.recycled.push(id);
                true
            }
            None => {
                warn!(service = %svc_port_name, "recycling a group id that was never allocated");
                false
            }
        }
    }
}
