//! Coordination store layout.
//!
//! ```text
//! /services/{service_id}                    Service record
//! /services/{service_id}/{instance_id}      Service-Instance record
//! /hosts/{host_id}/{instance_id}            Host-Instance record
//! /registry/hosts/{host_id}                 Host registration (ephemeral)
//! /locks/instances/{instance_id}            Instance lock directory
//! ```

use shepherd_coord::path::join;
use shepherd_id::{HostId, InstanceId, ServiceId};

/// Parent of all Service records.
pub const SERVICES: &str = "/services";

/// Parent of all per-host Host-Instance directories.
pub const HOSTS: &str = "/hosts";

/// Parent of host registrations.
pub const HOST_REGISTRY: &str = "/registry/hosts";

/// Parent of instance lock directories.
pub const INSTANCE_LOCKS: &str = "/locks/instances";

pub fn service(service_id: &ServiceId) -> String {
    join(SERVICES, [service_id.as_str()])
}

pub fn service_instance(service_id: &ServiceId, instance_id: &InstanceId) -> String {
    join(SERVICES, [service_id.to_string(), instance_id.to_string()])
}

pub fn host(host_id: &HostId) -> String {
    join(HOSTS, [host_id.as_str()])
}

pub fn host_instance(host_id: &HostId, instance_id: &InstanceId) -> String {
    join(HOSTS, [host_id.to_string(), instance_id.to_string()])
}

pub fn registered_host(host_id: &HostId) -> String {
    join(HOST_REGISTRY, [host_id.as_str()])
}

pub fn instance_lock(instance_id: &InstanceId) -> String {
    join(INSTANCE_LOCKS, [instance_id.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let svc = ServiceId::parse("web").unwrap();
        let host_id = HostId::parse("host-1").unwrap();
        let inst: InstanceId = "inst_01HV4Z4NYPMTRS0JTWA8XDME5F".parse().unwrap();

        assert_eq!(service(&svc), "/services/web");
        assert_eq!(
            service_instance(&svc, &inst),
            "/services/web/inst_01HV4Z4NYPMTRS0JTWA8XDME5F"
        );
        assert_eq!(host(&host_id), "/hosts/host-1");
        assert_eq!(
            host_instance(&host_id, &inst),
            "/hosts/host-1/inst_01HV4Z4NYPMTRS0JTWA8XDME5F"
        );
        assert_eq!(registered_host(&host_id), "/registry/hosts/host-1");
        assert_eq!(
            instance_lock(&inst),
            "/locks/instances/inst_01HV4Z4NYPMTRS0JTWA8XDME5F"
        );
    }
}
