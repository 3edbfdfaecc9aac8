//! Test fixtures for fuota-control integration tests.

use std::sync::Arc;
use std::time::Duration;

use fuota_control::{
    DevEui, DeploymentParams, DeploymentStore, EnrolledDevice, FuotaDeployment, MemoryStore,
    MulticastGroupId,
};
use rstest::fixture;

/// Builder for creating test deployments.
pub struct DeploymentBuilder {
    params: DeploymentParams,
    devices: Vec<EnrolledDevice>,
}

impl DeploymentBuilder {
    /// Creates a deployment linked to a fresh multicast group.
    pub fn new(name: &str) -> Self {
        Self {
            params: DeploymentParams {
                name: name.to_owned(),
                multicast_group_id: Some(MulticastGroupId::new(uuid::Uuid::new_v4())),
                fragmentation_matrix: 3,
                descriptor: [1, 2, 3, 4],
                payload: vec![5, 6, 7, 8],
                frag_size: 10,
                redundancy: 20,
                block_ack_delay: 6,
                multicast_timeout: 3,
                unicast_timeout: Duration::from_secs(60),
            },
            devices: Vec::new(),
        }
    }

    /// Removes the multicast group link.
    pub fn without_group(mut self) -> Self {
        self.params.multicast_group_id = None;
        self
    }

    /// Sets the per-device unicast answer timeout.
    pub fn with_unicast_timeout(mut self, timeout: Duration) -> Self {
        self.params.unicast_timeout = timeout;
        self
    }

    /// Enrolls a device.
    pub fn with_device(mut self, dev_eui: DevEui, name: &str) -> Self {
        self.devices.push(EnrolledDevice::new(dev_eui, name));
        self
    }

    /// Enrolls `n` devices named `device-1` to `device-n`.
    pub fn with_devices(mut self, n: u8) -> Self {
        for i in 1..=n {
            self.devices
                .push(EnrolledDevice::new(eui(i), format!("device-{i}")));
        }
        self
    }

    /// Builds the deployment without storing it.
    pub fn build(self) -> (FuotaDeployment, Vec<EnrolledDevice>) {
        (FuotaDeployment::new(self.params), self.devices)
    }

    /// Stores the deployment and returns it.
    pub async fn create(self, store: &dyn DeploymentStore) -> FuotaDeployment {
        let (deployment, devices) = self.build();
        store
            .create(&deployment, &devices)
            .await
            .expect("create failed");
        deployment
    }
}

/// A device EUI ending in `n`.
pub fn eui(n: u8) -> DevEui {
    DevEui::new([0, 0, 0, 0, 0, 0, 0, n])
}

#[fixture]
pub fn store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}
