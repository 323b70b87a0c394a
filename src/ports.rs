use std::collections::HashMap;
use tracing::debug;

use crate::driver::ContainerDriver;
use crate::error::Result;
use crate::models::LabConfig;

/// Maps a lab request onto external port bindings. The allocator keeps no
/// state of its own: availability comes from the driver's bind-time probe,
/// and each IDE service probes inside its own window so services never
/// contend for the same range. Must never be called while holding the
/// registry lock.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    range_start: u16,
}

impl PortAllocator {
    pub fn new(range_start: u16) -> Self {
        Self { range_start }
    }

    /// Allocate one external port per required IDE service and return the
    /// engine-style binding map, e.g. `"8080/tcp" -> 31000`. A full service
    /// window surfaces as ResourceExhausted from the driver.
    pub async fn allocate(
        &self,
        driver: &dyn ContainerDriver,
        config: &LabConfig,
    ) -> Result<HashMap<String, u16>> {
        let mut bindings = HashMap::new();
        for ide in config.required_services() {
            // Saturate: a range_start near u16::MAX just sees an empty
            // window and exhausts instead of wrapping into low ports
            let base = self.range_start.saturating_add(ide.port_offset());
            let port = driver.find_available_port(base).await?;
            debug!(
                "allocated port {} for {} (base {})",
                port,
                ide.as_str(),
                base
            );
            bindings.insert(ide.port_spec(), port);
        }
        Ok(bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::error::LabError;
    use crate::models::IdeType;

    #[tokio::test]
    async fn single_ide_gets_one_binding_in_its_window() {
        let driver = MockDriver::new();
        let allocator = PortAllocator::new(30000);
        let config = LabConfig {
            ide_type: IdeType::Jupyter,
            ..Default::default()
        };

        let bindings = allocator.allocate(&driver, &config).await.unwrap();
        assert_eq!(bindings.len(), 1);
        let port = bindings["8888/tcp"];
        assert!((30100..30200).contains(&port), "port {} outside jupyter window", port);
    }

    #[tokio::test]
    async fn multi_ide_gets_four_distinct_bindings() {
        let driver = MockDriver::new();
        let allocator = PortAllocator::new(30000);
        let config = LabConfig {
            enable_multi_ide: true,
            ..Default::default()
        };

        let bindings = allocator.allocate(&driver, &config).await.unwrap();
        assert_eq!(bindings.len(), 4);
        for ide in IdeType::ALL {
            assert!(bindings.contains_key(&ide.port_spec()));
        }

        let mut ports: Vec<u16> = bindings.values().copied().collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 4, "bindings reused a port: {:?}", bindings);
    }

    #[tokio::test]
    async fn repeated_allocations_never_collide() {
        let driver = MockDriver::new();
        let allocator = PortAllocator::new(30000);
        let config = LabConfig::default();

        let mut seen = Vec::new();
        for _ in 0..10 {
            let bindings = allocator.allocate(&driver, &config).await.unwrap();
            seen.push(bindings["8080/tcp"]);
        }
        let mut deduped = seen.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), seen.len());
    }

    #[tokio::test]
    async fn exhausted_window_reports_resource_exhausted() {
        let driver = MockDriver::new();
        driver.occupy_ports(30000..30100);
        let allocator = PortAllocator::new(30000);

        let err = allocator
            .allocate(&driver, &LabConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn range_start_near_the_top_of_the_port_space_does_not_overflow() {
        let driver = MockDriver::new();
        // Terminal's window would start past u16::MAX; the clamped window
        // is empty, so this exhausts rather than wrapping or panicking
        let allocator = PortAllocator::new(65_400);
        let config = LabConfig {
            ide_type: IdeType::Terminal,
            ..Default::default()
        };

        let err = allocator.allocate(&driver, &config).await.unwrap_err();
        assert!(matches!(err, LabError::ResourceExhausted(_)));
    }
}
