use crate::config::NvmeConfig;
use crate::controller::NvmeController;
use crate::error::InitError;
use crate::irq::{ControllerHandle, IrqRouter};
use crate::namespace::NvmeNamespace;
use crate::platform::{ControllerResources, Platform};
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_storage::{DeviceHandle, DeviceRegistry, StorageDevice};
use log::{error, info};

/// A controller brought up by [`probe`].
#[derive(Debug)]
pub struct ProbedController {
    pub controller: Arc<NvmeController>,
    pub route: ControllerHandle,
    /// Registered namespaces, named `nvme<controller>n<nsid>`.
    pub devices: Vec<(DeviceHandle, Arc<NvmeNamespace>)>,
}

/// Brings up one controller and publishes its namespaces.
///
/// The controller is routed before bring-up starts, because bring-up waits
/// for admin completions delivered by interrupt.
///
/// # Errors
/// Any bring-up or namespace detection failure. The interrupt route is
/// removed again and no device is registered.
pub fn probe(
    platform: Arc<dyn Platform>,
    resources: ControllerResources,
    config: NvmeConfig,
    router: &IrqRouter,
    registry: &DeviceRegistry,
) -> Result<ProbedController, InitError> {
    let controller = Arc::new(NvmeController::new(platform, resources, config)?);
    let route = router.register(Arc::clone(&controller));

    let namespaces = match controller.init().and_then(|()| controller.detect_namespaces()) {
        Ok(namespaces) => namespaces,
        Err(err) => {
            error!("NVMe controller {} failed to come up: {err}", route.index());
            router.unregister(route);
            return Err(err);
        }
    };

    let devices: Vec<_> = namespaces
        .into_iter()
        .map(|namespace| {
            let name = format!("nvme{}n{}", route.index(), namespace.nsid());
            let device: Arc<dyn StorageDevice> = namespace.clone();
            (registry.register(name, device), namespace)
        })
        .collect();
    info!(
        "NVMe controller {} up with {} namespaces",
        route.index(),
        devices.len()
    );

    Ok(ProbedController {
        controller,
        route,
        devices,
    })
}
