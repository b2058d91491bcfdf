use std::sync::Arc;

use ota_events::Bus;
use ota_kernel::Kernel;

use crate::{dispatcher::UpdateDispatcher, registry::ConnectionRegistry};

/// Shared service state handed to every handler and background task.
/// Cloning is cheap; the fields are handles.
#[derive(Clone)]
pub struct AppState {
    bus: Bus,
    kernel: Kernel,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<UpdateDispatcher>,
}

impl AppState {
    pub fn new(bus: Bus, kernel: Kernel) -> Self {
        let registry = ConnectionRegistry::new();
        let dispatcher =
            UpdateDispatcher::new(kernel.clone(), bus.clone(), registry.clone());
        Self {
            bus,
            kernel,
            registry,
            dispatcher,
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<UpdateDispatcher> {
        &self.dispatcher
    }
}
