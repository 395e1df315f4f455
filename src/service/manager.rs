use crate::common::{Result, RidgelineError};
use crate::service::device::DeviceHandle;

/// Registry of the devices this daemon fronts. Registration order decides
/// the default.
#[derive(Default)]
pub struct Manager {
    devices: Vec<(String, DeviceHandle)>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_device(&mut self, name: &str, handle: DeviceHandle) {
        tracing::info!(name, "device registered");
        self.devices.push((name.to_string(), handle));
    }

    pub fn get_devices(&self) -> Vec<&str> {
        self.devices.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn get_device(&self, name: &str) -> Result<&DeviceHandle> {
        self.devices
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, handle)| handle)
            .ok_or(RidgelineError::NoSuchDevice)
    }

    pub fn get_default_device(&self) -> Result<&DeviceHandle> {
        self.devices
            .first()
            .map(|(_, handle)| handle)
            .ok_or(RidgelineError::NoSuchDevice)
    }

    pub fn suspend_all(&self) -> Result<()> {
        for (name, handle) in &self.devices {
            tracing::debug!(%name, "suspending");
            handle.suspend()?;
        }
        Ok(())
    }

    pub fn resume_all(&self) -> Result<()> {
        for (name, handle) in &self.devices {
            tracing::debug!(%name, "resuming");
            handle.resume()?;
        }
        Ok(())
    }
}
