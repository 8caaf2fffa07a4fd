//! Bluetooth adapter.

use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::{Arc, Mutex},
};

use crate::{device::Device, session::SessionInner, Address};

/// A local Bluetooth controller with its connected devices.
pub struct Adapter {
    env: Arc<SessionInner>,
    dev_id: u16,
    name: String,
    devices: Mutex<HashMap<Address, Arc<Device>>>,
}

impl Debug for Adapter {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Adapter {{ name: {} }}", self.name())
    }
}

impl Adapter {
    pub(crate) fn new(env: Arc<SessionInner>, dev_id: u16) -> Arc<Self> {
        Arc::new(Self { env, dev_id, name: format!("hci{dev_id}"), devices: Mutex::new(HashMap::new()) })
    }

    /// The Bluetooth adapter name.
    ///
    /// For example `hci0`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The controller id of this adapter.
    pub fn dev_id(&self) -> u16 {
        self.dev_id
    }

    /// Device with the specified address, created if not known yet.
    pub fn device(&self, addr: Address) -> Arc<Device> {
        let mut devices = self.devices.lock().unwrap();
        devices
            .entry(addr)
            .or_insert_with(|| {
                log::debug!("Adding device {} to {}", addr, self.name);
                Device::new(self.env.clone(), self.dev_id, addr)
            })
            .clone()
    }

    /// All known devices of this adapter.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().unwrap().values().cloned().collect()
    }
}
