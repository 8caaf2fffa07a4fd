//! Bluetooth device.

use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::{Arc, Mutex},
};

use crate::{session::SessionInner, transport::Transport, Address};

/// Vendor extension information negotiated over the RFCOMM channel
/// (`AT+XAPL`).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct XaplInfo {
    /// Accessory vendor id.
    pub vendor_id: u16,
    /// Accessory product id.
    pub product_id: u16,
    /// Accessory software version.
    pub version: u16,
    /// Supported feature bitmask.
    pub features: u8,
}

/// A remote Bluetooth device with its media and voice transports.
///
/// Devices outlive their transports; they are dropped together with the
/// adapter that owns them.
pub struct Device {
    env: Arc<SessionInner>,
    adapter_id: u16,
    addr: Address,
    name: Mutex<String>,
    transports: Mutex<HashMap<String, Arc<Transport>>>,
    battery: Mutex<Option<u8>>,
    xapl: Mutex<Option<XaplInfo>>,
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Device {{ addr: {} }}", self.addr)
    }
}

impl Device {
    pub(crate) fn new(env: Arc<SessionInner>, adapter_id: u16, addr: Address) -> Arc<Self> {
        Arc::new(Self {
            env,
            adapter_id,
            addr,
            name: Mutex::new(addr.to_string()),
            transports: Mutex::new(HashMap::new()),
            battery: Mutex::new(None),
            xapl: Mutex::new(None),
        })
    }

    pub(crate) fn env(&self) -> &Arc<SessionInner> {
        &self.env
    }

    /// Address of the remote device.
    pub fn addr(&self) -> Address {
        self.addr
    }

    /// Id of the controller this device is connected through.
    pub fn adapter_id(&self) -> u16 {
        self.adapter_id
    }

    /// Friendly name of the remote device.
    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    /// Sets the friendly name of the remote device.
    pub fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_string();
    }

    /// Looks up a transport by the path the Bluetooth daemon assigned to it.
    pub fn transport(&self, path: &str) -> Option<Arc<Transport>> {
        self.transports.lock().unwrap().get(path).cloned()
    }

    /// All transports of this device.
    pub fn transports(&self) -> Vec<Arc<Transport>> {
        self.transports.lock().unwrap().values().cloned().collect()
    }

    /// Battery level of the remote device in percent, if it reported one.
    pub fn battery(&self) -> Option<u8> {
        *self.battery.lock().unwrap()
    }

    /// Vendor extension information of the remote device, if it reported any.
    pub fn xapl(&self) -> Option<XaplInfo> {
        *self.xapl.lock().unwrap()
    }

    pub(crate) fn set_battery(&self, level: u8) {
        log::debug!("Battery level of {}: {}%", self.addr, level);
        *self.battery.lock().unwrap() = Some(level);
    }

    pub(crate) fn set_xapl(&self, info: XaplInfo) {
        log::debug!("Vendor info of {}: {:04x}:{:04x}", self.addr, info.vendor_id, info.product_id);
        *self.xapl.lock().unwrap() = Some(info);
    }

    /// Forgets everything the RFCOMM command parser learned about the peer.
    pub(crate) fn clear_peer_metadata(&self) {
        *self.battery.lock().unwrap() = None;
        *self.xapl.lock().unwrap() = None;
    }

    pub(crate) fn insert_transport(&self, path: &str, transport: Arc<Transport>) {
        self.transports.lock().unwrap().insert(path.to_string(), transport);
    }

    pub(crate) fn remove_transport(&self, path: &str) -> Option<Arc<Transport>> {
        self.transports.lock().unwrap().remove(path)
    }
}
