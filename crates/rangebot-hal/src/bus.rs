//! I2C bus abstraction and the per-bus mutual-exclusion point.
//!
//! A physical controller implements [`I2cBus`].  It is wrapped exactly once
//! in a [`SharedBus`], which owns the single lock every device on that bus
//! goes through, so byte sequences from different devices never interleave.
//! Devices are opened by `(bus name, slave address)` through a
//! [`BusProvider`]; the returned [`I2cDevice`] handle releases its address
//! when dropped.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use rangebot_types::SensorError;
use thiserror::Error;
use tracing::{debug, trace};

/// Failures reported by the bus layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("no acknowledgment from device at address 0x{address:02x}")]
    Nack { address: u16 },

    #[error("device at address 0x{address:02x} is busy")]
    Busy { address: u16 },

    #[error("bus '{0}' is not registered")]
    UnknownBus(String),

    #[error("address 0x{address:02x} on bus '{bus}' is already open")]
    AddressInUse { bus: String, address: u16 },

    #[error("bus I/O error: {0}")]
    Io(String),
}

/// A physical (or simulated) I2C controller.
///
/// Implementations perform one complete transaction per call; callers that
/// need several transactions back-to-back use [`SharedBus::transaction`].
pub trait I2cBus: Send {
    /// Write `bytes` to the device at `address`.
    fn write(&mut self, address: u16, bytes: &[u8]) -> Result<(), BusError>;

    /// Fill `buffer` from the device at `address`.
    fn read(&mut self, address: u16, buffer: &mut [u8]) -> Result<(), BusError>;

    /// Write `bytes` then read into `buffer` with a repeated start.
    fn write_read(&mut self, address: u16, bytes: &[u8], buffer: &mut [u8])
    -> Result<(), BusError>;
}

/// One physical bus shared by every device attached to it.
///
/// Clone it cheaply – all clones share the same lock and controller.
#[derive(Clone)]
pub struct SharedBus {
    name: Arc<str>,
    controller: Arc<Mutex<Box<dyn I2cBus>>>,
    open_addresses: Arc<Mutex<HashSet<u16>>>,
}

impl fmt::Debug for SharedBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBus").field("name", &self.name).finish()
    }
}

impl SharedBus {
    /// Wrap `controller` as the bus called `name` (e.g. `"I2C1"`).
    pub fn new(name: impl Into<String>, controller: impl I2cBus + 'static) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            controller: Arc::new(Mutex::new(Box::new(controller))),
            open_addresses: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Bus name, as used by [`BusProvider::open`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` with exclusive access to the controller.
    ///
    /// The lock is held for the whole closure, so a multi-step sequence
    /// cannot be interleaved with another device's traffic.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut dyn I2cBus) -> Result<T, BusError>,
    ) -> Result<T, BusError> {
        let mut controller = self
            .controller
            .lock()
            .map_err(|_| BusError::Io(format!("bus '{}' lock poisoned", self.name)))?;
        f(controller.as_mut())
    }

    /// Open a handle to the device at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::AddressInUse`] while another handle to the same
    /// address is alive.
    pub fn open(&self, address: u16) -> Result<I2cDevice, BusError> {
        let mut open = self
            .open_addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !open.insert(address) {
            return Err(BusError::AddressInUse {
                bus: self.name.to_string(),
                address,
            });
        }
        debug!(bus = %self.name, address = %format!("0x{address:02x}"), "device opened");
        Ok(I2cDevice {
            label: format!("{}/0x{:02x}", self.name, address),
            bus: self.clone(),
            address,
        })
    }

    /// `true` while a handle to `address` is open.
    pub fn is_open(&self, address: u16) -> bool {
        self.open_addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&address)
    }

    fn release(&self, address: u16) {
        self.open_addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address);
        debug!(bus = %self.name, address = %format!("0x{address:02x}"), "device released");
    }
}

/// Registry of named buses; the handle provider drivers are built from.
#[derive(Default, Debug)]
pub struct BusProvider {
    buses: HashMap<String, SharedBus>,
}

impl BusProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bus.  A previously registered bus with the same name is
    /// replaced.
    pub fn register(&mut self, bus: SharedBus) {
        self.buses.insert(bus.name().to_string(), bus);
    }

    /// Look up a registered bus by name.
    pub fn bus(&self, name: &str) -> Option<&SharedBus> {
        self.buses.get(name)
    }

    /// Open the device at `(bus_name, address)`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownBus`] when no bus is registered under
    /// `bus_name`, or [`BusError::AddressInUse`] when the device is already open.
    pub fn open(&self, bus_name: &str, address: u16) -> Result<I2cDevice, BusError> {
        self.buses
            .get(bus_name)
            .ok_or_else(|| BusError::UnknownBus(bus_name.to_string()))?
            .open(address)
    }
}

/// Handle to one slave device on a [`SharedBus`].
///
/// Every call locks the bus for the duration of one transaction.  Failures
/// are reported as [`SensorError::Bus`] tagged with the handle's label.
pub struct I2cDevice {
    bus: SharedBus,
    address: u16,
    label: String,
}

impl fmt::Debug for I2cDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("I2cDevice").field("label", &self.label).finish()
    }
}

impl I2cDevice {
    /// 7-bit slave address.
    pub fn address(&self) -> u16 {
        self.address
    }

    /// `"<bus>/0x<address>"`.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn write(&self, bytes: &[u8]) -> Result<(), SensorError> {
        trace!(device = %self.label, ?bytes, "write");
        self.bus
            .transaction(|bus| bus.write(self.address, bytes))
            .map_err(|e| self.bus_error(e))
    }

    pub fn read(&self, buffer: &mut [u8]) -> Result<(), SensorError> {
        self.bus
            .transaction(|bus| bus.read(self.address, buffer))
            .map_err(|e| self.bus_error(e))?;
        trace!(device = %self.label, bytes = ?buffer, "read");
        Ok(())
    }

    pub fn write_read(&self, bytes: &[u8], buffer: &mut [u8]) -> Result<(), SensorError> {
        self.bus
            .transaction(|bus| bus.write_read(self.address, bytes, buffer))
            .map_err(|e| self.bus_error(e))?;
        trace!(device = %self.label, ?bytes, read = ?buffer, "write_read");
        Ok(())
    }

    /// Run several transactions against this device while holding the bus.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut dyn I2cBus, u16) -> Result<T, BusError>,
    ) -> Result<T, SensorError> {
        self.bus
            .transaction(|bus| f(bus, self.address))
            .map_err(|e| self.bus_error(e))
    }

    /// Read one 8-bit register.
    pub fn read_register(&self, register: u8) -> Result<u8, SensorError> {
        let mut buffer = [0u8; 1];
        self.write_read(&[register], &mut buffer)?;
        Ok(buffer[0])
    }

    /// Write one 8-bit register.
    pub fn write_register(&self, register: u8, value: u8) -> Result<(), SensorError> {
        self.write(&[register, value])
    }

    /// Read a 16-bit big-endian register pair starting at `register`.
    pub fn read_register_pair(&self, register: u8) -> Result<u16, SensorError> {
        let mut buffer = [0u8; 2];
        self.write_read(&[register], &mut buffer)?;
        Ok(u16::from_be_bytes(buffer))
    }

    fn bus_error(&self, error: BusError) -> SensorError {
        SensorError::bus(self.label.clone(), error)
    }
}

impl Drop for I2cDevice {
    fn drop(&mut self) {
        self.bus.release(self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBus, SimRegisterDevice};
    use rangebot_types::ErrorKind;

    fn bus_with_device(address: u16) -> SharedBus {
        let mut sim = SimBus::new();
        sim.attach(address, SimRegisterDevice::new());
        SharedBus::new("I2C1", sim)
    }

    #[test]
    fn open_twice_is_rejected_until_released() {
        let bus = bus_with_device(0x13);
        let first = bus.open(0x13).unwrap();
        assert!(matches!(
            bus.open(0x13),
            Err(BusError::AddressInUse { address: 0x13, .. })
        ));
        drop(first);
        assert!(!bus.is_open(0x13));
        assert!(bus.open(0x13).is_ok());
    }

    #[test]
    fn provider_rejects_unknown_bus() {
        let mut provider = BusProvider::new();
        provider.register(bus_with_device(0x48));
        assert!(provider.open("I2C1", 0x48).is_ok());
        assert!(matches!(
            provider.open("I2C9", 0x48),
            Err(BusError::UnknownBus(name)) if name == "I2C9"
        ));
    }

    #[test]
    fn register_helpers_use_pointer_then_data() {
        let bus = bus_with_device(0x40);
        let device = bus.open(0x40).unwrap();
        device.write_register(0x10, 0xAB).unwrap();
        device.write_register(0x11, 0xCD).unwrap();
        assert_eq!(device.read_register(0x10).unwrap(), 0xAB);
        assert_eq!(device.read_register_pair(0x10).unwrap(), 0xABCD);
    }

    #[test]
    fn missing_device_maps_to_bus_error() {
        let bus = SharedBus::new("I2C1", SimBus::new());
        let device = bus.open(0x70).unwrap();
        let err = device.write(&[0x00, 0x51]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bus);
        assert!(err.to_string().contains("I2C1/0x70"));
    }
}
