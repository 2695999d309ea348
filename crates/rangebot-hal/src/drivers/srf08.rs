//! Ultrasonic range finder (SRF08-class).
//!
//! Ranging is started by writing `0x51` (result in cm) to the command
//! register and takes up to ~65 ms, during which the device ignores the bus.
//! The first echo is then read from registers 0x02/0x03, big-endian.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rangebot_types::{EventPayload, ProximityReading, SensorError};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::bus::{BusError, I2cDevice};
use crate::device::PolledDevice;

pub const DEFAULT_ADDRESS: u16 = 0x70;

/// Write: command.  Read: software revision.
pub const REG_COMMAND: u8 = 0x00;
/// Write: max analogue gain.  Read: light sensor.
pub const REG_GAIN: u8 = 0x01;
/// Write: range register.  Read: first echo high byte.
pub const REG_RANGE: u8 = 0x02;

pub const CMD_RANGE_CM: u8 = 0x51;

/// Highest analogue gain setting.
pub const MAX_GAIN: u8 = 31;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Srf08Config {
    /// Wait between the ranging command and the result read.
    pub ranging_delay_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for Srf08Config {
    fn default() -> Self {
        Self {
            ranging_delay_ms: 70,
            poll_interval_ms: 100,
        }
    }
}

pub struct Srf08 {
    id: String,
    device: I2cDevice,
    config: Srf08Config,
    ranging: AtomicBool,
}

/// Clears the outstanding-ranging flag when the ranging attempt ends.
struct Outstanding<'a>(&'a AtomicBool);

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Srf08 {
    pub fn new(device: I2cDevice, config: Srf08Config) -> Self {
        Self {
            id: super::device_id("srf08", device.address()),
            device,
            config,
            ranging: AtomicBool::new(false),
        }
    }

    /// One complete ranging: trigger, wait, read the first echo in cm.
    ///
    /// # Errors
    ///
    /// [`SensorError::Bus`] (busy) when a ranging on this device is still
    /// outstanding; nothing is written in that case.
    pub fn read_range(&self) -> Result<ProximityReading, SensorError> {
        if self
            .ranging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SensorError::bus(
                self.device.label(),
                BusError::Busy {
                    address: self.device.address(),
                },
            ));
        }
        let _outstanding = Outstanding(&self.ranging);

        self.device.write(&[REG_COMMAND, CMD_RANGE_CM])?;
        std::thread::sleep(Duration::from_millis(self.config.ranging_delay_ms));

        let range_cm = self.device.transaction(|bus, address| {
            let mut buffer = [0u8; 2];
            bus.write(address, &[REG_RANGE])?;
            bus.read(address, &mut buffer)?;
            Ok(u16::from_be_bytes(buffer))
        })?;

        trace!(device = %self.id, range_cm, "ranging complete");
        Ok(ProximityReading {
            raw_value: i32::from(range_cm),
        })
    }

    /// `true` while a ranging is in progress.
    pub fn is_ranging(&self) -> bool {
        self.ranging.load(Ordering::Acquire)
    }

    pub fn software_revision(&self) -> Result<u8, SensorError> {
        self.device.read_register(REG_COMMAND)
    }

    /// Light sensor reading taken during the last ranging.
    pub fn light_level(&self) -> Result<u8, SensorError> {
        self.device.read_register(REG_GAIN)
    }

    pub fn set_gain(&self, gain: u8) -> Result<(), SensorError> {
        if gain > MAX_GAIN {
            return Err(SensorError::range("gain", gain, "[0, 31]"));
        }
        self.device.write_register(REG_GAIN, gain)
    }

    /// Maximum range is `(value + 1) * 43 mm`.
    pub fn set_max_range(&self, value: u8) -> Result<(), SensorError> {
        debug!(device = %self.id, max_range_mm = (u32::from(value) + 1) * 43, "max range set");
        self.device.write_register(REG_RANGE, value)
    }
}

impl PolledDevice for Srf08 {
    fn id(&self) -> &str {
        &self.id
    }

    fn poll(&self) -> Result<Vec<EventPayload>, SensorError> {
        let reading = self.read_range()?;
        Ok(vec![EventPayload::ProximityReceived {
            raw_value: reading.raw_value,
            distance: Some(f64::from(reading.raw_value)),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SharedBus;
    use crate::sim::{BusTransaction, SimBus, SimRegisterDevice, SimRegisters, TransactionLog};
    use rangebot_types::ErrorKind;
    use std::sync::Arc;

    fn ranger(range_cm: u16, config: Srf08Config) -> (Srf08, SimRegisters, TransactionLog) {
        let device = SimRegisterDevice::srf08(range_cm);
        let regs = device.registers();
        let mut sim = SimBus::new();
        sim.attach(DEFAULT_ADDRESS, device);
        let log = sim.log();
        let bus = SharedBus::new("I2C1", sim);
        (
            Srf08::new(bus.open(DEFAULT_ADDRESS).unwrap(), config),
            regs,
            log,
        )
    }

    fn fast() -> Srf08Config {
        Srf08Config {
            ranging_delay_ms: 0,
            ..Srf08Config::default()
        }
    }

    #[test]
    fn ranging_sequence_is_byte_exact() {
        let (srf08, _, log) = ranger(0x0123, fast());
        let reading = srf08.read_range().unwrap();
        assert_eq!(reading.raw_value, 0x0123);
        assert_eq!(
            log.entries(),
            vec![
                BusTransaction::Write {
                    address: 0x70,
                    bytes: vec![0x00, 0x51],
                },
                BusTransaction::Write {
                    address: 0x70,
                    bytes: vec![0x02],
                },
                BusTransaction::Read {
                    address: 0x70,
                    len: 2,
                },
            ]
        );
        assert!(!srf08.is_ranging());
    }

    #[test]
    fn retrigger_while_outstanding_is_busy() {
        let (srf08, _, log) = ranger(
            150,
            Srf08Config {
                ranging_delay_ms: 200,
                ..Srf08Config::default()
            },
        );
        let srf08 = Arc::new(srf08);
        let first = {
            let srf08 = Arc::clone(&srf08);
            std::thread::spawn(move || srf08.read_range())
        };
        while !srf08.is_ranging() {
            std::thread::yield_now();
        }

        let err = srf08.read_range().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bus);
        assert!(err.to_string().contains("busy"));

        assert_eq!(first.join().unwrap().unwrap().raw_value, 150);
        assert_eq!(log.writes_to(0x70).iter().filter(|w| w.as_slice() == [0x00, 0x51]).count(), 1);
    }

    #[test]
    fn flag_clears_after_a_failed_ranging() {
        let (srf08, regs, _) = ranger(150, fast());
        regs.fail_reads();
        assert!(srf08.read_range().is_err());
        assert!(!srf08.is_ranging());
        regs.heal();
        assert_eq!(srf08.read_range().unwrap().raw_value, 150);
    }

    #[test]
    fn auxiliary_registers() {
        let (srf08, regs, _) = ranger(150, fast());
        assert_eq!(srf08.software_revision().unwrap(), 0x0B);
        regs.set(REG_GAIN, 0x42);
        assert_eq!(srf08.light_level().unwrap(), 0x42);

        assert_eq!(srf08.set_gain(32).unwrap_err().kind(), ErrorKind::Range);
        srf08.set_gain(12).unwrap();
        assert_eq!(regs.get(REG_GAIN), 12);

        srf08.set_max_range(0x8C).unwrap();
        assert_eq!(regs.get(REG_RANGE), 0x8C);
    }

    #[test]
    fn poll_publishes_range_in_cm() {
        let (srf08, _, _) = ranger(87, fast());
        let events = srf08.poll().unwrap();
        assert!(matches!(
            events.as_slice(),
            [EventPayload::ProximityReceived { raw_value: 87, distance: Some(d) }] if (*d - 87.0).abs() < f64::EPSILON
        ));
    }
}
