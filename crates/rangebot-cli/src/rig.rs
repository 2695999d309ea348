//! Assembles buses and drivers from the [`Config`].
//!
//! The binary runs against the register-level simulator: each configured
//! device gets a simulated counterpart at its configured address, so the full
//! polling and sweep pipeline runs without hardware attached.

use std::sync::Arc;
use std::time::Duration;

use rangebot_hal::drivers::ads1115::{Ads1115, Gain};
use rangebot_hal::drivers::arduino_range::ArduinoRange;
use rangebot_hal::drivers::htu21d::Htu21d;
use rangebot_hal::drivers::pca9685::Pca9685;
use rangebot_hal::drivers::srf08::Srf08;
use rangebot_hal::drivers::vcnl4000::Vcnl4000;
use rangebot_hal::sim::{SimAds1115, SimBus, SimHtu21d, SimRegisterDevice};
use rangebot_hal::{BusProvider, PolledDevice, SharedBus};

use crate::config::Config;

/// Everything the binary schedules and drives.
pub struct Rig {
    /// Polled devices with their poll intervals.
    pub devices: Vec<(Arc<dyn PolledDevice>, Duration)>,
    /// Id of the range sensor feeding the sweep, when enabled.
    pub sonar_id: Option<String>,
    pub servo: Option<Arc<Pca9685>>,
    /// Full scale of the ADC, for volt conversion of channel readings.
    pub adc_gain: Gain,
}

/// Register one simulated bus per configured bus name, populated with a
/// simulated device at every enabled device's address.
pub fn simulated_provider(cfg: &Config) -> BusProvider {
    let mut main = SimBus::new();
    let mut climate = SimBus::new();

    if cfg.adc.enabled {
        main.attach(cfg.adc.address, SimAds1115::new([0x2000, 0x1000, 0x0800, 0x0400]));
    }
    if cfg.proximity.enabled {
        main.attach(cfg.proximity.address, SimRegisterDevice::vcnl4000(3000, 150));
    }
    if cfg.sonar.enabled {
        main.attach(cfg.sonar.address, SimRegisterDevice::srf08(87));
    }
    if cfg.bridge.enabled {
        let bridge = SimRegisterDevice::new();
        // 582 µs echo, little-endian.
        bridge.registers().set(0x00, 0x46);
        bridge.registers().set(0x01, 0x02);
        main.attach(cfg.bridge.address, bridge);
    }
    if cfg.servo.enabled {
        main.attach(cfg.servo.address, SimRegisterDevice::pca9685());
    }

    let xor = if cfg.climate.settings.humidity_crc_quirk { 0x62 } else { 0x00 };
    let climate_device = SimHtu21d::new(0x6680, 0x7C80, xor);
    let mut provider = BusProvider::new();
    if cfg.climate_bus == cfg.bus {
        if cfg.climate.enabled {
            main.attach(cfg.climate.address, climate_device);
        }
    } else {
        if cfg.climate.enabled {
            climate.attach(cfg.climate.address, climate_device);
        }
        provider.register(SharedBus::new(cfg.climate_bus.clone(), climate));
    }
    provider.register(SharedBus::new(cfg.bus.clone(), main));
    provider
}

/// Open every enabled device on `provider` and build its driver.
///
/// # Errors
///
/// A description of the first device that could not be opened or
/// initialised.
pub fn build(cfg: &Config, provider: &BusProvider) -> Result<Rig, String> {
    let open = |bus: &str, address: u16, what: &str| {
        provider
            .open(bus, address)
            .map_err(|e| format!("Failed to open {what} at {bus}/0x{address:02x}: {e}"))
    };
    let interval = Duration::from_millis;

    let mut devices: Vec<(Arc<dyn PolledDevice>, Duration)> = Vec::new();

    if cfg.adc.enabled {
        let adc = Ads1115::new(open(&cfg.bus, cfg.adc.address, "ADC")?, cfg.adc.settings.clone());
        devices.push((Arc::new(adc), interval(cfg.adc.settings.poll_interval_ms)));
    }
    if cfg.proximity.enabled {
        let sensor = Vcnl4000::new(
            open(&cfg.bus, cfg.proximity.address, "proximity sensor")?,
            cfg.proximity.settings.clone(),
        )
        .map_err(|e| format!("Failed to initialise proximity sensor: {e}"))?;
        devices.push((
            Arc::new(sensor),
            interval(cfg.proximity.settings.poll_interval_ms),
        ));
    }

    let mut sonar_id = None;
    if cfg.sonar.enabled {
        let sonar = Srf08::new(
            open(&cfg.bus, cfg.sonar.address, "range sensor")?,
            cfg.sonar.settings.clone(),
        );
        sonar_id = Some(sonar.id().to_string());
        devices.push((Arc::new(sonar), interval(cfg.sonar.settings.poll_interval_ms)));
    }
    if cfg.climate.enabled {
        let climate = Htu21d::new(
            open(&cfg.climate_bus, cfg.climate.address, "humidity sensor")?,
            cfg.climate.settings.clone(),
        );
        devices.push((
            Arc::new(climate),
            interval(cfg.climate.settings.poll_interval_ms),
        ));
    }
    if cfg.bridge.enabled {
        let bridge = ArduinoRange::new(open(&cfg.bus, cfg.bridge.address, "range bridge")?);
        devices.push((Arc::new(bridge), interval(cfg.bridge.settings.poll_interval_ms)));
    }

    let servo = if cfg.servo.enabled {
        Some(Arc::new(Pca9685::new(
            open(&cfg.bus, cfg.servo.address, "servo controller")?,
            cfg.servo.settings.clone(),
        )))
    } else {
        None
    };

    Ok(Rig {
        devices,
        sonar_id,
        servo,
        adc_gain: cfg.adc.settings.gain,
    })
}
