//! `rangebot-cli` – the `rangebot` binary.
//!
//! 1. Loads `~/.rangebot/config.toml`, writing the defaults on first run.
//! 2. Opens every configured device on the (simulated) buses and schedules
//!    its poll cycle.
//! 3. Starts the servo sweep, fed by the range sensor's readings.
//! 4. Reports readings, sweep positions and faults until **Ctrl-C**, then
//!    stops the sweep and every device timer.

mod config;
mod rig;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use rangebot_hal::RawValueConverter;
use rangebot_hal::drivers::ads1115::Gain;
use rangebot_kernel::PollingScheduler;
use rangebot_middleware::{EventBus, Topic, TopicReceiver};
use rangebot_runtime::SweepCoordinator;
use rangebot_types::{Event, EventPayload};

use crate::config::{Config, IrRanger};

fn main() {
    rangebot_runtime::init_tracing("rangebot");
    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping sweep and device timers …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; stop the process with a signal instead");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", config::config_path().display().to_string().bold());
            cfg
        }
        Ok(None) => {
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&Config::default()) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    // The runtime is created after tracing so its worker threads inherit
    // the global subscriber.
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cfg, shutdown)) {
        println!("{}: {}", "Startup failed".red().bold(), e);
        std::process::exit(1);
    }
    println!("{}", "  ✓ Exiting rangebot.".green());
}

// ─────────────────────────────────────────────────────────────────────────────
// Main loop
// ─────────────────────────────────────────────────────────────────────────────

async fn run(cfg: Config, shutdown: Arc<AtomicBool>) -> Result<(), String> {
    let provider = rig::simulated_provider(&cfg);
    let rig = rig::build(&cfg, &provider)?;

    let bus = EventBus::default();
    spawn_reporter(bus.subscribe_to(Topic::Readings), rig.adc_gain, cfg.ir_ranger.clone());
    spawn_reporter(bus.subscribe_to(Topic::Faults), rig.adc_gain, cfg.ir_ranger.clone());

    // ── Sweep ─────────────────────────────────────────────────────────────
    let sweep = match (&rig.servo, &rig.sonar_id) {
        (Some(servo), Some(sonar_id)) => {
            let sweep = SweepCoordinator::new(servo.clone(), cfg.sweep.clone())
                .map_err(|e| format!("Invalid sweep configuration: {e}"))?;
            spawn_reporter(sweep.events().subscribe_to(Topic::Sweep), rig.adc_gain, cfg.ir_ranger.clone());
            spawn_reporter(sweep.events().subscribe_to(Topic::Faults), rig.adc_gain, cfg.ir_ranger.clone());

            let starting = Arc::clone(&sweep);
            tokio::task::spawn_blocking(move || starting.start())
                .await
                .map_err(|e| format!("Sweep start aborted: {e}"))?
                .map_err(|e| format!("Failed to start sweep: {e}"))?;
            sweep.follow(&bus, sonar_id);
            Some(sweep)
        }
        _ => {
            info!("sweep disabled: needs both the servo controller and the range sensor");
            None
        }
    };

    // ── Device timers ─────────────────────────────────────────────────────
    let scheduler = PollingScheduler::new(bus.clone());
    for (device, interval) in rig.devices {
        scheduler
            .schedule(device, interval)
            .map_err(|e| format!("Failed to schedule device: {e}"))?;
    }
    println!(
        "  Polling {} device(s). Press {} to stop.\n",
        scheduler.scheduled().len(),
        "Ctrl-C".bold()
    );

    // ── Slow diagnostic poll ──────────────────────────────────────────────
    let mut diagnostics =
        tokio::time::interval(Duration::from_millis(cfg.diagnostic_interval_ms.max(1)));
    diagnostics.tick().await;
    while !shutdown.load(Ordering::SeqCst) {
        tokio::select! {
            _ = diagnostics.tick() => {
                let stale = scheduler.stale_devices();
                if stale.is_empty() {
                    debug!("all devices live");
                } else {
                    warn!(devices = ?stale, "devices stale");
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    if let Some(sweep) = sweep {
        sweep.stop();
    }
    scheduler.stop_all();
    Ok(())
}

fn spawn_reporter(mut rx: TopicReceiver, adc_gain: Gain, ir_ranger: IrRanger) {
    tokio::spawn(async move {
        while let Some(event) = rx.next_event().await {
            report(&event, adc_gain, &ir_ranger);
        }
    });
}

fn report(event: &Event, adc_gain: Gain, ir_ranger: &IrRanger) {
    match &event.payload {
        EventPayload::PositionFound { .. } => println!("  {}", describe(event, adc_gain, ir_ranger).cyan()),
        EventPayload::SensorException { .. } => {
            warn!(source = %event.source, "{}", describe(event, adc_gain, ir_ranger))
        }
        _ => info!(source = %event.source, "{}", describe(event, adc_gain, ir_ranger)),
    }
}

/// One-line human description of an event.
fn describe(event: &Event, adc_gain: Gain, ir_ranger: &IrRanger) -> String {
    match &event.payload {
        EventPayload::ChannelReadingDone(reading) => {
            let volts = reading.volts(adc_gain.full_scale_volts());
            let mut line = format!("ch{} = {volts:.3} V", reading.channel);
            if ir_ranger.enabled
                && ir_ranger.channel == reading.channel
                && let Some(cm) = ir_ranger.curve.convert(reading.raw_value)
            {
                line.push_str(&format!(" (IR range {cm:.1} cm)"));
            }
            line
        }
        EventPayload::ProximityReceived { raw_value, distance } => match distance {
            Some(d) => format!("proximity raw {raw_value}, distance {d:.1}"),
            None => format!("proximity raw {raw_value}"),
        },
        EventPayload::AmbientLightReceived { raw_value } => format!("ambient light {raw_value}"),
        EventPayload::ClimateReceived {
            temperature_c,
            relative_humidity,
            dew_point_c,
        } => format!(
            "{temperature_c:.2} °C, {relative_humidity:.1} %RH, dew point {dew_point_c:.2} °C"
        ),
        EventPayload::PositionFound {
            angle,
            distance,
            raw_value,
        } => match distance {
            Some(d) => format!("{angle:>3}° → {d:.1} (raw {raw_value})"),
            None => format!("{angle:>3}° → raw {raw_value}"),
        },
        EventPayload::SensorException { message, cause } => format!("{message}: {cause}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("  {} {}", "rangebot".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Range sensing and servo sweep");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangebot_types::{ChannelReading, SensorError};

    #[test]
    fn channel_reading_shows_volts_and_ir_range() {
        let event = Event::new(
            "ads1115@0x48",
            EventPayload::ChannelReadingDone(ChannelReading {
                raw_value: 0x4000,
                channel: 0,
                device_address: 0x48,
            }),
        );
        let line = describe(&event, Gain::One, &IrRanger::default());
        assert!(line.starts_with("ch0 = 2.048 V"), "{line}");
        assert!(line.contains("IR range"), "{line}");

        let other_channel = IrRanger {
            channel: 1,
            ..IrRanger::default()
        };
        assert!(!describe(&event, Gain::One, &other_channel).contains("IR range"));
    }

    #[test]
    fn position_and_fault_lines() {
        let found = Event::new(
            "sweep@ch0",
            EventPayload::PositionFound {
                angle: 45,
                distance: Some(87.0),
                raw_value: 87,
            },
        );
        assert_eq!(describe(&found, Gain::default(), &IrRanger::default()), " 45° → 87.0 (raw 87)");

        let fault = Event::new(
            "srf08@0x70",
            EventPayload::SensorException {
                message: "poll cycle of srf08@0x70 failed".to_string(),
                cause: SensorError::bus("srf08@0x70", "device busy"),
            },
        );
        let line = describe(&fault, Gain::default(), &IrRanger::default());
        assert!(line.contains("device busy"), "{line}");
    }
}
