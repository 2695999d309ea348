//! In-process simulated I2C bus for CI/CD testing without physical hardware.
//!
//! [`SimBus`] implements [`I2cBus`] by routing every transaction to a
//! simulated device attached at the target address, and appends it to a
//! shared [`TransactionLog`] so tests can assert byte-exact register traffic.
//!
//! # Stub behaviour
//!
//! | Device | Behaviour |
//! |---|---|
//! | [`SimRegisterDevice`] | 256 byte registers behind an auto-incrementing pointer; optional write hook |
//! | [`SimAds1115`] | 16-bit config/conversion registers; conversion result chosen per MUX setting |
//! | [`SimHtu21d`] | Hold-master commands returning `[msb, lsb, crc]` |
//! | [`sim_echo_pins`] | GPIO trigger/echo pair with a fixed echo delay and width |
//!
//! Presets ([`SimRegisterDevice::vcnl4000`], [`SimRegisterDevice::srf08`],
//! [`SimRegisterDevice::pca9685`]) model the ready bits and result registers
//! the drivers in [`crate::drivers`] rely on.
//!
//! # Example
//!
//! ```rust
//! use rangebot_hal::bus::SharedBus;
//! use rangebot_hal::sim::{SimBus, SimRegisterDevice};
//!
//! let mut sim = SimBus::new();
//! sim.attach(0x70, SimRegisterDevice::srf08(123));
//! let log = sim.log();
//! let bus = SharedBus::new("I2C1", sim);
//!
//! let srf08 = bus.open(0x70).unwrap();
//! srf08.write(&[0x00, 0x51]).unwrap();
//! assert_eq!(log.writes_to(0x70), vec![vec![0x00, 0x51]]);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rangebot_types::SensorError;

use crate::bus::{BusError, I2cBus};
use crate::drivers::hcsr04::GpioPin;
use crate::drivers::htu21d::crc8;

// ────────────────────────────────────────────────────────────────────────────
// Transaction log
// ────────────────────────────────────────────────────────────────────────────

/// One recorded bus transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusTransaction {
    Write { address: u16, bytes: Vec<u8> },
    Read { address: u16, len: usize },
    WriteRead { address: u16, bytes: Vec<u8>, len: usize },
}

impl BusTransaction {
    /// Target address of the transaction.
    pub fn address(&self) -> u16 {
        match self {
            BusTransaction::Write { address, .. }
            | BusTransaction::Read { address, .. }
            | BusTransaction::WriteRead { address, .. } => *address,
        }
    }
}

/// Shared, append-only record of every transaction a [`SimBus`] carried.
#[derive(Clone, Debug, Default)]
pub struct TransactionLog {
    entries: Arc<Mutex<Vec<BusTransaction>>>,
}

impl TransactionLog {
    fn push(&self, entry: BusTransaction) {
        self.lock().push(entry);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BusTransaction>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every recorded transaction, oldest first.
    pub fn entries(&self) -> Vec<BusTransaction> {
        self.lock().clone()
    }

    /// Payloads of the plain writes sent to `address`, oldest first.
    pub fn writes_to(&self, address: u16) -> Vec<Vec<u8>> {
        self.lock()
            .iter()
            .filter_map(|t| match t {
                BusTransaction::Write { address: a, bytes } if *a == address => {
                    Some(bytes.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Number of transactions addressed to `address`.
    pub fn count_for(&self, address: u16) -> usize {
        self.lock().iter().filter(|t| t.address() == address).count()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimDevice trait and SimBus
// ────────────────────────────────────────────────────────────────────────────

/// A simulated slave device attached to a [`SimBus`].
pub trait SimDevice: Send {
    /// Handle a master write.
    fn write(&mut self, bytes: &[u8]) -> Result<(), BusError>;

    /// Handle a master read.
    fn read(&mut self, buffer: &mut [u8]) -> Result<(), BusError>;
}

/// A simulated bus: addresses map to [`SimDevice`]s, unknown addresses NACK.
#[derive(Default)]
pub struct SimBus {
    devices: HashMap<u16, Box<dyn SimDevice>>,
    log: TransactionLog,
}

impl SimBus {
    /// Create an empty simulated bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `device` at `address`, replacing any device already there.
    pub fn attach(&mut self, address: u16, device: impl SimDevice + 'static) {
        self.devices.insert(address, Box::new(device));
    }

    /// Handle to the transaction log; clone it before the bus is moved into
    /// a [`SharedBus`][crate::bus::SharedBus].
    pub fn log(&self) -> TransactionLog {
        self.log.clone()
    }

    fn device(&mut self, address: u16) -> Result<&mut Box<dyn SimDevice>, BusError> {
        self.devices
            .get_mut(&address)
            .ok_or(BusError::Nack { address })
    }
}

/// Devices report NACKs without knowing their own address.
fn at(address: u16) -> impl FnOnce(BusError) -> BusError {
    move |error| match error {
        BusError::Nack { .. } => BusError::Nack { address },
        other => other,
    }
}

impl I2cBus for SimBus {
    fn write(&mut self, address: u16, bytes: &[u8]) -> Result<(), BusError> {
        self.log.push(BusTransaction::Write {
            address,
            bytes: bytes.to_vec(),
        });
        self.device(address)?.write(bytes).map_err(at(address))
    }

    fn read(&mut self, address: u16, buffer: &mut [u8]) -> Result<(), BusError> {
        self.log.push(BusTransaction::Read {
            address,
            len: buffer.len(),
        });
        self.device(address)?.read(buffer).map_err(at(address))
    }

    fn write_read(
        &mut self,
        address: u16,
        bytes: &[u8],
        buffer: &mut [u8],
    ) -> Result<(), BusError> {
        self.log.push(BusTransaction::WriteRead {
            address,
            bytes: bytes.to_vec(),
            len: buffer.len(),
        });
        let device = self.device(address)?;
        device.write(bytes).map_err(at(address))?;
        device.read(buffer).map_err(at(address))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pointer-register device
// ────────────────────────────────────────────────────────────────────────────

/// Called after a byte is stored: `(registers, register, value)`.
pub type WriteHook = Box<dyn FnMut(&mut [u8; 256], u8, u8) + Send>;

/// Mutable state behind a [`SimRegisterDevice`], shared with the test that
/// created it through [`SimRegisters`].
pub struct RegisterState {
    registers: [u8; 256],
    pointer: u8,
    hook: Option<WriteHook>,
    writes_seen: usize,
    fail_writes_after: Option<usize>,
    fail_reads: bool,
    latency: Duration,
}

/// Test-side handle to a [`SimRegisterDevice`]'s state.
#[derive(Clone)]
pub struct SimRegisters {
    state: Arc<Mutex<RegisterState>>,
}

impl SimRegisters {
    fn lock(&self) -> MutexGuard<'_, RegisterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current value of `register`.
    pub fn get(&self, register: u8) -> u8 {
        self.lock().registers[usize::from(register)]
    }

    /// Overwrite `register` without going through the bus.
    pub fn set(&self, register: u8, value: u8) {
        self.lock().registers[usize::from(register)] = value;
    }

    /// Store a big-endian 16-bit value at `register` and `register + 1`.
    pub fn set_pair(&self, register: u8, value: u16) {
        let [high, low] = value.to_be_bytes();
        let mut state = self.lock();
        state.registers[usize::from(register)] = high;
        state.registers[usize::from(register.wrapping_add(1))] = low;
    }

    /// Let the next `n` writes succeed, then NACK every write after them.
    pub fn fail_writes_after(&self, n: usize) {
        let mut state = self.lock();
        state.fail_writes_after = Some(state.writes_seen + n);
    }

    /// Stop injecting write failures.
    pub fn heal(&self) {
        let mut state = self.lock();
        state.fail_writes_after = None;
        state.fail_reads = false;
    }

    /// NACK every read.
    pub fn fail_reads(&self) {
        self.lock().fail_reads = true;
    }

    /// Sleep this long inside every transaction (the bus lock stays held).
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }
}

/// A device modelled as 256 byte registers behind an auto-incrementing
/// pointer: the first written byte selects the register, further bytes are
/// stored from there on, and reads return bytes from the pointer onwards.
pub struct SimRegisterDevice {
    state: Arc<Mutex<RegisterState>>,
}

impl Default for SimRegisterDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRegisterDevice {
    /// A blank register file.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RegisterState {
                registers: [0; 256],
                pointer: 0,
                hook: None,
                writes_seen: 0,
                fail_writes_after: None,
                fail_reads: false,
                latency: Duration::ZERO,
            })),
        }
    }

    /// Install a hook run after every stored byte.
    pub fn with_hook(self, hook: impl FnMut(&mut [u8; 256], u8, u8) + Send + 'static) -> Self {
        self.lock().hook = Some(Box::new(hook));
        self
    }

    /// Test-side handle to this device's registers.
    pub fn registers(&self) -> SimRegisters {
        SimRegisters {
            state: Arc::clone(&self.state),
        }
    }

    /// A proximity/ambient sensor whose measurements complete instantly.
    ///
    /// Setting the proximity (0x08) or ambient (0x10) on-demand bit in the
    /// command register (0x80) raises the matching ready bit (0x20 / 0x40),
    /// clears the on-demand bit, and loads the result registers.
    pub fn vcnl4000(proximity: u16, ambient: u16) -> Self {
        let device = Self::new().with_hook(move |regs, register, value| {
            if register != 0x80 {
                return;
            }
            let mut command = regs[0x80] & !0x18;
            if value & 0x08 != 0 {
                regs[0x87..=0x88].copy_from_slice(&proximity.to_be_bytes());
                command |= 0x20;
            }
            if value & 0x10 != 0 {
                regs[0x85..=0x86].copy_from_slice(&ambient.to_be_bytes());
                command |= 0x40;
            }
            regs[0x80] = command;
        });
        device.registers().set(0x81, 0x11);
        device
    }

    /// An ultrasonic ranger with software revision 0x0B; command 0x51 to
    /// register 0 loads `range_cm` into the first-echo registers (0x02, 0x03).
    pub fn srf08(range_cm: u16) -> Self {
        let device = Self::new().with_hook(move |regs, register, value| {
            if register == 0x00 && value == 0x51 {
                regs[0x02..=0x03].copy_from_slice(&range_cm.to_be_bytes());
                regs[0x00] = 0x0B;
            }
        });
        device.registers().set(0x00, 0x0B);
        device
    }

    /// A 16-channel PWM controller in its power-on state (MODE1 = 0x11,
    /// sleeping with all-call enabled; PRESCALE = 0x1E).
    pub fn pca9685() -> Self {
        let device = Self::new();
        let regs = device.registers();
        regs.set(0x00, 0x11);
        regs.set(0xFE, 0x1E);
        device
    }

    fn lock(&self) -> MutexGuard<'_, RegisterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stall(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
    }
}

impl SimDevice for SimRegisterDevice {
    fn write(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        self.stall();
        let mut state = self.lock();
        state.writes_seen += 1;
        if state
            .fail_writes_after
            .is_some_and(|limit| state.writes_seen > limit)
        {
            return Err(BusError::Nack { address: 0 });
        }
        let Some((&pointer, data)) = bytes.split_first() else {
            return Ok(());
        };
        state.pointer = pointer;
        let RegisterState {
            registers,
            pointer,
            hook,
            ..
        } = &mut *state;
        for &value in data {
            registers[usize::from(*pointer)] = value;
            if let Some(hook) = hook.as_mut() {
                hook(&mut *registers, *pointer, value);
            }
            *pointer = pointer.wrapping_add(1);
        }
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<(), BusError> {
        self.stall();
        let mut state = self.lock();
        if state.fail_reads {
            return Err(BusError::Nack { address: 0 });
        }
        for byte in buffer.iter_mut() {
            *byte = state.registers[usize::from(state.pointer)];
            state.pointer = state.pointer.wrapping_add(1);
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// 16-bit register ADC
// ────────────────────────────────────────────────────────────────────────────

/// A four-channel ADC with 16-bit config (pointer 0x01) and conversion
/// (pointer 0x00) registers.  Writing a config word with the MUX field set
/// to a single-ended channel latches that channel's value into the
/// conversion register.
#[derive(Clone, Default)]
pub struct SimAds1115 {
    inner: Arc<Mutex<AdcState>>,
}

#[derive(Default)]
struct AdcState {
    pointer: u8,
    config: u16,
    conversion: u16,
    channels: [u16; 4],
    /// Bit `n` set = selecting input `n` fails.
    failing: u8,
}

impl SimAds1115 {
    /// An ADC whose single-ended inputs read `channels`.
    pub fn new(channels: [u16; 4]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AdcState {
                channels,
                ..AdcState::default()
            })),
        }
    }

    /// Make config writes selecting single-ended input `channel` fail.
    pub fn fail_channel(&self, channel: u8) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).failing |= 1 << channel;
    }

    /// The last config word written.
    pub fn last_config(&self) -> u16 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).config
    }
}

impl SimDevice for SimAds1115 {
    fn write(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match bytes {
            [pointer] => state.pointer = *pointer,
            [0x01, high, low] => {
                state.pointer = 0x01;
                state.config = u16::from_be_bytes([*high, *low]);
                let mux = (state.config >> 12) & 0x7;
                if mux >= 4 && state.failing & (1 << (mux - 4)) != 0 {
                    return Err(BusError::Io(format!("input {} not responding", mux - 4)));
                }
                if mux >= 4 {
                    state.conversion = state.channels[usize::from(mux as u8 - 4)];
                }
            }
            _ => return Err(BusError::Io(format!("unexpected ADC write {bytes:02x?}"))),
        }
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<(), BusError> {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let word = if state.pointer == 0x01 {
            state.config
        } else {
            state.conversion
        };
        for (dst, src) in buffer.iter_mut().zip(word.to_be_bytes()) {
            *dst = src;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Hold-master humidity/temperature sensor
// ────────────────────────────────────────────────────────────────────────────

/// A humidity/temperature sensor answering hold-master commands 0xE3
/// (temperature) and 0xE5 (humidity) with `[msb, lsb, crc]`, the CRC taken
/// over the value with its status bits cleared.
///
/// The humidity CRC is XORed with `humidity_crc_xor` before it is sent,
/// modelling firmware that corrupts it in a fixed way.
pub struct SimHtu21d {
    raw_temperature: u16,
    raw_humidity: u16,
    humidity_crc_xor: u8,
    pending: Option<[u8; 3]>,
}

impl SimHtu21d {
    /// `raw_*` are the 14/12-bit readings left-aligned in 16 bits; the two
    /// status bits are filled in by the simulator.
    pub fn new(raw_temperature: u16, raw_humidity: u16, humidity_crc_xor: u8) -> Self {
        Self {
            raw_temperature,
            raw_humidity,
            humidity_crc_xor,
            pending: None,
        }
    }

    fn frame(value: u16, crc_xor: u8) -> [u8; 3] {
        let [msb, lsb] = value.to_be_bytes();
        [msb, lsb, crc8(value & 0xFFFC) ^ crc_xor]
    }
}

impl SimDevice for SimHtu21d {
    fn write(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        self.pending = match bytes.first() {
            Some(0xE3) => Some(Self::frame(self.raw_temperature & 0xFFFC, 0)),
            Some(0xE5) => Some(Self::frame(
                (self.raw_humidity & 0xFFFC) | 0x02,
                self.humidity_crc_xor,
            )),
            _ => None,
        };
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<(), BusError> {
        let frame = self.pending.take().ok_or(BusError::Io(
            "read without a pending measurement".to_string(),
        ))?;
        for (dst, src) in buffer.iter_mut().zip(frame) {
            *dst = src;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pulse-echo GPIO pair
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct EchoState {
    trigger_high: bool,
    fired_at: Option<Instant>,
}

/// One line of a [`sim_echo_pins`] pair.
pub struct SimPin {
    state: Arc<Mutex<EchoState>>,
    /// `(delay after trigger, echo width)`; `None` never echoes.
    echo: Option<Option<(Duration, Duration)>>,
}

/// A trigger/echo pin pair: the falling edge of the trigger pulse starts a
/// ping, after which the echo line is high for `width` once `delay` passes.
pub fn sim_echo_pins(profile: Option<(Duration, Duration)>) -> (SimPin, SimPin) {
    let state = Arc::new(Mutex::new(EchoState::default()));
    (
        SimPin {
            state: Arc::clone(&state),
            echo: None,
        },
        SimPin {
            state,
            echo: Some(profile),
        },
    )
}

impl GpioPin for SimPin {
    fn set(&mut self, high: bool) -> Result<(), SensorError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.trigger_high && !high {
            state.fired_at = Some(Instant::now());
        }
        state.trigger_high = high;
        Ok(())
    }

    fn is_high(&mut self) -> Result<bool, SensorError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (Some(Some((delay, width))), Some(fired_at)) = (self.echo, state.fired_at) else {
            return Ok(state.trigger_high && self.echo.is_none());
        };
        let elapsed = fired_at.elapsed();
        Ok(elapsed >= delay && elapsed < delay + width)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
