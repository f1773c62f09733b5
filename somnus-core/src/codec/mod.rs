//! Codec register sequencer.
//!
//! ```text
//! init(role, rate)
//!   probe id registers        (diagnostic only, never gates)
//!   open: reset + settle      (writes before the settle are ignored by the chip)
//!   clock profile             (pure function of rate + MCLK source)
//!   data format + power       (read-modify-write where bits are shared)
//!   path: disable → route → output stage
//!   verify output-enable bit  (bounded retries → PathNotEnabled, non-fatal)
//!   finish, amplifier on, unmute
//! ```
//!
//! All register traffic goes through a [`RegisterBus`] implementation, so the
//! same sequencer drives real hardware, the host simulation and tests.

pub mod es7210;
pub mod es8311;
pub mod profile;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::config::CodecConfig;
use crate::error::{BusError, CodecError};

pub use profile::{
    is_supported_sample_rate, ClockParams, CodecRegisterProfile, MclkSource, RegisterOp,
    SUPPORTED_SAMPLE_RATES,
};

const VERIFY_FORCE_SETTLE: Duration = Duration::from_millis(20);
const VERIFY_RESTORE_SETTLE: Duration = Duration::from_millis(10);
const VERIFY_BACKOFF: Duration = Duration::from_millis(50);

/// Register-level access to the codec chips (an I2C master on hardware).
///
/// Implementors must be `Send + 'static` so the handle can move between the
/// startup thread and the playback task.
pub trait RegisterBus: Send + 'static {
    fn write_register(&mut self, addr: u8, reg: u8, value: u8) -> Result<(), BusError>;

    fn read_register(&mut self, addr: u8, reg: u8) -> Result<u8, BusError>;

    /// Wait for a datasheet-specified settle time.
    fn settle(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// Drive the power amplifier enable line.
    fn set_amplifier(&mut self, _enabled: bool) -> Result<(), BusError> {
        Ok(())
    }
}

/// Thread-safe shared handle to a register bus. Both codecs share one bus.
#[derive(Clone)]
pub struct RegisterBusHandle(pub Arc<Mutex<dyn RegisterBus>>);

impl RegisterBusHandle {
    pub fn new<B: RegisterBus>(bus: B) -> Self {
        Self(Arc::new(Mutex::new(bus)))
    }
}

impl std::fmt::Debug for RegisterBusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RegisterBusHandle")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecRole {
    /// ADC feeding the capture channel.
    Capture,
    /// DAC driven by the playback channel.
    Playback,
}

/// Read-back check on a safety-critical enable bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyStep {
    pub reg: u8,
    pub mask: u8,
    /// Written to force the bit on when the read-back fails.
    pub force_value: u8,
    /// Restored once the bit is observed.
    pub working_value: u8,
}

/// Full register program for one chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipSequence {
    pub chip: &'static str,
    pub id_registers: &'static [u8],
    pub open: Vec<RegisterOp>,
    pub configure: Vec<RegisterOp>,
    pub path: Vec<RegisterOp>,
    pub verify: Option<VerifyStep>,
    pub finish: Vec<RegisterOp>,
    pub unmute: Vec<RegisterOp>,
    pub uses_amplifier: bool,
    pub power_down: Vec<RegisterOp>,
}

#[derive(Debug)]
struct ActiveCodec {
    role: CodecRole,
    address: u8,
    sequence: ChipSequence,
    sample_rate: u32,
    path_verified: bool,
}

/// Owned driver state for one codec chip.
#[derive(Debug)]
pub struct CodecHandle {
    bus: RegisterBusHandle,
    config: CodecConfig,
    active: Option<ActiveCodec>,
}

impl CodecHandle {
    pub fn new(bus: RegisterBusHandle, config: CodecConfig) -> Self {
        Self {
            bus,
            config,
            active: None,
        }
    }

    /// Run the full initialisation sequence for `role` at `sample_rate`.
    ///
    /// # Errors
    /// - [`CodecError::UnsupportedSampleRate`] before any register is touched.
    /// - [`CodecError::RegisterWrite`]: fatal for this call; the whole
    ///   sequence may be retried.
    /// - [`CodecError::PathNotEnabled`]: degraded. The sequence ran to
    ///   completion and the codec is marked initialised; audio may be silent.
    pub fn init(&mut self, role: CodecRole, sample_rate: u32) -> Result<(), CodecError> {
        let profile = CodecRegisterProfile::derive(role, sample_rate, self.config.mclk_source)?;
        let (address, sequence) = match role {
            CodecRole::Playback => (self.config.playback_address, es8311::sequence(&self.config)),
            CodecRole::Capture => (self.config.capture_address, es7210::sequence()),
        };
        let chip = sequence.chip;
        info!(chip, address = format_args!("0x{address:02x}"), sample_rate, "initialising codec");

        let mut guard = self.bus.0.lock();
        let bus: &mut dyn RegisterBus = &mut *guard;

        self.active = None;
        probe(bus, chip, address, sequence.id_registers);

        apply(bus, chip, address, &sequence.open)?;
        apply(bus, chip, address, &profile.ops)?;
        apply(bus, chip, address, &sequence.configure)?;
        apply(bus, chip, address, &sequence.path)?;

        let verified = match sequence.verify {
            Some(step) => verify_enabled(bus, chip, address, step, self.config.verify_retries),
            None => Ok(()),
        };

        apply(bus, chip, address, &sequence.finish)?;
        if sequence.uses_amplifier {
            bus.set_amplifier(true)
                .map_err(|source| CodecError::RegisterWrite {
                    chip,
                    register: 0,
                    source,
                })?;
            debug!(chip, "power amplifier enabled");
        }
        apply(bus, chip, address, &sequence.unmute)?;
        drop(guard);

        self.active = Some(ActiveCodec {
            role,
            address,
            sequence,
            sample_rate,
            path_verified: verified.is_ok(),
        });

        match verified {
            Ok(()) => {
                info!(chip, sample_rate, "codec ready");
                Ok(())
            }
            Err(e) => {
                error!(chip, error = %e, "codec initialised in degraded mode; output may be silent");
                Err(e)
            }
        }
    }

    /// Rewrite the clock dividers for a new sample rate.
    ///
    /// Always issues the full clock profile, so repeated calls for the same
    /// rate produce identical register traffic. Callers that share the bus
    /// channel with a running transfer go through
    /// [`crate::transport::AudioBus::reconfigure_playback`], which holds the channel
    /// disabled for the duration.
    pub fn reconfigure_sample_rate(&mut self, hz: u32) -> Result<(), CodecError> {
        let active = self.active.as_mut().ok_or(CodecError::NotInitialized)?;
        let profile = CodecRegisterProfile::derive(active.role, hz, self.config.mclk_source)?;
        let mut guard = self.bus.0.lock();
        apply(&mut *guard, active.sequence.chip, active.address, &profile.ops)?;
        drop(guard);
        debug!(
            chip = active.sequence.chip,
            from = active.sample_rate,
            to = hz,
            "codec clock reconfigured"
        );
        active.sample_rate = hz;
        Ok(())
    }

    /// Mute, drop the amplifier and disable the output path.
    pub fn power_down(&mut self) -> Result<(), CodecError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let chip = active.sequence.chip;
        let mut guard = self.bus.0.lock();
        let bus: &mut dyn RegisterBus = &mut *guard;
        if active.sequence.uses_amplifier {
            if let Err(e) = bus.set_amplifier(false) {
                warn!(chip, error = %e, "failed to disable power amplifier");
            }
        }
        apply(bus, chip, active.address, &active.sequence.power_down)?;
        info!(chip, "codec powered down");
        Ok(())
    }

    pub fn role(&self) -> Option<CodecRole> {
        self.active.as_ref().map(|a| a.role)
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.active.as_ref().map(|a| a.sample_rate)
    }

    pub fn is_initialized(&self) -> bool {
        self.active.is_some()
    }

    /// `false` after init surfaced [`CodecError::PathNotEnabled`].
    pub fn path_verified(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.path_verified)
    }
}

// ── Sequencing helpers ───────────────────────────────────────────────────────

fn probe(bus: &mut dyn RegisterBus, chip: &'static str, address: u8, id_registers: &[u8]) {
    let mut ids = Vec::with_capacity(id_registers.len());
    for &reg in id_registers {
        match bus.read_register(address, reg) {
            Ok(value) => ids.push(value),
            Err(source) => {
                let e = CodecError::ProbeFailed { chip, source };
                warn!(error = %e, "codec probe failed; continuing initialisation");
                return;
            }
        }
    }
    info!(chip, chip_id = ?ids, "codec detected");
}

fn apply(
    bus: &mut dyn RegisterBus,
    chip: &'static str,
    address: u8,
    ops: &[RegisterOp],
) -> Result<(), CodecError> {
    for op in ops {
        let wrap = |source| CodecError::RegisterWrite {
            chip,
            register: op.reg(),
            source,
        };
        let (reg, value) = match *op {
            RegisterOp::Write { reg, value, .. } => (reg, value),
            RegisterOp::Update {
                reg,
                keep_mask,
                bits,
                ..
            } => {
                let current = bus.read_register(address, reg).map_err(wrap)?;
                (reg, (current & keep_mask) | bits)
            }
        };
        trace!(chip, reg = format_args!("0x{reg:02x}"), value = format_args!("0x{value:02x}"), "register write");
        bus.write_register(address, reg, value).map_err(wrap)?;
        let settle = op.settle();
        if !settle.is_zero() {
            bus.settle(settle);
        }
    }
    Ok(())
}

fn bit_set(bus: &mut dyn RegisterBus, address: u8, step: &VerifyStep) -> (bool, u8) {
    match bus.read_register(address, step.reg) {
        Ok(v) => (v & step.mask != 0, v),
        Err(_) => (false, 0),
    }
}

fn verify_enabled(
    bus: &mut dyn RegisterBus,
    chip: &'static str,
    address: u8,
    step: VerifyStep,
    retries: u8,
) -> Result<(), CodecError> {
    let retries = retries.max(1);
    for attempt in 1..=retries {
        let (ok, readback) = bit_set(bus, address, &step);
        if ok {
            debug!(chip, attempt, readback = format_args!("0x{readback:02x}"), "enable bit verified");
            return Ok(());
        }
        warn!(
            chip,
            attempt,
            retries,
            register = format_args!("0x{:02x}", step.reg),
            readback = format_args!("0x{readback:02x}"),
            "enable bit not set; forcing"
        );

        // Write failures here are absorbed by the retry budget.
        if let Err(e) = bus.write_register(address, step.reg, step.force_value) {
            warn!(
                chip,
                attempt,
                register = format_args!("0x{:02x}", step.reg),
                "force write failed: {e}"
            );
        }
        bus.settle(VERIFY_FORCE_SETTLE);
        if bit_set(bus, address, &step).0 {
            if let Err(e) = bus.write_register(address, step.reg, step.working_value) {
                warn!(
                    chip,
                    attempt,
                    register = format_args!("0x{:02x}", step.reg),
                    "restore write failed: {e}"
                );
            }
            bus.settle(VERIFY_RESTORE_SETTLE);
            if bit_set(bus, address, &step).0 {
                return Ok(());
            }
        }
        bus.settle(VERIFY_BACKOFF);
    }

    let (ok, readback) = bit_set(bus, address, &step);
    if ok {
        return Ok(());
    }
    Err(CodecError::PathNotEnabled {
        chip,
        register: step.reg,
        readback,
    })
}

#[cfg(test)]
mod tests {
    use super::sim::SimulatedCodecBus;
    use super::*;

    fn handle(sim: &SimulatedCodecBus) -> CodecHandle {
        CodecHandle::new(RegisterBusHandle::new(sim.clone()), CodecConfig::default())
    }

    #[test]
    fn playback_init_enables_output_and_amplifier() {
        let sim = SimulatedCodecBus::new();
        let mut codec = handle(&sim);
        codec.init(CodecRole::Playback, 44_100).unwrap();

        assert!(codec.path_verified());
        assert_eq!(sim.register(0x18, es8311::SYSTEM_REG0F), Some(0x0C));
        assert_eq!(sim.register(0x18, es8311::SYSTEM_REG11), Some(0xE0));
        assert_eq!(sim.register(0x18, es8311::DAC_REG31), Some(0x00));
        assert!(sim.amplifier_enabled());
    }

    #[test]
    fn probe_failure_does_not_abort_init() {
        let sim = SimulatedCodecBus::new();
        sim.fail_reads_of(0x18, es8311::CHIP_ID1_REGFD);
        let mut codec = handle(&sim);
        assert!(codec.init(CodecRole::Playback, 48_000).is_ok());
        assert!(codec.is_initialized());
    }

    #[test]
    fn reset_settle_is_honoured() {
        let sim = SimulatedCodecBus::new();
        let mut codec = handle(&sim);
        codec.init(CodecRole::Playback, 16_000).unwrap();
        let log = sim.writes();
        let reset_idx = log
            .iter()
            .position(|w| w.reg == es8311::RESET_REG00 && w.value == 0x80)
            .unwrap();
        assert!(sim.settled_after_write(reset_idx) >= Duration::from_millis(20));
    }

    #[test]
    fn stuck_enable_bit_exhausts_retries_but_completes() {
        let sim = SimulatedCodecBus::new();
        sim.stick_bits_low(0x18, es8311::SYSTEM_REG11, 0x80);
        let mut codec = handle(&sim);
        let err = codec.init(CodecRole::Playback, 44_100).unwrap_err();

        assert!(matches!(
            err,
            CodecError::PathNotEnabled { register: 0x11, .. }
        ));
        assert!(err.is_degraded());
        assert!(codec.is_initialized());
        assert!(!codec.path_verified());
        // Unmute still ran after the failed verification.
        let log = sim.writes();
        assert_eq!(log.last().map(|w| w.reg), Some(es8311::DAC_REG31));
        let forced = log
            .iter()
            .filter(|w| w.reg == es8311::SYSTEM_REG11 && w.value == 0xFF)
            .count();
        assert_eq!(forced, 5);
    }

    #[test]
    fn failed_force_writes_leave_path_degraded() {
        let sim = SimulatedCodecBus::new();
        sim.stick_bits_low(0x18, es8311::SYSTEM_REG11, 0x80);
        sim.fail_value_writes(0x18, es8311::SYSTEM_REG11, 0xFF);
        let mut codec = handle(&sim);
        let err = codec.init(CodecRole::Playback, 44_100).unwrap_err();

        assert!(matches!(
            err,
            CodecError::PathNotEnabled { register: 0x11, .. }
        ));
        assert!(err.is_degraded());
        assert!(codec.is_initialized());
        assert!(!sim
            .writes()
            .iter()
            .any(|w| w.reg == es8311::SYSTEM_REG11 && w.value == 0xFF));
    }

    #[test]
    fn write_failure_is_fatal_for_the_call() {
        let sim = SimulatedCodecBus::new();
        sim.fail_writes_to(0x40, es7210::CLOCK_ON_REG08);
        let mut codec = handle(&sim);
        let err = codec.init(CodecRole::Capture, 16_000).unwrap_err();
        assert!(matches!(
            err,
            CodecError::RegisterWrite { register: 0x08, .. }
        ));
        assert!(!err.is_degraded());
        assert!(!codec.is_initialized());
    }

    #[test]
    fn unsupported_rate_touches_no_registers() {
        let sim = SimulatedCodecBus::new();
        let mut codec = handle(&sim);
        assert_eq!(
            codec.init(CodecRole::Playback, 12_000),
            Err(CodecError::UnsupportedSampleRate(12_000))
        );
        assert!(sim.writes().is_empty());
    }

    #[test]
    fn reconfigure_requires_init() {
        let sim = SimulatedCodecBus::new();
        let mut codec = handle(&sim);
        assert_eq!(
            codec.reconfigure_sample_rate(16_000),
            Err(CodecError::NotInitialized)
        );
    }

    #[test]
    fn reconfigure_same_rate_is_idempotent() {
        for &rate in &SUPPORTED_SAMPLE_RATES {
            let sim = SimulatedCodecBus::new();
            let mut codec = handle(&sim);
            codec.init(CodecRole::Playback, 44_100).unwrap();

            sim.clear_log();
            codec.reconfigure_sample_rate(rate).unwrap();
            let first = sim.writes();
            sim.clear_log();
            codec.reconfigure_sample_rate(rate).unwrap();
            let second = sim.writes();

            assert!(!first.is_empty());
            assert_eq!(first, second, "rate {rate}");
            assert_eq!(codec.sample_rate(), Some(rate));
        }
    }

    #[test]
    fn power_down_mutes_and_drops_amplifier() {
        let sim = SimulatedCodecBus::new();
        let mut codec = handle(&sim);
        codec.init(CodecRole::Playback, 44_100).unwrap();
        codec.power_down().unwrap();
        assert!(!sim.amplifier_enabled());
        assert_eq!(sim.register(0x18, es8311::DAC_REG31), Some(es8311::DAC_MUTE));
        assert!(!codec.is_initialized());
    }
}
