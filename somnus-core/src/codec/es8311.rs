//! ES8311 playback DAC register sequences.

use super::profile::{ClockParams, MclkSource, RegisterOp};
use super::{ChipSequence, VerifyStep};
use crate::config::CodecConfig;

pub const CHIP: &str = "ES8311";

pub const RESET_REG00: u8 = 0x00;
pub const CLK_MANAGER_REG01: u8 = 0x01;
pub const CLK_MANAGER_REG02: u8 = 0x02;
pub const CLK_MANAGER_REG03: u8 = 0x03;
pub const CLK_MANAGER_REG04: u8 = 0x04;
pub const CLK_MANAGER_REG05: u8 = 0x05;
pub const CLK_MANAGER_REG06: u8 = 0x06;
pub const CLK_MANAGER_REG07: u8 = 0x07;
pub const CLK_MANAGER_REG08: u8 = 0x08;
pub const SDPIN_REG09: u8 = 0x09;
pub const SDPOUT_REG0A: u8 = 0x0A;
pub const SYSTEM_REG0B: u8 = 0x0B;
pub const SYSTEM_REG0C: u8 = 0x0C;
pub const SYSTEM_REG0D: u8 = 0x0D;
pub const SYSTEM_REG0E: u8 = 0x0E;
pub const SYSTEM_REG0F: u8 = 0x0F;
pub const SYSTEM_REG10: u8 = 0x10;
pub const SYSTEM_REG11: u8 = 0x11;
pub const SYSTEM_REG12: u8 = 0x12;
pub const SYSTEM_REG13: u8 = 0x13;
pub const SYSTEM_REG14: u8 = 0x14;
pub const ADC_REG15: u8 = 0x15;
pub const ADC_REG16: u8 = 0x16;
pub const ADC_REG17: u8 = 0x17;
pub const ADC_REG1B: u8 = 0x1B;
pub const ADC_REG1C: u8 = 0x1C;
pub const DAC_REG31: u8 = 0x31;
pub const DAC_REG32: u8 = 0x32;
pub const DAC_REG37: u8 = 0x37;
pub const GPIO_REG44: u8 = 0x44;
pub const GP_REG45: u8 = 0x45;
pub const CHIP_ID1_REGFD: u8 = 0xFD;
pub const CHIP_ID2_REGFE: u8 = 0xFE;

/// REG0F: speaker output routed, headphone output off.
pub const PATH_SPEAKER_ONLY: u8 = 0x0C;
/// REG11 bit 7: output stage enabled.
pub const OUTPUT_ENABLE_BIT: u8 = 0x80;
/// REG09/REG0A: I2S framing, 16-bit words.
pub const SDP_I2S_16BIT: u8 = 0x0C;
/// REG31 bits 6:5: soft mute.
pub const DAC_MUTE: u8 = 0x60;

pub fn sequence(config: &CodecConfig) -> ChipSequence {
    ChipSequence {
        chip: CHIP,
        id_registers: &[CHIP_ID1_REGFD, CHIP_ID2_REGFE],
        open: open_ops(config.mclk_source),
        configure: configure_ops(),
        path: path_ops(config.output_volume),
        verify: Some(VerifyStep {
            reg: SYSTEM_REG11,
            mask: OUTPUT_ENABLE_BIT,
            force_value: 0xFF,
            working_value: config.output_volume,
        }),
        finish: finish_ops(config.dac_volume),
        unmute: vec![RegisterOp::write(DAC_REG31, 0x00).settle_ms(20)],
        uses_amplifier: true,
        power_down: vec![
            RegisterOp::write(DAC_REG31, DAC_MUTE).settle_ms(10),
            RegisterOp::write(SYSTEM_REG0F, 0x00),
            RegisterOp::write(SYSTEM_REG11, 0x00),
        ],
    }
}

/// Noise immunity, clock manager defaults, reset, clock source.
fn open_ops(mclk_source: MclkSource) -> Vec<RegisterOp> {
    let clock_source = match mclk_source {
        MclkSource::External => 0x3F,
        MclkSource::FromBitClock => 0xBF,
    };
    vec![
        // Written twice; the first write can be lost while the bus settles.
        RegisterOp::write(GPIO_REG44, 0x08).settle_ms(5),
        RegisterOp::write(GPIO_REG44, 0x08).settle_ms(5),
        RegisterOp::write(CLK_MANAGER_REG01, 0x30).settle_ms(5),
        RegisterOp::write(CLK_MANAGER_REG02, 0x00).settle_ms(5),
        RegisterOp::write(CLK_MANAGER_REG03, 0x10).settle_ms(5),
        RegisterOp::write(ADC_REG16, 0x24).settle_ms(5),
        RegisterOp::write(CLK_MANAGER_REG04, 0x10).settle_ms(5),
        RegisterOp::write(CLK_MANAGER_REG05, 0x00).settle_ms(10),
        RegisterOp::write(SYSTEM_REG0B, 0x00),
        RegisterOp::write(SYSTEM_REG0C, 0x00),
        RegisterOp::write(SYSTEM_REG10, 0x00),
        // Reset, slave mode. Writes issued before the settle are ignored.
        RegisterOp::write(RESET_REG00, 0x80).settle_ms(20),
        RegisterOp::write(CLK_MANAGER_REG01, clock_source),
    ]
}

pub fn clock_ops(clock: &ClockParams) -> Vec<RegisterOp> {
    let pre_div = clock.pre_div.saturating_sub(1) & 0x07;
    let adc_div = clock.adc_div.saturating_sub(1) & 0x0F;
    let dac_div = clock.dac_div.saturating_sub(1) & 0x0F;
    vec![
        RegisterOp::update(
            CLK_MANAGER_REG02,
            0x07,
            (pre_div << 5) | ((clock.pre_multi_code & 0x03) << 3),
        ),
        RegisterOp::write(CLK_MANAGER_REG05, (adc_div << 4) | dac_div),
        RegisterOp::update(
            CLK_MANAGER_REG03,
            0x80,
            ((clock.fs_mode & 0x01) << 6) | (clock.adc_osr & 0x3F),
        ),
        RegisterOp::update(CLK_MANAGER_REG04, 0x80, clock.dac_osr & 0x7F),
        RegisterOp::update(
            CLK_MANAGER_REG07,
            0xC0,
            ((clock.lrck_div >> 8) & 0x0F) as u8,
        ),
        RegisterOp::write(CLK_MANAGER_REG08, (clock.lrck_div & 0xFF) as u8),
        RegisterOp::update(
            CLK_MANAGER_REG06,
            0xE0,
            clock.bclk_div.saturating_sub(1) & 0x1F,
        ),
    ]
}

/// Serial data port framing, then system power-up.
fn configure_ops() -> Vec<RegisterOp> {
    vec![
        // Clearing bit 6 enables the DAC side of the port.
        RegisterOp::update(SDPIN_REG09, 0xBF, SDP_I2S_16BIT),
        RegisterOp::update(SDPOUT_REG0A, 0xBF, SDP_I2S_16BIT),
        RegisterOp::write(ADC_REG17, 0xBF),
        RegisterOp::write(SYSTEM_REG0E, 0x02),
        RegisterOp::write(SYSTEM_REG12, 0x00),
        RegisterOp::write(SYSTEM_REG14, 0x1A),
        RegisterOp::write(SYSTEM_REG0D, 0x01).settle_ms(20),
    ]
}

/// Disable all paths, route speaker, enable output stage.
fn path_ops(output_volume: u8) -> Vec<RegisterOp> {
    vec![
        RegisterOp::write(SYSTEM_REG0F, 0x00).settle_ms(10),
        RegisterOp::write(SYSTEM_REG0F, PATH_SPEAKER_ONLY).settle_ms(10),
        RegisterOp::write(SYSTEM_REG11, OUTPUT_ENABLE_BIT).settle_ms(10),
        RegisterOp::write(SYSTEM_REG11, output_volume | OUTPUT_ENABLE_BIT).settle_ms(10),
    ]
}

fn finish_ops(dac_volume: u8) -> Vec<RegisterOp> {
    vec![
        RegisterOp::write(ADC_REG15, 0x40),
        // DAC ramp rate
        RegisterOp::write(DAC_REG37, 0x08),
        RegisterOp::write(GP_REG45, 0x00),
        RegisterOp::write(DAC_REG32, dac_volume),
        RegisterOp::write(SYSTEM_REG13, 0x30),
        RegisterOp::write(ADC_REG1B, 0x0A),
        RegisterOp::write(ADC_REG1C, 0x6A),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_ops_for_bit_clock_source() {
        let clock = ClockParams::derive(44_100, MclkSource::FromBitClock).unwrap();
        let ops = clock_ops(&clock);
        assert_eq!(ops[0], RegisterOp::update(CLK_MANAGER_REG02, 0x07, 0x18));
        assert_eq!(ops[1], RegisterOp::write(CLK_MANAGER_REG05, 0x00));
        assert_eq!(ops[2], RegisterOp::update(CLK_MANAGER_REG03, 0x80, 0x10));
        assert_eq!(ops[3], RegisterOp::update(CLK_MANAGER_REG04, 0x80, 0x10));
        assert_eq!(ops[4], RegisterOp::update(CLK_MANAGER_REG07, 0xC0, 0x00));
        assert_eq!(ops[5], RegisterOp::write(CLK_MANAGER_REG08, 0xFF));
        assert_eq!(ops[6], RegisterOp::update(CLK_MANAGER_REG06, 0xE0, 0x03));
    }

    #[test]
    fn reset_is_followed_by_settle_delay() {
        let ops = open_ops(MclkSource::FromBitClock);
        let reset = ops
            .iter()
            .find(|op| matches!(op, RegisterOp::Write { reg: RESET_REG00, .. }))
            .unwrap();
        assert!(reset.settle() >= std::time::Duration::from_millis(20));
        assert_eq!(
            ops.last(),
            Some(&RegisterOp::write(CLK_MANAGER_REG01, 0xBF))
        );
    }

    #[test]
    fn path_disables_before_enabling() {
        let ops = path_ops(0xE0);
        let regs: Vec<(u8, u8)> = ops
            .iter()
            .map(|op| match *op {
                RegisterOp::Write { reg, value, .. } => (reg, value),
                RegisterOp::Update { reg, bits, .. } => (reg, bits),
            })
            .collect();
        assert_eq!(
            regs,
            vec![
                (SYSTEM_REG0F, 0x00),
                (SYSTEM_REG0F, PATH_SPEAKER_ONLY),
                (SYSTEM_REG11, 0x80),
                (SYSTEM_REG11, 0xE0),
            ]
        );
    }
}
