//! ES7210 capture ADC register sequences.

use super::profile::{ClockParams, RegisterOp};
use super::{ChipSequence, VerifyStep};

pub const CHIP: &str = "ES7210";

pub const RESET_REG00: u8 = 0x00;
pub const CLOCK_ON_REG08: u8 = 0x08;
pub const MASTER_CLK_REG09: u8 = 0x09;
pub const ADC_MCLK_REG0A: u8 = 0x0A;
pub const ADC_SAMPLE_REG0C: u8 = 0x0C;
pub const MIC_SELECT_REG0D: u8 = 0x0D;
pub const ADC_DIGITAL_REG0E: u8 = 0x0E;
pub const ADC_CTRL_REG10: u8 = 0x10;
pub const CHIP_ID_REGFD: u8 = 0xFD;

pub const MIC_SELECT_ALL: u8 = 0x0F;
pub const ADC_ENABLE: u8 = 0x01;

/// ADC clock is MCLK divided down to 32 × fs.
const ADC_CLOCK_FS_RATIO: u32 = 32;

pub fn sequence() -> ChipSequence {
    ChipSequence {
        chip: CHIP,
        id_registers: &[CHIP_ID_REGFD],
        open: vec![
            RegisterOp::write(RESET_REG00, 0xFF).settle_ms(10),
            RegisterOp::write(RESET_REG00, 0x00).settle_ms(10),
        ],
        configure: vec![
            RegisterOp::write(CLOCK_ON_REG08, 0xFF),
            RegisterOp::write(MIC_SELECT_REG0D, MIC_SELECT_ALL),
        ],
        path: vec![
            RegisterOp::write(ADC_DIGITAL_REG0E, 0x01),
            RegisterOp::write(ADC_CTRL_REG10, ADC_ENABLE).settle_ms(50),
        ],
        verify: Some(VerifyStep {
            reg: ADC_CTRL_REG10,
            mask: ADC_ENABLE,
            force_value: ADC_ENABLE,
            working_value: ADC_ENABLE,
        }),
        finish: Vec::new(),
        unmute: Vec::new(),
        uses_amplifier: false,
        power_down: vec![RegisterOp::write(ADC_CTRL_REG10, 0x00)],
    }
}

pub fn clock_ops(clock: &ClockParams) -> Vec<RegisterOp> {
    let adc_mclk_div = (clock.mclk_hz / clock.sample_rate / ADC_CLOCK_FS_RATIO) as u8;
    vec![
        // Bit 7 selects the internally multiplied clock.
        RegisterOp::update(
            MASTER_CLK_REG09,
            0x7F,
            if clock.pre_multi > 1 { 0x80 } else { 0x00 },
        ),
        RegisterOp::write(ADC_MCLK_REG0A, adc_mclk_div),
        RegisterOp::update(ADC_SAMPLE_REG0C, 0xFE, clock.fs_mode & 0x01),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MclkSource;

    #[test]
    fn adc_divider_matches_power_on_default() {
        let clock = ClockParams::derive(16_000, MclkSource::FromBitClock).unwrap();
        let ops = clock_ops(&clock);
        assert_eq!(ops[1], RegisterOp::write(ADC_MCLK_REG0A, 0x08));
    }

    #[test]
    fn reset_is_pulsed() {
        let seq = sequence();
        assert_eq!(seq.open.len(), 2);
        assert!(seq.open.iter().all(|op| !op.settle().is_zero()));
    }
}
