//! Renogy charge controller register map

use van_core::OperatingState;

use crate::error::ProtocolError;

/// First register of the block read every poll
pub const BLOCK_START: u16 = 0x0100;
/// Registers 0x0100..=0x0122
pub const BLOCK_LEN: u16 = 35;

const BATTERY_VOLTAGE: u16 = 0x0101;
const CHARGING_CURRENT: u16 = 0x0102;
const CHARGING_POWER: u16 = 0x0109;
const CHARGING_STATE: u16 = 0x0120;
const FAULT_HIGH: u16 = 0x0121;
const FAULT_LOW: u16 = 0x0122;

/// Charging state reported in the low byte of 0x0120
pub fn charging_state(raw: u8, faults: u32) -> OperatingState {
    if faults != 0 {
        return OperatingState::Fault;
    }
    match raw {
        // deactivated, activated
        0 | 1 => OperatingState::Idle,
        // mppt, equalizing, boost, floating, current limiting
        2..=6 => OperatingState::Charging,
        _ => OperatingState::Unknown,
    }
}

/// One decoded poll of the controller
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerReading {
    pub battery_voltage: f64,
    pub charging_current: f64,
    pub charging_power: f64,
    pub charging_state: u8,
    pub faults: u32,
}

impl ControllerReading {
    /// Decode a block that starts at [`BLOCK_START`]
    pub fn from_registers(registers: &[u16]) -> Result<Self, ProtocolError> {
        if registers.len() < usize::from(BLOCK_LEN) {
            return Err(ProtocolError::TooShort {
                expected: usize::from(BLOCK_LEN),
                actual: registers.len(),
            });
        }
        let reg = |address: u16| registers[usize::from(address - BLOCK_START)];

        Ok(Self {
            battery_voltage: f64::from(reg(BATTERY_VOLTAGE)) * 0.1,
            charging_current: f64::from(reg(CHARGING_CURRENT)) * 0.01,
            charging_power: f64::from(reg(CHARGING_POWER)),
            charging_state: (reg(CHARGING_STATE) & 0x00FF) as u8,
            faults: (u32::from(reg(FAULT_HIGH)) << 16) | u32::from(reg(FAULT_LOW)),
        })
    }

    pub fn state(&self) -> OperatingState {
        charging_state(self.charging_state, self.faults)
    }

    /// Inverse of [`Self::from_registers`], for simulators and fixtures
    pub fn to_registers(&self) -> Vec<u16> {
        let mut registers = vec![0u16; usize::from(BLOCK_LEN)];
        let mut set = |address: u16, value: u16| {
            registers[usize::from(address - BLOCK_START)] = value;
        };
        set(BATTERY_VOLTAGE, (self.battery_voltage * 10.0).round() as u16);
        set(CHARGING_CURRENT, (self.charging_current * 100.0).round() as u16);
        set(CHARGING_POWER, self.charging_power.round() as u16);
        set(CHARGING_STATE, u16::from(self.charging_state));
        set(FAULT_HIGH, (self.faults >> 16) as u16);
        set(FAULT_LOW, (self.faults & 0xFFFF) as u16);
        registers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Vec<u16> {
        let mut regs = vec![0u16; BLOCK_LEN as usize];
        regs[0x01] = 133; // 13.3 V
        regs[0x02] = 1250; // 12.5 A
        regs[0x09] = 166;
        regs[0x20] = 0x0002;
        regs
    }

    #[test]
    fn test_decode_block() {
        let reading = ControllerReading::from_registers(&block()).unwrap();
        assert!((reading.battery_voltage - 13.3).abs() < 1e-9);
        assert!((reading.charging_current - 12.5).abs() < 1e-9);
        assert_eq!(reading.charging_power, 166.0);
        assert_eq!(reading.state(), OperatingState::Charging);
    }

    #[test]
    fn test_high_byte_of_state_ignored() {
        let mut regs = block();
        regs[0x20] = 0x8001;
        let reading = ControllerReading::from_registers(&regs).unwrap();
        assert_eq!(reading.state(), OperatingState::Idle);
    }

    #[test]
    fn test_fault_bits_win() {
        let mut regs = block();
        regs[0x22] = 0x0010;
        let reading = ControllerReading::from_registers(&regs).unwrap();
        assert_eq!(reading.faults, 0x10);
        assert_eq!(reading.state(), OperatingState::Fault);
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(charging_state(0, 0), OperatingState::Idle);
        assert_eq!(charging_state(4, 0), OperatingState::Charging);
        assert_eq!(charging_state(6, 0), OperatingState::Charging);
        assert_eq!(charging_state(9, 0), OperatingState::Unknown);
        assert_eq!(charging_state(2, 1 << 20), OperatingState::Fault);
    }

    #[test]
    fn test_short_block_rejected() {
        assert!(matches!(
            ControllerReading::from_registers(&[0u16; 10]),
            Err(ProtocolError::TooShort { expected: 35, actual: 10 })
        ));
    }

    #[test]
    fn test_to_registers_matches_layout() {
        let reading = ControllerReading::from_registers(&block()).unwrap();
        assert_eq!(reading.to_registers(), block());
    }
}
