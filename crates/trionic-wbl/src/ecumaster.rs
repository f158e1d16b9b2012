//! Ecumaster Lambda-to-CAN
//!
//! The module broadcasts two frames: 0x664 with supply, heater, temperature,
//! lambda and diagnostics, and 0x665 with the pump current, oxygen
//! concentration and sensor resistance.

use std::fmt;

use serde::Serialize;

use crate::error::{Result, WblError};

pub const PRODUCT: &str = "LAMBDA to CAN";

pub const STATUS_ID: u32 = 0x664;
pub const DETAIL_ID: u32 = 0x665;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum CalibrationState {
    Start,
    WaitSpiReset,
    Finished,
    Error,
    #[default]
    Unknown,
}

impl From<u8> for CalibrationState {
    fn from(v: u8) -> Self {
        match v {
            0 => CalibrationState::Start,
            1 => CalibrationState::WaitSpiReset,
            2 => CalibrationState::Finished,
            3 => CalibrationState::Error,
            _ => CalibrationState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum DeviceVersion {
    Lsu42,
    Lsu49,
    LsuAdv,
    #[default]
    Unknown,
}

impl From<u8> for DeviceVersion {
    fn from(v: u8) -> Self {
        match v {
            0 => DeviceVersion::Lsu42,
            1 => DeviceVersion::Lsu49,
            2 => DeviceVersion::LsuAdv,
            _ => DeviceVersion::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum HeaterState {
    LowPower,
    RampUp,
    Regulation,
    #[default]
    Unknown,
}

impl From<u8> for HeaterState {
    fn from(v: u8) -> Self {
        match v {
            2 => HeaterState::LowPower,
            4 => HeaterState::RampUp,
            7 => HeaterState::Regulation,
            _ => HeaterState::Unknown,
        }
    }
}

/// Everything the module reports
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LambdaToCanStatus {
    /// V
    pub supply_voltage: f64,
    /// % duty cycle
    pub heater_power: f64,
    /// °C
    pub sensor_temp: f64,
    pub lambda: f64,
    pub vm_short_vcc: bool,
    pub vm_short_gnd: bool,
    pub un_short_vcc: bool,
    pub un_short_gnd: bool,
    pub iaip_short_vcc: bool,
    pub iaip_short_gnd: bool,
    pub vub_low_voltage: bool,
    pub heater_short_vcc: bool,
    pub heater_short_gnd: bool,
    pub heater_open_load: bool,
    pub calibration_state: CalibrationState,
    pub device_version: DeviceVersion,
    /// mA
    pub ip_current: f64,
    /// %
    pub oxygen_conc: f64,
    /// Ohm
    pub resistance: f64,
    pub heater_state: HeaterState,
    pub lambda_valid: bool,
}

#[derive(Debug, Default)]
pub struct LambdaToCan {
    status: LambdaToCanStatus,
}

impl LambdaToCan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> &LambdaToCanStatus {
        &self.status
    }

    pub fn lambda(&self) -> f64 {
        self.status.lambda
    }

    pub(crate) fn set_lambda(&mut self, lambda: f64) {
        self.status.lambda = lambda;
    }

    pub fn decode(&mut self, id: u32, data: &[u8]) -> Result<()> {
        match id {
            STATUS_ID => self.decode_status(data),
            DETAIL_ID => self.decode_detail(data),
            other => Err(WblError::UnknownIdentifier(other)),
        }
    }

    fn decode_status(&mut self, data: &[u8]) -> Result<()> {
        check_len(data)?;
        let st = &mut self.status;
        st.supply_voltage = f64::from(u16::from_be_bytes([data[0], data[1]])) / 100.0;
        st.heater_power = f64::from(data[2]) / 255.0 * 100.0;
        st.sensor_temp = f64::from(data[3]) * 4.0;
        st.lambda = f64::from(u16::from_be_bytes([data[4], data[5]])) / 1000.0;

        let diag = data[7];
        st.vm_short_vcc = diag & 0x01 != 0;
        st.vm_short_gnd = diag & 0x02 != 0;
        st.un_short_vcc = diag & 0x04 != 0;
        st.un_short_gnd = diag & 0x08 != 0;
        st.iaip_short_vcc = diag & 0x10 != 0;
        st.iaip_short_gnd = diag & 0x20 != 0;
        st.vub_low_voltage = diag & 0x40 != 0;
        st.heater_short_vcc = diag & 0x80 != 0;

        let flags = data[6];
        st.heater_short_gnd = flags & 0x01 != 0;
        st.heater_open_load = flags & 0x02 != 0;
        st.calibration_state = CalibrationState::from((flags >> 2) & 0x07);
        st.device_version = DeviceVersion::from((flags >> 5) & 0x07);
        Ok(())
    }

    fn decode_detail(&mut self, data: &[u8]) -> Result<()> {
        check_len(data)?;
        let st = &mut self.status;
        st.ip_current = f64::from(i16::from_be_bytes([data[0], data[1]])) / 1000.0;
        st.oxygen_conc = f64::from(i16::from_be_bytes([data[2], data[3]])) / 100.0;
        st.resistance = f64::from(u16::from_be_bytes([data[4], data[5]])) / 10.0;
        st.heater_state = HeaterState::from(data[6]);
        st.lambda_valid = data[7] & 0x01 == 0x01;
        Ok(())
    }
}

fn check_len(data: &[u8]) -> Result<()> {
    if data.len() < 8 {
        return Err(WblError::DataTooShort {
            expected: 8,
            got: data.len(),
        });
    }
    Ok(())
}

impl fmt::Display for LambdaToCan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = &self.status;
        write!(
            f,
            "{:.2} V, heater {:.2} %, {} °C, λ {:.3}, {:?}, {:?}",
            st.supply_voltage, st.heater_power, st.sensor_temp, st.lambda, st.calibration_state, st.heater_state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_status_frame() {
        let mut wbl = LambdaToCan::new();
        wbl.decode(STATUS_ID, &[0x0B, 0xB6, 0x80, 0x28, 0x03, 0xE8, 0x08, 0x00])
            .unwrap();
        let st = wbl.status();
        assert!((st.supply_voltage - 29.98).abs() < 1e-9);
        assert!((st.heater_power - 50.196).abs() < 1e-3);
        assert_eq!(st.sensor_temp, 160.0);
        assert_eq!(wbl.lambda(), 1.0);
        assert_eq!(st.calibration_state, CalibrationState::Finished);
        assert_eq!(st.device_version, DeviceVersion::Lsu42);
        assert!(!st.vm_short_vcc);
    }

    #[test]
    fn test_diagnostic_bits() {
        let mut wbl = LambdaToCan::new();
        wbl.decode(STATUS_ID, &[0, 0, 0, 0, 0, 0, 0x23, 0x81]).unwrap();
        let st = wbl.status();
        assert!(st.vm_short_vcc && st.heater_short_vcc);
        assert!(st.heater_short_gnd && st.heater_open_load);
        assert_eq!(st.device_version, DeviceVersion::Lsu49);
    }

    #[test]
    fn test_decode_detail_frame() {
        let mut wbl = LambdaToCan::new();
        // -1.5 mA, 20.9 %, 300 Ohm, regulation, valid
        wbl.decode(DETAIL_ID, &[0xFA, 0x24, 0x08, 0x2A, 0x0B, 0xB8, 0x07, 0x01])
            .unwrap();
        let st = wbl.status();
        assert_eq!(st.ip_current, -1.5);
        assert_eq!(st.oxygen_conc, 20.9);
        assert_eq!(st.resistance, 300.0);
        assert_eq!(st.heater_state, HeaterState::Regulation);
        assert!(st.lambda_valid);
    }

    #[test]
    fn test_short_and_unknown_frames() {
        let mut wbl = LambdaToCan::new();
        assert_eq!(
            wbl.decode(STATUS_ID, &[0x0B, 0xB8]).unwrap_err(),
            WblError::DataTooShort { expected: 8, got: 2 }
        );
        assert_eq!(wbl.decode(0x123, &[0; 8]).unwrap_err(), WblError::UnknownIdentifier(0x123));
    }
}
