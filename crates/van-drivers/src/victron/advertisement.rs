//! Victron Instant Readout advertisement decoding
//!
//! Manufacturer data (company id `0x02E1`) layout, after the company id:
//!
//! | bytes | field                                   |
//! |-------|-----------------------------------------|
//! | 0-1   | record prefix, byte 0 is `0x10`         |
//! | 2-3   | model id (LE)                           |
//! | 4     | readout type                            |
//! | 5-6   | nonce / data counter (LE)               |
//! | 7     | first byte of the device key            |
//! | 8..   | AES-128-CTR ciphertext                  |
//!
//! The CTR counter block is the nonce as a 128-bit little-endian integer.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{KeyIvInit, StreamCipher};
use van_core::{EncryptionKey, OperatingState};

use crate::error::ProtocolError;

type Aes128Ctr = ctr::Ctr128LE<aes::Aes128>;

/// Bluetooth SIG company identifier assigned to Victron Energy
pub const VICTRON_COMPANY_ID: u16 = 0x02E1;

/// Record prefix marking a product advertisement
const PRODUCT_ADVERTISEMENT: u8 = 0x10;

const HEADER_LEN: usize = 8;

/// Readout types carried in byte 4
pub mod readout {
    pub const SOLAR_CHARGER: u8 = 0x01;
    pub const DCDC_CONVERTER: u8 = 0x04;
}

/// Cleartext part of an advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisementHeader {
    pub model_id: u16,
    pub readout_type: u8,
    pub nonce: u16,
    pub key_check: u8,
}

/// Split an advertisement into its header and ciphertext
pub fn parse_header(data: &[u8]) -> Result<(AdvertisementHeader, &[u8]), ProtocolError> {
    if data.len() <= HEADER_LEN {
        return Err(ProtocolError::TooShort {
            expected: HEADER_LEN + 1,
            actual: data.len(),
        });
    }
    if data[0] != PRODUCT_ADVERTISEMENT {
        return Err(ProtocolError::UnexpectedPrefix(data[0]));
    }

    let header = AdvertisementHeader {
        model_id: u16::from_le_bytes([data[2], data[3]]),
        readout_type: data[4],
        nonce: u16::from_le_bytes([data[5], data[6]]),
        key_check: data[7],
    };
    Ok((header, &data[HEADER_LEN..]))
}

fn apply_keystream(key: &EncryptionKey, nonce: u16, buf: &mut [u8]) {
    let mut iv = [0u8; 16];
    iv[..2].copy_from_slice(&nonce.to_le_bytes());
    let mut cipher = Aes128Ctr::new(
        GenericArray::from_slice(key.as_bytes()),
        GenericArray::from_slice(&iv),
    );
    cipher.apply_keystream(buf);
}

/// Check the key byte and decrypt the record body
pub fn decrypt(
    data: &[u8],
    key: &EncryptionKey,
) -> Result<(AdvertisementHeader, Vec<u8>), ProtocolError> {
    let (header, ciphertext) = parse_header(data)?;
    if header.key_check != key.check_byte() {
        return Err(ProtocolError::KeyMismatch);
    }
    let mut plaintext = ciphertext.to_vec();
    apply_keystream(key, header.nonce, &mut plaintext);
    Ok((header, plaintext))
}

/// Build a complete advertisement around an encrypted record
///
/// Used by simulators and test fixtures.
pub fn encrypt_record(
    key: &EncryptionKey,
    model_id: u16,
    readout_type: u8,
    nonce: u16,
    plaintext: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + plaintext.len());
    frame.extend_from_slice(&[PRODUCT_ADVERTISEMENT, 0x02]);
    frame.extend_from_slice(&model_id.to_le_bytes());
    frame.push(readout_type);
    frame.extend_from_slice(&nonce.to_le_bytes());
    frame.push(key.check_byte());

    let mut body = plaintext.to_vec();
    apply_keystream(key, nonce, &mut body);
    frame.extend_from_slice(&body);
    frame
}

const NA_I16: i16 = 0x7FFF;
const NA_U16: u16 = 0xFFFF;

fn read_i16(buf: &[u8], at: usize, field: &'static str, scale: f64) -> Result<f64, ProtocolError> {
    let raw = i16::from_le_bytes([buf[at], buf[at + 1]]);
    if raw == NA_I16 {
        return Err(ProtocolError::InvalidField(field));
    }
    Ok(f64::from(raw) * scale)
}

fn read_u16(buf: &[u8], at: usize, field: &'static str, scale: f64) -> Result<f64, ProtocolError> {
    let raw = u16::from_le_bytes([buf[at], buf[at + 1]]);
    if raw == NA_U16 {
        return Err(ProtocolError::InvalidField(field));
    }
    Ok(f64::from(raw) * scale)
}

fn require_len(buf: &[u8], len: usize) -> Result<(), ProtocolError> {
    if buf.len() < len {
        Err(ProtocolError::TooShort {
            expected: len,
            actual: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Solar charger (MPPT) record
#[derive(Debug, Clone, PartialEq)]
pub struct SolarChargerRecord {
    pub device_state: u8,
    pub charger_error: u8,
    /// Volts, 0.01 V resolution
    pub battery_voltage: f64,
    /// Amps, 0.1 A resolution
    pub battery_current: f64,
    /// kWh, 0.01 kWh resolution
    pub yield_today: f64,
    /// Watts
    pub pv_power: f64,
}

impl SolarChargerRecord {
    const LEN: usize = 10;

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        require_len(buf, Self::LEN)?;
        Ok(Self {
            device_state: buf[0],
            charger_error: buf[1],
            battery_voltage: read_i16(buf, 2, "battery_voltage", 0.01)?,
            battery_current: read_i16(buf, 4, "battery_current", 0.1)?,
            yield_today: read_u16(buf, 6, "yield_today", 0.01)?,
            pv_power: read_u16(buf, 8, "pv_power", 1.0)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.device_state, self.charger_error];
        buf.extend_from_slice(&((self.battery_voltage * 100.0).round() as i16).to_le_bytes());
        buf.extend_from_slice(&((self.battery_current * 10.0).round() as i16).to_le_bytes());
        buf.extend_from_slice(&((self.yield_today * 100.0).round() as u16).to_le_bytes());
        buf.extend_from_slice(&(self.pv_power.round() as u16).to_le_bytes());
        buf
    }
}

/// DC/DC converter (Orion Smart) record
#[derive(Debug, Clone, PartialEq)]
pub struct DcDcRecord {
    pub device_state: u8,
    pub charger_error: u8,
    /// Volts, 0.01 V resolution
    pub input_voltage: f64,
    /// Volts, 0.01 V resolution
    pub output_voltage: f64,
    pub off_reason: u32,
}

impl DcDcRecord {
    const LEN: usize = 10;

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        require_len(buf, Self::LEN)?;
        Ok(Self {
            device_state: buf[0],
            charger_error: buf[1],
            input_voltage: read_u16(buf, 2, "input_voltage", 0.01)?,
            output_voltage: read_i16(buf, 4, "output_voltage", 0.01)?,
            off_reason: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.device_state, self.charger_error];
        buf.extend_from_slice(&((self.input_voltage * 100.0).round() as u16).to_le_bytes());
        buf.extend_from_slice(&((self.output_voltage * 100.0).round() as i16).to_le_bytes());
        buf.extend_from_slice(&self.off_reason.to_le_bytes());
        buf
    }
}

/// A decoded readout of one of the supported product families
#[derive(Debug, Clone, PartialEq)]
pub enum Readout {
    SolarCharger(SolarChargerRecord),
    DcDcConverter(DcDcRecord),
}

impl Readout {
    pub fn decode(readout_type: u8, plaintext: &[u8]) -> Result<Self, ProtocolError> {
        match readout_type {
            readout::SOLAR_CHARGER => SolarChargerRecord::decode(plaintext).map(Readout::SolarCharger),
            readout::DCDC_CONVERTER => DcDcRecord::decode(plaintext).map(Readout::DcDcConverter),
            other => Err(ProtocolError::UnsupportedRecord(other)),
        }
    }

    /// Battery-side voltage
    pub fn voltage(&self) -> f64 {
        match self {
            Readout::SolarCharger(r) => r.battery_voltage,
            Readout::DcDcConverter(r) => r.output_voltage,
        }
    }

    /// Battery-side current; DC/DC converters do not report it
    pub fn current(&self) -> f64 {
        match self {
            Readout::SolarCharger(r) => r.battery_current,
            Readout::DcDcConverter(_) => 0.0,
        }
    }

    /// Input power; DC/DC converters do not report it
    pub fn power(&self) -> f64 {
        match self {
            Readout::SolarCharger(r) => r.pv_power,
            Readout::DcDcConverter(_) => 0.0,
        }
    }

    pub fn state(&self) -> OperatingState {
        match self {
            Readout::SolarCharger(r) => operating_state(r.device_state, r.charger_error),
            Readout::DcDcConverter(r) => operating_state(r.device_state, r.charger_error),
        }
    }
}

/// Map a Victron device state and error code to the common state
pub fn operating_state(device_state: u8, charger_error: u8) -> OperatingState {
    if charger_error != 0 {
        return OperatingState::Fault;
    }
    match device_state {
        0 | 1 | 9 | 11 | 245 => OperatingState::Idle,
        2 => OperatingState::Fault,
        3..=7 | 247 | 252 => OperatingState::Charging,
        _ => OperatingState::Unknown,
    }
}

/// Decrypt and decode one advertisement
pub fn decode(data: &[u8], key: &EncryptionKey) -> Result<Readout, ProtocolError> {
    let (header, plaintext) = decrypt(data, key)?;
    Readout::decode(header.readout_type, &plaintext)
}
