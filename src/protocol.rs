use bytes::Buf;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{FitlinkError, Result},
    types::{Measurement, Role, SensorKind},
    HEART_RATE_MEASUREMENT_CHAR_UUID, RQ_CHAR_UUID, VCO2_CHAR_UUID, VO2_CHAR_UUID,
};

/// Value written to a Client Characteristic Configuration Descriptor to enable notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Heart-rate flag bit selecting a 16-bit measurement field
pub const HEART_RATE_VALUE_FORMAT_U16: u8 = 0x01;

/// Layout of a characteristic's notification payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// Flag byte followed by a `u8` or little-endian `u16` value
    HeartRateMeasurement,
    /// One little-endian IEEE-754 single-precision float
    Float32Le,
}

impl PayloadShape {
    /// Smallest payload that can carry a value
    #[must_use]
    pub const fn min_len(self) -> usize {
        match self {
            Self::HeartRateMeasurement => 2,
            Self::Float32Le => 4,
        }
    }
}

/// A known characteristic and how to decode it
#[derive(Debug, Clone, Copy)]
pub struct CharacteristicDescriptor {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Sensor this characteristic belongs to
    pub sensor: SensorKind,
    /// What the characteristic measures
    pub role: Role,
    /// Expected payload layout
    pub shape: PayloadShape,
}

impl CharacteristicDescriptor {
    /// Decode a payload from this characteristic
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::MalformedPayload`] when the payload is too short
    /// for the characteristic's shape.
    pub fn decode(&self, payload: &[u8]) -> Result<Measurement> {
        let malformed = || FitlinkError::MalformedPayload {
            characteristic: self.uuid,
            len: payload.len(),
        };

        match self.shape {
            PayloadShape::HeartRateMeasurement => decode_heart_rate(payload)
                .map(Measurement::HeartRate)
                .ok_or_else(malformed),
            PayloadShape::Float32Le => {
                let value = decode_f32_le(payload).ok_or_else(malformed)?;
                Ok(match self.role {
                    Role::Vo2 => Measurement::Vo2(value),
                    Role::Vco2 => Measurement::Vco2(value),
                    Role::Rq => Measurement::Rq(value),
                    Role::HeartRateMeasurement => return Err(malformed()),
                })
            }
        }
    }
}

/// Every characteristic this crate subscribes to
pub static CHARACTERISTICS: [CharacteristicDescriptor; 4] = [
    CharacteristicDescriptor {
        uuid: HEART_RATE_MEASUREMENT_CHAR_UUID,
        sensor: SensorKind::HeartRate,
        role: Role::HeartRateMeasurement,
        shape: PayloadShape::HeartRateMeasurement,
    },
    CharacteristicDescriptor {
        uuid: VO2_CHAR_UUID,
        sensor: SensorKind::Vo2Max,
        role: Role::Vo2,
        shape: PayloadShape::Float32Le,
    },
    CharacteristicDescriptor {
        uuid: VCO2_CHAR_UUID,
        sensor: SensorKind::Vo2Max,
        role: Role::Vco2,
        shape: PayloadShape::Float32Le,
    },
    CharacteristicDescriptor {
        uuid: RQ_CHAR_UUID,
        sensor: SensorKind::Vo2Max,
        role: Role::Rq,
        shape: PayloadShape::Float32Le,
    },
];

/// Characteristics a sensor kind subscribes to, in subscription order
#[must_use]
pub fn descriptors_for(kind: SensorKind) -> &'static [CharacteristicDescriptor] {
    match kind {
        SensorKind::HeartRate => &CHARACTERISTICS[..1],
        SensorKind::Vo2Max => &CHARACTERISTICS[1..],
    }
}

/// Look up a characteristic by UUID
#[must_use]
pub fn lookup(uuid: Uuid) -> Option<&'static CharacteristicDescriptor> {
    CHARACTERISTICS.iter().find(|d| d.uuid == uuid)
}

/// Look up one of `kind`'s own characteristics by UUID
#[must_use]
pub fn lookup_for(kind: SensorKind, uuid: Uuid) -> Option<&'static CharacteristicDescriptor> {
    descriptors_for(kind).iter().find(|d| d.uuid == uuid)
}

/// Decode a notification, reporting why a frame was rejected
///
/// # Errors
///
/// Returns [`FitlinkError::UnknownCharacteristic`] for UUIDs outside the
/// descriptor table and [`FitlinkError::MalformedPayload`] for short frames.
pub fn try_decode(characteristic: Uuid, payload: &[u8]) -> Result<Measurement> {
    lookup(characteristic)
        .ok_or(FitlinkError::UnknownCharacteristic(characteristic))?
        .decode(payload)
}

/// Decode a notification; `None` means the frame is dropped
#[must_use]
pub fn decode(characteristic: Uuid, payload: &[u8]) -> Option<Measurement> {
    keep_or_drop(try_decode(characteristic, payload), payload)
}

/// Decode a notification received by a `kind` session
///
/// Frames from characteristics `kind` does not subscribe to are dropped.
#[must_use]
pub fn decode_for(kind: SensorKind, characteristic: Uuid, payload: &[u8]) -> Option<Measurement> {
    let decoded = lookup_for(kind, characteristic)
        .ok_or(FitlinkError::UnknownCharacteristic(characteristic))
        .and_then(|descriptor| descriptor.decode(payload));
    keep_or_drop(decoded, payload)
}

fn keep_or_drop(decoded: Result<Measurement>, payload: &[u8]) -> Option<Measurement> {
    match decoded {
        Ok(measurement) => Some(measurement),
        Err(e) => {
            debug!("Dropping frame {:02X?}: {}", payload, e);
            None
        }
    }
}

/// Decode a heart-rate measurement value
///
/// Only the value-format bit of the flag byte is interpreted. Sensor contact,
/// energy expended and RR intervals are ignored.
#[must_use]
pub fn decode_heart_rate(payload: &[u8]) -> Option<u16> {
    let mut buf = payload;
    if buf.remaining() < PayloadShape::HeartRateMeasurement.min_len() {
        return None;
    }

    let flags = buf.get_u8();
    if flags & HEART_RATE_VALUE_FORMAT_U16 != 0 {
        if buf.remaining() < 2 {
            return None;
        }
        Some(buf.get_u16_le())
    } else {
        Some(u16::from(buf.get_u8()))
    }
}

/// Decode a little-endian `f32` from the first four bytes
#[must_use]
pub fn decode_f32_le(payload: &[u8]) -> Option<f32> {
    let mut buf = payload;
    if buf.remaining() < PayloadShape::Float32Le.min_len() {
        return None;
    }
    Some(buf.get_f32_le())
}
