//! oneM2M "create contentInstance" request published for every measurement.

use crate::config::DeviceDescriptor;
use crate::errors::Result;
use crate::generator::{RandomValueGenerator, ValueSource};
use serde::{Deserialize, Serialize};

/// Originator identity stamped on every request.
pub const SENDER_ID: &str = "SiotTestAE";
/// Fixed part of the request identifier, followed by `-<sequence>`.
pub const REQUEST_ID_PREFIX: &str = "472c-9d83-e22bx23";

const OP_CREATE: u8 = 1;
const TY_CONTENT_INSTANCE: u8 = 4;
const SEC_NONE: u8 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentInstance {
    pub con: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveContent {
    #[serde(rename = "m2m:cin")]
    pub cin: ContentInstance,
}

/// Wire shape of one measurement request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    #[serde(rename = "fr")]
    pub from: String,
    #[serde(rename = "rqi")]
    pub correlation_id: String,
    pub pc: PrimitiveContent,
    pub op: u8,
    pub ty: u8,
    pub sec: u8,
}

impl OutboundMessage {
    pub fn value(&self) -> f64 {
        self.pc.cin.con
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

pub fn correlation_id(sequence: u64) -> String {
    format!("{}-{}", REQUEST_ID_PREFIX, sequence)
}

/// Recovers the sequence number from a request identifier.
pub fn sequence_of(correlation_id: &str) -> Option<u64> {
    correlation_id
        .strip_prefix(REQUEST_ID_PREFIX)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

/// Builds measurement requests for one device loop.
#[derive(Debug)]
pub struct MeasurementMessageBuilder<V = RandomValueGenerator> {
    source: V,
}

impl MeasurementMessageBuilder<RandomValueGenerator> {
    pub fn new() -> Self {
        Self::with_source(RandomValueGenerator::new())
    }
}

impl Default for MeasurementMessageBuilder<RandomValueGenerator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: ValueSource> MeasurementMessageBuilder<V> {
    pub fn with_source(source: V) -> Self {
        Self { source }
    }

    pub fn build(&mut self, device: &DeviceDescriptor, sequence: u64) -> OutboundMessage {
        OutboundMessage {
            to: device.address(),
            from: SENDER_ID.to_string(),
            correlation_id: correlation_id(sequence),
            pc: PrimitiveContent {
                cin: ContentInstance {
                    con: self.source.generate(device.min, device.max),
                },
            },
            op: OP_CREATE,
            ty: TY_CONTENT_INSTANCE,
            sec: SEC_NONE,
        }
    }
}
