use serde::{Deserialize, Serialize};

use crate::error::LogResult;

/// Width of the big-endian length prefix in front of every stored record.
pub const LEN_WIDTH: usize = 8;

/// Entry kind for ordinary data records.
pub const RECORD_TYPE_DATA: u32 = 0;

/// A single log record. `offset` is assigned by the log on append.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub value: Vec<u8>,
    pub offset: u64,
    pub term: u64,
    #[serde(rename = "type")]
    pub record_type: u32,
}

impl Record {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_term(mut self, term: u64, record_type: u32) -> Self {
        self.term = term;
        self.record_type = record_type;
        self
    }

    pub fn encode(&self) -> LogResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> LogResult<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
