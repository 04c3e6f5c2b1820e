use bytes::Bytes;
use thiserror::Error;

/// Rejected attempt to build a record from an empty payload
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("record payload must not be empty")]
pub struct InvalidRecord;

/// One serialized event waiting to be written to the bulk sink.
///
/// The payload is opaque: nothing downstream of the enricher parses it.
/// Cloning is cheap since the bytes are reference counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingRecord(Bytes);

impl PendingRecord {
    /// Wrap a payload, rejecting empty ones
    pub fn new(payload: impl Into<Bytes>) -> Result<Self, InvalidRecord> {
        let payload = payload.into();
        if payload.is_empty() {
            return Err(InvalidRecord);
        }
        Ok(Self(payload))
    }

    /// Newline-terminate a serialized line; the terminator keeps it non-empty
    pub fn from_line(mut line: String) -> Self {
        line.push('\n');
        Self(Bytes::from(line))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl TryFrom<Bytes> for PendingRecord {
    type Error = InvalidRecord;

    fn try_from(payload: Bytes) -> Result<Self, Self::Error> {
        Self::new(payload)
    }
}

impl TryFrom<String> for PendingRecord {
    type Error = InvalidRecord;

    fn try_from(payload: String) -> Result<Self, Self::Error> {
        Self::new(payload)
    }
}

impl TryFrom<&'static str> for PendingRecord {
    type Error = InvalidRecord;

    fn try_from(payload: &'static str) -> Result<Self, Self::Error> {
        Self::new(payload)
    }
}

impl AsRef<[u8]> for PendingRecord {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
