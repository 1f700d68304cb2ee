//! Portable object records.
//!
//! An artifact is a YAML document stream: each record is one object followed
//! by a `---` line. Records carry `apiVersion` and `kind` so a reader can
//! pick the decode target, and have server-assigned bookkeeping removed so
//! they can be replayed into a different cluster.
//!
//! Volume sizes travel as strings. [`UntypedRecord::into_volume`] normalises
//! them to integers before the structured decode.

use std::io::{BufRead, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::model::{CLAIM_KIND, PersistentVolumeClaim, Resource, VOLUME_KIND, Volume};

/// Line separating records in an artifact.
pub const DOCUMENT_SEPARATOR: &str = "---";

/// Errors raised while writing or reading an artifact.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RecordError {
    /// Raised when an object cannot be serialized.
    #[error("failed to encode {kind} {name}: {message}")]
    Encode {
        /// Kind of the object.
        kind: String,
        /// Name of the object.
        name: String,
        /// Serializer error message.
        message: String,
    },
    /// Raised when the sink rejects a write.
    #[error("failed to write artifact: {0}")]
    Write(String),
    /// Raised when the source cannot be read.
    #[error("failed to read artifact: {0}")]
    Read(String),
    /// Raised when a document is not valid YAML.
    #[error("record {index} is not valid YAML: {message}")]
    Parse {
        /// Zero-based record position in the stream.
        index: usize,
        /// Parser error message.
        message: String,
    },
    /// Raised when a document has no `kind`.
    #[error("record {index} has no kind")]
    MissingKind {
        /// Zero-based record position in the stream.
        index: usize,
    },
    /// Raised when a document does not match its declared kind.
    #[error("record {index} ({kind} {name}) could not be decoded: {message}")]
    Decode {
        /// Zero-based record position in the stream.
        index: usize,
        /// Declared kind.
        kind: String,
        /// Declared name.
        name: String,
        /// Decoder error message.
        message: String,
    },
}

/// Removes server-assigned bookkeeping from `object` in place.
pub fn strip<T: Resource>(object: &mut T) {
    let metadata = object.metadata_mut();
    metadata.resource_version = None;
    metadata.managed_fields.clear();
    metadata.uid = None;
    metadata.creation_timestamp = None;
    metadata.generation = None;
    metadata.extra.remove("selfLink");
}

/// Appends records to a sink.
#[derive(Debug)]
pub struct RecordWriter<W: Write> {
    sink: W,
    written: usize,
}

impl<W: Write> RecordWriter<W> {
    /// Wraps `sink`.
    #[must_use]
    pub const fn new(sink: W) -> Self {
        Self { sink, written: 0 }
    }

    /// Tags and strips `object`, then appends it and a separator.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Encode`] when serialization fails or
    /// [`RecordError::Write`] when the sink rejects the bytes.
    pub fn write_record<T: Resource + Serialize>(&mut self, mut object: T) -> Result<(), RecordError> {
        object.tag();
        strip(&mut object);
        let document = serde_yaml::to_string(&object).map_err(|err| RecordError::Encode {
            kind: T::KIND.to_owned(),
            name: object.name().to_owned(),
            message: err.to_string(),
        })?;
        self.sink
            .write_all(document.as_bytes())
            .and_then(|()| writeln!(self.sink, "{DOCUMENT_SEPARATOR}"))
            .map_err(|err| RecordError::Write(err.to_string()))?;
        self.written += 1;
        Ok(())
    }

    /// Returns how many records have been written.
    #[must_use]
    pub const fn records_written(&self) -> usize {
        self.written
    }

    /// Flushes and returns the sink.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Write`] when flushing fails.
    pub fn finish(mut self) -> Result<W, RecordError> {
        self.sink
            .flush()
            .map_err(|err| RecordError::Write(err.to_string()))?;
        Ok(self.sink)
    }
}

/// One record read back from an artifact, not yet decoded.
#[derive(Clone, Debug, PartialEq)]
pub struct UntypedRecord {
    index: usize,
    kind: String,
    value: Value,
}

impl UntypedRecord {
    fn from_document(index: usize, document: &str) -> Result<Option<Self>, RecordError> {
        let value: Value = serde_yaml::from_str(document).map_err(|err| RecordError::Parse {
            index,
            message: err.to_string(),
        })?;
        if value.is_null() {
            return Ok(None);
        }
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .filter(|kind| !kind.is_empty())
            .ok_or(RecordError::MissingKind { index })?
            .to_owned();
        Ok(Some(Self { index, kind, value }))
    }

    /// Returns the zero-based position of the record in its stream.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Returns the kind discriminator.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns `metadata.name`, or an empty string.
    #[must_use]
    pub fn name(&self) -> &str {
        self.value
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Returns `metadata.namespace`, or an empty string.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.value
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Decodes a `Volume` record, normalising a string size to an integer
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Decode`] when the record is not a volume or
    /// its fields do not match the volume schema.
    pub fn into_volume(mut self) -> Result<Volume, RecordError> {
        self.expect_kind(VOLUME_KIND)?;
        self.normalise_size()?;
        self.decode()
    }

    /// Decodes a `PersistentVolumeClaim` record.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Decode`] when the record is not a claim or its
    /// fields do not match the claim schema.
    pub fn into_claim(self) -> Result<PersistentVolumeClaim, RecordError> {
        self.expect_kind(CLAIM_KIND)?;
        self.decode()
    }

    fn decode_error(&self, message: String) -> RecordError {
        RecordError::Decode {
            index: self.index,
            kind: self.kind.clone(),
            name: self.name().to_owned(),
            message,
        }
    }

    fn expect_kind(&self, expected: &str) -> Result<(), RecordError> {
        if self.kind == expected {
            return Ok(());
        }
        Err(self.decode_error(format!("expected kind {expected}")))
    }

    fn normalise_size(&mut self) -> Result<(), RecordError> {
        let parsed = match self.value.pointer("/spec/size") {
            Some(Value::String(text)) => text
                .trim()
                .parse::<u64>()
                .map_err(|err| self.decode_error(format!("invalid size {text:?}: {err}")))?,
            _ => return Ok(()),
        };
        if let Some(size) = self.value.pointer_mut("/spec/size") {
            *size = Value::from(parsed);
        }
        Ok(())
    }

    fn decode<T: DeserializeOwned>(self) -> Result<T, RecordError> {
        let Self { index, kind, value } = self;
        let name = value
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        serde_json::from_value(value).map_err(|err| RecordError::Decode {
            index,
            kind,
            name,
            message: err.to_string(),
        })
    }
}

/// Reads records lazily from a buffered source, one document at a time.
#[derive(Debug)]
pub struct RecordReader<R: BufRead> {
    source: R,
    next_index: usize,
    finished: bool,
}

impl<R: BufRead> RecordReader<R> {
    /// Wraps `source`.
    #[must_use]
    pub const fn new(source: R) -> Self {
        Self {
            source,
            next_index: 0,
            finished: false,
        }
    }

    /// Collects the next document, or `None` at end of input.
    fn next_document(&mut self) -> Result<Option<String>, RecordError> {
        let mut document = String::new();
        loop {
            let mut line = String::new();
            let read = self
                .source
                .read_line(&mut line)
                .map_err(|err| RecordError::Read(err.to_string()))?;
            if read == 0 {
                self.finished = true;
                break;
            }
            if line.trim_end() == DOCUMENT_SEPARATOR {
                if document.trim().is_empty() {
                    document.clear();
                    continue;
                }
                break;
            }
            document.push_str(&line);
        }
        if document.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(document))
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<UntypedRecord, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let document = match self.next_document() {
                Ok(Some(document)) => document,
                Ok(None) => return None,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            };
            let index = self.next_index;
            self.next_index += 1;
            match UntypedRecord::from_document(index, &document) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => {}
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests;
