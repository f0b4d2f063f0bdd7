//! In-memory collaborators for transfer tests

use super::io::{ObjectReader, ObjectWriter};
use super::store::{ByteRange, CompletedPart, ObjectInfo, ObjectStore};
use super::TransferError;
use crate::transport::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// In-memory store. Later parts answer faster so completion order is
/// the reverse of dispatch order.
#[derive(Default)]
pub(crate) struct MemoryStore {
    pub object: Mutex<Vec<u8>>,
    pub parts: Mutex<HashMap<u32, Bytes>>,
    pub fail_parts: Mutex<HashMap<u32, (u32, u16)>>,
    pub calls: Mutex<Vec<String>>,
    pub completed_order: Mutex<Vec<u32>>,
    pub if_match: Mutex<Vec<Option<String>>>,
    /// Status every GET fails with
    pub get_status: Mutex<Option<u16>>,
    pub head_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn with_object(data: Vec<u8>) -> Self {
        let store = Self::default();
        *store.object.lock() = data;
        store
    }

    /// Fail `part` with `status` for the first `times` attempts
    pub fn fail_part(&self, part: u32, times: u32, status: u16) {
        self.fail_parts.lock().insert(part, (times, status));
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == name).count()
    }

    fn take_failure(&self, part: u32) -> Option<TransportError> {
        let mut failures = self.fail_parts.lock();
        let entry = failures.get_mut(&part)?;
        if entry.0 == 0 {
            return None;
        }
        entry.0 -= 1;
        Some(TransportError::Http {
            status: entry.1,
            code: None,
            message: "injected".into(),
            retry_after: None,
        })
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head_object(&self, _: &str, _: &str) -> Result<ObjectInfo, TransportError> {
        self.calls.lock().push("head".into());
        let delay = *self.head_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ObjectInfo {
            size: self.object.lock().len() as u64,
            etag: Some("\"memory\"".into()),
            last_modified: None,
            content_type: None,
        })
    }

    async fn put_object(
        &self,
        _: &str,
        _: &str,
        body: Bytes,
    ) -> Result<Option<String>, TransportError> {
        self.calls.lock().push("put".into());
        *self.object.lock() = body.to_vec();
        Ok(Some("\"single\"".into()))
    }

    async fn get_object(
        &self,
        _: &str,
        _: &str,
        range: Option<ByteRange>,
        if_match: Option<&str>,
    ) -> Result<Bytes, TransportError> {
        self.calls.lock().push("get".into());
        self.if_match.lock().push(if_match.map(String::from));
        if let Some(status) = *self.get_status.lock() {
            return Err(TransportError::Http {
                status,
                code: None,
                message: "injected".into(),
                retry_after: None,
            });
        }
        let data = self.object.lock().clone();
        Ok(match range {
            Some(r) => Bytes::copy_from_slice(&data[r.start as usize..r.end as usize]),
            None => Bytes::from(data),
        })
    }

    async fn create_multipart_upload(&self, _: &str, _: &str) -> Result<String, TransportError> {
        self.calls.lock().push("create".into());
        Ok("upload-1".into())
    }

    async fn upload_part(
        &self,
        _: &str,
        _: &str,
        _: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, TransportError> {
        self.calls.lock().push("upload_part".into());
        if let Some(err) = self.take_failure(part_number) {
            return Err(err);
        }
        tokio::time::sleep(Duration::from_millis(50 / part_number as u64)).await;
        self.parts.lock().insert(part_number, body);
        self.completed_order.lock().push(part_number);
        Ok(format!("\"etag-{}\"", part_number))
    }

    async fn complete_multipart_upload(
        &self,
        _: &str,
        _: &str,
        _: &str,
        parts: &[CompletedPart],
    ) -> Result<Option<String>, TransportError> {
        self.calls.lock().push("complete".into());
        let stored = self.parts.lock();
        let mut object = Vec::new();
        for part in parts {
            object.extend_from_slice(&stored[&part.part_number]);
        }
        *self.object.lock() = object;
        let numbers: Vec<String> = parts.iter().map(|p| p.part_number.to_string()).collect();
        Ok(Some(format!("\"{}\"", numbers.join(","))))
    }

    async fn abort_multipart_upload(
        &self,
        _: &str,
        _: &str,
        _: &str,
    ) -> Result<(), TransportError> {
        self.calls.lock().push("abort".into());
        Ok(())
    }
}

pub(crate) struct MemoryReader(pub Bytes);

#[async_trait]
impl ObjectReader for MemoryReader {
    async fn read_range(&self, range: ByteRange) -> Result<Bytes, TransferError> {
        Ok(self.0.slice(range.start as usize..range.end as usize))
    }
}

/// Buffer sink that records whether it was persisted or discarded
#[derive(Default)]
pub(crate) struct MemoryWriter {
    pub data: Mutex<Vec<u8>>,
    pub persisted: Mutex<bool>,
    pub discarded: Mutex<bool>,
}

#[async_trait]
impl ObjectWriter for MemoryWriter {
    async fn write_at(&self, offset: u64, data: Bytes) -> Result<(), TransferError> {
        let mut buf = self.data.lock();
        let end = offset as usize + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset as usize..end].copy_from_slice(&data);
        Ok(())
    }

    async fn sync(&self) -> Result<(), TransferError> {
        Ok(())
    }

    async fn persist(&self) -> Result<(), TransferError> {
        *self.persisted.lock() = true;
        Ok(())
    }

    async fn discard(&self) {
        self.data.lock().clear();
        *self.discarded.lock() = true;
    }
}

pub(crate) fn data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
