//! In-process object store, relay API and URL issuer.
//!
//! Used for loopback transfers and as the test double of every external
//! seam, with hooks to inject failures and observe concurrency.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use relaysync_protocol::TransferDescriptor;

use crate::TransferError;
use crate::assertions::RemoteAssertions;
use crate::storage::{BoxFuture, ObjectTransport, PresignedUrl, StorageResponse, StorageStrategy};

const SCHEME: &str = "mem://";

/// One assertion received by a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertionRecord {
    PartUploaded {
        file_id: String,
        part: u32,
        size: u64,
    },
    UploadFinished {
        file_id: String,
        total_parts: u32,
        sent_length: u64,
    },
    PartDownloaded {
        file_id: String,
        part: u32,
    },
    DownloadFinished {
        file_id: String,
        total_parts: u32,
    },
    Error {
        file_id: String,
        category: String,
        message: String,
    },
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<(String, u32), Vec<u8>>,
    put_failures: HashMap<u32, u16>,
    get_failures: HashMap<u32, u16>,
    short_gets: HashMap<u32, usize>,
    assertions: Vec<AssertionRecord>,
    reject_assertions: bool,
    put_delay: Duration,
    response_delay: Duration,
}

/// Decrements the in-flight counter even if the request future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn url(file_id: &str, part: u32) -> PresignedUrl {
        PresignedUrl::new(format!("{SCHEME}{file_id}/{part}"))
    }

    fn parse(url: &PresignedUrl) -> Result<(String, u32), TransferError> {
        let invalid = || TransferError::Transport(format!("not a memory URL: {url:?}"));
        let rest = url.as_str().strip_prefix(SCHEME).ok_or_else(invalid)?;
        let (file_id, part) = rest.rsplit_once('/').ok_or_else(invalid)?;
        let part = part.parse().map_err(|_| invalid())?;
        Ok((file_id.to_string(), part))
    }

    /// Every PUT of `part` is answered with `status`.
    pub fn fail_put(&self, part: u32, status: u16) {
        self.lock().put_failures.insert(part, status);
    }

    /// Every GET of `part` is answered with `status`.
    pub fn fail_get(&self, part: u32, status: u16) {
        self.lock().get_failures.insert(part, status);
    }

    /// Every GET of `part` returns only its first `len` bytes.
    pub fn short_get(&self, part: u32, len: usize) {
        self.lock().short_gets.insert(part, len);
    }

    /// Makes every assertion call fail.
    pub fn reject_assertions(&self, reject: bool) {
        self.lock().reject_assertions = reject;
    }

    /// Holds every PUT for `delay` before answering.
    pub fn set_put_delay(&self, delay: Duration) {
        self.lock().put_delay = delay;
    }

    /// Stores every accepted PUT at once but answers only after `delay`.
    pub fn set_response_delay(&self, delay: Duration) {
        self.lock().response_delay = delay;
    }

    /// Flips one byte of a stored object.
    pub fn corrupt(&self, file_id: &str, part: u32) -> bool {
        match self.lock().objects.get_mut(&(file_id.to_string(), part)) {
            Some(data) if !data.is_empty() => {
                data[0] ^= 0xff;
                true
            }
            _ => false,
        }
    }

    pub fn insert_object(&self, file_id: &str, part: u32, data: Vec<u8>) {
        self.lock().objects.insert((file_id.to_string(), part), data);
    }

    pub fn object(&self, file_id: &str, part: u32) -> Option<Vec<u8>> {
        self.lock().objects.get(&(file_id.to_string(), part)).cloned()
    }

    /// Stored part numbers of `file_id`, ascending.
    pub fn parts(&self, file_id: &str) -> Vec<u32> {
        self.lock()
            .objects
            .keys()
            .filter(|(id, _)| id == file_id)
            .map(|(_, part)| *part)
            .collect()
    }

    pub fn assertions(&self) -> Vec<AssertionRecord> {
        self.lock().assertions.clone()
    }

    /// Highest number of PUTs observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, record: AssertionRecord) -> Result<(), TransferError> {
        let mut inner = self.lock();
        if inner.reject_assertions {
            return Err(TransferError::Assertion(format!("rejected: {record:?}")));
        }
        inner.assertions.push(record);
        Ok(())
    }
}

impl StorageStrategy for MemoryStore {
    fn upload_url<'a>(
        &'a self,
        descriptor: &'a TransferDescriptor,
        part: u32,
    ) -> BoxFuture<'a, Result<PresignedUrl, TransferError>> {
        Box::pin(async move { Ok(Self::url(&descriptor.file_id, part)) })
    }

    fn download_url<'a>(
        &'a self,
        descriptor: &'a TransferDescriptor,
        part: u32,
    ) -> BoxFuture<'a, Result<PresignedUrl, TransferError>> {
        Box::pin(async move { Ok(Self::url(&descriptor.file_id, part)) })
    }

    fn delete_object<'a>(
        &'a self,
        descriptor: &'a TransferDescriptor,
        part: u32,
    ) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            self.lock()
                .objects
                .remove(&(descriptor.file_id.clone(), part));
            Ok(())
        })
    }

    fn object_size<'a>(
        &'a self,
        descriptor: &'a TransferDescriptor,
        part: u32,
    ) -> BoxFuture<'a, Result<u64, TransferError>> {
        Box::pin(async move {
            self.lock()
                .objects
                .get(&(descriptor.file_id.clone(), part))
                .map(|data| data.len() as u64)
                .ok_or(TransferError::StorageRejected { status: 404 })
        })
    }
}

impl ObjectTransport for MemoryStore {
    fn put<'a>(
        &'a self,
        url: &'a PresignedUrl,
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<StorageResponse, TransferError>> {
        Box::pin(async move {
            let key = Self::parse(url)?;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = InFlight(&self.in_flight);
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = self.lock().put_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let response_delay = {
                let mut inner = self.lock();
                if let Some(&status) = inner.put_failures.get(&key.1) {
                    return Ok(StorageResponse { status });
                }
                inner.objects.insert(key, body);
                inner.response_delay
            };
            if !response_delay.is_zero() {
                tokio::time::sleep(response_delay).await;
            }
            Ok(StorageResponse::ok())
        })
    }

    fn get<'a>(&'a self, url: &'a PresignedUrl) -> BoxFuture<'a, Result<Vec<u8>, TransferError>> {
        Box::pin(async move {
            let key = Self::parse(url)?;
            let inner = self.lock();
            if let Some(&status) = inner.get_failures.get(&key.1) {
                return Err(TransferError::StorageRejected { status });
            }
            let data = inner
                .objects
                .get(&key)
                .ok_or(TransferError::StorageRejected { status: 404 })?;
            let len = inner.short_gets.get(&key.1).map_or(data.len(), |&n| n.min(data.len()));
            Ok(data[..len].to_vec())
        })
    }
}

impl RemoteAssertions for MemoryStore {
    fn part_uploaded<'a>(
        &'a self,
        d: &'a TransferDescriptor,
        part: u32,
        size: u64,
    ) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            self.record(AssertionRecord::PartUploaded {
                file_id: d.file_id.clone(),
                part,
                size,
            })
        })
    }

    fn upload_finished<'a>(
        &'a self,
        d: &'a TransferDescriptor,
        total_parts: u32,
        sent_length: u64,
    ) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            self.record(AssertionRecord::UploadFinished {
                file_id: d.file_id.clone(),
                total_parts,
                sent_length,
            })
        })
    }

    fn part_downloaded<'a>(
        &'a self,
        d: &'a TransferDescriptor,
        part: u32,
    ) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            self.record(AssertionRecord::PartDownloaded {
                file_id: d.file_id.clone(),
                part,
            })
        })
    }

    fn download_finished<'a>(
        &'a self,
        d: &'a TransferDescriptor,
        total_parts: u32,
    ) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            self.record(AssertionRecord::DownloadFinished {
                file_id: d.file_id.clone(),
                total_parts,
            })
        })
    }

    // Error reports are recorded even while assertions are rejected.
    fn report_error<'a>(
        &'a self,
        d: &'a TransferDescriptor,
        category: &'a str,
        message: &'a str,
    ) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            self.lock().assertions.push(AssertionRecord::Error {
                file_id: d.file_id.clone(),
                category: category.to_string(),
                message: message.to_string(),
            });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaysync_protocol::TransferKind;
    use std::sync::Arc;

    fn descriptor() -> TransferDescriptor {
        TransferDescriptor::new("file/with/slashes", "s", "c", TransferKind::FullCopy)
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let store = MemoryStore::new();
        let d = descriptor();
        let url = store.upload_url(&d, 2).await.unwrap();
        assert!(store.put(&url, b"abc".to_vec()).await.unwrap().is_success());
        assert_eq!(store.object_size(&d, 2).await.unwrap(), 3);
        let url = store.download_url(&d, 2).await.unwrap();
        assert_eq!(store.get(&url).await.unwrap(), b"abc");
        assert_eq!(store.parts(&d.file_id), vec![2]);

        store.delete_object(&d, 2).await.unwrap();
        assert!(matches!(
            store.get(&url).await,
            Err(TransferError::StorageRejected { status: 404 })
        ));
    }

    #[tokio::test]
    async fn injected_put_failure_returns_status() {
        let store = MemoryStore::new();
        let d = descriptor();
        store.fail_put(1, 503);
        let url = store.upload_url(&d, 1).await.unwrap();
        let response = store.put(&url, vec![1]).await.unwrap();
        assert_eq!(response.status, 503);
        assert!(store.object(&d.file_id, 1).is_none());
    }

    #[tokio::test]
    async fn tracks_peak_concurrency() {
        let store = Arc::new(MemoryStore::new());
        store.set_put_delay(Duration::from_millis(30));
        let d = descriptor();
        let mut handles = Vec::new();
        for part in 1..=3 {
            let store = Arc::clone(&store);
            let url = store.upload_url(&d, part).await.unwrap();
            handles.push(tokio::spawn(async move {
                store.put(&url, vec![0; 8]).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.max_in_flight(), 3);
        assert_eq!(store.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_assertions_still_record_errors() {
        let store = MemoryStore::new();
        let d = descriptor();
        store.reject_assertions(true);
        assert!(store.part_uploaded(&d, 1, 10).await.is_err());
        store.report_error(&d, "io", "disk full").await.unwrap();
        assert_eq!(
            store.assertions(),
            vec![AssertionRecord::Error {
                file_id: d.file_id.clone(),
                category: "io".into(),
                message: "disk full".into(),
            }]
        );
    }

    #[test]
    fn corrupt_flips_a_byte() {
        let store = MemoryStore::new();
        store.insert_object("f", 1, vec![0x00, 0x01]);
        assert!(store.corrupt("f", 1));
        assert_eq!(store.object("f", 1), Some(vec![0xff, 0x01]));
        assert!(!store.corrupt("f", 2));
    }
}
