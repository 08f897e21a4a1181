//! Storage backend that can be switched to behave like a full disk

use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use redb::backends::InMemoryBackend;
use redb::StorageBackend;

use super::Outbox;

/// In-memory backend whose writes fail with `StorageFull` while `full` is set
#[derive(Debug)]
pub(crate) struct FullDiskBackend {
    inner: InMemoryBackend,
    full: Arc<AtomicBool>,
}

impl FullDiskBackend {
    fn check(&self) -> Result<(), io::Error> {
        if self.full.load(Ordering::SeqCst) {
            Err(io::Error::new(ErrorKind::StorageFull, "no space left on device"))
        } else {
            Ok(())
        }
    }
}

impl StorageBackend for FullDiskBackend {
    fn len(&self) -> Result<u64, io::Error> {
        self.inner.len()
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, io::Error> {
        self.inner.read(offset, len)
    }

    fn set_len(&self, len: u64) -> Result<(), io::Error> {
        self.check()?;
        self.inner.set_len(len)
    }

    fn sync_data(&self, eventual: bool) -> Result<(), io::Error> {
        self.check()?;
        self.inner.sync_data(eventual)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), io::Error> {
        self.check()?;
        self.inner.write(offset, data)
    }
}

/// An empty outbox plus the switch that fills its disk
pub(crate) fn full_disk_outbox() -> (Outbox, Arc<AtomicBool>) {
    let full = Arc::new(AtomicBool::new(false));
    let backend = FullDiskBackend {
        inner: InMemoryBackend::new(),
        full: full.clone(),
    };
    let outbox = Outbox::with_backend(backend).expect("in-memory outbox");
    (outbox, full)
}
