//! The copy engine boundary.
//!
//! The core never moves data itself: it asks a [`CopyEngine`] to copy a
//! block-sized region between the origin and data devices and gets the
//! completion injected back as an event. [`ThreadedCopier`] is the
//! in-process implementation: one worker thread draining a job queue.

use hc_block::ByteDevice;
use hc_error::{HcError, Result};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, trace};

/// Which device a copy endpoint lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopySide {
    Origin,
    Pool,
}

/// One endpoint of a copy: a sector range on one device.
#[derive(Debug, Clone, Copy)]
pub struct CopyRegion {
    pub side: CopySide,
    pub sector: u64,
    pub nr_sectors: u64,
}

pub type CopyCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Asynchronous "copy region A to region B" primitive.
pub trait CopyEngine: Send + Sync {
    fn copy(&self, from: CopyRegion, to: CopyRegion, done: CopyCallback);
}

struct CopyJob {
    from: CopyRegion,
    to: CopyRegion,
    done: CopyCallback,
}

/// Copy engine over two byte devices, served by a dedicated thread.
pub struct ThreadedCopier {
    tx: Mutex<Option<mpsc::Sender<CopyJob>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

const SECTOR_SIZE: u64 = 512;

fn run_copy(
    origin: &Arc<dyn ByteDevice>,
    pool: &Arc<dyn ByteDevice>,
    from: CopyRegion,
    to: CopyRegion,
) -> Result<()> {
    if from.nr_sectors != to.nr_sectors {
        return Err(HcError::InvalidArgument(format!(
            "copy length mismatch: {} vs {} sectors",
            from.nr_sectors, to.nr_sectors
        )));
    }
    let pick = |side| -> &Arc<dyn ByteDevice> {
        match side {
            CopySide::Origin => origin,
            CopySide::Pool => pool,
        }
    };
    let len = usize::try_from(from.nr_sectors * SECTOR_SIZE)
        .map_err(|_| HcError::InvalidArgument("copy length overflow".to_owned()))?;
    let mut buf = vec![0_u8; len];
    pick(from.side).read_exact_at(from.sector * SECTOR_SIZE, &mut buf)?;
    pick(to.side).write_all_at(to.sector * SECTOR_SIZE, &buf)?;
    Ok(())
}

impl ThreadedCopier {
    pub fn new(origin: Arc<dyn ByteDevice>, pool: Arc<dyn ByteDevice>) -> Self {
        let (tx, rx) = mpsc::channel::<CopyJob>();
        let join = std::thread::Builder::new()
            .name("hcache-copyd".to_owned())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    trace!(
                        target: "hcache::core::copy",
                        event = "copy",
                        from = ?job.from.side,
                        from_sector = job.from.sector,
                        to_sector = job.to.sector,
                        nr_sectors = job.from.nr_sectors
                    );
                    let result = run_copy(&origin, &pool, job.from, job.to);
                    if let Err(err) = &result {
                        error!(
                            target: "hcache::core::copy",
                            event = "copy_failed",
                            error = %err
                        );
                    }
                    (job.done)(result);
                }
            })
            .expect("spawn copy thread");
        Self {
            tx: Mutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
        }
    }
}

impl CopyEngine for ThreadedCopier {
    fn copy(&self, from: CopyRegion, to: CopyRegion, done: CopyCallback) {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => {
                let _ = tx.send(CopyJob { from, to, done });
            }
            None => done(Err(HcError::Format("copy engine shut down".to_owned()))),
        }
    }
}

impl Drop for ThreadedCopier {
    fn drop(&mut self) {
        let _ = self.tx.lock().take();
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hc_block::MemByteDevice;
    use std::sync::mpsc::channel;

    #[test]
    fn test_copy_moves_bytes_between_devices() {
        let origin: Arc<MemByteDevice> = Arc::new(MemByteDevice::new(64 * 512));
        let pool: Arc<MemByteDevice> = Arc::new(MemByteDevice::new(64 * 512));
        origin.write_all_at(8 * 512, &[0xAB; 8 * 512]).unwrap();

        let copier = ThreadedCopier::new(
            Arc::clone(&origin) as Arc<dyn ByteDevice>,
            Arc::clone(&pool) as Arc<dyn ByteDevice>,
        );
        let (tx, rx) = channel();
        copier.copy(
            CopyRegion {
                side: CopySide::Origin,
                sector: 8,
                nr_sectors: 8,
            },
            CopyRegion {
                side: CopySide::Pool,
                sector: 16,
                nr_sectors: 8,
            },
            Box::new(move |result| {
                tx.send(result).unwrap();
            }),
        );
        rx.recv().unwrap().unwrap();

        let mut buf = vec![0_u8; 8 * 512];
        pool.read_exact_at(16 * 512, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn test_out_of_bounds_copy_fails() {
        let origin: Arc<MemByteDevice> = Arc::new(MemByteDevice::new(8 * 512));
        let pool: Arc<MemByteDevice> = Arc::new(MemByteDevice::new(8 * 512));
        let copier = ThreadedCopier::new(
            Arc::clone(&origin) as Arc<dyn ByteDevice>,
            Arc::clone(&pool) as Arc<dyn ByteDevice>,
        );
        let (tx, rx) = channel();
        copier.copy(
            CopyRegion {
                side: CopySide::Origin,
                sector: 100,
                nr_sectors: 8,
            },
            CopyRegion {
                side: CopySide::Pool,
                sector: 0,
                nr_sectors: 8,
            },
            Box::new(move |result| {
                tx.send(result).unwrap();
            }),
        );
        assert!(rx.recv().unwrap().is_err());
    }
}
