//! WAL flusher service
//!
//! The WAL has a single writer. Producers (the frame thread and transaction
//! participants) enqueue append commands over an MPSC channel to a dedicated
//! flusher thread that owns the [`WalWriter`]. Appends are acknowledged back
//! to the producer once the record is written — and, per the durability
//! level, synced — so "WAL before effect" holds exactly as it would with a
//! direct writer, without any producer ever touching the file.

use crate::record::WalOp;
use crate::writer::WalWriter;
use hotswap_core::{HotswapError, Lsn, Result, TxnId};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::JoinHandle;
use tracing::{error, info};

enum WalCommand {
    Append {
        txn: TxnId,
        op_id: u32,
        op: WalOp,
        ack: SyncSender<Result<Lsn>>,
    },
    Flush {
        ack: SyncSender<Result<()>>,
    },
    Shutdown,
}

/// Cloneable producer handle to the flusher thread.
#[derive(Clone)]
pub struct WalHandle {
    tx: Sender<WalCommand>,
}

impl WalHandle {
    /// Append an operation and wait until it is written (and synced, per the
    /// durability level). Returns the record's LSN.
    pub fn append(&self, txn: TxnId, op_id: u32, op: WalOp) -> Result<Lsn> {
        let (ack, ack_rx) = mpsc::sync_channel(1);
        self.tx
            .send(WalCommand::Append {
                txn,
                op_id,
                op,
                ack,
            })
            .map_err(|_| HotswapError::wal_write_failed("WAL flusher is gone"))?;
        ack_rx
            .recv()
            .map_err(|_| HotswapError::wal_write_failed("WAL flusher dropped the ack"))?
    }

    /// Force all buffered records to stable storage.
    pub fn flush(&self) -> Result<()> {
        let (ack, ack_rx) = mpsc::sync_channel(1);
        self.tx
            .send(WalCommand::Flush { ack })
            .map_err(|_| HotswapError::wal_write_failed("WAL flusher is gone"))?;
        ack_rx
            .recv()
            .map_err(|_| HotswapError::wal_write_failed("WAL flusher dropped the ack"))?
    }
}

/// Owns the flusher thread; dropping without [`WalService::shutdown`] still
/// stops the thread but discards its join result.
pub struct WalService {
    handle: WalHandle,
    thread: Option<JoinHandle<()>>,
}

impl WalService {
    /// Spawn the flusher thread around an opened writer.
    pub fn spawn(writer: WalWriter) -> Result<WalService> {
        let (tx, rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("hotswap-wal".to_string())
            .spawn(move || flusher_loop(writer, rx))
            .map_err(|e| HotswapError::internal(format!("WAL flusher spawn: {}", e)))?;
        Ok(WalService {
            handle: WalHandle { tx },
            thread: Some(thread),
        })
    }

    /// Producer handle.
    pub fn handle(&self) -> WalHandle {
        self.handle.clone()
    }

    /// Stop the flusher after draining queued commands.
    pub fn shutdown(mut self) {
        let _ = self.handle.tx.send(WalCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("WAL flusher thread panicked");
            }
        }
    }
}

impl Drop for WalService {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(WalCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn flusher_loop(mut writer: WalWriter, rx: Receiver<WalCommand>) {
    while let Ok(command) = rx.recv() {
        match command {
            WalCommand::Append {
                txn,
                op_id,
                op,
                ack,
            } => {
                let result = writer.append(txn, op_id, op);
                let _ = ack.send(result);
            }
            WalCommand::Flush { ack } => {
                let _ = ack.send(writer.flush());
            }
            WalCommand::Shutdown => break,
        }
    }
    if let Err(e) = writer.flush() {
        error!(error = %e, "final WAL flush failed");
    }
    info!("WAL flusher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::WalReader;
    use crate::writer::DEFAULT_SEGMENT_BYTES;
    use hotswap_core::DurabilityLevel;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn service(dir: &std::path::Path) -> WalService {
        let writer = WalWriter::open(
            dir,
            [1; 16],
            DurabilityLevel::FsyncEveryRecord,
            DEFAULT_SEGMENT_BYTES,
        )
        .unwrap();
        WalService::spawn(writer).unwrap()
    }

    #[test]
    fn test_append_through_service() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        let handle = svc.handle();

        let a = handle.append(TxnId(1), 0, WalOp::TxnBegin { txn_kind: 0 }).unwrap();
        let b = handle.append(TxnId(1), 1, WalOp::Aborted).unwrap();
        assert_eq!(a, Lsn(1));
        assert_eq!(b, Lsn(2));
        svc.shutdown();

        let records = WalReader::new().read_all(dir.path()).unwrap().records;
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_concurrent_producers_get_unique_lsns() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        let handle = Arc::new(svc.handle());

        let workers: Vec<_> = (0..4u64)
            .map(|t| {
                let handle = Arc::clone(&handle);
                std::thread::spawn(move || {
                    (0..25u32)
                        .map(|i| handle.append(TxnId(t), i, WalOp::Checkpoint).unwrap())
                        .collect::<Vec<Lsn>>()
                })
            })
            .collect();

        let mut all: Vec<Lsn> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 100);
        svc.shutdown();
    }

    #[test]
    fn test_flush_acknowledged() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        svc.handle().append(TxnId(1), 0, WalOp::Checkpoint).unwrap();
        svc.handle().flush().unwrap();
        svc.shutdown();
    }

    #[test]
    fn test_append_after_shutdown_fails() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        let handle = svc.handle();
        svc.shutdown();

        let err = handle.append(TxnId(1), 0, WalOp::Checkpoint).unwrap_err();
        assert!(err.is_wal_failure());
    }
}
