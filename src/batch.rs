use crate::decoder::ExternalDecoder;
use crate::descriptor::FormatDescriptor;
use crate::error::CarveError;
use crate::io::Source;
use crate::naming::NameRegistry;
use crate::session::CarvingSession;
use crate::types::ExtractionRecord;
use crossbeam_channel::{unbounded, Sender};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Progress notifications emitted while a batch runs. Consumers (the CLI
/// progress bar, tests) receive these over a channel; a dropped receiver
/// never stalls the batch.
#[derive(Debug)]
pub enum BatchEvent {
    Started { total_sources: usize },
    SourceStarted { path: PathBuf },
    SegmentExtracted(ExtractionRecord),
    SourceFinished { path: PathBuf, segments: u64 },
    SourceFailed { path: PathBuf, reason: String },
    Completed { total_extracted: u64 },
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed,
    Cancelled,
}

/// Aggregate result of one batch run.
#[derive(Debug)]
pub struct BatchSummary {
    pub outcome: BatchOutcome,
    pub sources_scanned: u64,
    pub sources_failed: u64,
    pub segments_extracted: u64,
    pub bytes_extracted: u64,
    pub records: Vec<ExtractionRecord>,
}

pub struct BatchConfig {
    pub output_dir: PathBuf,
    pub workers: usize,
}

impl BatchConfig {
    #[must_use]
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            workers: num_cpus::get(),
        }
    }

    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// Fans a list of source files out over a worker pool, each worker carving
/// whole files with its own session. One shared name registry keeps output
/// names unique across workers writing into the same directory.
pub struct BatchCoordinator<'a> {
    descriptor: &'a FormatDescriptor,
    config: BatchConfig,
    cancel: Arc<AtomicBool>,
    decoder: Option<&'a (dyn ExternalDecoder + Sync)>,
}

impl<'a> BatchCoordinator<'a> {
    #[must_use]
    pub fn new(
        descriptor: &'a FormatDescriptor,
        config: BatchConfig,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            descriptor,
            config,
            cancel,
            decoder: None,
        }
    }

    #[must_use]
    pub fn with_decoder(mut self, decoder: &'a (dyn ExternalDecoder + Sync)) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Processes every source; per-file failures are reported and skipped,
    /// only cancellation stops the batch early. Already-completed outputs
    /// are kept on cancellation, in-flight files stop between segments.
    pub fn run(&self, sources: Vec<PathBuf>, events: &Sender<BatchEvent>) -> BatchSummary {
        let total = sources.len();
        let _ = events.send(BatchEvent::Started {
            total_sources: total,
        });

        let registry = NameRegistry::new();
        let sources_scanned = AtomicU64::new(0);
        let sources_failed = AtomicU64::new(0);
        let segments_extracted = AtomicU64::new(0);
        let bytes_extracted = AtomicU64::new(0);

        let (job_tx, job_rx) = unbounded::<PathBuf>();
        let (record_tx, record_rx) = unbounded::<ExtractionRecord>();
        for path in sources {
            let _ = job_tx.send(path);
        }
        drop(job_tx);

        let workers = self.config.workers.min(total.max(1));
        info!(workers, total, format = self.descriptor.id, "starting batch");

        thread::scope(|scope| {
            for worker in 0..workers {
                let job_rx = job_rx.clone();
                let record_tx = record_tx.clone();
                let registry = &registry;
                let sources_scanned = &sources_scanned;
                let sources_failed = &sources_failed;
                let segments_extracted = &segments_extracted;
                let bytes_extracted = &bytes_extracted;
                let cancel = Arc::clone(&self.cancel);

                scope.spawn(move || {
                    debug!(worker, "batch worker up");
                    for path in job_rx.iter() {
                        if cancel.load(Ordering::Relaxed) {
                            break;
                        }
                        let _ = events.send(BatchEvent::SourceStarted { path: path.clone() });

                        let mut session = CarvingSession::new(
                            self.descriptor,
                            registry,
                            &self.config.output_dir,
                            &cancel,
                        );
                        if let Some(decoder) = self.decoder {
                            session = session.with_decoder(decoder);
                        }

                        let result = Source::open(&path).and_then(|mut source| {
                            session.run(&mut source, &path, |record| {
                                let _ =
                                    events.send(BatchEvent::SegmentExtracted(record.clone()));
                                let _ = record_tx.send(record.clone());
                            })
                        });

                        match result {
                            Ok(records) => {
                                let stats = session.stats();
                                sources_scanned.fetch_add(1, Ordering::Relaxed);
                                segments_extracted
                                    .fetch_add(stats.segments_written, Ordering::Relaxed);
                                bytes_extracted.fetch_add(stats.bytes_written, Ordering::Relaxed);
                                let _ = events.send(BatchEvent::SourceFinished {
                                    path,
                                    segments: records.len() as u64,
                                });
                            }
                            Err(CarveError::Cancelled) => break,
                            Err(e) => {
                                sources_failed.fetch_add(1, Ordering::Relaxed);
                                warn!(path = %path.display(), error = %e, "source failed");
                                let _ = events.send(BatchEvent::SourceFailed {
                                    path,
                                    reason: e.to_string(),
                                });
                            }
                        }
                    }
                });
            }
        });
        drop(record_tx);

        let mut records: Vec<ExtractionRecord> = record_rx.iter().collect();
        records.sort_by(|a, b| {
            (&a.source_path, &a.output_path).cmp(&(&b.source_path, &b.output_path))
        });

        let segments_extracted = segments_extracted.into_inner();
        let outcome = if self.cancel.load(Ordering::Relaxed) {
            let _ = events.send(BatchEvent::Cancelled);
            BatchOutcome::Cancelled
        } else {
            let _ = events.send(BatchEvent::Completed {
                total_extracted: segments_extracted,
            });
            BatchOutcome::Completed
        };

        BatchSummary {
            outcome,
            sources_scanned: sources_scanned.into_inner(),
            sources_failed: sources_failed.into_inner(),
            segments_extracted,
            bytes_extracted: bytes_extracted.into_inner(),
            records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{BoundaryStrategy, Endian, LengthField};
    use crate::types::Signature;
    use tempfile::TempDir;

    fn descriptor() -> FormatDescriptor {
        FormatDescriptor {
            id: "rec",
            signatures: vec![Signature::exact(b"AAAA")],
            boundary: BoundaryStrategy::LengthField(LengthField {
                offset: 4,
                width: 4,
                endian: Endian::Little,
                base: 8,
                align: 0,
            }),
            rules: vec![],
            extension: "bin",
            priority: 0,
            block_size: crate::scanner::DEFAULT_BLOCK_SIZE,
            external_decoder: false,
        }
    }

    fn record(payload: usize) -> Vec<u8> {
        let mut rec = b"AAAA".to_vec();
        rec.extend_from_slice(&(payload as u32).to_le_bytes());
        rec.extend(std::iter::repeat_n(0x7Fu8, payload));
        rec
    }

    #[test]
    fn batch_carves_all_sources() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        std::fs::create_dir(&out).unwrap();

        let mut sources = Vec::new();
        for i in 0..6 {
            let path = tmp.path().join(format!("arc{i}.dat"));
            let mut data = vec![0x33u8; 5];
            data.extend(record(50 + i));
            data.extend(record(80));
            std::fs::write(&path, &data).unwrap();
            sources.push(path);
        }

        let d = descriptor();
        let config = BatchConfig::new(out.clone()).workers(3);
        let coordinator = BatchCoordinator::new(&d, config, Arc::new(AtomicBool::new(false)));

        let (tx, rx) = unbounded();
        let summary = coordinator.run(sources, &tx);

        assert_eq!(summary.outcome, BatchOutcome::Completed);
        assert_eq!(summary.sources_scanned, 6);
        assert_eq!(summary.sources_failed, 0);
        assert_eq!(summary.segments_extracted, 12);
        assert_eq!(summary.records.len(), 12);
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 12);

        let events: Vec<BatchEvent> = rx.try_iter().collect();
        assert!(matches!(events.first(), Some(BatchEvent::Started { total_sources: 6 })));
        assert!(matches!(
            events.last(),
            Some(BatchEvent::Completed { total_extracted: 12 })
        ));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, BatchEvent::SegmentExtracted(_)))
                .count(),
            12
        );
    }

    #[test]
    fn unreadable_source_is_reported_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        std::fs::create_dir(&out).unwrap();

        let good = tmp.path().join("good.dat");
        std::fs::write(&good, record(30)).unwrap();
        let missing = tmp.path().join("missing.dat");

        let d = descriptor();
        let coordinator = BatchCoordinator::new(
            &d,
            BatchConfig::new(out).workers(1),
            Arc::new(AtomicBool::new(false)),
        );

        let (tx, rx) = unbounded();
        let summary = coordinator.run(vec![missing.clone(), good], &tx);

        assert_eq!(summary.outcome, BatchOutcome::Completed);
        assert_eq!(summary.sources_scanned, 1);
        assert_eq!(summary.sources_failed, 1);
        assert_eq!(summary.segments_extracted, 1);

        let failed: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                BatchEvent::SourceFailed { path, .. } => Some(path),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec![missing]);
    }

    #[test]
    fn names_stay_unique_across_workers() {
        // Same stem in different directories; workers race on the registry
        // and every output still gets a distinct name.
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        std::fs::create_dir(&out).unwrap();

        let mut sources = Vec::new();
        for sub in ["a", "b", "c", "d"] {
            let dir = tmp.path().join(sub);
            std::fs::create_dir(&dir).unwrap();
            let path = dir.join("bank.dat");
            std::fs::write(&path, record(64)).unwrap();
            sources.push(path);
        }

        let d = descriptor();
        let coordinator = BatchCoordinator::new(
            &d,
            BatchConfig::new(out.clone()).workers(4),
            Arc::new(AtomicBool::new(false)),
        );
        let (tx, _rx) = unbounded();
        let summary = coordinator.run(sources, &tx);

        assert_eq!(summary.segments_extracted, 4);
        let mut names: Vec<_> = summary
            .records
            .iter()
            .map(|r| r.output_path.clone())
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 4);
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 4);
    }

    #[test]
    fn pre_cancelled_batch_does_no_work() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let path = tmp.path().join("arc.dat");
        std::fs::write(&path, record(100)).unwrap();

        let d = descriptor();
        let coordinator = BatchCoordinator::new(
            &d,
            BatchConfig::new(out.clone()).workers(2),
            Arc::new(AtomicBool::new(true)),
        );
        let (tx, rx) = unbounded();
        let summary = coordinator.run(vec![path], &tx);

        assert_eq!(summary.outcome, BatchOutcome::Cancelled);
        assert_eq!(summary.segments_extracted, 0);
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);
        assert!(rx.try_iter().any(|e| matches!(e, BatchEvent::Cancelled)));
    }
}
