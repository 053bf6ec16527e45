//! Worker-thread streaming engine.
//!
//! Requests enter a bounded queue and are serviced by a small fixed pool of
//! OS threads in submission order (linear scan for the lowest request id,
//! so the queue is deliberately kept small). A read request performs a
//! blocking read at a file offset and decompresses the record; a build
//! request runs CPU voxelization. Results land in a completion queue the
//! main thread drains once per frame.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::core::Error;
use crate::segment::pool::BrickBufferPool;
use crate::segment::segment::BrickPayload;
use crate::segment::voxelize::{self, BuildOutput, VoxelizeJob};
use crate::svo::arena::SegmentId;
use crate::svo::persist::{self, TextureFormat};

pub struct StreamEngineConfig {
    pub worker_threads: usize,
    pub queue_capacity: usize,
    /// Brick data file; `None` runs in voxelize-only mode.
    pub brick_file: Option<PathBuf>,
    pub texture_format: TextureFormat,
}

/// One streaming request.
pub enum StreamJob {
    /// Blocking read of a persisted brick record.
    Read {
        segment: SegmentId,
        /// Persisted segment id, validated against the record header.
        segment_key: u32,
        offset: u64,
        length: u32,
    },
    /// On-demand voxelization.
    Build(Box<VoxelizeJob>),
}

impl StreamJob {
    fn segment(&self) -> SegmentId {
        match self {
            StreamJob::Read { segment, .. } => *segment,
            StreamJob::Build(job) => job.segment,
        }
    }
}

pub enum StreamOutcome {
    Loaded(BrickPayload),
    Built(BuildOutput),
    /// Fatal (corruption-class) failure; never retried.
    Failed(Error),
}

pub struct StreamResult {
    pub segment: SegmentId,
    pub outcome: StreamOutcome,
}

struct Pending {
    request_id: u64,
    job: StreamJob,
}

/// Pop the request with the lowest submission id.
fn pop_oldest(queue: &mut Vec<Pending>) -> Option<Pending> {
    let mut oldest = 0;
    for (i, item) in queue.iter().enumerate() {
        if item.request_id < queue[oldest].request_id {
            oldest = i;
        }
    }
    if queue.is_empty() {
        None
    } else {
        Some(queue.swap_remove(oldest))
    }
}

struct Shared {
    queue: Mutex<Vec<Pending>>,
    available: Condvar,
    completed: Mutex<VecDeque<StreamResult>>,
    done: AtomicBool,
    in_flight: AtomicUsize,
    file: Option<Mutex<File>>,
    format: TextureFormat,
    pool: Arc<BrickBufferPool>,
    queue_capacity: usize,
}

pub struct StreamEngine {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    next_request_id: u64,
}

impl StreamEngine {
    pub fn new(config: StreamEngineConfig, pool: Arc<BrickBufferPool>) -> std::io::Result<Self> {
        let file = match &config.brick_file {
            Some(path) => Some(Mutex::new(File::open(path)?)),
            None => None,
        };

        let shared = Arc::new(Shared {
            queue: Mutex::new(Vec::new()),
            available: Condvar::new(),
            completed: Mutex::new(VecDeque::new()),
            done: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            file,
            format: config.texture_format,
            pool,
            queue_capacity: config.queue_capacity,
        });

        let workers = (0..config.worker_threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("svo-stream-{}", i))
                    .spawn(move || worker_loop(shared))
                    .expect("spawn streaming worker")
            })
            .collect();

        Ok(Self {
            shared,
            workers,
            next_request_id: 0,
        })
    }

    /// Enqueue a request. Returns false when the queue is full; the caller
    /// retries on a later frame (backpressure, not an error).
    pub fn start(&mut self, job: StreamJob) -> bool {
        {
            let mut queue = self.shared.queue.lock().expect("stream queue");
            if queue.len() >= self.shared.queue_capacity {
                return false;
            }
            queue.push(Pending {
                request_id: self.next_request_id,
                job,
            });
        }
        self.next_request_id += 1;
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        self.shared.available.notify_one();
        true
    }

    /// Requests accepted but not yet handed back through `drain_completed`.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Take all finished results; called once per frame by the main thread.
    pub fn drain_completed(&self) -> Vec<StreamResult> {
        let mut completed = self.shared.completed.lock().expect("completion queue");
        let results: Vec<StreamResult> = completed.drain(..).collect();
        self.shared.in_flight.fetch_sub(results.len(), Ordering::AcqRel);
        results
    }

    /// Stop servicing requests and join the workers. Queued items are
    /// abandoned; an in-flight blocking read completes first.
    pub fn shutdown(&mut self) {
        self.shared.done.store(true, Ordering::Release);
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let pending = {
            let mut queue = shared.queue.lock().expect("stream queue");
            loop {
                if shared.done.load(Ordering::Acquire) {
                    return;
                }
                if let Some(item) = pop_oldest(&mut queue) {
                    break item;
                }
                queue = shared.available.wait(queue).expect("stream queue");
            }
        };

        let segment = pending.job.segment();
        let outcome = execute(&shared, pending.job);

        shared
            .completed
            .lock()
            .expect("completion queue")
            .push_back(StreamResult { segment, outcome });
    }
}

fn execute(shared: &Shared, job: StreamJob) -> StreamOutcome {
    match job {
        StreamJob::Read {
            segment_key,
            offset,
            length,
            ..
        } => match read_record(shared, offset, length) {
            Ok(bytes) => {
                match persist::parse_brick_record(&bytes, shared.format, segment_key, &shared.pool)
                {
                    Ok(payload) => StreamOutcome::Loaded(payload),
                    Err(e) => StreamOutcome::Failed(e),
                }
            }
            Err(e) => StreamOutcome::Failed(e),
        },
        StreamJob::Build(job) => StreamOutcome::Built(voxelize::run_job(&job.params)),
    }
}

fn read_record(shared: &Shared, offset: u64, length: u32) -> Result<Vec<u8>, Error> {
    let Some(file) = &shared.file else {
        return Err(Error::Streaming(
            "read request without a brick file".into(),
        ));
    };

    let mut buf = vec![0u8; length as usize];
    let mut file = file.lock().expect("brick file");
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Corrupt(format!(
                "short read: {} bytes at offset {} past end of brick file",
                length, offset
            ))
        } else {
            Error::Io(e)
        }
    })?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec3;
    use crate::math::Aabb;
    use crate::scene::SceneSources;
    use crate::segment::brick::{crop_to_bounds, texel_index, BrickChannels};
    use crate::segment::voxelize::{VoxelizeConfig, VoxelizeParams};
    use crate::segment::Segment;
    use crate::svo::arena::NodeId;
    use std::io::Write;

    fn config(workers: usize, capacity: usize, file: Option<PathBuf>) -> StreamEngineConfig {
        StreamEngineConfig {
            worker_threads: workers,
            queue_capacity: capacity,
            brick_file: file,
            texture_format: TextureFormat::Rgba8,
        }
    }

    fn wait_for_results(engine: &StreamEngine, count: usize) -> Vec<StreamResult> {
        let mut results = Vec::new();
        for _ in 0..500 {
            results.extend(engine.drain_completed());
            if results.len() >= count {
                return results;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        panic!("streaming results did not arrive");
    }

    #[test]
    fn test_queue_capacity_backpressure() {
        // no workers: the queue fills deterministically
        let pool = BrickBufferPool::new(4);
        let mut engine =
            StreamEngine::new(config(0, 2, None), pool).expect("engine");

        let job = |n: u32| StreamJob::Read {
            segment: SegmentId(n),
            segment_key: n,
            offset: 0,
            length: 16,
        };

        assert!(engine.start(job(0)));
        assert!(engine.start(job(1)));
        assert!(!engine.start(job(2)), "queue full must refuse");
        assert!(!engine.start(job(3)));
        assert_eq!(engine.in_flight(), 2);
    }

    #[test]
    fn test_pop_oldest_by_request_id() {
        let mut queue = vec![
            Pending {
                request_id: 5,
                job: StreamJob::Read {
                    segment: SegmentId(5),
                    segment_key: 0,
                    offset: 0,
                    length: 0,
                },
            },
            Pending {
                request_id: 2,
                job: StreamJob::Read {
                    segment: SegmentId(2),
                    segment_key: 0,
                    offset: 0,
                    length: 0,
                },
            },
            Pending {
                request_id: 9,
                job: StreamJob::Read {
                    segment: SegmentId(9),
                    segment_key: 0,
                    offset: 0,
                    length: 0,
                },
            },
        ];

        let order: Vec<u64> = std::iter::from_fn(|| pop_oldest(&mut queue))
            .map(|p| p.request_id)
            .collect();
        assert_eq!(order, vec![2, 5, 9]);
    }

    #[test]
    fn test_read_roundtrip() {
        let pool = BrickBufferPool::new(8);

        // build a brick record on disk
        let bounds = Aabb::new(Vec3::ZERO, Vec3::splat(8.0));
        let mut segment = Segment::new(7, NodeId(0), None, bounds);
        let mut channels = BrickChannels::allocate(&pool);
        channels.opacity[texel_index(1, 1, 1)] = [9, 9, 9, 1];
        segment.crop = crop_to_bounds(&mut channels);
        segment.channels = Some(channels);
        let record = persist::build_brick_record(&segment, TextureFormat::Rgba8);

        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&[0xAA; 32]).expect("padding");
        file.write_all(&record).expect("record");
        file.flush().expect("flush");

        let mut engine = StreamEngine::new(
            config(1, 16, Some(file.path().to_path_buf())),
            Arc::clone(&pool),
        )
        .expect("engine");

        assert!(engine.start(StreamJob::Read {
            segment: SegmentId(3),
            segment_key: 7,
            offset: 32,
            length: record.len() as u32,
        }));

        let results = wait_for_results(&engine, 1);
        assert_eq!(results[0].segment, SegmentId(3));
        match &results[0].outcome {
            StreamOutcome::Loaded(payload) => {
                assert_eq!(payload.voxel_count, 1);
                assert_eq!(payload.crop, segment.crop);
            }
            _ => panic!("expected a loaded payload"),
        }
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_short_read_is_fatal() {
        let pool = BrickBufferPool::new(4);
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&[1, 2, 3, 4]).expect("write");
        file.flush().expect("flush");

        let mut engine = StreamEngine::new(
            config(1, 16, Some(file.path().to_path_buf())),
            pool,
        )
        .expect("engine");

        assert!(engine.start(StreamJob::Read {
            segment: SegmentId(0),
            segment_key: 0,
            offset: 0,
            length: 64,
        }));

        let results = wait_for_results(&engine, 1);
        match &results[0].outcome {
            StreamOutcome::Failed(Error::Corrupt(msg)) => {
                assert!(msg.contains("short read"));
            }
            _ => panic!("expected corruption failure"),
        }
    }

    #[test]
    fn test_build_job_runs_voxelization() {
        let pool = BrickBufferPool::new(8);
        let mut engine = StreamEngine::new(config(1, 16, None), Arc::clone(&pool)).expect("engine");

        let bounds = Aabb::new(Vec3::ZERO, Vec3::splat(32.0));
        let params = VoxelizeParams {
            node_bounds: bounds,
            parent_mesh: None,
            parent_merged: Vec::new(),
            sources: SceneSources::empty(),
            cfg: VoxelizeConfig::from_config(&crate::config::SvoConfig::default()),
            pool,
        };
        assert!(engine.start(StreamJob::Build(Box::new(VoxelizeJob {
            segment: SegmentId(4),
            params,
        }))));

        let results = wait_for_results(&engine, 1);
        assert_eq!(results[0].segment, SegmentId(4));
        match &results[0].outcome {
            StreamOutcome::Built(out) => assert!(out.payload.crop.is_empty()),
            _ => panic!("expected a built payload"),
        }
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let pool = BrickBufferPool::new(4);
        let mut engine = StreamEngine::new(config(2, 16, None), pool).expect("engine");
        engine.shutdown();
        // second call is a no-op
        engine.shutdown();
    }
}
