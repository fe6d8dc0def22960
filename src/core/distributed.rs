//! Tile distribution across cooperating workers.
//!
//! Rank 0 coordinates: it computes its own tiles, waits on a barrier, then
//! collects exactly one result message from every other rank in rank order
//! and merges the tiles into a single raster. Workers never block: they
//! announce their arrival and report straight away, so the coordinator's
//! waits are the only blocking points. Each of those carries a timeout, and a
//! lost worker surfaces as [`StackError::DistributedCommunication`] instead of
//! a hang.

use crate::core::stack::ObservationStack;
use crate::core::estimator::PixelEstimator;
use crate::core::tiles::{Tile, TileAssignment, TileGrid};
use crate::types::{RateMaps, StackError, StackResult, Vcm};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use ndarray::s;
use std::time::{Duration, Instant};

/// Rank of the coordinating worker
pub const COORDINATOR: usize = 0;

/// Computed outputs for one tile
#[derive(Debug, Clone, PartialEq)]
pub struct TileResult {
    pub tile: Tile,
    pub maps: RateMaps,
}

/// Payloads exchanged between workers
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    BarrierArrive,
    TileResults(Vec<TileResult>),
}

impl Message {
    fn kind(&self) -> &'static str {
        match self {
            Message::BarrierArrive => "barrier arrive",
            Message::TileResults(_) => "tile results",
        }
    }
}

/// A message with its sender and tag
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: usize,
    pub tag: usize,
    pub message: Message,
}

/// Point-to-point messaging between ranks with bounded waits
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn send(&self, destination: usize, tag: usize, message: Message) -> StackResult<()>;

    /// Next message from `source`, failing once `timeout` has elapsed
    fn receive(&mut self, source: usize, timeout: Duration) -> StackResult<Envelope>;

    /// Coordinator blocks until every rank has arrived, failing after `timeout`
    /// per rank; other ranks announce their arrival and return.
    fn barrier(&mut self, timeout: Duration) -> StackResult<()> {
        let rank = self.rank();
        if rank == COORDINATOR {
            for source in 1..self.size() {
                expect(self.receive(source, timeout)?, "barrier arrive", |m| {
                    matches!(m, Message::BarrierArrive)
                })?;
            }
        } else {
            self.send(COORDINATOR, rank, Message::BarrierArrive)?;
        }
        Ok(())
    }
}

fn expect(
    envelope: Envelope,
    wanted: &str,
    matches: impl Fn(&Message) -> bool,
) -> StackResult<Envelope> {
    if matches(&envelope.message) {
        Ok(envelope)
    } else {
        Err(StackError::DistributedCommunication {
            rank: envelope.source,
            reason: format!("expected {}, received {}", wanted, envelope.message.kind()),
        })
    }
}

/// In-process communicator backed by one crossbeam channel per ordered rank pair
pub struct ChannelCommunicator {
    rank: usize,
    outboxes: Vec<Sender<Envelope>>,
    /// Indexed by source rank
    inboxes: Vec<Receiver<Envelope>>,
}

impl ChannelCommunicator {
    /// Fully connected group of `size` endpoints, indexed by rank.
    ///
    /// Only rank `s` holds the sender of the `s -> d` channel, so dropping an
    /// endpoint disconnects it from every peer.
    pub fn group(size: usize) -> Vec<ChannelCommunicator> {
        let mut outboxes: Vec<Vec<Sender<Envelope>>> = (0..size).map(|_| Vec::new()).collect();
        let mut inboxes: Vec<Vec<Receiver<Envelope>>> = (0..size).map(|_| Vec::new()).collect();
        for source in 0..size {
            for destination in 0..size {
                let (tx, rx) = unbounded();
                outboxes[source].push(tx);
                inboxes[destination].push(rx);
            }
        }
        outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (outboxes, inboxes))| ChannelCommunicator {
                rank,
                outboxes,
                inboxes,
            })
            .collect()
    }
}

impl Communicator for ChannelCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.outboxes.len()
    }

    fn send(&self, destination: usize, tag: usize, message: Message) -> StackResult<()> {
        let outbox = self.outboxes.get(destination).ok_or_else(|| {
            StackError::DistributedCommunication {
                rank: destination,
                reason: format!("no such rank in a group of {}", self.outboxes.len()),
            }
        })?;
        outbox
            .send(Envelope {
                source: self.rank,
                tag,
                message,
            })
            .map_err(|_| StackError::DistributedCommunication {
                rank: destination,
                reason: "receiver has shut down".to_string(),
            })
    }

    fn receive(&mut self, source: usize, timeout: Duration) -> StackResult<Envelope> {
        let inbox = self.inboxes.get(source).ok_or_else(|| {
            StackError::DistributedCommunication {
                rank: source,
                reason: format!("no such rank in a group of {}", self.inboxes.len()),
            }
        })?;

        // Messages already queued are delivered before a disconnect is reported
        match inbox.recv_deadline(Instant::now() + timeout) {
            Ok(envelope) => Ok(envelope),
            Err(RecvTimeoutError::Timeout) => Err(StackError::DistributedCommunication {
                rank: source,
                reason: format!("no message within {:.1}s", timeout.as_secs_f64()),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(StackError::DistributedCommunication {
                rank: source,
                reason: "peer disconnected before sending".to_string(),
            }),
        }
    }
}

/// Cluster layout shared by every rank
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOptions {
    pub workers: usize,
    /// Explicit `(tile_rows, tile_cols)`; derived from `workers` when absent
    pub tile_grid: Option<(usize, usize)>,
    pub assignment: TileAssignment,
    pub timeout: Duration,
}

impl ClusterOptions {
    /// The partition every rank derives independently
    pub fn tile_grid(&self, shape: (usize, usize)) -> StackResult<TileGrid> {
        match self.tile_grid {
            Some(grid) => TileGrid::with_grid(shape, grid),
            None => TileGrid::for_workers(shape, self.workers),
        }
    }
}

/// Estimate every pixel of the given tiles
pub fn compute_tiles(
    tiles: &[Tile],
    stack: &ObservationStack,
    vcm: &Vcm,
    estimator: &PixelEstimator,
) -> Vec<TileResult> {
    tiles
        .iter()
        .map(|tile| {
            let mut maps = RateMaps::empty(tile.shape());
            for (i, row) in tile.rows().enumerate() {
                for (j, col) in tile.cols().enumerate() {
                    let estimate = stack.estimate_pixel(estimator, vcm, row, col);
                    maps.set(i, j, &estimate);
                }
            }
            TileResult { tile: *tile, maps }
        })
        .collect()
}

/// Non-coordinating rank: compute own tiles, arrive at the barrier, report once
pub fn run_worker<C: Communicator>(
    mut comm: C,
    stack: &ObservationStack,
    vcm: &Vcm,
    estimator: &PixelEstimator,
    options: &ClusterOptions,
) -> StackResult<()> {
    let rank = comm.rank();
    let grid = options.tile_grid(stack.shape())?;
    let tiles = grid.assigned(rank, comm.size(), options.assignment);
    log::debug!("Worker {} has {} of {} tiles", rank, tiles.len(), grid.len());

    let results = compute_tiles(&tiles, stack, vcm, estimator);

    comm.barrier(options.timeout)?;
    comm.send(COORDINATOR, rank, Message::TileResults(results))?;
    log::debug!("Worker {} sent its tile results", rank);
    Ok(())
}

/// Coordinating rank: compute own tiles, then collect and merge everyone else's
pub fn run_coordinator<C: Communicator>(
    mut comm: C,
    stack: &ObservationStack,
    vcm: &Vcm,
    estimator: &PixelEstimator,
    options: &ClusterOptions,
) -> StackResult<RateMaps> {
    let grid = options.tile_grid(stack.shape())?;
    let tiles = grid.assigned(comm.rank(), comm.size(), options.assignment);
    log::debug!("Coordinator has {} of {} tiles", tiles.len(), grid.len());

    let mut merged = RateMaps::empty(grid.shape());
    let mut placed = vec![false; grid.len()];

    for result in compute_tiles(&tiles, stack, vcm, estimator) {
        place_tile(&mut merged, &mut placed, &result, comm.rank())?;
    }

    comm.barrier(options.timeout)?;

    for source in 1..comm.size() {
        let envelope = expect(comm.receive(source, options.timeout)?, "tile results", |m| {
            matches!(m, Message::TileResults(_))
        })?;
        if let Message::TileResults(results) = envelope.message {
            log::debug!("Received {} tiles from worker {}", results.len(), source);
            for result in &results {
                place_tile(&mut merged, &mut placed, result, source)?;
            }
        }
    }

    let missing = placed.iter().filter(|p| !**p).count();
    if missing > 0 {
        return Err(StackError::Processing(format!(
            "{} of {} tiles were never computed",
            missing,
            grid.len()
        )));
    }

    Ok(merged)
}

fn place_tile(
    merged: &mut RateMaps,
    placed: &mut [bool],
    result: &TileResult,
    source: usize,
) -> StackResult<()> {
    let tile = &result.tile;
    let slot = placed.get_mut(tile.index).ok_or_else(|| StackError::DistributedCommunication {
        rank: source,
        reason: format!("unknown tile index {}", tile.index),
    })?;
    if *slot {
        return Err(StackError::DistributedCommunication {
            rank: source,
            reason: format!("tile {} delivered twice", tile.index),
        });
    }
    if result.maps.shape() != tile.shape() {
        return Err(StackError::DistributedCommunication {
            rank: source,
            reason: format!(
                "tile {} has shape {:?}, expected {:?}",
                tile.index,
                result.maps.shape(),
                tile.shape()
            ),
        });
    }

    merged.rate.slice_mut(s![tile.rows(), tile.cols()]).assign(&result.maps.rate);
    merged.error.slice_mut(s![tile.rows(), tile.cols()]).assign(&result.maps.error);
    merged.samples.slice_mut(s![tile.rows(), tile.cols()]).assign(&result.maps.samples);
    *slot = true;
    Ok(())
}

/// Run one coordinator and `workers - 1` worker threads over a channel group
pub fn run_cluster(
    stack: &ObservationStack,
    vcm: &Vcm,
    estimator: &PixelEstimator,
    options: &ClusterOptions,
) -> StackResult<RateMaps> {
    if options.workers == 0 {
        return Err(StackError::Configuration(
            "Distributed run requires at least one worker".to_string(),
        ));
    }

    log::info!("🛰️  Distributing stack rate over {} workers", options.workers);

    let mut endpoints = ChannelCommunicator::group(options.workers).into_iter();
    let coordinator = endpoints
        .next()
        .ok_or_else(|| StackError::Processing("empty communicator group".to_string()))?;

    std::thread::scope(|scope| {
        let handles: Vec<_> = endpoints
            .map(|comm| {
                let rank = comm.rank();
                (rank, scope.spawn(move || run_worker(comm, stack, vcm, estimator, options)))
            })
            .collect();

        let merged = run_coordinator(coordinator, stack, vcm, estimator, options);

        for (rank, handle) in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("Worker {} failed: {}", rank, e),
                Err(_) => log::error!("Worker {} panicked", rank),
            }
        }

        merged
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObservationLayer;
    use ndarray::Array2;

    fn small_stack() -> ObservationStack {
        let spans = [0.5, 1.0, 1.5, 2.0];
        let layers: Vec<ObservationLayer> = spans
            .iter()
            .map(|&t| {
                let phase = Array2::from_shape_fn((6, 5), |(r, c)| (t * (1.0 + r as f64 + 0.1 * c as f64)) as f32);
                ObservationLayer::new(phase, t)
            })
            .collect();
        ObservationStack::new(&layers, None).unwrap()
    }

    fn options(workers: usize) -> ClusterOptions {
        ClusterOptions {
            workers,
            tile_grid: None,
            assignment: TileAssignment::Block,
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_receive_selects_source() {
        let mut group = ChannelCommunicator::group(3);
        let mut root = group.remove(0);
        group[1].send(0, 2, Message::BarrierArrive).unwrap();
        group[0].send(0, 1, Message::BarrierArrive).unwrap();

        let first = root.receive(1, Duration::from_secs(1)).unwrap();
        let second = root.receive(2, Duration::from_secs(1)).unwrap();

        assert_eq!((first.source, first.tag), (1, 1));
        assert_eq!((second.source, second.tag), (2, 2));
    }

    #[test]
    fn test_receive_times_out() {
        let mut group = ChannelCommunicator::group(2);
        let result = group[0].receive(1, Duration::from_millis(20));

        match result {
            Err(StackError::DistributedCommunication { rank, .. }) => assert_eq!(rank, 1),
            other => panic!("expected communication failure, got {:?}", other),
        }
    }

    #[test]
    fn test_dropped_peer_fails_fast() {
        let mut group = ChannelCommunicator::group(3);
        let dropped = group.pop();
        drop(dropped);

        let started = Instant::now();
        let result = group[0].receive(2, Duration::from_secs(30));

        assert!(started.elapsed() < Duration::from_secs(5));
        match result {
            Err(StackError::DistributedCommunication { rank, reason }) => {
                assert_eq!(rank, 2);
                assert!(reason.contains("disconnected"));
            }
            other => panic!("expected communication failure, got {:?}", other),
        }
    }

    #[test]
    fn test_queued_message_survives_sender_drop() {
        let mut group = ChannelCommunicator::group(2);
        let worker = group.pop().unwrap();
        worker.send(COORDINATOR, 1, Message::BarrierArrive).unwrap();
        drop(worker);

        let envelope = group[0].receive(1, Duration::from_secs(1)).unwrap();
        assert_eq!(envelope.message, Message::BarrierArrive);
        assert!(group[0].receive(1, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_worker_does_not_wait_for_coordinator() {
        let stack = small_stack();
        let vcm = Array2::eye(4);
        let estimator = PixelEstimator::new(3.0, 2);
        let mut opts = options(2);
        opts.timeout = Duration::from_millis(10);

        let mut group = ChannelCommunicator::group(2).into_iter();
        let root = group.next().unwrap();
        let worker = group.next().unwrap();

        // Coordinator is idle for the whole of the worker's run
        run_worker(worker, &stack, &vcm, &estimator, &opts).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let merged = run_coordinator(root, &stack, &vcm, &estimator, &opts).unwrap();
        let single = run_cluster(&stack, &vcm, &estimator, &options(1)).unwrap();
        assert_eq!(merged, single);
    }

    #[test]
    fn test_cluster_matches_serial_tiles() {
        let stack = small_stack();
        let vcm = Array2::eye(4);
        let estimator = PixelEstimator::new(3.0, 2);

        let single = run_cluster(&stack, &vcm, &estimator, &options(1)).unwrap();
        let several = run_cluster(&stack, &vcm, &estimator, &options(3)).unwrap();

        assert_eq!(single.shape(), (6, 5));
        for (a, b) in single.rate.iter().zip(several.rate.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        for (a, b) in single.samples.iter().zip(several.samples.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_missing_worker_reported() {
        let stack = small_stack();
        let vcm = Array2::eye(4);
        let estimator = PixelEstimator::new(3.0, 2);
        let mut opts = options(3);
        opts.timeout = Duration::from_millis(100);

        let mut group = ChannelCommunicator::group(3).into_iter();
        let root = group.next().unwrap();
        let worker = group.next().unwrap();
        // rank 2 never runs
        let _silent = group.next().unwrap();

        let result = std::thread::scope(|scope| {
            let handle = scope.spawn(|| run_worker(worker, &stack, &vcm, &estimator, &opts));
            let merged = run_coordinator(root, &stack, &vcm, &estimator, &opts);
            let _ = handle.join();
            merged
        });

        match result {
            Err(StackError::DistributedCommunication { rank, .. }) => assert_eq!(rank, 2),
            other => panic!("expected communication failure, got {:?}", other.map(|m| m.shape())),
        }
    }
}
