//! Keeping replicated models identical across workers.
//!
//! Every worker holds a full replica of the model and a contiguous
//! block of rows. During optimisation only rank 0 runs the optimizer;
//! each parameter update it makes is pushed to the others as a
//! continue signal followed by the parameter vector, and the session
//! ends with a stop signal.

use crate::common::*;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;

/// another parameter vector follows
pub const SIGNAL_CONTINUE: i32 = 1;
/// optimisation finished
pub const SIGNAL_STOP: i32 = -1;

/// Collective operations over a fixed group of workers.
///
/// All members must call the same collectives in the same order.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// `root` sends `signal`; everyone else overwrites theirs with it
    fn broadcast_signal(&self, signal: &mut i32, root: usize) -> anyhow::Result<()>;

    /// `root` sends `payload`; everyone else replaces theirs with it
    fn broadcast(&self, payload: &mut Vec<f64>, root: usize) -> anyhow::Result<()>;

    /// Element-wise sum over all workers, written back into `buf`
    fn allreduce_sum(&self, buf: &mut [f64]) -> anyhow::Result<()>;

    /// Every worker's `local`, in rank order
    fn allgather(&self, local: &[f64]) -> anyhow::Result<Vec<Vec<f64>>>;
}

enum Body {
    Signal(i32),
    Data(Vec<f64>),
}

struct Packet {
    from: usize,
    body: Body,
}

/// In-process transport: one endpoint per worker thread.
///
/// Reductions are gathered on rank 0, summed in rank order and sent
/// back, so all workers see bit-identical results.
pub struct LocalComm {
    rank: usize,
    size: usize,
    inbox: Receiver<Packet>,
    // no sender to itself, so a worker whose peers all dropped sees a
    // disconnect instead of blocking forever
    peers: Vec<Option<Sender<Packet>>>,
}

impl LocalComm {
    /// Create `size` connected endpoints; endpoint `r` has rank `r`
    pub fn group(size: usize) -> Vec<LocalComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalComm {
                rank,
                size,
                inbox,
                peers: senders
                    .iter()
                    .enumerate()
                    .map(|(r, tx)| (r != rank).then(|| tx.clone()))
                    .collect(),
            })
            .collect()
    }

    fn send(&self, to: usize, body: Body) -> anyhow::Result<()> {
        let tx = self.peers.get(to).and_then(|tx| tx.as_ref()).ok_or_else(|| {
            LentilError::Transport(format!("worker {} cannot send to {}", self.rank, to))
        })?;
        tx.send(Packet {
            from: self.rank,
            body,
        })
        .map_err(|_| LentilError::Transport(format!("worker {} hung up on {}", to, self.rank)))?;
        Ok(())
    }

    fn recv(&self) -> anyhow::Result<Packet> {
        self.inbox.recv().map_err(|_| {
            LentilError::Transport(format!("all peers of worker {} hung up", self.rank)).into()
        })
    }

    fn recv_data_from(&self, from: usize) -> anyhow::Result<Vec<f64>> {
        match self.recv()? {
            Packet {
                from: src,
                body: Body::Data(data),
            } if src == from => Ok(data),
            Packet { from: src, .. } => Err(LentilError::Transport(format!(
                "worker {} expected data from {}, got a different message from {}",
                self.rank, from, src
            ))
            .into()),
        }
    }

    /// Rank 0 receives one data packet from every other worker
    fn gather_on_root(&self, local: &[f64]) -> anyhow::Result<Vec<Vec<f64>>> {
        let mut parts: Vec<Option<Vec<f64>>> = (0..self.size).map(|_| None).collect();
        parts[ROOT_RANK] = Some(local.to_vec());
        for _ in 1..self.size {
            match self.recv()? {
                Packet {
                    from,
                    body: Body::Data(data),
                } if from < self.size && parts[from].is_none() => {
                    parts[from] = Some(data);
                }
                Packet { from, .. } => {
                    return Err(LentilError::Transport(format!(
                        "unexpected message from worker {} during a collective",
                        from
                    ))
                    .into());
                }
            }
        }
        Ok(parts.into_iter().flatten().collect())
    }

    fn check_root(&self, root: usize) -> anyhow::Result<()> {
        if root >= self.size {
            return Err(LentilError::Transport(format!(
                "root {} outside a group of {}",
                root, self.size
            ))
            .into());
        }
        Ok(())
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast_signal(&self, signal: &mut i32, root: usize) -> anyhow::Result<()> {
        self.check_root(root)?;
        if self.rank == root {
            for r in (0..self.size).filter(|&r| r != root) {
                self.send(r, Body::Signal(*signal))?;
            }
            return Ok(());
        }
        match self.recv()? {
            Packet {
                from,
                body: Body::Signal(s),
            } if from == root => {
                *signal = s;
                Ok(())
            }
            Packet { from, .. } => Err(LentilError::Transport(format!(
                "worker {} expected a signal from {}, got a different message from {}",
                self.rank, root, from
            ))
            .into()),
        }
    }

    fn broadcast(&self, payload: &mut Vec<f64>, root: usize) -> anyhow::Result<()> {
        self.check_root(root)?;
        if self.rank == root {
            for r in (0..self.size).filter(|&r| r != root) {
                self.send(r, Body::Data(payload.clone()))?;
            }
        } else {
            *payload = self.recv_data_from(root)?;
        }
        Ok(())
    }

    fn allreduce_sum(&self, buf: &mut [f64]) -> anyhow::Result<()> {
        if self.size < 2 {
            return Ok(());
        }

        if self.rank == ROOT_RANK {
            let parts = self.gather_on_root(buf)?;
            let mut acc = parts[ROOT_RANK].clone();
            for part in parts.iter().skip(1) {
                if part.len() != acc.len() {
                    return Err(LentilError::Transport(format!(
                        "allreduce length mismatch: {} vs {}",
                        part.len(),
                        acc.len()
                    ))
                    .into());
                }
                acc.iter_mut().zip(part.iter()).for_each(|(a, b)| *a += b);
            }
            for r in 1..self.size {
                self.send(r, Body::Data(acc.clone()))?;
            }
            buf.copy_from_slice(&acc);
        } else {
            self.send(ROOT_RANK, Body::Data(buf.to_vec()))?;
            let reduced = self.recv_data_from(ROOT_RANK)?;
            if reduced.len() != buf.len() {
                return Err(LentilError::Transport(format!(
                    "allreduce length mismatch: {} vs {}",
                    reduced.len(),
                    buf.len()
                ))
                .into());
            }
            buf.copy_from_slice(&reduced);
        }
        Ok(())
    }

    fn allgather(&self, local: &[f64]) -> anyhow::Result<Vec<Vec<f64>>> {
        if self.size < 2 {
            return Ok(vec![local.to_vec()]);
        }

        if self.rank == ROOT_RANK {
            let parts = self.gather_on_root(local)?;
            for r in 1..self.size {
                for part in parts.iter() {
                    self.send(r, Body::Data(part.clone()))?;
                }
            }
            Ok(parts)
        } else {
            self.send(ROOT_RANK, Body::Data(local.to_vec()))?;
            (0..self.size)
                .map(|_| self.recv_data_from(ROOT_RANK))
                .collect()
        }
    }
}

/// Split `n` rows into `workers` contiguous blocks `[start, end)`; the
/// first `n % workers` blocks carry one extra row.
pub fn divide_rows(n: usize, workers: usize) -> Vec<(usize, usize)> {
    if workers == 0 {
        return vec![];
    }
    let base = n / workers;
    let extra = n % workers;
    let mut start = 0;
    (0..workers)
        .map(|w| {
            let len = base + usize::from(w < extra);
            let block = (start, start + len);
            start += len;
            block
        })
        .collect()
}

/// The block of rows owned by one worker and the table of all blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowPartition {
    pub start: usize,
    pub end: usize,
    pub table: Vec<(usize, usize)>,
}

impl RowPartition {
    pub fn new(n: usize, rank: usize, size: usize) -> anyhow::Result<Self> {
        if rank >= size {
            return Err(LentilError::Transport(format!(
                "rank {} outside a group of {}",
                rank, size
            ))
            .into());
        }
        let table = divide_rows(n, size);
        let (start, end) = table[rank];
        Ok(Self { start, end, table })
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Anything that can be brought in line with rank 0's parameters
pub trait Replica {
    fn apply_parameters(&mut self, theta: &[f64]) -> anyhow::Result<()>;
}

/// Rank 0: announce and send a new parameter vector
pub fn broadcast_update(comm: &dyn Communicator, theta: &[f64]) -> anyhow::Result<()> {
    let mut signal = SIGNAL_CONTINUE;
    comm.broadcast_signal(&mut signal, ROOT_RANK)?;
    let mut payload = theta.to_vec();
    comm.broadcast(&mut payload, ROOT_RANK)?;
    Ok(())
}

/// Rank 0: release the followers
pub fn broadcast_stop(comm: &dyn Communicator) -> anyhow::Result<()> {
    let mut signal = SIGNAL_STOP;
    comm.broadcast_signal(&mut signal, ROOT_RANK)
}

/// Ranks other than 0: mirror rank 0's updates until told to stop.
///
/// Returns the number of updates applied. Any signal other than
/// continue or stop ends the loop with [`LentilError::Protocol`].
pub fn follow<R: Replica + ?Sized>(
    comm: &dyn Communicator,
    replica: &mut R,
) -> anyhow::Result<usize> {
    let mut applied = 0;
    loop {
        let mut signal = 0;
        comm.broadcast_signal(&mut signal, ROOT_RANK)?;
        match signal {
            SIGNAL_CONTINUE => {
                let mut theta = vec![];
                comm.broadcast(&mut theta, ROOT_RANK)?;
                replica.apply_parameters(&theta)?;
                applied += 1;
            }
            SIGNAL_STOP => {
                debug!("worker {} stopping after {} updates", comm.rank(), applied);
                return Ok(applied);
            }
            signal => {
                return Err(LentilError::Protocol {
                    rank: comm.rank(),
                    signal,
                }
                .into());
            }
        }
    }
}

/// Process-local view of a distributed run; never persisted
pub struct DistributedSession {
    pub comm: Arc<dyn Communicator>,
    pub partition: RowPartition,
    pub y_local: Mat,
}

/// What an evidence engine needs to work on one worker's rows
pub struct Shard<'a> {
    pub comm: &'a dyn Communicator,
    pub partition: &'a RowPartition,
    pub y_local: &'a Mat,
}

impl DistributedSession {
    pub fn new(comm: Arc<dyn Communicator>, y: &Mat) -> anyhow::Result<Self> {
        let partition = RowPartition::new(y.nrows(), comm.rank(), comm.size())?;
        let y_local = y.rows(partition.start, partition.len()).into_owned();
        info!(
            "worker {}/{} owns rows [{}, {})",
            comm.rank(),
            comm.size(),
            partition.start,
            partition.end
        );
        Ok(Self {
            comm,
            partition,
            y_local,
        })
    }

    pub fn is_root(&self) -> bool {
        self.comm.rank() == ROOT_RANK
    }

    pub fn shard(&self) -> Shard<'_> {
        Shard {
            comm: self.comm.as_ref(),
            partition: &self.partition,
            y_local: &self.y_local,
        }
    }
}
