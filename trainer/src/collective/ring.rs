//! Ring collectives for data-parallel training.
//!
//! All-reduce is the bandwidth-optimal ring algorithm used by NCCL and
//! Horovod:
//! 1. **Reduce-Scatter**: each worker ends up with the full sum of one chunk
//! 2. **All-Gather**: the summed chunks travel around the ring to everyone
//!
//! Every collective is bounded by a timeout; a stalled neighbour surfaces as
//! [`TrainerError::RankUnreachable`]. A rank that times out moves on, so its
//! neighbours may later see traffic from an abandoned collective (dropped) or
//! from one they haven't reached yet (kept for the next call). Either way the
//! ring falls back into step at the next collective both sides enter.

use std::time::Duration;
use tracing::{debug, trace};

use crate::errors::{Result, TrainerError};

use super::message::{AllReducePhase, TensorMessage};
use super::tensor::{ParamMap, Tensor};
use super::transport::RingTransport;

/// Key index reserved for barrier traffic.
const BARRIER_KEY: u32 = u32::MAX;
const BARRIER_NAME: &str = "barrier";

/// Where in which collective a message belongs.
#[derive(Debug, Clone, Copy)]
struct Position<'a> {
    sequence: u64,
    key_index: u32,
    key: &'a str,
    phase: AllReducePhase,
    step: u32,
}

/// A rank's view of the ring plus the collective sequence counter.
pub struct WorkerRing<T: RingTransport> {
    transport: T,
    sequence: u64,
    timeout: Duration,
    /// Message for a collective this rank hasn't entered yet
    pending: Option<TensorMessage>,
}

impl<T: RingTransport> WorkerRing<T> {
    pub fn new(transport: T, timeout: Duration) -> Self {
        Self {
            transport,
            sequence: 0,
            timeout,
            pending: None,
        }
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.transport.size()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sum every tensor in `tensors` across all ranks.
    ///
    /// Keys are processed in sorted order; every rank must pass the same key
    /// set with the same element counts. Output keys and shapes equal the
    /// input's.
    pub async fn all_reduce_sum(&mut self, tensors: &ParamMap) -> Result<ParamMap> {
        let sequence = self.next_sequence();
        let timeout = self.timeout;
        let left = self.transport.left_rank();

        tokio::time::timeout(timeout, self.all_reduce_inner(sequence, tensors))
            .await
            .map_err(|_| TrainerError::RankUnreachable { rank: left, timeout })?
    }

    /// Elementwise mean across ranks.
    pub async fn all_reduce_mean(&mut self, tensors: &ParamMap) -> Result<ParamMap> {
        let mut reduced = self.all_reduce_sum(tensors).await?;
        let factor = 1.0 / self.size() as f32;
        reduced.values_mut().for_each(|t| t.scale(factor));
        Ok(reduced)
    }

    /// Replace every rank's tensors with those of `root`.
    pub async fn broadcast(&mut self, tensors: &ParamMap, root: usize) -> Result<ParamMap> {
        if root >= self.size() {
            return Err(TrainerError::Config(format!(
                "Broadcast root {} out of range for size {}",
                root,
                self.size()
            )));
        }

        let sequence = self.next_sequence();
        let timeout = self.timeout;
        let left = self.transport.left_rank();

        tokio::time::timeout(timeout, self.broadcast_inner(sequence, tensors, root))
            .await
            .map_err(|_| TrainerError::RankUnreachable { rank: left, timeout })?
    }

    /// Wait until every rank has reached this point.
    ///
    /// Implemented as an all-reduce of a single 1.0, so completion on any
    /// rank implies every rank contributed.
    pub async fn barrier(&mut self) -> Result<()> {
        let sequence = self.next_sequence();
        let timeout = self.timeout;
        let left = self.transport.left_rank();
        let size = self.size();

        let count = tokio::time::timeout(
            timeout,
            self.ring_all_reduce(sequence, BARRIER_KEY, BARRIER_NAME, Tensor::from_vec(vec![1.0])),
        )
        .await
        .map_err(|_| TrainerError::RankUnreachable { rank: left, timeout })??;

        if count.data.first().map(|&c| c.round() as usize) != Some(size) {
            return Err(TrainerError::Collective(format!(
                "Barrier counted {:?} ranks, expected {}",
                count.data, size
            )));
        }

        debug!(rank = self.rank(), sequence, "Barrier complete");
        Ok(())
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }

    async fn all_reduce_inner(&mut self, sequence: u64, tensors: &ParamMap) -> Result<ParamMap> {
        let mut reduced = ParamMap::new();

        for (key_index, (name, tensor)) in tensors.iter().enumerate() {
            let key_index = u32::try_from(key_index)
                .map_err(|_| TrainerError::Collective("Too many tensors in one collective".into()))?;

            let summed = self
                .ring_all_reduce(sequence, key_index, name, tensor.clone())
                .await?
                .reshape(tensor.shape.clone())?;

            reduced.insert(name.clone(), summed);
        }

        Ok(reduced)
    }

    /// Ring all-reduce of a single tensor; returns the flat sum.
    async fn ring_all_reduce(
        &mut self,
        sequence: u64,
        key_index: u32,
        key: &str,
        partial_result: Tensor,
    ) -> Result<Tensor> {
        let n = self.size();
        let my_pos = self.rank();

        let mut chunks = partial_result.chunk(n);

        trace!(n, my_pos, sequence, key_index, "Starting ring all-reduce");

        // After this phase, worker i has the complete sum of chunk (i+1) % n
        for step in 0..(n - 1) {
            let send_idx = (my_pos + n - step) % n;
            let recv_idx = (my_pos + n - step - 1) % n;

            let received = self
                .exchange(
                    Position {
                        sequence,
                        key_index,
                        key,
                        phase: AllReducePhase::ReduceScatter,
                        step: step as u32,
                    },
                    &chunks[send_idx],
                )
                .await?;

            chunks[recv_idx] = chunks[recv_idx].add(&received)?;
        }

        for step in 0..(n - 1) {
            let send_idx = (my_pos + n - step + 1) % n;
            let recv_idx = (my_pos + n - step) % n;

            let received = self
                .exchange(
                    Position {
                        sequence,
                        key_index,
                        key,
                        phase: AllReducePhase::AllGather,
                        step: step as u32,
                    },
                    &chunks[send_idx],
                )
                .await?;

            if received.len() != chunks[recv_idx].len() {
                return Err(TrainerError::Collective(format!(
                    "All-gather chunk size mismatch: {} vs {}",
                    received.len(),
                    chunks[recv_idx].len()
                )));
            }
            chunks[recv_idx] = received;
        }

        Ok(Tensor::concat(chunks))
    }

    async fn broadcast_inner(
        &mut self,
        sequence: u64,
        tensors: &ParamMap,
        root: usize,
    ) -> Result<ParamMap> {
        let n = self.size();
        let rank = self.rank();
        // Hops from the root along the ring
        let distance = (rank + n - root) % n;
        let mut result = ParamMap::new();

        for (key_index, (name, tensor)) in tensors.iter().enumerate() {
            let position = Position {
                sequence,
                key_index: key_index as u32,
                key: name.as_str(),
                phase: AllReducePhase::Broadcast,
                step: 0,
            };

            let value = if distance == 0 {
                tensor.clone()
            } else {
                self.receive(position).await?.into_tensor()?
            };

            // The last rank before the root stops the relay
            if distance < n - 1 {
                let message = TensorMessage::new(
                    sequence,
                    position.key_index,
                    name,
                    AllReducePhase::Broadcast,
                    0,
                    rank as u32,
                    &value,
                );
                self.transport.send_right(message).await?;
            }

            if value.len() != tensor.len() {
                return Err(TrainerError::Collective(format!(
                    "Broadcast tensor '{}' has {} elements, local copy has {}",
                    name,
                    value.len(),
                    tensor.len()
                )));
            }
            result.insert(name.clone(), value);
        }

        Ok(result)
    }

    async fn exchange(&mut self, position: Position<'_>, chunk: &Tensor) -> Result<Tensor> {
        let outgoing = TensorMessage::new(
            position.sequence,
            position.key_index,
            position.key,
            position.phase,
            position.step,
            self.rank() as u32,
            chunk,
        );
        self.transport.send_right(outgoing).await?;
        self.receive(position).await?.into_tensor()
    }

    /// Next message from the left neighbour for `position`.
    ///
    /// Leftovers from an abandoned earlier collective are dropped. A message
    /// from a later collective means the neighbour gave up on this one: it is
    /// kept for the next call and this collective fails.
    async fn receive(&mut self, position: Position<'_>) -> Result<TensorMessage> {
        loop {
            let received = match self.pending.take() {
                Some(message) => message,
                None => self.transport.recv_left().await?,
            };

            if received.sequence < position.sequence {
                debug!(
                    stale_sequence = received.sequence,
                    sequence = position.sequence,
                    "Dropping stale ring message"
                );
                continue;
            }

            if received.sequence > position.sequence {
                let (from_rank, ahead) = (received.from_rank, received.sequence);
                self.pending = Some(received);
                return Err(TrainerError::Collective(format!(
                    "Rank {} moved on to collective {} while this rank was in {}",
                    from_rank, ahead, position.sequence
                )));
            }

            Self::check_position(&received, position)?;
            return Ok(received);
        }
    }

    fn check_position(received: &TensorMessage, position: Position<'_>) -> Result<()> {
        if received.matches(
            position.sequence,
            position.key_index,
            position.key,
            position.phase,
            position.step,
        ) {
            return Ok(());
        }

        Err(TrainerError::Collective(format!(
            "Out-of-order ring message from rank {}: got (seq {}, key '{}', {:?}, step {}), expected (seq {}, key '{}', {:?}, step {})",
            received.from_rank,
            received.sequence,
            received.key,
            received.phase,
            received.step,
            position.sequence,
            position.key,
            position.phase,
            position.step
        )))
    }
}
