/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The per-rank collective engine.
//!
//! A [`CollectiveEngine`] owns every live collective instance of one
//! physical rank, keyed by [`CollectiveKey`]. Operations enter through
//! [`CollectiveEngine::start`]; messages from peers enter through
//! [`CollectiveEngine::incoming`]. Messages for an occurrence that has not
//! started here yet are queued per key and handed over, in arrival order,
//! when it starts.
//!
//! Every occurrence of a key gets an epoch: the number of earlier
//! occurrences of that key on this rank. Peers run the same sequence of
//! occurrences, so epochs agree, and a message names the occurrence it
//! belongs to. A message for an occurrence that already finished here is a
//! protocol error; one for an occurrence that has not started is queued.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::actor::StuckReport;
use crate::algorithm::AlgorithmTable;
use crate::algorithm::fill;
use crate::communicator::Communicator;
use crate::communicator::CommunicatorError;
use crate::config::EngineConfig;
use crate::config::SendCompletion;
use crate::error::CollectiveError;
use crate::instance::CollectiveInstance;
use crate::instance::Completion;
use crate::kind::CollectiveKey;
use crate::message::AckMessage;
use crate::message::Message;
use crate::message::WorkMessage;
use crate::operation::Operation;
use crate::transport::CqId;
use crate::transport::PhysicalRank;
use crate::transport::Transport;

pub struct CollectiveEngine<T: Transport> {
    transport: T,
    config: EngineConfig,
    algorithms: AlgorithmTable,
    world: Arc<Communicator>,
    instances: HashMap<CollectiveKey, CollectiveInstance>,
    /// Messages for occurrences that have not started here.
    pending: HashMap<CollectiveKey, VecDeque<WorkMessage>>,
    /// Next epoch per key. Entries outlive their instances: a tag reused
    /// as soon as it retires here must not match a peer still finishing
    /// the earlier occurrence.
    epochs: HashMap<CollectiveKey, u64>,
    /// Finished instances, dropped on the next entry into the engine.
    retired: Vec<CollectiveInstance>,
    /// Completions produced while waiting on another queue.
    held: HashMap<CqId, VecDeque<Completion>>,
}

impl<T: Transport> CollectiveEngine<T> {
    /// An engine for `transport`'s rank in a world of `world_size` ranks.
    pub fn new(transport: T, world_size: usize, config: EngineConfig) -> Result<Self, CollectiveError> {
        let algorithms = AlgorithmTable::from_config(&config)?;
        let world = Arc::new(Communicator::world(world_size)?);
        if !world.contains(transport.rank()) {
            return Err(CommunicatorError::RankOutOfRange {
                rank: transport.rank(),
                size: world_size,
            }
            .into());
        }
        Ok(Self {
            transport,
            config,
            algorithms,
            world,
            instances: HashMap::new(),
            pending: HashMap::new(),
            epochs: HashMap::new(),
            retired: Vec::new(),
            held: HashMap::new(),
        })
    }

    pub fn rank(&self) -> PhysicalRank {
        self.transport.rank()
    }

    pub fn world(&self) -> &Arc<Communicator> {
        &self.world
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn algorithms(&self) -> &AlgorithmTable {
        &self.algorithms
    }

    /// The strategy table, for registering or selecting algorithms.
    pub fn algorithms_mut(&mut self) -> &mut AlgorithmTable {
        &mut self.algorithms
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Instances currently registered, live or persistent.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Actors not yet done, over every instance.
    pub fn actor_count(&self) -> usize {
        self.instances.values().map(CollectiveInstance::actor_count).sum()
    }

    /// Messages queued for occurrences that have not started.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    pub fn has_instance(&self, key: &CollectiveKey) -> bool {
        self.instances.contains_key(key)
    }

    pub fn instance_epoch(&self, key: &CollectiveKey) -> Option<u64> {
        self.instances.get(key).map(CollectiveInstance::epoch)
    }

    fn acknowledged(&self) -> bool {
        self.config.send_completion == SendCompletion::Acknowledged
    }

    /// Start `op` for one communicator rank resident here. Returns the
    /// completion when the occurrence finishes during the call.
    pub fn start(&mut self, op: Operation) -> Result<Option<Completion>, CollectiveError> {
        self.clean_up();
        let key = op.key();
        let physical = self.transport.rank();
        let rank = match op.rank {
            Some(rank) => rank,
            None => op
                .comm
                .physical_to_rank(physical)
                .ok_or(CollectiveError::NotAMember { key, physical })?,
        };
        op.validate(rank)?;
        let world = self.world.size();
        if let Some(&outside) = op.comm.ranks().iter().find(|&&p| p >= world) {
            return Err(CollectiveError::OutsideWorld {
                key,
                physical: outside,
                world,
            });
        }
        if op.comm.rank_to_physical(rank)? != physical {
            return Err(CollectiveError::NotAMember { key, physical });
        }
        if op.comm.size() == 1 {
            return Ok(Some(skip_collective(op, rank)));
        }

        let acknowledged = self.acknowledged();
        if let Some(instance) = self.instances.get_mut(&key) {
            if !instance.is_complete() {
                if instance.joined(rank) {
                    return Err(CollectiveError::TagInUse { key });
                }
                tracing::debug!(%key, epoch = instance.epoch(), rank, "merging into live instance");
                let done = instance.join(&mut self.transport, acknowledged, op, rank)?;
                return Ok(done.map(|c| self.on_complete(c)));
            }
            let epoch = next_epoch(&self.epochs, key);
            let (previous, previous_cq) = (instance.epoch(), instance.cq());
            tracing::debug!(%key, epoch, "re-arming persistent instance");
            instance.rearm(epoch, op.cq);
            let done = match instance.join(&mut self.transport, acknowledged, op, rank) {
                Ok(done) => done,
                Err(err) => {
                    instance.disarm(previous, previous_cq);
                    return Err(err);
                }
            };
            self.epochs.insert(key, epoch + 1);
            return self.after_join(key, done);
        }

        let algorithm = self.algorithms.get(op.kind)?;
        let epoch = next_epoch(&self.epochs, key);
        let resident = op.comm.local_ranks_of(physical).to_vec();
        tracing::debug!(
            %key,
            epoch,
            algorithm = algorithm.name(),
            size = op.comm.size(),
            "creating instance"
        );
        let mut instance = CollectiveInstance::new(
            key,
            op.comm.clone(),
            algorithm,
            epoch,
            op.cq,
            op.persistent,
            resident,
        );
        let done = instance.join(&mut self.transport, acknowledged, op, rank)?;
        self.epochs.insert(key, epoch + 1);
        self.instances.insert(key, instance);
        self.after_join(key, done)
    }

    fn after_join(
        &mut self,
        key: CollectiveKey,
        done: Option<Completion>,
    ) -> Result<Option<Completion>, CollectiveError> {
        let done = match done {
            Some(done) => Some(done),
            None => self.drain_pending(key)?,
        };
        Ok(done.map(|c| self.on_complete(c)))
    }

    /// Hand queued messages of the current occurrence to its instance;
    /// later occurrences stay queued.
    fn drain_pending(&mut self, key: CollectiveKey) -> Result<Option<Completion>, CollectiveError> {
        let Some(queue) = self.pending.remove(&key) else {
            return Ok(None);
        };
        let acknowledged = self.acknowledged();
        let Some(instance) = self.instances.get_mut(&key) else {
            self.pending.insert(key, queue);
            return Ok(None);
        };
        let epoch = instance.epoch();
        let (now, later): (VecDeque<_>, VecDeque<_>) = queue.into_iter().partition(|m| m.epoch == epoch);
        if !later.is_empty() {
            self.pending.insert(key, later);
        }
        tracing::debug!(%key, epoch, count = now.len(), "delivering queued messages");
        let mut done = None;
        for message in now {
            if let Some(completion) = instance.deliver(&mut self.transport, acknowledged, message)? {
                done = Some(completion);
            }
        }
        Ok(done)
    }

    /// Route a message from a peer.
    pub fn incoming(&mut self, message: Message) -> Result<Option<Completion>, CollectiveError> {
        self.clean_up();
        match message {
            Message::Work(work) => self.incoming_work(work),
            Message::Ack(ack) => self.incoming_ack(ack),
        }
    }

    fn incoming_work(&mut self, message: WorkMessage) -> Result<Option<Completion>, CollectiveError> {
        let key = message.key;
        let acknowledged = self.acknowledged();
        if let Some(instance) = self.instances.get_mut(&key) {
            if !instance.is_complete() && instance.epoch() == message.epoch {
                let done = instance.deliver(&mut self.transport, acknowledged, message)?;
                return Ok(done.map(|c| self.on_complete(c)));
            }
        }
        let next = self.epochs.get(&key).copied().unwrap_or(0);
        if message.epoch < next {
            return Err(CollectiveError::protocol(
                key,
                format!(
                    "message from rank {} round {} for finished epoch {}",
                    message.src_rank, message.round, message.epoch
                ),
            ));
        }
        tracing::debug!(
            %key,
            epoch = message.epoch,
            src_rank = message.src_rank,
            round = message.round,
            "queuing message for an occurrence not started here"
        );
        self.pending.entry(key).or_default().push_back(message);
        Ok(None)
    }

    fn incoming_ack(&mut self, ack: AckMessage) -> Result<Option<Completion>, CollectiveError> {
        let acknowledged = self.acknowledged();
        let instance = self
            .instances
            .get_mut(&ack.key)
            .filter(|i| !i.is_complete() && i.epoch() == ack.epoch)
            .ok_or_else(|| {
                CollectiveError::protocol(
                    ack.key,
                    format!("acknowledgement for epoch {} with no live instance", ack.epoch),
                )
            })?;
        let done = instance.ack(&mut self.transport, acknowledged, &ack)?;
        Ok(done.map(|c| self.on_complete(c)))
    }

    fn on_complete(&mut self, completion: Completion) -> Completion {
        let key = completion.key;
        let persistent = self
            .instances
            .get(&key)
            .is_some_and(CollectiveInstance::is_persistent);
        tracing::debug!(%key, epoch = completion.epoch, cq = completion.cq, persistent, "collective complete");
        if !persistent {
            if let Some(instance) = self.instances.remove(&key) {
                self.retired.push(instance);
            }
        }
        completion
    }

    fn clean_up(&mut self) {
        for instance in self.retired.drain(..) {
            tracing::trace!(key = %instance.key(), epoch = instance.epoch(), "dropping retired instance");
        }
    }

    /// Feed messages from the transport through [`Self::incoming`] until a
    /// completion for `cq` is available. Completions for other queues are
    /// held for later calls. Completions returned by [`Self::start`] are
    /// never held.
    pub fn block_until_next(&mut self, cq: CqId) -> Result<Completion, CollectiveError> {
        loop {
            if let Some(completion) = self.take_completion(cq) {
                return Ok(completion);
            }
            let message = self.transport.blocking_poll(cq)?;
            if let Some(completion) = self.incoming(message)? {
                if completion.cq == cq {
                    return Ok(completion);
                }
                self.held.entry(completion.cq).or_default().push_back(completion);
            }
        }
    }

    /// A held completion for `cq`, if any.
    pub fn take_completion(&mut self, cq: CqId) -> Option<Completion> {
        let queue = self.held.get_mut(&cq)?;
        let completion = queue.pop_front();
        if queue.is_empty() {
            self.held.remove(&cq);
        }
        completion
    }

    /// Run a barrier over the world with the system tag and wait for it.
    pub fn wait_barrier(&mut self) -> Result<(), CollectiveError> {
        if self.world.size() == 1 {
            return Ok(());
        }
        let op = Operation::barrier(self.world.clone(), self.config.system_tag);
        let key = op.key();
        let cq = op.cq;
        if self.start(op)?.is_some() {
            return Ok(());
        }
        self.wait_for(key, cq).map(|_| ())
    }

    fn wait_for(&mut self, key: CollectiveKey, cq: CqId) -> Result<Completion, CollectiveError> {
        loop {
            let message = self.transport.blocking_poll(cq)?;
            if let Some(completion) = self.incoming(message)? {
                if completion.key == key {
                    return Ok(completion);
                }
                self.held.entry(completion.cq).or_default().push_back(completion);
            }
        }
    }

    /// Ask every live instance whether it can make progress on its own.
    pub fn deadlock_check(&self) -> Vec<StuckReport> {
        let reports: Vec<StuckReport> = self
            .instances
            .values()
            .flat_map(CollectiveInstance::stuck_reports)
            .collect();
        for report in &reports {
            tracing::warn!("rank {} stuck: {}", self.transport.rank(), report);
        }
        for (key, queue) in &self.pending {
            tracing::warn!(%key, queued = queue.len(), "messages queued for an occurrence not started");
        }
        reports
    }

    /// Destroy the complete instance for `key`. Returns whether one was
    /// registered.
    pub fn release(&mut self, key: &CollectiveKey) -> Result<bool, CollectiveError> {
        match self.instances.get(key) {
            None => Ok(false),
            Some(instance) if !instance.is_complete() => Err(CollectiveError::TagInUse { key: *key }),
            Some(_) => {
                self.instances.remove(key);
                tracing::debug!(%key, "released instance");
                Ok(true)
            }
        }
    }
}

/// The epoch the next occurrence of `key` runs at. Callers commit it once
/// the occurrence has started.
fn next_epoch(epochs: &HashMap<CollectiveKey, u64>, key: CollectiveKey) -> u64 {
    epochs.get(&key).copied().unwrap_or(0)
}

/// Single-rank communicators: the result is the contribution itself.
fn skip_collective(op: Operation, rank: usize) -> Completion {
    let layout = op.layout(rank);
    let key = op.key();
    let output = match op.src {
        Some(src) => {
            let len = layout.bytes(layout.output_elems()).min(src.len());
            if len == 0 {
                op.dst
            } else {
                Some(fill(op.dst, src[..len].to_vec()))
            }
        }
        None => op.dst,
    };
    tracing::trace!(%key, "single-rank collective completed immediately");
    Completion {
        key,
        epoch: 0,
        cq: op.cq,
        outputs: [(rank, output)].into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;
    use strum::IntoEnumIterator;
    use tracing_test::traced_test;

    use super::*;
    use crate::algorithm::Algorithm;
    use crate::algorithm::Layout;
    use crate::communicator::CommId;
    use crate::dag::BufferPolicy;
    use crate::dag::Dag;
    use crate::dag::DagBuilder;
    use crate::dag::DagError;
    use crate::dag::RecvOp;
    use crate::dag::Segment;
    use crate::error::ErrorClass;
    use crate::kind::CollectiveKind;
    use crate::message::Header;
    use crate::message::Payload;
    use crate::reduce::ReduceOp;
    use crate::reduce::Reduction;
    use crate::reduce::from_bytes;
    use crate::reduce::to_bytes;
    use crate::test_utils::Delivery;
    use crate::test_utils::Mesh;

    fn world(n: usize) -> Arc<Communicator> {
        Arc::new(Communicator::world(n).unwrap())
    }

    fn sum() -> Reduction {
        Reduction::of::<i64>(ReduceOp::Sum).unwrap()
    }

    fn vals(rank: usize, len: usize) -> Vec<i64> {
        (0..len).map(|j| (rank * 100 + j) as i64 + 1).collect()
    }

    /// Element `j` of the block rank `from` sends to rank `to`.
    fn cells(from: usize, to: usize, len: usize) -> Vec<i64> {
        (0..len).map(|j| (from * 1000 + to * 10 + j) as i64).collect()
    }

    fn vcount(rank: usize) -> usize {
        rank % 3 + 1
    }

    /// All-to-all-v count from `from` to `to`.
    fn pair_count(from: usize, to: usize) -> usize {
        (from + 2 * to) % 3 + 1
    }

    fn elementwise_sum(rows: impl Iterator<Item = Vec<i64>>) -> Vec<i64> {
        rows.reduce(|a, b| a.iter().zip(&b).map(|(x, y)| x + y).collect())
            .unwrap_or_default()
    }

    /// The source and expected result of rank `r`.
    fn case(
        kind: CollectiveKind,
        n: usize,
        root: usize,
        c: usize,
        r: usize,
    ) -> (Option<Vec<i64>>, Option<Vec<i64>>) {
        use CollectiveKind::*;
        let counts: Vec<usize> = (0..n).map(vcount).collect();
        let at_root = |v: Vec<i64>| (r == root).then_some(v);
        match kind {
            Bcast => (at_root(vals(root, c)), Some(vals(root, c))),
            Allreduce => (Some(vals(r, c)), Some(elementwise_sum((0..n).map(|q| vals(q, c))))),
            Reduce => (
                Some(vals(r, c)),
                at_root(elementwise_sum((0..n).map(|q| vals(q, c)))),
            ),
            ReduceScatter => {
                let total = elementwise_sum((0..n).map(|q| vals(q, n * c)));
                (Some(vals(r, n * c)), Some(total[r * c..(r + 1) * c].to_vec()))
            }
            Scan => (Some(vals(r, c)), Some(elementwise_sum((0..=r).map(|q| vals(q, c))))),
            Allgather => (Some(vals(r, c)), Some((0..n).flat_map(|q| vals(q, c)).collect())),
            Allgatherv => (
                Some(vals(r, counts[r])),
                Some((0..n).flat_map(|q| vals(q, counts[q])).collect()),
            ),
            Alltoall => (
                Some((0..n).flat_map(|s| cells(r, s, c)).collect()),
                Some((0..n).flat_map(|s| cells(s, r, c)).collect()),
            ),
            Alltoallv => (
                Some((0..n).flat_map(|s| cells(r, s, pair_count(r, s))).collect()),
                Some((0..n).flat_map(|s| cells(s, r, pair_count(s, r))).collect()),
            ),
            Gather => (Some(vals(r, c)), at_root((0..n).flat_map(|q| vals(q, c)).collect())),
            Gatherv => (
                Some(vals(r, counts[r])),
                at_root((0..n).flat_map(|q| vals(q, counts[q])).collect()),
            ),
            Scatter => (
                at_root((0..n).flat_map(|s| cells(root, s, c)).collect()),
                Some(cells(root, r, c)),
            ),
            Scatterv => (
                at_root((0..n).flat_map(|s| cells(root, s, counts[s])).collect()),
                Some(cells(root, r, counts[r])),
            ),
            Barrier => (None, None),
        }
    }

    fn operation(kind: CollectiveKind, comm: Arc<Communicator>, root: usize, c: usize, r: usize) -> Operation {
        use CollectiveKind::*;
        let n = comm.size();
        let counts: Vec<usize> = (0..n).map(vcount).collect();
        let tag = 11;
        let mut op = match kind {
            Bcast => Operation::bcast(comm, tag, root, c, 8),
            Allreduce => Operation::allreduce(comm, tag, c, 8, sum()),
            Reduce => Operation::reduce(comm, tag, root, c, 8, sum()),
            ReduceScatter => Operation::reduce_scatter(comm, tag, c, 8, sum()),
            Scan => Operation::scan(comm, tag, c, 8, sum()),
            Allgather => Operation::allgather(comm, tag, c, 8),
            Allgatherv => Operation::allgatherv(comm, tag, counts, 8),
            Alltoall => Operation::alltoall(comm, tag, c, 8),
            Alltoallv => Operation::alltoallv(
                comm,
                tag,
                (0..n).map(|s| pair_count(r, s)).collect(),
                (0..n).map(|s| pair_count(s, r)).collect(),
                8,
            ),
            Gather => Operation::gather(comm, tag, root, c, 8),
            Gatherv => Operation::gatherv(comm, tag, root, counts, 8),
            Scatter => Operation::scatter(comm, tag, root, c, 8),
            Scatterv => Operation::scatterv(comm, tag, root, counts, 8),
            Barrier => Operation::barrier(comm, tag),
        };
        let (src, expected) = case(kind, n, root, c, r);
        if let Some(src) = src {
            op = op.with_src(to_bytes(&src));
        }
        if let Some(expected) = expected {
            op = op.with_dst(vec![0; expected.len() * 8]);
        }
        op
    }

    /// Run `kind` over `n` ranks and check every rank's result.
    fn check_kind(kind: CollectiveKind, n: usize, root: usize, c: usize, delivery: Delivery) {
        let mut mesh = Mesh::new(n, delivery);
        let comm = world(n);
        let mut done = mesh.start_all(|r| operation(kind, comm.clone(), root, c, r));
        done.extend(mesh.run());
        let by_rank: BTreeMap<usize, Completion> = done.into_iter().collect();
        assert_eq!(by_rank.len(), n, "{kind} n={n}: not every rank completed");
        for (rank, completion) in by_rank {
            let (_, expected) = case(kind, n, root, c, rank);
            let actual = completion.output(rank).map(from_bytes::<i64>);
            assert_eq!(actual, expected, "{kind} n={n} root={root} count={c} rank={rank}");
        }
        for engine in &mesh.engines {
            assert_eq!(engine.instance_count(), 0);
            assert_eq!(engine.pending_count(), 0);
        }
    }

    #[test]
    fn test_every_kind_small_groups() {
        for kind in CollectiveKind::iter() {
            for n in [1, 2, 3, 4, 5, 8] {
                check_kind(kind, n, n / 2, 2, Delivery::Fifo);
            }
        }
    }

    #[test]
    fn test_every_kind_lifo() {
        for kind in CollectiveKind::iter() {
            check_kind(kind, 7, 6, 3, Delivery::Lifo);
        }
    }

    fn delivery() -> impl Strategy<Value = Delivery> {
        prop_oneof![
            Just(Delivery::Fifo),
            Just(Delivery::Lifo),
            any::<u64>().prop_map(Delivery::Shuffled),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_bcast_reaches_everyone(
            (n, root) in (1usize..=12).prop_flat_map(|n| (Just(n), 0..n)),
            count in 1usize..4,
            delivery in delivery(),
        ) {
            check_kind(CollectiveKind::Bcast, n, root, count, delivery);
        }

        #[test]
        fn test_allreduce_is_the_fold(
            n in 1usize..=12,
            count in 1usize..6,
            delivery in delivery(),
        ) {
            check_kind(CollectiveKind::Allreduce, n, 0, count, delivery);
        }

        #[test]
        fn test_any_kind_any_order(
            kind in proptest::sample::select(CollectiveKind::iter().collect::<Vec<_>>()),
            (n, root) in (1usize..=9).prop_flat_map(|n| (Just(n), 0..n)),
            count in 1usize..3,
            seed in any::<u64>(),
        ) {
            check_kind(kind, n, root, count, Delivery::Shuffled(seed));
        }
    }

    #[test]
    fn test_bcast_eight_from_three() {
        let mut mesh = Mesh::new(8, Delivery::Fifo);
        let comm = world(8);
        let value = to_bytes(&[0x0123_4567_89ab_cdefi64]);
        let mut done = mesh.start_all(|r| {
            let op = Operation::bcast(comm.clone(), 0, 3, 1, 8).with_dst(vec![0; 8]);
            if r == 3 { op.with_src(value.clone()) } else { op }
        });
        done.extend(mesh.run());
        assert_eq!(done.len(), 8);
        for (rank, completion) in done {
            assert_eq!(completion.output(rank), Some(&value[..]));
        }
    }

    #[test]
    fn test_allreduce_one_to_four() {
        let mut mesh = Mesh::new(4, Delivery::Fifo);
        let comm = world(4);
        let mut done = mesh.start_all(|r| {
            Operation::allreduce(comm.clone(), 0, 1, 8, sum())
                .with_src(to_bytes(&[r as i64 + 1]))
                .with_dst(vec![0; 8])
        });
        done.extend(mesh.run());
        assert_eq!(done.len(), 4);
        for (_, completion) in done {
            assert_eq!(from_bytes::<i64>(&completion.into_output().unwrap()), vec![10]);
        }
    }

    #[test]
    fn test_single_rank_short_circuit() {
        let mut mesh = Mesh::new(1, Delivery::Fifo);
        let done = mesh
            .start(
                0,
                Operation::allreduce(world(1), 3, 2, 8, sum())
                    .with_src(to_bytes(&[4i64, 5]))
                    .with_dst(vec![0; 16])
                    .on_queue(7),
            )
            .unwrap()
            .unwrap();
        assert_eq!(done.cq, 7);
        assert_eq!(from_bytes::<i64>(done.output(0).unwrap()), vec![4, 5]);
        assert_eq!(mesh.engines[0].instance_count(), 0);
        assert_eq!(mesh.in_flight(), 0);

        // In place: the destination already holds the result.
        let done = mesh
            .start(0, Operation::bcast(world(1), 3, 0, 1, 8).with_dst(to_bytes(&[9i64])))
            .unwrap()
            .unwrap();
        assert_eq!(from_bytes::<i64>(done.output(0).unwrap()), vec![9]);
        assert!(mesh.engines[0].wait_barrier().is_ok());
        assert_eq!(mesh.engines[0].instance_count(), 0);
    }

    #[traced_test]
    #[test]
    fn test_message_before_start_is_not_lost() {
        let mut mesh = Mesh::new(2, Delivery::Fifo);
        let comm = world(2);
        let root = Operation::bcast(comm.clone(), 4, 0, 1, 8).with_src(to_bytes(&[42i64]));
        assert!(mesh.start(0, root).unwrap().is_some());
        assert!(mesh.run().is_empty());
        assert_eq!(mesh.engines[1].pending_count(), 1);
        assert!(logs_contain("queuing message"));

        let done = mesh
            .start(1, Operation::bcast(comm, 4, 0, 1, 8).with_dst(vec![0; 8]))
            .unwrap()
            .unwrap();
        assert_eq!(from_bytes::<i64>(done.output(1).unwrap()), vec![42]);
        assert_eq!(mesh.engines[1].pending_count(), 0);
        assert!(logs_contain("delivering queued messages"));
    }

    #[test]
    fn test_persistent_barrier_restarts() {
        let n = 4;
        let mut mesh = Mesh::new(n, Delivery::Shuffled(7));
        let comm = world(n);
        let key = Operation::barrier(comm.clone(), 2).key();
        for occurrence in 0..6u64 {
            let mut done = mesh.start_all(|_| Operation::barrier(comm.clone(), 2).persistent());
            done.extend(mesh.run());
            assert_eq!(done.len(), n);
            for (_, completion) in &done {
                assert_eq!(completion.epoch, occurrence);
            }
            for engine in &mesh.engines {
                assert_eq!(engine.actor_count(), 0);
                assert_eq!(engine.instance_count(), 1);
                assert_eq!(engine.instance_epoch(&key), Some(occurrence));
            }
        }
        for engine in &mut mesh.engines {
            assert!(engine.release(&key).unwrap());
            assert!(!engine.release(&key).unwrap());
            assert_eq!(engine.instance_count(), 0);
        }
    }

    #[test]
    fn test_early_rearm_is_queued() {
        let mut mesh = Mesh::new(2, Delivery::Fifo);
        let comm = world(2);
        let barrier = || Operation::barrier(comm.clone(), 0).persistent();
        mesh.start_all(|_| barrier());
        mesh.run();
        // Rank 0 starts the next occurrence before rank 1 does.
        assert!(mesh.start(0, barrier()).unwrap().is_none());
        mesh.run();
        assert_eq!(mesh.engines[1].pending_count(), 1);
        // Rank 1 finds rank 0's message waiting and finishes at once.
        assert_eq!(mesh.start(1, barrier()).unwrap().unwrap().epoch, 1);
        let done = mesh.run();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].1.epoch, 1);
    }

    #[test]
    fn test_rejected_start_leaves_key_untouched() {
        let mut mesh = Mesh::new(2, Delivery::Fifo);
        let comm = |ranks: Vec<PhysicalRank>| Arc::new(Communicator::from_ranks(CommId(1), ranks).unwrap());
        let bcast = |comm: Arc<Communicator>, rank: usize| {
            let op = Operation::bcast(comm, 0, 0, 1, 8).with_dst(vec![0; 8]);
            if rank == 0 { op.with_src(to_bytes(&[42i64])) } else { op }
        };

        let err = mesh.start(0, bcast(comm(vec![0, 5]), 0)).unwrap_err();
        assert!(matches!(err, CollectiveError::OutsideWorld { physical: 5, world: 2, .. }));
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert_eq!(mesh.engines[0].instance_count(), 0);
        assert_eq!(mesh.in_flight(), 0);

        let good = comm(vec![0, 1]);
        let mut done = mesh.start_all(|rank| bcast(good.clone(), rank));
        done.extend(mesh.run());
        assert_eq!(done.len(), 2);
        for (rank, completion) in done {
            assert_eq!(completion.epoch, 0);
            assert_eq!(completion.output(rank), Some(&to_bytes(&[42i64])[..]));
        }
        assert_eq!(mesh.engines[1].pending_count(), 0);
    }

    #[test]
    fn test_failed_rearm_keeps_epoch() {
        let mut mesh = Mesh::new(2, Delivery::Fifo);
        let comm = world(2);
        let key = Operation::barrier(comm.clone(), 4).key();
        let barrier = || Operation::barrier(comm.clone(), 4).persistent();
        mesh.start_all(|_| barrier());
        assert_eq!(mesh.run().len(), 2);

        mesh.set_closed(true);
        let err = mesh.start(0, barrier()).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transport);
        assert_eq!(mesh.engines[0].instance_epoch(&key), Some(0));
        assert_eq!(mesh.engines[0].actor_count(), 0);

        mesh.set_closed(false);
        let mut done = mesh.start_all(|_| barrier());
        done.extend(mesh.run());
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|(_, completion)| completion.epoch == 1));
    }

    #[test]
    fn test_tag_reused_before_peer_finishes() {
        let mut mesh = Mesh::new(2, Delivery::Fifo);
        let comm = world(2);
        let bcast = |rank: usize, value: i64| {
            let op = Operation::bcast(comm.clone(), 6, 0, 1, 8).with_dst(vec![0; 8]);
            if rank == 0 { op.with_src(to_bytes(&[value])) } else { op }
        };
        // The root finishes on injection and reuses the tag at once.
        assert!(mesh.start(0, bcast(0, 1)).unwrap().is_some());
        assert!(mesh.start(0, bcast(0, 2)).unwrap().is_some());

        let first = mesh.start(1, bcast(1, 0)).unwrap();
        let mut done: Vec<_> = first.into_iter().map(|c| (1, c)).collect();
        done.extend(mesh.run());
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].1.epoch, 0);
        assert_eq!(done[0].1.output(1), Some(&to_bytes(&[1i64])[..]));
        assert_eq!(mesh.engines[1].pending_count(), 1);

        let second = mesh.start(1, bcast(1, 0)).unwrap().unwrap();
        assert_eq!(second.epoch, 1);
        assert_eq!(second.output(1), Some(&to_bytes(&[2i64])[..]));
    }

    #[test]
    fn test_live_tag_reuse_is_rejected() {
        let mut mesh = Mesh::new(3, Delivery::Fifo);
        let op = || {
            Operation::allreduce(world(3), 5, 1, 8, sum())
                .with_src(to_bytes(&[1i64]))
                .with_dst(vec![0; 8])
        };
        assert!(mesh.start(0, op()).unwrap().is_none());
        let err = mesh.start(0, op()).unwrap_err();
        assert!(matches!(err, CollectiveError::TagInUse { .. }));
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert!(err.to_string().contains("allreduce[5]"));

        // Another tag, or another kind, runs alongside.
        assert!(mesh
            .start(0, Operation::barrier(world(3), 5))
            .unwrap()
            .is_none());
        assert_eq!(mesh.engines[0].instance_count(), 2);

        // Once complete, the tag is free again.
        mesh.start(1, op()).unwrap();
        mesh.start(2, op()).unwrap();
        mesh.start(1, Operation::barrier(world(3), 5)).unwrap();
        mesh.start(2, Operation::barrier(world(3), 5)).unwrap();
        assert_eq!(mesh.run().len(), 6);
        assert!(mesh.start(0, op()).unwrap().is_none());
    }

    fn stray(key: CollectiveKey, epoch: u64, round: u32) -> Message {
        Message::Work(WorkMessage {
            header: Header {
                src: 1,
                dst: 0,
                cq: 0,
                flow_id: 99,
            },
            key,
            epoch,
            src_rank: 1,
            dst_rank: 0,
            round,
            nelems: 1,
            payload: Payload::Data(to_bytes(&[0i64]).into()),
            ack_requested: false,
        })
    }

    #[test]
    fn test_unmatched_message_is_a_protocol_error() {
        let mut mesh = Mesh::new(2, Delivery::Fifo);
        let op = Operation::allreduce(world(2), 1, 1, 8, sum()).with_src(to_bytes(&[1i64]));
        let key = op.key();
        mesh.start(0, op).unwrap();
        mesh.inject(stray(key, 0, 99));
        let err = mesh.try_run().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Protocol);
    }

    #[test]
    fn test_message_for_finished_occurrence() {
        let mut mesh = Mesh::new(2, Delivery::Fifo);
        let comm = world(2);
        let key = Operation::barrier(comm.clone(), 0).key();
        mesh.start_all(|_| Operation::barrier(comm.clone(), 0));
        assert_eq!(mesh.run().len(), 2);
        mesh.inject(stray(key, 0, 0));
        let err = mesh.try_run().unwrap_err();
        assert!(matches!(err, CollectiveError::Protocol { .. }));
    }

    #[test]
    fn test_several_ranks_per_process() {
        // Four communicator ranks on two processes.
        let comm = Arc::new(Communicator::from_ranks(CommId(1), vec![0, 0, 1, 1]).unwrap());
        let mut mesh = Mesh::new(2, Delivery::Shuffled(3));
        let op = |rank: usize| {
            Operation::allreduce(comm.clone(), 0, 2, 8, sum())
                .with_src(to_bytes(&[rank as i64, 1]))
                .with_dst(vec![0; 16])
                .as_rank(rank)
        };
        assert!(mesh.start(0, op(0)).unwrap().is_none());
        assert!(mesh.start(1, op(2)).unwrap().is_none());
        assert!(mesh.run().is_empty());
        assert!(matches!(
            mesh.start(0, op(2)).unwrap_err(),
            CollectiveError::NotAMember { physical: 0, .. }
        ));
        mesh.start(0, op(1)).unwrap();
        mesh.start(1, op(3)).unwrap();
        let done = mesh.run();
        assert_eq!(done.len(), 2);
        for (physical, completion) in done {
            assert_eq!(completion.outputs.len(), 2);
            for rank in comm.local_ranks_of(physical) {
                assert_eq!(from_bytes::<i64>(completion.output(*rank).unwrap()), vec![6, 4]);
            }
        }
    }

    #[test]
    fn test_not_a_member() {
        let comm = Arc::new(Communicator::from_ranks(CommId(2), vec![1, 2]).unwrap());
        let mut mesh = Mesh::new(3, Delivery::Fifo);
        let err = mesh.start(0, Operation::barrier(comm, 0)).unwrap_err();
        assert!(matches!(err, CollectiveError::NotAMember { physical: 0, .. }));
    }

    #[test]
    fn test_acknowledged_sends() {
        let config = EngineConfig {
            send_completion: SendCompletion::Acknowledged,
            ..EngineConfig::default()
        };
        let mut mesh = Mesh::with_config(5, Delivery::Shuffled(11), config);
        let comm = world(5);
        let mut done = mesh.start_all(|r| {
            Operation::allreduce(comm.clone(), 0, 3, 8, sum()).with_src(to_bytes(&vals(r, 3)))
        });
        assert!(done.is_empty());
        done.extend(mesh.run());
        assert_eq!(done.len(), 5);
        let total = elementwise_sum((0..5).map(|q| vals(q, 3)));
        for (_, completion) in done {
            assert_eq!(from_bytes::<i64>(&completion.into_output().unwrap()), total);
        }
    }

    #[test]
    fn test_phantom_payloads() {
        let mut mesh = Mesh::new(6, Delivery::Lifo);
        let comm = world(6);
        let mut done = mesh.start_all(|_| Operation::allreduce(comm.clone(), 0, 1000, 8, sum()));
        done.extend(mesh.run());
        assert_eq!(done.len(), 6);
        assert!(done.iter().all(|(rank, c)| c.output(*rank).is_none()));

        let mut done = mesh.start_all(|_| Operation::alltoall(comm.clone(), 1, 4, 4));
        done.extend(mesh.run());
        assert_eq!(done.len(), 6);
    }

    #[test]
    fn test_non_contiguous() {
        let mut mesh = Mesh::new(5, Delivery::Fifo);
        let comm = world(5);
        let err = mesh
            .start(0, Operation::gatherv(comm.clone(), 0, 0, vec![1; 5], 8).non_contiguous())
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Unsupported);
        assert_eq!(mesh.engines[0].instance_count(), 0);

        let mut done = mesh.start_all(|r| {
            let op = Operation::bcast(comm.clone(), 0, 2, 2, 8)
                .with_dst(vec![0; 16])
                .non_contiguous();
            if r == 2 { op.with_src(to_bytes(&[5i64, 6])) } else { op }
        });
        done.extend(mesh.run());
        assert_eq!(done.len(), 5);
        for (rank, completion) in done {
            assert_eq!(from_bytes::<i64>(completion.output(rank).unwrap()), vec![5, 6]);
        }
    }

    #[test]
    fn test_block_until_next() {
        let mut mesh = Mesh::new(2, Delivery::Fifo);
        let comm = world(2);
        let root = Operation::bcast(comm.clone(), 0, 0, 1, 8).with_src(to_bytes(&[8i64]));
        assert!(mesh.start(0, root).unwrap().is_some());
        let leaf = Operation::bcast(comm.clone(), 0, 0, 1, 8).with_dst(vec![0; 8]);
        assert!(mesh.start(1, leaf).unwrap().is_none());
        let done = mesh.engines[1].block_until_next(0).unwrap();
        assert_eq!(from_bytes::<i64>(done.output(1).unwrap()), vec![8]);

        // Nothing else will ever arrive.
        let err = mesh.engines[1].block_until_next(0).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transport);
    }

    #[test]
    fn test_completion_for_another_queue_is_held() {
        let mut mesh = Mesh::new(2, Delivery::Fifo);
        let comm = world(2);
        let root = Operation::bcast(comm.clone(), 0, 0, 1, 8)
            .with_src(to_bytes(&[8i64]))
            .on_queue(1);
        mesh.start(0, root).unwrap();
        let leaf = Operation::bcast(comm.clone(), 0, 0, 1, 8)
            .with_dst(vec![0; 8])
            .on_queue(2);
        mesh.start(1, leaf).unwrap();
        // The root's message arrives on its queue; the completion belongs to
        // the leaf's.
        assert!(mesh.engines[1].block_until_next(1).is_err());
        let held = mesh.engines[1].take_completion(2).unwrap();
        assert_eq!(held.cq, 2);
        assert!(mesh.engines[1].take_completion(2).is_none());
    }

    #[traced_test]
    #[test]
    fn test_deadlock_check_reports_missing_peer() {
        let mut mesh = Mesh::new(4, Delivery::Fifo);
        let comm = world(4);
        for rank in 0..3 {
            mesh.start(
                rank,
                Operation::allreduce(comm.clone(), 0, 4, 8, sum()).with_src(to_bytes(&vals(rank, 4))),
            )
            .unwrap();
        }
        assert!(mesh.run().is_empty());
        let reports = mesh.engines[2].deadlock_check();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].rank, 2);
        assert!(reports[0].waiting_on.contains(&(3, 1)));
        assert!(logs_contain("stuck"));
        assert!(mesh.engines[3].deadlock_check().is_empty());
    }

    #[test]
    fn test_algorithm_selection() {
        let mut config = EngineConfig::default();
        config
            .algorithms
            .insert(CollectiveKind::Allreduce, "recursive_doubling".to_string());
        config
            .algorithms
            .insert(CollectiveKind::Alltoall, "direct".to_string());
        let mesh = Mesh::with_config(2, Delivery::Fifo, config);
        assert_eq!(
            mesh.engines[0].algorithms().selected(CollectiveKind::Allreduce),
            Some("recursive_doubling")
        );

        let comm = world(6);
        for (kind, name) in [
            (CollectiveKind::Allreduce, "recursive_doubling"),
            (CollectiveKind::Alltoall, "direct"),
        ] {
            let mut config = EngineConfig::default();
            config.algorithms.insert(kind, name.to_string());
            let mut mesh = Mesh::with_config(6, Delivery::Shuffled(5), config);
            let mut done = mesh.start_all(|r| operation(kind, comm.clone(), 0, 2, r));
            done.extend(mesh.run());
            assert_eq!(done.len(), 6);
            for (rank, completion) in done {
                let (_, expected) = case(kind, 6, 0, 2, rank);
                assert_eq!(completion.output(rank).map(from_bytes::<i64>), expected);
            }
        }
    }

    /// Root sends to everyone directly.
    #[derive(Debug)]
    struct LinearBcast;

    impl Algorithm for LinearBcast {
        fn name(&self) -> &'static str {
            "linear"
        }

        fn kind(&self) -> CollectiveKind {
            CollectiveKind::Bcast
        }

        fn build_dag(&self, layout: &Layout) -> Result<Dag, DagError> {
            let all = vec![Segment::new(0, layout.count)];
            let mut b = DagBuilder::new(layout.size);
            if layout.is_root() {
                for peer in (0..layout.size).filter(|p| *p != layout.me) {
                    b.send(peer, 0, all.clone(), BufferPolicy::InPlace, &[]);
                }
            } else {
                b.recv(layout.root, 0, all, BufferPolicy::InPlace, RecvOp::Copy, &[]);
            }
            b.build()
        }
    }

    #[test]
    fn test_custom_algorithm() {
        let mut mesh = Mesh::new(5, Delivery::Fifo);
        for engine in &mut mesh.engines {
            engine.algorithms_mut().register(Arc::new(LinearBcast));
        }
        check_kind_on(&mut mesh, CollectiveKind::Bcast, 1);
        assert_eq!(
            mesh.engines[0].algorithms().names(CollectiveKind::Bcast),
            vec!["binary_tree", "linear"]
        );
    }

    fn check_kind_on(mesh: &mut Mesh, kind: CollectiveKind, root: usize) {
        let n = mesh.engines.len();
        let comm = world(n);
        let mut done = mesh.start_all(|r| operation(kind, comm.clone(), root, 3, r));
        done.extend(mesh.run());
        assert_eq!(done.len(), n);
        for (rank, completion) in done {
            let (_, expected) = case(kind, n, root, 3, rank);
            assert_eq!(completion.output(rank).map(from_bytes::<i64>), expected);
        }
    }

    #[test]
    fn test_unknown_algorithm_in_config() {
        let mut config = EngineConfig::default();
        config
            .algorithms
            .insert(CollectiveKind::Bcast, "no_such".to_string());
        let mesh = Mesh::new(2, Delivery::Fifo);
        let transport = mesh.engines.into_iter().next().unwrap().into_transport();
        let err = CollectiveEngine::new(transport, 2, config).err().unwrap();
        assert!(matches!(err, CollectiveError::UnknownAlgorithm { .. }));
        assert_eq!(err.class(), ErrorClass::Configuration);
    }
}
