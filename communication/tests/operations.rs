use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use weft_communication::codec::MessageSchema;
use weft_communication::operation::{
    natural_order, BBroadcast, BDirect, BGather, BJoin, BKeyedGather, BPartition, BReduce,
    JoinAlgorithm, JoinInput, JoinType, Relation, SKeyedReduce, SPartition,
};
use weft_communication::routing::{LogicalPlan, LogicalPlanBuilder};
use weft_communication::{BulkReceiver, CommError, Communicator, Config, DataFlowOperation, MessageType, PartitionAlgorithm, SingularReceiver, Value};

/// Everything a receiver was handed, shared with the test.
#[derive(Clone, Default)]
struct Collected {
    values: Rc<RefCell<Vec<(i32, Value)>>>,
    syncs: Rc<RefCell<Vec<(i32, Option<Vec<u8>>)>>>,
}

impl Collected {
    fn values(&self) -> Vec<(i32, Value)> { self.values.borrow().clone() }
    fn syncs(&self) -> Vec<(i32, Option<Vec<u8>>)> { self.syncs.borrow().clone() }
    fn clear(&self) {
        self.values.borrow_mut().clear();
        self.syncs.borrow_mut().clear();
    }
}

impl BulkReceiver for Collected {
    fn receive(&mut self, target: i32, values: Vec<Value>) -> Result<(), Vec<Value>> {
        self.values.borrow_mut().extend(values.into_iter().map(|value| (target, value)));
        Ok(())
    }
    fn sync(&mut self, target: i32, barrier: Option<&[u8]>) -> bool {
        self.syncs.borrow_mut().push((target, barrier.map(|b| b.to_vec())));
        true
    }
}

impl SingularReceiver for Collected {
    fn receive(&mut self, target: i32, value: Value) -> Result<(), Value> {
        self.values.borrow_mut().push((target, value));
        Ok(())
    }
    fn sync(&mut self, target: i32, barrier: Option<&[u8]>) -> bool {
        self.syncs.borrow_mut().push((target, barrier.map(|b| b.to_vec())));
        true
    }
}

/// Connects `workers` communicators over loopback, all driven from this thread.
fn cluster(workers: usize, configure: impl Fn(&mut Config)) -> Vec<Communicator> {
    let mut communicators: Vec<Communicator> = (0 .. workers)
        .map(|worker| {
            let mut config = Config::local(worker, workers);
            configure(&mut config);
            Communicator::bind(config, worker, "127.0.0.1:0").unwrap()
        })
        .collect();
    let addresses: Vec<String> = communicators.iter().map(|c| c.local_addr().to_string()).collect();
    for communicator in communicators.iter_mut() {
        communicator.connect_peers(&addresses).unwrap();
    }
    let mut rounds = 0;
    while !communicators.iter().all(|c| c.all_connected()) {
        for communicator in communicators.iter_mut() {
            communicator.progress();
        }
        rounds += 1;
        assert!(rounds < 1_000_000, "workers did not connect");
    }
    communicators
}

/// Tasks `0 .. per_worker * workers`, in contiguous blocks, as seen from `worker`.
fn plan(worker: usize, workers: usize, per_worker: usize) -> Rc<LogicalPlan> {
    Rc::new(LogicalPlanBuilder::new(worker).blocks(workers, per_worker).build())
}

/// Sends every input through the operation of the sender's worker, finishes every source,
/// and drives all workers until each operation completes.
fn drive<O: DataFlowOperation>(operations: &mut [O], inputs: Vec<Vec<(i32, Value)>>) {
    let mut pending: Vec<VecDeque<(i32, Value)>> = inputs.iter().map(|i| i.iter().cloned().collect()).collect();
    let sources: Vec<BTreeSet<i32>> = inputs.iter().map(|i| i.iter().map(|(s, _)| *s).collect()).collect();
    let mut finished: Vec<BTreeSet<i32>> = vec![BTreeSet::new(); operations.len()];

    let mut rounds = 0;
    loop {
        for (worker, operation) in operations.iter_mut().enumerate() {
            while let Some((source, value)) = pending[worker].front() {
                if !operation.send(*source, value, 0).unwrap() {
                    break;
                }
                pending[worker].pop_front();
            }
            if pending[worker].is_empty() {
                for source in sources[worker].iter() {
                    if !finished[worker].contains(source) && operation.finish(*source).unwrap() {
                        finished[worker].insert(*source);
                    }
                }
            }
            operation.progress_channel();
            assert!(operation.error().is_none(), "{:?}", operation.error());
        }
        if operations.iter().all(|o| o.is_complete()) {
            break;
        }
        rounds += 1;
        assert!(rounds < 1_000_000, "operations did not complete");
    }
}

/// Values per target, in delivery order.
fn by_target(values: Vec<(i32, Value)>) -> BTreeMap<i32, Vec<Value>> {
    let mut by_target: BTreeMap<i32, Vec<Value>> = BTreeMap::new();
    for (target, value) in values {
        by_target.entry(target).or_default().push(value);
    }
    by_target
}

/// Progresses `operation` until `done` holds, failing after ten seconds.
fn progress_until<O: DataFlowOperation>(operation: &mut O, mut done: impl FnMut(&O) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done(operation) {
        operation.progress_channel();
        assert!(Instant::now() < deadline, "condition not reached");
    }
}

fn sum(left: Value, right: Value) -> Value {
    Value::Integer(left.as_integer().unwrap_or(0) + right.as_integer().unwrap_or(0))
}

fn integers(values: Vec<(i32, Value)>) -> BTreeMap<i32, Vec<i32>> {
    let mut by_target: BTreeMap<i32, Vec<i32>> = BTreeMap::new();
    for (target, value) in values {
        by_target.entry(target).or_default().push(value.as_integer().unwrap());
    }
    for values in by_target.values_mut() {
        values.sort();
    }
    by_target
}

fn partition_with(algorithm: PartitionAlgorithm) -> BTreeMap<i32, Vec<i32>> {
    let mut communicators = cluster(2, |config| {
        config.batch_partition_algorithm = algorithm;
        config.grouping_size = 7;
    });
    let seen: Vec<Collected> = vec![Collected::default(), Collected::default()];
    let mut operations: Vec<BPartition> = communicators.iter_mut().enumerate()
        .map(|(worker, communicator)| {
            BPartition::new(communicator, plan(worker, 2, 4), vec![0, 1, 4, 5], vec![2, 3, 6, 7], MessageType::Integer, seen[worker].clone()).unwrap()
        })
        .collect();
    let inputs = vec![
        (0 .. 200).map(|i| (i % 2, Value::Integer(i))).collect(),
        (200 .. 400).map(|i| (4 + i % 2, Value::Integer(i))).collect(),
    ];
    drive(&mut operations, inputs);
    for collected in seen.iter() {
        assert_eq!(collected.syncs().len(), 2);
    }
    integers(seen.iter().flat_map(|c| c.values()).collect())
}

#[test]
fn ring_and_simple_partitions_agree() {
    let simple = partition_with(PartitionAlgorithm::Simple);
    let ring = partition_with(PartitionAlgorithm::Ring);
    assert_eq!(simple.values().map(|v| v.len()).sum::<usize>(), 400);
    assert_eq!(simple, ring);
}

#[test]
fn gather_tags_values_with_their_source() {
    let mut communicators = cluster(2, |_| { });
    let seen = [Collected::default(), Collected::default()];
    let mut operations: Vec<BGather> = communicators.iter_mut().enumerate()
        .map(|(worker, communicator)| {
            BGather::new(communicator, plan(worker, 2, 2), vec![0, 2, 3], 1, MessageType::String, seen[worker].clone()).unwrap()
        })
        .collect();
    let inputs = vec![
        vec![(0, Value::from("zero"))],
        vec![(2, Value::from("two")), (3, Value::from("three"))],
    ];
    drive(&mut operations, inputs);
    assert!(seen[1].values().is_empty());
    let mut gathered: Vec<Value> = seen[0].values().into_iter().map(|(_, v)| v).collect();
    gathered.sort_by_key(|v| v.as_pair().and_then(|(s, _)| s.as_integer()));
    assert_eq!(gathered, vec![Value::tuple(0, "zero"), Value::tuple(2, "two"), Value::tuple(3, "three")]);
    assert_eq!(seen[0].syncs(), vec![(1, None)]);
}

#[test]
fn join_types_across_workers() {
    let cases = [(JoinType::Inner, 10), (JoinType::LeftOuter, 20), (JoinType::RightOuter, 20), (JoinType::FullOuter, 30)];
    for ((join_type, expected), algorithm) in cases.into_iter().flat_map(|case| [(case, JoinAlgorithm::Hash), (case, JoinAlgorithm::sorted())]) {
        let mut communicators = cluster(2, |_| { });
        let seen = [Collected::default(), Collected::default()];
        let mut operations: Vec<BJoin> = communicators.iter_mut().enumerate()
            .map(|(worker, communicator)| {
                let left = JoinInput { sources: vec![0, 3], data_type: MessageType::String };
                let right = JoinInput { sources: vec![1, 4], data_type: MessageType::String };
                BJoin::new(communicator, plan(worker, 2, 3), left, right, vec![2, 5], MessageType::Integer, join_type, algorithm.clone(), seen[worker].clone()).unwrap()
            })
            .collect();
        let mut inputs = vec![Vec::new(), Vec::new()];
        for key in 0 .. 20 {
            let (worker, source) = if key % 2 == 0 { (0, 0) } else { (1, 3) };
            inputs[worker].push((source, Value::tuple(key, format!("L{}", key))));
        }
        for key in 10 .. 30 {
            let (worker, source) = if key % 2 == 0 { (0, 1) } else { (1, 4) };
            inputs[worker].push((source, Value::tuple(key, format!("R{}", key))));
        }
        drive(&mut operations, inputs);

        if let JoinAlgorithm::Sort(_) = algorithm {
            for values in seen.iter().flat_map(|c| by_target(c.values()).into_values()) {
                let keys: Vec<Value> = values.iter().filter_map(|v| v.as_pair().map(|(k, _)| k.clone())).collect();
                assert!(keys.windows(2).all(|pair| pair[0] <= pair[1]), "{:?}", keys);
            }
        }
        let joined: Vec<Value> = seen.iter().flat_map(|c| c.values()).map(|(_, v)| v).collect();
        assert_eq!(joined.len(), expected, "{:?} {:?}", join_type, algorithm);
        for value in joined {
            let (key, sides) = value.into_pair().unwrap();
            let key = key.as_integer().unwrap();
            let (left, right) = sides.into_pair().unwrap();
            if (10 .. 20).contains(&key) {
                assert_eq!(left, Value::String(format!("L{}", key)));
                assert_eq!(right, Value::String(format!("R{}", key)));
            }
            else if key < 10 {
                assert_eq!(right, Value::Empty);
            }
            else {
                assert_eq!(left, Value::Empty);
            }
        }
    }
}

#[test]
fn broadcast_reaches_every_target() {
    let mut communicators = cluster(2, |_| { });
    let seen = [Collected::default(), Collected::default()];
    let mut operations: Vec<BBroadcast> = communicators.iter_mut().enumerate()
        .map(|(worker, communicator)| {
            BBroadcast::new(communicator, plan(worker, 2, 2), 0, vec![1, 2, 3], MessageType::Integer, seen[worker].clone()).unwrap()
        })
        .collect();
    drive(&mut operations, vec![(0 .. 50).map(|i| (0, Value::Integer(i))).collect(), Vec::new()]);
    let by_target = integers(seen.iter().flat_map(|c| c.values()).collect());
    assert_eq!(by_target.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    for values in by_target.values() {
        assert_eq!(*values, (0 .. 50).collect::<Vec<_>>());
    }
}

#[test]
fn large_values_cross_small_buffers() {
    let mut communicators = cluster(2, |config| config.buffer_size = 64);
    let seen = [Collected::default(), Collected::default()];
    let mut operations: Vec<BDirect> = communicators.iter_mut().enumerate()
        .map(|(worker, communicator)| {
            BDirect::new(communicator, plan(worker, 2, 1), vec![0], vec![1], MessageType::ByteArray, seen[worker].clone()).unwrap()
        })
        .collect();
    let payload: Vec<u8> = (0 .. 500).map(|i| (i % 251) as u8).collect();
    drive(&mut operations, vec![vec![(0, Value::Bytes(payload.clone()))], Vec::new()]);
    assert_eq!(seen[1].values(), vec![(1, Value::Bytes(payload))]);
}

#[test]
fn barriers_reach_the_receiver() {
    let mut communicators = cluster(1, |_| { });
    let seen = Collected::default();
    let mut direct = BDirect::new(&mut communicators[0], plan(0, 1, 2), vec![0], vec![1], MessageType::Integer, seen.clone()).unwrap();
    assert!(direct.send(0, &Value::Integer(5), 0).unwrap());
    while !direct.send_barrier(0, b"checkpoint-3").unwrap() {
        direct.progress();
    }
    while !direct.is_complete() {
        direct.progress();
    }
    assert_eq!(seen.values(), vec![(1, Value::Integer(5))]);
    assert_eq!(seen.syncs(), vec![(1, Some(b"checkpoint-3".to_vec()))]);
}

#[test]
fn refused_sends_leave_no_trace() {
    let mut communicators = cluster(1, |config| config.send_pending_max = 2);
    let seen = Collected::default();
    let mut partition = BPartition::new(&mut communicators[0], plan(0, 1, 2), vec![0], vec![1], MessageType::Integer, seen.clone()).unwrap();

    let mut accepted = Vec::new();
    let mut next = 0;
    while partition.partition(0, &Value::Integer(next), 0).unwrap() {
        accepted.push(next);
        next += 1;
    }
    assert_eq!(accepted, vec![0, 1]);
    // the refused value is retried once progress has made room.
    partition.progress();
    assert!(partition.partition(0, &Value::Integer(next), 0).unwrap());
    accepted.push(next);

    while !partition.finish(0).unwrap() {
        partition.progress();
    }
    while !partition.is_complete() {
        partition.progress();
    }
    assert_eq!(integers(seen.values())[&1], accepted);
}

#[test]
fn reset_abandons_a_run_in_flight() {
    let mut communicators = cluster(1, |_| { });
    let seen = Collected::default();
    let mut partition = BPartition::new(&mut communicators[0], plan(0, 1, 4), vec![0, 1], vec![2, 3], MessageType::Integer, seen.clone()).unwrap();

    for value in 0 .. 10 {
        assert!(partition.partition(value % 2, &Value::Integer(100 + value), 0).unwrap());
        partition.progress();
    }
    partition.reset();
    assert!(seen.values().is_empty());

    let inputs: Vec<(i32, Value)> = (0 .. 10).map(|value| (value % 2, Value::Integer(value))).collect();
    drive(std::slice::from_mut(&mut partition), vec![inputs]);
    let by_target = integers(seen.values());
    assert_eq!(by_target.values().flatten().copied().collect::<BTreeSet<_>>(), (0 .. 10).collect());
}

#[test]
fn reset_allows_a_clean_rerun() {
    // large groups and queues, so every value is queued before anything flushes.
    let mut communicators = cluster(2, |config| {
        config.grouping_size = 64;
        config.send_pending_max = 64;
    });
    let seen = [Collected::default(), Collected::default()];
    let mut operations: Vec<BPartition> = communicators.iter_mut().enumerate()
        .map(|(worker, communicator)| {
            BPartition::new(communicator, plan(worker, 2, 3), vec![0, 1], vec![2, 5], MessageType::Integer, seen[worker].clone()).unwrap()
        })
        .collect();
    let inputs = || vec![(0 .. 12).map(|i| (i % 2, Value::Integer(i))).collect(), Vec::new()];

    drive(&mut operations, inputs());
    let first: Vec<BTreeMap<i32, Vec<Value>>> = seen.iter().map(|c| by_target(c.values())).collect();
    let first_syncs: Vec<_> = seen.iter().map(|c| c.syncs()).collect();
    assert_eq!(first.iter().map(|t| t.values().map(|v| v.len()).sum::<usize>()).sum::<usize>(), 12);

    for (operation, collected) in operations.iter_mut().zip(seen.iter()) {
        operation.reset();
        collected.clear();
    }
    drive(&mut operations, inputs());
    let second: Vec<BTreeMap<i32, Vec<Value>>> = seen.iter().map(|c| by_target(c.values())).collect();
    assert_eq!(first, second);
    assert_eq!(first_syncs, seen.iter().map(|c| c.syncs()).collect::<Vec<_>>());
}

#[test]
fn streaming_keyed_reduce_reports_running_totals() {
    let mut communicators = cluster(1, |_| { });
    let seen = Collected::default();
    let sum = |a: Value, b: Value| Value::Integer(a.as_integer().unwrap_or(0) + b.as_integer().unwrap_or(0));
    let mut reduce = SKeyedReduce::new(&mut communicators[0], plan(0, 1, 3), vec![0, 1], vec![2], MessageType::String, MessageType::Integer, sum, seen.clone()).unwrap();
    let inputs: Vec<(i32, Value)> = (0 .. 40).map(|i| (i % 2, Value::tuple(if i % 4 < 2 { "even" } else { "odd" }, 1))).collect();
    drive(std::slice::from_mut(&mut reduce), vec![inputs]);

    let mut latest = BTreeMap::new();
    for (_, value) in seen.values() {
        let (key, total) = value.into_pair().unwrap();
        let total = total.as_integer().unwrap();
        let previous = latest.insert(key.as_str().unwrap().to_owned(), total).unwrap_or(0);
        assert!(total > previous);
    }
    assert_eq!(latest["even"], 20);
    assert_eq!(latest["odd"], 20);
    assert_eq!(seen.syncs(), vec![(2, None)]);
}

/// Sums the integers `1 ..= 100`, sent by every source in turn, at task 1.
fn reduce_sum(workers: usize, grouping_size: usize) -> Vec<(i32, Value)> {
    let mut communicators = cluster(workers, |config| config.grouping_size = grouping_size);
    let seen: Vec<Collected> = (0 .. workers).map(|_| Collected::default()).collect();
    let sources: Vec<i32> = (0 .. workers as i32).map(|w| w * 4).chain((0 .. workers as i32).map(|w| w * 4 + 2)).collect();
    let mut operations: Vec<BReduce> = communicators.iter_mut().enumerate()
        .map(|(worker, communicator)| {
            BReduce::new(communicator, plan(worker, workers, 4), sources.clone(), 1, MessageType::Integer, sum, seen[worker].clone()).unwrap()
        })
        .collect();
    let mut inputs = vec![Vec::new(); workers];
    for value in 1 ..= 100 {
        let source = sources[value as usize % sources.len()];
        inputs[source as usize / 4].push((source, Value::Integer(value)));
    }
    drive(&mut operations, inputs);
    for collected in seen.iter().skip(1) {
        assert!(collected.values().is_empty());
    }
    assert_eq!(seen[0].syncs(), vec![(1, None)]);
    seen[0].values()
}

#[test]
fn reduce_with_groups_of_one() {
    let mut communicators = cluster(1, |config| config.grouping_size = 1);
    let seen = Collected::default();
    let mut reduce = BReduce::new(&mut communicators[0], plan(0, 1, 2), vec![0], 1, MessageType::Integer, sum, seen.clone()).unwrap();
    drive(std::slice::from_mut(&mut reduce), vec![(1 ..= 5).map(|i| (0, Value::Integer(i))).collect()]);
    assert_eq!(seen.values(), vec![(1, Value::Integer(15))]);
}

#[test]
fn reduce_across_workers() {
    for grouping_size in [1, 3, 100] {
        assert_eq!(reduce_sum(1, grouping_size), vec![(1, Value::Integer(5050))], "grouping {}", grouping_size);
        assert_eq!(reduce_sum(2, grouping_size), vec![(1, Value::Integer(5050))], "grouping {}", grouping_size);
    }
}

#[test]
fn keyed_gather_across_workers() {
    let mut communicators = cluster(2, |config| config.grouping_size = 5);
    let seen = [Collected::default(), Collected::default()];
    let mut operations: Vec<BKeyedGather> = communicators.iter_mut().enumerate()
        .map(|(worker, communicator)| {
            BKeyedGather::new(communicator, plan(worker, 2, 3), vec![0, 3], vec![2, 5], MessageType::String, MessageType::Integer, seen[worker].clone()).unwrap()
        })
        .collect();
    let mut inputs = vec![Vec::new(), Vec::new()];
    for i in 0 .. 60 {
        let (worker, source) = if i % 3 == 0 { (1, 3) } else { (0, 0) };
        inputs[worker].push((source, Value::tuple(format!("k{}", i % 6), i)));
    }
    drive(&mut operations, inputs);

    let mut groups: BTreeMap<String, (i32, Vec<i32>)> = BTreeMap::new();
    for (target, value) in seen.iter().flat_map(|c| c.values()) {
        let (key, list) = value.into_pair().unwrap();
        let Value::List(values) = list else { panic!("group is not a list") };
        let mut values: Vec<i32> = values.iter().map(|v| v.as_integer().unwrap()).collect();
        values.sort();
        let previous = groups.insert(key.as_str().unwrap().to_owned(), (target, values));
        assert!(previous.is_none(), "a key was grouped twice");
    }
    assert_eq!(groups.len(), 6);
    for (key, (_, values)) in groups.iter() {
        let residue: i32 = key[1 ..].parse().unwrap();
        assert_eq!(*values, (0 .. 60).filter(|i| i % 6 == residue).collect::<Vec<_>>());
    }
    for collected in seen.iter() {
        assert_eq!(collected.syncs().len(), 1);
    }
}

#[test]
fn sorted_keyed_gather_delivers_keys_in_order() {
    let mut communicators = cluster(2, |_| { });
    let seen = [Collected::default(), Collected::default()];
    let mut operations: Vec<BKeyedGather> = communicators.iter_mut().enumerate()
        .map(|(worker, communicator)| {
            BKeyedGather::sorted(communicator, plan(worker, 2, 3), vec![0, 3], vec![2, 5], MessageType::Integer, MessageType::String, natural_order(), seen[worker].clone()).unwrap()
        })
        .collect();
    let inputs = vec![
        (0 .. 40).rev().map(|k| (0, Value::tuple(k, "zero"))).collect(),
        (0 .. 40).map(|k| (3, Value::tuple(k, "three"))).collect(),
    ];
    drive(&mut operations, inputs);

    let mut total = 0;
    for values in seen.iter().flat_map(|c| by_target(c.values()).into_values()) {
        let keys: Vec<i32> = values.iter().map(|v| v.as_pair().and_then(|(k, _)| k.as_integer()).unwrap()).collect();
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", keys);
        total += keys.len();
    }
    assert_eq!(total, 40);
}

#[test]
fn streaming_barriers_arrive_in_rounds() {
    let mut communicators = cluster(2, |_| { });
    let seen = [Collected::default(), Collected::default()];
    let mut operations: Vec<SPartition> = communicators.iter_mut().enumerate()
        .map(|(worker, communicator)| {
            SPartition::new(communicator, plan(worker, 2, 3), vec![0, 3], vec![2, 5], MessageType::Integer, seen[worker].clone()).unwrap()
        })
        .collect();
    let sources = [0, 3];
    let barriers: [&[u8]; 2] = [b"one", b"two"];
    let mut rounds = [0usize; 2];
    for (worker, operation) in operations.iter_mut().enumerate() {
        assert!(operation.send(sources[worker], &Value::Integer(worker as i32), 0).unwrap());
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        for (worker, operation) in operations.iter_mut().enumerate() {
            if rounds[worker] < barriers.len() && operation.send_barrier(sources[worker], barriers[rounds[worker]]).unwrap() {
                rounds[worker] += 1;
                if rounds[worker] == 1 {
                    assert!(operation.send(sources[worker], &Value::Integer(10 + worker as i32), 0).unwrap());
                }
            }
            operation.progress_channel();
            assert!(operation.error().is_none(), "{:?}", operation.error());
        }
        let delivered = seen.iter().all(|c| c.syncs().len() == 2);
        if rounds == [2, 2] && delivered && operations.iter().all(|o| o.is_complete()) {
            break;
        }
        assert!(Instant::now() < deadline, "barriers were not delivered");
    }

    assert_eq!(seen[0].syncs(), vec![(2, Some(b"one".to_vec())), (2, Some(b"two".to_vec()))]);
    assert_eq!(seen[1].syncs(), vec![(5, Some(b"one".to_vec())), (5, Some(b"two".to_vec()))]);
    let values: BTreeSet<i32> = seen.iter().flat_map(|c| c.values()).map(|(_, v)| v.as_integer().unwrap()).collect();
    assert_eq!(values, [0, 1, 10, 11].into_iter().collect());
}

#[test]
fn fixed_schema_across_workers() {
    let mut communicators = cluster(2, |_| { });
    let seen = [Collected::default(), Collected::default()];
    let mut operations: Vec<BPartition> = communicators.iter_mut().enumerate()
        .map(|(worker, communicator)| {
            BPartition::new(communicator, plan(worker, 2, 3), vec![0, 3], vec![2, 5], MessageType::Integer, seen[worker].clone())
                .and_then(|partition| partition.with_schema(MessageSchema::fixed(4)))
                .unwrap()
        })
        .collect();
    drive(&mut operations, vec![
        (0 .. 30).map(|i| (0, Value::Integer(i))).collect(),
        (30 .. 60).map(|i| (3, Value::Integer(i))).collect(),
    ]);
    let values: Vec<i32> = integers(seen.iter().flat_map(|c| c.values()).collect()).into_values().flatten().collect();
    assert_eq!(values.into_iter().collect::<BTreeSet<_>>(), (0 .. 60).collect());
}

#[test]
fn schema_is_fixed_once_traffic_starts() {
    let mut communicators = cluster(1, |_| { });
    let mut partition = BPartition::new(&mut communicators[0], plan(0, 1, 2), vec![0], vec![1], MessageType::Integer, Collected::default()).unwrap();
    assert!(partition.partition(0, &Value::Integer(1), 0).unwrap());
    assert!(matches!(partition.with_schema(MessageSchema::fixed(4)), Err(CommError::Config { .. })));
}

#[test]
fn lost_peer_is_reported_as_degraded() {
    let mut communicators = cluster(2, |_| { });
    let seen = [Collected::default(), Collected::default()];
    let mut operations: Vec<BPartition> = communicators.iter_mut().enumerate()
        .map(|(worker, communicator)| {
            BPartition::new(communicator, plan(worker, 2, 3), vec![0, 3], vec![2, 5], MessageType::Integer, seen[worker].clone()).unwrap()
        })
        .collect();

    // worker 1 goes away mid-operation, with its source never synced.
    drop(operations.pop());
    drop(communicators.pop());

    let partition = &mut operations[0];
    for value in 0 .. 8 {
        assert!(partition.partition(0, &Value::Integer(value), 0).unwrap());
    }
    while !partition.finish(0).unwrap() {
        partition.progress_channel();
    }
    progress_until(&mut *partition, |p| !p.degraded_workers().is_empty());

    assert_eq!(partition.degraded_workers(), vec![1]);
    assert_eq!(partition.error(), Some(&CommError::Degraded { worker: 1 }));
    assert_eq!(communicators[0].degraded_workers(), vec![1]);
    for _ in 0 .. 100 {
        partition.progress_channel();
    }
    assert!(!partition.is_complete());
    assert!(seen[0].syncs().is_empty());
}

#[test]
fn join_reports_peers_lost_on_either_side() {
    let mut communicators = cluster(2, |_| { });
    let seen = [Collected::default(), Collected::default()];
    // the left side stays on worker 0; only the right side hears from worker 1.
    let mut operations: Vec<BJoin> = communicators.iter_mut().enumerate()
        .map(|(worker, communicator)| {
            let left = JoinInput { sources: vec![0], data_type: MessageType::String };
            let right = JoinInput { sources: vec![3], data_type: MessageType::String };
            BJoin::new(communicator, plan(worker, 2, 3), left, right, vec![1], MessageType::Integer, JoinType::Inner, JoinAlgorithm::Hash, seen[worker].clone()).unwrap()
        })
        .collect();
    drop(operations.pop());
    drop(communicators.pop());

    let join = &mut operations[0];
    assert!(join.join(0, Relation::Left, 1, "left", 0).unwrap());
    progress_until(&mut *join, |j| !j.degraded_workers().is_empty());
    assert_eq!(join.degraded_workers(), vec![1]);
    assert_eq!(join.error(), Some(&CommError::Degraded { worker: 1 }));
    assert!(!join.is_complete());
}
