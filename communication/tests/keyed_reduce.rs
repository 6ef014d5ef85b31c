use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use weft_communication::operation::BKeyedReduce;
use weft_communication::routing::LogicalPlanBuilder;
use weft_communication::{BulkReceiver, Communicator, Config, DataFlowOperation, MessageType, PartitionAlgorithm, Value};

/// Totals per key, and how many times each target synced.
#[derive(Clone, Default)]
struct Totals {
    totals: Rc<RefCell<HashMap<String, i32>>>,
    syncs: Rc<RefCell<HashMap<i32, usize>>>,
}

impl BulkReceiver for Totals {
    fn receive(&mut self, _target: i32, values: Vec<Value>) -> Result<(), Vec<Value>> {
        let mut totals = self.totals.borrow_mut();
        for value in values {
            let (key, total) = value.into_pair().expect("keyed output");
            let previous = totals.insert(key.as_str().expect("string key").to_owned(), total.as_integer().expect("integer total"));
            assert!(previous.is_none(), "a key was delivered twice");
        }
        Ok(())
    }

    fn sync(&mut self, target: i32, _barrier: Option<&[u8]>) -> bool {
        *self.syncs.borrow_mut().entry(target).or_default() += 1;
        true
    }
}

fn sum(left: Value, right: Value) -> Value {
    Value::Integer(left.as_integer().unwrap_or(0) + right.as_integer().unwrap_or(0))
}

/// Each source sends `("a", 1)` and `("b", 1)` a thousand times each.
fn send_ones<O: DataFlowOperation>(operation: &mut O, source: i32, sent: &mut usize) -> bool {
    while *sent < 2000 {
        let key = if *sent % 2 == 0 { "a" } else { "b" };
        if !operation.send(source, &Value::tuple(key, 1), 0).unwrap() {
            return false;
        }
        *sent += 1;
    }
    operation.finish(source).unwrap()
}

#[test]
fn four_sources_on_one_worker() {
    for algorithm in [PartitionAlgorithm::Simple, PartitionAlgorithm::Ring] {
        let config = Config { batch_partition_algorithm: algorithm, ..Config::local(0, 1) };
        let mut communicator = Communicator::bind(config, 0, "127.0.0.1:0").unwrap();
        let plan = Rc::new(LogicalPlanBuilder::new(0).blocks(1, 5).build());
        let totals = Totals::default();
        let mut reduce = BKeyedReduce::new(
            &mut communicator, plan, vec![0, 1, 2, 3], vec![4],
            MessageType::String, MessageType::Integer, sum, totals.clone()).unwrap();

        let mut sent = [0usize; 4];
        let mut done = [false; 4];
        while !reduce.is_complete() {
            for source in 0 .. 4 {
                if !done[source] {
                    done[source] = send_ones(&mut reduce, source as i32, &mut sent[source]);
                }
            }
            reduce.progress();
        }

        let totals_seen = totals.totals.borrow();
        assert_eq!(totals_seen.len(), 2);
        assert_eq!(totals_seen["a"], 4000);
        assert_eq!(totals_seen["b"], 4000);
        assert_eq!(totals.syncs.borrow()[&4], 1);
    }
}

#[test]
fn four_sources_across_two_workers() {
    let mut communicators: Vec<Communicator> = (0 .. 2)
        .map(|worker| Communicator::bind(Config::local(worker, 2), worker, "127.0.0.1:0").unwrap())
        .collect();
    let addresses: Vec<String> = communicators.iter().map(|c| c.local_addr().to_string()).collect();
    for communicator in communicators.iter_mut() {
        communicator.connect_peers(&addresses).unwrap();
    }
    while !communicators.iter().all(|c| c.all_connected()) {
        for communicator in communicators.iter_mut() {
            communicator.progress();
        }
    }

    // worker 0 hosts tasks 0, 1, 2; worker 1 hosts 3, 4, 5.
    let totals = [Totals::default(), Totals::default()];
    let mut operations: Vec<BKeyedReduce> = communicators.iter_mut().enumerate()
        .map(|(worker, communicator)| {
            let plan = Rc::new(LogicalPlanBuilder::new(worker).blocks(2, 3).build());
            BKeyedReduce::new(
                communicator, plan, vec![0, 1, 3, 4], vec![2, 5],
                MessageType::String, MessageType::Integer, sum, totals[worker].clone()).unwrap()
        })
        .collect();

    let local_sources = [[0, 1], [3, 4]];
    let mut sent = [[0usize; 2]; 2];
    let mut done = [[false; 2]; 2];
    let mut rounds = 0;
    while !operations.iter().all(|o| o.is_complete()) {
        for (worker, operation) in operations.iter_mut().enumerate() {
            for (index, source) in local_sources[worker].iter().enumerate() {
                if !done[worker][index] {
                    done[worker][index] = send_ones(operation, *source, &mut sent[worker][index]);
                }
            }
            operation.progress_channel();
        }
        rounds += 1;
        assert!(rounds < 1_000_000, "keyed reduce did not complete");
    }

    let mut merged = HashMap::new();
    for totals in totals.iter() {
        merged.extend(totals.totals.borrow().iter().map(|(k, v)| (k.clone(), *v)));
    }
    assert_eq!(merged.len(), 2);
    assert_eq!(merged["a"], 4000);
    assert_eq!(merged["b"], 4000);
    assert_eq!(totals[0].syncs.borrow()[&2], 1);
    assert_eq!(totals[1].syncs.borrow()[&5], 1);

    for communicator in communicators.iter_mut() {
        communicator.close();
    }
}
