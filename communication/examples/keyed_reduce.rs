//! Counts words across a cluster.
//!
//! Run one process per worker, for example in two terminals:
//!
//! ```text
//! cargo run --example keyed_reduce -- -n 2 -p 0
//! cargo run --example keyed_reduce -- -n 2 -p 1
//! ```

use std::rc::Rc;

use weft_communication::operation::BKeyedReduce;
use weft_communication::routing::LogicalPlanBuilder;
use weft_communication::{BulkReceiver, Config, DataFlowOperation, MessageType, Value};

const TASKS_PER_WORKER: usize = 4;
const WORDS: [&str; 5] = ["alpha", "beta", "gamma", "delta", "epsilon"];

struct Print;

impl BulkReceiver for Print {
    fn receive(&mut self, target: i32, values: Vec<Value>) -> Result<(), Vec<Value>> {
        for value in values {
            if let Some((word, count)) = value.as_pair() {
                println!("task {}: {:?} -> {:?}", target, word, count);
            }
        }
        Ok(())
    }

    fn sync(&mut self, target: i32, _barrier: Option<&[u8]>) -> bool {
        println!("task {}: complete", target);
        true
    }
}

fn main() {
    let config = match Config::from_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => { eprintln!("{}", error); std::process::exit(1); },
    };
    let worker = config.process;
    let workers = config.processes();
    let mut communicator = weft_communication::initialize(config).expect("cluster did not start");

    // the first half of every worker's tasks send, the second half receive.
    let plan = Rc::new(LogicalPlanBuilder::new(worker).blocks(workers, TASKS_PER_WORKER).build());
    let (sources, targets): (Vec<i32>, Vec<i32>) = (0 .. (workers * TASKS_PER_WORKER) as i32)
        .partition(|task| (*task as usize % TASKS_PER_WORKER) < TASKS_PER_WORKER / 2);
    let local: Vec<i32> = plan.tasks_of_worker(worker).into_iter().filter(|t| sources.contains(t)).collect();

    let sum = |a: Value, b: Value| Value::Long(a.as_long().unwrap_or(0) + b.as_long().unwrap_or(0));
    let mut counts = BKeyedReduce::new(&mut communicator, plan, sources, targets, MessageType::String, MessageType::Long, sum, Print)
        .expect("invalid operation");

    for (index, source) in local.iter().enumerate() {
        for round in 0 .. 1000 {
            let word = WORDS[(round + index) % WORDS.len()];
            while !counts.send(*source, &Value::tuple(word, 1i64), 0).expect("send failed") {
                counts.progress_channel();
            }
        }
        while !counts.finish(*source).expect("finish failed") {
            counts.progress_channel();
        }
    }
    while !counts.is_complete() {
        counts.progress_channel();
        if let Some(error) = counts.error() {
            eprintln!("worker {}: {}", worker, error);
            break;
        }
    }
    communicator.close();
}
