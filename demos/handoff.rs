use std::{sync::Arc, thread, time::Duration};

use clap::Parser;
use completeable::{futures::completeable::Completeable, scope::WaitScope, task::Executor};
use log::{debug, info};

/// Hand a value from one producer thread to many consumers.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of consumer threads blocking on the value.
    #[arg(short, long, default_value_t = 4)]
    consumers: usize,

    /// How long the producer takes to come up with the value, in milliseconds.
    #[arg(short, long, default_value_t = 500)]
    delay: u64,

    /// How long each consumer is willing to wait, in milliseconds.
    #[arg(short, long, default_value_t = 1000)]
    timeout: u64,

    /// Cancel the future instead of completing it.
    #[arg(long)]
    cancel: bool,
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    let fut = Arc::new(Completeable::<String>::new());

    let consumers: Vec<_> = (0..args.consumers)
        .map(|i| {
            let fut = fut.clone();
            let scope = WaitScope::with_timeout(Duration::from_millis(args.timeout));
            thread::spawn(move || {
                debug!("consumer {} waiting", i);
                match fut.wait(&scope) {
                    Ok(v) => println!("consumer {}: got {:?}", i, v),
                    Err(e) => println!("consumer {}: {}", i, e),
                }
            })
        })
        .collect();

    let producer = {
        let fut = fut.clone();
        let cancel = args.cancel;
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(args.delay));

            if cancel {
                info!("producer cancelling");
                fut.cancel();
            } else if let Err(e) = fut.complete(String::from("Hello, world!")) {
                info!("producer lost: {}", e);
            }
        })
    };

    // An async task waits alongside the threads.
    let task_result = {
        let fut = fut.clone();
        let timeout = Duration::from_millis(args.timeout);
        Executor::block_on(async move {
            let scope = WaitScope::with_timeout(timeout);
            fut.get(&scope).await
        })
    };
    println!("task: {:?}", task_result);

    producer.join().unwrap();
    for consumer in consumers {
        consumer.join().unwrap();
    }

    println!("final state: {:?}", fut);
}
