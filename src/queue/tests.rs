//! Multi-threaded tests for the segmented queue

use super::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn test_mpmc_stress_test() {
    let queue = Arc::new(SegmentedQueue::new());
    let num_producers = 8;
    let num_consumers = 8;
    let items_per_producer = 10000;
    let total = num_producers * items_per_producer;
    let consumed = Arc::new(AtomicUsize::new(0));

    let producer_handles: Vec<_> = (0..num_producers)
        .map(|producer_id| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..items_per_producer {
                    queue.enqueue(producer_id * items_per_producer + i);
                }
            })
        })
        .collect();

    let consumer_handles: Vec<_> = (0..num_consumers)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let consumed = Arc::clone(&consumed);
            thread::spawn(move || {
                let mut seen = Vec::new();
                while consumed.load(Ordering::Relaxed) < total {
                    match queue.try_dequeue() {
                        Some(value) => {
                            consumed.fetch_add(1, Ordering::Relaxed);
                            seen.push(value);
                        }
                        None => thread::yield_now(),
                    }
                }
                seen
            })
        })
        .collect();

    for handle in producer_handles {
        handle.join().unwrap();
    }

    let mut all = HashSet::with_capacity(total);
    for handle in consumer_handles {
        for value in handle.join().unwrap() {
            assert!(all.insert(value), "value {} dequeued twice", value);
        }
    }

    assert_eq!(all.len(), total);
    assert!(queue.is_empty());
    assert_eq!(queue.try_dequeue(), None);
}

#[test]
fn test_per_producer_order_is_preserved() {
    let queue = Arc::new(SegmentedQueue::new());
    let num_producers = 4;
    let items_per_producer = 5000;

    let handles: Vec<_> = (0..num_producers)
        .map(|producer_id| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for seq in 0..items_per_producer {
                    queue.enqueue((producer_id, seq));
                }
            })
        })
        .collect();

    // Drain concurrently with the producers from a single consumer.
    let mut next_expected = vec![0; num_producers];
    let mut received = 0;
    while received < num_producers * items_per_producer {
        if let Some((producer_id, seq)) = queue.try_dequeue() {
            assert_eq!(seq, next_expected[producer_id], "producer {} out of order", producer_id);
            next_expected[producer_id] += 1;
            received += 1;
        } else {
            thread::yield_now();
        }
    }

    for handle in handles {
        handle.join().unwrap();
    }
    assert!(queue.is_empty());
}

#[test]
fn test_snapshots_during_concurrent_dequeue() {
    let queue: Arc<SegmentedQueue<String>> =
        Arc::new((0..20_000).map(|i| format!("value_{:05}", i)).collect());
    let done = Arc::new(AtomicBool::new(false));

    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut count = 0;
                while queue.try_dequeue().is_some() {
                    count += 1;
                }
                count
            })
        })
        .collect();

    let observer = {
        let queue = Arc::clone(&queue);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                // Whatever a snapshot sees must be intact and in order.
                let snapshot = queue.to_vec();
                assert!(snapshot.windows(2).all(|pair| pair[0] < pair[1]));
                assert!(snapshot.iter().all(|v| v.starts_with("value_")));

                if let Some(head) = queue.try_peek() {
                    assert!(head.starts_with("value_"));
                }
            }
        })
    };

    let dequeued: usize = consumers.into_iter().map(|h| h.join().unwrap()).sum();
    done.store(true, Ordering::Relaxed);
    observer.join().unwrap();

    assert_eq!(dequeued, 20_000);
    assert!(queue.is_empty());
}

#[test]
fn test_len_tracks_concurrent_producers() {
    let queue = Arc::new(SegmentedQueue::new());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..1000 {
                    queue.enqueue(i);
                    assert!(queue.len() >= 1);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(queue.len(), 4000);
    assert_eq!(queue.iter().count(), 4000);
}
