//! Property-based tests for the segmented queue
//!
//! A single-threaded run must behave exactly like `VecDeque`, whatever the
//! interleaving of operations and however many segments it spans.

use super::*;
use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum QueueOp {
    Enqueue(i32),
    EnqueueMany(Vec<i32>),
    Dequeue,
    Peek,
}

fn queue_op() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        5 => any::<i32>().prop_map(QueueOp::Enqueue),
        1 => prop::collection::vec(any::<i32>(), 0..80).prop_map(QueueOp::EnqueueMany),
        4 => Just(QueueOp::Dequeue),
        1 => Just(QueueOp::Peek),
    ]
}

proptest! {
    #[test]
    fn test_matches_vec_deque(ops in prop::collection::vec(queue_op(), 1..400)) {
        let queue = SegmentedQueue::new();
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                QueueOp::Enqueue(value) => {
                    queue.enqueue(value);
                    model.push_back(value);
                }
                QueueOp::EnqueueMany(values) => {
                    for value in values {
                        queue.enqueue(value);
                        model.push_back(value);
                    }
                }
                QueueOp::Dequeue => prop_assert_eq!(queue.try_dequeue(), model.pop_front()),
                QueueOp::Peek => prop_assert_eq!(queue.try_peek(), model.front().copied()),
            }

            prop_assert_eq!(queue.len(), model.len());
            prop_assert_eq!(queue.is_empty(), model.is_empty());
        }

        prop_assert_eq!(queue.to_vec(), model.iter().copied().collect::<Vec<_>>());
    }

    #[test]
    fn test_no_memory_leaks(
        values in prop::collection::vec(any::<i32>(), 1..200),
        dequeues in 0usize..200,
    ) {
        let tracker = Arc::new(());
        {
            let queue = SegmentedQueue::new();
            for &value in &values {
                queue.enqueue((value, Arc::clone(&tracker)));
            }
            for _ in 0..dequeues {
                queue.try_dequeue();
            }
            prop_assert_eq!(queue.len(), values.len().saturating_sub(dequeues));
        }
        prop_assert_eq!(Arc::strong_count(&tracker), 1);
    }
}
