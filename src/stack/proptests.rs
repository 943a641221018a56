//! Property-based tests for the lock-free stack against `Vec`

use super::*;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum StackOp {
    Push(i32),
    PushRange(Vec<i32>),
    Pop,
    PopRange(usize),
    Peek,
    Clear,
}

fn stack_op() -> impl Strategy<Value = StackOp> {
    prop_oneof![
        5 => any::<i32>().prop_map(StackOp::Push),
        2 => prop::collection::vec(any::<i32>(), 0..20).prop_map(StackOp::PushRange),
        4 => Just(StackOp::Pop),
        2 => (0usize..8).prop_map(StackOp::PopRange),
        1 => Just(StackOp::Peek),
        1 => Just(StackOp::Clear),
    ]
}

proptest! {
    #[test]
    fn test_matches_vec(ops in prop::collection::vec(stack_op(), 1..300)) {
        let stack = LockFreeStack::new();
        let mut model: Vec<i32> = Vec::new();

        for op in ops {
            match op {
                StackOp::Push(value) => {
                    stack.push(value);
                    model.push(value);
                }
                StackOp::PushRange(values) => {
                    stack.push_range(values.clone());
                    model.extend(values);
                }
                StackOp::Pop => prop_assert_eq!(stack.try_pop(), model.pop()),
                StackOp::PopRange(n) => {
                    let mut buffer = vec![0; n];
                    let popped = stack.try_pop_range(&mut buffer);
                    let expected: Vec<i32> = (0..n).map_while(|_| model.pop()).collect();
                    prop_assert_eq!(popped, expected.len());
                    prop_assert_eq!(&buffer[..popped], &expected[..]);
                }
                StackOp::Peek => prop_assert_eq!(stack.try_peek(), model.last().copied()),
                StackOp::Clear => {
                    stack.clear();
                    model.clear();
                }
            }

            prop_assert_eq!(stack.len(), model.len());
        }

        let expected: Vec<i32> = model.iter().rev().copied().collect();
        prop_assert_eq!(stack.to_vec(), expected);
    }
}
