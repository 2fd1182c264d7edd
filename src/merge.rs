//! K-way pull merge of independently sorted timestamped sequences.
//!
//! Each input is primed with a one-element lookahead; every pull scans the
//! still-live inputs, yields the strictly minimal lookahead timestamp
//! (first-encountered wins ties), advances that input, and retires inputs
//! that report exhaustion. Cost is `O(N)` per yielded element, which is fine:
//! the source count is small while the element count is large.
//!
//! The output is globally non-decreasing **iff** every input is individually
//! non-decreasing. That precondition is a caller contract and is not
//! verified here; violations propagate silently as out-of-order output.

use crate::error::{Error, Result};
use crate::types::Timestamped;

/// A pull-able sequence feeding the merge.
///
/// `None` signals exhaustion; an `Err` item signals a producer-side fault and
/// terminates the whole merge.
pub trait PullInput<T>: Send {
    /// Pull the next element, blocking until one is available or the input is
    /// exhausted.
    fn pull(&mut self) -> Option<Result<Timestamped<T>>>;
}

impl<T, F> PullInput<T> for F
where
    F: FnMut() -> Option<Result<Timestamped<T>>> + Send,
{
    fn pull(&mut self) -> Option<Result<Timestamped<T>>> {
        self()
    }
}

struct Slot<T, I> {
    lookahead: Timestamped<T>,
    input: I,
}

/// Merges N pull sequences into one globally time-ordered sequence.
pub struct PullMerge<T, I> {
    unprimed: Vec<I>,
    slots: Vec<Slot<T, I>>,
    pending_error: Option<Error>,
    done: bool,
}

impl<T, I: PullInput<T>> PullMerge<T, I> {
    /// Create a merge over the given inputs.
    ///
    /// Inputs are primed lazily on the first pull, so construction never
    /// blocks.
    #[must_use]
    pub fn new(inputs: Vec<I>) -> Self {
        Self { unprimed: inputs, slots: Vec::new(), pending_error: None, done: false }
    }

    /// Number of inputs that are not yet exhausted.
    #[must_use]
    pub fn live_inputs(&self) -> usize {
        self.unprimed.len() + self.slots.len()
    }

    /// Pull the next merged element.
    ///
    /// Yields `Some(Err(_))` exactly once when any input faults, then
    /// terminates. Yields `None` once every input is exhausted.
    pub fn next_item(&mut self) -> Option<Result<Timestamped<T>>> {
        if self.done {
            return None;
        }
        if let Some(error) = self.pending_error.take() {
            self.done = true;
            return Some(Err(error));
        }

        if !self.unprimed.is_empty() {
            for mut input in self.unprimed.drain(..) {
                match input.pull() {
                    Some(Ok(lookahead)) => self.slots.push(Slot { lookahead, input }),
                    Some(Err(error)) => {
                        self.done = true;
                        return Some(Err(error));
                    },
                    None => {},
                }
            }
        }

        if self.slots.is_empty() {
            self.done = true;
            return None;
        }

        // Strict comparison keeps the first-encountered input on ties.
        let mut min = 0;
        for idx in 1..self.slots.len() {
            if self.slots[idx].lookahead.timestamp < self.slots[min].lookahead.timestamp {
                min = idx;
            }
        }

        match self.slots[min].input.pull() {
            Some(Ok(next)) => {
                Some(Ok(std::mem::replace(&mut self.slots[min].lookahead, next)))
            },
            Some(Err(error)) => {
                self.pending_error = Some(error);
                let slot = self.slots.remove(min);
                Some(Ok(slot.lookahead))
            },
            None => {
                let slot = self.slots.remove(min);
                Some(Ok(slot.lookahead))
            },
        }
    }
}

impl<T, I: PullInput<T>> Iterator for PullMerge<T, I> {
    type Item = Result<Timestamped<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_item()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn ts(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    type BoxedInput = Box<dyn FnMut() -> Option<Result<Timestamped<u32>>> + Send>;

    fn input_from(items: Vec<(i64, u32)>) -> BoxedInput {
        let mut iter = items.into_iter();
        Box::new(move || iter.next().map(|(secs, value)| Ok(Timestamped::new(value, ts(secs)))))
    }

    fn collect_values(merge: PullMerge<u32, BoxedInput>) -> Vec<u32> {
        merge.map(|item| item.unwrap().value).collect()
    }

    #[test]
    fn interleaves_two_sorted_inputs() {
        let merge = PullMerge::new(vec![
            input_from(vec![(1, 10), (3, 30)]),
            input_from(vec![(2, 20), (4, 40)]),
        ]);
        assert_eq!(collect_values(merge), vec![10, 20, 30, 40]);
    }

    #[test]
    fn ties_go_to_the_first_encountered_input() {
        let merge = PullMerge::new(vec![
            input_from(vec![(5, 1), (5, 2)]),
            input_from(vec![(5, 100)]),
        ]);
        assert_eq!(collect_values(merge), vec![1, 2, 100]);
    }

    #[test]
    fn uneven_lengths_drain_completely() {
        let merge = PullMerge::new(vec![
            input_from(vec![(1, 1)]),
            input_from(vec![(2, 2), (3, 3), (4, 4)]),
            input_from(vec![]),
        ]);
        assert_eq!(collect_values(merge), vec![1, 2, 3, 4]);
    }

    #[test]
    fn input_error_terminates_after_buffered_items() {
        let mut failing_sent = false;
        let failing: BoxedInput = Box::new(move || {
            if failing_sent {
                Some(Err(Error::source("b", "broken pipe")))
            } else {
                failing_sent = true;
                Some(Ok(Timestamped::new(7, ts(1))))
            }
        });
        let mut merge = PullMerge::new(vec![input_from(vec![(2, 9)]), failing]);

        assert_eq!(merge.next_item().unwrap().unwrap().value, 7);
        assert!(matches!(merge.next_item(), Some(Err(Error::Source { .. }))));
        assert!(merge.next_item().is_none());
        assert!(merge.next_item().is_none());
    }

    #[test]
    fn zero_inputs_is_an_empty_sequence() {
        let mut merge: PullMerge<u32, BoxedInput> = PullMerge::new(Vec::new());
        assert!(merge.next_item().is_none());
    }

    proptest! {
        #[test]
        fn merged_output_is_non_decreasing(
            raw in proptest::collection::vec(
                proptest::collection::vec(0i64..1000, 0..50),
                1..6,
            )
        ) {
            let inputs: Vec<BoxedInput> = raw
                .iter()
                .map(|timestamps| {
                    let mut sorted = timestamps.clone();
                    sorted.sort_unstable();
                    input_from(sorted.into_iter().map(|secs| (secs, 0)).collect())
                })
                .collect();

            let merged: Vec<Timestamp> = PullMerge::new(inputs)
                .map(|item| item.unwrap().timestamp)
                .collect();

            let total: usize = raw.iter().map(Vec::len).sum();
            prop_assert_eq!(merged.len(), total);
            prop_assert!(merged.windows(2).all(|pair| pair[0] <= pair[1]));
        }
    }
}
