//! Ordered merge of pre-sorted event streams
//!
//! k-way merge over a min-heap. Ties on the ordering key resolve by input
//! stream index, then by position within that stream, so the merge is
//! stable and independent of network arrival order.

use super::types::CanonicalEvent;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Merge streams that are each sorted by `(block_number, tx_index)`.
pub fn merge_streams(streams: Vec<Vec<CanonicalEvent>>) -> Vec<CanonicalEvent> {
    merge_by(streams, |e| e.ordering_key())
}

/// Merge with an explicit key. Each input must already be sorted by `key`.
pub fn merge_by<K, F>(streams: Vec<Vec<CanonicalEvent>>, key: F) -> Vec<CanonicalEvent>
where
    K: Ord,
    F: Fn(&CanonicalEvent) -> K,
{
    let total: usize = streams.iter().map(Vec::len).sum();
    let mut iters: Vec<_> = streams.into_iter().map(|s| s.into_iter()).collect();
    let mut heap = BinaryHeap::with_capacity(iters.len());
    let mut heads: Vec<Option<CanonicalEvent>> = Vec::with_capacity(iters.len());

    for (idx, it) in iters.iter_mut().enumerate() {
        let head = it.next();
        if let Some(ev) = &head {
            heap.push(Reverse((key(ev), idx, 0usize)));
        }
        heads.push(head);
    }

    let mut out = Vec::with_capacity(total);
    while let Some(Reverse((_, idx, seq))) = heap.pop() {
        if let Some(ev) = heads[idx].take() {
            out.push(ev);
        }
        if let Some(next) = iters[idx].next() {
            heap.push(Reverse((key(&next), idx, seq + 1)));
            heads[idx] = Some(next);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Address, EventPayload};
    use num_bigint::BigInt;

    fn ev(block: u64, tx: u64, log: u64, increased: bool) -> CanonicalEvent {
        let operator = Address::zero();
        let payload = if increased {
            EventPayload::OperatorSharesIncreased {
                operator: operator.clone(),
                staker: operator.clone(),
                strategy: operator,
                shares: BigInt::from(1),
            }
        } else {
            EventPayload::OperatorSharesDecreased {
                operator: operator.clone(),
                staker: operator.clone(),
                strategy: operator,
                shares: BigInt::from(1),
            }
        };
        CanonicalEvent {
            address: Address::zero(),
            tx_hash: format!("0x{:064x}", block * 1000 + tx),
            tx_index: tx,
            log_index: log,
            block_number: block,
            block_time: block as i64 * 12,
            payload,
        }
    }

    #[test]
    fn test_interleaves_by_block_and_tx() {
        let inc = vec![ev(1, 0, 0, true), ev(3, 0, 0, true), ev(5, 2, 0, true)];
        let dec = vec![ev(2, 0, 0, false), ev(5, 1, 0, false)];

        let merged = merge_streams(vec![inc, dec]);
        let keys: Vec<_> = merged.iter().map(|e| e.ordering_key()).collect();
        assert_eq!(keys, vec![(1, 0), (2, 0), (3, 0), (5, 1), (5, 2)]);
    }

    #[test]
    fn test_ties_preserve_input_stream_order() {
        let inc = vec![ev(4, 1, 3, true)];
        let dec = vec![ev(4, 1, 2, false)];

        let merged = merge_streams(vec![inc, dec]);
        assert!(matches!(merged[0].payload, EventPayload::OperatorSharesIncreased { .. }));
        assert!(matches!(merged[1].payload, EventPayload::OperatorSharesDecreased { .. }));

        let inc = vec![ev(4, 1, 3, true)];
        let dec = vec![ev(4, 1, 2, false)];
        let merged = merge_streams(vec![dec, inc]);
        assert!(matches!(merged[0].payload, EventPayload::OperatorSharesDecreased { .. }));
    }

    #[test]
    fn test_ties_within_one_stream_keep_sequence() {
        let a = vec![ev(1, 0, 0, true), ev(1, 0, 1, true), ev(1, 0, 2, true)];
        let merged = merge_streams(vec![a, vec![]]);
        let logs: Vec<_> = merged.iter().map(|e| e.log_index).collect();
        assert_eq!(logs, vec![0, 1, 2]);
    }

    #[test]
    fn test_merge_by_custom_key() {
        let a = vec![ev(1, 0, 9, true), ev(2, 0, 1, true)];
        let b = vec![ev(1, 0, 3, false)];
        let merged = merge_by(vec![a, b], |e| (e.block_number, e.tx_index, e.log_index));
        let logs: Vec<_> = merged.iter().map(|e| e.log_index).collect();
        assert_eq!(logs, vec![3, 9, 1]);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(merge_streams(vec![]).is_empty());
        assert!(merge_streams(vec![vec![], vec![]]).is_empty());
    }
}
