// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

/// Splits the inclusive range `[from, to]` into consecutive inclusive chunks of
/// at most `batch_size` blocks. An empty range (`from >= to`) yields no chunks.
pub fn build_ranges(from: u64, to: u64, batch_size: u64) -> Vec<[u64; 2]> {
    if from >= to || batch_size == 0 {
        return vec![];
    }
    let mut ranges = vec![];
    let mut start = from;
    loop {
        let end = start.saturating_add(batch_size - 1).min(to);
        ranges.push([start, end]);
        if end >= to {
            break;
        }
        start = end + 1;
    }
    ranges
}
