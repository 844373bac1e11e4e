// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Sorted Merkle tree over key/value leaves.
//!
//! Leaves are ordered by key. A leaf hashes to `keccak256(key ‖ value)`, a
//! parent to `keccak256(min(a, b) ‖ max(a, b))`, and an unpaired node is
//! carried to the next level unchanged. Because pairs are sorted, a proof is
//! just the list of sibling hashes from the leaf up.

use ethers::types::H256;
use ethers::utils::keccak256;
use std::collections::BTreeMap;

pub fn leaf_hash(key: &str, value: &[u8]) -> H256 {
    let mut buf = Vec::with_capacity(key.len() + value.len());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(value);
    H256::from(keccak256(buf))
}

fn hash_pair(a: &H256, b: &H256) -> H256 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(lo.as_bytes());
    buf[32..].copy_from_slice(hi.as_bytes());
    H256::from(keccak256(buf))
}

/// 8 byte big-endian two's complement encoding used for numeric leaves.
pub fn encode_int(value: i64) -> [u8; 8] {
    value.to_be_bytes()
}

pub struct SortedMerkleTree {
    keys: Vec<String>,
    /// `layers[0]` are the leaf hashes, the last layer holds the root.
    layers: Vec<Vec<H256>>,
}

impl SortedMerkleTree {
    pub fn new(data: &BTreeMap<String, Vec<u8>>) -> Self {
        let keys: Vec<String> = data.keys().cloned().collect();
        let leaves: Vec<H256> = data.iter().map(|(k, v)| leaf_hash(k, v)).collect();
        let mut layers = vec![leaves];
        while layers.last().map(|l| l.len() > 1).unwrap_or(false) {
            let prev = &layers[layers.len() - 1];
            let next = prev
                .chunks(2)
                .map(|pair| match pair {
                    [a, b] => hash_pair(a, b),
                    [a] => *a,
                    _ => unreachable!("chunks(2) yields one or two nodes"),
                })
                .collect();
            layers.push(next);
        }
        Self { keys, layers }
    }

    pub fn root(&self) -> H256 {
        self.layers
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or_else(H256::zero)
    }

    pub fn proof(&self, key: &str) -> Option<Vec<H256>> {
        let mut index = self.keys.binary_search_by(|k| k.as_str().cmp(key)).ok()?;
        let mut proof = vec![];
        for layer in &self.layers[..self.layers.len() - 1] {
            let sibling = index ^ 1;
            if let Some(hash) = layer.get(sibling) {
                proof.push(*hash);
            }
            index /= 2;
        }
        Some(proof)
    }

    pub fn verify_proof(proof: &[H256], root: &H256, leaf: &H256) -> bool {
        let computed = proof.iter().fold(*leaf, |acc, sibling| hash_pair(&acc, sibling));
        &computed == root
    }
}
