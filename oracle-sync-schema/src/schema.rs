// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

diesel::table! {
    blocks (block_id) {
        block_id -> Int8,
        status -> Text,
        data_timestamp -> Int8,
        root -> Text,
        staked -> Text,
        power -> Text,
        voters -> Array<Text>,
        votes -> Jsonb,
        fcd -> Jsonb,
        chain_address -> Text,
        anchor -> Int8,
    }
}

diesel::table! {
    leaves (block_id, key) {
        block_id -> Int8,
        key -> Text,
        value -> Text,
        proof -> Array<Text>,
    }
}

diesel::table! {
    chain_instances (id) {
        id -> Text,
        chain_id -> Text,
        address -> Text,
        anchor -> Int8,
        blocks_count_offset -> Int8,
    }
}

diesel::table! {
    replications (chain_id, block_id) {
        chain_id -> Text,
        block_id -> Int8,
        anchor -> Int8,
        chain_address -> Text,
        minter -> Text,
        status -> Text,
    }
}

diesel::table! {
    fcds (chain_id, key) {
        chain_id -> Text,
        key -> Text,
        value -> Float8,
        data_timestamp -> Int8,
    }
}

diesel::table! {
    mappings (key) {
        key -> Text,
        value -> Text,
    }
}

diesel::table! {
    job_locks (name) {
        name -> Text,
        owner -> Text,
        expires_at_ms -> Int8,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    blocks,
    leaves,
    chain_instances,
    replications,
    fcds,
    mappings,
    job_locks,
);
