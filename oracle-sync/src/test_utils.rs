// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Fakes for every external seam plus record builders shared by unit tests.

use crate::error::{SyncError, SyncResult};
use crate::foreign::ForeignChainContract;
use crate::home_chain::{FcdValue, HomeChain};
use crate::merkle::{encode_int, SortedMerkleTree};
use crate::rpc::{ChainRpc, LatestBlockFees};
use crate::types::{
    BlockSubmission, ForeignChainStatus, HomeChainStatus, MintEvent, OnChainBlock, TxReceipt,
    ValidatorBlockData, VoterEvent,
};
use crate::utils::format_h256;
use crate::validator_client::ValidatorClient;
use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address as EthAddress, Bytes, H256, U256};
use oracle_sync_schema::{Block, BlockStatus, ReplicationRecord, ReplicationRecordStatus};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Once};

pub const TEST_CHAIN_ADDRESS: &str = "0x00000000000000000000000000000000000000c1";

pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub fn completed_block(block_id: u64, data_timestamp: u64) -> Block {
    Block {
        block_id,
        status: BlockStatus::Completed,
        data_timestamp,
        root: format_h256(&H256::repeat_byte(block_id as u8)),
        staked: "1000".to_string(),
        power: "900".to_string(),
        voters: vec!["0xv1".to_string()],
        votes: BTreeMap::from([("0xv1".to_string(), "900".to_string())]),
        fcd: BTreeMap::new(),
        chain_address: TEST_CHAIN_ADDRESS.to_string(),
        anchor: block_id * 10,
    }
}

pub fn finalized_block(block_id: u64, data_timestamp: u64) -> Block {
    Block {
        status: BlockStatus::Finalized,
        ..completed_block(block_id, data_timestamp)
    }
}

pub fn replication(chain_id: &str, block_id: u64) -> ReplicationRecord {
    ReplicationRecord {
        chain_id: chain_id.to_string(),
        block_id,
        anchor: block_id * 10,
        chain_address: TEST_CHAIN_ADDRESS.to_string(),
        minter: "0x00000000000000000000000000000000000000aa".to_string(),
        status: ReplicationRecordStatus::Replicated,
    }
}

/// Validator payload with integer encoded values and the root it commits to.
pub fn validator_data(values: &[(&str, i64)]) -> (ValidatorBlockData, H256) {
    let leaves: BTreeMap<String, Vec<u8>> = values
        .iter()
        .map(|(key, value)| (key.to_string(), encode_int(*value).to_vec()))
        .collect();
    let data = ValidatorBlockData {
        data: leaves
            .iter()
            .map(|(key, value)| (key.clone(), format!("0x{}", hex::encode(value))))
            .collect(),
        numeric_fcd_keys: vec![],
        numeric_fcd_values: vec![],
    };
    (data, SortedMerkleTree::new(&leaves).root())
}

#[derive(Default)]
struct ChainRpcState {
    fees: LatestBlockFees,
    gas_price: u64,
    priority_fee: Option<u64>,
    block_number: u64,
    auto_mine: bool,
    receipts: HashMap<H256, TxReceipt>,
    transaction_count: u64,
    balance: U256,
    call_responses: HashMap<[u8; 4], SyncResult<Bytes>>,
    gas_estimate: Option<SyncResult<U256>>,
    sent: Vec<TypedTransaction>,
}

#[derive(Clone, Default)]
pub struct FakeChainRpc {
    state: Arc<Mutex<ChainRpcState>>,
}

impl FakeChainRpc {
    pub fn set_fees(&self, fees: LatestBlockFees) {
        self.state.lock().unwrap().fees = fees;
    }

    pub fn set_gas_price(&self, gas_price: u64) {
        self.state.lock().unwrap().gas_price = gas_price;
    }

    pub fn set_priority_fee(&self, fee: u64) {
        self.state.lock().unwrap().priority_fee = Some(fee);
    }

    /// Every `block_number` call observes a new block.
    pub fn set_auto_mine(&self, auto_mine: bool) {
        self.state.lock().unwrap().auto_mine = auto_mine;
    }

    pub fn set_receipt(&self, receipt: TxReceipt) {
        self.state
            .lock()
            .unwrap()
            .receipts
            .insert(receipt.tx_hash, receipt);
    }

    pub fn set_transaction_count(&self, count: u64) {
        self.state.lock().unwrap().transaction_count = count;
    }

    pub fn set_balance(&self, balance: U256) {
        self.state.lock().unwrap().balance = balance;
    }

    /// Answer for calls whose data starts with `selector`. Other calls revert.
    pub fn set_call_response(&self, selector: [u8; 4], response: SyncResult<Bytes>) {
        self.state
            .lock()
            .unwrap()
            .call_responses
            .insert(selector, response);
    }

    /// Defaults to 100_000.
    pub fn set_gas_estimate(&self, estimate: SyncResult<U256>) {
        self.state.lock().unwrap().gas_estimate = Some(estimate);
    }

    pub fn sent_transactions(&self) -> Vec<TypedTransaction> {
        self.state.lock().unwrap().sent.clone()
    }
}

#[async_trait]
impl ChainRpc for FakeChainRpc {
    fn sender(&self) -> EthAddress {
        EthAddress::repeat_byte(0xaa)
    }

    async fn block_number(&self) -> SyncResult<u64> {
        let mut state = self.state.lock().unwrap();
        if state.auto_mine {
            state.block_number += 1;
        }
        Ok(state.block_number)
    }

    async fn latest_block_fees(&self) -> SyncResult<LatestBlockFees> {
        Ok(self.state.lock().unwrap().fees.clone())
    }

    async fn gas_price(&self) -> SyncResult<u64> {
        Ok(self.state.lock().unwrap().gas_price)
    }

    async fn max_priority_fee_per_gas(&self) -> SyncResult<u64> {
        self.state
            .lock()
            .unwrap()
            .priority_fee
            .ok_or_else(|| SyncError::Rpc("method not found".into()))
    }

    async fn call(&self, tx: &TypedTransaction) -> SyncResult<Bytes> {
        let selector: [u8; 4] = tx
            .data()
            .and_then(|d| d.get(..4))
            .and_then(|s| s.try_into().ok())
            .unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .call_responses
            .get(&selector)
            .cloned()
            .unwrap_or_else(|| Err(SyncError::Rpc("execution reverted".into())))
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> SyncResult<U256> {
        self.state
            .lock()
            .unwrap()
            .gas_estimate
            .clone()
            .unwrap_or_else(|| Ok(U256::from(100_000)))
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> SyncResult<Option<TxReceipt>> {
        Ok(self.state.lock().unwrap().receipts.get(&tx_hash).cloned())
    }

    async fn transaction_count(&self, _address: EthAddress) -> SyncResult<U256> {
        Ok(U256::from(self.state.lock().unwrap().transaction_count))
    }

    async fn balance(&self, _address: EthAddress) -> SyncResult<U256> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn send_transaction(&self, tx: TypedTransaction) -> SyncResult<H256> {
        let mut state = self.state.lock().unwrap();
        state.sent.push(tx);
        Ok(H256::from_low_u64_be(1_000 + state.sent.len() as u64))
    }
}

#[derive(Default)]
struct HomeChainState {
    block_number: u64,
    registry_address: Option<String>,
    blocks_count_offset: u64,
    status: Option<HomeChainStatus>,
    blocks: HashMap<(String, u64), OnChainBlock>,
    mints: Vec<MintEvent>,
    voters: Vec<(u64, VoterEvent)>,
    fcds: Vec<FcdValue>,
    fail_logs_from: Option<u64>,
    fail_block_reads: bool,
    fcd_reads: Vec<String>,
}

#[derive(Clone)]
pub struct FakeHomeChain {
    chain_id: String,
    state: Arc<Mutex<HomeChainState>>,
}

impl FakeHomeChain {
    pub fn new(chain_id: &str) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            state: Default::default(),
        }
    }

    pub fn set_block_number(&self, block_number: u64) {
        self.state.lock().unwrap().block_number = block_number;
    }

    pub fn set_registry_address(&self, address: Option<&str>) {
        self.state.lock().unwrap().registry_address = address.map(str::to_string);
    }

    pub fn set_blocks_count_offset(&self, offset: u64) {
        self.state.lock().unwrap().blocks_count_offset = offset;
    }

    pub fn set_status(&self, status: HomeChainStatus) {
        self.state.lock().unwrap().status = Some(status);
    }

    pub fn set_block(&self, chain_address: &str, block: OnChainBlock) {
        self.state
            .lock()
            .unwrap()
            .blocks
            .insert((chain_address.to_lowercase(), block.block_id), block);
    }

    pub fn add_mint(&self, mint: MintEvent) {
        self.state.lock().unwrap().mints.push(mint);
    }

    /// Voter log emitted at home chain height `anchor`.
    pub fn add_voter(&self, anchor: u64, voter: VoterEvent) {
        self.state.lock().unwrap().voters.push((anchor, voter));
    }

    pub fn set_fcd(&self, value: FcdValue) {
        let mut state = self.state.lock().unwrap();
        state.fcds.retain(|f| f.key != value.key);
        state.fcds.push(value);
    }

    /// Log queries starting at or above `from_block` fail.
    pub fn fail_logs_from(&self, from_block: u64) {
        self.state.lock().unwrap().fail_logs_from = Some(from_block);
    }

    /// Contract addresses FCD values were read from, in call order.
    pub fn fcd_reads(&self) -> Vec<String> {
        self.state.lock().unwrap().fcd_reads.clone()
    }

    /// Block data reads fail like a dropped provider connection.
    pub fn fail_block_reads(&self, fail: bool) {
        self.state.lock().unwrap().fail_block_reads = fail;
    }

    fn check_logs(&self, from_block: u64) -> SyncResult<()> {
        match self.state.lock().unwrap().fail_logs_from {
            Some(limit) if from_block >= limit => {
                Err(SyncError::Rpc(format!("get_logs from {} failed", from_block)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl HomeChain for FakeHomeChain {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    async fn block_number(&self) -> SyncResult<u64> {
        Ok(self.state.lock().unwrap().block_number)
    }

    async fn status(&self) -> SyncResult<HomeChainStatus> {
        self.state
            .lock()
            .unwrap()
            .status
            .clone()
            .ok_or_else(|| SyncError::Rpc("status unavailable".into()))
    }

    async fn registry_chain_address(&self) -> SyncResult<Option<String>> {
        Ok(self.state.lock().unwrap().registry_address.clone())
    }

    async fn blocks_count_offset(&self, _chain_address: &str) -> SyncResult<u64> {
        Ok(self.state.lock().unwrap().blocks_count_offset)
    }

    async fn block(&self, chain_address: &str, block_id: u64) -> SyncResult<Option<OnChainBlock>> {
        let state = self.state.lock().unwrap();
        if state.fail_block_reads {
            return Err(SyncError::Rpc("connection reset by peer".into()));
        }
        Ok(state
            .blocks
            .get(&(chain_address.to_lowercase(), block_id))
            .cloned())
    }

    async fn mint_events(
        &self,
        chain_address: &str,
        from_block: u64,
        to_block: u64,
    ) -> SyncResult<Vec<MintEvent>> {
        self.check_logs(from_block)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .mints
            .iter()
            .filter(|m| m.chain_address.eq_ignore_ascii_case(chain_address))
            .filter(|m| m.anchor >= from_block && m.anchor <= to_block)
            .cloned()
            .collect())
    }

    async fn voter_events(
        &self,
        _chain_address: &str,
        from_block: u64,
        to_block: u64,
    ) -> SyncResult<Vec<VoterEvent>> {
        self.check_logs(from_block)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .voters
            .iter()
            .filter(|(anchor, _)| *anchor >= from_block && *anchor <= to_block)
            .map(|(_, voter)| voter.clone())
            .collect())
    }

    async fn fcds(&self, chain_address: &str, keys: &[String]) -> SyncResult<Vec<FcdValue>> {
        let mut state = self.state.lock().unwrap();
        state.fcd_reads.push(chain_address.to_string());
        Ok(state
            .fcds
            .iter()
            .filter(|f| keys.contains(&f.key))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct ValidatorState {
    responses: HashMap<(String, u64), SyncResult<Option<ValidatorBlockData>>>,
    requests: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeValidatorClient {
    state: Arc<Mutex<ValidatorState>>,
}

impl FakeValidatorClient {
    pub fn respond(
        &self,
        location: &str,
        block_id: u64,
        response: SyncResult<Option<ValidatorBlockData>>,
    ) {
        self.state
            .lock()
            .unwrap()
            .responses
            .insert((location.to_string(), block_id), response);
    }

    /// Requested locations in call order.
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl ValidatorClient for FakeValidatorClient {
    async fn block_leaves(
        &self,
        location: &str,
        block_id: u64,
    ) -> SyncResult<Option<ValidatorBlockData>> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(location.to_string());
        state
            .responses
            .get(&(location.to_string(), block_id))
            .cloned()
            .unwrap_or(Ok(None))
    }
}

struct ForeignChainState {
    status: ForeignChainStatus,
    architecture_version: u32,
    balance: U256,
    submit_result: Option<SyncResult<TxReceipt>>,
    submissions: Vec<BlockSubmission>,
}

#[derive(Clone)]
pub struct FakeForeignChain {
    chain_id: String,
    state: Arc<Mutex<ForeignChainState>>,
}

impl FakeForeignChain {
    pub fn new(chain_id: &str) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            state: Arc::new(Mutex::new(ForeignChainState {
                status: ForeignChainStatus {
                    chain_address: "0x00000000000000000000000000000000000000f1".to_string(),
                    last_block_id: 0,
                    last_data_timestamp: 0,
                    time_padding: 60,
                    next_block_id: 1,
                },
                architecture_version: 1,
                balance: U256::exp10(18),
                submit_result: None,
                submissions: vec![],
            })),
        }
    }

    pub fn set_status(&self, status: ForeignChainStatus) {
        self.state.lock().unwrap().status = status;
    }

    pub fn set_architecture_version(&self, version: u32) {
        self.state.lock().unwrap().architecture_version = version;
    }

    pub fn set_balance(&self, balance: U256) {
        self.state.lock().unwrap().balance = balance;
    }

    /// Overrides the default successful receipt mined at block 777.
    pub fn set_submit_result(&self, result: SyncResult<TxReceipt>) {
        self.state.lock().unwrap().submit_result = Some(result);
    }

    pub fn submissions(&self) -> Vec<BlockSubmission> {
        self.state.lock().unwrap().submissions.clone()
    }
}

#[async_trait]
impl ForeignChainContract for FakeForeignChain {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn wallet_address(&self) -> String {
        "0x00000000000000000000000000000000000000bb".to_string()
    }

    async fn status(&self) -> SyncResult<ForeignChainStatus> {
        Ok(self.state.lock().unwrap().status.clone())
    }

    async fn architecture_version(&self) -> SyncResult<u32> {
        Ok(self.state.lock().unwrap().architecture_version)
    }

    async fn balance(&self) -> SyncResult<U256> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn submit(
        &self,
        submission: &BlockSubmission,
        _status: &ForeignChainStatus,
    ) -> SyncResult<TxReceipt> {
        let mut state = self.state.lock().unwrap();
        state.submissions.push(submission.clone());
        state.submit_result.clone().unwrap_or(Ok(TxReceipt {
            tx_hash: H256::repeat_byte(0x77),
            block_number: 777,
            status: 1,
        }))
    }
}
