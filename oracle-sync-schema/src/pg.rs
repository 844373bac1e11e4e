// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Postgres backend shared by every node process.
//!
//! Besides the record collections it owns the `job_locks` table. Lock expiry
//! is compared against the database clock so that nodes with skewed clocks
//! still agree on who holds a chain.

use crate::models::{
    Block, BlockStatus, ChainInstance, Fcd, Leaf, ReplicationRecord, ReplicationRecordStatus,
};
use crate::schema::{blocks, chain_instances, fcds, job_locks, leaves, mappings, replications};
use crate::store::{InsertOutcome, MappingStore, OracleStore, StoreError, StoreResult};
use async_trait::async_trait;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Jsonb, Text};
use diesel::upsert::excluded;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Database time in unix millis.
const DB_NOW_MS: &str = "(EXTRACT(EPOCH FROM clock_timestamp()) * 1000)::BIGINT";

#[derive(Debug, Clone, diesel::Queryable, diesel::Selectable, diesel::Insertable)]
#[diesel(table_name = blocks, check_for_backend(diesel::pg::Pg))]
struct BlockRow {
    block_id: i64,
    status: String,
    data_timestamp: i64,
    root: String,
    staked: String,
    power: String,
    voters: Vec<String>,
    votes: serde_json::Value,
    fcd: serde_json::Value,
    chain_address: String,
    anchor: i64,
}

impl TryFrom<&Block> for BlockRow {
    type Error = StoreError;

    fn try_from(block: &Block) -> StoreResult<Self> {
        Ok(Self {
            block_id: block.block_id as i64,
            status: block.status.as_str().to_string(),
            data_timestamp: block.data_timestamp as i64,
            root: block.root.clone(),
            staked: block.staked.clone(),
            power: block.power.clone(),
            voters: block.voters.clone(),
            votes: to_json(&block.votes)?,
            fcd: to_json(&block.fcd)?,
            chain_address: block.chain_address.clone(),
            anchor: block.anchor as i64,
        })
    }
}

impl TryFrom<BlockRow> for Block {
    type Error = StoreError;

    fn try_from(row: BlockRow) -> StoreResult<Self> {
        let status = BlockStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Other(format!("block {} has unknown status {}", row.block_id, row.status))
        })?;
        Ok(Self {
            block_id: row.block_id as u64,
            status,
            data_timestamp: row.data_timestamp as u64,
            root: row.root,
            staked: row.staked,
            power: row.power,
            voters: row.voters,
            votes: from_json(row.votes)?,
            fcd: from_json(row.fcd)?,
            chain_address: row.chain_address,
            anchor: row.anchor as u64,
        })
    }
}

#[derive(Debug, Clone, diesel::Queryable, diesel::Selectable, diesel::Insertable)]
#[diesel(table_name = leaves, check_for_backend(diesel::pg::Pg))]
struct LeafRow {
    block_id: i64,
    key: String,
    value: String,
    proof: Vec<String>,
}

impl From<Leaf> for LeafRow {
    fn from(leaf: Leaf) -> Self {
        Self {
            block_id: leaf.block_id as i64,
            key: leaf.key,
            value: leaf.value,
            proof: leaf.proof,
        }
    }
}

impl From<LeafRow> for Leaf {
    fn from(row: LeafRow) -> Self {
        Self {
            block_id: row.block_id as u64,
            key: row.key,
            value: row.value,
            proof: row.proof,
        }
    }
}

#[derive(Debug, Clone, diesel::Queryable, diesel::Selectable, diesel::Insertable)]
#[diesel(table_name = chain_instances, check_for_backend(diesel::pg::Pg))]
struct ChainInstanceRow {
    id: String,
    chain_id: String,
    address: String,
    anchor: i64,
    blocks_count_offset: i64,
}

impl From<ChainInstance> for ChainInstanceRow {
    fn from(instance: ChainInstance) -> Self {
        Self {
            id: instance.id(),
            chain_id: instance.chain_id,
            address: instance.address,
            anchor: instance.anchor as i64,
            blocks_count_offset: instance.blocks_count_offset as i64,
        }
    }
}

impl From<ChainInstanceRow> for ChainInstance {
    fn from(row: ChainInstanceRow) -> Self {
        Self {
            chain_id: row.chain_id,
            address: row.address,
            anchor: row.anchor as u64,
            blocks_count_offset: row.blocks_count_offset as u64,
        }
    }
}

#[derive(Debug, Clone, diesel::Queryable, diesel::Selectable, diesel::Insertable)]
#[diesel(table_name = replications, check_for_backend(diesel::pg::Pg))]
struct ReplicationRow {
    chain_id: String,
    block_id: i64,
    anchor: i64,
    chain_address: String,
    minter: String,
    status: String,
}

impl From<ReplicationRecord> for ReplicationRow {
    fn from(record: ReplicationRecord) -> Self {
        Self {
            chain_id: record.chain_id,
            block_id: record.block_id as i64,
            anchor: record.anchor as i64,
            chain_address: record.chain_address,
            minter: record.minter,
            status: record.status.as_str().to_string(),
        }
    }
}

impl TryFrom<ReplicationRow> for ReplicationRecord {
    type Error = StoreError;

    fn try_from(row: ReplicationRow) -> StoreResult<Self> {
        let status = ReplicationRecordStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Other(format!(
                "replication {}:{} has unknown status {}",
                row.chain_id, row.block_id, row.status
            ))
        })?;
        Ok(Self {
            chain_id: row.chain_id,
            block_id: row.block_id as u64,
            anchor: row.anchor as u64,
            chain_address: row.chain_address,
            minter: row.minter,
            status,
        })
    }
}

#[derive(Debug, Clone, diesel::Queryable, diesel::Selectable, diesel::Insertable)]
#[diesel(table_name = fcds, check_for_backend(diesel::pg::Pg))]
struct FcdRow {
    chain_id: String,
    key: String,
    value: f64,
    data_timestamp: i64,
}

impl From<Fcd> for FcdRow {
    fn from(fcd: Fcd) -> Self {
        Self {
            chain_id: fcd.chain_id,
            key: fcd.key,
            value: fcd.value,
            data_timestamp: fcd.data_timestamp as i64,
        }
    }
}

impl From<FcdRow> for Fcd {
    fn from(row: FcdRow) -> Self {
        Self {
            key: row.key,
            chain_id: row.chain_id,
            value: row.value,
            data_timestamp: row.data_timestamp as u64,
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Other(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> StoreResult<T> {
    serde_json::from_value(value).map_err(|e| StoreError::Other(e.to_string()))
}

fn query_error(e: DieselError) -> StoreError {
    match e {
        DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
            StoreError::Connection(info.message().to_string())
        }
        e => StoreError::Other(e.to_string()),
    }
}

fn outcome(inserted_rows: usize) -> InsertOutcome {
    if inserted_rows == 0 {
        InsertOutcome::AlreadyExists
    } else {
        InsertOutcome::Inserted
    }
}

/// Pooled Postgres store. Clones share the pool.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<AsyncPgConnection>,
    database_url: String,
}

impl PgStore {
    pub async fn new(
        database_url: &str,
        pool_size: u32,
        connection_timeout: Duration,
    ) -> StoreResult<Self> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(connection_timeout)
            .build(manager)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            pool,
            database_url: database_url.to_string(),
        })
    }

    async fn connect(&self) -> StoreResult<PooledConnection<'_, AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    /// Applies pending embedded migrations and returns how many ran.
    pub async fn run_migrations(&self) -> StoreResult<usize> {
        use diesel_migrations::MigrationHarness;

        info!("Running migrations ...");
        let conn = AsyncPgConnection::establish(&self.database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let mut wrapper: AsyncConnectionWrapper<AsyncPgConnection> = conn.into();
        let applied = tokio::task::spawn_blocking(move || {
            wrapper
                .run_pending_migrations(MIGRATIONS)
                .map(|versions| versions.len())
        })
        .await
        .map_err(|e| StoreError::Other(e.to_string()))?
        .map_err(|e| StoreError::Other(format!("Failed to run migrations: {:?}", e)))?;
        info!("Migrations complete, {} applied", applied);
        Ok(applied)
    }

    /// Takes `name` for `owner` unless an unexpired row names someone else.
    pub async fn try_lock(&self, name: &str, owner: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connect().await?;
        let query = format!(
            "INSERT INTO job_locks (name, owner, expires_at_ms) VALUES ($1, $2, {now} + $3) \
             ON CONFLICT (name) DO UPDATE \
             SET owner = EXCLUDED.owner, expires_at_ms = EXCLUDED.expires_at_ms \
             WHERE job_locks.expires_at_ms <= {now}",
            now = DB_NOW_MS
        );
        let taken = diesel::sql_query(query)
            .bind::<Text, _>(name)
            .bind::<Text, _>(owner)
            .bind::<BigInt, _>(ttl.as_millis() as i64)
            .execute(&mut conn)
            .await
            .map_err(query_error)?;
        Ok(taken == 1)
    }

    pub async fn extend_lock(&self, name: &str, owner: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connect().await?;
        let query = format!(
            "UPDATE job_locks SET expires_at_ms = {now} + $3 \
             WHERE name = $1 AND owner = $2 AND expires_at_ms > {now}",
            now = DB_NOW_MS
        );
        let extended = diesel::sql_query(query)
            .bind::<Text, _>(name)
            .bind::<Text, _>(owner)
            .bind::<BigInt, _>(ttl.as_millis() as i64)
            .execute(&mut conn)
            .await
            .map_err(query_error)?;
        Ok(extended == 1)
    }

    pub async fn unlock(&self, name: &str, owner: &str) -> StoreResult<bool> {
        let mut conn = self.connect().await?;
        let deleted = diesel::delete(
            job_locks::table
                .filter(job_locks::name.eq(name))
                .filter(job_locks::owner.eq(owner)),
        )
        .execute(&mut conn)
        .await
        .map_err(query_error)?;
        Ok(deleted == 1)
    }
}

#[async_trait]
impl OracleStore for PgStore {
    async fn insert_block(&self, block: Block) -> StoreResult<InsertOutcome> {
        let row = BlockRow::try_from(&block)?;
        let mut conn = self.connect().await?;
        let inserted = diesel::insert_into(blocks::table)
            .values(&row)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await
            .map_err(query_error)?;
        if inserted == 0 {
            debug!("[PgStore] Block {} already exists", block.block_id);
        }
        Ok(outcome(inserted))
    }

    async fn block(&self, block_id: u64) -> StoreResult<Option<Block>> {
        let mut conn = self.connect().await?;
        let row: Option<BlockRow> = blocks::table
            .find(block_id as i64)
            .select(BlockRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(query_error)?;
        row.map(Block::try_from).transpose()
    }

    async fn latest_block_id(&self) -> StoreResult<Option<u64>> {
        let mut conn = self.connect().await?;
        let latest: Option<i64> = blocks::table
            .select(diesel::dsl::max(blocks::block_id))
            .first(&mut conn)
            .await
            .map_err(query_error)?;
        Ok(latest.map(|id| id as u64))
    }

    async fn blocks_with_status(
        &self,
        status: BlockStatus,
        limit: usize,
    ) -> StoreResult<Vec<Block>> {
        let mut conn = self.connect().await?;
        let rows: Vec<BlockRow> = blocks::table
            .filter(blocks::status.eq(status.as_str()))
            .order(blocks::block_id.asc())
            .limit(limit as i64)
            .select(BlockRow::as_select())
            .load(&mut conn)
            .await
            .map_err(query_error)?;
        rows.into_iter().map(Block::try_from).collect()
    }

    async fn latest_blocks_with_statuses(
        &self,
        statuses: &[BlockStatus],
        limit: usize,
    ) -> StoreResult<Vec<Block>> {
        let statuses: Vec<&str> = statuses.iter().map(BlockStatus::as_str).collect();
        let mut conn = self.connect().await?;
        let rows: Vec<BlockRow> = blocks::table
            .filter(blocks::status.eq_any(statuses))
            .order(blocks::block_id.desc())
            .limit(limit as i64)
            .select(BlockRow::as_select())
            .load(&mut conn)
            .await
            .map_err(query_error)?;
        rows.into_iter().map(Block::try_from).collect()
    }

    async fn latest_finalized_block_after(
        &self,
        after_timestamp: u64,
    ) -> StoreResult<Option<Block>> {
        let mut conn = self.connect().await?;
        let row: Option<BlockRow> = blocks::table
            .filter(blocks::status.eq(BlockStatus::Finalized.as_str()))
            .filter(blocks::data_timestamp.gt(after_timestamp as i64))
            .order(blocks::block_id.desc())
            .select(BlockRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(query_error)?;
        row.map(Block::try_from).transpose()
    }

    async fn update_block_statuses(&self, updates: &[(u64, BlockStatus)]) -> StoreResult<usize> {
        let mut conn = self.connect().await?;
        let mut updated = 0;
        for (block_id, status) in updates {
            updated += diesel::update(blocks::table.find(*block_id as i64))
                .set(blocks::status.eq(status.as_str()))
                .execute(&mut conn)
                .await
                .map_err(query_error)?;
        }
        Ok(updated)
    }

    async fn annotate_block_fcd(
        &self,
        block_id: u64,
        keys: &[String],
        values: &[f64],
    ) -> StoreResult<()> {
        let annotations: BTreeMap<&String, &f64> = keys.iter().zip(values).collect();
        let annotations = to_json(&annotations)?;
        let mut conn = self.connect().await?;
        // jsonb concatenation merges into the existing annotations in place
        let updated = diesel::sql_query("UPDATE blocks SET fcd = fcd || $1 WHERE block_id = $2")
            .bind::<Jsonb, _>(annotations)
            .bind::<BigInt, _>(block_id as i64)
            .execute(&mut conn)
            .await
            .map_err(query_error)?;
        if updated == 0 {
            return Err(StoreError::NotFound(crate::models::block_key(block_id)));
        }
        Ok(())
    }

    async fn delete_block(&self, block_id: u64) -> StoreResult<bool> {
        let mut conn = self.connect().await?;
        diesel::delete(leaves::table.filter(leaves::block_id.eq(block_id as i64)))
            .execute(&mut conn)
            .await
            .map_err(query_error)?;
        let deleted = diesel::delete(blocks::table.find(block_id as i64))
            .execute(&mut conn)
            .await
            .map_err(query_error)?;
        Ok(deleted > 0)
    }

    async fn delete_blocks_from(&self, from_block_id: u64) -> StoreResult<u64> {
        let mut conn = self.connect().await?;
        diesel::delete(leaves::table.filter(leaves::block_id.ge(from_block_id as i64)))
            .execute(&mut conn)
            .await
            .map_err(query_error)?;
        let deleted = diesel::delete(blocks::table.filter(blocks::block_id.ge(from_block_id as i64)))
            .execute(&mut conn)
            .await
            .map_err(query_error)?;
        Ok(deleted as u64)
    }

    async fn upsert_leaf(&self, leaf: Leaf) -> StoreResult<()> {
        let row = LeafRow::from(leaf);
        let mut conn = self.connect().await?;
        diesel::insert_into(leaves::table)
            .values(&row)
            .on_conflict((leaves::block_id, leaves::key))
            .do_update()
            .set((
                leaves::value.eq(excluded(leaves::value)),
                leaves::proof.eq(excluded(leaves::proof)),
            ))
            .execute(&mut conn)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn leaves(&self, block_id: u64) -> StoreResult<Vec<Leaf>> {
        let mut conn = self.connect().await?;
        let rows: Vec<LeafRow> = leaves::table
            .filter(leaves::block_id.eq(block_id as i64))
            .order(leaves::key.asc())
            .select(LeafRow::as_select())
            .load(&mut conn)
            .await
            .map_err(query_error)?;
        Ok(rows.into_iter().map(Leaf::from).collect())
    }

    async fn insert_chain_instance(&self, instance: ChainInstance) -> StoreResult<InsertOutcome> {
        let row = ChainInstanceRow::from(instance);
        let mut conn = self.connect().await?;
        let inserted = diesel::insert_into(chain_instances::table)
            .values(&row)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await
            .map_err(query_error)?;
        Ok(outcome(inserted))
    }

    async fn chain_instances(&self, chain_id: &str) -> StoreResult<Vec<ChainInstance>> {
        let mut conn = self.connect().await?;
        let rows: Vec<ChainInstanceRow> = chain_instances::table
            .filter(chain_instances::chain_id.eq(chain_id))
            .order(chain_instances::anchor.asc())
            .select(ChainInstanceRow::as_select())
            .load(&mut conn)
            .await
            .map_err(query_error)?;
        Ok(rows.into_iter().map(ChainInstance::from).collect())
    }

    async fn insert_replication(&self, record: ReplicationRecord) -> StoreResult<InsertOutcome> {
        let row = ReplicationRow::from(record);
        let mut conn = self.connect().await?;
        let inserted = diesel::insert_into(replications::table)
            .values(&row)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await
            .map_err(query_error)?;
        Ok(outcome(inserted))
    }

    async fn replication(
        &self,
        chain_id: &str,
        block_id: u64,
    ) -> StoreResult<Option<ReplicationRecord>> {
        let mut conn = self.connect().await?;
        let row: Option<ReplicationRow> = replications::table
            .find((chain_id, block_id as i64))
            .select(ReplicationRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(query_error)?;
        row.map(ReplicationRecord::try_from).transpose()
    }

    async fn latest_replication(&self, chain_id: &str) -> StoreResult<Option<ReplicationRecord>> {
        let mut conn = self.connect().await?;
        let row: Option<ReplicationRow> = replications::table
            .filter(replications::chain_id.eq(chain_id))
            .order(replications::block_id.desc())
            .select(ReplicationRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(query_error)?;
        row.map(ReplicationRecord::try_from).transpose()
    }

    async fn delete_replications_from(
        &self,
        chain_id: &str,
        from_block_id: u64,
    ) -> StoreResult<u64> {
        let mut conn = self.connect().await?;
        let deleted = diesel::delete(
            replications::table
                .filter(replications::chain_id.eq(chain_id))
                .filter(replications::block_id.ge(from_block_id as i64)),
        )
        .execute(&mut conn)
        .await
        .map_err(query_error)?;
        Ok(deleted as u64)
    }

    async fn upsert_fcd(&self, fcd: Fcd) -> StoreResult<()> {
        let row = FcdRow::from(fcd);
        let mut conn = self.connect().await?;
        diesel::insert_into(fcds::table)
            .values(&row)
            .on_conflict((fcds::chain_id, fcds::key))
            .do_update()
            .set((
                fcds::value.eq(excluded(fcds::value)),
                fcds::data_timestamp.eq(excluded(fcds::data_timestamp)),
            ))
            .execute(&mut conn)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn fcds(&self, chain_id: &str, keys: &[String]) -> StoreResult<Vec<Fcd>> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.connect().await?;
        let rows: Vec<FcdRow> = fcds::table
            .filter(fcds::chain_id.eq(chain_id))
            .filter(fcds::key.eq_any(keys))
            .select(FcdRow::as_select())
            .load(&mut conn)
            .await
            .map_err(query_error)?;
        let mut by_key: HashMap<String, Fcd> = rows
            .into_iter()
            .map(|row| (row.key.clone(), Fcd::from(row)))
            .collect();
        Ok(keys.iter().filter_map(|key| by_key.remove(key)).collect())
    }
}

#[async_trait]
impl MappingStore for PgStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connect().await?;
        mappings::table
            .find(key)
            .select(mappings::value)
            .first(&mut conn)
            .await
            .optional()
            .map_err(query_error)
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        let mut conn = self.connect().await?;
        diesel::insert_into(mappings::table)
            .values((mappings::key.eq(key), mappings::value.eq(&value)))
            .on_conflict(mappings::key)
            .do_update()
            .set(mappings::value.eq(&value))
            .execute(&mut conn)
            .await
            .map_err(query_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(block_id: u64, status: BlockStatus) -> Block {
        Block {
            block_id,
            status,
            data_timestamp: 1_000 + block_id,
            root: format!("0x{:064x}", block_id),
            staked: "100".to_string(),
            power: "100".to_string(),
            voters: vec!["0xaa".to_string()],
            votes: BTreeMap::from([("0xaa".to_string(), "100".to_string())]),
            fcd: BTreeMap::new(),
            chain_address: "0xchain".to_string(),
            anchor: block_id * 10,
        }
    }

    fn replication(chain_id: &str, block_id: u64) -> ReplicationRecord {
        ReplicationRecord {
            chain_id: chain_id.to_string(),
            block_id,
            anchor: block_id * 10,
            chain_address: "0xchain".to_string(),
            minter: "0xaa".to_string(),
            status: ReplicationRecordStatus::Replicated,
        }
    }

    #[test]
    fn test_block_row_conversion_keeps_maps() {
        let mut original = block(7, BlockStatus::Finalized);
        original.fcd.insert("ETH-USD".to_string(), 2_500.5);
        let row = BlockRow::try_from(&original).unwrap();
        assert_eq!(row.status, "finalized");
        assert_eq!(row.votes, serde_json::json!({"0xaa": "100"}));
        assert_eq!(Block::try_from(row).unwrap(), original);
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let mut row = BlockRow::try_from(&block(7, BlockStatus::Completed)).unwrap();
        row.status = "pending".to_string();
        assert!(matches!(Block::try_from(row), Err(StoreError::Other(_))));

        let mut row = ReplicationRow::from(replication("bsc", 7));
        assert_eq!(row.status, "replicated");
        row.status = "lost".to_string();
        assert!(ReplicationRecord::try_from(row).is_err());
    }

    async fn test_store() -> PgStore {
        let database_url = std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL environment variable must be set");
        let store = PgStore::new(&database_url, 2, Duration::from_secs(10))
            .await
            .unwrap();
        store.run_migrations().await.unwrap();
        let mut conn = store.connect().await.unwrap();
        diesel::sql_query(
            "TRUNCATE blocks, leaves, chain_instances, replications, fcds, mappings, job_locks",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        drop(conn);
        store
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    async fn test_blocks_and_leaves_roundtrip_through_postgres() {
        let store = test_store().await;
        for id in 1..=4 {
            let status = if id % 2 == 0 {
                BlockStatus::Finalized
            } else {
                BlockStatus::Completed
            };
            assert!(store.insert_block(block(id, status)).await.unwrap().is_inserted());
        }
        assert_eq!(
            store.insert_block(block(1, BlockStatus::Failed)).await.unwrap(),
            InsertOutcome::AlreadyExists
        );
        assert_eq!(store.latest_block_id().await.unwrap(), Some(4));

        let completed = store.blocks_with_status(BlockStatus::Completed, 10).await.unwrap();
        assert_eq!(completed.iter().map(|b| b.block_id).collect::<Vec<_>>(), vec![1, 3]);
        let latest = store
            .latest_finalized_block_after(1_002)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.block_id, 4);

        store
            .annotate_block_fcd(4, &["ETH-USD".to_string()], &[2_000.0])
            .await
            .unwrap();
        store
            .annotate_block_fcd(4, &["BTC-USD".to_string()], &[60_000.0])
            .await
            .unwrap();
        let annotated = store.block(4).await.unwrap().unwrap();
        assert_eq!(annotated.fcd.len(), 2);
        assert!(store.annotate_block_fcd(99, &[], &[]).await.is_err());

        for key in ["b", "a"] {
            store
                .upsert_leaf(Leaf {
                    block_id: 3,
                    key: key.to_string(),
                    value: "0x01".to_string(),
                    proof: vec![],
                })
                .await
                .unwrap();
        }
        let keys: Vec<String> = store.leaves(3).await.unwrap().into_iter().map(|l| l.key).collect();
        assert_eq!(keys, vec!["a", "b"]);

        assert_eq!(store.delete_blocks_from(3).await.unwrap(), 2);
        assert!(store.leaves(3).await.unwrap().is_empty());
        assert_eq!(store.latest_block_id().await.unwrap(), Some(2));
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    async fn test_replications_fcds_and_mappings_through_postgres() {
        let store = test_store().await;
        for id in [5, 6, 7] {
            store.insert_replication(replication("bsc", id)).await.unwrap();
        }
        assert_eq!(
            store.insert_replication(replication("bsc", 5)).await.unwrap(),
            InsertOutcome::AlreadyExists
        );
        assert_eq!(store.latest_replication("bsc").await.unwrap().unwrap().block_id, 7);
        assert_eq!(store.delete_replications_from("bsc", 6).await.unwrap(), 2);
        assert!(store.replication("bsc", 5).await.unwrap().is_some());

        for (key, value) in [("ETH-USD", 1.0), ("BTC-USD", 2.0)] {
            store
                .upsert_fcd(Fcd {
                    key: key.to_string(),
                    chain_id: "bsc".to_string(),
                    value,
                    data_timestamp: 10,
                })
                .await
                .unwrap();
        }
        let keys = vec!["BTC-USD".to_string(), "MISSING".to_string(), "ETH-USD".to_string()];
        let values: Vec<f64> = store.fcds("bsc", &keys).await.unwrap().iter().map(|f| f.value).collect();
        assert_eq!(values, vec![2.0, 1.0]);

        assert_eq!(store.get("checkpoint").await.unwrap(), None);
        store.set("checkpoint", "10".to_string()).await.unwrap();
        store.set("checkpoint", "20".to_string()).await.unwrap();
        assert_eq!(store.get("checkpoint").await.unwrap(), Some("20".to_string()));
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    async fn test_job_lock_is_owned_and_expires() {
        let store = test_store().await;
        let ttl = Duration::from_secs(60);
        assert!(store.try_lock("bsc", "a", ttl).await.unwrap());
        assert!(!store.try_lock("bsc", "b", ttl).await.unwrap());
        assert!(!store.extend_lock("bsc", "b", ttl).await.unwrap());
        assert!(!store.unlock("bsc", "b").await.unwrap());
        assert!(store.extend_lock("bsc", "a", ttl).await.unwrap());
        assert!(store.unlock("bsc", "a").await.unwrap());

        assert!(store.try_lock("bsc", "b", Duration::from_millis(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        // an expired row is taken over and its old owner loses it
        assert!(store.try_lock("bsc", "c", ttl).await.unwrap());
        assert!(!store.extend_lock("bsc", "b", ttl).await.unwrap());
        assert!(!store.unlock("bsc", "b").await.unwrap());
    }
}
