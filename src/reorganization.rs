//! Fork tracking, best-chain selection and chain reorganization

use crate::config::ChainConfig;
use crate::error::{LedgerError, Result};
use crate::ledger::{check_block_structure, BlockUndo, LedgerState, TipHandle};
use crate::transaction::calculate_tx_id;
use crate::types::*;
use crate::constants::MAX_ORPHAN_BLOCKS;
use indexmap::{IndexMap, IndexSet};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TipStatus {
    /// Competing tip that has never been best
    Active,
    Best,
    /// Former best tip
    Stale,
    /// The tip or one of its ancestors failed to apply
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub hash: Hash,
    pub height: Height,
    pub cumulative_work: u128,
    pub status: TipStatus,
}

#[derive(Debug, Clone)]
pub struct IndexedBlock {
    pub block: Block,
    pub height: Height,
    pub cumulative_work: u128,
    pub invalid: bool,
}

/// Every known block rooted at genesis, plus blocks waiting for their parent
#[derive(Debug, Clone, Default)]
pub struct BlockIndex {
    blocks: HashMap<Hash, IndexedBlock>,
    /// Blocks without children, in first-seen order
    tips: IndexSet<Hash>,
    /// Blocks waiting for their parent, in arrival order
    orphans: IndexMap<Hash, Block>,
}

impl BlockIndex {
    pub fn get(&self, hash: &Hash) -> Option<&IndexedBlock> {
        self.blocks.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_orphan(&self, hash: &Hash) -> bool {
        self.orphans.contains_key(hash)
    }

    /// Hold a block until its parent arrives, evicting the oldest orphan once full
    fn hold_orphan(&mut self, hash: Hash, block: Block) {
        while self.orphans.len() >= MAX_ORPHAN_BLOCKS {
            if let Some((evicted, _)) = self.orphans.shift_remove_index(0) {
                warn!("dropping orphan block {}", hex::encode(evicted));
            }
        }
        self.orphans.insert(hash, block);
    }

    fn take_orphans(&mut self, parent: &Hash) -> Vec<Block> {
        let waiting: Vec<Hash> = self
            .orphans
            .iter()
            .filter(|(_, block)| block.header.prev_block_hash == *parent)
            .map(|(hash, _)| *hash)
            .collect();
        waiting
            .iter()
            .filter_map(|hash| self.orphans.shift_remove(hash))
            .collect()
    }

    fn insert(&mut self, hash: Hash, block: Block, height: Height, cumulative_work: u128) {
        self.tips.shift_remove(&block.header.prev_block_hash);
        self.tips.insert(hash);
        self.blocks.insert(
            hash,
            IndexedBlock {
                block,
                height,
                cumulative_work,
                invalid: false,
            },
        );
    }

    /// Mark a block invalid; a valid parent left without valid children is a tip again
    fn mark_invalid(&mut self, hash: &Hash) {
        let parent = match self.blocks.get_mut(hash) {
            Some(entry) => {
                entry.invalid = true;
                entry.block.header.prev_block_hash
            }
            None => return,
        };
        if self.blocks.contains_key(&parent) && !self.is_invalid(&parent) && !self.has_valid_child(&parent) {
            self.tips.insert(parent);
        }
    }

    fn has_valid_child(&self, parent: &Hash) -> bool {
        self.blocks
            .values()
            .any(|entry| entry.block.header.prev_block_hash == *parent && !entry.invalid)
    }

    /// True when the block or any of its ancestors is marked invalid
    pub fn is_invalid(&self, hash: &Hash) -> bool {
        let mut cursor = self.blocks.get(hash);
        while let Some(entry) = cursor {
            if entry.invalid {
                return true;
            }
            cursor = self.blocks.get(&entry.block.header.prev_block_hash);
        }
        false
    }

    fn entry(&self, hash: &Hash) -> Result<&IndexedBlock> {
        self.blocks
            .get(hash)
            .ok_or_else(|| LedgerError::UnknownBlock(hex::encode(hash)))
    }

    /// Find common ancestor between two indexed blocks
    ///
    /// 1. Walk the higher block back until both are at the same height
    /// 2. Walk both back together until they meet
    pub fn find_common_ancestor(&self, a: &Hash, b: &Hash) -> Result<Hash> {
        let (mut a, mut b) = (*a, *b);

        // 1. Equalize heights
        while self.entry(&a)?.height > self.entry(&b)?.height {
            a = self.entry(&a)?.block.header.prev_block_hash;
        }
        while self.entry(&b)?.height > self.entry(&a)?.height {
            b = self.entry(&b)?.block.header.prev_block_hash;
        }

        // 2. Walk back together
        while a != b {
            a = self.entry(&a)?.block.header.prev_block_hash;
            b = self.entry(&b)?.block.header.prev_block_hash;
        }
        Ok(a)
    }

    /// Blocks after `ancestor` up to and including `tip`, in chain order
    pub fn path(&self, ancestor: &Hash, tip: &Hash) -> Result<Vec<Hash>> {
        let mut path = Vec::new();
        let mut cursor = *tip;
        while cursor != *ancestor {
            path.push(cursor);
            cursor = self.entry(&cursor)?.block.header.prev_block_hash;
        }
        path.reverse();
        Ok(path)
    }
}

/// Result of a block acceptance or reorganization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainUpdate {
    /// Blocks rewound, tip first
    pub disconnected: Vec<Hash>,
    /// Blocks applied, in chain order
    pub connected: Vec<Hash>,
    /// Non-coinbase transactions confirmed only on the abandoned branch, in chain order
    pub abandoned: Vec<Transaction>,
}

impl ChainUpdate {
    pub fn tip_changed(&self) -> bool {
        !self.connected.is_empty() || !self.disconnected.is_empty()
    }

    fn merge(&mut self, other: ChainUpdate) {
        self.disconnected.extend(other.disconnected);
        self.connected.extend(other.connected);
        self.abandoned.extend(other.abandoned);
    }
}

/// Check if reorganization is beneficial
///
/// Strictly more work wins; on a tie the tip seen first stays best.
pub fn should_reorganize(new_work: u128, best_work: u128) -> bool {
    new_work > best_work
}

/// Work represented by one block: ⌊2¹²⁸ / (⌊target / 2¹²⁸⌋ + 1)⌋, never zero
pub fn block_work(bits: u32) -> Result<u128> {
    let high = expand_target_high(bits)?;
    Ok(u128::MAX / high.saturating_add(1))
}

/// Expand a compact target, keeping only the bits above 2¹²⁸
fn expand_target_high(bits: u32) -> Result<u128> {
    let exponent = bits >> 24;
    let mantissa = (bits & 0x007fffff) as u128;

    if mantissa == 0 {
        return Err(LedgerError::InvalidBlock("Zero target".into()));
    }
    if exponent > 32 {
        return Err(LedgerError::InvalidBlock("Target too large".into()));
    }

    // Target is mantissa << 8 * (exponent - 3); only shifts past 128 bits matter
    let shift = 8 * exponent as i64 - 24 - 128;
    if shift <= 0 {
        Ok(0)
    } else {
        Ok(mantissa << shift)
    }
}

/// Ledger plus block index: the only writer of confirmed state
#[derive(Debug, Clone)]
pub struct ChainState {
    config: ChainConfig,
    ledger: LedgerState,
    index: BlockIndex,
    /// Undo records for every block on the active chain
    undo: HashMap<Hash, BlockUndo>,
    best: Hash,
    stale: HashSet<Hash>,
    halted: Option<String>,
}

impl ChainState {
    /// Start a chain from its genesis block
    pub fn new(config: ChainConfig, genesis: Block) -> Result<Self> {
        config.validate()?;
        let mut ledger = LedgerState::new();
        let undo = ledger.apply_block(None, &genesis, &config)?;
        let hash = genesis.hash();
        let work = block_work(genesis.header.bits)?;

        let mut index = BlockIndex::default();
        index.insert(hash, genesis, 0, work);
        info!("chain started at genesis {}", hex::encode(hash));

        Ok(ChainState {
            config,
            ledger,
            index,
            undo: HashMap::from([(hash, undo)]),
            best: hash,
            stale: HashSet::new(),
            halted: None,
        })
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Confirmed state at the best tip
    pub fn ledger(&self) -> &LedgerState {
        &self.ledger
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn best_hash(&self) -> Hash {
        self.best
    }

    pub fn best_tip(&self) -> Result<TipHandle> {
        self.ledger
            .tip()
            .ok_or_else(|| LedgerError::StateCorruption("ledger has no tip".into()))
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn check_running(&self) -> Result<()> {
        match &self.halted {
            Some(reason) => Err(LedgerError::StateCorruption(format!("block processing halted: {}", reason))),
            None => Ok(()),
        }
    }

    fn halt(&mut self, reason: String) -> LedgerError {
        error!("halting block processing: {}", reason);
        self.halted = Some(reason.clone());
        LedgerError::StateCorruption(reason)
    }

    /// Every chain tip with its status; the best tip is always listed
    pub fn chain_tips(&self) -> Vec<ChainTip> {
        let mut hashes: Vec<Hash> = self.index.tips.iter().copied().collect();
        if !hashes.contains(&self.best) {
            hashes.insert(0, self.best);
        }
        hashes
            .into_iter()
            .filter_map(|hash| {
                let entry = self.index.get(&hash)?;
                let status = if hash == self.best {
                    TipStatus::Best
                } else if self.index.is_invalid(&hash) {
                    TipStatus::Invalid
                } else if self.stale.contains(&hash) {
                    TipStatus::Stale
                } else {
                    TipStatus::Active
                };
                Some(ChainTip {
                    hash,
                    height: entry.height,
                    cumulative_work: entry.cumulative_work,
                    status,
                })
            })
            .collect()
    }

    /// AcceptBlock: ℬ × 𝒞𝒮 → 𝒞𝒮
    ///
    /// 1. Reject duplicates; hold blocks with an unknown parent as orphans
    /// 2. Index the block with its cumulative work
    /// 3. Extend the best chain, reorganize onto it, or keep it as a side chain
    /// 4. Connect any orphans that were waiting for it
    pub fn accept_block(&mut self, block: Block) -> Result<ChainUpdate> {
        self.check_running()?;
        let hash = block.hash();

        // 1. Duplicates and orphans
        if self.index.contains(&hash) || self.index.is_orphan(&hash) {
            return Err(LedgerError::DuplicateBlock(hex::encode(hash)));
        }
        if !self.index.contains(&block.header.prev_block_hash) {
            info!("holding orphan block {}", hex::encode(hash));
            self.index.hold_orphan(hash, block);
            return Err(LedgerError::OrphanBlock(hex::encode(hash)));
        }

        // 2–3. Index and connect
        let mut update = self.connect(hash, block)?;

        // 4. Waiting orphans
        let mut pending = vec![hash];
        while let Some(parent) = pending.pop() {
            for orphan in self.index.take_orphans(&parent) {
                let orphan_hash = orphan.hash();
                match self.connect(orphan_hash, orphan) {
                    Ok(next) => {
                        update.merge(next);
                        pending.push(orphan_hash);
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        warn!("orphan block {} rejected: {}", hex::encode(orphan_hash), err);
                        if self.index.contains(&orphan_hash) {
                            pending.push(orphan_hash);
                        }
                    }
                }
            }
        }
        Ok(update)
    }

    fn connect(&mut self, hash: Hash, block: Block) -> Result<ChainUpdate> {
        let parent_hash = block.header.prev_block_hash;
        let parent = self.index.entry(&parent_hash)?;
        let height = parent.height + 1;
        let parent_work = parent.cumulative_work;

        if let Err(err) = check_block_structure(&block, height) {
            warn!("rejected block {}: {}", hex::encode(hash), err);
            return Err(err);
        }
        let work = parent_work.saturating_add(block_work(block.header.bits)?);
        self.index.insert(hash, block, height, work);

        if self.index.is_invalid(&parent_hash) {
            self.index.mark_invalid(&hash);
            warn!("rejected block {}: descends from an invalid block", hex::encode(hash));
            return Err(LedgerError::InvalidBlock("descends from an invalid block".into()));
        }

        if parent_hash == self.best {
            return self.extend(hash);
        }
        let best_work = self.index.entry(&self.best)?.cumulative_work;
        if should_reorganize(work, best_work) {
            return self.handle_reorg(hash);
        }
        info!("side chain block {} at height {}", hex::encode(hash), height);
        Ok(ChainUpdate::default())
    }

    fn extend(&mut self, hash: Hash) -> Result<ChainUpdate> {
        match self.apply(&hash) {
            Ok(()) => {
                self.best = hash;
                info!(
                    "connected block {} at height {}",
                    hex::encode(hash),
                    self.ledger.next_height() - 1
                );
                Ok(ChainUpdate {
                    connected: vec![hash],
                    ..ChainUpdate::default()
                })
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                self.index.mark_invalid(&hash);
                warn!("rejected block {}: {}", hex::encode(hash), err);
                Err(err)
            }
        }
    }

    /// Apply an indexed block on top of the ledger, recording its undo
    fn apply(&mut self, hash: &Hash) -> Result<()> {
        let tip = self.best_tip()?;
        let block = &self.index.entry(hash)?.block;
        match self.ledger.apply_block(Some(&tip), block, &self.config) {
            Ok(undo) => {
                self.undo.insert(*hash, undo);
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(self.halt(err.to_string())),
            Err(err) => Err(err),
        }
    }

    /// Rewind the ledger's tip block; any failure halts
    fn rewind(&mut self, hash: &Hash) -> Result<()> {
        let tip = self.best_tip()?;
        let outcome = match (self.index.get(hash), self.undo.get(hash)) {
            (Some(entry), Some(undo)) => self.ledger.rewind_block(&tip, &entry.block, undo),
            _ => Err(LedgerError::StateCorruption(format!(
                "no undo record for {}",
                hex::encode(hash)
            ))),
        };
        match outcome {
            Ok(()) => {
                self.undo.remove(hash);
                info!("disconnected block {} at height {}", hex::encode(hash), tip.height);
                Ok(())
            }
            Err(err) => Err(self.halt(format!("rewinding {}: {}", hex::encode(hash), err))),
        }
    }

    /// Reorganization: switch the best chain to `new_best`
    ///
    /// For current best chain [a₁ … aₘ] and new chain [b₁ … bₙ] above their fork:
    /// 1. Find the common ancestor
    /// 2. Rewind aₘ … a₁ in reverse order
    /// 3. Apply b₁ … bₙ forward; if one fails, mark it invalid and restore a₁ … aₘ
    /// 4. Collect transactions confirmed only on [a₁ … aₘ], in original order
    ///
    /// Purging pool entries that conflict with the new chain is the pool's part.
    /// Failure to rewind or to restore is fatal and halts block processing.
    pub fn handle_reorg(&mut self, new_best: Hash) -> Result<ChainUpdate> {
        self.check_running()?;
        let target_work = self.index.entry(&new_best)?.cumulative_work;
        if self.index.is_invalid(&new_best) {
            return Err(LedgerError::InvalidBlock(format!(
                "{} is on an invalid branch",
                hex::encode(new_best)
            )));
        }
        if new_best == self.best {
            return Ok(ChainUpdate::default());
        }
        let best_work = self.index.entry(&self.best)?.cumulative_work;
        if !should_reorganize(target_work, best_work) {
            return Err(LedgerError::NotBetterChain(hex::encode(new_best)));
        }

        // 1. Common ancestor
        let old_best = self.best;
        let ancestor = self.index.find_common_ancestor(&old_best, &new_best)?;
        let old_branch = self.index.path(&ancestor, &old_best)?;
        let new_branch = self.index.path(&ancestor, &new_best)?;

        // 2. Rewind
        for hash in old_branch.iter().rev() {
            self.rewind(hash)?;
        }

        // 3. Apply
        let mut applied = Vec::with_capacity(new_branch.len());
        for hash in &new_branch {
            match self.apply(hash) {
                Ok(()) => applied.push(*hash),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    self.index.mark_invalid(hash);
                    warn!("reorg to {} failed at {}: {}", hex::encode(new_best), hex::encode(hash), err);
                    self.restore(&applied, &old_branch)?;
                    return Err(err);
                }
            }
        }

        // 4. Abandoned transactions
        let confirmed: HashSet<Hash> = new_branch
            .iter()
            .filter_map(|hash| self.index.get(hash))
            .flat_map(|entry| entry.block.transactions.iter().map(calculate_tx_id))
            .collect();
        let abandoned: Vec<Transaction> = old_branch
            .iter()
            .filter_map(|hash| self.index.get(hash))
            .flat_map(|entry| entry.block.transactions.iter().skip(1))
            .filter(|tx| !confirmed.contains(&calculate_tx_id(tx)))
            .cloned()
            .collect();

        self.stale.insert(old_best);
        self.stale.remove(&new_best);
        self.best = new_best;
        info!(
            "reorganized from {} to {}: {} disconnected, {} connected, {} transactions abandoned",
            hex::encode(old_best),
            hex::encode(new_best),
            old_branch.len(),
            new_branch.len(),
            abandoned.len()
        );

        Ok(ChainUpdate {
            disconnected: old_branch.into_iter().rev().collect(),
            connected: new_branch,
            abandoned,
        })
    }

    fn restore(&mut self, applied: &[Hash], old_branch: &[Hash]) -> Result<()> {
        for hash in applied.iter().rev() {
            self.rewind(hash)?;
        }
        for hash in old_branch {
            if let Err(err) = self.apply(hash) {
                if err.is_fatal() {
                    return Err(err);
                }
                return Err(self.halt(format!("restoring {}: {}", hex::encode(hash), err)));
            }
        }
        Ok(())
    }

    /// Confirmed state as of any indexed, valid block, built on a copy
    pub fn ledger_at(&self, hash: &Hash) -> Result<LedgerState> {
        self.index.entry(hash)?;
        if *hash == self.best {
            return Ok(self.ledger.clone());
        }
        if self.index.is_invalid(hash) {
            return Err(LedgerError::InvalidBlock(format!("{} is on an invalid branch", hex::encode(hash))));
        }

        let ancestor = self.index.find_common_ancestor(&self.best, hash)?;
        let mut ledger = self.ledger.clone();
        for step in self.index.path(&ancestor, &self.best)?.iter().rev() {
            let tip = ledger
                .tip()
                .ok_or_else(|| LedgerError::StateCorruption("ledger has no tip".into()))?;
            let undo = self
                .undo
                .get(step)
                .ok_or_else(|| LedgerError::StateCorruption(format!("no undo record for {}", hex::encode(step))))?;
            ledger.rewind_block(&tip, &self.index.entry(step)?.block, undo)?;
        }
        for step in self.index.path(&ancestor, hash)? {
            let tip = ledger.tip();
            ledger.apply_block(tip.as_ref(), &self.index.entry(&step)?.block, &self.config)?;
        }
        Ok(ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COIN;
    use crate::transaction::{address_of, sign_all_inputs};
    use secp256k1::SecretKey;

    const BITS: u32 = 0x207fffff;

    fn key(seed: u8) -> SecretKey {
        SecretKey::from_slice(&[seed; 32]).unwrap()
    }

    fn config() -> ChainConfig {
        ChainConfig { coinbase_maturity: 0, ..ChainConfig::default() }
    }

    fn coinbase(height: Height) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TxOutput { value: COIN, destination: Destination::Address(address_of(&key(1))) }],
            payload: TxPayload::Coinbase { height },
        }
    }

    fn block_on(parent: Hash, height: Height, stamp: u64, mut txs: Vec<Transaction>) -> Block {
        txs.insert(0, coinbase(height));
        Block::new(parent, stamp, BITS, txs)
    }

    fn spend(outpoint: OutPoint) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            inputs: vec![TxInput {
                prevout: outpoint,
                unlock: Unlock::Signature { pubkey: vec![], signature: vec![] },
            }],
            outputs: vec![TxOutput { value: COIN - 1000, destination: Destination::Address(PubKeyHash([2; 20])) }],
            payload: TxPayload::Transfer,
        };
        sign_all_inputs(&mut tx, &key(1)).unwrap();
        tx
    }

    fn genesis() -> Block {
        Block::new([0; 32], 0, BITS, vec![coinbase(0)])
    }

    fn genesis_output() -> OutPoint {
        OutPoint { hash: calculate_tx_id(&coinbase(0)), index: 0 }
    }

    fn status_of(chain: &ChainState, hash: &Hash) -> Option<TipStatus> {
        chain.chain_tips().into_iter().find(|tip| tip.hash == *hash).map(|tip| tip.status)
    }

    #[test]
    fn test_extend_best_chain() {
        let g = genesis();
        let mut chain = ChainState::new(config(), g.clone()).unwrap();
        let b1 = block_on(g.hash(), 1, 1, vec![]);
        let b2 = block_on(b1.hash(), 2, 2, vec![]);

        assert_eq!(chain.accept_block(b1.clone()).unwrap().connected, vec![b1.hash()]);
        chain.accept_block(b2.clone()).unwrap();

        assert_eq!(chain.best_tip().unwrap(), TipHandle { hash: b2.hash(), height: 2 });
        let tips = chain.chain_tips();
        assert_eq!(tips.len(), 1);
        assert_eq!(tips[0].status, TipStatus::Best);
    }

    #[test]
    fn test_equal_work_keeps_first_seen() {
        let g = genesis();
        let mut chain = ChainState::new(config(), g.clone()).unwrap();
        let a1 = block_on(g.hash(), 1, 1, vec![]);
        let b1 = block_on(g.hash(), 1, 2, vec![]);

        chain.accept_block(a1.clone()).unwrap();
        let update = chain.accept_block(b1.clone()).unwrap();

        assert!(!update.tip_changed());
        assert_eq!(chain.best_hash(), a1.hash());
        assert_eq!(status_of(&chain, &b1.hash()), Some(TipStatus::Active));
    }

    #[test]
    fn test_reorg_returns_abandoned_transactions() {
        let g = genesis();
        let mut chain = ChainState::new(config(), g.clone()).unwrap();
        let tx = spend(genesis_output());
        let a1 = block_on(g.hash(), 1, 1, vec![tx.clone()]);
        let b1 = block_on(g.hash(), 1, 2, vec![]);
        let b2 = block_on(b1.hash(), 2, 3, vec![]);

        chain.accept_block(a1.clone()).unwrap();
        chain.accept_block(b1.clone()).unwrap();
        let update = chain.accept_block(b2.clone()).unwrap();

        assert_eq!(update.disconnected, vec![a1.hash()]);
        assert_eq!(update.connected, vec![b1.hash(), b2.hash()]);
        assert_eq!(update.abandoned, vec![tx]);
        assert_eq!(status_of(&chain, &a1.hash()), Some(TipStatus::Stale));
        assert_eq!(status_of(&chain, &b2.hash()), Some(TipStatus::Best));
        assert!(chain.ledger().utxos().contains(&genesis_output()));
    }

    #[test]
    fn test_transaction_confirmed_on_both_branches_not_abandoned() {
        let g = genesis();
        let mut chain = ChainState::new(config(), g.clone()).unwrap();
        let tx = spend(genesis_output());
        let a1 = block_on(g.hash(), 1, 1, vec![tx.clone()]);
        let b1 = block_on(g.hash(), 1, 2, vec![tx]);
        let b2 = block_on(b1.hash(), 2, 3, vec![]);

        chain.accept_block(a1).unwrap();
        chain.accept_block(b1).unwrap();
        assert!(chain.accept_block(b2).unwrap().abandoned.is_empty());
    }

    #[test]
    fn test_orphan_connected_when_parent_arrives() {
        let g = genesis();
        let mut chain = ChainState::new(config(), g.clone()).unwrap();
        let b1 = block_on(g.hash(), 1, 1, vec![]);
        let b2 = block_on(b1.hash(), 2, 2, vec![]);

        assert!(matches!(chain.accept_block(b2.clone()), Err(LedgerError::OrphanBlock(_))));
        assert_eq!(chain.index().orphan_count(), 1);

        let update = chain.accept_block(b1.clone()).unwrap();
        assert_eq!(update.connected, vec![b1.hash(), b2.hash()]);
        assert_eq!(chain.index().orphan_count(), 0);
    }

    #[test]
    fn test_orphans_capped_oldest_first() {
        let g = genesis();
        let mut chain = ChainState::new(config(), g).unwrap();
        let orphans: Vec<Block> = (0..=MAX_ORPHAN_BLOCKS as u64)
            .map(|stamp| block_on([stamp as u8 + 1; 32], 1, stamp, vec![]))
            .collect();
        for orphan in &orphans {
            assert!(matches!(chain.accept_block(orphan.clone()), Err(LedgerError::OrphanBlock(_))));
        }

        assert_eq!(chain.index().orphan_count(), MAX_ORPHAN_BLOCKS);
        assert!(!chain.index().is_orphan(&orphans[0].hash()));
        assert!(chain.index().is_orphan(&orphans[1].hash()));
        assert!(chain.index().is_orphan(&orphans[MAX_ORPHAN_BLOCKS].hash()));
    }

    #[test]
    fn test_duplicate_block_rejected() {
        let g = genesis();
        let mut chain = ChainState::new(config(), g.clone()).unwrap();
        let b1 = block_on(g.hash(), 1, 1, vec![]);
        chain.accept_block(b1.clone()).unwrap();
        assert!(matches!(chain.accept_block(b1), Err(LedgerError::DuplicateBlock(_))));
    }

    #[test]
    fn test_invalid_branch_restores_old_chain() {
        let g = genesis();
        let mut chain = ChainState::new(config(), g.clone()).unwrap();
        let a1 = block_on(g.hash(), 1, 1, vec![]);
        chain.accept_block(a1.clone()).unwrap();
        let before = chain.ledger().digest();

        let b1 = block_on(g.hash(), 1, 2, vec![]);
        let bogus = spend(OutPoint { hash: [7; 32], index: 0 });
        let b2 = block_on(b1.hash(), 2, 3, vec![bogus]);
        chain.accept_block(b1).unwrap();

        assert!(matches!(chain.accept_block(b2.clone()), Err(LedgerError::InvalidBlock(_))));
        assert_eq!(chain.best_hash(), a1.hash());
        assert_eq!(chain.ledger().digest(), before);
        assert_eq!(status_of(&chain, &b2.hash()), Some(TipStatus::Invalid));
        assert!(!chain.is_halted());

        let b3 = block_on(b2.hash(), 3, 4, vec![]);
        assert!(matches!(chain.accept_block(b3), Err(LedgerError::InvalidBlock(_))));
    }

    #[test]
    fn test_side_tip_kept_when_child_invalid() {
        let g = genesis();
        let mut chain = ChainState::new(config(), g.clone()).unwrap();
        let a1 = block_on(g.hash(), 1, 1, vec![]);
        let a2 = block_on(a1.hash(), 2, 2, vec![]);
        chain.accept_block(a1).unwrap();
        chain.accept_block(a2.clone()).unwrap();

        let b1 = block_on(g.hash(), 1, 3, vec![]);
        chain.accept_block(b1.clone()).unwrap();
        assert_eq!(status_of(&chain, &b1.hash()), Some(TipStatus::Active));

        let bogus = spend(OutPoint { hash: [7; 32], index: 0 });
        let b2 = block_on(b1.hash(), 2, 4, vec![bogus]);
        chain.accept_block(b2.clone()).unwrap();
        let b3 = block_on(b2.hash(), 3, 5, vec![]);
        assert!(matches!(chain.accept_block(b3.clone()), Err(LedgerError::InvalidBlock(_))));

        assert_eq!(chain.best_hash(), a2.hash());
        assert_eq!(status_of(&chain, &b1.hash()), Some(TipStatus::Active));
        assert_eq!(status_of(&chain, &b3.hash()), Some(TipStatus::Invalid));
        assert_eq!(chain.chain_tips().len(), 3);
    }

    #[test]
    fn test_handle_reorg_requires_more_work() {
        let g = genesis();
        let mut chain = ChainState::new(config(), g.clone()).unwrap();
        let a1 = block_on(g.hash(), 1, 1, vec![]);
        let b1 = block_on(g.hash(), 1, 2, vec![]);
        chain.accept_block(a1).unwrap();
        chain.accept_block(b1.clone()).unwrap();

        assert!(matches!(chain.handle_reorg(b1.hash()), Err(LedgerError::NotBetterChain(_))));
        assert!(matches!(chain.handle_reorg([9; 32]), Err(LedgerError::UnknownBlock(_))));
    }

    #[test]
    fn test_ledger_at_side_tip() {
        let g = genesis();
        let mut chain = ChainState::new(config(), g.clone()).unwrap();
        let tx = spend(genesis_output());
        let a1 = block_on(g.hash(), 1, 1, vec![]);
        let b1 = block_on(g.hash(), 1, 2, vec![tx]);
        chain.accept_block(a1).unwrap();
        chain.accept_block(b1.clone()).unwrap();

        let side = chain.ledger_at(&b1.hash()).unwrap();
        let tip = side.tip().unwrap();
        assert_eq!(tip.hash, b1.hash());
        let paid = Destination::Address(PubKeyHash([2; 20]));
        assert_eq!(side.balance_of(&paid, &tip).unwrap(), COIN - 1000);

        let best = chain.best_tip().unwrap();
        assert_eq!(chain.ledger().balance_of(&paid, &best).unwrap(), 0);
    }

    #[test]
    fn test_block_work() {
        assert_eq!(block_work(0x207fffff).unwrap(), u128::MAX / ((0x7fffffu128 << 104) + 1));
        assert_eq!(block_work(0x1000ffff).unwrap(), u128::MAX);
        assert!(block_work(0x21010000).is_err());
        assert!(block_work(0x20000000).is_err());
        assert!(should_reorganize(2, 1));
        assert!(!should_reorganize(1, 1));
    }
}
