//! Merkle roots and compact membership proofs over a block's transactions.
//!
//! Every level pairs nodes left to right. When a level has an odd number of
//! nodes the last one is paired with itself instead of being promoted, and at
//! least one pairing round always runs, so a lone transaction `t` has the root
//! `hash(h(t), h(t))`.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::error::{LedgerError, LedgerResult};
use crate::hash::{HashEngine, HashValue};
use crate::transaction::Transaction;

/// One step of an audit path: the sibling hash and which side of the running
/// hash it sits on.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AuditEntry {
    pub sibling: HashValue,
    pub is_left: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AuditPath {
    transaction: Transaction,
    block_number: u64,
    /// Leaf side first.
    entries: Vec<AuditEntry>,
}

impl AuditPath {
    pub fn new(transaction: Transaction, block_number: u64, entries: Vec<AuditEntry>) -> Self {
        AuditPath {
            transaction,
            block_number,
            entries,
        }
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }
}

pub struct MerkleTree;

impl MerkleTree {
    fn leaves(transactions: &[Transaction]) -> LedgerResult<Vec<HashValue>> {
        transactions
            .par_iter()
            .map(HashEngine::hash_transaction)
            .collect()
    }

    fn pair_up(level: &[HashValue]) -> Vec<HashValue> {
        level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                HashEngine::hash_hashes(&[left, right])
            })
            .collect()
    }

    /// Root over `transactions` in order. The empty set has the zero digest as root.
    pub fn root(transactions: &[Transaction]) -> LedgerResult<HashValue> {
        let mut level = Self::leaves(transactions)?;
        if level.is_empty() {
            return Ok(HashValue::zero());
        }

        loop {
            level = Self::pair_up(&level);
            if level.len() == 1 {
                break;
            }
        }

        Ok(level.swap_remove(0))
    }

    /// Sibling hashes needed to rebuild `block`'s root from `transaction` alone.
    pub fn audit_path(transaction: &Transaction, block: &Block) -> LedgerResult<AuditPath> {
        let mut index = block
            .transactions()
            .iter()
            .position(|t| t == transaction)
            .ok_or(LedgerError::TransactionNotPresent)?;

        let mut level = Self::leaves(block.transactions())?;
        let mut entries = Vec::new();

        loop {
            let is_left = index % 2 == 1;
            let sibling = if is_left {
                level[index - 1].clone()
            } else {
                // The last node of an odd level is its own sibling.
                level.get(index + 1).unwrap_or(&level[index]).clone()
            };
            entries.push(AuditEntry { sibling, is_left });

            level = Self::pair_up(&level);
            index /= 2;
            if level.len() == 1 {
                break;
            }
        }

        Ok(AuditPath::new(
            transaction.clone(),
            block.block_number(),
            entries,
        ))
    }

    /// Folds `path` onto the hash of `transaction`. The result must equal the
    /// hosting block's stored root for the transaction to count as present.
    pub fn root_from_audit_path(
        transaction: &Transaction,
        path: &AuditPath,
    ) -> LedgerResult<HashValue> {
        if path.transaction() != transaction {
            return Err(LedgerError::TransactionNotPresent);
        }

        let mut running = HashEngine::hash_transaction(transaction)?;
        for entry in path.entries() {
            running = if entry.is_left {
                HashEngine::hash_hashes(&[&entry.sibling, &running])
            } else {
                HashEngine::hash_hashes(&[&running, &entry.sibling])
            };
        }
        Ok(running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::UnsealedHeader;
    use proptest::prelude::*;

    fn tx(n: u64) -> Transaction {
        Transaction::new(1, format!("identity-{}", n), n, 1, vec![n as u8, 0xee]).unwrap()
    }

    fn block_of(transactions: Vec<Transaction>) -> Block {
        let header = UnsealedHeader {
            version: 1,
            chain_name: "tessera-test".to_string(),
            block_number: 12,
            previous_hash: HashValue::zero(),
            merkle_root: MerkleTree::root(&transactions).unwrap(),
            timestamp: 0,
            difficulty: 1.into(),
            nonce: 0,
            miner_signature: String::new(),
        }
        .seal()
        .unwrap();
        Block::new(header, transactions)
    }

    fn h(t: &Transaction) -> HashValue {
        t.hash().unwrap()
    }

    fn pair(a: &HashValue, b: &HashValue) -> HashValue {
        HashEngine::hash_hashes(&[a, b])
    }

    #[test]
    fn empty_set_has_zero_root() {
        assert_eq!(MerkleTree::root(&[]).unwrap(), HashValue::zero());
    }

    #[test]
    fn single_leaf_is_paired_with_itself() {
        let t = tx(1);
        assert_eq!(MerkleTree::root(&[t.clone()]).unwrap(), pair(&h(&t), &h(&t)));

        let block = block_of(vec![t.clone()]);
        let path = MerkleTree::audit_path(&t, &block).unwrap();
        assert_eq!(path.entries().len(), 1);
        assert_eq!(
            MerkleTree::root_from_audit_path(&t, &path).unwrap(),
            *block.header().merkle_root()
        );
    }

    #[test]
    fn two_leaves() {
        let (a, b) = (tx(1), tx(2));
        assert_eq!(
            MerkleTree::root(&[a.clone(), b.clone()]).unwrap(),
            pair(&h(&a), &h(&b))
        );
    }

    #[test]
    fn odd_leaf_count_duplicates_last() {
        let (t0, t1, t2) = (tx(0), tx(1), tx(2));
        let expected = pair(&pair(&h(&t0), &h(&t1)), &pair(&h(&t2), &h(&t2)));
        assert_eq!(MerkleTree::root(&[t0, t1, t2]).unwrap(), expected);
    }

    #[test]
    fn order_matters() {
        let (a, b) = (tx(1), tx(2));
        assert_ne!(
            MerkleTree::root(&[a.clone(), b.clone()]).unwrap(),
            MerkleTree::root(&[b, a]).unwrap()
        );
    }

    #[test]
    fn audit_path_records_sides() {
        let txs: Vec<_> = (0..3).map(tx).collect();
        let block = block_of(txs.clone());

        let path = MerkleTree::audit_path(&txs[2], &block).unwrap();
        let entries = path.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], AuditEntry { sibling: h(&txs[2]), is_left: false });
        assert_eq!(
            entries[1],
            AuditEntry { sibling: pair(&h(&txs[0]), &h(&txs[1])), is_left: true }
        );
        assert_eq!(path.block_number(), 12);
    }

    #[test]
    fn missing_transaction_is_reported() {
        let block = block_of((0..4).map(tx).collect());
        assert!(matches!(
            MerkleTree::audit_path(&tx(99), &block),
            Err(LedgerError::TransactionNotPresent)
        ));

        let path = MerkleTree::audit_path(&tx(1), &block).unwrap();
        assert!(matches!(
            MerkleTree::root_from_audit_path(&tx(2), &path),
            Err(LedgerError::TransactionNotPresent)
        ));
    }

    #[test]
    fn tampered_sibling_changes_root() {
        let txs: Vec<_> = (0..5).map(tx).collect();
        let block = block_of(txs.clone());
        let path = MerkleTree::audit_path(&txs[3], &block).unwrap();

        let mut entries = path.entries().to_vec();
        entries[0].sibling = HashEngine::hash_bytes(b"forged");
        let forged = AuditPath::new(txs[3].clone(), 12, entries);

        assert_ne!(
            MerkleTree::root_from_audit_path(&txs[3], &forged).unwrap(),
            *block.header().merkle_root()
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn audit_path_rebuilds_root(count in 1usize..24, pick in 0usize..24) {
            let txs: Vec<_> = (0..count as u64).map(tx).collect();
            let block = block_of(txs.clone());
            let target = &txs[pick % count];

            let path = MerkleTree::audit_path(target, &block).unwrap();
            let rebuilt = MerkleTree::root_from_audit_path(target, &path).unwrap();
            prop_assert_eq!(rebuilt, MerkleTree::root(&txs).unwrap());
        }
    }
}
