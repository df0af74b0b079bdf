//! Picking one answer out of several untrusted peer replies to the same query.
//!
//! This is an availability heuristic: the most replicated answer wins, ties go
//! to an answer that links onto a header we already hold, and anything still
//! tied is drawn at random. It gives no protection against a colluding
//! majority, so the winner is still run through the block validator.

use log::debug;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::block::{Block, BlockHeader, CompactBlock};
use crate::hash::HashValue;
use crate::storage::ChainStorage;

/// Anything that names its own height and its parent's hash.
pub trait ChainLinked {
    fn linked_number(&self) -> u64;
    fn linked_previous_hash(&self) -> &HashValue;
}

impl ChainLinked for BlockHeader {
    fn linked_number(&self) -> u64 {
        self.block_number()
    }

    fn linked_previous_hash(&self) -> &HashValue {
        self.previous_hash()
    }
}

impl ChainLinked for Block {
    fn linked_number(&self) -> u64 {
        self.header().linked_number()
    }

    fn linked_previous_hash(&self) -> &HashValue {
        self.header().linked_previous_hash()
    }
}

impl ChainLinked for CompactBlock {
    fn linked_number(&self) -> u64 {
        self.header().linked_number()
    }

    fn linked_previous_hash(&self) -> &HashValue {
        self.header().linked_previous_hash()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Consensus<T> {
    /// Every peer that answered gave the same value.
    Unanimous(T),
    /// One value was strictly the most frequent.
    Plurality(T),
    /// Tied values, resolved by the one linking onto a known local header.
    LinkedTieBreak(T),
    /// Tied values with nothing to tell them apart.
    RandomTieBreak(T),
    /// No peer returned anything.
    NotFound,
}

impl<T> Consensus<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Consensus::Unanimous(v)
            | Consensus::Plurality(v)
            | Consensus::LinkedTieBreak(v)
            | Consensus::RandomTieBreak(v) => Some(v),
            Consensus::NotFound => None,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Consensus::Unanimous(v)
            | Consensus::Plurality(v)
            | Consensus::LinkedTieBreak(v)
            | Consensus::RandomTieBreak(v) => Some(v),
            Consensus::NotFound => None,
        }
    }
}

pub struct ConsensusSelector<'a> {
    storage: &'a dyn ChainStorage,
}

impl<'a> ConsensusSelector<'a> {
    pub fn new(storage: &'a dyn ChainStorage) -> Self {
        ConsensusSelector { storage }
    }

    /// `None` entries are peers that had no answer.
    pub fn select<T>(&self, replies: &[Option<T>]) -> Consensus<T>
    where
        T: ChainLinked + PartialEq + Clone,
    {
        self.select_with_rng(replies, &mut rand::thread_rng())
    }

    pub fn select_with_rng<T, R>(&self, replies: &[Option<T>], rng: &mut R) -> Consensus<T>
    where
        T: ChainLinked + PartialEq + Clone,
        R: Rng + ?Sized,
    {
        let answers: Vec<&T> = replies.iter().flatten().collect();
        let Some(first) = answers.first() else {
            return Consensus::NotFound;
        };

        if answers.iter().all(|a| a == first) {
            return Consensus::Unanimous((*first).clone());
        }

        let mut counts: Vec<(&T, usize)> = Vec::new();
        for answer in &answers {
            match counts.iter_mut().find(|(value, _)| value == answer) {
                Some((_, count)) => *count += 1,
                None => counts.push((answer, 1)),
            }
        }

        let top = counts.iter().map(|(_, c)| *c).max().unwrap_or(0);
        let candidates: Vec<&T> = counts
            .into_iter()
            .filter(|(_, c)| *c == top)
            .map(|(value, _)| value)
            .collect();
        debug!(
            "{} answers from {} replies, {} tied at {} votes",
            answers.len(),
            replies.len(),
            candidates.len(),
            top
        );

        if let [only] = candidates.as_slice() {
            return Consensus::Plurality((*only).clone());
        }

        let linked: Vec<&T> = candidates
            .iter()
            .copied()
            .filter(|c| self.links_locally(*c))
            .collect();
        if let Some(choice) = linked.choose(rng) {
            return Consensus::LinkedTieBreak((*choice).clone());
        }

        match candidates.choose(rng) {
            Some(choice) => Consensus::RandomTieBreak((*choice).clone()),
            None => Consensus::NotFound,
        }
    }

    fn links_locally<T: ChainLinked>(&self, candidate: &T) -> bool {
        let number = candidate.linked_number();
        if number == 0 {
            return false;
        }
        self.storage
            .header_by_number(number - 1)
            .is_some_and(|local| local.hash() == candidate.linked_previous_hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::UnsealedHeader;
    use bigdecimal::BigDecimal;
    use crate::hash::HashEngine;
    use crate::params::ChainParams;
    use crate::storage::MemoryChain;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn header(number: u64, previous: HashValue, nonce: u32) -> BlockHeader {
        UnsealedHeader {
            version: 1,
            chain_name: "tessera-test".to_string(),
            block_number: number,
            previous_hash: previous,
            merkle_root: HashValue::zero(),
            timestamp: 0,
            difficulty: BigDecimal::from(1),
            nonce,
            miner_signature: String::new(),
        }
        .seal()
        .unwrap()
    }

    fn chain() -> MemoryChain {
        MemoryChain::with_genesis(Block::genesis(&ChainParams::testing()).unwrap()).unwrap()
    }

    #[test]
    fn no_replies_is_not_found() {
        let storage = chain();
        let selector = ConsensusSelector::new(&storage);
        assert_eq!(selector.select::<BlockHeader>(&[]), Consensus::NotFound);
        assert_eq!(selector.select::<BlockHeader>(&[None, None]), Consensus::NotFound);
    }

    #[test]
    fn identical_replies_take_the_fast_path() {
        let storage = chain();
        let selector = ConsensusSelector::new(&storage);
        let value = header(5, HashValue::zero(), 1);
        let replies = vec![Some(value.clone()); 5];

        assert_eq!(selector.select(&replies), Consensus::Unanimous(value.clone()));

        let with_gaps = vec![None, Some(value.clone()), None, Some(value.clone())];
        assert_eq!(selector.select(&with_gaps), Consensus::Unanimous(value));
    }

    #[test]
    fn most_frequent_reply_wins() {
        let storage = chain();
        let selector = ConsensusSelector::new(&storage);
        let a = header(5, HashValue::zero(), 1);
        let b = header(5, HashValue::zero(), 2);

        let replies = vec![Some(b.clone()), Some(a.clone()), Some(a.clone()), None];
        assert_eq!(selector.select(&replies), Consensus::Plurality(a));
    }

    #[test]
    fn tie_goes_to_the_locally_linked_reply() {
        let storage = chain();
        let selector = ConsensusSelector::new(&storage);
        let genesis_hash = storage.header_by_number(0).unwrap().hash().clone();

        let a = header(1, genesis_hash, 1);
        let b = header(1, HashEngine::hash_bytes(b"unknown parent"), 2);
        let replies = vec![
            Some(b.clone()),
            Some(a.clone()),
            Some(b.clone()),
            Some(a.clone()),
        ];

        for seed in 0..16 {
            let mut rng = StdRng::seed_from_u64(seed);
            assert_eq!(
                selector.select_with_rng(&replies, &mut rng),
                Consensus::LinkedTieBreak(a.clone())
            );
        }
    }

    #[test]
    fn unresolvable_tie_picks_one_candidate() {
        let storage = chain();
        let selector = ConsensusSelector::new(&storage);
        let a = header(7, HashEngine::hash_bytes(b"x"), 1);
        let b = header(7, HashEngine::hash_bytes(b"y"), 2);
        let c = header(7, HashEngine::hash_bytes(b"z"), 3);
        let replies = vec![
            Some(a.clone()),
            Some(b.clone()),
            Some(c),
            Some(a.clone()),
            Some(b.clone()),
        ];

        let mut rng = StdRng::seed_from_u64(42);
        match selector.select_with_rng(&replies, &mut rng) {
            Consensus::RandomTieBreak(choice) => assert!(choice == a || choice == b),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn reply_order_does_not_change_the_winner() {
        let storage = chain();
        let selector = ConsensusSelector::new(&storage);
        let a = header(3, HashValue::zero(), 1);
        let b = header(3, HashValue::zero(), 2);

        let forward = vec![Some(a.clone()), Some(b.clone()), Some(a.clone())];
        let backward: Vec<_> = forward.iter().rev().cloned().collect();
        assert_eq!(selector.select(&forward), selector.select(&backward));
    }

    #[test]
    fn works_for_blocks_and_compact_blocks() {
        let storage = chain();
        let selector = ConsensusSelector::new(&storage);
        let genesis = storage.block_by_number(0).unwrap();

        let blocks = vec![Some(genesis.clone()), None, Some(genesis.clone())];
        assert_eq!(selector.select(&blocks).into_value(), Some(genesis.clone()));

        let compact = CompactBlock::from_block(&genesis, &genesis.transactions()[0]).unwrap();
        let compacts = vec![Some(compact.clone())];
        assert_eq!(selector.select(&compacts).into_value(), Some(compact));
    }
}
