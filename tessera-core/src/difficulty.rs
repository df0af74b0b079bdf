use bigdecimal::num_bigint::BigInt;
use bigdecimal::{BigDecimal, One, RoundingMode};
use log::{debug, warn};

use crate::block::BlockHeader;
use crate::error::{LedgerError, LedgerResult};
use crate::hash::{HashEngine, HashValue};
use crate::params::ChainParams;
use crate::storage::ChainStorage;
use crate::U512;

/// Fractional digits kept for a retargeted difficulty.
pub const DIFFICULTY_SCALE: i64 = 20;
/// Fractional digits kept for the intermediate adjustment coefficient.
const COEFFICIENT_SCALE: i64 = 40;
/// Written into the last byte of a target that would otherwise be all zeros.
const TARGET_SENTINEL: u8 = 0x01;

/// Difficulty retargeting and difficulty-to-target conversion.
pub struct DifficultyPolicy<'a> {
    params: &'a ChainParams,
    storage: &'a dyn ChainStorage,
}

impl<'a> DifficultyPolicy<'a> {
    pub fn new(params: &'a ChainParams, storage: &'a dyn ChainStorage) -> Self {
        DifficultyPolicy { params, storage }
    }

    /// Difficulty the block following `header` must declare.
    ///
    /// Off a retarget boundary this is `header`'s difficulty. On a boundary the
    /// header `retarget_interval` blocks back (never before genesis) is read from
    /// `window` when given, else from storage, and the difficulty is scaled by
    /// how far the elapsed time strayed from the target block time.
    pub fn next_difficulty(
        &self,
        header: &BlockHeader,
        window: Option<&[BlockHeader]>,
    ) -> LedgerResult<BigDecimal> {
        let interval = self.params.retarget_interval;
        let next_number = header.block_number() + 1;
        if next_number % interval != 0 {
            return Ok(header.difficulty().clone());
        }

        let earlier_number = header.block_number().saturating_sub(interval);
        let earlier = self.lookup(earlier_number, window)?;

        let elapsed_seconds = header.timestamp() / 1000 - earlier.timestamp() / 1000;
        if elapsed_seconds <= 0 {
            warn!(
                "Non-positive retarget window ({}s) ending at block #{}, treating it as 1s",
                elapsed_seconds,
                header.block_number()
            );
        }
        let elapsed_seconds = elapsed_seconds.max(1);

        let expected_seconds =
            BigDecimal::from(interval) * BigDecimal::from(self.params.target_seconds_per_block);
        let coefficient = (expected_seconds / BigDecimal::from(elapsed_seconds))
            .with_scale_round(COEFFICIENT_SCALE, RoundingMode::HalfEven);
        let adjusted = (header.difficulty() * &coefficient)
            .with_scale_round(DIFFICULTY_SCALE, RoundingMode::HalfEven);
        let adjusted = adjusted.max(BigDecimal::one());

        debug!(
            "Retarget at block #{}: {}s elapsed, coefficient {}, difficulty {} -> {}",
            next_number,
            elapsed_seconds,
            coefficient,
            header.difficulty(),
            adjusted
        );
        Ok(adjusted)
    }

    fn lookup(&self, number: u64, window: Option<&[BlockHeader]>) -> LedgerResult<BlockHeader> {
        if let Some(found) = window
            .and_then(|headers| headers.iter().find(|h| h.block_number() == number))
        {
            return Ok(found.clone());
        }
        self.storage
            .header_by_number(number)
            .ok_or(LedgerError::HeaderNotFound(number))
    }

    pub fn target_mask(&self, difficulty: &BigDecimal) -> HashValue {
        Self::target_mask_for(self.params, difficulty)
    }

    /// Target a header hash has to survive masking with, for `difficulty`.
    ///
    /// The easiest target keeps `max_zero_bits` leading zero bits; every
    /// doubling of the (ceiled) difficulty adds one more.
    pub fn target_mask_for(params: &ChainParams, difficulty: &BigDecimal) -> HashValue {
        let hash_bits = HashEngine::hash_length() * 8;
        let max_target = U512::MAX >> params.max_zero_bits as usize;
        let shifts = Self::shifts(difficulty);

        let target = if shifts >= hash_bits {
            U512::zero()
        } else {
            max_target >> shifts
        };

        let mut bytes = target.to_big_endian().to_vec();
        if let Some(last) = bytes.last_mut() {
            if *last == 0 {
                *last = TARGET_SENTINEL;
            }
        }
        HashValue::new(bytes)
    }

    /// `ceil(log2(ceil(difficulty)))`, zero for difficulties up to 1.
    fn shifts(difficulty: &BigDecimal) -> usize {
        let (ceiled, _) = difficulty
            .with_scale_round(0, RoundingMode::Ceiling)
            .into_bigint_and_exponent();
        if ceiled <= BigInt::one() {
            return 0;
        }
        (ceiled - BigInt::one()).bits() as usize
    }

    pub fn satisfies_target(hash: &HashValue, target: &HashValue) -> bool {
        &hash.mask_with(target) == hash
    }

    pub fn header_meets_target(&self, header: &BlockHeader) -> bool {
        let target = self.target_mask(header.difficulty());
        Self::satisfies_target(header.hash(), &target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::UnsealedHeader;
    use crate::storage::MemoryChain;

    fn header(number: u64, timestamp: i64, difficulty: &str) -> BlockHeader {
        UnsealedHeader {
            version: 1,
            chain_name: "tessera-test".to_string(),
            block_number: number,
            previous_hash: HashValue::zero(),
            merkle_root: HashValue::zero(),
            timestamp,
            difficulty: difficulty.parse().unwrap(),
            nonce: 0,
            miner_signature: String::new(),
        }
        .seal()
        .unwrap()
    }

    fn params(interval: u64, seconds: u64) -> ChainParams {
        ChainParams {
            retarget_interval: interval,
            target_seconds_per_block: seconds,
            ..ChainParams::testing()
        }
    }

    fn dec(s: &str) -> BigDecimal {
        s.parse().unwrap()
    }

    #[test]
    fn off_boundary_keeps_difficulty() {
        let params = params(4, 10);
        let storage = MemoryChain::new();
        let policy = DifficultyPolicy::new(&params, &storage);

        for number in [0u64, 1, 2, 4, 5, 6] {
            let h = header(number, 0, "7.125");
            assert_eq!(policy.next_difficulty(&h, None).unwrap(), dec("7.125"));
        }
    }

    #[test]
    fn blocks_faster_than_target_raise_difficulty() {
        let params = params(2, 10);
        let storage = MemoryChain::new();
        let policy = DifficultyPolicy::new(&params, &storage);

        // 2 blocks x 10s expected, 5s observed: coefficient 4.
        let window = vec![header(1, 1_000_000, "1"), header(3, 1_005_000, "3")];
        let next = policy.next_difficulty(&window[1], Some(&window)).unwrap();
        assert_eq!(next, dec("12"));
        assert_eq!(next.as_bigint_and_exponent().1, DIFFICULTY_SCALE);
    }

    #[test]
    fn rounding_is_half_even_at_twenty_digits() {
        let params = params(1, 1);
        let storage = MemoryChain::new();
        let policy = DifficultyPolicy::new(&params, &storage);

        // Interval 1: block 5 looks back to block 4; 3s elapsed gives coefficient 1/3.
        let window = vec![header(4, 10_000, "1"), header(5, 13_000, "9")];
        let next = policy.next_difficulty(&window[1], Some(&window)).unwrap();
        assert_eq!(next, dec("3.00000000000000000000"));

        let window = vec![header(4, 10_000, "1"), header(5, 13_000, "5")];
        let next = policy.next_difficulty(&window[1], Some(&window)).unwrap();
        assert_eq!(next, dec("1.66666666666666666667"));
    }

    #[test]
    fn difficulty_never_drops_below_one() {
        let params = params(2, 10);
        let storage = MemoryChain::new();
        let policy = DifficultyPolicy::new(&params, &storage);

        let window = vec![header(1, 0, "1"), header(3, 86_400_000, "1.5")];
        let next = policy.next_difficulty(&window[1], Some(&window)).unwrap();
        assert_eq!(next, BigDecimal::one());
    }

    #[test]
    fn zero_elapsed_time_is_clamped() {
        let params = params(2, 10);
        let storage = MemoryChain::new();
        let policy = DifficultyPolicy::new(&params, &storage);

        let window = vec![header(1, 5_000, "1"), header(3, 5_999, "2")];
        assert_eq!(policy.next_difficulty(&window[1], Some(&window)).unwrap(), dec("40"));
    }

    #[test]
    fn missing_window_header_is_reported() {
        let params = params(2, 10);
        let storage = MemoryChain::new();
        let policy = DifficultyPolicy::new(&params, &storage);

        let h = header(3, 0, "1");
        assert!(matches!(
            policy.next_difficulty(&h, None),
            Err(LedgerError::HeaderNotFound(1))
        ));
    }

    #[test]
    fn window_lookup_stops_at_genesis() {
        let params = params(2, 10);
        let storage = MemoryChain::new();
        let policy = DifficultyPolicy::new(&params, &storage);

        // Block 1 closes the first window; it reaches back to genesis, not block -1.
        let window = vec![header(0, 0, "1"), header(1, 10_000, "1")];
        assert_eq!(policy.next_difficulty(&window[1], Some(&window)).unwrap(), dec("2"));
    }

    #[test]
    fn target_mask_keeps_leading_zero_bits() {
        let params = ChainParams { max_zero_bits: 12, ..ChainParams::testing() };
        let mask = DifficultyPolicy::target_mask_for(&params, &BigDecimal::one());
        let bytes = mask.as_bytes();

        assert_eq!(mask.len(), HashEngine::hash_length());
        assert_eq!(bytes[0], 0x00);
        assert_eq!(bytes[1], 0x0f);
        assert!(bytes[2..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn fractional_difficulty_is_ceiled() {
        let params = ChainParams::testing();
        let at_two = DifficultyPolicy::target_mask_for(&params, &dec("2"));
        let just_above_one = DifficultyPolicy::target_mask_for(&params, &dec("1.01"));
        let at_three = DifficultyPolicy::target_mask_for(&params, &dec("3"));
        let at_four = DifficultyPolicy::target_mask_for(&params, &dec("4"));

        assert_eq!(just_above_one, at_two);
        assert_eq!(at_three, at_four);
        assert_ne!(at_two, at_four);
    }

    #[test]
    fn higher_difficulty_narrows_accepted_hashes() {
        let params = ChainParams::testing();
        let difficulties = ["1", "2", "4", "8", "1024", "65536"];
        let masks: Vec<_> = difficulties
            .iter()
            .map(|d| DifficultyPolicy::target_mask_for(&params, &dec(d)))
            .collect();

        for pair in masks.windows(2) {
            let (easier, harder) = (&pair[0], &pair[1]);
            // Whatever passes the harder target passes the easier one.
            assert_eq!(&harder.mask_with(easier), harder);
            // The easier target itself fails the harder one.
            assert!(!DifficultyPolicy::satisfies_target(easier, harder));
        }
    }

    #[test]
    fn target_never_becomes_all_zero() {
        let params = ChainParams::testing();
        let huge = BigDecimal::new(BigInt::one() << 600usize, 0);
        let mask = DifficultyPolicy::target_mask_for(&params, &huge);
        assert_eq!(mask.as_bytes().last(), Some(&TARGET_SENTINEL));
        assert!(mask.as_bytes()[..63].iter().all(|b| *b == 0));
    }
}
