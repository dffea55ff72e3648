// Coin Selection
// Knapsack selection over an eligibility ladder, with coin-control presets
// and an optional input-count cap

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeSet;
use tracing::debug;

use crate::config::SelectionConfig;
use crate::error::{InputError, ResourceError, Result};
use crate::recipient::Destination;
use crate::types::{Amount, OutPoint, OutputKind};

/// Stochastic subset-sum passes per target
const SUBSET_ITERATIONS: usize = 1_000;

/// A spendable output as seen during one selection call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinCandidate {
    pub outpoint: OutPoint,
    pub kind: OutputKind,
    pub value: Amount,
    pub depth: i32,
    pub spendable: bool,
    pub solvable: bool,
    /// Confirmed, or trusted unconfirmed
    pub safe: bool,
    /// The funding transaction spends our own coins
    pub from_me: bool,
    pub ancestors: usize,
    pub descendants: usize,
}

/// Caller overrides for input choice, change and proof parameters
#[derive(Debug, Clone, Default)]
pub struct CoinControl {
    /// Always spent
    pub inputs: BTreeSet<OutPoint>,
    pub allow_other_inputs: bool,
    pub allow_watch_only: bool,
    pub change_destination: Option<Destination>,
    /// Output position for change, `None` for random
    pub change_position: Option<usize>,
    pub fees_from_change: bool,
    pub min_value: Option<u64>,
    pub ct_exponent: Option<u32>,
    pub ct_bits: Option<u32>,
    /// Overrides the configured input cap
    pub max_inputs: Option<usize>,
}

impl CoinControl {
    pub fn new() -> Self {
        Self {
            allow_other_inputs: true,
            ..Self::default()
        }
    }

    pub fn select(&mut self, outpoint: OutPoint) -> &mut Self {
        self.inputs.insert(outpoint);
        self
    }

    pub fn has_selected(&self) -> bool {
        !self.inputs.is_empty()
    }

    pub fn is_selected(&self, outpoint: &OutPoint) -> bool {
        self.inputs.contains(outpoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibilityFilter {
    pub conf_mine: i32,
    pub conf_theirs: i32,
    pub max_ancestors: usize,
    pub max_descendants: usize,
}

impl EligibilityFilter {
    pub fn new(conf_mine: i32, conf_theirs: i32, max_ancestors: usize) -> Self {
        Self::with_descendants(conf_mine, conf_theirs, max_ancestors, max_ancestors)
    }

    pub fn with_descendants(
        conf_mine: i32,
        conf_theirs: i32,
        max_ancestors: usize,
        max_descendants: usize,
    ) -> Self {
        Self {
            conf_mine,
            conf_theirs,
            max_ancestors,
            max_descendants,
        }
    }

    /// Unsafe coins, unconfirmed and not our own trusted spends, never pass
    pub fn accepts(&self, coin: &CoinCandidate) -> bool {
        if !coin.safe {
            return false;
        }
        let min_depth = if coin.from_me {
            self.conf_mine
        } else {
            self.conf_theirs
        };
        coin.depth >= min_depth
            && coin.ancestors <= self.max_ancestors
            && coin.descendants <= self.max_descendants
    }
}

/// Filters tried in order, loosest last
pub fn eligibility_ladder(config: &SelectionConfig) -> Vec<EligibilityFilter> {
    let max_ancestors = config.max_ancestors.max(1);
    let max_descendants = config.max_descendants.max(1);

    let mut ladder = vec![
        EligibilityFilter::new(1, 6, 0),
        EligibilityFilter::new(1, 1, 0),
    ];
    if config.spend_zero_conf_change {
        ladder.push(EligibilityFilter::new(0, 1, 2));
        ladder.push(EligibilityFilter::with_descendants(
            0,
            1,
            4.min(max_ancestors / 3),
            4.min(max_descendants / 3),
        ));
        ladder.push(EligibilityFilter::with_descendants(
            0,
            1,
            max_ancestors / 2,
            max_descendants / 2,
        ));
        ladder.push(EligibilityFilter::with_descendants(
            0,
            1,
            max_ancestors - 1,
            max_descendants - 1,
        ));
        if !config.reject_long_chains {
            ladder.push(EligibilityFilter::new(0, 1, usize::MAX));
        }
    }
    ladder
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub coins: Vec<CoinCandidate>,
    pub value: Amount,
}

impl Selection {
    fn push(&mut self, coin: CoinCandidate) {
        self.value += coin.value;
        self.coins.push(coin);
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.coins.iter().map(|c| c.outpoint).collect()
    }
}

/// Randomised two-pass inclusion sampling; returns the inclusion mask and
/// sum of the best subset reaching `target`
pub fn approximate_best_subset<R: Rng>(
    rng: &mut R,
    values: &[Amount],
    total_lower: Amount,
    target: Amount,
    iterations: usize,
) -> (Vec<bool>, Amount) {
    let mut best = vec![true; values.len()];
    let mut best_sum = total_lower;

    let mut rep = 0;
    while rep < iterations && best_sum != target {
        let mut included = vec![false; values.len()];
        let mut total = 0;
        let mut reached = false;

        for pass in 0..2 {
            if reached {
                break;
            }
            for i in 0..values.len() {
                let take = if pass == 0 { rng.gen::<bool>() } else { !included[i] };
                if !take {
                    continue;
                }
                total += values[i];
                included[i] = true;
                if total >= target {
                    reached = true;
                    if total < best_sum {
                        best_sum = total;
                        best = included.clone();
                    }
                    total -= values[i];
                    included[i] = false;
                }
            }
        }
        rep += 1;
    }

    (best, best_sum)
}

/// Knapsack selection under one eligibility filter
pub fn select_coins_min_conf<R: Rng>(
    rng: &mut R,
    target: Amount,
    filter: &EligibilityFilter,
    coins: &[CoinCandidate],
    min_change: Amount,
) -> Option<Selection> {
    let mut shuffled: Vec<&CoinCandidate> = coins.iter().filter(|c| filter.accepts(c)).collect();
    shuffled.shuffle(rng);

    let mut lowest_larger: Option<&CoinCandidate> = None;
    let mut lower: Vec<&CoinCandidate> = Vec::new();
    let mut total_lower = 0;

    for coin in shuffled {
        if coin.value == target {
            let mut selection = Selection::default();
            selection.push(coin.clone());
            return Some(selection);
        } else if coin.value < target + min_change {
            lower.push(coin);
            total_lower += coin.value;
        } else if lowest_larger.map_or(true, |l| coin.value < l.value) {
            lowest_larger = Some(coin);
        }
    }

    let mut selection = Selection::default();

    if total_lower == target {
        for coin in lower {
            selection.push(coin.clone());
        }
        return Some(selection);
    }

    if total_lower < target {
        selection.push(lowest_larger?.clone());
        return Some(selection);
    }

    lower.sort_by(|a, b| b.value.cmp(&a.value));
    let values: Vec<Amount> = lower.iter().map(|c| c.value).collect();

    let (mut best, mut best_sum) =
        approximate_best_subset(rng, &values, total_lower, target, SUBSET_ITERATIONS);
    if best_sum != target && total_lower >= target + min_change {
        let second = approximate_best_subset(rng, &values, total_lower, target + min_change, SUBSET_ITERATIONS);
        best = second.0;
        best_sum = second.1;
    }

    match lowest_larger {
        Some(larger)
            if (best_sum != target && best_sum < target + min_change) || larger.value <= best_sum =>
        {
            selection.push(larger.clone());
        }
        _ => {
            for (coin, take) in lower.into_iter().zip(best) {
                if take {
                    selection.push(coin.clone());
                }
            }
        }
    }

    Some(selection)
}

/// Selection capped at `max_count` inputs. May return less than `target`
/// when the cap binds; the caller decides what to do with a short result.
pub fn select_coins_for_one_tx<R: Rng>(
    rng: &mut R,
    target: Amount,
    filter: &EligibilityFilter,
    coins: &[CoinCandidate],
    max_count: usize,
    min_change: Amount,
) -> Option<Selection> {
    if coins.is_empty() {
        return None;
    }
    if max_count == 0 {
        return select_coins_min_conf(rng, target, filter, coins, min_change);
    }

    let mut shuffled: Vec<&CoinCandidate> = coins.iter().filter(|c| filter.accepts(c)).collect();
    shuffled.shuffle(rng);

    let mut lowest_larger: Option<&CoinCandidate> = None;
    let mut sorted: Vec<&CoinCandidate> = Vec::new();
    for coin in shuffled {
        if coin.value < target + min_change {
            sorted.push(coin);
        } else if lowest_larger.map_or(true, |l| coin.value < l.value) {
            lowest_larger = Some(coin);
        }
    }
    sorted.sort_by_key(|c| c.value);
    if let Some(larger) = lowest_larger {
        sorted.push(larger);
    }
    if sorted.is_empty() {
        return None;
    }

    // Always include the smallest coin, against dust build-up
    let mut sum = sorted[0].value;
    let mut end = 1;
    while end < max_count && sum < target && end < sorted.len() {
        sum += sorted[end].value;
        end += 1;
    }

    let mut selection = Selection::default();
    if sum >= target {
        for coin in &sorted[..end] {
            selection.push((*coin).clone());
        }
        return Some(selection);
    }
    if end == sorted.len() {
        return None;
    }

    // Still short: slide the window past the smallest coin
    let mut start = 1;
    while sum < target && end < sorted.len() {
        sum += sorted[end].value - sorted[start].value;
        start += 1;
        end += 1;
    }

    selection.push(sorted[0].clone());
    for coin in &sorted[start..end] {
        selection.push((*coin).clone());
    }
    Some(selection)
}

/// Pick inputs for `target` from `coins`, honouring coin control and
/// walking the eligibility ladder.
///
/// Returns a short selection only when an input cap is in force.
pub fn select_coins<R: Rng>(
    rng: &mut R,
    coins: &[CoinCandidate],
    target: Amount,
    coin_control: &CoinControl,
    config: &SelectionConfig,
    min_change: Amount,
) -> Result<Selection> {
    let mut preset = Selection::default();
    for outpoint in &coin_control.inputs {
        let coin = coins
            .iter()
            .find(|c| c.outpoint == *outpoint)
            .ok_or(InputError::UnknownInput(*outpoint))?;
        preset.push(coin.clone());
    }

    if coin_control.has_selected() && !coin_control.allow_other_inputs {
        if preset.value < target {
            return Err(ResourceError::InsufficientFunds {
                needed: target,
                available: preset.value,
            }
            .into());
        }
        return Ok(preset);
    }

    let remaining: Vec<CoinCandidate> = coins
        .iter()
        .filter(|c| !coin_control.is_selected(&c.outpoint))
        .cloned()
        .collect();
    let max_count = coin_control.max_inputs.unwrap_or(config.max_inputs);

    let mut selection = Selection::default();
    if target > preset.value {
        let needed = target - preset.value;
        let found = eligibility_ladder(config)
            .iter()
            .find_map(|filter| select_coins_for_one_tx(rng, needed, filter, &remaining, max_count, min_change));
        match found {
            Some(found) => selection = found,
            None => {
                let available = preset.value + remaining.iter().map(|c| c.value).sum::<Amount>();
                return Err(ResourceError::InsufficientFunds {
                    needed: target,
                    available,
                }
                .into());
            }
        }
    }

    for coin in preset.coins {
        selection.push(coin);
    }
    selection.coins.shuffle(rng);

    debug!(
        target,
        selected = selection.value,
        inputs = selection.coins.len(),
        "selected coins"
    );
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WalletError;
    use crate::types::{Hash256, CENT, COIN};
    use proptest::prelude::*;
    use rand::thread_rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn coin(i: u32, value: Amount) -> CoinCandidate {
        CoinCandidate {
            outpoint: OutPoint::new(Hash256::hash(&i.to_le_bytes()), i),
            kind: OutputKind::Standard,
            value,
            depth: 10,
            spendable: true,
            solvable: true,
            safe: true,
            from_me: false,
            ancestors: 0,
            descendants: 0,
        }
    }

    fn pool(values: &[Amount]) -> Vec<CoinCandidate> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| coin(i as u32, *v))
            .collect()
    }

    fn any_filter() -> EligibilityFilter {
        EligibilityFilter::new(0, 0, usize::MAX)
    }

    #[test]
    fn test_exact_match_wins() {
        let coins = pool(&[COIN, 3 * COIN, 2 * COIN]);
        let selection =
            select_coins_min_conf(&mut thread_rng(), 3 * COIN, &any_filter(), &coins, CENT).unwrap();
        assert_eq!(selection.coins.len(), 1);
        assert_eq!(selection.value, 3 * COIN);
    }

    #[test]
    fn test_lower_set_exact_sum() {
        let coins = pool(&[COIN, 2 * COIN, 50 * COIN]);
        let selection =
            select_coins_min_conf(&mut thread_rng(), 3 * COIN, &any_filter(), &coins, CENT).unwrap();
        assert_eq!(selection.value, 3 * COIN);
        assert_eq!(selection.coins.len(), 2);
    }

    #[test]
    fn test_lowest_larger_fallback() {
        let coins = pool(&[CENT, 2 * CENT, 5 * COIN, 7 * COIN]);
        let selection =
            select_coins_min_conf(&mut thread_rng(), COIN, &any_filter(), &coins, CENT).unwrap();
        assert_eq!(selection.value, 5 * COIN);

        let small = pool(&[CENT, 2 * CENT]);
        assert!(select_coins_min_conf(&mut thread_rng(), COIN, &any_filter(), &small, CENT).is_none());
    }

    #[test]
    fn test_subset_avoids_tiny_change() {
        // 0.5 + 0.3 + 0.25 can hit 0.8 exactly
        let coins = pool(&[COIN / 2, 3 * COIN / 10, COIN / 4, 10 * COIN]);
        let selection =
            select_coins_min_conf(&mut thread_rng(), 8 * COIN / 10, &any_filter(), &coins, CENT).unwrap();
        assert_eq!(selection.value, 8 * COIN / 10);
    }

    #[test]
    fn test_ladder_shape() {
        let mut config = SelectionConfig::default();
        let ladder = eligibility_ladder(&config);
        assert_eq!(ladder.len(), 6);
        assert_eq!(ladder[0], EligibilityFilter::new(1, 6, 0));
        assert_eq!(ladder[3].max_ancestors, 4);
        assert_eq!(ladder[5].max_ancestors, 24);

        config.reject_long_chains = false;
        assert_eq!(eligibility_ladder(&config).len(), 7);

        config.spend_zero_conf_change = false;
        assert_eq!(eligibility_ladder(&config).len(), 2);
    }

    #[test]
    fn test_unconfirmed_change_needs_zero_conf_level() {
        let mut change = coin(1, 5 * COIN);
        change.depth = 0;
        change.from_me = true;
        change.ancestors = 1;
        let coins = vec![change];

        let mut config = SelectionConfig::default();
        let selection = select_coins(
            &mut thread_rng(),
            &coins,
            COIN,
            &CoinControl::new(),
            &config,
            CENT,
        )
        .unwrap();
        assert_eq!(selection.value, 5 * COIN);

        config.spend_zero_conf_change = false;
        let err = select_coins(&mut thread_rng(), &coins, COIN, &CoinControl::new(), &config, CENT)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::WalletError::ResourceExhausted(ResourceError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_coin_control_presets() {
        let coins = pool(&[COIN, 2 * COIN, 4 * COIN]);
        let config = SelectionConfig::default();

        let mut control = CoinControl::new();
        control.select(coins[0].outpoint);
        control.allow_other_inputs = false;
        let selection =
            select_coins(&mut thread_rng(), &coins, COIN / 2, &control, &config, CENT).unwrap();
        assert_eq!(selection.outpoints(), vec![coins[0].outpoint]);

        assert!(select_coins(&mut thread_rng(), &coins, 2 * COIN, &control, &config, CENT).is_err());

        // Presets count towards the target, the rest comes from the pool
        control.allow_other_inputs = true;
        let selection =
            select_coins(&mut thread_rng(), &coins, 5 * COIN, &control, &config, CENT).unwrap();
        assert!(selection.outpoints().contains(&coins[0].outpoint));
        assert!(selection.value >= 5 * COIN);

        let mut unknown = CoinControl::new();
        unknown.select(OutPoint::new(Hash256::zero(), 9));
        assert!(select_coins(&mut thread_rng(), &coins, COIN, &unknown, &config, CENT).is_err());
    }

    #[test]
    fn test_sliding_window() {
        let coins = pool(&[COIN, 2 * COIN, 3 * COIN, 4 * COIN]);

        // Two smallest reach the target inside the window
        let selection =
            select_coins_for_one_tx(&mut thread_rng(), 3 * COIN, &any_filter(), &coins, 2, 0).unwrap();
        assert_eq!(selection.value, 3 * COIN);

        // Window of two slides past the smallest but cannot reach 8
        let selection =
            select_coins_for_one_tx(&mut thread_rng(), 8 * COIN, &any_filter(), &coins, 2, 0).unwrap();
        assert_eq!(selection.coins.len(), 2);
        assert_eq!(selection.value, 5 * COIN);
        assert!(selection.coins.iter().any(|c| c.value == COIN));

        // Everything fits in the window and is still short
        assert!(select_coins_for_one_tx(&mut thread_rng(), 20 * COIN, &any_filter(), &coins, 4, 0).is_none());
    }

    #[test]
    fn test_seeded_runs_are_sufficient() {
        let coins = pool(&[
            3 * CENT,
            7 * CENT,
            11 * CENT,
            13 * CENT,
            17 * CENT,
            19 * CENT,
            23 * CENT,
            29 * CENT,
        ]);
        let target = 41 * CENT;

        let mut first = ChaCha20Rng::seed_from_u64(1);
        let mut second = ChaCha20Rng::seed_from_u64(2);
        let a = select_coins_min_conf(&mut first, target, &any_filter(), &coins, CENT).unwrap();
        let b = select_coins_min_conf(&mut second, target, &any_filter(), &coins, CENT).unwrap();
        assert!(a.value >= target);
        assert!(b.value >= target);

        // Same seed, same answer
        let mut again = ChaCha20Rng::seed_from_u64(1);
        let c = select_coins_min_conf(&mut again, target, &any_filter(), &coins, CENT).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_unsafe_coins_never_selected() {
        let mut unsafe_coin = coin(0, 5 * COIN);
        unsafe_coin.depth = 0;
        unsafe_coin.from_me = true;
        unsafe_coin.safe = false;
        assert!(!any_filter().accepts(&unsafe_coin));

        let config = SelectionConfig {
            reject_long_chains: false,
            ..SelectionConfig::default()
        };
        let err = select_coins(&mut thread_rng(), &[unsafe_coin.clone()], COIN, &CoinControl::new(), &config, CENT)
            .unwrap_err();
        assert!(matches!(
            err,
            WalletError::ResourceExhausted(ResourceError::InsufficientFunds { .. })
        ));

        // The same coin once trusted
        unsafe_coin.safe = true;
        let selection = select_coins(&mut thread_rng(), &[unsafe_coin], COIN, &CoinControl::new(), &config, CENT).unwrap();
        assert_eq!(selection.value, 5 * COIN);
    }

    proptest! {
        #[test]
        fn prop_selection_is_sufficient(
            values in prop::collection::vec(1i64..50 * COIN, 1..20),
            target in 1i64..200 * COIN,
            seed in any::<u64>(),
        ) {
            let coins = pool(&values);
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            match select_coins_min_conf(&mut rng, target, &any_filter(), &coins, CENT) {
                Some(selection) => {
                    prop_assert!(selection.value >= target);
                    let sum: Amount = selection.coins.iter().map(|c| c.value).sum();
                    prop_assert_eq!(sum, selection.value);
                }
                None => prop_assert!(values.iter().sum::<Amount>() < target),
            }
        }
    }
}
