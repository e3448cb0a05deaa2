//! Coin selection with changeless search, dust folding and rotation.
//!
//! Strategy, in order:
//! 1. Branch-and-bound search for a set whose value lands between the
//!    changeless requirement and that plus the cost of creating change.
//! 2. The smallest single UTXO that covers the target.
//! 3. Largest-first accumulation.
//!
//! Outpoints picked in the last few rounds are tried last, so building
//! several transactions before any is broadcast does not keep spending the
//! same coins.

use std::collections::{HashSet, VecDeque};

use bitcoin::OutPoint;
use tracing::debug;

use satchel_core::constants::DEFAULT_DUST_THRESHOLD;
use satchel_core::types::{dedup_utxos, Utxo};

use crate::error::WalletError;
use crate::fee::{fee_for_inputs, InputProfile};

/// Search budget for the branch-and-bound pass.
pub const BNB_MAX_TRIES: usize = 100_000;

/// Number of past selections remembered for rotation.
pub const ROTATION_ROUNDS: usize = 3;

/// Transaction shape the selection must pay for.
#[derive(Debug, Clone)]
pub struct SelectionParams {
    /// How each selected input will be spent.
    pub input: InputProfile,
    /// scriptPubKey lengths of the recipient outputs.
    pub recipient_script_lens: Vec<usize>,
    /// scriptPubKey length of the change output.
    pub change_script_len: usize,
    /// Change below this is added to the fee instead.
    pub dust_threshold: u64,
}

impl SelectionParams {
    pub fn new(input: InputProfile, recipient_script_lens: Vec<usize>, change_script_len: usize) -> Self {
        Self {
            input,
            recipient_script_lens,
            change_script_len,
            dust_threshold: DEFAULT_DUST_THRESHOLD,
        }
    }

    fn outputs(&self, with_change: bool) -> Vec<usize> {
        let mut lens = self.recipient_script_lens.clone();
        if with_change {
            lens.push(self.change_script_len);
        }
        lens
    }
}

/// Result of coin selection: which UTXOs to spend and the fee/change breakdown.
///
/// `total_input == target + fee + change` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSelection {
    pub selected: Vec<Utxo>,
    /// Sum of the selected values.
    pub total_input: u64,
    /// Amount paid to recipients.
    pub target: u64,
    /// Fee in satoshis, including any folded sub-dust change.
    pub fee: u64,
    /// Change returned to the wallet; zero means no change output.
    pub change: u64,
}

impl CoinSelection {
    pub fn has_change(&self) -> bool {
        self.change > 0
    }
}

/// Fee-aware coin selector.
///
/// Keeps a short memory of recent picks; create one per wallet session.
#[derive(Debug, Default)]
pub struct CoinSelector {
    recent: VecDeque<Vec<OutPoint>>,
}

struct Costs<'a> {
    params: &'a SelectionParams,
    target: u64,
    fee_rate: u64,
}

impl Costs<'_> {
    fn fee(&self, input_count: usize, with_change: bool) -> u64 {
        fee_for_inputs(
            &self.params.input,
            input_count,
            &self.params.outputs(with_change),
            self.fee_rate,
        )
    }

    /// Fee and change for spending exactly `utxos`, if they suffice.
    fn settle(&self, utxos: &[Utxo]) -> Option<CoinSelection> {
        let total: u64 = utxos.iter().map(|u| u.value).sum();
        let with_change = self.target.saturating_add(self.fee(utxos.len(), true));
        let (fee, change) = if total >= with_change
            && total - with_change >= self.params.dust_threshold
        {
            (with_change - self.target, total - with_change)
        } else {
            let changeless = self.target.saturating_add(self.fee(utxos.len(), false));
            if total < changeless {
                return None;
            }
            (total - self.target, 0)
        };
        Some(CoinSelection {
            selected: utxos.to_vec(),
            total_input: total,
            target: self.target,
            fee,
            change,
        })
    }
}

impl CoinSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget rotation history.
    pub fn reset(&mut self) {
        self.recent.clear();
    }

    fn recently_used(&self) -> HashSet<OutPoint> {
        self.recent.iter().flatten().copied().collect()
    }

    /// Select UTXOs paying `target` plus fees at `fee_rate` sat/vB.
    pub fn select(
        &mut self,
        utxos: &[Utxo],
        target: u64,
        fee_rate: u64,
        params: &SelectionParams,
    ) -> Result<CoinSelection, WalletError> {
        if utxos.is_empty() {
            return Err(WalletError::NoUtxos);
        }
        if target == 0 {
            return Err(WalletError::InvalidAmount("target must be non-zero".into()));
        }

        let costs = Costs {
            params,
            target,
            fee_rate,
        };
        let all = dedup_utxos(utxos.iter().cloned());
        let input_cost = params.input.vsize().saturating_mul(fee_rate);
        let spendable: Vec<Utxo> = all
            .iter()
            .filter(|u| u.value > input_cost)
            .cloned()
            .collect();

        let recent = self.recently_used();
        let fresh: Vec<Utxo> = spendable
            .iter()
            .filter(|u| !recent.contains(&u.outpoint))
            .cloned()
            .collect();

        let selection = if fresh.len() < spendable.len() {
            Self::select_from(&fresh, &costs).or_else(|| Self::select_from(&spendable, &costs))
        } else {
            Self::select_from(&spendable, &costs)
        };

        match selection {
            Some(selection) => {
                debug!(
                    inputs = selection.selected.len(),
                    target,
                    fee = selection.fee,
                    change = selection.change,
                    "coins selected"
                );
                self.recent
                    .push_back(selection.selected.iter().map(|u| u.outpoint).collect());
                if self.recent.len() > ROTATION_ROUNDS {
                    self.recent.pop_front();
                }
                Ok(selection)
            }
            None => Err(WalletError::InsufficientFunds {
                have: all.iter().map(|u| u.value).sum(),
                need: target.saturating_add(costs.fee(spendable.len().max(1), false)),
            }),
        }
    }

    fn select_from(pool: &[Utxo], costs: &Costs<'_>) -> Option<CoinSelection> {
        if pool.is_empty() {
            return None;
        }
        Self::changeless(pool, costs)
            .or_else(|| Self::smallest_covering(pool, costs))
            .or_else(|| Self::largest_first(pool, costs))
    }

    /// Branch-and-bound over effective values for a set needing no change.
    fn changeless(pool: &[Utxo], costs: &Costs<'_>) -> Option<CoinSelection> {
        let input_cost = costs.params.input.vsize().saturating_mul(costs.fee_rate);
        let mut candidates: Vec<&Utxo> = pool.iter().collect();
        candidates.sort_by(|a, b| b.value.cmp(&a.value).then(a.outpoint.cmp(&b.outpoint)));
        let values: Vec<u64> = candidates.iter().map(|u| u.value - input_cost).collect();

        // Everything except the inputs themselves.
        let fixed_fee = costs.fee(0, false);
        let change_fee = costs.fee(0, true) - fixed_fee;
        let cost_of_change = change_fee.saturating_add(input_cost);
        let lower = costs.target.saturating_add(fixed_fee);

        let mut search = BranchAndBound {
            values: &values,
            lower,
            upper: lower.saturating_add(cost_of_change),
            tries: 0,
            current: Vec::new(),
            best: None,
        };
        search.run();

        let (_, picks) = search.best?;
        let chosen: Vec<Utxo> = picks.into_iter().map(|i| candidates[i].clone()).collect();
        // Rounding can push the real fee past the estimate; settle re-checks.
        let settled = costs.settle(&chosen)?;
        (!settled.has_change()).then_some(settled)
    }

    fn smallest_covering(pool: &[Utxo], costs: &Costs<'_>) -> Option<CoinSelection> {
        let mut by_value: Vec<&Utxo> = pool.iter().collect();
        by_value.sort_by(|a, b| a.value.cmp(&b.value).then(a.outpoint.cmp(&b.outpoint)));
        by_value
            .into_iter()
            .find_map(|u| costs.settle(std::slice::from_ref(u)))
    }

    fn largest_first(pool: &[Utxo], costs: &Costs<'_>) -> Option<CoinSelection> {
        let mut by_value: Vec<&Utxo> = pool.iter().collect();
        by_value.sort_by(|a, b| b.value.cmp(&a.value).then(a.outpoint.cmp(&b.outpoint)));
        let mut chosen = Vec::new();
        let mut total = 0u64;
        for utxo in by_value {
            chosen.push(utxo.clone());
            total = total.saturating_add(utxo.value);
            // settle succeeds exactly when the changeless requirement is met
            if total >= costs.target.saturating_add(costs.fee(chosen.len(), false)) {
                return costs.settle(&chosen);
            }
        }
        None
    }
}

struct BranchAndBound<'a> {
    values: &'a [u64],
    lower: u64,
    upper: u64,
    tries: usize,
    current: Vec<usize>,
    /// (excess over `lower`, indices)
    best: Option<(u64, Vec<usize>)>,
}

enum Step {
    Visit { i: usize, sum: u64 },
    /// Leave the inclusion branch of the most recent pick.
    Unpick,
}

impl BranchAndBound<'_> {
    /// Depth-first search, inclusion branch first, on an explicit stack so
    /// pool size does not bound recursion depth.
    fn run(&mut self) {
        let mut suffix = vec![0u64; self.values.len() + 1];
        for i in (0..self.values.len()).rev() {
            suffix[i] = suffix[i + 1].saturating_add(self.values[i]);
        }

        let mut stack = vec![Step::Visit { i: 0, sum: 0 }];
        while let Some(step) = stack.pop() {
            let (i, sum) = match step {
                Step::Unpick => {
                    self.current.pop();
                    continue;
                }
                Step::Visit { i, sum } => (i, sum),
            };
            if self.tries >= BNB_MAX_TRIES || matches!(self.best, Some((0, _))) {
                break;
            }
            self.tries += 1;
            if sum > self.upper {
                continue;
            }
            if sum >= self.lower {
                let excess = sum - self.lower;
                if self.best.as_ref().is_none_or(|(b, _)| excess < *b) {
                    self.best = Some((excess, self.current.clone()));
                }
                continue;
            }
            if i == self.values.len() || sum.saturating_add(suffix[i]) < self.lower {
                continue;
            }
            // popped in reverse: include i, unwind it, then exclude i
            self.current.push(i);
            stack.push(Step::Visit { i: i + 1, sum });
            stack.push(Step::Unpick);
            stack.push(Step::Visit {
                i: i + 1,
                sum: sum + self.values[i],
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{ScriptBuf, Txid};
    use satchel_core::types::Confirmation;

    fn utxo(n: u8, value: u64) -> Utxo {
        utxo_at(n, 0, value)
    }

    fn utxo_at(n: u8, vout: u32, value: u64) -> Utxo {
        Utxo {
            outpoint: OutPoint::new(Txid::from_byte_array([n; 32]), vout),
            value,
            script_pubkey: ScriptBuf::new(),
            confirmation: Confirmation::Confirmed { height: 100 },
        }
    }

    fn p2wpkh_params() -> SelectionParams {
        SelectionParams::new(InputProfile::P2wpkh, vec![22], 22)
    }

    fn balanced(s: &CoinSelection) -> bool {
        s.total_input == s.target + s.fee + s.change
            && s.total_input == s.selected.iter().map(|u| u.value).sum::<u64>()
    }

    #[test]
    fn picks_smallest_covering_utxo() {
        let utxos = vec![utxo(1, 100_000), utxo(2, 200_000), utxo(3, 300_000)];
        let s = CoinSelector::new()
            .select(&utxos, 150_000, 2, &p2wpkh_params())
            .unwrap();
        assert_eq!(s.selected.len(), 1);
        assert_eq!(s.selected[0].value, 200_000);
        // 141 vB at 2 sat/vB
        assert_eq!(s.fee, 282);
        assert_eq!(s.change, 200_000 - 150_000 - 282);
        assert!(balanced(&s));
    }

    #[test]
    fn exact_match_is_changeless() {
        // 110 vB changeless at 1 sat/vB
        let utxos = vec![utxo(1, 50_110), utxo(2, 80_000)];
        let s = CoinSelector::new()
            .select(&utxos, 50_000, 1, &p2wpkh_params())
            .unwrap();
        assert_eq!(s.selected[0].value, 50_110);
        assert_eq!(s.change, 0);
        assert_eq!(s.fee, 110);
        assert!(balanced(&s));
    }

    #[test]
    fn sub_dust_change_folded_into_fee() {
        // would leave 300 sats change: below dust
        let utxos = vec![utxo(1, 50_000 + 141 + 300)];
        let s = CoinSelector::new()
            .select(&utxos, 50_000, 1, &p2wpkh_params())
            .unwrap();
        assert_eq!(s.change, 0);
        assert_eq!(s.fee, 441);
        assert!(balanced(&s));
    }

    #[test]
    fn combines_when_no_single_covers() {
        let utxos = vec![utxo(1, 40_000), utxo(2, 30_000), utxo(3, 20_000)];
        let s = CoinSelector::new()
            .select(&utxos, 65_000, 1, &p2wpkh_params())
            .unwrap();
        assert!(s.selected.len() >= 2);
        assert!(balanced(&s));
        assert!(s.change == 0 || s.change >= DEFAULT_DUST_THRESHOLD);
    }

    #[test]
    fn insufficient_funds_reports_have_and_need() {
        let utxos = vec![utxo(1, 10_000), utxo(2, 20_000)];
        let err = CoinSelector::new()
            .select(&utxos, 50_000, 1, &p2wpkh_params())
            .unwrap_err();
        match err {
            WalletError::InsufficientFunds { have, need } => {
                assert_eq!(have, 30_000);
                assert!(need > 50_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn funds_exactly_short_by_fee() {
        let utxos = vec![utxo(1, 50_000)];
        assert!(matches!(
            CoinSelector::new().select(&utxos, 50_000, 1, &p2wpkh_params()),
            Err(WalletError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn empty_and_zero_target_rejected() {
        let mut selector = CoinSelector::new();
        assert_eq!(
            selector.select(&[], 1_000, 1, &p2wpkh_params()),
            Err(WalletError::NoUtxos)
        );
        assert!(matches!(
            selector.select(&[utxo(1, 1_000)], 0, 1, &p2wpkh_params()),
            Err(WalletError::InvalidAmount(_))
        ));
    }

    #[test]
    fn uneconomic_utxos_ignored() {
        // 68 vB input at 10 sat/vB costs 680
        let utxos = vec![utxo(1, 600), utxo(2, 100_000)];
        let s = CoinSelector::new()
            .select(&utxos, 10_000, 10, &p2wpkh_params())
            .unwrap();
        assert!(s.selected.iter().all(|u| u.value != 600));
    }

    #[test]
    fn duplicate_outpoints_counted_once() {
        let utxos = vec![utxo(1, 30_000), utxo(1, 30_000)];
        let err = CoinSelector::new()
            .select(&utxos, 50_000, 1, &p2wpkh_params())
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { have: 30_000, .. }));
    }

    #[test]
    fn rotation_prefers_unused_coins() {
        let utxos = vec![utxo(1, 100_000), utxo(2, 200_000), utxo(3, 300_000)];
        let mut selector = CoinSelector::new();
        let first = selector.select(&utxos, 150_000, 2, &p2wpkh_params()).unwrap();
        let second = selector.select(&utxos, 150_000, 2, &p2wpkh_params()).unwrap();
        assert_ne!(first.selected[0].outpoint, second.selected[0].outpoint);
        assert_eq!(second.selected[0].value, 300_000);

        // only the remembered coins can pay: still allowed
        let third = selector.select(&utxos, 250_000, 2, &p2wpkh_params()).unwrap();
        assert_eq!(third.selected[0].value, 300_000);

        selector.reset();
        let again = selector.select(&utxos, 150_000, 2, &p2wpkh_params()).unwrap();
        assert_eq!(again.selected[0].value, 200_000);
    }

    #[test]
    fn fee_scales_with_rate() {
        let utxos = vec![utxo(1, 1_000_000)];
        let low = CoinSelector::new()
            .select(&utxos, 100_000, 1, &p2wpkh_params())
            .unwrap();
        let high = CoinSelector::new()
            .select(&utxos, 100_000, 10, &p2wpkh_params())
            .unwrap();
        assert_eq!(high.fee, low.fee * 10);
    }

    #[test]
    fn large_pool_selects_on_small_stack() {
        let utxos: Vec<Utxo> = (0..50_000u32).map(|vout| utxo_at(7, vout, 10_000)).collect();
        let selection = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(move || {
                CoinSelector::new().select(&utxos, 300_000_000, 1, &p2wpkh_params())
            })
            .unwrap()
            .join()
            .unwrap()
            .unwrap();
        assert!(balanced(&selection));
        assert!(selection.total_input >= 300_000_000 + selection.fee);
    }

    #[test]
    fn search_prefers_exact_changeless_set() {
        // 45_000 + 30_000 lands in the changeless window; the search must
        // backtrack past 60_000 to find it
        let utxos = vec![
            utxo(1, 60_000),
            utxo(2, 45_000),
            utxo(3, 30_000),
            utxo(4, 5_000),
        ];
        let params = p2wpkh_params();
        let costs = Costs {
            params: &params,
            target: 75_000 - fee_for_inputs(&params.input, 2, &params.outputs(false), 1) - 20,
            fee_rate: 1,
        };
        let selection = CoinSelector::changeless(&utxos, &costs).unwrap();
        assert!(!selection.has_change());
        let mut values: Vec<u64> = selection.selected.iter().map(|u| u.value).collect();
        values.sort();
        assert_eq!(values, vec![30_000, 45_000]);
    }
}
