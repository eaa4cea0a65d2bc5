//! Coin selection over VTXOs and on-chain UTXOs.

use crate::Error;
use bitcoin::Amount;
use bitcoin::OutPoint;

/// A candidate VTXO for coin selection. A trimmed-down view of the full VTXO record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualTxOutPoint {
    pub outpoint: OutPoint,
    pub expire_at: i64,
    pub amount: Amount,
}

/// Select VTXOs to cover `target`.
///
/// The strategy is greedy smallest-first-that-exceeds with a largest-first fallback: prefer the
/// single smallest coin that covers the target; otherwise accumulate small coins, keeping
/// fragmentation down by falling back to big coins when small ones cannot produce a valid
/// change output. The resulting change is either zero or at least `dust` (sub-dust VTXOs
/// cannot be created as change), and no selected coin is redundant.
///
/// With `sort_by_expiry`, coins closest to expiry are preferred, so that value is refreshed
/// before the server can sweep it.
pub fn select_vtxos(
    mut candidates: Vec<VirtualTxOutPoint>,
    target: Amount,
    dust: Amount,
    sort_by_expiry: bool,
) -> Result<Vec<VirtualTxOutPoint>, Error> {
    if target == Amount::ZERO {
        return Err(Error::coin_select("cannot select coins for zero target"));
    }

    let total_available = candidates
        .iter()
        .try_fold(Amount::ZERO, |acc, coin| acc.checked_add(coin.amount))
        .ok_or_else(|| Error::coin_select("candidate amount overflow"))?;

    if total_available < target {
        return Err(Error::coin_select(format!(
            "insufficient funds: need {target}, have {total_available}"
        )));
    }

    let valid_change = |total: Amount| -> bool {
        match total.checked_sub(target) {
            Some(change) => change == Amount::ZERO || change >= dust,
            None => false,
        }
    };

    // The single smallest coin that covers the target with acceptable change.
    let mut by_amount = candidates.clone();
    by_amount.sort_by_key(|coin| coin.amount);

    if let Some(coin) = by_amount.iter().find(|coin| valid_change(coin.amount)) {
        return Ok(vec![*coin]);
    }

    if sort_by_expiry {
        // Refresh the coins that expire first.
        candidates.sort_by_key(|coin| (coin.expire_at, coin.amount));
    } else {
        candidates.sort_by_key(|coin| coin.amount);
    }

    let selection = accumulate(&candidates, target, &valid_change).or_else(|| {
        // Fallback: largest coins first. Fewer inputs, and over-selection makes a valid
        // change output more likely.
        let mut by_amount_desc = by_amount;
        by_amount_desc.reverse();
        accumulate(&by_amount_desc, target, &valid_change)
    });

    let mut selection = selection.ok_or_else(|| {
        Error::coin_select(format!(
            "insufficient funds: cannot cover {target} without sub-dust change"
        ))
    })?;

    prune(&mut selection, &valid_change);

    Ok(selection)
}

fn accumulate(
    candidates: &[VirtualTxOutPoint],
    target: Amount,
    valid_change: &impl Fn(Amount) -> bool,
) -> Option<Vec<VirtualTxOutPoint>> {
    let mut selection = Vec::new();
    let mut total = Amount::ZERO;

    for coin in candidates {
        selection.push(*coin);
        total = total.checked_add(coin.amount)?;

        if total >= target && valid_change(total) {
            return Some(selection);
        }
    }

    None
}

/// Drop coins that are not needed to satisfy the target and change constraints.
fn prune(selection: &mut Vec<VirtualTxOutPoint>, valid_change: &impl Fn(Amount) -> bool) {
    let mut i = 0;
    while i < selection.len() {
        let remaining = selection
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, coin)| coin.amount)
            .sum::<Amount>();

        if valid_change(remaining) {
            selection.remove(i);
        } else {
            i += 1;
        }
    }
}

/// A selected on-chain UTXO.
#[derive(Debug, Clone, Copy)]
pub struct SelectedUtxo {
    pub outpoint: OutPoint,
    pub amount: Amount,
}

/// The result of selecting on-chain UTXOs for a spend.
#[derive(Debug, Clone)]
pub struct UtxoCoinSelection {
    pub selected_utxos: Vec<SelectedUtxo>,
    pub total_selected: Amount,
}

/// Accumulate on-chain UTXOs until `target` is covered. On-chain change can always be created,
/// so no dust handling is needed here; the caller accounts for fees in `target`.
pub fn select_utxos(
    mut candidates: Vec<SelectedUtxo>,
    target: Amount,
) -> Result<UtxoCoinSelection, Error> {
    candidates.sort_by_key(|utxo| utxo.amount);

    let mut selected_utxos = Vec::new();
    let mut total_selected = Amount::ZERO;

    for utxo in candidates.into_iter().rev() {
        if total_selected >= target {
            break;
        }

        total_selected += utxo.amount;
        selected_utxos.push(utxo);
    }

    if total_selected < target {
        return Err(Error::coin_select(format!(
            "insufficient funds: need {target}, have {total_selected}"
        )));
    }

    Ok(UtxoCoinSelection {
        selected_utxos,
        total_selected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    fn coin(sats: u64, byte: u8) -> VirtualTxOutPoint {
        VirtualTxOutPoint {
            outpoint: OutPoint {
                txid: Txid::from_byte_array([byte; 32]),
                vout: 0,
            },
            expire_at: byte as i64,
            amount: Amount::from_sat(sats),
        }
    }

    const DUST: Amount = Amount::from_sat(546);

    fn check_invariants(selection: &[VirtualTxOutPoint], target: Amount) {
        let total: Amount = selection.iter().map(|c| c.amount).sum();
        assert!(total >= target);

        let change = total - target;
        assert!(
            change == Amount::ZERO || change >= DUST,
            "invalid change: {change}"
        );

        // No redundant coin: removing any selected coin breaks the constraints.
        for skip in 0..selection.len() {
            let rest: Amount = selection
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, c)| c.amount)
                .sum();

            let still_valid =
                rest >= target && (rest - target == Amount::ZERO || rest - target >= DUST);
            assert!(!still_valid, "coin {skip} is redundant");
        }
    }

    #[test]
    fn prefers_single_exact_coin() {
        let candidates = vec![coin(5_000, 1), coin(10_000, 2), coin(20_000, 3)];

        let selection =
            select_vtxos(candidates, Amount::from_sat(10_000), DUST, false).unwrap();

        assert_eq!(selection.len(), 1);
        assert_eq!(selection[0].amount, Amount::from_sat(10_000));
    }

    #[test]
    fn prefers_smallest_covering_coin() {
        let candidates = vec![coin(50_000, 1), coin(20_000, 2), coin(100_000, 3)];

        let target = Amount::from_sat(15_000);
        let selection = select_vtxos(candidates, target, DUST, false).unwrap();

        assert_eq!(selection.len(), 1);
        assert_eq!(selection[0].amount, Amount::from_sat(20_000));
        check_invariants(&selection, target);
    }

    #[test]
    fn accumulates_small_coins() {
        let candidates = vec![coin(4_000, 1), coin(3_000, 2), coin(2_000, 3)];

        let target = Amount::from_sat(8_000);
        let selection = select_vtxos(candidates, target, DUST, false).unwrap();

        check_invariants(&selection, target);
    }

    #[test]
    fn rejects_insufficient_funds() {
        let candidates = vec![coin(4_000, 1), coin(3_000, 2)];

        assert!(select_vtxos(candidates, Amount::from_sat(8_000), DUST, false).is_err());
    }

    #[test]
    fn avoids_sub_dust_change() {
        // 10_100 - 10_000 = 100 < dust, so a single coin will not do; both coins give change
        // of 5_100 which is fine.
        let candidates = vec![coin(10_100, 1), coin(5_000, 2)];

        let target = Amount::from_sat(10_000);
        let selection = select_vtxos(candidates, target, DUST, false).unwrap();

        check_invariants(&selection, target);
        assert_eq!(selection.len(), 2);
    }

    #[test]
    fn sub_dust_change_with_no_way_out_is_an_error() {
        let candidates = vec![coin(10_100, 1)];

        assert!(select_vtxos(candidates, Amount::from_sat(10_000), DUST, false).is_err());
    }

    #[test]
    fn expiring_coins_are_preferred() {
        let mut expiring = coin(4_000, 1);
        expiring.expire_at = 1;
        let mut fresh = coin(4_000, 2);
        fresh.expire_at = 100;

        let target = Amount::from_sat(6_000);
        let selection =
            select_vtxos(vec![fresh, expiring], target, DUST, true).unwrap();

        check_invariants(&selection, target);
        assert_eq!(selection[0].expire_at, 1);
    }

    #[test]
    fn zero_target_is_rejected() {
        assert!(select_vtxos(vec![coin(1_000, 1)], Amount::ZERO, DUST, false).is_err());
    }

    #[test]
    fn utxo_selection_accumulates() {
        let utxos = vec![
            SelectedUtxo {
                outpoint: OutPoint {
                    txid: Txid::from_byte_array([1; 32]),
                    vout: 0,
                },
                amount: Amount::from_sat(30_000),
            },
            SelectedUtxo {
                outpoint: OutPoint {
                    txid: Txid::from_byte_array([2; 32]),
                    vout: 0,
                },
                amount: Amount::from_sat(20_000),
            },
        ];

        let selection = select_utxos(utxos, Amount::from_sat(40_000)).unwrap();
        assert_eq!(selection.selected_utxos.len(), 2);
        assert_eq!(selection.total_selected, Amount::from_sat(50_000));
    }
}
