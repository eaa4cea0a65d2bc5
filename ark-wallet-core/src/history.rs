//! Derivation of a user-visible transaction history from the raw VTXO set.
//!
//! The server only reports VTXOs. Incoming payments, outgoing payments, settlements and
//! offboards are reconstructed by netting VTXO flows per transaction.

use crate::server::VirtualTxOutPoint;
use crate::Error;
use bitcoin::Amount;
use bitcoin::OutPoint;
use bitcoin::SignedAmount;
use bitcoin::Txid;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Transaction {
    /// A transaction that transforms a UTXO into a boarding output.
    Boarding {
        txid: Txid,
        /// Always incoming.
        amount: Amount,
        confirmed_at: Option<i64>,
    },
    /// A commitment transaction that confirms VTXOs of ours.
    Commitment {
        txid: Txid,
        /// May be incoming or outgoing.
        amount: SignedAmount,
        created_at: i64,
    },
    /// An off-chain transaction with VTXOs of ours as outputs.
    Ark {
        txid: Txid,
        amount: SignedAmount,
        /// An Ark transaction is settled once our outputs in it have been spent.
        is_settled: bool,
        created_at: i64,
    },
    /// A settlement whose outputs went on-chain.
    Offboard {
        /// The commitment TXID that settles the VTXOs.
        commitment_txid: Txid,
        /// Always outgoing.
        amount: Amount,
        confirmed_at: Option<i64>,
    },
}

impl Transaction {
    pub fn created_at(&self) -> Option<i64> {
        match self {
            Transaction::Boarding { confirmed_at, .. }
            | Transaction::Offboard { confirmed_at, .. } => *confirmed_at,
            Transaction::Commitment { created_at, .. } | Transaction::Ark { created_at, .. } => {
                Some(*created_at)
            }
        }
    }

    pub fn txid(&self) -> Txid {
        match self {
            Transaction::Boarding { txid, .. }
            | Transaction::Commitment { txid, .. }
            | Transaction::Ark { txid, .. } => *txid,
            Transaction::Offboard {
                commitment_txid, ..
            } => *commitment_txid,
        }
    }
}

/// Sort descending by creation time; pending transactions (no creation time) first.
pub fn sort_transactions_by_created_at(txs: &mut [Transaction]) {
    txs.sort_by(|a, b| match (a.created_at(), b.created_at()) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(a_time), Some(b_time)) => b_time.cmp(&a_time),
    });
}

/// Generate the transactions in which we receive VTXOs.
///
/// Settlements and change are netted out: only transactions with a positive net inflow count
/// as incoming.
pub fn generate_incoming_vtxo_transaction_history(
    spent_vtxos: &[VirtualTxOutPoint],
    spendable_vtxos: &[VirtualTxOutPoint],
    // Commitment transactions which take a boarding output of ours as an input.
    boarding_commitment_txs: &[Txid],
) -> Result<Vec<Transaction>, Error> {
    let mut txs = Vec::new();

    let all_vtxos = spent_vtxos.iter().chain(spendable_vtxos.iter());

    let mut spent_vtxos_left_to_check = spent_vtxos.to_vec();

    for vtxo in all_vtxos {
        if vtxo.commitment_txids.is_empty() {
            return Err(Error::ad_hoc(format!(
                "VTXO {} has no commitment TXID",
                vtxo.outpoint
            )));
        }

        // The confirmed settlement of a boarding output is already covered by the boarding
        // transaction itself.
        if !vtxo.is_preconfirmed && boarding_commitment_txs.contains(&vtxo.commitment_txids[0]) {
            continue;
        }

        // How much we spent in the transaction that produced this VTXO.
        let spent_amount = {
            let mut spent_amount = Amount::ZERO;
            let mut remaining_spent_vtxos = Vec::new();
            for spent_vtxo in spent_vtxos_left_to_check.iter() {
                let belongs = if vtxo.is_preconfirmed {
                    spent_vtxo.ark_txid == Some(vtxo.outpoint.txid)
                } else {
                    spent_vtxo.settled_by == Some(vtxo.commitment_txids[0])
                };

                if belongs {
                    spent_amount += spent_vtxo.amount;
                } else {
                    remaining_spent_vtxos.push(spent_vtxo.clone());
                }
            }

            spent_vtxos_left_to_check = remaining_spent_vtxos;

            spent_amount
        };

        let receive_amount = vtxo.amount.to_signed().map_err(Error::ad_hoc)?;
        let spent_amount = spent_amount.to_signed().map_err(Error::ad_hoc)?;

        let net_amount = receive_amount - spent_amount;

        // Zero net amount is a self-payment or a settlement; negative is a change VTXO.
        // Neither deserves an incoming entry.
        if !net_amount.is_positive() {
            continue;
        }

        if vtxo.is_preconfirmed {
            txs.push(Transaction::Ark {
                txid: vtxo.outpoint.txid,
                amount: net_amount,
                is_settled: vtxo.spent_by.is_some() ||
                    // To include settled dust outputs too!
                    vtxo.settled_by.is_some(),
                created_at: vtxo.created_at,
            })
        } else {
            txs.push(Transaction::Commitment {
                txid: vtxo.outpoint.txid,
                amount: receive_amount,
                created_at: vtxo.created_at,
            })
        }
    }

    Ok(txs)
}

/// An outgoing transaction, possibly missing data that the caller must supply.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OutgoingTransaction {
    Complete(Transaction),
    /// Needs a foreign [`VirtualTxOutPoint`] (the receiver's VTXO) to be completed.
    Incomplete(IncompleteOutgoingTransaction),
    /// Needs confirmation data from the block explorer to be completed.
    IncompleteOffboard(IncompleteOffboardTransaction),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IncompleteOutgoingTransaction {
    first_outpoint: OutPoint,
    net_amount: SignedAmount,
}

impl IncompleteOutgoingTransaction {
    /// Any outpoint of the outgoing transaction; used to look up the corresponding
    /// [`VirtualTxOutPoint`] at the server.
    pub fn first_outpoint(&self) -> OutPoint {
        self.first_outpoint
    }

    pub fn finish(self, virtual_tx_outpoint: &VirtualTxOutPoint) -> Result<Transaction, Error> {
        if self.first_outpoint.txid != virtual_tx_outpoint.outpoint.txid {
            return Err(Error::ad_hoc(format!(
                "cannot finish outgoing transaction with unrelated virtual TX outpoint: \
                 expected {}, got {}",
                self.first_outpoint.txid, virtual_tx_outpoint.outpoint.txid
            )));
        }

        Ok(build_outgoing_transaction(
            virtual_tx_outpoint,
            self.net_amount,
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IncompleteOffboardTransaction {
    commitment_txid: Txid,
    amount: Amount,
}

impl IncompleteOffboardTransaction {
    /// Use this value to query the block explorer for confirmation data.
    pub fn commitment_txid(&self) -> Txid {
        self.commitment_txid
    }

    pub fn finish(self, confirmed_at: Option<i64>) -> Transaction {
        Transaction::Offboard {
            commitment_txid: self.commitment_txid,
            amount: self.amount,
            confirmed_at,
        }
    }
}

/// Generate the list of outgoing transactions: off-chain payments and offboards.
///
/// Pure settlements (VTXO refreshes with no net outflow) are excluded.
pub fn generate_outgoing_vtxo_transaction_history(
    spent_vtxos: &[VirtualTxOutPoint],
    spendable_vtxos: &[VirtualTxOutPoint],
) -> Result<Vec<OutgoingTransaction>, Error> {
    let all_vtxos = [spent_vtxos, spendable_vtxos].concat();

    // Transactions in which one or more VTXOs of ours are spent.
    let mut vtxos_by_spent_by = HashMap::<Txid, Vec<VirtualTxOutPoint>>::new();
    // VTXOs that are settled (forfeited) by a commitment transaction.
    let mut vtxos_by_settled_by = HashMap::<Txid, Vec<VirtualTxOutPoint>>::new();

    for spent_vtxo in spent_vtxos.iter() {
        if let Some(settled_by) = spent_vtxo.settled_by {
            match vtxos_by_settled_by.entry(settled_by) {
                Entry::Occupied(mut occupied_entry) => {
                    occupied_entry.get_mut().push(spent_vtxo.clone());
                }
                Entry::Vacant(e) => {
                    e.insert(vec![spent_vtxo.clone()]);
                }
            }
        } else if spent_vtxo.spent_by.is_some() {
            if let Some(ark_txid) = spent_vtxo.ark_txid {
                match vtxos_by_spent_by.entry(ark_txid) {
                    Entry::Occupied(mut occupied_entry) => {
                        occupied_entry.get_mut().push(spent_vtxo.clone());
                    }
                    Entry::Vacant(e) => {
                        e.insert(vec![spent_vtxo.clone()]);
                    }
                }
            }
        }
    }

    let mut outgoing_txs = Vec::new();

    // Regular outgoing Ark transactions.
    for (spend_txid, spent_vtxos) in vtxos_by_spent_by.iter() {
        let spent_amount = spent_vtxos
            .iter()
            .fold(Amount::ZERO, |acc, x| acc + x.amount)
            .to_signed()
            .map_err(Error::ad_hoc)?;

        let produced_virtual_tx_outpoints = all_vtxos
            .iter()
            .filter(|v| v.outpoint.txid == *spend_txid)
            .collect::<Vec<_>>();

        let produced_amount = produced_virtual_tx_outpoints
            .iter()
            .fold(Amount::ZERO, |acc, x| acc + x.amount)
            .to_signed()
            .map_err(Error::ad_hoc)?;

        let net_amount = produced_amount - spent_amount;

        if !net_amount.is_negative() {
            // Ignore settlements and self-payments.
            continue;
        }

        let tx = match produced_virtual_tx_outpoints.first() {
            // With a change VTXO of ours we have everything we need.
            Some(virtual_tx_change_outpoint) => OutgoingTransaction::Complete(
                build_outgoing_transaction(virtual_tx_change_outpoint, net_amount),
            ),
            // Without change, a foreign VTXO of the same transaction must be fetched.
            None => OutgoingTransaction::Incomplete(IncompleteOutgoingTransaction {
                first_outpoint: OutPoint {
                    txid: *spend_txid,
                    vout: 0,
                },
                net_amount,
            }),
        };

        outgoing_txs.push(tx);
    }

    // Settlements: a net outflow means some value left the off-chain system (offboard).
    for (commitment_txid, settled_vtxos) in vtxos_by_settled_by.iter() {
        let input_amount = settled_vtxos
            .iter()
            .fold(Amount::ZERO, |acc, x| acc + x.amount)
            .to_signed()
            .map_err(Error::ad_hoc)?;

        let produced_vtxos = all_vtxos
            .iter()
            .filter(|v| v.commitment_txids.contains(commitment_txid))
            .collect::<Vec<_>>();

        let output_amount = produced_vtxos
            .iter()
            .fold(Amount::ZERO, |acc, x| acc + x.amount)
            .to_signed()
            .map_err(Error::ad_hoc)?;

        let offboarded_amount = input_amount - output_amount;

        if offboarded_amount.is_positive() {
            outgoing_txs.push(OutgoingTransaction::IncompleteOffboard(
                IncompleteOffboardTransaction {
                    commitment_txid: *commitment_txid,
                    amount: offboarded_amount.to_unsigned().map_err(Error::ad_hoc)?,
                },
            ));
        }
        // Otherwise it's a pure settlement (refresh).
    }

    Ok(outgoing_txs)
}

fn build_outgoing_transaction(
    vtxo_outpoint: &VirtualTxOutPoint,
    // Negative: coins received minus coins sent.
    net_amount: SignedAmount,
) -> Transaction {
    let created_at = vtxo_outpoint.created_at;
    match vtxo_outpoint.is_preconfirmed {
        true => Transaction::Ark {
            txid: vtxo_outpoint.outpoint.txid,
            amount: net_amount,
            // The sender always considers an outgoing Ark transaction settled.
            is_settled: true,
            created_at,
        },
        false => Transaction::Commitment {
            txid: vtxo_outpoint.commitment_txids[0],
            amount: net_amount,
            created_at,
        },
    }
}
