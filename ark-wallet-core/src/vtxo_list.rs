use crate::server::VirtualTxOutPoint;
use crate::ExplorerUtxo;
use crate::VtxoScript;
use bitcoin::ScriptBuf;
use std::collections::HashMap;
use std::time::Duration;

/// The VTXOs of a wallet, partitioned by state.
#[derive(Clone, Debug, Default)]
pub struct VtxoList {
    // Unspent
    pre_confirmed: Vec<VirtualTxOutPoint>,
    confirmed: Vec<VirtualTxOutPoint>,
    recoverable: Vec<VirtualTxOutPoint>,

    // Spent
    spent: Vec<VirtualTxOutPoint>,
}

impl VtxoList {
    pub fn new(virtual_tx_outpoints: Vec<VirtualTxOutPoint>) -> Self {
        let mut pre_confirmed = Vec::new();
        let mut confirmed = Vec::new();
        let mut recoverable = Vec::new();
        let mut spent = Vec::new();

        for virtual_tx_outpoint in virtual_tx_outpoints {
            if virtual_tx_outpoint.is_recoverable() {
                recoverable.push(virtual_tx_outpoint);
            } else if virtual_tx_outpoint.is_unrolled
                || virtual_tx_outpoint.is_spent
                || virtual_tx_outpoint.is_swept
            {
                spent.push(virtual_tx_outpoint);
            } else if virtual_tx_outpoint.is_preconfirmed {
                pre_confirmed.push(virtual_tx_outpoint);
            } else {
                confirmed.push(virtual_tx_outpoint);
            }
        }

        VtxoList {
            pre_confirmed,
            confirmed,
            recoverable,
            spent,
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &VirtualTxOutPoint> {
        self.all_unspent().chain(self.spent())
    }

    pub fn all_unspent(&self) -> impl Iterator<Item = &VirtualTxOutPoint> {
        self.pre_confirmed
            .iter()
            .chain(self.confirmed.iter())
            .chain(self.recoverable.iter())
    }

    /// VTXOs that can be spent in an offchain transaction.
    ///
    /// Recoverable VTXOs cannot be spent directly; they can only be settled.
    pub fn spendable_offchain(&self) -> impl Iterator<Item = &VirtualTxOutPoint> {
        self.pre_confirmed.iter().chain(self.confirmed.iter())
    }

    pub fn pre_confirmed(&self) -> impl Iterator<Item = &VirtualTxOutPoint> {
        self.pre_confirmed.iter()
    }

    pub fn confirmed(&self) -> impl Iterator<Item = &VirtualTxOutPoint> {
        self.confirmed.iter()
    }

    pub fn recoverable(&self) -> impl Iterator<Item = &VirtualTxOutPoint> {
        self.recoverable.iter()
    }

    pub fn spent(&self) -> impl Iterator<Item = &VirtualTxOutPoint> {
        self.spent.iter()
    }

    /// VTXOs that are already on-chain and whose exit path is active.
    pub fn exit_ready(
        &self,
        now: Duration,
        // Every VTXO in `vtxo_scripts` which has been found on the blockchain.
        explorer_utxos: Vec<ExplorerUtxo>,
        vtxo_scripts: HashMap<ScriptBuf, VtxoScript>,
    ) -> impl Iterator<Item = &VirtualTxOutPoint> {
        self.all_unspent().filter(move |v| {
            match explorer_utxos
                .iter()
                .find(|explorer_utxo| explorer_utxo.outpoint == v.outpoint)
            {
                Some(ExplorerUtxo {
                    confirmation_blocktime: Some(confirmation_blocktime),
                    ..
                }) => match vtxo_scripts.get(&v.script) {
                    Some(vtxo) => vtxo.can_be_claimed_unilaterally_by_owner(
                        now,
                        Duration::from_secs(*confirmation_blocktime),
                    ),
                    None => false,
                },
                _ => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Amount;
    use bitcoin::OutPoint;
    use bitcoin::Txid;

    fn vtxo(byte: u8) -> VirtualTxOutPoint {
        VirtualTxOutPoint {
            outpoint: OutPoint {
                txid: Txid::from_byte_array([byte; 32]),
                vout: 0,
            },
            created_at: 0,
            expires_at: 0,
            amount: Amount::from_sat(1000),
            script: ScriptBuf::new(),
            is_preconfirmed: false,
            is_swept: false,
            is_unrolled: false,
            is_spent: false,
            spent_by: None,
            commitment_txids: vec![],
            settled_by: None,
            ark_txid: None,
        }
    }

    #[test]
    fn partitioning() {
        let confirmed = vtxo(1);

        let mut pre_confirmed = vtxo(2);
        pre_confirmed.is_preconfirmed = true;

        let mut recoverable = vtxo(3);
        recoverable.is_swept = true;

        let mut spent = vtxo(4);
        spent.is_spent = true;

        let list = VtxoList::new(vec![confirmed, pre_confirmed, recoverable, spent]);

        assert_eq!(list.confirmed().count(), 1);
        assert_eq!(list.pre_confirmed().count(), 1);
        assert_eq!(list.recoverable().count(), 1);
        assert_eq!(list.spent().count(), 1);

        assert_eq!(list.all_unspent().count(), 3);
        assert_eq!(list.spendable_offchain().count(), 2);
        assert_eq!(list.all().count(), 4);
    }

    #[test]
    fn swept_and_spent_is_not_recoverable() {
        let mut vtxo = vtxo(1);
        vtxo.is_swept = true;
        vtxo.is_spent = true;

        let list = VtxoList::new(vec![vtxo]);

        assert_eq!(list.recoverable().count(), 0);
        assert_eq!(list.spent().count(), 1);
    }
}
