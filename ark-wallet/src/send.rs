//! Sending bitcoin, off-chain when possible and on-chain otherwise.

use crate::error::ErrorContext;
use crate::utils::timeout_op;
use crate::ContractRepository;
use crate::Error;
use crate::Explorer;
use crate::Identity;
use crate::ServerClient;
use crate::Wallet;
use crate::WalletRepository;
use ark_wallet_core::coin_select;
use ark_wallet_core::coin_select::select_vtxos;
use ark_wallet_core::send;
use ark_wallet_core::send::build_offchain_transactions;
use ark_wallet_core::send::sign_ark_transaction;
use ark_wallet_core::send::sign_checkpoint_transaction;
use ark_wallet_core::send::OffchainTransactions;
use ark_wallet_core::ArkAddress;
use ark_wallet_core::ErrorContext as _;
use bitcoin::absolute::LockTime;
use bitcoin::psbt;
use bitcoin::secp256k1;
use bitcoin::secp256k1::schnorr;
use bitcoin::transaction;
use bitcoin::Address;
use bitcoin::Amount;
use bitcoin::FeeRate;
use bitcoin::Psbt;
use bitcoin::Sequence;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxOut;
use bitcoin::Txid;
use bitcoin::XOnlyPublicKey;
use std::str::FromStr;

/// The result of [`Wallet::send_bitcoin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentTransaction {
    /// An off-chain Ark transaction.
    Ark(Txid),
    /// A plain on-chain transaction.
    Onchain(Txid),
}

impl SentTransaction {
    pub fn txid(&self) -> Txid {
        match self {
            SentTransaction::Ark(txid) | SentTransaction::Onchain(txid) => *txid,
        }
    }
}

impl<S, E, W, C, I> Wallet<S, E, W, C, I>
where
    S: ServerClient + 'static,
    E: Explorer,
    W: WalletRepository,
    C: ContractRepository,
    I: Identity,
{
    /// Send `amount` to `address`.
    ///
    /// An Ark address is paid with an off-chain Ark transaction; a regular bitcoin address is
    /// paid with an on-chain transaction spending the wallet's plain P2TR UTXOs.
    pub async fn send_bitcoin(
        &self,
        address: &str,
        amount: Amount,
        fee_rate: Option<FeeRate>,
    ) -> Result<SentTransaction, Error> {
        if amount == Amount::ZERO {
            return Err(Error::ad_hoc("cannot send zero amount"));
        }

        if let Ok(ark_address) = ArkAddress::decode(address) {
            let txid = self.send_offchain(ark_address, amount).await?;
            return Ok(SentTransaction::Ark(txid));
        }

        let address = Address::from_str(address)
            .map_err(Error::ad_hoc)
            .and_then(|address| {
                address
                    .require_network(self.server_info.network)
                    .map_err(Error::ad_hoc)
            })
            .context("invalid address")?;

        let txid = self.send_onchain(address, amount, fee_rate).await?;

        Ok(SentTransaction::Onchain(txid))
    }

    /// Spend VTXOs in an off-chain Ark transaction sending `amount` to `address`.
    pub async fn send_offchain(
        &self,
        address: ArkAddress,
        amount: Amount,
    ) -> Result<Txid, Error> {
        let (vtxo_list, vtxo_script) = self.list_vtxos().await?;

        let candidates = vtxo_list
            .spendable_offchain()
            .map(|vtxo| coin_select::VirtualTxOutPoint {
                outpoint: vtxo.outpoint,
                expire_at: vtxo.expires_at,
                amount: vtxo.amount,
            })
            .collect::<Vec<_>>();

        let selected_coins =
            select_vtxos(candidates, amount, self.server_info.dust, true).map_err(Error::from)?;

        let vtxo_inputs = selected_coins
            .into_iter()
            .map(|coin| {
                let (forfeit_script, control_block) = vtxo_script
                    .forfeit_spend_info()
                    .context("failed to get forfeit spend info")?;

                Ok(send::VtxoTxInput::new(
                    forfeit_script,
                    None,
                    control_block,
                    vtxo_script.tapscripts(),
                    vtxo_script.script_pubkey(),
                    coin.amount,
                    coin.outpoint,
                ))
            })
            .collect::<Result<Vec<_>, ark_wallet_core::Error>>()?;

        let (change_address, _) = self.get_offchain_address()?;

        let OffchainTransactions {
            mut ark_tx,
            checkpoint_txs,
        } = build_offchain_transactions(
            &[(&address, amount)],
            Some(&change_address),
            &vtxo_inputs,
            None,
            &self.server_info,
        )
        .map_err(Error::from)
        .context("failed to build offchain transactions")?;

        let sign_fn = |_: &mut psbt::Input,
                       msg: secp256k1::Message|
         -> Result<(schnorr::Signature, XOnlyPublicKey), ark_wallet_core::Error> {
            let sig = self
                .identity()
                .sign_message(&msg)
                .map_err(|e| ark_wallet_core::Error::ad_hoc(e.to_string()))?;

            Ok((sig, self.identity().x_only_public_key()))
        };

        let checkpoint_outputs = checkpoint_txs
            .iter()
            .map(|checkpoint| (checkpoint.output.clone(), checkpoint.outpoint))
            .collect::<Vec<_>>();

        for i in 0..checkpoint_txs.len() {
            sign_ark_transaction(sign_fn, &mut ark_tx, &checkpoint_outputs, i)?;
        }

        let ark_txid = ark_tx.unsigned_tx.compute_txid();

        let mut res = timeout_op(
            self.timeout(),
            self.server().submit_tx(
                ark_tx,
                checkpoint_txs
                    .iter()
                    .map(|checkpoint| checkpoint.psbt.clone())
                    .collect(),
            ),
        )
        .await
        .context("failed to submit offchain transactions")??;

        // The server countersigned our checkpoints; now we countersign its copies and return
        // them to finalize the transfer.
        for (checkpoint_psbt, checkpoint) in res
            .signed_checkpoint_txs
            .iter_mut()
            .zip(checkpoint_txs.iter())
        {
            sign_checkpoint_transaction(sign_fn, checkpoint_psbt, &checkpoint.vtxo_input)?;
        }

        timeout_op(
            self.timeout(),
            self.server()
                .finalize_tx(ark_txid, res.signed_checkpoint_txs),
        )
        .await
        .context("failed to finalize offchain transaction")??;

        tracing::info!(%ark_txid, %address, %amount, "Sent offchain payment");

        Ok(ark_txid)
    }

    /// Spend the wallet's plain P2TR UTXOs in an on-chain transaction.
    async fn send_onchain(
        &self,
        address: Address,
        amount: Amount,
        fee_rate: Option<FeeRate>,
    ) -> Result<Txid, Error> {
        let fee_rate = match fee_rate {
            Some(fee_rate) => fee_rate,
            None => timeout_op(self.timeout(), self.explorer().get_fee_rate())
                .await
                .context("failed to get fee rate")??,
        };

        let onchain_address = self.get_onchain_address();

        let utxos = timeout_op(
            self.timeout(),
            self.explorer().find_outpoints(&onchain_address),
        )
        .await
        .context("failed to find on-chain UTXOs")??;

        let candidates = utxos
            .into_iter()
            .filter(|utxo| !utxo.is_spent)
            .map(|utxo| coin_select::SelectedUtxo {
                outpoint: utxo.outpoint,
                amount: utxo.amount,
            })
            .collect::<Vec<_>>();

        // Key-spend P2TR inputs weigh ~57.5 vbytes, P2TR outputs 43; add some headroom for the
        // transaction frame.
        let estimate_fee = |n_inputs: u64| -> Amount {
            let vbytes = 11 + 58 * n_inputs + 43 * 2;
            fee_rate
                .checked_mul_by_weight(bitcoin::Weight::from_vb_unwrap(vbytes))
                .unwrap_or(Amount::MAX)
        };

        // One extra iteration in case covering the fee needs one more input.
        let mut selection =
            coin_select::select_utxos(candidates.clone(), amount).map_err(Error::from)?;

        let mut fee = estimate_fee(selection.selected_utxos.len() as u64);
        if selection.total_selected < amount + fee {
            selection =
                coin_select::select_utxos(candidates, amount + fee).map_err(Error::from)?;
            fee = estimate_fee(selection.selected_utxos.len() as u64);
        }

        let change_amount = selection
            .total_selected
            .checked_sub(amount + fee)
            .ok_or_else(|| Error::coin_select("cannot cover amount plus fee"))?;

        let mut outputs = vec![TxOut {
            value: amount,
            script_pubkey: address.script_pubkey(),
        }];

        if change_amount > Amount::ZERO {
            outputs.push(TxOut {
                value: change_amount,
                script_pubkey: onchain_address.script_pubkey(),
            });
        }

        let unsigned_tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: selection
                .selected_utxos
                .iter()
                .map(|utxo| TxIn {
                    previous_output: utxo.outpoint,
                    script_sig: Default::default(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Default::default(),
                })
                .collect(),
            output: outputs,
        };

        let mut psbt = Psbt::from_unsigned_tx(unsigned_tx)
            .map_err(Error::ad_hoc)
            .context("failed to build on-chain PSBT")?;

        for (psbt_input, utxo) in psbt.inputs.iter_mut().zip(selection.selected_utxos.iter()) {
            psbt_input.witness_utxo = Some(TxOut {
                value: utxo.amount,
                script_pubkey: onchain_address.script_pubkey(),
            });
        }

        self.identity().sign(&mut psbt, None)?;

        let mut tx = psbt.unsigned_tx.clone();
        for (tx_input, psbt_input) in tx.input.iter_mut().zip(psbt.inputs.iter()) {
            let signature = psbt_input
                .tap_key_sig
                .ok_or_else(|| Error::ad_hoc("unsigned on-chain input"))?;

            tx_input.witness = bitcoin::Witness::p2tr_key_spend(&signature);
        }

        let txid = timeout_op(self.timeout(), self.explorer().broadcast(&tx))
            .await
            .context("failed to broadcast transaction")??;

        tracing::info!(%txid, %address, %amount, %fee, "Sent on-chain payment");

        Ok(txid)
    }
}
