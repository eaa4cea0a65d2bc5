//! MuSig2 co-signing of a VTXO tree.
//!
//! Every shared output of the tree is a key-spend path for the MuSig2 aggregate of its
//! cosigners, tweaked with the server's sweep tap-tree root. Signing is a two round-trip
//! protocol: public nonces are exchanged and aggregated first, partial signatures second.

use crate::conversions::from_musig_xonly;
use crate::conversions::to_musig_pk;
use crate::sweep::SweepScript;
use crate::tx_tree::TxTree;
use crate::tx_tree::TxTreeNode;
use crate::Error;
use crate::ErrorContext;
use crate::VTXO_INPUT_INDEX;
use bitcoin::hashes::Hash;
use bitcoin::key::Keypair;
use bitcoin::key::Secp256k1;
use bitcoin::key::TweakedPublicKey;
use bitcoin::secp256k1::PublicKey;
use bitcoin::sighash::Prevouts;
use bitcoin::sighash::SighashCache;
use bitcoin::Amount;
use bitcoin::ScriptBuf;
use bitcoin::TapSighashType;
use bitcoin::TxOut;
use bitcoin::XOnlyPublicKey;
use musig::musig;
use rand::CryptoRng;
use rand::Rng;
use std::io::Cursor;
use std::io::Read;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignerSessionError {
    #[error("cosigner keys already set")]
    KeysAlreadySet,
    #[error("cosigner keys not set")]
    KeysNotSet,
    #[error("own public key not in cosigner set")]
    SelfKeyNotInSet,
    #[error("aggregated nonces already set")]
    NoncesAlreadySet,
    #[error("aggregated nonces not set")]
    NoncesNotSet,
    #[error("nonces not generated")]
    NoncesNotGenerated,
    #[error("secret nonce for node ({0}, {1}) missing or already used")]
    MissingSecretNonce(usize, usize),
    #[error("matrix shape does not match the tree")]
    ShapeMismatch,
}

/// The MuSig2 aggregate of a cosigner set, before and after the Taproot tweak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateKey {
    /// The plain key aggregate, used as the Taproot internal key of shared outputs.
    pub agg_pk: XOnlyPublicKey,
    /// The BIP-341 tweaked output key.
    pub final_pk: XOnlyPublicKey,
}

/// Aggregate an unordered set of cosigner keys, optionally applying the sweep tap-tree tweak.
///
/// Keys are sorted lexicographically before aggregation, so every participant derives the same
/// aggregate regardless of the order in which the keys were delivered.
pub fn aggregate_keys(
    pks: &[PublicKey],
    sweep: Option<&SweepScript>,
) -> Result<AggregateKey, Error> {
    if pks.is_empty() {
        return Err(Error::crypto("cannot aggregate empty key set"));
    }

    let mut pks = pks.to_vec();
    pks.sort_by_key(|k| k.serialize());

    let key_agg_cache = {
        let cosigner_pks = pks.iter().map(|pk| to_musig_pk(*pk)).collect::<Vec<_>>();
        musig::KeyAggCache::new(&cosigner_pks.iter().collect::<Vec<_>>())
    };

    let agg_pk = from_musig_xonly(key_agg_cache.agg_pk());

    let final_pk = match sweep {
        Some(sweep) => {
            let secp = Secp256k1::new();
            sweep.output_key(&secp, agg_pk)?
        }
        None => agg_pk,
    };

    Ok(AggregateKey { agg_pk, final_pk })
}

/// One public nonce per tree node, shaped like the tree itself.
#[derive(Debug, Clone)]
pub struct NoncePks(Vec<Vec<musig::PublicNonce>>);

impl NoncePks {
    pub fn get(&self, level: usize, index: usize) -> Option<musig::PublicNonce> {
        self.0.get(level).and_then(|row| row.get(index)).copied()
    }

    pub fn encode_hex(&self) -> String {
        encode_matrix_hex(&self.0, |nonce| nonce.serialize().to_vec())
    }

    pub fn decode_hex(s: &str) -> Result<Self, Error> {
        decode_matrix_hex(s, 66, |bytes| {
            let bytes: [u8; 66] = bytes.try_into().expect("exact length");
            musig::PublicNonce::from_byte_array(&bytes).map_err(Error::crypto)
        })
        .map(Self)
    }
}

/// One aggregated (combined) nonce per tree node.
#[derive(Debug, Clone)]
pub struct AggregatedNonces(pub Vec<Vec<musig::AggregatedNonce>>);

impl AggregatedNonces {
    pub fn encode_hex(&self) -> String {
        encode_matrix_hex(&self.0, |nonce| nonce.serialize().to_vec())
    }

    pub fn decode_hex(s: &str) -> Result<Self, Error> {
        decode_matrix_hex(s, 66, |bytes| {
            let bytes: [u8; 66] = bytes.try_into().expect("exact length");
            musig::AggregatedNonce::from_byte_array(&bytes).map_err(Error::crypto)
        })
        .map(Self)
    }
}

/// One MuSig2 partial signature per tree node.
#[derive(Debug, Clone)]
pub struct PartialSigTree(pub Vec<Vec<musig::PartialSignature>>);

impl PartialSigTree {
    pub fn encode_hex(&self) -> String {
        encode_matrix_hex(&self.0, |sig| sig.serialize().to_vec())
    }

    pub fn decode_hex(s: &str) -> Result<Self, Error> {
        decode_matrix_hex(s, 32, |bytes| {
            let bytes: [u8; 32] = bytes.try_into().expect("exact length");
            musig::PartialSignature::from_byte_array(&bytes).map_err(Error::crypto)
        })
        .map(Self)
    }
}

/// Combine the public nonces of all cosigners, node by node.
pub fn aggregate_nonces(per_cosigner: &[NoncePks]) -> Result<AggregatedNonces, Error> {
    let first = per_cosigner
        .first()
        .ok_or_else(|| Error::crypto("no nonces to aggregate"))?;

    let mut aggregated = Vec::with_capacity(first.0.len());

    for (level, row) in first.0.iter().enumerate() {
        let mut aggregated_row = Vec::with_capacity(row.len());

        for index in 0..row.len() {
            let nonces = per_cosigner
                .iter()
                .map(|nonce_pks| {
                    nonce_pks
                        .get(level, index)
                        .ok_or_else(|| Error::from(SignerSessionError::ShapeMismatch))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let nonce_refs = nonces.iter().collect::<Vec<_>>();
            aggregated_row.push(musig::AggregatedNonce::new(&nonce_refs));
        }

        aggregated.push(aggregated_row);
    }

    Ok(AggregatedNonces(aggregated))
}

/// A single-use signing session over a whole tree.
///
/// The session is strictly ordered: `set_keys`, `get_nonces`, `set_aggregated_nonces`, `sign`.
/// Secret nonces live in memory only and are consumed by `sign`; dropping the session drops any
/// that remain, so an aborted session can never reuse a nonce.
pub struct TreeSignerSession {
    own_keypair: Keypair,
    tree: TxTree,
    sweep: SweepScript,
    /// The amount of the commitment transaction output spent by the root.
    shared_output_amount: Amount,
    cosigner_pks: Option<Vec<PublicKey>>,
    pub_nonces: Option<NoncePks>,
    secret_nonces: Option<Vec<Vec<Option<musig::SecretNonce>>>>,
    agg_nonces: Option<AggregatedNonces>,
}

impl TreeSignerSession {
    pub fn new(
        own_keypair: Keypair,
        tree: TxTree,
        sweep: SweepScript,
        shared_output_amount: Amount,
    ) -> Self {
        Self {
            own_keypair,
            tree,
            sweep,
            shared_output_amount,
            cosigner_pks: None,
            pub_nonces: None,
            secret_nonces: None,
            agg_nonces: None,
        }
    }

    pub fn own_pk(&self) -> PublicKey {
        self.own_keypair.public_key()
    }

    /// Set the cosigner set shared by all tree nodes. One-shot.
    pub fn set_keys(&mut self, cosigner_pks: Vec<PublicKey>) -> Result<(), SignerSessionError> {
        if self.cosigner_pks.is_some() {
            return Err(SignerSessionError::KeysAlreadySet);
        }

        if !cosigner_pks.contains(&self.own_pk()) {
            return Err(SignerSessionError::SelfKeyNotInSet);
        }

        let mut cosigner_pks = cosigner_pks;
        cosigner_pks.sort_by_key(|k| k.serialize());

        self.cosigner_pks = Some(cosigner_pks);

        Ok(())
    }

    /// Generate one nonce pair per tree node.
    ///
    /// Calling this again before `sign` returns the same public nonces, so a submission can be
    /// retried without generating (and leaking) fresh nonces.
    pub fn get_nonces<R>(&mut self, rng: &mut R) -> Result<NoncePks, Error>
    where
        R: Rng + CryptoRng,
    {
        if let Some(pub_nonces) = &self.pub_nonces {
            return Ok(pub_nonces.clone());
        }

        let cosigner_pks = self
            .cosigner_pks
            .as_ref()
            .ok_or(SignerSessionError::KeysNotSet)?;

        let key_agg_cache = {
            let pks = cosigner_pks
                .iter()
                .map(|pk| to_musig_pk(*pk))
                .collect::<Vec<_>>();
            musig::KeyAggCache::new(&pks.iter().collect::<Vec<_>>())
        };

        let root_prevout = self.root_prevout()?;

        let mut pub_nonces = Vec::new();
        let mut secret_nonces = Vec::new();

        for level in self.tree.levels().iter() {
            let mut pub_row = Vec::with_capacity(level.len());
            let mut secret_row = Vec::with_capacity(level.len());

            for node in level {
                let msg = tree_tx_sighash(&self.tree, node, &root_prevout)?;

                let session_id = musig::SessionSecretRand::assume_unique_per_nonce_gen(rng.r#gen());
                let extra_rand: [u8; 32] = rng.r#gen();

                let (secret_nonce, pub_nonce) = key_agg_cache.nonce_gen(
                    session_id,
                    to_musig_pk(self.own_pk()),
                    &msg,
                    Some(extra_rand),
                );

                pub_row.push(pub_nonce);
                secret_row.push(Some(secret_nonce));
            }

            pub_nonces.push(pub_row);
            secret_nonces.push(secret_row);
        }

        let pub_nonces = NoncePks(pub_nonces);

        self.pub_nonces = Some(pub_nonces.clone());
        self.secret_nonces = Some(secret_nonces);

        Ok(pub_nonces)
    }

    /// Set the aggregated nonces produced by the server. One-shot.
    pub fn set_aggregated_nonces(
        &mut self,
        agg_nonces: AggregatedNonces,
    ) -> Result<(), SignerSessionError> {
        if self.agg_nonces.is_some() {
            return Err(SignerSessionError::NoncesAlreadySet);
        }

        let shape_matches = agg_nonces.0.len() == self.tree.levels().len()
            && agg_nonces
                .0
                .iter()
                .zip(self.tree.levels())
                .all(|(row, level)| row.len() == level.len());

        if !shape_matches {
            return Err(SignerSessionError::ShapeMismatch);
        }

        self.agg_nonces = Some(agg_nonces);

        Ok(())
    }

    /// Produce a partial signature for every tree node, consuming the secret nonces.
    pub fn sign(&mut self) -> Result<PartialSigTree, Error> {
        let cosigner_pks = self
            .cosigner_pks
            .as_ref()
            .ok_or(SignerSessionError::KeysNotSet)?;
        let agg_nonces = self
            .agg_nonces
            .as_ref()
            .ok_or(SignerSessionError::NoncesNotSet)?;

        if self.secret_nonces.is_none() {
            return Err(SignerSessionError::NoncesNotGenerated.into());
        }

        let secp = Secp256k1::new();

        let own_keypair =
            ::musig::Keypair::from_seckey_byte_array(self.own_keypair.secret_bytes())
                .map_err(|e| Error::crypto(format!("invalid keypair: {e}")))?;

        // The key aggregation must be tweaked exactly like the shared outputs themselves.
        let mut key_agg_cache = {
            let pks = cosigner_pks
                .iter()
                .map(|pk| to_musig_pk(*pk))
                .collect::<Vec<_>>();
            musig::KeyAggCache::new(&pks.iter().collect::<Vec<_>>())
        };

        let agg_pk = from_musig_xonly(key_agg_cache.agg_pk());
        let sweep_spend_info = self.sweep.sweep_spend_info(&secp, agg_pk)?;

        let tweak = ::musig::Scalar::from(
            ::musig::SecretKey::from_byte_array(*sweep_spend_info.tap_tweak().as_byte_array())
                .map_err(|e| Error::crypto(format!("invalid tweak: {e}")))?,
        );

        key_agg_cache
            .pubkey_xonly_tweak_add(&tweak)
            .map_err(Error::crypto)?;

        let root_prevout = self.root_prevout()?;

        let mut partial_sigs = Vec::new();

        for (level_index, level) in self.tree.levels().iter().enumerate() {
            let mut row = Vec::with_capacity(level.len());

            for (node_index, node) in level.iter().enumerate() {
                tracing::debug!(txid = %node.txid, "Generating partial signature");

                let msg = tree_tx_sighash(&self.tree, node, &root_prevout)?;

                let secret_nonce = self
                    .secret_nonces
                    .as_mut()
                    .expect("checked above")
                    .get_mut(level_index)
                    .and_then(|row| row.get_mut(node_index))
                    .and_then(Option::take)
                    .ok_or(SignerSessionError::MissingSecretNonce(
                        level_index,
                        node_index,
                    ))?;

                let agg_nonce = agg_nonces
                    .0
                    .get(level_index)
                    .and_then(|row| row.get(node_index))
                    .ok_or(SignerSessionError::ShapeMismatch)?;

                let sig = musig::Session::new(&key_agg_cache, *agg_nonce, &msg)
                    .partial_sign(secret_nonce, &own_keypair, &key_agg_cache);

                row.push(sig);
            }

            partial_sigs.push(row);
        }

        Ok(PartialSigTree(partial_sigs))
    }

    fn root_prevout(&self) -> Result<TxOut, Error> {
        let cosigner_pks = self
            .cosigner_pks
            .as_ref()
            .ok_or(SignerSessionError::KeysNotSet)?;

        let aggregate = aggregate_keys(cosigner_pks, Some(&self.sweep))?;

        Ok(TxOut {
            value: self.shared_output_amount,
            script_pubkey: ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(
                aggregate.final_pk,
            )),
        })
    }
}

/// The BIP-341 key-spend sighash of a tree transaction's only input.
fn tree_tx_sighash(
    tree: &TxTree,
    node: &TxTreeNode,
    root_prevout: &TxOut,
) -> Result<[u8; 32], Error> {
    let prevout = node_prevout(tree, node, root_prevout)?;

    let prevouts = [prevout];
    let prevouts = Prevouts::All(&prevouts);

    // Tree outputs are signed with a musig key spend so that the whole cosigner set signs
    // with a single signature.
    let tap_sighash = SighashCache::new(&node.tx.unsigned_tx)
        .taproot_key_spend_signature_hash(VTXO_INPUT_INDEX, &prevouts, TapSighashType::Default)
        .map_err(Error::crypto)?;

    Ok(tap_sighash.to_raw_hash().to_byte_array())
}

fn node_prevout(tree: &TxTree, node: &TxTreeNode, root_prevout: &TxOut) -> Result<TxOut, Error> {
    if node.level == 0 {
        return Ok(root_prevout.clone());
    }

    let spent_outpoint = node.tx.unsigned_tx.input[VTXO_INPUT_INDEX].previous_output;

    let parent = tree.get(&node.parent_txid).ok_or_else(|| {
        Error::crypto(format!(
            "parent transaction {} not found for tree TX {}",
            node.parent_txid, node.txid
        ))
    })?;

    parent
        .tx
        .unsigned_tx
        .output
        .get(spent_outpoint.vout as usize)
        .cloned()
        .ok_or_else(|| {
            Error::crypto(format!(
                "previous output {spent_outpoint} not found for tree TX {}",
                node.txid
            ))
        })
}

/// Verify the final key-spend signature of every node against the recomputed sighash.
pub fn validate_tree_sigs(
    final_pk: XOnlyPublicKey,
    shared_output_amount: Amount,
    tree: &TxTree,
) -> Result<(), Error> {
    let secp = Secp256k1::new();

    let root_prevout = TxOut {
        value: shared_output_amount,
        script_pubkey: ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(
            final_pk,
        )),
    };

    for node in tree.iter() {
        let sig = node.tx.inputs[VTXO_INPUT_INDEX]
            .tap_key_sig
            .ok_or_else(|| Error::crypto(format!("node {} is unsigned", node.txid)))?;

        let prevout = node_prevout(tree, node, &root_prevout)?;

        let output_key = XOnlyPublicKey::from_slice(&prevout.script_pubkey.as_bytes()[2..34])
            .map_err(Error::crypto)
            .with_context(|| format!("invalid prevout key for node {}", node.txid))?;

        let msg = bitcoin::secp256k1::Message::from_digest(tree_tx_sighash(
            tree,
            node,
            &root_prevout,
        )?);

        secp.verify_schnorr(&sig.signature, &msg, &output_key)
            .map_err(Error::crypto)
            .with_context(|| format!("invalid tree signature for node {}", node.txid))?;
    }

    Ok(())
}

fn encode_matrix_hex<T>(matrix: &[Vec<T>], serialize: impl Fn(&T) -> Vec<u8>) -> String {
    let mut bytes = Vec::new();

    crate::utils::write_compact_size_uint(&mut bytes, matrix.len() as u64).expect("infallible");

    for row in matrix {
        crate::utils::write_compact_size_uint(&mut bytes, row.len() as u64).expect("infallible");

        for item in row {
            bytes.extend_from_slice(&serialize(item));
        }
    }

    hex::encode(bytes)
}

fn decode_matrix_hex<T>(
    s: &str,
    item_size: usize,
    parse: impl Fn(&[u8]) -> Result<T, Error>,
) -> Result<Vec<Vec<T>>, Error> {
    let bytes = hex::decode(s)
        .map_err(Error::ad_hoc)
        .context("invalid hex")?;

    let mut cursor = Cursor::new(bytes.as_slice());

    let n_levels = crate::utils::read_compact_size_uint(&mut cursor)
        .map_err(Error::ad_hoc)
        .context("failed to read level count")?;

    let mut matrix = Vec::with_capacity(n_levels as usize);
    for _ in 0..n_levels {
        let n_items = crate::utils::read_compact_size_uint(&mut cursor)
            .map_err(Error::ad_hoc)
            .context("failed to read row length")?;

        let mut row = Vec::with_capacity(n_items as usize);
        for _ in 0..n_items {
            let mut item = vec![0u8; item_size];
            cursor
                .read_exact(&mut item)
                .map_err(Error::ad_hoc)
                .context("matrix truncated")?;

            row.push(parse(&item)?);
        }

        matrix.push(row);
    }

    Ok(matrix)
}
