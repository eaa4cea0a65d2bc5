//! The transaction trees produced by a settlement round: the VTXO tree and the connectors
//! tree.
//!
//! Nodes reference their parents by txid rather than by pointer, so the tree is a plain
//! acyclic map. The in-memory shape is a matrix of levels plus a txid index for O(1) parent
//! lookup.

use crate::asset::AssetPacket;
use crate::psbt::extract_cosigner_pks;
use crate::sweep::SweepScript;
use crate::tree_signing::aggregate_keys;
use crate::ArkAddress;
use crate::Error;
use crate::BATCH_OUTPUT_INDEX;
use crate::CONNECTORS_OUTPUT_INDEX;
use crate::VTXO_INPUT_INDEX;
use bitcoin::taproot;
use bitcoin::Amount;
use bitcoin::OutPoint;
use bitcoin::Psbt;
use bitcoin::ScriptBuf;
use bitcoin::Txid;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TreeValidationError {
    #[error("empty tree")]
    EmptyTree,
    #[error("root input does not spend the commitment transaction: expected {expected}, got {got}")]
    WrongCommitmentTxid { expected: OutPoint, got: OutPoint },
    #[error("node {got} does not match its serialised transaction {expected}")]
    WrongTxid { expected: Txid, got: Txid },
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("node {0} carries no cosigner keys")]
    MissingCosigners(Txid),
    #[error("output key of node {0} does not match its children's cosigner set")]
    InvalidTaprootScript(Txid),
    #[error("tree has no leaves")]
    NoLeaves,
    #[error("node {0} not found in tree")]
    UnknownNode(Txid),
    #[error("malformed node: {0}")]
    MalformedNode(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReceiverValidationError {
    #[error("no leaf output found for receiver {address} ({amount})")]
    ReceiverOutputNotFound { address: String, amount: Amount },
    #[error("no asset group found for asset {0}")]
    AssetGroupNotFound(String),
    #[error("no asset output found for asset {0} at index {1}")]
    AssetOutputNotFound(String, u16),
    #[error("asset {0} amount mismatch: expected {1}, got {2}")]
    InvalidAssetAmount(String, u64, u64),
}

#[derive(Debug, Clone)]
pub struct TxTreeNode {
    pub txid: Txid,
    pub tx: Psbt,
    pub parent_txid: Txid,
    pub leaf: bool,
    pub level: usize,
    pub level_index: usize,
}

/// A finite DAG of transactions, realised as a matrix of levels.
///
/// Level 0 holds the single root, whose input references a known outpoint of the commitment
/// transaction. Each non-root node has exactly one input spending a parent output.
#[derive(Debug, Clone, Default)]
pub struct TxTree {
    levels: Vec<Vec<TxTreeNode>>,
    index: HashMap<Txid, (usize, usize)>,
}

impl TxTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nodes(
        nodes: impl IntoIterator<Item = TxTreeNode>,
    ) -> Result<Self, TreeValidationError> {
        let mut tree = Self::new();
        for node in nodes {
            tree.add_node(node)?;
        }

        Ok(tree)
    }

    pub fn add_node(&mut self, node: TxTreeNode) -> Result<(), TreeValidationError> {
        if self.index.contains_key(&node.txid) {
            return Err(TreeValidationError::MalformedNode(format!(
                "duplicate node {}",
                node.txid
            )));
        }

        if node.tx.unsigned_tx.input.len() != 1 {
            return Err(TreeValidationError::MalformedNode(format!(
                "node {} must have exactly one input",
                node.txid
            )));
        }

        while self.levels.len() <= node.level {
            self.levels.push(Vec::new());
        }

        if node.level_index != self.levels[node.level].len() {
            return Err(TreeValidationError::MalformedNode(format!(
                "node {} is out of order at level {}",
                node.txid, node.level
            )));
        }

        self.index.insert(node.txid, (node.level, node.level_index));
        self.levels[node.level].push(node);

        Ok(())
    }

    pub fn nb_of_nodes(&self) -> usize {
        self.index.len()
    }

    pub fn levels(&self) -> &[Vec<TxTreeNode>] {
        &self.levels
    }

    pub fn root(&self) -> Result<&TxTreeNode, TreeValidationError> {
        self.levels
            .first()
            .and_then(|level| level.first())
            .ok_or(TreeValidationError::EmptyTree)
    }

    pub fn get(&self, txid: &Txid) -> Option<&TxTreeNode> {
        let (level, index) = self.index.get(txid)?;
        Some(&self.levels[*level][*index])
    }

    pub fn leaves(&self) -> Vec<&TxTreeNode> {
        self.iter().filter(|node| node.leaf).collect()
    }

    pub fn children(&self, txid: &Txid) -> Vec<&TxTreeNode> {
        self.iter().filter(|node| node.parent_txid == *txid).collect()
    }

    /// All nodes, level by level.
    pub fn iter(&self) -> impl Iterator<Item = &TxTreeNode> {
        self.levels.iter().flatten()
    }

    /// The root-to-leaf path ending in `leaf_txid`.
    pub fn branch(&self, leaf_txid: &Txid) -> Result<Vec<&TxTreeNode>, TreeValidationError> {
        let mut branch = Vec::new();

        let mut current = self
            .get(leaf_txid)
            .ok_or(TreeValidationError::UnknownNode(*leaf_txid))?;

        loop {
            branch.push(current);

            if current.level == 0 {
                break;
            }

            current = self
                .get(&current.parent_txid)
                .ok_or(TreeValidationError::UnknownNode(current.parent_txid))?;
        }

        branch.reverse();

        Ok(branch)
    }

    /// The minimal suffix of the branch to `leaf_txid` that still must be broadcast to realise
    /// a unilateral exit.
    ///
    /// Transactions for which `is_tx_confirmed` returns true are already on-chain and are
    /// skipped, together with all their ancestors.
    pub fn exit_branch<F>(
        &self,
        leaf_txid: &Txid,
        is_tx_confirmed: F,
    ) -> Result<Vec<&TxTreeNode>, TreeValidationError>
    where
        F: Fn(&Txid) -> bool,
    {
        let branch = self.branch(leaf_txid)?;

        let first_unconfirmed = branch
            .iter()
            .rposition(|node| is_tx_confirmed(&node.txid))
            .map(|i| i + 1)
            .unwrap_or(0);

        Ok(branch[first_unconfirmed..].to_vec())
    }

    /// Write a key-spend signature into input 0 of the node at `(level, index)`.
    pub fn add_signature(
        &mut self,
        level: usize,
        index: usize,
        signature: taproot::Signature,
    ) -> Result<(), TreeValidationError> {
        let node = self
            .levels
            .get_mut(level)
            .and_then(|nodes| nodes.get_mut(index))
            .ok_or_else(|| {
                TreeValidationError::MalformedNode(format!("no node at ({level}, {index})"))
            })?;

        node.tx.inputs[VTXO_INPUT_INDEX].tap_key_sig = Some(signature);

        Ok(())
    }
}

/// Validate a VTXO tree against its commitment transaction.
///
/// Checks performed:
///
/// 1. The root spends the batch output of the commitment transaction, which must carry a
///    non-zero amount.
/// 2. Every node's txid matches its serialised transaction, and every shared output key is the
///    tweaked MuSig2 aggregate of the spending node's cosigner set.
/// 3. Amounts add up along every edge.
/// 4. At least one leaf exists.
pub fn validate_vtxo_tx_tree(
    tree: &TxTree,
    commitment_tx: &Psbt,
    sweep: &SweepScript,
) -> Result<(), Error> {
    validate_tx_tree(
        tree,
        commitment_tx,
        BATCH_OUTPUT_INDEX,
        Some(sweep),
    )
}

/// Validate a connectors tree against its commitment transaction.
///
/// Connector transactions are signed by the server alone, so there is no cosigner set to check.
pub fn validate_connectors_tx_tree(tree: &TxTree, commitment_tx: &Psbt) -> Result<(), Error> {
    validate_tx_tree(tree, commitment_tx, CONNECTORS_OUTPUT_INDEX, None)
}

fn validate_tx_tree(
    tree: &TxTree,
    commitment_tx: &Psbt,
    commitment_output_index: u32,
    sweep: Option<&SweepScript>,
) -> Result<(), Error> {
    let root = tree.root()?;

    let commitment_txid = commitment_tx.unsigned_tx.compute_txid();

    let shared_output = commitment_tx
        .unsigned_tx
        .output
        .get(commitment_output_index as usize)
        .ok_or_else(|| {
            TreeValidationError::InvalidAmount(format!(
                "commitment transaction has no output at index {commitment_output_index}"
            ))
        })?;

    if shared_output.value == Amount::ZERO {
        return Err(TreeValidationError::InvalidAmount(
            "commitment shared output is empty".to_string(),
        )
        .into());
    }

    let expected_root_outpoint = OutPoint {
        txid: commitment_txid,
        vout: commitment_output_index,
    };

    let root_outpoint = root.tx.unsigned_tx.input[VTXO_INPUT_INDEX].previous_output;
    if root_outpoint != expected_root_outpoint {
        return Err(TreeValidationError::WrongCommitmentTxid {
            expected: expected_root_outpoint,
            got: root_outpoint,
        }
        .into());
    }

    let root_output_sum = non_anchor_output_sum(&root.tx)?;
    if root_output_sum != shared_output.value {
        return Err(TreeValidationError::InvalidAmount(format!(
            "root outputs sum to {root_output_sum}, commitment batch output is {}",
            shared_output.value
        ))
        .into());
    }

    if tree.leaves().is_empty() {
        return Err(TreeValidationError::NoLeaves.into());
    }

    for node in tree.iter() {
        let computed_txid = node.tx.unsigned_tx.compute_txid();
        if computed_txid != node.txid {
            return Err(TreeValidationError::WrongTxid {
                expected: computed_txid,
                got: node.txid,
            }
            .into());
        }

        let spent_outpoint = node.tx.unsigned_tx.input[VTXO_INPUT_INDEX].previous_output;

        let parent_output = if node.level == 0 {
            shared_output.clone()
        } else {
            let parent = tree
                .get(&node.parent_txid)
                .ok_or(TreeValidationError::UnknownNode(node.parent_txid))?;

            if spent_outpoint.txid != parent.txid {
                return Err(TreeValidationError::MalformedNode(format!(
                    "node {} does not spend its parent {}",
                    node.txid, parent.txid
                ))
                .into());
            }

            parent
                .tx
                .unsigned_tx
                .output
                .get(spent_outpoint.vout as usize)
                .cloned()
                .ok_or_else(|| {
                    TreeValidationError::MalformedNode(format!(
                        "parent {} has no output {}",
                        parent.txid, spent_outpoint.vout
                    ))
                })?
        };

        if node.level > 0 {
            let output_sum = non_anchor_output_sum(&node.tx)?;
            if output_sum != parent_output.value {
                return Err(TreeValidationError::InvalidAmount(format!(
                    "node {} outputs sum to {output_sum}, parent output is {}",
                    node.txid, parent_output.value
                ))
                .into());
            }
        }

        if let Some(sweep) = sweep {
            let cosigner_pks = extract_cosigner_pks(&node.tx.inputs[VTXO_INPUT_INDEX])?;

            if cosigner_pks.is_empty() {
                return Err(TreeValidationError::MissingCosigners(node.txid).into());
            }

            let aggregate = aggregate_keys(&cosigner_pks, Some(sweep))?;

            let expected_script = ScriptBuf::new_p2tr_tweaked(
                bitcoin::key::TweakedPublicKey::dangerous_assume_tweaked(aggregate.final_pk),
            );

            if parent_output.script_pubkey != expected_script {
                return Err(TreeValidationError::InvalidTaprootScript(node.txid).into());
            }
        }
    }

    Ok(())
}

fn non_anchor_output_sum(tx: &Psbt) -> Result<Amount, Error> {
    tx.unsigned_tx
        .output
        .iter()
        .filter(|output| output.value > Amount::ZERO)
        .try_fold(Amount::ZERO, |acc, output| acc.checked_add(output.value))
        .ok_or_else(|| Error::transaction("output amount overflow"))
}

/// A receiver registered for the round: an address, an amount, and optionally the asset
/// amounts expected at that output.
#[derive(Debug, Clone)]
pub struct Receiver {
    pub address: ArkAddress,
    pub amount: Amount,
    pub assets: Vec<(crate::asset::AssetId, u64)>,
}

/// Check that every receiver has a matching output in some leaf of the VTXO tree.
///
/// This guards against a malicious server omitting or altering a registered output.
pub fn validate_receivers(
    tree: &TxTree,
    receivers: &[Receiver],
) -> Result<(), ReceiverValidationError> {
    for receiver in receivers {
        let p2tr_script = receiver.address.to_p2tr_script_pubkey();
        let sub_dust_script = receiver.address.to_sub_dust_script_pubkey();

        let (leaf, vout) = tree
            .leaves()
            .iter()
            .find_map(|leaf| {
                leaf.tx
                    .unsigned_tx
                    .output
                    .iter()
                    .position(|output| {
                        output.value == receiver.amount
                            && (output.script_pubkey == p2tr_script
                                || output.script_pubkey == sub_dust_script)
                    })
                    .map(|vout| (*leaf, vout as u16))
            })
            .ok_or_else(|| ReceiverValidationError::ReceiverOutputNotFound {
                address: receiver.address.encode(),
                amount: receiver.amount,
            })?;

        if receiver.assets.is_empty() {
            continue;
        }

        let packet = AssetPacket::find_in_tx(&leaf.tx.unsigned_tx);

        for (asset_id, amount) in &receiver.assets {
            let asset_label = format!("{}:{}", asset_id.txid, asset_id.index);

            let group = packet
                .as_ref()
                .and_then(|packet| {
                    packet
                        .groups
                        .iter()
                        .find(|group| group.asset_id.as_ref() == Some(asset_id))
                })
                .ok_or_else(|| {
                    ReceiverValidationError::AssetGroupNotFound(asset_label.clone())
                })?;

            let output = group
                .outputs
                .iter()
                .find(|output| output.vout == vout)
                .ok_or_else(|| {
                    ReceiverValidationError::AssetOutputNotFound(asset_label.clone(), vout)
                })?;

            if output.amount != *amount {
                return Err(ReceiverValidationError::InvalidAssetAmount(
                    asset_label,
                    *amount,
                    output.amount,
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetGroup;
    use crate::asset::AssetId;
    use crate::asset::AssetOutput;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::key::Keypair;
    use bitcoin::key::Secp256k1;
    use bitcoin::key::TweakedPublicKey;
    use bitcoin::secp256k1::SecretKey;
    use bitcoin::transaction;
    use bitcoin::Network;
    use bitcoin::Transaction;
    use bitcoin::TxIn;
    use bitcoin::TxOut;

    fn xonly(byte: u8) -> bitcoin::XOnlyPublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        Keypair::from_secret_key(&secp, &sk).x_only_public_key().0
    }

    fn psbt(previous_output: OutPoint, outputs: Vec<TxOut>) -> Psbt {
        Psbt::from_unsigned_tx(Transaction {
            version: transaction::Version::non_standard(3),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output,
                ..Default::default()
            }],
            output: outputs,
        })
        .unwrap()
    }

    fn output(sats: u64, script_pubkey: ScriptBuf) -> TxOut {
        TxOut {
            value: Amount::from_sat(sats),
            script_pubkey,
        }
    }

    /// root -> branch -> two leaves, plus one leaf directly under the root.
    fn three_level_tree() -> (TxTree, Txid) {
        let commitment_txid = Txid::from_byte_array([9; 32]);

        let root = psbt(
            OutPoint {
                txid: commitment_txid,
                vout: 0,
            },
            vec![
                output(70_000, ScriptBuf::new()),
                output(30_000, ScriptBuf::new()),
            ],
        );
        let root_txid = root.unsigned_tx.compute_txid();

        let branch = psbt(
            OutPoint {
                txid: root_txid,
                vout: 0,
            },
            vec![
                output(40_000, ScriptBuf::new()),
                output(30_000, ScriptBuf::new()),
            ],
        );
        let branch_txid = branch.unsigned_tx.compute_txid();

        let leaf_a = psbt(
            OutPoint {
                txid: root_txid,
                vout: 1,
            },
            vec![output(30_000, ScriptBuf::new())],
        );
        let leaf_b = psbt(
            OutPoint {
                txid: branch_txid,
                vout: 0,
            },
            vec![output(40_000, ScriptBuf::new())],
        );
        let leaf_c = psbt(
            OutPoint {
                txid: branch_txid,
                vout: 1,
            },
            vec![output(30_000, ScriptBuf::new())],
        );

        let nodes = [
            (root, commitment_txid, false, 0, 0),
            (branch, root_txid, false, 1, 0),
            (leaf_a, root_txid, true, 1, 1),
            (leaf_b, branch_txid, true, 2, 0),
            (leaf_c, branch_txid, true, 2, 1),
        ]
        .into_iter()
        .map(|(tx, parent_txid, leaf, level, level_index)| TxTreeNode {
            txid: tx.unsigned_tx.compute_txid(),
            tx,
            parent_txid,
            leaf,
            level,
            level_index,
        })
        .collect::<Vec<_>>();

        (TxTree::from_nodes(nodes).unwrap(), commitment_txid)
    }

    #[test]
    fn tree_queries() {
        let (tree, _) = three_level_tree();

        assert_eq!(tree.nb_of_nodes(), 5);
        assert_eq!(tree.leaves().len(), 3);

        let root_txid = tree.root().unwrap().txid;
        assert_eq!(tree.children(&root_txid).len(), 2);
    }

    #[test]
    fn branch_goes_from_root_to_leaf() {
        let (tree, _) = three_level_tree();

        let deep_leaf = tree
            .leaves()
            .into_iter()
            .find(|leaf| leaf.level == 2)
            .unwrap();
        let deep_leaf_txid = deep_leaf.txid;

        let branch = tree.branch(&deep_leaf_txid).unwrap();

        assert_eq!(branch.len(), 3);
        assert_eq!(branch[0].level, 0);
        assert_eq!(branch[2].txid, deep_leaf_txid);
    }

    #[test]
    fn exit_branch_skips_confirmed_prefix() {
        let (tree, _) = three_level_tree();

        let deep_leaf_txid = tree
            .leaves()
            .into_iter()
            .find(|leaf| leaf.level == 2)
            .unwrap()
            .txid;
        let root_txid = tree.root().unwrap().txid;

        // Nothing confirmed: the whole branch must be broadcast.
        let full = tree.exit_branch(&deep_leaf_txid, |_| false).unwrap();
        assert_eq!(full.len(), 3);

        // Root confirmed: only the suffix remains.
        let suffix = tree
            .exit_branch(&deep_leaf_txid, |txid| *txid == root_txid)
            .unwrap();
        assert_eq!(suffix.len(), 2);
        assert_eq!(suffix.last().unwrap().txid, deep_leaf_txid);

        // Everything confirmed: nothing left to broadcast.
        let none = tree.exit_branch(&deep_leaf_txid, |_| true).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn unknown_leaf_is_rejected() {
        let (tree, _) = three_level_tree();

        let unknown = Txid::from_byte_array([0xAB; 32]);
        assert_eq!(
            tree.branch(&unknown).unwrap_err(),
            TreeValidationError::UnknownNode(unknown)
        );
    }

    #[test]
    fn duplicate_nodes_are_rejected() {
        let (tree, commitment_txid) = three_level_tree();

        let root = tree.root().unwrap().clone();
        let mut nodes = tree.iter().cloned().collect::<Vec<_>>();
        nodes.push(TxTreeNode {
            level: 2,
            level_index: 2,
            parent_txid: commitment_txid,
            ..root
        });

        assert!(matches!(
            TxTree::from_nodes(nodes),
            Err(TreeValidationError::MalformedNode(_))
        ));
    }

    #[test]
    fn receiver_output_is_found() {
        let address = ArkAddress::new(
            Network::Regtest,
            xonly(1),
            TweakedPublicKey::dangerous_assume_tweaked(xonly(2)),
        );

        let commitment_txid = Txid::from_byte_array([9; 32]);
        let root = psbt(
            OutPoint {
                txid: commitment_txid,
                vout: 0,
            },
            vec![output(30_000, address.to_p2tr_script_pubkey())],
        );

        let tree = TxTree::from_nodes([TxTreeNode {
            txid: root.unsigned_tx.compute_txid(),
            tx: root,
            parent_txid: commitment_txid,
            leaf: true,
            level: 0,
            level_index: 0,
        }])
        .unwrap();

        validate_receivers(
            &tree,
            &[Receiver {
                address,
                amount: Amount::from_sat(30_000),
                assets: vec![],
            }],
        )
        .unwrap();

        let missing = validate_receivers(
            &tree,
            &[Receiver {
                address,
                amount: Amount::from_sat(31_000),
                assets: vec![],
            }],
        )
        .unwrap_err();
        assert!(matches!(
            missing,
            ReceiverValidationError::ReceiverOutputNotFound { .. }
        ));
    }

    #[test]
    fn receiver_assets_are_checked() {
        let address = ArkAddress::new(
            Network::Regtest,
            xonly(1),
            TweakedPublicKey::dangerous_assume_tweaked(xonly(2)),
        );

        let asset_id = AssetId {
            txid: Txid::from_byte_array([0x55; 32]),
            index: 0,
        };

        let packet = AssetPacket::new(vec![AssetGroup {
            asset_id: Some(asset_id),
            inputs: vec![crate::asset::AssetInput::Intent {
                txid: Txid::from_byte_array([0x66; 32]),
                vin: 0,
                amount: 700,
            }],
            outputs: vec![AssetOutput {
                vout: 0,
                amount: 700,
            }],
            ..Default::default()
        }])
        .unwrap();

        let commitment_txid = Txid::from_byte_array([9; 32]);
        let root = psbt(
            OutPoint {
                txid: commitment_txid,
                vout: 0,
            },
            vec![
                output(30_000, address.to_p2tr_script_pubkey()),
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: ScriptBuf::new_op_return(
                        <&bitcoin::script::PushBytes>::try_from(packet.encode().as_slice())
                            .unwrap(),
                    ),
                },
            ],
        );

        let tree = TxTree::from_nodes([TxTreeNode {
            txid: root.unsigned_tx.compute_txid(),
            tx: root,
            parent_txid: commitment_txid,
            leaf: true,
            level: 0,
            level_index: 0,
        }])
        .unwrap();

        validate_receivers(
            &tree,
            &[Receiver {
                address,
                amount: Amount::from_sat(30_000),
                assets: vec![(asset_id, 700)],
            }],
        )
        .unwrap();

        // Wrong expected amount.
        let err = validate_receivers(
            &tree,
            &[Receiver {
                address,
                amount: Amount::from_sat(30_000),
                assets: vec![(asset_id, 800)],
            }],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ReceiverValidationError::InvalidAssetAmount(_, 800, 700)
        ));

        // Unknown asset.
        let other_asset = AssetId {
            txid: Txid::from_byte_array([0x77; 32]),
            index: 1,
        };
        let err = validate_receivers(
            &tree,
            &[Receiver {
                address,
                amount: Amount::from_sat(30_000),
                assets: vec![(other_asset, 700)],
            }],
        )
        .unwrap_err();
        assert!(matches!(err, ReceiverValidationError::AssetGroupNotFound(_)));
    }
}
