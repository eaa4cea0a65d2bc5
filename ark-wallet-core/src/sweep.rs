use crate::script::csv_multisig_script;
use crate::Error;
use bitcoin::key::Secp256k1;
use bitcoin::key::Verification;
use bitcoin::taproot::TaprootBuilder;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::XOnlyPublicKey;

/// The script the server uses to reclaim expired outputs of a VTXO tree.
///
/// Every shared (internal) output of the tree is the MuSig2 aggregate of its cosigners, tweaked
/// with the Taproot tree whose single leaf is this script. After `expiry`, the server can sweep
/// the output through the script path; before that, only the cosigners can move it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepScript {
    expiry: Sequence,
    server: XOnlyPublicKey,
}

impl SweepScript {
    pub fn new(expiry: Sequence, server: XOnlyPublicKey) -> Self {
        Self { expiry, server }
    }

    pub fn expiry(&self) -> Sequence {
        self.expiry
    }

    pub fn leaf(&self) -> Result<ScriptBuf, Error> {
        csv_multisig_script(self.expiry, &[self.server])
    }

    /// The Taproot spend info of a shared output with internal key `agg_pk`.
    pub fn sweep_spend_info<C>(
        &self,
        secp: &Secp256k1<C>,
        agg_pk: XOnlyPublicKey,
    ) -> Result<TaprootSpendInfo, Error>
    where
        C: Verification,
    {
        let leaf = self.leaf()?;

        TaprootBuilder::new()
            .add_leaf(0, leaf)
            .map_err(Error::script)?
            .finalize(secp, agg_pk)
            .map_err(|_| Error::script("failed to finalize sweep Taproot tree"))
    }

    /// The final (tweaked) output key of a shared output with internal key `agg_pk`.
    pub fn output_key<C>(
        &self,
        secp: &Secp256k1<C>,
        agg_pk: XOnlyPublicKey,
    ) -> Result<XOnlyPublicKey, Error>
    where
        C: Verification,
    {
        let spend_info = self.sweep_spend_info(secp, agg_pk)?;

        Ok(spend_info.output_key().to_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::key::Keypair;
    use bitcoin::secp256k1::SecretKey;

    #[test]
    fn output_key_depends_on_expiry() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[7; 32]).unwrap();
        let kp = Keypair::from_secret_key(&secp, &sk);
        let pk = kp.x_only_public_key().0;

        let sweep_a = SweepScript::new(Sequence::from_height(144), pk);
        let sweep_b = SweepScript::new(Sequence::from_height(288), pk);

        let key_a = sweep_a.output_key(&secp, pk).unwrap();
        let key_b = sweep_b.output_key(&secp, pk).unwrap();

        assert_ne!(key_a, key_b);

        // Same parameters always produce the same key.
        assert_eq!(sweep_a.output_key(&secp, pk).unwrap(), key_a);
    }
}
