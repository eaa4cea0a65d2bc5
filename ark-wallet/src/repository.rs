//! Pluggable storage for wallet and contract state.
//!
//! Repositories are logically single-writer per process. Writes carry a monotonic
//! `last_sync_time`; an implementation must reject writes that would regress it, so that a
//! concurrent background sync can never clobber fresher data.

use crate::Error;
use ark_wallet_core::server::VirtualTxOutPoint;
use async_trait::async_trait;
use bitcoin::ScriptBuf;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// The persisted top-level wallet state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletState {
    pub last_sync_time: u64,
    pub settings: HashMap<String, String>,
}

/// A filter for loading VTXOs from the repository.
#[derive(Debug, Clone)]
pub enum VtxoFilter {
    All,
    Spendable,
    Script(ScriptBuf),
}

#[async_trait]
pub trait WalletRepository: Send + Sync {
    /// Persist the wallet state. Fails with a stale-write error if `state.last_sync_time`
    /// regresses.
    async fn save_state(&self, state: WalletState) -> Result<(), Error>;

    async fn load_state(&self) -> Result<Option<WalletState>, Error>;

    /// Replace the stored VTXOs of `owner_script`. Fails with a stale-write error if
    /// `last_sync_time` regresses.
    async fn save_vtxos(
        &self,
        owner_script: ScriptBuf,
        vtxos: Vec<VirtualTxOutPoint>,
        last_sync_time: u64,
    ) -> Result<(), Error>;

    async fn load_vtxos(&self, filter: VtxoFilter) -> Result<Vec<VirtualTxOutPoint>, Error>;
}

/// A contract tracked by the wallet (e.g. an HTLC of a pending swap).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub id: String,
    pub state: String,
    pub expires_at: Option<i64>,
    pub address: String,
    pub script: ScriptBuf,
}

#[async_trait]
pub trait ContractRepository: Send + Sync {
    async fn save_contract(&self, contract: Contract) -> Result<(), Error>;

    async fn set_contract_data(&self, id: &str, key: &str, value: Vec<u8>) -> Result<(), Error>;

    async fn get_contract_data(&self, id: &str, key: &str) -> Result<Option<Vec<u8>>, Error>;

    async fn list_contracts(&self) -> Result<Vec<Contract>, Error>;
}

/// In-memory [`WalletRepository`], the default for tests and ephemeral wallets.
#[derive(Debug, Default)]
pub struct InMemoryWalletRepository {
    inner: RwLock<WalletRepositoryInner>,
}

#[derive(Debug, Default)]
struct WalletRepositoryInner {
    state: Option<WalletState>,
    vtxos: HashMap<ScriptBuf, (u64, Vec<VirtualTxOutPoint>)>,
}

#[async_trait]
impl WalletRepository for InMemoryWalletRepository {
    async fn save_state(&self, state: WalletState) -> Result<(), Error> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = &inner.state {
            if existing.last_sync_time > state.last_sync_time {
                return Err(Error::stale_write(format!(
                    "state at {} is newer than {}",
                    existing.last_sync_time, state.last_sync_time
                )));
            }
        }

        inner.state = Some(state);

        Ok(())
    }

    async fn load_state(&self) -> Result<Option<WalletState>, Error> {
        Ok(self.inner.read().await.state.clone())
    }

    async fn save_vtxos(
        &self,
        owner_script: ScriptBuf,
        vtxos: Vec<VirtualTxOutPoint>,
        last_sync_time: u64,
    ) -> Result<(), Error> {
        let mut inner = self.inner.write().await;

        if let Some((existing, _)) = inner.vtxos.get(&owner_script) {
            if *existing > last_sync_time {
                return Err(Error::stale_write(format!(
                    "VTXOs of {owner_script} at {existing} are newer than {last_sync_time}"
                )));
            }
        }

        inner.vtxos.insert(owner_script, (last_sync_time, vtxos));

        Ok(())
    }

    async fn load_vtxos(&self, filter: VtxoFilter) -> Result<Vec<VirtualTxOutPoint>, Error> {
        let inner = self.inner.read().await;

        let all = inner.vtxos.values().flat_map(|(_, vtxos)| vtxos.iter());

        let vtxos = match &filter {
            VtxoFilter::All => all.cloned().collect(),
            VtxoFilter::Spendable => all.filter(|v| v.is_spendable()).cloned().collect(),
            VtxoFilter::Script(script) => {
                all.filter(|v| &v.script == script).cloned().collect()
            }
        };

        Ok(vtxos)
    }
}

/// In-memory [`ContractRepository`].
#[derive(Debug, Default)]
pub struct InMemoryContractRepository {
    inner: RwLock<ContractRepositoryInner>,
}

#[derive(Debug, Default)]
struct ContractRepositoryInner {
    contracts: HashMap<String, Contract>,
    data: HashMap<(String, String), Vec<u8>>,
}

#[async_trait]
impl ContractRepository for InMemoryContractRepository {
    async fn save_contract(&self, contract: Contract) -> Result<(), Error> {
        self.inner
            .write()
            .await
            .contracts
            .insert(contract.id.clone(), contract);

        Ok(())
    }

    async fn set_contract_data(&self, id: &str, key: &str, value: Vec<u8>) -> Result<(), Error> {
        self.inner
            .write()
            .await
            .data
            .insert((id.to_string(), key.to_string()), value);

        Ok(())
    }

    async fn get_contract_data(&self, id: &str, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .inner
            .read()
            .await
            .data
            .get(&(id.to_string(), key.to_string()))
            .cloned())
    }

    async fn list_contracts(&self) -> Result<Vec<Contract>, Error> {
        let mut contracts = self
            .inner
            .read()
            .await
            .contracts
            .values()
            .cloned()
            .collect::<Vec<_>>();

        contracts.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(contracts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_state_writes_are_rejected() {
        let repository = InMemoryWalletRepository::default();

        repository
            .save_state(WalletState {
                last_sync_time: 100,
                settings: HashMap::new(),
            })
            .await
            .unwrap();

        let err = repository
            .save_state(WalletState {
                last_sync_time: 99,
                settings: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert!(err.is_stale_write());

        // Equal sync times are fine (idempotent re-sync).
        repository
            .save_state(WalletState {
                last_sync_time: 100,
                settings: HashMap::new(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_vtxo_writes_are_rejected() {
        let repository = InMemoryWalletRepository::default();
        let script = ScriptBuf::new();

        repository
            .save_vtxos(script.clone(), vec![], 100)
            .await
            .unwrap();

        let err = repository
            .save_vtxos(script, vec![], 50)
            .await
            .unwrap_err();
        assert!(err.is_stale_write());
    }

    #[tokio::test]
    async fn contract_data_roundtrip() {
        let repository = InMemoryContractRepository::default();

        repository
            .save_contract(Contract {
                id: "swap-1".to_string(),
                state: "pending".to_string(),
                expires_at: Some(1000),
                address: "tark1...".to_string(),
                script: ScriptBuf::new(),
            })
            .await
            .unwrap();

        repository
            .set_contract_data("swap-1", "preimage", vec![1, 2, 3])
            .await
            .unwrap();

        assert_eq!(
            repository
                .get_contract_data("swap-1", "preimage")
                .await
                .unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(
            repository.get_contract_data("swap-1", "other").await.unwrap(),
            None
        );

        assert_eq!(repository.list_contracts().await.unwrap().len(), 1);
    }
}
