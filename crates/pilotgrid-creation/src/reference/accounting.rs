//! Charges recorded in the state store.

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use pilotgrid_core::config::AccountingConfig;
use pilotgrid_core::*;
use pilotgrid_state::{ChargeRecord, StateStore};

pub struct LedgerAccounting {
    store: StateStore,
    config: AccountingConfig,
}

impl LedgerAccounting {
    pub fn new(store: StateStore, config: AccountingConfig) -> Self {
        Self { store, config }
    }

    /// Charged minutes outstanding for `creator`.
    pub fn outstanding_minutes(&self, creator: &str) -> Result<u64, AccountingError> {
        let charges = self
            .store
            .list_charges_for_creator(creator)
            .map_err(|e| AccountingError::Internal(e.to_string()))?;
        Ok(charges.iter().map(ChargeRecord::charged_minutes).sum())
    }
}

#[async_trait]
impl AccountingAdapter for LedgerAccounting {
    async fn create(&self, charge: Charge) -> Result<(), AccountingError> {
        let record = ChargeRecord {
            vmid: charge.vmid,
            creator: charge.creator,
            minutes: charge.minutes,
            cpu_count: charge.cpu_count,
            memory_mb: charge.memory_mb,
            charge_ratio: charge.charge_ratio,
            charged_at: Utc::now(),
        };
        if let Some(limit) = self.config.max_minutes_per_creator {
            let total = self.outstanding_minutes(&record.creator)? + record.charged_minutes();
            if total > limit {
                return Err(AccountingError::Denied(format!(
                    "{} would have {total} minutes charged, limit is {limit}",
                    record.creator
                )));
            }
        }
        self.store
            .put_charge(&record)
            .map_err(|e| AccountingError::Internal(e.to_string()))?;
        debug!(vmid = record.vmid, minutes = record.charged_minutes(), "charge recorded");
        Ok(())
    }

    async fn destroy(&self, vmid: VmId, creator: &str) -> Result<(), AccountingError> {
        let removed = self
            .store
            .delete_charge(vmid)
            .map_err(|e| AccountingError::Internal(e.to_string()))?;
        debug!(vmid, %creator, removed, "charge removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn charge(vmid: VmId, minutes: u64) -> Charge {
        Charge {
            vmid,
            creator: "alice".to_string(),
            minutes,
            cpu_count: 1,
            memory_mb: 256,
            charge_ratio: 1.5,
        }
    }

    #[tokio::test]
    async fn limit_counts_ratio() {
        let store = StateStore::open_in_memory().unwrap();
        let ledger = LedgerAccounting::new(
            store,
            AccountingConfig {
                enabled: true,
                max_minutes_per_creator: Some(100),
            },
        );
        ledger.create(charge(1, 60)).await.unwrap();
        assert_eq!(ledger.outstanding_minutes("alice").unwrap(), 90);
        assert!(matches!(
            ledger.create(charge(2, 10)).await,
            Err(AccountingError::Denied(_))
        ));

        ledger.destroy(1, "alice").await.unwrap();
        ledger.create(charge(2, 10)).await.unwrap();
        assert_eq!(ledger.outstanding_minutes("alice").unwrap(), 15);
    }
}
