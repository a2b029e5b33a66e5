use std::collections::HashMap;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::error::EscrowError;
use crate::types::{EntryKind, UserId, Wallet, WalletEntry};

/// In-memory wallet book: one balance plus append-only entry history per
/// user.
///
/// Mutations are two-phase, mirroring the storage layer's write-ahead
/// protocol: `build_*` computes the post-operation wallet value without
/// touching the book, the caller persists it, and only then `install`s it.
/// No in-place entry mutation API exists; history is append-only.
#[derive(Debug, Default, Clone)]
pub struct WalletBook {
    wallets: HashMap<UserId, Wallet>,
}

impl WalletBook {
    pub fn new() -> Self {
        Self {
            wallets: HashMap::new(),
        }
    }

    /// Rebuild a book from persisted wallets, verifying that every stored
    /// balance matches the sum of its entry history.
    pub fn from_wallets(wallets: Vec<Wallet>) -> Result<Self, EscrowError> {
        let mut book = Self::new();
        for wallet in wallets {
            match wallet.derived_balance_minor() {
                Some(derived) if derived == wallet.balance_minor => {
                    book.wallets.insert(wallet.user_id.clone(), wallet);
                }
                Some(derived) => {
                    return Err(EscrowError::Storage(format!(
                        "wallet {} balance {} does not match entry history sum {}",
                        wallet.user_id, wallet.balance_minor, derived
                    )))
                }
                None => {
                    return Err(EscrowError::Storage(format!(
                        "wallet {} entry history overdraws or overflows",
                        wallet.user_id
                    )))
                }
            }
        }
        Ok(book)
    }

    /// Wallets are created lazily: an unknown user reads as an empty wallet
    /// rather than an error.
    pub fn wallet(&self, user_id: &UserId) -> Wallet {
        self.wallets
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| Wallet::empty(user_id.clone()))
    }

    pub fn balance_minor(&self, user_id: &UserId) -> u64 {
        self.wallets
            .get(user_id)
            .map(|wallet| wallet.balance_minor)
            .unwrap_or(0)
    }

    /// Compute the wallet value after appending one entry. Does not mutate
    /// the book.
    pub fn build_entry(
        &self,
        user_id: &UserId,
        kind: EntryKind,
        amount_minor: u64,
        reference: impl Into<String>,
    ) -> Result<Wallet, EscrowError> {
        if amount_minor == 0 {
            return Err(EscrowError::Validation(
                "ledger entry amount must be positive".to_string(),
            ));
        }

        let mut wallet = self.wallet(user_id);
        let new_balance = match kind {
            EntryKind::Credit | EntryKind::Refund => wallet
                .balance_minor
                .checked_add(amount_minor)
                .ok_or_else(|| {
                    EscrowError::Validation(format!("balance overflow for {user_id}"))
                })?,
            EntryKind::Debit => {
                if wallet.balance_minor < amount_minor {
                    return Err(EscrowError::InsufficientBalance {
                        required_minor: amount_minor,
                        available_minor: wallet.balance_minor,
                    });
                }
                wallet.balance_minor - amount_minor
            }
        };

        wallet.entries.push(WalletEntry {
            entry_id: Uuid::new_v4(),
            kind,
            amount_minor,
            reference: reference.into(),
            created_at: Utc::now(),
        });
        wallet.balance_minor = new_balance;
        wallet.updated_at = Utc::now();
        Ok(wallet)
    }

    /// Commit a wallet value previously produced by `build_entry`. Rejects
    /// wallets whose balance and history disagree and regressions that drop
    /// already-committed entries.
    pub fn install(&mut self, wallet: Wallet) -> Result<(), EscrowError> {
        match wallet.derived_balance_minor() {
            Some(derived) if derived == wallet.balance_minor => {}
            _ => {
                return Err(EscrowError::Storage(format!(
                    "refusing to install wallet {} with inconsistent balance",
                    wallet.user_id
                )))
            }
        }

        if let Some(existing) = self.wallets.get(&wallet.user_id) {
            if wallet.entries.len() < existing.entries.len() {
                return Err(EscrowError::Storage(format!(
                    "refusing to truncate wallet {} history ({} -> {} entries)",
                    wallet.user_id,
                    existing.entries.len(),
                    wallet.entries.len()
                )));
            }
        }

        debug!(
            user = %wallet.user_id,
            balance_minor = wallet.balance_minor,
            entries = wallet.entries.len(),
            "wallet installed"
        );
        self.wallets.insert(wallet.user_id.clone(), wallet);
        Ok(())
    }

    pub fn wallets(&self) -> impl Iterator<Item = &Wallet> {
        self.wallets.values()
    }

    /// Check the balance invariant across every wallet in the book.
    pub fn verify(&self) -> bool {
        self.wallets
            .values()
            .all(|wallet| wallet.derived_balance_minor() == Some(wallet.balance_minor))
    }
}
