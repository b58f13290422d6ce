//! In-memory per-user, per-asset balance accounting.
//!
//! Every balance carries an `available` and a `liabilities` sub-account.
//! `liabilities` tracks funds reserved against resting orders; the one
//! invariant every operation must preserve is `liabilities <= available +
//! pending_deposits`. This is the only way to move a balance — there is no
//! path that mutates `UserBalance` fields directly from outside this crate,
//! the same discipline the teacher's `LedgerEntry::append` enforces for its
//! Postgres-backed ledger, just without the table.

use matching_engine::{Amount, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserBalance {
    pub available: Amount,
    pub liabilities: Amount,
    /// Observed on chain but not yet credited. The current deposit handler
    /// credits `available` directly on event (see DESIGN.md), so this stays
    /// zero today; the field exists so a two-phase scheme can be introduced
    /// without changing the public shape of a balance.
    pub pending_deposits: Amount,
}

impl UserBalance {
    /// `liabilities <= available + pending_deposits` — checked after every
    /// mutation in debug builds, not just asserted in prose.
    fn invariant_holds(&self) -> bool {
        self.available
            .checked_add(self.pending_deposits)
            .map(|capacity| self.liabilities.0 <= capacity.0)
            .unwrap_or(false)
    }

    fn spendable(&self) -> Amount {
        // available - liabilities; saturates to zero rather than panicking,
        // the caller's checked_sub below is what actually rejects the op.
        Amount(self.available.0.saturating_sub(self.liabilities.0))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient available balance")]
    InsufficientAvailable,
    /// Fatal: liabilities or available would go negative, or an amount
    /// overflowed u64. Indicates an internal miscount upstream — the caller
    /// must halt, never paper over it.
    #[error("internal invariant violation: {0}")]
    UnderflowBug(&'static str),
}

#[derive(Debug, Clone, Copy)]
enum LedgerOp {
    Credit,
    Reserve,
    Release,
    Consume,
    Debit,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    asset: Asset,
    op: LedgerOp,
    amount: Amount,
}

/// Per-user, per-asset balance store. Exclusively owned and mutated by the
/// executor (see `coordinator::Executor`); never shared behind a lock.
pub struct UserStore {
    balances: HashMap<(UserId, Asset), UserBalance>,
    history: HashMap<UserId, VecDeque<HistoryEntry>>,
    history_depth: usize,
}

impl Default for UserStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStore {
    pub fn new() -> Self {
        Self::with_history_depth(32)
    }

    /// `history_depth` bounds the diagnostic ring kept per user; 0 disables it.
    pub fn with_history_depth(history_depth: usize) -> Self {
        Self {
            balances: HashMap::new(),
            history: HashMap::new(),
            history_depth,
        }
    }

    pub fn balance(&self, user: UserId, asset: Asset) -> UserBalance {
        self.balances.get(&(user, asset)).copied().unwrap_or_default()
    }

    pub fn recent_history(&self, user: UserId) -> Vec<(Asset, &'static str, Amount)> {
        self.history
            .get(&user)
            .into_iter()
            .flat_map(|ring| ring.iter())
            .map(|e| (e.asset, op_name(e.op), e.amount))
            .collect()
    }

    fn record(&mut self, user: UserId, asset: Asset, op: LedgerOp, amount: Amount) {
        if self.history_depth == 0 {
            return;
        }
        let ring = self.history.entry(user).or_default();
        if ring.len() == self.history_depth {
            ring.pop_front();
        }
        ring.push_back(HistoryEntry { asset, op, amount });
    }

    fn mutate(
        &mut self,
        user: UserId,
        asset: Asset,
        f: impl FnOnce(&mut UserBalance) -> Result<(), LedgerError>,
    ) -> Result<(), LedgerError> {
        let balance = self.balances.entry((user, asset)).or_default();
        let before = *balance;
        f(balance)?;
        if !balance.invariant_holds() {
            *balance = before;
            return Err(LedgerError::UnderflowBug("liabilities exceed available + pending"));
        }
        Ok(())
    }

    /// Increments `available`. Used for deposits and the buyer's receive leg
    /// at settlement.
    pub fn credit(&mut self, user: UserId, asset: Asset, amount: Amount) -> Result<(), LedgerError> {
        self.mutate(user, asset, |b| {
            b.available = b
                .available
                .checked_add(amount)
                .ok_or(LedgerError::UnderflowBug("available overflow on credit"))?;
            Ok(())
        })?;
        self.record(user, asset, LedgerOp::Credit, amount);
        Ok(())
    }

    /// Requires `amount <= available - liabilities`; increments `liabilities`.
    /// Used when placing a resting order or locking funds for a taker leg.
    pub fn reserve(&mut self, user: UserId, asset: Asset, amount: Amount) -> Result<(), LedgerError> {
        self.mutate(user, asset, |b| {
            if amount.0 > b.spendable().0 {
                return Err(LedgerError::InsufficientAvailable);
            }
            b.liabilities = b
                .liabilities
                .checked_add(amount)
                .ok_or(LedgerError::UnderflowBug("liabilities overflow on reserve"))?;
            Ok(())
        })?;
        self.record(user, asset, LedgerOp::Reserve, amount);
        Ok(())
    }

    /// Decrements `liabilities`. Used on cancel of a resting order's
    /// remaining quantity, and to hand back the fractional difference when a
    /// buyer's reservation was at a better price than the fill.
    pub fn release(&mut self, user: UserId, asset: Asset, amount: Amount) -> Result<(), LedgerError> {
        if amount.is_zero() {
            return Ok(());
        }
        self.mutate(user, asset, |b| {
            b.liabilities = b
                .liabilities
                .checked_sub(amount)
                .ok_or(LedgerError::UnderflowBug("liabilities underflow on release"))?;
            Ok(())
        })?;
        self.record(user, asset, LedgerOp::Release, amount);
        Ok(())
    }

    /// Decrements both `available` and `liabilities`. Used on the leg of a
    /// settlement where funds leave the system for the counterparty.
    pub fn consume(&mut self, user: UserId, asset: Asset, amount: Amount) -> Result<(), LedgerError> {
        self.mutate(user, asset, |b| {
            b.available = b
                .available
                .checked_sub(amount)
                .ok_or(LedgerError::UnderflowBug("available underflow on consume"))?;
            b.liabilities = b
                .liabilities
                .checked_sub(amount)
                .ok_or(LedgerError::UnderflowBug("liabilities underflow on consume"))?;
            Ok(())
        })?;
        self.record(user, asset, LedgerOp::Consume, amount);
        Ok(())
    }

    /// Requires `amount <= available - liabilities`; decrements `available`
    /// only. Used for withdrawals.
    pub fn debit(&mut self, user: UserId, asset: Asset, amount: Amount) -> Result<(), LedgerError> {
        self.mutate(user, asset, |b| {
            if amount.0 > b.spendable().0 {
                return Err(LedgerError::InsufficientAvailable);
            }
            b.available = b
                .available
                .checked_sub(amount)
                .ok_or(LedgerError::UnderflowBug("available underflow on debit"))?;
            Ok(())
        })?;
        self.record(user, asset, LedgerOp::Debit, amount);
        Ok(())
    }
}

fn op_name(op: LedgerOp) -> &'static str {
    match op {
        LedgerOp::Credit => "credit",
        LedgerOp::Reserve => "reserve",
        LedgerOp::Release => "release",
        LedgerOp::Consume => "consume",
        LedgerOp::Debit => "debit",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(byte: u8) -> UserId {
        [byte; 32]
    }

    #[test]
    fn credit_then_reserve_then_consume_round_trips() {
        let mut store = UserStore::new();
        store.credit(user(1), Asset::A, Amount(100)).unwrap();
        store.reserve(user(1), Asset::A, Amount(40)).unwrap();
        assert_eq!(store.balance(user(1), Asset::A).liabilities, Amount(40));

        store.consume(user(1), Asset::A, Amount(40)).unwrap();
        let bal = store.balance(user(1), Asset::A);
        assert_eq!(bal.available, Amount(60));
        assert_eq!(bal.liabilities, Amount(0));
    }

    #[test]
    fn reserve_beyond_available_is_rejected() {
        let mut store = UserStore::new();
        store.credit(user(1), Asset::B, Amount(10)).unwrap();
        let err = store.reserve(user(1), Asset::B, Amount(11)).unwrap_err();
        assert_eq!(err, LedgerError::InsufficientAvailable);
    }

    #[test]
    fn cancel_releases_liability_back_to_zero() {
        let mut store = UserStore::new();
        store.credit(user(1), Asset::A, Amount(50)).unwrap();
        store.reserve(user(1), Asset::A, Amount(50)).unwrap();
        store.release(user(1), Asset::A, Amount(50)).unwrap();
        assert_eq!(store.balance(user(1), Asset::A).liabilities, Amount(0));
    }

    #[test]
    fn debit_respects_reserved_liabilities() {
        let mut store = UserStore::new();
        store.credit(user(1), Asset::B, Amount(100)).unwrap();
        store.reserve(user(1), Asset::B, Amount(60)).unwrap();
        // only 40 is spendable; a 50 withdrawal must be rejected
        let err = store.debit(user(1), Asset::B, Amount(50)).unwrap_err();
        assert_eq!(err, LedgerError::InsufficientAvailable);
        assert!(store.debit(user(1), Asset::B, Amount(40)).is_ok());
    }

    #[test]
    fn invariant_holds_across_zero_balance_user() {
        let store = UserStore::new();
        let bal = store.balance(user(7), Asset::A);
        assert!(bal.invariant_holds());
    }
}
