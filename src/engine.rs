//! Prize-savings accounting engine.
//!
//! Pure state machine over a fixed-size, zero-copy `LotteryEngine`. Holds the
//! pool registry, per-pool time-weight accrual, the position ledger with lazy
//! reward-index settlement, the prize allocator, the weighted draw and the
//! epoch lifecycle. Token movement and randomness delivery are reached only
//! through the `YieldVault` and `RandomnessOracle` traits.

use arrayref::array_ref;
use bytemuck::{Pod, Zeroable};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::verify;

pub const SCALE: u128 = 1_000_000_000_000_000_000;
pub const WEIGHT_DECIMALS: u8 = 18;

pub const MAX_POOLS: usize = 16;
pub const MAX_ASSETS: usize = 8;
#[cfg(feature = "test")]
pub const MAX_POSITIONS: usize = 64;
#[cfg(not(feature = "test"))]
pub const MAX_POSITIONS: usize = 1024;
pub const HISTORY_LEN: usize = 32;

pub const BITMAP_WORDS: usize = (MAX_POSITIONS + 63) / 64;
pub const NO_POOL: u8 = 0;

// ============================================================================
// 128-bit storage
// ============================================================================

/// u128 stored as two u64 limbs so the slab only needs 8-byte alignment.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct U128 {
    lo: u64,
    hi: u64,
}

impl U128 {
    pub const ZERO: U128 = U128 { lo: 0, hi: 0 };

    #[inline]
    pub const fn new(v: u128) -> Self {
        U128 { lo: v as u64, hi: (v >> 64) as u64 }
    }

    #[inline]
    pub const fn get(self) -> u128 {
        ((self.hi as u128) << 64) | self.lo as u128
    }

    #[inline]
    pub fn set(&mut self, v: u128) {
        *self = U128::new(v);
    }

    #[inline]
    pub const fn lo(self) -> u64 {
        self.lo
    }

    #[inline]
    pub const fn hi(self) -> u64 {
        self.hi
    }
}

impl From<u128> for U128 {
    fn from(v: u128) -> Self {
        U128::new(v)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineError {
    InvalidState,
    PoolNotFound,
    AssetNotFound,
    PositionNotFound,
    InsufficientBalance,
    InsufficientFunds,
    Unauthorized,
    AssetMismatch,
    DuplicateAsset,
    AssetTableFull,
    AssetHasDeposits,
    AssetDisabled,
    InvalidParams,
    ZeroAmount,
    Paused,
    Reentrancy,
    PositionTableFull,
    Overflow,
    VaultFailure,
}

/// Coarse error classes exposed to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    State,
    NotFound,
    InsufficientBalance,
    InsufficientFunds,
    Authorization,
    Config,
    ZeroAmount,
    Internal,
}

impl EngineError {
    pub fn kind(self) -> ErrorKind {
        match self {
            EngineError::InvalidState | EngineError::Paused | EngineError::Reentrancy => {
                ErrorKind::State
            }
            EngineError::PoolNotFound
            | EngineError::AssetNotFound
            | EngineError::PositionNotFound => ErrorKind::NotFound,
            EngineError::InsufficientBalance => ErrorKind::InsufficientBalance,
            EngineError::InsufficientFunds => ErrorKind::InsufficientFunds,
            EngineError::Unauthorized => ErrorKind::Authorization,
            EngineError::AssetMismatch
            | EngineError::DuplicateAsset
            | EngineError::AssetTableFull
            | EngineError::AssetHasDeposits
            | EngineError::AssetDisabled
            | EngineError::InvalidParams => ErrorKind::Config,
            EngineError::ZeroAmount => ErrorKind::ZeroAmount,
            EngineError::PositionTableFull | EngineError::Overflow | EngineError::VaultFailure => {
                ErrorKind::Internal
            }
        }
    }
}

pub type Result<T> = core::result::Result<T, EngineError>;

// ============================================================================
// External collaborators
// ============================================================================

/// Yield-bearing facility an asset's deposits are routed into.
pub trait YieldVault {
    fn asset_id(&self) -> [u8; 32];
    /// Returns the number of facility shares minted.
    fn deposit(&mut self, amount: u128) -> Result<u128>;
    /// Returns the number of facility shares burned.
    fn withdraw(&mut self, amount: u128, recipient: &[u8; 32]) -> Result<u128>;
    /// Total value held on the lottery's behalf, realized yield included.
    fn current_value(&self) -> u128;
}

/// Randomness provider. Delivery happens later through
/// `LotteryEngine::fulfill_randomness`.
pub trait RandomnessOracle {
    fn fee(&self) -> u64;
    /// Pays `fee()` and returns an opaque correlation token.
    fn request(&mut self, epoch_id: u64) -> Result<u64>;
}

// ============================================================================
// State
// ============================================================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum EpochStatus {
    Open = 0,
    Closed = 1,
    RandomnessRequested = 2,
    RandomnessReady = 3,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Action {
    None = 0,
    Close = 1,
    RequestRandomness = 2,
    Finalize = 3,
}

impl Action {
    pub fn from_code(code: u8) -> Option<Action> {
        Action::from_u8(code)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct LotteryParams {
    pub epoch_duration_secs: u64,
    pub schedule_anchor_ts: i64,
    pub num_pools: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Epoch {
    pub id: u64,
    pub start_ts: i64,
    pub end_ts: i64,
    pub request_token: u64,
    pub randomness: [u8; 32],
    /// Sum of surplus folded into the winning pool, raw units across assets.
    pub total_prize: U128,
    pub finalized_ts: i64,
    pub status: u8,
    pub winning_pool: u8,
    pub has_randomness: u8,
    pub _padding: [u8; 5],
}

impl Epoch {
    pub fn status(&self) -> EpochStatus {
        EpochStatus::from_u8(self.status).unwrap_or(EpochStatus::Open)
    }

    pub fn randomness(&self) -> Option<[u8; 32]> {
        if self.has_randomness != 0 {
            Some(self.randomness)
        } else {
            None
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Pool {
    pub creator: [u8; 32],
    /// Principal per asset slot, raw units.
    pub deposits: [U128; MAX_ASSETS],
    /// Reward index per asset slot, scaled by `SCALE`.
    pub reward_index: [U128; MAX_ASSETS],
    /// Sum of decimal-normalized deposits.
    pub weighted_balance: U128,
    pub cumulative_weight: U128,
    pub last_balance: U128,
    pub last_ts: i64,
    pub id: u8,
    pub exists: u8,
    pub _padding: [u8; 6],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Asset {
    pub mint: [u8; 32],
    pub vault: [u8; 32],
    pub principal_liability: U128,
    pub prize_liability: U128,
    pub enabled: u8,
    pub decimals: u8,
    pub _padding: [u8; 6],
}

impl Asset {
    pub fn is_registered(&self) -> bool {
        self.mint != [0u8; 32]
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }

    pub fn liabilities(&self) -> u128 {
        self.principal_liability
            .get()
            .saturating_add(self.prize_liability.get())
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Position {
    pub owner: [u8; 32],
    pub principal: U128,
    /// Pool reward index last settled against.
    pub checkpoint: U128,
    pub pending_prize: U128,
    pub asset: u8,
    pub pool: u8,
    pub _padding: [u8; 6],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct LotteryEngine {
    pub params: LotteryParams,
    pub oracle_authority: [u8; 32],
    /// Zero means any caller may execute automation actions.
    pub automation_caller: [u8; 32],
    pub current: Epoch,
    pub fee_reserve: u64,
    pub finalized_count: u64,
    pub num_positions: u64,
    pub reentrancy_lock: u8,
    pub paused: u8,
    pub _padding: [u8; 6],
    pub pools: [Pool; MAX_POOLS],
    pub assets: [Asset; MAX_ASSETS],
    pub used: [u64; BITMAP_WORDS],
    pub positions: [Position; MAX_POSITIONS],
    pub history: [Epoch; HISTORY_LEN],
}

// ============================================================================
// Math helpers
// ============================================================================

/// floor(a * b / d) without intermediate overflow when the result fits.
pub fn mul_div_floor(a: u128, b: u128, d: u128) -> Result<u128> {
    if d == 0 {
        return Err(EngineError::Overflow);
    }
    if let Some(p) = a.checked_mul(b) {
        return Ok(p / d);
    }
    let q = a / d;
    let r = a % d;
    let hi = q.checked_mul(b).ok_or(EngineError::Overflow)?;
    let lo = r.checked_mul(b).ok_or(EngineError::Overflow)? / d;
    hi.checked_add(lo).ok_or(EngineError::Overflow)
}

/// Rescale a raw amount with `decimals` to `WEIGHT_DECIMALS`.
pub fn normalize_amount(amount: u128, decimals: u8) -> u128 {
    if decimals <= WEIGHT_DECIMALS {
        amount.saturating_mul(10u128.pow((WEIGHT_DECIMALS - decimals) as u32))
    } else {
        let shift = (decimals - WEIGHT_DECIMALS).min(38);
        amount / 10u128.pow(shift as u32)
    }
}

/// Interprets the first 16 bytes of a random word as a little-endian integer.
pub fn randomness_to_u128(randomness: &[u8; 32]) -> u128 {
    u128::from_le_bytes(*array_ref![randomness, 0, 16])
}

/// Weighted selection over `weights` in index order.
///
/// Returns `None` when the total weight is zero. Otherwise the slot whose
/// cumulative range contains `r mod total`.
pub fn select_winner(weights: &[u128], r: u128) -> Option<usize> {
    let total = weights.iter().fold(0u128, |acc, w| acc.saturating_add(*w));
    if total == 0 {
        return None;
    }
    let mut x = r % total;
    let mut last = None;
    for (i, w) in weights.iter().enumerate() {
        if *w == 0 {
            continue;
        }
        if x < *w {
            return Some(i);
        }
        x -= *w;
        last = Some(i);
    }
    // only reachable when the total saturated
    last
}

/// Smallest scheduled boundary strictly after `now`.
pub fn next_boundary(params: &LotteryParams, now: i64) -> i64 {
    let anchor = params.schedule_anchor_ts;
    let d = params.epoch_duration_secs.max(1) as i64;
    if now < anchor {
        return anchor;
    }
    let periods = (now - anchor) / d + 1;
    anchor.saturating_add(periods.saturating_mul(d))
}

/// Deterministic depositor -> pool mapping. Changing `num_pools` reshuffles
/// every depositor.
pub fn assign_pool(owner: &[u8; 32], num_pools: u64) -> u8 {
    if num_pools == 0 {
        return NO_POOL;
    }
    let digest = solana_program::hash::hash(owner).to_bytes();
    let h = u64::from_le_bytes(*array_ref![digest, 0, 8]);
    (h % num_pools) as u8 + 1
}

// ============================================================================
// Engine
// ============================================================================

impl LotteryEngine {
    /// Builds an engine by value. On-chain callers use `init` on zeroed slab
    /// memory instead.
    pub fn new(
        params: LotteryParams,
        creator: [u8; 32],
        oracle_authority: [u8; 32],
        now: i64,
    ) -> Result<Self> {
        let mut engine = LotteryEngine::zeroed();
        engine.init(params, creator, oracle_authority, now)?;
        Ok(engine)
    }

    /// Initializes zeroed engine memory.
    pub fn init(
        &mut self,
        params: LotteryParams,
        creator: [u8; 32],
        oracle_authority: [u8; 32],
        now: i64,
    ) -> Result<()> {
        if params.epoch_duration_secs == 0
            || params.num_pools == 0
            || params.num_pools > MAX_POOLS as u64
        {
            return Err(EngineError::InvalidParams);
        }
        self.params = params;
        self.oracle_authority = oracle_authority;
        for i in 0..params.num_pools as usize {
            let pool = &mut self.pools[i];
            pool.id = (i + 1) as u8;
            pool.exists = 1;
            pool.creator = creator;
            pool.last_ts = now;
        }
        self.current = Epoch {
            id: 1,
            start_ts: now,
            end_ts: next_boundary(&params, now),
            status: EpochStatus::Open as u8,
            ..Epoch::default()
        };
        Ok(())
    }

    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.reentrancy_lock != 0 {
            return Err(EngineError::Reentrancy);
        }
        self.reentrancy_lock = 1;
        let res = f(self);
        self.reentrancy_lock = 0;
        res
    }

    // ---------------------------------------------------------------- registry

    pub fn assign_pool(&self, owner: &[u8; 32]) -> u8 {
        assign_pool(owner, self.params.num_pools)
    }

    pub fn pool(&self, id: u8) -> Result<&Pool> {
        let idx = self.pool_slot(id)?;
        Ok(&self.pools[idx])
    }

    fn pool_slot(&self, id: u8) -> Result<usize> {
        if id == NO_POOL || id as usize > MAX_POOLS {
            return Err(EngineError::PoolNotFound);
        }
        let idx = id as usize - 1;
        if self.pools[idx].exists == 0 {
            return Err(EngineError::PoolNotFound);
        }
        Ok(idx)
    }

    pub fn asset(&self, idx: u8) -> Result<&Asset> {
        self.assets
            .get(idx as usize)
            .filter(|a| a.is_registered())
            .ok_or(EngineError::AssetNotFound)
    }

    pub fn register_asset(&mut self, mint: [u8; 32], vault: [u8; 32], decimals: u8) -> Result<u8> {
        if mint == [0u8; 32] {
            return Err(EngineError::InvalidParams);
        }
        if let Some(i) = self.assets.iter().position(|a| a.mint == mint) {
            let asset = &mut self.assets[i];
            if asset.is_enabled() {
                return Err(EngineError::DuplicateAsset);
            }
            if asset.decimals != decimals {
                return Err(EngineError::AssetMismatch);
            }
            asset.vault = vault;
            asset.enabled = 1;
            return Ok(i as u8);
        }
        let i = self
            .assets
            .iter()
            .position(|a| !a.is_registered())
            .ok_or(EngineError::AssetTableFull)?;
        self.assets[i] = Asset {
            mint,
            vault,
            principal_liability: U128::ZERO,
            prize_liability: U128::ZERO,
            enabled: 1,
            decimals,
            _padding: [0; 6],
        };
        Ok(i as u8)
    }

    pub fn disable_asset(&mut self, idx: u8) -> Result<()> {
        let i = idx as usize;
        if i >= MAX_ASSETS || !self.assets[i].is_registered() {
            return Err(EngineError::AssetNotFound);
        }
        if self.assets[i].principal_liability.get() != 0 {
            return Err(EngineError::AssetHasDeposits);
        }
        self.assets[i].enabled = 0;
        Ok(())
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused as u8;
    }

    pub fn set_automation_caller(&mut self, caller: [u8; 32]) {
        self.automation_caller = caller;
    }

    pub fn fund_fees(&mut self, lamports: u64) -> Result<()> {
        if lamports == 0 {
            return Err(EngineError::ZeroAmount);
        }
        self.fee_reserve = self
            .fee_reserve
            .checked_add(lamports)
            .ok_or(EngineError::Overflow)?;
        Ok(())
    }

    // ----------------------------------------------------------- weight accrual

    /// Integrates the pool's previous balance up to `now`, then records the
    /// current balance as the new baseline.
    fn accrue_pool(&mut self, slot: usize, now: i64) {
        let pool = &mut self.pools[slot];
        let elapsed = now.saturating_sub(pool.last_ts).max(0) as u128;
        let gained = pool.last_balance.get().saturating_mul(elapsed);
        pool.cumulative_weight
            .set(pool.cumulative_weight.get().saturating_add(gained));
        if now > pool.last_ts {
            pool.last_ts = now;
        }
        pool.last_balance = pool.weighted_balance;
    }

    /// Recomputes the pool's weight balance from its per-asset deposits.
    fn rebalance_pool(&mut self, slot: usize) {
        let mut balance = 0u128;
        for (a, asset) in self.assets.iter().enumerate() {
            let units = self.pools[slot].deposits[a].get();
            balance = balance.saturating_add(normalize_amount(units, asset.decimals));
        }
        self.pools[slot].weighted_balance.set(balance);
    }

    fn accrue_all(&mut self, now: i64) {
        for slot in 0..MAX_POOLS {
            if self.pools[slot].exists != 0 {
                self.accrue_pool(slot, now);
            }
        }
    }

    // ------------------------------------------------------------------ ledger

    pub fn is_used(&self, idx: usize) -> bool {
        idx < MAX_POSITIONS && (self.used[idx >> 6] >> (idx & 63)) & 1 == 1
    }

    fn check_position(&self, idx: u16) -> Result<usize> {
        let i = idx as usize;
        if !self.is_used(i) {
            return Err(EngineError::PositionNotFound);
        }
        Ok(i)
    }

    pub fn position(&self, idx: u16) -> Result<&Position> {
        let i = self.check_position(idx)?;
        Ok(&self.positions[i])
    }

    pub fn find_position(&self, asset: u8, pool: u8, owner: &[u8; 32]) -> Option<u16> {
        (0..MAX_POSITIONS)
            .filter(|i| self.is_used(*i))
            .find(|i| {
                let p = &self.positions[*i];
                p.asset == asset && p.pool == pool && p.owner == *owner
            })
            .map(|i| i as u16)
    }

    /// Returns the position for (asset, pool, owner), creating it on first use.
    pub fn open_position(&mut self, asset: u8, pool: u8, owner: [u8; 32]) -> Result<u16> {
        self.asset(asset)?;
        let slot = self.pool_slot(pool)?;
        if let Some(idx) = self.find_position(asset, pool, &owner) {
            return Ok(idx);
        }
        let i = (0..MAX_POSITIONS)
            .find(|i| !self.is_used(*i))
            .ok_or(EngineError::PositionTableFull)?;
        self.used[i >> 6] |= 1u64 << (i & 63);
        self.num_positions += 1;
        self.positions[i] = Position {
            owner,
            principal: U128::ZERO,
            checkpoint: self.pools[slot].reward_index[asset as usize],
            pending_prize: U128::ZERO,
            asset,
            pool,
            _padding: [0; 6],
        };
        Ok(i as u16)
    }

    /// Moves any reward-index growth since the position's checkpoint into its
    /// pending prize. Calling it twice in a row changes nothing the second time.
    pub fn settle(&mut self, idx: u16) -> Result<u128> {
        let i = self.check_position(idx)?;
        let (asset, slot) = {
            let p = &self.positions[i];
            (p.asset as usize, self.pool_slot(p.pool)?)
        };
        let index = self.pools[slot].reward_index[asset].get();
        let pos = &mut self.positions[i];
        let delta = index.saturating_sub(pos.checkpoint.get());
        let principal = pos.principal.get();
        if delta > 0 && principal > 0 {
            let owed = mul_div_floor(principal, delta, SCALE)?;
            let pending = pos
                .pending_prize
                .get()
                .checked_add(owed)
                .ok_or(EngineError::Overflow)?;
            pos.pending_prize.set(pending);
        }
        pos.checkpoint.set(index);
        Ok(pos.pending_prize.get())
    }

    pub fn deposit<V: YieldVault>(
        &mut self,
        vault: &mut V,
        idx: u16,
        amount: u128,
        now: i64,
    ) -> Result<()> {
        self.guarded(|e| e.deposit_locked(vault, idx, amount, now))
    }

    fn deposit_locked<V: YieldVault>(
        &mut self,
        vault: &mut V,
        idx: u16,
        amount: u128,
        now: i64,
    ) -> Result<()> {
        if amount == 0 {
            return Err(EngineError::ZeroAmount);
        }
        if self.paused != 0 {
            return Err(EngineError::Paused);
        }
        let i = self.check_position(idx)?;
        let (asset_idx, pool_id) = (self.positions[i].asset, self.positions[i].pool);
        let slot = self.pool_slot(pool_id)?;
        let asset = *self.asset(asset_idx)?;
        if !asset.is_enabled() {
            return Err(EngineError::AssetDisabled);
        }
        if vault.asset_id() != asset.mint {
            return Err(EngineError::AssetMismatch);
        }

        let a = asset_idx as usize;
        let principal = self.positions[i]
            .principal
            .get()
            .checked_add(amount)
            .ok_or(EngineError::Overflow)?;
        let deposits = self.pools[slot].deposits[a]
            .get()
            .checked_add(amount)
            .ok_or(EngineError::Overflow)?;
        let liability = asset
            .principal_liability
            .get()
            .checked_add(amount)
            .ok_or(EngineError::Overflow)?;

        self.settle(idx)?;
        vault.deposit(amount)?;

        self.positions[i].principal.set(principal);
        self.pools[slot].deposits[a].set(deposits);
        self.assets[a].principal_liability.set(liability);
        self.rebalance_pool(slot);
        self.accrue_pool(slot, now);
        Ok(())
    }

    pub fn withdraw<V: YieldVault>(
        &mut self,
        vault: &mut V,
        idx: u16,
        amount: u128,
        now: i64,
    ) -> Result<()> {
        self.guarded(|e| e.withdraw_locked(vault, idx, amount, now))
    }

    fn withdraw_locked<V: YieldVault>(
        &mut self,
        vault: &mut V,
        idx: u16,
        amount: u128,
        now: i64,
    ) -> Result<()> {
        if amount == 0 {
            return Err(EngineError::ZeroAmount);
        }
        let i = self.check_position(idx)?;
        let (asset_idx, pool_id, owner) = {
            let p = &self.positions[i];
            (p.asset, p.pool, p.owner)
        };
        let slot = self.pool_slot(pool_id)?;
        let asset = *self.asset(asset_idx)?;
        if vault.asset_id() != asset.mint {
            return Err(EngineError::AssetMismatch);
        }

        let principal = self.positions[i].principal.get();
        if amount > principal {
            return Err(EngineError::InsufficientBalance);
        }

        self.settle(idx)?;
        vault.withdraw(amount, &owner)?;

        let a = asset_idx as usize;
        self.positions[i].principal.set(principal - amount);
        let pool = &mut self.pools[slot];
        pool.deposits[a].set(pool.deposits[a].get().saturating_sub(amount));
        let entry = &mut self.assets[a];
        entry
            .principal_liability
            .set(entry.principal_liability.get().saturating_sub(amount));
        self.rebalance_pool(slot);
        self.accrue_pool(slot, now);
        Ok(())
    }

    /// Pays out the position's pending prize. Zero is a no-op.
    pub fn claim<V: YieldVault>(&mut self, vault: &mut V, idx: u16) -> Result<u128> {
        self.guarded(|e| e.claim_locked(vault, idx))
    }

    fn claim_locked<V: YieldVault>(&mut self, vault: &mut V, idx: u16) -> Result<u128> {
        if self.paused != 0 {
            return Err(EngineError::Paused);
        }
        let i = self.check_position(idx)?;
        let (asset_idx, owner) = (self.positions[i].asset, self.positions[i].owner);
        let asset = *self.asset(asset_idx)?;
        if vault.asset_id() != asset.mint {
            return Err(EngineError::AssetMismatch);
        }

        let amount = self.settle(idx)?;
        if amount == 0 {
            return Ok(0);
        }
        let owed = asset.prize_liability.get();
        if amount > owed {
            return Err(EngineError::InsufficientBalance);
        }

        vault.withdraw(amount, &owner)?;
        self.assets[asset_idx as usize].prize_liability.set(owed - amount);
        self.positions[i].pending_prize = U128::ZERO;
        Ok(amount)
    }

    /// Pending prize plus whatever settlement would add right now.
    pub fn claimable(&self, idx: u16) -> Result<u128> {
        let pos = self.position(idx)?;
        let pool = self.pool(pos.pool)?;
        let delta = pool.reward_index[pos.asset as usize]
            .get()
            .saturating_sub(pos.checkpoint.get());
        let unsettled = mul_div_floor(pos.principal.get(), delta, SCALE)?;
        pos.pending_prize
            .get()
            .checked_add(unsettled)
            .ok_or(EngineError::Overflow)
    }

    // --------------------------------------------------------------- allocator

    pub fn surplus(&self, asset_idx: u8, current_value: u128) -> Result<u128> {
        let asset = self.asset(asset_idx)?;
        Ok(verify::surplus(
            current_value,
            asset.principal_liability.get(),
            asset.prize_liability.get(),
        ))
    }

    /// Aggregate surplus over enabled assets; missing values count as zero.
    pub fn total_surplus(&self, asset_values: &[u128]) -> u128 {
        self.assets
            .iter()
            .zip(asset_values.iter())
            .filter(|(a, _)| a.is_enabled())
            .map(|(a, v)| {
                verify::surplus(*v, a.principal_liability.get(), a.prize_liability.get())
            })
            .fold(0u128, |acc, s| acc.saturating_add(s))
    }

    /// Folds each enabled asset's surplus into the winner's reward index for
    /// that asset. Assets the winner holds nothing of keep their surplus for
    /// the next draw.
    fn allocate(&mut self, slot: usize, asset_values: &[u128]) -> Result<u128> {
        let mut total = 0u128;
        for a in 0..MAX_ASSETS {
            if !self.assets[a].is_enabled() {
                continue;
            }
            let value = *asset_values.get(a).ok_or(EngineError::AssetNotFound)?;
            let asset = &self.assets[a];
            let surplus = verify::surplus(
                value,
                asset.principal_liability.get(),
                asset.prize_liability.get(),
            );
            let deposits = self.pools[slot].deposits[a].get();
            if surplus == 0 || deposits == 0 {
                continue;
            }
            let step = mul_div_floor(surplus, SCALE, deposits)?;
            let index = &mut self.pools[slot].reward_index[a];
            index.set(index.get().checked_add(step).ok_or(EngineError::Overflow)?);
            let asset = &mut self.assets[a];
            asset.prize_liability.set(
                asset
                    .prize_liability
                    .get()
                    .checked_add(surplus)
                    .ok_or(EngineError::Overflow)?,
            );
            total = total.saturating_add(surplus);
        }
        Ok(total)
    }

    // ------------------------------------------------------------------- draw

    pub fn pool_weights(&self) -> [u128; MAX_POOLS] {
        let mut weights = [0u128; MAX_POOLS];
        for (w, p) in weights.iter_mut().zip(self.pools.iter()) {
            if p.exists != 0 {
                *w = p.cumulative_weight.get();
            }
        }
        weights
    }

    /// Winning pool id for `randomness`, or `NO_POOL` if no pool has weight.
    pub fn draw(&self, randomness: &[u8; 32]) -> u8 {
        let weights = self.pool_weights();
        match select_winner(&weights, randomness_to_u128(randomness)) {
            Some(slot) => self.pools[slot].id,
            None => NO_POOL,
        }
    }

    // ------------------------------------------------------------------ epochs

    pub fn epoch(&self) -> &Epoch {
        &self.current
    }

    pub fn time_until_close(&self, now: i64) -> u64 {
        self.current.end_ts.saturating_sub(now).max(0) as u64
    }

    pub fn close_epoch(&mut self, now: i64) -> Result<()> {
        self.guarded(|e| {
            if e.current.status() != EpochStatus::Open || now < e.current.end_ts {
                return Err(EngineError::InvalidState);
            }
            e.accrue_all(now);
            e.current.status = EpochStatus::Closed as u8;
            Ok(())
        })
    }

    pub fn request_randomness<O: RandomnessOracle>(&mut self, oracle: &mut O) -> Result<u64> {
        self.guarded(|e| {
            if e.current.status() != EpochStatus::Closed {
                return Err(EngineError::InvalidState);
            }
            let fee = oracle.fee();
            if e.fee_reserve < fee {
                return Err(EngineError::InsufficientFunds);
            }
            let token = oracle.request(e.current.id)?;
            e.fee_reserve -= fee;
            e.current.request_token = token;
            e.current.status = EpochStatus::RandomnessRequested as u8;
            Ok(token)
        })
    }

    /// Oracle delivery. Anything that does not match the outstanding request
    /// is ignored; this never fails.
    pub fn fulfill_randomness(
        &mut self,
        token: u64,
        provider: &[u8; 32],
        randomness: [u8; 32],
    ) -> bool {
        if !verify::callback_accepted(
            self.current.status,
            self.current.request_token,
            token,
            &self.oracle_authority,
            provider,
        ) {
            return false;
        }
        self.current.randomness = randomness;
        self.current.has_randomness = 1;
        self.current.status = EpochStatus::RandomnessReady as u8;
        true
    }

    /// Runs the draw, allocates the prize and opens the next epoch. Returns
    /// the winning pool id (`NO_POOL` when every weight was zero).
    pub fn finalize(&mut self, now: i64, asset_values: &[u128]) -> Result<u8> {
        self.guarded(|e| e.finalize_locked(now, asset_values))
    }

    fn finalize_locked(&mut self, now: i64, asset_values: &[u128]) -> Result<u8> {
        if self.current.status() != EpochStatus::RandomnessReady {
            return Err(EngineError::InvalidState);
        }
        self.accrue_all(now);

        let randomness = self.current.randomness;
        let winner = self.draw(&randomness);
        let prize = if winner != NO_POOL {
            let slot = self.pool_slot(winner)?;
            self.allocate(slot, asset_values)?
        } else {
            0
        };

        self.current.winning_pool = winner;
        self.current.total_prize.set(prize);
        self.current.finalized_ts = now;
        self.history[(self.finalized_count % HISTORY_LEN as u64) as usize] = self.current;
        self.finalized_count += 1;

        for pool in self.pools.iter_mut().filter(|p| p.exists != 0) {
            pool.cumulative_weight = U128::ZERO;
        }

        self.current = Epoch {
            id: self.current.id + 1,
            start_ts: now,
            end_ts: next_boundary(&self.params, now),
            status: EpochStatus::Open as u8,
            ..Epoch::default()
        };
        Ok(winner)
    }

    /// Finalized epochs, most recent first.
    pub fn draw_history(&self) -> impl Iterator<Item = &Epoch> + '_ {
        let n = self.finalized_count;
        let kept = n.min(HISTORY_LEN as u64);
        (0..kept).map(move |k| &self.history[((n - 1 - k) % HISTORY_LEN as u64) as usize])
    }

    pub fn find_epoch(&self, id: u64) -> Option<&Epoch> {
        if id == self.current.id {
            return Some(&self.current);
        }
        self.draw_history().find(|e| e.id == id)
    }

    // -------------------------------------------------------------- automation

    pub fn decide(&self, now: i64, fee: u64) -> (bool, Action) {
        let action = verify::decide_action(
            self.current.status,
            now,
            self.current.end_ts,
            self.fee_reserve,
            fee,
        );
        (action != Action::None, action)
    }

    pub fn execute<O: RandomnessOracle>(
        &mut self,
        action: Action,
        caller: &[u8; 32],
        now: i64,
        oracle: &mut O,
        asset_values: &[u128],
    ) -> Result<()> {
        if !verify::automation_caller_ok(&self.automation_caller, caller) {
            return Err(EngineError::Unauthorized);
        }
        match action {
            Action::None => match self.decide(now, oracle.fee()) {
                (false, _) => Ok(()),
                (true, _) => Err(EngineError::InvalidState),
            },
            Action::Close => self.close_epoch(now),
            Action::RequestRandomness => self.request_randomness(oracle).map(|_| ()),
            Action::Finalize => self.finalize(now, asset_values).map(|_| ()),
        }
    }

    // -------------------------------------------------------------- invariants

    /// Principal liability equals the sum of position principal, per asset.
    pub fn check_conservation(&self) -> bool {
        let mut sums = [0u128; MAX_ASSETS];
        let mut pool_sums = [0u128; MAX_ASSETS];
        for i in (0..MAX_POSITIONS).filter(|i| self.is_used(*i)) {
            let p = &self.positions[i];
            sums[p.asset as usize] = sums[p.asset as usize].saturating_add(p.principal.get());
        }
        for pool in self.pools.iter().filter(|p| p.exists != 0) {
            for (s, d) in pool_sums.iter_mut().zip(pool.deposits.iter()) {
                *s = s.saturating_add(d.get());
            }
        }
        self.assets.iter().enumerate().all(|(a, asset)| {
            asset.principal_liability.get() == sums[a] && pool_sums[a] == sums[a]
        })
    }
}
