//! Prizepool: single-file Solana program around the prize-savings engine.

#![deny(unsafe_code)]

pub mod engine;

// 1. mod constants
pub mod constants {
    use core::mem::{align_of, size_of};
    use crate::engine::LotteryEngine;
    use crate::state::LotteryConfig;

    pub const MAGIC: u64 = 0x4f4f_5045_5a49_5250; // "PRIZEPOO"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = 64;
    pub const CONFIG_LEN: usize = size_of::<LotteryConfig>();
    pub const ENGINE_ALIGN: usize = align_of::<LotteryEngine>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const ENGINE_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, ENGINE_ALIGN);
    pub const ENGINE_LEN: usize = size_of::<LotteryEngine>();
    pub const SLAB_LEN: usize = ENGINE_OFF + ENGINE_LEN;

    /// Deposit with this index opens (or finds) the caller's position.
    pub const NEW_POSITION: u16 = u16::MAX;

    pub const VAULT_SEED: &[u8] = b"vault";
    pub const RANDOMNESS_SEED: &[u8] = b"randomness";
}

// 2. mod zc (zero-copy engine view)
pub mod zc {
    use solana_program::program_error::ProgramError;
    use crate::constants::{ENGINE_LEN, ENGINE_OFF};
    use crate::engine::LotteryEngine;

    #[inline]
    pub fn engine_ref(data: &[u8]) -> Result<&LotteryEngine, ProgramError> {
        let bytes = data
            .get(ENGINE_OFF..ENGINE_OFF + ENGINE_LEN)
            .ok_or(ProgramError::InvalidAccountData)?;
        bytemuck::try_from_bytes(bytes).map_err(|_| ProgramError::InvalidAccountData)
    }

    #[inline]
    pub fn engine_mut(data: &mut [u8]) -> Result<&mut LotteryEngine, ProgramError> {
        let bytes = data
            .get_mut(ENGINE_OFF..ENGINE_OFF + ENGINE_LEN)
            .ok_or(ProgramError::InvalidAccountData)?;
        bytemuck::try_from_bytes_mut(bytes).map_err(|_| ProgramError::InvalidAccountData)
    }
}

// 3. mod error
pub mod error {
    use num_derive::FromPrimitive;
    use solana_program::{
        decode_error::DecodeError,
        msg,
        program_error::{PrintProgramError, ProgramError},
    };
    use thiserror::Error;
    use crate::engine::EngineError;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Error, FromPrimitive)]
    pub enum PrizeError {
        #[error("Slab version mismatch")]
        InvalidVersion,
        #[error("Lottery already initialized")]
        AlreadyInitialized,
        #[error("Lottery not initialized")]
        NotInitialized,
        #[error("Slab account has the wrong length")]
        InvalidSlabLen,
        #[error("Vault token account is not owned by the vault authority")]
        InvalidVaultAta,
        #[error("Mint does not match the registered asset")]
        InvalidMint,
        #[error("Account must sign")]
        ExpectedSigner,
        #[error("Account must be writable")]
        ExpectedWritable,
        #[error("Oracle fee receiver mismatch")]
        InvalidFeeReceiver,
        #[error("Admin signature required")]
        AdminOnly,
        #[error("Unknown automation action")]
        InvalidAction,
        #[error("Position belongs to another asset")]
        PositionAssetMismatch,
        // Engine errors mapped:
        #[error("Operation invalid for the current epoch status")]
        EngineInvalidState,
        #[error("Unknown pool")]
        EnginePoolNotFound,
        #[error("Unknown asset")]
        EngineAssetNotFound,
        #[error("Unknown position")]
        EnginePositionNotFound,
        #[error("Amount exceeds recorded balance")]
        EngineInsufficientBalance,
        #[error("Cannot cover the randomness fee")]
        EngineInsufficientFunds,
        #[error("Caller not authorized")]
        EngineUnauthorized,
        #[error("Yield facility does not hold the registered asset")]
        EngineAssetMismatch,
        #[error("Asset already registered")]
        EngineDuplicateAsset,
        #[error("Asset table full")]
        EngineAssetTableFull,
        #[error("Asset still has deposits")]
        EngineAssetHasDeposits,
        #[error("Asset disabled")]
        EngineAssetDisabled,
        #[error("Invalid lottery parameters")]
        EngineInvalidParams,
        #[error("Amount must be nonzero")]
        EngineZeroAmount,
        #[error("Deposits and claims are paused")]
        EnginePaused,
        #[error("Reentrant call rejected")]
        EngineReentrancy,
        #[error("Position table full")]
        EnginePositionTableFull,
        #[error("Arithmetic overflow")]
        EngineOverflow,
        #[error("Yield facility transfer failed")]
        EngineVaultFailure,
    }

    impl From<PrizeError> for ProgramError {
        fn from(e: PrizeError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    impl<T> DecodeError<T> for PrizeError {
        fn type_of() -> &'static str {
            "PrizeError"
        }
    }

    impl PrintProgramError for PrizeError {
        fn print<E>(&self)
        where
            E: 'static
                + std::error::Error
                + DecodeError<E>
                + PrintProgramError
                + num_traits::FromPrimitive,
        {
            msg!("Error: {}", self);
        }
    }

    pub fn engine_error(e: EngineError) -> PrizeError {
        match e {
            EngineError::InvalidState => PrizeError::EngineInvalidState,
            EngineError::PoolNotFound => PrizeError::EnginePoolNotFound,
            EngineError::AssetNotFound => PrizeError::EngineAssetNotFound,
            EngineError::PositionNotFound => PrizeError::EnginePositionNotFound,
            EngineError::InsufficientBalance => PrizeError::EngineInsufficientBalance,
            EngineError::InsufficientFunds => PrizeError::EngineInsufficientFunds,
            EngineError::Unauthorized => PrizeError::EngineUnauthorized,
            EngineError::AssetMismatch => PrizeError::EngineAssetMismatch,
            EngineError::DuplicateAsset => PrizeError::EngineDuplicateAsset,
            EngineError::AssetTableFull => PrizeError::EngineAssetTableFull,
            EngineError::AssetHasDeposits => PrizeError::EngineAssetHasDeposits,
            EngineError::AssetDisabled => PrizeError::EngineAssetDisabled,
            EngineError::InvalidParams => PrizeError::EngineInvalidParams,
            EngineError::ZeroAmount => PrizeError::EngineZeroAmount,
            EngineError::Paused => PrizeError::EnginePaused,
            EngineError::Reentrancy => PrizeError::EngineReentrancy,
            EngineError::PositionTableFull => PrizeError::EnginePositionTableFull,
            EngineError::Overflow => PrizeError::EngineOverflow,
            EngineError::VaultFailure => PrizeError::EngineVaultFailure,
        }
    }

    pub fn map_engine_error(e: EngineError) -> ProgramError {
        engine_error(e).into()
    }
}

// 4. mod ix
pub mod ix {
    use arrayref::array_ref;
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};

    pub const TAG_INIT_LOTTERY: u8 = 0;
    pub const TAG_REGISTER_ASSET: u8 = 1;
    pub const TAG_DISABLE_ASSET: u8 = 2;
    pub const TAG_SET_PAUSED: u8 = 3;
    pub const TAG_SET_AUTOMATION_CALLER: u8 = 4;
    pub const TAG_DEPOSIT: u8 = 5;
    pub const TAG_WITHDRAW: u8 = 6;
    pub const TAG_CLAIM: u8 = 7;
    pub const TAG_FUND_ORACLE_FEES: u8 = 8;
    pub const TAG_CLOSE_EPOCH: u8 = 9;
    pub const TAG_REQUEST_RANDOMNESS: u8 = 10;
    pub const TAG_FULFILL_RANDOMNESS: u8 = 11;
    pub const TAG_FINALIZE_DRAW: u8 = 12;
    pub const TAG_CRANK: u8 = 13;

    #[derive(Debug, PartialEq, Eq)]
    pub enum Instruction {
        InitLottery {
            epoch_duration_secs: u64,
            schedule_anchor_ts: i64,
            num_pools: u8,
            oracle_authority: Pubkey,
            oracle_fee_receiver: Pubkey,
            oracle_fee_lamports: u64,
        },
        RegisterAsset,
        DisableAsset { asset_idx: u8 },
        SetPaused { paused: bool },
        SetAutomationCaller { caller: Pubkey },
        Deposit { asset_idx: u8, position_idx: u16, amount: u64 },
        Withdraw { position_idx: u16, amount: u64 },
        Claim { position_idx: u16 },
        FundOracleFees { lamports: u64 },
        CloseEpoch,
        RequestRandomness,
        FulfillRandomness { request_token: u64, randomness: [u8; 32] },
        FinalizeDraw,
        Crank { action: u8 },
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                TAG_INIT_LOTTERY => {
                    let epoch_duration_secs = read_u64(&mut rest)?;
                    let schedule_anchor_ts = read_i64(&mut rest)?;
                    let num_pools = read_u8(&mut rest)?;
                    let oracle_authority = read_pubkey(&mut rest)?;
                    let oracle_fee_receiver = read_pubkey(&mut rest)?;
                    let oracle_fee_lamports = read_u64(&mut rest)?;
                    Ok(Instruction::InitLottery {
                        epoch_duration_secs, schedule_anchor_ts, num_pools,
                        oracle_authority, oracle_fee_receiver, oracle_fee_lamports,
                    })
                },
                TAG_REGISTER_ASSET => Ok(Instruction::RegisterAsset),
                TAG_DISABLE_ASSET => {
                    let asset_idx = read_u8(&mut rest)?;
                    Ok(Instruction::DisableAsset { asset_idx })
                },
                TAG_SET_PAUSED => {
                    let paused = read_u8(&mut rest)? != 0;
                    Ok(Instruction::SetPaused { paused })
                },
                TAG_SET_AUTOMATION_CALLER => {
                    let caller = read_pubkey(&mut rest)?;
                    Ok(Instruction::SetAutomationCaller { caller })
                },
                TAG_DEPOSIT => {
                    let asset_idx = read_u8(&mut rest)?;
                    let position_idx = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::Deposit { asset_idx, position_idx, amount })
                },
                TAG_WITHDRAW => {
                    let position_idx = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::Withdraw { position_idx, amount })
                },
                TAG_CLAIM => {
                    let position_idx = read_u16(&mut rest)?;
                    Ok(Instruction::Claim { position_idx })
                },
                TAG_FUND_ORACLE_FEES => {
                    let lamports = read_u64(&mut rest)?;
                    Ok(Instruction::FundOracleFees { lamports })
                },
                TAG_CLOSE_EPOCH => Ok(Instruction::CloseEpoch),
                TAG_REQUEST_RANDOMNESS => Ok(Instruction::RequestRandomness),
                TAG_FULFILL_RANDOMNESS => {
                    let request_token = read_u64(&mut rest)?;
                    let randomness = read_bytes32(&mut rest)?;
                    Ok(Instruction::FulfillRandomness { request_token, randomness })
                },
                TAG_FINALIZE_DRAW => Ok(Instruction::FinalizeDraw),
                TAG_CRANK => {
                    let action = read_u8(&mut rest)?;
                    Ok(Instruction::Crank { action })
                },
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], ProgramError> {
        if input.len() < n { return Err(ProgramError::InvalidInstructionData); }
        let (bytes, rest) = input.split_at(n);
        *input = rest;
        Ok(bytes)
    }

    fn read_u8(input: &mut &[u8]) -> Result<u8, ProgramError> {
        let (&val, rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;
        *input = rest;
        Ok(val)
    }

    fn read_u16(input: &mut &[u8]) -> Result<u16, ProgramError> {
        let bytes = take(input, 2)?;
        Ok(u16::from_le_bytes(*array_ref![bytes, 0, 2]))
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        let bytes = take(input, 8)?;
        Ok(u64::from_le_bytes(*array_ref![bytes, 0, 8]))
    }

    fn read_i64(input: &mut &[u8]) -> Result<i64, ProgramError> {
        let bytes = take(input, 8)?;
        Ok(i64::from_le_bytes(*array_ref![bytes, 0, 8]))
    }

    fn read_bytes32(input: &mut &[u8]) -> Result<[u8; 32], ProgramError> {
        let bytes = take(input, 32)?;
        Ok(*array_ref![bytes, 0, 32])
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        Ok(Pubkey::new_from_array(read_bytes32(input)?))
    }
}

// 5. mod accounts
pub mod accounts {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};
    use crate::constants::VAULT_SEED;
    use crate::error::PrizeError;

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(PrizeError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(PrizeError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_owner(ai: &AccountInfo, owner: &Pubkey) -> Result<(), ProgramError> {
        if ai.owner != owner {
            return Err(ProgramError::IllegalOwner);
        }
        Ok(())
    }

    pub fn expect_key(ai: &AccountInfo, expected: &Pubkey) -> Result<(), ProgramError> {
        if ai.key != expected {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }

    pub fn derive_vault_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[VAULT_SEED, slab_key.as_ref()], program_id)
    }
}

// 6. mod state
pub mod state {
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use solana_program::account_info::AccountInfo;
    use solana_program::program_error::ProgramError;
    use crate::constants::{CONFIG_LEN, HEADER_LEN};

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SlabHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        pub _padding: [u8; 3],
        pub admin: [u8; 32],
        pub _reserved: [u8; 16],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct LotteryConfig {
        pub oracle_fee_receiver: [u8; 32],
        pub oracle_fee_lamports: u64,
        pub vault_authority_bump: u8,
        pub _padding: [u8; 7],
    }

    pub fn slab_data_mut<'a, 'b>(ai: &'b AccountInfo<'a>) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_mut_data()?)
    }

    pub fn read_header(data: &[u8]) -> SlabHeader {
        let mut h = SlabHeader::zeroed();
        let src = &data[..HEADER_LEN];
        let dst = bytemuck::bytes_of_mut(&mut h);
        dst.copy_from_slice(src);
        h
    }

    pub fn write_header(data: &mut [u8], h: &SlabHeader) {
        let src = bytemuck::bytes_of(h);
        let dst = &mut data[..HEADER_LEN];
        dst.copy_from_slice(src);
    }

    pub fn read_config(data: &[u8]) -> LotteryConfig {
        let mut c = LotteryConfig::zeroed();
        let src = &data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        let dst = bytemuck::bytes_of_mut(&mut c);
        dst.copy_from_slice(src);
        c
    }

    pub fn write_config(data: &mut [u8], c: &LotteryConfig) {
        let src = bytemuck::bytes_of(c);
        let dst = &mut data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        dst.copy_from_slice(src);
    }
}

// 7. mod vault (asset custody, the yield facility seen by the engine)
pub mod vault {
    use solana_program::{
        account_info::AccountInfo, program_error::ProgramError, program_pack::Pack,
    };
    use spl_token::state::Account as TokenAccount;
    use crate::engine::{self, EngineError, YieldVault};

    #[cfg(not(test))]
    use solana_program::program::invoke_signed;

    pub fn read_token_account(ai: &AccountInfo) -> Result<TokenAccount, ProgramError> {
        let data = ai.try_borrow_data()?;
        TokenAccount::unpack(&data)
    }

    pub fn transfer<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke_signed(&ix, &[source.clone(), dest.clone(), _authority.clone(), _token_program.clone()], _signer_seeds)
        }
        #[cfg(test)]
        {
            let mut src_data = source.try_borrow_mut_data()?;
            let mut src_state = TokenAccount::unpack(&src_data)?;
            src_state.amount = src_state.amount.checked_sub(amount).ok_or(ProgramError::InsufficientFunds)?;
            TokenAccount::pack(src_state, &mut src_data)?;

            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state.amount.checked_add(amount).ok_or(ProgramError::InvalidAccountData)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }

    /// An asset's vault token account. Shares are 1:1 with token units and
    /// the current value is the vault balance, so yield is whatever an
    /// external strategy transfers in.
    pub struct TokenVault<'a, 'c> {
        pub token_program: &'c AccountInfo<'a>,
        pub vault: &'c AccountInfo<'a>,
        pub user_ata: &'c AccountInfo<'a>,
        /// Depositor for inbound transfers, vault PDA for outbound ones.
        pub authority: &'c AccountInfo<'a>,
        pub signer_seeds: &'c [&'c [&'c [u8]]],
    }

    impl<'a, 'c> YieldVault for TokenVault<'a, 'c> {
        fn asset_id(&self) -> [u8; 32] {
            read_token_account(self.vault)
                .map(|t| t.mint.to_bytes())
                .unwrap_or([0u8; 32])
        }

        fn deposit(&mut self, amount: u128) -> engine::Result<u128> {
            let units = u64::try_from(amount).map_err(|_| EngineError::Overflow)?;
            transfer(self.token_program, self.user_ata, self.vault, self.authority, units, &[])
                .map_err(|_| EngineError::VaultFailure)?;
            Ok(amount)
        }

        fn withdraw(&mut self, amount: u128, recipient: &[u8; 32]) -> engine::Result<u128> {
            let units = u64::try_from(amount).map_err(|_| EngineError::Overflow)?;
            let dest = read_token_account(self.user_ata).map_err(|_| EngineError::VaultFailure)?;
            if dest.owner.to_bytes() != *recipient {
                return Err(EngineError::Unauthorized);
            }
            transfer(self.token_program, self.vault, self.user_ata, self.authority, units, self.signer_seeds)
                .map_err(|_| EngineError::VaultFailure)?;
            Ok(amount)
        }

        fn current_value(&self) -> u128 {
            read_token_account(self.vault)
                .map(|t| t.amount as u128)
                .unwrap_or(0)
        }
    }
}

// 8. mod randomness
pub mod randomness {
    use solana_program::{account_info::AccountInfo, hash::hashv, program_error::ProgramError, pubkey::Pubkey};
    use crate::constants::RANDOMNESS_SEED;
    use crate::engine::{self, EngineError, RandomnessOracle};

    #[cfg(not(test))]
    use solana_program::{program::invoke, system_instruction};

    pub fn request_token(slab: &Pubkey, epoch_id: u64, slot: u64) -> u64 {
        let digest = hashv(&[
            RANDOMNESS_SEED,
            slab.as_ref(),
            &epoch_id.to_le_bytes(),
            &slot.to_le_bytes(),
        ])
        .to_bytes();
        u64::from_le_bytes(*arrayref::array_ref![digest, 0, 8])
    }

    /// Moves lamports from `payer` into the slab's fee reserve.
    pub fn fund<'a>(
        payer: &AccountInfo<'a>,
        slab: &AccountInfo<'a>,
        _system_program: &AccountInfo<'a>,
        lamports: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = system_instruction::transfer(payer.key, slab.key, lamports);
            invoke(&ix, &[payer.clone(), slab.clone(), _system_program.clone()])
        }
        #[cfg(test)]
        {
            let mut from = payer.try_borrow_mut_lamports()?;
            **from = (**from).checked_sub(lamports).ok_or(ProgramError::InsufficientFunds)?;
            let mut to = slab.try_borrow_mut_lamports()?;
            **to = (**to).checked_add(lamports).ok_or(ProgramError::InvalidAccountData)?;
            Ok(())
        }
    }

    /// Pays the oracle fee out of the slab's lamports. The token is derived
    /// from the slab, epoch and slot, so each request gets a fresh one.
    /// Without a fee receiver the adapter can quote its fee but not request.
    pub struct LamportFeeOracle<'a, 'c> {
        pub slab: &'c AccountInfo<'a>,
        pub fee_receiver: Option<&'c AccountInfo<'a>>,
        pub fee: u64,
        pub slot: u64,
    }

    impl<'a, 'c> RandomnessOracle for LamportFeeOracle<'a, 'c> {
        fn fee(&self) -> u64 {
            self.fee
        }

        fn request(&mut self, epoch_id: u64) -> engine::Result<u64> {
            let receiver = self.fee_receiver.ok_or(EngineError::InvalidState)?;
            let mut from = self.slab.try_borrow_mut_lamports().map_err(|_| EngineError::VaultFailure)?;
            **from = (**from).checked_sub(self.fee).ok_or(EngineError::InsufficientFunds)?;
            let mut to = receiver.try_borrow_mut_lamports().map_err(|_| EngineError::VaultFailure)?;
            **to = (**to).checked_add(self.fee).ok_or(EngineError::Overflow)?;
            Ok(request_token(self.slab.key, epoch_id, self.slot))
        }
    }
}

// 9. mod processor
pub mod processor {
    use solana_program::{
        account_info::AccountInfo, entrypoint::ProgramResult, msg, pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
        program_error::ProgramError,
        program_pack::Pack,
    };
    use crate::{
        ix::{self, Instruction},
        state::{self, SlabHeader, LotteryConfig},
        accounts,
        constants::{MAGIC, VERSION, SLAB_LEN, NEW_POSITION, VAULT_SEED},
        error::{PrizeError, map_engine_error},
        engine::{Action, LotteryEngine, LotteryParams, MAX_ASSETS},
        randomness::{self, LamportFeeOracle},
        vault::{self, TokenVault},
        zc,
    };

    fn slab_guard(program_id: &Pubkey, slab: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        accounts::expect_owner(slab, program_id)?;
        if data.len() != SLAB_LEN { return Err(PrizeError::InvalidSlabLen.into()); }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC { return Err(PrizeError::NotInitialized.into()); }
        if h.version != VERSION { return Err(PrizeError::InvalidVersion.into()); }
        Ok(())
    }

    fn require_admin(data: &[u8], signer: &AccountInfo) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if !crate::verify::admin_ok(&h.admin, &signer.key.to_bytes()) {
            return Err(PrizeError::AdminOnly.into());
        }
        Ok(())
    }

    fn check_owner(engine: &LotteryEngine, idx: u16, user: &Pubkey) -> Result<(), ProgramError> {
        let pos = engine.position(idx).map_err(map_engine_error)?;
        if !crate::verify::owner_ok(&pos.owner, &user.to_bytes()) {
            return Err(PrizeError::EngineUnauthorized.into());
        }
        Ok(())
    }

    fn verify_vault(a_vault: &AccountInfo, expected_owner: &Pubkey, expected_mint: &Pubkey, expected_pubkey: &Pubkey) -> Result<(), ProgramError> {
        if a_vault.key != expected_pubkey { return Err(PrizeError::InvalidVaultAta.into()); }
        if a_vault.owner != &spl_token::ID { return Err(PrizeError::InvalidVaultAta.into()); }
        if a_vault.data_len() != spl_token::state::Account::LEN { return Err(PrizeError::InvalidVaultAta.into()); }

        let tok = vault::read_token_account(a_vault)?;
        if tok.mint != *expected_mint { return Err(PrizeError::InvalidMint.into()); }
        if tok.owner != *expected_owner { return Err(PrizeError::InvalidVaultAta.into()); }
        Ok(())
    }

    /// Vault balances for every enabled asset, read from `vaults` in slot order.
    fn collect_asset_values(
        engine: &LotteryEngine,
        vault_authority: &Pubkey,
        vaults: &[AccountInfo],
    ) -> Result<[u128; MAX_ASSETS], ProgramError> {
        let mut values = [0u128; MAX_ASSETS];
        let mut next = vaults.iter();
        for (i, asset) in engine.assets.iter().enumerate() {
            if !asset.is_enabled() { continue; }
            let a_vault = next.next().ok_or(ProgramError::NotEnoughAccountKeys)?;
            verify_vault(
                a_vault,
                vault_authority,
                &Pubkey::new_from_array(asset.mint),
                &Pubkey::new_from_array(asset.vault),
            )?;
            values[i] = vault::read_token_account(a_vault)?.amount as u128;
        }
        Ok(values)
    }

    fn log_outcome(engine: &LotteryEngine) {
        if let Some(last) = engine.draw_history().next() {
            msg!(
                "Draw finalized: epoch={} winner={} prize={} next_epoch={} closes_at={}",
                last.id,
                last.winning_pool,
                last.total_prize.get(),
                engine.epoch().id,
                engine.epoch().end_ts
            );
        }
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        // The randomness callback must never fail, whatever it is sent.
        if instruction_data.first() == Some(&ix::TAG_FULFILL_RANDOMNESS) {
            fulfill_randomness(program_id, accounts, instruction_data);
            return Ok(());
        }

        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitLottery {
                epoch_duration_secs, schedule_anchor_ts, num_pools,
                oracle_authority, oracle_fee_receiver, oracle_fee_lamports,
            } => {
                accounts::expect_len(accounts, 3)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;

                let header = state::read_header(&data);
                if header.magic == MAGIC { return Err(PrizeError::AlreadyInitialized.into()); }

                let clock = Clock::from_account_info(a_clock)?;
                let (_, bump) = accounts::derive_vault_authority(program_id, a_slab.key);

                for b in data.iter_mut() { *b = 0; }

                let params = LotteryParams {
                    epoch_duration_secs,
                    schedule_anchor_ts,
                    num_pools: num_pools as u64,
                };
                {
                    let engine = zc::engine_mut(&mut data)?;
                    engine
                        .init(params, a_admin.key.to_bytes(), oracle_authority.to_bytes(), clock.unix_timestamp)
                        .map_err(map_engine_error)?;
                    msg!("Lottery initialized: pools={} epoch=1 closes_at={}", num_pools, engine.epoch().end_ts);
                }

                let config = LotteryConfig {
                    oracle_fee_receiver: oracle_fee_receiver.to_bytes(),
                    oracle_fee_lamports,
                    vault_authority_bump: bump,
                    _padding: [0; 7],
                };
                state::write_config(&mut data, &config);

                let new_header = SlabHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    _padding: [0; 3],
                    admin: a_admin.key.to_bytes(),
                    _reserved: [0; 16],
                };
                state::write_header(&mut data, &new_header);
            },
            Instruction::RegisterAsset => {
                accounts::expect_len(accounts, 4)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_mint = &accounts[2];
                let a_vault = &accounts[3];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                accounts::expect_owner(a_mint, &spl_token::ID)?;
                let decimals = {
                    let mint_data = a_mint.try_borrow_data()?;
                    spl_token::state::Mint::unpack(&mint_data)?.decimals
                };

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(a_vault, &auth, a_mint.key, a_vault.key)?;

                let engine = zc::engine_mut(&mut data)?;
                let idx = engine
                    .register_asset(a_mint.key.to_bytes(), a_vault.key.to_bytes(), decimals)
                    .map_err(map_engine_error)?;
                msg!("Asset registered: idx={} mint={} decimals={}", idx, a_mint.key, decimals);
            },
            Instruction::DisableAsset { asset_idx } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let engine = zc::engine_mut(&mut data)?;
                engine.disable_asset(asset_idx).map_err(map_engine_error)?;
                msg!("Asset disabled: idx={}", asset_idx);
            },
            Instruction::SetPaused { paused } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let engine = zc::engine_mut(&mut data)?;
                engine.set_paused(paused);
                msg!("Paused: {}", paused);
            },
            Instruction::SetAutomationCaller { caller } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let engine = zc::engine_mut(&mut data)?;
                engine.set_automation_caller(caller.to_bytes());
                msg!("Automation caller set: {}", caller);
            },
            Instruction::Deposit { asset_idx, position_idx, amount } => {
                accounts::expect_len(accounts, 6)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_user_ata = &accounts[2];
                let a_vault = &accounts[3];
                let a_token = &accounts[4];
                let a_clock = &accounts[5];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;
                accounts::expect_key(a_token, &spl_token::ID)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let clock = Clock::from_account_info(a_clock)?;
                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);

                let engine = zc::engine_mut(&mut data)?;
                let asset = *engine.asset(asset_idx).map_err(map_engine_error)?;
                verify_vault(a_vault, &auth, &Pubkey::new_from_array(asset.mint), &Pubkey::new_from_array(asset.vault))?;

                let idx = if position_idx == NEW_POSITION {
                    let owner = a_user.key.to_bytes();
                    let pool = engine.assign_pool(&owner);
                    engine.open_position(asset_idx, pool, owner).map_err(map_engine_error)?
                } else {
                    check_owner(engine, position_idx, a_user.key)?;
                    position_idx
                };
                if engine.positions[idx as usize].asset != asset_idx {
                    return Err(PrizeError::PositionAssetMismatch.into());
                }

                let mut facility = TokenVault {
                    token_program: a_token,
                    vault: a_vault,
                    user_ata: a_user_ata,
                    authority: a_user,
                    signer_seeds: &[],
                };
                engine
                    .deposit(&mut facility, idx, amount as u128, clock.unix_timestamp)
                    .map_err(map_engine_error)?;
                msg!("Deposit: position={} pool={} amount={}", idx, engine.positions[idx as usize].pool, amount);
            },
            Instruction::Withdraw { position_idx, amount } => {
                accounts::expect_len(accounts, 7)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_user_ata = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];
                let a_clock = &accounts[6];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;
                accounts::expect_key(a_token, &spl_token::ID)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let clock = Clock::from_account_info(a_clock)?;
                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;

                let engine = zc::engine_mut(&mut data)?;
                check_owner(engine, position_idx, a_user.key)?;
                let asset_idx = engine.positions[position_idx as usize].asset;
                let asset = *engine.asset(asset_idx).map_err(map_engine_error)?;
                verify_vault(a_vault, &derived_pda, &Pubkey::new_from_array(asset.mint), &Pubkey::new_from_array(asset.vault))?;

                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seeds: [&[u8]; 3] = [VAULT_SEED, a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                let mut facility = TokenVault {
                    token_program: a_token,
                    vault: a_vault,
                    user_ata: a_user_ata,
                    authority: a_vault_pda,
                    signer_seeds: &signer_seeds,
                };
                engine
                    .withdraw(&mut facility, position_idx, amount as u128, clock.unix_timestamp)
                    .map_err(map_engine_error)?;
                msg!("Withdraw: position={} amount={}", position_idx, amount);
            },
            Instruction::Claim { position_idx } => {
                accounts::expect_len(accounts, 6)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_user_ata = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;
                accounts::expect_key(a_token, &spl_token::ID)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;

                let engine = zc::engine_mut(&mut data)?;
                check_owner(engine, position_idx, a_user.key)?;
                let asset_idx = engine.positions[position_idx as usize].asset;
                let asset = *engine.asset(asset_idx).map_err(map_engine_error)?;
                verify_vault(a_vault, &derived_pda, &Pubkey::new_from_array(asset.mint), &Pubkey::new_from_array(asset.vault))?;

                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seeds: [&[u8]; 3] = [VAULT_SEED, a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                let mut facility = TokenVault {
                    token_program: a_token,
                    vault: a_vault,
                    user_ata: a_user_ata,
                    authority: a_vault_pda,
                    signer_seeds: &signer_seeds,
                };
                let paid = engine.claim(&mut facility, position_idx).map_err(map_engine_error)?;
                msg!("Claim: position={} paid={}", position_idx, paid);
            },
            Instruction::FundOracleFees { lamports } => {
                accounts::expect_len(accounts, 3)?;
                let a_payer = &accounts[0];
                let a_slab = &accounts[1];
                let a_system = &accounts[2];

                accounts::expect_signer(a_payer)?;
                accounts::expect_writable(a_slab)?;
                accounts::expect_key(a_system, &solana_program::system_program::id())?;

                {
                    let data = a_slab.try_borrow_data()?;
                    slab_guard(program_id, a_slab, &data)?;
                    require_initialized(&data)?;
                }
                if lamports == 0 { return Err(PrizeError::EngineZeroAmount.into()); }

                // CPI first: the slab data must not be borrowed across it.
                randomness::fund(a_payer, a_slab, a_system, lamports)?;

                let mut data = state::slab_data_mut(a_slab)?;
                let engine = zc::engine_mut(&mut data)?;
                engine.fund_fees(lamports).map_err(map_engine_error)?;
                msg!("Oracle fees funded: +{} reserve={}", lamports, engine.fee_reserve);
            },
            Instruction::CloseEpoch => {
                accounts::expect_len(accounts, 3)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let clock = Clock::from_account_info(a_clock)?;
                let engine = zc::engine_mut(&mut data)?;
                engine.close_epoch(clock.unix_timestamp).map_err(map_engine_error)?;
                msg!("Epoch {} closed", engine.epoch().id);
            },
            Instruction::RequestRandomness => {
                accounts::expect_len(accounts, 4)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];
                let a_fee_receiver = &accounts[3];

                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;
                accounts::expect_writable(a_fee_receiver)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);
                if a_fee_receiver.key.to_bytes() != config.oracle_fee_receiver {
                    return Err(PrizeError::InvalidFeeReceiver.into());
                }

                let clock = Clock::from_account_info(a_clock)?;
                let mut oracle = LamportFeeOracle {
                    slab: a_slab,
                    fee_receiver: Some(a_fee_receiver),
                    fee: config.oracle_fee_lamports,
                    slot: clock.slot,
                };
                let engine = zc::engine_mut(&mut data)?;
                let token = engine.request_randomness(&mut oracle).map_err(map_engine_error)?;
                msg!("Randomness requested: epoch={} token={}", engine.epoch().id, token);
            },
            Instruction::FulfillRandomness { .. } => {
                // handled before decode
            },
            Instruction::FinalizeDraw => {
                accounts::expect_len(accounts, 3)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let clock = Clock::from_account_info(a_clock)?;
                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);

                let engine = zc::engine_mut(&mut data)?;
                let values = collect_asset_values(engine, &auth, &accounts[3..])?;
                engine.finalize(clock.unix_timestamp, &values).map_err(map_engine_error)?;
                log_outcome(engine);
            },
            Instruction::Crank { action } => {
                accounts::expect_len(accounts, 3)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;

                let action = Action::from_code(action).ok_or(PrizeError::InvalidAction)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                // Only a randomness request pays the oracle.
                let fee_receiver = if action == Action::RequestRandomness {
                    accounts::expect_len(accounts, 4)?;
                    let a_fee_receiver = &accounts[3];
                    accounts::expect_writable(a_fee_receiver)?;
                    if a_fee_receiver.key.to_bytes() != config.oracle_fee_receiver {
                        return Err(PrizeError::InvalidFeeReceiver.into());
                    }
                    Some(a_fee_receiver)
                } else {
                    None
                };

                let clock = Clock::from_account_info(a_clock)?;
                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);

                let mut oracle = LamportFeeOracle {
                    slab: a_slab,
                    fee_receiver,
                    fee: config.oracle_fee_lamports,
                    slot: clock.slot,
                };
                let engine = zc::engine_mut(&mut data)?;
                let values = if action == Action::Finalize {
                    collect_asset_values(engine, &auth, &accounts[3..])?
                } else {
                    [0u128; MAX_ASSETS]
                };
                engine
                    .execute(action, &a_caller.key.to_bytes(), clock.unix_timestamp, &mut oracle, &values)
                    .map_err(map_engine_error)?;
                msg!("Crank executed: {:?} epoch={}", action, engine.epoch().id);
                if action == Action::Finalize {
                    log_outcome(engine);
                }
            },
        }
        Ok(())
    }

    /// Oracle callback. Every failure is logged and absorbed.
    fn fulfill_randomness(program_id: &Pubkey, accounts: &[AccountInfo], instruction_data: &[u8]) {
        let outcome = (|| -> Result<bool, ProgramError> {
            let (request_token, randomness) = match Instruction::decode(instruction_data)? {
                Instruction::FulfillRandomness { request_token, randomness } => (request_token, randomness),
                _ => return Ok(false),
            };
            accounts::expect_len(accounts, 2)?;
            let a_oracle = &accounts[0];
            let a_slab = &accounts[1];
            if !a_oracle.is_signer || !a_slab.is_writable {
                return Ok(false);
            }

            let mut data = state::slab_data_mut(a_slab)?;
            slab_guard(program_id, a_slab, &data)?;
            require_initialized(&data)?;

            let engine = zc::engine_mut(&mut data)?;
            Ok(engine.fulfill_randomness(request_token, &a_oracle.key.to_bytes(), randomness))
        })();

        match outcome {
            Ok(true) => msg!("Randomness delivered"),
            Ok(false) => msg!("Randomness callback ignored"),
            Err(e) => msg!("Randomness callback ignored: {}", e),
        }
    }
}

// 10. mod entrypoint
#[cfg(not(feature = "no-entrypoint"))]
pub mod entrypoint {
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult,
        program_error::PrintProgramError, pubkey::Pubkey,
    };
    use crate::{error::PrizeError, processor};

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        if let Err(error) = processor::process_instruction(program_id, accounts, instruction_data) {
            error.print::<PrizeError>();
            return Err(error);
        }
        Ok(())
    }
}

// 11. mod verify (pure decision helpers, shared with the kani harnesses)
pub mod verify {
    use num_traits::FromPrimitive;
    use crate::engine::{Action, EpochStatus};

    /// Never negative: value at or below liabilities yields zero.
    #[inline]
    pub fn surplus(value: u128, principal: u128, prize: u128) -> u128 {
        value.saturating_sub(principal.saturating_add(prize))
    }

    #[inline]
    pub fn owner_ok(stored: &[u8; 32], signer: &[u8; 32]) -> bool {
        stored == signer
    }

    #[inline]
    pub fn admin_ok(admin: &[u8; 32], signer: &[u8; 32]) -> bool {
        *admin != [0u8; 32] && admin == signer
    }

    /// An all-zero configured caller leaves automation open to anyone.
    #[inline]
    pub fn automation_caller_ok(configured: &[u8; 32], caller: &[u8; 32]) -> bool {
        *configured == [0u8; 32] || configured == caller
    }

    pub fn callback_accepted(
        status: u8,
        expected_token: u64,
        token: u64,
        expected_provider: &[u8; 32],
        provider: &[u8; 32],
    ) -> bool {
        status == EpochStatus::RandomnessRequested as u8
            && expected_token == token
            && *expected_provider != [0u8; 32]
            && expected_provider == provider
    }

    /// Next automation step. While Closed, nothing is due until the fee
    /// reserve covers the oracle fee.
    pub fn decide_action(status: u8, now: i64, end_ts: i64, fee_reserve: u64, fee: u64) -> Action {
        match EpochStatus::from_u8(status) {
            Some(EpochStatus::Open) if now >= end_ts => Action::Close,
            Some(EpochStatus::Closed) if fee_reserve >= fee => Action::RequestRandomness,
            Some(EpochStatus::RandomnessReady) => Action::Finalize,
            _ => Action::None,
        }
    }
}
