//! Segregated witness stacks and their consensus validation.
//!
//! The crate decodes and encodes BIP144 witness stacks, derives the script and
//! initial stack a witness commits to (BIP141), and drives a caller-supplied
//! [`ScriptEngine`] through the version 0 validation rules. Opcode semantics
//! live in the engine; this crate owns everything around it.

mod codec;
mod extract;
mod program;
mod tx;
mod verify;
mod witness;

pub use codec::{
    check_allocation, check_allocation_within, Allocation, DecodeError, MAX_BLOCK_WEIGHT,
};
pub use extract::{Commitment, ExtractError, Extraction, LockingScript, ScriptVersion};
pub use program::{cast_to_bool, Program, ScriptEngine, ScriptError, ScriptFlags, SpendContext};
pub use verify::WitnessError;
pub use witness::{Witness, MAX_PUSH_DATA_SIZE};

use bitcoin::{Amount, Script, Transaction};
use log::debug;

use crate::tx::TransactionContext;

/// Do not enable any verification.
pub const VERIFY_NONE: u32 = 0;
/// Evaluate P2SH (BIP16) subscripts.
pub const VERIFY_P2SH: u32 = 1 << 0;
/// Enforce strict ECDSA encoding (BIP62).
pub const VERIFY_STRICTENC: u32 = 1 << 1;
/// Enforce strict DER (BIP66) compliance.
pub const VERIFY_DERSIG: u32 = 1 << 2;
/// Require signatures to use low-S form (BIP62).
pub const VERIFY_LOW_S: u32 = 1 << 3;
/// Enforce NULLDUMMY (BIP147).
pub const VERIFY_NULLDUMMY: u32 = 1 << 4;
/// Require scriptSig to be push only.
pub const VERIFY_SIGPUSHONLY: u32 = 1 << 5;
/// Require minimal data encodings (BIP62).
pub const VERIFY_MINIMALDATA: u32 = 1 << 6;
/// Discourage use of upgradable NOP opcodes.
pub const VERIFY_DISCOURAGE_UPGRADABLE_NOPS: u32 = 1 << 7;
/// Require a clean stack after evaluation.
pub const VERIFY_CLEANSTACK: u32 = 1 << 8;
/// Enable CHECKLOCKTIMEVERIFY (BIP65).
pub const VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
/// Enable CHECKSEQUENCEVERIFY (BIP112).
pub const VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;
/// Enable WITNESS (BIP141).
pub const VERIFY_WITNESS: u32 = 1 << 11;
/// Discourage unknown witness program versions.
pub const VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM: u32 = 1 << 12;
/// Require minimal encodings for IF/NOTIF.
pub const VERIFY_MINIMALIF: u32 = 1 << 13;
/// Enforce NULLFAIL behaviour (BIP147).
pub const VERIFY_NULLFAIL: u32 = 1 << 14;
/// Require compressed pubkeys in segwit v0 contexts.
pub const VERIFY_WITNESS_PUBKEYTYPE: u32 = 1 << 15;

/// Soft-fork rules in force once segwit activated.
pub const VERIFY_SEGWIT_CONSENSUS: u32 = VERIFY_P2SH
    | VERIFY_DERSIG
    | VERIFY_NULLDUMMY
    | VERIFY_CHECKLOCKTIMEVERIFY
    | VERIFY_CHECKSEQUENCEVERIFY
    | VERIFY_WITNESS;

/// Errors returned by the transaction-level entry points.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The input index is out of range for the transaction.
    #[error("input index {index} out of range for transaction with {inputs} inputs")]
    TxIndex { index: usize, inputs: usize },
    /// The transaction bytes are not canonically encoded.
    #[error("transaction length did not match its serialization")]
    TxSizeMismatch,
    /// The transaction bytes could not be parsed.
    #[error("an error deserializing the transaction")]
    TxDeserialize,
    /// The flags contain unsupported bits.
    #[error("script verification flags {0:#x} are invalid")]
    InvalidFlags(u32),
    /// The input's witness failed verification.
    #[error(transparent)]
    Witness(#[from] WitnessError),
}

/// Verifies the witness of `tx`'s input at `input_index` against the output it spends.
pub fn verify_input<E: ScriptEngine + ?Sized>(
    engine: &E,
    tx: &Transaction,
    input_index: usize,
    flags: u32,
    spent_output_script: &Script,
    amount: Amount,
) -> Result<(), Error> {
    let input = tx::input_at(tx, input_index)?;
    let flags = ScriptFlags::from_bits(flags)?;
    let witness = Witness::from(&input.witness);
    let spend = SpendContext::new(tx, input_index, flags, amount);

    witness.verify(engine, spend, spent_output_script).map_err(|err| {
        debug!("input {input_index} of {} failed: {err}", tx.compute_txid());
        Error::from(err)
    })
}

/// Same as [`verify_input`] but starting from serialized transaction and script bytes.
pub fn verify_with_flags<E: ScriptEngine + ?Sized>(
    engine: &E,
    spent_output_script: &[u8],
    amount: u64,
    spending_transaction: &[u8],
    input_index: usize,
    flags: u32,
) -> Result<(), Error> {
    let tx_ctx = TransactionContext::parse(spending_transaction)?;
    tx_ctx.ensure_input_index(input_index)?;

    verify_input(
        engine,
        tx_ctx.tx(),
        input_index,
        flags,
        Script::from_bytes(spent_output_script),
        Amount::from_sat(amount),
    )
}
