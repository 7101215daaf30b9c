//! Evaluation context handed to a script engine.

use bitcoin::{blockdata::script::Script, Amount, ScriptBuf, Transaction};

use crate::{
    extract::ScriptVersion, Error, VERIFY_CHECKLOCKTIMEVERIFY, VERIFY_CHECKSEQUENCEVERIFY,
    VERIFY_CLEANSTACK, VERIFY_DERSIG, VERIFY_DISCOURAGE_UPGRADABLE_NOPS,
    VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM, VERIFY_LOW_S, VERIFY_MINIMALDATA,
    VERIFY_MINIMALIF, VERIFY_NULLDUMMY, VERIFY_NULLFAIL, VERIFY_P2SH, VERIFY_SIGPUSHONLY,
    VERIFY_STRICTENC, VERIFY_WITNESS, VERIFY_WITNESS_PUBKEYTYPE,
};

/// Failure codes reported by a script engine.
///
/// These are passed through witness verification unchanged.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("unknown script error")]
    Unknown,
    #[error("script evaluated without error but finished with a false top stack element")]
    EvalFalse,
    #[error("OP_RETURN was encountered")]
    OpReturn,
    #[error("script is too big")]
    ScriptSize,
    #[error("push value size limit exceeded")]
    PushSize,
    #[error("operation limit exceeded")]
    OpCount,
    #[error("stack size limit exceeded")]
    StackSize,
    #[error("signature count negative or greater than pubkey count")]
    SigCount,
    #[error("pubkey count negative or limit exceeded")]
    PubkeyCount,
    #[error("script failed an OP_VERIFY operation")]
    Verify,
    #[error("script failed an OP_EQUALVERIFY operation")]
    EqualVerify,
    #[error("script failed an OP_CHECKSIGVERIFY operation")]
    CheckSigVerify,
    #[error("script failed an OP_CHECKMULTISIGVERIFY operation")]
    CheckMultiSigVerify,
    #[error("script failed an OP_NUMEQUALVERIFY operation")]
    NumEqualVerify,
    #[error("opcode missing or not understood")]
    BadOpcode,
    #[error("attempted to use a disabled opcode")]
    DisabledOpcode,
    #[error("operation not valid with the current stack size")]
    InvalidStackOperation,
    #[error("operation not valid with the current altstack size")]
    InvalidAltstackOperation,
    #[error("invalid OP_IF construction")]
    UnbalancedConditional,
    #[error("negative locktime")]
    NegativeLockTime,
    #[error("locktime requirement not satisfied")]
    UnsatisfiedLockTime,
    #[error("signature hash type missing or not understood")]
    SigHashType,
    #[error("non-canonical DER signature")]
    SigDer,
    #[error("data push larger than necessary")]
    MinimalData,
    #[error("only push operators allowed in signatures")]
    SigPushOnly,
    #[error("non-canonical signature: S value is unnecessarily high")]
    SigHighS,
    #[error("dummy CHECKMULTISIG argument must be zero")]
    SigNullDummy,
    #[error("public key is neither compressed nor uncompressed")]
    PubkeyType,
    #[error("stack size must be exactly one after execution")]
    CleanStack,
    #[error("OP_IF/NOTIF argument must be minimal")]
    MinimalIf,
    #[error("signature must be zero for failed CHECK(MULTI)SIG operation")]
    NullFail,
    #[error("NOPx reserved for soft-fork upgrades")]
    DiscourageUpgradableNops,
    #[error("witness version reserved for soft-fork upgrades")]
    DiscourageUpgradableWitnessProgram,
    #[error("using non-compressed keys in segwit")]
    WitnessPubkeyType,
    #[error("signature is found in scriptCode")]
    SigFindAndDelete,
}

const SUPPORTED_FLAGS: u32 = VERIFY_P2SH
    | VERIFY_STRICTENC
    | VERIFY_DERSIG
    | VERIFY_LOW_S
    | VERIFY_NULLDUMMY
    | VERIFY_SIGPUSHONLY
    | VERIFY_MINIMALDATA
    | VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | VERIFY_CLEANSTACK
    | VERIFY_CHECKLOCKTIMEVERIFY
    | VERIFY_CHECKSEQUENCEVERIFY
    | VERIFY_WITNESS
    | VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM
    | VERIFY_MINIMALIF
    | VERIFY_NULLFAIL
    | VERIFY_WITNESS_PUBKEYTYPE;

/// Active rule set for an evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptFlags(u32);

impl ScriptFlags {
    pub fn from_bits(bits: u32) -> Result<Self, Error> {
        if bits & !SUPPORTED_FLAGS != 0 {
            return Err(Error::InvalidFlags(bits));
        }
        Ok(Self(Self::apply_implied_bits(bits)))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    fn apply_implied_bits(mut bits: u32) -> u32 {
        if bits & VERIFY_WITNESS != 0 {
            bits |= VERIFY_P2SH;
        }
        bits
    }
}

/// Input-specific data that accompanies every evaluation.
#[derive(Debug, Clone, Copy)]
pub struct SpendContext<'tx> {
    pub tx: &'tx Transaction,
    pub input_index: usize,
    pub flags: ScriptFlags,
    pub value: Amount,
}

impl<'tx> SpendContext<'tx> {
    pub fn new(tx: &'tx Transaction, input_index: usize, flags: ScriptFlags, value: Amount) -> Self {
        Self {
            tx,
            input_index,
            flags,
            value,
        }
    }
}

/// A script, its initial stack and the spend it belongs to.
///
/// The engine evaluates the script in place, leaving its final stack behind
/// for [`Program::stack_result`].
#[derive(Debug, Clone)]
pub struct Program<'tx> {
    script: ScriptBuf,
    stack: Vec<Vec<u8>>,
    spend: SpendContext<'tx>,
    version: ScriptVersion,
}

impl<'tx> Program<'tx> {
    pub fn new(
        script: ScriptBuf,
        stack: Vec<Vec<u8>>,
        spend: SpendContext<'tx>,
        version: ScriptVersion,
    ) -> Self {
        Self {
            script,
            stack,
            spend,
            version,
        }
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn transaction(&self) -> &'tx Transaction {
        self.spend.tx
    }

    pub fn input_index(&self) -> usize {
        self.spend.input_index
    }

    pub fn flags(&self) -> ScriptFlags {
        self.spend.flags
    }

    pub fn value(&self) -> Amount {
        self.spend.value
    }

    pub fn version(&self) -> ScriptVersion {
        self.version
    }

    pub fn stack(&self) -> &[Vec<u8>] {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut Vec<Vec<u8>> {
        &mut self.stack
    }

    pub fn into_stack(self) -> Vec<Vec<u8>> {
        self.stack
    }

    /// Whether the final stack counts as success.
    ///
    /// With `clean` the stack must hold exactly one element, otherwise only the
    /// top element is considered. Either way that element must be true.
    pub fn stack_result(&self, clean: bool) -> bool {
        match self.stack.as_slice() {
            [] => false,
            [.., top] if !clean => cast_to_bool(top),
            [top] => cast_to_bool(top),
            _ => false,
        }
    }
}

/// Evaluates witness scripts.
pub trait ScriptEngine {
    /// Runs `program`'s script against its stack.
    fn evaluate(&self, program: &mut Program<'_>) -> Result<(), ScriptError>;
}

impl<E: ScriptEngine + ?Sized> ScriptEngine for &E {
    fn evaluate(&self, program: &mut Program<'_>) -> Result<(), ScriptError> {
        (**self).evaluate(program)
    }
}

/// Script truthiness: any non-zero byte, except a lone trailing sign bit.
pub fn cast_to_bool(data: &[u8]) -> bool {
    for (i, &byte) in data.iter().enumerate() {
        if byte != 0 {
            return !(i == data.len() - 1 && byte == 0x80);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{absolute::LockTime, transaction::Version};

    fn empty_tx() -> Transaction {
        Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: Vec::new(),
            output: Vec::new(),
        }
    }

    fn program_with(tx: &Transaction, stack: Vec<Vec<u8>>) -> Program<'_> {
        let spend = SpendContext::new(tx, 0, ScriptFlags::default(), Amount::from_sat(1));
        Program::new(ScriptBuf::new(), stack, spend, ScriptVersion::Zero)
    }

    #[test]
    fn casts_script_booleans() {
        assert!(!cast_to_bool(&[]));
        assert!(!cast_to_bool(&[0x00]));
        assert!(!cast_to_bool(&[0x00, 0x00]));
        assert!(!cast_to_bool(&[0x80]));
        assert!(!cast_to_bool(&[0x00, 0x80]));
        assert!(cast_to_bool(&[0x01]));
        assert!(cast_to_bool(&[0x80, 0x00]));
        assert!(cast_to_bool(&[0x00, 0x81]));
    }

    #[test]
    fn clean_stack_requires_single_true_element() {
        let tx = empty_tx();
        assert!(program_with(&tx, vec![vec![1]]).stack_result(true));
        assert!(!program_with(&tx, vec![vec![1], vec![1]]).stack_result(true));
        assert!(!program_with(&tx, vec![Vec::new()]).stack_result(true));
        assert!(!program_with(&tx, Vec::new()).stack_result(true));
    }

    #[test]
    fn unclean_stack_checks_top_only() {
        let tx = empty_tx();
        assert!(program_with(&tx, vec![Vec::new(), vec![1]]).stack_result(false));
        assert!(!program_with(&tx, vec![vec![1], Vec::new()]).stack_result(false));
        assert!(!program_with(&tx, Vec::new()).stack_result(false));
    }

    #[test]
    fn program_exposes_spend_context() {
        let tx = empty_tx();
        let mut program = program_with(&tx, vec![vec![7]]);
        assert_eq!(program.input_index(), 0);
        assert_eq!(program.value(), Amount::from_sat(1));
        assert_eq!(program.version(), ScriptVersion::Zero);
        assert!(program.script().is_empty());
        program.stack_mut().push(vec![8]);
        assert_eq!(program.into_stack(), vec![vec![7], vec![8]]);
    }

    #[test]
    fn rejects_unknown_flags() {
        let invalid_bit = 1 << 31;
        assert_eq!(
            ScriptFlags::from_bits(invalid_bit),
            Err(Error::InvalidFlags(invalid_bit))
        );
    }

    #[test]
    fn witness_flag_implies_p2sh() {
        let flags = ScriptFlags::from_bits(VERIFY_WITNESS).unwrap();
        assert_eq!(flags.bits(), VERIFY_WITNESS | VERIFY_P2SH);
        assert!(flags.contains(VERIFY_P2SH));
    }

    #[test]
    fn flags_without_implied_bits_are_lossless() {
        let bits = VERIFY_P2SH | VERIFY_SIGPUSHONLY | VERIFY_DERSIG;
        assert_eq!(ScriptFlags::from_bits(bits).unwrap().bits(), bits);
    }
}
