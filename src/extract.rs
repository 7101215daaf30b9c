//! Derivation of the redeeming script and initial stack from a witness commitment.

use bitcoin::{
    blockdata::script::{Instruction, Script, ScriptBuf},
    hashes::{sha256, Hash},
    opcodes::{all, Opcode},
    script::Builder,
    PubkeyHash,
};
use log::{debug, trace};

use crate::witness::Witness;

const KEY_HASH_SIZE: usize = 20;
const SCRIPT_HASH_SIZE: usize = 32;
const MAX_PUBKEYS_PER_MULTISIG: u32 = 20;

/// Witness version of a locking script (BIP141).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ScriptVersion {
    /// Version 0: key-hash and script-hash programs.
    Zero,
    /// Versions 1 through 16, reserved for future soft forks.
    Reserved,
    /// Not a witness program.
    Unversioned,
}

impl ScriptVersion {
    /// Classifies a witness version number, `None` meaning no witness program.
    pub fn from_version_number(version: Option<u8>) -> Self {
        match version {
            Some(0) => ScriptVersion::Zero,
            Some(1..=16) => ScriptVersion::Reserved,
            _ => ScriptVersion::Unversioned,
        }
    }
}

/// The parts of a locking script a witness is validated against.
pub trait LockingScript {
    fn version(&self) -> ScriptVersion;

    /// The committed program, empty when the script is not a witness program.
    fn witness_program(&self) -> &[u8];
}

impl LockingScript for Script {
    fn version(&self) -> ScriptVersion {
        ScriptVersion::from_version_number(self.witness_version().map(|version| version.to_num()))
    }

    fn witness_program(&self) -> &[u8] {
        match self.witness_version() {
            Some(_) => &self.as_bytes()[2..],
            None => &[],
        }
    }
}

impl LockingScript for ScriptBuf {
    fn version(&self) -> ScriptVersion {
        self.as_script().version()
    }

    fn witness_program(&self) -> &[u8] {
        self.as_script().witness_program()
    }
}

/// A witness version and program held apart from any script encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commitment {
    pub version: ScriptVersion,
    pub program: Vec<u8>,
}

impl Commitment {
    pub fn new(version: ScriptVersion, program: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            program: program.into(),
        }
    }

    /// Captures the commitment carried by `script`.
    pub fn of<L: LockingScript + ?Sized>(script: &L) -> Self {
        Self::new(script.version(), script.witness_program())
    }
}

impl LockingScript for Commitment {
    fn version(&self) -> ScriptVersion {
        self.version
    }

    fn witness_program(&self) -> &[u8] {
        &self.program
    }
}

/// Script and initial stack derived from a witness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub script: ScriptBuf,
    pub stack: Vec<Vec<u8>>,
}

impl Extraction {
    fn empty() -> Self {
        Self {
            script: ScriptBuf::new(),
            stack: Vec::new(),
        }
    }
}

/// Reasons a witness does not yield a script for its commitment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("key-hash witness must have 2 elements, found {0}")]
    KeyHashStackSize(usize),
    #[error("script-hash witness is empty")]
    EmptyStack,
    #[error("witness script does not hash to the committed program")]
    ScriptHashMismatch,
    #[error("version 0 program of {0} bytes is undefined")]
    UndefinedProgram(usize),
    #[error("locking script is not a witness program")]
    Unversioned,
}

/// Version 0 programs are told apart by length alone.
enum ProgramShape<'a> {
    KeyHash(&'a [u8; KEY_HASH_SIZE]),
    ScriptHash(&'a [u8; SCRIPT_HASH_SIZE]),
    Undefined(usize),
}

impl<'a> ProgramShape<'a> {
    fn of(program: &'a [u8]) -> Self {
        if let Ok(hash) = <&[u8; KEY_HASH_SIZE]>::try_from(program) {
            ProgramShape::KeyHash(hash)
        } else if let Ok(hash) = <&[u8; SCRIPT_HASH_SIZE]>::try_from(program) {
            ProgramShape::ScriptHash(hash)
        } else {
            ProgramShape::Undefined(program.len())
        }
    }
}

impl Witness {
    /// Script used only to count signature operations for this witness.
    ///
    /// `None` means the locking script is not a witness program and witness
    /// sigops do not apply. Undefined version 0 programs and reserved versions
    /// yield an empty script rather than failing.
    pub fn extract_sigop_script<L: LockingScript + ?Sized>(&self, locking: &L) -> Option<ScriptBuf> {
        match (locking.version(), ProgramShape::of(locking.witness_program())) {
            // Each key-hash spend counts as one sigop.
            (ScriptVersion::Zero, ProgramShape::KeyHash(_)) => {
                Some(Builder::new().push_opcode(all::OP_CHECKSIG).into_script())
            }
            (ScriptVersion::Zero, ProgramShape::ScriptHash(_)) => Some(
                self.stack()
                    .last()
                    .map(|top| ScriptBuf::from_bytes(top.clone()))
                    .unwrap_or_default(),
            ),
            (ScriptVersion::Zero, ProgramShape::Undefined(_)) | (ScriptVersion::Reserved, _) => {
                Some(ScriptBuf::new())
            }
            (ScriptVersion::Unversioned, _) => None,
        }
    }

    /// Derives the script to evaluate and the stack to evaluate it on.
    pub fn extract_script<L: LockingScript + ?Sized>(
        &self,
        locking: &L,
    ) -> Result<Extraction, ExtractError> {
        let version = locking.version();
        let program = locking.witness_program();
        trace!(
            "extracting witness script: version {version:?}, program of {} bytes",
            program.len()
        );

        let result = match (version, ProgramShape::of(program)) {
            (ScriptVersion::Zero, ProgramShape::KeyHash(hash)) => {
                if self.len() != 2 {
                    Err(ExtractError::KeyHashStackSize(self.len()))
                } else {
                    Ok(Extraction {
                        script: key_hash_script(hash),
                        stack: self.stack().to_vec(),
                    })
                }
            }
            (ScriptVersion::Zero, ProgramShape::ScriptHash(hash)) => {
                let mut stack = self.stack().to_vec();
                match stack.pop() {
                    None => Err(ExtractError::EmptyStack),
                    Some(script) => {
                        if sha256::Hash::hash(&script).to_byte_array() == *hash {
                            Ok(Extraction {
                                script: ScriptBuf::from_bytes(script),
                                stack,
                            })
                        } else {
                            Err(ExtractError::ScriptHashMismatch)
                        }
                    }
                }
            }
            (ScriptVersion::Zero, ProgramShape::Undefined(len)) => {
                Err(ExtractError::UndefinedProgram(len))
            }
            (ScriptVersion::Reserved, _) => Ok(Extraction::empty()),
            (ScriptVersion::Unversioned, _) => Err(ExtractError::Unversioned),
        };

        if let Err(err) = &result {
            debug!("witness extraction failed: {err}");
        }
        result
    }

    /// Signature operations charged to this witness, `None` when not applicable.
    pub fn sigop_count<L: LockingScript + ?Sized>(&self, locking: &L) -> Option<u32> {
        self.extract_sigop_script(locking)
            .map(|script| count_sigops(&script))
    }
}

/// `OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG` for a key-hash program.
fn key_hash_script(hash: &[u8; KEY_HASH_SIZE]) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(*hash))
}

/// Counts sigops with exact multisig key counts, stopping at the first malformed push.
fn count_sigops(script: &Script) -> u32 {
    let mut total: u32 = 0;
    let mut last_op: Option<Opcode> = None;
    for instruction in script.instructions() {
        let Ok(instruction) = instruction else {
            break;
        };
        match instruction {
            Instruction::Op(opcode) => {
                match opcode {
                    all::OP_CHECKSIG | all::OP_CHECKSIGVERIFY => {
                        total = total.saturating_add(1);
                    }
                    all::OP_CHECKMULTISIG | all::OP_CHECKMULTISIGVERIFY => {
                        let keys = decode_op_n(last_op).unwrap_or(MAX_PUBKEYS_PER_MULTISIG);
                        total = total.saturating_add(keys);
                    }
                    _ => {}
                }
                last_op = Some(opcode);
            }
            Instruction::PushBytes(_) => {
                last_op = None;
            }
        }
    }
    total
}

fn decode_op_n(opcode: Option<Opcode>) -> Option<u32> {
    let value = opcode?.to_u8();
    if (all::OP_PUSHNUM_1.to_u8()..=all::OP_PUSHNUM_16.to_u8()).contains(&value) {
        Some(u32::from(value - all::OP_PUSHNUM_1.to_u8() + 1))
    } else {
        None
    }
}
