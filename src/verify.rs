//! Witness validation: extraction, evaluation and the clean stack rule.

use log::{debug, trace};

use crate::{
    extract::{Extraction, LockingScript, ScriptVersion},
    program::{Program, ScriptEngine, ScriptError, SpendContext},
    witness::Witness,
};

/// Consensus outcome of a failed witness verification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WitnessError {
    /// The witness does not satisfy the version 0 commitment.
    #[error("invalid witness")]
    InvalidWitness,
    /// Evaluation succeeded without leaving exactly one true element.
    #[error("witness script did not leave a clean true stack")]
    StackFalse,
    /// The locking script carries no witness commitment.
    #[error("locking script is not a witness program")]
    UnversionedScript,
    /// The engine rejected the witness script.
    #[error("witness script failed: {0}")]
    Script(#[from] ScriptError),
}

impl Witness {
    /// Validates this witness against `locking` for the given spend.
    ///
    /// Reserved witness versions always pass without evaluation.
    pub fn verify<E, L>(
        &self,
        engine: &E,
        spend: SpendContext<'_>,
        locking: &L,
    ) -> Result<(), WitnessError>
    where
        E: ScriptEngine + ?Sized,
        L: LockingScript + ?Sized,
    {
        let version = locking.version();
        trace!("verifying witness for input {}: version {version:?}", spend.input_index);

        match version {
            ScriptVersion::Zero => {
                let Extraction { script, stack } = self
                    .extract_script(locking)
                    .map_err(|_| WitnessError::InvalidWitness)?;

                let mut program = Program::new(script, stack, spend, version);
                engine.evaluate(&mut program).map_err(|err| {
                    debug!("witness script failed for input {}: {err}", spend.input_index);
                    WitnessError::Script(err)
                })?;

                if program.stack_result(true) {
                    Ok(())
                } else {
                    debug!(
                        "witness script left {} stack elements for input {}",
                        program.stack().len(),
                        spend.input_index
                    );
                    Err(WitnessError::StackFalse)
                }
            }
            ScriptVersion::Reserved => Ok(()),
            ScriptVersion::Unversioned => Err(WitnessError::UnversionedScript),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{extract::Commitment, program::ScriptFlags};
    use bitcoin::{
        absolute::LockTime,
        blockdata::script::Builder,
        hashes::{sha256, Hash},
        opcodes::all,
        transaction::Version,
        Amount, ScriptBuf, Transaction,
    };
    use std::cell::RefCell;

    /// Reports a fixed result and leaves a fixed final stack.
    struct StubEngine {
        result: Result<(), ScriptError>,
        final_stack: Vec<Vec<u8>>,
        seen: RefCell<Vec<(ScriptBuf, Vec<Vec<u8>>)>>,
    }

    impl StubEngine {
        fn new(result: Result<(), ScriptError>, final_stack: Vec<Vec<u8>>) -> Self {
            Self {
                result,
                final_stack,
                seen: RefCell::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.seen.borrow().len()
        }
    }

    impl ScriptEngine for StubEngine {
        fn evaluate(&self, program: &mut Program<'_>) -> Result<(), ScriptError> {
            self.seen
                .borrow_mut()
                .push((program.script().to_owned(), program.stack().to_vec()));
            *program.stack_mut() = self.final_stack.clone();
            self.result
        }
    }

    fn empty_tx() -> Transaction {
        Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: Vec::new(),
            output: Vec::new(),
        }
    }

    fn true_script() -> ScriptBuf {
        Builder::new().push_opcode(all::OP_PUSHNUM_1).into_script()
    }

    fn script_hash_commitment(script: &ScriptBuf) -> Commitment {
        Commitment::new(
            ScriptVersion::Zero,
            sha256::Hash::hash(script.as_bytes()).to_byte_array(),
        )
    }

    #[test]
    fn clean_true_stack_succeeds() {
        let tx = empty_tx();
        let spend = SpendContext::new(&tx, 0, ScriptFlags::default(), Amount::ZERO);
        let script = true_script();
        let witness = Witness::new(vec![vec![0xaa], script.to_bytes()]);
        let engine = StubEngine::new(Ok(()), vec![vec![1]]);

        assert_eq!(witness.verify(&engine, spend, &script_hash_commitment(&script)), Ok(()));
        let seen = engine.seen.borrow();
        assert_eq!(seen[0].0, script);
        assert_eq!(seen[0].1, vec![vec![0xaa]]);
    }

    #[test]
    fn extra_stack_elements_yield_stack_false() {
        let tx = empty_tx();
        let spend = SpendContext::new(&tx, 0, ScriptFlags::default(), Amount::ZERO);
        let script = true_script();
        let witness = Witness::new(vec![script.to_bytes()]);
        let engine = StubEngine::new(Ok(()), vec![vec![1], vec![1]]);

        assert_eq!(
            witness.verify(&engine, spend, &script_hash_commitment(&script)),
            Err(WitnessError::StackFalse)
        );
    }

    #[test]
    fn false_top_yields_stack_false() {
        let tx = empty_tx();
        let spend = SpendContext::new(&tx, 0, ScriptFlags::default(), Amount::ZERO);
        let script = true_script();
        let witness = Witness::new(vec![script.to_bytes()]);
        let engine = StubEngine::new(Ok(()), vec![vec![0x80]]);

        assert_eq!(
            witness.verify(&engine, spend, &script_hash_commitment(&script)),
            Err(WitnessError::StackFalse)
        );
    }

    #[test]
    fn engine_errors_pass_through() {
        let tx = empty_tx();
        let spend = SpendContext::new(&tx, 0, ScriptFlags::default(), Amount::ZERO);
        let script = true_script();
        let witness = Witness::new(vec![script.to_bytes()]);
        let engine = StubEngine::new(Err(ScriptError::EqualVerify), vec![vec![1]]);

        assert_eq!(
            witness.verify(&engine, spend, &script_hash_commitment(&script)),
            Err(WitnessError::Script(ScriptError::EqualVerify))
        );
    }

    #[test]
    fn extraction_failure_skips_evaluation() {
        let tx = empty_tx();
        let spend = SpendContext::new(&tx, 0, ScriptFlags::default(), Amount::ZERO);
        let engine = StubEngine::new(Ok(()), vec![vec![1]]);
        let witness = Witness::new(vec![vec![1]]);

        let key_hash = Commitment::new(ScriptVersion::Zero, [0x01; 20]);
        assert_eq!(
            witness.verify(&engine, spend, &key_hash),
            Err(WitnessError::InvalidWitness)
        );
        let mismatch = script_hash_commitment(&true_script());
        assert_eq!(
            witness.verify(&engine, spend, &mismatch),
            Err(WitnessError::InvalidWitness)
        );
        assert_eq!(engine.calls(), 0);
    }

    #[test]
    fn verify_dispatch_table() {
        let tx = empty_tx();
        let spend = SpendContext::new(&tx, 0, ScriptFlags::default(), Amount::ZERO);
        let engine = StubEngine::new(Ok(()), vec![vec![1]]);
        let script = true_script();
        let script_hash = sha256::Hash::hash(script.as_bytes()).to_byte_array();

        for version in [ScriptVersion::Zero, ScriptVersion::Reserved, ScriptVersion::Unversioned] {
            for len in [0usize, 19, 20, 21, 32, 64] {
                let (program, witness) = match len {
                    32 => (script_hash.to_vec(), Witness::new(vec![script.to_bytes()])),
                    _ => (vec![0x42; len], Witness::new(vec![vec![0x30], vec![0x02]])),
                };
                let result = witness.verify(&engine, spend, &Commitment::new(version, program));
                let expected = match (version, len) {
                    (ScriptVersion::Zero, 20 | 32) => Ok(()),
                    (ScriptVersion::Zero, _) => Err(WitnessError::InvalidWitness),
                    (ScriptVersion::Reserved, _) => Ok(()),
                    (ScriptVersion::Unversioned, _) => Err(WitnessError::UnversionedScript),
                };
                assert_eq!(result, expected, "version {version:?}, length {len}");
            }
        }
        // Only the two defined version 0 shapes reach the engine.
        assert_eq!(engine.calls(), 2);
    }
}
