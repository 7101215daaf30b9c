//! Transaction parsing for the byte-oriented entry points.

use bitcoin::{consensus, Transaction, TxIn};
use log::debug;

use crate::Error;

/// A transaction parsed from wire bytes.
#[derive(Debug, Clone)]
pub(crate) struct TransactionContext {
    tx: Transaction,
}

impl TransactionContext {
    /// Parses a transaction and reserializes it to guarantee canonical encoding.
    pub(crate) fn parse(tx_bytes: &[u8]) -> Result<Self, Error> {
        let tx: Transaction = consensus::deserialize(tx_bytes).map_err(|err| {
            debug!("rejecting transaction bytes: {err}");
            Error::TxDeserialize
        })?;

        let canonical = consensus::serialize(&tx);
        if canonical.len() != tx_bytes.len() {
            return Err(Error::TxSizeMismatch);
        }

        Ok(Self { tx })
    }

    pub(crate) fn tx(&self) -> &Transaction {
        &self.tx
    }

    /// Ensures `input_index` points to an existing transaction input.
    pub(crate) fn ensure_input_index(&self, input_index: usize) -> Result<(), Error> {
        input_at(&self.tx, input_index).map(|_| ())
    }
}

pub(crate) fn input_at(tx: &Transaction, input_index: usize) -> Result<&TxIn, Error> {
    tx.input.get(input_index).ok_or(Error::TxIndex {
        index: input_index,
        inputs: tx.input.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{
        absolute::LockTime, transaction::Version, Amount, OutPoint, ScriptBuf, Sequence, TxOut,
        Witness,
    };

    fn two_input_tx() -> Transaction {
        let input = TxIn {
            previous_output: OutPoint::default(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::from_slice(&[vec![0x51]]),
        };
        Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: vec![input.clone(), input],
            output: vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    #[test]
    fn parses_canonical_bytes() {
        let tx = two_input_tx();
        let ctx = TransactionContext::parse(&consensus::serialize(&tx)).unwrap();
        assert_eq!(ctx.tx(), &tx);
        assert_eq!(ctx.tx().input[1].witness.len(), 1);
    }

    #[test]
    fn rejects_truncated_bytes() {
        let bytes = consensus::serialize(&two_input_tx());
        assert_eq!(
            TransactionContext::parse(&bytes[..bytes.len() - 1]).unwrap_err(),
            Error::TxDeserialize
        );
    }

    #[test]
    fn input_index_bounds() {
        let ctx = TransactionContext::parse(&consensus::serialize(&two_input_tx())).unwrap();
        assert!(ctx.ensure_input_index(0).is_ok());
        assert!(ctx.ensure_input_index(1).is_ok());
        assert_eq!(
            ctx.ensure_input_index(2),
            Err(Error::TxIndex { index: 2, inputs: 2 })
        );
        assert_eq!(input_at(ctx.tx(), 1).unwrap().witness.len(), 1);
    }
}
