// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

//! Construction of the batch transaction sweeping matured outputs into the wallet.

use crate::logger::{log_error, log_warn, Logger};
use crate::output::{CsvSpendableOutput, KidOutput, WitnessType};
use crate::types::{DynFeeEstimator, DynLogger, DynSweepScriptSource, DynWitnessSigner};
use crate::Error;

use bitcoin::absolute::LockTime;
use bitcoin::policy::MAX_STANDARD_TX_WEIGHT;
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Weight, Witness};

// Non-witness size of the sweep transaction skeleton: version, input count, output count, the
// single P2WPKH output (value, script length, program) and locktime.
const BASE_SWEEP_TX_SIZE: u64 = 4 + 1 + 1 + 8 + 1 + 22 + 4;

// Segwit marker and flag bytes.
const WITNESS_HEADER_SIZE: u64 = 2;

// Non-witness size of one input: previous outpoint, script_sig length and sequence.
const INPUT_SIZE: u64 = 32 + 4 + 1 + 4;

// <sig> <> <to_self_script>
const TO_LOCAL_TIMEOUT_WITNESS_WEIGHT: u64 = 1 + 1 + 73 + 1 + 1 + 77;

// <sender_sig> <> <offered_htlc_script>
const OFFERED_HTLC_TIMEOUT_WITNESS_WEIGHT: u64 = 1 + 1 + 73 + 1 + 1 + 133;

fn witness_weight(witness_type: WitnessType) -> Option<u64> {
	match witness_type {
		WitnessType::CommitmentTimeLock => Some(TO_LOCAL_TIMEOUT_WITNESS_WEIGHT),
		WitnessType::HtlcOfferedTimeout => Some(OFFERED_HTLC_TIMEOUT_WITNESS_WEIGHT),
		_ => None,
	}
}

/// Builds and signs the transaction sweeping the given kindergarten outputs into a fresh wallet
/// script.
///
/// Outputs with a witness type we cannot estimate are dropped with a warning and remain
/// untouched in the store. The resulting transaction pays `sum(inputs) - fee` to a single
/// P2WPKH-shaped output and sets each input's sequence to its CSV delay.
///
/// The sweep script is freshly generated on every call, so the txid is not stable across
/// rebuilds. Callers must pin the first finalized transaction for a height before broadcasting.
pub(crate) fn create_sweep_tx(
	kgtn_outputs: &[KidOutput], conf_target: u32, fee_estimator: &DynFeeEstimator,
	sweep_script_source: &DynSweepScriptSource, signer: &DynWitnessSigner, logger: &DynLogger,
) -> Result<Transaction, Error> {
	let mut inputs = Vec::with_capacity(kgtn_outputs.len());
	let mut tx_weight = 4 * BASE_SWEEP_TX_SIZE + WITNESS_HEADER_SIZE;

	for output in kgtn_outputs {
		let witness_weight = match witness_weight(output.witness_type()) {
			Some(weight) => weight,
			None => {
				log_warn!(
					logger,
					"Kindergarten output {} has unexpected witness type {:?}, not sweeping",
					output.outpoint(),
					output.witness_type()
				);
				continue;
			},
		};

		tx_weight += 4 * INPUT_SIZE + witness_weight;
		inputs.push(output);
	}

	if inputs.is_empty() {
		log_error!(logger, "No sweepable outputs in kindergarten batch");
		return Err(Error::SweepTxCreationFailed);
	}

	if tx_weight > MAX_STANDARD_TX_WEIGHT as u64 {
		log_error!(logger, "Sweep transaction weight estimate {} exceeds standardness limit", tx_weight);
		return Err(Error::SweepTxCreationFailed);
	}

	let sweep_script = sweep_script_source.gen_sweep_script()?;

	let total_value: Amount = inputs.iter().map(|output| output.amount()).sum();

	let fee_rate = fee_estimator.estimate_fee_rate(conf_target)?;
	let fee =
		fee_rate.fee_wu(Weight::from_wu(tx_weight)).ok_or(Error::FeeEstimationFailed)?;
	let sweep_value = total_value
		.checked_sub(fee)
		.filter(|value| *value > Amount::ZERO)
		.ok_or_else(|| {
			log_error!(logger, "Fee of {} exceeds total sweep value of {}", fee, total_value);
			Error::SweepTxCreationFailed
		})?;

	// Version 2 is required for the CSV delays carried in the input sequences.
	let mut sweep_tx = Transaction {
		version: Version(2),
		lock_time: LockTime::ZERO,
		input: inputs
			.iter()
			.map(|output| TxIn {
				previous_output: output.outpoint(),
				script_sig: ScriptBuf::new(),
				sequence: Sequence(output.blocks_to_maturity()),
				witness: Witness::new(),
			})
			.collect(),
		output: vec![TxOut { value: sweep_value, script_pubkey: sweep_script }],
	};

	check_sweep_tx_sanity(&sweep_tx)?;

	let mut sighash_cache = SighashCache::new(&sweep_tx);
	let mut witnesses = Vec::with_capacity(inputs.len());
	for (input_index, output) in inputs.iter().enumerate() {
		witnesses.push(output.build_witness(signer, &sweep_tx, &mut sighash_cache, input_index)?);
	}
	drop(sighash_cache);

	for (tx_in, witness) in sweep_tx.input.iter_mut().zip(witnesses) {
		tx_in.witness = witness;
	}

	Ok(sweep_tx)
}

fn check_sweep_tx_sanity(tx: &Transaction) -> Result<(), Error> {
	if tx.input.is_empty() || tx.output.is_empty() {
		return Err(Error::SweepTxCreationFailed);
	}
	debug_assert!(tx.output.iter().all(|output| output.value > Amount::ZERO));
	Ok(())
}
