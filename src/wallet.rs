// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::output::{SignDescriptor, WitnessType};
use crate::Error;

use bitcoin::sighash::SighashCache;
use bitcoin::{ScriptBuf, Transaction, Witness};

/// Generates witnesses spending incubated outputs at the time they are swept.
///
/// Implementations hold the wallet keys referenced by the [`SignDescriptor`]s carried through the
/// nursery. A baby output's first-stage timeout transaction is pre-signed at channel close time
/// and never passes through this interface.
pub trait WitnessSigner {
	/// Produces the witness stack for the input at `input_index` of `spend_tx`, which spends the
	/// output described by `sign_desc` via the spend path selected by `witness_type`.
	///
	/// `sighash_cache` is precomputed once per transaction and shared across all of its inputs.
	fn sign_output<'a>(
		&self, spend_tx: &'a Transaction, sighash_cache: &mut SighashCache<&'a Transaction>,
		input_index: usize, sign_desc: &SignDescriptor, witness_type: WitnessType,
	) -> Result<Witness, Error>;
}

/// Generates fresh wallet scripts to which matured outputs are swept.
pub trait SweepScriptSource {
	/// Returns a fresh P2WPKH-shaped script owned by the wallet.
	///
	/// Every call must return a previously unused script, which makes the txid of a sweep
	/// transaction non-deterministic across rebuilds. The nursery pins the first finalized
	/// transaction for a height to compensate.
	fn gen_sweep_script(&self) -> Result<ScriptBuf, Error>;
}
