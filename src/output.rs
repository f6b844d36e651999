// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

//! The outputs shepherded by the nursery and their on-disk encoding.
//!
//! All multi-byte integers are encoded big-endian. Decoders reject records that leave trailing
//! bytes unconsumed.

use crate::wallet::WitnessSigner;
use crate::Error;

use lightning::impl_writeable_tlv_based;
use lightning::ln::msgs::DecodeError;
use lightning::util::ser::{BigSize, Readable, Writeable, Writer};

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::sighash::SighashCache;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut, Txid, Witness};

use lightning::io::{Cursor, Read};

/// The script template under which an incubated output is encumbered, selecting the witness the
/// signer has to produce when sweeping it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WitnessType {
	/// A commitment to-self output, spendable after a relative delay.
	CommitmentTimeLock,
	/// A commitment to-remote output without any delay.
	CommitmentNoDelay,
	/// A revoked commitment output claimed through the revocation key.
	CommitmentRevoke,
	/// The delayed second-stage output of an offered HTLC's timeout transaction.
	HtlcOfferedTimeout,
	/// A witness type this version does not know about. Preserved losslessly so that records
	/// written by a newer version survive a round trip.
	Unknown(u16),
}

impl WitnessType {
	fn to_u16(self) -> u16 {
		match self {
			Self::CommitmentTimeLock => 0,
			Self::CommitmentNoDelay => 1,
			Self::CommitmentRevoke => 2,
			Self::HtlcOfferedTimeout => 3,
			Self::Unknown(code) => code,
		}
	}

	fn from_u16(code: u16) -> Self {
		match code {
			0 => Self::CommitmentTimeLock,
			1 => Self::CommitmentNoDelay,
			2 => Self::CommitmentRevoke,
			3 => Self::HtlcOfferedTimeout,
			code => Self::Unknown(code),
		}
	}
}

impl Writeable for WitnessType {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), lightning::io::Error> {
		self.to_u16().write(writer)
	}
}

impl Readable for WitnessType {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let code: u16 = Readable::read(reader)?;
		Ok(Self::from_u16(code))
	}
}

/// The data the external signer needs to produce a valid witness for one input.
///
/// The nursery carries this bundle with an output through all of its states and hands it back to
/// the [`WitnessSigner`] untouched once the output is swept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignDescriptor {
	/// The wallet key the witness will be signed with.
	pub pubkey: PublicKey,
	/// The script whose conditions the witness has to satisfy.
	pub witness_script: ScriptBuf,
	/// The output being spent.
	pub output: TxOut,
}

impl_writeable_tlv_based!(SignDescriptor, {
	(0, pubkey, required),
	(2, witness_script, required),
	(4, output, required),
});

/// A spendable output locked under a relative (CSV) delay.
///
/// Implemented by both output kinds tracked by the nursery; a [`BabyOutput`] delegates to the
/// [`KidOutput`] it will turn into once its first stage confirms.
pub trait CsvSpendableOutput {
	/// Returns the value of the output.
	fn amount(&self) -> Amount;

	/// Returns the outpoint of the output to be spent.
	fn outpoint(&self) -> OutPoint;

	/// Returns the funding outpoint of the channel this output descended from.
	fn origin_channel_point(&self) -> OutPoint;

	/// Returns the relative timelock, as a number of blocks, that must be built on top of the
	/// confirmation height before the output can be spent.
	fn blocks_to_maturity(&self) -> u32;

	/// Returns the witness template applying to this output.
	fn witness_type(&self) -> WitnessType;

	/// Returns the sign descriptor handed to the signer when sweeping this output.
	fn sign_desc(&self) -> &SignDescriptor;

	/// Returns the height at which this output was confirmed. A zero value indicates that the
	/// output has not been confirmed yet.
	fn conf_height(&self) -> u32;

	/// Marks the height at which the output was confirmed in the chain.
	fn set_conf_height(&mut self, height: u32);

	/// Returns the absolute height at which this output becomes spendable. Only meaningful once
	/// the confirmation height is known.
	fn maturity_height(&self) -> u32 {
		debug_assert_ne!(self.conf_height(), 0);
		self.conf_height() + self.blocks_to_maturity()
	}

	/// Generates the witness spending this output as input `input_index` of `spend_tx`.
	fn build_witness<'a>(
		&self, signer: &dyn WitnessSigner, spend_tx: &'a Transaction,
		sighash_cache: &mut SighashCache<&'a Transaction>, input_index: usize,
	) -> Result<Witness, Error> {
		signer.sign_output(spend_tx, sighash_cache, input_index, self.sign_desc(), self.witness_type())
	}
}

/// An output waiting for a required block height before its funds can be moved into the user's
/// wallet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KidOutput {
	amount: Amount,
	outpoint: OutPoint,
	origin_chan_point: OutPoint,
	blocks_to_maturity: u32,
	conf_height: u32,
	witness_type: WitnessType,
	sign_desc: SignDescriptor,
}

impl KidOutput {
	/// Creates a new output awaiting maturity. The amount is taken from the output recorded in
	/// the sign descriptor.
	pub fn new(
		outpoint: OutPoint, origin_chan_point: OutPoint, blocks_to_maturity: u32,
		witness_type: WitnessType, sign_desc: SignDescriptor,
	) -> Self {
		Self {
			amount: sign_desc.output.value,
			outpoint,
			origin_chan_point,
			blocks_to_maturity,
			conf_height: 0,
			witness_type,
			sign_desc,
		}
	}
}

impl CsvSpendableOutput for KidOutput {
	fn amount(&self) -> Amount {
		self.amount
	}

	fn outpoint(&self) -> OutPoint {
		self.outpoint
	}

	fn origin_channel_point(&self) -> OutPoint {
		self.origin_chan_point
	}

	fn blocks_to_maturity(&self) -> u32 {
		self.blocks_to_maturity
	}

	fn witness_type(&self) -> WitnessType {
		self.witness_type
	}

	fn sign_desc(&self) -> &SignDescriptor {
		&self.sign_desc
	}

	fn conf_height(&self) -> u32 {
		self.conf_height
	}

	fn set_conf_height(&mut self, height: u32) {
		self.conf_height = height;
	}
}

impl Writeable for KidOutput {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), lightning::io::Error> {
		self.amount.to_sat().write(writer)?;
		write_outpoint(writer, &self.outpoint)?;
		write_outpoint(writer, &self.origin_chan_point)?;
		self.blocks_to_maturity.write(writer)?;
		self.conf_height.write(writer)?;
		self.witness_type.write(writer)?;
		self.sign_desc.write(writer)
	}
}

impl Readable for KidOutput {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let amount_sats: u64 = Readable::read(reader)?;
		let outpoint = read_outpoint(reader)?;
		let origin_chan_point = read_outpoint(reader)?;
		let blocks_to_maturity: u32 = Readable::read(reader)?;
		let conf_height: u32 = Readable::read(reader)?;
		let witness_type: WitnessType = Readable::read(reader)?;
		let sign_desc: SignDescriptor = Readable::read(reader)?;

		Ok(Self {
			amount: Amount::from_sat(amount_sats),
			outpoint,
			origin_chan_point,
			blocks_to_maturity,
			conf_height,
			witness_type,
			sign_desc,
		})
	}
}

/// A two-stage HTLC output in the earliest stage of upbringing.
///
/// Carries the pre-signed timeout transaction to broadcast at the absolute expiry height, and the
/// future [`KidOutput`] describing the delayed second-stage output that results from confirming
/// it. The timeout transaction was signed by the wallet at channel close time, so its txid is
/// fixed and the nursery only ever broadcasts and watches it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BabyOutput {
	expiry: u32,
	timeout_tx: Transaction,
	kid: KidOutput,
}

impl BabyOutput {
	/// Creates a new two-stage output wrapping a future [`KidOutput`]. `outpoint` is the
	/// second-stage output created by `timeout_tx`; `blocks_to_maturity` its relative delay once
	/// confirmed.
	pub fn new(
		outpoint: OutPoint, origin_chan_point: OutPoint, blocks_to_maturity: u32, expiry: u32,
		timeout_tx: Transaction, sign_desc: SignDescriptor,
	) -> Self {
		let kid = KidOutput::new(
			outpoint,
			origin_chan_point,
			blocks_to_maturity,
			WitnessType::HtlcOfferedTimeout,
			sign_desc,
		);
		Self { expiry, timeout_tx, kid }
	}

	/// Returns the absolute height at which the timeout transaction becomes valid and should be
	/// broadcast.
	pub fn expiry(&self) -> u32 {
		self.expiry
	}

	/// Returns the pre-signed first-stage timeout transaction.
	pub fn timeout_tx(&self) -> &Transaction {
		&self.timeout_tx
	}

	/// Returns the wrapped second-stage output.
	pub fn kid(&self) -> &KidOutput {
		&self.kid
	}
}

impl CsvSpendableOutput for BabyOutput {
	fn amount(&self) -> Amount {
		self.kid.amount()
	}

	fn outpoint(&self) -> OutPoint {
		self.kid.outpoint()
	}

	fn origin_channel_point(&self) -> OutPoint {
		self.kid.origin_channel_point()
	}

	fn blocks_to_maturity(&self) -> u32 {
		self.kid.blocks_to_maturity()
	}

	fn witness_type(&self) -> WitnessType {
		self.kid.witness_type()
	}

	fn sign_desc(&self) -> &SignDescriptor {
		self.kid.sign_desc()
	}

	fn conf_height(&self) -> u32 {
		self.kid.conf_height()
	}

	fn set_conf_height(&mut self, height: u32) {
		self.kid.set_conf_height(height);
	}
}

impl Writeable for BabyOutput {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), lightning::io::Error> {
		self.expiry.write(writer)?;
		self.timeout_tx.write(writer)?;
		self.kid.write(writer)
	}
}

impl Readable for BabyOutput {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let expiry: u32 = Readable::read(reader)?;
		let timeout_tx: Transaction = Readable::read(reader)?;
		let kid: KidOutput = Readable::read(reader)?;

		Ok(Self { expiry, timeout_tx, kid })
	}
}

/// The on-chain aftermath of a unilateral channel close, handed to
/// [`UtxoNursery::incubate_outputs`].
///
/// [`UtxoNursery::incubate_outputs`]: crate::UtxoNursery::incubate_outputs
#[derive(Clone, Debug)]
pub struct ForceCloseSummary {
	/// The funding outpoint of the force-closed channel.
	pub channel_point: OutPoint,
	/// The commitment transaction output paying to ourselves.
	pub self_outpoint: OutPoint,
	/// The relative delay, in blocks, encumbering our commitment and second-stage HTLC outputs.
	pub output_maturity: u32,
	/// The sign descriptor for our commitment output, or `None` if our balance was dust and no
	/// such output exists.
	pub self_output_sign_desc: Option<SignDescriptor>,
	/// The resolutions of all HTLCs offered on the broadcast commitment transaction.
	pub htlc_resolutions: Vec<HtlcResolution>,
}

/// The material required to resolve a single offered HTLC after a force close.
#[derive(Clone, Debug)]
pub struct HtlcResolution {
	/// The absolute height at which `signed_timeout_tx` becomes valid.
	pub expiry: u32,
	/// The fully signed first-stage timeout transaction. Its first output is the delayed
	/// second-stage output the nursery will sweep.
	pub signed_timeout_tx: Transaction,
	/// The sign descriptor for the second-stage output.
	pub sweep_sign_desc: SignDescriptor,
}

pub(crate) fn write_outpoint<W: Writer>(
	writer: &mut W, outpoint: &OutPoint,
) -> Result<(), lightning::io::Error> {
	BigSize(32).write(writer)?;
	writer.write_all(&outpoint.txid.to_byte_array())?;
	outpoint.vout.write(writer)
}

pub(crate) fn read_outpoint<R: Read>(reader: &mut R) -> Result<OutPoint, DecodeError> {
	let txid_len: BigSize = Readable::read(reader)?;
	if txid_len.0 != 32 {
		return Err(DecodeError::InvalidValue);
	}

	let mut txid_bytes = [0u8; 32];
	reader.read_exact(&mut txid_bytes)?;
	let txid = Txid::from_byte_array(txid_bytes);

	let vout: u32 = Readable::read(reader)?;
	Ok(OutPoint { txid, vout })
}

/// Decodes a value from `bytes`, requiring that the value consumes the buffer exactly.
pub(crate) fn decode_exact<T: Readable>(bytes: &[u8]) -> Result<T, DecodeError> {
	let mut reader = Cursor::new(bytes);
	let res = T::read(&mut reader)?;
	if reader.position() != bytes.len() as u64 {
		return Err(DecodeError::InvalidValue);
	}
	Ok(res)
}
