// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

//! The persistent, height-indexed state machine of incubating outputs.
//!
//! Outputs move through four buckets:
//! - `crib` holds two-stage HTLC outputs waiting for their absolute expiry, indexed under the
//!   expiry height;
//! - `pscl` (preschool) holds commitment outputs waiting for the commitment transaction to
//!   confirm, at which point their maturity height becomes known;
//! - `kndr` (kindergarten) holds outputs with a known maturity height, indexed under that
//!   height, waiting to be swept;
//! - `grad` holds swept outputs, retained until their height is purged.
//!
//! The store additionally pins the finalized sweep transaction per height. Once
//! [`NurseryStore::finalize_kinder`] has returned, [`NurseryStore::fetch_class`] returns that
//! transaction byte for byte, which is what keeps a single txid per kindergarten batch across
//! restarts.

use crate::logger::{log_error, Logger};
use crate::output::{
	decode_exact, read_outpoint, write_outpoint, BabyOutput, CsvSpendableOutput, KidOutput,
};
use crate::types::{DynLogger, DynStore};
use crate::Error;

use lightning::ln::msgs::DecodeError;
use lightning::util::ser::{BigSize, Readable, Writeable, Writer};

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Transaction};

use lightning::io::Read;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// The nursery state will be persisted under this key.
pub(crate) const NURSERY_STORE_PERSISTENCE_PRIMARY_NAMESPACE: &str = "nursery";
pub(crate) const NURSERY_STORE_PERSISTENCE_SECONDARY_NAMESPACE: &str = "";
pub(crate) const NURSERY_STORE_PERSISTENCE_KEY: &str = "outputs";

pub(crate) const CRIB_PREFIX: [u8; 4] = *b"crib";
pub(crate) const PSCL_PREFIX: [u8; 4] = *b"pscl";
pub(crate) const KNDR_PREFIX: [u8; 4] = *b"kndr";
pub(crate) const GRAD_PREFIX: [u8; 4] = *b"grad";

/// The maturity of a channel tracked by the nursery.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ChannelMaturity {
	/// The channel is not tracked by the nursery.
	NotFound,
	/// At least one of the channel's outputs has not graduated yet.
	Immature,
	/// Every output recorded for the channel has graduated.
	Mature,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct HeightClass {
	sweep_tx: Option<Transaction>,
	crib: Vec<BabyOutput>,
	kndr: Vec<KidOutput>,
	grad: Vec<KidOutput>,
}

impl HeightClass {
	fn is_empty(&self) -> bool {
		self.sweep_tx.is_none() && self.crib.is_empty() && self.kndr.is_empty() && self.grad.is_empty()
	}
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct NurseryState {
	last_finalized_height: u32,
	last_purged_height: u32,
	last_graduated_height: u32,
	preschool: Vec<KidOutput>,
	classes: BTreeMap<u32, HeightClass>,
	channels: BTreeMap<OutPoint, BTreeMap<Vec<u8>, Vec<u8>>>,
}

pub(crate) struct NurseryStore {
	state: Mutex<NurseryState>,
	kv_store: Arc<DynStore>,
	logger: Arc<DynLogger>,
}

impl NurseryStore {
	/// Loads the previously persisted state from the given store, starting fresh if none exists.
	pub(crate) fn new(kv_store: Arc<DynStore>, logger: Arc<DynLogger>) -> Result<Self, Error> {
		let state = match kv_store.read(
			NURSERY_STORE_PERSISTENCE_PRIMARY_NAMESPACE,
			NURSERY_STORE_PERSISTENCE_SECONDARY_NAMESPACE,
			NURSERY_STORE_PERSISTENCE_KEY,
		) {
			Ok(bytes) => decode_exact::<NurseryState>(&bytes).map_err(|e| {
				log_error!(logger, "Failed to decode persisted nursery state: {:?}", e);
				Error::DecodeFailed
			})?,
			Err(e) if e.kind() == lightning::io::ErrorKind::NotFound => NurseryState::default(),
			Err(e) => {
				log_error!(logger, "Failed to read persisted nursery state: {}", e);
				return Err(Error::PersistenceFailed);
			},
		};

		Ok(Self { state: Mutex::new(state), kv_store, logger })
	}

	/// Persists the given kid output in preschool and the given baby outputs in their cribs,
	/// indexed under the respective heights. Either all inserts apply or none.
	pub(crate) fn incubate(
		&self, commitment_output: Option<KidOutput>, htlc_outputs: Vec<BabyOutput>,
	) -> Result<(), Error> {
		self.update(|state| {
			if let Some(kid) = &commitment_output {
				if !state.preschool.iter().any(|k| k.outpoint() == kid.outpoint()) {
					state.preschool.push(kid.clone());
				}
				state
					.channels
					.entry(kid.origin_channel_point())
					.or_default()
					.insert(chan_output_key(&PSCL_PREFIX, &kid.outpoint()), kid.encode());
			}

			for baby in &htlc_outputs {
				let class = state.classes.entry(baby.expiry()).or_default();
				if !class.crib.iter().any(|b| b.outpoint() == baby.outpoint()) {
					class.crib.push(baby.clone());
				}
				state
					.channels
					.entry(baby.origin_channel_point())
					.or_default()
					.insert(chan_output_key(&CRIB_PREFIX, &baby.outpoint()), baby.encode());
			}

			Ok(())
		})
	}

	/// Returns all outputs currently waiting for their commitment transaction to confirm.
	pub(crate) fn fetch_preschools(&self) -> Vec<KidOutput> {
		self.state.lock().unwrap().preschool.clone()
	}

	/// Returns the sweep transaction previously finalized for `height` (if any), the
	/// kindergarten outputs maturing at `height`, and the crib outputs expiring at `height`.
	pub(crate) fn fetch_class(
		&self, height: u32,
	) -> (Option<Transaction>, Vec<KidOutput>, Vec<BabyOutput>) {
		let locked_state = self.state.lock().unwrap();
		match locked_state.classes.get(&height) {
			Some(class) => (class.sweep_tx.clone(), class.kndr.clone(), class.crib.clone()),
			None => (None, Vec::new(), Vec::new()),
		}
	}

	/// Pins the sweep transaction for `height` (which may be `None` if no kindergarten outputs
	/// mature there) and advances the last finalized height.
	///
	/// Repeated calls for an already finalized height are no-ops, so the first transaction
	/// stored for a height is never rewritten.
	pub(crate) fn finalize_kinder(
		&self, height: u32, sweep_tx: Option<Transaction>,
	) -> Result<(), Error> {
		self.update(|state| {
			if height <= state.last_finalized_height {
				return Ok(());
			}

			if let Some(tx) = &sweep_tx {
				state.classes.entry(height).or_default().sweep_tx = Some(tx.clone());
			}
			state.last_finalized_height = height;

			Ok(())
		})
	}

	/// Returns the greatest height for which a sweep transaction has been finalized.
	pub(crate) fn last_finalized_height(&self) -> u32 {
		self.state.lock().unwrap().last_finalized_height
	}

	/// Returns the greatest height that has been purged from the store.
	pub(crate) fn last_purged_height(&self) -> u32 {
		self.state.lock().unwrap().last_purged_height
	}

	/// Relocates a baby output whose timeout transaction confirmed from its crib to
	/// kindergarten, re-indexing the wrapped kid under its now known maturity height.
	pub(crate) fn crib_to_kinder(&self, baby: &BabyOutput) -> Result<(), Error> {
		let kid = baby.kid().clone();
		debug_assert_ne!(kid.conf_height(), 0);

		self.update(|state| {
			let mut drop_expiry_class = false;
			if let Some(class) = state.classes.get_mut(&baby.expiry()) {
				class.crib.retain(|b| b.outpoint() != baby.outpoint());
				drop_expiry_class = class.is_empty();
			}
			if drop_expiry_class {
				state.classes.remove(&baby.expiry());
			}

			let class = state.classes.entry(kid.maturity_height()).or_default();
			if !class.kndr.iter().any(|k| k.outpoint() == kid.outpoint()) {
				class.kndr.push(kid.clone());
			}

			if let Some(chan_outputs) = state.channels.get_mut(&kid.origin_channel_point()) {
				chan_outputs.remove(&chan_output_key(&CRIB_PREFIX, &kid.outpoint()));
				chan_outputs.insert(chan_output_key(&KNDR_PREFIX, &kid.outpoint()), kid.encode());
			}

			Ok(())
		})
	}

	/// Relocates a kid output whose commitment transaction confirmed from preschool to
	/// kindergarten, indexing it under its now known maturity height.
	pub(crate) fn preschool_to_kinder(&self, kid: &KidOutput) -> Result<(), Error> {
		debug_assert_ne!(kid.conf_height(), 0);

		self.update(|state| {
			state.preschool.retain(|k| k.outpoint() != kid.outpoint());

			let class = state.classes.entry(kid.maturity_height()).or_default();
			if !class.kndr.iter().any(|k| k.outpoint() == kid.outpoint()) {
				class.kndr.push(kid.clone());
			}

			if let Some(chan_outputs) = state.channels.get_mut(&kid.origin_channel_point()) {
				chan_outputs.remove(&chan_output_key(&PSCL_PREFIX, &kid.outpoint()));
				chan_outputs.insert(chan_output_key(&KNDR_PREFIX, &kid.outpoint()), kid.encode());
			}

			Ok(())
		})
	}

	/// Relocates the given kids from kindergarten at `height` to the graduated bucket.
	pub(crate) fn graduate_kinder(&self, height: u32, kids: &[KidOutput]) -> Result<(), Error> {
		self.update(|state| {
			let class = state.classes.entry(height).or_default();
			for kid in kids {
				class.kndr.retain(|k| k.outpoint() != kid.outpoint());
				if !class.grad.iter().any(|k| k.outpoint() == kid.outpoint()) {
					class.grad.push(kid.clone());
				}

				if let Some(chan_outputs) = state.channels.get_mut(&kid.origin_channel_point()) {
					chan_outputs.remove(&chan_output_key(&KNDR_PREFIX, &kid.outpoint()));
					chan_outputs
						.insert(chan_output_key(&GRAD_PREFIX, &kid.outpoint()), kid.encode());
				}
			}

			Ok(())
		})
	}

	/// Records that class `height` graduated successfully, advancing the monotonic graduation
	/// watermark if no unswept outputs remain at that height.
	pub(crate) fn try_finalize_class(&self, height: u32) -> Result<(), Error> {
		self.update(|state| {
			let class_done = state
				.classes
				.get(&height)
				.map_or(true, |class| class.crib.is_empty() && class.kndr.is_empty());
			if class_done && height > state.last_graduated_height {
				state.last_graduated_height = height;
			}

			Ok(())
		})
	}

	/// Returns whether every output ever recorded for the given channel has graduated.
	pub(crate) fn is_mature_channel(&self, channel_point: &OutPoint) -> ChannelMaturity {
		let locked_state = self.state.lock().unwrap();
		match locked_state.channels.get(channel_point) {
			None => ChannelMaturity::NotFound,
			Some(chan_outputs) => {
				if chan_outputs.keys().all(|key| key.starts_with(&GRAD_PREFIX)) {
					ChannelMaturity::Mature
				} else {
					ChannelMaturity::Immature
				}
			},
		}
	}

	/// Erases the channel index and all outpoints recorded under it. Only legal once
	/// [`Self::is_mature_channel`] reports the channel mature.
	pub(crate) fn remove_channel(&self, channel_point: &OutPoint) -> Result<(), Error> {
		self.update(|state| {
			state.channels.remove(channel_point).map(|_| ()).ok_or(Error::ChannelNotFound)
		})
	}

	/// Drops the finalized sweep transactions and graduated outputs of all heights up to and
	/// including `height`. Must not be called for heights above the reorg safety floor.
	pub(crate) fn purge_height(&self, height: u32) -> Result<(), Error> {
		self.update(|state| {
			let mut emptied = Vec::new();
			for (purged_height, class) in state.classes.range_mut(..=height) {
				class.grad.clear();
				class.sweep_tx = None;
				if class.is_empty() {
					emptied.push(*purged_height);
				}
			}
			for purged_height in emptied {
				state.classes.remove(&purged_height);
			}

			if height > state.last_purged_height {
				state.last_purged_height = height;
			}

			Ok(())
		})
	}

	/// Visits the raw key/value pairs recorded under the given channel. Keys carry the 4-byte
	/// state prefix followed by the outpoint; values are the serialized outputs.
	pub(crate) fn for_chan_outputs<F>(
		&self, channel_point: &OutPoint, mut visit: F,
	) -> Result<(), Error>
	where
		F: FnMut(&[u8], &[u8]) -> Result<(), Error>,
	{
		let locked_state = self.state.lock().unwrap();
		let chan_outputs =
			locked_state.channels.get(channel_point).ok_or(Error::ChannelNotFound)?;
		for (key, value) in chan_outputs.iter() {
			visit(key, value)?;
		}
		Ok(())
	}

	/// Applies `mutate` to a copy of the in-memory state and persists the result, only
	/// committing the copy once the write went through. A failed mutation or persist leaves
	/// both the in-memory and the on-disk state untouched.
	fn update<R>(&self, mutate: impl FnOnce(&mut NurseryState) -> Result<R, Error>) -> Result<R, Error> {
		let mut locked_state = self.state.lock().unwrap();

		let mut updated_state = locked_state.clone();
		let res = mutate(&mut updated_state)?;
		self.persist(&updated_state)?;

		*locked_state = updated_state;
		Ok(res)
	}

	fn persist(&self, state: &NurseryState) -> Result<(), Error> {
		let data = state.encode();
		self.kv_store
			.write(
				NURSERY_STORE_PERSISTENCE_PRIMARY_NAMESPACE,
				NURSERY_STORE_PERSISTENCE_SECONDARY_NAMESPACE,
				NURSERY_STORE_PERSISTENCE_KEY,
				&data,
			)
			.map_err(|e| {
				log_error!(
					self.logger,
					"Write for key {}/{} failed due to: {}",
					NURSERY_STORE_PERSISTENCE_PRIMARY_NAMESPACE,
					NURSERY_STORE_PERSISTENCE_KEY,
					e
				);
				Error::PersistenceFailed
			})
	}
}

fn chan_output_key(prefix: &[u8; 4], outpoint: &OutPoint) -> Vec<u8> {
	let mut key = Vec::with_capacity(40);
	key.extend_from_slice(prefix);
	key.extend_from_slice(&outpoint.txid.to_byte_array());
	key.extend_from_slice(&outpoint.vout.to_be_bytes());
	key
}

fn write_len_prefixed_vec<W: Writer, T: Writeable>(
	writer: &mut W, items: &[T],
) -> Result<(), lightning::io::Error> {
	BigSize(items.len() as u64).write(writer)?;
	for item in items {
		item.write(writer)?;
	}
	Ok(())
}

fn read_len_prefixed_vec<R: Read, T: Readable>(reader: &mut R) -> Result<Vec<T>, DecodeError> {
	let len: BigSize = Readable::read(reader)?;
	let mut items = Vec::new();
	for _ in 0..len.0 {
		items.push(Readable::read(reader)?);
	}
	Ok(items)
}

fn write_len_prefixed_bytes<W: Writer>(
	writer: &mut W, bytes: &[u8],
) -> Result<(), lightning::io::Error> {
	BigSize(bytes.len() as u64).write(writer)?;
	writer.write_all(bytes)
}

fn read_len_prefixed_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>, DecodeError> {
	let len: BigSize = Readable::read(reader)?;
	let mut bytes = vec![0u8; len.0 as usize];
	reader.read_exact(&mut bytes)?;
	Ok(bytes)
}

impl Writeable for HeightClass {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), lightning::io::Error> {
		match &self.sweep_tx {
			Some(tx) => {
				1u8.write(writer)?;
				tx.write(writer)?;
			},
			None => 0u8.write(writer)?,
		}
		write_len_prefixed_vec(writer, &self.crib)?;
		write_len_prefixed_vec(writer, &self.kndr)?;
		write_len_prefixed_vec(writer, &self.grad)
	}
}

impl Readable for HeightClass {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let has_sweep_tx: u8 = Readable::read(reader)?;
		let sweep_tx = match has_sweep_tx {
			0 => None,
			1 => Some(Readable::read(reader)?),
			_ => return Err(DecodeError::InvalidValue),
		};
		let crib = read_len_prefixed_vec(reader)?;
		let kndr = read_len_prefixed_vec(reader)?;
		let grad = read_len_prefixed_vec(reader)?;

		Ok(Self { sweep_tx, crib, kndr, grad })
	}
}

impl Writeable for NurseryState {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), lightning::io::Error> {
		self.last_finalized_height.write(writer)?;
		self.last_purged_height.write(writer)?;
		self.last_graduated_height.write(writer)?;

		write_len_prefixed_vec(writer, &self.preschool)?;

		BigSize(self.classes.len() as u64).write(writer)?;
		for (height, class) in self.classes.iter() {
			height.write(writer)?;
			class.write(writer)?;
		}

		BigSize(self.channels.len() as u64).write(writer)?;
		for (channel_point, chan_outputs) in self.channels.iter() {
			write_outpoint(writer, channel_point)?;
			BigSize(chan_outputs.len() as u64).write(writer)?;
			for (key, value) in chan_outputs.iter() {
				write_len_prefixed_bytes(writer, key)?;
				write_len_prefixed_bytes(writer, value)?;
			}
		}

		Ok(())
	}
}

impl Readable for NurseryState {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let last_finalized_height: u32 = Readable::read(reader)?;
		let last_purged_height: u32 = Readable::read(reader)?;
		let last_graduated_height: u32 = Readable::read(reader)?;

		let preschool = read_len_prefixed_vec(reader)?;

		let num_classes: BigSize = Readable::read(reader)?;
		let mut classes = BTreeMap::new();
		for _ in 0..num_classes.0 {
			let height: u32 = Readable::read(reader)?;
			let class: HeightClass = Readable::read(reader)?;
			classes.insert(height, class);
		}

		let num_channels: BigSize = Readable::read(reader)?;
		let mut channels = BTreeMap::new();
		for _ in 0..num_channels.0 {
			let channel_point = read_outpoint(reader)?;
			let num_outputs: BigSize = Readable::read(reader)?;
			let mut chan_outputs = BTreeMap::new();
			for _ in 0..num_outputs.0 {
				let key = read_len_prefixed_bytes(reader)?;
				let value = read_len_prefixed_bytes(reader)?;
				chan_outputs.insert(key, value);
			}
			channels.insert(channel_point, chan_outputs);
		}

		Ok(Self {
			last_finalized_height,
			last_purged_height,
			last_graduated_height,
			preschool,
			classes,
			channels,
		})
	}
}
