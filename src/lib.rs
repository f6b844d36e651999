// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

#![crate_name = "utxo_nursery"]

//! # UTXO Nursery
//! An incubator for the time-locked outputs a payment-channel node is left with after a channel
//! force-closes on-chain.
//!
//! Such outputs cannot be spent right away: commitment outputs only become spendable a relative
//! number of blocks (CSV) after the commitment transaction confirms, and two-stage HTLC outputs
//! first require broadcasting a pre-signed timeout transaction at an absolute height (CLTV),
//! followed by another relative delay. The [`UtxoNursery`] accepts these outputs via
//! [`incubate_outputs`], drives them through the required height-dependent ceremonies as blocks
//! arrive, and finally sweeps all outputs maturing at a given height with a single batch
//! transaction paying to the on-chain wallet. Once every output of a channel has been swept, the
//! channel is marked fully closed in the external channel database.
//!
//! Outputs progress through four persistent states:
//! - **crib**: a two-stage HTLC output waiting for its timeout transaction to become valid and
//!   confirm;
//! - **preschool**: a commitment output waiting for the commitment transaction to confirm;
//! - **kindergarten**: an output whose maturity height is known, waiting to be swept;
//! - **graduated**: an output swept into the wallet.
//!
//! The batch sweep transaction for a height is signed once and pinned in the nursery store
//! before it is first broadcast, so a crash between signing and broadcasting can never produce
//! two different txids for the same batch. All progress is crash-safe: on startup the nursery
//! replays every block height it missed while offline before subscribing to live block events.
//!
//! Two limitations to be aware of:
//! - A reorg that unconfirms an already swept output is not handled; the affected outputs stay
//!   graduated even though their sweep reverted.
//! - The pinned sweep transaction is never fee-bumped. If its fee rate turns out too low to
//!   relay, the nursery will keep rebroadcasting the same transaction on every block.
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

mod chain;
mod channel_registry;
mod config;
mod error;
mod fee_estimator;
mod logger;
mod output;
mod store;
mod sweep;
#[cfg(test)]
mod test;
mod tx_broadcaster;
mod types;
mod wallet;

pub use bitcoin;
pub use lightning;

pub use chain::{BlockEpoch, ChainNotifier, ChainSource, TxConfirmation};
pub use channel_registry::ChannelRegistry;
pub use config::Config;
pub use error::Error;
pub use fee_estimator::FeeEstimator;
pub use logger::{FilesystemLogger, LogLevel};
pub use output::{
	BabyOutput, CsvSpendableOutput, ForceCloseSummary, HtlcResolution, KidOutput, SignDescriptor,
	WitnessType,
};
pub use tx_broadcaster::{Broadcaster, PublishError};
pub use wallet::{SweepScriptSource, WitnessSigner};

use crate::logger::{log_debug, log_error, log_info, Logger};
use crate::output::decode_exact;
use crate::store::{ChannelMaturity, NurseryStore, KNDR_PREFIX, PSCL_PREFIX};
use crate::types::{
	DynBroadcaster, DynChainNotifier, DynChainSource, DynChannelRegistry, DynFeeEstimator,
	DynLogger, DynSweepScriptSource, DynWitnessSigner,
};

use lightning::util::persist::KVStore;

use bitcoin::{Amount, OutPoint, Transaction};

use tokio::sync::{oneshot, watch, Mutex, Notify};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// The maturity progress of a force-closed channel still tracked by the nursery.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NurseryReport {
	/// The funding outpoint of the channel awaiting maturity.
	pub channel_point: OutPoint,
	/// The total value still frozen within this channel's outputs.
	pub limbo_balance: Amount,
	/// The height at which the watched output confirmed, or zero if unconfirmed.
	pub confirmation_height: u32,
	/// The number of blocks that must be built on top of the confirmation before the output
	/// matures.
	pub maturity_requirement: u32,
	/// The absolute height at which the output matures, or zero while unknown.
	pub maturity_height: u32,
}

/// A system dedicated to incubating the time-locked outputs created by the broadcast of a
/// commitment transaction, either by us or by the remote peer.
///
/// The nursery accepts outputs via [`incubate_outputs`] and shepherds them until maturity, at
/// which point they are swept back into the source wallet in per-height batches. See the
/// [crate-level documentation] for the full lifecycle.
///
/// All chain access happens through the collaborator interfaces handed to [`new`]; the nursery
/// itself performs no network I/O.
///
/// [`incubate_outputs`]: Self::incubate_outputs
/// [`new`]: Self::new
/// [crate-level documentation]: crate
pub struct UtxoNursery {
	inner: Arc<NurseryInner>,
}

impl UtxoNursery {
	/// Creates a new nursery over the given persistence backend and collaborators, reloading
	/// any previously persisted outputs.
	pub fn new(
		config: Config, kv_store: Arc<dyn KVStore + Send + Sync>,
		chain_source: Arc<dyn ChainSource + Send + Sync>,
		notifier: Arc<dyn ChainNotifier + Send + Sync>,
		fee_estimator: Arc<dyn FeeEstimator + Send + Sync>,
		broadcaster: Arc<dyn Broadcaster + Send + Sync>,
		signer: Arc<dyn WitnessSigner + Send + Sync>,
		sweep_script_source: Arc<dyn SweepScriptSource + Send + Sync>,
		channel_registry: Arc<dyn ChannelRegistry + Send + Sync>,
		logger: Arc<dyn Logger + Send + Sync>,
	) -> Result<Self, Error> {
		debug_assert!(config.conf_depth >= 1);
		debug_assert!(config.pruning_depth >= config.conf_depth);

		let store = Arc::new(NurseryStore::new(kv_store, Arc::clone(&logger))?);
		let (stop_sender, _) = watch::channel(());

		Ok(Self {
			inner: Arc::new(NurseryInner {
				config,
				store,
				chain_source,
				notifier,
				fee_estimator,
				broadcaster,
				signer,
				sweep_script_source,
				channel_registry,
				logger,
				current_height: Arc::new(Mutex::new(0)),
				stop_sender,
				tasks: Arc::new(TaskCounter::new()),
				started: AtomicBool::new(false),
				stopped: AtomicBool::new(false),
			}),
		})
	}

	/// Starts the nursery on the ambient `tokio` runtime.
	///
	/// Flushes any channels whose outputs fully graduated while we were offline, replays all
	/// block heights missed since the last purge, re-registers confirmation watchers for
	/// preschool outputs, and only then subscribes to live block events. The replay happens
	/// strictly before the subscription so that no height is ever processed concurrently with
	/// itself.
	pub async fn start(&self) -> Result<(), Error> {
		let inner = &self.inner;
		if inner.started.swap(true, Ordering::SeqCst) {
			return Err(Error::AlreadyRunning);
		}

		log_info!(inner.logger, "Starting UTXO nursery");

		// Ensure all channels that matured while we were offline are marked fully closed in
		// the external database.
		let pending_close_channels = inner.channel_registry.fetch_pending_closed_channels()?;
		for channel_point in pending_close_channels {
			inner.close_and_remove_if_mature(&channel_point)?;
		}

		// Replay crib and kindergarten outputs for all heights between the last purge and the
		// current chain tip.
		let last_purged_height = inner.store.last_purged_height();
		let (_, best_height) = inner.chain_source.get_best_block()?;
		if last_purged_height != 0 && last_purged_height != best_height {
			log_info!(
				inner.logger,
				"Processing outputs from missed blocks. Starting with blockHeight: {}, to current blockHeight: {}",
				last_purged_height,
				best_height
			);

			for height in last_purged_height + 1..=best_height {
				let mut height_lock = inner.current_height.lock().await;
				inner.graduate_class(&mut *height_lock, height).map_err(|e| {
					log_error!(
						inner.logger,
						"Failed to graduate outputs at height={}: {}",
						height,
						e
					);
					e
				})?;
			}

			log_info!(inner.logger, "UTXO nursery is now fully synced");
		}

		// Restart confirmation watchers for any outputs still waiting for their commitment
		// transaction to confirm.
		for kid in inner.store.fetch_preschools() {
			let conf_receiver = inner.notifier.register_tx_confirmation(
				kid.outpoint().txid,
				inner.config.conf_depth,
				last_purged_height,
			)?;

			log_info!(
				inner.logger,
				"Preschool outpoint {} re-registered for confirmation notification",
				kid.outpoint()
			);

			inner.spawn_wait_for_promotion(kid, conf_receiver);
		}

		// Now that we are caught up, start watching for new blocks.
		let mut block_epochs = inner.notifier.register_block_epochs()?;

		let incubator = Arc::clone(inner);
		let mut stop_receiver = inner.stop_sender.subscribe();
		let task_guard = TaskCounter::guard(&inner.tasks);
		tokio::spawn(async move {
			let _task_guard = task_guard;
			loop {
				tokio::select! {
					epoch = block_epochs.recv() => match epoch {
						Some(epoch) => {
							let mut height_lock = incubator.current_height.lock().await;
							if let Err(e) = incubator.graduate_class(&mut *height_lock, epoch.height) {
								log_error!(
									incubator.logger,
									"Error while graduating class at height {}: {}",
									epoch.height,
									e
								);
							}
						},
						None => {
							// The notifier is exiting, which means the node is shutting down as
							// well.
							log_debug!(incubator.logger, "Block epoch stream closed, stopping incubator");
							return;
						},
					},
					_ = stop_receiver.changed() => return,
				}
			}
		});

		Ok(())
	}

	/// Stops the nursery.
	///
	/// Signals all background tasks to shut down and waits until they have drained. The first
	/// call performs the shutdown; any subsequent call returns immediately.
	pub async fn stop(&self) -> Result<(), Error> {
		let inner = &self.inner;
		if !inner.started.load(Ordering::SeqCst) {
			return Err(Error::NotRunning);
		}
		if inner.stopped.swap(true, Ordering::SeqCst) {
			return Ok(());
		}

		log_info!(inner.logger, "UTXO nursery shutting down");

		// Sending fails if all tasks already exited, which is fine.
		let _ = inner.stop_sender.send(());
		inner.tasks.wait_for_drain().await;

		log_info!(inner.logger, "UTXO nursery shut down");
		Ok(())
	}

	/// Hands the outputs of a force-closed channel to the nursery for incubation.
	///
	/// A commitment output is only tracked if its sign descriptor is present and its value is
	/// above zero; positive-value HTLC outputs are tracked through their two-stage path. If the
	/// summary contains no output worth incubating, the channel is immediately marked fully
	/// closed in the external channel database.
	pub async fn incubate_outputs(&self, close_summary: ForceCloseSummary) -> Result<(), Error> {
		let height_lock = self.inner.current_height.lock().await;
		self.inner.incubate_outputs(*height_lock, close_summary)
	}

	/// Returns the maturity progress of a channel currently incubating, or
	/// [`Error::ChannelNotFound`] if the nursery holds no watched output for it.
	pub fn nursery_report(&self, channel_point: &OutPoint) -> Result<NurseryReport, Error> {
		let mut report = None;
		self.inner.store.for_chan_outputs(channel_point, |key, value| {
			if report.is_some() || key.len() < 4 {
				return Ok(());
			}

			if key.starts_with(&PSCL_PREFIX) || key.starts_with(&KNDR_PREFIX) {
				let kid: KidOutput = decode_exact(value).map_err(Error::from)?;

				let mut entry = NurseryReport {
					channel_point: *channel_point,
					limbo_balance: kid.amount(),
					confirmation_height: 0,
					maturity_requirement: kid.blocks_to_maturity(),
					maturity_height: 0,
				};

				// Once the confirmation height is known, so is the final maturity height.
				if kid.conf_height() != 0 {
					entry.confirmation_height = kid.conf_height();
					entry.maturity_height = kid.maturity_height();
				}

				report = Some(entry);
			}

			Ok(())
		})?;

		report.ok_or(Error::ChannelNotFound)
	}

	#[cfg(test)]
	pub(crate) fn store(&self) -> Arc<NurseryStore> {
		Arc::clone(&self.inner.store)
	}
}

struct NurseryInner {
	config: Config,
	store: Arc<NurseryStore>,
	chain_source: Arc<DynChainSource>,
	notifier: Arc<DynChainNotifier>,
	fee_estimator: Arc<DynFeeEstimator>,
	broadcaster: Arc<DynBroadcaster>,
	signer: Arc<DynWitnessSigner>,
	sweep_script_source: Arc<DynSweepScriptSource>,
	channel_registry: Arc<DynChannelRegistry>,
	logger: Arc<DynLogger>,
	// The coordination lock serializing all state-mutating paths. The guarded value is the
	// height the nursery most recently processed.
	current_height: Arc<Mutex<u32>>,
	stop_sender: watch::Sender<()>,
	tasks: Arc<TaskCounter>,
	started: AtomicBool,
	stopped: AtomicBool,
}

impl NurseryInner {
	/// Handles all outputs whose CSV or CLTV delay expires at `class_height`. Called with the
	/// coordination lock held, both for every newly connected block and during startup replay.
	fn graduate_class(&self, current_height: &mut u32, class_height: u32) -> Result<(), Error> {
		*current_height = class_height;

		let (mut final_tx, kgtn_outputs, crib_outputs) = self.store.fetch_class(class_height);

		// If we haven't processed this height before, sign a sweep transaction spending the
		// kindergarten outputs and pin it, so that a retry of this height can never broadcast a
		// different txid for the same batch.
		if class_height > self.store.last_finalized_height() {
			let sweep_tx = if kgtn_outputs.is_empty() {
				None
			} else {
				Some(sweep::create_sweep_tx(
					&kgtn_outputs,
					self.config.sweep_conf_target,
					&*self.fee_estimator,
					&*self.sweep_script_source,
					&*self.signer,
					&*self.logger,
				)?)
			};

			self.store.finalize_kinder(class_height, sweep_tx.clone())?;
			// From this point on the transaction for this height is committed; crashing and
			// resuming will reuse it.

			if sweep_tx.is_some() {
				log_info!(self.logger, "Finalized kindergarten at height {}", class_height);
			}
			final_tx = sweep_tx;
		}

		if let Some(sweep_tx) = final_tx {
			// Outputs the builder refused to sweep (unknown witness types) stay behind in
			// kindergarten; only graduate what the pinned transaction actually spends.
			let swept_outputs: Vec<KidOutput> = kgtn_outputs
				.into_iter()
				.filter(|kid| {
					sweep_tx.input.iter().any(|tx_in| tx_in.previous_output == kid.outpoint())
				})
				.collect();

			let txid = sweep_tx.compute_txid();
			log_info!(
				self.logger,
				"Sweeping {} time-locked outputs with sweep tx (txid={})",
				swept_outputs.len(),
				txid
			);

			self.publish_transaction(&sweep_tx)?;

			let conf_receiver = self.notifier.register_tx_confirmation(
				txid,
				self.config.conf_depth,
				class_height,
			)?;

			self.spawn_wait_for_graduation(class_height, swept_outputs, conf_receiver);
		}

		// Broadcast all pre-signed htlc timeout transactions expiring at this height. These
		// need no finalization, as their txids were fixed when the wallet signed them.
		for baby in crib_outputs {
			self.publish_transaction(baby.timeout_tx())?;

			let conf_receiver = self.notifier.register_tx_confirmation(
				baby.outpoint().txid,
				self.config.conf_depth,
				class_height,
			)?;

			log_info!(
				self.logger,
				"Baby output {} registered for promotion notification",
				baby.outpoint()
			);

			self.spawn_wait_for_enrollment(baby, conf_receiver);
		}

		// Finally, purge all state below the reorg safety floor.
		if class_height > self.config.pruning_depth {
			let purge_height = class_height - self.config.pruning_depth;
			self.store.purge_height(purge_height).map_err(|e| {
				log_error!(self.logger, "Failed to purge height {}: {}", purge_height, e);
				e
			})?;
		}

		Ok(())
	}

	fn incubate_outputs(
		&self, current_height: u32, close_summary: ForceCloseSummary,
	) -> Result<(), Error> {
		let mut commitment_output = None;

		// Our to-self output may have been below the dust limit, in which case there is no sign
		// descriptor and nothing to incubate.
		if let Some(sign_desc) = close_summary.self_output_sign_desc {
			let kid = KidOutput::new(
				close_summary.self_outpoint,
				close_summary.channel_point,
				close_summary.output_maturity,
				WitnessType::CommitmentTimeLock,
				sign_desc,
			);

			// A zero value'd output indicates we have no settled balance within the commitment
			// transaction.
			if kid.amount() > Amount::ZERO {
				commitment_output = Some(kid);
			}
		}

		let mut htlc_outputs = Vec::with_capacity(close_summary.htlc_resolutions.len());
		for resolution in close_summary.htlc_resolutions {
			let outpoint =
				OutPoint { txid: resolution.signed_timeout_tx.compute_txid(), vout: 0 };
			let baby = BabyOutput::new(
				outpoint,
				close_summary.channel_point,
				close_summary.output_maturity,
				resolution.expiry,
				resolution.signed_timeout_tx,
				resolution.sweep_sign_desc,
			);

			if baby.amount() > Amount::ZERO {
				htlc_outputs.push(baby);
			}
		}

		// With nothing to incubate the channel is already fully resolved.
		if commitment_output.is_none() && htlc_outputs.is_empty() {
			return self.channel_registry.mark_channel_fully_closed(&close_summary.channel_point);
		}

		self.store.incubate(commitment_output.clone(), htlc_outputs)?;

		// The commitment output needs a watcher for the close transaction right away. Baby
		// outputs are picked up by their expiry class and need none yet.
		if let Some(kid) = commitment_output {
			let conf_receiver = self.notifier.register_tx_confirmation(
				kid.outpoint().txid,
				self.config.conf_depth,
				current_height,
			)?;

			log_info!(self.logger, "Added kid output to preschool: {}", kid.outpoint());

			self.spawn_wait_for_promotion(kid, conf_receiver);
		}

		Ok(())
	}

	/// Publishes a transaction, treating "already known" rejections as success. Rebroadcasts of
	/// pinned sweep transactions and replayed timeout transactions hit this path on every
	/// restart.
	fn publish_transaction(&self, tx: &Transaction) -> Result<(), Error> {
		match self.broadcaster.publish_transaction(tx) {
			Ok(()) => Ok(()),
			Err(e) if e.is_already_known() => {
				log_debug!(
					self.logger,
					"Transaction {} already known to the network: {}",
					tx.compute_txid(),
					e
				);
				Ok(())
			},
			Err(e) => {
				log_error!(self.logger, "Unable to broadcast tx {}: {}", tx.compute_txid(), e);
				Err(Error::TxBroadcastFailed)
			},
		}
	}

	fn close_and_remove_if_mature(&self, channel_point: &OutPoint) -> Result<(), Error> {
		close_and_remove_if_mature(
			&self.store,
			&*self.channel_registry,
			&*self.logger,
			channel_point,
		)
	}

	/// Spawns a reactor waiting for the confirmation of a baby output's timeout transaction,
	/// moving the output from its crib to kindergarten on success.
	fn spawn_wait_for_enrollment(
		&self, mut baby: BabyOutput, conf_receiver: oneshot::Receiver<TxConfirmation>,
	) {
		let store = Arc::clone(&self.store);
		let logger = Arc::clone(&self.logger);
		let current_height = Arc::clone(&self.current_height);
		let mut stop_receiver = self.stop_sender.subscribe();
		let task_guard = TaskCounter::guard(&self.tasks);

		tokio::spawn(async move {
			let _task_guard = task_guard;

			let confirmation = tokio::select! {
				res = conf_receiver => match res {
					Ok(confirmation) => confirmation,
					Err(_) => {
						log_error!(
							logger,
							"Notification channel closed, can't advance baby output {}",
							baby.outpoint()
						);
						return;
					},
				},
				_ = stop_receiver.changed() => return,
			};

			baby.set_conf_height(confirmation.block_height);

			let _height_lock = current_height.lock().await;
			match store.crib_to_kinder(&baby) {
				Ok(()) => {
					log_info!(logger, "Htlc output {} promoted to kindergarten", baby.outpoint())
				},
				Err(e) => log_error!(
					logger,
					"Unable to move htlc output {} from crib to kindergarten bucket: {}",
					baby.outpoint(),
					e
				),
			}
		});
	}

	/// Spawns a reactor waiting for the confirmation of a kid output's commitment transaction,
	/// moving the output from preschool to kindergarten on success.
	fn spawn_wait_for_promotion(
		&self, mut kid: KidOutput, conf_receiver: oneshot::Receiver<TxConfirmation>,
	) {
		let store = Arc::clone(&self.store);
		let logger = Arc::clone(&self.logger);
		let current_height = Arc::clone(&self.current_height);
		let mut stop_receiver = self.stop_sender.subscribe();
		let task_guard = TaskCounter::guard(&self.tasks);

		tokio::spawn(async move {
			let _task_guard = task_guard;

			let confirmation = tokio::select! {
				res = conf_receiver => match res {
					Ok(confirmation) => confirmation,
					Err(_) => {
						log_error!(
							logger,
							"Notification channel closed, can't advance output {}",
							kid.outpoint()
						);
						return;
					},
				},
				_ = stop_receiver.changed() => return,
			};

			kid.set_conf_height(confirmation.block_height);

			let _height_lock = current_height.lock().await;
			match store.preschool_to_kinder(&kid) {
				Ok(()) => log_info!(
					logger,
					"Preschool output {} promoted to kindergarten",
					kid.outpoint()
				),
				Err(e) => log_error!(
					logger,
					"Unable to move kid output from preschool to kindergarten bucket: {}",
					e
				),
			}
		});
	}

	/// Spawns a reactor waiting for the confirmation of a kindergarten sweep transaction,
	/// graduating the swept outputs and closing any channel left without unswept outputs.
	fn spawn_wait_for_graduation(
		&self, class_height: u32, kgtn_outputs: Vec<KidOutput>,
		conf_receiver: oneshot::Receiver<TxConfirmation>,
	) {
		let store = Arc::clone(&self.store);
		let channel_registry = Arc::clone(&self.channel_registry);
		let logger = Arc::clone(&self.logger);
		let current_height = Arc::clone(&self.current_height);
		let mut stop_receiver = self.stop_sender.subscribe();
		let task_guard = TaskCounter::guard(&self.tasks);

		tokio::spawn(async move {
			let _task_guard = task_guard;

			tokio::select! {
				res = conf_receiver => {
					if res.is_err() {
						log_error!(
							logger,
							"Notification channel closed, can't advance {} graduating outputs",
							kgtn_outputs.len()
						);
						return;
					}
				},
				_ = stop_receiver.changed() => return,
			};

			let _height_lock = current_height.lock().await;
			if let Err(e) = store.graduate_kinder(class_height, &kgtn_outputs) {
				log_error!(
					logger,
					"Unable to award diplomas to {} graduating outputs: {}",
					kgtn_outputs.len(),
					e
				);
				return;
			}

			log_info!(
				logger,
				"Graduated {} kindergarten outputs from height {}",
				kgtn_outputs.len(),
				class_height
			);

			// Attempt to close each channel these outputs descended from, only doing so when
			// all of the channel's outputs have graduated.
			let possible_closes: HashSet<OutPoint> =
				kgtn_outputs.iter().map(|kid| kid.origin_channel_point()).collect();
			for channel_point in possible_closes {
				if let Err(e) =
					close_and_remove_if_mature(&store, &*channel_registry, &*logger, &channel_point)
				{
					log_error!(
						logger,
						"Failed to close and remove channel {}: {}",
						channel_point,
						e
					);
					return;
				}
			}

			if let Err(e) = store.try_finalize_class(class_height) {
				log_error!(logger, "Attempt to finalize height {} failed: {}", class_height, e);
			}
		});
	}
}

/// Removes a channel from the nursery and marks it fully closed in the external database, if and
/// only if all of its outputs have graduated. Unknown or still incubating channels are left
/// untouched.
fn close_and_remove_if_mature(
	store: &NurseryStore, channel_registry: &DynChannelRegistry, logger: &DynLogger,
	channel_point: &OutPoint,
) -> Result<(), Error> {
	match store.is_mature_channel(channel_point) {
		ChannelMaturity::NotFound => return Ok(()),
		ChannelMaturity::Immature => return Ok(()),
		ChannelMaturity::Mature => {},
	}

	channel_registry.mark_channel_fully_closed(channel_point).map_err(|e| {
		log_error!(logger, "Unable to mark channel {} as fully closed: {}", channel_point, e);
		e
	})?;

	log_info!(logger, "Marked channel {} as fully closed", channel_point);

	store.remove_channel(channel_point).map_err(|e| {
		log_error!(logger, "Unable to remove channel {} from nursery store: {}", channel_point, e);
		e
	})?;

	log_info!(logger, "Removed channel {} from nursery store", channel_point);

	Ok(())
}

/// Tracks the number of outstanding background tasks, so that shutdown can block until all of
/// them have drained.
struct TaskCounter {
	count: AtomicUsize,
	notifier: Notify,
}

impl TaskCounter {
	fn new() -> Self {
		Self { count: AtomicUsize::new(0), notifier: Notify::new() }
	}

	fn guard(counter: &Arc<TaskCounter>) -> TaskGuard {
		counter.count.fetch_add(1, Ordering::SeqCst);
		TaskGuard { counter: Arc::clone(counter) }
	}

	async fn wait_for_drain(&self) {
		loop {
			let notified = self.notifier.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			if self.count.load(Ordering::SeqCst) == 0 {
				return;
			}
			notified.await;
		}
	}
}

struct TaskGuard {
	counter: Arc<TaskCounter>,
}

impl Drop for TaskGuard {
	fn drop(&mut self) {
		if self.counter.count.fetch_sub(1, Ordering::SeqCst) == 1 {
			self.counter.notifier.notify_waiters();
		}
	}
}
