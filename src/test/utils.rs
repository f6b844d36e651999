// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::chain::{BlockEpoch, ChainNotifier, ChainSource, TxConfirmation};
use crate::channel_registry::ChannelRegistry;
use crate::fee_estimator::FeeEstimator;
use crate::output::{BabyOutput, HtlcResolution, KidOutput, SignDescriptor, WitnessType};
use crate::tx_broadcaster::{Broadcaster, PublishError};
use crate::types::{
	DynBroadcaster, DynChainNotifier, DynChainSource, DynChannelRegistry, DynLogger,
	DynSweepScriptSource,
};
use crate::wallet::{SweepScriptSource, WitnessSigner};
use crate::{Config, Error, UtxoNursery};

use lightning::util::logger::{Level, Logger, Record};
use lightning::util::persist::KVStore;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
	Amount, BlockHash, FeeRate, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
	WPubkeyHash, Witness,
};

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use tokio::sync::{mpsc, oneshot};

use std::collections::{hash_map, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) struct TestStore {
	persisted_bytes: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
	fail_writes: AtomicBool,
}

impl TestStore {
	pub fn new() -> Self {
		Self { persisted_bytes: Mutex::new(HashMap::new()), fail_writes: AtomicBool::new(false) }
	}

	pub fn fail_writes(&self, fail: bool) {
		self.fail_writes.store(fail, Ordering::SeqCst);
	}
}

fn store_namespace(primary_namespace: &str, secondary_namespace: &str) -> String {
	format!("{}/{}", primary_namespace, secondary_namespace)
}

impl KVStore for TestStore {
	fn read(
		&self, primary_namespace: &str, secondary_namespace: &str, key: &str,
	) -> Result<Vec<u8>, lightning::io::Error> {
		let persisted_lock = self.persisted_bytes.lock().unwrap();
		let namespace = store_namespace(primary_namespace, secondary_namespace);
		persisted_lock
			.get(&namespace)
			.and_then(|outer| outer.get(key))
			.cloned()
			.ok_or_else(|| {
				lightning::io::Error::new(lightning::io::ErrorKind::NotFound, "Key not found")
			})
	}

	fn write(
		&self, primary_namespace: &str, secondary_namespace: &str, key: &str, buf: &[u8],
	) -> Result<(), lightning::io::Error> {
		if self.fail_writes.load(Ordering::SeqCst) {
			return Err(lightning::io::Error::new(
				lightning::io::ErrorKind::Other,
				"Injected write failure",
			));
		}

		let mut persisted_lock = self.persisted_bytes.lock().unwrap();
		let namespace = store_namespace(primary_namespace, secondary_namespace);
		let outer = persisted_lock.entry(namespace).or_insert_with(HashMap::new);
		outer.insert(key.to_string(), buf.to_vec());
		Ok(())
	}

	fn remove(
		&self, primary_namespace: &str, secondary_namespace: &str, key: &str, _lazy: bool,
	) -> Result<(), lightning::io::Error> {
		let mut persisted_lock = self.persisted_bytes.lock().unwrap();
		let namespace = store_namespace(primary_namespace, secondary_namespace);
		if let Some(outer) = persisted_lock.get_mut(&namespace) {
			outer.remove(key);
		}
		Ok(())
	}

	fn list(
		&self, primary_namespace: &str, secondary_namespace: &str,
	) -> Result<Vec<String>, lightning::io::Error> {
		let mut persisted_lock = self.persisted_bytes.lock().unwrap();
		let namespace = store_namespace(primary_namespace, secondary_namespace);
		match persisted_lock.entry(namespace) {
			hash_map::Entry::Occupied(e) => Ok(e.get().keys().cloned().collect()),
			hash_map::Entry::Vacant(_) => Ok(Vec::new()),
		}
	}
}

// Copied over from upstream LDK
pub(crate) struct TestLogger {
	level: Level,
	pub lines: Mutex<HashMap<(String, String), usize>>,
}

impl TestLogger {
	pub fn new() -> TestLogger {
		TestLogger { level: Level::Trace, lines: Mutex::new(HashMap::new()) }
	}

	/// Search for the number of occurrences of the logged lines which
	/// 1. belong to the specified module and
	/// 2. contain `line` in them.
	/// And assert that the number of occurrences is the same as the given `count`.
	pub fn assert_log_contains(&self, module: &str, line: &str, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		let l: usize = log_entries
			.iter()
			.filter(|&(&(ref m, ref l), _c)| m == module && l.contains(line))
			.map(|(_, c)| c)
			.sum();
		assert_eq!(l, count)
	}
}

impl Logger for TestLogger {
	fn log(&self, record: Record) {
		*self
			.lines
			.lock()
			.unwrap()
			.entry((record.module_path.to_string(), format!("{}", record.args)))
			.or_insert(0) += 1;
		if record.level >= self.level {
			println!(
				"{:<5} [{} : {}] {}",
				record.level.to_string(),
				record.module_path,
				record.line,
				record.args
			);
		}
	}
}

pub(crate) struct TestChainSource {
	best_block: Mutex<(BlockHash, u32)>,
}

impl TestChainSource {
	pub fn new(best_height: u32) -> Self {
		Self { best_block: Mutex::new((BlockHash::all_zeros(), best_height)) }
	}
}

impl ChainSource for TestChainSource {
	fn get_best_block(&self) -> Result<(BlockHash, u32), Error> {
		Ok(*self.best_block.lock().unwrap())
	}
}

struct ConfWatcher {
	num_confs: u32,
	height_hint: u32,
	sender: oneshot::Sender<TxConfirmation>,
}

pub(crate) struct TestNotifier {
	epoch_senders: Mutex<Vec<mpsc::Sender<BlockEpoch>>>,
	conf_watchers: Mutex<HashMap<Txid, Vec<ConfWatcher>>>,
}

impl TestNotifier {
	pub fn new() -> Self {
		Self { epoch_senders: Mutex::new(Vec::new()), conf_watchers: Mutex::new(HashMap::new()) }
	}

	pub async fn notify_block(&self, height: u32) {
		let senders = self.epoch_senders.lock().unwrap().clone();
		for sender in senders {
			let _ = sender.send(BlockEpoch { height }).await;
		}
	}

	pub fn confirm_tx(&self, txid: &Txid, block_height: u32) {
		let watchers = self.conf_watchers.lock().unwrap().remove(txid).unwrap_or_default();
		assert!(!watchers.is_empty(), "No confirmation watcher registered for {}", txid);
		for watcher in watchers {
			let _ = watcher.sender.send(TxConfirmation { block_height });
		}
	}

	pub fn is_watching(&self, txid: &Txid) -> bool {
		self.conf_watchers.lock().unwrap().contains_key(txid)
	}

	/// Returns the `(num_confs, height_hint)` pairs of all watchers registered for `txid`.
	pub fn watch_details(&self, txid: &Txid) -> Vec<(u32, u32)> {
		self.conf_watchers
			.lock()
			.unwrap()
			.get(txid)
			.map(|watchers| watchers.iter().map(|w| (w.num_confs, w.height_hint)).collect())
			.unwrap_or_default()
	}
}

impl ChainNotifier for TestNotifier {
	fn register_block_epochs(&self) -> Result<mpsc::Receiver<BlockEpoch>, Error> {
		let (sender, receiver) = mpsc::channel(64);
		self.epoch_senders.lock().unwrap().push(sender);
		Ok(receiver)
	}

	fn register_tx_confirmation(
		&self, txid: Txid, num_confs: u32, height_hint: u32,
	) -> Result<oneshot::Receiver<TxConfirmation>, Error> {
		let (sender, receiver) = oneshot::channel();
		self.conf_watchers
			.lock()
			.unwrap()
			.entry(txid)
			.or_default()
			.push(ConfWatcher { num_confs, height_hint, sender });
		Ok(receiver)
	}
}

pub(crate) struct TestBroadcaster {
	txs: Mutex<Vec<Transaction>>,
	reject_with: Mutex<Option<String>>,
}

impl TestBroadcaster {
	pub fn new() -> Self {
		Self { txs: Mutex::new(Vec::new()), reject_with: Mutex::new(None) }
	}

	/// Returns every transaction handed to the broadcaster, including rejected attempts.
	pub fn broadcast_txs(&self) -> Vec<Transaction> {
		self.txs.lock().unwrap().clone()
	}

	pub fn reject_with(&self, message: Option<String>) {
		*self.reject_with.lock().unwrap() = message;
	}
}

impl Broadcaster for TestBroadcaster {
	fn publish_transaction(&self, tx: &Transaction) -> Result<(), PublishError> {
		self.txs.lock().unwrap().push(tx.clone());
		match self.reject_with.lock().unwrap().clone() {
			Some(message) => Err(PublishError { message }),
			None => Ok(()),
		}
	}
}

pub(crate) struct TestFeeEstimator {
	sat_per_kwu: u64,
}

impl TestFeeEstimator {
	pub fn new(sat_per_kwu: u64) -> Self {
		Self { sat_per_kwu }
	}
}

impl FeeEstimator for TestFeeEstimator {
	fn estimate_fee_rate(&self, _confirmation_target: u32) -> Result<FeeRate, Error> {
		Ok(FeeRate::from_sat_per_kwu(self.sat_per_kwu))
	}
}

pub(crate) struct TestSigner {}

impl TestSigner {
	pub fn new() -> Self {
		Self {}
	}
}

impl WitnessSigner for TestSigner {
	fn sign_output<'a>(
		&self, _spend_tx: &'a Transaction, _sighash_cache: &mut SighashCache<&'a Transaction>,
		_input_index: usize, sign_desc: &SignDescriptor, _witness_type: WitnessType,
	) -> Result<Witness, Error> {
		Ok(Witness::from_slice(&[vec![0u8; 73], vec![], sign_desc.witness_script.as_bytes().to_vec()]))
	}
}

pub(crate) struct TestSweepScriptSource {
	counter: AtomicUsize,
}

impl TestSweepScriptSource {
	pub fn new() -> Self {
		Self { counter: AtomicUsize::new(0) }
	}

	pub fn scripts_issued(&self) -> usize {
		self.counter.load(Ordering::SeqCst)
	}
}

impl SweepScriptSource for TestSweepScriptSource {
	fn gen_sweep_script(&self) -> Result<ScriptBuf, Error> {
		// A fresh script per call, mirroring a real wallet deriving a new address every time.
		let index = self.counter.fetch_add(1, Ordering::SeqCst) as u8;
		Ok(ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([index.wrapping_add(1); 20])))
	}
}

pub(crate) struct TestChannelRegistry {
	pending: Mutex<Vec<OutPoint>>,
	closed: Mutex<Vec<OutPoint>>,
}

impl TestChannelRegistry {
	pub fn new() -> Self {
		Self { pending: Mutex::new(Vec::new()), closed: Mutex::new(Vec::new()) }
	}

	pub fn set_pending(&self, channels: Vec<OutPoint>) {
		*self.pending.lock().unwrap() = channels;
	}

	pub fn closed_channels(&self) -> Vec<OutPoint> {
		self.closed.lock().unwrap().clone()
	}
}

impl ChannelRegistry for TestChannelRegistry {
	fn fetch_pending_closed_channels(&self) -> Result<Vec<OutPoint>, Error> {
		Ok(self.pending.lock().unwrap().clone())
	}

	fn mark_channel_fully_closed(&self, channel_point: &OutPoint) -> Result<(), Error> {
		self.closed.lock().unwrap().push(*channel_point);
		Ok(())
	}
}

pub(crate) fn dummy_outpoint(byte: u8, vout: u32) -> OutPoint {
	OutPoint { txid: Txid::from_byte_array([byte; 32]), vout }
}

pub(crate) fn dummy_pubkey() -> PublicKey {
	let secp = Secp256k1::new();
	let secret_key = SecretKey::from_slice(&[42u8; 32]).unwrap();
	PublicKey::from_secret_key(&secp, &secret_key)
}

pub(crate) fn dummy_sign_descriptor(value_sats: u64) -> SignDescriptor {
	let witness_script = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([9u8; 20]));
	SignDescriptor {
		pubkey: dummy_pubkey(),
		witness_script: witness_script.clone(),
		output: TxOut { value: Amount::from_sat(value_sats), script_pubkey: witness_script },
	}
}

pub(crate) fn dummy_transaction(value_sats: u64) -> Transaction {
	Transaction {
		version: Version(2),
		lock_time: LockTime::ZERO,
		input: vec![TxIn {
			previous_output: dummy_outpoint(0xee, value_sats as u32),
			script_sig: ScriptBuf::new(),
			sequence: Sequence::ZERO,
			witness: Witness::new(),
		}],
		output: vec![TxOut {
			value: Amount::from_sat(value_sats),
			script_pubkey: ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([7u8; 20])),
		}],
	}
}

pub(crate) fn make_kid(
	channel_point: OutPoint, outpoint: OutPoint, blocks_to_maturity: u32, value_sats: u64,
) -> KidOutput {
	make_kid_with_witness_type(
		channel_point,
		outpoint,
		blocks_to_maturity,
		value_sats,
		WitnessType::CommitmentTimeLock,
	)
}

pub(crate) fn make_kid_with_witness_type(
	channel_point: OutPoint, outpoint: OutPoint, blocks_to_maturity: u32, value_sats: u64,
	witness_type: WitnessType,
) -> KidOutput {
	KidOutput::new(
		outpoint,
		channel_point,
		blocks_to_maturity,
		witness_type,
		dummy_sign_descriptor(value_sats),
	)
}

/// Builds the resolution of an offered HTLC, with a pre-signed timeout transaction whose first
/// output is the second-stage output to sweep.
///
/// Distinct `(expiry, value_sats)` pairs yield distinct timeout txids.
pub(crate) fn make_htlc_resolution(expiry: u32, value_sats: u64) -> HtlcResolution {
	let signed_timeout_tx = Transaction {
		version: Version(2),
		lock_time: LockTime::from_consensus(expiry),
		input: vec![TxIn {
			previous_output: dummy_outpoint(0xbb, expiry),
			script_sig: ScriptBuf::new(),
			sequence: Sequence::ZERO,
			witness: Witness::new(),
		}],
		output: vec![TxOut {
			value: Amount::from_sat(value_sats),
			script_pubkey: ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([8u8; 20])),
		}],
	};
	HtlcResolution { expiry, signed_timeout_tx, sweep_sign_desc: dummy_sign_descriptor(value_sats) }
}

pub(crate) fn make_baby(
	channel_point: OutPoint, blocks_to_maturity: u32, expiry: u32, value_sats: u64,
) -> BabyOutput {
	let resolution = make_htlc_resolution(expiry, value_sats);
	let outpoint = OutPoint { txid: resolution.signed_timeout_tx.compute_txid(), vout: 0 };
	BabyOutput::new(
		outpoint,
		channel_point,
		blocks_to_maturity,
		expiry,
		resolution.signed_timeout_tx,
		resolution.sweep_sign_desc,
	)
}

pub(crate) fn random_storage_path() -> PathBuf {
	let mut temp_path = std::env::temp_dir();
	let mut rng = thread_rng();
	let rand_dir: String = (0..7).map(|_| rng.sample(Alphanumeric) as char).collect();
	temp_path.push(rand_dir);
	temp_path
}

/// Polls `condition` with exponential backoff, panicking if it does not hold within a couple of
/// seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
	let mut delay = Duration::from_millis(16);
	for _ in 0..12 {
		if condition() {
			return;
		}
		tokio::time::sleep(delay).await;
		if delay < Duration::from_millis(512) {
			delay = delay.mul_f32(2.0);
		}
	}
	panic!("Condition not reached before timeout");
}

pub(crate) struct NurseryHarness {
	pub nursery: UtxoNursery,
	pub kv_store: Arc<TestStore>,
	pub chain_source: Arc<TestChainSource>,
	pub notifier: Arc<TestNotifier>,
	pub broadcaster: Arc<TestBroadcaster>,
	pub sweep_script_source: Arc<TestSweepScriptSource>,
	pub channel_registry: Arc<TestChannelRegistry>,
	pub logger: Arc<TestLogger>,
}

impl NurseryHarness {
	pub fn new(config: Config, best_height: u32) -> Self {
		Self::with_kv_store(config, best_height, Arc::new(TestStore::new()))
	}

	/// Builds a nursery around an existing store, with all other collaborators fresh. Used to
	/// model a restart over persisted state.
	pub fn with_kv_store(config: Config, best_height: u32, kv_store: Arc<TestStore>) -> Self {
		let chain_source = Arc::new(TestChainSource::new(best_height));
		let notifier = Arc::new(TestNotifier::new());
		let broadcaster = Arc::new(TestBroadcaster::new());
		let sweep_script_source = Arc::new(TestSweepScriptSource::new());
		let channel_registry = Arc::new(TestChannelRegistry::new());
		let logger = Arc::new(TestLogger::new());

		let nursery = UtxoNursery::new(
			config,
			Arc::clone(&kv_store) as Arc<crate::types::DynStore>,
			Arc::clone(&chain_source) as Arc<DynChainSource>,
			Arc::clone(&notifier) as Arc<DynChainNotifier>,
			Arc::new(TestFeeEstimator::new(1_000)),
			Arc::clone(&broadcaster) as Arc<DynBroadcaster>,
			Arc::new(TestSigner::new()),
			Arc::clone(&sweep_script_source) as Arc<DynSweepScriptSource>,
			Arc::clone(&channel_registry) as Arc<DynChannelRegistry>,
			Arc::clone(&logger) as Arc<DynLogger>,
		)
		.unwrap();

		Self {
			nursery,
			kv_store,
			chain_source,
			notifier,
			broadcaster,
			sweep_script_source,
			channel_registry,
			logger,
		}
	}
}
