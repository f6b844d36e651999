// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::Error;

use bitcoin::{BlockHash, Txid};

use tokio::sync::{mpsc, oneshot};

/// A block newly connected to the main chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockEpoch {
	/// The height of the connected block.
	pub height: u32,
}

/// A watched transaction having reached its requested confirmation depth.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TxConfirmation {
	/// The height of the block the transaction was included in.
	pub block_height: u32,
}

/// Provides read access to the current state of the block chain.
pub trait ChainSource {
	/// Returns the hash and height of the current chain tip.
	///
	/// Implementations should only answer from a fully synced chain view. A stale height
	/// reported during an active rescan will make the nursery process heights it will see again
	/// later, which is wasteful but safe.
	fn get_best_block(&self) -> Result<(BlockHash, u32), Error>;
}

/// Provides subscriptions to chain events driving the nursery's state transitions.
pub trait ChainNotifier {
	/// Returns a stream of notifications for each block newly connected to the main chain.
	///
	/// The stream closing is interpreted as the notifier shutting down.
	fn register_block_epochs(&self) -> Result<mpsc::Receiver<BlockEpoch>, Error>;

	/// Returns a one-shot notification firing once `txid` has reached `num_confs`
	/// confirmations.
	///
	/// `height_hint` is the earliest height the transaction could have confirmed at, allowing
	/// implementations to bound their rescan. The sender side being dropped before firing is
	/// interpreted as the notifier shutting down.
	fn register_tx_confirmation(
		&self, txid: Txid, num_confs: u32, height_hint: u32,
	) -> Result<oneshot::Receiver<TxConfirmation>, Error>;
}
