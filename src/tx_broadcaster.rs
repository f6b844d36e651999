// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use bitcoin::Transaction;

use std::fmt;

/// An error returned by a [`Broadcaster`] when publishing a transaction failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishError {
	/// The error message reported by the backing node or service.
	pub message: String,
}

impl PublishError {
	/// Returns whether the rejection indicates the transaction is already known to the network,
	/// i.e., it is sitting in the mempool or was already mined.
	///
	/// Backing full nodes report this case with a "TX rejected:" message. Such rejections are
	/// expected whenever we rebroadcast a previously published transaction and must not be
	/// treated as failures.
	pub fn is_already_known(&self) -> bool {
		self.message.contains("TX rejected:")
	}
}

impl fmt::Display for PublishError {
	fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
		write!(f, "{}", self.message)
	}
}

impl std::error::Error for PublishError {}

/// Facilitates broadcasting signed transactions to the network.
pub trait Broadcaster {
	/// Publishes the given transaction.
	///
	/// Implementations should apply their own publication timeout and avoid blocking for
	/// extended periods, as the nursery invokes this while holding its coordination lock.
	fn publish_transaction(&self, tx: &Transaction) -> Result<(), PublishError>;
}
