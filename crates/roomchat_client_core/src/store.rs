use std::cell::OnceCell;
use std::collections::HashSet;
use std::sync::Arc;

use roomchat_domain::{Delivery, LocalId, Message, MessageId};
use tracing::debug;

/// Ordered, deduplicated timeline for the active room.
///
/// Entries are kept sorted by `(created_at, id)`; optimistic entries (no server id yet) sort by their local
/// id. A server id is never visible twice. Reads go through [`MessageStore::snapshot`], which is rebuilt
/// lazily after a mutation.
#[derive(Debug, Default)]
pub struct MessageStore {
	entries: Vec<Message>,
	ids: HashSet<MessageId>,
	view: OnceCell<Arc<[Message]>>,
}

impl MessageStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Replace the timeline with a new baseline.
	pub fn seed(&mut self, messages: Vec<Message>) {
		self.entries.clear();
		self.ids.clear();

		for m in messages {
			if let Some(id) = &m.id
				&& !self.ids.insert(id.clone())
			{
				debug!(id = %id, "seed: duplicate id dropped");
				continue;
			}
			self.entries.push(m);
		}

		self.entries.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
		self.invalidate();
	}

	/// Insert a server message. Returns `false` if its id is already present.
	///
	/// A confirmed message carrying a `local_id` also replaces the optimistic entry with that local id.
	pub fn ingest_inbound(&mut self, message: Message) -> bool {
		let Some(id) = message.id.clone() else {
			debug!("ingest: message without server id ignored");
			return false;
		};
		if self.ids.contains(&id) {
			if let Some(local_id) = &message.local_id {
				self.remove_optimistic(local_id);
			}
			return false;
		}

		if let Some(local_id) = &message.local_id {
			self.remove_optimistic(local_id);
		}

		self.ids.insert(id);
		self.insert_sorted(message);
		true
	}

	/// Swap the optimistic entry for its confirmed counterpart.
	pub fn confirm_local(&mut self, local_id: &LocalId, confirmed: Message) -> bool {
		let removed = self.remove_optimistic(local_id).is_some();
		let inserted = self.ingest_inbound(confirmed);
		removed || inserted
	}

	/// Render a locally originated message before the server has confirmed it. Replaces any existing
	/// optimistic entry with the same local id.
	pub fn insert_optimistic(&mut self, message: Message) {
		let Some(local_id) = message.local_id.clone() else {
			debug!("insert_optimistic: message without local id ignored");
			return;
		};
		self.remove_optimistic(&local_id);
		self.insert_sorted(Message { id: None, ..message });
	}

	pub fn mark_failed(&mut self, local_id: &LocalId) -> bool {
		self.set_delivery(local_id, Delivery::Failed)
	}

	pub fn mark_pending(&mut self, local_id: &LocalId) -> bool {
		self.set_delivery(local_id, Delivery::Pending)
	}

	pub fn set_delivery(&mut self, local_id: &LocalId, delivery: Delivery) -> bool {
		let Some(entry) = self
			.entries
			.iter_mut()
			.find(|m| m.id.is_none() && m.local_id.as_ref() == Some(local_id))
		else {
			return false;
		};
		if entry.delivery == delivery {
			return false;
		}
		entry.delivery = delivery;
		self.invalidate();
		true
	}

	pub fn remove_optimistic(&mut self, local_id: &LocalId) -> Option<Message> {
		let idx = self
			.entries
			.iter()
			.position(|m| m.id.is_none() && m.local_id.as_ref() == Some(local_id))?;
		let removed = self.entries.remove(idx);
		self.invalidate();
		Some(removed)
	}

	pub fn contains(&self, id: &MessageId) -> bool {
		self.ids.contains(id)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Read-only ordered view. Cached until the next mutation.
	pub fn snapshot(&self) -> Arc<[Message]> {
		Arc::clone(self.view.get_or_init(|| Arc::from(self.entries.as_slice())))
	}

	pub fn clear(&mut self) {
		self.entries.clear();
		self.ids.clear();
		self.invalidate();
	}

	fn insert_sorted(&mut self, message: Message) {
		let idx = {
			let key = message.order_key();
			self.entries.partition_point(|m| m.order_key() <= key)
		};
		self.entries.insert(idx, message);
		self.invalidate();
	}

	fn invalidate(&mut self) {
		self.view.take();
	}
}
