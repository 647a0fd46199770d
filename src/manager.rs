//! Delivery entrypoint tying policy, store, and hub together

use std::sync::Arc;

use log::debug;

use crate::error::{Error, Result};
use crate::hub::{MessageEvent, MessageHub};
use crate::message::parse_delivery;
use crate::policy::{parse_email_address, AddrPolicy};
use crate::storage::Store;

/// The single path every front-end uses to put mail into the system.
pub struct StoreManager {
    pub policy: Arc<AddrPolicy>,
    pub store: Arc<dyn Store>,
    pub hub: Arc<MessageHub>,
}

impl StoreManager {
    pub fn new(policy: Arc<AddrPolicy>, store: Arc<dyn Store>, hub: Arc<MessageHub>) -> Self {
        Self { policy, store, hub }
    }

    /// Deliver a raw message to the mailbox behind `rcpt`.
    ///
    /// Storage failures propagate to the caller; a hub dispatch failure
    /// does not, because by then the delivery has already succeeded.
    pub async fn deliver(&self, rcpt: &str, from: &str, raw: Vec<u8>) -> Result<String> {
        let addr = parse_email_address(rcpt)?;
        if !self.policy.should_store_domain(&addr.domain) {
            return Err(Error::Rejected(format!(
                "Recipient domain not stored: {}",
                addr.domain
            )));
        }
        let mailbox = self.policy.extract_mailbox(&addr)?;

        let mut delivery = parse_delivery(raw, &mailbox);
        if delivery.meta.from.is_empty() {
            delivery.meta.from = from.to_string();
        }

        let mut event_meta = delivery.meta.clone();
        let id = self.store.add_message(delivery).await?;
        event_meta.id = id.clone();
        debug!("Delivered {} to {:?}", id, mailbox);

        self.hub.dispatch(MessageEvent::from(&event_meta));
        Ok(id)
    }
}
