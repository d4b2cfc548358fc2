//! Client producer: spends producer credits before every send

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use super::credits::ProducerCredits;
use super::session::SessionCore;
use crate::protocol::{Message, PacketBody};
use crate::{CorvidError, Result};

pub struct ClientProducer {
    session: Arc<SessionCore>,
    /// None for an anonymous producer
    address: Option<String>,
    credits: Option<Arc<ProducerCredits>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ClientProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProducer")
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ClientProducer {
    pub(crate) fn new(
        session: Arc<SessionCore>,
        address: Option<String>,
        credits: Option<Arc<ProducerCredits>>,
    ) -> Self {
        Self {
            session,
            address,
            credits,
            closed: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.session.is_closed()
    }

    /// Send to this producer's address, or to the message's own address
    /// for an anonymous producer.
    ///
    /// Waits for producer credits first. Durable messages wait for the
    /// server's response when `block_on_durable_send` is set, non-durable
    /// ones when `block_on_non_durable_send` is.
    pub async fn send(&self, mut message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(CorvidError::ObjectClosed("producer".to_string()));
        }
        let credits = match (&self.address, &self.credits) {
            (Some(address), Some(credits)) => {
                message.address = address.clone();
                Arc::clone(credits)
            }
            _ => {
                if message.address.is_empty() {
                    return Err(CorvidError::InvalidDestination(
                        "anonymous producer needs a message address".to_string(),
                    ));
                }
                self.session.credits().get_credits(&message.address, true)?
            }
        };
        self.dispatch(credits, message).await
    }

    /// Anonymous send to `address`
    pub async fn send_to(&self, address: &str, mut message: Message) -> Result<()> {
        if let Some(bound) = &self.address {
            return Err(CorvidError::IllegalState(format!("producer is bound to {bound}")));
        }
        message.address = address.to_string();
        self.send(message).await
    }

    async fn dispatch(&self, credits: Arc<ProducerCredits>, message: Message) -> Result<()> {
        credits.acquire(message.encoded_size()).await?;

        let config = self.session.config();
        let blocking = if message.durable {
            config.block_on_durable_send
        } else {
            config.block_on_non_durable_send
        };
        if blocking {
            self.session
                .request(PacketBody::SessSend {
                    message,
                    requires_response: true,
                })
                .await?;
            Ok(())
        } else {
            self.session.send_one_way(PacketBody::SessSend {
                message,
                requires_response: false,
            })
        }
    }

    /// Give the address's credits back to the session
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(address) = &self.address {
            self.session.credits().return_credits(address);
            info!(address = %address, "Producer closed");
        }
    }
}

impl Drop for ClientProducer {
    fn drop(&mut self) {
        self.close();
    }
}
