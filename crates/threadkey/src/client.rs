//! The ThreadClient: one participant's view of their threads.
//!
//! The client ties together the receipt store, thread keys, the delivery
//! transport and the safety monitor. It owns no transport itself; the
//! [`TransportManager`] is shared with the caller so that only one live
//! handle exists per process.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use threadkey_core::{
    validate_thread_access, AccessDecision, ChatMessage, Contact, ContactUpdate, Conversation, IdentityKeypair,
    IdentityKind, JoinReceipt, SafetyNumber, ThreadId,
};
use threadkey_keys::{InvitePayload, InviteRequest, KeyError, ThreadKey, X25519PublicKey, X25519StaticSecret};
use threadkey_relay::{
    now_millis, AckLedger, AckPayload, ControlPayload, DeliveryState, DeliveryTransport,
    EventHandler, MessageId, MessagePayload, ShutdownSignal, Subscription, ThreadEvent,
    TransportConfig, TransportFactory, TransportManager, TypingPayload,
};
use threadkey_store::Store;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::safety::{
    detect_safety_number_changes, DerivedSafetyNumbers, SafetyPorts, SafetyReport, SafetyScan,
    StoreSafetyPorts,
};

/// What became of an incoming event.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Decrypted and appended to history.
    Message(ChatMessage),
    /// The author holds no valid data token; the message was dropped.
    Rejected(Box<AccessDecision>),
    /// First terminal state for one of our messages.
    Ack(AckPayload),
    /// Already seen: a repeated ack, a message already in history or an
    /// echo of our own message.
    Duplicate,
    Control(ControlPayload),
    Typing(TypingPayload),
}

/// An accepted invite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedThread {
    pub thread_id: ThreadId,
    pub inviter: String,
    pub inviter_name: Option<String>,
    pub policy: IdentityKind,
}

/// Live events of one subscribed thread.
pub struct ThreadFeed {
    subscription: Subscription,
    events: mpsc::UnboundedReceiver<ThreadEvent>,
}

impl ThreadFeed {
    pub fn thread_id(&self) -> &ThreadId {
        self.subscription.thread_id()
    }

    /// Next raw event. Pass it to [`ThreadClient::ingest_event`].
    pub async fn next(&mut self) -> Option<ThreadEvent> {
        self.events.recv().await
    }

    pub fn try_next(&mut self) -> Option<ThreadEvent> {
        self.events.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        self.subscription.unsubscribe();
    }
}

/// One participant.
pub struct ThreadClient<S: Store, F: TransportFactory> {
    identity: IdentityKeypair,
    /// Hex of the identity public key, cached.
    identity_hex: String,
    exchange: X25519StaticSecret,
    store: Arc<S>,
    transports: Arc<TransportManager<F>>,
    config: RwLock<ClientConfig>,
    /// Thread keys are held in memory only.
    keys: RwLock<HashMap<ThreadId, ThreadKey>>,
    acks: AckLedger,
}

impl<S: Store + 'static, F: TransportFactory + 'static> ThreadClient<S, F> {
    /// Create a client.
    ///
    /// The transport identity is always the client's own identity key.
    pub fn new(
        identity: IdentityKeypair,
        exchange: X25519StaticSecret,
        store: S,
        transports: Arc<TransportManager<F>>,
        mut config: ClientConfig,
    ) -> Result<Self> {
        let identity_hex = identity.public_key().to_hex();
        config.transport.identity_key = identity_hex.clone();
        config.validate()?;

        Ok(Self {
            identity,
            identity_hex,
            exchange,
            store: Arc::new(store),
            transports,
            config: RwLock::new(config),
            keys: RwLock::new(HashMap::new()),
            acks: AckLedger::new(),
        })
    }

    /// Hex identity public key; the key DT outputs name.
    pub fn identity_key(&self) -> &str {
        &self.identity_hex
    }

    /// Public half of the key-exchange secret, handed to inviters.
    pub fn exchange_public_key(&self) -> X25519PublicKey {
        self.exchange.public_key()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> ClientConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transport_config(&self) -> TransportConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .transport
            .clone()
    }

    async fn transport(&self) -> Result<Arc<dyn DeliveryTransport>> {
        let config = self.transport_config();
        Ok(self.transports.get_or_connect(&config).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Threads and Keys
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a thread we created: store its receipt and generate its key.
    ///
    /// Calling again for a thread with a key keeps the existing key.
    pub async fn open_thread(&self, receipt: &JoinReceipt) -> Result<()> {
        if receipt.thread_id.is_empty() {
            return Err(threadkey_core::ValidationError::EmptyIdentifier("thread_id").into());
        }
        self.store.put_receipt(receipt).await?;
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(receipt.thread_id.clone())
            .or_insert_with(ThreadKey::generate);
        tracing::debug!(thread = %receipt.thread_id, "thread opened");
        Ok(())
    }

    /// Store a newer receipt (issuance, burn or block) for a thread.
    pub async fn record_receipt(&self, receipt: &JoinReceipt) -> Result<()> {
        self.store.put_receipt(receipt).await?;
        Ok(())
    }

    /// Install a key obtained out of band.
    pub fn import_thread_key(&self, thread_id: &ThreadId, key: ThreadKey) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(thread_id.clone(), key);
    }

    pub fn has_thread_key(&self, thread_id: &ThreadId) -> bool {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(thread_id)
    }

    fn thread_key(&self, thread_id: &ThreadId) -> Result<ThreadKey> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(thread_id)
            .cloned()
            .ok_or_else(|| ClientError::MissingThreadKey(thread_id.clone()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Invites
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a signed invite link that hands the thread key to `invitee`.
    pub fn create_invite(
        &self,
        thread_id: &ThreadId,
        invitee: &X25519PublicKey,
        policy: IdentityKind,
        inviter_name: Option<String>,
    ) -> Result<String> {
        let key = self.thread_key(thread_id)?;
        let config = self.config();
        let expires_at = now_secs().saturating_add(config.invite_ttl_secs);

        let payload = InvitePayload::create(
            &self.identity,
            InviteRequest {
                thread_id: thread_id.clone(),
                thread_key: &key,
                invitee,
                policy,
                inviter_name,
                expires_at,
            },
        )?;
        Ok(payload.to_link(&config.invite_base_url)?)
    }

    /// Accept an invite link: unwrap the key and record the inviter.
    ///
    /// Access still depends on a receipt naming this identity; see
    /// [`Self::record_receipt`].
    pub async fn accept_invite(&self, link: &str) -> Result<JoinedThread> {
        let invite = InvitePayload::from_link(link)?;
        let key = invite.accept(&self.exchange, now_secs())?;
        self.import_thread_key(&invite.thread_id, key);

        if self.store.get_conversation(&invite.thread_id).await?.is_none() {
            let conversation =
                Conversation::new(invite.thread_id.clone(), invite.inviter.clone(), self.identity_key());
            self.store.put_conversation(&conversation).await?;
        }
        if self.store.get_contact(&invite.inviter).await?.is_none() {
            self.store.put_contact(&Contact::new(invite.inviter.clone())).await?;
        }

        tracing::info!(thread = %invite.thread_id, inviter = %invite.inviter, "invite accepted");
        Ok(JoinedThread {
            thread_id: invite.thread_id,
            inviter: invite.inviter,
            inviter_name: invite.inviter_name,
            policy: invite.policy,
        })
    }

    /// Record a conversation with a peer we invited.
    pub async fn add_conversation(&self, thread_id: &ThreadId, peer: &str) -> Result<()> {
        let conversation = Conversation::new(thread_id.clone(), peer, self.identity_key());
        self.store.put_conversation(&conversation).await?;
        if self.store.get_contact(peer).await?.is_none() {
            self.store.put_contact(&Contact::new(peer)).await?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Access and Messaging
    // ─────────────────────────────────────────────────────────────────────────

    /// Access decision for this identity on `thread_id`.
    pub async fn check_access(&self, thread_id: &ThreadId) -> Result<AccessDecision> {
        self.access_for(thread_id, &self.identity_hex).await
    }

    async fn access_for(&self, thread_id: &ThreadId, pubkey: &str) -> Result<AccessDecision> {
        let receipt = self
            .store
            .get_receipt(thread_id)
            .await?
            .ok_or_else(|| ClientError::MissingReceipt(thread_id.clone()))?;
        Ok(validate_thread_access(thread_id, pubkey, &receipt))
    }

    /// Seal and publish a message.
    ///
    /// Refused with [`ClientError::AccessDenied`] unless this identity holds
    /// a valid data token. Delivery is reported later as an ack.
    pub async fn send_message(&self, thread_id: &ThreadId, text: &str) -> Result<MessageId> {
        let decision = self.check_access(thread_id).await?;
        if !decision.has_access {
            return Err(ClientError::AccessDenied(Box::new(decision)));
        }
        let message = ChatMessage::new(self.identity_hex.clone(), text, now_millis());
        self.publish_chat(thread_id, message).await
    }

    /// Seal `message`, publish it under a fresh id, then append it to history.
    async fn publish_chat(&self, thread_id: &ThreadId, mut message: ChatMessage) -> Result<MessageId> {
        let key = self.thread_key(thread_id)?;
        let body = key.seal(thread_id.as_str(), message.text.as_bytes())?;

        let id = MessageId::generate();
        let transport = self.transport().await?;
        transport
            .publish_message(
                thread_id,
                MessagePayload {
                    id: Some(id.clone()),
                    author: message.author.clone(),
                    body,
                    sent_at: message.sent_at,
                    system: message.system,
                },
            )
            .await?;

        message.id = Some(id.to_string());
        self.store.append_message(thread_id, &message).await?;
        Ok(id)
    }

    pub async fn send_typing(&self, thread_id: &ThreadId, typing: bool) -> Result<()> {
        let transport = self.transport().await?;
        transport
            .publish_typing(thread_id, &self.identity_hex, typing)
            .await?;
        Ok(())
    }

    /// Subscribe to a thread's events.
    pub async fn subscribe_thread(&self, thread_id: &ThreadId) -> Result<ThreadFeed> {
        let (tx, events) = mpsc::unbounded_channel();
        let handler: EventHandler = Arc::new(move |event: &ThreadEvent| {
            let _ = tx.send(event.clone());
        });
        let transport = self.transport().await?;
        let subscription = transport.subscribe(thread_id, handler).await?;
        Ok(ThreadFeed {
            subscription,
            events,
        })
    }

    /// Process one event received on `thread_id`.
    ///
    /// Messages are accepted only from authors with a valid data token, then
    /// decrypted and appended to history. Acks are de-duplicated per
    /// `(thread, message)`.
    pub async fn ingest_event(&self, thread_id: &ThreadId, event: &ThreadEvent) -> Result<Incoming> {
        match event {
            ThreadEvent::Message(payload) => self.ingest_message(thread_id, payload).await,
            ThreadEvent::Ack(ack) => {
                if self.acks.record(thread_id, ack) {
                    Ok(Incoming::Ack(ack.clone()))
                } else {
                    Ok(Incoming::Duplicate)
                }
            }
            ThreadEvent::Control(control) => Ok(Incoming::Control(control.clone())),
            ThreadEvent::Typing(typing) => Ok(Incoming::Typing(typing.clone())),
        }
    }

    async fn ingest_message(&self, thread_id: &ThreadId, payload: &MessagePayload) -> Result<Incoming> {
        if payload.author.eq_ignore_ascii_case(&self.identity_hex) {
            return Ok(Incoming::Duplicate);
        }
        // Mailbox inboxes can replay a message after a transport switch.
        if let Some(id) = &payload.id {
            if self.store.has_message(thread_id, id.as_str()).await? {
                tracing::debug!(thread = %thread_id, message = %id, "message already in history");
                return Ok(Incoming::Duplicate);
            }
        }

        let decision = self.access_for(thread_id, &payload.author).await?;
        if !decision.has_access {
            tracing::warn!(
                thread = %thread_id,
                author = %payload.author,
                reason = decision.reason.as_str(),
                "dropping message from author without access"
            );
            return Ok(Incoming::Rejected(Box::new(decision)));
        }

        let key = self.thread_key(thread_id)?;
        let plaintext = key.open(thread_id.as_str(), &payload.body)?;
        let text = String::from_utf8(plaintext)
            .map_err(|e| KeyError::Decryption(format!("message is not utf-8: {e}")))?;

        let mut message = ChatMessage::new(payload.author.clone(), text, payload.sent_at);
        message.id = payload.id.as_ref().map(ToString::to_string);
        message.system = payload.system;
        self.store.append_message(thread_id, &message).await?;
        Ok(Incoming::Message(message))
    }

    /// First recorded delivery state of one of our messages.
    pub fn delivery_state(&self, thread_id: &ThreadId, message_id: &MessageId) -> Option<DeliveryState> {
        self.acks.state(thread_id, message_id)
    }

    pub async fn history(&self, thread_id: &ThreadId) -> Result<Vec<ChatMessage>> {
        Ok(self.store.messages(thread_id).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────────────────

    /// Switch transport configuration, e.g. from guest to wallet-linked.
    ///
    /// The shared manager replaces the live handle if the key changed.
    /// Existing [`ThreadFeed`]s stay bound to the old handle.
    pub async fn reconfigure(&self, mut transport: TransportConfig) -> Result<Arc<dyn DeliveryTransport>> {
        transport.identity_key = self.identity_hex.clone();
        transport.validate()?;
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .transport = transport.clone();
        tracing::info!(key = %transport.config_key(), "transport reconfigured");
        Ok(self.transports.get_or_connect(&transport).await?)
    }

    /// Close the live transport.
    pub async fn close(&self) {
        self.transports.shutdown().await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Contacts and Safety Numbers
    // ─────────────────────────────────────────────────────────────────────────

    /// Safety number shared with `pubkey`.
    pub fn safety_number(&self, pubkey: &str) -> Result<SafetyNumber> {
        Ok(SafetyNumber::derive(&self.identity_hex, pubkey)?)
    }

    /// Mark a contact verified against today's safety number.
    ///
    /// Call after the user compared the number out of band.
    pub async fn verify_contact(&self, pubkey: &str) -> Result<Contact> {
        let number = self.safety_number(pubkey)?;
        let mut contact = self
            .store
            .get_contact(pubkey)
            .await?
            .unwrap_or_else(|| Contact::new(pubkey));
        contact.mark_verified(number.to_string());
        self.store.put_contact(&contact).await?;
        Ok(contact)
    }

    /// Run one safety-number check over every stored contact.
    ///
    /// Warnings are sealed and published to the thread like any message, so
    /// the peer sees them too.
    pub async fn check_safety_numbers(&self) -> Result<SafetyReport> {
        let scan = SafetyScan::from_store(self.store.as_ref()).await?;
        let source = DerivedSafetyNumbers::new(self.identity_hex.clone());
        let ports = ClientSafetyPorts {
            client: self,
            local: StoreSafetyPorts::new(Arc::clone(&self.store)),
        };
        Ok(detect_safety_number_changes(&scan, &source, &ports).await)
    }

    /// Run the safety check now and then periodically until `shutdown`.
    pub fn spawn_safety_monitor(self: Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        let period = self.config().safety_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        match self.check_safety_numbers().await {
                            Ok(report) if !report.is_quiet() => tracing::info!(
                                deverified = report.deverified.len(),
                                warned = report.warned.len(),
                                "safety numbers changed"
                            ),
                            Ok(_) => {}
                            Err(err) => tracing::warn!(error = %err, "safety check failed"),
                        }
                    }
                }
            }
            tracing::debug!("safety monitor stopped");
        })
    }
}

/// Safety ports that publish warnings through the client's send path.
struct ClientSafetyPorts<'a, S: Store, F: TransportFactory> {
    client: &'a ThreadClient<S, F>,
    local: StoreSafetyPorts<S>,
}

#[async_trait]
impl<'a, S: Store + 'static, F: TransportFactory + 'static> SafetyPorts for ClientSafetyPorts<'a, S, F> {
    async fn upsert_contact(&self, pubkey: &str, update: &ContactUpdate) -> anyhow::Result<()> {
        self.local.upsert_contact(pubkey, update).await
    }

    async fn has_safety_warning(&self, thread_id: &ThreadId) -> anyhow::Result<bool> {
        self.local.has_safety_warning(thread_id).await
    }

    async fn post_system_message(&self, thread_id: &ThreadId, message: &ChatMessage) -> anyhow::Result<()> {
        let writable = match self.client.check_access(thread_id).await {
            Ok(decision) => decision.has_access && self.client.has_thread_key(thread_id),
            Err(ClientError::MissingReceipt(_)) => false,
            Err(err) => return Err(err.into()),
        };
        if !writable {
            tracing::debug!(thread = %thread_id, "thread not writable, warning kept local");
            return self.local.post_system_message(thread_id, message).await;
        }

        if let Err(err) = self.client.publish_chat(thread_id, message.clone()).await {
            // The local user still sees the warning.
            self.local.post_system_message(thread_id, message).await?;
            return Err(err.into());
        }
        Ok(())
    }

    async fn mark_warning_sent(&self, thread_id: &ThreadId) -> anyhow::Result<()> {
        self.local.mark_warning_sent(thread_id).await
    }
}

fn now_secs() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
