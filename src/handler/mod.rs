
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::Config;
use crate::cryptor::{FrameCryptor, ParticipantId};
use crate::error::{Error, Result};
use crate::key_derivation::KeyMaterial;

/// KeyAnnouncer delivers the local participant's key material to the other
/// participants over the secure signaling channel. The channel wraps and
/// authenticates the material; this crate only fixes the ordering: a key is
/// always announced before the local sender starts encrypting with it.
#[async_trait]
pub trait KeyAnnouncer {
    async fn announce_key(&self, material: &KeyMaterial, index: u8) -> Result<()>;
}

/// Lifecycle state of the e2ee engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHandlerState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

enum Event {
    Enable {
        reply: oneshot::Sender<Result<()>>,
    },
    Disable {
        reply: oneshot::Sender<Result<()>>,
    },
    ParticipantJoined(ParticipantId),
    ParticipantLeft(ParticipantId),
    RemoteKeyUpdate {
        participant: ParticipantId,
        material: KeyMaterial,
        index: u8,
    },
    State {
        reply: oneshot::Sender<KeyHandlerState>,
    },
    Close,
}

/// KeyHandler drives the key lifecycle: enable/disable, a debounced ratchet
/// when participants join and a debounced rotation when they leave. It owns
/// the local material chain and never touches ring memory directly; every
/// mutation reaches the cryptor worker as a message.
pub struct KeyHandler {
    event_tx: mpsc::Sender<Event>,
}

impl KeyHandler {
    /// new spawns the handler's event loop. The returned receiver carries
    /// engine-level errors (failed key derivation, a dead worker); the
    /// conference layer typically reacts by disabling e2ee for the session.
    pub fn new(
        config: Config,
        cryptor: FrameCryptor,
        announcer: Arc<dyn KeyAnnouncer + Send + Sync>,
    ) -> Result<(KeyHandler, mpsc::Receiver<Error>)> {
        config.validate()?;
        let (event_tx, event_rx) = mpsc::channel(64);
        let (error_tx, error_rx) = mpsc::channel(8);
        let internal = HandlerInternal {
            config,
            cryptor,
            announcer,
            error_tx,
            state: KeyHandlerState::Disabled,
            material: None,
            index: 0,
        };
        tokio::spawn(internal.run(event_rx));
        Ok((KeyHandler { event_tx }, error_rx))
    }

    async fn send(&self, event: Event) -> Result<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| Error::HandlerClosed)
    }

    /// enable generates fresh local key material, announces it at index 0 and
    /// installs it into the worker. Returns once the worker holds the key.
    pub async fn enable(&self) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Event::Enable { reply }).await?;
        reply_rx.await.map_err(|_| Error::HandlerClosed)?
    }

    /// disable clears every key ring and stops transforming frames.
    pub async fn disable(&self) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Event::Disable { reply }).await?;
        reply_rx.await.map_err(|_| Error::HandlerClosed)?
    }

    /// participant_joined schedules a debounced ratchet of the local key, so
    /// the newcomer cannot read media sent before they arrived.
    pub async fn participant_joined(&self, participant: &str) -> Result<()> {
        self.send(Event::ParticipantJoined(participant.to_owned()))
            .await
    }

    /// participant_left clears the leaver's ring immediately and schedules a
    /// debounced rotation, so the leaver cannot read media sent after.
    pub async fn participant_left(&self, participant: &str) -> Result<()> {
        self.send(Event::ParticipantLeft(participant.to_owned()))
            .await
    }

    /// remote_key_update forwards a remote participant's announced key to the
    /// worker.
    pub async fn remote_key_update(
        &self,
        participant: &str,
        material: KeyMaterial,
        index: u8,
    ) -> Result<()> {
        self.send(Event::RemoteKeyUpdate {
            participant: participant.to_owned(),
            material,
            index,
        })
        .await
    }

    pub async fn state(&self) -> Result<KeyHandlerState> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Event::State { reply }).await?;
        reply_rx.await.map_err(|_| Error::HandlerClosed)
    }

    /// close stops the event loop and cancels any pending timers.
    pub async fn close(&self) -> Result<()> {
        self.send(Event::Close).await
    }
}

struct HandlerInternal {
    config: Config,
    cryptor: FrameCryptor,
    announcer: Arc<dyn KeyAnnouncer + Send + Sync>,
    error_tx: mpsc::Sender<Error>,
    state: KeyHandlerState,
    material: Option<KeyMaterial>,
    index: u8,
}

// A disarmed timer never fires; select polls it as forever-pending.
async fn debounce(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

impl HandlerInternal {
    async fn run(mut self, mut event_rx: mpsc::Receiver<Event>) {
        let mut ratchet_at: Option<Instant> = None;
        let mut rotate_at: Option<Instant> = None;

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        None | Some(Event::Close) => break,
                        Some(event) => {
                            self.handle_event(event, &mut ratchet_at, &mut rotate_at).await;
                        }
                    }
                }
                _ = debounce(ratchet_at) => {
                    ratchet_at = None;
                    self.ratchet_local_key().await;
                }
                _ = debounce(rotate_at) => {
                    rotate_at = None;
                    self.rotate_local_key().await;
                }
            }
        }
    }

    async fn handle_event(
        &mut self,
        event: Event,
        ratchet_at: &mut Option<Instant>,
        rotate_at: &mut Option<Instant>,
    ) {
        match event {
            Event::Enable { reply } => {
                let _ = reply.send(self.enable().await);
            }
            Event::Disable { reply } => {
                *ratchet_at = None;
                *rotate_at = None;
                let _ = reply.send(self.disable().await);
            }
            Event::ParticipantJoined(participant) => {
                if self.state == KeyHandlerState::Enabled {
                    log::debug!("participant {participant} joined, scheduling key ratchet");
                    *ratchet_at = Some(Instant::now() + self.config.ratchet_debounce);
                }
            }
            Event::ParticipantLeft(participant) => {
                if self.state == KeyHandlerState::Enabled {
                    log::debug!("participant {participant} left, scheduling key rotation");
                    if let Err(err) = self.cryptor.cleanup(&participant).await {
                        self.fatal(err);
                    }
                    *rotate_at = Some(Instant::now() + self.config.rotate_debounce);
                }
            }
            Event::RemoteKeyUpdate {
                participant,
                material,
                index,
            } => {
                if let Err(err) = self
                    .cryptor
                    .set_remote_key(&participant, material, index)
                    .await
                {
                    self.fatal(err);
                }
            }
            Event::State { reply } => {
                let _ = reply.send(self.state);
            }
            Event::Close => {}
        }
    }

    async fn enable(&mut self) -> Result<()> {
        if self.state != KeyHandlerState::Disabled {
            return Err(Error::AlreadyEnabled);
        }
        self.state = KeyHandlerState::Enabling;

        let material = KeyMaterial::generate();
        // Announce before installing: a key no receiver has yet must never
        // encrypt frames.
        let result = async {
            self.announcer.announce_key(&material, 0).await?;
            self.cryptor.set_local_key(material.clone(), 0).await?;
            self.cryptor.set_enabled(true).await
        }
        .await;

        match result {
            Ok(()) => {
                self.material = Some(material);
                self.index = 0;
                self.state = KeyHandlerState::Enabled;
                Ok(())
            }
            Err(err) => {
                log::warn!("enabling e2ee failed: {err}");
                self.state = KeyHandlerState::Disabled;
                Err(err)
            }
        }
    }

    async fn disable(&mut self) -> Result<()> {
        if self.state != KeyHandlerState::Enabled {
            return Err(Error::AlreadyDisabled);
        }
        self.state = KeyHandlerState::Disabling;

        let result = async {
            self.cryptor.set_enabled(false).await?;
            self.cryptor.cleanup_all().await
        }
        .await;

        self.material = None;
        self.index = 0;
        self.state = KeyHandlerState::Disabled;
        result
    }

    // Fired by the debounce timer after a join: advance the local material
    // one HKDF step at the next index. Forward-secret against the newcomer.
    async fn ratchet_local_key(&mut self) {
        if self.state != KeyHandlerState::Enabled {
            return;
        }
        let next = match &self.material {
            Some(material) => match material.ratchet() {
                Ok(next) => next,
                Err(err) => return self.fatal(err),
            },
            None => return,
        };
        self.install_local_key(next, "ratcheted").await;
    }

    // Fired by the debounce timer after a leave: replace the local material
    // with fresh random bytes at the next index. Backward-secret against the
    // leaver.
    async fn rotate_local_key(&mut self) {
        if self.state != KeyHandlerState::Enabled || self.material.is_none() {
            return;
        }
        self.install_local_key(KeyMaterial::generate(), "rotated").await;
    }

    async fn install_local_key(&mut self, material: KeyMaterial, action: &str) {
        let index = ((self.index as usize + 1) % self.config.ring_size) as u8;
        if let Err(err) = self.announcer.announce_key(&material, index).await {
            // Transient signaling failure: keep the current key and state, a
            // later join/leave retries with a new announcement.
            log::warn!("key announcement failed, keeping current key: {err}");
            return;
        }
        match self.cryptor.set_local_key(material.clone(), index).await {
            Ok(()) => {
                log::debug!("local key {action} to index {index}");
                self.material = Some(material);
                self.index = index;
            }
            Err(err) => self.fatal(err),
        }
    }

    fn fatal(&mut self, err: Error) {
        log::error!("engine error: {err}");
        let _ = self.error_tx.try_send(err);
    }
}
