
use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::context::{Context, DecryptOutcome};
use crate::error::{Error, Result};
use crate::frame::{EncodedFrame, FrameKind, MediaKind};
use crate::key_derivation::KeyMaterial;
use crate::red::RedEncoder;

/// ParticipantId identifies a conference participant. Assigned by the
/// conference layer and stable for the participant's lifetime; the receive
/// side keys its rings by it.
pub type ParticipantId = String;

/// Counters for frames the worker refused to deliver.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CryptorStats {
    /// Frames dropped because the GCM tag did not verify.
    pub auth_failures: u64,
    /// Frames dropped because they were shorter than the minimum envelope.
    pub malformed_frames: u64,
}

enum Direction {
    Send,
    Receive { participant: ParticipantId },
}

struct Pipeline {
    kind: MediaKind,
    direction: Direction,
    // Audio send pipelines wrap frames in RFC 2198 redundancy before
    // encryption.
    red: Option<RedEncoder>,
}

enum Command {
    InstallSend {
        stream_id: String,
        kind: MediaKind,
        reply: oneshot::Sender<Result<()>>,
    },
    InstallReceive {
        stream_id: String,
        kind: MediaKind,
        participant: ParticipantId,
        reply: oneshot::Sender<Result<()>>,
    },
    Uninstall {
        stream_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SetLocalKey {
        material: KeyMaterial,
        index: u8,
        reply: oneshot::Sender<Result<()>>,
    },
    SetRemoteKey {
        participant: ParticipantId,
        material: KeyMaterial,
        index: u8,
        reply: oneshot::Sender<Result<()>>,
    },
    Cleanup {
        participant: ParticipantId,
        reply: oneshot::Sender<Result<()>>,
    },
    CleanupAll {
        reply: oneshot::Sender<Result<()>>,
    },
    SetEnabled {
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetRedundancy {
        redundancy: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Encrypt {
        stream_id: String,
        frame: EncodedFrame,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    Decrypt {
        stream_id: String,
        frame: EncodedFrame,
        reply: oneshot::Sender<Result<Option<Bytes>>>,
    },
    Stats {
        reply: oneshot::Sender<CryptorStats>,
    },
    Close,
}

/// FrameCryptor is the handle to the dedicated worker that owns every key
/// ring, send counter and pipeline. All key mutations and frame transforms
/// happen on the worker in command order, so a `set_key` is applied exactly
/// between the frames that surrounded it on the queue; handles only enqueue.
///
/// Requires a running tokio runtime; the worker is spawned from `new`.
#[derive(Clone)]
pub struct FrameCryptor {
    cmd_tx: mpsc::Sender<Command>,
}

impl FrameCryptor {
    /// new validates the configuration and spawns the worker task.
    pub fn new(config: Config) -> Result<FrameCryptor> {
        config.validate()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let worker = CryptorWorker::new(config);
        tokio::spawn(worker.run(cmd_rx));
        Ok(FrameCryptor { cmd_tx })
    }

    async fn request<T>(
        &self,
        command: Command,
        reply_rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| Error::CryptorClosed)?;
        reply_rx.await.map_err(|_| Error::CryptorClosed)?
    }

    /// install_send_pipeline attaches the encrypting transform for one
    /// outgoing stream.
    pub async fn install_send_pipeline(&self, stream_id: &str, kind: MediaKind) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            Command::InstallSend {
                stream_id: stream_id.to_owned(),
                kind,
                reply,
            },
            reply_rx,
        )
        .await
    }

    /// install_receive_pipeline attaches the decrypting transform for one
    /// incoming stream, keyed by the sending participant.
    pub async fn install_receive_pipeline(
        &self,
        stream_id: &str,
        kind: MediaKind,
        participant: &str,
    ) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            Command::InstallReceive {
                stream_id: stream_id.to_owned(),
                kind,
                participant: participant.to_owned(),
                reply,
            },
            reply_rx,
        )
        .await
    }

    /// uninstall_pipeline detaches a stream's transform.
    pub async fn uninstall_pipeline(&self, stream_id: &str) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            Command::Uninstall {
                stream_id: stream_id.to_owned(),
                reply,
            },
            reply_rx,
        )
        .await
    }

    /// set_local_key installs the local participant's sending key.
    pub async fn set_local_key(&self, material: KeyMaterial, index: u8) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            Command::SetLocalKey {
                material,
                index,
                reply,
            },
            reply_rx,
        )
        .await
    }

    /// set_remote_key installs a remote participant's announced key, creating
    /// the participant's ring on first announcement.
    pub async fn set_remote_key(
        &self,
        participant: &str,
        material: KeyMaterial,
        index: u8,
    ) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            Command::SetRemoteKey {
                participant: participant.to_owned(),
                material,
                index,
                reply,
            },
            reply_rx,
        )
        .await
    }

    /// cleanup destroys a departed participant's key ring. Their pipelines,
    /// if still installed, fall back to passthrough.
    pub async fn cleanup(&self, participant: &str) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            Command::Cleanup {
                participant: participant.to_owned(),
                reply,
            },
            reply_rx,
        )
        .await
    }

    /// cleanup_all wipes the local ring and every remote ring.
    pub async fn cleanup_all(&self) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(Command::CleanupAll { reply }, reply_rx).await
    }

    /// set_enabled switches both directions between transforming and
    /// passthrough.
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(Command::SetEnabled { enabled, reply }, reply_rx)
            .await
    }

    /// set_redundancy adjusts the RFC 2198 redundancy level of every audio
    /// send pipeline, present and future.
    pub async fn set_redundancy(&self, redundancy: usize) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(Command::SetRedundancy { redundancy, reply }, reply_rx)
            .await
    }

    /// encrypt_frame runs one outgoing frame through its send pipeline and
    /// returns the bytes to hand to the transport.
    pub async fn encrypt_frame(&self, stream_id: &str, frame: EncodedFrame) -> Result<Bytes> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            Command::Encrypt {
                stream_id: stream_id.to_owned(),
                frame,
                reply,
            },
            reply_rx,
        )
        .await
    }

    /// decrypt_frame runs one incoming frame through its receive pipeline.
    /// `None` means the frame was dropped and nothing goes to the decoder.
    pub async fn decrypt_frame(
        &self,
        stream_id: &str,
        frame: EncodedFrame,
    ) -> Result<Option<Bytes>> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            Command::Decrypt {
                stream_id: stream_id.to_owned(),
                frame,
                reply,
            },
            reply_rx,
        )
        .await
    }

    /// stats returns the worker's drop counters.
    pub async fn stats(&self) -> Result<CryptorStats> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stats { reply })
            .await
            .map_err(|_| Error::CryptorClosed)?;
        reply_rx.await.map_err(|_| Error::CryptorClosed)
    }

    /// close stops the worker. Pending commands already on the queue are
    /// still applied; everything after the close is rejected.
    pub async fn close(&self) -> Result<()> {
        self.cmd_tx
            .send(Command::Close)
            .await
            .map_err(|_| Error::CryptorClosed)
    }
}

struct CryptorWorker {
    config: Config,
    enabled: bool,
    local: Context,
    remotes: HashMap<ParticipantId, Context>,
    pipelines: HashMap<String, Pipeline>,
    stats: CryptorStats,
}

impl CryptorWorker {
    fn new(config: Config) -> CryptorWorker {
        let local = Context::new(config.ring_size, 0);
        CryptorWorker {
            config,
            enabled: false,
            local,
            remotes: HashMap::new(),
            pipelines: HashMap::new(),
            stats: CryptorStats::default(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(command) = cmd_rx.recv().await {
            if self.handle(command) {
                break;
            }
        }
        // Dropping the worker drops every ring; key material zeroizes itself.
    }

    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::InstallSend {
                stream_id,
                kind,
                reply,
            } => {
                let _ = reply.send(self.install_send(stream_id, kind));
            }
            Command::InstallReceive {
                stream_id,
                kind,
                participant,
                reply,
            } => {
                let _ = reply.send(self.install_receive(stream_id, kind, participant));
            }
            Command::Uninstall { stream_id, reply } => {
                let _ = reply.send(self.uninstall(&stream_id));
            }
            Command::SetLocalKey {
                material,
                index,
                reply,
            } => {
                let _ = reply.send(self.set_local_key(material, index));
            }
            Command::SetRemoteKey {
                participant,
                material,
                index,
                reply,
            } => {
                let _ = reply.send(self.set_remote_key(participant, material, index));
            }
            Command::Cleanup { participant, reply } => {
                self.remotes.remove(&participant);
                let _ = reply.send(Ok(()));
            }
            Command::CleanupAll { reply } => {
                self.local.clear_all();
                self.remotes.clear();
                let _ = reply.send(Ok(()));
            }
            Command::SetEnabled { enabled, reply } => {
                self.enabled = enabled;
                let _ = reply.send(Ok(()));
            }
            Command::SetRedundancy { redundancy, reply } => {
                self.config.redundancy_level = redundancy;
                for pipeline in self.pipelines.values_mut() {
                    if let Some(red) = pipeline.red.as_mut() {
                        red.set_redundancy(redundancy);
                    }
                }
                let _ = reply.send(Ok(()));
            }
            Command::Encrypt {
                stream_id,
                frame,
                reply,
            } => {
                let _ = reply.send(self.encrypt(&stream_id, frame));
            }
            Command::Decrypt {
                stream_id,
                frame,
                reply,
            } => {
                let _ = reply.send(self.decrypt(&stream_id, frame));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats);
            }
            Command::Close => return true,
        }
        false
    }

    fn install_send(&mut self, stream_id: String, kind: MediaKind) -> Result<()> {
        if self.pipelines.contains_key(&stream_id) {
            return Err(Error::PipelineExists(stream_id));
        }
        let red = (kind == MediaKind::Audio).then(|| {
            RedEncoder::new(
                self.config.inner_opus_payload_type,
                self.config.redundancy_level,
            )
        });
        self.pipelines.insert(
            stream_id,
            Pipeline {
                kind,
                direction: Direction::Send,
                red,
            },
        );
        Ok(())
    }

    fn install_receive(
        &mut self,
        stream_id: String,
        kind: MediaKind,
        participant: ParticipantId,
    ) -> Result<()> {
        if self.pipelines.contains_key(&stream_id) {
            return Err(Error::PipelineExists(stream_id));
        }
        self.pipelines.insert(
            stream_id,
            Pipeline {
                kind,
                direction: Direction::Receive { participant },
                red: None,
            },
        );
        Ok(())
    }

    fn uninstall(&mut self, stream_id: &str) -> Result<()> {
        self.pipelines
            .remove(stream_id)
            .map(|_| ())
            .ok_or_else(|| Error::NoSuchPipeline(stream_id.to_owned()))
    }

    fn set_local_key(&mut self, material: KeyMaterial, index: u8) -> Result<()> {
        // The local sender writes the index into every frame trailer; it must
        // stay within the ring the remotes were configured with.
        if index as usize >= self.config.ring_size {
            return Err(Error::InvalidKeyIndex(index, self.config.ring_size));
        }
        self.local.set_key(material, index)
    }

    fn set_remote_key(
        &mut self,
        participant: ParticipantId,
        material: KeyMaterial,
        index: u8,
    ) -> Result<()> {
        let ring_size = self.config.ring_size;
        let ratchet_window = self.config.ratchet_window;
        self.remotes
            .entry(participant)
            .or_insert_with(|| Context::new(ring_size, ratchet_window))
            .set_key(material, index)
    }

    fn encrypt(&mut self, stream_id: &str, frame: EncodedFrame) -> Result<Bytes> {
        let pipeline = self
            .pipelines
            .get_mut(stream_id)
            .ok_or_else(|| Error::NoSuchPipeline(stream_id.to_owned()))?;
        if !matches!(pipeline.direction, Direction::Send) {
            return Err(Error::InvalidSendStream);
        }
        if !self.enabled {
            return Ok(frame.payload);
        }

        let payload = match pipeline.red.as_mut() {
            Some(red) => red.encode(&frame.payload, frame.timestamp),
            None => frame.payload.clone(),
        };
        let kind = FrameKind::classify(pipeline.kind, frame.key_frame, &payload);
        self.local
            .encrypt_frame(kind, frame.ssrc, frame.timestamp, &payload)
    }

    fn decrypt(&mut self, stream_id: &str, frame: EncodedFrame) -> Result<Option<Bytes>> {
        let pipeline = self
            .pipelines
            .get(stream_id)
            .ok_or_else(|| Error::NoSuchPipeline(stream_id.to_owned()))?;
        let participant = match &pipeline.direction {
            Direction::Receive { participant } => participant,
            Direction::Send => return Err(Error::InvalidReceiveStream),
        };
        if !self.enabled {
            return Ok(Some(frame.payload));
        }

        let context = match self.remotes.get_mut(participant) {
            Some(context) => context,
            None => {
                log::debug!("no key ring for participant {participant}, passing frame through");
                return Ok(Some(frame.payload));
            }
        };

        let kind = FrameKind::classify(pipeline.kind, frame.key_frame, &frame.payload);
        match context.decrypt_frame(kind, &frame.payload) {
            Ok(DecryptOutcome::Plaintext(plaintext)) => Ok(Some(plaintext)),
            Ok(DecryptOutcome::Passthrough(payload)) => {
                log::debug!("no key at frame's index on stream {stream_id}, passing through");
                Ok(Some(payload))
            }
            Err(Error::FailedToDecryptFrame) => {
                self.stats.auth_failures += 1;
                log::warn!("dropping frame on stream {stream_id}: authentication failed");
                Ok(None)
            }
            Err(Error::FrameTooShort(got, want)) => {
                self.stats.malformed_frames += 1;
                log::warn!(
                    "dropping malformed frame on stream {stream_id}: {got} bytes, expected at least {want}"
                );
                Ok(None)
            }
            // Anything else is a crypto primitive failure; surface it.
            Err(err) => Err(err),
        }
    }
}
