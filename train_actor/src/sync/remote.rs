use std::io;

use async_trait::async_trait;
use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload},
    specs::EngineSpec,
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
};

use super::{EngineId, LocalRolloutEngine, RolloutEngine, WeightVersion, WireTensor};

struct Chan<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rx: OnoReceiver<R>,
    tx: OnoSender<W>,
    buf: Vec<u8>,
}

impl<R, W> Chan<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn send(&mut self, cmd: Command) -> io::Result<()> {
        self.tx.send(&Msg::Control(cmd)).await
    }

    async fn recv(&mut self) -> io::Result<Command> {
        match self.rx.recv_into(&mut self.buf).await? {
            Msg::Control(cmd) => Ok(cmd),
            Msg::Err(e) => Err(io::Error::other(e.into_owned())),
            Msg::Data(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "expected a control message, got data",
            )),
        }
    }
}

/// A rollout engine living at the other end of a `comms` channel.
pub struct RemoteRolloutEngine<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    id: EngineId,
    spec: EngineSpec,
    chan: Mutex<Chan<R, W>>,
}

impl<R, W> RemoteRolloutEngine<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Handshakes with a served engine and learns its layout.
    ///
    /// # Arguments
    /// * `id` - The engine's position in the connected list.
    /// * `rx` - The receiving end of the channel.
    /// * `tx` - The sending end of the channel.
    ///
    /// # Returns
    /// A connected `RemoteRolloutEngine` or an io error.
    pub async fn connect(id: EngineId, rx: OnoReceiver<R>, tx: OnoSender<W>) -> io::Result<Self> {
        let mut chan = Chan {
            rx,
            tx,
            buf: Vec::new(),
        };

        chan.send(Command::Describe).await?;
        let spec = match chan.recv().await? {
            Command::Spec(spec) => spec,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected engine spec, got {other:?}"),
                ));
            }
        };

        debug!("engine {id} described itself as {spec:?}");
        Ok(Self {
            id,
            spec,
            chan: Mutex::new(chan),
        })
    }

    /// Tells the served engine to stop serving this channel.
    pub async fn disconnect(&self) -> io::Result<()> {
        let mut chan = self.chan.lock().await;
        chan.send(Command::Disconnect).await?;
        chan.recv().await.map(|_| ())
    }
}

fn unexpected<T>(expected: &str, got: Command) -> io::Result<T> {
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("expected {expected}, got {got:?}"),
    ))
}

#[async_trait]
impl<R, W> RolloutEngine for RemoteRolloutEngine<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn id(&self) -> EngineId {
        self.id
    }

    fn spec(&self) -> EngineSpec {
        self.spec
    }

    async fn stage(&self, version: WeightVersion, bucket: Vec<WireTensor>) -> io::Result<()> {
        let mut chan = self.chan.lock().await;

        for tensor in bucket {
            chan.send(Command::StageTensor {
                version,
                spec: tensor.spec,
            })
            .await?;

            let msg = Msg::Data(Payload::Tensor(&tensor.bytes));
            chan.tx.send(&msg).await?;
        }

        Ok(())
    }

    async fn ready(&self, version: WeightVersion) -> io::Result<WeightVersion> {
        let mut chan = self.chan.lock().await;
        chan.send(Command::Ready { version }).await?;

        match chan.recv().await? {
            Command::Ack { version } => Ok(version),
            other => unexpected("ack", other),
        }
    }

    async fn commit(&self, version: WeightVersion) -> io::Result<()> {
        let mut chan = self.chan.lock().await;
        chan.send(Command::Commit { version }).await?;

        match chan.recv().await? {
            Command::Committed { version: v } if v == version => Ok(()),
            other => unexpected("commit confirmation", other),
        }
    }

    async fn abort(&self, version: WeightVersion) -> io::Result<()> {
        self.chan.lock().await.send(Command::Abort { version }).await
    }
}

/// Serves `engine` over a `comms` channel until the peer disconnects.
///
/// Staging failures are held back and reported when the peer asks for readiness.
///
/// # Arguments
/// * `engine` - The engine to serve.
/// * `rx` - The receiving end of the channel.
/// * `tx` - The sending end of the channel.
///
/// # Returns
/// An io error if the channel breaks.
pub async fn serve_engine<R, W>(
    engine: &LocalRolloutEngine,
    mut rx: OnoReceiver<R>,
    mut tx: OnoSender<W>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut rx_buf = Vec::new();
    let mut data_buf = Vec::new();
    let mut failed: Option<String> = None;

    loop {
        let cmd = match rx.recv_into(&mut rx_buf).await? {
            Msg::Control(cmd) => cmd,
            msg => {
                warn!("engine {} expected a command, got {msg:?}", engine.id());
                continue;
            }
        };

        let reply = match cmd {
            Command::Describe => Some(Msg::Control(Command::Spec(engine.spec()))),
            Command::StageTensor { version, spec } => {
                let bytes = match rx.recv_into(&mut data_buf).await? {
                    Msg::Data(Payload::Tensor(bytes)) => bytes.to_vec(),
                    msg => return unexpected_data(msg),
                };

                if let Err(e) = engine.stage(version, vec![WireTensor { spec, bytes }]).await {
                    failed.get_or_insert(e.to_string());
                }

                None
            }
            Command::Ready { version } => {
                let res = match failed.take() {
                    Some(e) => Err(io::Error::other(e)),
                    None => engine.ready(version).await,
                };

                Some(match res {
                    Ok(version) => Msg::Control(Command::Ack { version }),
                    Err(e) => Msg::Err(e.to_string().into()),
                })
            }
            Command::Commit { version } => Some(match engine.commit(version).await {
                Ok(()) => Msg::Control(Command::Committed { version }),
                Err(e) => Msg::Err(e.to_string().into()),
            }),
            Command::Abort { version } => {
                failed = None;
                engine.abort(version).await?;
                None
            }
            Command::Disconnect => {
                tx.send(&Msg::Control(Command::Disconnect)).await?;
                info!("engine {} disconnected", engine.id());
                return Ok(());
            }
            other => {
                warn!("engine {} ignoring unexpected {other:?}", engine.id());
                None
            }
        };

        if let Some(reply) = reply {
            tx.send(&reply).await?;
        }
    }
}

fn unexpected_data<T>(msg: Msg<'_>) -> io::Result<T> {
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("expected tensor data, got {msg:?}"),
    ))
}
