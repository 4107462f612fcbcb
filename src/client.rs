//! Operator-side connection to a host.
//!
//! Used by `live-harness-ctl` and by the integration tests.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::engine::TimeFlow;
use crate::wire::handshake;
use crate::wire::messages::{
    Catalog, CodeImage, HelloAck, ListCatalog, Message, RunEntryPoint, StopRun,
};
use crate::wire::FrameCodec;
use crate::{AppError, Result};

/// A verified connection to a host.
#[derive(Debug)]
pub struct Client {
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    session_id: String,
    server: String,
}

impl Client {
    /// Connect and complete the handshake.
    ///
    /// # Errors
    ///
    /// `AppError::Network` if the host cannot be reached or hangs up, and
    /// `AppError::Unauthorized` if it rejects the handshake.
    pub async fn connect(
        addr: SocketAddr,
        client: &str,
        token: &str,
        max_frame_bytes: usize,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| AppError::Network(format!("cannot connect to {addr}: {err}")))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::new(max_frame_bytes));
        let mut writer = FramedWrite::new(write_half, FrameCodec::new(max_frame_bytes));

        writer
            .send(Message::from(handshake::client_hello(client, token)))
            .await?;
        let reply = reader
            .next()
            .await
            .ok_or_else(|| AppError::Network("host closed during handshake".into()))??;

        let HelloAck { session_id, server } = match reply {
            Message::HelloAck(ack) => ack,
            Message::HelloNack(nack) => return Err(AppError::Unauthorized(nack.reason)),
            other => {
                return Err(AppError::Protocol(format!(
                    "expected handshake reply, got {:?}",
                    other.kind()
                )))
            }
        };
        reader.decoder_mut().upgrade();
        writer.encoder_mut().upgrade();

        Ok(Self {
            reader,
            writer,
            session_id,
            server,
        })
    }

    /// Session id assigned by the host.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Host identification.
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Send one message.
    ///
    /// # Errors
    ///
    /// Returns the transport or encoding error.
    pub async fn send(&mut self, message: impl Into<Message>) -> Result<()> {
        let message: Message = message.into();
        self.writer.send(message).await
    }

    /// Receive the next message; `None` once the host closed the stream.
    ///
    /// # Errors
    ///
    /// Returns transport or decoding errors.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        self.reader.next().await.transpose()
    }

    /// Receive the next message, failing after `wait`.
    ///
    /// # Errors
    ///
    /// `AppError::Network` on timeout or when the host closed the stream.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Result<Message> {
        tokio::time::timeout(wait, self.recv())
            .await
            .map_err(|_| AppError::Network("timed out waiting for host".into()))??
            .ok_or_else(|| AppError::Network("host closed the connection".into()))
    }

    /// Upload an image and wait for its catalog.
    ///
    /// Log frames received in between are skipped.
    ///
    /// # Errors
    ///
    /// `AppError::Load` when the host rejects the image.
    pub async fn push_image(&mut self, image: Vec<u8>, symbols: Option<Vec<u8>>) -> Result<Catalog> {
        self.send(CodeImage { image, symbols }).await?;
        self.await_catalog().await
    }

    /// Ask for the current catalog.
    ///
    /// # Errors
    ///
    /// `AppError::Load` when no image is loaded.
    pub async fn list_catalog(&mut self) -> Result<Catalog> {
        self.send(ListCatalog).await?;
        self.await_catalog().await
    }

    /// Request a run of catalog entry `index`.
    ///
    /// # Errors
    ///
    /// Returns the transport error.
    pub async fn run(&mut self, index: u32, time_flow: TimeFlow) -> Result<()> {
        self.send(RunEntryPoint { index, time_flow }).await
    }

    /// Ask the host to stop a run.
    ///
    /// # Errors
    ///
    /// Returns the transport error.
    pub async fn stop(&mut self, run_id: &str) -> Result<()> {
        self.send(StopRun {
            run_id: run_id.to_owned(),
        })
        .await
    }

    /// Say goodbye and close the write side.
    ///
    /// # Errors
    ///
    /// Returns the transport error.
    pub async fn disconnect(mut self, reason: &str) -> Result<()> {
        self.writer.send(Message::disconnect(reason)).await?;
        self.writer.close().await
    }

    async fn await_catalog(&mut self) -> Result<Catalog> {
        loop {
            match self.recv().await? {
                Some(Message::Catalog(catalog)) => return Ok(catalog),
                Some(Message::LoadFailed(failed)) => return Err(AppError::Load(failed.reason)),
                Some(Message::Log(_)) => {}
                Some(Message::Disconnect(d)) => return Err(AppError::Network(d.reason)),
                Some(other) => {
                    return Err(AppError::Protocol(format!(
                        "unexpected {:?} while waiting for catalog",
                        other.kind()
                    )))
                }
                None => return Err(AppError::Network("host closed the connection".into())),
            }
        }
    }
}
