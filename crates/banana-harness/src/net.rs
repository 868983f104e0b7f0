//! Driving a broker over an async byte stream.
//!
//! Works with any `AsyncRead + AsyncWrite` stream; the tests use turmoil's
//! simulated TCP so reads arrive with real boundaries and latency.

use std::io;

use banana_core::Value;
use banana_pb::{Broker, BrokerAction, CallArgs, CallError, RemoteReference};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const READ_BUFFER: usize = 4096;

/// A broker bound to one stream.
pub struct Session<S> {
    broker: Broker,
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// Bind `broker` to `stream`.
    pub fn new(broker: Broker, stream: S) -> Self {
        Self { broker, stream }
    }

    /// The broker, for queuing calls or inspecting tables.
    pub fn broker(&mut self) -> &mut Broker {
        &mut self.broker
    }

    /// Write whatever the broker has ready.
    pub async fn flush(&mut self) -> io::Result<()> {
        let actions = self.broker.flush();
        self.perform(actions).await
    }

    /// Read once and feed the broker. `Ok(false)` means the peer closed.
    pub async fn read_once(&mut self) -> io::Result<bool> {
        let mut buf = [0u8; READ_BUFFER];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            self.broker.connection_lost("peer closed the stream");
            return Ok(false);
        }
        debug!(bytes = n, "read");
        let actions = self.broker.data_received(&buf[..n]);
        self.perform(actions).await?;
        Ok(true)
    }

    /// Call `method` and keep the connection serviced until it settles.
    pub async fn call(
        &mut self,
        target: &RemoteReference,
        method: &str,
        args: CallArgs,
    ) -> Result<Value, CallError> {
        let mut call = self.broker.call_remote(target, method, args)?;
        if let Err(err) = self.flush().await {
            self.broker.connection_lost(&err.to_string());
        }
        loop {
            if let Some(outcome) = call.try_result() {
                return outcome;
            }
            if let Err(err) = self.read_once().await {
                self.broker.connection_lost(&err.to_string());
            }
        }
    }

    /// Answer the peer until it closes the stream.
    pub async fn serve(mut self) -> io::Result<()> {
        self.flush().await?;
        while self.read_once().await? {}
        Ok(())
    }

    async fn perform(&mut self, actions: Vec<BrokerAction>) -> io::Result<()> {
        for action in actions {
            match action {
                BrokerAction::Write(bytes) => self.stream.write_all(&bytes).await?,
                BrokerAction::LoseConnection { reason } => {
                    self.stream.shutdown().await?;
                    return Err(io::Error::new(io::ErrorKind::InvalidData, reason));
                },
            }
        }
        self.stream.flush().await
    }
}
