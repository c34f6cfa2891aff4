//! TCP transport - line-delimited JSON in front of [`Service`]
//!
//! Each client line is an [`Envelope`]; each server line is a [`Response`].
//! A `stream_output` request switches the connection into stream mode:
//! the server sends one chunk, then waits for the client's next line.
//! `c` asks for another chunk; anything else ends the stream with `ok`.
//! `end_of_stream` is sent once the task finishes. Either way the
//! connection then goes back to accepting requests.

use crate::error::Error;
use crate::service::{AllowAll, Envelope, Interceptor, Request, Response, Service, StreamControl};
use std::io;
use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines,
};
use tokio::net::TcpListener;

#[derive(Clone)]
pub struct Server {
    service: Service,
    interceptor: Arc<dyn Interceptor>,
}

impl Server {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            interceptor: Arc::new(AllowAll),
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    /// Accept connections until the listener fails or the future is dropped
    pub async fn run(&self, listener: TcpListener) -> io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Listening on {}", addr);
        }

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    continue;
                }
            };
            log::debug!("Connection from {}", peer);

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream).await {
                    log::debug!("Connection {} ended with error: {}", peer, e);
                } else {
                    log::debug!("Connection {} closed", peer);
                }
            });
        }
    }

    /// Serve one connection until the client closes it
    pub async fn serve_connection<S>(&self, stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let envelope: Envelope = match serde_json::from_str(&line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    let err = Error::ValidationFailed(format!("malformed request: {}", e));
                    send(&mut writer, &Response::from(err)).await?;
                    continue;
                }
            };

            if !self.interceptor.authorize(envelope.auth.as_deref()) {
                log::warn!("Rejected unauthorized request");
                send(&mut writer, &Response::unauthorized()).await?;
                continue;
            }

            match envelope.request {
                Request::StreamOutput { queue } => {
                    self.stream_output(&queue, &mut lines, &mut writer).await?
                }
                request => send(&mut writer, &self.service.handle(request)).await?,
            }
        }

        Ok(())
    }

    async fn stream_output<R, W>(
        &self,
        queue: &str,
        lines: &mut Lines<R>,
        writer: &mut W,
    ) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut session = match self.service.open_stream(queue) {
            Ok(session) => session,
            Err(e) => return send(writer, &Response::from(e)).await,
        };

        loop {
            match session.next_chunk().await {
                Some(chunk) => send(writer, &Response::chunk(&chunk)).await?,
                None => {
                    session.close();
                    return send(writer, &Response::EndOfStream).await;
                }
            }

            match lines.next_line().await? {
                Some(message) => {
                    if session.on_client_message(&message) == StreamControl::Stop {
                        session.close();
                        return send(writer, &Response::ok()).await;
                    }
                }
                None => {
                    session.close();
                    return Ok(());
                }
            }
        }
    }
}

async fn send<W>(writer: &mut W, response: &Response) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}
