//! Line-protocol client for a kvrelay coordinator

use crate::common::{Error, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    response_timeout: Duration,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs, response_timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            response_timeout,
        })
    }

    /// Send one command and wait for its response line
    pub async fn send(&mut self, command: &str) -> Result<String> {
        let mut out = Vec::with_capacity(command.len() + 1);
        out.extend_from_slice(command.as_bytes());
        out.push(b'\n');
        self.writer.write_all(&out).await?;
        self.read_response().await
    }

    /// Read the next response line, without its terminator
    pub async fn read_response(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = tokio::time::timeout(self.response_timeout, self.reader.read_line(&mut line))
            .await
            .map_err(|_| Error::Timeout("no response received from server".into()))??;
        if n == 0 {
            return Err(Error::ConnectionFailed("server closed the connection".into()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Send several commands before reading any response
    pub async fn pipeline(&mut self, commands: &[&str]) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for command in commands {
            out.extend_from_slice(command.as_bytes());
            out.push(b'\n');
        }
        self.writer.write_all(&out).await?;

        let mut responses = Vec::with_capacity(commands.len());
        for _ in commands {
            responses.push(self.read_response().await?);
        }
        Ok(responses)
    }
}
