//! Configuration-file transfer over the command connection.
//!
//! Uploads announce the payload with a `<byte_len>` line, then stream the raw file.
//! Downloads are the reverse: the server replies with an integer byte length, the
//! raw bytes follow, and the client acknowledges with a single `\n`. Both directions
//! finish with the integer completion code of the command that started them.

use super::client::ProtocolClient;
use crate::error::{ProtocolError, XpadError, XpadResult};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};

/// Largest configuration file accepted from the server (16 MiB).
pub const MAX_CONFIG_FILE_LEN: usize = 16 << 20;

impl<S> ProtocolClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Send `command`, stream the file at `path`, and return the completion code.
    pub async fn upload_file(&mut self, command: &str, path: &Path) -> XpadResult<i64> {
        let payload = tokio::fs::read(path).await?;
        tracing::debug!(command, path = %path.display(), bytes = payload.len(), "Uploading file");

        self.send(command).await?;
        self.send(&payload.len().to_string()).await?;
        self.connection_mut()?
            .write_all(&payload)
            .await
            .map_err(|source| ProtocolError::Send {
                command: command.to_string(),
                source,
            })?;

        Ok(self.await_integer(command).await?)
    }

    /// Send `command`, receive the announced payload into `path`, and return the
    /// completion code.
    ///
    /// Lengths above [`MAX_CONFIG_FILE_LEN`] fail before anything is buffered.
    pub async fn download_file(&mut self, command: &str, path: &Path) -> XpadResult<i64> {
        self.send(command).await?;

        let length = self.await_integer(command).await?;
        let length = usize::try_from(length)
            .ok()
            .filter(|&len| len <= MAX_CONFIG_FILE_LEN)
            .ok_or_else(|| {
                XpadError::DetectorFailure(format!(
                    "'{command}' announced {length} bytes (limit {MAX_CONFIG_FILE_LEN})"
                ))
            })?;

        let mut payload = vec![0u8; length];
        let conn = self.connection_mut()?;
        conn.read_exact_into(&mut payload)
            .await
            .map_err(ProtocolError::Read)?;
        conn.write_all(b"\n").await.map_err(|source| ProtocolError::Send {
            command: command.to_string(),
            source,
        })?;

        tokio::fs::write(path, &payload).await?;
        tracing::debug!(command, path = %path.display(), bytes = length, "Downloaded file");

        Ok(self.await_integer(command).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn upload_announces_length_then_streams_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calib.cfl");
        tokio::fs::write(&path, b"local-config").await.unwrap();

        let (client_end, server_end) = tokio::io::duplex(1024);
        let mut client = ProtocolClient::from_stream(client_end);

        let server = tokio::spawn(async move {
            let mut reader = BufReader::new(server_end);
            let mut command = String::new();
            reader.read_line(&mut command).await.unwrap();
            let mut length = String::new();
            reader.read_line(&mut length).await.unwrap();
            let length: usize = length.trim().parse().unwrap();
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).await.unwrap();
            reader.get_mut().write_all(b"*0\n").await.unwrap();
            (command, body)
        });

        let code = client
            .upload_file("LoadConfigLFromFile", &path)
            .await
            .unwrap();
        assert_eq!(code, 0);

        let (command, body) = server.await.unwrap();
        assert_eq!(command.trim(), "LoadConfigLFromFile");
        assert_eq!(body, b"local-config");
    }

    #[tokio::test]
    async fn download_writes_file_and_acknowledges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calib.cfl");

        let (client_end, mut server_end) = tokio::io::duplex(1024);
        let mut client = ProtocolClient::from_stream(client_end);

        let server = tokio::spawn(async move {
            let mut command = vec![0u8; "ReadConfigL\n".len()];
            server_end.read_exact(&mut command).await.unwrap();
            server_end.write_all(b"*5\nabcde").await.unwrap();
            let ack = server_end.read_u8().await.unwrap();
            server_end.write_all(b"*0\n").await.unwrap();
            ack
        });

        let code = client.download_file("ReadConfigL", &path).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(server.await.unwrap(), b'\n');
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abcde");
    }

    #[tokio::test]
    async fn download_rejects_oversized_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calib.cfl");

        let (client_end, mut server_end) = tokio::io::duplex(1024);
        let mut client = ProtocolClient::from_stream(client_end);

        let server = tokio::spawn(async move {
            let mut command = vec![0u8; "ReadConfigL\n".len()];
            server_end.read_exact(&mut command).await.unwrap();
            server_end.write_all(b"*4294967296\n").await.unwrap();
            server_end
        });

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client.download_file("ReadConfigL", &path),
        )
        .await
        .expect("payload read was attempted")
        .unwrap_err();
        assert!(matches!(err, XpadError::DetectorFailure(ref m) if m.contains("4294967296")));
        assert!(!path.exists());
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn download_rejects_negative_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calib.cfl");

        let (client_end, mut server_end) = tokio::io::duplex(1024);
        let mut client = ProtocolClient::from_stream(client_end);

        tokio::spawn(async move {
            let mut command = vec![0u8; "ReadConfigL\n".len()];
            server_end.read_exact(&mut command).await.unwrap();
            server_end.write_all(b"*-3\n").await.unwrap();
            server_end
        });

        let err = client.download_file("ReadConfigL", &path).await.unwrap_err();
        assert!(matches!(err, XpadError::DetectorFailure(_)));
    }
}
