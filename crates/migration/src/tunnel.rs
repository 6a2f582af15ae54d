// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The tunnelled-migration pump: move the hypervisor's migration bytes
//! from a local socket onto a caller-supplied stream, under the control of
//! a stop/abort channel.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use vmm_types::{Result, VmmError};

const TUNNEL_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelCommand {
    /// Finish draining whatever is buffered, then exit cleanly.
    Stop,
    /// Exit immediately and reset the output stream.
    Abort,
}

/// Pump `source` into `dest` in 64 KiB chunks until EOF, a stop, or an
/// abort. Returns Ok on EOF or graceful stop.
pub async fn run_tunnel<R, W>(
    mut source: R,
    mut dest: W,
    mut control: mpsc::Receiver<TunnelCommand>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; TUNNEL_CHUNK];
    let mut stopping = false;

    loop {
        if stopping {
            // Graceful stop: drain what is immediately available, then
            // leave. Zero-timeout reads stand in for a poll with timeout 0.
            match tokio::time::timeout(std::time::Duration::from_millis(1), source.read(&mut buf))
                .await
            {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => {
                    dest.write_all(&buf[..n]).await.map_err(|e| {
                        VmmError::OperationFailed(format!("writing migration stream: {}", e))
                    })?;
                }
                Ok(Err(e)) => {
                    return Err(VmmError::OperationFailed(format!(
                        "reading migration socket: {}",
                        e
                    )))
                }
            }
            continue;
        }

        tokio::select! {
            command = control.recv() => match command {
                Some(TunnelCommand::Stop) => stopping = true,
                Some(TunnelCommand::Abort) | None => {
                    let _ = dest.shutdown().await;
                    return Err(VmmError::OperationAborted(
                        "migration tunnel: aborted".to_string(),
                    ));
                }
            },
            read = source.read(&mut buf) => match read {
                // Short read means the hypervisor closed its end.
                Ok(0) => break,
                Ok(n) => {
                    dest.write_all(&buf[..n]).await.map_err(|e| {
                        VmmError::OperationFailed(format!("writing migration stream: {}", e))
                    })?;
                }
                Err(e) => {
                    return Err(VmmError::OperationFailed(format!(
                        "reading migration socket: {}",
                        e
                    )))
                }
            },
        }
    }

    dest.flush()
        .await
        .map_err(|e| VmmError::OperationFailed(format!("flushing migration stream: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pumps_until_eof() {
        let (mut tx, rx) = tokio::io::duplex(256 * 1024);
        let (_ctl_tx, ctl_rx) = mpsc::channel(1);
        let mut out = std::io::Cursor::new(Vec::new());

        let payload = vec![7u8; 100_000];
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                tx.write_all(&payload).await.unwrap();
                tx.shutdown().await.unwrap();
            })
        };

        run_tunnel(rx, &mut out, ctl_rx).await.unwrap();
        writer.await.unwrap();
        assert_eq!(out.get_ref(), &payload);
    }

    #[tokio::test]
    async fn test_abort_interrupts_the_stream() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let (ctl_tx, ctl_rx) = mpsc::channel(1);
        let out = tokio::io::sink();

        // Keep some bytes trickling so the pump is mid-stream.
        let feeder = tokio::spawn(async move {
            loop {
                if tx.write_all(&[1u8; 16]).await.is_err() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        });

        ctl_tx.send(TunnelCommand::Abort).await.unwrap();
        let err = run_tunnel(rx, out, ctl_rx).await.unwrap_err();
        assert_eq!(err.code(), "operation-aborted");
        feeder.abort();
    }

    #[tokio::test]
    async fn test_stop_drains_and_exits() {
        let (mut tx, rx) = tokio::io::duplex(256 * 1024);
        let (ctl_tx, ctl_rx) = mpsc::channel(1);
        let mut out = std::io::Cursor::new(Vec::new());

        tx.write_all(&[9u8; 4096]).await.unwrap();
        ctl_tx.send(TunnelCommand::Stop).await.unwrap();

        run_tunnel(rx, &mut out, ctl_rx).await.unwrap();
        assert_eq!(out.get_ref().len(), 4096);
    }
}
