use chrono::Utc;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use thermo_stats::{parse_timestamp, Reading};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info, warn};

use crate::backend::ReadingSink;

/// Validates newline-delimited reading documents and stores them.
pub struct IngestHandler {
    sink: ReadingSink,
    sequence: AtomicU64,
}

impl IngestHandler {
    pub fn new(sink: ReadingSink) -> Self {
        Self {
            sink,
            sequence: AtomicU64::new(0),
        }
    }

    /// Accept one JSON payload, deserialize it into a `Reading`, check its
    /// timestamp and store it under a fresh key. Returns the key.
    pub async fn handle_message(&self, data: &[u8]) -> Result<String, Box<dyn std::error::Error>> {
        let reading: Reading = serde_json::from_slice(data)?;
        parse_timestamp(&reading.timestamp)?;

        let key = format!(
            "{}-{}",
            Utc::now().timestamp_millis(),
            self.sequence.fetch_add(1, Ordering::Relaxed)
        );
        self.sink.insert(&key, &reading).await?;

        debug!(
            "Stored reading {}: {} at {}",
            key, reading.temperature, reading.timestamp
        );
        Ok(key)
    }
}

/// Longest line a sensor may send before its connection is dropped.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Read newline-delimited readings from one sensor connection until it closes.
///
/// A line that grows past [`MAX_LINE_BYTES`] without a newline ends the
/// connection with `InvalidData`.
pub async fn serve_sensor_connection<S>(
    mut stream: S,
    addr: SocketAddr,
    handler: &IngestHandler,
) -> std::io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; 8192];
    let mut leftover = Vec::new();

    loop {
        match stream.read(&mut buffer).await {
            Ok(0) => {
                info!("Sensor connection from {} closed", addr);
                break;
            }
            Ok(n) => {
                leftover.extend_from_slice(&buffer[..n]);

                while let Some(newline_pos) = leftover.iter().position(|&b| b == b'\n') {
                    let line = &leftover[..newline_pos];

                    if !line.is_empty() {
                        if let Err(e) = handler.handle_message(line).await {
                            error!("Rejected reading from {}: {}", addr, e);
                        }
                    }

                    leftover.drain(..=newline_pos);
                }

                if leftover.len() > MAX_LINE_BYTES {
                    warn!(
                        "Dropping {}: {} bytes without a newline",
                        addr,
                        leftover.len()
                    );
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "line too long",
                    ));
                }
            }
            Err(e) => {
                error!("Error reading from {}: {}", addr, e);
                return Err(e);
            }
        }
    }

    Ok(())
}
