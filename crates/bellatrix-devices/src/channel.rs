/*!
 * Serial channel abstraction.
 *
 * A channel is an exclusively-owned, line-oriented text transport to one
 * port. Writes append the configured line terminator; reads surface as a
 * stream of raw text chunks that ends when the channel closes.
 */
use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::watch;

use crate::device::Result;

/// Stream of raw text chunks received from a port
pub type ChunkStream = BoxStream<'static, String>;

/// An open, exclusively owned serial channel
#[async_trait]
pub trait SerialChannel: Send + Sync + Debug {
    /// Port name this channel is bound to
    fn port_name(&self) -> &str;

    /// Whether the channel is still open
    fn is_open(&self) -> bool;

    /// Write a line of text followed by the line terminator
    ///
    /// Fails with `ConnectionClosed` if the channel closes before or while
    /// the write is pending.
    async fn write_line(&self, text: &str) -> Result<()>;

    /// Take the incoming chunk stream; only one consumer per channel
    fn incoming(&self) -> Result<ChunkStream>;

    /// Close the channel and release the port; idempotent
    async fn close(&self);

    /// Resolves once the channel has been closed
    async fn closed(&self);
}

/// Wait until the watched flag turns true or its sender goes away
pub(crate) async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(feature = "serial")]
pub use self::serial::SerialPortChannel;

#[cfg(feature = "serial")]
mod serial {
    use std::io::ErrorKind;
    use std::sync::{Arc, Mutex as StdMutex};

    use async_trait::async_trait;
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
    use tokio::sync::{mpsc, watch, Mutex};
    use tokio::task::JoinHandle;
    use tokio_serial::{SerialPortBuilderExt, SerialStream};
    use tracing::{debug, trace, warn};

    use bellatrix_core::config::SerialConfig;

    use super::{wait_closed, ChunkStream, SerialChannel};
    use crate::device::{DeviceError, Result};

    const CHUNK_QUEUE_DEPTH: usize = 64;

    /// Channel backed by a native serial port
    #[derive(Debug)]
    pub struct SerialPortChannel {
        port_name: String,
        terminator: String,
        writer: Mutex<Option<WriteHalf<SerialStream>>>,
        incoming: StdMutex<Option<mpsc::Receiver<String>>>,
        reader: StdMutex<Option<JoinHandle<()>>>,
        closed: Arc<watch::Sender<bool>>,
    }

    impl SerialPortChannel {
        /// Open a port with 8N1 framing and no flow control
        ///
        /// Must be called from within a Tokio runtime.
        pub fn open(port_name: &str, config: &SerialConfig) -> Result<Self> {
            let stream = tokio_serial::new(port_name, config.baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(|e| DeviceError::connection(port_name, e))?;

            let (read_half, write_half) = tokio::io::split(stream);
            let (tx, rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
            let (closed, _) = watch::channel(false);
            let closed = Arc::new(closed);

            let reader = tokio::spawn(read_loop(
                port_name.to_string(),
                read_half,
                config.read_buffer_size.max(1),
                tx,
                Arc::clone(&closed),
            ));

            debug!(port = port_name, baud = config.baud_rate, "Opened serial port");

            Ok(Self {
                port_name: port_name.to_string(),
                terminator: config.line_terminator.clone(),
                writer: Mutex::new(Some(write_half)),
                incoming: StdMutex::new(Some(rx)),
                reader: StdMutex::new(Some(reader)),
                closed,
            })
        }
    }

    async fn read_loop(
        port_name: String,
        mut reader: ReadHalf<SerialStream>,
        buffer_size: usize,
        tx: mpsc::Sender<String>,
        closed: Arc<watch::Sender<bool>>,
    ) {
        let mut buf = vec![0u8; buffer_size];
        let mut closed_rx = closed.subscribe();
        loop {
            tokio::select! {
                _ = wait_closed(&mut closed_rx) => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!(port = %port_name, "Serial port reached end of stream");
                        break;
                    }
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        trace!(port = %port_name, bytes = n, "Received chunk");
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                    Err(e) => {
                        warn!(port = %port_name, error = %e, "Serial read failed");
                        break;
                    }
                },
            }
        }
        closed.send_replace(true);
    }

    #[async_trait]
    impl SerialChannel for SerialPortChannel {
        fn port_name(&self) -> &str {
            &self.port_name
        }

        fn is_open(&self) -> bool {
            !*self.closed.borrow()
        }

        async fn write_line(&self, text: &str) -> Result<()> {
            if !self.is_open() {
                return Err(DeviceError::closed(&self.port_name));
            }
            let mut closed_rx = self.closed.subscribe();
            let mut guard = self.writer.lock().await;
            let writer = guard
                .as_mut()
                .ok_or_else(|| DeviceError::closed(&self.port_name))?;
            let payload = format!("{}{}", text, self.terminator);

            tokio::select! {
                _ = wait_closed(&mut closed_rx) => Err(DeviceError::closed(&self.port_name)),
                written = async {
                    writer.write_all(payload.as_bytes()).await?;
                    writer.flush().await
                } => {
                    written.map_err(|e| DeviceError::write(&self.port_name, e))?;
                    trace!(port = %self.port_name, text, "Wrote line");
                    Ok(())
                }
            }
        }

        fn incoming(&self) -> Result<ChunkStream> {
            let rx = match self.incoming.lock() {
                Ok(mut slot) => slot.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            let rx = rx.ok_or_else(|| DeviceError::StreamTaken {
                port: self.port_name.clone(),
            })?;
            Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            })
            .boxed())
        }

        async fn close(&self) {
            let was_open = !self.closed.send_replace(true);
            self.writer.lock().await.take();
            let reader = match self.reader.lock() {
                Ok(mut slot) => slot.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(reader) = reader {
                if let Err(e) = reader.await {
                    warn!(port = %self.port_name, error = %e, "Serial reader task failed");
                }
            }
            if was_open {
                debug!(port = %self.port_name, "Closed serial port");
            }
        }

        async fn closed(&self) {
            let mut rx = self.closed.subscribe();
            wait_closed(&mut rx).await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_wait_closed_returns_when_flag_set() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_closed(&mut rx).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_closed_returns_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        wait_closed(&mut rx).await;
    }

    #[cfg(feature = "serial")]
    #[tokio::test]
    async fn test_open_missing_port_is_connection_error() {
        let config = bellatrix_core::config::SerialConfig::default();
        let result = SerialPortChannel::open("/dev/bellatrix-does-not-exist", &config);
        assert!(matches!(
            result,
            Err(crate::device::DeviceError::Connection { ref port, .. })
                if port == "/dev/bellatrix-does-not-exist"
        ));
    }
}
