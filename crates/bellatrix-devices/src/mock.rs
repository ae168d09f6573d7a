/*!
 * In-memory channel and port provider for tests and dry runs.
 */
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};

use crate::channel::{wait_closed, ChunkStream, SerialChannel};
use crate::device::{DeviceError, Result};
use crate::discovery::PortProvider;

/// Canned replies for a written instruction: `(port, instruction) -> chunks`
pub type Responder = Arc<dyn Fn(&str, &str) -> Vec<String> + Send + Sync>;

const TERMINATOR: &str = "\r";

/// Wrap a closure as a [`Responder`]
pub fn responder<F>(f: F) -> Responder
where
    F: Fn(&str, &str) -> Vec<String> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A scripted serial channel
pub struct MockChannel {
    port_name: String,
    written: Mutex<Vec<String>>,
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    closed: watch::Sender<bool>,
    responder: Mutex<Option<Responder>>,
    writes_before_failure: Mutex<Option<usize>>,
    write_latency: Mutex<Duration>,
}

impl fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockChannel")
            .field("port_name", &self.port_name)
            .field("open", &self.is_open())
            .field("written", &*lock(&self.written))
            .finish()
    }
}

impl MockChannel {
    /// Create an open channel
    pub fn new<S: Into<String>>(port_name: S) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            port_name: port_name.into(),
            written: Mutex::new(Vec::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            closed,
            responder: Mutex::new(None),
            writes_before_failure: Mutex::new(None),
            write_latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Reply to writes with canned chunks
    pub fn set_responder(&self, responder: Responder) {
        *lock(&self.responder) = Some(responder);
    }

    /// Let `count` more writes succeed, then fail every write
    pub fn fail_writes_after(&self, count: usize) {
        *lock(&self.writes_before_failure) = Some(count);
    }

    /// Fail every write from now on
    pub fn fail_all_writes(&self) {
        self.fail_writes_after(0);
    }

    /// Make every write take this long
    pub fn set_write_latency(&self, latency: Duration) {
        *lock(&self.write_latency) = latency;
    }

    /// Deliver a chunk as if the device sent it
    pub fn inject<S: Into<String>>(&self, chunk: S) {
        let _ = self.tx.send(chunk.into());
    }

    /// Raw bytes written so far, terminators included
    pub fn written(&self) -> Vec<String> {
        lock(&self.written).clone()
    }

    /// Written lines with the terminator stripped
    pub fn instructions(&self) -> Vec<String> {
        lock(&self.written)
            .iter()
            .map(|line| line.strip_suffix(TERMINATOR).unwrap_or(line).to_string())
            .collect()
    }

    fn take_write_permit(&self) -> bool {
        let mut remaining = lock(&self.writes_before_failure);
        match remaining.as_mut() {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }
}

#[async_trait]
impl SerialChannel for MockChannel {
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
        let latency = *lock(&self.write_latency);
        if !latency.is_zero() {
            let mut closed_rx = self.closed.subscribe();
            tokio::select! {
                _ = wait_closed(&mut closed_rx) => {
                    return Err(DeviceError::closed(&self.port_name));
                }
                _ = tokio::time::sleep(latency) => {}
            }
        }
        if !self.take_write_permit() {
            return Err(DeviceError::write(&self.port_name, "simulated write failure"));
        }

        lock(&self.written).push(format!("{}{}", text, TERMINATOR));

        let responder = lock(&self.responder).clone();
        if let Some(responder) = responder {
            for chunk in responder(&self.port_name, text) {
                self.inject(chunk);
            }
        }
        Ok(())
    }

    fn incoming(&self) -> Result<ChunkStream> {
        let rx = lock(&self.rx).take().ok_or_else(|| DeviceError::StreamTaken {
            port: self.port_name.clone(),
        })?;
        let closed_rx = self.closed.subscribe();
        Ok(futures::stream::unfold((rx, closed_rx), |(mut rx, mut closed_rx)| async move {
            tokio::select! {
                biased;
                _ = wait_closed(&mut closed_rx) => None,
                chunk = rx.recv() => chunk.map(|chunk| (chunk, (rx, closed_rx))),
            }
        })
        .boxed())
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        wait_closed(&mut rx).await
    }
}

#[derive(Default)]
struct ProviderState {
    ports: Vec<String>,
    failing: HashSet<String>,
    enumeration_error: Option<String>,
    opened: Vec<Arc<MockChannel>>,
}

/// Port provider handing out [`MockChannel`]s
#[derive(Default)]
pub struct MockPortProvider {
    state: Mutex<ProviderState>,
    responder: Mutex<Option<Responder>>,
}

impl fmt::Debug for MockPortProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MockPortProvider")
            .field("ports", &state.ports)
            .field("failing", &state.failing)
            .field("opened", &state.opened.len())
            .finish()
    }
}

impl MockPortProvider {
    /// Provider exposing the given ports
    pub fn new<I, S>(ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = Self::default();
        provider.set_ports(ports);
        provider
    }

    /// Replace the enumerated port list
    pub fn set_ports<I, S>(&self, ports: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.state).ports = ports.into_iter().map(Into::into).collect();
    }

    /// Make opening this port fail
    pub fn fail_port<S: Into<String>>(&self, port: S) {
        lock(&self.state).failing.insert(port.into());
    }

    /// Make enumeration itself fail
    pub fn fail_enumeration<S: Into<String>>(&self, reason: S) {
        lock(&self.state).enumeration_error = Some(reason.into());
    }

    /// Responder installed on every channel opened from now on
    pub fn set_responder(&self, responder: Responder) {
        *lock(&self.responder) = Some(responder);
    }

    /// Every channel opened so far, in order
    pub fn opened(&self) -> Vec<Arc<MockChannel>> {
        lock(&self.state).opened.clone()
    }

    /// Most recently opened channel for a port
    pub fn channel(&self, port: &str) -> Option<Arc<MockChannel>> {
        lock(&self.state)
            .opened
            .iter()
            .rev()
            .find(|channel| channel.port_name() == port)
            .cloned()
    }
}

#[async_trait]
impl PortProvider for MockPortProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn available_ports(&self) -> Result<Vec<String>> {
        let state = lock(&self.state);
        match &state.enumeration_error {
            Some(reason) => Err(DeviceError::Enumeration(reason.clone())),
            None => Ok(state.ports.clone()),
        }
    }

    async fn open(&self, port: &str) -> Result<Arc<dyn SerialChannel>> {
        let mut state = lock(&self.state);
        if state.failing.contains(port) {
            return Err(DeviceError::connection(port, "port unavailable"));
        }
        let busy = state
            .opened
            .iter()
            .any(|channel| channel.port_name() == port && channel.is_open());
        if busy {
            return Err(DeviceError::connection(port, "port already in use"));
        }

        let channel = Arc::new(MockChannel::new(port));
        if let Some(responder) = lock(&self.responder).clone() {
            channel.set_responder(responder);
        }
        state.opened.push(Arc::clone(&channel));
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_writes_and_responds() {
        let channel = MockChannel::new("COM1");
        channel.set_responder(responder(|_, instruction| {
            vec![format!("{}\r\nOK\r\n", instruction)]
        }));
        let mut incoming = channel.incoming().unwrap();

        channel.write_line("AT").await.unwrap();
        assert_eq!(channel.written(), vec!["AT\r"]);
        assert_eq!(channel.instructions(), vec!["AT"]);
        assert_eq!(incoming.next().await.as_deref(), Some("AT\r\nOK\r\n"));

        assert!(matches!(channel.incoming(), Err(DeviceError::StreamTaken { .. })));
    }

    #[tokio::test]
    async fn test_close_ends_stream_and_rejects_writes() {
        let channel = MockChannel::new("COM1");
        let mut incoming = channel.incoming().unwrap();
        channel.inject("pending");
        channel.close().await;
        channel.close().await;
        assert_eq!(incoming.next().await, None);
        assert!(matches!(
            channel.write_line("AT").await,
            Err(DeviceError::ConnectionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_fail_writes_after() {
        let channel = MockChannel::new("COM1");
        channel.fail_writes_after(1);
        tokio_test::assert_ok!(channel.write_line("AT").await);
        assert!(matches!(
            channel.write_line("AT").await,
            Err(DeviceError::Write { ref port, .. }) if port == "COM1"
        ));
        assert_eq!(channel.instructions(), vec!["AT"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_unblocks_pending_write() {
        let channel = Arc::new(MockChannel::new("COM1"));
        channel.set_write_latency(Duration::from_secs(60));
        let writer = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.write_line("AT").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.close().await;
        assert!(matches!(
            writer.await.unwrap(),
            Err(DeviceError::ConnectionClosed { .. })
        ));
        assert!(channel.written().is_empty());
    }

    #[tokio::test]
    async fn test_provider_enforces_exclusive_open() {
        let provider = MockPortProvider::new(["COM1", "COM2"]);
        provider.fail_port("COM2");
        assert_eq!(provider.available_ports().await.unwrap(), vec!["COM1", "COM2"]);

        let first = provider.open("COM1").await.unwrap();
        assert!(matches!(
            provider.open("COM1").await,
            Err(DeviceError::Connection { .. })
        ));
        first.close().await;
        assert!(provider.open("COM1").await.is_ok());
        assert_eq!(provider.opened().len(), 2);

        assert!(matches!(
            provider.open("COM2").await,
            Err(DeviceError::Connection { ref port, .. }) if port == "COM2"
        ));
    }

    #[tokio::test]
    async fn test_provider_enumeration_failure() {
        let provider = MockPortProvider::new(Vec::<String>::new());
        provider.fail_enumeration("access denied");
        assert!(matches!(
            provider.available_ports().await,
            Err(DeviceError::Enumeration(_))
        ));
    }
}
