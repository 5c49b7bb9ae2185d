use crate::config::{BridgeConfig, ReconnectConfig};
use crate::consts;
use crate::error::ConnectError;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    /// The only state in which lines are forwarded.
    Ready,
    Closing,
}

/// Delay between connection attempts: doubling per consecutive failure,
/// capped, with equal jitter.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    failures: u32,
}

fn jitter() -> f64 {
    // Every RandomState gets fresh keys, so hashing nothing is random enough
    // to spread reconnects.
    let hash = RandomState::new().build_hasher().finish();
    (hash >> 11) as f64 / (1u64 << 53) as f64
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        let initial = Duration::from_millis(config.initial_delay_ms.max(1));
        Self {
            initial,
            max: Duration::from_millis(config.max_delay_ms).max(initial),
            failures: 0,
        }
    }

    /// Upper bound of the next delay.
    pub fn ceiling(&self) -> Duration {
        let factor = 1u32 << self.failures.min(20);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.failures = self.failures.saturating_add(1);
        let half = ceiling / 2;
        half + half.mul_f64(jitter())
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Called when a session ends. Only a session that stayed up for the
    /// longest delay counts as recovery.
    pub fn session_ended(&mut self, uptime: Duration) {
        if uptime >= self.max {
            self.reset();
        }
    }
}

mod telnet {
    pub const IAC: u8 = 255;
    pub const DONT: u8 = 254;
    pub const DO: u8 = 253;
    pub const WONT: u8 = 252;
    pub const WILL: u8 = 251;
    pub const SB: u8 = 250;
    pub const SE: u8 = 240;
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum Telnet {
    #[default]
    Data,
    Iac,
    Negotiate(u8),
    Sub,
    SubIac,
}

/// Strips telnet commands from the inbound stream, refusing every option
/// the bridge offers or asks for.
#[derive(Debug, Default)]
struct TelnetFilter {
    state: Telnet,
}

impl TelnetFilter {
    /// Returns payload bytes; replies to send back are appended to `replies`.
    fn feed(&mut self, input: &[u8], replies: &mut Vec<u8>) -> Vec<u8> {
        let mut data = Vec::with_capacity(input.len());
        for &byte in input {
            self.state = match (self.state, byte) {
                (Telnet::Data, telnet::IAC) => Telnet::Iac,
                (Telnet::Data, _) => {
                    data.push(byte);
                    Telnet::Data
                }
                (Telnet::Iac, telnet::IAC) => {
                    data.push(telnet::IAC);
                    Telnet::Data
                }
                (Telnet::Iac, telnet::DO | telnet::DONT | telnet::WILL | telnet::WONT) => {
                    Telnet::Negotiate(byte)
                }
                (Telnet::Iac, telnet::SB) => Telnet::Sub,
                (Telnet::Iac, _) => Telnet::Data,
                (Telnet::Negotiate(command), option) => {
                    let refusal = match command {
                        telnet::DO => Some(telnet::WONT),
                        telnet::WILL => Some(telnet::DONT),
                        _ => None,
                    };
                    if let Some(refusal) = refusal {
                        replies.extend_from_slice(&[telnet::IAC, refusal, option]);
                    }
                    Telnet::Data
                }
                (Telnet::Sub, telnet::IAC) => Telnet::SubIac,
                (Telnet::Sub, _) => Telnet::Sub,
                (Telnet::SubIac, telnet::SE) => Telnet::Data,
                (Telnet::SubIac, _) => Telnet::Sub,
            };
        }
        data
    }
}

/// Split complete lines off the buffer. Prompts the bridge prints in front
/// of a record are removed, blank lines dropped.
fn drain_lines(text: &mut String, ready_prompt: &str) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(end) = text.find('\n') {
        let raw: String = text.drain(..=end).collect();
        let mut line = raw.trim();
        if !ready_prompt.is_empty() {
            while let Some(rest) = line.strip_prefix(ready_prompt) {
                line = rest;
            }
        }
        let line = line.trim();
        if !line.is_empty() && line != ready_prompt.trim() {
            lines.push(line.to_string());
        }
    }
    lines
}

/// Length of the bytes at the end of `bytes` that start a UTF-8 character
/// not yet complete.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

/// Decoded text received from the bridge, not yet split into lines.
#[derive(Debug, Default)]
struct LineBuffer {
    text: String,
    /// Start of a character split across reads.
    undecoded: Vec<u8>,
    /// Set after an overlong line was dropped, until its end is seen.
    resync: bool,
}

impl LineBuffer {
    fn push(&mut self, data: &[u8]) {
        self.undecoded.extend_from_slice(data);
        let keep = incomplete_tail(&self.undecoded);
        let tail = self.undecoded.split_off(self.undecoded.len() - keep);
        self.text.push_str(&String::from_utf8_lossy(&self.undecoded));
        self.undecoded = tail;
    }

    /// Complete lines received so far. A partial line longer than
    /// `MAX_LINE_LEN` is dropped together with the rest of it.
    fn take_lines(&mut self, ready_prompt: &str) -> Vec<String> {
        if self.resync {
            match self.text.find('\n') {
                Some(end) => {
                    self.text.drain(..=end);
                    self.resync = false;
                }
                None => {
                    self.text.clear();
                    return Vec::new();
                }
            }
        }

        let lines = drain_lines(&mut self.text, ready_prompt);
        if self.text.len() > consts::MAX_LINE_LEN {
            warn!("Dropping {} bytes received without a line end", self.text.len());
            self.text.clear();
            self.resync = true;
        }
        lines
    }
}

/// One live TCP session with the bridge.
#[derive(Debug)]
pub struct Session {
    stream: TcpStream,
    filter: TelnetFilter,
    buffer: LineBuffer,
}

impl Session {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            filter: TelnetFilter::default(),
            buffer: LineBuffer::default(),
        }
    }

    async fn read_more(&mut self) -> Result<(), ConnectError> {
        let mut buf = [0u8; 512];
        let count = match self.stream.read(&mut buf).await {
            Ok(0) => return Err(ConnectError::Closed),
            Ok(count) => count,
            Err(err) => return Err(ConnectError::from_io("bridge", err)),
        };

        let mut replies = Vec::new();
        let data = self.filter.feed(&buf[..count], &mut replies);
        if !replies.is_empty() {
            debug!("Refusing telnet options: {:02x?}", replies);
            self.stream
                .write_all(&replies)
                .await
                .map_err(|err| ConnectError::from_io("bridge", err))?;
        }
        self.buffer.push(&data);
        Ok(())
    }

    /// Wait for `prompt`. If `rejected` shows up first the login failed.
    async fn expect(&mut self, prompt: &str, rejected: Option<&str>) -> Result<(), ConnectError> {
        loop {
            let text = &mut self.buffer.text;
            let found = text.find(prompt);
            let refused = rejected.and_then(|r| text.find(r));
            match (found, refused) {
                (_, Some(r)) if found.map_or(true, |f| r < f) => {
                    debug!("Bridge answered {:?}", text);
                    return Err(ConnectError::BadCredentials);
                }
                (Some(pos), _) => {
                    text.drain(..pos + prompt.len());
                    return Ok(());
                }
                _ => self.read_more().await?,
            }
        }
    }

    async fn send_line(&mut self, line: &str) -> Result<(), ConnectError> {
        let data = format!("{}\r\n", line);
        self.stream
            .write_all(data.as_bytes())
            .await
            .map_err(|err| ConnectError::from_io("bridge", err))
    }
}

pub struct TransportConnection {
    bridge: BridgeConfig,
    backoff: Backoff,
    lines: mpsc::Sender<String>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl TransportConnection {
    pub fn new(
        bridge: BridgeConfig,
        reconnect: &ReconnectConfig,
        lines: mpsc::Sender<String>,
        shutdown: CancellationToken,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let transport = Self {
            bridge,
            backoff: Backoff::new(reconnect),
            lines,
            state,
            shutdown,
        };
        (transport, state_rx)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection {:?} --> {:?}", previous, state);
        }
    }

    async fn open(&self) -> Result<TcpStream, ConnectError> {
        let host = self.bridge.host.as_str();
        let addrs: Vec<_> = lookup_host((host, self.bridge.port))
            .await
            .map_err(|err| ConnectError::UnknownHost {
                host: host.to_string(),
                source: Some(err),
            })?
            .collect();

        let mut last = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    debug!("Connecting to {} failed: {}", addr, err);
                    last = Some(ConnectError::from_io(&addr.to_string(), err));
                }
            }
        }
        Err(last.unwrap_or(ConnectError::UnknownHost {
            host: host.to_string(),
            source: None,
        }))
    }

    async fn establish(&self) -> Result<Session, ConnectError> {
        self.set_state(ConnectionState::Connecting);
        let stream = self.open().await?;
        info!("RCV CONNECT {}:{}", self.bridge.host, self.bridge.port);

        self.set_state(ConnectionState::Authenticating);
        let mut session = Session::new(stream);
        session.expect(&self.bridge.login_prompt, None).await?;
        session.send_line(&self.bridge.username).await?;
        session.expect(&self.bridge.password_prompt, None).await?;
        session.send_line(&self.bridge.password).await?;
        session
            .expect(&self.bridge.ready_prompt, Some(&self.bridge.login_prompt))
            .await?;
        Ok(session)
    }

    /// Connect and log in, bounded by the configured timeout.
    pub async fn connect(&self) -> Result<Session, ConnectError> {
        let limit = self.bridge.connect_timeout();
        match timeout(limit, self.establish()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout {
                stage: match *self.state.borrow() {
                    ConnectionState::Connecting => "connect",
                    _ => "login",
                },
                timeout: limit,
            }),
        }
    }

    /// Forward lines until the session ends.
    async fn serve(&self, session: &mut Session) -> ConnectError {
        loop {
            for line in session.buffer.take_lines(&self.bridge.ready_prompt) {
                debug!("BRIDGE->RX: {}", line);
                if self.lines.send(line).await.is_err() {
                    info!("Line consumer is gone, shutting down transport");
                    self.shutdown.cancel();
                    return ConnectError::Closed;
                }
            }
            if let Err(err) = session.read_more().await {
                return err;
            }
        }
    }

    /// Keep a session up until shutdown. Failures, whether on the first
    /// attempt or after a working session, are retried with backoff.
    pub async fn run(mut self) {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok(mut session) => {
                    info!("RCV READY. PROMPT: {:?}", self.bridge.ready_prompt);
                    attempt = 0;
                    self.set_state(ConnectionState::Ready);
                    let since = Instant::now();
                    let lost = tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        lost = self.serve(&mut session) => lost,
                    };
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    let uptime = since.elapsed();
                    info!("Connection lost after {:?}: {}. {}", uptime, lost, lost.hint());
                    self.backoff.session_ended(uptime);
                }
                Err(err) if attempt == 1 => {
                    error!("Unable to connect to bridge: {}. {}", err, err.hint());
                }
                Err(err) => {
                    warn!("Connection attempt {} failed: {}. {}", attempt, err, err.hint());
                }
            }
            self.set_state(ConnectionState::Disconnected);

            let delay = self.backoff.next_delay();
            info!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Closing);
        info!("Transport finishing");
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn reconnect(initial_delay_ms: u64, max_delay_ms: u64) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_ms,
            max_delay_ms,
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap_and_resets() {
        let mut backoff = Backoff::new(&reconnect(100, 1000));
        let ceilings = [100, 200, 400, 800, 1000, 1000];
        for ceiling in ceilings {
            let ceiling = Duration::from_millis(ceiling);
            let delay = backoff.next_delay();
            assert!(
                delay >= ceiling / 2 && delay <= ceiling,
                "{:?} not within {:?}",
                delay,
                ceiling
            );
        }
        backoff.reset();
        assert_eq!(backoff.ceiling(), Duration::from_millis(100));
    }

    #[test]
    fn backoff_survives_many_failures() {
        let mut backoff = Backoff::new(&reconnect(500, 60_000));
        for _ in 0..100 {
            backoff.next_delay();
        }
        assert_eq!(backoff.ceiling(), Duration::from_secs(60));
    }

    #[test]
    fn short_sessions_do_not_reset_backoff() {
        let mut backoff = Backoff::new(&reconnect(100, 1000));
        for _ in 0..3 {
            backoff.next_delay();
        }
        backoff.session_ended(Duration::from_millis(20));
        assert_eq!(backoff.ceiling(), Duration::from_millis(800));
        backoff.session_ended(Duration::from_secs(1));
        assert_eq!(backoff.ceiling(), Duration::from_millis(100));
    }

    #[test]
    fn telnet_negotiation_is_refused_and_stripped() {
        use super::telnet::*;
        let mut filter = TelnetFilter::default();
        let mut replies = Vec::new();

        let first = filter.feed(&[IAC, DO, 24, b'l', b'o', IAC], &mut replies);
        let second = filter.feed(&[WILL, 1, b'g', IAC, SB, 24, 1, IAC, SE, IAC, IAC], &mut replies);

        assert_eq!(first, b"lo".to_vec());
        assert_eq!(second, vec![b'g', IAC]);
        assert_eq!(replies, vec![IAC, WONT, 24, IAC, DONT, 1]);
    }

    #[test]
    fn lines_are_split_and_prompts_removed() {
        let mut text = "\r\nGNET> ~DEVICE,2,3,3\r\nGNET> GNET> ~DEVICE,2,3,4\r\n~DEV".to_string();
        let lines = drain_lines(&mut text, "GNET> ");
        assert_eq!(lines, vec!["~DEVICE,2,3,3", "~DEVICE,2,3,4"]);
        assert_eq!(text, "~DEV");
    }

    #[test]
    fn characters_split_across_reads_are_kept() {
        let mut buffer = LineBuffer::default();
        let record = "~DEVICE,2,3,3 \u{e9}\r\n".as_bytes();
        let split = record.len() - 3;
        buffer.push(&record[..split]);
        assert_eq!(buffer.take_lines(""), Vec::<String>::new());
        buffer.push(&record[split..]);
        assert_eq!(buffer.take_lines(""), vec!["~DEVICE,2,3,3 \u{e9}"]);
        assert!(buffer.undecoded.is_empty());
    }

    #[test]
    fn overlong_line_is_dropped_until_its_end() {
        let mut buffer = LineBuffer::default();
        let junk = vec![b'x'; consts::MAX_LINE_LEN + 1];
        buffer.push(&junk);
        assert!(buffer.take_lines("GNET> ").is_empty());
        assert!(buffer.text.is_empty());

        buffer.push(b"xxxx");
        assert!(buffer.take_lines("GNET> ").is_empty());
        buffer.push(b"xx\r\n~DEVICE,2,3,4\r\n");
        assert_eq!(buffer.take_lines("GNET> "), vec!["~DEVICE,2,3,4"]);
    }

    /// Plays the bridge side of the login exchange.
    async fn login(stream: &mut TcpStream, accept: bool) -> (String, String) {
        let (read, mut write) = stream.split();
        let mut read = BufReader::new(read);
        let mut username = String::new();
        let mut password = String::new();

        write.write_all(b"login: ").await.unwrap();
        read.read_line(&mut username).await.unwrap();
        write.write_all(b"password: ").await.unwrap();
        read.read_line(&mut password).await.unwrap();
        if accept {
            write.write_all(b"\r\nGNET> ").await.unwrap();
        } else {
            write.write_all(b"bad login\r\nlogin: ").await.unwrap();
        }
        (username.trim().to_string(), password.trim().to_string())
    }

    async fn fake_bridge() -> (TcpListener, BridgeConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut bridge = BridgeConfig::new("127.0.0.1", port, "lutron", "integration");
        bridge.connect_timeout_ms = 2000;
        (listener, bridge)
    }

    fn transport(
        bridge: BridgeConfig,
    ) -> (
        TransportConnection,
        watch::Receiver<ConnectionState>,
        mpsc::Receiver<String>,
        CancellationToken,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let (transport, state) =
            TransportConnection::new(bridge, &reconnect(10, 50), tx, shutdown.clone());
        (transport, state, rx, shutdown)
    }

    async fn next_line(rx: &mut mpsc::Receiver<String>) -> String {
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn logs_in_forwards_lines_and_reconnects_after_close() {
        let (listener, bridge) = fake_bridge().await;
        let server = tokio::spawn(async move {
            let (mut first, _) = listener.accept().await.unwrap();
            let credentials = login(&mut first, true).await;
            first
                .write_all(b"~DEVICE,2,3,3\r\nGNET> ~DEVICE,2,3,4\r\n")
                .await
                .unwrap();
            drop(first);

            let (mut second, _) = listener.accept().await.unwrap();
            login(&mut second, true).await;
            // Telnet chatter in the middle of a record.
            second
                .write_all(&[b'~', b'D', telnet::IAC, telnet::DO, 1, b'E', b'V'])
                .await
                .unwrap();
            second.write_all(b"ICE,5,1,3\r\n").await.unwrap();
            let mut reply = [0u8; 3];
            second.read_exact(&mut reply).await.unwrap();
            (credentials, reply, second)
        });

        let (transport, mut state, mut lines, shutdown) = transport(bridge);
        let runner = transport.spawn();

        assert_eq!(next_line(&mut lines).await, "~DEVICE,2,3,3");
        assert_eq!(next_line(&mut lines).await, "~DEVICE,2,3,4");
        assert_eq!(next_line(&mut lines).await, "~DEVICE,5,1,3");
        assert_eq!(*state.borrow_and_update(), ConnectionState::Ready);

        let (credentials, reply, _held) = server.await.unwrap();
        assert_eq!(credentials, ("lutron".to_string(), "integration".to_string()));
        assert_eq!(reply, [telnet::IAC, telnet::WONT, 1]);

        shutdown.cancel();
        timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn rejected_login_is_bad_credentials() {
        let (listener, bridge) = fake_bridge().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            login(&mut stream, false).await;
            stream
        });

        let (transport, _state, _lines, _shutdown) = transport(bridge);
        assert_matches!(transport.connect().await, Err(ConnectError::BadCredentials));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_classified() {
        let (listener, bridge) = fake_bridge().await;
        drop(listener);

        let (transport, _state, _lines, _shutdown) = transport(bridge);
        assert_matches!(
            transport.connect().await,
            Err(ConnectError::ConnectionRefused { .. })
        );
    }

    #[tokio::test]
    async fn silent_bridge_times_out_during_login() {
        let (listener, mut bridge) = fake_bridge().await;
        bridge.connect_timeout_ms = 100;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            sleep(Duration::from_secs(1)).await;
            drop(stream);
        });

        let (transport, _state, _lines, _shutdown) = transport(bridge);
        assert_matches!(
            transport.connect().await,
            Err(ConnectError::Timeout { stage: "login", .. })
        );
        server.abort();
    }

    #[tokio::test]
    async fn sessions_dropped_after_login_back_off() {
        let (listener, bridge) = fake_bridge().await;
        let server = tokio::spawn(async move {
            let mut accepted = Vec::new();
            for _ in 0..4 {
                let (mut stream, _) = listener.accept().await.unwrap();
                accepted.push(Instant::now());
                login(&mut stream, true).await;
            }
            accepted
        });

        let (tx, _lines) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let (transport, _state) =
            TransportConnection::new(bridge, &reconnect(50, 1000), tx, shutdown.clone());
        let runner = transport.spawn();

        let accepted = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        let gaps: Vec<Duration> = accepted.windows(2).map(|w| w[1] - w[0]).collect();
        // Delays are drawn from [25, 50], [50, 100] and [100, 200] ms.
        assert!(gaps[2] >= Duration::from_millis(100), "{:?}", gaps);
        assert!(gaps[2] > gaps[0], "{:?}", gaps);

        shutdown.cancel();
        timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn first_attempt_failure_is_retried_until_shutdown() {
        let (listener, bridge) = fake_bridge().await;
        let port = bridge.port;
        drop(listener);

        let (transport, mut state, mut lines, shutdown) = transport(bridge);
        let runner = transport.spawn();

        // Let a few attempts fail, then bring the bridge up.
        sleep(Duration::from_millis(100)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            login(&mut stream, true).await;
            stream.write_all(b"~DEVICE,2,2,3\r\n").await.unwrap();
            stream
        });

        assert_eq!(next_line(&mut lines).await, "~DEVICE,2,2,3");
        assert_eq!(*state.borrow_and_update(), ConnectionState::Ready);
        let _held = server.await.unwrap();

        shutdown.cancel();
        timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
    }
}
