use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::actions::key_bytes;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;
const OPT_TTYPE: u8 = 24;
const OPT_NAWS: u8 = 31;

const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;

/// How long the socket may stay silent before we force a close.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Data(Vec<u8>),
    Closed,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
enum ParseState {
    Data,
    Iac,
    Command(u8),
    Sub(Vec<u8>),
    SubIac(Vec<u8>),
}

/// Inline telnet option handling. Feed raw socket bytes in; clean data
/// bytes and any negotiation replies come out. Pure, so the whole policy
/// is testable without a socket.
#[derive(Debug)]
pub struct TelnetParser {
    state: ParseState,
}

impl TelnetParser {
    pub fn new() -> Self {
        TelnetParser { state: ParseState::Data }
    }

    /// Process a chunk. `data` receives forwarded bytes, `reply` receives
    /// bytes that must be written back to the peer.
    pub fn push(&mut self, input: &[u8], data: &mut Vec<u8>, reply: &mut Vec<u8>) {
        for &byte in input {
            self.state = match std::mem::replace(&mut self.state, ParseState::Data) {
                ParseState::Data => {
                    if byte == IAC {
                        ParseState::Iac
                    } else {
                        data.push(byte);
                        ParseState::Data
                    }
                }
                ParseState::Iac => match byte {
                    IAC => {
                        // escaped literal 0xFF
                        data.push(IAC);
                        ParseState::Data
                    }
                    DO | DONT | WILL | WONT => ParseState::Command(byte),
                    SB => ParseState::Sub(Vec::new()),
                    _ => ParseState::Data, // NOP, GA, etc.
                },
                ParseState::Command(cmd) => {
                    self.respond(cmd, byte, reply);
                    ParseState::Data
                }
                ParseState::Sub(mut buf) => {
                    if byte == IAC {
                        ParseState::SubIac(buf)
                    } else {
                        if buf.len() < 128 {
                            buf.push(byte);
                        }
                        ParseState::Sub(buf)
                    }
                }
                ParseState::SubIac(mut buf) => {
                    if byte == SE {
                        self.subnegotiate(&buf, reply);
                        ParseState::Data
                    } else {
                        // doubled IAC inside subnegotiation
                        buf.push(byte);
                        ParseState::Sub(buf)
                    }
                }
            };
        }
    }

    fn respond(&self, cmd: u8, option: u8, reply: &mut Vec<u8>) {
        match cmd {
            DO => match option {
                OPT_TTYPE | OPT_SGA => reply.extend_from_slice(&[IAC, WILL, option]),
                OPT_NAWS => {
                    reply.extend_from_slice(&[IAC, WILL, OPT_NAWS]);
                    // cols=80, rows=24, big-endian
                    reply.extend_from_slice(&[IAC, SB, OPT_NAWS, 0, 80, 0, 24, IAC, SE]);
                }
                _ => reply.extend_from_slice(&[IAC, WONT, option]),
            },
            WILL => match option {
                OPT_ECHO | OPT_SGA => reply.extend_from_slice(&[IAC, DO, option]),
                _ => reply.extend_from_slice(&[IAC, DONT, option]),
            },
            WONT => reply.extend_from_slice(&[IAC, DONT, option]),
            DONT => reply.extend_from_slice(&[IAC, WONT, option]),
            _ => {}
        }
    }

    fn subnegotiate(&self, buf: &[u8], reply: &mut Vec<u8>) {
        if buf.first() == Some(&OPT_TTYPE) && buf.get(1) == Some(&TTYPE_SEND) {
            reply.extend_from_slice(&[IAC, SB, OPT_TTYPE, TTYPE_IS]);
            reply.extend_from_slice(b"ANSI");
            reply.extend_from_slice(&[IAC, SE]);
        }
    }
}

impl Default for TelnetParser {
    fn default() -> Self {
        Self::new()
    }
}

/// One TCP connection to a board. A background task reads the socket,
/// handles option negotiation inline, and forwards clean data bytes as
/// events. Writes go through `send`/`send_key`.
pub struct BoardConnection {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl BoardConnection {
    pub async fn connect(
        host: &str,
        port: u16,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .with_context(|| format!("Timed out connecting to {}", addr))?
            .with_context(|| format!("Failed to connect to {}", addr))?;
        stream.set_nodelay(true).ok();

        let (mut read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));
        let connected = Arc::new(AtomicBool::new(true));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let reader_writer = writer.clone();
        let reader_connected = connected.clone();
        let reader = tokio::spawn(async move {
            let mut parser = TelnetParser::new();
            let mut buf = [0u8; 4096];

            loop {
                let read = tokio::time::timeout(INACTIVITY_TIMEOUT, read_half.read(&mut buf)).await;
                match read {
                    Err(_) => {
                        warn!("socket idle past {:?}, forcing close", INACTIVITY_TIMEOUT);
                        break;
                    }
                    Ok(Ok(0)) => {
                        debug!("board closed the connection");
                        break;
                    }
                    Ok(Ok(n)) => {
                        let mut data = Vec::new();
                        let mut reply = Vec::new();
                        parser.push(&buf[..n], &mut data, &mut reply);

                        if !reply.is_empty() {
                            let mut w = reader_writer.lock().await;
                            if w.write_all(&reply).await.is_err() {
                                break;
                            }
                        }
                        if !data.is_empty() && event_tx.send(ConnectionEvent::Data(data)).is_err() {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        let _ = event_tx.send(ConnectionEvent::Error(e.to_string()));
                        break;
                    }
                }
            }

            reader_connected.store(false, Ordering::SeqCst);
            let _ = event_tx.send(ConnectionEvent::Closed);
        });

        Ok((
            BoardConnection { writer, connected, reader },
            event_rx,
        ))
    }

    /// Write raw bytes. Literal 0xFF is escaped as a doubled IAC on the way
    /// out, mirroring the read side.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            anyhow::bail!("Connection is closed");
        }

        let mut escaped = Vec::with_capacity(bytes.len());
        for &b in bytes {
            escaped.push(b);
            if b == IAC {
                escaped.push(IAC);
            }
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(&escaped).await.context("Failed to write to board")?;
        writer.flush().await.context("Failed to flush to board")?;
        Ok(())
    }

    pub async fn send_key(&self, key: &str) -> Result<()> {
        self.send(&key_bytes(key)).await
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut parser = TelnetParser::new();
        let mut data = Vec::new();
        let mut reply = Vec::new();
        parser.push(input, &mut data, &mut reply);
        (data, reply)
    }

    #[test]
    fn test_negotiation_ttype_naws() {
        // DO TERMINAL-TYPE, DO NAWS, then "Hi"
        let (data, reply) = run(&[0xFF, 0xFD, 0x18, 0xFF, 0xFD, 0x1F, 0x48, 0x69]);
        assert_eq!(
            reply,
            vec![
                0xFF, 0xFB, 0x18, // WILL TTYPE
                0xFF, 0xFB, 0x1F, // WILL NAWS
                0xFF, 0xFA, 0x1F, 0x00, 0x50, 0x00, 0x18, 0xFF, 0xF0, // SB NAWS 80x24
            ]
        );
        assert_eq!(data, b"Hi");
    }

    #[test]
    fn test_plain_stream_transparent() {
        let input: Vec<u8> = (0..=254).collect(); // everything but IAC
        let (data, reply) = run(&input);
        assert_eq!(data, input);
        assert!(reply.is_empty());
    }

    #[test]
    fn test_doubled_iac_yields_single_ff() {
        let (data, reply) = run(&[0x41, 0xFF, 0xFF, 0x42, 0xFF, 0xFF]);
        assert_eq!(data, vec![0x41, 0xFF, 0x42, 0xFF]);
        assert!(reply.is_empty());
    }

    #[test]
    fn test_refuses_unknown_options() {
        // DO LINEMODE(34) -> WONT, WILL STATUS(5) -> DONT
        let (_, reply) = run(&[0xFF, 0xFD, 34, 0xFF, 0xFB, 5]);
        assert_eq!(reply, vec![0xFF, 0xFC, 34, 0xFF, 0xFE, 5]);
    }

    #[test]
    fn test_wont_dont_mirrored() {
        let (_, reply) = run(&[0xFF, 0xFC, 1, 0xFF, 0xFE, 3]);
        assert_eq!(reply, vec![0xFF, 0xFE, 1, 0xFF, 0xFC, 3]);
    }

    #[test]
    fn test_will_echo_accepted() {
        let (_, reply) = run(&[0xFF, 0xFB, 1]);
        assert_eq!(reply, vec![0xFF, 0xFD, 1]);
    }

    #[test]
    fn test_ttype_send_answers_ansi() {
        // IAC SB TTYPE SEND IAC SE
        let (_, reply) = run(&[0xFF, 0xFA, 0x18, 0x01, 0xFF, 0xF0]);
        let mut expected = vec![0xFF, 0xFA, 0x18, 0x00];
        expected.extend_from_slice(b"ANSI");
        expected.extend_from_slice(&[0xFF, 0xF0]);
        assert_eq!(reply, expected);
    }

    #[test]
    fn test_negotiation_split_across_chunks() {
        let mut parser = TelnetParser::new();
        let mut data = Vec::new();
        let mut reply = Vec::new();
        parser.push(&[0xFF], &mut data, &mut reply);
        parser.push(&[0xFD], &mut data, &mut reply);
        parser.push(&[0x18], &mut data, &mut reply);
        assert_eq!(reply, vec![0xFF, 0xFB, 0x18]);
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_connect_and_receive() {
        use tokio::io::AsyncReadExt as _;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(&[0xFF, 0xFD, 0x1F, b'o', b'k'])
                .await
                .unwrap();
            let mut reply = vec![0u8; 64];
            let n = socket.read(&mut reply).await.unwrap();
            reply.truncate(n);
            reply
        });

        let (conn, mut events) = BoardConnection::connect("127.0.0.1", addr.port())
            .await
            .unwrap();
        assert!(conn.is_connected());

        match events.recv().await {
            Some(ConnectionEvent::Data(data)) => assert_eq!(data, b"ok"),
            other => panic!("expected data event, got {:?}", other),
        }

        let reply = server.await.unwrap();
        assert_eq!(&reply[..3], &[0xFF, 0xFB, 0x1F]);

        conn.disconnect().await;
        assert!(!conn.is_connected());
    }
}
