//! Line-oriented transport shared by the IMAP and POP3 sessions.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConnection, StreamOwned};
use rustls_pki_types::ServerName;

use crate::error::ConnectionError;

/// A TCP connection, optionally wrapped in TLS.
pub enum MailStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for MailStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for MailStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

/// Connect to `host:port`, with implicit TLS when `tls` is set.
pub fn open_stream(
    host: &str,
    port: u16,
    tls: bool,
    timeout: Duration,
) -> Result<MailStream, ConnectionError> {
    let connect_err = |reason: String| ConnectionError::Connect {
        host: host.to_string(),
        port,
        reason,
    };

    let tcp = connect_tcp(host, port, timeout).map_err(|e| connect_err(e.to_string()))?;
    tcp.set_read_timeout(Some(timeout))?;
    tcp.set_write_timeout(Some(timeout))?;

    if !tls {
        return Ok(MailStream::Plain(tcp));
    }

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ConnectionError::Tls(format!("invalid server name {host}: {e}")))?;
    let conn = ClientConnection::new(tls_config, server_name)
        .map_err(|e| ConnectionError::Tls(e.to_string()))?;
    Ok(MailStream::Tls(Box::new(StreamOwned::new(conn, tcp))))
}

/// Try every resolved address in turn, each bounded by `timeout`.
fn connect_tcp(host: &str, port: u16, timeout: Duration) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}

/// Largest literal a server may announce.
pub const MAX_LITERAL: usize = 256 * 1024 * 1024;

/// Buffered reader over a duplex stream; writes go straight through.
pub struct Wire<S: Read + Write> {
    inner: BufReader<S>,
    max_literal: usize,
}

impl<S: Read + Write> Wire<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: BufReader::new(stream),
            max_literal: MAX_LITERAL,
        }
    }

    pub fn with_max_literal(mut self, max_literal: usize) -> Self {
        self.max_literal = max_literal;
        self
    }

    /// Next line without its line terminator.
    pub fn read_line(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let mut buf = Vec::new();
        if self.inner.read_until(b'\n', &mut buf)? == 0 {
            return Err(ConnectionError::Closed);
        }
        if buf.ends_with(b"\n") {
            buf.pop();
        }
        if buf.ends_with(b"\r") {
            buf.pop();
        }
        Ok(buf)
    }

    /// Next line decoded lossily.
    pub fn read_text_line(&mut self) -> Result<String, ConnectionError> {
        Ok(String::from_utf8_lossy(&self.read_line()?).into_owned())
    }

    /// Exactly `len` bytes. Lengths come from the server, so they are
    /// checked against the literal limit before anything is read.
    pub fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, ConnectionError> {
        if len > self.max_literal {
            return Err(ConnectionError::Protocol {
                command: "literal".to_string(),
                reason: format!("{len} bytes exceeds the {} byte limit", self.max_literal),
            });
        }
        let mut buf = Vec::new();
        (&mut self.inner).take(len as u64).read_to_end(&mut buf)?;
        if buf.len() < len {
            return Err(ConnectionError::Closed);
        }
        Ok(buf)
    }

    /// Send `line` terminated by CRLF.
    pub fn write_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        let stream = self.inner.get_mut();
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\r\n")?;
        stream.flush()?;
        Ok(())
    }
}

/// In-memory duplex stream replaying a canned server transcript.
#[cfg(test)]
pub(crate) struct Scripted {
    input: std::io::Cursor<Vec<u8>>,
    pub(crate) output: Arc<std::sync::Mutex<Vec<u8>>>,
}

#[cfg(test)]
impl Scripted {
    pub(crate) fn new(server: &str) -> Self {
        Self {
            input: std::io::Cursor::new(server.as_bytes().to_vec()),
            output: Arc::default(),
        }
    }

    /// Everything the client wrote so far.
    pub(crate) fn sent(output: &Arc<std::sync::Mutex<Vec<u8>>>) -> String {
        String::from_utf8_lossy(&output.lock().unwrap()).into_owned()
    }
}

#[cfg(test)]
impl Read for Scripted {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.input.read(buf)
    }
}

#[cfg(test)]
impl Write for Scripted {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.output.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
