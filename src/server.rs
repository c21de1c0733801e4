/// TCP server publishing a table to every connected client.
///
/// Each accepted connection gets a [`ClientSession`] and its own table from
/// the factory passed to [`TcpServer::serve`]: either a shared table or a
/// projection built for that client. A [`TableEncoder`] then streams the
/// table's replay and live updates to the socket.
///
/// Tables are single-threaded (`Rc<RefCell<_>>`), so the server runs on the
/// current thread and must be driven inside a [`tokio::task::LocalSet`].
/// A client that disconnects or fails tears down only its own session.
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::table::ReactiveTable;
use crate::wire::{FieldMapping, TableEncoder};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// One connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
}

impl ClientSession {
    pub fn new(remote_addr: SocketAddr) -> Self {
        ClientSession {
            id: Uuid::new_v4(),
            remote_addr,
        }
    }
}

impl fmt::Display for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.remote_addr, self.id)
    }
}

/// Server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// JSON field mapping file; without one, columns are numbered from 1 in
    /// schema order
    #[serde(default)]
    pub field_map: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 9400,
            field_map: None,
        }
    }
}

impl ServerConfig {
    /// Read `HOST`, `PORT` and `FIELD_MAP`, falling back to the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = ServerConfig::default();
        let port = match lookup("PORT") {
            Some(port) => port
                .parse()
                .map_err(|_| Error::Config(format!("PORT must be a number, got '{}'", port)))?,
            None => defaults.port,
        };
        Ok(ServerConfig {
            host: lookup("HOST").unwrap_or(defaults.host),
            port,
            field_map: lookup("FIELD_MAP").map(PathBuf::from),
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Load the configured field mapping, if any.
    pub fn load_mapping(&self) -> Result<Option<FieldMapping>> {
        self.field_map.as_ref().map(FieldMapping::from_file).transpose()
    }
}

/// Encoder output: each flushed frame becomes one message for the socket task.
struct ChannelWriter {
    pending: Vec<u8>,
    tx: UnboundedSender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.tx
            .send(std::mem::take(&mut self.pending))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client session closed"))
    }
}

/// Publishes tables to TCP clients.
pub struct TcpServer {
    config: ServerConfig,
    mapping: Option<FieldMapping>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl TcpServer {
    pub fn new(config: ServerConfig, diagnostics: Arc<dyn Diagnostics>) -> Self {
        TcpServer {
            config,
            mapping: None,
            diagnostics,
        }
    }

    /// Use one field mapping for every client instead of numbering each
    /// table's columns.
    pub fn with_mapping(mut self, mapping: FieldMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.config.address()).await?;
        if let Ok(addr) = listener.local_addr() {
            self.diagnostics.info("server", &format!("listening on {}", addr));
        }
        Ok(listener)
    }

    /// Accept clients until `shutdown` completes, then close every session.
    ///
    /// Must run inside a `LocalSet`.
    pub async fn serve<F, S>(self, listener: TcpListener, factory: F, shutdown: S) -> Result<()>
    where
        F: Fn(&ClientSession) -> Result<Rc<RefCell<dyn ReactiveTable>>> + 'static,
        S: Future<Output = ()>,
    {
        let mut sessions: Vec<JoinHandle<()>> = Vec::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            self.diagnostics.error("server", &Error::from(err));
                            continue;
                        }
                    };
                    let session = ClientSession::new(addr);
                    self.diagnostics.client_connected(&session.to_string());
                    sessions.retain(|handle| !handle.is_finished());
                    match self.open(&session, &factory) {
                        Ok((table, encoder, frames)) => {
                            let diagnostics = self.diagnostics.clone();
                            sessions.push(tokio::task::spawn_local(async move {
                                let result = run_session(stream, frames, encoder, table).await;
                                diagnostics.client_disconnected(&session.to_string(), result.err().as_ref());
                            }));
                        }
                        Err(err) => self.diagnostics.client_disconnected(&session.to_string(), Some(&err)),
                    }
                }
            }
        }

        self.diagnostics
            .info("server", &format!("shutting down {} sessions", sessions.len()));
        for session in sessions {
            session.abort();
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn open<F>(
        &self,
        session: &ClientSession,
        factory: &F,
    ) -> Result<(Rc<RefCell<dyn ReactiveTable>>, TableEncoder, UnboundedReceiver<Vec<u8>>)>
    where
        F: Fn(&ClientSession) -> Result<Rc<RefCell<dyn ReactiveTable>>>,
    {
        let table = factory(session)?;
        let mapping = match &self.mapping {
            Some(mapping) => mapping.clone(),
            None => FieldMapping::for_schema(table.borrow().schema()),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = ChannelWriter {
            pending: Vec::new(),
            tx,
        };
        let encoder = TableEncoder::setup(writer, &table, mapping, self.diagnostics.clone())?;
        Ok((table, encoder, rx))
    }
}

/// Copy frames to the socket until either side goes away.
///
/// `table` is held so per-client projections live as long as the session.
async fn run_session(
    stream: TcpStream,
    mut frames: UnboundedReceiver<Vec<u8>>,
    mut encoder: TableEncoder,
    table: Rc<RefCell<dyn ReactiveTable>>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut inbound = [0u8; 1024];

    let result = loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(bytes) => {
                    if let Err(err) = writer.write_all(&bytes).await {
                        break Err(err.into());
                    }
                }
                // The encoder dropped its writer after a failure
                None => break encoder.take_error().map_or(Ok(()), Err),
            },
            read = reader.read(&mut inbound) => match read {
                Ok(0) => break Ok(()),
                // Clients only listen; anything they send is ignored
                Ok(_) => {}
                Err(err) => break Err(err.into()),
            },
        }
    };

    encoder.dispose();
    drop(table);
    result
}
