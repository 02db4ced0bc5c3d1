//! Transport used by the session: one query at a time during provisioning,
//! then a CopyBoth replication stream.
//!
//! [`PgConnection`] speaks the frontend/backend protocol directly through
//! `postgres-protocol`, because the replication sub-protocol needs CopyBoth
//! which `tokio-postgres` does not expose. TLS is not handled here.

use bytes::{Buf, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::{self, sasl};
use postgres_protocol::message::backend::{self, Message};
use postgres_protocol::message::frontend;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use crate::{Error, Result};

/// One row of a simple-query result, every value in text form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRow {
    columns: Vec<String>,
    values: Vec<Option<String>>,
}

impl QueryRow {
    pub fn new(columns: Vec<String>, values: Vec<Option<String>>) -> Self {
        Self { columns, values }
    }

    /// Value of the named column; `None` when absent or SQL NULL.
    pub fn get(&self, column: &str) -> Option<&str> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.values.get(index)?.as_deref()
    }
}

/// What the session needs from a database connection.
///
/// Implementations own the socket, authentication and TLS. Calls never
/// overlap: the session waits for each result before issuing the next.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Runs one query (or replication command) and returns its rows.
    async fn simple_query(&mut self, query: &str) -> Result<Vec<QueryRow>>;

    /// Issues `START_REPLICATION` and switches the connection to streaming.
    async fn start_replication(&mut self, query: &str) -> Result<()>;

    /// Next CopyData payload from the server, or `None` once the server
    /// has ended the stream.
    async fn recv_frame(&mut self) -> Result<Option<Bytes>>;

    /// Sends one CopyData payload to the server.
    async fn send_frame(&mut self, frame: Bytes) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// A replication-mode connection (`replication=database`).
pub struct PgConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    streaming: bool,
}

/// CopyBothResponse is the one backend message `backend::Message` has no
/// variant for, so it is split off before parsing.
const COPY_BOTH_RESPONSE_TAG: u8 = b'W';

enum Incoming {
    Message(Message),
    CopyBothResponse,
}

impl PgConnection {
    /// Connects, authenticates and waits until the server is ready for queries.
    pub async fn connect(config: &tokio_postgres::Config) -> Result<Self> {
        let host = config
            .get_hosts()
            .iter()
            .find_map(|host| match host {
                tokio_postgres::config::Host::Tcp(name) => Some(name.clone()),
                #[allow(unreachable_patterns)]
                _ => None,
            })
            .ok_or_else(|| Error::Config("a TCP host is required".to_string()))?;
        let port = config.get_ports().first().copied().unwrap_or(5432);
        let user = config
            .get_user()
            .ok_or_else(|| Error::Config("a user name is required".to_string()))?
            .to_string();
        let database = config.get_dbname().unwrap_or(user.as_str()).to_string();
        let password = config.get_password().map(|p| p.to_vec());
        let timeout = config.get_connect_timeout().copied().unwrap_or(Duration::from_secs(30));

        info!(%host, port, %database, "Creating replication connection to PostgreSQL");

        let stream = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| Error::Timeout {
                message: format!("connecting to {}:{}", host, port),
            })??;
        stream.set_nodelay(true)?;

        let mut connection = Self {
            stream,
            read_buf: BytesMut::with_capacity(8192),
            write_buf: BytesMut::with_capacity(1024),
            streaming: false,
        };

        let mut params = vec![
            ("user", user.as_str()),
            ("database", database.as_str()),
            ("replication", "database"),
        ];
        if let Some(application_name) = config.get_application_name() {
            params.push(("application_name", application_name));
        }
        frontend::startup_message(params, &mut connection.write_buf)?;
        connection.flush().await?;

        tokio::time::timeout(
            timeout,
            connection.authenticate(user.as_bytes(), password.as_deref()),
        )
        .await
        .map_err(|_| Error::Timeout {
            message: "authentication".to_string(),
        })??;

        info!("Successfully connected to PostgreSQL in replication mode");
        Ok(connection)
    }

    async fn authenticate(&mut self, user: &[u8], password: Option<&[u8]>) -> Result<()> {
        let mut scram: Option<sasl::ScramSha256> = None;

        loop {
            match self.read_message().await? {
                Message::AuthenticationOk => debug!("Authentication accepted"),
                Message::AuthenticationCleartextPassword => {
                    let password = require_password(password)?;
                    frontend::password_message(password, &mut self.write_buf)?;
                    self.flush().await?;
                }
                Message::AuthenticationMd5Password(body) => {
                    let password = require_password(password)?;
                    let hash = authentication::md5_hash(user, password, body.salt());
                    frontend::password_message(hash.as_bytes(), &mut self.write_buf)?;
                    self.flush().await?;
                }
                Message::AuthenticationSasl(body) => {
                    let password = require_password(password)?;
                    let offers_scram = body
                        .mechanisms()
                        .any(|mechanism| Ok(mechanism == sasl::SCRAM_SHA_256))?;
                    if !offers_scram {
                        return Err(Error::Authentication(
                            "server offers no supported SASL mechanism".to_string(),
                        ));
                    }
                    let client =
                        sasl::ScramSha256::new(password, sasl::ChannelBinding::unsupported());
                    frontend::sasl_initial_response(
                        sasl::SCRAM_SHA_256,
                        client.message(),
                        &mut self.write_buf,
                    )?;
                    self.flush().await?;
                    scram = Some(client);
                }
                Message::AuthenticationSaslContinue(body) => {
                    let client = scram.as_mut().ok_or_else(|| {
                        Error::Protocol("SASL continue without SASL start".to_string())
                    })?;
                    client
                        .update(body.data())
                        .map_err(|e| Error::Authentication(e.to_string()))?;
                    frontend::sasl_response(client.message(), &mut self.write_buf)?;
                    self.flush().await?;
                }
                Message::AuthenticationSaslFinal(body) => {
                    let client = scram.as_mut().ok_or_else(|| {
                        Error::Protocol("SASL final without SASL start".to_string())
                    })?;
                    client
                        .finish(body.data())
                        .map_err(|e| Error::Authentication(e.to_string()))?;
                }
                Message::ErrorResponse(body) => {
                    let (code, text) = error_fields(&body)?;
                    return Err(Error::Authentication(format!("[{}] {}", code, text)));
                }
                Message::ReadyForQuery(_) => return Ok(()),
                Message::ParameterStatus(_)
                | Message::BackendKeyData(_)
                | Message::NoticeResponse(_) => {}
                Message::AuthenticationGss
                | Message::AuthenticationKerberosV5
                | Message::AuthenticationScmCredential
                | Message::AuthenticationSspi
                | Message::AuthenticationGssContinue(_) => {
                    return Err(Error::Authentication(
                        "unsupported authentication method".to_string(),
                    ));
                }
                _ => {
                    return Err(Error::Protocol("unexpected message during startup".to_string()));
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        let out = self.write_buf.split();
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads one backend message outside of the CopyBoth handshake.
    async fn read_message(&mut self) -> Result<Message> {
        match self.read_incoming().await? {
            Incoming::Message(message) => Ok(message),
            Incoming::CopyBothResponse => {
                Err(Error::Protocol("unexpected CopyBothResponse".to_string()))
            }
        }
    }

    /// Reads one complete backend message. Cancel safe: partial input stays
    /// in `read_buf`.
    async fn read_incoming(&mut self) -> Result<Incoming> {
        loop {
            if let Some(incoming) = next_incoming(&mut self.read_buf)? {
                return Ok(incoming);
            }
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Err(Error::Connection("server closed the connection".to_string()));
            }
        }
    }
}

/// Splits the next complete message off `buf`, if there is one.
fn next_incoming(buf: &mut BytesMut) -> Result<Option<Incoming>> {
    let Some(header) = backend::Header::parse(&buf[..])? else {
        return Ok(None);
    };
    if header.tag() != COPY_BOTH_RESPONSE_TAG {
        return Ok(Message::parse(buf)?.map(Incoming::Message));
    }
    let total = 1 + header.len() as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }
    buf.advance(total);
    Ok(Some(Incoming::CopyBothResponse))
}

impl Transport for PgConnection {
    async fn simple_query(&mut self, query: &str) -> Result<Vec<QueryRow>> {
        debug!(%query, "Sending query");
        frontend::query(query, &mut self.write_buf)?;
        self.flush().await?;

        let mut columns = Vec::new();
        let mut rows = Vec::new();
        let mut failure = None;

        loop {
            match self.read_message().await? {
                Message::RowDescription(body) => columns = column_names(&body)?,
                Message::DataRow(body) => {
                    rows.push(QueryRow::new(columns.clone(), row_values(&body)?))
                }
                Message::ErrorResponse(body) => failure = Some(error_fields(&body)?),
                Message::ReadyForQuery(_) => break,
                Message::CommandComplete(_)
                | Message::EmptyQueryResponse
                | Message::NoticeResponse(_)
                | Message::ParameterStatus(_) => {}
                _ => {
                    return Err(Error::Protocol("unexpected message in query response".to_string()));
                }
            }
        }

        match failure {
            Some((code, message)) => Err(Error::Query { code, message }),
            None => Ok(rows),
        }
    }

    async fn start_replication(&mut self, query: &str) -> Result<()> {
        info!(%query, "Starting replication");
        frontend::query(query, &mut self.write_buf)?;
        self.flush().await?;

        loop {
            let message = match self.read_incoming().await? {
                Incoming::CopyBothResponse => {
                    self.streaming = true;
                    return Ok(());
                }
                Incoming::Message(message) => message,
            };
            match message {
                Message::ErrorResponse(body) => {
                    let (code, message) = error_fields(&body)?;
                    // The server follows the error with ReadyForQuery.
                    while !matches!(self.read_message().await?, Message::ReadyForQuery(_)) {}
                    return Err(Error::Query { code, message });
                }
                Message::NoticeResponse(_) | Message::ParameterStatus(_) => {}
                _ => {
                    return Err(Error::Protocol(
                        "expected CopyBothResponse after START_REPLICATION".to_string(),
                    ));
                }
            }
        }
    }

    async fn recv_frame(&mut self) -> Result<Option<Bytes>> {
        if !self.streaming {
            return Err(Error::Protocol("replication not started".to_string()));
        }

        loop {
            match self.read_message().await? {
                Message::CopyData(body) => {
                    let frame = body.into_bytes();
                    trace!(len = frame.len(), "CopyData");
                    return Ok(Some(frame));
                }
                Message::CopyDone => {
                    info!("Server ended the replication stream");
                    self.streaming = false;
                    return Ok(None);
                }
                Message::ErrorResponse(body) => {
                    let (code, message) = error_fields(&body)?;
                    return Err(Error::Query { code, message });
                }
                Message::NoticeResponse(_) | Message::ParameterStatus(_) => {}
                _ => warn!("Ignoring unexpected message while streaming"),
            }
        }
    }

    async fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        frontend::CopyData::new(frame)?.write(&mut self.write_buf);
        self.flush().await
    }

    async fn close(&mut self) -> Result<()> {
        info!("Closing replication connection");
        if self.streaming {
            frontend::copy_done(&mut self.write_buf);
            self.streaming = false;
        }
        frontend::terminate(&mut self.write_buf);
        self.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn require_password(password: Option<&[u8]>) -> Result<&[u8]> {
    password.ok_or_else(|| Error::Authentication("server requested a password".to_string()))
}

fn column_names(body: &backend::RowDescriptionBody) -> Result<Vec<String>> {
    let names = body
        .fields()
        .map(|field| Ok(field.name().to_string()))
        .collect::<Vec<_>>()?;
    Ok(names)
}

/// Text values of a DataRow; `None` for SQL NULL.
fn row_values(body: &backend::DataRowBody) -> Result<Vec<Option<String>>> {
    let buffer = body.buffer();
    let values = body
        .ranges()
        .map(|range| {
            Ok(range.map(|range| String::from_utf8_lossy(&buffer[range]).into_owned()))
        })
        .collect::<Vec<_>>()?;
    Ok(values)
}

/// SQLSTATE and message of an ErrorResponse.
fn error_fields(body: &backend::ErrorResponseBody) -> Result<(String, String)> {
    let mut code = String::new();
    let mut message = String::new();
    let mut fields = body.fields();
    while let Some(field) = fields.next()? {
        match field.type_() {
            b'C' => code = field.value().to_string(),
            b'M' => message = field.value().to_string(),
            _ => {}
        }
    }
    Ok((code, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn backend_message(tag: u8, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(tag);
        buf.put_i32(4 + body.len() as i32);
        buf.put_slice(body);
        buf
    }

    fn parse(tag: u8, body: &[u8]) -> Message {
        match next_incoming(&mut backend_message(tag, body)).unwrap() {
            Some(Incoming::Message(message)) => message,
            _ => panic!("expected a complete message"),
        }
    }

    #[test]
    fn test_query_row_lookup() {
        let row = QueryRow::new(
            vec!["schemaname".to_string(), "tablename".to_string(), "extra".to_string()],
            vec![Some("public".to_string()), Some("users".to_string()), None],
        );
        assert_eq!(row.get("schemaname"), Some("public"));
        assert_eq!(row.get("tablename"), Some("users"));
        assert_eq!(row.get("extra"), None);
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn test_row_description_and_data_row() {
        let mut description = BytesMut::new();
        description.put_u16(2);
        for name in ["schemaname", "tablename"] {
            description.put_slice(name.as_bytes());
            description.put_u8(0);
            description.put_slice(&[0u8; 18]);
        }
        let Message::RowDescription(body) = parse(b'T', &description) else {
            panic!("expected RowDescription");
        };
        assert_eq!(column_names(&body).unwrap(), vec!["schemaname", "tablename"]);

        let mut data = BytesMut::new();
        data.put_u16(2);
        data.put_i32(6);
        data.put_slice(b"public");
        data.put_i32(-1);
        let Message::DataRow(body) = parse(b'D', &data) else {
            panic!("expected DataRow");
        };
        assert_eq!(row_values(&body).unwrap(), vec![Some("public".to_string()), None]);
    }

    #[test]
    fn test_error_fields() {
        let body = b"SERROR\0C42P01\0Mrelation \"missing\" does not exist\0\0";
        let Message::ErrorResponse(body) = parse(b'E', body) else {
            panic!("expected ErrorResponse");
        };
        let (code, message) = error_fields(&body).unwrap();
        assert_eq!(code, "42P01");
        assert_eq!(message, "relation \"missing\" does not exist");
    }

    #[test]
    fn test_truncated_data_row_is_rejected() {
        let mut data = BytesMut::new();
        data.put_u16(1);
        data.put_i32(10);
        data.put_slice(b"abc");
        let Message::DataRow(body) = parse(b'D', &data) else {
            panic!("expected DataRow");
        };
        assert!(row_values(&body).is_err());
    }

    #[test]
    fn test_copy_both_response_is_split_off() {
        // CopyBothResponse: text format, no columns
        let mut buf = backend_message(b'W', &[0, 0, 0]);
        buf.extend_from_slice(&backend_message(b'd', b"payload"));

        assert!(matches!(
            next_incoming(&mut buf).unwrap(),
            Some(Incoming::CopyBothResponse)
        ));
        match next_incoming(&mut buf).unwrap() {
            Some(Incoming::Message(Message::CopyData(body))) => {
                assert_eq!(body.into_bytes(), Bytes::from_static(b"payload"));
            }
            _ => panic!("expected CopyData"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_message_waits_for_more_input() {
        let full = backend_message(b'W', &[0, 0, 0]);
        let mut buf = BytesMut::from(&full[..6]);
        assert!(next_incoming(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);

        let full = backend_message(b'd', b"payload");
        let mut buf = BytesMut::from(&full[..8]);
        assert!(next_incoming(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[8..]);
        assert!(matches!(
            next_incoming(&mut buf).unwrap(),
            Some(Incoming::Message(Message::CopyData(_)))
        ));
    }
}
