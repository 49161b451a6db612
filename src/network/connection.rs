use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use fleetgeo_error::{ErrorExt, GeoError, LogLevel, ProtocolError, StatusCode};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
    sync::{Notify, Semaphore},
    time::{timeout, Instant},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    engine::QueryCoordinator,
    error::{ServiceError, ServiceResult},
    network::protocol::{Command, Reply},
};

/// Сколько байт хвоста слишком длинной строки дочитывается перед закрытием.
const DISCARD_LIMIT: u64 = 64 * 1024;

/// Конфигурация для обработки соединений
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Максимальное кол-во одновременных соединений
    pub max_connections: usize,
    /// Максимальное кол-во соединений с одного IP
    pub max_connections_per_ip: usize,
    /// Сколько ждать начала следующей команды
    pub idle_timeout_secs: u64,
    /// Сколько ждать конца уже начатой строки
    pub read_timeout_secs: u64,
    /// Таймаут записи ответа
    pub write_timeout_secs: u64,
    /// Размер буфера для чтения
    pub read_buffer_size: usize,
    /// Максимальная длина строки команды в байтах (без CRLF)
    pub max_line_len: usize,
}

/// Менеджер соединений: лимиты, счётчики и graceful shutdown.
#[derive(Debug)]
pub struct ConnectionManager {
    config: ConnectionConfig,
    connection_semaphore: Arc<Semaphore>,
    /// Счётчик соединений по IP адресам
    ip_connections: Mutex<HashMap<IpAddr, usize>>,
    active_connections: AtomicUsize,
    shutdown_signal: Arc<Notify>,
    shutting_down: Arc<AtomicBool>,
    /// Счётчик для генерации ID соединений
    connection_counter: AtomicU32,
}

/// Обработчик отдельного соединения
pub struct ConnectionHandler {
    connection_id: u32,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    addr: SocketAddr,
    coordinator: QueryCoordinator,
    config: ConnectionConfig,
    shutdown_signal: Arc<Notify>,
    shutting_down: Arc<AtomicBool>,
}

/// Результат чтения одной строки.
enum ReadOutcome {
    Line(String),
    Eof,
    Idle,
    ReadTimeout,
    /// `terminated`: строка уже дочитана до `\n`.
    TooLong { terminated: bool },
    InvalidUtf8,
    Failed(std::io::Error),
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl ConnectionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn validate(&self) -> ServiceResult<()> {
        let checks = [
            ("connection.max_connections", self.max_connections as u64),
            (
                "connection.max_connections_per_ip",
                self.max_connections_per_ip as u64,
            ),
            ("connection.idle_timeout_secs", self.idle_timeout_secs),
            ("connection.read_timeout_secs", self.read_timeout_secs),
            ("connection.write_timeout_secs", self.write_timeout_secs),
            ("connection.read_buffer_size", self.read_buffer_size as u64),
            ("connection.max_line_len", self.max_line_len as u64),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(ServiceError::invalid_setting(field, "must be positive"));
            }
        }
        Ok(())
    }
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config,
            ip_connections: Mutex::new(HashMap::new()),
            active_connections: AtomicUsize::new(0),
            shutdown_signal: Arc::new(Notify::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            connection_counter: AtomicU32::new(0),
        }
    }

    /// Текущее кол-во активных соединений
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Инициализация graceful shutdown: все обработчики получают сигнал и
    /// закрывают соединения после текущей команды.
    pub fn shutdown(&self) {
        info!("Initiating graceful shutdown for connection manager");
        self.shutting_down.store(true, Ordering::Release);
        self.shutdown_signal.notify_waiters();
    }

    /// Ждать завершения всех активных соединений
    pub async fn wait_for_shutdown(
        &self,
        timeout_duration: Duration,
    ) -> ServiceResult<()> {
        let start = Instant::now();

        while self.active_connections() > 0 {
            if start.elapsed() > timeout_duration {
                let active = self.active_connections();
                warn!(active, "Shutdown timeout reached");
                return Err(ServiceError::ShutdownTimeout { active });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!("All connections closed gracefully");
        Ok(())
    }

    /// Обрабатывает новое соединение до его закрытия.
    pub async fn handle_connection(
        &self,
        mut socket: TcpStream,
        addr: SocketAddr,
        coordinator: QueryCoordinator,
    ) -> ServiceResult<()> {
        let _permit = match self.connection_semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                return self
                    .reject(&mut socket, addr, "Maximum connections limit reached")
                    .await;
            }
        };

        if !self.register_ip(addr.ip()) {
            let reason = format!("Too many connections from IP: {}", addr.ip());
            return self.reject(&mut socket, addr, &reason).await;
        }

        let connection_count = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        let connection_id = self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1;

        info!(
            connection_id,
            %addr,
            active = connection_count,
            "Connection established"
        );

        let handler = ConnectionHandler::new(
            connection_id,
            socket,
            addr,
            coordinator,
            self.config.clone(),
            self.shutdown_signal.clone(),
            self.shutting_down.clone(),
        );

        let result = handler.run().await;

        self.release_ip(addr.ip());
        let remaining = self.active_connections.fetch_sub(1, Ordering::Relaxed) - 1;

        match &result {
            Ok(_) => debug!(connection_id, %addr, remaining, "Connection closed"),
            Err(e) => error!(connection_id, %addr, remaining, error = %e, "Connection closed with error"),
        }

        result
    }

    async fn reject(
        &self,
        socket: &mut TcpStream,
        addr: SocketAddr,
        reason: &str,
    ) -> ServiceResult<()> {
        warn!(%addr, reason, "Connection rejected");
        let reply = Reply::Error {
            code: StatusCode::TooManyConnections,
            message: reason.to_string(),
        };
        // Клиент может уже закрыть сокет; ответ best-effort
        let _ = timeout(
            self.config.write_timeout(),
            socket.write_all(reply.encode().as_bytes()),
        )
        .await;
        Err(ServiceError::ConnectionRejected(reason.to_string()))
    }

    /// Учитывает соединение с IP. `false`, если лимит на IP исчерпан.
    fn register_ip(
        &self,
        ip: IpAddr,
    ) -> bool {
        let mut ip_connections = self.ip_connections.lock();
        let count = ip_connections.entry(ip).or_insert(0);
        if *count >= self.config.max_connections_per_ip {
            return false;
        }
        *count += 1;
        true
    }

    fn release_ip(
        &self,
        ip: IpAddr,
    ) {
        let mut ip_connections = self.ip_connections.lock();
        if let Some(count) = ip_connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                ip_connections.remove(&ip);
            }
        }
    }
}

impl ConnectionHandler {
    fn new(
        connection_id: u32,
        socket: TcpStream,
        addr: SocketAddr,
        coordinator: QueryCoordinator,
        config: ConnectionConfig,
        shutdown_signal: Arc<Notify>,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        let (read_half, write_half) = socket.into_split();
        let reader = BufReader::with_capacity(config.read_buffer_size, read_half);

        Self {
            connection_id,
            reader,
            writer: write_half,
            addr,
            coordinator,
            config,
            shutdown_signal,
            shutting_down,
        }
    }

    /// Основной цикл обработки соединения.
    async fn run(self) -> ServiceResult<()> {
        let ConnectionHandler {
            connection_id,
            mut reader,
            mut writer,
            addr,
            coordinator,
            config,
            shutdown_signal,
            shutting_down,
        } = self;

        loop {
            // Подписываемся до проверки флага, чтобы не пропустить сигнал
            let notified = shutdown_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if shutting_down.load(Ordering::Acquire) {
                Self::send_shutdown_notice(connection_id, addr, &mut writer, &config).await?;
                break;
            }

            let outcome = select! {
                _ = &mut notified => {
                    Self::send_shutdown_notice(connection_id, addr, &mut writer, &config).await?;
                    break;
                }
                outcome = Self::read_line(&mut reader, &config) => outcome,
            };

            match outcome {
                ReadOutcome::Line(line) => {
                    let trimmed = line.trim();
                    trace!(connection_id, %addr, command = trimmed, "Received command");

                    let command = match Command::parse(trimmed) {
                        Ok(command) => command,
                        Err(ProtocolError::EmptyCommand) => continue,
                        Err(e) => {
                            log_command_error("parse", &e);
                            Self::send(&mut writer, &Reply::from_error(&e), &config).await?;
                            continue;
                        }
                    };

                    let reply = execute_command(&coordinator, &command);
                    Self::send(&mut writer, &reply, &config).await?;

                    if command == Command::Quit {
                        info!(connection_id, %addr, "Client sent QUIT, closing");
                        break;
                    }
                }
                ReadOutcome::Eof => {
                    debug!(connection_id, %addr, "Client closed connection");
                    break;
                }
                ReadOutcome::Idle => {
                    warn!(connection_id, %addr, "Idle timeout");
                    let reply = Reply::Error {
                        code: StatusCode::Timeout,
                        message: "Connection idle timeout".to_string(),
                    };
                    Self::send(&mut writer, &reply, &config).await?;
                    break;
                }
                ReadOutcome::ReadTimeout => {
                    warn!(connection_id, %addr, "Read timeout");
                    let reply = Reply::Error {
                        code: StatusCode::ReadTimeout,
                        message: "Read timeout".to_string(),
                    };
                    Self::send(&mut writer, &reply, &config).await?;
                    break;
                }
                ReadOutcome::TooLong { terminated } => {
                    warn!(connection_id, %addr, limit = config.max_line_len, "Command line too long");
                    let err = ProtocolError::LineTooLong {
                        limit: config.max_line_len,
                    };
                    Self::send(&mut writer, &Reply::from_error(&err), &config).await?;
                    // Непрочитанные данные при закрытии сокета превращаются в RST
                    if !terminated {
                        let mut rest = Vec::new();
                        let mut limited = (&mut reader).take(DISCARD_LIMIT);
                        let discard = limited.read_until(b'\n', &mut rest);
                        let _ = timeout(config.read_timeout(), discard).await;
                    }
                    break;
                }
                ReadOutcome::InvalidUtf8 => {
                    warn!(connection_id, %addr, "Ignoring invalid UTF-8 from client");
                    let reply = Reply::Error {
                        code: StatusCode::ParseError,
                        message: "Command is not valid UTF-8".to_string(),
                    };
                    Self::send(&mut writer, &reply, &config).await?;
                }
                ReadOutcome::Failed(e) => {
                    if Self::is_recoverable_error(&e) {
                        debug!(connection_id, %addr, error = %e, "Recoverable read error");
                        break;
                    }
                    error!(connection_id, %addr, error = %e, "Fatal read error");
                    return Err(e.into());
                }
            }
        }

        Self::graceful_close_writer(connection_id, writer).await;
        Ok(())
    }

    /// Читает строку команды: начала ждём `idle_timeout`, конца уже
    /// `read_timeout`. Длина строки ограничена `max_line_len`.
    async fn read_line(
        reader: &mut BufReader<OwnedReadHalf>,
        config: &ConnectionConfig,
    ) -> ReadOutcome {
        match timeout(config.idle_timeout(), reader.fill_buf()).await {
            Err(_) => return ReadOutcome::Idle,
            Ok(Err(e)) => return ReadOutcome::Failed(e),
            Ok(Ok(buf)) if buf.is_empty() => return ReadOutcome::Eof,
            Ok(Ok(_)) => {}
        }

        // +2 байта на CRLF
        let limit = config.max_line_len as u64 + 2;
        let mut raw = Vec::new();
        let mut limited = (&mut *reader).take(limit);
        let read = timeout(config.read_timeout(), limited.read_until(b'\n', &mut raw)).await;

        match read {
            Err(_) => ReadOutcome::ReadTimeout,
            Ok(Err(e)) => ReadOutcome::Failed(e),
            Ok(Ok(n)) => {
                let terminated = raw.last() == Some(&b'\n');
                if !terminated && n as u64 >= limit {
                    return ReadOutcome::TooLong { terminated };
                }
                // Длина считается без `\n` или `\r\n` в конце
                if payload_len(&raw) > config.max_line_len {
                    return ReadOutcome::TooLong { terminated };
                }
                match String::from_utf8(raw) {
                    Ok(line) => ReadOutcome::Line(line),
                    Err(_) => ReadOutcome::InvalidUtf8,
                }
            }
        }
    }

    async fn send_shutdown_notice(
        connection_id: u32,
        addr: SocketAddr,
        writer: &mut OwnedWriteHalf,
        config: &ConnectionConfig,
    ) -> ServiceResult<()> {
        info!(connection_id, %addr, "Received shutdown signal");
        let reply = Reply::Error {
            code: StatusCode::ConnectionClosed,
            message: "Server shutting down".to_string(),
        };
        Self::send(writer, &reply, config).await
    }

    /// Отправляет ответ с таймаутом записи
    async fn send(
        writer: &mut OwnedWriteHalf,
        reply: &Reply,
        config: &ConnectionConfig,
    ) -> ServiceResult<()> {
        timeout(config.write_timeout(), writer.write_all(reply.encode().as_bytes()))
            .await
            .map_err(|_| std::io::Error::new(ErrorKind::TimedOut, "write timeout"))??;
        Ok(())
    }

    /// Проверяет, является ли ошибка восстанавливаемой
    fn is_recoverable_error(error: &std::io::Error) -> bool {
        matches!(
            error.kind(),
            ErrorKind::UnexpectedEof
                | ErrorKind::BrokenPipe
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::TimedOut
        )
    }

    async fn graceful_close_writer(
        connection_id: u32,
        mut writer: OwnedWriteHalf,
    ) {
        if let Err(e) = writer.shutdown().await {
            // Игнорируем ошибки при закрытии уже закрытого соединения
            if e.kind() != ErrorKind::NotConnected {
                debug!(connection_id, error = %e, "Error during shutdown");
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Внешние функции
////////////////////////////////////////////////////////////////////////////////

/// Выполняет команду через координатор и формирует ответ.
pub fn execute_command(
    coordinator: &QueryCoordinator,
    command: &Command,
) -> Reply {
    let result = match command {
        Command::Ping(None) => Ok(Reply::Simple("PONG".to_string())),
        Command::Ping(Some(message)) => Ok(Reply::Bulk(message.clone())),
        Command::Upsert {
            agent_id,
            latitude,
            longitude,
        } => coordinator
            .upsert_position(agent_id, *latitude, *longitude)
            .map(|_| Reply::ok()),
        Command::Nearby {
            latitude,
            longitude,
            radius_km,
            limit,
            with_dist: false,
        } => coordinator
            .query_nearby(*latitude, *longitude, *radius_km, *limit)
            .map(|ids| Reply::Array(ids.into_iter().map(Reply::Bulk).collect())),
        Command::Nearby {
            latitude,
            longitude,
            radius_km,
            limit,
            with_dist: true,
        } => coordinator
            .query_nearby_with_distances(*latitude, *longitude, *radius_km, *limit)
            .map(|neighbors| {
                Reply::Array(
                    neighbors
                        .into_iter()
                        .map(|n| {
                            Reply::Array(vec![Reply::Bulk(n.agent_id), Reply::float(n.distance_km)])
                        })
                        .collect(),
                )
            }),
        Command::Remove { agent_id } => coordinator.remove_agent(agent_id).map(|_| Reply::Integer(1)),
        Command::Pos { agent_id } => Ok(match coordinator.position(agent_id) {
            Some(position) => Reply::Array(vec![
                Reply::Bulk(position.latitude().to_string()),
                Reply::Bulk(position.longitude().to_string()),
            ]),
            None => Reply::Nil,
        }),
        Command::Dist { a, b, unit } => match coordinator.distance(a, b, *unit) {
            Ok(distance) => Ok(Reply::float(distance)),
            Err(GeoError::NotFound { .. }) => Ok(Reply::Nil),
            Err(e) => Err(e),
        },
        Command::Count => Ok(Reply::Integer(coordinator.index().len() as i64)),
        Command::Quit => Ok(Reply::ok()),
    };

    result.unwrap_or_else(|err| {
        log_command_error(command.name(), &err);
        Reply::from_error(&err)
    })
}

////////////////////////////////////////////////////////////////////////////////
// Внутренние методы и функции
////////////////////////////////////////////////////////////////////////////////

/// Длина строки команды без завершающего `\n` или `\r\n`.
fn payload_len(raw: &[u8]) -> usize {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    line.strip_suffix(b"\r").unwrap_or(line).len()
}

/// Логирует ошибку команды с уровнем, который задаёт её статус.
fn log_command_error(
    command: &str,
    err: &dyn ErrorExt,
) {
    let code = err.status_code().code();
    let retryable = err.status_code().is_retryable();
    let detail = err.log_message();
    let tags = err.metrics_tags();
    match err.status_code().log_level() {
        LogLevel::Trace => trace!(command, code, retryable, detail = %detail, tags = ?tags, "Command failed"),
        LogLevel::Debug => debug!(command, code, retryable, detail = %detail, tags = ?tags, "Command failed"),
        LogLevel::Info => info!(command, code, retryable, detail = %detail, tags = ?tags, "Command failed"),
        LogLevel::Warn => warn!(command, code, retryable, detail = %detail, tags = ?tags, "Command failed"),
        LogLevel::Error => error!(command, code, retryable, detail = %detail, tags = ?tags, "Command failed"),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 10000,
            max_connections_per_ip: 100,
            idle_timeout_secs: 300,
            read_timeout_secs: 30,
            write_timeout_secs: 10,
            read_buffer_size: 8192,
            max_line_len: 4096,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::{TcpListener, TcpStream},
    };

    use super::*;
    use crate::{
        database::GeoIndex,
        engine::{QueryCoordinator, QueryPolicy},
    };

    fn coordinator() -> QueryCoordinator {
        QueryCoordinator::new(Arc::new(GeoIndex::new()), QueryPolicy::default())
    }

    fn run(
        coordinator: &QueryCoordinator,
        line: &str,
    ) -> String {
        let command = Command::parse(line).unwrap();
        execute_command(coordinator, &command).encode()
    }

    #[test]
    fn test_execute_upsert_and_nearby() {
        let c = coordinator();
        assert_eq!(run(&c, "UPSERT a 0 0"), "+OK\r\n");
        assert_eq!(run(&c, "UPSERT b 0 0.01"), "+OK\r\n");
        assert_eq!(
            run(&c, "NEARBY 0 0 5"),
            "*2\r\n$1\r\na\r\n$1\r\nb\r\n"
        );
        assert_eq!(
            run(&c, "NEARBY 0 0 5 1 WITHDIST"),
            "*1\r\n*2\r\n$1\r\na\r\n$6\r\n0.0000\r\n"
        );
        assert_eq!(run(&c, "COUNT"), ":2\r\n");
    }

    #[test]
    fn test_execute_errors() {
        let c = coordinator();
        assert_eq!(
            run(&c, "UPSERT a 95 0"),
            "-ERR 2001 Invalid coordinate: latitude 95, longitude 0\r\n"
        );
        assert!(run(&c, "NEARBY 0 0 0").starts_with("-ERR 2003 "));
        assert!(run(&c, "REMOVE ghost").starts_with("-ERR 2000 "));
    }

    #[test]
    fn test_execute_pos_dist_remove() {
        let c = coordinator();
        run(&c, "UPSERT a 10.5 20.25");
        run(&c, "UPSERT b 10.5 20.25");
        assert_eq!(
            run(&c, "POS a"),
            "*2\r\n$4\r\n10.5\r\n$5\r\n20.25\r\n"
        );
        assert_eq!(run(&c, "POS nobody"), "$-1\r\n");
        assert_eq!(run(&c, "DIST a b m"), "$6\r\n0.0000\r\n");
        assert_eq!(run(&c, "DIST a nobody"), "$-1\r\n");
        assert_eq!(run(&c, "REMOVE a"), ":1\r\n");
        assert_eq!(run(&c, "COUNT"), ":1\r\n");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handler_run_ping_and_quit() -> anyhow::Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;
        let coordinator = coordinator();

        let server_fut = async move {
            let (socket, addr) = listener.accept().await?;
            let handler = ConnectionHandler::new(
                1,
                socket,
                addr,
                coordinator,
                ConnectionConfig::default(),
                Arc::new(Notify::new()),
                Arc::new(AtomicBool::new(false)),
            );
            handler.run().await?;
            Ok::<(), anyhow::Error>(())
        };

        let client_fut = async move {
            let stream = TcpStream::connect(local_addr).await?;
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();

            write.write_all(b"PING\r\n").await?;
            assert_eq!(lines.next_line().await?.as_deref(), Some("+PONG"));

            write.write_all(b"\r\nBOGUS\r\n").await?;
            let reply = lines.next_line().await?.unwrap_or_default();
            assert!(reply.starts_with("-ERR 8000"), "{reply}");

            write.write_all(b"QUIT\r\n").await?;
            assert_eq!(lines.next_line().await?.as_deref(), Some("+OK"));
            assert_eq!(lines.next_line().await?, None);
            Ok::<(), anyhow::Error>(())
        };

        tokio::try_join!(server_fut, client_fut)?;
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handler_rejects_long_lines() -> anyhow::Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;
        let coordinator = coordinator();
        let config = ConnectionConfig {
            max_line_len: 16,
            ..Default::default()
        };

        let server_fut = async move {
            let (socket, addr) = listener.accept().await?;
            let handler = ConnectionHandler::new(
                1,
                socket,
                addr,
                coordinator,
                config,
                Arc::new(Notify::new()),
                Arc::new(AtomicBool::new(false)),
            );
            handler.run().await?;
            Ok::<(), anyhow::Error>(())
        };

        let client_fut = async move {
            let stream = TcpStream::connect(local_addr).await?;
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();

            write
                .write_all(b"UPSERT an-agent-with-a-long-name 1 2\r\n")
                .await?;
            let reply = lines.next_line().await?.unwrap_or_default();
            assert!(reply.starts_with("-ERR 8004"), "{reply}");
            Ok::<(), anyhow::Error>(())
        };

        tokio::try_join!(server_fut, client_fut)?;
        Ok(())
    }

    /// Поднимает обработчик с `max_line_len = 16`, отправляет `payload`
    /// и возвращает все строки ответа до закрытия соединения.
    async fn replies_with_short_lines(payload: &'static [u8]) -> anyhow::Result<Vec<String>> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;
        let coordinator = coordinator();
        let config = ConnectionConfig {
            max_line_len: 16,
            ..Default::default()
        };

        let server_fut = async move {
            let (socket, addr) = listener.accept().await?;
            let handler = ConnectionHandler::new(
                1,
                socket,
                addr,
                coordinator,
                config,
                Arc::new(Notify::new()),
                Arc::new(AtomicBool::new(false)),
            );
            handler.run().await?;
            Ok::<(), anyhow::Error>(())
        };

        let client_fut = async move {
            let stream = TcpStream::connect(local_addr).await?;
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();

            write.write_all(payload).await?;
            let mut replies = Vec::new();
            // Сервер может закрыть сокет с непрочитанным хвостом (RST)
            while let Ok(Some(line)) = lines.next_line().await {
                replies.push(line);
            }
            Ok::<Vec<String>, anyhow::Error>(replies)
        };

        let ((), replies) = tokio::try_join!(server_fut, client_fut)?;
        Ok(replies)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handler_closes_on_long_line_cut_inside_utf8() -> anyhow::Result<()> {
        // Граница в 18 байт приходится на середину `é`
        let replies =
            replies_with_short_lines("PING aaaaaaaaaaaa\u{e9} x\r\nCOUNT\r\n".as_bytes()).await?;
        assert_eq!(replies.len(), 1, "{replies:?}");
        assert!(replies[0].starts_with("-ERR 8004"), "{replies:?}");
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handler_limits_lf_terminated_lines() -> anyhow::Result<()> {
        // 17 байт полезной нагрузки и голый `\n`
        let replies = replies_with_short_lines(b"PING aaaaaaaaaaaa\nCOUNT\n").await?;
        assert_eq!(replies.len(), 1, "{replies:?}");
        assert!(replies[0].starts_with("-ERR 8004"), "{replies:?}");
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handler_accepts_line_at_exact_limit() -> anyhow::Result<()> {
        // Ровно 16 байт, с `\n` и с `\r\n`
        let replies =
            replies_with_short_lines(b"PING aaaaaaaaaaa\nPING bbbbbbbbbbb\r\nQUIT\r\n").await?;
        assert_eq!(
            replies,
            ["$11", "aaaaaaaaaaa", "$11", "bbbbbbbbbbb", "+OK"],
        );
        Ok(())
    }

    #[test]
    fn test_payload_len_ignores_line_ending() {
        assert_eq!(payload_len(b"PING\r\n"), 4);
        assert_eq!(payload_len(b"PING\n"), 4);
        assert_eq!(payload_len(b"PING"), 4);
        assert_eq!(payload_len(b"PING\r"), 4);
        assert_eq!(payload_len(b"\r\n"), 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(ConnectionConfig::default().validate().is_ok());
        let cfg = ConnectionConfig {
            idle_timeout_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ServiceError::InvalidSetting {
                field: "connection.idle_timeout_secs",
                ..
            })
        ));
    }

    #[test]
    fn test_ip_limit() {
        let manager = ConnectionManager::new(ConnectionConfig {
            max_connections_per_ip: 2,
            ..Default::default()
        });
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(manager.register_ip(ip));
        assert!(manager.register_ip(ip));
        assert!(!manager.register_ip(ip));
        manager.release_ip(ip);
        assert!(manager.register_ip(ip));
    }
}
