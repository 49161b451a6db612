use std::{sync::Arc, time::Duration};

use anyhow::Result;
use fleetgeo::{
    network::ConnectionConfig, GeoIndex, QueryCoordinator, QueryPolicy, Server,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::oneshot,
    time::timeout,
};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (r, w) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(r),
            writer: w,
        })
    }

    async fn send(
        &mut self,
        line: &str,
    ) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        Ok(())
    }

    async fn line(&mut self) -> Result<String> {
        let mut buf = String::new();
        timeout(IO_TIMEOUT, self.reader.read_line(&mut buf)).await??;
        Ok(buf.trim_end_matches("\r\n").to_string())
    }

    /// Читает `n` строк ответа.
    async fn lines(
        &mut self,
        n: usize,
    ) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.line().await?);
        }
        Ok(out)
    }
}

async fn start_server(
    config: ConnectionConfig,
) -> Result<(
    std::net::SocketAddr,
    oneshot::Sender<()>,
    tokio::task::JoinHandle<fleetgeo::ServiceResult<()>>,
)> {
    let coordinator = QueryCoordinator::new(Arc::new(GeoIndex::new()), QueryPolicy::default());
    let server = Server::bind("127.0.0.1:0".parse()?, coordinator, config)
        .await?
        .with_shutdown_grace(Duration::from_secs(2));
    let addr = server.local_addr()?;

    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run(async {
        let _ = rx.await;
    }));
    Ok((addr, tx, handle))
}

#[tokio::test]
async fn test_dispatch_session_over_tcp() -> Result<()> {
    let (addr, shutdown, handle) = start_server(ConnectionConfig::default()).await?;
    let mut client = Client::connect(addr).await?;

    client.send("PING").await?;
    assert_eq!(client.line().await?, "+PONG");

    client.send("UPSERT truck-sf 37.7749 -122.4194").await?;
    assert_eq!(client.line().await?, "+OK");
    client.send("upsert truck-oak 37.8044 -122.2712").await?;
    assert_eq!(client.line().await?, "+OK");
    client.send("UPSERT truck-ny 40.7128 -74.0060").await?;
    assert_eq!(client.line().await?, "+OK");

    client.send("COUNT").await?;
    assert_eq!(client.line().await?, ":3");

    client.send("NEARBY 37.7749 -122.4194 20").await?;
    assert_eq!(
        client.lines(5).await?,
        ["*2", "$8", "truck-sf", "$9", "truck-oak"]
    );

    client.send("NEARBY 37.7749 -122.4194 20 1").await?;
    assert_eq!(client.lines(3).await?, ["*1", "$8", "truck-sf"]);

    client.send("NEARBY 37.7749 -122.4194 20 1 WITHDIST").await?;
    assert_eq!(
        client.lines(6).await?,
        ["*1", "*2", "$8", "truck-sf", "$6", "0.0000"]
    );

    client.send("POS truck-ny").await?;
    assert_eq!(
        client.lines(5).await?,
        ["*2", "$7", "40.7128", "$7", "-74.006"]
    );

    client.send("DIST truck-sf truck-ghost").await?;
    assert_eq!(client.line().await?, "$-1");

    client.send("DIST truck-sf truck-oak km").await?;
    let header = client.line().await?;
    let value = client.line().await?;
    assert!(header.starts_with('$'));
    let km: f64 = value.parse()?;
    assert!((km - 13.4).abs() < 1.0, "{km}");

    client.send("REMOVE truck-oak").await?;
    assert_eq!(client.line().await?, ":1");
    client.send("REMOVE truck-oak").await?;
    assert!(client.line().await?.starts_with("-ERR 2000 "));

    client.send("QUIT").await?;
    assert_eq!(client.line().await?, "+OK");

    // После QUIT сервер закрывает соединение
    let mut rest = Vec::new();
    timeout(IO_TIMEOUT, client.reader.read_to_end(&mut rest)).await??;
    assert!(rest.is_empty());

    let _ = shutdown.send(());
    timeout(IO_TIMEOUT, handle).await???;
    Ok(())
}

#[tokio::test]
async fn test_errors_keep_connection_open() -> Result<()> {
    let (addr, shutdown, handle) = start_server(ConnectionConfig::default()).await?;
    let mut client = Client::connect(addr).await?;

    client.send("FLY me to the moon").await?;
    assert!(client.line().await?.starts_with("-ERR 8000 "));

    client.send("UPSERT a1 north 10").await?;
    assert!(client.line().await?.starts_with("-ERR 8003 "));

    client.send("UPSERT a1 95 10").await?;
    assert!(client.line().await?.starts_with("-ERR 2001 "));

    client.send("NEARBY 0 0 0").await?;
    assert!(client.line().await?.starts_with("-ERR 2003 "));

    client.send("NEARBY 0 0").await?;
    assert!(client.line().await?.starts_with("-ERR 8001 "));

    client.send("PING still-here").await?;
    assert_eq!(client.lines(2).await?, ["$10", "still-here"]);

    let _ = shutdown.send(());
    timeout(IO_TIMEOUT, handle).await???;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_closes_idle_clients() -> Result<()> {
    let (addr, shutdown, handle) = start_server(ConnectionConfig::default()).await?;

    let mut first = Client::connect(addr).await?;
    let mut second = Client::connect(addr).await?;
    first.send("PING").await?;
    assert_eq!(first.line().await?, "+PONG");
    second.send("PING").await?;
    assert_eq!(second.line().await?, "+PONG");

    let _ = shutdown.send(());
    timeout(IO_TIMEOUT, handle).await???;

    // Оба клиента видят EOF, возможно после уведомления об остановке
    for client in [&mut first, &mut second] {
        let mut rest = Vec::new();
        let _ = timeout(IO_TIMEOUT, client.reader.read_to_end(&mut rest)).await?;
    }

    // Новые соединения больше не принимаются
    assert!(TcpStream::connect(addr).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_connection_limit_rejects_extra_clients() -> Result<()> {
    let config = ConnectionConfig {
        max_connections: 1,
        ..Default::default()
    };
    let (addr, shutdown, handle) = start_server(config).await?;

    let mut first = Client::connect(addr).await?;
    first.send("PING").await?;
    assert_eq!(first.line().await?, "+PONG");

    let mut second = Client::connect(addr).await?;
    assert!(second.line().await?.starts_with("-ERR 4001 "));

    first.send("QUIT").await?;
    assert_eq!(first.line().await?, "+OK");

    let _ = shutdown.send(());
    timeout(IO_TIMEOUT, handle).await???;
    Ok(())
}
