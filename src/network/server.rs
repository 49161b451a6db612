use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net::TcpListener, select};
use tracing::{debug, info, warn};

use crate::{
    engine::QueryCoordinator,
    error::ServiceResult,
    network::connection::{ConnectionConfig, ConnectionManager},
};

/// Сколько ждать закрытия соединений после сигнала остановки.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Пауза после ошибки accept (например, исчерпаны дескрипторы).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// TCP-сервер line-протокола.
pub struct Server {
    listener: TcpListener,
    manager: Arc<ConnectionManager>,
    coordinator: QueryCoordinator,
    shutdown_grace: Duration,
}

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        coordinator: QueryCoordinator,
        config: ConnectionConfig,
    ) -> ServiceResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Listening");

        Ok(Self {
            listener,
            manager: Arc::new(ConnectionManager::new(config)),
            coordinator,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    pub fn with_shutdown_grace(
        mut self,
        grace: Duration,
    ) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn local_addr(&self) -> ServiceResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn manager(&self) -> Arc<ConnectionManager> {
        self.manager.clone()
    }

    /// Принимает соединения, пока не завершится `shutdown`, затем ждёт
    /// закрытия активных соединений.
    pub async fn run<F>(
        self,
        shutdown: F,
    ) -> ServiceResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        if let Err(e) = socket.set_nodelay(true) {
                            debug!(%addr, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let manager = self.manager.clone();
                        let coordinator = self.coordinator.clone();
                        tokio::spawn(async move {
                            // Ошибка уже залогирована менеджером
                            let _ = manager.handle_connection(socket, addr, coordinator).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }

        self.manager.shutdown();
        self.manager.wait_for_shutdown(self.shutdown_grace).await
    }
}
