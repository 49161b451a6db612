use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde::Deserialize;
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::database::GeoIndex;

/// Параметры фоновой очистки устаревших позиций.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    pub enabled: bool,
    /// Позиция старше этого возраста считается устаревшей.
    pub max_age_secs: u64,
    pub sweep_interval_secs: u64,
}

/// Фоновая задача, периодически удаляющая агентов без свежих обновлений.
#[derive(Debug)]
pub struct StaleSweeper {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl EvictionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl StaleSweeper {
    /// Запускает очистку. Первый проход выполняется сразу.
    pub fn spawn(
        index: Arc<GeoIndex>,
        max_age: Duration,
        sweep_interval: Duration,
    ) -> Self {
        let stop = Arc::new(Notify::new());
        let signal = stop.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = ticker.tick() => {
                        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
                            warn!(?max_age, "max age is out of range, sweeper stopped");
                            break;
                        };
                        let evicted = index.evict_stale(Utc::now() - max_age);
                        if evicted > 0 {
                            info!(evicted, remaining = index.len(), "stale agents evicted");
                        }
                    }
                }
            }
            debug!("stale sweeper stopped");
        });

        Self { stop, handle }
    }

    /// Запускает очистку по конфигурации; `None`, если она выключена.
    pub fn from_config(
        index: Arc<GeoIndex>,
        config: &EvictionConfig,
    ) -> Option<Self> {
        config
            .enabled
            .then(|| Self::spawn(index, config.max_age(), config.sweep_interval()))
    }

    /// Останавливает задачу и дожидается её завершения.
    pub async fn stop(self) {
        self.stop.notify_one();
        if let Err(err) = self.handle.await {
            warn!(%err, "stale sweeper task failed");
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_age_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
