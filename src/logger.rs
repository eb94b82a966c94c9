// Логирование: tracing + fmt подписчик с фильтром из RUST_LOG

use tracing::Level;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

/// Формат времени, как в консоли приложения
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub enabled: bool,
    pub default_level: Level,
    pub show_targets: bool,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // в отладочной сборке подробнее
            default_level: if cfg!(debug_assertions) {
                Level::DEBUG
            } else {
                Level::INFO
            },
            show_targets: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    pub fn quiet() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    /// Директива фильтра: RUST_LOG важнее уровня по умолчанию
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.default_level.as_str().to_lowercase()))
    }
}

/// Ставит глобальный подписчик. Повторный вызов ничего не ломает и возвращает false.
pub fn init_logging(config: &LogConfig) -> bool {
    if !config.enabled {
        return false;
    }
    tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_target(config.show_targets)
        .with_ansi(config.ansi)
        .try_init()
        .is_ok()
}
