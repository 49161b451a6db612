use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{layer::Layer as LayerTrait, registry::LookupSpan};

use crate::{
    error::ServiceResult,
    logging::{config::LoggingConfig, formatter},
};

/// Файловый слой с ежедневной ротацией и неблокирующей записью.
///
/// `WorkerGuard` нужно держать до завершения процесса, иначе хвост буфера
/// потеряется.
pub fn layer_with_config<S>(
    config: &LoggingConfig
) -> ServiceResult<(Box<dyn LayerTrait<S> + Send + Sync>, WorkerGuard)>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    config.ensure_log_dir()?;

    let appender = rolling::daily(&config.log_dir, &config.file.filename);
    let (writer, guard) = non_blocking(appender);

    let layer = formatter::build_formatter(config.file.format, writer, false, &config.console);
    Ok((layer, guard))
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::{prelude::*, registry::Registry};

    use super::*;
    use crate::logging::config::FileConfig;

    #[test]
    fn test_file_layer_writes_to_log_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = LoggingConfig {
            log_dir: tmp.path().to_path_buf(),
            file: FileConfig {
                enabled: true,
                filename: "test.log".into(),
                ..Default::default()
            },
            ..Default::default()
        };

        let (layer, guard) = layer_with_config::<Registry>(&cfg).unwrap();
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("written to file");
        });
        drop(guard);

        let files: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(Result::ok)
            .collect();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().to_string_lossy().into_owned();
        assert!(name.starts_with("test.log"), "{name}");
        let content = std::fs::read_to_string(files[0].path()).unwrap();
        assert!(content.contains("written to file"));
    }
}
