use anyhow::Result;
use flexi_logger::{Age, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};

/// Start file logging under `logs/`, rotated daily, mirrored to stderr.
///
/// `RUST_LOG` overrides the default `info` level. Keep the handle alive for
/// the life of the process.
pub fn init_logging() -> Result<LoggerHandle> {
    std::fs::create_dir_all("logs")?;

    let handle = Logger::try_with_env_or_str("info")?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .basename("projector_scheduler")
                .suffix("log"),
        )
        .rotate(
            Criterion::Age(Age::Day),
            Naming::Numbers,
            Cleanup::KeepLogFiles(7),
        )
        .duplicate_to_stderr(Duplicate::Info)
        .start()?;

    Ok(handle)
}
