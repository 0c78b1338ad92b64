//! 日志初始化.
//!
//! 控制台彩色输出, 文件无色输出, 两者级别相同.
//!
//! 级别 (优先级: AVSYNC_LOG 环境变量 > 命令行 > 默认):
//! - 默认:   info
//! - `-v`:   debug
//! - `-vv`:  trace (仅 avsync crate, 其余保持 info)
//! - `-vvv`: trace (全局)
//!
//! 日志文件位于 $cwd/logs/{prefix}.{date}.log
//!
//! 引擎通过 `log` 门面输出, 由 tracing-subscriber 的 log 桥接收.

use std::sync::OnceLock;

use anyhow::Context;
use chrono::{Datelike, Local, Timelike};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, FormatEvent, FormatFields, format::Writer},
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

const LOG_ENV: &str = "AVSYNC_LOG";

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

const AVSYNC_TARGETS: &[&str] = &["avsync", "avsync_core", "avsync_engine", "avsync_play"];

fn build_filter(verbosity: u8) -> EnvFilter {
    match verbosity {
        0 => EnvFilter::new("info"),
        1 => EnvFilter::new("debug"),
        2 => {
            let mut directives = AVSYNC_TARGETS
                .iter()
                .map(|t| format!("{t}=trace"))
                .collect::<Vec<_>>();
            directives.push("info".to_string());
            EnvFilter::new(directives.join(","))
        }
        _ => EnvFilter::new("trace"),
    }
}

fn filter(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| build_filter(verbosity))
}

/// 初始化日志系统
///
/// `no_file` 为 true 时只输出到控制台.
pub fn init(file_prefix: &str, verbosity: u8, no_file: bool) -> anyhow::Result<()> {
    let console_layer = fmt::Layer::default()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .event_format(ConsoleFormatter)
        .with_filter(filter(verbosity));

    let file_layer = if no_file {
        None
    } else {
        std::fs::create_dir_all("logs").context("创建日志目录失败")?;
        let appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix(file_prefix)
            .filename_suffix("log")
            .build("logs")
            .context("创建日志文件失败")?;
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        LOG_GUARD.set(guard).ok();
        Some(
            fmt::Layer::default()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(FileFormatter)
                .with_filter(filter(verbosity)),
        )
    };

    Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("安装日志订阅者失败")?;
    Ok(())
}

fn write_timestamp(writer: &mut Writer<'_>) -> std::fmt::Result {
    let now = Local::now();
    write!(
        writer,
        "[{:02}-{:02} {:02}:{:02}:{:02}.{:03}] ",
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.timestamp_subsec_millis(),
    )
}

/// 控制台格式: 彩色级别
struct ConsoleFormatter;

impl<S, N> FormatEvent<S, N> for ConsoleFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        let color = match *meta.level() {
            tracing::Level::ERROR => "\x1b[31m",
            tracing::Level::WARN => "\x1b[33m",
            tracing::Level::INFO => "\x1b[32m",
            _ => "\x1b[34m",
        };
        write_timestamp(&mut writer)?;
        write!(writer, "{color}{:5}\x1b[0m > ", meta.level())?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// 文件格式: 无色, 无 target
struct FileFormatter;

impl<S, N> FormatEvent<S, N> for FileFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        write_timestamp(&mut writer)?;
        write!(writer, "{:5} > ", event.metadata().level())?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
