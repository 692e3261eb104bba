//! 消息捕获回放 CLI
//!
//! 从文件或标准输入逐行读取出站通知（JSON），经拦截通道捕获入库，
//! 再把每行原文逐字节写到标准输出，模拟宿主的正常投递路径。

use anyhow::{Context, Result};
use clap::Parser;
use message_storage_rust::{CaptureContext, InterceptedChannel, Notification, NotificationSink};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Duration;
use tracing::{error, info, warn};

/// 消息捕获回放 CLI
#[derive(Parser, Debug)]
#[command(name = "message-storage-cli")]
#[command(about = "回放出站通知并把其中的消息持久化到本地", long_about = None)]
struct Args {
    /// 数据目录（存放数据库、配置和日志）
    #[arg(short, long, default_value = "message_storage")]
    data_dir: PathBuf,

    /// 通知文件（每行一个 JSON），缺省时读取标准输入
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// 模拟的窗口 URL
    #[arg(long, default_value = "app://./renderer/index.html#/main/message")]
    window_url: String,

    /// 关闭时等待写入队列清空的秒数
    #[arg(long, default_value = "5")]
    drain_timeout: u64,

    /// 日志级别（默认: info,message_storage_rust=debug）
    #[arg(long, default_value = "info,message_storage_rust=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stderr 和数据目录下的文件，stdout 留给转发的通知）
fn init_logger(log_level: &str, data_dir: &Path) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("创建数据目录失败: {}", data_dir.display()))?;
    let log_path = data_dir.join("message-storage.log");
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("无法创建日志文件 {}", log_path.display()))?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 文件不需要颜色
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 日志同时输出到 stderr 和文件: {}", log_path.display());
    Ok(())
}

/// 宿主投递路径的替身：每条通知按收到时的原文写一行
struct LineSink<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> LineSink<W> {
    fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    fn write_line(&self, line: &str) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            error!("[CLI] 写出通知失败: {}", e);
        }
    }
}

impl<W: Write + Send> NotificationSink for LineSink<W> {
    fn send(&self, notification: Notification) {
        match notification.to_json_line() {
            Ok(line) => self.write_line(&line),
            Err(e) => error!("[CLI] 序列化通知失败: {}", e),
        }
    }
}

/// 逐行回放；不是通知的行原样透传，返回回放的通知数
async fn replay<R, W>(input: R, channel: &InterceptedChannel<LineSink<W>>) -> Result<usize>
where
    R: AsyncRead + Unpin,
    W: Write + Send,
{
    let mut lines = BufReader::new(input).lines();
    let mut line_no = 0;
    let mut count = 0;
    while let Some(line) = lines.next_line().await.context("读取输入失败")? {
        line_no += 1;
        if line.trim().is_empty() {
            channel.downstream().write_line(&line);
            continue;
        }
        match Notification::from_json_line(&line) {
            Ok(notification) => {
                channel.send(notification);
                count += 1;
            }
            Err(e) => {
                warn!("[CLI] 第 {} 行不是通知，原样透传: {}", line_no, e);
                channel.downstream().write_line(&line);
            }
        }
    }
    Ok(count)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger(&args.log_level, &args.data_dir)?;

    info!("[CLI] 数据目录: {}", args.data_dir.display());

    let ctx = CaptureContext::initialize(&args.data_dir)
        .await
        .context("消息捕获初始化失败")?;

    let sink = LineSink::new(std::io::stdout());
    let Some(channel) = ctx.attach_window(&args.window_url, sink) else {
        return Err(anyhow::anyhow!(
            "窗口 {} 不是消息窗口，没有可捕获的内容",
            args.window_url
        ));
    };

    let replayed = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("打开输入文件失败: {}", path.display()))?;
            replay(file, &channel).await?
        }
        None => replay(tokio::io::stdin(), &channel).await?,
    };
    info!("[CLI] 共回放 {} 条通知", replayed);

    ctx.shutdown(Duration::from_secs(args.drain_timeout)).await;
    info!("[CLI] 程序退出");
    Ok(())
}
