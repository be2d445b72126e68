//! RESP 演示服务器。
//!
//! 注册 `PING` 和 `ECHO` 两个命令，并为每个命令记录处理耗时。
//! 执行命令行解析并将参数传递给 `resp_server::run`。
//!
//! 使用 `clap` crate 解析参数。

use resp_server::{
    handler_fn, run, BoxHandler, BoxMiddleware, Semaphore, ServeMux, Server, TracingLogger, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_PORT,
};

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::time::Instant;
use tracing::info;

#[cfg(feature = "otel")]
// 为了能够设置 XrayPropagator
use opentelemetry::global;
#[cfg(feature = "otel")]
// 配置某些选项，例如采样率
use opentelemetry::sdk::trace as sdktrace;
#[cfg(feature = "otel")]
// 为了在服务之间传递相同的 XrayId
use opentelemetry_aws::trace::XrayPropagator;
#[cfg(feature = "otel")]
// `Ext` 特性允许 Registry 接受 OpenTelemetry 特定类型（例如 `OpenTelemetryLayer`）
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter};

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    set_up_logging()?;

    let cli = Cli::parse();
    let port = cli.port.unwrap_or(DEFAULT_PORT);

    let mut semaphore = Semaphore::new(cli.max_connections)?;
    if cli.block {
        semaphore = semaphore.blocking(Duration::from_millis(cli.wait_ms));
    }

    let server = Server::builder()
        .addr(format!("127.0.0.1:{port}"))
        .handler(commands())
        .semaphore(semaphore)
        .logger_factory(TracingLogger::factory())
        .panic_hook(|report| eprintln!("{report}"))
        .build();

    // 绑定一个 TCP 监听器
    let listener = TcpListener::bind(server.addr()).await?;

    run(server, listener, signal::ctrl_c()).await;

    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "resp-server", version, author, about = "一个 RESP 演示服务器")]
struct Cli {
    #[arg(long)]
    port: Option<u16>,

    /// 同时服务的最大连接数
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// 连接数满时等待空闲许可，而不是立即拒绝
    #[arg(long)]
    block: bool,

    /// 配合 `--block` 使用的最长等待时间（毫秒）
    #[arg(long, default_value_t = 100)]
    wait_ms: u64,
}

fn commands() -> ServeMux {
    let mut mux = ServeMux::new();

    mux.handle_func(
        "ping",
        |_ctx, w, req| {
            Box::pin(async move {
                let _ = match req.args().first() {
                    Some(msg) => w.binary(msg).await,
                    None => w.text("PONG").await,
                };
            })
        },
        [timing()],
    );

    mux.handle_func(
        "echo",
        |_ctx, w, req| {
            Box::pin(async move {
                let _ = match req.args() {
                    [msg] => w.binary(msg).await,
                    _ => w.error("ERR wrong number of arguments for 'echo' command").await,
                };
            })
        },
        [timing()],
    );

    mux
}

/// 记录每个命令的处理耗时。
fn timing() -> BoxMiddleware {
    Arc::new(|next: BoxHandler| -> BoxHandler {
        handler_fn(move |ctx, w, req| {
            let next = next.clone();
            Box::pin(async move {
                let start = Instant::now();
                next.serve(ctx, w, req).await;
                info!(cmd = req.cmd(), conn = ctx.conn_id(), elapsed = ?start.elapsed(), "命令完成");
            })
        })
    })
}

#[cfg(not(feature = "otel"))]
fn set_up_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // 参见 https://docs.rs/tracing 获取更多信息
    tracing_subscriber::fmt::try_init()
}

#[cfg(feature = "otel")]
fn set_up_logging() -> Result<(), TryInitError> {
    // 将全局传播器设置为 X-Ray 传播器
    global::set_text_map_propagator(XrayPropagator::default());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(
            sdktrace::config()
                .with_sampler(sdktrace::Sampler::AlwaysOn)
                // 需要将跟踪 ID 转换为 Xray 兼容格式
                .with_id_generator(sdktrace::XrayIdGenerator::default()),
        )
        .install_simple()
        .expect("无法初始化 OtlpPipeline");

    let opentelemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    // 从 `RUST_LOG` 环境变量解析 `EnvFilter` 配置。
    let filter = EnvFilter::from_default_env();

    tracing_subscriber::registry()
        .with(opentelemetry)
        .with(filter)
        .with(fmt::Layer::default())
        .try_init()
}
