/// 跟踪服务端 (Tracking Server)
///
/// 监听线程接受连接, 每个连接一个会话线程
/// - Session: 单连接的跟踪状态机
pub mod session;

pub use session::{RetryPolicy, SessionEnd, SessionStats, TrackSession};

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::config::TrackerConfig;
use crate::detection::Detector;
use crate::error::DetectError;
use crate::protocol::Channel;

/// 跟踪服务端: 每个会话通过工厂创建自己的检测器
pub struct TrackServer<F> {
    listener: TcpListener,
    config: Arc<TrackerConfig>,
    factory: Arc<F>,
}

impl<F, D> TrackServer<F>
where
    F: Fn() -> Result<D, DetectError> + Send + Sync + 'static,
    D: Detector + 'static,
{
    pub fn bind(addr: impl ToSocketAddrs, config: TrackerConfig, factory: F) -> Result<Self> {
        let listener = TcpListener::bind(addr).context("监听地址绑定失败")?;
        info!("🚀 跟踪服务启动: {}", listener.local_addr()?);
        Ok(Self {
            listener,
            config: Arc::new(config),
            factory: Arc::new(factory),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受连接直到监听器出错; 单个连接失败不影响其它会话
    pub fn serve(&self) -> Result<()> {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(e) = self.spawn_session(stream) {
                        warn!("⚠️ 会话启动失败: {:#}", e);
                    }
                }
                Err(e) => warn!("⚠️ 接受连接失败: {}", e),
            }
        }
        Ok(())
    }

    /// 为一个已接受的连接启动会话线程
    pub fn spawn_session(&self, stream: TcpStream) -> Result<JoinHandle<()>> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!("🔗 新连接: {}", peer);

        let config = self.config.clone();
        let factory = self.factory.clone();

        let handle = thread::Builder::new()
            .name(format!("session-{}", peer))
            .spawn(move || {
                if let Err(e) = run_session(stream, &config, factory.as_ref()) {
                    error!("❌ 会话 {} 异常: {:#}", peer, e);
                }
            })
            .context("会话线程创建失败")?;
        Ok(handle)
    }
}

fn run_session<F, D>(stream: TcpStream, config: &TrackerConfig, factory: &F) -> Result<()>
where
    F: Fn() -> Result<D, DetectError>,
    D: Detector,
{
    stream.set_nodelay(true).ok();
    let detector = factory().context("检测器创建失败")?;

    let mut channel = Channel::with_limits(stream, config.network.max_message_size, 4096);
    channel
        .set_recv_timeout(Some(config.network.recv_timeout()))
        .context("设置读超时失败")?;
    let peer = channel.peer();

    let mut session = TrackSession::new(detector, &config.detection);
    let end = session.run(&mut channel, &RetryPolicy::from(&config.network));

    info!("👋 会话结束 {}: {}", peer, end);
    info!("📊 {}", session.stats());
    Ok(())
}
