//! 远程取数接口
//!
//! 下载核心只通过 [`RemoteFetcher::open_range`] 拉取字节区间，服务器地址发现和鉴权
//! 由外部完成，这里只拿到已解析好的地址和令牌。

pub mod http;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

pub use http::HttpFetcher;

/// 区间字节流
pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// 网络层错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("请求超时")]
    Timeout,
    #[error("连接失败: {0}")]
    Connection(String),
    #[error("HTTP错误: {0}")]
    HttpStatus(u16),
    #[error("服务器不支持 Range 请求")]
    RangeNotSupported,
    #[error("数据流提前结束")]
    Incomplete,
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// 是否属于可以原地重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout
            | FetchError::Connection(_)
            | FetchError::Incomplete
            | FetchError::HttpStatus(_) => true,
            FetchError::RangeNotSupported | FetchError::Other(_) => false,
        }
    }
}

/// 远程资源定位（URL + 令牌）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLocator {
    pub url: String,
    pub access_token: Option<String>,
}

/// 已解析的服务器连接信息
#[derive(Debug, Clone)]
pub struct ServerConnection {
    pub server_id: u64,
    pub base_url: String,
    pub access_token: Option<String>,
}

impl ServerConnection {
    pub fn new(server_id: u64, base_url: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            server_id,
            base_url: base_url.into(),
            access_token,
        }
    }

    /// 拼接文件位置，已经是完整 URL 的直接使用
    pub fn locator(&self, file_location: &str) -> ResourceLocator {
        let url = if file_location.starts_with("http://") || file_location.starts_with("https://")
        {
            file_location.to_string()
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                file_location.trim_start_matches('/')
            )
        };
        ResourceLocator {
            url,
            access_token: self.access_token.clone(),
        }
    }
}

/// 远程区间读取
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// 打开 `[start, end_inclusive]` 区间的字节流
    async fn open_range(
        &self,
        locator: &ResourceLocator,
        start: u64,
        end_inclusive: u64,
    ) -> Result<ByteStream, FetchError>;
}
