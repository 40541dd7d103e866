//! 基于 reqwest 的区间下载实现

use super::{ByteStream, FetchError, RemoteFetcher, ResourceLocator};
use crate::config::DownloadConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use tracing::{debug, warn};

/// 媒体服务器令牌请求头
const TOKEN_HEADER: &str = "X-Plex-Token";

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// 不设置整体超时（大文件一个区间可能下载很久），单次读取超时由 worker 控制
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("media-ripper/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout())
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_keepalive(std::time::Duration::from_secs(60))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("创建HTTP客户端失败")?;
        Ok(Self { client })
    }
}

fn map_request_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else if let Some(status) = err.status() {
        FetchError::HttpStatus(status.as_u16())
    } else {
        FetchError::Connection(err.to_string())
    }
}

/// 解析 `Content-Range: bytes <start>-<end>/<total>` 的起始偏移
fn content_range_start(headers: &header::HeaderMap) -> Option<u64> {
    let value = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn open_range(
        &self,
        locator: &ResourceLocator,
        start: u64,
        end_inclusive: u64,
    ) -> Result<ByteStream, FetchError> {
        debug!("Range 请求: {} bytes={}-{}", locator.url, start, end_inclusive);

        let mut request = self
            .client
            .get(&locator.url)
            .header(header::RANGE, format!("bytes={}-{}", start, end_inclusive));
        if let Some(token) = &locator.access_token {
            request = request.header(TOKEN_HEADER, token);
        }

        let resp = request.send().await.map_err(map_request_error)?;
        let status = resp.status();

        // 200 只在从头请求时可以接受（服务器忽略了 Range 但返回的就是整个文件）
        match status {
            // 返回的区间必须从请求的偏移开始，否则字节会写到错误的位置
            StatusCode::PARTIAL_CONTENT => match content_range_start(resp.headers()) {
                Some(offset) if offset == start => {}
                other => {
                    warn!(
                        "Content-Range 与请求不一致: {} 请求起点 {}，响应 {:?}",
                        locator.url, start, other
                    );
                    return Err(FetchError::RangeNotSupported);
                }
            },
            StatusCode::OK if start == 0 => {}
            s if s.is_success() => return Err(FetchError::RangeNotSupported),
            s => return Err(FetchError::HttpStatus(s.as_u16())),
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_request_error));
        Ok(stream.boxed())
    }
}
