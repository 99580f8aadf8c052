//! 图片上传
//!
//! 通过 HTTP PUT 直接上传到 S3 兼容的对象存储，返回公开访问 URL；
//! 对象存储不可达或拒绝时退回内联 data URL（随消息一起写入数据库）。

use crate::im::serialization::encode_data_url;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 对象存储配置
#[derive(Clone, Debug)]
pub struct BlobStoreConfig {
    /// 例如 `https://s3.eu-central-1.example.com`
    pub endpoint: String,
    pub bucket: String,
    /// 对象 key 前缀
    pub key_prefix: String,
    /// 是否附带 `x-amz-acl: public-read`
    pub public_read: bool,
    pub timeout: Duration,
}

impl BlobStoreConfig {
    pub fn new(endpoint: &str, bucket: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            key_prefix: "chaterly".to_string(),
            public_read: true,
            timeout: Duration::from_secs(30),
        }
    }
}

/// 对象存储协作者
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// 上传文件，返回公开访问 URL
    async fn upload(&self, bytes: &[u8], content_type: &str, file_name: &str) -> Result<String>;
}

/// 上传文件，失败时退回内联 data URL
pub async fn upload_or_inline(
    store: Option<&dyn BlobStore>,
    bytes: &[u8],
    content_type: &str,
    file_name: &str,
) -> String {
    if let Some(store) = store {
        match store.upload(bytes, content_type, file_name).await {
            Ok(url) => return url,
            Err(e) => warn!("[Blob] 上传失败，改用内联 data URL: {:#}", e),
        }
    }
    debug!("[Blob] 内联图片 {} ({} 字节)", file_name, bytes.len());
    encode_data_url(content_type, bytes)
}

/// 文件扩展名：优先取文件名，其次根据 content type 推断
fn extension(file_name: &str, content_type: &str) -> String {
    if let Some((_, ext)) = file_name.rsplit_once('.') {
        if !ext.is_empty() {
            return ext.to_lowercase();
        }
    }
    match content_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "bin",
    }
    .to_string()
}

/// S3 兼容对象存储的 HTTP 实现
pub struct HttpBlobStore {
    client: reqwest::Client,
    config: BlobStoreConfig,
}

impl HttpBlobStore {
    pub fn new(config: BlobStoreConfig) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .timeout(config.timeout)
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self { client, config })
    }

    /// 对象 key：`{prefix}/{毫秒时间戳}_{随机串}.{扩展名}`
    pub fn object_key(&self, file_name: &str, content_type: &str) -> String {
        let random = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{}/{}_{}.{}",
            self.config.key_prefix,
            chrono::Utc::now().timestamp_millis(),
            &random[..8],
            extension(file_name, content_type)
        )
    }

    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.config.endpoint, self.config.bucket, key)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, bytes: &[u8], content_type: &str, file_name: &str) -> Result<String> {
        let url = self.object_url(&self.object_key(file_name, content_type));
        let amz_date = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();

        let mut request = self
            .client
            .put(&url)
            .header("Content-Type", content_type)
            .header("x-amz-date", amz_date)
            .body(bytes.to_vec());
        if self.config.public_read {
            request = request.header("x-amz-acl", "public-read");
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("上传请求失败: {}", url))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("对象存储返回错误 {}: {}", status, text);
        }
        info!("[Blob] ✅ 上传成功: {}", url);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::serialization::decode_data_url;

    #[test]
    fn extension_prefers_file_name() {
        assert_eq!(extension("photo.JPG", "image/png"), "jpg");
        assert_eq!(extension("photo", "image/png"), "png");
        assert_eq!(extension("photo.", "application/x-unknown"), "bin");
    }

    #[test]
    fn object_key_layout() {
        let store = HttpBlobStore::new(BlobStoreConfig::new("https://s3.example.com/", "bucket")).unwrap();
        let key = store.object_key("cat.png", "image/png");
        assert!(key.starts_with("chaterly/"));
        assert!(key.ends_with(".png"));
        assert!(store
            .object_url(&key)
            .starts_with("https://s3.example.com/bucket/chaterly/"));
    }

    #[tokio::test]
    async fn unreachable_store_falls_back_to_data_url() {
        let mut config = BlobStoreConfig::new("http://127.0.0.1:9", "bucket");
        config.timeout = Duration::from_secs(2);
        let store = HttpBlobStore::new(config).unwrap();
        let url = upload_or_inline(Some(&store as &dyn BlobStore), b"img", "image/png", "a.png").await;
        let (content_type, bytes) = decode_data_url(&url).unwrap();
        assert_eq!(content_type, "image/png");
        assert_eq!(bytes, b"img");
    }

    #[tokio::test]
    async fn no_store_inlines() {
        let url = upload_or_inline(None, b"x", "", "x").await;
        assert!(url.starts_with("data:application/octet-stream;base64,"));
    }
}
