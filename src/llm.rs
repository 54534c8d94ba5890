use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

/// 一轮会话。history 只取尾部若干轮进提示词。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// 生成服务边界。唯一的非确定性组件，输出永远要经过校验修复。
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn complete(&self, system: &str, user: &str, max_tokens: u32) -> Result<String, String>;

    /// 流式生成：增量文本推入 tx。默认实现退化为一次性整段。
    async fn complete_stream(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        tx: mpsc::Sender<String>,
    ) -> Result<(), String> {
        let text = self.complete(system, user, max_tokens).await?;
        tx.send(text).await.map_err(|_| "接收端已关闭".to_string())?;
        Ok(())
    }
}

/// HTTP 网关客户端：POST {base}/generate、{base}/generate_stream。
pub struct GatewayClient {
    base: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl GatewayClient {
    pub fn new(base: &str, timeout_secs: u64) -> Result<Self, String> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("客户端创建失败: {}", e))?;
        Ok(Self { base: base.trim_end_matches('/').to_string(), client, timeout })
    }
}

#[async_trait]
impl GenerationService for GatewayClient {
    async fn complete(&self, system: &str, user: &str, max_tokens: u32) -> Result<String, String> {
        let resp = self
            .client
            .post(format!("{}/generate", self.base))
            .json(&serde_json::json!({
                "system": system,
                "prompt": user,
                "max_tokens": max_tokens,
            }))
            .send()
            .await
            .map_err(|_| "生成服务暂时不可用".to_string())?;
        if !resp.status().is_success() {
            return Err(format!("生成服务返回 {}", resp.status().as_u16()));
        }
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|_| "生成服务响应解析失败".to_string())?;
        json.get("text")
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| "生成服务响应缺少 text 字段".to_string())
    }

    async fn complete_stream(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        tx: mpsc::Sender<String>,
    ) -> Result<(), String> {
        // 流式端点逐行返回 NDJSON: {"delta":"..."}，末行 {"done":true}
        let resp = self
            .client
            .post(format!("{}/generate_stream", self.base))
            .timeout(self.timeout.saturating_mul(4))
            .json(&serde_json::json!({
                "system": system,
                "prompt": user,
                "max_tokens": max_tokens,
            }))
            .send()
            .await
            .map_err(|_| "生成服务暂时不可用".to_string())?;
        if !resp.status().is_success() {
            return Err(format!("生成服务返回 {}", resp.status().as_u16()));
        }

        let mut stream = Box::pin(resp.bytes_stream());
        let mut buf = String::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|_| "生成流中断".to_string())?;
            buf.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim().to_string();
                buf.drain(..=pos);
                if line.is_empty() {
                    continue;
                }
                let v: serde_json::Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if v.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
                    return Ok(());
                }
                if let Some(delta) = v.get("delta").and_then(|d| d.as_str()) {
                    if !delta.is_empty() && tx.send(delta.to_string()).await.is_err() {
                        // 消费端断开，立即停止向生成服务要后续分片
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

/// 剥掉 markdown 代码围栏。返回 (文本, 是否剥过)。
pub fn strip_code_fences(raw: &str) -> (String, bool) {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return (trimmed.to_string(), false);
    }
    let mut inner = trimmed.trim_start_matches('`');
    // 语言标注（json / javascript 等）到首个换行为止
    if let Some(nl) = inner.find('\n') {
        inner = &inner[nl + 1..];
    }
    let inner = inner.trim_end().trim_end_matches('`').trim();
    (inner.to_string(), true)
}

/// 常见格式问题兜底：定位首个 '{' 与末个 '}' 之间的对象。
pub fn extract_json_object(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end > start {
        Some(raw[start..=end].to_string())
    } else {
        None
    }
}
