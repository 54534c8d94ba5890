use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// 子能力调用边界：按 id 调用一个分析能力，拿回整段 markdown 文本。
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        agent_id: &str,
        params: &HashMap<String, serde_json::Value>,
    ) -> Result<String, String>;
}

/// HTTP 网关实现：POST {base}/agent/{id}，body 为参数对象。
pub struct GatewayAgentClient {
    base: String,
    client: reqwest::Client,
}

impl GatewayAgentClient {
    pub fn new(base: &str, timeout_secs: u64) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| format!("客户端创建失败: {}", e))?;
        Ok(Self { base: base.trim_end_matches('/').to_string(), client })
    }
}

#[async_trait]
impl AgentInvoker for GatewayAgentClient {
    async fn invoke(
        &self,
        agent_id: &str,
        params: &HashMap<String, serde_json::Value>,
    ) -> Result<String, String> {
        let resp = self
            .client
            .post(format!("{}/agent/{}", self.base, agent_id))
            .json(params)
            .send()
            .await
            .map_err(|_| format!("分析能力 {} 暂时不可用 (agent unavailable)", agent_id))?;
        if !resp.status().is_success() {
            return Err(format!(
                "分析能力 {} 返回 {}",
                agent_id,
                resp.status().as_u16()
            ));
        }
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|_| format!("分析能力 {} 响应解析失败", agent_id))?;
        json.get("content")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| format!("分析能力 {} 响应缺少 content 字段", agent_id))
    }
}
