// ============================================================================
// 决策契约层 (Decision Schema) - 两条路由路径共用的结构约定，验证失败必须修复
// ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 机器拒收/修复后输出的保守默认置信度。
pub const DEFAULT_CONFIDENCE: f64 = 0.8;

/// 定制分析的保留能力 id，不对应任何真实目录条目。
pub const CUSTOM_ANALYSIS_ID: &str = "custom-analysis";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterAction {
    CallSubagent,
    CombineMultiple,
    Clarify,
    DirectAnswer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CombineStrategy {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMethod {
    Rule,
    Llm,
}

fn default_confidence() -> f64 {
    DEFAULT_CONFIDENCE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterDecision {
    pub action: RouterAction,
    #[serde(default)]
    pub strategy: CombineStrategy,
    #[serde(default)]
    pub subagent_id: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub clarification_question: Option<String>,
    #[serde(default)]
    pub direct_response: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

impl RouterDecision {
    pub fn call_subagent(id: &str, confidence: f64, reason: String) -> Self {
        Self {
            action: RouterAction::CallSubagent,
            strategy: CombineStrategy::Sequential,
            subagent_id: Some(id.to_string()),
            endpoints: Vec::new(),
            params: HashMap::new(),
            reason,
            clarification_question: None,
            direct_response: None,
            confidence,
        }
    }

    /// 兜底决策：分类器输出不可用时的安全替代，永远通过 validate。
    pub fn safe_default(default_agent: &str, reason: String) -> Self {
        let mut d = Self::call_subagent(default_agent, 0.3, reason);
        d.params = HashMap::new();
        d
    }

    /// 结构校验：action 与伴随字段的互斥约束。目录 id 是否存在由调用方查。
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence 越界: {}", self.confidence));
        }
        match self.action {
            RouterAction::CallSubagent => {
                if self.subagent_id.as_deref().map_or(true, |s| s.is_empty()) {
                    return Err("call_subagent 缺少 subagent_id".into());
                }
            }
            RouterAction::CombineMultiple => {
                if self.endpoints.is_empty() {
                    return Err("combine_multiple 的 endpoints 为空".into());
                }
                if self.endpoints.iter().any(|e| e.is_empty()) {
                    return Err("combine_multiple 含空 endpoint".into());
                }
            }
            RouterAction::Clarify => {
                if self
                    .clarification_question
                    .as_deref()
                    .map_or(true, |s| s.trim().is_empty())
                {
                    return Err("clarify 缺少 clarification_question".into());
                }
            }
            RouterAction::DirectAnswer => {
                if self
                    .direct_response
                    .as_deref()
                    .map_or(true, |s| s.trim().is_empty())
                {
                    return Err("direct_answer 缺少 direct_response".into());
                }
            }
        }
        Ok(())
    }

    /// 路由到定制分析路径？
    pub fn is_custom_analysis(&self) -> bool {
        self.action == RouterAction::CallSubagent
            && self.subagent_id.as_deref() == Some(CUSTOM_ANALYSIS_ID)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HybridRoutingResult {
    pub decision: RouterDecision,
    pub routing_method: RoutingMethod,
}
