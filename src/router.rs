use crate::catalog::AgentCatalog;
use crate::fallback::{FallbackClassifier, ParseOutcome};
use crate::llm::ChatTurn;
use crate::matcher::PatternMatcher;
use crate::schema::{HybridRoutingResult, RouterDecision, RoutingMethod, CUSTOM_ANALYSIS_ID};
use std::sync::Arc;

/// 规则路由：确定性快路径。接受则零网络开销，拒绝是常态不是错误。
pub struct RuleRouter {
    catalog: Arc<AgentCatalog>,
    matcher: PatternMatcher,
    threshold: f64,
}

impl RuleRouter {
    pub fn new(catalog: Arc<AgentCatalog>, threshold: f64) -> Self {
        let matcher = PatternMatcher::new(catalog.clone());
        Self { catalog, matcher, threshold }
    }

    /// 接受返回 Some(决策)，无把握返回 None——后者是触发 LLM 兜底的唯一条件。
    pub fn route(&self, query: &str) -> Option<RouterDecision> {
        // 对比意图优先于任何单能力关键词命中
        if self.matcher.detect_comparison(query) {
            let mut d = RouterDecision::call_subagent(
                CUSTOM_ANALYSIS_ID,
                0.85,
                "命中对比措辞，转定制分析".into(),
            );
            d.params = crate::matcher::extract_params(&query.to_lowercase());
            return Some(d);
        }

        let m = self.matcher.best_match(query)?;
        if m.confidence < self.threshold {
            return None;
        }
        let (params, missing) = self.catalog.filter_params(&m.subagent_id, &m.extracted_params);
        if !missing.is_empty() {
            log::debug!("规则路由 {} 缺少必填参数: {:?}", m.subagent_id, missing);
        }
        let mut d = RouterDecision::call_subagent(
            &m.subagent_id,
            m.confidence,
            format!("关键词命中: {}", m.matched_keywords.join(", ")),
        );
        d.params = params;
        Some(d)
    }
}

/// 混合路由入口：规则先行，拒绝才进 LLM，且每次 route 至多调一次分类器。
pub struct HybridRouter {
    rule: RuleRouter,
    fallback: FallbackClassifier,
}

impl HybridRouter {
    pub fn new(rule: RuleRouter, fallback: FallbackClassifier) -> Self {
        Self { rule, fallback }
    }

    pub async fn route(
        &self,
        query: &str,
        history: &[ChatTurn],
        profile: Option<&str>,
    ) -> HybridRoutingResult {
        if let Some(decision) = self.rule.route(query) {
            log::info!(
                "ROUTE rule → {} ({:.2})",
                decision.subagent_id.as_deref().unwrap_or("-"),
                decision.confidence
            );
            return HybridRoutingResult { decision, routing_method: RoutingMethod::Rule };
        }

        let (decision, outcome) = self.fallback.classify(query, history, profile).await;
        match &outcome {
            ParseOutcome::Clean => log::info!("ROUTE llm → {:?}", decision.action),
            ParseOutcome::Repaired(note) => log::info!("ROUTE llm(修复: {}) → {:?}", note, decision.action),
            ParseOutcome::Failed(reason) => log::warn!("ROUTE llm 失败兜底: {}", reason),
        }
        HybridRoutingResult { decision, routing_method: RoutingMethod::Llm }
    }
}
