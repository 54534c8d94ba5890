use crate::catalog::AgentCatalog;
use crate::llm::{extract_json_object, strip_code_fences, ChatTurn, GenerationService};
use crate::schema::{RouterAction, RouterDecision, CUSTOM_ANALYSIS_ID};
use std::sync::Arc;

/// 解析结果三态：干净 / 修过（带原因） / 彻底失败（带原因）。
/// 失败也会给出安全默认决策，这一层永不向上抛异常。
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Clean,
    Repaired(String),
    Failed(String),
}

pub struct FallbackClassifier {
    catalog: Arc<AgentCatalog>,
    service: Arc<dyn GenerationService>,
    default_agent: String,
    context_turns: usize,
    max_tokens: u32,
}

impl FallbackClassifier {
    pub fn new(
        catalog: Arc<AgentCatalog>,
        service: Arc<dyn GenerationService>,
        default_agent: &str,
        context_turns: usize,
        max_tokens: u32,
    ) -> Self {
        Self {
            catalog,
            service,
            default_agent: default_agent.to_string(),
            context_turns,
            max_tokens,
        }
    }

    /// 调分类器并解析。任何失败都折叠成安全默认决策。
    pub async fn classify(
        &self,
        query: &str,
        history: &[ChatTurn],
        profile: Option<&str>,
    ) -> (RouterDecision, ParseOutcome) {
        let system = self.system_prompt();
        let user = self.user_prompt(query, history, profile);
        match self.service.complete(&system, &user, self.max_tokens).await {
            Ok(raw) => self.parse_reply(&raw),
            Err(e) => {
                let reason = format!("分类器调用失败，回落默认能力: {}", e);
                log::warn!("{}", reason);
                (
                    RouterDecision::safe_default(&self.default_agent, reason.clone()),
                    ParseOutcome::Failed(reason),
                )
            }
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "你是对局数据助手的路由分类器。根据用户问题选择处理方式，只输出一个 JSON 对象，不要输出围栏、注释或多余文字。\n\
             \n\
             可用能力目录:\n{}\n- {}: 目录外的定制统计分析（分组对比、自定义口径）\n\
             \n\
             JSON 字段:\n\
             - action: \"call_subagent\" | \"combine_multiple\" | \"clarify\" | \"direct_answer\"\n\
             - subagent_id: action=call_subagent 时必填\n\
             - endpoints: action=combine_multiple 时必填，能力 id 数组\n\
             - strategy: \"sequential\" | \"parallel\"（仅 combine_multiple）\n\
             - params: 参数映射，只允许目录里列出的参数\n\
             - clarification_question: action=clarify 时必填\n\
             - direct_response: action=direct_answer 时必填\n\
             - reason: 必填，选择依据（审计用）\n\
             - confidence: 0~1",
            self.catalog.prompt_block(),
            CUSTOM_ANALYSIS_ID,
        )
    }

    fn user_prompt(&self, query: &str, history: &[ChatTurn], profile: Option<&str>) -> String {
        let mut out = String::new();
        if let Some(p) = profile {
            out.push_str(&format!("玩家数据概况: {}\n\n", p));
        }
        let tail_start = history.len().saturating_sub(self.context_turns);
        if tail_start < history.len() {
            out.push_str("最近对话:\n");
            for turn in &history[tail_start..] {
                out.push_str(&format!("{}: {}\n", turn.role, turn.content));
            }
            out.push('\n');
        }
        out.push_str(&format!("当前问题: {}", query));
        out
    }

    /// 解码→校验→修复。围栏剥离和花括号截取都算 Repaired。
    pub fn parse_reply(&self, raw: &str) -> (RouterDecision, ParseOutcome) {
        let (text, fenced) = strip_code_fences(raw);

        let (mut decision, mut repairs) = match serde_json::from_str::<RouterDecision>(&text) {
            Ok(d) => (d, Vec::new()),
            Err(first_err) => match extract_json_object(&text)
                .and_then(|obj| serde_json::from_str::<RouterDecision>(&obj).ok())
            {
                Some(d) => (d, vec!["截取花括号后解析成功".to_string()]),
                None => {
                    let reason = format!("JSON 解析失败: {}", first_err);
                    return (
                        RouterDecision::safe_default(&self.default_agent, reason.clone()),
                        ParseOutcome::Failed(reason),
                    );
                }
            },
        };
        if fenced {
            repairs.insert(0, "剥离代码围栏".into());
        }

        self.repair(&mut decision, &mut repairs);

        if let Err(e) = decision.validate() {
            // 修复后仍不合法：换成安全默认，绝不把坏决策交给调用方
            let reason = format!("决策修复失败({})，回落默认能力", e);
            return (
                RouterDecision::safe_default(&self.default_agent, reason.clone()),
                ParseOutcome::Failed(reason),
            );
        }

        if repairs.is_empty() {
            (decision, ParseOutcome::Clean)
        } else {
            let note = repairs.join("; ");
            decision.confidence = decision.confidence.min(crate::schema::DEFAULT_CONFIDENCE);
            decision.reason = format!("{} [修复: {}]", decision.reason, note);
            (decision, ParseOutcome::Repaired(note))
        }
    }

    /// 就地修复常见缺陷：未知能力 id、缺伴随字段、越界置信度、目录外参数。
    fn repair(&self, decision: &mut RouterDecision, repairs: &mut Vec<String>) {
        if !(0.0..=1.0).contains(&decision.confidence) {
            decision.confidence = decision.confidence.clamp(0.0, 1.0);
            repairs.push("confidence 截断到 [0,1]".into());
        }

        match decision.action {
            RouterAction::CallSubagent => {
                let id_ok = decision
                    .subagent_id
                    .as_deref()
                    .map(|id| id == CUSTOM_ANALYSIS_ID || self.catalog.contains(id))
                    .unwrap_or(false);
                if !id_ok {
                    let old = decision.subagent_id.clone().unwrap_or_default();
                    decision.subagent_id = Some(self.default_agent.clone());
                    repairs.push(format!("未知能力 id '{}' 替换为默认", old));
                }
                if let Some(id) = decision.subagent_id.clone() {
                    if id != CUSTOM_ANALYSIS_ID {
                        let (kept, missing) = self.catalog.filter_params(&id, &decision.params);
                        if kept.len() != decision.params.len() {
                            repairs.push("丢弃目录外参数".into());
                        }
                        if !missing.is_empty() {
                            log::debug!("能力 {} 缺少必填参数: {:?}", id, missing);
                        }
                        decision.params = kept;
                    }
                }
            }
            RouterAction::CombineMultiple => {
                // 定制分析不是可调用的能力，不能出现在组合列表里
                let before = decision.endpoints.len();
                let had_custom = decision.endpoints.iter().any(|e| e == CUSTOM_ANALYSIS_ID);
                decision.endpoints.retain(|e| self.catalog.contains(e));
                if decision.endpoints.len() != before {
                    repairs.push("剔除不可组合的 endpoint".into());
                }
                if decision.endpoints.is_empty() {
                    decision.action = RouterAction::CallSubagent;
                    if had_custom {
                        decision.subagent_id = Some(CUSTOM_ANALYSIS_ID.to_string());
                        repairs.push("组合只含定制分析，改走定制分析路径".into());
                    } else {
                        decision.subagent_id = Some(self.default_agent.clone());
                        repairs.push("endpoints 清空后降级为默认能力".into());
                    }
                }
            }
            RouterAction::Clarify | RouterAction::DirectAnswer => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Canned(String);

    #[async_trait]
    impl GenerationService for Canned {
        async fn complete(&self, _s: &str, _u: &str, _m: u32) -> Result<String, String> {
            Ok(self.0.clone())
        }
    }

    struct Down;

    #[async_trait]
    impl GenerationService for Down {
        async fn complete(&self, _s: &str, _u: &str, _m: u32) -> Result<String, String> {
            Err("生成服务暂时不可用".into())
        }
    }

    fn classifier(reply: &str) -> FallbackClassifier {
        FallbackClassifier::new(
            Arc::new(AgentCatalog::load(None)),
            Arc::new(Canned(reply.to_string())),
            "general-analysis",
            3,
            800,
        )
    }

    #[tokio::test]
    async fn test_clean_json_parses_clean() {
        let c = classifier(
            r#"{"action":"call_subagent","subagent_id":"trend-analysis","reason":"近期状态问题","confidence":0.85}"#,
        );
        let (d, outcome) = c.classify("我最近状态怎么样", &[], None).await;
        assert_eq!(outcome, ParseOutcome::Clean);
        assert_eq!(d.subagent_id.as_deref(), Some("trend-analysis"));
        assert_eq!(d.confidence, 0.85);
    }

    #[tokio::test]
    async fn test_fenced_json_repaired() {
        let c = classifier(
            "```json\n{\"action\":\"call_subagent\",\"subagent_id\":\"weakness-analysis\",\"reason\":\"弱点\"}\n```",
        );
        let (d, outcome) = c.classify("q", &[], None).await;
        assert!(matches!(outcome, ParseOutcome::Repaired(_)));
        assert_eq!(d.subagent_id.as_deref(), Some("weakness-analysis"));
        assert!(d.validate().is_ok());
    }

    #[tokio::test]
    async fn test_prose_reply_fails_to_safe_default() {
        let c = classifier("I think you should check X");
        let (d, outcome) = c.classify("q", &[], None).await;
        assert!(matches!(outcome, ParseOutcome::Failed(_)));
        assert_eq!(d.action, RouterAction::CallSubagent);
        assert_eq!(d.subagent_id.as_deref(), Some("general-analysis"));
        assert!(d.confidence < crate::schema::DEFAULT_CONFIDENCE);
        assert!(d.reason.contains("解析失败"));
        assert!(d.validate().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_subagent_repaired_to_default() {
        let c = classifier(
            r#"{"action":"call_subagent","subagent_id":"super-coach-9000","reason":"x"}"#,
        );
        let (d, outcome) = c.classify("q", &[], None).await;
        assert!(matches!(outcome, ParseOutcome::Repaired(_)));
        assert_eq!(d.subagent_id.as_deref(), Some("general-analysis"));
        assert!(d.validate().is_ok());
    }

    #[tokio::test]
    async fn test_missing_companion_field_falls_to_default() {
        // clarify 但没给问题：修不了，必须落安全默认而不是返回坏决策
        let c = classifier(r#"{"action":"clarify","reason":"需要更多信息"}"#);
        let (d, outcome) = c.classify("q", &[], None).await;
        assert!(matches!(outcome, ParseOutcome::Failed(_)));
        assert!(d.validate().is_ok());
        assert_eq!(d.subagent_id.as_deref(), Some("general-analysis"));
    }

    #[tokio::test]
    async fn test_service_down_never_raises() {
        let c = FallbackClassifier::new(
            Arc::new(AgentCatalog::load(None)),
            Arc::new(Down),
            "general-analysis",
            3,
            800,
        );
        let (d, outcome) = c.classify("q", &[], None).await;
        assert!(matches!(outcome, ParseOutcome::Failed(_)));
        assert!(d.validate().is_ok());
    }

    #[tokio::test]
    async fn test_combine_drops_custom_analysis_endpoint() {
        // 定制分析走不了能力调用通道，留在 endpoints 里只会得到"不可用"段落
        let c = classifier(
            r#"{"action":"combine_multiple","endpoints":["custom-analysis","weakness-analysis"],"reason":"组合"}"#,
        );
        let (d, outcome) = c.classify("q", &[], None).await;
        assert!(matches!(outcome, ParseOutcome::Repaired(_)));
        assert_eq!(d.action, RouterAction::CombineMultiple);
        assert_eq!(d.endpoints, vec!["weakness-analysis".to_string()]);
    }

    #[tokio::test]
    async fn test_combine_of_only_custom_analysis_reroutes() {
        let c = classifier(
            r#"{"action":"combine_multiple","endpoints":["custom-analysis"],"reason":"对比"}"#,
        );
        let (d, outcome) = c.classify("q", &[], None).await;
        assert!(matches!(outcome, ParseOutcome::Repaired(_)));
        assert_eq!(d.action, RouterAction::CallSubagent);
        assert!(d.is_custom_analysis());
        assert!(d.validate().is_ok());
    }

    #[tokio::test]
    async fn test_combine_with_unknown_endpoint_pruned() {
        let c = classifier(
            r#"{"action":"combine_multiple","endpoints":["weakness-analysis","made-up"],"strategy":"parallel","reason":"组合"}"#,
        );
        let (d, outcome) = c.classify("q", &[], None).await;
        assert!(matches!(outcome, ParseOutcome::Repaired(_)));
        assert_eq!(d.endpoints, vec!["weakness-analysis".to_string()]);
        assert_eq!(d.strategy, crate::schema::CombineStrategy::Parallel);
    }

    #[test]
    fn test_fuzz_malformed_always_valid() {
        let c = classifier("");
        let cases = [
            "",
            "null",
            "[]",
            "{}",
            "{\"action\":\"fly_to_moon\"}",
            "{\"action\":\"call_subagent\"}",
            "{\"action\":\"call_subagent\",\"subagent_id\":\"\"}",
            "{\"action\":\"combine_multiple\",\"endpoints\":[]}",
            "{\"action\":\"direct_answer\"}",
            "{\"action\":\"call_subagent\",\"subagent_id\":\"trend-analysis\",\"confidence\":7.5}",
            "```\ngarbage\n```",
            "{\"action\":\"clarify\",\"clarification_question\":\"  \"}",
            "{ truncated",
        ];
        for raw in cases {
            let (d, _) = c.parse_reply(raw);
            assert!(d.validate().is_ok(), "raw={:?} 产生了非法决策", raw);
        }
    }

    #[test]
    fn test_context_tail_bounded() {
        let c = classifier("{}");
        let history: Vec<ChatTurn> = (0..10)
            .map(|i| ChatTurn { role: "user".into(), content: format!("回合{}", i) })
            .collect();
        let prompt = c.user_prompt("当前", &history, None);
        assert!(!prompt.contains("回合6"));
        assert!(prompt.contains("回合7"));
        assert!(prompt.contains("回合9"));
        assert!(prompt.contains("当前"));
    }
}
