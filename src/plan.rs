use crate::catalog::{metric_known, metrics_prompt_block};
use crate::llm::{extract_json_object, strip_code_fences, GenerationService};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 时间窗口谓词：最近 last_days 天，再整体前移 offset_days 天。
/// 两项都缺省则匹配全部时间。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeFilter {
    #[serde(default)]
    pub last_days: Option<u32>,
    #[serde(default)]
    pub offset_days: Option<u32>,
}

impl TimeFilter {
    /// 窗口为左开右闭 (start, end]：相邻窗口（近30天 / 前移30天的30天）
    /// 共享边界时，边界上的记录只落进其中一个。
    pub fn contains(&self, ts: u64, now: u64) -> bool {
        const DAY: u64 = 86_400;
        let end = now.saturating_sub(self.offset_days.unwrap_or(0) as u64 * DAY);
        if ts > end {
            return false;
        }
        if let Some(last) = self.last_days {
            let start = end.saturating_sub(last as u64 * DAY);
            if ts <= start {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub value: String,
}

/// 没有任何谓词的分组匹配全部数据，作为基线组是合法的。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataGroup {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub time_filter: Option<TimeFilter>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub comparison_type: String,
    #[serde(default)]
    pub output_format: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub data_groups: Vec<DataGroup>,
    #[serde(default)]
    pub metrics: Vec<String>,
    /// 校验阶段丢弃项的记录，随报告透出，不中断执行。
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanError {
    /// 有效分组或指标为零：要求用户澄清，绝不端出空数据冒充分析。
    NeedClarification(String),
    Generation(String),
}

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanError::NeedClarification(q) => write!(f, "需要澄清: {}", q),
            PlanError::Generation(e) => write!(f, "计划生成失败: {}", e),
        }
    }
}

/// 校验并修剪计划：分组名去重、未知指标丢弃并记录原因；
/// 剪完为空则整体失败为澄清请求。
pub fn validate_plan(mut plan: Plan) -> Result<Plan, PlanError> {
    let mut seen = std::collections::HashSet::new();
    let mut groups = Vec::with_capacity(plan.data_groups.len());
    for g in plan.data_groups {
        if g.name.trim().is_empty() {
            plan.dropped.push("丢弃无名分组".into());
            continue;
        }
        if !seen.insert(g.name.clone()) {
            plan.dropped.push(format!("丢弃重名分组 '{}'", g.name));
            continue;
        }
        groups.push(g);
    }
    plan.data_groups = groups;

    let mut metric_seen = std::collections::HashSet::new();
    let mut metrics = Vec::with_capacity(plan.metrics.len());
    for m in plan.metrics {
        if !metric_known(&m) {
            plan.dropped.push(format!("丢弃未知指标 '{}'", m));
            continue;
        }
        if metric_seen.insert(m.clone()) {
            metrics.push(m);
        }
    }
    plan.metrics = metrics;

    if plan.data_groups.is_empty() {
        return Err(PlanError::NeedClarification(
            "没能从问题里确定要统计哪些数据分组，能说得具体一点吗？比如时间范围或英雄/位置。".into(),
        ));
    }
    if plan.metrics.is_empty() {
        return Err(PlanError::NeedClarification(
            "没能确定要看的指标。想看胜率、KDA 还是分均补刀之类？".into(),
        ));
    }
    Ok(plan)
}

/// 定制分析路径的计划生成器。提示词只描述聚合数据形状，不喂原始对局。
pub struct PlanGenerator {
    service: Arc<dyn GenerationService>,
    max_tokens: u32,
}

impl PlanGenerator {
    pub fn new(service: Arc<dyn GenerationService>, max_tokens: u32) -> Self {
        Self { service, max_tokens }
    }

    pub async fn generate(&self, query: &str, profile: &str) -> Result<Plan, PlanError> {
        let system = format!(
            "你是对局数据助手的分析规划器。把用户问题转成一个统计计划，只输出 JSON 对象。\n\
             \n\
             数据为按 (英雄, 位置, 队列, 版本) 预聚合的记录，每条含 games/wins 与指标字段。\n\
             可用指标:\n{}\n\
             \n\
             JSON 形状:\n\
             {{\"comparison_type\": \"time_periods|champions|roles|queues|single\",\n\
               \"output_format\": \"comparison_table|summary|trend\",\n\
               \"explanation\": \"一句话说明统计口径\",\n\
               \"data_groups\": [{{\"name\": \"组名(组内唯一)\",\n\
                                  \"time_filter\": {{\"last_days\": 30, \"offset_days\": 0}},\n\
                                  \"conditions\": [{{\"field\": \"champion|role|queue|patch\", \"value\": \"...\"}}]}}],\n\
               \"metrics\": [\"win_rate\", ...]}}\n\
             \n\
             time_filter 与 conditions 都可省略；都省略的组是全量基线组。",
            metrics_prompt_block(),
        );
        let user = format!("玩家数据概况: {}\n\n用户问题: {}", profile, query);

        let raw = self
            .service
            .complete(&system, &user, self.max_tokens)
            .await
            .map_err(PlanError::Generation)?;

        let (text, _) = strip_code_fences(&raw);
        let parsed: Plan = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(first_err) => match extract_json_object(&text)
                .and_then(|obj| serde_json::from_str(&obj).ok())
            {
                Some(p) => p,
                None => {
                    return Err(PlanError::Generation(format!(
                        "计划 JSON 解析失败: {}",
                        first_err
                    )))
                }
            },
        };

        let mut plan = validate_plan(parsed)?;
        plan.query = query.to_string();
        if !plan.dropped.is_empty() {
            log::info!("PLAN 修剪: {}", plan.dropped.join("; "));
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn plan_with(groups: Vec<DataGroup>, metrics: Vec<&str>) -> Plan {
        Plan {
            query: "q".into(),
            comparison_type: "time_periods".into(),
            output_format: "comparison_table".into(),
            explanation: String::new(),
            data_groups: groups,
            metrics: metrics.into_iter().map(|s| s.to_string()).collect(),
            dropped: Vec::new(),
        }
    }

    fn group(name: &str) -> DataGroup {
        DataGroup { name: name.into(), time_filter: None, conditions: vec![] }
    }

    #[test]
    fn test_duplicate_group_deduped() {
        let plan = plan_with(vec![group("近30天"), group("近30天"), group("之前30天")], vec!["win_rate"]);
        let out = validate_plan(plan).unwrap();
        assert_eq!(out.data_groups.len(), 2);
        assert!(out.dropped.iter().any(|d| d.contains("重名")));
    }

    #[test]
    fn test_unknown_metric_dropped_with_reason() {
        let plan = plan_with(vec![group("全部")], vec!["win_rate", "combat_power"]);
        let out = validate_plan(plan).unwrap();
        assert_eq!(out.metrics, vec!["win_rate".to_string()]);
        assert!(out.dropped.iter().any(|d| d.contains("combat_power")));
    }

    #[test]
    fn test_zero_groups_is_clarification() {
        let plan = plan_with(vec![], vec!["win_rate"]);
        assert!(matches!(
            validate_plan(plan),
            Err(PlanError::NeedClarification(_))
        ));
    }

    #[test]
    fn test_all_metrics_unknown_is_clarification() {
        let plan = plan_with(vec![group("全部")], vec!["combat_power", "tilt_index"]);
        assert!(matches!(
            validate_plan(plan),
            Err(PlanError::NeedClarification(_))
        ));
    }

    #[test]
    fn test_baseline_group_without_predicates_valid() {
        let plan = plan_with(vec![group("全量基线")], vec!["games", "win_rate"]);
        let out = validate_plan(plan).unwrap();
        assert_eq!(out.data_groups.len(), 1);
        assert!(out.data_groups[0].time_filter.is_none());
        assert!(out.data_groups[0].conditions.is_empty());
    }

    #[test]
    fn test_time_filter_window() {
        let now = 100 * 86_400;
        let f = TimeFilter { last_days: Some(30), offset_days: Some(30) };
        assert!(f.contains(55 * 86_400, now));
        assert!(!f.contains(80 * 86_400, now));
        assert!(!f.contains(30 * 86_400, now));
        let open = TimeFilter::default();
        assert!(open.contains(0, now));
        assert!(open.contains(now, now));
    }

    #[test]
    fn test_adjacent_windows_share_no_boundary_record() {
        // 正好落在 now - 30天 的记录只归前一个窗口，不被两个窗口重复统计
        let now = 100 * 86_400;
        let boundary = 70 * 86_400;
        let recent = TimeFilter { last_days: Some(30), offset_days: None };
        let prior = TimeFilter { last_days: Some(30), offset_days: Some(30) };
        assert!(!recent.contains(boundary, now));
        assert!(prior.contains(boundary, now));
        assert!(recent.contains(now, now));
        assert!(!prior.contains(40 * 86_400, now));
    }

    struct Canned(String);

    #[async_trait]
    impl GenerationService for Canned {
        async fn complete(&self, _s: &str, _u: &str, _m: u32) -> Result<String, String> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_generate_parses_fenced_plan() {
        let reply = "```json\n{\"comparison_type\":\"time_periods\",\"output_format\":\"comparison_table\",\"explanation\":\"近30天对比前30天\",\"data_groups\":[{\"name\":\"近30天\",\"time_filter\":{\"last_days\":30}},{\"name\":\"之前30天\",\"time_filter\":{\"last_days\":30,\"offset_days\":30}}],\"metrics\":[\"win_rate\",\"kda\"]}\n```";
        let gen = PlanGenerator::new(Arc::new(Canned(reply.into())), 800);
        let plan = gen.generate("对比最近30天和之前30天", "共340场").await.unwrap();
        assert_eq!(plan.query, "对比最近30天和之前30天");
        assert_eq!(plan.data_groups.len(), 2);
        assert_eq!(plan.metrics, vec!["win_rate".to_string(), "kda".to_string()]);
    }

    #[tokio::test]
    async fn test_generate_prose_reply_is_generation_error() {
        let gen = PlanGenerator::new(Arc::new(Canned("让我想想该怎么分析".into())), 800);
        let err = gen.generate("q", "p").await.unwrap_err();
        assert!(matches!(err, PlanError::Generation(_)));
    }
}
