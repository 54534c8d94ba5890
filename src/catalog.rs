use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// 能力目录条目。进程启动时装载一次，之后只读。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub required_params: Vec<String>,
    #[serde(default)]
    pub optional_params: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub use_cases: Vec<String>,
}

pub struct AgentCatalog {
    agents: Vec<AgentMetadata>,
}

impl AgentCatalog {
    /// 外部目录文件优先，缺失或解析失败回落到内置表。
    pub fn load(path: Option<&str>) -> Self {
        if let Some(p) = path {
            if Path::new(p).exists() {
                match std::fs::read_to_string(p)
                    .map_err(|e| format!("读取目录失败: {}", e))
                    .and_then(|c| {
                        serde_json::from_str::<Vec<AgentMetadata>>(&c)
                            .map_err(|e| format!("解析目录失败: {}", e))
                    }) {
                    Ok(agents) if !agents.is_empty() => return Self { agents },
                    Ok(_) => log::warn!("目录文件为空，使用内置目录"),
                    Err(e) => log::warn!("{}，使用内置目录", e),
                }
            }
        }
        Self { agents: seed_agents() }
    }

    pub fn get(&self, id: &str) -> Option<&AgentMetadata> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn all(&self) -> &[AgentMetadata] {
        &self.agents
    }

    pub fn count(&self) -> usize {
        self.agents.len()
    }

    /// 给分类器提示词用的目录区块：每行 id + 描述 + 参数。
    pub fn prompt_block(&self) -> String {
        let mut lines = Vec::with_capacity(self.agents.len());
        for a in &self.agents {
            let req = if a.required_params.is_empty() {
                String::new()
            } else {
                format!(" 必填参数: {}", a.required_params.join(","))
            };
            lines.push(format!("- {}: {}{}", a.id, a.description, req));
        }
        lines.join("\n")
    }

    /// 按能力的参数表过滤 params：未知参数丢弃，返回缺失的必填参数名。
    pub fn filter_params(
        &self,
        agent_id: &str,
        params: &HashMap<String, serde_json::Value>,
    ) -> (HashMap<String, serde_json::Value>, Vec<String>) {
        let Some(agent) = self.get(agent_id) else {
            return (HashMap::new(), Vec::new());
        };
        let known = |k: &str| {
            agent.required_params.iter().any(|p| p == k)
                || agent.optional_params.iter().any(|p| p == k)
        };
        let kept: HashMap<String, serde_json::Value> = params
            .iter()
            .filter(|(k, _)| known(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let missing: Vec<String> = agent
            .required_params
            .iter()
            .filter(|p| !kept.contains_key(*p))
            .cloned()
            .collect();
        (kept, missing)
    }
}

/// 内置能力表。目录变更只改这张表，不碰匹配逻辑。
fn seed_agents() -> Vec<AgentMetadata> {
    let a = |id: &str,
             name: &str,
             description: &str,
             required: &[&str],
             optional: &[&str],
             keywords: &[&str],
             use_cases: &[&str]| AgentMetadata {
        id: id.into(),
        name: name.into(),
        description: description.into(),
        required_params: required.iter().map(|s| s.to_string()).collect(),
        optional_params: optional.iter().map(|s| s.to_string()).collect(),
        keywords: keywords.iter().map(|s| s.to_string()).collect(),
        use_cases: use_cases.iter().map(|s| s.to_string()).collect(),
    };
    vec![
        a(
            "weakness-analysis",
            "弱点分析",
            "找出玩家近期表现中最拖后腿的环节（对线、节奏、视野、团战数据）并给出改进建议",
            &[],
            &["role", "time_window_days", "queue"],
            &[
                "weakness", "weaknesses", "弱点", "短板", "不足", "问题在哪", "哪里做得不好",
                "improve", "怎么提升",
            ],
            &["分析我的弱点", "What are my weaknesses", "我最近哪里打得不好"],
        ),
        a(
            "trend-analysis",
            "状态趋势",
            "按时间维度观察胜率与核心指标的走向，判断状态上升还是下滑",
            &[],
            &["time_window_days", "queue", "role"],
            &[
                "trend", "trending", "趋势", "状态", "最近状态", "走势", "form", "近期表现",
                "progress",
            ],
            &["我最近状态怎么样", "Is my win rate trending up"],
        ),
        a(
            "champion-recommend",
            "英雄推荐",
            "基于历史表现与版本数据推荐适合玩家的英雄和分路",
            &[],
            &["role", "queue"],
            &[
                "recommend", "recommendation", "推荐", "该玩什么", "玩哪个英雄", "英雄池",
                "champion pool", "pick", "练什么",
            ],
            &["推荐几个适合我的英雄", "Which champion should I play"],
        ),
        a(
            "matchup-analysis",
            "对线分析",
            "分析指定英雄的对线数据：压制关系、经济差、容错点",
            &["champion"],
            &["role", "queue"],
            &[
                "matchup", "counter", "对线", "打不过", "克制", "被压", "lane",
            ],
            &["我的剑姬对线数据怎么样", "How do I play this matchup"],
        ),
        a(
            "general-analysis",
            "综合分析",
            "整体战绩概览：胜率、常用英雄、位置分布与关键指标汇总。兜底能力",
            &[],
            &["time_window_days", "queue"],
            &[
                "overview", "总体", "整体", "综合", "战绩", "概览", "summary", "stats",
                "数据",
            ],
            &["看看我的整体战绩", "Give me an overview of my stats"],
        ),
    ]
}

/// 固定指标字典。执行器只认这里列出的指标。
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricDef {
    pub id: &'static str,
    pub label: &'static str,
    pub unit: &'static str,
    pub description: &'static str,
}

pub const METRICS: &[MetricDef] = &[
    MetricDef { id: "games", label: "场次", unit: "场", description: "纳入统计的对局数" },
    MetricDef { id: "wins", label: "胜场", unit: "场", description: "获胜对局数" },
    MetricDef { id: "win_rate", label: "胜率", unit: "%", description: "胜场 / 场次" },
    MetricDef { id: "kda", label: "KDA", unit: "", description: "(击杀+助攻) / 死亡" },
    MetricDef { id: "cs_per_min", label: "分均补刀", unit: "个/分", description: "每分钟补刀数" },
    MetricDef { id: "gold_per_min", label: "分均经济", unit: "金/分", description: "每分钟金币收入" },
    MetricDef { id: "damage_share", label: "伤害占比", unit: "%", description: "占全队伤害比例" },
    MetricDef { id: "vision_score", label: "视野评分", unit: "", description: "场均视野得分" },
];

pub fn metric_known(id: &str) -> bool {
    METRICS.iter().any(|m| m.id == id)
}

pub fn metrics_prompt_block() -> String {
    METRICS
        .iter()
        .map(|m| format!("- {}: {} ({})", m.id, m.label, m.description))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_catalog_ids_unique() {
        let catalog = AgentCatalog::load(None);
        let mut seen = std::collections::HashSet::new();
        for a in catalog.all() {
            assert!(seen.insert(a.id.clone()), "重复 id: {}", a.id);
        }
        assert!(catalog.contains("weakness-analysis"));
        assert!(catalog.contains("general-analysis"));
    }

    #[test]
    fn test_custom_analysis_not_in_catalog() {
        let catalog = AgentCatalog::load(None);
        assert!(!catalog.contains(crate::schema::CUSTOM_ANALYSIS_ID));
    }

    #[test]
    fn test_filter_params_drops_unknown() {
        let catalog = AgentCatalog::load(None);
        let mut params = HashMap::new();
        params.insert("role".to_string(), serde_json::json!("jungle"));
        params.insert("favorite_skin".to_string(), serde_json::json!("k/da"));
        let (kept, missing) = catalog.filter_params("weakness-analysis", &params);
        assert_eq!(kept.len(), 1);
        assert!(kept.contains_key("role"));
        assert!(missing.is_empty());
    }

    #[test]
    fn test_filter_params_reports_missing_required() {
        let catalog = AgentCatalog::load(None);
        let params = HashMap::new();
        let (kept, missing) = catalog.filter_params("matchup-analysis", &params);
        assert!(kept.is_empty());
        assert_eq!(missing, vec!["champion".to_string()]);
    }

    #[test]
    fn test_metrics_dict() {
        assert!(metric_known("win_rate"));
        assert!(metric_known("kda"));
        assert!(!metric_known("combat_power"));
        assert!(metrics_prompt_block().contains("win_rate"));
    }

    #[test]
    fn test_prompt_block_lists_every_agent() {
        let catalog = AgentCatalog::load(None);
        let block = catalog.prompt_block();
        for a in catalog.all() {
            assert!(block.contains(&a.id));
        }
    }
}
