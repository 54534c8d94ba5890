use crate::catalog::AgentCatalog;
use std::collections::HashMap;
use std::sync::Arc;

/// 单个能力对一条查询的打分结果。不落盘。
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub subagent_id: String,
    pub confidence: f64,
    pub extracted_params: HashMap<String, serde_json::Value>,
    pub matched_keywords: Vec<String>,
}

/// 对比/比较措辞标记。命中即走定制分析路径，优先级高于单能力关键词。
const COMPARISON_MARKERS: &[&str] = &[
    " vs ", " vs. ", "versus", "compare", "compared", "对比", "比较", "相比", "差异", "差别",
    "前后变化", "哪个更", "谁更",
];

pub struct PatternMatcher {
    catalog: Arc<AgentCatalog>,
}

impl PatternMatcher {
    pub fn new(catalog: Arc<AgentCatalog>) -> Self {
        Self { catalog }
    }

    /// 全目录打分取最优。无任何关键词命中返回 None——正常返回值，不是错误。
    pub fn best_match(&self, query: &str) -> Option<RuleMatch> {
        let lower = query.to_lowercase();
        let query_chars = lower.chars().count().max(1);
        let mut best: Option<(RuleMatch, usize)> = None;

        for agent in self.catalog.all() {
            let mut matched: Vec<&str> = Vec::new();
            for kw in &agent.keywords {
                let k = kw.to_lowercase();
                let hit = if k.is_ascii() {
                    contains_word(&lower, &k)
                } else {
                    lower.contains(&k)
                };
                if hit {
                    matched.push(kw.as_str());
                }
            }
            if matched.is_empty() {
                continue;
            }

            let distinct = matched.len();
            let covered: usize = matched.iter().map(|k| k.chars().count()).sum();
            let coverage = (covered as f64 / query_chars as f64).min(1.0);
            let confidence = (0.45 + 0.15 * distinct as f64 + 0.35 * coverage).min(0.97);
            let longest = matched.iter().map(|k| k.chars().count()).max().unwrap_or(0);

            let candidate = RuleMatch {
                subagent_id: agent.id.clone(),
                confidence,
                extracted_params: extract_params(&lower),
                matched_keywords: matched.iter().map(|s| s.to_string()).collect(),
            };

            // 平局顺序：分数 > 关键词数 > 最长关键词 > 目录顺序（先到先得）。
            let better = match &best {
                None => true,
                Some((b, b_longest)) => {
                    if candidate.confidence != b.confidence {
                        candidate.confidence > b.confidence
                    } else if candidate.matched_keywords.len() != b.matched_keywords.len() {
                        candidate.matched_keywords.len() > b.matched_keywords.len()
                    } else {
                        longest > *b_longest
                    }
                }
            };
            if better {
                best = Some((candidate, longest));
            }
        }

        best.map(|(m, _)| m)
    }

    /// 对比意图检测：显式比较措辞，或同时出现两个时间窗口。
    pub fn detect_comparison(&self, query: &str) -> bool {
        let lower = query.to_lowercase();
        if COMPARISON_MARKERS.iter().any(|m| lower.contains(m)) {
            return true;
        }
        let recent = lower.contains("last") || lower.contains("最近") || lower.contains("近期");
        let prior = lower.contains("previous") || lower.contains("之前") || lower.contains("上个");
        recent && prior
    }
}

/// ASCII 关键词按词边界匹配，避免 "top" 误命中 "stop"。CJK 走子串。
fn contains_word(haystack: &str, word: &str) -> bool {
    let bytes = haystack.as_bytes();
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(word) {
        let i = start + pos;
        let before_ok = i == 0 || !bytes[i - 1].is_ascii_alphanumeric();
        let end = i + word.len();
        let after_ok = end >= bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if before_ok && after_ok {
            return true;
        }
        start = i + 1;
        if start >= haystack.len() {
            break;
        }
    }
    false
}

/// 从查询文本解析结构化参数：位置、时间窗口、队列。输入已转小写。
pub fn extract_params(lower: &str) -> HashMap<String, serde_json::Value> {
    let mut params = HashMap::new();

    const ROLES: &[(&str, &str)] = &[
        ("top", "top"), ("上单", "top"),
        ("jungle", "jungle"), ("打野", "jungle"),
        ("mid", "mid"), ("中单", "mid"), ("中路", "mid"),
        ("adc", "adc"), ("下路", "adc"), ("射手", "adc"),
        ("support", "support"), ("辅助", "support"),
    ];
    for (kw, canonical) in ROLES {
        let hit = if kw.is_ascii() { contains_word(lower, kw) } else { lower.contains(kw) };
        if hit {
            params.insert("role".to_string(), serde_json::json!(canonical));
            break;
        }
    }

    const QUEUES: &[(&str, &str)] = &[
        ("排位", "ranked"), ("ranked", "ranked"), ("solo", "ranked"),
        ("匹配", "normal"), ("normal", "normal"),
        ("大乱斗", "aram"), ("aram", "aram"),
    ];
    for (kw, canonical) in QUEUES {
        let hit = if kw.is_ascii() { contains_word(lower, kw) } else { lower.contains(kw) };
        if hit {
            params.insert("queue".to_string(), serde_json::json!(canonical));
            break;
        }
    }

    if let Some(days) = extract_days(lower) {
        params.insert("time_window_days".to_string(), serde_json::json!(days));
    }

    params
}

fn extract_days(lower: &str) -> Option<u32> {
    let chars: Vec<char> = lower.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_ascii_digit() {
            let mut j = i;
            let mut n: u32 = 0;
            while j < chars.len() && chars[j].is_ascii_digit() {
                n = n.saturating_mul(10).saturating_add(chars[j] as u32 - '0' as u32);
                j += 1;
            }
            let rest: String = chars[j..].iter().collect();
            let rest = rest.trim_start();
            if rest.starts_with('天') || rest.starts_with("day") {
                if n > 0 && n <= 3650 {
                    return Some(n);
                }
            }
            if rest.starts_with("week") || rest.starts_with('周') {
                if n > 0 && n <= 520 {
                    return Some(n * 7);
                }
            }
            i = j;
        } else {
            i += 1;
        }
    }
    if lower.contains("一周") || lower.contains("本周") || lower.contains("this week") {
        return Some(7);
    }
    if lower.contains("两周") {
        return Some(14);
    }
    if lower.contains("一个月") || lower.contains("这个月") || lower.contains("this month") {
        return Some(30);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> PatternMatcher {
        PatternMatcher::new(Arc::new(AgentCatalog::load(None)))
    }

    #[test]
    fn test_weakness_query_scores_above_threshold() {
        let m = matcher().best_match("analyze my weaknesses").unwrap();
        assert_eq!(m.subagent_id, "weakness-analysis");
        assert!(m.confidence >= 0.7, "confidence={}", m.confidence);
        assert!(m.matched_keywords.iter().any(|k| k == "weaknesses"));
    }

    #[test]
    fn test_weakness_query_zh() {
        let m = matcher().best_match("分析我的弱点").unwrap();
        assert_eq!(m.subagent_id, "weakness-analysis");
        assert!(m.confidence >= 0.7, "confidence={}", m.confidence);
    }

    #[test]
    fn test_vague_query_below_threshold() {
        let m = matcher().best_match("帮我随便看看最近打的这些对局数据情况怎么样啊");
        if let Some(m) = m {
            assert!(m.confidence < 0.7, "confidence={}", m.confidence);
        }
    }

    #[test]
    fn test_no_keyword_is_none_not_error() {
        assert!(matcher().best_match("hello there").is_none());
    }

    #[test]
    fn test_deterministic_output() {
        let a = matcher().best_match("推荐几个英雄").unwrap();
        let b = matcher().best_match("推荐几个英雄").unwrap();
        assert_eq!(a.subagent_id, b.subagent_id);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.matched_keywords, b.matched_keywords);
    }

    #[test]
    fn test_comparison_phrasing_en() {
        let m = matcher();
        assert!(m.detect_comparison("Compare my last 30 days vs previous 30 days"));
        assert!(m.detect_comparison("my winrate this patch versus last patch"));
    }

    #[test]
    fn test_comparison_phrasing_zh() {
        let m = matcher();
        assert!(m.detect_comparison("对比一下我最近30天和之前30天的表现"));
        assert!(m.detect_comparison("我打野和中单哪个更强"));
    }

    #[test]
    fn test_plain_query_not_comparison() {
        let m = matcher();
        assert!(!m.detect_comparison("分析我的弱点"));
        assert!(!m.detect_comparison("what are my weaknesses"));
    }

    #[test]
    fn test_word_boundary_for_ascii() {
        assert!(contains_word("play top lane", "top"));
        assert!(!contains_word("please stop feeding", "top"));
        assert!(contains_word("top", "top"));
    }

    #[test]
    fn test_extract_role_and_queue() {
        let p = extract_params("我打野排位最近30天的表现");
        assert_eq!(p.get("role"), Some(&serde_json::json!("jungle")));
        assert_eq!(p.get("queue"), Some(&serde_json::json!("ranked")));
        assert_eq!(p.get("time_window_days"), Some(&serde_json::json!(30)));
    }

    #[test]
    fn test_extract_days_en() {
        assert_eq!(extract_days("my last 14 days of ranked"), Some(14));
        assert_eq!(extract_days("past 2 weeks"), Some(14));
        assert_eq!(extract_days("this month so far"), Some(30));
        assert_eq!(extract_days("no window here"), None);
    }
}
