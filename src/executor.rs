use crate::catalog::metric_known;
use crate::plan::{DataGroup, Plan};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// 一条预聚合记录：按 (英雄, 位置, 队列, 版本) 汇总。本层只读。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackRecord {
    pub champion: String,
    pub role: String,
    pub queue: String,
    pub patch: String,
    /// 该版本窗口的代表时间戳（秒），时间谓词作用在这上面。
    pub patch_ts: u64,
    pub games: u32,
    pub wins: u32,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

/// 数据包来源边界。生命周期归采集子系统，这里只枚举。
pub trait PackSource: Send + Sync {
    fn records(&self) -> Result<Vec<PackRecord>, String>;
}

/// 文件包存储：目录下每个 *.json 是一个包（记录数组）。
pub struct FilePackSource {
    dir: PathBuf,
}

impl FilePackSource {
    pub fn new(dir: &str) -> Self {
        Self { dir: PathBuf::from(dir) }
    }
}

impl PackSource for FilePackSource {
    fn records(&self) -> Result<Vec<PackRecord>, String> {
        let mut out = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| format!("读取数据包目录失败 {}: {}", self.dir.display(), e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("跳过不可读数据包 {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_str::<Vec<PackRecord>>(&content) {
                Ok(mut records) => out.append(&mut records),
                Err(e) => log::warn!("跳过损坏数据包 {}: {}", path.display(), e),
            }
        }
        Ok(out)
    }
}

/// 喂给规划提示词的数据形状概况，不含任何原始记录。
#[derive(Debug, Clone, Serialize)]
pub struct PlayerProfile {
    pub total_games: u32,
    pub champion_count: usize,
    pub patches: Vec<String>,
    pub queues: Vec<String>,
}

impl PlayerProfile {
    pub fn summary(&self) -> String {
        format!(
            "共 {} 场，{} 个英雄，版本 {}，队列 {}",
            self.total_games,
            self.champion_count,
            self.patches.join("/"),
            self.queues.join("/")
        )
    }
}

pub fn build_profile(source: &dyn PackSource) -> Result<PlayerProfile, String> {
    let records = source.records()?;
    let mut champions = std::collections::HashSet::new();
    let mut patches = std::collections::BTreeSet::new();
    let mut queues = std::collections::BTreeSet::new();
    let mut total_games = 0u32;
    for r in &records {
        champions.insert(r.champion.clone());
        patches.insert(r.patch.clone());
        queues.insert(r.queue.clone());
        total_games = total_games.saturating_add(r.games);
    }
    Ok(PlayerProfile {
        total_games,
        champion_count: champions.len(),
        patches: patches.into_iter().collect(),
        queues: queues.into_iter().collect(),
    })
}

/// 一个分组的计算结果。空组保留并打 no_data 标记，绝不静默省略。
#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub name: String,
    pub games: u32,
    pub wins: u32,
    pub no_data: bool,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub query: String,
    pub comparison_type: String,
    pub output_format: String,
    pub groups: Vec<GroupReport>,
    pub notes: Vec<String>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn execute(plan: &Plan, source: &dyn PackSource) -> Result<Report, String> {
    execute_at(plan, source, now_secs())
}

/// 纯计算：过滤 → 加权聚合。叙事阶段只拿得到这里算出的数字。
pub fn execute_at(plan: &Plan, source: &dyn PackSource, now: u64) -> Result<Report, String> {
    let records = source.records()?;
    let mut notes: Vec<String> = plan.dropped.clone();
    let mut groups = Vec::with_capacity(plan.data_groups.len());

    for g in &plan.data_groups {
        let matched: Vec<&PackRecord> = records
            .iter()
            .filter(|r| group_matches(g, r, now, &mut notes))
            .collect();
        groups.push(aggregate(g, &matched, &plan.metrics, &mut notes));
    }

    Ok(Report {
        query: plan.query.clone(),
        comparison_type: plan.comparison_type.clone(),
        output_format: plan.output_format.clone(),
        groups,
        notes,
    })
}

fn group_matches(group: &DataGroup, r: &PackRecord, now: u64, notes: &mut Vec<String>) -> bool {
    if let Some(tf) = &group.time_filter {
        if !tf.contains(r.patch_ts, now) {
            return false;
        }
    }
    for c in &group.conditions {
        let actual = match c.field.as_str() {
            "champion" => &r.champion,
            "role" => &r.role,
            "queue" => &r.queue,
            "patch" => &r.patch,
            other => {
                // 未知字段的条件丢弃并记录，而不是让整组匹配不到任何数据
                let note = format!("组 '{}' 丢弃未知条件字段 '{}'", group.name, other);
                if !notes.contains(&note) {
                    notes.push(note);
                }
                continue;
            }
        };
        if !actual.eq_ignore_ascii_case(&c.value) {
            return false;
        }
    }
    true
}

fn aggregate(
    group: &DataGroup,
    matched: &[&PackRecord],
    wanted: &[String],
    notes: &mut Vec<String>,
) -> GroupReport {
    let games: u32 = matched.iter().map(|r| r.games).sum();
    let wins: u32 = matched.iter().map(|r| r.wins).sum();
    let no_data = matched.is_empty() || games == 0;
    let mut metrics = BTreeMap::new();

    if !no_data {
        for m in wanted {
            if !metric_known(m) {
                let note = format!("丢弃未知指标 '{}'", m);
                if !notes.contains(&note) {
                    notes.push(note);
                }
                continue;
            }
            match m.as_str() {
                "games" => {
                    metrics.insert(m.clone(), games as f64);
                }
                "wins" => {
                    metrics.insert(m.clone(), wins as f64);
                }
                "win_rate" => {
                    metrics.insert(m.clone(), wins as f64 / games as f64 * 100.0);
                }
                _ => {
                    // 按场次加权平均，只统计带该指标的记录
                    let mut weighted = 0.0;
                    let mut weight = 0u32;
                    for r in matched {
                        if let Some(v) = r.metrics.get(m) {
                            weighted += v * r.games as f64;
                            weight += r.games;
                        }
                    }
                    if weight > 0 {
                        metrics.insert(m.clone(), weighted / weight as f64);
                    } else {
                        notes.push(format!("组 '{}' 无指标 '{}' 的数据", group.name, m));
                    }
                }
            }
        }
    } else {
        notes.push(format!("组 '{}' 没有匹配到任何数据", group.name));
    }

    GroupReport { name: group.name.clone(), games, wins, no_data, metrics }
}

/// 叙事阶段的生成请求：只序列化算好的聚合值，绝不让生成服务自己算数。
pub fn narration_prompt(report: &Report) -> (String, String) {
    let system = "你是对局数据助手的报告撰写器。只根据给出的已计算聚合值写 markdown 报告，\
                  禁止编造或推算任何数字；no_data=true 的分组必须明确说明该组没有数据，\
                  不要给它编任何数值。按 output_format 组织结构，用用户的语言回答。"
        .to_string();
    let user = format!(
        "用户问题: {}\n对比口径: {}\n输出形式: {}\n\n已计算聚合值:\n{}\n\n备注:\n{}",
        report.query,
        report.comparison_type,
        report.output_format,
        serde_json::to_string_pretty(&report.groups).unwrap_or_else(|_| "[]".into()),
        if report.notes.is_empty() { "无".to_string() } else { report.notes.join("\n") },
    );
    (system, user)
}
