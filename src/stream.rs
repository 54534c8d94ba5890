use crate::agent_client::AgentInvoker;
use crate::executor::{build_profile, execute, narration_prompt, PackSource};
use crate::llm::GenerationService;
use crate::plan::{PlanError, PlanGenerator};
use crate::schema::{CombineStrategy, RouterAction, RouterDecision};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// 流协议事件类型。done / error 都是终态，之后不再有任何行。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Loading,
    Executing,
    Generating,
    Chunk,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl StreamEvent {
    pub fn new(event_type: EventType, content: Option<String>) -> Self {
        Self { event_type, content }
    }

    /// NDJSON 行：单行 JSON + 换行。
    pub fn line(&self) -> String {
        let mut s = serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","content":"事件序列化失败"}"#.into());
        s.push('\n');
        s
    }
}

/// 发送一个事件。返回 false 表示消费端已断开，管线应立即收工。
async fn emit(tx: &mpsc::Sender<String>, event_type: EventType, content: Option<String>) -> bool {
    tx.send(StreamEvent::new(event_type, content).line())
        .await
        .is_ok()
}

/// 流水线依赖集合。所有外设都在 trait 后面，测试直接换假件。
pub struct StreamDeps {
    pub generator: PlanGenerator,
    pub narrator: Arc<dyn GenerationService>,
    pub invoker: Arc<dyn AgentInvoker>,
    pub packs: Arc<dyn PackSource>,
    pub narrate_max_tokens: u32,
}

/// 按路由决策驱动整条流式回答。任何一步出错都以 error 事件收尾；
/// 消费端断开则静默终止，不再向任何下游要数据。
pub async fn run(query: &str, decision: &RouterDecision, deps: &StreamDeps, tx: mpsc::Sender<String>) {
    if !emit(&tx, EventType::Loading, Some("正在分析你的问题…".into())).await {
        return;
    }

    match decision.action {
        RouterAction::Clarify => {
            let q = decision
                .clarification_question
                .clone()
                .unwrap_or_else(|| "能再说具体一点吗？".into());
            if emit(&tx, EventType::Chunk, Some(q)).await {
                emit(&tx, EventType::Done, None).await;
            }
        }
        RouterAction::DirectAnswer => {
            let a = decision.direct_response.clone().unwrap_or_default();
            if emit(&tx, EventType::Chunk, Some(a)).await {
                emit(&tx, EventType::Done, None).await;
            }
        }
        RouterAction::CallSubagent => {
            if decision.is_custom_analysis() {
                run_custom_analysis(query, deps, &tx).await;
            } else {
                run_fixed_agent(decision, deps, &tx).await;
            }
        }
        RouterAction::CombineMultiple => {
            run_combine(decision, deps, &tx).await;
        }
    }
}

/// 定制分析路径：生成计划 → 本地只读执行 → 基于聚合值流式叙事。
async fn run_custom_analysis(query: &str, deps: &StreamDeps, tx: &mpsc::Sender<String>) {
    let profile = match build_profile(deps.packs.as_ref()) {
        Ok(p) => p.summary(),
        Err(e) => {
            log::warn!("读取数据概况失败: {}", e);
            "暂无数据概况".to_string()
        }
    };

    let plan = match deps.generator.generate(query, &profile).await {
        Ok(p) => p,
        Err(PlanError::NeedClarification(q)) => {
            // 澄清不是错误：正常以 chunk + done 收尾
            if emit(tx, EventType::Chunk, Some(q)).await {
                emit(tx, EventType::Done, None).await;
            }
            return;
        }
        Err(PlanError::Generation(e)) => {
            emit(tx, EventType::Error, Some(e)).await;
            return;
        }
    };

    if !emit(tx, EventType::Executing, Some("正在统计对局数据…".into())).await {
        return;
    }
    let report = match execute(&plan, deps.packs.as_ref()) {
        Ok(r) => r,
        Err(e) => {
            emit(tx, EventType::Error, Some(e)).await;
            return;
        }
    };
    if !emit(tx, EventType::Generating, Some("正在撰写报告…".into())).await {
        return;
    }

    let (system, user) = narration_prompt(&report);
    stream_narration(deps.narrator.clone(), system, user, deps.narrate_max_tokens, tx).await;
}

/// 固定能力路径：调一次子能力，把它的 markdown 作为分片透出。
async fn run_fixed_agent(decision: &RouterDecision, deps: &StreamDeps, tx: &mpsc::Sender<String>) {
    let Some(agent_id) = decision.subagent_id.as_deref() else {
        emit(tx, EventType::Error, Some("决策缺少 subagent_id".into())).await;
        return;
    };
    if !emit(tx, EventType::Executing, Some(format!("正在调用 {}…", agent_id))).await {
        return;
    }
    match deps.invoker.invoke(agent_id, &decision.params).await {
        Ok(content) => {
            if emit(tx, EventType::Generating, None).await
                && emit(tx, EventType::Chunk, Some(content)).await
            {
                emit(tx, EventType::Done, None).await;
            }
        }
        Err(e) => {
            emit(tx, EventType::Error, Some(e)).await;
        }
    }
}

/// 组合路径：多个能力依次或并行取回，逐段透出。单个失败降级为提示段，
/// 全部失败才算错误。
async fn run_combine(decision: &RouterDecision, deps: &StreamDeps, tx: &mpsc::Sender<String>) {
    if !emit(tx, EventType::Executing, Some("正在汇总多个分析…".into())).await {
        return;
    }

    let sections: Vec<(String, Result<String, String>)> = match decision.strategy {
        CombineStrategy::Sequential => {
            let mut out = Vec::with_capacity(decision.endpoints.len());
            for id in &decision.endpoints {
                let r = deps.invoker.invoke(id, &decision.params).await;
                out.push((id.clone(), r));
            }
            out
        }
        CombineStrategy::Parallel => {
            let handles: Vec<_> = decision
                .endpoints
                .iter()
                .map(|id| {
                    let invoker = deps.invoker.clone();
                    let id = id.clone();
                    let params = decision.params.clone();
                    tokio::spawn(async move {
                        let r = invoker.invoke(&id, &params).await;
                        (id, r)
                    })
                })
                .collect();
            let mut out = Vec::with_capacity(handles.len());
            for h in handles {
                match h.await {
                    Ok(pair) => out.push(pair),
                    Err(e) => out.push(("?".into(), Err(format!("任务失败: {}", e)))),
                }
            }
            out
        }
    };

    if sections.iter().all(|(_, r)| r.is_err()) {
        let detail = sections
            .iter()
            .filter_map(|(_, r)| r.as_ref().err().cloned())
            .collect::<Vec<_>>()
            .join("; ");
        emit(tx, EventType::Error, Some(format!("所有分析能力均不可用: {}", detail))).await;
        return;
    }

    if !emit(tx, EventType::Generating, None).await {
        return;
    }
    for (id, result) in sections {
        let body = match result {
            Ok(content) => format!("## {}\n\n{}\n\n", id, content),
            Err(e) => {
                log::warn!("组合分析 {} 失败: {}", id, e);
                format!("## {}\n\n该部分暂时不可用：{}\n\n", id, e)
            }
        };
        if !emit(tx, EventType::Chunk, Some(body)).await {
            return;
        }
    }
    emit(tx, EventType::Done, None).await;
}

/// 把生成服务的增量分片桥接为 chunk 事件。消费端断开时丢弃接收器，
/// 生产侧的 send 失败会让它停止向生成服务要后续分片。
async fn stream_narration(
    service: Arc<dyn GenerationService>,
    system: String,
    user: String,
    max_tokens: u32,
    tx: &mpsc::Sender<String>,
) {
    let (ctx, mut crx) = mpsc::channel::<String>(16);
    let handle =
        tokio::spawn(async move { service.complete_stream(&system, &user, max_tokens, ctx).await });

    while let Some(delta) = crx.recv().await {
        if !emit(tx, EventType::Chunk, Some(delta)).await {
            return;
        }
    }
    match handle.await {
        Ok(Ok(())) => {
            emit(tx, EventType::Done, None).await;
        }
        Ok(Err(e)) => {
            emit(tx, EventType::Error, Some(e)).await;
        }
        Err(e) => {
            emit(tx, EventType::Error, Some(format!("生成任务异常: {}", e))).await;
        }
    }
}
