use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{TaskClientError, TaskClientResult};

/// 新建任务的初始进度
pub const INITIAL_PROGRESS: f32 = 0.01;

/// 任务
///
/// 表示一次异步工作的状态快照，例如"创建租户X"。任务只存在于内存和消息中，
/// 状态变化总是以一条新消息的形式发布，而不是原地更新。
///
/// # 线上格式
///
/// ```json
/// {"id":"39b0b2fc-749f-46f3-8960-453418e72b2e","description":"Creating tenant X","tags":["create","tenant"],"status":"waiting","progress":0.01}
/// ```
///
/// # 使用示例
///
/// ```rust
/// use tenant_core::models::{Task, TaskStatus};
///
/// let task = Task::new(vec!["create".to_string(), "tenant".to_string()], "Creating tenant X");
/// assert_eq!(task.status, TaskStatus::Waiting);
///
/// let bytes = task.encode().unwrap();
/// assert_eq!(Task::decode(&bytes).unwrap(), task);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    pub tags: Vec<String>,
    pub status: TaskStatus,
    pub progress: f32,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskStatus::Waiting),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "" => Err(TaskClientError::MissingStatus),
            other => Err(TaskClientError::UnknownStatus(other.to_string())),
        }
    }
}

/// 解码时使用的宽松结构，状态保留为原始字符串以区分"缺失"和"未知"
#[derive(Deserialize)]
struct WireTask {
    #[serde(default)]
    id: Uuid,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    progress: f32,
}

impl Task {
    /// 创建一个处于 waiting 状态的新任务
    pub fn new(tags: Vec<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            tags,
            status: TaskStatus::Waiting,
            progress: INITIAL_PROGRESS,
        }
    }

    /// 返回状态已变更的副本，原任务和进度都不变
    pub fn with_status(&self, status: TaskStatus) -> Self {
        let mut next = self.clone();
        next.status = status;
        next
    }

    /// 返回进度已变更的副本，进度被限制在 [0, 1]
    pub fn with_progress(&self, progress: f32) -> Self {
        let mut next = self.clone();
        next.progress = clamp_progress(progress);
        next
    }

    /// 序列化为 UTF-8 JSON 字节
    pub fn encode(&self) -> TaskClientResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| TaskClientError::Serialization(format!("序列化任务失败: {e}")))
    }

    /// 从字节解码任务
    ///
    /// - 无法解析的消息体返回 [`TaskClientError::InvalidPayload`]
    /// - 状态为空或缺失返回 [`TaskClientError::MissingStatus`]
    /// - 状态无法识别返回 [`TaskClientError::UnknownStatus`]
    pub fn decode(data: &[u8]) -> TaskClientResult<Self> {
        let wire: WireTask = serde_json::from_slice(data)
            .map_err(|e| TaskClientError::InvalidPayload(e.to_string()))?;
        let status = wire.status.parse::<TaskStatus>()?;

        Ok(Self {
            id: wire.id,
            description: wire.description,
            tags: wire.tags,
            status,
            progress: clamp_progress(wire.progress),
        })
    }
}

fn clamp_progress(progress: f32) -> f32 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"{"id":"39b0b2fc-749f-46f3-8960-453418e72b2e","description":"Creating tenant X","tags":["create","tenant"],"status":"waiting","progress":0.01}"#;

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new(vec!["create".to_string()], "Creating tenant X");
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(task.progress, INITIAL_PROGRESS);
        assert_eq!(task.tags, vec!["create".to_string()]);
        assert!(!task.id.is_nil());

        let other = Task::new(vec![], "Creating tenant Y");
        assert_ne!(task.id, other.id);
    }

    #[test]
    fn test_decode_example_payload() {
        let task = Task::decode(EXAMPLE.as_bytes()).unwrap();
        assert_eq!(
            task.id,
            Uuid::parse_str("39b0b2fc-749f-46f3-8960-453418e72b2e").unwrap()
        );
        assert_eq!(task.description, "Creating tenant X");
        assert_eq!(task.tags, vec!["create".to_string(), "tenant".to_string()]);
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(task.progress, 0.01);
    }

    #[test]
    fn test_encode_matches_wire_format() {
        let task = Task::decode(EXAMPLE.as_bytes()).unwrap();
        let encoded = String::from_utf8(task.encode().unwrap()).unwrap();
        assert_eq!(encoded, EXAMPLE);
    }

    #[test]
    fn test_round_trip_all_statuses() {
        let base = Task::new(vec!["tenant".to_string(), "delete".to_string()], "Deleting tenant");
        for status in [
            TaskStatus::Waiting,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            let task = base.with_status(status).with_progress(0.37);
            let decoded = Task::decode(&task.encode().unwrap()).unwrap();
            assert_eq!(decoded, task);
        }
    }

    #[test]
    fn test_decode_malformed_body() {
        let err = Task::decode(b"not json at all").unwrap_err();
        assert!(matches!(err, TaskClientError::InvalidPayload(_)));
        assert!(err.is_poison());
    }

    #[test]
    fn test_decode_missing_or_empty_status() {
        let missing = br#"{"id":"39b0b2fc-749f-46f3-8960-453418e72b2e","description":"x"}"#;
        assert!(matches!(
            Task::decode(missing).unwrap_err(),
            TaskClientError::MissingStatus
        ));

        let empty = br#"{"description":"x","status":""}"#;
        assert!(matches!(
            Task::decode(empty).unwrap_err(),
            TaskClientError::MissingStatus
        ));
    }

    #[test]
    fn test_decode_unknown_status() {
        let body = br#"{"description":"x","status":"paused"}"#;
        match Task::decode(body).unwrap_err() {
            TaskClientError::UnknownStatus(s) => assert_eq!(s, "paused"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_with_status_does_not_mutate_original() {
        let task = Task::new(vec![], "Creating tenant X");
        let completed = task.with_status(TaskStatus::Completed);
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(completed.status, TaskStatus::Completed);
        assert_eq!(completed.progress, task.progress);
        assert_eq!(completed.id, task.id);
    }

    #[test]
    fn test_with_progress_clamps() {
        let task = Task::new(vec![], "x");
        assert_eq!(task.with_progress(1.5).progress, 1.0);
        assert_eq!(task.with_progress(-0.2).progress, 0.0);
        assert_eq!(task.with_progress(f32::NAN).progress, 0.0);
        assert_eq!(task.with_progress(0.5).progress, 0.5);
    }

    #[test]
    fn test_decode_clamps_out_of_range_progress() {
        let over = br#"{"description":"x","status":"running","progress":7.5}"#;
        assert_eq!(Task::decode(over).unwrap().progress, 1.0);

        let under = br#"{"description":"x","status":"running","progress":-1}"#;
        assert_eq!(Task::decode(under).unwrap().progress, 0.0);

        let missing = br#"{"description":"x","status":"running"}"#;
        assert_eq!(Task::decode(missing).unwrap().progress, 0.0);
    }

    #[test]
    fn test_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert_eq!(TaskStatus::Running.to_string(), "running");
    }
}
