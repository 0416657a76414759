//! 批处理队列作业监控
//!
//! 按固定间隔查询队列，把嘈杂的状态输出归约为 [`JobStatus`]。
//! 作业曾在队列中出现、随后查询不到时视为离开队列（完成或失败，不区分）。

use crate::channel::CommandChannel;
use crate::core::timespec::serde_secs;
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// SLURM 作业状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueState {
    Pending,
    Running,
    Completed,
    Completing,
    Configuring,
    Cancelled,
    Failed,
    Timeout,
    BootFail,
    Deadline,
    Suspended,
    Stopped,
    Preempted,
    ResvDelHold,
    RequeueFed,
    RequeueHold,
    Requeued,
    Resizing,
    Revoked,
    Signaling,
    SpecialExit,
    StageOut,
}

impl QueueState {
    pub const ALL: [QueueState; 22] = [
        QueueState::Pending,
        QueueState::Running,
        QueueState::Completed,
        QueueState::Completing,
        QueueState::Configuring,
        QueueState::Cancelled,
        QueueState::Failed,
        QueueState::Timeout,
        QueueState::BootFail,
        QueueState::Deadline,
        QueueState::Suspended,
        QueueState::Stopped,
        QueueState::Preempted,
        QueueState::ResvDelHold,
        QueueState::RequeueFed,
        QueueState::RequeueHold,
        QueueState::Requeued,
        QueueState::Resizing,
        QueueState::Revoked,
        QueueState::Signaling,
        QueueState::SpecialExit,
        QueueState::StageOut,
    ];

    /// `squeue -o %t` 输出的短代码
    pub fn code(self) -> &'static str {
        match self {
            QueueState::Pending => "PD",
            QueueState::Running => "R",
            QueueState::Completed => "CD",
            QueueState::Completing => "CG",
            QueueState::Configuring => "CF",
            QueueState::Cancelled => "CA",
            QueueState::Failed => "F",
            QueueState::Timeout => "TO",
            QueueState::BootFail => "BF",
            QueueState::Deadline => "DL",
            QueueState::Suspended => "S",
            QueueState::Stopped => "ST",
            QueueState::Preempted => "PR",
            QueueState::ResvDelHold => "RD",
            QueueState::RequeueFed => "RF",
            QueueState::RequeueHold => "RH",
            QueueState::Requeued => "RQ",
            QueueState::Resizing => "RS",
            QueueState::Revoked => "RV",
            QueueState::Signaling => "SI",
            QueueState::SpecialExit => "SE",
            QueueState::StageOut => "SO",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn description(self) -> &'static str {
        match self {
            QueueState::Pending => "Pending",
            QueueState::Running => "Running",
            QueueState::Completed => "Completed",
            QueueState::Completing => "Completing",
            QueueState::Configuring => "Configuring",
            QueueState::Cancelled => "Cancelled",
            QueueState::Failed => "Failed",
            QueueState::Timeout => "Timed out",
            QueueState::BootFail => "Boot fail",
            QueueState::Deadline => "Deadline",
            QueueState::Suspended => "Suspended",
            QueueState::Stopped => "Stopped with SIGSTOP signal",
            QueueState::Preempted => "Preempted",
            QueueState::ResvDelHold => "Held after requested reservation was deleted",
            QueueState::RequeueFed => "Being requeued by a federation",
            QueueState::RequeueHold => "Held to be requeued",
            QueueState::Requeued => "Completing, being requeued",
            QueueState::Resizing => "Resizing",
            QueueState::Revoked => {
                "Sibling removed from cluster due to other cluster starting the job"
            }
            QueueState::Signaling => "Being signaled",
            QueueState::SpecialExit => "Requeued in a special state",
            QueueState::StageOut => "Staging out files",
        }
    }
}

/// 作业状态
///
/// 队列原生状态只出现在 `OnQueue` 中，合成状态是独立的变体，
/// 不会与原生代码冲突。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// 已提交，还没在队列中看到
    NotSeen,
    OnQueue(QueueState),
    /// 曾在队列中，现在已离开（终态）
    OffQueue,
    /// 无法识别的输出
    Unknown(String),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::OffQueue)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, JobStatus::OnQueue(QueueState::Running))
    }

    /// 短代码，合成状态使用 NS / OQ / UK
    pub fn code(&self) -> &str {
        match self {
            JobStatus::NotSeen => "NS",
            JobStatus::OnQueue(state) => state.code(),
            JobStatus::OffQueue => "OQ",
            JobStatus::Unknown(_) => "UK",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::NotSeen => write!(f, "Not seen on queue (NS)"),
            JobStatus::OnQueue(state) => write!(f, "{} ({})", state.description(), state.code()),
            JobStatus::OffQueue => write!(f, "Off the queue (OQ)"),
            JobStatus::Unknown(raw) => write!(f, "Unknown status (UK): {:?}", raw),
        }
    }
}

/// 轮询策略：每隔 `check_every` 查询一次，累计 `check_until` 后停止
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorPolicy {
    #[serde(with = "serde_secs")]
    pub check_until: Duration,
    #[serde(with = "serde_secs")]
    pub check_every: Duration,
}

impl MonitorPolicy {
    pub fn new(check_until: Duration, check_every: Duration) -> Self {
        Self {
            check_until,
            check_every,
        }
    }

    pub fn from_secs(check_until: u64, check_every: u64) -> Self {
        Self::new(
            Duration::from_secs(check_until),
            Duration::from_secs(check_every),
        )
    }

    /// 只查询一次
    pub fn once() -> Self {
        Self::from_secs(0, 0)
    }
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self::from_secs(20, 5)
    }
}

/// 批处理队列系统
pub trait QueueSystem: Send + Sync {
    fn name(&self) -> &str;

    /// 查询单个作业状态的命令
    fn status_command(&self, job_id: &str) -> String;

    fn parse_state(&self, raw: &str) -> Option<QueueState>;

    /// 从提交回执中提取作业编号
    fn parse_submission(&self, ack: &str) -> Option<String>;

    /// stderr 是否表示作业已不在队列中
    fn is_vanished(&self, stderr: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Slurm;

const SLURM_SUBMIT_PATTERN: &str = r"Submitted batch job (\S+)";

fn slurm_submit_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SLURM_SUBMIT_PATTERN).expect("sbatch 回执正则"))
}

impl QueueSystem for Slurm {
    fn name(&self) -> &str {
        "slurm"
    }

    fn status_command(&self, job_id: &str) -> String {
        format!("squeue -h -o %t -j{}", job_id)
    }

    fn parse_state(&self, raw: &str) -> Option<QueueState> {
        QueueState::from_code(raw)
    }

    fn parse_submission(&self, ack: &str) -> Option<String> {
        slurm_submit_regex()
            .captures(ack)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    fn is_vanished(&self, stderr: &str) -> bool {
        stderr.contains("Invalid job id")
    }
}

/// 单次轮询的状态转换
pub fn transition(queue: &dyn QueueSystem, raw: &str, seen: &mut bool) -> JobStatus {
    let raw = raw.trim();
    if let Some(state) = queue.parse_state(raw) {
        *seen = true;
        return JobStatus::OnQueue(state);
    }
    match (raw.is_empty(), *seen) {
        (true, true) => JobStatus::OffQueue,
        (true, false) => JobStatus::NotSeen,
        (false, _) => {
            warn!("无法识别的队列输出: {:?}", raw);
            JobStatus::Unknown(raw.to_string())
        }
    }
}

/// 一次监控的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOutcome {
    pub status: JobStatus,
    pub polls: u32,
    /// 时间用完仍未到达终态，状态待定
    pub budget_exhausted: bool,
}

/// 运行方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// 阻塞运行直到结束
    Direct,
    /// 交给队列系统，提交后按策略做一次启动检查
    Indirect(MonitorPolicy),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { stdout: String },
    Submitted { job_id: String, watch: WatchOutcome },
}

/// 作业监控
pub struct JobMonitor {
    channel: Arc<dyn CommandChannel>,
    queue: Arc<dyn QueueSystem>,
}

impl JobMonitor {
    pub fn new(channel: Arc<dyn CommandChannel>) -> Self {
        Self::with_queue(channel, Arc::new(Slurm))
    }

    pub fn with_queue(channel: Arc<dyn CommandChannel>, queue: Arc<dyn QueueSystem>) -> Self {
        Self { channel, queue }
    }

    async fn poll(&self, job_id: &str, seen: &mut bool) -> Result<JobStatus> {
        let command = self.queue.status_command(job_id);
        let raw = match self.channel.run(&command, true).await {
            Ok(out) => out,
            Err(Error::RemoteCommand { stderr, .. }) if self.queue.is_vanished(&stderr) => {
                debug!("作业 {} 已不在队列中", job_id);
                String::new()
            }
            Err(Error::RemoteCommand { stderr, .. }) => stderr.trim().to_string(),
            Err(e) => return Err(e),
        };
        Ok(transition(self.queue.as_ref(), &raw, seen))
    }

    pub async fn watch(&self, job_id: &str, policy: MonitorPolicy) -> Result<JobStatus> {
        Ok(self.watch_outcome(job_id, policy).await?.status)
    }

    /// 按策略轮询，离开队列时立即返回
    pub async fn watch_outcome(&self, job_id: &str, policy: MonitorPolicy) -> Result<WatchOutcome> {
        info!(
            "监控作业 {} ({}), 每 {:?} 查询一次, 共 {:?}",
            job_id,
            self.queue.name(),
            policy.check_every,
            policy.check_until
        );
        let mut seen = false;
        let mut polls = 0;
        let mut elapsed = Duration::ZERO;

        loop {
            let status = self.poll(job_id, &mut seen).await?;
            polls += 1;
            debug!("作业 {} 第 {} 次查询: {}", job_id, polls, status);

            if status.is_terminal() {
                info!("作业 {} 已离开队列", job_id);
                return Ok(WatchOutcome {
                    status,
                    polls,
                    budget_exhausted: false,
                });
            }

            elapsed += policy.check_every;
            if policy.check_every.is_zero() || elapsed >= policy.check_until {
                warn!(
                    "作业 {} 在 {:?} 内没有离开队列，当前状态: {}",
                    job_id, policy.check_until, status
                );
                return Ok(WatchOutcome {
                    status,
                    polls,
                    budget_exhausted: true,
                });
            }

            tokio::time::sleep(policy.check_every).await;
        }
    }

    /// 查询一次，假定作业已经在队列中出现过
    pub async fn check_once(&self, job_id: &str) -> Result<JobStatus> {
        let mut seen = true;
        let status = self.poll(job_id, &mut seen).await?;
        info!("作业 {}: {}", job_id, status);
        Ok(status)
    }

    /// 提交作业并返回作业编号
    pub async fn submit(&self, commands: &[String]) -> Result<String> {
        let output = self.channel.execute(commands, true).await?;
        let job_id = self
            .queue
            .parse_submission(&output.stdout)
            .ok_or_else(|| Error::Submission(output.stdout.clone()))?;
        info!("已提交作业 {}", job_id);
        Ok(job_id)
    }

    pub async fn run(&self, commands: &[String], mode: RunMode) -> Result<RunOutcome> {
        match mode {
            RunMode::Direct => {
                let output = self.channel.execute(commands, false).await?;
                Ok(RunOutcome::Completed {
                    stdout: output.stdout,
                })
            }
            RunMode::Indirect(policy) => {
                let job_id = self.submit(commands).await?;
                let watch = self.watch_outcome(&job_id, policy).await?;
                Ok(RunOutcome::Submitted { job_id, watch })
            }
        }
    }
}

/// 是否应该取回结果；`None` 表示无法自动判断，由调用方决定
pub fn should_retrieve(status: &JobStatus) -> Option<bool> {
    match status {
        JobStatus::OffQueue => Some(true),
        s if s.is_running() => Some(false),
        _ => None,
    }
}

/// 无法自动判断时询问调用方
pub fn decide_to_pull<F>(status: &JobStatus, ask: F) -> bool
where
    F: FnOnce(&JobStatus) -> bool,
{
    should_retrieve(status).unwrap_or_else(|| ask(status))
}
