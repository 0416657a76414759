use crate::channel::CommandChannel;
use crate::core::age::Age;
use crate::core::scanner::{join, TreeScanner};
use crate::error::{Error, Result};
use futures::{stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// 排除的目录名（任意层级）
    pub exclude_dirs: Vec<String>,
    /// 传输后把目标的修改时间设为源文件的修改时间
    pub preserve_mtime: bool,
    /// 最大并发传输数，1 表示按顺序传输
    pub max_concurrent_transfers: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            exclude_dirs: Vec::new(),
            preserve_mtime: true,
            max_concurrent_transfers: 1,
        }
    }
}

/// 单向同步的方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// 远程 -> 本地
    Pull,
    /// 本地 -> 远程
    Push,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Pull => write!(f, "pull"),
            Direction::Push => write!(f, "push"),
        }
    }
}

/// 一个文件的传输决策单元
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub relative_path: String,
    pub source_path: String,
    pub source_age: Age,
    pub target_path: String,
    /// `None` 表示目标不存在
    pub target_age: Option<Age>,
}

/// 候选文件的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Create,
    Update,
    LeaveAlone,
}

impl Candidate {
    /// 同一秒内的修改视为相同，不传输
    pub fn decide(&self) -> Decision {
        match self.target_age {
            None => Decision::Create,
            Some(target) if target < self.source_age => Decision::Update,
            Some(_) => Decision::LeaveAlone,
        }
    }
}

/// 同步报告，三个列表互不相交，元素为目标路径
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub directions: Vec<Direction>,
    pub updated: Vec<String>,
    pub created: Vec<String>,
    pub left_alone: Vec<String>,
    /// 被调用方排除、没有参与比较的文件数
    pub skipped: usize,
    pub duration_ms: u64,
}

impl SyncReport {
    fn new(direction: Direction) -> Self {
        Self {
            directions: vec![direction],
            ..Default::default()
        }
    }

    fn record(&mut self, candidate: &Candidate, decision: Decision) {
        let path = candidate.target_path.clone();
        match decision {
            Decision::Create => self.created.push(path),
            Decision::Update => self.updated.push(path),
            Decision::LeaveAlone => self.left_alone.push(path),
        }
    }

    /// 合并另一次同步的结果（双向同步使用）
    pub fn merge(&mut self, other: SyncReport) {
        self.directions.extend(other.directions);
        self.updated.extend(other.updated);
        self.created.extend(other.created);
        self.left_alone.extend(other.left_alone);
        self.skipped += other.skipped;
        self.duration_ms += other.duration_ms;
    }

    pub fn transferred(&self) -> usize {
        self.updated.len() + self.created.len()
    }

    pub fn total(&self) -> usize {
        self.transferred() + self.left_alone.len()
    }

    pub fn summary(&self) -> String {
        let dirs: Vec<String> = self.directions.iter().map(|d| d.to_string()).collect();
        format!(
            "{}: 更新 {}, 新建 {}, 未变 {}, 排除 {}, 耗时 {}ms",
            dirs.join("+"),
            self.updated.len(),
            self.created.len(),
            self.left_alone.len(),
            self.skipped,
            self.duration_ms
        )
    }
}

/// 同步引擎
///
/// 以修改时间为唯一依据在本地与远程之间同步目录树。
/// 不做内容比较，不合并，较新的一方获胜。
pub struct SyncEngine {
    local: Arc<dyn CommandChannel>,
    remote: Arc<dyn CommandChannel>,
    config: SyncConfig,
    scanner: TreeScanner,
    last_push_dir: Mutex<Option<String>>,
}

impl SyncEngine {
    pub fn new(local: Arc<dyn CommandChannel>, remote: Arc<dyn CommandChannel>) -> Self {
        Self::with_config(local, remote, SyncConfig::default())
    }

    pub fn with_config(
        local: Arc<dyn CommandChannel>,
        remote: Arc<dyn CommandChannel>,
        config: SyncConfig,
    ) -> Self {
        let scanner = TreeScanner::new(config.exclude_dirs.iter().cloned());
        Self {
            local,
            remote,
            config,
            scanner,
            last_push_dir: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn remote(&self) -> &Arc<dyn CommandChannel> {
        &self.remote
    }

    /// 单向同步
    ///
    /// `skip` 中的相对路径不参与比较。
    pub async fn reconcile_one_way(
        &self,
        direction: Direction,
        source_root: &str,
        target_root: &str,
        skip: &BTreeSet<String>,
    ) -> Result<SyncReport> {
        let start = Instant::now();
        let (source, target) = match direction {
            Direction::Pull => (&self.remote, &self.local),
            Direction::Push => (&self.local, &self.remote),
        };
        info!(
            "开始 {}: {} [{}] -> {} [{}]",
            direction,
            source_root,
            source.name(),
            target_root,
            target.name()
        );

        let entries = self
            .scanner
            .scan_mirrored(source.as_ref(), source_root, target.as_ref(), target_root)
            .await?;

        let mut report = SyncReport::new(direction);
        let mut transfers = Vec::new();

        // 先确定所有候选的归类，传输顺序不影响报告
        for entry in entries {
            if skip.contains(&entry.relative_path) {
                debug!("本轮跳过: {}", entry.relative_path);
                report.skipped += 1;
                continue;
            }
            let target_path = join(target_root, &entry.relative_path);
            let candidate = Candidate {
                target_age: target.age(&target_path).await?,
                relative_path: entry.relative_path,
                source_path: entry.absolute_path,
                source_age: entry.age,
                target_path,
            };
            let decision = candidate.decide();
            debug!(
                "{:?}: {} ({} -> {})",
                decision,
                candidate.relative_path,
                candidate.source_age,
                candidate.target_age.unwrap_or(Age::MISSING)
            );
            report.record(&candidate, decision);
            if decision != Decision::LeaveAlone {
                transfers.push(candidate);
            }
        }

        let concurrency = self.config.max_concurrent_transfers.max(1);
        if concurrency == 1 {
            for candidate in &transfers {
                self.transfer(direction, candidate).await?;
            }
        } else {
            stream::iter(transfers.iter().map(Ok::<_, Error>))
                .try_for_each_concurrent(concurrency, |candidate| self.transfer(direction, candidate))
                .await?;
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!("完成 {}", report.summary());
        Ok(report)
    }

    async fn transfer(&self, direction: Direction, candidate: &Candidate) -> Result<()> {
        let target = match direction {
            Direction::Pull => {
                self.remote
                    .get(&candidate.source_path, &candidate.target_path)
                    .await?;
                &self.local
            }
            Direction::Push => {
                self.remote
                    .put(&candidate.source_path, &candidate.target_path)
                    .await?;
                &self.remote
            }
        };
        if self.config.preserve_mtime {
            target
                .set_age(&candidate.target_path, candidate.source_age)
                .await?;
        }
        Ok(())
    }

    /// 远程 -> 本地
    pub async fn pull(&self, remote_root: &str, local_root: &str) -> Result<SyncReport> {
        self.reconcile_one_way(Direction::Pull, remote_root, local_root, &BTreeSet::new())
            .await
    }

    /// 本地 -> 远程
    ///
    /// `empty_push` 时不做任何传输，只记录目标目录，供后续 `cd` 使用。
    pub async fn push(
        &self,
        local_root: &str,
        remote_root: &str,
        empty_push: bool,
    ) -> Result<SyncReport> {
        self.set_last_push_dir(remote_root);
        if empty_push {
            info!("empty push: 仅记录目标目录 {}", remote_root);
            return Ok(SyncReport::new(Direction::Push));
        }
        self.reconcile_one_way(Direction::Push, local_root, remote_root, &BTreeSet::new())
            .await
    }

    /// 两侧根目录下同一个子目录之间的 push
    pub async fn push_stem(
        &self,
        local_root: &str,
        remote_root: &str,
        stem: &str,
        empty_push: bool,
    ) -> Result<SyncReport> {
        let stem = stem.trim_matches('/');
        if stem.is_empty() {
            return self.push(local_root, remote_root, empty_push).await;
        }
        self.push(&join(local_root, stem), &join(remote_root, stem), empty_push)
            .await
    }

    /// 双向同步：先 pull，再 push 没有被 pull 改动过的文件
    pub async fn twoway(&self, remote_root: &str, local_root: &str) -> Result<SyncReport> {
        let mut report = self.pull(remote_root, local_root).await?;

        let pulled: BTreeSet<String> = report
            .updated
            .iter()
            .chain(&report.created)
            .filter_map(|p| relative_to(local_root, p))
            .collect();

        let pushed = self
            .reconcile_one_way(Direction::Push, local_root, remote_root, &pulled)
            .await?;
        report.merge(pushed);
        info!("双向同步完成 {}", report.summary());
        Ok(report)
    }

    pub fn last_push_dir(&self) -> Option<String> {
        self.last_push_dir
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_last_push_dir(&self, dir: &str) {
        *self.last_push_dir.lock().unwrap_or_else(|e| e.into_inner()) = Some(dir.to_string());
    }

    /// 把远程工作目录切换到最近一次 push 的目标目录
    pub fn change_directory_to_last_push(&self) -> Result<String> {
        let dir = self
            .last_push_dir()
            .ok_or_else(|| Error::Config("还没有 push 过，无法切换到 last push 目录".to_string()))?;
        self.remote.change_directory(Some(dir.clone()));
        Ok(dir)
    }
}

fn relative_to(root: &str, path: &str) -> Option<String> {
    let root = root.trim_end_matches('/');
    path.strip_prefix(root)
        .filter(|rest| rest.starts_with('/'))
        .map(|rest| rest.trim_start_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalChannel;
    use std::path::Path;

    fn write_aged(root: &Path, rel: &str, secs: i64) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, rel).unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(Age::from_secs(secs).to_system_time()).unwrap();
    }

    fn s(p: &Path) -> String {
        p.to_string_lossy().into_owned()
    }

    fn loopback(config: SyncConfig) -> SyncEngine {
        SyncEngine::with_config(
            Arc::new(LocalChannel::new()),
            Arc::new(LocalChannel::textual()),
            config,
        )
    }

    #[test]
    fn test_ties_are_left_alone() {
        let mut c = Candidate {
            relative_path: "x".into(),
            source_path: "/s/x".into(),
            source_age: Age::from_secs(100),
            target_path: "/t/x".into(),
            target_age: Some(Age::from_secs(100)),
        };
        assert_eq!(c.decide(), Decision::LeaveAlone);
        c.target_age = Some(Age::from_secs(99));
        assert_eq!(c.decide(), Decision::Update);
        c.target_age = None;
        assert_eq!(c.decide(), Decision::Create);
    }

    #[test]
    fn test_relative_paths_under_root() {
        assert_eq!(relative_to("/l/", "/l/a/x.txt").as_deref(), Some("a/x.txt"));
        assert_eq!(relative_to("/l", "/lx/a.txt"), None);
    }

    #[tokio::test]
    async fn test_pull_splits_updated_and_created() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        write_aged(remote.path(), "a/x.txt", 1_700_000_100);
        write_aged(remote.path(), "a/y.txt", 1_700_000_050);
        write_aged(local.path(), "a/x.txt", 1_700_000_090);

        let engine = loopback(SyncConfig::default());
        let report = engine.pull(&s(remote.path()), &s(local.path())).await.unwrap();

        assert_eq!(report.updated, vec![s(&local.path().join("a/x.txt"))]);
        assert_eq!(report.created, vec![s(&local.path().join("a/y.txt"))]);
        assert!(report.left_alone.is_empty());
        assert_eq!(
            Age::of_local(&local.path().join("a/x.txt")),
            Age::from_secs(1_700_000_100)
        );

        let again = engine.pull(&s(remote.path()), &s(local.path())).await.unwrap();
        assert_eq!(again.transferred(), 0);
        assert_eq!(again.left_alone.len(), 2);
    }

    #[tokio::test]
    async fn test_newer_target_is_not_overwritten() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        write_aged(remote.path(), "f.txt", 1_700_000_000);
        write_aged(local.path(), "f.txt", 1_700_000_500);

        let report = loopback(SyncConfig::default())
            .pull(&s(remote.path()), &s(local.path()))
            .await
            .unwrap();
        assert_eq!(report.left_alone.len(), 1);
        assert_eq!(
            std::fs::read_to_string(local.path().join("f.txt")).unwrap(),
            "f.txt"
        );
        assert_eq!(
            Age::of_local(&local.path().join("f.txt")),
            Age::from_secs(1_700_000_500)
        );
    }

    #[tokio::test]
    async fn test_concurrent_transfers_keep_report_membership() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        for i in 0..8 {
            write_aged(remote.path(), &format!("d/f{}.txt", i), 1_700_000_000 + i);
        }

        let engine = loopback(SyncConfig {
            max_concurrent_transfers: 4,
            ..Default::default()
        });
        let report = engine.push(&s(remote.path()), &s(local.path()), false).await.unwrap();
        assert_eq!(report.created.len(), 8);
        assert_eq!(report.directions, vec![Direction::Push]);
        assert_eq!(engine.last_push_dir(), Some(s(local.path())));
    }

    #[tokio::test]
    async fn test_push_stem_syncs_only_the_shared_subdirectory() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        write_aged(local.path(), "case1/in.dat", 1_700_000_000);
        write_aged(local.path(), "case2/in.dat", 1_700_000_000);

        let engine = loopback(SyncConfig::default());
        let report = engine
            .push_stem(&s(local.path()), &s(remote.path()), "case1/", false)
            .await
            .unwrap();

        assert_eq!(report.created, vec![format!("{}/case1/in.dat", s(remote.path()))]);
        assert!(!remote.path().join("case2").exists());
        assert_eq!(
            engine.last_push_dir(),
            Some(format!("{}/case1", s(remote.path())))
        );
    }

    #[tokio::test]
    async fn test_empty_push_only_records_directory() {
        let local = tempfile::tempdir().unwrap();
        write_aged(local.path(), "x.txt", 1_700_000_000);
        let target = local.path().join("never");

        let engine = loopback(SyncConfig::default());
        assert!(engine.change_directory_to_last_push().is_err());

        let report = engine.push(&s(local.path()), &s(&target), true).await.unwrap();
        assert_eq!(report.total(), 0);
        assert!(!target.exists());

        assert_eq!(engine.change_directory_to_last_push().unwrap(), s(&target));
        assert_eq!(engine.remote().working_directory(), Some(s(&target)));
    }
}
