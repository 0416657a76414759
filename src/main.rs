use anyhow::{bail, Context};
use jobsync_lib::channel::{with_channel, ChannelConfig, CommandChannel, LocalChannel};
use jobsync_lib::config::{self, AppConfig, Task};
use jobsync_lib::core::{decide_to_pull, JobMonitor, JobStatus, SyncEngine};
use jobsync_lib::logging;
use std::io::{BufRead, Write};
use std::sync::Arc;
use tracing::{info, warn};

/// 无法自动判断时在终端上询问
fn confirm_pull(status: &JobStatus) -> bool {
    print!("作业状态为 {}，是否取回结果? [y/N] ", status);
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// 双因素登录且没有配置验证码时在终端上询问
fn ask_twofa_code(channel: &mut ChannelConfig) -> anyhow::Result<()> {
    if let ChannelConfig::Remote(remote) = channel {
        if remote.two_factor && remote.twofa_code.is_none() {
            print!("{} 的验证码: ", remote.target_name());
            std::io::stdout().flush()?;
            let mut code = String::new();
            std::io::stdin().lock().read_line(&mut code)?;
            remote.twofa_code = Some(code.trim().to_string());
        }
    }
    Ok(())
}

async fn run_task(
    config: &AppConfig,
    task: &Task,
    remote: Arc<dyn CommandChannel>,
) -> jobsync_lib::Result<()> {
    let local: Arc<dyn CommandChannel> = Arc::new(LocalChannel::new());
    let engine = SyncEngine::with_config(local, remote.clone(), config.sync.clone());

    match task {
        Task::Pull {
            remote_root,
            local_root,
        } => {
            let report = engine.pull(remote_root, local_root).await?;
            println!("{}", report.summary());
        }
        Task::Push {
            local_root,
            remote_root,
            empty_push,
            stem,
        } => {
            let report = match stem {
                Some(stem) => {
                    engine
                        .push_stem(local_root, remote_root, stem, *empty_push)
                        .await?
                }
                None => engine.push(local_root, remote_root, *empty_push).await?,
            };
            println!("{}", report.summary());
        }
        Task::Twoway {
            remote_root,
            local_root,
        } => {
            let report = engine.twoway(remote_root, local_root).await?;
            println!("{}", report.summary());
        }
        Task::Watch {
            job_id,
            remote_root,
            local_root,
        } => {
            let monitor = JobMonitor::new(remote);
            let status = monitor.watch(job_id, config.monitor).await?;
            println!("{}: {}", job_id, status);

            if let (Some(remote_root), Some(local_root)) = (remote_root, local_root) {
                if decide_to_pull(&status, confirm_pull) {
                    let report = engine.pull(remote_root, local_root).await?;
                    println!("{}", report.summary());
                } else {
                    info!("不取回作业 {} 的结果", job_id);
                }
            }
        }
        Task::Check { job_id } => {
            let status = JobMonitor::new(remote).check_once(job_id).await?;
            println!("{}: {}", job_id, status);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_dir = config::config_dir();
    let config = AppConfig::load(&config_dir)?;
    let _log_guard = logging::init(&config.log, &config.log.log_dir(&config_dir));

    let Some(task) = config.task.clone() else {
        warn!("{} 中没有配置 task", config_dir.join(config::CONFIG_FILE).display());
        bail!("没有需要执行的任务");
    };
    info!("执行任务: {:?}", task);

    let mut channel = config.channel.clone();
    ask_twofa_code(&mut channel)?;
    with_channel(&channel, |remote| async move {
        run_task(&config, &task, remote).await
    })
    .await
    .context("任务执行失败")?;

    Ok(())
}
