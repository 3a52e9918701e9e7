use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 重载去抖窗口：编辑器保存往往产生一串事件
const DEBOUNCE: Duration = Duration::from_secs(1);

/// 文件消失后等待其重新出现的轮询间隔
const REWATCH_INTERVAL: Duration = Duration::from_millis(500);

/// 监控配置文件变化，去抖后向 `reload_tx` 发送重载信号
///
/// 监控的是文件所在目录而不只是文件本身：编辑器常以改名替换或
/// 先删后建的方式写文件，只盯 inode 会丢事件。文件级 watch 作为
/// 补充挂在目录 watch 之上；文件消失时摘除，重现后挂回。
pub async fn watch(
    config_file: &Path,
    reload_tx: mpsc::UnboundedSender<()>,
    cancel: CancellationToken,
) -> Result<()> {
    let abs_config = std::path::absolute(config_file).context("failed to resolve config path")?;
    let config_dir = abs_config
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let config_name = abs_config
        .file_name()
        .map(|n| n.to_os_string())
        .context("config path has no file name")?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<Event>| {
            let _ = event_tx.send(result);
        },
        notify::Config::default(),
    )
    .context("failed to create file watcher")?;

    watcher
        .watch(&config_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", config_dir.display()))?;

    let mut file_watch_active = try_watch_file(&mut watcher, &abs_config);

    info!(file = %abs_config.display(), "watching for config changes");

    let mut pending: Option<tokio::time::Instant> = None;

    loop {
        let pending_at = pending;
        let rewatch_idle = file_watch_active;

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),

            _ = async move {
                match pending_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                pending = None;
                debug!("debounce window elapsed, requesting reload");
                if reload_tx.send(()).is_err() {
                    return Ok(());
                }
            }

            _ = async move {
                if rewatch_idle {
                    std::future::pending::<()>().await
                } else {
                    tokio::time::sleep(REWATCH_INTERVAL).await
                }
            } => {
                if abs_config.exists() {
                    file_watch_active = try_watch_file(&mut watcher, &abs_config);
                }
            }

            event = event_rx.recv() => {
                let Some(event) = event else { return Ok(()) };
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        // watcher 错误视为瞬态，记录后继续
                        error!(error = %e, "file watcher error");
                        continue;
                    }
                };

                if !event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(config_name.as_os_str()))
                {
                    continue;
                }

                if matches!(
                    event.kind,
                    EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
                ) {
                    debug!(file = %abs_config.display(), "config file removed or renamed");
                    if file_watch_active {
                        let _ = watcher.unwatch(&abs_config);
                        file_watch_active = false;
                    }
                    continue;
                }

                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    info!(file = %abs_config.display(), "config file changed");
                    pending = Some(tokio::time::Instant::now() + DEBOUNCE);
                }
            }
        }
    }
}

fn try_watch_file(watcher: &mut RecommendedWatcher, path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    match watcher.watch(path, RecursiveMode::NonRecursive) {
        Ok(()) => {
            debug!(file = %path.display(), "watching config file");
            true
        }
        Err(e) => {
            warn!(file = %path.display(), error = %e, "failed to watch config file");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const SIGNAL_WAIT: Duration = Duration::from_secs(5);

    struct WatchFixture {
        _dir: tempfile::TempDir,
        path: PathBuf,
        rx: mpsc::UnboundedReceiver<()>,
        cancel: CancellationToken,
    }

    async fn start_watch() -> WatchFixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "tunnels: []\n").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        {
            let path = path.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = watch(&path, tx, cancel).await {
                    eprintln!("watch failed: {e}");
                }
            });
        }
        // 给 watcher 一点时间完成初始挂载
        tokio::time::sleep(Duration::from_millis(300)).await;

        WatchFixture {
            _dir: dir,
            path,
            rx,
            cancel,
        }
    }

    #[tokio::test]
    async fn write_triggers_debounced_reload_signal() {
        let mut fixture = start_watch().await;

        std::fs::write(&fixture.path, "tunnels:\n  - url: x\n").unwrap();

        timeout(SIGNAL_WAIT, fixture.rx.recv())
            .await
            .expect("reload signal within deadline")
            .expect("sender alive");

        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn rapid_writes_coalesce_into_one_signal() {
        let mut fixture = start_watch().await;

        for i in 0..5 {
            std::fs::write(&fixture.path, format!("tunnels: [] # {i}\n")).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        timeout(SIGNAL_WAIT, fixture.rx.recv())
            .await
            .expect("reload signal within deadline")
            .expect("sender alive");

        // 去抖后的安静期内不应再有第二个信号
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(fixture.rx.try_recv().is_err());

        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn remove_then_recreate_triggers_exactly_one_reload() {
        let mut fixture = start_watch().await;

        std::fs::remove_file(&fixture.path).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(&fixture.path, "tunnels: []\n").unwrap();

        timeout(SIGNAL_WAIT, fixture.rx.recv())
            .await
            .expect("reload signal within deadline")
            .expect("sender alive");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(fixture.rx.try_recv().is_err());

        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn chmod_triggers_reload_signal() {
        let mut fixture = start_watch().await;

        let mut perms = std::fs::metadata(&fixture.path).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&fixture.path, perms).unwrap();

        timeout(SIGNAL_WAIT, fixture.rx.recv())
            .await
            .expect("reload signal within deadline")
            .expect("sender alive");

        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn events_for_other_files_are_ignored() {
        let mut fixture = start_watch().await;

        std::fs::write(fixture.path.with_file_name("other.yaml"), "x\n").unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(fixture.rx.try_recv().is_err());

        fixture.cancel.cancel();
    }
}
