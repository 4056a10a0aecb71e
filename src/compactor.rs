use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{Engine, EngineError};

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

/// Compact if at least `threshold` appends happened since the last one.
/// Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MeetingFilter;
    use std::path::PathBuf;
    use ulid::Ulid;

    const H: i64 = 3_600_000;
    const DAY0: i64 = 1_735_689_600_000; // 2025-01-01T00:00:00Z

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("meetd_test_compactor")
            .join(Ulid::new().to_string());
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone()).unwrap();

        let user = engine.create_user("Ada", "ada@example.com").await.unwrap();
        for i in 0..4 {
            let m = engine
                .create_meeting(user.id, "churn", None, DAY0 + i * H, DAY0 + (i + 1) * H)
                .await
                .unwrap();
            engine.delete_meeting(m.id).await.unwrap();
        }
        let kept = engine
            .create_meeting(user.id, "keep", None, DAY0, DAY0 + H)
            .await
            .unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 10);

        assert!(!compact_if_needed(&engine, 11).await.unwrap());
        let before = std::fs::metadata(&path).unwrap().len();
        assert!(compact_if_needed(&engine, 10).await.unwrap());
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "{after} < {before}");
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        drop(engine);

        let reopened = Engine::new(path).unwrap();
        let meetings = reopened.list_meetings(MeetingFilter::default()).await;
        assert_eq!(meetings.len(), 1);
        assert_eq!(meetings[0].id, kept.id);
        assert_eq!(reopened.get_user(user.id).await.unwrap().email, "ada@example.com");
    }
}
