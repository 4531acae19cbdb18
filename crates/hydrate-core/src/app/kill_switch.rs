//! Kill switches - 実行時に切り替えられる停止フラグ
//!
//! - `hydration_disabled` : 全 job type
//! - `hydration_disabled:<job_type>` : 個別
//!
//! submit 時と claim 時の両方で確認します。値は短い TTL でキャッシュし、
//! 再デプロイなしで切り替えられるようにしています。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::domain::JobType;
use crate::ports::SettingsSource;

pub const GLOBAL_KEY: &str = "hydration_disabled";

pub fn type_key(job_type: JobType) -> String {
    format!("{GLOBAL_KEY}:{job_type}")
}

/// `"true"` / `"1"` (any case, surrounding whitespace ignored) enable a switch.
pub fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    value == "1" || value.eq_ignore_ascii_case("true")
}

pub struct KillSwitch {
    settings: Arc<dyn SettingsSource>,
    ttl: Duration,
    cache: Mutex<HashMap<String, (Instant, bool)>>,
}

impl KillSwitch {
    pub fn new(settings: Arc<dyn SettingsSource>, ttl: Duration) -> Self {
        Self {
            settings,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `job_type` is switched off, globally or individually.
    pub async fn is_disabled(&self, job_type: JobType) -> bool {
        self.flag(GLOBAL_KEY).await || self.flag(&type_key(job_type)).await
    }

    /// Drop cached values so the next read goes to the settings source.
    pub async fn invalidate(&self) {
        self.cache.lock().await.clear();
    }

    async fn flag(&self, key: &str) -> bool {
        if let Some((fetched_at, value)) = self.cache.lock().await.get(key)
            && fetched_at.elapsed() < self.ttl
        {
            return *value;
        }

        let value = match self.settings.get(key).await {
            Ok(raw) => raw.as_deref().is_some_and(is_truthy),
            Err(err) => {
                // 設定が読めないときは止めない
                tracing::warn!(key, error = %err, "kill switch unreadable; treating as off");
                false
            }
        };
        self.cache
            .lock()
            .await
            .insert(key.to_string(), (Instant::now(), value));
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryStore;
    use rstest::rstest;

    #[rstest]
    #[case::word("true", true)]
    #[case::upper(" TRUE ", true)]
    #[case::one("1", true)]
    #[case::false_word("false", false)]
    #[case::zero("0", false)]
    #[case::empty("", false)]
    #[case::yes("yes", false)]
    fn truthiness(#[case] raw: &str, #[case] expected: bool) {
        assert_eq!(is_truthy(raw), expected);
    }

    #[tokio::test]
    async fn global_and_per_type_switches_are_both_honoured() {
        let store = Arc::new(InMemoryStore::new());
        let switch = KillSwitch::new(store.clone(), Duration::ZERO);
        assert!(!switch.is_disabled(JobType::Notes).await);

        store.set_setting(type_key(JobType::Notes), "1").await;
        assert!(switch.is_disabled(JobType::Notes).await);
        assert!(!switch.is_disabled(JobType::Questions).await);

        store.remove_setting(&type_key(JobType::Notes)).await;
        store.set_setting(GLOBAL_KEY, "true").await;
        assert!(switch.is_disabled(JobType::Questions).await);
    }

    #[tokio::test]
    async fn cached_values_survive_until_the_ttl_expires() {
        let store = Arc::new(InMemoryStore::new());
        let switch = KillSwitch::new(store.clone(), Duration::from_secs(60));
        assert!(!switch.is_disabled(JobType::Notes).await);

        store.set_setting(GLOBAL_KEY, "true").await;
        assert!(!switch.is_disabled(JobType::Notes).await);

        switch.invalidate().await;
        assert!(switch.is_disabled(JobType::Notes).await);
    }
}
