//! SettingsSource port - kill switch などのランタイム設定
//!
//! 値は文字列で返します。真偽の解釈は `app::kill_switch` 側の責務です。

use async_trait::async_trait;

use super::job_store::StoreError;

#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
}
