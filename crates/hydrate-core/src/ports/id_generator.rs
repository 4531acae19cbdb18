//! IdGenerator port - ID 生成の抽象化
//!
//! IdGenerator は分散システムで使える ID を生成するためのインターフェースです。
//! テスト容易性のために、trait として抽象化しています。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::{AuditId, EntityId, JobId, OutboxId};
use crate::ports::Clock;

/// IdGenerator は分散システムで使える ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数ワーカーから共有する）
pub trait IdGenerator: Send + Sync {
    fn job_id(&self) -> JobId;
    fn outbox_id(&self) -> OutboxId;
    fn audit_id(&self) -> AuditId;
    /// Id for a newly generated curriculum record (chapter, topic).
    fn entity_id(&self) -> EntityId;
}

impl<G: IdGenerator + ?Sized> IdGenerator for Arc<G> {
    fn job_id(&self) -> JobId {
        (**self).job_id()
    }

    fn outbox_id(&self) -> OutboxId {
        (**self).outbox_id()
    }

    fn audit_id(&self) -> AuditId {
        (**self).audit_id()
    }

    fn entity_id(&self) -> EntityId {
        (**self).entity_id()
    }
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
/// これにより、テスト時に ManualClock を使って timestamp 部分を固定できます。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn job_id(&self) -> JobId {
        JobId::from(self.next())
    }

    fn outbox_id(&self) -> OutboxId {
        OutboxId::from(self.next())
    }

    fn audit_id(&self) -> AuditId {
        AuditId::from(self.next())
    }

    fn entity_id(&self) -> EntityId {
        EntityId::from(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ManualClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.job_id();
        let id2 = id_gen.job_id();
        let id3 = id_gen.job_id();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn manual_clock_pins_the_timestamp_part() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(ManualClock::new(fixed_time));

        let id1 = id_gen.job_id();
        let id2 = id_gen.job_id();

        // ランダム部分があるので ID は異なる
        assert_ne!(id1, id2);

        // ただし timestamp 部分は同じ
        assert_eq!(id1.as_ulid().timestamp_ms(), id2.as_ulid().timestamp_ms());
        assert_eq!(id1.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn each_id_kind_keeps_its_prefix() {
        let id_gen = UlidGenerator::new(SystemClock);
        assert!(id_gen.job_id().to_string().starts_with("job-"));
        assert!(id_gen.outbox_id().to_string().starts_with("obx-"));
        assert!(id_gen.audit_id().to_string().starts_with("aud-"));
        assert!(id_gen.entity_id().to_string().starts_with("ent-"));
    }
}
