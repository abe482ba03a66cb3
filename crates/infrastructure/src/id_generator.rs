use jobflow_domain::{IdGenerator, IdKind};
use uuid::Uuid;

/// 基于UUID v4的ID生成器
#[derive(Debug, Default, Clone)]
pub struct UuidIdGenerator;

impl UuidIdGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self, kind: IdKind) -> String {
        format!("{}-{}", kind.prefix(), Uuid::new_v4().simple())
    }
}
