use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One thread of control traveling the graph. All branches minted by a
/// single split share one `ref_id`; `parent_ref_id` points at the token the
/// split was reached with, so a merge can collapse back to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub process_instance_id: Uuid,
    pub ref_id: Uuid,
    pub parent_ref_id: Option<Uuid>,
}

impl Token {
    pub fn new(process_instance_id: Uuid, ref_id: Uuid, parent_ref_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            process_instance_id,
            ref_id,
            parent_ref_id,
        }
    }
}
