//! Model bundle reference

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A packaged model that an endpoint serves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    /// Unique bundle identifier
    pub id: String,

    /// Bundle name
    pub name: String,

    /// Owning tenant
    pub owner: String,

    /// When the bundle was registered
    pub created_at: DateTime<Utc>,

    /// Where the bundle artifacts live
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl ModelBundle {
    pub fn new(id: String, name: String, owner: String) -> Self {
        Self {
            id,
            name,
            owner,
            created_at: Utc::now(),
            location: None,
        }
    }
}
