use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ManageAssociationParams {
    #[schemars(description = "One of: get, strengthen, set, delete")]
    pub action: String,

    #[schemars(description = "Source node id")]
    pub source_id: String,

    #[schemars(description = "Target node id")]
    pub target_id: String,

    #[schemars(description = "Strength for set, or the delta for strengthen (defaults to nodes.association_delta)")]
    pub strength: Option<f64>,
}
