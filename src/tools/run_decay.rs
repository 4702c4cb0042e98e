use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RunDecayParams {
    #[schemars(description = "Also process every queued conversation before decaying (default: false)")]
    pub process_queue: Option<bool>,
}
