use serde::Deserialize;

use super::RawConversation;

#[derive(Deserialize, Debug)]
pub struct AccountResponse {
    pub id: i64,
}

#[derive(Deserialize, Debug)]
pub struct DialogPage {
    #[serde(default)]
    pub dialogs: Vec<RawConversation>,
    /// Absent on the last page.
    #[serde(default)]
    pub next_offset: Option<u64>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Seconds, as reported in a 429 body.
    #[serde(default)]
    pub retry_after: Option<u64>,
}
