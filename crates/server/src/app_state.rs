use std::time::Duration;

use server_api::{token::SessionKeys, ApiContext};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) sessions: SessionKeys,
    pub(crate) request_timeout: Duration,
}
