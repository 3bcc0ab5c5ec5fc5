use hub::HubStatus;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct HubStatusResponse {
    /// Live socket connections, anonymous ones included.
    #[schema(example = 12)]
    pub clients: usize,
    /// Distinct authenticated users with at least one live connection.
    #[schema(example = 9)]
    pub authenticated: usize,
}

impl From<HubStatus> for HubStatusResponse {
    fn from(status: HubStatus) -> Self {
        Self {
            clients: status.clients,
            authenticated: status.authenticated,
        }
    }
}
