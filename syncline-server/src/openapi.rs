use shared::models::{
    HeartbeatRequest, HeartbeatResponse, Message, MessageUpsert, PresenceEntry, PresenceUpdate,
    PresenceUpsertRequest, UpdateEnvelope, UpsertReceipt,
};
use utoipa::OpenApi;

use crate::handlers::channels::StatsResponse;
use crate::http::problem::ProblemDetails;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Syncline API",
        version = "1.0.0",
        description = "Channel relay, presence register, and sequenced chat log"
    ),
    paths(
        crate::handlers::channels::subscribe_channel,
        crate::handlers::channels::publish_channel,
        crate::handlers::channels::channel_stats,
        crate::handlers::presence::presence_snapshot,
        crate::handlers::presence::presence_upsert,
        crate::handlers::presence::presence_heartbeat,
        crate::handlers::chat::upsert_message,
        crate::handlers::chat::load_messages,
    ),
    components(schemas(
        UpdateEnvelope,
        Message,
        MessageUpsert,
        UpsertReceipt,
        PresenceEntry,
        PresenceUpdate,
        PresenceUpsertRequest,
        HeartbeatRequest,
        HeartbeatResponse,
        StatsResponse,
        ProblemDetails,
    )),
    tags(
        (name = "channels", description = "Live update streams and publishing"),
        (name = "presence", description = "Channel membership and liveness"),
        (name = "chat", description = "Sequenced message log")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_endpoint() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();

        assert!(paths.iter().any(|p| p.ends_with("/subscribe")));
        assert!(paths.iter().any(|p| p.ends_with("/publish")));
        assert!(paths.iter().any(|p| p.contains("/presence/")));
        assert!(paths.iter().any(|p| p.contains("/chats/")));
    }

    #[test]
    fn document_serializes_to_json() {
        let json = ApiDoc::openapi().to_json().unwrap();

        assert!(json.contains("\"Syncline API\""));
        assert!(json.contains("UpdateEnvelope"));
    }
}
