use crate::error::CallError;
use crate::net::{HttpClient, HttpRequest, HttpResponse};
use crate::types::{ConferenceId, PeerId};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::sync::Arc;

/// Room membership registry.
#[async_trait]
pub trait RoomService: Send + Sync {
    /// Allocates a new, empty room.
    async fn create_room(&self, owner: &PeerId) -> Result<ConferenceId, CallError>;

    /// Registers `member`. Fails with [`CallError::RoomFull`] at capacity.
    async fn join_room(&self, room: &ConferenceId, member: &PeerId) -> Result<(), CallError>;

    async fn leave_room(&self, room: &ConferenceId, member: &PeerId) -> Result<(), CallError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedRoom {
    #[serde(alias = "id")]
    conference_id: ConferenceId,
}

/// REST room service.
///
/// - `POST {base}/conferences` → `{"conferenceId": "..."}`
/// - `POST {base}/conferences/{id}/join` → 2xx, or 409/403 when full
/// - `POST {base}/conferences/{id}/leave`
pub struct HttpRoomService {
    http: Arc<dyn HttpClient>,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpRoomService {
    pub fn new(http: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn room_url(&self, room: &ConferenceId, action: &str) -> String {
        format!(
            "{}/conferences/{}/{}",
            self.base_url,
            urlencoding::encode(room.as_str()),
            action
        )
    }

    async fn post(&self, url: String, member: &PeerId) -> Result<HttpResponse, CallError> {
        let mut request =
            HttpRequest::post(url).with_json(&serde_json::json!({ "peerId": member.as_str() }));
        if let Some(token) = &self.auth_token {
            request = request.with_header("Authorization", format!("Bearer {token}"));
        }
        self.http.execute(request).await.map_err(CallError::Service)
    }
}

fn is_full(response: &HttpResponse) -> bool {
    match response.status_code {
        409 => true,
        403 => String::from_utf8_lossy(&response.body)
            .to_ascii_lowercase()
            .contains("full"),
        _ => false,
    }
}

#[async_trait]
impl RoomService for HttpRoomService {
    async fn create_room(&self, owner: &PeerId) -> Result<ConferenceId, CallError> {
        let response = self
            .post(format!("{}/conferences", self.base_url), owner)
            .await?;
        if !response.is_success() {
            return Err(CallError::Service(anyhow::anyhow!(
                "create room returned {}",
                response.status_code
            )));
        }
        let created: CreatedRoom = response.json().map_err(CallError::Service)?;
        debug!("Created room {}", created.conference_id);
        Ok(created.conference_id)
    }

    async fn join_room(&self, room: &ConferenceId, member: &PeerId) -> Result<(), CallError> {
        let response = self.post(self.room_url(room, "join"), member).await?;
        if is_full(&response) {
            return Err(CallError::RoomFull);
        }
        if !response.is_success() {
            return Err(CallError::Service(anyhow::anyhow!(
                "join room {} returned {}",
                room,
                response.status_code
            )));
        }
        Ok(())
    }

    async fn leave_room(&self, room: &ConferenceId, member: &PeerId) -> Result<(), CallError> {
        let response = self.post(self.room_url(room, "leave"), member).await?;
        if !response.is_success() {
            return Err(CallError::Service(anyhow::anyhow!(
                "leave room {} returned {}",
                room,
                response.status_code
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedHttp {
        status: u16,
        body: &'static str,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedHttp {
        fn new(status: u16, body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                status,
                body,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedHttp {
        async fn execute(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            Ok(HttpResponse {
                status_code: self.status,
                body: self.body.as_bytes().to_vec(),
            })
        }
    }

    #[tokio::test]
    async fn test_create_room_parses_id() {
        let http = ScriptedHttp::new(201, r#"{"conferenceId":"r-42"}"#);
        let rooms = HttpRoomService::new(http.clone(), "https://rooms.test/api/");

        let id = rooms.create_room(&PeerId::new("alice")).await.unwrap();

        assert_eq!(id.as_str(), "r-42");
        let requests = http.requests.lock().unwrap();
        assert_eq!(requests[0].url, "https://rooms.test/api/conferences");
        assert_eq!(requests[0].method, "POST");
    }

    #[tokio::test]
    async fn test_join_encodes_room_id_and_maps_conflict_to_full() {
        let http = ScriptedHttp::new(409, "");
        let rooms = HttpRoomService::new(http.clone(), "https://rooms.test").with_auth_token("t");

        let result = rooms
            .join_room(&ConferenceId::new("team sync"), &PeerId::new("carol"))
            .await;

        assert!(matches!(result, Err(CallError::RoomFull)));
        let requests = http.requests.lock().unwrap();
        assert_eq!(
            requests[0].url,
            "https://rooms.test/conferences/team%20sync/join"
        );
        assert_eq!(
            requests[0].headers.get("Authorization").map(String::as_str),
            Some("Bearer t")
        );
    }

    #[tokio::test]
    async fn test_forbidden_is_full_only_when_body_says_so() {
        let full = HttpRoomService::new(ScriptedHttp::new(403, "Room FULL"), "http://r");
        let denied = HttpRoomService::new(ScriptedHttp::new(403, "not invited"), "http://r");
        let room = ConferenceId::new("r1");
        let me = PeerId::new("dave");

        assert!(matches!(
            full.join_room(&room, &me).await,
            Err(CallError::RoomFull)
        ));
        assert!(matches!(
            denied.join_room(&room, &me).await,
            Err(CallError::Service(_))
        ));
    }
}
